//! sonolocate finds an ultrasonic source from a stereo pair of microphones.
//! A 40 kHz burst is fired at a known instant, both channels are captured
//! from a free-running converter, and the difference in arrival time gives
//! the bearing while the arrival time itself gives the range.
//!
//! The crate splits into two halves that only meet at a
//! [`Capture`](trigger_aligner::Capture):
//!
//! - acquisition: [`frame_clock`] counts frames as the converter produces
//!   them, [`stream_buffer`] tracks what has been read out of the ring, and
//!   [`trigger_aligner`] cuts the frames that follow a trigger out of the
//!   stream;
//! - analysis: [`signal_analyzer`] finds the burst and its peaks in each
//!   channel, [`peak_interpolator`] places the peaks between samples,
//!   [`correlator`] matches the two channels' peak trains, and
//!   [`delay_estimator`] extrapolates each burst back to its start.
//!   [`solver`] turns all of that into a [`Fix`](solver::Fix).
//!
//! [`locator`] runs whole measurement cycles over any
//! [`AcquisitionDevice`](device::AcquisitionDevice), and [`sim_device`]
//! provides one that simulates the rig, so everything can run without
//! hardware.

#![warn(missing_docs)]

pub mod args;
pub mod capture_file;
pub mod component;
pub mod config;
pub mod correlator;
pub mod delay_estimator;
pub mod device;
pub mod frame_clock;
pub mod locator;
pub mod peak_interpolator;
pub mod signal_analyzer;
pub mod sim_device;
pub mod solver;
pub mod stream_buffer;
pub mod trigger_aligner;
