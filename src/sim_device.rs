//! A stand-in for the I2S converter and its frame-clock pulse counter.
//!
//! [`SimulatedDevice`] keeps a fixed-capacity ring of raw stereo frames and
//! overwrites the oldest unread frames when it fills up, the way DMA does.
//! Every frame carries Gaussian noise plus whatever ultrasonic bursts have
//! been scheduled with [`SimulatedDevice::emit_burst`]. Frames are made
//! either on demand with [`SimulatedDevice::produce`] or in real time by a
//! producer thread started with [`SimulatedDevice::spawn`].

use crate::config::{AcquisitionConfig, Geometry};
use crate::device::{AcquisitionDevice, DeviceError, FrameIndex, PulseCounter, RawFrame};
use crate::frame_clock::FrameClock;
use crate::stream_buffer::voltage_to_code;

use log::{debug, error, info, warn};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::{
    collections::VecDeque,
    f32::consts::PI,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc, Arc, Condvar, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

/// Range of the hardware pulse counter (high limit 32767, then wrap).
pub const COUNTER_RANGE: u32 = 32768;

/// Shape of one transmitted burst: a tone under a linear ramp up, then a
/// linear ramp down.
#[derive(Debug, Clone, PartialEq)]
pub struct BurstShape {
    /// Carrier frequency.
    pub frequency_hz: f32,
    /// Peak voltage at the top of the ramp.
    pub amplitude_v: f32,
    /// Carrier cycles from zero to full amplitude.
    pub rise_cycles: f32,
    /// Carrier cycles from full amplitude back to zero.
    pub fall_cycles: f32,
}

impl Default for BurstShape {
    fn default() -> Self {
        Self {
            frequency_hz: 40_000.0,
            amplitude_v: 1.0,
            rise_cycles: 30.0,
            fall_cycles: 10.0,
        }
    }
}

impl BurstShape {
    fn cycle_us(&self) -> f32 {
        1e6 / self.frequency_hz
    }

    /// Length of the whole burst.
    pub fn duration_us(&self) -> f32 {
        (self.rise_cycles + self.fall_cycles) * self.cycle_us()
    }

    /// Burst voltage `t_us` after it started. Zero outside the burst.
    pub fn value_at(&self, t_us: f32) -> f32 {
        let rise = self.rise_cycles * self.cycle_us();
        let fall = self.fall_cycles * self.cycle_us();
        if t_us < 0.0 || t_us >= rise + fall {
            return 0.0;
        }
        let envelope = if t_us < rise {
            t_us / rise
        } else {
            1.0 - (t_us - rise) / fall
        };
        self.amplitude_v * envelope * (2.0 * PI * self.frequency_hz * t_us * 1e-6).sin()
    }
}

/// The frame clock's pulse counter, advanced by the simulated producer.
pub struct SimulatedPulseCounter {
    count: AtomicU32,
    range: u32,
    running: AtomicBool,
    available: bool,
}

impl SimulatedPulseCounter {
    /// A stopped counter wrapping at `range`.
    pub fn new(range: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            range,
            running: AtomicBool::new(false),
            available: true,
        }
    }

    /// A counter whose configuration always fails.
    pub fn unavailable(range: u32) -> Self {
        Self {
            available: false,
            ..Self::new(range)
        }
    }

    /// True once configured.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Count `pulses` frame clock edges, raising the overflow interrupt on
    /// `clock` every time the counter wraps.
    pub fn pulse(&self, pulses: u64, clock: &FrameClock) {
        let range = self.range as u64;
        let total = self.count.load(Ordering::Relaxed) as u64 + pulses;
        // Counter first, pages second: a reader racing the wrap sees a
        // value that is behind, never one that is ahead
        self.count.store((total % range) as u32, Ordering::Release);
        for _ in 0..total / range {
            clock.on_overflow();
        }
    }
}

impl PulseCounter for SimulatedPulseCounter {
    fn configure(&self) -> Result<(), String> {
        if !self.available {
            return Err("no pulse counter unit free".to_string());
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.count.store(0, Ordering::Release);
    }

    fn range(&self) -> u32 {
        self.range
    }
}

/// Arrival times of one burst at each microphone, in microseconds since the
/// first simulated frame.
#[derive(Debug, Clone, Copy)]
struct ScheduledBurst {
    left_us: f64,
    right_us: f64,
}

struct Ring {
    frames: VecDeque<RawFrame>,
    capacity: usize,
    produced: FrameIndex,
    overwritten: u64,
    noise: Option<Normal<f32>>,
    rng: StdRng,
    bursts: Vec<ScheduledBurst>,
}

struct Shared {
    ring: Mutex<Ring>,
    ready: Condvar,
    counter: Arc<SimulatedPulseCounter>,
    clock: Arc<FrameClock>,
    shape: BurstShape,
    geometry: Geometry,
    sample_period_us: f64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Ring> {
        // A panicked producer leaves the ring in a consistent state
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generate `frames` frames, push them into the ring and clock them out.
    /// Nothing is produced while the counter is not running.
    fn produce(&self, frames: usize) -> usize {
        if frames == 0 || !self.counter.is_running() {
            return 0;
        }

        {
            let mut ring = self.lock();
            let burst_len = self.shape.duration_us() as f64;
            for _ in 0..frames {
                let t = ring.produced as f64 * self.sample_period_us;
                let mut left = 0.0f32;
                let mut right = 0.0f32;
                for burst in &ring.bursts {
                    left += self.shape.value_at((t - burst.left_us) as f32);
                    right += self.shape.value_at((t - burst.right_us) as f32);
                }
                if let Some(normal) = ring.noise {
                    left += normal.sample(&mut ring.rng);
                    right += normal.sample(&mut ring.rng);
                }

                ring.frames
                    .push_back([voltage_to_code(left), voltage_to_code(right)]);
                if ring.frames.len() > ring.capacity {
                    ring.frames.pop_front();
                    ring.overwritten += 1;
                }
                ring.produced += 1;
            }

            let now = ring.produced as f64 * self.sample_period_us;
            ring.bursts
                .retain(|b| b.left_us.max(b.right_us) + burst_len > now);
        }

        self.counter.pulse(frames as u64, &self.clock);
        self.ready.notify_all();
        frames
    }
}

/// Gaussian noise of standard deviation `noise_v`, or none at all for a
/// zero or unusable deviation.
fn noise_distribution(noise_v: f32) -> Option<Normal<f32>> {
    if noise_v == 0.0 {
        return None;
    }
    match Normal::new(0.0, noise_v) {
        Ok(normal) => Some(normal),
        Err(e) => {
            warn!("SimulatedDevice : noise {} V ignored: {}", noise_v, e);
            None
        }
    }
}

enum Signal {
    Noise(Option<Normal<f32>>),
    Stop,
}

/// Simulated converter: a noisy ring of stereo frames and the pulse
/// counter clocking them out.
pub struct SimulatedDevice {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
    tx: Option<mpsc::Sender<Signal>>,
    sample_rate_hz: u32,
    chunk_frames: usize,
}

impl SimulatedDevice {
    /// A device with a ring of `config.ring_capacity` frames and noise of
    /// standard deviation `noise_v` on both channels. `seed` fixes the noise.
    pub fn new(config: &AcquisitionConfig, geometry: &Geometry, noise_v: f32, seed: u64) -> Self {
        let counter = Arc::new(SimulatedPulseCounter::new(COUNTER_RANGE));
        Self::with_counter(config, geometry, noise_v, seed, counter)
    }

    /// Like [`new`](Self::new), with a caller-supplied pulse counter.
    pub fn with_counter(
        config: &AcquisitionConfig,
        geometry: &Geometry,
        noise_v: f32,
        seed: u64,
        counter: Arc<SimulatedPulseCounter>,
    ) -> Self {
        let clock = Arc::new(FrameClock::new(counter.clone()));
        let ring = Ring {
            frames: VecDeque::with_capacity(config.ring_capacity as usize),
            capacity: config.ring_capacity as usize,
            produced: 0,
            overwritten: 0,
            noise: noise_distribution(noise_v),
            rng: StdRng::seed_from_u64(seed),
            bursts: Vec::new(),
        };

        Self {
            shared: Arc::new(Shared {
                ring: Mutex::new(ring),
                ready: Condvar::new(),
                counter,
                clock,
                shape: BurstShape::default(),
                geometry: geometry.clone(),
                sample_period_us: 1e6 / config.sample_rate_hz.max(1) as f64,
            }),
            handle: None,
            tx: None,
            sample_rate_hz: config.sample_rate_hz,
            chunk_frames: config.chunk_frames.max(1),
        }
    }

    /// The frame clock driven by this device's pulse counter.
    pub fn clock(&self) -> Arc<FrameClock> {
        self.shared.clock.clone()
    }

    /// Frames generated since the counter started.
    pub fn produced(&self) -> FrameIndex {
        self.shared.lock().produced
    }

    /// Unread frames lost to ring overwrite.
    pub fn overwritten(&self) -> u64 {
        self.shared.lock().overwritten
    }

    /// True while the producer thread is up.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Generate `frames` frames right now. Returns how many were made, which
    /// is zero until the frame clock has been started.
    pub fn produce(&self, frames: usize) -> usize {
        self.shared.produce(frames)
    }

    /// Change the noise deviation, from the next frame on.
    pub fn set_noise(&self, noise_v: f32) {
        match &self.tx {
            Some(tx) => {
                // The producer only goes away through `stop`
                let _ = tx.send(Signal::Noise(noise_distribution(noise_v)));
            }
            None => self.shared.lock().noise = noise_distribution(noise_v),
        }
    }

    /** emit_burst()
     * @brief   Schedules a burst from a source at the given bearing and range,
     *          transmitted at frame `at_frame`
     * @param   Transmit frame, bearing in degrees (positive reaches the left
     *          microphone first), range in centimetres
     */
    pub fn emit_burst(&self, at_frame: FrameIndex, angle_deg: f32, distance_cm: f32) {
        let geometry = &self.shared.geometry;
        let flight_us = (distance_cm / geometry.sound_speed_cm_per_us()) as f64;
        let t_diff_us = (angle_deg.to_radians().sin() / geometry.angle_factor()) as f64;

        let emitted = at_frame as f64 * self.shared.sample_period_us;
        let near = emitted + flight_us;
        let burst = if t_diff_us >= 0.0 {
            ScheduledBurst {
                left_us: near,
                right_us: near + t_diff_us,
            }
        } else {
            ScheduledBurst {
                left_us: near - t_diff_us,
                right_us: near,
            }
        };

        debug!(
            "SimulatedDevice : burst at frame {}, arrives {:.1}/{:.1} us",
            at_frame, burst.left_us, burst.right_us
        );
        self.shared.lock().bursts.push(burst);
    }

    /// Start producing frames in real time on a background thread.
    pub fn spawn(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel::<Signal>();
        let shared = Arc::clone(&self.shared);
        let rate = self.sample_rate_hz as f64;
        let chunk = self.chunk_frames;
        let nap = Duration::from_secs_f64(chunk as f64 / rate.max(1.0) / 2.0);

        let handle = thread::spawn(move || {
            let start = Instant::now();
            let mut made: u64 = 0;
            let mut running = true;
            while running {
                match rx.try_recv() {
                    Ok(Signal::Noise(noise)) => shared.lock().noise = noise,
                    Ok(Signal::Stop) | Err(mpsc::TryRecvError::Disconnected) => running = false,
                    Err(mpsc::TryRecvError::Empty) => {}
                }

                let due = (start.elapsed().as_secs_f64() * rate) as u64;
                while made + chunk as u64 <= due {
                    shared.produce(chunk);
                    made += chunk as u64;
                }
                spin_sleep::sleep(nap);
            }
        });

        info!("SimulatedDevice : producer started at {} Hz", self.sample_rate_hz);
        self.handle = Some(handle);
        self.tx = Some(tx);
    }

    /// Stop and join the producer thread, if there is one.
    pub fn stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Signal::Stop);
        }
        // `join` consumes the handle, so it has to come out of the struct
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                error!("SimulatedDevice : producer thread panicked");
            }
            info!("SimulatedDevice : producer stopped");
        }
        self.shared.ready.notify_all();
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AcquisitionDevice for SimulatedDevice {
    fn read_frames(&mut self, buf: &mut [RawFrame], timeout: Duration) -> Result<usize, DeviceError> {
        let mut ring = self.shared.lock();
        if ring.frames.is_empty() && self.handle.is_some() {
            ring = self
                .shared
                .ready
                .wait_timeout_while(ring, timeout, |r| r.frames.is_empty())
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }

        let n = buf.len().min(ring.frames.len());
        for (slot, frame) in buf.iter_mut().zip(ring.frames.drain(..n)) {
            *slot = frame;
        }
        Ok(n)
    }
}
