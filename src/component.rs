//! Defines the Component trait for the stages that run after a fix or a
//! capture is made. Each stage sits on its own thread, consumes data from
//! one channel and passes its output on to the next, so slow work like
//! writing files never holds up the acquisition loop.

use crate::locator::LocateError;
use crate::solver::Fix;

use log::{info, warn};
use std::fmt;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Why a pipeline stage failed.
#[derive(Debug)]
pub enum ComponentError {
    /// Reading or writing a WAV file.
    Hound(hound::Error),
    /// Any other filesystem error.
    Io(std::io::Error),
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentError::Hound(e) => write!(f, "wav error: {}", e),
            ComponentError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ComponentError {}

impl From<hound::Error> for ComponentError {
    fn from(value: hound::Error) -> Self {
        ComponentError::Hound(value)
    }
}

impl From<std::io::Error> for ComponentError {
    fn from(value: std::io::Error) -> Self {
        ComponentError::Io(value)
    }
}

///
/// A stage in the post-processing pipeline. Its `Display` form is the name
/// used in log messages.
///
pub trait Component: fmt::Display {
    /// What the stage consumes.
    type InData;
    /// What the stage emits per input.
    type OutData;

    /// Converts an input of type A into an output of type B
    fn convert(&mut self, input: Self::InData) -> Self::OutData;

    /// Cleans up at termination of pipeline
    fn finalize(&mut self) -> Result<(), ComponentError>;
}

/// Runs the given Component on its own thread. On receiving data of type
/// InData on the input channel, the Component converts them to data of type
/// OutData and sends it to the output channel. The thread ends, after
/// finalizing the Component, once every sender of the input is dropped.
pub fn run_component<C: Component + Send + 'static>(
    mut component: Box<C>,
    input: Receiver<<C as Component>::InData>,
    output: Sender<<C as Component>::OutData>,
) -> JoinHandle<()>
where
    <C as Component>::InData: Send + 'static,
    <C as Component>::OutData: Send + 'static,
{
    thread::spawn(move || {
        while let Ok(data) = input.recv() {
            let out_data = component.convert(data);
            // Nobody listening downstream is fine
            let _ = output.send(out_data);
        }

        if let Err(component_error) = component.finalize() {
            warn!("{} : error during terminating : {}.", component, component_error);
        }
        info!("{} : terminated.", component);
    })
}

/// Running totals kept by a [`FixReporter`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FixSummary {
    /// Cycles seen, with or without a fix.
    pub cycles: usize,
    /// Cycles that produced a fix.
    pub fixes: usize,
    /// Sum of the angles of every fix.
    pub angle_sum_deg: f64,
    /// Sum of the distances of every fix.
    pub distance_sum_cm: f64,
}

impl FixSummary {
    /// Share of cycles that produced a fix, 0 before the first cycle.
    pub fn success_rate(&self) -> f64 {
        if self.cycles == 0 {
            return 0.0;
        }
        self.fixes as f64 / self.cycles as f64
    }

    /// None until there is a fix.
    pub fn mean_angle_deg(&self) -> Option<f64> {
        (self.fixes > 0).then(|| self.angle_sum_deg / self.fixes as f64)
    }

    /// None until there is a fix.
    pub fn mean_distance_cm(&self) -> Option<f64> {
        (self.fixes > 0).then(|| self.distance_sum_cm / self.fixes as f64)
    }
}

/// Logs every cycle's outcome and passes successful fixes on. At the end of
/// the run it logs how many cycles produced a fix and their mean.
#[derive(Debug, Default)]
pub struct FixReporter {
    summary: FixSummary,
}

impl FixReporter {
    /// A reporter that has seen nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Totals so far.
    pub fn summary(&self) -> FixSummary {
        self.summary
    }
}

impl Component for FixReporter {
    type InData = Result<Fix, LocateError>;
    type OutData = Option<Fix>;

    fn convert(&mut self, input: Result<Fix, LocateError>) -> Option<Fix> {
        self.summary.cycles += 1;
        match input {
            Ok(fix) => {
                self.summary.fixes += 1;
                self.summary.angle_sum_deg += fix.angle_deg as f64;
                self.summary.distance_sum_cm += fix.distance_cm as f64;
                info!(
                    "{} : cycle {}: angle {:.3} deg, distance {:.2} cm (lag {}, offset {} frames)",
                    self, self.summary.cycles, fix.angle_deg, fix.distance_cm, fix.lag, fix.offset_frames
                );
                Some(fix)
            }
            Err(error) => {
                warn!("{} : cycle {}: no fix, {}", self, self.summary.cycles, error);
                None
            }
        }
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        let s = self.summary;
        match (s.mean_angle_deg(), s.mean_distance_cm()) {
            (Some(angle), Some(distance)) => info!(
                "{} : {}/{} cycles fixed ({:.0}%), mean angle {:.3} deg, mean distance {:.2} cm",
                self,
                s.fixes,
                s.cycles,
                100.0 * s.success_rate(),
                angle,
                distance
            ),
            _ => info!("{} : no fixes in {} cycles", self, s.cycles),
        }
        Ok(())
    }
}

impl fmt::Display for FixReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixReporter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger_aligner::AcquireError;
    use std::sync::mpsc::channel;

    /// Null MockComponent for compilation testing
    struct MockComponent {}

    impl MockComponent {
        fn new() -> Self {
            Self {}
        }
    }

    impl Component for MockComponent {
        type InData = i32;
        type OutData = i32;

        fn convert(&mut self, input: i32) -> i32 {
            input + 1
        }

        fn finalize(&mut self) -> Result<(), ComponentError> {
            Ok(())
        }
    }

    impl fmt::Display for MockComponent {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "MockComponent")
        }
    }

    fn fix(angle_deg: f32, distance_cm: f32) -> Fix {
        Fix {
            angle_deg,
            distance_cm,
            t_diff_us: 0.0,
            sig_delay_us: 0.0,
            lag: 0,
            correlation: 1.0,
            offset_frames: 0,
            starts: (0, 0),
            intercepts_us: (0.0, 0.0),
        }
    }

    /// Checks that writing a value to the Component's input produces that
    /// value, converted, in the Component's output
    #[test]
    fn test_mock_component() {
        let (test_tx, block_rx) = channel::<i32>();
        let (block_tx, test_rx) = channel::<i32>();

        run_component(Box::new(MockComponent::new()), block_rx, block_tx);

        assert_eq!(test_tx.send(0), Ok(()));
        assert_eq!(test_rx.recv(), Ok(1));
    }

    #[test]
    fn test_chained_component() {
        let (test_tx, block_a_rx) = channel::<i32>();
        let (block_a_tx, block_b_rx) = channel::<i32>();
        let (block_b_tx, test_rx) = channel::<i32>();

        run_component(Box::new(MockComponent::new()), block_a_rx, block_a_tx);
        run_component(Box::new(MockComponent::new()), block_b_rx, block_b_tx);

        assert_eq!(test_tx.send(0), Ok(()));
        assert_eq!(test_rx.recv(), Ok(2));
    }

    #[test]
    fn component_thread_ends_with_its_input() {
        let (test_tx, block_rx) = channel::<i32>();
        let (block_tx, test_rx) = channel::<i32>();
        let handle = run_component(Box::new(MockComponent::new()), block_rx, block_tx);

        drop(test_tx);
        assert!(handle.join().is_ok());
        assert!(test_rx.recv().is_err());
    }

    #[test]
    fn reporter_counts_and_passes_fixes() {
        let mut reporter = FixReporter::new();
        assert_eq!(reporter.convert(Ok(fix(10.0, 50.0))), Some(fix(10.0, 50.0)));
        assert_eq!(
            reporter.convert(Err(LocateError::Acquire(AcquireError::NotTriggered))),
            None
        );
        reporter.convert(Ok(fix(20.0, 70.0)));

        let s = reporter.summary();
        assert_eq!((s.cycles, s.fixes), (3, 2));
        assert!((s.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.mean_angle_deg(), Some(15.0));
        assert_eq!(s.mean_distance_cm(), Some(60.0));
        assert!(reporter.finalize().is_ok());
    }

    #[test]
    fn empty_summary_has_no_means() {
        let s = FixSummary::default();
        assert_eq!(s.success_rate(), 0.0);
        assert_eq!(s.mean_angle_deg(), None);
    }
}
