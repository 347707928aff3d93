//! Commandline argument parser using clap for sonolocate

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Top-level arguments of the `sonolocate` binary.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct LocateArgs {
    #[command(subcommand)]
    /// Which task to perform: a simulated run, an offline solve, or
    /// printing the configuration
    pub command: CommandTask,

    /// RON configuration file. Fields it leaves out keep their defaults
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
}

/// The subcommands.
#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Locate bursts from a simulated source in real time
    #[command(about)]
    Simulate(SimulateCommand),

    /// Solve a capture recorded to a WAV file
    #[command(about)]
    Solve(SolveCommand),

    /// Print the configuration in effect as RON
    #[command(about)]
    Config,
}

/// Options of `sonolocate simulate`.
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct SimulateCommand {
    /// Angle of the source, in degrees. Positive is towards the left microphone
    #[arg(short = 'a', long = "angle", default_value_t = 0.0, allow_negative_numbers = true)]
    pub angle_deg: f32,

    /// Distance of the source, in centimetres
    #[arg(short = 'd', long = "distance", default_value_t = 50.0)]
    pub distance_cm: f32,

    /// Number of measurement cycles to run
    #[arg(short = 'n', long = "cycles", default_value_t = 10)]
    pub cycles: usize,

    /// Time between triggers, in milliseconds
    #[arg(short = 'i', long = "interval-ms", default_value_t = 100)]
    pub interval_ms: u64,

    /// Standard deviation of the noise on each channel, in volts
    #[arg(long = "noise", default_value_t = 0.002)]
    pub noise_v: f32,

    /// Directory to write every capture to, as numbered WAV files
    #[arg(short = 'r', long = "record")]
    pub record: Option<PathBuf>,

    /// Seed for the noise generator
    #[arg(long = "seed", default_value_t = 1)]
    pub seed: u64,
}

/// Options of `sonolocate solve`.
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct SolveCommand {
    /// Two-channel capture, left channel first
    pub wav: PathBuf,

    /// Frames between the trigger and the first frame of the capture
    #[arg(short = 'o', long = "offset", default_value_t = 0, allow_negative_numbers = true)]
    pub offset_frames: i64,

    /// Signal energy threshold to use instead of the configured one
    #[arg(short = 't', long = "threshold")]
    pub threshold: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn arguments_are_consistent() {
        LocateArgs::command().debug_assert();
    }

    #[test]
    fn parses_simulate() {
        let args = LocateArgs::parse_from([
            "sonolocate",
            "simulate",
            "--angle",
            "-12.5",
            "--distance",
            "80",
            "--cycles",
            "3",
            "--record",
            "out",
        ]);
        match args.command {
            CommandTask::Simulate(cmd) => {
                assert_eq!(cmd.angle_deg, -12.5);
                assert_eq!(cmd.distance_cm, 80.0);
                assert_eq!(cmd.cycles, 3);
                assert_eq!(cmd.interval_ms, 100);
                assert_eq!(cmd.record, Some(PathBuf::from("out")));
            }
            other => panic!("parsed {:?}", other),
        }
        assert_eq!(args.config, None);
    }

    #[test]
    fn parses_solve_with_global_config() {
        let args = LocateArgs::parse_from([
            "sonolocate",
            "solve",
            "capture.wav",
            "--offset",
            "-40",
            "--config",
            "rig.ron",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("rig.ron")));
        match args.command {
            CommandTask::Solve(cmd) => {
                assert_eq!(cmd.wav, PathBuf::from("capture.wav"));
                assert_eq!(cmd.offset_frames, -40);
                assert_eq!(cmd.threshold, None);
            }
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn solve_needs_a_file() {
        assert!(LocateArgs::try_parse_from(["sonolocate", "solve"]).is_err());
    }
}
