//! Front end for the locator: run it against the simulated rig, re-solve
//! recorded captures, or dump the configuration.

use clap::Parser;
use sonolocate::{
    args::{
        CommandTask::{Config, Simulate, Solve},
        LocateArgs, SimulateCommand, SolveCommand,
    },
    capture_file::{read_block, CaptureWriter},
    component::{run_component, FixReporter},
    config::LocatorConfig,
    locator::{LocateError, Locator},
    sim_device::SimulatedDevice,
    solver::{Channel, Fix, LocalizationSolver},
    trigger_aligner::Capture,
};

use log::{info, warn};
use std::{
    error::Error,
    sync::mpsc::channel,
    time::{Duration, Instant},
};

// Example:
// cargo run --bin sonolocate -- simulate
//                            --angle     12
//                            --distance  60
//                            --cycles    20
//                            --record    captures/

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = LocateArgs::parse();

    let config = match &args.config {
        Some(path) => LocatorConfig::from_path(path)?,
        None => LocatorConfig::default(),
    };

    match args.command {
        Simulate(cmd) => simulate(&config, &cmd),
        Solve(cmd) => solve(&config, &cmd),
        Config => {
            println!("{}", config.to_ron()?);
            Ok(())
        }
    }
}

fn simulate(config: &LocatorConfig, cmd: &SimulateCommand) -> Result<(), Box<dyn Error>> {
    let mut device = SimulatedDevice::new(&config.acquisition, &config.geometry, cmd.noise_v, cmd.seed);
    let clock = device.clock();
    device.spawn();

    let mut locator = Locator::new(device, clock, config);
    locator.begin()?;

    let (fix_tx, fix_rx) = channel::<Result<Fix, LocateError>>();
    let (report_tx, report_rx) = channel::<Option<Fix>>();
    let reporter = run_component(Box::new(FixReporter::new()), fix_rx, report_tx);

    let mut recorder = None;
    if let Some(dir) = &cmd.record {
        let writer = CaptureWriter::new(dir, config.acquisition.sample_rate_hz)?;
        let (capture_tx, capture_rx) = channel::<Capture>();
        let (path_tx, path_rx) = channel();
        let handle = run_component(Box::new(writer), capture_rx, path_tx);
        recorder = Some((capture_tx, path_rx, handle));
    }

    let interval = Duration::from_millis(cmd.interval_ms);
    for _ in 0..cmd.cycles {
        let cycle_start = Instant::now();
        let at = locator.trigger();
        locator.device().emit_burst(at, cmd.angle_deg, cmd.distance_cm);

        let outcome = match locator.acquire() {
            Ok(capture) => {
                let fix = locator.solve_capture(&capture).map_err(LocateError::from);
                if let Some((capture_tx, _, _)) = &recorder {
                    let _ = capture_tx.send(capture);
                }
                fix
            }
            Err(e) => Err(e.into()),
        };
        let _ = fix_tx.send(outcome);

        // Keep up with the converter until the next trigger is due
        while cycle_start.elapsed() < interval {
            locator.service();
            spin_sleep::sleep(Duration::from_millis(1));
        }
    }

    let stats = locator.stats();
    if stats.overruns > 0 {
        warn!(
            "Main : {} overruns, {} frames dropped",
            stats.overruns, stats.frames_dropped
        );
    }

    drop(fix_tx);
    if reporter.join().is_err() {
        warn!("Main : reporter thread panicked");
    }
    let fixes = report_rx.try_iter().flatten().count();
    info!("Main : {} of {} cycles fixed", fixes, cmd.cycles);

    if let Some((capture_tx, path_rx, handle)) = recorder {
        drop(capture_tx);
        if handle.join().is_err() {
            warn!("Main : capture writer thread panicked");
        }
        for written in path_rx.try_iter() {
            if let Err(e) = written {
                warn!("Main : capture not saved: {}", e);
            }
        }
    }
    Ok(())
}

fn solve(config: &LocatorConfig, cmd: &SolveCommand) -> Result<(), Box<dyn Error>> {
    let (block, sample_rate) = read_block(&cmd.wav)?;
    if sample_rate != config.acquisition.sample_rate_hz {
        warn!(
            "Main : {} is at {} Hz, solving at the configured {} Hz",
            cmd.wav.display(),
            sample_rate,
            config.acquisition.sample_rate_hz
        );
    }

    let mut solver = LocalizationSolver::new(config);
    if let Some(threshold) = cmd.threshold {
        for channel in [Channel::Left, Channel::Right] {
            solver.analyzer_mut(channel).set_threshold(threshold);
        }
    }

    let fix = solver.solve(&block.left, &block.right, cmd.offset_frames)?;
    println!("angle      {:.3} deg", fix.angle_deg);
    println!("distance   {:.2} cm", fix.distance_cm);
    println!("t_diff     {:.3} us (lag {}, correlation {:.4})", fix.t_diff_us, fix.lag, fix.correlation);
    println!("sig_delay  {:.3} us", fix.sig_delay_us);
    println!("starts     {} / {}", fix.starts.0, fix.starts.1);
    Ok(())
}
