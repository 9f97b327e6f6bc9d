// src/main.rs

mod actuator;
mod cli;
mod command;
mod config;
mod detection;
mod engagement;
mod events;
mod heading;
mod mission;
mod plan;
mod types;

use actuator::{ActuatorPort, SimDrone, TelloDrone};
use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, FlyArgs, PlanArgs};
use detection::{
    DetectionFeed, DetectionPort, FrameSource, ScriptedDetector, Sensor, SyntheticFrames,
    VideoStream, YoloDetector,
};
use events::{EventSink, Fanout, MissionMetrics, TracingSink};
use mission::MissionRunner;
use plan::{format_seconds, load_plan, resolve_plan_path, summarize, Plan};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use types::Config;

/// Exit code for plan and config problems
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config);
    let level = config
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    let log_dir = config
        .as_ref()
        .map(|c| c.logging.dir.clone())
        .unwrap_or_else(|_| "logs".to_string());

    let log_request = match &cli.command {
        Commands::Fly(args) => args.log.as_deref(),
        Commands::DryRun(_) => None,
    };
    let log_files = init_logging(&level, log_request, Path::new(&log_dir))?;

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            std::process::exit(EXIT_USAGE);
        }
    };
    if !cli.config.exists() {
        info!("Using default configuration");
    }
    if let Some((flight, engage)) = &log_files {
        info!("📝 Logging to {} (engagement: {})", flight.display(), engage.display());
    }

    let code = match cli.command {
        Commands::DryRun(args) => dry_run(&args, &cli.plans_dir, &config),
        Commands::Fly(args) => fly(args, &cli.plans_dir, config).await?,
    };
    std::process::exit(code)
}

// ============================================================================
// LOGGING
// ============================================================================

/// Console logging plus, on request, a flight log and an engagement-only log.
///
/// `log` is `Some("")` for timestamped files under `dir`.
fn init_logging(level: &str, log: Option<&str>, dir: &Path) -> Result<Option<(PathBuf, PathBuf)>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("drone_patrol={},ort=warn", level)));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(env_filter);

    let paths = log.map(|request| log_paths(request, dir));
    let (flight_layer, engage_layer) = match &paths {
        Some((flight, engage)) => {
            let file_level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
            let flight_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(create_log(flight)?))
                .with_filter(
                    Targets::new()
                        .with_target("drone_patrol", file_level)
                        .with_target("engagement", file_level)
                        .with_target("mission_events", file_level),
                );
            let engage_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(create_log(engage)?))
                .with_filter(Targets::new().with_target("engagement", Level::TRACE));
            (Some(flight_layer), Some(engage_layer))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(flight_layer)
        .with(engage_layer)
        .init();

    Ok(paths)
}

/// `logs/flight_<stamp>.log` and `logs/flight_engage_<stamp>.log`, or
/// `<path>` and `<stem>_engage.<ext>` next to it
fn log_paths(request: &str, dir: &Path) -> (PathBuf, PathBuf) {
    if request.is_empty() {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        return (
            dir.join(format!("flight_{}.log", stamp)),
            dir.join(format!("flight_engage_{}.log", stamp)),
        );
    }

    let flight = PathBuf::from(request);
    let stem = flight
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "flight".to_string());
    let ext = flight
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "log".to_string());
    let engage = flight.with_file_name(format!("{}_engage.{}", stem, ext));
    (flight, engage)
}

fn create_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    File::create(path).with_context(|| format!("Failed to create log file {}", path.display()))
}

// ============================================================================
// COMMANDS
// ============================================================================

fn resolve_and_load(args: &PlanArgs, plans_dir: &Path) -> Option<(PathBuf, Plan)> {
    let path = match resolve_plan_path(args.plan.as_deref(), args.use_last, plans_dir) {
        Ok(path) => path,
        Err(e) => {
            error!("{}", e);
            return None;
        }
    };
    if args.use_last || args.plan.is_none() {
        info!("Using latest plan: {}", path.display());
    }
    match load_plan(&path) {
        Ok(plan) => Some((path, plan)),
        Err(e) => {
            error!("{:#}", e);
            None
        }
    }
}

fn dry_run(args: &PlanArgs, plans_dir: &Path, config: &Config) -> i32 {
    let Some((path, plan)) = resolve_and_load(args, plans_dir) else {
        return EXIT_USAGE;
    };
    let summary = summarize(&plan, config);

    println!("Plan: {}", path.display());
    println!(
        "Altitude {} cm, speed {} cm/s, {} segment(s)",
        summary.altitude_cm,
        summary.speed_cm_s,
        summary.segments.len()
    );
    println!(
        "Climb {} cm ({})",
        summary.climb_cm,
        format_seconds(summary.climb_s)
    );
    for segment in &summary.segments {
        println!("  {}", segment.describe());
    }
    println!(
        "Total distance {} cm, estimated mission time {}",
        summary.total_distance_cm,
        format_seconds(Some(summary.mission_s))
    );
    0
}

async fn fly(args: FlyArgs, plans_dir: &Path, mut config: Config) -> Result<i32> {
    let Some((path, plan)) = resolve_and_load(&args.plan, plans_dir) else {
        return Ok(EXIT_USAGE);
    };
    config.apply_plan_meta(&plan.meta);
    if let Some(hold) = args.hold {
        config.engagement.hold = hold.into();
    }
    info!(
        "Plan {}: {} segment(s), altitude {} cm, speed {} cm/s",
        path.display(),
        plan.segments.len(),
        config.flight.altitude_cm,
        config.flight.speed_cm_s
    );

    let metrics = Arc::new(MissionMetrics::new());
    let mut sinks = Fanout::new().with(metrics.clone());
    if config.logging.events {
        sinks = sinks.with(Arc::new(TracingSink));
    }
    let events: Arc<dyn EventSink> = Arc::new(sinks);

    let drone: Box<dyn ActuatorPort> = if args.sim {
        info!("Flying the simulated vehicle");
        Box::new(SimDrone::new())
    } else {
        Box::new(TelloDrone::new(
            config.connection.clone(),
            Duration::from_millis(config.command.response_timeout_ms),
        ))
    };

    let feed = build_feed(&config, &args);
    let abort = Arc::new(AtomicBool::new(false));
    let mut runner = MissionRunner::new(config, drone, feed, events).with_abort(abort.clone());

    let mut handle = tokio::task::spawn_blocking(move || runner.run(&plan));
    let joined = tokio::select! {
        joined = &mut handle => joined,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("Interrupt received - landing");
            abort.store(true, Ordering::SeqCst);
            handle.await
        }
    };

    let code = match joined {
        Ok(Ok(report)) => {
            info!("Mission {}", report.status.as_str());
            if let Some(reason) = &report.reason {
                info!("  Reason: {}", reason);
            }
            info!("  Segments flown: {}", report.segments_flown);
            info!("  Engagements: {}", report.engagements.len());
            for (i, result) in report.engagements.iter().enumerate() {
                info!(
                    "    [{}] standoff={} forward={}cm restored={} unretreated={}cm",
                    i,
                    result.standoff_reached,
                    result.total_forward_cm,
                    result.heading_restored,
                    result.unretreated_cm
                );
            }
            info!("  Landing: {}", report.landing);
            report.status.exit_code()
        }
        Ok(Err(e)) => {
            error!("Mission failed: {}", e);
            e.exit_code()
        }
        Err(e) => {
            error!("Mission thread failed: {}", e);
            1
        }
    };

    match serde_json::to_string(&metrics.summary()) {
        Ok(json) => info!("📊 Metrics: {}", json),
        Err(e) => warn!("Failed to serialize metrics: {}", e),
    }
    Ok(code)
}

/// Detection is a constructor-time choice: any setup failure flies the plan without it
fn build_feed(config: &Config, args: &FlyArgs) -> Option<DetectionFeed> {
    if args.no_detect || !config.detection.enabled {
        info!("Detection disabled");
        return None;
    }
    let det = &config.detection;

    let detector: Box<dyn DetectionPort> = match &args.detections {
        Some(script) => match ScriptedDetector::load(script) {
            Ok(d) => Box::new(d),
            Err(e) => {
                warn!("Detection script unavailable - disabling detection: {:#}", e);
                return None;
            }
        },
        None => match YoloDetector::new(det) {
            Ok(d) => Box::new(d),
            Err(e) => {
                warn!("Detector unavailable - disabling detection: {:#}", e);
                return None;
            }
        },
    };

    let frames: Box<dyn FrameSource> = if args.sim {
        Box::new(SyntheticFrames::new(
            det.frame_width as usize,
            det.frame_height as usize,
        ))
    } else {
        match VideoStream::new(&config.connection.video_url, det.frame_width, det.frame_height) {
            Ok(stream) => Box::new(stream),
            Err(e) => {
                warn!("Video stream unavailable - disabling detection: {:#}", e);
                return None;
            }
        }
    };

    Some(DetectionFeed::new(
        Sensor::new(frames, detector),
        det.poll_interval(),
    ))
}
