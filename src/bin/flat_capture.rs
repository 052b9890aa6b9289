// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::Arc;

use canonical_error::{CanonicalError, invalid_argument_error};
use clap::Parser;
use log::{error, info, warn};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use flat_capture::estimate_store::{ExposureEstimateStore, JsonFileEstimateStore,
                                   MemoryEstimateStore};
use flat_capture::exposure::{ExposureLimits, RefinementStrategy};
use flat_capture::options::{DitherOptions, MountOptions, SaveDestination,
                            SessionOptions};
use flat_capture::progress::{EventSink, SessionEvent, SessionOutcome};
use flat_capture::session_control::SessionController;
use flat_capture::session_engine::SessionEngine;
use flat_capture::skyx_client::{ImagingServer, SkyXClient};
use flat_capture::work_item::{FilterSpec, WorkItem};

// Console lines are indented this many spaces per level.
const CONSOLE_INDENTATION_DEPTH: usize = 3;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Address of the machine running TheSkyX.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// TheSkyX TCP server port.
    #[arg(long, default_value = "3040")]
    port: u16,

    /// Desired average ADU level of each flat frame.
    #[arg(long, default_value = "25000")]
    target_adu: f64,

    /// Acceptable deviation from target_adu, as a fraction.
    #[arg(long, default_value = "0.10")]
    tolerance: f64,

    /// A set of frames to capture, e.g. "16:2:Red:1" for 16 frames with the
    /// Red filter in slot 2, binned 1x1. Repeat for more sets; they are
    /// captured in the order given.
    #[arg(long = "item", value_name = "COUNT:SLOT:NAME:BINNING", required = true)]
    items: Vec<String>,

    /// The camera has no filter wheel.
    #[arg(long)]
    no_filter_wheel: bool,

    /// Directory, on the machine running TheSkyX, to save frames in. If
    /// omitted, frames go to the camera's autosave directory.
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Turn off camera cooling when the session completes.
    #[arg(long)]
    warm_when_done: bool,

    /// Exposure refinement: linear|bracket.
    #[arg(long, default_value = "linear")]
    strategy: String,

    /// Shortest exposure we will request, seconds.
    #[arg(long, default_value = "0.001")]
    min_exposure: f64,

    /// Longest exposure we will request, seconds.
    #[arg(long, default_value = "60.0")]
    max_exposure: f64,

    /// Allow the session to control the mount.
    #[arg(long)]
    mount_control: bool,

    /// Home the mount before starting.
    #[arg(long)]
    home_mount: bool,

    /// Altitude of the flat light source, degrees. Together with
    /// --source-az, the mount slews there before capturing.
    #[arg(long, requires = "source_az")]
    source_alt: Option<f64>,

    /// Azimuth of the flat light source, degrees.
    #[arg(long, requires = "source_alt")]
    source_az: Option<f64>,

    /// Turn off mount tracking once positioned.
    #[arg(long)]
    tracking_off: bool,

    /// Park the mount when the session completes.
    #[arg(long)]
    park_when_done: bool,

    /// Disconnect the mount when the session completes.
    #[arg(long)]
    disconnect_mount_when_done: bool,

    /// Move the scope slightly between frames. Requires --mount-control.
    #[arg(long)]
    dither: bool,

    /// Spacing of dither rings, arc-seconds.
    #[arg(long, default_value = "5.0")]
    dither_radius: f64,

    /// Largest dither ring, arc-seconds.
    #[arg(long, default_value = "30.0")]
    dither_max_radius: f64,

    /// JSON file remembering good exposures between sessions.
    #[arg(long)]
    estimates_file: Option<PathBuf>,

    #[arg(long, default_value = ".")]
    log_dir: String,

    #[arg(long, default_value = "flat_capture_log.txt")]
    log_file: String,
}

// "16:2:Red:1" -> 16 frames, filter slot 2 named Red, binning 1x1.
fn parse_item(spec: &str, target_adu: f64, tolerance: f64)
              -> Result<WorkItem, CanonicalError> {
    let bad_item = || invalid_argument_error(
        format!("Work item \"{}\" is not COUNT:SLOT:NAME:BINNING.", spec).as_str());
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 4 {
        return Err(bad_item());
    }
    let count: u32 = parts[0].parse().map_err(|_| bad_item())?;
    let slot: u32 = parts[1].parse().map_err(|_| bad_item())?;
    let binning: u32 = parts[3].parse().map_err(|_| bad_item())?;
    let filter = FilterSpec::new(slot, parts[2])?;
    WorkItem::new(count, filter, binning, target_adu, tolerance)
}

fn session_options(args: &Args) -> Result<SessionOptions, CanonicalError> {
    let options = SessionOptions{
        host: args.host.clone(),
        port: args.port,
        target_adu: args.target_adu,
        tolerance: args.tolerance,
        save_destination: match &args.save_dir {
            Some(dir) => SaveDestination::Local(dir.clone()),
            None => SaveDestination::Autosave,
        },
        use_filter_wheel: !args.no_filter_wheel,
        mount: MountOptions{
            control_mount: args.mount_control,
            home_mount: args.home_mount,
            source_alt_az: args.source_alt.zip(args.source_az),
            tracking_off: args.tracking_off,
            park_when_done: args.park_when_done,
            disconnect_when_done: args.disconnect_mount_when_done,
        },
        dither: DitherOptions{
            enabled: args.dither,
            step_radius_arcsec: args.dither_radius,
            max_radius_arcsec: args.dither_max_radius,
        },
        warm_when_done: args.warm_when_done,
        strategy: args.strategy.parse::<RefinementStrategy>()?,
        exposure_limits: ExposureLimits{min_seconds: args.min_exposure,
                                        max_seconds: args.max_exposure},
    };
    options.validate()?;
    Ok(options)
}

fn main() {
    let args = Args::parse();

    // Set up logging.
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Cannot log to {}/{}: {}", args.log_dir, args.log_file, e);
            std::process::exit(1);
        }
    };
    let (non_blocking_file, file_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, stdout_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let exit_code = match run(&args) {
        Ok(SessionOutcome::Completed) => 0,
        Ok(SessionOutcome::Cancelled) => 2,
        Ok(SessionOutcome::Failed{..}) => 1,
        Err(e) => {
            error!("{}", e.message);
            1
        }
    };
    // Flush logs before exiting.
    drop(file_guard);
    drop(stdout_guard);
    std::process::exit(exit_code);
}

fn run(args: &Args) -> Result<SessionOutcome, CanonicalError> {
    let options = session_options(args)?;
    let work_items = args.items.iter()
        .map(|spec| parse_item(spec, options.target_adu, options.tolerance))
        .collect::<Result<Vec<WorkItem>, CanonicalError>>()?;
    let estimates: Box<dyn ExposureEstimateStore + Send + Sync> =
        match &args.estimates_file {
            Some(path) => Box::new(JsonFileEstimateStore::open(path)?),
            None => Box::new(MemoryEstimateStore::new()),
        };

    // First control-c cancels the session; a second one exits immediately.
    let controller = SessionController::new();
    let controller2 = controller.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if controller2.is_running() {
            info!("Got control-c, cancelling session");
            controller2.request_cancel();
        } else {
            info!("Exiting");
            std::process::exit(-1);
        }
    }) {
        warn!("Could not install control-c handler: {}", e);
    }

    Ok(async_main(options, work_items, estimates, controller))
}

#[tokio::main]
async fn async_main(options: SessionOptions,
                    work_items: Vec<WorkItem>,
                    estimates: Box<dyn ExposureEstimateStore + Send + Sync>,
                    controller: SessionController) -> SessionOutcome {
    let client = Arc::new(SkyXClient::new(&options.host, options.port));
    if options.save_destination == SaveDestination::Autosave {
        match client.autosave_path().await {
            Ok(path) => info!("Saving frames to autosave directory {}", path),
            Err(e) => warn!("Could not read autosave directory: {}", e.message),
        }
    }
    match client.camera_temperature().await {
        Ok(t) => info!("Camera temperature {:.1}C", t),
        Err(e) => warn!("Could not read camera temperature: {}", e.message),
    }

    let (events, mut receiver) = EventSink::channel();
    let engine = SessionEngine::new(client, options, controller, events, estimates);
    let session = engine.spawn(work_items);

    while let Some(event) = receiver.recv().await {
        match event {
            SessionEvent::ConsoleLine{text, indent} => {
                println!("{}{}", " ".repeat(indent as usize * CONSOLE_INDENTATION_DEPTH),
                         text);
            }
            SessionEvent::FramesCompleted{index, completed} => {
                info!("Work item {}: {} frames completed", index, completed);
            }
            SessionEvent::Finished(_) => break,
            _ => (),
        }
    }

    match session.await {
        Ok((outcome, work_items)) => {
            for item in &work_items {
                info!("{}: {} of {} frames", item, item.frames_completed(),
                      item.frame_count());
            }
            outcome
        }
        Err(e) => {
            error!("Session task failed: {}", e);
            SessionOutcome::Failed{message: e.to_string()}
        }
    }
}

// mod tests.
