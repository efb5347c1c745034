use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camprobe::{ui, AcquisitionSettings, CamProbe, CameraConfig, CaptureError, ShellEvent};
use camprobe_view::Viewer;
use clap::Parser;
use log::{error, info, warn};
use signal_hook::consts::SIGINT;
use signal_hook::flag;

const UI_POLL: Duration = Duration::from_millis(100);

/// Find the first USB device with an IN endpoint and try to pull frames off every endpoint it has
#[derive(Parser)]
#[command(name = "camprobe")]
#[command(version)]
struct Args {
    /// Frame width in pixels (YUY2)
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value_t = 480)]
    height: u32,

    #[arg(long, default_value_t = 30)]
    frame_rate: u32,

    /// Delay between probe ticks
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Timeout for bulk, interrupt and isochronous reads
    #[arg(long, default_value_t = 1000)]
    transfer_timeout_ms: u64,

    /// Write the most recently displayed frame here as PNG
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose logging (use RUST_LOG=debug for more)
    #[arg(short, long)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = match CameraConfig::new(args.frame_rate, args.width, args.height) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            return ExitCode::from(2);
        }
    };
    let settings = AcquisitionSettings {
        tick_interval: Duration::from_millis(args.tick_ms),
        transfer_timeout: Duration::from_millis(args.transfer_timeout_ms),
    };

    let (ui, queue) = ui::channel();
    let probe = match CamProbe::connect(config, settings, ui) {
        Ok(probe) => probe,
        Err(err) => {
            error!("could not set up USB access: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let events = probe.events();

    let interrupted = Arc::new(AtomicBool::new(false));
    if let Err(err) = flag::register(SIGINT, Arc::clone(&interrupted)) {
        warn!("Ctrl-C will not stop probing cleanly: {}", err);
    }

    let session = match thread::Builder::new()
        .name("arbiter".into())
        .spawn(move || probe.run())
    {
        Ok(session) => session,
        Err(err) => {
            error!("could not start probing: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut viewer = Viewer::new(args.output);
    if args.quiet {
        viewer = viewer.quiet();
    }

    // The UI thread: drain until every producer has gone away.
    let mut shutdown_sent = false;
    while queue.drain_timeout(&mut viewer, UI_POLL).is_some() {
        if interrupted.load(Ordering::Relaxed) && !shutdown_sent {
            info!("interrupted, shutting down");
            if events.send(ShellEvent::Shutdown).is_err() {
                break;
            }
            shutdown_sent = true;
        }
    }

    let result = match session.join() {
        Ok(result) => result,
        Err(_) => {
            error!("probing thread panicked");
            return ExitCode::FAILURE;
        }
    };

    info!("{} frame(s) displayed", viewer.frames_shown());

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            exit_code(&err)
        }
    }
}

fn exit_code(err: &CaptureError) -> ExitCode {
    match err {
        CaptureError::NoCamera => ExitCode::from(3),
        CaptureError::PermissionDenied(_) => ExitCode::from(4),
        CaptureError::Open { .. } | CaptureError::Claim { .. } => ExitCode::from(5),
        _ => ExitCode::FAILURE,
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let env = env_logger::Env::default();

    let env = if quiet {
        env.default_filter_or("error")
    } else if verbose {
        env.default_filter_or("debug")
    } else {
        env.default_filter_or("warn")
    };

    env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .init();
}
