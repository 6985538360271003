//! Binary entrypoint.
//!
//! Invoked by the device-attach trigger (udev → systemd) when a flight
//! controller enumerates, or by hand:
//!
//! ```text
//! bbsyncer [--port /dev/ttyACM0] [--config path] [--dry-run] [-v]
//! ```
//!
//! Exits 0 when the sync completed or the flash was already empty;
//! non-zero with one code per error category otherwise.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};

use bbsyncer::config::Config;
use bbsyncer::error::SyncError;
use bbsyncer::msp::{MspClient, Transport};
use bbsyncer::signal::{self, SignalEvent};
use bbsyncer::sync::{CancelFlag, Orchestrator, SyncOutcome};

/// Let the terminal LED pattern play out before restoring the trigger.
const LED_GRACE: Duration = Duration::from_secs(6);

#[derive(Parser)]
#[command(name = "bbsyncer")]
#[command(about = "Download, verify, store, and erase Betaflight blackbox flash")]
#[command(version)]
struct Cli {
    /// Serial port (e.g. /dev/ttyACM0). Empty = auto-detect.
    #[arg(short, long)]
    port: Option<String>,

    /// Configuration file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Copy and verify but skip the erase step.
    #[arg(long)]
    dry_run: bool,

    /// Verbose logging (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    info!("bbsyncer v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(cli.config.as_deref());

    let port = cli
        .port
        .clone()
        .filter(|p| !p.is_empty())
        .or_else(|| {
            let configured = config.serial.port.clone();
            (!configured.is_empty()).then_some(configured)
        })
        .or_else(auto_detect_port);
    let Some(port) = port else {
        error!("no serial port given and no /dev/ttyACM* present; use --port");
        std::process::exit(2);
    };

    info!("starting sync on {port} (dry_run={})", cli.dry_run);

    let (handle, driver) = signal::spawn(signal::backend_from_config(&config.led));

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("cancel requested, stopping after the current chunk");
                cancel.trigger();
            }
        });
    }

    let code = match Transport::open_serial(&port, config.serial.baud) {
        Ok(transport) => {
            let mut client = MspClient::new(transport, config.request_timeout());
            let mut orchestrator = Orchestrator::new(config, handle.clone(), cancel, cli.dry_run);
            match orchestrator.run(&mut client).await {
                Ok(SyncOutcome::Completed { session_dir }) => {
                    info!("saved to {}", session_dir.display());
                    0
                }
                Ok(SyncOutcome::FlashEmpty) => 0,
                Err(e) => {
                    error!("{e}");
                    e.exit_code()
                }
            }
        }
        Err(e) => {
            let err = SyncError::SerialOpen {
                port: port.clone(),
                source: e,
            };
            error!("{err}");
            handle.emit(SignalEvent::Error);
            err.exit_code()
        }
    };

    // Give the pilot a readable terminal pattern, then let the driver
    // restore the LED and exit.
    tokio::time::sleep(LED_GRACE).await;
    drop(handle);
    let _ = driver.await;

    info!("exit code {code}");
    std::process::exit(code);
}

/// First `/dev/ttyACM*` in sorted order, the way Betaflight boards
/// enumerate on Linux.
fn auto_detect_port() -> Option<String> {
    let mut ports: Vec<String> = std::fs::read_dir(Path::new("/dev"))
        .ok()?
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with("ttyACM"))
        .map(|name| format!("/dev/{name}"))
        .collect();
    ports.sort();
    let port = ports.into_iter().next()?;
    info!("auto-detected port {port}");
    Some(port)
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|fmt, record| {
        writeln!(
            fmt,
            "{} [{}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            record.level(),
            record.args()
        )
    });
    let _ = builder.try_init();
}
