//! # bbsyncer — Betaflight blackbox field syncer
//!
//! A device-resident agent for the flying field: plug a flight controller
//! in over USB and it downloads the blackbox flash, verifies the copy,
//! writes an audit manifest, and only then erases the FC — signalling
//! progress on an indicator LED the whole time.
//!
//! ## Module organization
//!
//! - [`msp`] — MSP v1/v2 frame codec, CRCs, Huffman decompression, the
//!   serial transport, and the pipelined request/response client
//! - [`fc`] — flight-controller handshake and flash state queries
//! - [`sync`] — the ten-step sync orchestrator
//! - [`storage`] — per-FC session directories, image writer, manifests
//! - [`signal`] — LED pattern driver (sysfs and GPIO backends)
//! - [`disk`] — free-space preflight
//! - [`config`] — TOML configuration
//! - [`error`] — the sync error taxonomy and exit codes
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use bbsyncer::config::Config;
//! use bbsyncer::msp::{MspClient, Transport};
//! use bbsyncer::signal;
//! use bbsyncer::sync::{CancelFlag, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None);
//!     let transport = Transport::open_serial("/dev/ttyACM0", config.serial.baud)?;
//!     let mut client = MspClient::new(transport, config.request_timeout());
//!     let (handle, _driver) = signal::spawn(signal::backend_from_config(&config.led));
//!     let mut orchestrator = Orchestrator::new(config, handle, CancelFlag::new(), false);
//!     orchestrator.run(&mut client).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod disk;
pub mod error;
pub mod fc;
pub mod msp;
pub mod signal;
pub mod storage;
pub mod sync;
