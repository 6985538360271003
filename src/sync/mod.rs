//! The sync orchestrator: ten steps from "FC attached" to "flash copied,
//! verified, and erased".
//!
//! ```text
//! IDENTIFY → SUMMARY → CHECK_DISK → OPEN_SESSION → STREAM →
//! VERIFY → WRITE_MANIFEST → ERASE → POLL_EMPTY → DONE_OK
//! ```
//!
//! An empty flash short-circuits to `DONE_EMPTY`; any unrecoverable error
//! is `DONE_ERROR`. The hard invariants live here:
//!
//! * a chunk is written to the file only in strict offset order;
//! * the manifest is durable on disk before the erase frame is written;
//! * a failed verification retains the session and never erases.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::time::{sleep, Instant};

use crate::config::Config;
use crate::disk;
use crate::error::{Stage, SyncError};
use crate::fc::{self, BlackboxDevice};
use crate::msp::{op, FlashReadPlan, MspClient};
use crate::signal::{SignalEvent, SignalHandle};
use crate::storage::Session;

/// Terminal states that exit 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Flash copied (and erased unless disabled); path of the session dir.
    Completed { session_dir: std::path::PathBuf },
    /// Nothing on the FC to copy; no session directory was created.
    FlashEmpty,
}

/// External cancel trigger (ctrl-c, service stop). Checked between
/// chunks and poll rounds.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Orchestrator {
    config: Config,
    signal: SignalHandle,
    cancel: CancelFlag,
    dry_run: bool,
    /// Runs between stream completion and verification. Integrity tests
    /// use it to corrupt the on-disk copy at the one moment that matters.
    pre_verify: Option<Box<dyn FnOnce(&Path) + Send>>,
}

impl Orchestrator {
    pub fn new(config: Config, signal: SignalHandle, cancel: CancelFlag, dry_run: bool) -> Self {
        Self {
            config,
            signal,
            cancel,
            dry_run,
            pre_verify: None,
        }
    }

    #[doc(hidden)]
    pub fn set_pre_verify(&mut self, hook: Box<dyn FnOnce(&Path) + Send>) {
        self.pre_verify = Some(hook);
    }

    /// Run the whole workflow, emitting the terminal signal pattern.
    pub async fn run(&mut self, client: &mut MspClient) -> Result<SyncOutcome, SyncError> {
        let result = self.execute(client).await;
        match &result {
            Ok(SyncOutcome::Completed { session_dir }) => {
                info!("sync complete: {}", session_dir.display());
                self.signal.emit(SignalEvent::Success);
            }
            Ok(SyncOutcome::FlashEmpty) => {
                info!("flash is empty, nothing to sync");
                self.signal.emit(SignalEvent::Empty);
            }
            Err(e) => {
                error!("sync failed: {e}");
                self.signal.emit(SignalEvent::Error);
            }
        }
        result
    }

    async fn execute(&mut self, client: &mut MspClient) -> Result<SyncOutcome, SyncError> {
        let deadline = Instant::now() + self.config.sync_timeout();
        let cfg = self.config.clone();

        // --- IDENTIFY ---
        info!("step 1/10: identifying flight controller");
        self.check_cancel()?;
        let identity = fc::identify(client).await?;
        let device = fc::blackbox_device(client).await?;
        if device == BlackboxDevice::SdCard {
            return Err(SyncError::SdCardBackedFc);
        }

        // --- SUMMARY ---
        info!("step 2/10: querying flash state");
        let summary = fc::read_summary(client).await?;
        info!(
            "flash: ready={} used={} total={} compression={}",
            summary.ready(),
            summary.used_size,
            summary.total_size,
            summary.supports_compression(),
        );
        if summary.total_size == 0 || !summary.supported() {
            return Err(SyncError::UnsupportedFc(
                "no dataflash present on this board".into(),
            ));
        }
        if !summary.ready() {
            return Err(SyncError::Protocol {
                stage: Stage::Summary,
                reason: "flash not ready (erase or logging in progress?)".into(),
            });
        }
        let used_size = summary.used_size;
        if used_size == 0 {
            return Ok(SyncOutcome::FlashEmpty);
        }

        // --- CHECK_DISK ---
        info!("step 3/10: checking storage space");
        std::fs::create_dir_all(&cfg.storage.storage_path).map_err(SyncError::Storage)?;
        disk::require(
            &cfg.storage.storage_path,
            u64::from(used_size),
            cfg.headroom_bytes(),
        )?;

        // --- OPEN_SESSION ---
        info!("step 4/10: opening session directory");
        let mut session = Session::open(&cfg.storage.storage_path, &identity, device)?;

        // --- STREAM ---
        info!(
            "step 5/10: reading {used_size} bytes from flash into {}",
            session.data_path().display()
        );
        self.signal.emit(SignalEvent::CopyStart);
        let compressed = cfg.sync.allow_compressed_read && summary.supports_compression();
        if let Err(e) = self
            .stream_flash(client, &mut session, used_size, compressed, deadline)
            .await
        {
            match e {
                SyncError::Cancelled => {
                    // Keep what we have: close the file and seal an audit
                    // manifest saying no erase happened.
                    let _ = session.finish_file();
                    let sha = session.streaming_sha256();
                    if let Err(seal_err) = session.seal(sha, false) {
                        warn!("could not seal cancelled session: {seal_err}");
                    }
                    return Err(SyncError::Cancelled);
                }
                other => {
                    // A partial image is useless; reclaim the space.
                    session.discard();
                    return Err(other);
                }
            }
        }
        session.finish_file()?;

        // --- VERIFY ---
        info!("step 6/10: verifying on-disk copy");
        self.signal.emit(SignalEvent::VerifyStart);
        if session.bytes_written() != u64::from(used_size) {
            let got = session.bytes_written();
            session.discard();
            return Err(SyncError::Protocol {
                stage: Stage::Stream,
                reason: format!("stream ended early: {got} of {used_size} bytes"),
            });
        }
        if let Some(hook) = self.pre_verify.take() {
            hook(session.data_path());
        }
        let sha256 = match session.verify() {
            Ok(sha) => sha,
            Err(e) => {
                // Retain the session for a retry; record what happened.
                let sha = session.streaming_sha256();
                if let Err(seal_err) = session.seal(sha, false) {
                    warn!("could not seal failed session: {seal_err}");
                }
                return Err(e);
            }
        };
        info!("integrity ok, sha256={sha256}");

        // --- WRITE_MANIFEST ---
        info!("step 7/10: writing manifest");
        let erasing = !self.dry_run && cfg.sync.erase_after_sync;
        session.seal(sha256, erasing)?;
        if !erasing {
            info!("erase disabled ({}), stopping after copy",
                if self.dry_run { "dry run" } else { "erase_after_sync = false" });
            return Ok(SyncOutcome::Completed {
                session_dir: session.dir().to_path_buf(),
            });
        }

        // --- ERASE ---
        info!("step 8/10: erasing FC flash");
        self.check_cancel()?;
        self.signal.emit(SignalEvent::EraseStart);
        client
            .send(op::DATAFLASH_ERASE, &[])
            .await
            .map_err(|e| SyncError::from_msp(Stage::Erase, e))?;

        // --- POLL_EMPTY ---
        info!("step 9/10: waiting for erase to finish");
        self.poll_until_empty(client, deadline).await?;
        session.record_erase_completed()?;

        info!("step 10/10: done");
        Ok(SyncOutcome::Completed {
            session_dir: session.dir().to_path_buf(),
        })
    }

    /// Pipelined copy of `[0, used_size)` into the session file, strict
    /// offset order, hashing as it goes.
    async fn stream_flash(
        &self,
        client: &mut MspClient,
        session: &mut Session,
        used_size: u32,
        compressed: bool,
        deadline: Instant,
    ) -> Result<(), SyncError> {
        let cfg = &self.config;
        let plan = FlashReadPlan {
            used_size,
            chunk_size: cfg.sync.chunk_size_bytes.min(u32::from(u16::MAX)) as u16,
            depth: usize::from(cfg.sync.pipeline_depth.max(1)),
            compressed,
            chunk_timeout: cfg.chunk_timeout(),
        };
        let mut stream = client.flash_stream(plan);
        let mut chunks: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(SyncError::Timeout {
                    stage: Stage::FullSync,
                });
            }
            match stream.next_chunk().await {
                Ok(Some(chunk)) => {
                    session.write_chunk(&chunk)?;
                    chunks += 1;
                    if chunks % 64 == 0 {
                        debug!(
                            "read {:#010x} / {:#010x} ({}%)",
                            session.bytes_written(),
                            used_size,
                            session.bytes_written() * 100 / u64::from(used_size)
                        );
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(SyncError::from_msp(Stage::Stream, e)),
            }
        }
    }

    /// Poll the summary until the flash reads empty and ready, or the
    /// erase window closes.
    async fn poll_until_empty(
        &self,
        client: &mut MspClient,
        sync_deadline: Instant,
    ) -> Result<(), SyncError> {
        let poll_deadline = Instant::now() + self.config.erase_timeout();
        loop {
            self.check_cancel()?;
            sleep(self.config.erase_poll_interval()).await;
            if Instant::now() >= poll_deadline {
                return Err(SyncError::EraseTimeout);
            }
            if Instant::now() >= sync_deadline {
                return Err(SyncError::Timeout {
                    stage: Stage::FullSync,
                });
            }
            match fc::read_summary(client).await {
                Ok(summary) => {
                    debug!(
                        "erase poll: used={} ready={}",
                        summary.used_size,
                        summary.ready()
                    );
                    if summary.used_size == 0 && summary.ready() {
                        return Ok(());
                    }
                }
                // The FC is busy wiping sectors; a missed poll is normal.
                Err(e) => warn!("summary poll failed during erase: {e}"),
            }
        }
    }

    fn check_cancel(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}
