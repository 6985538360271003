//! Session store: one timestamped directory per sync attempt, holding the
//! raw flash image and its manifest.
//!
//! Layout on disk:
//!
//! ```text
//! <storage_root>/
//! └── fc_BTFL_uid-12ab34cd/
//!     └── 2026-08-02_101500/
//!         ├── raw_flash.bbl
//!         └── manifest.json
//! ```
//!
//! A session directory is created with exclusive semantics (a timestamp
//! collision fails rather than overwrites), the image is hashed as it is
//! written, and verification re-reads the file from disk so the hash in
//! the manifest describes what is actually stored, not what we meant to
//! store.

pub mod manifest;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::error::SyncError;
use crate::fc::{BlackboxDevice, FcIdentity};
pub use manifest::{Manifest, MANIFEST_FILENAME, RAW_FLASH_FILENAME};

const WRITE_BUFFER: usize = 256 * 1024;
const VERIFY_BLOCK: usize = 1 << 20;

/// An open sync session. Dropped without [`Session::discard`], the files
/// stay on disk (crash-safe default: keep what we copied).
pub struct Session {
    dir: PathBuf,
    data_path: PathBuf,
    file: Option<BufWriter<File>>,
    hasher: Sha256,
    bytes_written: u64,
    fc: FcIdentity,
    device: BlackboxDevice,
}

impl Session {
    /// Create the per-FC and timestamped directories and open the image
    /// file. Fails if the session directory already exists.
    pub fn open(
        storage_root: &Path,
        fc: &FcIdentity,
        device: BlackboxDevice,
    ) -> Result<Session, SyncError> {
        let fc_dir = storage_root.join(format!(
            "fc_{}_uid-{}",
            fc.variant_str(),
            fc.uid_prefix()
        ));
        std::fs::create_dir_all(&fc_dir).map_err(SyncError::Storage)?;

        let stamp = Utc::now().format("%Y-%m-%d_%H%M%S").to_string();
        let dir = fc_dir.join(&stamp);
        std::fs::create_dir(&dir).map_err(SyncError::Storage)?;

        let data_path = dir.join(RAW_FLASH_FILENAME);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&data_path)
            .map_err(SyncError::Storage)?;
        info!("session directory {}", dir.display());

        Ok(Session {
            dir,
            data_path,
            file: Some(BufWriter::with_capacity(WRITE_BUFFER, file)),
            hasher: Sha256::new(),
            bytes_written: 0,
            fc: fc.clone(),
            device,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append a chunk, feeding the running hash.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), SyncError> {
        if data.is_empty() {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or_else(|| {
            SyncError::Storage(std::io::Error::new(
                std::io::ErrorKind::Other,
                "session file already closed",
            ))
        })?;
        file.write_all(data).map_err(SyncError::Storage)?;
        self.hasher.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flush and fsync the image; no more writes after this.
    pub fn finish_file(&mut self) -> Result<(), SyncError> {
        if let Some(mut file) = self.file.take() {
            file.flush().map_err(SyncError::Storage)?;
            file.get_ref().sync_all().map_err(SyncError::Storage)?;
            debug!(
                "closed {} ({} bytes)",
                self.data_path.display(),
                self.bytes_written
            );
        }
        Ok(())
    }

    /// Hex digest of everything passed to [`Session::write_chunk`].
    pub fn streaming_sha256(&self) -> String {
        hex_digest(self.hasher.clone().finalize().as_slice())
    }

    /// Re-read the image from disk and compare with the streaming hash.
    /// On success returns the (identical) on-disk digest.
    pub fn verify(&self) -> Result<String, SyncError> {
        let mut hasher = Sha256::new();
        let mut file = File::open(&self.data_path).map_err(SyncError::Storage)?;
        let mut block = vec![0u8; VERIFY_BLOCK];
        loop {
            let n = file.read(&mut block).map_err(SyncError::Storage)?;
            if n == 0 {
                break;
            }
            hasher.update(&block[..n]);
        }
        let disk = hex_digest(hasher.finalize().as_slice());
        let streamed = self.streaming_sha256();
        if disk != streamed {
            return Err(SyncError::VerifyMismatch {
                expected: streamed,
                actual: disk,
            });
        }
        Ok(disk)
    }

    /// Write the manifest (atomically, durable) describing this session.
    pub fn seal(&self, sha256: String, erase_attempted: bool) -> Result<(), SyncError> {
        let m = Manifest::new(
            &self.fc,
            self.device,
            self.bytes_written,
            sha256,
            erase_attempted,
        );
        manifest::write(&self.dir, &m).map_err(SyncError::Storage)
    }

    /// Flip `erase_completed` in the sealed manifest.
    pub fn record_erase_completed(&self) -> Result<(), SyncError> {
        let mut m = manifest::read(&self.dir).map_err(SyncError::Storage)?;
        m.erase_attempted = true;
        m.erase_completed = true;
        manifest::write(&self.dir, &m).map_err(SyncError::Storage)
    }

    /// Delete the partial image and the session directory (stream
    /// failure: nothing useful was captured).
    pub fn discard(mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        if let Err(e) = std::fs::remove_file(&self.data_path) {
            warn!("could not remove partial {}: {e}", self.data_path.display());
        }
        if let Err(e) = std::fs::remove_dir(&self.dir) {
            warn!("could not remove {}: {e}", self.dir.display());
        } else {
            warn!("discarded incomplete session {}", self.dir.display());
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A stored session, as the on-device browser sees it.
#[derive(Debug)]
pub struct StoredSession {
    pub fc_dir: String,
    pub session_dir: String,
    pub path: PathBuf,
    pub data_path: Option<PathBuf>,
    pub manifest: Manifest,
}

/// All sessions under `storage_root`, newest first. Directories without a
/// parseable manifest are skipped.
pub fn list_sessions(storage_root: &Path) -> std::io::Result<Vec<StoredSession>> {
    let mut sessions = Vec::new();
    let fc_dirs = match std::fs::read_dir(storage_root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
        Err(e) => return Err(e),
    };
    for fc_entry in fc_dirs.flatten() {
        if !fc_entry.file_type()?.is_dir() {
            continue;
        }
        for session_entry in std::fs::read_dir(fc_entry.path())?.flatten() {
            if !session_entry.file_type()?.is_dir() {
                continue;
            }
            let path = session_entry.path();
            let manifest = match manifest::read(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let data_path = path.join(RAW_FLASH_FILENAME);
            sessions.push(StoredSession {
                fc_dir: fc_entry.file_name().to_string_lossy().into_owned(),
                session_dir: session_entry.file_name().to_string_lossy().into_owned(),
                data_path: data_path.exists().then_some(data_path),
                path,
                manifest,
            });
        }
    }
    sessions.sort_by(|a, b| (&b.fc_dir, &b.session_dir).cmp(&(&a.fc_dir, &a.session_dir)));
    Ok(sessions)
}
