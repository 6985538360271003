//! Sync-level error taxonomy. Every variant carries enough context to log,
//! pick an exit code, and drive the error light pattern.

use std::fmt;

use crate::msp::MspError;

/// Which phase of the sync a timeout or protocol failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Identify,
    Summary,
    Stream,
    Erase,
    FullSync,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Identify => "identify",
            Stage::Summary => "flash summary",
            Stage::Stream => "flash stream",
            Stage::Erase => "erase",
            Stage::FullSync => "full sync",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("cannot open serial port {port}: {source}")]
    SerialOpen {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial link failed during {stage}: {source}")]
    SerialIo {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out during {stage}")]
    Timeout { stage: Stage },

    #[error("protocol violation during {stage}: {reason}")]
    Protocol { stage: Stage, reason: String },

    #[error("unsupported flight controller: {0}")]
    UnsupportedFc(String),

    #[error("flight controller logs to its SD card; pull the card and read it directly")]
    SdCardBackedFc,

    #[error("not enough space on storage: {have} bytes free, {need} needed")]
    InsufficientSpace { have: u64, need: u64 },

    #[error("on-disk copy does not match stream (streamed {expected}, reread {actual}); flash NOT erased")]
    VerifyMismatch { expected: String, actual: String },

    #[error("flash still reports data after the erase window; copy is safe on disk")]
    EraseTimeout,

    #[error("sync cancelled")]
    Cancelled,

    #[error("storage failure: {0}")]
    Storage(#[source] std::io::Error),
}

impl SyncError {
    /// Stable process exit codes, one per taxonomy category.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::SerialOpen { .. } => 10,
            SyncError::SerialIo { .. } => 11,
            SyncError::Timeout { .. } => 12,
            SyncError::Protocol { .. } => 13,
            SyncError::UnsupportedFc(_) => 14,
            SyncError::SdCardBackedFc => 15,
            SyncError::InsufficientSpace { .. } => 16,
            SyncError::VerifyMismatch { .. } => 17,
            SyncError::EraseTimeout => 18,
            SyncError::Cancelled => 19,
            SyncError::Storage(_) => 20,
        }
    }

    /// Attach stage context to a protocol-stack failure.
    pub fn from_msp(stage: Stage, err: MspError) -> Self {
        match err {
            MspError::Io(e) => SyncError::SerialIo { stage, source: e },
            MspError::PortClosed(reason) => SyncError::SerialIo {
                stage,
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, reason),
            },
            MspError::Timeout { .. } => SyncError::Timeout { stage },
            other => SyncError::Protocol {
                stage,
                reason: other.to_string(),
            },
        }
    }
}
