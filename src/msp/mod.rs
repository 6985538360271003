//! MultiWii Serial Protocol stack: checksums, frame codec, Huffman
//! decompression, transport, and the request/response client.
//!
//! Only the opcodes the syncer needs are named here. Requests go out as v1
//! frames (every opcode fits in eight bits); replies may arrive as v1 or
//! v2 and the decoder accepts both interleaved.

pub mod client;
pub mod crc;
pub mod frame;
pub mod huffman;
pub mod transport;

pub use client::{FlashReadPlan, FlashStream, MspClient};
pub use frame::{encode, Frame, FrameDecoder, FrameDirection, MspVersion};
pub use transport::{ReaderEvent, Transport};

/// MSP opcodes used by the sync workflow.
pub mod op {
    pub const API_VERSION: u16 = 1;
    pub const FC_VARIANT: u16 = 2;
    pub const DATAFLASH_SUMMARY: u16 = 70;
    pub const DATAFLASH_READ: u16 = 71;
    pub const DATAFLASH_ERASE: u16 = 72;
    pub const BLACKBOX_CONFIG: u16 = 80;
    pub const UID: u16 = 160;
}

/// `DATAFLASH_SUMMARY` flag bits.
pub mod summary_flags {
    pub const READY: u8 = 1 << 0;
    pub const SUPPORTED: u8 = 1 << 1;
    pub const READ_COMPRESSED_SUPPORT: u8 = 1 << 2;
}

/// Consecutive framer CRC mismatches tolerated within one request before
/// the client escalates to a protocol error.
pub const CRC_MISMATCH_QUOTA: u32 = 3;

/// Errors from the protocol stack. The orchestrator folds these into the
/// sync-level taxonomy with stage context attached.
#[derive(Debug, thiserror::Error)]
pub enum MspError {
    #[error("serial I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial reader stopped: {0}")]
    PortClosed(String),

    #[error("cannot encode frame: {0}")]
    Encode(&'static str),

    #[error("no response for opcode {code} within {timeout_ms} ms")]
    Timeout { code: u16, timeout_ms: u64 },

    #[error("flight controller rejected opcode {code}")]
    ErrorResponse { code: u16 },

    #[error("response for opcode {code} too short ({len} bytes)")]
    ShortPayload { code: u16, len: usize },

    #[error("repeated checksum failures on the wire")]
    CrcQuota,

    #[error("huffman decode failed: {0}")]
    Huffman(&'static str),

    #[error("flash read stream out of step: {0}")]
    Stream(String),
}
