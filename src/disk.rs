//! Storage preflight: make sure the target filesystem can hold the flash
//! image plus headroom before a session directory is even created.

use std::path::Path;

use log::info;

use crate::error::SyncError;

/// Free bytes on the filesystem containing `path`.
pub fn free_bytes(path: &Path) -> std::io::Result<u64> {
    fs2::available_space(path)
}

/// Fail with [`SyncError::InsufficientSpace`] unless `need + headroom`
/// bytes are free at `path`.
pub fn require(path: &Path, need: u64, headroom: u64) -> Result<(), SyncError> {
    let have = free_bytes(path).map_err(SyncError::Storage)?;
    let total = need.saturating_add(headroom);
    info!(
        "storage preflight: {:.1} MiB free, {:.1} MiB required",
        have as f64 / (1024.0 * 1024.0),
        total as f64 / (1024.0 * 1024.0),
    );
    if have < total {
        return Err(SyncError::InsufficientSpace { have, need: total });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impossible_requirement_is_rejected() {
        let dir = std::env::temp_dir();
        let err = require(&dir, u64::MAX / 2, 0).unwrap_err();
        match err {
            SyncError::InsufficientSpace { have, need } => {
                assert!(need > have);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_requirement_passes() {
        assert!(require(&std::env::temp_dir(), 0, 0).is_ok());
    }
}
