//! Session manifest: the JSON sidecar that makes a sync auditable.
//!
//! The manifest must be durable before any erase byte goes out — it is
//! written to `manifest.json.tmp`, fsynced, renamed over `manifest.json`,
//! and the directory is fsynced, so a crash between manifest and erase
//! still leaves a parseable record with `erase_completed = false`.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fc::{BlackboxDevice, FcIdentity};

pub const MANIFEST_FILENAME: &str = "manifest.json";
pub const RAW_FLASH_FILENAME: &str = "raw_flash.bbl";

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_utc: DateTime<Utc>,
    pub fc: FcSection,
    pub file: FileSection,
    pub erase_attempted: bool,
    pub erase_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcSection {
    pub variant: String,
    pub uid: String,
    pub api_version: String,
    pub blackbox_device: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSection {
    pub name: String,
    pub bytes: u64,
    pub sha256: String,
}

impl Manifest {
    pub fn new(
        fc: &FcIdentity,
        device: BlackboxDevice,
        bytes: u64,
        sha256: String,
        erase_attempted: bool,
    ) -> Self {
        Manifest {
            version: MANIFEST_VERSION,
            created_utc: Utc::now(),
            fc: FcSection {
                variant: fc.variant_str(),
                uid: fc.uid_hex(),
                api_version: fc.api_version_str(),
                blackbox_device: device.wire_value(),
            },
            file: FileSection {
                name: RAW_FLASH_FILENAME.to_string(),
                bytes,
                sha256,
            },
            erase_attempted,
            erase_completed: false,
        }
    }
}

/// Write the manifest atomically and make it durable.
pub fn write(session_dir: &Path, manifest: &Manifest) -> std::io::Result<()> {
    let final_path = session_dir.join(MANIFEST_FILENAME);
    let tmp_path = session_dir.join(format!("{MANIFEST_FILENAME}.tmp"));

    let body = serde_json::to_vec_pretty(manifest)?;
    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(&body)?;
    tmp.sync_all()?;
    drop(tmp);

    std::fs::rename(&tmp_path, &final_path)?;
    // The rename itself must survive a crash before the erase is issued.
    File::open(session_dir)?.sync_all()?;
    Ok(())
}

pub fn read(session_dir: &Path) -> std::io::Result<Manifest> {
    let text = std::fs::read_to_string(session_dir.join(MANIFEST_FILENAME))?;
    serde_json::from_str(&text).map_err(std::io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fc::SUPPORTED_VARIANT;

    fn identity() -> FcIdentity {
        FcIdentity {
            variant: *SUPPORTED_VARIANT,
            uid: [7; 12],
            api_version: (1, 45),
        }
    }

    #[test]
    fn json_shape_is_stable() {
        let m = Manifest::new(
            &identity(),
            BlackboxDevice::SpiFlash,
            1_048_576,
            "ab".repeat(32),
            true,
        );
        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&m).unwrap()).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["fc"]["variant"], "BTFL");
        assert_eq!(value["fc"]["api_version"], "1.45");
        assert_eq!(value["fc"]["blackbox_device"], 1);
        assert_eq!(value["file"]["name"], "raw_flash.bbl");
        assert_eq!(value["file"]["bytes"], 1_048_576);
        assert_eq!(value["erase_attempted"], true);
        assert_eq!(value["erase_completed"], false);
        // ISO-8601 with a zulu suffix.
        let ts = value["created_utc"].as_str().unwrap();
        assert!(ts.ends_with('Z') || ts.ends_with("+00:00"), "timestamp {ts}");
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let m = Manifest::new(&identity(), BlackboxDevice::SpiFlash, 42, "00".repeat(32), false);
        write(dir.path(), &m).unwrap();
        assert!(!dir.path().join("manifest.json.tmp").exists());
        let back = read(dir.path()).unwrap();
        assert_eq!(back.file.bytes, 42);
        assert!(!back.erase_attempted);
        assert_eq!(back.fc.uid, "07".repeat(12));
    }
}
