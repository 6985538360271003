//! Flight-controller identification and flash state queries.
//!
//! The handshake runs a fixed sequence — API version gate, variant gate,
//! UID, flash summary, blackbox device probe — and each step fails with
//! its own error kind so the operator light and the logs can tell them
//! apart.

use log::{info, warn};

use crate::error::{Stage, SyncError};
use crate::msp::{op, summary_flags, MspClient, MspError};

/// The only firmware family this agent talks to.
pub const SUPPORTED_VARIANT: &[u8; 4] = b"BTFL";
/// Oldest MSP API that carries the dataflash opcodes we rely on.
pub const MIN_API_VERSION: (u8, u8) = (1, 40);

/// Immutable identity of the attached controller, fixed for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcIdentity {
    pub variant: [u8; 4],
    pub uid: [u8; 12],
    pub api_version: (u8, u8),
}

impl FcIdentity {
    pub fn variant_str(&self) -> String {
        String::from_utf8_lossy(&self.variant).into_owned()
    }

    pub fn uid_hex(&self) -> String {
        self.uid.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Short UID used in the per-FC directory name.
    pub fn uid_prefix(&self) -> String {
        self.uid_hex().chars().take(8).collect()
    }

    pub fn api_version_str(&self) -> String {
        format!("{}.{}", self.api_version.0, self.api_version.1)
    }
}

/// Parsed `DATAFLASH_SUMMARY` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashSummary {
    pub flags: u8,
    pub sectors: u32,
    pub total_size: u32,
    pub used_size: u32,
}

impl FlashSummary {
    pub fn ready(&self) -> bool {
        self.flags & summary_flags::READY != 0
    }

    pub fn supported(&self) -> bool {
        self.flags & summary_flags::SUPPORTED != 0
    }

    pub fn supports_compression(&self) -> bool {
        self.flags & summary_flags::READ_COMPRESSED_SUPPORT != 0
    }
}

/// Where the firmware writes its blackbox log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlackboxDevice {
    None,
    SpiFlash,
    SdCard,
    Serial,
    Unknown(u8),
}

impl BlackboxDevice {
    fn from_wire(b: u8) -> Self {
        match b {
            0 => BlackboxDevice::None,
            1 => BlackboxDevice::SpiFlash,
            2 => BlackboxDevice::SdCard,
            3 => BlackboxDevice::Serial,
            other => BlackboxDevice::Unknown(other),
        }
    }

    pub fn wire_value(&self) -> u8 {
        match self {
            BlackboxDevice::None => 0,
            BlackboxDevice::SpiFlash => 1,
            BlackboxDevice::SdCard => 2,
            BlackboxDevice::Serial => 3,
            BlackboxDevice::Unknown(v) => *v,
        }
    }
}

fn step_err(e: MspError) -> SyncError {
    SyncError::from_msp(Stage::Identify, e)
}

/// Steps 1–3 of the handshake: version gate, variant gate, UID.
///
/// The variant gate runs before the UID query, so an unsupported firmware
/// sees exactly two requests and nothing more.
pub async fn identify(client: &mut MspClient) -> Result<FcIdentity, SyncError> {
    let payload = client
        .request(op::API_VERSION, &[])
        .await
        .map_err(step_err)?;
    if payload.len() < 3 {
        return Err(SyncError::Protocol {
            stage: Stage::Identify,
            reason: format!("API_VERSION reply too short ({} bytes)", payload.len()),
        });
    }
    // byte 0 is the MSP protocol revision; the API pair follows.
    let api_version = (payload[1], payload[2]);
    info!("MSP API version {}.{}", api_version.0, api_version.1);
    if api_version < MIN_API_VERSION {
        return Err(SyncError::UnsupportedFc(format!(
            "API {}.{} older than required {}.{}",
            api_version.0, api_version.1, MIN_API_VERSION.0, MIN_API_VERSION.1
        )));
    }

    let payload = client
        .request(op::FC_VARIANT, &[])
        .await
        .map_err(step_err)?;
    if payload.len() < 4 {
        return Err(SyncError::Protocol {
            stage: Stage::Identify,
            reason: format!("FC_VARIANT reply too short ({} bytes)", payload.len()),
        });
    }
    let mut variant = [0u8; 4];
    variant.copy_from_slice(&payload[..4]);
    info!("FC variant {:?}", String::from_utf8_lossy(&variant));
    if &variant != SUPPORTED_VARIANT {
        return Err(SyncError::UnsupportedFc(format!(
            "variant {:?}, expected {:?}",
            String::from_utf8_lossy(&variant),
            String::from_utf8_lossy(SUPPORTED_VARIANT),
        )));
    }

    let payload = client.request(op::UID, &[]).await.map_err(step_err)?;
    if payload.len() < 12 {
        return Err(SyncError::Protocol {
            stage: Stage::Identify,
            reason: format!("UID reply too short ({} bytes)", payload.len()),
        });
    }
    let mut uid = [0u8; 12];
    uid.copy_from_slice(&payload[..12]);

    let identity = FcIdentity {
        variant,
        uid,
        api_version,
    };
    info!("FC identified: uid={}", identity.uid_hex());
    Ok(identity)
}

/// Step 4: flash summary. Layout: `flags:u8, sectors:u32, total:u32,
/// used:u32`, all little-endian.
pub async fn read_summary(client: &mut MspClient) -> Result<FlashSummary, SyncError> {
    let payload = client
        .request(op::DATAFLASH_SUMMARY, &[])
        .await
        .map_err(|e| SyncError::from_msp(Stage::Summary, e))?;
    if payload.len() < 13 {
        return Err(SyncError::Protocol {
            stage: Stage::Summary,
            reason: format!("DATAFLASH_SUMMARY reply too short ({} bytes)", payload.len()),
        });
    }
    let u32_at = |i: usize| u32::from_le_bytes([payload[i], payload[i + 1], payload[i + 2], payload[i + 3]]);
    Ok(FlashSummary {
        flags: payload[0],
        sectors: u32_at(1),
        total_size: u32_at(5),
        used_size: u32_at(9),
    })
}

/// Step 5: blackbox device probe. Reply byte 0 is a supported flag and
/// byte 1 the device kind; everything after that varies with the API
/// version and is ignored.
pub async fn blackbox_device(client: &mut MspClient) -> Result<BlackboxDevice, SyncError> {
    let payload = match client.request(op::BLACKBOX_CONFIG, &[]).await {
        Ok(p) => p,
        Err(MspError::Timeout { .. }) | Err(MspError::ErrorResponse { .. }) => {
            // Old firmware without the opcode: treat as not SD-backed and
            // let the flash summary decide whether logging exists at all.
            warn!("BLACKBOX_CONFIG unavailable, assuming SPI flash logging");
            return Ok(BlackboxDevice::Unknown(0xFF));
        }
        Err(e) => return Err(step_err(e)),
    };
    if payload.len() < 2 {
        return Err(SyncError::Protocol {
            stage: Stage::Identify,
            reason: format!("BLACKBOX_CONFIG reply too short ({} bytes)", payload.len()),
        });
    }
    let device = BlackboxDevice::from_wire(payload[1]);
    info!("blackbox device: {device:?}");
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_rendering() {
        let id = FcIdentity {
            variant: *SUPPORTED_VARIANT,
            uid: [0x12, 0xAB, 0x34, 0xCD, 0, 0, 0, 0, 0, 0, 0, 0xEF],
            api_version: (1, 46),
        };
        assert_eq!(id.uid_hex(), "12ab34cd00000000000000ef");
        assert_eq!(id.uid_prefix(), "12ab34cd");
        assert_eq!(id.api_version_str(), "1.46");
    }

    #[test]
    fn summary_flag_bits() {
        let s = FlashSummary {
            flags: summary_flags::READY | summary_flags::SUPPORTED,
            sectors: 128,
            total_size: 16 << 20,
            used_size: 0,
        };
        assert!(s.ready());
        assert!(s.supported());
        assert!(!s.supports_compression());
    }

    #[test]
    fn blackbox_device_mapping() {
        assert_eq!(BlackboxDevice::from_wire(1), BlackboxDevice::SpiFlash);
        assert_eq!(BlackboxDevice::from_wire(2), BlackboxDevice::SdCard);
        assert_eq!(BlackboxDevice::from_wire(9), BlackboxDevice::Unknown(9));
    }
}
