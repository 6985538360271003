//! MSP frame encoder and incremental decoder.
//!
//! Both frame generations share the `$` lead-in and a direction byte:
//!
//!   v1: `$M<dir> <len:u8> <code:u8> <payload…> <xor:u8>`
//!   v2: `$X<dir> <flag:u8> <code:u16 LE> <len:u16 LE> <payload…> <dvb-s2:u8>`
//!
//! The decoder is a byte-at-a-time state machine so that v1 and v2 frames
//! can interleave freely on the wire and line noise resynchronizes on the
//! next `$`. Frames with a bad checksum are dropped silently (a counter is
//! kept so the client can enforce its mismatch quota).

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

use super::crc::{crc8_dvb_s2_step, crc8_xor};
use super::MspError;

/// Maximum v1 payload (length field is one byte).
pub const MAX_V1_PAYLOAD: usize = 255;
/// Maximum v2 payload (length field is two bytes).
pub const MAX_V2_PAYLOAD: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MspVersion {
    V1,
    V2,
}

/// Who a frame is travelling to, as encoded in the wire direction byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// `'<'` — request from us to the flight controller.
    ToFc,
    /// `'>'` — reply from the flight controller.
    FromFc,
    /// `'!'` — the flight controller could not process the request.
    ErrorFromFc,
}

impl FrameDirection {
    pub fn wire_byte(self) -> u8 {
        match self {
            FrameDirection::ToFc => b'<',
            FrameDirection::FromFc => b'>',
            FrameDirection::ErrorFromFc => b'!',
        }
    }

    fn from_wire(b: u8) -> Option<Self> {
        match b {
            b'<' => Some(FrameDirection::ToFc),
            b'>' => Some(FrameDirection::FromFc),
            b'!' => Some(FrameDirection::ErrorFromFc),
            _ => None,
        }
    }
}

/// A checksum-validated MSP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: MspVersion,
    pub direction: FrameDirection,
    pub code: u16,
    pub payload: Bytes,
}

/// Encode a frame for the wire.
///
/// v1 cannot express codes above 255 or payloads above [`MAX_V1_PAYLOAD`];
/// attempting to do so is a caller bug and reported as [`MspError::Encode`].
pub fn encode(
    version: MspVersion,
    direction: FrameDirection,
    code: u16,
    payload: &[u8],
) -> Result<Vec<u8>, MspError> {
    match version {
        MspVersion::V1 => {
            if code > 0xFF {
                return Err(MspError::Encode("v1 frame cannot carry a 16-bit code"));
            }
            if payload.len() > MAX_V1_PAYLOAD {
                return Err(MspError::Encode("v1 payload exceeds 255 bytes"));
            }
            let mut out = Vec::with_capacity(6 + payload.len());
            out.extend_from_slice(b"$M");
            out.push(direction.wire_byte());
            out.push(payload.len() as u8);
            out.push(code as u8);
            out.extend_from_slice(payload);
            let crc = crc8_xor(&out[3..]);
            out.push(crc);
            Ok(out)
        }
        MspVersion::V2 => {
            if payload.len() > MAX_V2_PAYLOAD {
                return Err(MspError::Encode("v2 payload exceeds 65535 bytes"));
            }
            let len = payload.len() as u16;
            let mut out = Vec::with_capacity(9 + payload.len());
            out.extend_from_slice(b"$X");
            out.push(direction.wire_byte());
            out.push(0); // flag, reserved
            out.extend_from_slice(&code.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(payload);
            let crc = out[3..].iter().fold(0, |c, &b| crc8_dvb_s2_step(c, b));
            out.push(crc);
            Ok(out)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    HeaderM,
    Direction,
    V1Len,
    V1Code,
    V1Payload,
    V1Checksum,
    V2Flag,
    V2CodeLo,
    V2CodeHi,
    V2LenLo,
    V2LenHi,
    V2Payload,
    V2Checksum,
}

/// Incremental frame decoder. Feed arbitrary chunks; completed frames queue
/// up and are drained with [`FrameDecoder::next_frame`].
pub struct FrameDecoder {
    state: State,
    version: MspVersion,
    direction: FrameDirection,
    code: u16,
    size: usize,
    checksum: u8,
    payload: BytesMut,
    frames: VecDeque<Frame>,
    crc_mismatches: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            version: MspVersion::V1,
            direction: FrameDirection::ToFc,
            code: 0,
            size: 0,
            checksum: 0,
            payload: BytesMut::with_capacity(4096),
            frames: VecDeque::new(),
            crc_mismatches: 0,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        for &b in data {
            self.process(b);
        }
    }

    /// Pop the oldest completed frame, if any.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Number of checksum failures since the last call; the counter resets.
    pub fn take_crc_mismatches(&mut self) -> u32 {
        std::mem::take(&mut self.crc_mismatches)
    }

    fn reset(&mut self) {
        self.state = State::Idle;
        self.code = 0;
        self.size = 0;
        self.checksum = 0;
        self.payload.clear();
    }

    fn complete(&mut self) {
        let frame = Frame {
            version: self.version,
            direction: self.direction,
            code: self.code,
            payload: self.payload.split().freeze(),
        };
        self.frames.push_back(frame);
        self.reset();
    }

    fn process(&mut self, b: u8) {
        match self.state {
            State::Idle => {
                if b == b'$' {
                    self.state = State::HeaderM;
                }
            }
            State::HeaderM => match b {
                b'M' => {
                    self.version = MspVersion::V1;
                    self.state = State::Direction;
                }
                b'X' => {
                    self.version = MspVersion::V2;
                    self.state = State::Direction;
                }
                _ => self.reset(),
            },
            State::Direction => match FrameDirection::from_wire(b) {
                Some(dir) => {
                    self.direction = dir;
                    self.state = match self.version {
                        MspVersion::V1 => State::V1Len,
                        MspVersion::V2 => State::V2Flag,
                    };
                }
                None => self.reset(),
            },

            State::V1Len => {
                self.size = b as usize;
                self.checksum = b; // XOR seed is the length byte
                self.state = State::V1Code;
            }
            State::V1Code => {
                self.code = b as u16;
                self.checksum ^= b;
                self.payload.clear();
                self.state = if self.size == 0 {
                    State::V1Checksum
                } else {
                    State::V1Payload
                };
            }
            State::V1Payload => {
                self.payload.extend_from_slice(&[b]);
                self.checksum ^= b;
                if self.payload.len() == self.size {
                    self.state = State::V1Checksum;
                }
            }
            State::V1Checksum => {
                if b == self.checksum {
                    self.complete();
                } else {
                    self.crc_mismatches += 1;
                    self.reset();
                }
            }

            State::V2Flag => {
                // flag byte participates in the CRC but is otherwise ignored
                self.checksum = crc8_dvb_s2_step(0, b);
                self.state = State::V2CodeLo;
            }
            State::V2CodeLo => {
                self.code = b as u16;
                self.checksum = crc8_dvb_s2_step(self.checksum, b);
                self.state = State::V2CodeHi;
            }
            State::V2CodeHi => {
                self.code |= (b as u16) << 8;
                self.checksum = crc8_dvb_s2_step(self.checksum, b);
                self.state = State::V2LenLo;
            }
            State::V2LenLo => {
                self.size = b as usize;
                self.checksum = crc8_dvb_s2_step(self.checksum, b);
                self.state = State::V2LenHi;
            }
            State::V2LenHi => {
                self.size |= (b as usize) << 8;
                self.checksum = crc8_dvb_s2_step(self.checksum, b);
                self.payload.clear();
                self.state = if self.size == 0 {
                    State::V2Checksum
                } else {
                    State::V2Payload
                };
            }
            State::V2Payload => {
                self.payload.extend_from_slice(&[b]);
                self.checksum = crc8_dvb_s2_step(self.checksum, b);
                if self.payload.len() == self.size {
                    self.state = State::V2Checksum;
                }
            }
            State::V2Checksum => {
                if b == self.checksum {
                    self.complete();
                } else {
                    self.crc_mismatches += 1;
                    self.reset();
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> Vec<Frame> {
        let mut dec = FrameDecoder::new();
        dec.feed(data);
        let mut out = Vec::new();
        while let Some(f) = dec.next_frame() {
            out.push(f);
        }
        out
    }

    #[test]
    fn v1_round_trip() {
        let wire = encode(MspVersion::V1, FrameDirection::FromFc, 70, &[1, 2, 3]).unwrap();
        let frames = decode_all(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].version, MspVersion::V1);
        assert_eq!(frames[0].direction, FrameDirection::FromFc);
        assert_eq!(frames[0].code, 70);
        assert_eq!(&frames[0].payload[..], &[1, 2, 3]);
    }

    #[test]
    fn v2_round_trip_large_payload() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let wire = encode(MspVersion::V2, FrameDirection::FromFc, 0x1234, &payload).unwrap();
        let frames = decode_all(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].version, MspVersion::V2);
        assert_eq!(frames[0].code, 0x1234);
        assert_eq!(&frames[0].payload[..], &payload[..]);
    }

    #[test]
    fn empty_payload_frames() {
        for version in [MspVersion::V1, MspVersion::V2] {
            let wire = encode(version, FrameDirection::ToFc, 72, &[]).unwrap();
            let frames = decode_all(&wire);
            assert_eq!(frames.len(), 1);
            assert!(frames[0].payload.is_empty());
        }
    }

    #[test]
    fn single_bit_flip_discards_frame() {
        let wire = encode(MspVersion::V2, FrameDirection::FromFc, 71, &[9, 8, 7, 6]).unwrap();
        for bit in 0..wire.len() * 8 {
            let mut corrupted = wire.clone();
            corrupted[bit / 8] ^= 1 << (bit % 8);
            let mut dec = FrameDecoder::new();
            dec.feed(&corrupted);
            // A flipped bit may destroy framing entirely or fail the CRC;
            // it must never deliver a frame with altered content.
            if let Some(f) = dec.next_frame() {
                assert_eq!(&f.payload[..], &[9, 8, 7, 6], "bit {bit} mis-delivered");
                assert_eq!(f.code, 71);
            }
        }
    }

    #[test]
    fn interleaved_versions_with_junk() {
        let a = encode(MspVersion::V1, FrameDirection::FromFc, 1, &[0, 1, 45]).unwrap();
        let b = encode(MspVersion::V2, FrameDirection::FromFc, 300, &[0xAA; 40]).unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(b"\x00\xFFnoise$M junk");
        wire.extend_from_slice(&a);
        wire.extend_from_slice(b"$X?");
        wire.extend_from_slice(&b);
        wire.extend_from_slice(&[0x24]); // trailing lone '$'
        let frames = decode_all(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].code, 1);
        assert_eq!(frames[1].code, 300);
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let a = encode(MspVersion::V1, FrameDirection::FromFc, 160, &[7; 12]).unwrap();
        let b = encode(MspVersion::V2, FrameDirection::ErrorFromFc, 71, &[]).unwrap();
        let mut dec = FrameDecoder::new();
        for &byte in a.iter().chain(b.iter()) {
            dec.feed(&[byte]);
        }
        let first = dec.next_frame().unwrap();
        let second = dec.next_frame().unwrap();
        assert_eq!(first.code, 160);
        assert_eq!(second.direction, FrameDirection::ErrorFromFc);
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn crc_mismatch_counter_resyncs() {
        let good = encode(MspVersion::V1, FrameDirection::FromFc, 2, b"BTFL").unwrap();
        let mut bad = good.clone();
        *bad.last_mut().unwrap() ^= 0xFF;
        let mut dec = FrameDecoder::new();
        dec.feed(&bad);
        dec.feed(&good);
        assert_eq!(dec.take_crc_mismatches(), 1);
        assert_eq!(dec.take_crc_mismatches(), 0);
        let f = dec.next_frame().unwrap();
        assert_eq!(&f.payload[..], b"BTFL");
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn v1_rejects_wide_code() {
        assert!(encode(MspVersion::V1, FrameDirection::ToFc, 0x100, &[]).is_err());
    }
}
