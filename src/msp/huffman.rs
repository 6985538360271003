//! Fixed-table Huffman codec for compressed `DATAFLASH_READ` payloads.
//!
//! Both ends of the link compile in the same table: 257 canonical codes
//! (256 byte values plus an end-of-stream sentinel), code lengths 2–12
//! bits, codes right-aligned, bits read MSB-first. Decoding avoids a
//! per-bit linear scan by looking codes up in a flat table indexed by
//! `(code_len - 1) * 4096 + code`.

use std::sync::OnceLock;

use super::MspError;

const MAX_CODE_LEN: u16 = 12;
/// Sentinel value stored for the end-of-stream code.
const EOF_VALUE: u16 = 256;
/// Flat-lookup slot meaning "no code has this bit pattern at this length".
const NO_CODE: i16 = -1;

/// `(code_len, count)` bands of the canonical code, in length order.
/// Short codes go to the bytes that dominate blackbox logs (0x00 and
/// 0x01 delta markers, 0x50 frame headers); everything else follows
/// numerically, and the final 12-bit band ends with the end-of-stream
/// sentinel. Band sizes keep the Kraft sum under one so every code fits
/// its stated bit length.
const BANDS: [(u16, u16); 10] = [
    (2, 1),
    (4, 2),
    (5, 4),
    (6, 8),
    (7, 16),
    (8, 16),
    (9, 32),
    (10, 32),
    (11, 64),
    (12, 82),
];

#[derive(Debug, Clone, Copy)]
struct Code {
    len: u16,
    code: u16,
}

fn value_order() -> impl Iterator<Item = u16> {
    std::iter::once(0x00)
        .chain([0x01, 0x50])
        .chain(0x02..=0x05)
        .chain(0x06..=0x0D)
        .chain(0x0E..=0x2D)
        .chain(0x2E..=0x4D)
        .chain([0x4E, 0x4F])
        .chain(0x51..=0xFF)
        .chain(std::iter::once(EOF_VALUE))
}

/// Per-value code assignments, index 0..=255 for bytes, 256 for EOF.
fn codes() -> &'static [Code; 257] {
    static CODES: OnceLock<[Code; 257]> = OnceLock::new();
    CODES.get_or_init(|| {
        let mut out = [Code { len: 0, code: 0 }; 257];
        let mut values = value_order();
        let mut code: u16 = 0;
        let mut prev_len = BANDS[0].0;
        for (len, count) in BANDS {
            code <<= len - prev_len;
            prev_len = len;
            for _ in 0..count {
                let value = values.next().expect("band counts cover 257 values");
                out[value as usize] = Code { len, code };
                code += 1;
            }
        }
        out
    })
}

/// Flat decode table: `(code_len - 1) * 4096 + code` → value, or [`NO_CODE`].
fn lookup() -> &'static [i16] {
    static LOOKUP: OnceLock<Vec<i16>> = OnceLock::new();
    LOOKUP.get_or_init(|| {
        let mut table = vec![NO_CODE; MAX_CODE_LEN as usize * 4096];
        for (value, c) in codes().iter().enumerate() {
            table[(c.len as usize - 1) * 4096 + c.code as usize] = value as i16;
        }
        table
    })
}

/// Decode `input`, producing at most `char_count` bytes.
///
/// Stops at the end-of-stream code, after `char_count` output bytes, or
/// when the input runs out, whichever comes first. A 12-bit accumulation
/// that matches no code is a decode error.
pub fn decode(input: &[u8], char_count: usize) -> Result<Vec<u8>, MspError> {
    let table = lookup();
    let mut out = Vec::with_capacity(char_count);
    let mut code: u16 = 0;
    let mut code_len: u16 = 0;

    'bits: for &byte in input {
        let mut test_bit = 0x80u8;
        while test_bit != 0 {
            if out.len() >= char_count {
                break 'bits;
            }
            code = (code << 1) | u16::from(byte & test_bit != 0);
            code_len += 1;
            test_bit >>= 1;

            match table[(code_len as usize - 1) * 4096 + code as usize] {
                v if v == EOF_VALUE as i16 => break 'bits,
                NO_CODE => {
                    if code_len == MAX_CODE_LEN {
                        return Err(MspError::Huffman("bit pattern matches no code"));
                    }
                }
                value => {
                    out.push(value as u8);
                    code = 0;
                    code_len = 0;
                }
            }
        }
    }
    Ok(out)
}

/// Encode `data` with the shared table, terminated by the end-of-stream
/// code and zero-padded to a byte boundary. The counterpart the firmware
/// runs before transmitting compressed flash chunks; here it backs the
/// loopback tests and any tooling that needs to fabricate compressed
/// payloads.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let codes = codes();
    let mut out = Vec::with_capacity(data.len() / 2 + 2);
    let mut acc: u32 = 0;
    let mut acc_len: u16 = 0;

    let mut push = |c: Code, acc: &mut u32, acc_len: &mut u16, out: &mut Vec<u8>| {
        *acc = (*acc << c.len) | u32::from(c.code);
        *acc_len += c.len;
        while *acc_len >= 8 {
            *acc_len -= 8;
            out.push((*acc >> *acc_len) as u8);
        }
    };

    for &b in data {
        push(codes[b as usize], &mut acc, &mut acc_len, &mut out);
    }
    push(codes[EOF_VALUE as usize], &mut acc, &mut acc_len, &mut out);
    if acc_len > 0 {
        out.push((acc << (8 - acc_len)) as u8);
    }
    out
}
