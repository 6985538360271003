#![allow(dead_code)] // each test binary uses a different slice of this

//! In-process flight-controller simulator.
//!
//! Speaks MSP over an in-memory duplex that behaves like a serial port:
//! reads block briefly and fail with `TimedOut` when the line is quiet.
//! The simulator parses requests with the crate's own frame decoder and
//! answers with v2 frames (flash chunks do not fit in a v1 payload), so
//! the tests exercise the full codec both ways.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bbsyncer::config::Config;
use bbsyncer::msp::{
    encode, huffman, op, FrameDecoder, FrameDirection, MspClient, MspVersion, Transport,
};

pub const READY: u8 = 1 << 0;
pub const SUPPORTED: u8 = 1 << 1;
pub const COMPRESSED_SUPPORT: u8 = 1 << 2;

type EraseHook = Box<dyn FnMut() + Send>;

pub struct SimOptions {
    pub variant: [u8; 4],
    pub api: (u8, u8),
    pub uid: [u8; 12],
    pub flags: u8,
    pub total_size: u32,
    pub flash: Vec<u8>,
    pub blackbox_device: u8,
    /// `used_size` values reported by successive summary polls after the
    /// erase request arrives; the last value repeats.
    pub erase_countdown: Vec<u32>,
    /// Swallow the read request for this offset (simulates a wedged FC).
    pub drop_read_at: Option<u32>,
    /// Hold this many read responses and release them in reverse order,
    /// so replies arrive permuted within the pipeline window.
    pub reorder_window: usize,
    /// Serve reads compressed when asked to.
    pub compress_reads: bool,
    /// Runs when `DATAFLASH_ERASE` arrives, before the ack.
    pub on_erase: Option<EraseHook>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            variant: *b"BTFL",
            api: (1, 46),
            uid: *b"\xde\xad\xbe\xef\x00\x11\x22\x33\x44\x55\x66\x77",
            flags: READY | SUPPORTED,
            total_size: 16 << 20,
            flash: Vec::new(),
            blackbox_device: 1,
            erase_countdown: vec![0],
            drop_read_at: None,
            reorder_window: 0,
            compress_reads: false,
            on_erase: None,
        }
    }
}

struct SimState {
    opts: SimOptions,
    decoder: FrameDecoder,
    to_host: VecDeque<u8>,
    request_log: Vec<u16>,
    erase_received: bool,
    poll_idx: usize,
    held_reads: Vec<Vec<u8>>,
}

pub struct FcSim {
    shared: Arc<(Mutex<SimState>, Condvar)>,
}

impl FcSim {
    pub fn new(opts: SimOptions) -> Self {
        let state = SimState {
            opts,
            decoder: FrameDecoder::new(),
            to_host: VecDeque::new(),
            request_log: Vec::new(),
            erase_received: false,
            poll_idx: 0,
            held_reads: Vec::new(),
        };
        Self {
            shared: Arc::new((Mutex::new(state), Condvar::new())),
        }
    }

    pub fn split(&self) -> (SimReader, SimWriter) {
        (
            SimReader {
                shared: self.shared.clone(),
            },
            SimWriter {
                shared: self.shared.clone(),
            },
        )
    }

    /// Opcodes received so far, in arrival order.
    pub fn request_log(&self) -> Vec<u16> {
        self.shared.0.lock().unwrap().request_log.clone()
    }

    pub fn erase_received(&self) -> bool {
        self.shared.0.lock().unwrap().erase_received
    }
}

pub struct SimReader {
    shared: Arc<(Mutex<SimState>, Condvar)>,
}

impl Read for SimReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        if state.to_host.is_empty() {
            let (next, _timed_out) = cvar
                .wait_timeout(state, Duration::from_millis(20))
                .unwrap();
            state = next;
            if state.to_host.is_empty() {
                return Err(std::io::Error::new(ErrorKind::TimedOut, "line quiet"));
            }
        }
        let n = buf.len().min(state.to_host.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.to_host.pop_front().unwrap();
        }
        Ok(n)
    }
}

pub struct SimWriter {
    shared: Arc<(Mutex<SimState>, Condvar)>,
}

impl Write for SimWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        state.decoder.feed(buf);
        while let Some(frame) = state.decoder.next_frame() {
            if frame.direction == FrameDirection::ToFc {
                handle_request(&mut state, frame.code, &frame.payload);
            }
        }
        cvar.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn respond(state: &mut SimState, code: u16, payload: &[u8]) {
    let wire = encode(MspVersion::V2, FrameDirection::FromFc, code, payload)
        .expect("sim response encodes");
    state.to_host.extend(wire);
}

fn handle_request(state: &mut SimState, code: u16, payload: &[u8]) {
    state.request_log.push(code);
    match code {
        op::API_VERSION => {
            let (major, minor) = state.opts.api;
            respond(state, code, &[0, major, minor]);
        }
        op::FC_VARIANT => {
            let variant = state.opts.variant;
            respond(state, code, &variant);
        }
        op::UID => {
            let uid = state.opts.uid;
            respond(state, code, &uid);
        }
        op::BLACKBOX_CONFIG => {
            let device = state.opts.blackbox_device;
            respond(state, code, &[1, device, 1, 1]);
        }
        op::DATAFLASH_SUMMARY => {
            let used = if state.erase_received {
                let countdown = &state.opts.erase_countdown;
                let used = countdown
                    .get(state.poll_idx)
                    .or(countdown.last())
                    .copied()
                    .unwrap_or(0);
                state.poll_idx += 1;
                used
            } else {
                state.opts.flash.len() as u32
            };
            let mut p = vec![state.opts.flags];
            p.extend_from_slice(&128u32.to_le_bytes()); // sector count
            p.extend_from_slice(&state.opts.total_size.to_le_bytes());
            p.extend_from_slice(&used.to_le_bytes());
            respond(state, code, &p);
        }
        op::DATAFLASH_READ => handle_read(state, payload),
        op::DATAFLASH_ERASE => {
            state.erase_received = true;
            if let Some(hook) = state.opts.on_erase.as_mut() {
                hook();
            }
            respond(state, code, &[]);
        }
        other => panic!("simulator got unexpected opcode {other}"),
    }
}

fn handle_read(state: &mut SimState, payload: &[u8]) {
    assert!(payload.len() >= 7, "short DATAFLASH_READ request");
    let offset = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let len = u16::from_le_bytes([payload[4], payload[5]]) as usize;
    let want_compression = payload[6] != 0;

    if state.opts.drop_read_at == Some(offset) {
        return;
    }

    let flash_len = state.opts.flash.len();
    let start = (offset as usize).min(flash_len);
    let end = (start + len).min(flash_len);
    let data = state.opts.flash[start..end].to_vec();

    let mut p = Vec::with_capacity(6 + data.len());
    p.extend_from_slice(&offset.to_le_bytes());
    if want_compression {
        assert!(state.opts.compress_reads, "client asked for compression the sim did not advertise");
        p.extend_from_slice(&(data.len() as u16).to_le_bytes());
        p.extend_from_slice(&huffman::encode(&data));
    } else {
        p.extend_from_slice(&data);
    }
    let wire =
        encode(MspVersion::V2, FrameDirection::FromFc, op::DATAFLASH_READ, &p).expect("encodes");

    let last_chunk = end >= flash_len;
    if state.reorder() {
        state.held_reads.push(wire);
        if state.held_reads.len() >= state.opts.reorder_window || last_chunk {
            while let Some(held) = state.held_reads.pop() {
                state.to_host.extend(held);
            }
        }
    } else {
        state.to_host.extend(wire);
    }
}

impl SimState {
    fn reorder(&self) -> bool {
        self.opts.reorder_window > 1
    }
}

/// A config tuned for fast tests: storage under `root`, no headroom,
/// short timeouts, near-instant erase polling.
pub fn test_config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.storage.storage_path = root.to_path_buf();
    cfg.storage.min_free_space_mb = 0;
    cfg.sync.request_timeout_ms = 500;
    cfg.sync.chunk_timeout_ms = 500;
    cfg.sync.sync_timeout_ms = 30_000;
    cfg.sync.erase_poll_interval_ms = 10;
    cfg.sync.erase_timeout_ms = 2_000;
    cfg
}

pub fn client_for(sim: &FcSim, cfg: &Config) -> MspClient {
    let (reader, writer) = sim.split();
    MspClient::new(
        Transport::from_io(Box::new(reader), Box::new(writer)),
        cfg.request_timeout(),
    )
}

/// Pseudo-random but reproducible flash content.
pub fn deterministic_flash(len: usize) -> Vec<u8> {
    let mut state = 0x2545_F491u32;
    (0..len)
        .map(|_| {
            // xorshift32
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
