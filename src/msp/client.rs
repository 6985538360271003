//! Request/response MSP client.
//!
//! MSP has no sequence numbers: a response is matched to its request by
//! `(direction, code)`, so only one plain request per opcode may be in
//! flight. The exception is `DATAFLASH_READ`, whose response echoes the
//! flash offset — that lets us keep a window of overlapping reads on the
//! wire and re-associate replies by offset, hiding the FC's flash latency.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};
use tokio::time::{timeout, Instant};

use super::frame::{encode, Frame, FrameDirection, MspVersion};
use super::transport::{ReaderEvent, Transport};
use super::{huffman, op, MspError, CRC_MISMATCH_QUOTA};

/// Serial-level MSP client. Owns the transport for the session.
pub struct MspClient {
    transport: Transport,
    /// Frames that arrived for opcodes nobody was waiting on yet.
    pending: HashMap<u16, Frame>,
    request_timeout: Duration,
    crc_streak: u32,
}

impl MspClient {
    pub fn new(transport: Transport, request_timeout: Duration) -> Self {
        Self {
            transport,
            pending: HashMap::new(),
            request_timeout,
            crc_streak: 0,
        }
    }

    /// Fire a request without waiting for the reply (`DATAFLASH_ERASE` is
    /// ack'd by some firmware versions but completion is only observable
    /// by polling the summary, so the ack is not awaited).
    pub async fn send(&mut self, code: u16, payload: &[u8]) -> Result<(), MspError> {
        let wire = encode(MspVersion::V1, FrameDirection::ToFc, code, payload)?;
        trace!("tx code={code} payload_len={}", payload.len());
        self.transport.send_frame(&wire).await
    }

    /// Send a request and wait for the matching response payload.
    pub async fn request(&mut self, code: u16, payload: &[u8]) -> Result<Bytes, MspError> {
        // Discard any stale reply left over from a previous exchange.
        self.pending.remove(&code);
        self.send(code, payload).await?;
        let deadline = Instant::now() + self.request_timeout;
        self.crc_streak = 0;
        self.await_response(code, deadline).await
    }

    /// Start a pipelined flash read. The stream borrows the client
    /// exclusively; chunks come back strictly in offset order.
    pub fn flash_stream(&mut self, plan: FlashReadPlan) -> FlashStream<'_> {
        FlashStream {
            client: self,
            plan,
            next_request: 0,
            expect: 0,
            in_flight: BTreeMap::new(),
            window: BTreeMap::new(),
            finished: false,
        }
    }

    async fn await_response(&mut self, code: u16, deadline: Instant) -> Result<Bytes, MspError> {
        loop {
            if let Some(frame) = self.pending.remove(&code) {
                return classify(frame);
            }
            let event = self.next_event(code, deadline).await?;
            match event {
                ReaderEvent::Frame(frame) => {
                    self.crc_streak = 0;
                    if frame.code == code && frame.direction != FrameDirection::ToFc {
                        return classify(frame);
                    }
                    self.stash(frame);
                }
                ReaderEvent::CrcMismatch(n) => self.bump_crc_streak(n)?,
                ReaderEvent::Disconnected(reason) => {
                    return Err(MspError::PortClosed(reason));
                }
            }
        }
    }

    async fn next_event(&mut self, code: u16, deadline: Instant) -> Result<ReaderEvent, MspError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(MspError::Timeout {
                code,
                timeout_ms: self.request_timeout.as_millis() as u64,
            });
        }
        match timeout(remaining, self.transport.recv_event()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(MspError::PortClosed("reader task exited".into())),
            Err(_) => Err(MspError::Timeout {
                code,
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }

    fn stash(&mut self, frame: Frame) {
        if frame.direction == FrameDirection::ToFc {
            return; // our own echo, or another host on the bus
        }
        trace!("stashing unsolicited frame for opcode {}", frame.code);
        self.pending.insert(frame.code, frame);
    }

    fn bump_crc_streak(&mut self, n: u32) -> Result<(), MspError> {
        self.crc_streak += n;
        if self.crc_streak >= CRC_MISMATCH_QUOTA {
            return Err(MspError::CrcQuota);
        }
        Ok(())
    }
}

fn classify(frame: Frame) -> Result<Bytes, MspError> {
    match frame.direction {
        FrameDirection::FromFc => Ok(frame.payload),
        FrameDirection::ErrorFromFc => Err(MspError::ErrorResponse { code: frame.code }),
        FrameDirection::ToFc => unreachable!("request frames are filtered before classify"),
    }
}

/// Parameters for one pipelined read pass over `[0, used_size)`.
#[derive(Debug, Clone)]
pub struct FlashReadPlan {
    pub used_size: u32,
    /// Bytes requested per read; the FC may return fewer.
    pub chunk_size: u16,
    /// Window depth: how many reads are on the wire at once (>= 1).
    pub depth: usize,
    /// Ask the FC to Huffman-compress each chunk.
    pub compressed: bool,
    /// How long to wait for each in-order chunk to become available.
    pub chunk_timeout: Duration,
}

/// In-order consumer over a window of overlapping `DATAFLASH_READ`s.
pub struct FlashStream<'a> {
    client: &'a mut MspClient,
    plan: FlashReadPlan,
    /// Next offset to put on the wire.
    next_request: u32,
    /// Next offset the caller will receive.
    expect: u32,
    /// offset → requested length, for every read on the wire.
    in_flight: BTreeMap<u32, u16>,
    /// Decoded chunks that arrived ahead of `expect`, with the length
    /// their request asked for.
    window: BTreeMap<u32, (u16, Bytes)>,
    finished: bool,
}

impl FlashStream<'_> {
    /// The next chunk in strict offset order, `None` at end of stream.
    ///
    /// A timeout or protocol failure poisons the window: outstanding
    /// traffic is drained off the wire and the error returned; the stream
    /// yields nothing further.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, MspError> {
        if self.finished || self.expect >= self.plan.used_size {
            self.finished = true;
            return Ok(None);
        }
        match self.advance().await {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                self.finished = true;
                self.drain().await;
                Err(e)
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<Bytes>, MspError> {
        self.fill_window().await?;
        let deadline = Instant::now() + self.plan.chunk_timeout;
        loop {
            if let Some((requested, data)) = self.window.remove(&self.expect) {
                if data.is_empty() {
                    // The FC signals end-of-data with an empty chunk; the
                    // orchestrator's size check decides what that means.
                    debug!("zero-length chunk at {:#010x}, ending stream", self.expect);
                    self.finished = true;
                    return Ok(None);
                }
                self.expect += data.len() as u32;
                if (data.len() as u32) < u32::from(requested) && self.expect < self.plan.used_size
                {
                    // Short chunk: every prefetched offset beyond this
                    // point is now misaligned. Restart the window from
                    // the new position.
                    debug!(
                        "short chunk ({} of {requested} bytes), realigning window at {:#010x}",
                        data.len(),
                        self.expect
                    );
                    self.drain().await;
                    self.next_request = self.expect;
                } else {
                    self.fill_window().await?;
                }
                return Ok(Some(data));
            }

            let event = self
                .client
                .next_event(op::DATAFLASH_READ, deadline)
                .await?;
            match event {
                ReaderEvent::Frame(frame) => {
                    self.client.crc_streak = 0;
                    self.accept(frame)?;
                }
                ReaderEvent::CrcMismatch(n) => self.client.bump_crc_streak(n)?,
                ReaderEvent::Disconnected(reason) => {
                    return Err(MspError::PortClosed(reason));
                }
            }
        }
    }

    /// Top the window up to `depth` outstanding requests.
    async fn fill_window(&mut self) -> Result<(), MspError> {
        while self.in_flight.len() < self.plan.depth.max(1)
            && self.next_request < self.plan.used_size
        {
            let remaining = self.plan.used_size - self.next_request;
            let len = u32::from(self.plan.chunk_size).min(remaining) as u16;
            let mut payload = Vec::with_capacity(7);
            payload.extend_from_slice(&self.next_request.to_le_bytes());
            payload.extend_from_slice(&len.to_le_bytes());
            payload.push(u8::from(self.plan.compressed));
            self.client.send(op::DATAFLASH_READ, &payload).await?;
            self.in_flight.insert(self.next_request, len);
            self.next_request += u32::from(len);
        }
        Ok(())
    }

    /// Classify one frame while a read window is open.
    fn accept(&mut self, frame: Frame) -> Result<(), MspError> {
        if frame.code != op::DATAFLASH_READ {
            self.client.stash(frame);
            return Ok(());
        }
        match frame.direction {
            FrameDirection::ToFc => Ok(()),
            FrameDirection::ErrorFromFc => Err(MspError::ErrorResponse { code: frame.code }),
            FrameDirection::FromFc => {
                let (offset, data) = self.parse_read_response(&frame)?;
                let Some(requested) = self.in_flight.remove(&offset) else {
                    // Late reply from a drained window; flash content is
                    // immutable during the sync, so dropping it is safe.
                    debug!("ignoring stale read response at {offset:#010x}");
                    return Ok(());
                };
                self.window.insert(offset, (requested, data));
                Ok(())
            }
        }
    }

    /// `offset:u32 LE`, then for compressed reads a `u16 LE` decoded
    /// character count and the Huffman stream, otherwise the raw bytes.
    fn parse_read_response(&self, frame: &Frame) -> Result<(u32, Bytes), MspError> {
        let p = &frame.payload;
        if p.len() < 4 {
            return Err(MspError::ShortPayload {
                code: frame.code,
                len: p.len(),
            });
        }
        let offset = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
        if !self.plan.compressed {
            return Ok((offset, frame.payload.slice(4..)));
        }
        if p.len() < 6 {
            return Err(MspError::ShortPayload {
                code: frame.code,
                len: p.len(),
            });
        }
        let char_count = u16::from_le_bytes([p[4], p[5]]) as usize;
        let decoded = huffman::decode(&p[6..], char_count)?;
        if decoded.len() != char_count {
            return Err(MspError::Stream(format!(
                "compressed chunk at {offset:#010x} decoded to {} of {char_count} bytes",
                decoded.len()
            )));
        }
        Ok((offset, Bytes::from(decoded)))
    }

    /// Soak up whatever the FC is still sending so the next exchange on
    /// the port starts from a quiet line.
    async fn drain(&mut self) {
        self.in_flight.clear();
        self.window.clear();
        let quiet = Instant::now() + Duration::from_millis(300);
        loop {
            let remaining = quiet.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match timeout(Duration::from_millis(120), self.client.transport.recv_event()).await {
                Ok(Some(ReaderEvent::Frame(f))) if f.code == op::DATAFLASH_READ => continue,
                Ok(Some(ReaderEvent::Frame(f))) => self.client.stash(f),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return,
            }
        }
    }
}
