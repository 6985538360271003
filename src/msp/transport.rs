//! Serial transport: owns the port, runs the read loop, and delivers
//! decoded frames to the client through a channel.
//!
//! The read side lives on a blocking task (serial reads are blocking with
//! a short timeout) and feeds the byte-level [`FrameDecoder`]; completed
//! frames and checksum-mismatch notices flow to the async side over an
//! unbounded channel. The write side stays with the caller and writes
//! whole frames, retrying transient failures a few times before giving up.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::mpsc;

use super::frame::{Frame, FrameDecoder};
use super::MspError;

/// MSP runs at a fixed rate on the USB CDC link.
pub const BAUD_RATE: u32 = 115_200;

/// How long a single blocking read waits before coming back empty.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 4096;

/// Whole-frame write retry policy for transient failures.
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// What the reader task produces.
#[derive(Debug)]
pub enum ReaderEvent {
    /// A checksum-validated frame, in serial-port order.
    Frame(Frame),
    /// `n` frames were dropped for bad checksums since the last event.
    CrcMismatch(u32),
    /// The port went away; no further events will arrive.
    Disconnected(String),
}

/// Owns both halves of the serial link. Nothing else touches the port.
pub struct Transport {
    writer: Box<dyn Write + Send>,
    events: mpsc::UnboundedReceiver<ReaderEvent>,
}

impl Transport {
    /// Open a serial port at 8N1 and start the reader task.
    pub fn open_serial(port_name: &str, baud: u32) -> Result<Self, serialport::Error> {
        let builder = serialport::new(port_name, baud)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
        let port = builder.open()?;
        let reader = port.try_clone()?;
        debug!("opened serial port {port_name} at {baud} baud");
        Ok(Self::from_io(Box::new(reader), Box::new(port)))
    }

    /// Build a transport over arbitrary I/O halves. The read half should
    /// behave like a serial port: block briefly, then fail with
    /// `TimedOut`/`WouldBlock` when no data is pending.
    pub fn from_io(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || read_loop(reader, tx));
        Self { writer, events: rx }
    }

    /// Write one framed request in full. Transient failures are retried
    /// with a short backoff; anything else aborts the request.
    pub async fn send_frame(&mut self, wire: &[u8]) -> Result<(), MspError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let res = self
                .writer
                .write_all(wire)
                .and_then(|()| self.writer.flush());
            match res {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WRITE_ATTEMPTS && is_transient(&e) => {
                    warn!("serial write failed (attempt {attempt}): {e}");
                    tokio::time::sleep(WRITE_BACKOFF).await;
                }
                Err(e) => return Err(MspError::Io(e)),
            }
        }
    }

    /// Next reader event, or `None` once the reader task has exited and
    /// the channel drained.
    pub async fn recv_event(&mut self) -> Option<ReaderEvent> {
        self.events.recv().await
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<ReaderEvent>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        if tx.is_closed() {
            trace!("reader task: client gone, stopping");
            return;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = tx.send(ReaderEvent::Disconnected("port closed".into()));
                return;
            }
            Ok(n) => {
                decoder.feed(&buf[..n]);
                let mismatches = decoder.take_crc_mismatches();
                if mismatches > 0 {
                    debug!("dropped {mismatches} frame(s) with bad checksum");
                    if tx.send(ReaderEvent::CrcMismatch(mismatches)).is_err() {
                        return;
                    }
                }
                while let Some(frame) = decoder.next_frame() {
                    trace!(
                        "rx frame code={} dir={:?} len={}",
                        frame.code,
                        frame.direction,
                        frame.payload.len()
                    );
                    if tx.send(ReaderEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
            }
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                let _ = tx.send(ReaderEvent::Disconnected(e.to_string()));
                return;
            }
        }
    }
}
