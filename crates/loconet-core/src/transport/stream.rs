//! Byte-stream transport: frames out to any writer, frames in from any reader.
//!
//! LocoNet has no start-of-frame marker other than the opcode's high bit, so
//! the assembler resynchronizes on every opcode byte and drops data bytes
//! that arrive outside a frame.

use std::io::{Read, Write};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, trace};

use super::traits::{LocoNetTransport, TransportError};
use crate::protocol::{LnMessage, checksum, frame_length};

/// Writes frames to an `io::Write` (serial device, socket, file).
pub struct StreamTransport<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> StreamTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> LocoNetTransport for StreamTransport<W> {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(frame)?;
        writer.flush()?;
        trace!(len = frame.len(), "Frame written");
        Ok(())
    }
}

/// Incremental frame assembler.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns a frame (or a framing error) when one completes.
    pub fn push(&mut self, byte: u8) -> Option<Result<LnMessage, TransportError>> {
        if byte & 0x80 != 0 {
            if !self.buf.is_empty() {
                debug!(
                    dropped = self.buf.len(),
                    opcode = %format!("{:02X}", self.buf[0]),
                    "Incomplete frame, resyncing"
                );
            }
            self.buf.clear();
        } else if self.buf.is_empty() {
            trace!(byte = %format!("{byte:02X}"), "Stray data byte");
            return None;
        }
        self.buf.push(byte);

        let expected = frame_length(self.buf[0], self.buf.get(1).copied())?;
        if expected < 2 {
            let opcode = self.buf[0];
            self.buf.clear();
            return Some(Err(TransportError::Malformed(format!(
                "{opcode:02X} frame declares length {expected}"
            ))));
        }
        if self.buf.len() < expected {
            return None;
        }

        let frame = std::mem::take(&mut self.buf);
        let (&actual, body) = frame.split_last()?;
        let expected_chk = checksum(body);
        if actual != expected_chk {
            return Some(Err(TransportError::Checksum {
                opcode: frame[0],
                expected: expected_chk,
                actual,
            }));
        }
        Some(LnMessage::from_bytes(&frame).map_err(|e| TransportError::Malformed(e.to_string())))
    }
}

/// Iterator of frames read from an `io::Read`.
///
/// Reads byte by byte; wrap slow readers in a `BufReader`.
pub struct FrameReader<R: Read> {
    reader: R,
    assembler: FrameAssembler,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            assembler: FrameAssembler::new(),
        }
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<LnMessage, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return None,
                Ok(_) => {
                    if let Some(result) = self.assembler.push(byte[0]) {
                        return Some(result);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
