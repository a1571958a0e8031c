//! RSP packet framing: `$<payload>#<checksum>` with `+`/`-` acks.

use crate::error::Error;
use log::debug;
use std::io::{Read, Write};

/// Frames packets over a byte stream. Split reader/writer halves so the
/// server can hand in a buffered clone of the socket, and tests can drive
/// the codec with plain buffers.
pub struct PacketCodec<R, W> {
    reader: R,
    writer: W,
    /// Acks are exchanged until NoAck mode is negotiated.
    ack_mode: bool,
}

pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

impl<R: Read, W: Write> PacketCodec<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        PacketCodec {
            reader,
            writer,
            ack_mode: true,
        }
    }

    pub fn set_ack_mode(&mut self, ack_mode: bool) {
        self.ack_mode = ack_mode;
    }

    /// Receive one packet. `Ok(Some(payload))` for a valid packet (already
    /// acked when acks are on); `Ok(None)` after a checksum mismatch (a `-`
    /// has been sent, the client will retransmit); `Error::ConnectionClosed`
    /// at end of stream.
    pub fn recv(&mut self) -> Result<Option<Vec<u8>>, Error> {
        // Skip to the packet start, dropping acks and line noise.
        loop {
            if self.read_byte()? == b'$' {
                break;
            }
        }

        let mut payload = Vec::new();
        let mut sum = 0u8;
        loop {
            let b = self.read_byte()?;
            if b == b'#' {
                break;
            }
            sum = sum.wrapping_add(b);
            payload.push(b);
        }

        let sent = [self.read_byte()?, self.read_byte()?];
        let sent = std::str::from_utf8(&sent)
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok());

        if self.ack_mode {
            if sent != Some(sum) {
                debug!(target: "rsp", "checksum mismatch, sending -");
                self.writer.write_all(b"-")?;
                self.writer.flush()?;
                return Ok(None);
            }
            self.writer.write_all(b"+")?;
            self.writer.flush()?;
        }

        debug!(target: "rsp", "<- {}", String::from_utf8_lossy(&payload));
        Ok(Some(payload))
    }

    /// Frame and send one reply, flushing so the debugger never waits on a
    /// buffered packet.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        debug!(target: "rsp", "-> {}", String::from_utf8_lossy(payload));
        self.writer.write_all(b"$")?;
        self.writer.write_all(payload)?;
        write!(self.writer, "#{:02x}", checksum(payload))?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        match self.reader.read_exact(&mut byte) {
            Ok(()) => Ok(byte[0]),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::ConnectionClosed)
            }
            Err(e) => Err(e.into()),
        }
    }
}
