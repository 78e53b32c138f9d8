//! Per-connection stream framing: byte stream in, whole packets out.

use std::io::{self, Read, Write};

use crate::packet::{Packet, HEADER_LEN};

const MIN_RX_BUF_SIZE: usize = 64 * 1024;

/// The header's size field exceeds the configured bound. Points to a bad
/// or malicious peer; the connection stops reading.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("frame of {size} bytes exceeds the {limit} byte limit")]
pub struct OversizedFrame {
    pub size: usize,
    pub limit: usize,
}

/// Wraps the read and write halves of a peer connection. The read side
/// buffers raw bytes and slices out complete header+payload frames; the
/// write side holds at most one outgoing frame at a time, so a frame that
/// started flushing is never interleaved with another.
#[derive(Debug)]
pub struct PacketStream<S> {
    stream: S,
    rx_buf: Vec<u8>,
    tx_buf: Vec<u8>,
    max_payload: usize,
}

impl<S: Read + Write> PacketStream<S> {
    pub fn new(stream: S, max_payload: usize) -> Self {
        Self {
            stream,
            rx_buf: Vec::with_capacity(MIN_RX_BUF_SIZE),
            tx_buf: Vec::new(),
            max_payload,
        }
    }

    /// Performs one read into `scratch` and appends whatever arrived to the
    /// reassembly buffer. Returns the number of bytes read; 0 is end of
    /// stream, `WouldBlock` surfaces as the error it is.
    pub fn read_into(&mut self, scratch: &mut [u8]) -> io::Result<usize> {
        let read = self.stream.read(scratch)?;
        self.rx_buf.extend_from_slice(&scratch[..read]);
        Ok(read)
    }

    /// Detaches the next complete frame (header included) from the front of
    /// the reassembly buffer, if one is fully buffered.
    pub fn take_frame(&mut self) -> Result<Option<Vec<u8>>, OversizedFrame> {
        if self.rx_buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let payload_len =
            Packet::peek_payload_len(&self.rx_buf).expect("header is buffered");
        if payload_len > self.max_payload {
            return Err(OversizedFrame {
                size: payload_len,
                limit: self.max_payload,
            });
        }

        let frame_len = HEADER_LEN + payload_len;
        if self.rx_buf.len() < frame_len {
            return Ok(None);
        }

        Ok(Some(self.rx_buf.drain(..frame_len).collect()))
    }

    /// Loads the next outgoing frame. Only valid at a frame boundary.
    pub fn begin_frame(&mut self, packet: &Packet) {
        debug_assert!(self.tx_buf.is_empty(), "frame started mid-frame");
        packet.write(&mut self.tx_buf);
    }

    /// Whether a partially-sent frame is outstanding.
    pub fn has_partial_frame(&self) -> bool {
        !self.tx_buf.is_empty()
    }

    /// Hands at most `max` bytes of the current frame to the stream and
    /// drops whatever the kernel accepted. Returns the bytes accepted.
    pub fn write_budget(&mut self, max: usize) -> io::Result<usize> {
        let end = self.tx_buf.len().min(max);
        let written = self.stream.write(&self.tx_buf[..end])?;
        self.tx_buf.drain(..written);
        self.stream.flush()?;
        Ok(written)
    }

    /// Drops all buffered receive bytes. Used when the read half closes.
    pub fn discard_rx(&mut self) {
        self.rx_buf.clear();
        self.rx_buf.shrink_to(MIN_RX_BUF_SIZE);
    }

    /// Drops the outstanding frame. Used when the write half closes.
    pub fn discard_tx(&mut self) {
        self.tx_buf.clear();
    }

    /// Truncates buffer capacity back to a sane floor. Large payloads would
    /// otherwise pin their high-water capacity for the connection's life.
    pub fn shrink_buffers(&mut self) {
        self.rx_buf.shrink_to(MIN_RX_BUF_SIZE.max(self.rx_buf.len()));
        self.tx_buf.shrink_to(self.tx_buf.len());
    }

    pub fn inner(&self) -> &S {
        &self.stream
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}
