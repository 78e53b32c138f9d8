//! The 6-byte packet header and its framing rules.
//!
//! On the wire every packet is `protocol: u8`, `size: u32` little-endian
//! (payload length, header excluded), `opcode: u8`, then the payload.

/// Original eDonkey2000 protocol family.
pub const PROTO_EDONKEY: u8 = 0xE3;
/// Extended eMule protocol family.
pub const PROTO_EMULE_EXT: u8 = 0xC5;
/// Packed extended protocol. Recognized, never handled.
pub const PROTO_PACKED: u8 = 0xD4;
/// Kademlia protocol. Recognized, never handled.
pub const PROTO_KADEMLIA: u8 = 0xE4;
/// Packed Kademlia protocol. Recognized, never handled.
pub const PROTO_KADEMLIA_PACKED: u8 = 0xE5;

/// Size of the fixed packet header.
pub const HEADER_LEN: usize = 6;

/// Default inbound TCP listener port.
pub const DEFAULT_TCP_PORT: u16 = 4662;
/// Conventional UDP port. Reserved; no UDP subsystem lives in this crate.
pub const DEFAULT_UDP_PORT: u16 = 4666;

/// One protocol packet: a (protocol, opcode) pair and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub protocol: u8,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(protocol: u8, opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            protocol,
            opcode,
            payload,
        }
    }

    /// Serialized size including the header.
    pub fn wire_size(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Appends header and payload to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.reserve(self.wire_size());
        out.push(self.protocol);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.push(self.opcode);
        out.extend_from_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_size());
        self.write(&mut out);
        out
    }

    /// Reads the header's payload length, if at least a header is buffered.
    pub fn peek_payload_len(buf: &[u8]) -> Option<usize> {
        let size = buf.get(1..5)?;
        Some(u32::from_le_bytes(size.try_into().expect("4 bytes")) as usize)
    }

    /// Rebuilds a packet from one full frame (header + payload). The frame
    /// length must match the header's size field exactly.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        let payload_len = Self::peek_payload_len(frame)?;
        if frame.len() != HEADER_LEN + payload_len {
            return None;
        }
        Some(Self {
            protocol: frame[0],
            opcode: frame[5],
            payload: frame[HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_layout() {
        let packet = Packet::new(PROTO_EDONKEY, 0x34, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(
            packet.to_bytes(),
            [0xE3, 0x04, 0x00, 0x00, 0x00, 0x34, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn frame_roundtrip() {
        let packet = Packet::new(PROTO_EMULE_EXT, 0x92, vec![1, 2, 3]);
        let bytes = packet.to_bytes();
        assert_eq!(Packet::peek_payload_len(&bytes), Some(3));
        assert_eq!(Packet::from_frame(&bytes), Some(packet));
    }

    #[test]
    fn short_or_long_frames_rejected() {
        let bytes = Packet::new(PROTO_EDONKEY, 0x01, vec![7; 5]).to_bytes();
        assert_eq!(Packet::from_frame(&bytes[..bytes.len() - 1]), None);

        let mut padded = bytes;
        padded.push(0);
        assert_eq!(Packet::from_frame(&padded), None);
    }

    #[test]
    fn peek_needs_five_bytes() {
        assert_eq!(Packet::peek_payload_len(&[0xE3, 1, 0, 0]), None);
        assert_eq!(Packet::peek_payload_len(&[0xE3, 1, 0, 0, 0]), Some(1));
    }
}
