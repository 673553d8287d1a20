//! TDS wire protocol framing.
//!
//! Every TDS message travels in one or more packets with an 8-byte header:
//! - 1 byte: packet type
//! - 1 byte: status (bit 0 marks the last packet of a message)
//! - 2 bytes: total packet length including the header (big-endian)
//! - 2 bytes: server process id (big-endian)
//! - 1 byte: packet id (wraps at 255)
//! - 1 byte: window (unused, always 0)

pub mod prelogin;
pub mod reader;
pub mod writer;

pub use prelogin::{
    EncryptionOption, PreloginMessage, PreloginOption, PreloginVersion, TraceId,
    negotiate_encryption,
};
pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Default negotiated packet size before login changes it.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Smallest packet size a server accepts.
pub const MIN_PACKET_SIZE: usize = 512;

/// Largest packet size the protocol allows.
pub const MAX_PACKET_SIZE: usize = 32_767;

/// Packet status bits.
pub mod status {
    pub const NORMAL: u8 = 0x00;
    /// End of message: last packet of the request or response
    pub const EOM: u8 = 0x01;
}

/// Packet types used by the bootstrap sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Server response stream (0x04)
    TabularResult,
    /// Prelogin handshake (0x12)
    PreLogin,
    /// Any other type byte
    Unknown(u8),
}

impl PacketType {
    pub const fn from_byte(b: u8) -> Self {
        match b {
            0x04 => PacketType::TabularResult,
            0x12 => PacketType::PreLogin,
            other => PacketType::Unknown(other),
        }
    }

    pub const fn as_byte(self) -> u8 {
        match self {
            PacketType::TabularResult => 0x04,
            PacketType::PreLogin => 0x12,
            PacketType::Unknown(b) => b,
        }
    }
}

/// TDS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub status: u8,
    /// Total length including this header
    pub length: u16,
    pub spid: u16,
    pub packet_id: u8,
    pub window: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 8;

    /// Parse a packet header from 8 bytes.
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            packet_type: PacketType::from_byte(bytes[0]),
            status: bytes[1],
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
            spid: u16::from_be_bytes([bytes[4], bytes[5]]),
            packet_id: bytes[6],
            window: bytes[7],
        }
    }

    /// Encode the header to 8 bytes.
    pub fn to_bytes(&self) -> [u8; 8] {
        let len = self.length.to_be_bytes();
        let spid = self.spid.to_be_bytes();
        [
            self.packet_type.as_byte(),
            self.status,
            len[0],
            len[1],
            spid[0],
            spid[1],
            self.packet_id,
            self.window,
        ]
    }

    /// Payload bytes carried by this packet.
    pub fn payload_length(&self) -> usize {
        usize::from(self.length).saturating_sub(Self::SIZE)
    }

    /// Is this the last packet of its message?
    pub fn is_end_of_message(&self) -> bool {
        self.status & status::EOM != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_roundtrip() {
        let header = PacketHeader {
            packet_type: PacketType::PreLogin,
            status: status::EOM,
            length: 0x0056,
            spid: 0x0102,
            packet_id: 1,
            window: 0,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x12, 0x01, 0x00, 0x56, 0x01, 0x02, 0x01, 0x00]);
        let parsed = PacketHeader::from_bytes(&bytes);
        assert_eq!(parsed, header);
        assert_eq!(parsed.payload_length(), 0x56 - 8);
        assert!(parsed.is_end_of_message());
    }

    #[test]
    fn test_packet_type_unknown_passthrough() {
        assert_eq!(PacketType::from_byte(0x04), PacketType::TabularResult);
        assert_eq!(PacketType::from_byte(0x7F), PacketType::Unknown(0x7F));
        assert_eq!(PacketType::Unknown(0x7F).as_byte(), 0x7F);
    }

    #[test]
    fn test_short_length_has_no_payload() {
        let header = PacketHeader::from_bytes(&[0x04, 0x00, 0x00, 0x04, 0, 0, 0, 0]);
        assert_eq!(header.payload_length(), 0);
        assert!(!header.is_end_of_message());
    }
}
