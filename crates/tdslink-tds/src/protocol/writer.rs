//! Byte buffer for encoding TDS payloads and packets.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{PacketHeader, PacketType, status};

/// A writer for TDS protocol data.
#[derive(Debug)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    /// Create a new writer with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Consume the writer and return the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Write a u16 (big-endian).
    pub fn write_u16_be(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a u16 (little-endian).
    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u32 (little-endian).
    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Build one packet around `payload`.
    ///
    /// `payload` must fit in a single packet (at most `u16::MAX - 8` bytes).
    pub fn build_packet(
        packet_type: PacketType,
        payload: &[u8],
        end_of_message: bool,
        packet_id: u8,
    ) -> Vec<u8> {
        let header = PacketHeader {
            packet_type,
            status: if end_of_message {
                status::EOM
            } else {
                status::NORMAL
            },
            length: (payload.len() + PacketHeader::SIZE) as u16,
            spid: 0,
            packet_id,
            window: 0,
        };
        let mut packet = Vec::with_capacity(PacketHeader::SIZE + payload.len());
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(payload);
        packet
    }
}
