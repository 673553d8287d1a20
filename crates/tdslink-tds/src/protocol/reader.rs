//! Byte cursor for decoding TDS payloads.
//!
//! TDS mixes byte orders: packet headers and prelogin directory entries are
//! big-endian, most token fields are little-endian.

/// A reader over a borrowed TDS payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    /// Read a u16 (big-endian).
    pub fn read_u16_be(&mut self) -> Option<u16> {
        let bytes = self.read_array::<2>()?;
        Some(u16::from_be_bytes(bytes))
    }

    /// Read a u16 (little-endian).
    pub fn read_u16_le(&mut self) -> Option<u16> {
        let bytes = self.read_array::<2>()?;
        Some(u16::from_le_bytes(bytes))
    }

    /// Read a u32 (big-endian).
    pub fn read_u32_be(&mut self) -> Option<u32> {
        let bytes = self.read_array::<4>()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Read a u32 (little-endian).
    pub fn read_u32_le(&mut self) -> Option<u32> {
        let bytes = self.read_array::<4>()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Read a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Some(out)
    }

    /// Read exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }
}
