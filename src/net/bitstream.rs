//! Bit-level writer/reader for datagram payloads
//!
//! Fields are written most-significant bit first with no alignment; the
//! finished buffer is zero-padded to a whole byte.

use bitvec::prelude::*;

use crate::net::protocol::DecodeError;

/// Bit writer for constructing datagrams
pub struct BitWriter {
    bits: BitVec<u8, Msb0>,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bits: BitVec::with_capacity(bytes * 8),
        }
    }

    #[inline]
    pub fn write_bit(&mut self, value: bool) {
        self.bits.push(value);
    }

    /// Write the low `count` bits of `value`
    pub fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64);
        for i in (0..count).rev() {
            self.bits.push((value >> i) & 1 == 1);
        }
    }

    /// Write `value` in just enough bits to hold any value below `max`
    pub fn write_int(&mut self, value: u32, max: u32) {
        debug_assert!(value < max.max(1));
        self.write_bits(value as u64, bits_for_max(max));
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(value as u64, 8);
    }

    #[inline]
    pub fn write_f32(&mut self, value: f32) {
        self.write_bits(value.to_bits() as u64, 32);
    }

    #[inline]
    pub fn write_f64(&mut self, value: f64) {
        self.write_bits(value.to_bits(), 64);
    }

    /// Number of bits written so far
    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }

    /// Get the finished, zero-padded bytes
    pub fn finish(mut self) -> Vec<u8> {
        self.bits.set_uninitialized(false);
        self.bits.into_vec()
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bit reader for parsing datagrams
pub struct BitReader<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            bits: data.view_bits::<Msb0>(),
            position: 0,
        }
    }

    pub fn read_bit(&mut self) -> Result<bool, DecodeError> {
        let bit = self
            .bits
            .get(self.position)
            .map(|b| *b)
            .ok_or(DecodeError::Truncated)?;
        self.position += 1;
        Ok(bit)
    }

    /// Read `count` bits as an unsigned value
    pub fn read_bits(&mut self, count: u32) -> Result<u64, DecodeError> {
        let count = count as usize;
        if self.position + count > self.bits.len() {
            return Err(DecodeError::Truncated);
        }
        let value = self.bits[self.position..self.position + count]
            .iter()
            .fold(0u64, |acc, bit| (acc << 1) | (*bit as u64));
        self.position += count;
        Ok(value)
    }

    pub fn read_int(&mut self, max: u32) -> Result<u32, DecodeError> {
        self.read_bits(bits_for_max(max)).map(|v| v as u32)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.read_bits(8).map(|v| v as u8)
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        self.read_bits(32).map(|v| f32::from_bits(v as u32))
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        self.read_bits(64).map(f64::from_bits)
    }

    /// Bits not yet consumed
    pub fn remaining(&self) -> usize {
        self.bits.len() - self.position
    }

    /// Succeeds only if everything left is byte padding (fewer than 8 zero bits)
    pub fn expect_padding(&self) -> Result<(), DecodeError> {
        let rest = &self.bits[self.position..];
        if rest.len() >= 8 || rest.any() {
            return Err(DecodeError::TrailingBits(rest.len()));
        }
        Ok(())
    }
}

/// Bits needed to store any value in `0..max`
#[inline]
pub fn bits_for_max(max: u32) -> u32 {
    if max <= 1 {
        1
    } else {
        32 - (max - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_for_max() {
        assert_eq!(bits_for_max(1), 1);
        assert_eq!(bits_for_max(2), 1);
        assert_eq!(bits_for_max(3), 2);
        assert_eq!(bits_for_max(4), 2);
        assert_eq!(bits_for_max(30), 5);
        assert_eq!(bits_for_max(32), 5);
        assert_eq!(bits_for_max(33), 6);
    }

    #[test]
    fn test_msb_first_layout() {
        let mut writer = BitWriter::new();
        writer.write_bit(true);
        writer.write_bits(0b01, 2);
        let bytes = writer.finish();
        assert_eq!(bytes, vec![0b1010_0000]);
    }

    #[test]
    fn test_mixed_fields() {
        let mut writer = BitWriter::new();
        writer.write_bit(true);
        writer.write_u8(0xAB);
        writer.write_int(17, 30);
        writer.write_f32(-2.5);
        writer.write_f64(12345.678);
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        assert_eq!(reader.read_int(30).unwrap(), 17);
        assert_eq!(reader.read_f32().unwrap(), -2.5);
        assert_eq!(reader.read_f64().unwrap(), 12345.678);
        assert!(reader.expect_padding().is_ok());
    }

    #[test]
    fn test_truncated_read() {
        let bytes = [0xFFu8];
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_bits(9), Err(DecodeError::Truncated));
        // Failed read does not consume
        assert_eq!(reader.remaining(), 8);
    }

    #[test]
    fn test_trailing_bits_detected() {
        let bytes = [0x00u8, 0x01];
        let mut reader = BitReader::new(&bytes);
        reader.read_bits(4).unwrap();
        assert!(matches!(
            reader.expect_padding(),
            Err(DecodeError::TrailingBits(12))
        ));
    }

    #[test]
    fn test_empty_writer() {
        assert!(BitWriter::default().finish().is_empty());
    }
}
