//! Quantized control input
//!
//! Four continuous axes in [-1, 1] plus a flag byte. Axes quantize to one of
//! 255 steps (254 intervals) so that zero lands exactly on the middle step.

use serde::{Deserialize, Serialize};

use crate::net::bitstream::{BitReader, BitWriter};
use crate::net::protocol::DecodeError;

/// Number of intervals an axis is divided into. Odd step count keeps zero exact.
pub const AXIS_STEPS: f32 = 254.0;

/// Quantized step that decodes to exactly zero; it is the step omitted from the wire
pub const ZERO_STEP: u8 = 127;

/// Compress an axis value in [-1, 1] to a step in [0, 254]
///
/// Callers clamp first; out-of-range input saturates.
#[inline]
pub fn compress_axis(value: f32) -> u8 {
    (((value * 0.5) + 0.5) * AXIS_STEPS).round() as u8
}

/// Expand a quantized step back to [-1, 1]
#[inline]
pub fn decompress_axis(step: u8) -> f32 {
    ((step as f32 / AXIS_STEPS) * 2.0) - 1.0
}

/// Snap a raw axis value to the value the wire will reproduce
#[inline]
pub fn quantize_axis(value: f32) -> f32 {
    let clamped = if value.is_finite() { value.clamp(-1.0, 1.0) } else { 0.0 };
    decompress_axis(compress_axis(clamped))
}

/// Control input for a single move
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantizedInput {
    pub forward: f32,
    pub strafe: f32,
    pub steer: f32,
    pub pitch: f32,
    /// Discrete button states (boost, brake, ...)
    pub flags: u8,
}

impl QuantizedInput {
    /// Build an input from raw device values, clamping and snapping every axis
    /// so client and authority simulate with identical numbers.
    pub fn new(forward: f32, strafe: f32, steer: f32, pitch: f32, flags: u8) -> Self {
        Self {
            forward: quantize_axis(forward),
            strafe: quantize_axis(strafe),
            steer: quantize_axis(steer),
            pitch: quantize_axis(pitch),
            flags,
        }
    }

    /// Re-snap every axis; for inputs built field by field
    pub fn quantized(&self) -> Self {
        Self::new(self.forward, self.strafe, self.steer, self.pitch, self.flags)
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    fn axes(&self) -> [f32; 4] {
        [self.forward, self.strafe, self.steer, self.pitch]
    }

    /// Write presence bits and non-zero bytes in fixed field order
    pub fn write(&self, writer: &mut BitWriter) {
        for axis in self.axes() {
            let step = compress_axis(axis);
            writer.write_bit(step != ZERO_STEP);
            if step != ZERO_STEP {
                writer.write_u8(step);
            }
        }
        writer.write_bit(self.flags != 0);
        if self.flags != 0 {
            writer.write_u8(self.flags);
        }
    }

    pub fn read(reader: &mut BitReader<'_>) -> Result<Self, DecodeError> {
        let mut axes = [0.0f32; 4];
        for axis in axes.iter_mut() {
            if reader.read_bit()? {
                *axis = decompress_axis(reader.read_u8()?);
            }
        }
        let flags = if reader.read_bit()? { reader.read_u8()? } else { 0 };

        Ok(Self {
            forward: axes[0],
            strafe: axes[1],
            steer: axes[2],
            pitch: axes[3],
            flags,
        })
    }
}

impl std::fmt::Display for QuantizedInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fwd={:.3} strafe={:.3} steer={:.3} pitch={:.3} flags={:#04x}",
            self.forward, self.strafe, self.steer, self.pitch, self.flags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_exact() {
        assert_eq!(compress_axis(0.0), ZERO_STEP);
        assert_eq!(decompress_axis(ZERO_STEP), 0.0);
        assert_eq!(quantize_axis(0.0), 0.0);
    }

    #[test]
    fn test_extremes() {
        assert_eq!(compress_axis(-1.0), 0);
        assert_eq!(compress_axis(1.0), 254);
        assert_eq!(decompress_axis(0), -1.0);
        assert_eq!(decompress_axis(254), 1.0);
    }

    #[test]
    fn test_roundtrip_error_bound() {
        let bound = 1.0 / AXIS_STEPS + 1e-6;
        for i in 0..=2000 {
            let v = -1.0 + (i as f32) * 0.001;
            let decoded = decompress_axis(compress_axis(v));
            assert!(
                (decoded - v).abs() <= bound,
                "value {} decoded to {}",
                v,
                decoded
            );
        }
    }

    #[test]
    fn test_quantize_is_idempotent() {
        for v in [-0.93, -0.5, -0.01, 0.004, 0.33, 0.999] {
            let once = quantize_axis(v);
            assert_eq!(quantize_axis(once), once);
        }
    }

    #[test]
    fn test_new_clamps_and_sanitizes() {
        let input = QuantizedInput::new(3.0, -7.0, f32::NAN, 0.0, 0);
        assert_eq!(input.forward, 1.0);
        assert_eq!(input.strafe, -1.0);
        assert_eq!(input.steer, 0.0);
    }

    #[test]
    fn test_idle_costs_five_bits() {
        let mut writer = BitWriter::new();
        QuantizedInput::default().write(&mut writer);
        assert_eq!(writer.bit_len(), 5);
    }

    #[test]
    fn test_partial_input_size() {
        let mut writer = BitWriter::new();
        QuantizedInput::new(1.0, 0.0, 0.0, 0.0, 0b10).write(&mut writer);
        // 5 presence bits + forward byte + flags byte
        assert_eq!(writer.bit_len(), 5 + 16);
    }

    #[test]
    fn test_every_axis_decodes_to_its_own_field() {
        let input = QuantizedInput::new(0.25, -0.5, 0.75, -1.0, 0x81);
        let mut writer = BitWriter::new();
        input.write(&mut writer);
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        let decoded = QuantizedInput::read(&mut reader).unwrap();
        assert_eq!(decoded, input);
        assert_eq!(decoded.pitch, -1.0);
        assert_eq!(decoded.steer, input.steer);
    }

    #[test]
    fn test_truncated_input() {
        // Forward presence bit set but no byte follows
        let bytes = [0b1000_0000u8];
        let mut reader = BitReader::new(&bytes);
        assert!(QuantizedInput::read(&mut reader).is_err());
    }

    #[test]
    fn test_display() {
        let text = QuantizedInput::default().to_string();
        assert!(text.contains("fwd=0.000"));
    }
}
