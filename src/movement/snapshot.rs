//! Kinematic snapshot: the unit of state exchanged between client and authority

use serde::{Deserialize, Serialize};

use crate::net::bitstream::{BitReader, BitWriter};
use crate::net::protocol::DecodeError;
use crate::util::math::{Quat, Vec3};

/// Fixed-point scale for packed vectors (2 decimal places)
pub const VECTOR_SCALE: f32 = 100.0;
/// Maximum bits per packed vector component
pub const VECTOR_MAX_BITS: u32 = 30;

// Keeps the rounded value inside i32 on every platform
const SCALED_MIN: f32 = -1_073_741_824.0;
const SCALED_MAX: f32 = 1_073_741_760.0;

/// Position, orientation and velocities of a pawn at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KinematicSnapshot {
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl KinematicSnapshot {
    pub fn new(
        position: Vec3,
        rotation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    ) -> Self {
        Self {
            position,
            rotation,
            linear_velocity,
            angular_velocity,
        }
    }

    pub fn at_rest(position: Vec3, rotation: Quat) -> Self {
        Self::new(position, rotation, Vec3::ZERO, Vec3::ZERO)
    }

    /// Serialize to the packed wire form.
    ///
    /// Returns `false` if any value had to be clamped or sanitized to fit.
    pub fn write(&self, writer: &mut BitWriter) -> bool {
        let mut exact = write_packed_vector(self.position, writer);
        exact &= write_quat(self.rotation, writer);
        exact &= write_packed_vector(self.linear_velocity, writer);
        exact &= write_packed_vector(self.angular_velocity, writer);
        exact
    }

    pub fn read(reader: &mut BitReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            position: read_packed_vector(reader)?,
            rotation: read_quat(reader)?,
            linear_velocity: read_packed_vector(reader)?,
            angular_velocity: read_packed_vector(reader)?,
        })
    }

    /// The snapshot as the receiving side will decode it
    pub fn quantized(&self) -> Self {
        let mut writer = BitWriter::with_capacity(48);
        self.write(&mut writer);
        let bytes = writer.finish();
        Self::read(&mut BitReader::new(&bytes)).unwrap_or(*self)
    }

    pub fn approx_eq(&self, other: &KinematicSnapshot, epsilon: f32) -> bool {
        self.position.approx_eq(other.position, epsilon)
            && self.rotation.approx_eq(other.rotation, epsilon)
            && self.linear_velocity.approx_eq(other.linear_velocity, epsilon)
            && self.angular_velocity.approx_eq(other.angular_velocity, epsilon)
    }
}

/// Write a vector with 2 decimal places of precision, using only as many bits
/// per component as the largest component needs.
///
/// Format: [5 bits width W][3 x (W + 2) bits biased components]
pub fn write_packed_vector(value: Vec3, writer: &mut BitWriter) -> bool {
    let mut exact = true;
    let mut ints = [0i64; 3];

    for (slot, component) in ints.iter_mut().zip([value.x, value.y, value.z]) {
        let scaled = component * VECTOR_SCALE;
        if !scaled.is_finite() {
            exact = false;
            continue;
        }
        let clamped = scaled.clamp(SCALED_MIN, SCALED_MAX);
        if clamped != scaled {
            exact = false;
        }
        *slot = clamped.round() as i64;
    }

    let largest = ints.iter().map(|v| v.unsigned_abs()).max().unwrap_or(0);
    let width = ceil_log2(1 + largest).clamp(1, VECTOR_MAX_BITS) - 1;
    writer.write_int(width, VECTOR_MAX_BITS);

    let bias = 1i64 << (width + 1);
    let max = 1i64 << (width + 2);
    for v in ints {
        let mut biased = v + bias;
        if biased >= max {
            exact = false;
            biased = max - 1;
        } else if biased < 0 {
            exact = false;
            biased = 0;
        }
        writer.write_bits(biased as u64, width + 2);
    }

    exact
}

pub fn read_packed_vector(reader: &mut BitReader<'_>) -> Result<Vec3, DecodeError> {
    let width = reader.read_int(VECTOR_MAX_BITS)?;
    if width >= VECTOR_MAX_BITS {
        return Err(DecodeError::InvalidField("packed vector width"));
    }
    let bias = 1i64 << (width + 1);

    let mut out = [0.0f32; 3];
    for slot in out.iter_mut() {
        let biased = reader.read_bits(width + 2)? as i64;
        *slot = (biased - bias) as f32 / VECTOR_SCALE;
    }
    Ok(Vec3::new(out[0], out[1], out[2]))
}

/// Write a rotation as X, Y, Z with W implied non-negative
pub fn write_quat(value: Quat, writer: &mut BitWriter) -> bool {
    let exact = value.is_finite();
    let mut q = value.normalize();
    if q.w < 0.0 {
        q = Quat::new(-q.x, -q.y, -q.z, -q.w);
    }
    writer.write_f32(q.x);
    writer.write_f32(q.y);
    writer.write_f32(q.z);
    exact
}

pub fn read_quat(reader: &mut BitReader<'_>) -> Result<Quat, DecodeError> {
    let x = reader.read_f32()?;
    let y = reader.read_f32()?;
    let z = reader.read_f32()?;
    if !(x.is_finite() && y.is_finite() && z.is_finite()) {
        return Err(DecodeError::NonFinite("orientation"));
    }
    let xyz_sq = x * x + y * y + z * z;
    let w = (1.0 - xyz_sq).max(0.0).sqrt();
    Ok(Quat::new(x, y, z, w).normalize())
}

#[inline]
fn ceil_log2(value: u64) -> u32 {
    if value <= 1 {
        0
    } else {
        64 - (value - 1).leading_zeros()
    }
}
