pub mod archive;
pub mod farc;
pub mod objset;
pub mod texset;

use std::fmt::{Debug, Display, Formatter, Write};

use binrw::binrw;
use bytemuck::{Pod, Zeroable};

#[binrw]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    #[inline]
    pub const fn new(value: &[u8; 4]) -> Self { Self(*value) }

    /// Bytes as they appear on disk, interpreted little-endian.
    #[inline]
    pub const fn from_le_u32(value: u32) -> Self { Self(value.to_le_bytes()) }

    #[inline]
    pub const fn as_le_u32(&self) -> u32 { u32::from_le_bytes(self.0) }
}

impl Display for FourCC {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0 {
            if c.is_ascii_graphic() || c == b' ' {
                f.write_char(c as char)?;
            } else {
                write!(f, "\\x{c:02X}")?;
            }
        }
        Ok(())
    }
}

impl Debug for FourCC {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_char('"')?;
        Display::fmt(self, f)?;
        f.write_char('"')
    }
}

impl PartialEq<[u8; 4]> for FourCC {
    fn eq(&self, other: &[u8; 4]) -> bool { &self.0 == other }
}

#[inline]
pub fn peek_four_cc(data: &[u8]) -> Option<FourCC> {
    data.get(..4).and_then(|b| b.try_into().ok()).map(FourCC)
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vec4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IVec2 {
    pub x: i32,
    pub y: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IVec3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IVec4 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub w: i32,
}

/// Column-major.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Mat3 {
    pub m: [f32; 9],
}

/// Column-major.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Mat4 {
    pub m: [f32; 16],
}

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4 {
        m: [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
    };
}

impl Default for Mat4 {
    fn default() -> Self { Self { m: [0.0; 16] } }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

/// Extracts `width` bits starting at `offset`.
#[inline]
pub(crate) const fn get_bits(value: u32, offset: u32, width: u32) -> u32 {
    (value >> offset) & mask(width)
}

/// Stores the low `width` bits of `field` at `offset`.
#[inline]
pub(crate) fn put_bits(value: &mut u32, field: u32, offset: u32, width: u32) {
    let mask = mask(width) << offset;
    *value = (*value & !mask) | ((field << offset) & mask);
}

#[inline]
pub(crate) const fn get_bit(value: u32, offset: u32) -> bool { get_bits(value, offset, 1) != 0 }

#[inline]
pub(crate) fn put_bit(value: &mut u32, field: bool, offset: u32) {
    put_bits(value, field as u32, offset, 1)
}

#[inline]
const fn mask(width: u32) -> u32 { if width >= 32 { u32::MAX } else { (1u32 << width) - 1 } }
