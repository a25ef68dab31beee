//! Supported point element types and their distance result types.
//!
//! The engine is generic over a closed set of numeric element types. Each
//! element type names the floating-point type its distances accumulate in:
//! `f64` stays `f64`, every other type (including all integer types)
//! accumulates in `f32`.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, Sub};

use serde::de::DeserializeOwned;
use serde::Serialize;

mod sealed {
    pub trait Sealed {}
}

/// A numeric component type that points may be made of.
pub trait Element:
    sealed::Sealed + Copy + Send + Sync + Debug + PartialEq + Serialize + DeserializeOwned + 'static
{
    /// The type distances against this element accumulate in.
    type Distance: DistanceValue;

    /// Stable tag written into saved indices and dataset files.
    const TYPE_TAG: u8;
    /// Human-readable name of the element type.
    const NAME: &'static str;
    /// Width of the element's bit pattern.
    const BITS: u32;

    fn to_distance(self) -> Self::Distance;

    /// Raw bit pattern, zero-extended. Used by the Hamming metrics.
    fn bit_pattern(self) -> u64;

    fn write_le(self, out: &mut Vec<u8>);

    /// Decode from exactly `BITS / 8` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

/// Floating-point type distances are reported in.
pub trait DistanceValue:
    Element<Distance = Self>
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + AddAssign
{
    const ZERO: Self;
    const ONE: Self;
    const INFINITY: Self;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn from_usize(v: usize) -> Self;
    fn abs(self) -> Self;
    fn sqrt(self) -> Self;
    fn ln(self) -> Self;
    fn powf(self, p: Self) -> Self;
    fn max(self, other: Self) -> Self;
    fn min(self, other: Self) -> Self;
    fn total_cmp(&self, other: &Self) -> Ordering;
}

macro_rules! impl_element {
    ($t:ty, $dist:ty, $tag:expr, |$v:ident| $bits:expr) => {
        impl sealed::Sealed for $t {}

        impl Element for $t {
            type Distance = $dist;

            const TYPE_TAG: u8 = $tag;
            const NAME: &'static str = stringify!($t);
            const BITS: u32 = (std::mem::size_of::<$t>() * 8) as u32;

            #[inline]
            fn to_distance(self) -> $dist {
                self as $dist
            }

            #[inline]
            fn bit_pattern(self) -> u64 {
                let $v = self;
                $bits
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(f32, f32, 1, |v| v.to_bits() as u64);
impl_element!(f64, f64, 2, |v| v.to_bits());
impl_element!(i8, f32, 3, |v| v as u8 as u64);
impl_element!(i16, f32, 4, |v| v as u16 as u64);
impl_element!(i32, f32, 5, |v| v as u32 as u64);
impl_element!(u8, f32, 6, |v| v as u64);
impl_element!(u16, f32, 7, |v| v as u64);
impl_element!(u32, f32, 8, |v| v as u64);

macro_rules! impl_distance_value {
    ($t:ty) => {
        impl DistanceValue for $t {
            const ZERO: Self = 0.0;
            const ONE: Self = 1.0;
            const INFINITY: Self = <$t>::INFINITY;

            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $t
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_usize(v: usize) -> Self {
                v as $t
            }

            #[inline]
            fn abs(self) -> Self {
                <$t>::abs(self)
            }

            #[inline]
            fn sqrt(self) -> Self {
                <$t>::sqrt(self)
            }

            #[inline]
            fn ln(self) -> Self {
                <$t>::ln(self)
            }

            #[inline]
            fn powf(self, p: Self) -> Self {
                <$t>::powf(self, p)
            }

            #[inline]
            fn max(self, other: Self) -> Self {
                <$t>::max(self, other)
            }

            #[inline]
            fn min(self, other: Self) -> Self {
                <$t>::min(self, other)
            }

            #[inline]
            fn total_cmp(&self, other: &Self) -> Ordering {
                <$t>::total_cmp(self, other)
            }
        }
    };
}

impl_distance_value!(f32);
impl_distance_value!(f64);

/// Convert a row of elements into its distance type.
pub(crate) fn to_distance_row<T: Element>(row: &[T]) -> Vec<T::Distance> {
    row.iter().map(|v| v.to_distance()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_elements_widen_to_f32() {
        assert_eq!(200u8.to_distance(), 200.0f32);
        assert_eq!((-5i16).to_distance(), -5.0f32);
        assert_eq!(7.5f64.to_distance(), 7.5f64);
    }

    #[test]
    fn test_bit_patterns_are_zero_extended() {
        assert_eq!((-1i8).bit_pattern(), 0xFF);
        assert_eq!((-1i16).bit_pattern(), 0xFFFF);
        assert_eq!(0b1010u8.bit_pattern(), 0b1010);
        assert_eq!(<u8 as Element>::BITS, 8);
        assert_eq!(<f64 as Element>::BITS, 64);
    }

    #[test]
    fn test_le_roundtrip() {
        let mut buf = Vec::new();
        (-12345i32).write_le(&mut buf);
        3.25f32.write_le(&mut buf);
        assert_eq!(i32::read_le(&buf[0..4]), -12345);
        assert_eq!(f32::read_le(&buf[4..8]), 3.25);
    }

    #[test]
    fn test_type_tags_unique() {
        let tags = [
            <f32 as Element>::TYPE_TAG,
            <f64 as Element>::TYPE_TAG,
            <i8 as Element>::TYPE_TAG,
            <i16 as Element>::TYPE_TAG,
            <i32 as Element>::TYPE_TAG,
            <u8 as Element>::TYPE_TAG,
            <u16 as Element>::TYPE_TAG,
            <u32 as Element>::TYPE_TAG,
        ];
        let unique: std::collections::HashSet<u8> = tags.iter().copied().collect();
        assert_eq!(unique.len(), tags.len());
    }
}
