//! Feature vector data types and packed-blob helpers.
//!
//! The index stores features as opaque byte blobs; this module owns the
//! mapping between element types and their packed layout:
//! - fp32/fp16/int16/int8: plain little-endian element arrays
//! - int4: two elements per byte, low nibble first
//! - binary32/binary64: bit-packed words
//!
//! `VectorView<T>` projects a typed slice over a blob without copying.

use serde::{Deserialize, Serialize};

/// Element type of an index column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// Unknown / not set
    Undefined,
    /// 32-bit float elements
    Fp32,
    /// 16-bit float elements
    Fp16,
    /// 16-bit signed integer elements
    Int16,
    /// 8-bit signed integer elements
    Int8,
    /// 4-bit signed integer elements, packed two per byte
    Int4,
    /// 32-bit binary (bit-packed) elements
    Binary32,
    /// 64-bit binary (bit-packed) elements
    Binary64,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Undefined
    }
}

impl DataType {
    /// Bits occupied by one element.
    pub fn element_size_bits(self) -> usize {
        match self {
            DataType::Undefined => 0,
            DataType::Fp32 => 32,
            DataType::Fp16 => 16,
            DataType::Int16 => 16,
            DataType::Int8 => 8,
            DataType::Int4 => 4,
            DataType::Binary32 => 1,
            DataType::Binary64 => 1,
        }
    }

    /// Bytes occupied by one vector of `dimension` elements.
    pub fn vector_size(self, dimension: usize) -> usize {
        (self.element_size_bits() * dimension + 7) / 8
    }

    /// Parse the wire name used by requests and schemas.
    pub fn from_name(name: &str) -> DataType {
        match name {
            "fp32" | "FP32" | "VECTOR_FP32" => DataType::Fp32,
            "fp16" | "FP16" | "VECTOR_FP16" => DataType::Fp16,
            "int16" | "INT16" | "VECTOR_INT16" => DataType::Int16,
            "int8" | "INT8" | "VECTOR_INT8" => DataType::Int8,
            "int4" | "INT4" | "VECTOR_INT4" => DataType::Int4,
            "binary32" | "BINARY32" | "VECTOR_BINARY32" => DataType::Binary32,
            "binary64" | "BINARY64" | "VECTOR_BINARY64" => DataType::Binary64,
            _ => DataType::Undefined,
        }
    }
}

// ---------------------------------------------------------------------------
// fp16 conversion
// ---------------------------------------------------------------------------

/// Convert an f32 to IEEE 754 half-precision bits (round-to-nearest-even).
pub fn fp32_to_fp16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exp == 0xff {
        // Inf / NaN
        let payload = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | payload;
    }

    let unbiased = exp - 127;
    if unbiased > 15 {
        // Overflow to infinity
        return sign | 0x7c00;
    }
    if unbiased >= -14 {
        // Normal half
        let half_exp = ((unbiased + 15) as u16) << 10;
        let half_mant = (mantissa >> 13) as u16;
        let round = (mantissa >> 12) & 1;
        return (sign | half_exp | half_mant).wrapping_add(round as u16);
    }
    if unbiased >= -24 {
        // Subnormal half: value = mant * 2^-24
        let shift = (-unbiased - 1) as u32;
        let full = mantissa | 0x0080_0000;
        let mant = full >> shift;
        let round = (full >> (shift - 1)) & 1;
        return sign | ((mant as u16).wrapping_add(round as u16));
    }
    // Underflow to zero
    sign
}

/// Convert IEEE 754 half-precision bits to an f32.
pub fn fp16_bits_to_fp32(bits: u16) -> f32 {
    let sign = ((bits & 0x8000) as u32) << 16;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let mantissa = (bits & 0x03ff) as u32;

    let word = if exp == 0 {
        if mantissa == 0 {
            sign
        } else {
            // Subnormal: renormalize
            let mut exp = 127 - 15 + 1;
            let mut mant = mantissa;
            while mant & 0x0400 == 0 {
                mant <<= 1;
                exp -= 1;
            }
            sign | ((exp as u32) << 23) | ((mant & 0x03ff) << 13)
        }
    } else if exp == 0x1f {
        sign | 0x7f80_0000 | (mantissa << 13)
    } else {
        sign | ((exp + 127 - 15) << 23) | (mantissa << 13)
    };
    f32::from_bits(word)
}

// ---------------------------------------------------------------------------
// Packing helpers
// ---------------------------------------------------------------------------

/// Pack f32 elements into a blob for the given data type.
///
/// Only the float family is convertible; integer and binary types must be
/// packed from their native element slices.
pub fn pack_f32(values: &[f32], data_type: DataType) -> Option<Vec<u8>> {
    match data_type {
        DataType::Fp32 => {
            let mut buf = Vec::with_capacity(values.len() * 4);
            for v in values {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Some(buf)
        }
        DataType::Fp16 => {
            let mut buf = Vec::with_capacity(values.len() * 2);
            for v in values {
                buf.extend_from_slice(&fp32_to_fp16_bits(*v).to_le_bytes());
            }
            Some(buf)
        }
        _ => None,
    }
}

/// Pack i16 elements.
pub fn pack_i16(values: &[i16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 2);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Pack i8 elements.
pub fn pack_i8(values: &[i8]) -> Vec<u8> {
    values.iter().map(|v| *v as u8).collect()
}

/// Pack 4-bit elements, low nibble first: `(val & 0xF) << ((i & 1) << 2)`.
pub fn pack_i4(values: &[i8]) -> Vec<u8> {
    let mut buf = vec![0u8; (values.len() + 1) / 2];
    for (i, v) in values.iter().enumerate() {
        buf[i >> 1] |= ((*v as u8) & 0xf) << ((i & 1) << 2);
    }
    buf
}

/// Read the `i`-th 4-bit element of a packed blob.
pub fn unpack_i4(blob: &[u8], i: usize) -> i8 {
    let nibble = (blob[i >> 1] >> ((i & 1) << 2)) & 0xf;
    // Sign-extend the nibble
    ((nibble << 4) as i8) >> 4
}

/// Pack binary words (32- or 64-bit) into a bit blob.
pub fn pack_u32(values: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Pack binary64 words.
pub fn pack_u64(values: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 8);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Pack float-parsed elements into a blob of the given type.
///
/// This is the write-time conversion for JSON-sourced vectors: floats for
/// the float family, truncation for the integer families, word values for
/// the binary families.
pub fn pack_f64_values(values: &[f64], data_type: DataType) -> Option<Vec<u8>> {
    match data_type {
        DataType::Fp32 | DataType::Fp16 => {
            let floats: Vec<f32> = values.iter().map(|v| *v as f32).collect();
            pack_f32(&floats, data_type)
        }
        DataType::Int16 => {
            let ints: Vec<i16> = values.iter().map(|v| *v as i16).collect();
            Some(pack_i16(&ints))
        }
        DataType::Int8 => {
            let ints: Vec<i8> = values.iter().map(|v| *v as i8).collect();
            Some(pack_i8(&ints))
        }
        DataType::Int4 => {
            let ints: Vec<i8> = values.iter().map(|v| *v as i8).collect();
            Some(pack_i4(&ints))
        }
        DataType::Binary32 => {
            let words: Vec<u32> = values.iter().map(|v| *v as u32).collect();
            Some(pack_u32(&words))
        }
        DataType::Binary64 => {
            let words: Vec<u64> = values.iter().map(|v| *v as u64).collect();
            Some(pack_u64(&words))
        }
        DataType::Undefined => None,
    }
}

/// Test the `bit`-th bit of a packed binary blob: `(bit >> 3)` addressing.
pub fn test_bit(blob: &[u8], bit: usize) -> bool {
    blob[bit >> 3] & (1 << (bit & 7)) != 0
}

/// Typed projection over a packed byte blob.
///
/// Length is `bytes / size_of::<T>()`; the blob must be aligned for `T`,
/// which holds for blobs produced by the pack helpers above.
pub struct VectorView<'a, T> {
    blob: &'a [u8],
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: Copy> VectorView<'a, T> {
    /// Wrap a blob. Trailing bytes that do not fill an element are ignored.
    pub fn new(blob: &'a [u8]) -> Self {
        VectorView {
            blob,
            _marker: std::marker::PhantomData,
        }
    }

    /// Number of whole elements in the blob.
    pub fn len(&self) -> usize {
        self.blob.len() / std::mem::size_of::<T>()
    }

    /// True when no whole element fits.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read element `i` (unaligned-safe).
    pub fn get(&self, i: usize) -> T {
        let size = std::mem::size_of::<T>();
        let start = i * size;
        assert!(start + size <= self.blob.len(), "vector view out of bounds");
        unsafe { std::ptr::read_unaligned(self.blob[start..].as_ptr() as *const T) }
    }

    /// Iterate elements.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

/// Decode a blob of the given type into f32 elements, for distance math.
///
/// Integer elements are widened; binary types are not decodable to floats
/// and return `None`.
pub fn unpack_to_f32(blob: &[u8], data_type: DataType) -> Option<Vec<f32>> {
    match data_type {
        DataType::Fp32 => Some(VectorView::<f32>::new(blob).iter().collect()),
        DataType::Fp16 => Some(
            VectorView::<u16>::new(blob)
                .iter()
                .map(fp16_bits_to_fp32)
                .collect(),
        ),
        DataType::Int16 => Some(
            VectorView::<i16>::new(blob)
                .iter()
                .map(|v| v as f32)
                .collect(),
        ),
        DataType::Int8 => Some(blob.iter().map(|v| *v as i8 as f32).collect()),
        DataType::Int4 => {
            let count = blob.len() * 2;
            Some((0..count).map(|i| unpack_i4(blob, i) as f32).collect())
        }
        _ => None,
    }
}
