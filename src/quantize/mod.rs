//! Block quantization codec
//!
//! Converts between full-precision tensors and compact block-quantized
//! storage. Supported formats:
//!
//! - `Q4_0`: 4-bit, scale only (block size 32)
//! - `Q5_0`: 5-bit, scale + high-bit plane (block size 32)
//! - `Q5_1`: 5-bit, scale + min (block size 32)
//! - `Q8_0`: 8-bit, scale only (block size 32)
//! - `Q4_K`: 4-bit super-block of 256 with packed 6-bit sub-block scales
//! - `Q6_K`: 6-bit super-block of 256 with i8 sub-block scales
//!
//! ## `Q8_0` Format
//!
//! Blocks of 32 values, symmetric: `scale = max_abs / 127`,
//! `value = scale * quantized`.
//!
//! ## `Q4_0` Format
//!
//! Blocks of 32 values packed two per byte, low nibbles at positions 0-15
//! and high nibbles at positions 16-31. `value = scale * (quantized - 8)`.
//!
//! ## `Q5_0` / `Q5_1` Formats
//!
//! Like `Q4_0` plus a 32-bit plane carrying each value's 5th bit. `Q5_0` is
//! symmetric (`value = scale * (quantized - 16)`); `Q5_1` carries an explicit
//! minimum (`value = scale * quantized + min`).
//!
//! Quantize and dequantize are pure functions of their inputs, so weight
//! loading is deterministic regardless of access order. A zero-amplitude
//! block quantizes with a minimal positive scale and dequantizes to exactly
//! zeros, never NaN. Scales round-trip through `f16`, matching on-disk
//! precision.

#![allow(non_camel_case_types)]

pub mod kquants;
pub mod matvec;

pub use kquants::{Q4_KBlock, Q6_KBlock};
pub use matvec::{matvec_q4_0, matvec_q8_0, matvec_q8_0_into};

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{InferirError, Result};

/// Block size for the simple formats (`Q4_0`, `Q5_0`, `Q5_1`, `Q8_0`)
pub const BLOCK_SIZE: usize = 32;

/// Super-block size for the K-quant formats (`Q4_K`, `Q6_K`)
pub const QK_K: usize = 256;

/// Minimal positive scale used for zero-amplitude blocks
const MIN_SCALE: f32 = 1.0 / 127.0;

/// Round a scale through f16, the precision it is stored at
#[inline]
pub(crate) fn f16_round(x: f32) -> f32 {
    f16::from_f32(x).to_f32()
}

// ============================================================================
// Format registry
// ============================================================================

/// Supported quantization schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantFormat {
    /// 4-bit, scale only, block 32
    Q4_0,
    /// 5-bit, scale + high-bit plane, block 32
    Q5_0,
    /// 5-bit, scale + min, block 32
    Q5_1,
    /// 8-bit, scale only, block 32
    Q8_0,
    /// 4-bit K-quant, super-block 256
    Q4_K,
    /// 6-bit K-quant, super-block 256
    Q6_K,
}

impl QuantFormat {
    /// Look up a scheme by its conventional lowercase name
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedQuantization` for any name this codec does not
    /// implement, including recognized-but-unimplemented schemes.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "q4_0" => Ok(Self::Q4_0),
            "q5_0" => Ok(Self::Q5_0),
            "q5_1" => Ok(Self::Q5_1),
            "q8_0" => Ok(Self::Q8_0),
            "q4_k" => Ok(Self::Q4_K),
            "q6_k" => Ok(Self::Q6_K),
            _ => Err(InferirError::UnsupportedQuantization {
                name: name.to_string(),
            }),
        }
    }

    /// Values per block
    #[must_use]
    pub fn block_size(self) -> usize {
        match self {
            Self::Q4_0 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 => BLOCK_SIZE,
            Self::Q4_K | Self::Q6_K => QK_K,
        }
    }

    /// Serialized bytes per block (f16 scales, packed codes)
    #[must_use]
    pub fn bytes_per_block(self) -> usize {
        match self {
            Self::Q4_0 => 2 + 16,
            Self::Q5_0 => 2 + 4 + 16,
            Self::Q5_1 => 2 + 2 + 4 + 16,
            Self::Q8_0 => 2 + 32,
            Self::Q4_K => 2 + 2 + 12 + 128,
            Self::Q6_K => 128 + 64 + 16 + 2,
        }
    }

    /// Effective bits per weight including scale overhead
    #[must_use]
    pub fn bits_per_weight(self) -> f32 {
        (self.bytes_per_block() * 8) as f32 / self.block_size() as f32
    }

    /// Whether this codec can dequantize the scheme (always true for
    /// constructed values; registry lookups reject the rest)
    #[must_use]
    pub fn is_supported(self) -> bool {
        true
    }

    /// Check that a tensor length is an exact multiple of the block size
    ///
    /// # Errors
    ///
    /// Returns `FormatError` otherwise; rejected at load time, never a
    /// runtime fault.
    pub fn validate_len(self, len: usize) -> Result<()> {
        if len % self.block_size() != 0 {
            return Err(InferirError::FormatError {
                reason: format!(
                    "{self:?} requires length multiple of {}, got {len}",
                    self.block_size()
                ),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for QuantFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Q4_0 => "q4_0",
            Self::Q5_0 => "q5_0",
            Self::Q5_1 => "q5_1",
            Self::Q8_0 => "q8_0",
            Self::Q4_K => "q4_k",
            Self::Q6_K => "q6_k",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// Simple block structs (block size 32)
// ============================================================================

/// `Q8_0` quantized block: f16-precision scale + 32 int8 codes
#[derive(Debug, Clone)]
pub struct Q8_0Block {
    /// Scale factor for dequantization
    pub scale: f32,
    /// Quantized values
    pub quants: [i8; BLOCK_SIZE],
}

impl Q8_0Block {
    /// Quantize 32 values, symmetric: scale = `max_abs` / 127
    #[must_use]
    pub fn quantize(values: &[f32; BLOCK_SIZE]) -> Self {
        let max_abs = values.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
        let scale = f16_round(if max_abs > 1e-10 {
            max_abs / 127.0
        } else {
            MIN_SCALE
        });

        let mut quants = [0i8; BLOCK_SIZE];
        for (q, &v) in quants.iter_mut().zip(values.iter()) {
            *q = (v / scale).round().clamp(-128.0, 127.0) as i8;
        }
        Self { scale, quants }
    }

    /// Dequantize back to 32 values
    #[must_use]
    pub fn dequantize(&self) -> [f32; BLOCK_SIZE] {
        let mut values = [0.0f32; BLOCK_SIZE];
        for (v, &q) in values.iter_mut().zip(self.quants.iter()) {
            *v = f32::from(q) * self.scale;
        }
        values
    }
}

/// `Q4_0` quantized block: f16-precision scale + 32 4-bit codes
///
/// Low nibbles hold positions 0-15, high nibbles positions 16-31.
#[derive(Debug, Clone)]
pub struct Q4_0Block {
    /// Scale factor for dequantization
    pub scale: f32,
    /// Packed 4-bit values, two per byte
    pub quants: [u8; BLOCK_SIZE / 2],
}

impl Q4_0Block {
    /// Quantize 32 values, symmetric around the 4-bit midpoint
    ///
    /// The divisor is 7, not 8, so both extremes stay representable after
    /// the `+8` shift.
    #[must_use]
    pub fn quantize(values: &[f32; BLOCK_SIZE]) -> Self {
        let max_abs = values.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
        let scale = f16_round(if max_abs > 1e-10 {
            max_abs / 7.0
        } else {
            MIN_SCALE
        });

        let code = |v: f32| -> u8 { ((v / scale).round() + 8.0).clamp(0.0, 15.0) as u8 };

        let mut quants = [0u8; BLOCK_SIZE / 2];
        for (j, q) in quants.iter_mut().enumerate() {
            *q = code(values[j]) | (code(values[j + 16]) << 4);
        }
        Self { scale, quants }
    }

    /// Dequantize back to 32 values
    #[must_use]
    pub fn dequantize(&self) -> [f32; BLOCK_SIZE] {
        let mut values = [0.0f32; BLOCK_SIZE];
        for (j, &byte) in self.quants.iter().enumerate() {
            values[j] = self.scale * (f32::from(byte & 0x0F) - 8.0);
            values[j + 16] = self.scale * (f32::from(byte >> 4) - 8.0);
        }
        values
    }
}

/// `Q5_0` quantized block: scale + 32 5-bit codes (4 low bits packed, 5th
/// bits in a 32-bit plane)
#[derive(Debug, Clone)]
pub struct Q5_0Block {
    /// Scale factor for dequantization
    pub scale: f32,
    /// 5th bit of each value, bit `i` for position `i`
    pub high_bits: u32,
    /// Packed low 4 bits, two values per byte
    pub quants: [u8; BLOCK_SIZE / 2],
}

impl Q5_0Block {
    /// Quantize 32 values, symmetric around the 5-bit midpoint
    #[must_use]
    pub fn quantize(values: &[f32; BLOCK_SIZE]) -> Self {
        let max_abs = values.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
        let scale = f16_round(if max_abs > 1e-10 {
            max_abs / 15.0
        } else {
            MIN_SCALE
        });

        let code = |v: f32| -> u8 { ((v / scale).round() + 16.0).clamp(0.0, 31.0) as u8 };

        let mut high_bits = 0u32;
        let mut quants = [0u8; BLOCK_SIZE / 2];
        for (j, q) in quants.iter_mut().enumerate() {
            let lo = code(values[j]);
            let hi = code(values[j + 16]);
            *q = (lo & 0x0F) | ((hi & 0x0F) << 4);
            high_bits |= u32::from(lo >> 4) << j;
            high_bits |= u32::from(hi >> 4) << (j + 16);
        }
        Self {
            scale,
            high_bits,
            quants,
        }
    }

    /// Dequantize back to 32 values
    #[must_use]
    pub fn dequantize(&self) -> [f32; BLOCK_SIZE] {
        let mut values = [0.0f32; BLOCK_SIZE];
        for (j, &byte) in self.quants.iter().enumerate() {
            let lo = (byte & 0x0F) | ((self.high_bits >> j) & 1) as u8 * 16;
            let hi = (byte >> 4) | ((self.high_bits >> (j + 16)) & 1) as u8 * 16;
            values[j] = self.scale * (f32::from(lo) - 16.0);
            values[j + 16] = self.scale * (f32::from(hi) - 16.0);
        }
        values
    }
}

/// `Q5_1` quantized block: scale + explicit minimum + 32 5-bit codes
#[derive(Debug, Clone)]
pub struct Q5_1Block {
    /// Scale factor for dequantization
    pub scale: f32,
    /// Minimum value of the block
    pub min: f32,
    /// 5th bit of each value, bit `i` for position `i`
    pub high_bits: u32,
    /// Packed low 4 bits, two values per byte
    pub quants: [u8; BLOCK_SIZE / 2],
}

impl Q5_1Block {
    /// Quantize 32 values with an explicit minimum (asymmetric)
    #[must_use]
    pub fn quantize(values: &[f32; BLOCK_SIZE]) -> Self {
        let vmin = values.iter().copied().fold(f32::INFINITY, f32::min);
        let vmax = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min = f16_round(vmin);
        let range = vmax - min;
        let scale = f16_round(if range > 1e-10 { range / 31.0 } else { MIN_SCALE });

        let code = |v: f32| -> u8 { ((v - min) / scale).round().clamp(0.0, 31.0) as u8 };

        let mut high_bits = 0u32;
        let mut quants = [0u8; BLOCK_SIZE / 2];
        for (j, q) in quants.iter_mut().enumerate() {
            let lo = code(values[j]);
            let hi = code(values[j + 16]);
            *q = (lo & 0x0F) | ((hi & 0x0F) << 4);
            high_bits |= u32::from(lo >> 4) << j;
            high_bits |= u32::from(hi >> 4) << (j + 16);
        }
        Self {
            scale,
            min,
            high_bits,
            quants,
        }
    }

    /// Dequantize back to 32 values
    #[must_use]
    pub fn dequantize(&self) -> [f32; BLOCK_SIZE] {
        let mut values = [0.0f32; BLOCK_SIZE];
        for (j, &byte) in self.quants.iter().enumerate() {
            let lo = (byte & 0x0F) | ((self.high_bits >> j) & 1) as u8 * 16;
            let hi = (byte >> 4) | ((self.high_bits >> (j + 16)) & 1) as u8 * 16;
            values[j] = self.scale * f32::from(lo) + self.min;
            values[j + 16] = self.scale * f32::from(hi) + self.min;
        }
        values
    }
}

// ============================================================================
// Slice-level quantize / dequantize
// ============================================================================

macro_rules! slice_codec {
    ($quant_fn:ident, $dequant_fn:ident, $block:ident, $name:literal) => {
        /// Quantize a slice to blocks of 32
        ///
        /// # Errors
        ///
        /// Returns `FormatError` if the length is not a multiple of 32.
        pub fn $quant_fn(values: &[f32]) -> Result<Vec<$block>> {
            if values.len() % BLOCK_SIZE != 0 {
                return Err(InferirError::FormatError {
                    reason: format!(
                        concat!($name, " requires length multiple of {}, got {}"),
                        BLOCK_SIZE,
                        values.len()
                    ),
                });
            }
            Ok(values
                .chunks_exact(BLOCK_SIZE)
                .map(|chunk| {
                    let arr: [f32; BLOCK_SIZE] =
                        chunk.try_into().expect("chunk is exactly 32 elements");
                    $block::quantize(&arr)
                })
                .collect())
        }

        /// Dequantize blocks back to a flat slice
        #[must_use]
        pub fn $dequant_fn(blocks: &[$block]) -> Vec<f32> {
            let mut output = Vec::with_capacity(blocks.len() * BLOCK_SIZE);
            for block in blocks {
                output.extend_from_slice(&block.dequantize());
            }
            output
        }
    };
}

slice_codec!(quantize_q4_0, dequantize_q4_0, Q4_0Block, "Q4_0");
slice_codec!(quantize_q5_0, dequantize_q5_0, Q5_0Block, "Q5_0");
slice_codec!(quantize_q5_1, dequantize_q5_1, Q5_1Block, "Q5_1");
slice_codec!(quantize_q8_0, dequantize_q8_0, Q8_0Block, "Q8_0");

#[cfg(test)]
mod tests {
    use super::*;

    fn test_block() -> [f32; BLOCK_SIZE] {
        let mut values = [0.0f32; BLOCK_SIZE];
        for (i, v) in values.iter_mut().enumerate() {
            *v = (i as f32 - 15.5) * 0.1;
        }
        values
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    #[test]
    fn test_from_name_known() {
        assert_eq!(QuantFormat::from_name("q8_0").unwrap(), QuantFormat::Q8_0);
        assert_eq!(QuantFormat::from_name("Q4_K").unwrap(), QuantFormat::Q4_K);
    }

    #[test]
    fn test_from_name_unsupported() {
        let err = QuantFormat::from_name("q3_k_xs").unwrap_err();
        assert!(matches!(
            err,
            InferirError::UnsupportedQuantization { name } if name == "q3_k_xs"
        ));
        assert!(QuantFormat::from_name("q2_k").is_err());
    }

    #[test]
    fn test_block_sizes() {
        assert_eq!(QuantFormat::Q8_0.block_size(), 32);
        assert_eq!(QuantFormat::Q4_K.block_size(), 256);
        assert_eq!(QuantFormat::Q6_K.block_size(), 256);
    }

    #[test]
    fn test_bits_per_weight() {
        assert!((QuantFormat::Q4_0.bits_per_weight() - 4.5).abs() < 1e-6);
        assert!((QuantFormat::Q8_0.bits_per_weight() - 8.5).abs() < 1e-6);
        assert!((QuantFormat::Q4_K.bits_per_weight() - 4.5).abs() < 1e-6);
        assert!((QuantFormat::Q6_K.bits_per_weight() - 6.5625).abs() < 1e-6);
    }

    #[test]
    fn test_validate_len() {
        assert!(QuantFormat::Q8_0.validate_len(64).is_ok());
        assert!(matches!(
            QuantFormat::Q8_0.validate_len(33).unwrap_err(),
            InferirError::FormatError { .. }
        ));
        assert!(QuantFormat::Q4_K.validate_len(512).is_ok());
        assert!(QuantFormat::Q4_K.validate_len(128).is_err());
    }

    #[test]
    fn test_format_display_round_trips_through_registry() {
        for fmt in [
            QuantFormat::Q4_0,
            QuantFormat::Q5_0,
            QuantFormat::Q5_1,
            QuantFormat::Q8_0,
            QuantFormat::Q4_K,
            QuantFormat::Q6_K,
        ] {
            assert_eq!(QuantFormat::from_name(&fmt.to_string()).unwrap(), fmt);
        }
    }

    // ------------------------------------------------------------------------
    // Q8_0
    // ------------------------------------------------------------------------

    #[test]
    fn test_q8_0_round_trip_within_tolerance() {
        let values = test_block();
        let block = Q8_0Block::quantize(&values);
        let restored = block.dequantize();

        let max_abs = values.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
        for (orig, deq) in values.iter().zip(restored.iter()) {
            // Error bounded by half a quantization step
            assert!((orig - deq).abs() <= max_abs / 127.0);
        }
    }

    #[test]
    fn test_q8_0_max_maps_to_127() {
        let mut values = [0.0f32; BLOCK_SIZE];
        values[5] = 2.0;
        let block = Q8_0Block::quantize(&values);
        assert_eq!(block.quants[5], 127);
    }

    #[test]
    fn test_q8_0_zero_block_dequantizes_to_zeros() {
        let block = Q8_0Block::quantize(&[0.0; BLOCK_SIZE]);
        assert!(block.scale > 0.0);
        assert!(block.dequantize().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_q8_0_quantize_is_pure() {
        let values = test_block();
        let a = Q8_0Block::quantize(&values);
        let b = Q8_0Block::quantize(&values);
        assert_eq!(a.scale, b.scale);
        assert_eq!(a.quants, b.quants);
    }

    // ------------------------------------------------------------------------
    // Q4_0 / Q5_0 / Q5_1
    // ------------------------------------------------------------------------

    #[test]
    fn test_q4_0_round_trip_within_tolerance() {
        let values = test_block();
        let block = Q4_0Block::quantize(&values);
        let restored = block.dequantize();
        for (orig, deq) in values.iter().zip(restored.iter()) {
            assert!((orig - deq).abs() <= block.scale * 0.51);
        }
    }

    #[test]
    fn test_q4_0_zero_block() {
        let block = Q4_0Block::quantize(&[0.0; BLOCK_SIZE]);
        assert!(block.dequantize().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_q5_0_round_trip_within_tolerance() {
        let values = test_block();
        let block = Q5_0Block::quantize(&values);
        let restored = block.dequantize();
        for (orig, deq) in values.iter().zip(restored.iter()) {
            assert!((orig - deq).abs() <= block.scale * 0.51);
        }
    }

    #[test]
    fn test_q5_0_uses_high_bit_plane() {
        let mut values = [0.0f32; BLOCK_SIZE];
        values[0] = 1.0; // code 31: needs the 5th bit
        values[1] = -1.0;
        let block = Q5_0Block::quantize(&values);
        assert_ne!(block.high_bits, 0);
        let restored = block.dequantize();
        assert!((restored[0] - 1.0).abs() < 0.1);
        assert!((restored[1] + 1.0).abs() < 0.1);
    }

    #[test]
    fn test_q5_1_round_trip_asymmetric() {
        // All-positive block: the explicit min should beat symmetric coding
        let mut values = [0.0f32; BLOCK_SIZE];
        for (i, v) in values.iter_mut().enumerate() {
            *v = 10.0 + i as f32 * 0.05;
        }
        let block = Q5_1Block::quantize(&values);
        let restored = block.dequantize();
        for (orig, deq) in values.iter().zip(restored.iter()) {
            assert!((orig - deq).abs() <= block.scale * 0.6, "{orig} vs {deq}");
        }
    }

    #[test]
    fn test_q5_1_constant_block() {
        let block = Q5_1Block::quantize(&[3.5; BLOCK_SIZE]);
        let restored = block.dequantize();
        for v in &restored {
            assert!((v - 3.5).abs() < 0.01);
        }
    }

    // ------------------------------------------------------------------------
    // Slice level
    // ------------------------------------------------------------------------

    #[test]
    fn test_slice_quantize_rejects_bad_length() {
        let err = quantize_q8_0(&[1.0; 33]).unwrap_err();
        assert!(matches!(err, InferirError::FormatError { .. }));
        assert!(quantize_q4_0(&[1.0; 31]).is_err());
    }

    #[test]
    fn test_slice_round_trip() {
        let values: Vec<f32> = (0..96).map(|i| (i as f32 * 0.37).sin()).collect();
        let blocks = quantize_q8_0(&values).unwrap();
        assert_eq!(blocks.len(), 3);
        let restored = dequantize_q8_0(&blocks);
        assert_eq!(restored.len(), 96);
        for (orig, deq) in values.iter().zip(restored.iter()) {
            assert!((orig - deq).abs() < 0.02);
        }
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_block() -> impl Strategy<Value = Vec<f32>> {
        proptest::collection::vec(-64.0f32..64.0, BLOCK_SIZE)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Q8_0 round-trip error stays within half a quantization step
        #[test]
        fn prop_q8_0_round_trip_bounded(values in arb_block()) {
            let mut block_in = [0.0f32; BLOCK_SIZE];
            block_in.copy_from_slice(&values);
            let block = Q8_0Block::quantize(&block_in);
            let restored = block.dequantize();
            for (orig, deq) in block_in.iter().zip(restored.iter()) {
                prop_assert!((orig - deq).abs() <= block.scale * 0.51 + 1e-6);
            }
        }

        /// Q4_0 round-trip error stays within half a step of its coarser grid
        #[test]
        fn prop_q4_0_round_trip_bounded(values in arb_block()) {
            let mut block_in = [0.0f32; BLOCK_SIZE];
            block_in.copy_from_slice(&values);
            let block = Q4_0Block::quantize(&block_in);
            let restored = block.dequantize();
            for (orig, deq) in block_in.iter().zip(restored.iter()) {
                prop_assert!((orig - deq).abs() <= block.scale * 0.51 + 1e-6);
            }
        }

        /// Quantizing the same block twice yields identical bytes
        #[test]
        fn prop_q8_0_quantize_is_deterministic(values in arb_block()) {
            let mut block_in = [0.0f32; BLOCK_SIZE];
            block_in.copy_from_slice(&values);
            let a = Q8_0Block::quantize(&block_in);
            let b = Q8_0Block::quantize(&block_in);
            prop_assert_eq!(a.scale, b.scale);
            prop_assert_eq!(a.quants, b.quants);
        }
    }
}
