//! K-quant super-block formats (`Q4_K`, `Q6_K`)
//!
//! Super-blocks of 256 values carry two levels of scaling: a half-precision
//! super-block scale and packed per-sub-block scales. `Q4_K` divides into
//! 8 sub-blocks of 32 with 6-bit scale/min pairs packed into 12 bytes;
//! `Q6_K` divides into 16 sub-blocks of 16 with signed 8-bit scales.
//!
//! Dequantization:
//!
//! - `Q4_K`: `value = d * sc * q - dmin * m`, `q` in `[0, 15]`
//! - `Q6_K`: `value = d * sc * (q - 32)`, `q` in `[0, 63]`

use super::{f16_round, QK_K};

/// Sub-blocks per `Q4_K` super-block
const Q4K_SUB_BLOCKS: usize = 8;
/// Values per `Q4_K` sub-block
const Q4K_SUB_SIZE: usize = 32;

/// Sub-blocks per `Q6_K` super-block
const Q6K_SUB_BLOCKS: usize = 16;
/// Values per `Q6_K` sub-block
const Q6K_SUB_SIZE: usize = 16;

// ============================================================================
// 6-bit scale/min packing (Q4_K)
// ============================================================================

/// Unpack the 6-bit scale and min for sub-block `block_idx` from the 12-byte
/// packed layout
///
/// Sub-blocks 0-3 live in the low 6 bits of bytes 0-7; sub-blocks 4-7 split
/// across the low/high nibbles of bytes 8-11 plus the high 2 bits of bytes
/// 0-7.
#[must_use]
pub fn extract_scale_min(scales: &[u8; 12], block_idx: usize) -> (f32, f32) {
    let j = block_idx;
    let (scale_bits, min_bits) = if j < 4 {
        (scales[j] & 63, scales[j + 4] & 63)
    } else {
        (
            (scales[j + 4] & 0x0F) | ((scales[j - 4] >> 6) << 4),
            (scales[j + 4] >> 4) | ((scales[j] >> 6) << 4),
        )
    };
    (f32::from(scale_bits), f32::from(min_bits))
}

/// Inverse of [`extract_scale_min`]: pack eight 6-bit scale/min pairs
fn pack_scale_min(sc: &[u8; 8], mn: &[u8; 8]) -> [u8; 12] {
    let mut out = [0u8; 12];
    for j in 0..4 {
        out[j] = sc[j] & 63;
        out[j + 4] = mn[j] & 63;
    }
    for j in 4..8 {
        out[j + 4] = (sc[j] & 0x0F) | ((mn[j] & 0x0F) << 4);
        out[j - 4] |= (sc[j] >> 4) << 6;
        out[j] |= (mn[j] >> 4) << 6;
    }
    out
}

// ============================================================================
// Q4_K
// ============================================================================

/// `Q4_K` super-block: 256 values at 4.5 bits per weight
///
/// Layout: f16 super-scale `d`, f16 super-min `dmin`, 12 bytes of packed
/// 6-bit sub-block scales/mins, 128 bytes of 4-bit codes.
#[derive(Debug, Clone)]
pub struct Q4_KBlock {
    /// Super-block scale
    pub d: f32,
    /// Super-block min scale
    pub dmin: f32,
    /// Packed 6-bit sub-block scales and mins
    pub scales: [u8; 12],
    /// Packed 4-bit codes
    pub qs: [u8; 128],
}

impl Q4_KBlock {
    /// Quantize 256 values
    ///
    /// Per sub-block the asymmetric range is coded as `scale` and `min`;
    /// both sets are then re-quantized to 6 bits against the super-block
    /// `d`/`dmin`.
    #[must_use]
    pub fn quantize(values: &[f32; QK_K]) -> Self {
        let mut sub_scale = [0.0f32; Q4K_SUB_BLOCKS];
        let mut sub_min = [0.0f32; Q4K_SUB_BLOCKS];
        for (j, chunk) in values.chunks_exact(Q4K_SUB_SIZE).enumerate() {
            let vmin = chunk.iter().copied().fold(f32::INFINITY, f32::min);
            let vmax = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            // Codes are unsigned: the min shifts the range to start at zero
            sub_min[j] = (-vmin).max(0.0);
            sub_scale[j] = (vmax + sub_min[j]).max(0.0) / 15.0;
        }

        let scale_max = sub_scale.iter().copied().fold(0.0f32, f32::max);
        let min_max = sub_min.iter().copied().fold(0.0f32, f32::max);
        let d = f16_round(scale_max / 63.0);
        let dmin = f16_round(min_max / 63.0);

        let mut sc = [0u8; Q4K_SUB_BLOCKS];
        let mut mn = [0u8; Q4K_SUB_BLOCKS];
        for j in 0..Q4K_SUB_BLOCKS {
            if d > 0.0 {
                sc[j] = (sub_scale[j] / d).round().clamp(0.0, 63.0) as u8;
            }
            if dmin > 0.0 {
                mn[j] = (sub_min[j] / dmin).round().clamp(0.0, 63.0) as u8;
            }
        }
        let scales = pack_scale_min(&sc, &mn);

        let mut qs = [0u8; 128];
        let code = |v: f32, j: usize| -> u8 {
            let eff = d * f32::from(sc[j]);
            if eff > 0.0 {
                ((v + dmin * f32::from(mn[j])) / eff)
                    .round()
                    .clamp(0.0, 15.0) as u8
            } else {
                0
            }
        };
        // Low nibbles: values 0-31 of each 64-run; high nibbles: values 32-63
        for j in (0..QK_K).step_by(64) {
            let is = j / Q4K_SUB_SIZE;
            for i in 0..32 {
                let lo = code(values[j + i], is);
                let hi = code(values[j + 32 + i], is + 1);
                qs[j / 2 + i] = lo | (hi << 4);
            }
        }

        Self {
            d,
            dmin,
            scales,
            qs,
        }
    }

    /// Dequantize back to 256 values
    #[must_use]
    pub fn dequantize(&self) -> [f32; QK_K] {
        let mut values = [0.0f32; QK_K];
        let mut out = 0;
        for j in (0..QK_K).step_by(64) {
            let q = &self.qs[j / 2..j / 2 + 32];
            let is = j / Q4K_SUB_SIZE;

            let (sc1, m1) = extract_scale_min(&self.scales, is);
            let d1 = self.d * sc1;
            let dm1 = self.dmin * m1;

            let (sc2, m2) = extract_scale_min(&self.scales, is + 1);
            let d2 = self.d * sc2;
            let dm2 = self.dmin * m2;

            for &byte in q {
                values[out] = d1 * f32::from(byte & 0x0F) - dm1;
                out += 1;
            }
            for &byte in q {
                values[out] = d2 * f32::from(byte >> 4) - dm2;
                out += 1;
            }
        }
        values
    }
}

// ============================================================================
// Q6_K
// ============================================================================

/// `Q6_K` super-block: 256 values at 6.5625 bits per weight
///
/// Layout: 128 bytes of low 4-bit planes, 64 bytes of high 2-bit planes,
/// 16 signed 8-bit sub-block scales, f16 super-scale `d`.
#[derive(Debug, Clone)]
pub struct Q6_KBlock {
    /// Super-block scale
    pub d: f32,
    /// Signed sub-block scales, one per 16 values
    pub scales: [i8; 16],
    /// Low 4 bits of each code
    pub ql: [u8; 128],
    /// High 2 bits of each code, four values per byte
    pub qh: [u8; 64],
}

impl Q6_KBlock {
    /// Quantize 256 values, symmetric per sub-block
    #[must_use]
    pub fn quantize(values: &[f32; QK_K]) -> Self {
        let mut sub_scale = [0.0f32; Q6K_SUB_BLOCKS];
        for (k, chunk) in values.chunks_exact(Q6K_SUB_SIZE).enumerate() {
            let max_abs = chunk.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            sub_scale[k] = max_abs / 31.0;
        }

        let scale_max = sub_scale.iter().copied().fold(0.0f32, f32::max);
        let d = if scale_max > 1e-10 {
            f16_round(scale_max / 127.0)
        } else {
            0.0
        };

        let mut scales = [0i8; Q6K_SUB_BLOCKS];
        if d > 0.0 {
            for (s, &t) in scales.iter_mut().zip(sub_scale.iter()) {
                *s = (t / d).round().clamp(0.0, 127.0) as i8;
            }
        }

        // code = q + 32, q in [-32, 31]
        let code = |v: f32, k: usize| -> u8 {
            let eff = d * f32::from(scales[k]);
            if eff > 0.0 {
                ((v / eff).round().clamp(-32.0, 31.0) + 32.0) as u8
            } else {
                32
            }
        };

        let mut ql = [0u8; 128];
        let mut qh = [0u8; 64];
        for n in (0..QK_K).step_by(128) {
            let idx = n / 128;
            for l in 0..32 {
                let is = l / 16;
                let q1 = code(values[n + l], 8 * idx + is);
                let q2 = code(values[n + l + 32], 8 * idx + is + 2);
                let q3 = code(values[n + l + 64], 8 * idx + is + 4);
                let q4 = code(values[n + l + 96], 8 * idx + is + 6);

                ql[64 * idx + l] = (q1 & 0x0F) | ((q3 & 0x0F) << 4);
                ql[64 * idx + l + 32] = (q2 & 0x0F) | ((q4 & 0x0F) << 4);
                qh[32 * idx + l] =
                    (q1 >> 4) | ((q2 >> 4) << 2) | ((q3 >> 4) << 4) | ((q4 >> 4) << 6);
            }
        }

        Self { d, scales, ql, qh }
    }

    /// Dequantize back to 256 values
    #[must_use]
    pub fn dequantize(&self) -> [f32; QK_K] {
        let mut values = [0.0f32; QK_K];
        for n in (0..QK_K).step_by(128) {
            let idx = n / 128;
            let sc = &self.scales[8 * idx..];
            let ql = &self.ql[64 * idx..];
            let qh = &self.qh[32 * idx..];

            for l in 0..32 {
                let is = l / 16;

                let q1 = i32::from((ql[l] & 0x0F) | ((qh[l] & 3) << 4)) - 32;
                let q2 = i32::from((ql[l + 32] & 0x0F) | (((qh[l] >> 2) & 3) << 4)) - 32;
                let q3 = i32::from((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) - 32;
                let q4 = i32::from((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) - 32;

                values[n + l] = self.d * f32::from(sc[is]) * q1 as f32;
                values[n + l + 32] = self.d * f32::from(sc[is + 2]) * q2 as f32;
                values[n + l + 64] = self.d * f32::from(sc[is + 4]) * q3 as f32;
                values[n + l + 96] = self.d * f32::from(sc[is + 6]) * q4 as f32;
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_superblock() -> [f32; QK_K] {
        let mut values = [0.0f32; QK_K];
        for (i, v) in values.iter_mut().enumerate() {
            *v = ((i as f32) * 0.043).sin() * (1.0 + (i / 32) as f32 * 0.3);
        }
        values
    }

    #[test]
    fn test_scale_min_pack_round_trip() {
        let sc = [0u8, 17, 63, 42, 33, 5, 63, 48];
        let mn = [7u8, 0, 63, 21, 60, 1, 15, 63];
        let packed = pack_scale_min(&sc, &mn);
        for j in 0..8 {
            let (s, m) = extract_scale_min(&packed, j);
            assert_eq!(s, f32::from(sc[j]), "scale {j}");
            assert_eq!(m, f32::from(mn[j]), "min {j}");
        }
    }

    #[test]
    fn test_q4_k_round_trip_within_tolerance() {
        let values = ramp_superblock();
        let block = Q4_KBlock::quantize(&values);
        let restored = block.dequantize();

        for (j, (orig_chunk, deq_chunk)) in values
            .chunks_exact(32)
            .zip(restored.chunks_exact(32))
            .enumerate()
        {
            let vmin = orig_chunk.iter().copied().fold(f32::INFINITY, f32::min);
            let vmax = orig_chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            // Half a 4-bit step plus the 6-bit scale re-quantization error,
            // which scales with the super-block (not sub-block) amplitude
            let tol = (vmax - vmin) * 0.07 + 0.05;
            for (orig, deq) in orig_chunk.iter().zip(deq_chunk.iter()) {
                assert!(
                    (orig - deq).abs() <= tol,
                    "sub-block {j}: {orig} vs {deq} (tol {tol})"
                );
            }
        }
    }

    #[test]
    fn test_q4_k_zero_superblock_dequantizes_to_zeros() {
        let block = Q4_KBlock::quantize(&[0.0; QK_K]);
        assert!(block.dequantize().iter().all(|&v| v == 0.0));
        assert!(!block.dequantize().iter().any(|v| v.is_nan()));
    }

    #[test]
    fn test_q4_k_all_negative_block() {
        let mut values = [0.0f32; QK_K];
        for (i, v) in values.iter_mut().enumerate() {
            *v = -1.0 - (i % 32) as f32 * 0.01;
        }
        let block = Q4_KBlock::quantize(&values);
        let restored = block.dequantize();
        for (orig, deq) in values.iter().zip(restored.iter()) {
            assert!((orig - deq).abs() < 0.08, "{orig} vs {deq}");
        }
    }

    #[test]
    fn test_q6_k_round_trip_within_tolerance() {
        let values = ramp_superblock();
        let block = Q6_KBlock::quantize(&values);
        let restored = block.dequantize();

        for (k, (orig_chunk, deq_chunk)) in values
            .chunks_exact(16)
            .zip(restored.chunks_exact(16))
            .enumerate()
        {
            let max_abs = orig_chunk.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            let tol = max_abs * 0.03 + 0.02;
            for (orig, deq) in orig_chunk.iter().zip(deq_chunk.iter()) {
                assert!(
                    (orig - deq).abs() <= tol,
                    "sub-block {k}: {orig} vs {deq} (tol {tol})"
                );
            }
        }
    }

    #[test]
    fn test_q6_k_zero_superblock_dequantizes_to_zeros() {
        let block = Q6_KBlock::quantize(&[0.0; QK_K]);
        assert_eq!(block.d, 0.0);
        assert!(block.dequantize().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_q6_k_better_than_q4_k() {
        // 6 bits per weight should beat 4 bits on the same data
        let values = ramp_superblock();
        let q4 = Q4_KBlock::quantize(&values).dequantize();
        let q6 = Q6_KBlock::quantize(&values).dequantize();

        let err = |restored: &[f32; QK_K]| -> f32 {
            values
                .iter()
                .zip(restored.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum()
        };
        assert!(err(&q6) < err(&q4));
    }

    #[test]
    fn test_quantize_is_pure() {
        let values = ramp_superblock();
        let a = Q4_KBlock::quantize(&values);
        let b = Q4_KBlock::quantize(&values);
        assert_eq!(a.scales, b.scales);
        assert_eq!(a.qs, b.qs);
        assert_eq!(a.d, b.d);
    }
}
