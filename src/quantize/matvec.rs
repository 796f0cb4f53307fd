//! Fused quantized matrix-vector products
//!
//! Dots quantized weight rows directly against f32 activations without
//! materializing the dequantized matrix. Per block the integer codes are
//! accumulated first and the scale applied once, so the fused result matches
//! dequantize-then-dot exactly.
//!
//! Above [`KernelConfig::parallel_min_rows`](crate::kernels::KernelConfig)
//! output rows, rows are computed on the rayon worker pool; rows are
//! independent, so scheduling cannot change the result.

use rayon::prelude::*;

use super::{Q4_0Block, Q8_0Block, BLOCK_SIZE};
use crate::error::{InferirError, Result};
use crate::kernels::KernelConfig;

fn check_dims(num_blocks: usize, x_len: usize, in_dim: usize, out_dim: usize) -> Result<()> {
    if in_dim % BLOCK_SIZE != 0 {
        return Err(InferirError::FormatError {
            reason: format!("fused matvec requires in_dim multiple of {BLOCK_SIZE}, got {in_dim}"),
        });
    }
    let expected = out_dim * in_dim / BLOCK_SIZE;
    if num_blocks != expected || x_len != in_dim {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "fused matvec: {num_blocks} blocks, input {x_len} vs dims [{out_dim} x {in_dim}]"
            ),
        });
    }
    Ok(())
}

/// One Q8_0 row dotted against f32 activations
#[inline]
fn dot_row_q8_0(row_blocks: &[Q8_0Block], x: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (block, x_chunk) in row_blocks.iter().zip(x.chunks_exact(BLOCK_SIZE)) {
        let mut partial = 0.0f32;
        for (&q, &xv) in block.quants.iter().zip(x_chunk.iter()) {
            partial += f32::from(q) * xv;
        }
        sum += block.scale * partial;
    }
    sum
}

/// One Q4_0 row dotted against f32 activations
///
/// Low nibbles pair with positions 0-15 of each 32-chunk, high nibbles with
/// positions 16-31.
#[inline]
fn dot_row_q4_0(row_blocks: &[Q4_0Block], x: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (block, x_chunk) in row_blocks.iter().zip(x.chunks_exact(BLOCK_SIZE)) {
        let mut partial = 0.0f32;
        for (j, &byte) in block.quants.iter().enumerate() {
            partial += (f32::from(byte & 0x0F) - 8.0) * x_chunk[j];
            partial += (f32::from(byte >> 4) - 8.0) * x_chunk[j + 16];
        }
        sum += block.scale * partial;
    }
    sum
}

/// Fused Q8_0 matvec into a pre-allocated output
///
/// `blocks` holds `out_dim` rows of `in_dim / 32` blocks each, row-major.
///
/// # Errors
///
/// Returns `FormatError` if `in_dim` is not a multiple of the block size,
/// `InvalidShape` on any other dimension disagreement.
pub fn matvec_q8_0_into(
    blocks: &[Q8_0Block],
    x: &[f32],
    in_dim: usize,
    out_dim: usize,
    output: &mut [f32],
) -> Result<()> {
    check_dims(blocks.len(), x.len(), in_dim, out_dim)?;
    if output.len() != out_dim {
        return Err(InferirError::InvalidShape {
            reason: format!("fused matvec: output {} vs out_dim {out_dim}", output.len()),
        });
    }

    let blocks_per_row = in_dim / BLOCK_SIZE;
    if out_dim >= KernelConfig::default().parallel_min_rows {
        output.par_iter_mut().enumerate().for_each(|(row, out)| {
            *out = dot_row_q8_0(
                &blocks[row * blocks_per_row..(row + 1) * blocks_per_row],
                x,
            );
        });
    } else {
        for (row, out) in output.iter_mut().enumerate() {
            *out = dot_row_q8_0(
                &blocks[row * blocks_per_row..(row + 1) * blocks_per_row],
                x,
            );
        }
    }
    Ok(())
}

/// Allocating wrapper around [`matvec_q8_0_into`]
///
/// # Errors
///
/// Returns `FormatError` if `in_dim` is not a multiple of the block size,
/// `InvalidShape` on any other dimension disagreement.
pub fn matvec_q8_0(
    blocks: &[Q8_0Block],
    x: &[f32],
    in_dim: usize,
    out_dim: usize,
) -> Result<Vec<f32>> {
    let mut output = vec![0.0; out_dim];
    matvec_q8_0_into(blocks, x, in_dim, out_dim, &mut output)?;
    Ok(output)
}

/// Fused Q4_0 matvec
///
/// # Errors
///
/// Returns `FormatError` if `in_dim` is not a multiple of the block size,
/// `InvalidShape` on any other dimension disagreement.
pub fn matvec_q4_0(
    blocks: &[Q4_0Block],
    x: &[f32],
    in_dim: usize,
    out_dim: usize,
) -> Result<Vec<f32>> {
    check_dims(blocks.len(), x.len(), in_dim, out_dim)?;

    let blocks_per_row = in_dim / BLOCK_SIZE;
    let mut output = vec![0.0f32; out_dim];
    if out_dim >= KernelConfig::default().parallel_min_rows {
        output.par_iter_mut().enumerate().for_each(|(row, out)| {
            *out = dot_row_q4_0(
                &blocks[row * blocks_per_row..(row + 1) * blocks_per_row],
                x,
            );
        });
    } else {
        for (row, out) in output.iter_mut().enumerate() {
            *out = dot_row_q4_0(
                &blocks[row * blocks_per_row..(row + 1) * blocks_per_row],
                x,
            );
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::{dequantize_q8_0, quantize_q4_0, quantize_q8_0};

    fn weights(rows: usize, cols: usize) -> Vec<f32> {
        (0..rows * cols)
            .map(|i| ((i as f32) * 0.17).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_fused_q8_0_matches_dequantized_matvec() {
        let (in_dim, out_dim) = (64, 8);
        let w = weights(out_dim, in_dim);
        let x: Vec<f32> = (0..in_dim).map(|i| (i as f32 * 0.11).cos()).collect();

        let blocks = quantize_q8_0(&w).unwrap();
        let fused = matvec_q8_0(&blocks, &x, in_dim, out_dim).unwrap();

        let dequant = dequantize_q8_0(&blocks);
        let reference = crate::kernels::matvec(&dequant, &x, in_dim, out_dim).unwrap();

        for (f, r) in fused.iter().zip(reference.iter()) {
            assert!((f - r).abs() < 1e-4, "fused {f} vs reference {r}");
        }
    }

    #[test]
    fn test_fused_q4_0_approximates_full_precision() {
        let (in_dim, out_dim) = (32, 4);
        let w = weights(out_dim, in_dim);
        let x: Vec<f32> = (0..in_dim).map(|i| (i as f32 * 0.07).sin()).collect();

        let blocks = quantize_q4_0(&w).unwrap();
        let fused = matvec_q4_0(&blocks, &x, in_dim, out_dim).unwrap();
        let exact = crate::kernels::matvec(&w, &x, in_dim, out_dim).unwrap();

        // 4-bit quantization error, not kernel error
        for (f, e) in fused.iter().zip(exact.iter()) {
            assert!((f - e).abs() < 0.8, "fused {f} vs exact {e}");
        }
    }

    #[test]
    fn test_parallel_rows_match_sequential() {
        // 128 rows engages the rayon path under default thresholds
        let (in_dim, out_dim) = (64, 128);
        let w = weights(out_dim, in_dim);
        let x: Vec<f32> = (0..in_dim).map(|i| i as f32 * 0.01).collect();
        let blocks = quantize_q8_0(&w).unwrap();

        let parallel = matvec_q8_0(&blocks, &x, in_dim, out_dim).unwrap();
        let blocks_per_row = in_dim / BLOCK_SIZE;
        let sequential: Vec<f32> = (0..out_dim)
            .map(|row| dot_row_q8_0(&blocks[row * blocks_per_row..(row + 1) * blocks_per_row], &x))
            .collect();

        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_dimension_validation() {
        let blocks = quantize_q8_0(&weights(2, 32)).unwrap();
        // in_dim not a block multiple
        assert!(matches!(
            matvec_q8_0(&blocks, &[0.0; 33], 33, 2).unwrap_err(),
            InferirError::FormatError { .. }
        ));
        // wrong activation length
        assert!(matches!(
            matvec_q8_0(&blocks, &[0.0; 64], 32, 2).unwrap_err(),
            InferirError::InvalidShape { .. }
        ));
        // wrong block count
        assert!(matvec_q8_0(&blocks, &[0.0; 32], 32, 3).is_err());
    }
}
