//! Compute kernel library
//!
//! Elementwise, activation, normalization, softmax, and matrix-multiply
//! primitives over contiguous `f32` buffers. Output goes in place or to a
//! caller-supplied destination; nothing allocates on the success path except
//! the `Vec`-returning convenience wrappers.
//!
//! ## Dispatch
//!
//! Two levels of selection, both resolved cheaply:
//!
//! 1. **Hardware tier** — probed once at startup ([`simd_tier`]), cached,
//!    branched on per call. No per-call feature detection.
//! 2. **Operand size** — within a tier, kernels compare operand size against
//!    the tuned constants in [`KernelConfig`]: matrix multiply switches from
//!    a direct to a cache-tiled strategy, elementwise and softmax kernels
//!    switch between single-pass scalar and two-pass vectorized forms.
//!
//! ## Determinism
//!
//! Matrix multiply accumulates each output element over `k` in a fixed
//! sequential order regardless of strategy, so repeated runs on the same
//! build are bit-reproducible. Across tiers, results agree within
//! [`KERNEL_EPSILON`] relative error.

pub mod simd;

pub use simd::{detect_simd_tier, simd_tier, SimdTier};

use crate::error::{InferirError, Result};

/// Relative tolerance treated as "equivalent" between SIMD code paths
///
/// Different tiers reorder floating-point accumulation, so cross-tier
/// results are epsilon-equal rather than bit-identical.
pub const KERNEL_EPSILON: f32 = 1e-5;

/// Tuned crossover thresholds for kernel strategy selection
///
/// Named, overridable constants rather than scattered literals, so tuning
/// and regression testing can pin them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Output-element count above which matmul switches to the tiled strategy
    pub matmul_tile_threshold: usize,
    /// Column tile width for the cache-tiled matmul strategy
    pub tile_size: usize,
    /// Minimum length before vectorized two-pass forms pay for themselves
    pub vectorize_min_len: usize,
    /// Minimum row count before row-parallel kernels engage the worker pool
    pub parallel_min_rows: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            matmul_tile_threshold: 64 * 64,
            tile_size: 64,
            vectorize_min_len: 32,
            parallel_min_rows: 64,
        }
    }
}

// ============================================================================
// Elementwise operations
// ============================================================================

/// In-place vector addition (a += b)
///
/// # Panics
///
/// Panics on length mismatch: an internal contract violation, not a
/// recoverable condition.
#[inline]
pub fn vec_add(a: &mut [f32], b: &[f32]) {
    assert_eq!(a.len(), b.len(), "vec_add: length mismatch");
    #[cfg(target_arch = "x86_64")]
    if simd_tier() == SimdTier::Avx2 && a.len() >= KernelConfig::default().vectorize_min_len {
        // SAFETY: AVX2 tier implies the features are available
        unsafe { simd::vec_add_avx2(a, b) };
        return;
    }
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += y;
    }
}

/// In-place elementwise multiplication (a *= b)
///
/// # Panics
///
/// Panics on length mismatch.
#[inline]
pub fn vec_mul(a: &mut [f32], b: &[f32]) {
    assert_eq!(a.len(), b.len(), "vec_mul: length mismatch");
    #[cfg(target_arch = "x86_64")]
    if simd_tier() == SimdTier::Avx2 && a.len() >= KernelConfig::default().vectorize_min_len {
        // SAFETY: AVX2 tier implies the features are available
        unsafe { simd::vec_mul_avx2(a, b) };
        return;
    }
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x *= y;
    }
}

/// In-place scalar multiplication (a *= s)
#[inline]
pub fn vec_scale(a: &mut [f32], s: f32) {
    #[cfg(target_arch = "x86_64")]
    if simd_tier() == SimdTier::Avx2 && a.len() >= KernelConfig::default().vectorize_min_len {
        // SAFETY: AVX2 tier implies the features are available
        unsafe { simd::vec_scale_avx2(a, s) };
        return;
    }
    for x in a.iter_mut() {
        *x *= s;
    }
}

/// Dot product with tier dispatch
///
/// # Panics
///
/// Panics on length mismatch.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "dot: length mismatch");
    #[cfg(target_arch = "x86_64")]
    if simd_tier() == SimdTier::Avx2 && a.len() >= 8 {
        // SAFETY: AVX2 tier implies the features are available
        return unsafe { simd::dot_avx2(a, b) };
    }
    simd::dot_scalar(a, b)
}

// ============================================================================
// Activations
// ============================================================================

/// ReLU activation, in place
#[inline]
pub fn relu(data: &mut [f32]) {
    for x in data.iter_mut() {
        *x = x.max(0.0);
    }
}

/// GELU activation (tanh approximation), in place
///
/// GELU(x) ≈ 0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 * x³)))
#[inline]
pub fn gelu(data: &mut [f32]) {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    const C: f32 = 0.044_715;

    for x in data.iter_mut() {
        let inner = SQRT_2_OVER_PI * (*x + C * *x * *x * *x);
        *x = 0.5 * *x * (1.0 + inner.tanh());
    }
}

/// SiLU (Swish) activation, in place
///
/// SiLU(x) = x * sigmoid(x) = x / (1 + exp(-x))
#[inline]
pub fn silu(data: &mut [f32]) {
    for x in data.iter_mut() {
        *x = *x / (1.0 + (-*x).exp());
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// RMSNorm to a pre-allocated buffer
///
/// output = x / sqrt(mean(x²) + eps) * weight
///
/// # Panics
///
/// Panics if `output` or `input` are shorter than `weight`.
pub fn rms_norm_into(input: &[f32], weight: &[f32], eps: f32, output: &mut [f32]) {
    let hidden_dim = weight.len();
    let x = &input[..hidden_dim];

    let sum_sq: f32 = x.iter().map(|v| v * v).sum();
    let inv_rms = 1.0 / (sum_sq / hidden_dim as f32 + eps).sqrt();

    for j in 0..hidden_dim {
        output[j] = x[j] * inv_rms * weight[j];
    }
}

/// RMSNorm over one or more rows of `weight.len()` elements
#[must_use]
pub fn rms_norm(input: &[f32], weight: &[f32], eps: f32) -> Vec<f32> {
    let hidden_dim = weight.len();
    let mut output = vec![0.0; input.len()];
    for (row_in, row_out) in input
        .chunks_exact(hidden_dim)
        .zip(output.chunks_exact_mut(hidden_dim))
    {
        rms_norm_into(row_in, weight, eps, row_out);
    }
    output
}

/// LayerNorm to a pre-allocated buffer
///
/// output = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
///
/// # Panics
///
/// Panics if `output` or `input` are shorter than `weight`.
pub fn layer_norm_into(
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    eps: f32,
    output: &mut [f32],
) {
    let hidden_dim = weight.len();
    let x = &input[..hidden_dim];

    let mean: f32 = x.iter().sum::<f32>() / hidden_dim as f32;
    let var: f32 = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / hidden_dim as f32;
    let inv_std = 1.0 / (var + eps).sqrt();

    for j in 0..hidden_dim {
        output[j] = (x[j] - mean) * inv_std * weight[j];
        if let Some(b) = bias {
            output[j] += b[j];
        }
    }
}

/// LayerNorm over one or more rows of `weight.len()` elements
#[must_use]
pub fn layer_norm(input: &[f32], weight: &[f32], bias: Option<&[f32]>, eps: f32) -> Vec<f32> {
    let hidden_dim = weight.len();
    let mut output = vec![0.0; input.len()];
    for (row_in, row_out) in input
        .chunks_exact(hidden_dim)
        .zip(output.chunks_exact_mut(hidden_dim))
    {
        layer_norm_into(row_in, weight, bias, eps, row_out);
    }
    output
}

// ============================================================================
// Softmax
// ============================================================================

/// Numerically stable softmax, in place, with tuned strategy selection
///
/// Subtracts the max before exponentiation and fuses the exp-and-sum pass.
/// Below `config.vectorize_min_len` (or off the AVX2 tier) a single-pass
/// scalar form runs; above it, the two-pass vectorized form.
pub fn softmax_with(x: &mut [f32], config: &KernelConfig) {
    if x.is_empty() {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    if simd_tier() == SimdTier::Avx2 && x.len() >= config.vectorize_min_len {
        // SAFETY: AVX2 tier implies the features are available
        unsafe { simd::softmax_avx2(x) };
        return;
    }
    let _ = config;

    softmax_scalar(x);
}

/// Numerically stable softmax with default thresholds
pub fn softmax(x: &mut [f32]) {
    softmax_with(x, &KernelConfig::default());
}

fn softmax_scalar(x: &mut [f32]) {
    let max_val = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }

    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for v in x.iter_mut() {
            *v *= inv_sum;
        }
    }
}

/// Causal softmax: normalize the first `valid` entries, zero the rest
///
/// Masked positions never enter the exponential at all; the result matches
/// softmaxing the full row with `-inf` at masked positions and then zeroing
/// them.
///
/// # Panics
///
/// Panics if `valid > x.len()`.
pub fn causal_softmax(x: &mut [f32], valid: usize) {
    assert!(valid <= x.len(), "causal_softmax: valid past end");
    let (live, masked) = x.split_at_mut(valid);
    softmax(live);
    for v in masked.iter_mut() {
        *v = 0.0;
    }
}

// ============================================================================
// Matrix multiply
// ============================================================================

/// Matrix-vector product: out = W·x, with W stored row-major [out_dim × in_dim]
///
/// Rows are processed in cache-friendly tiles; each row reduces to a tier-
/// dispatched dot product.
///
/// # Errors
///
/// Returns `InvalidShape` when operand lengths disagree with the dimensions.
pub fn matvec_into(
    weight: &[f32],
    x: &[f32],
    in_dim: usize,
    out_dim: usize,
    output: &mut [f32],
) -> Result<()> {
    if weight.len() != in_dim * out_dim || x.len() != in_dim || output.len() != out_dim {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "matvec: weight {}, input {}, output {} vs dims [{out_dim} x {in_dim}]",
                weight.len(),
                x.len(),
                output.len()
            ),
        });
    }

    let tile = KernelConfig::default().tile_size;
    for tile_start in (0..out_dim).step_by(tile) {
        let tile_end = (tile_start + tile).min(out_dim);
        for row in tile_start..tile_end {
            output[row] = dot(&weight[row * in_dim..(row + 1) * in_dim], x);
        }
    }
    Ok(())
}

/// Allocating wrapper around [`matvec_into`]
///
/// # Errors
///
/// Returns `InvalidShape` when operand lengths disagree with the dimensions.
pub fn matvec(weight: &[f32], x: &[f32], in_dim: usize, out_dim: usize) -> Result<Vec<f32>> {
    let mut output = vec![0.0; out_dim];
    matvec_into(weight, x, in_dim, out_dim, &mut output)?;
    Ok(output)
}

/// General matrix multiply: C[m,n] = A[m,k] · B[k,n], with strategy selection
///
/// Below `config.matmul_tile_threshold` output elements the direct
/// triple-loop form runs; above it, a cache-tiled form that reuses each
/// `A[i][k]` across a tile of columns. Both accumulate each output element
/// over `k` in the same fixed order, so the strategies are bit-identical.
///
/// # Errors
///
/// Returns `InvalidShape` when operand lengths disagree with the dimensions.
pub fn matmul_with(
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
    config: &KernelConfig,
) -> Result<Vec<f32>> {
    if a.len() != m * k || b.len() != k * n {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "matmul: A has {} elements, B has {}, dims [{m} x {k}] x [{k} x {n}]",
                a.len(),
                b.len()
            ),
        });
    }

    let mut c = vec![0.0f32; m * n];

    if m * n <= config.matmul_tile_threshold {
        // Direct form: fine for small outputs, strided reads of B
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0f32;
                for kk in 0..k {
                    sum += a[i * k + kk] * b[kk * n + j];
                }
                c[i * n + j] = sum;
            }
        }
    } else {
        // Tiled form: axpy over a column tile keeps B accesses contiguous.
        // Per output element the k loop still runs 0..k sequentially.
        for jt in (0..n).step_by(config.tile_size) {
            let jt_end = (jt + config.tile_size).min(n);
            for i in 0..m {
                for kk in 0..k {
                    let aik = a[i * k + kk];
                    let b_row = &b[kk * n + jt..kk * n + jt_end];
                    let c_row = &mut c[i * n + jt..i * n + jt_end];
                    for (cv, bv) in c_row.iter_mut().zip(b_row.iter()) {
                        *cv += aik * bv;
                    }
                }
            }
        }
    }

    Ok(c)
}

/// Matrix multiply with default thresholds
///
/// # Errors
///
/// Returns `InvalidShape` when operand lengths disagree with the dimensions.
pub fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
    matmul_with(a, b, m, k, n, &KernelConfig::default())
}

/// Transposed-right-operand multiply: C[m,n] = A[m,k] · Bᵗ where B is [n,k]
///
/// Both operands are read row-major, which makes this the natural form for
/// attention scores (Q · Kᵗ with K stored position-major).
///
/// # Errors
///
/// Returns `InvalidShape` when operand lengths disagree with the dimensions.
pub fn matmul_transb(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
    if a.len() != m * k || b.len() != n * k {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "matmul_transb: A has {} elements, B has {}, dims [{m} x {k}] x [{n} x {k}]ᵗ",
                a.len(),
                b.len()
            ),
        });
    }

    let mut c = vec![0.0f32; m * n];
    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            c[i * n + j] = dot(a_row, &b[j * k..(j + 1) * k]);
        }
    }
    Ok(c)
}

/// Index of the maximum value (greedy decoding)
#[inline]
#[must_use]
pub fn argmax(logits: &[f32]) -> u32 {
    let mut max_idx = 0u32;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &val) in logits.iter().enumerate() {
        if val > max_val {
            max_val = val;
            max_idx = i as u32;
        }
    }
    max_idx
}
