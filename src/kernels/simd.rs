//! SIMD tier detection and vectorized kernel bodies
//!
//! Hardware capability is probed exactly once, at first use, and cached in a
//! [`std::sync::LazyLock`]. Hot paths branch on the cached [`SimdTier`] and
//! never re-probe. Kernels carry an AVX2 body plus a scalar fallback; the
//! SSE2 and NEON tiers are detected for introspection and currently route to
//! the scalar bodies.
//!
//! Different tiers are numerically equivalent within
//! [`KERNEL_EPSILON`](crate::kernels::KERNEL_EPSILON) relative error, not
//! bit-identical: the AVX2 paths use 8-lane partial sums while the scalar
//! paths accumulate left to right. Within one build and tier, results are
//! bit-reproducible.

use std::sync::LazyLock;

/// SIMD tier detected at startup, widest to narrowest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SimdTier {
    /// AVX2 + FMA (256-bit)
    Avx2,
    /// SSE2 (128-bit)
    Sse2,
    /// ARM NEON (128-bit)
    Neon,
    /// Scalar fallback
    #[default]
    Scalar,
}

impl std::fmt::Display for SimdTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimdTier::Avx2 => write!(f, "AVX2"),
            SimdTier::Sse2 => write!(f, "SSE2"),
            SimdTier::Neon => write!(f, "NEON"),
            SimdTier::Scalar => write!(f, "Scalar"),
        }
    }
}

/// Probe the widest available SIMD tier
///
/// Called once by [`simd_tier`]; callers in the hot path must use the cached
/// value instead.
#[must_use]
pub fn detect_simd_tier() -> SimdTier {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return SimdTier::Avx2;
        }
        if is_x86_feature_detected!("sse2") {
            return SimdTier::Sse2;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return SimdTier::Neon;
    }

    #[allow(unreachable_code)]
    SimdTier::Scalar
}

static SIMD_TIER: LazyLock<SimdTier> = LazyLock::new(detect_simd_tier);

/// The cached SIMD tier for this process
#[inline]
#[must_use]
pub fn simd_tier() -> SimdTier {
    *SIMD_TIER
}

// ============================================================================
// Dot product
// ============================================================================

/// Scalar dot product, sequential left-to-right accumulation
#[inline]
#[must_use]
pub(crate) fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// AVX2+FMA dot product with 8-lane partial sums
///
/// # Safety
///
/// Caller must ensure AVX2 and FMA are available.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    #[allow(clippy::wildcard_imports)]
    use std::arch::x86_64::*;

    let len = a.len().min(b.len());
    let chunks = len / 8;

    let mut acc = _mm256_setzero_ps();
    for i in 0..chunks {
        let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }

    let mut sum = hsum_ps_256(acc);
    for i in (chunks * 8)..len {
        sum += a[i] * b[i];
    }
    sum
}

/// Horizontal sum of 8 f32 lanes in a 256-bit register
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
pub(crate) unsafe fn hsum_ps_256(v: std::arch::x86_64::__m256) -> f32 {
    #[allow(clippy::wildcard_imports)]
    use std::arch::x86_64::*;

    let lo = _mm256_castps256_ps128(v);
    let hi = _mm256_extractf128_ps(v, 1);
    let sum128 = _mm_add_ps(lo, hi);
    let sum64 = _mm_add_ps(sum128, _mm_movehl_ps(sum128, sum128));
    let sum32 = _mm_add_ss(sum64, _mm_shuffle_ps(sum64, sum64, 1));
    _mm_cvtss_f32(sum32)
}

// ============================================================================
// Elementwise bodies
// ============================================================================

/// AVX2 in-place vector addition (a += b)
///
/// # Safety
///
/// Caller must ensure AVX2 is available and slices have equal length.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
pub(crate) unsafe fn vec_add_avx2(a: &mut [f32], b: &[f32]) {
    #[allow(clippy::wildcard_imports)]
    use std::arch::x86_64::*;

    let len = a.len();
    let chunks = len / 8;
    for i in 0..chunks {
        let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
        _mm256_storeu_ps(a.as_mut_ptr().add(i * 8), _mm256_add_ps(va, vb));
    }
    for i in (chunks * 8)..len {
        a[i] += b[i];
    }
}

/// AVX2 in-place elementwise multiplication (a *= b)
///
/// # Safety
///
/// Caller must ensure AVX2 is available and slices have equal length.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
pub(crate) unsafe fn vec_mul_avx2(a: &mut [f32], b: &[f32]) {
    #[allow(clippy::wildcard_imports)]
    use std::arch::x86_64::*;

    let len = a.len();
    let chunks = len / 8;
    for i in 0..chunks {
        let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
        _mm256_storeu_ps(a.as_mut_ptr().add(i * 8), _mm256_mul_ps(va, vb));
    }
    for i in (chunks * 8)..len {
        a[i] *= b[i];
    }
}

/// AVX2 in-place scaling (a *= s)
///
/// # Safety
///
/// Caller must ensure AVX2 is available.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
pub(crate) unsafe fn vec_scale_avx2(a: &mut [f32], s: f32) {
    #[allow(clippy::wildcard_imports)]
    use std::arch::x86_64::*;

    let len = a.len();
    let chunks = len / 8;
    let vs = _mm256_set1_ps(s);
    for i in 0..chunks {
        let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
        _mm256_storeu_ps(a.as_mut_ptr().add(i * 8), _mm256_mul_ps(va, vs));
    }
    for i in (chunks * 8)..len {
        a[i] *= s;
    }
}

// ============================================================================
// Softmax (two-pass vectorized form)
// ============================================================================

/// AVX2 softmax: vectorized max and normalize passes, scalar exp
///
/// Three phases: SIMD max reduction, exp-and-sum (exp stays scalar for
/// accuracy), SIMD normalization.
///
/// # Safety
///
/// Caller must ensure AVX2 is available.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[allow(unsafe_op_in_unsafe_fn)]
pub(crate) unsafe fn softmax_avx2(x: &mut [f32]) {
    #[allow(clippy::wildcard_imports)]
    use std::arch::x86_64::*;

    let len = x.len();
    let chunks = len / 8;

    // Phase 1: max reduction
    let mut max_vec = _mm256_set1_ps(f32::NEG_INFINITY);
    for i in 0..chunks {
        let v = _mm256_loadu_ps(x.as_ptr().add(i * 8));
        max_vec = _mm256_max_ps(max_vec, v);
    }
    let max128 = _mm_max_ps(
        _mm256_castps256_ps128(max_vec),
        _mm256_extractf128_ps(max_vec, 1),
    );
    let max64 = _mm_max_ps(max128, _mm_movehl_ps(max128, max128));
    let max32 = _mm_max_ss(max64, _mm_shuffle_ps(max64, max64, 1));
    let mut max_val = _mm_cvtss_f32(max32);
    for &v in &x[chunks * 8..] {
        max_val = max_val.max(v);
    }

    // Phase 2: exp(x - max) and sum
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }

    // Phase 3: normalize
    let inv_sum = 1.0 / sum;
    let inv_vec = _mm256_set1_ps(inv_sum);
    for i in 0..chunks {
        let v = _mm256_loadu_ps(x.as_ptr().add(i * 8));
        _mm256_storeu_ps(x.as_mut_ptr().add(i * 8), _mm256_mul_ps(v, inv_vec));
    }
    for v in &mut x[chunks * 8..] {
        *v *= inv_sum;
    }
}
