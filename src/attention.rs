//! Causal self-attention over cached key/value prefixes
//!
//! Two entry points: [`attention_step`] attends one new position against the
//! cached prefix plus its own key/value (the incremental decode path), and
//! [`attention_prefill`] attends a whole prompt causally in one call (the
//! recompute path; also the reference the cache path is tested against).
//!
//! Grouped-query attention broadcasts one cached kv stream across the query
//! heads mapped to it; the mapping is fixed by the head counts. Scratch is
//! rented from the workspace pool and sized to the current sequence length,
//! not the capacity. Heads are independent, so above a small head count they
//! run on the rayon worker pool.

use rayon::prelude::*;

use crate::cache::KvCache;
use crate::error::{InferirError, Result};
use crate::kernels::{causal_softmax, dot, softmax};
use crate::pool::BufferPool;

/// Head count at and above which heads run in parallel
const PARALLEL_HEAD_THRESHOLD: usize = 4;

/// Cached kv stream serving query head `query_head`
///
/// Fixed at model configuration: consecutive runs of
/// `n_heads / n_kv_heads` query heads share one kv head.
#[inline]
#[must_use]
pub fn kv_head_for_query(query_head: usize, n_heads: usize, n_kv_heads: usize) -> usize {
    query_head / (n_heads / n_kv_heads)
}

fn check_group(n_heads: usize, n_kv_heads: usize) -> Result<()> {
    if n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
        return Err(InferirError::InvalidConfiguration {
            reason: format!("{n_heads} query heads not divisible into {n_kv_heads} kv heads"),
        });
    }
    Ok(())
}

/// One head attending `total` positions; `current` is the position being
/// decoded, appended after the cached prefix
fn attend_head(
    q: &[f32],
    cached_keys: &[f32],
    cached_values: &[f32],
    current_k: &[f32],
    current_v: &[f32],
    head_dim: usize,
    scale: f32,
    scores: &mut [f32],
    out: &mut [f32],
) {
    let prefix_len = cached_keys.len() / head_dim;
    for j in 0..prefix_len {
        scores[j] = dot(q, &cached_keys[j * head_dim..(j + 1) * head_dim]) * scale;
    }
    scores[prefix_len] = dot(q, current_k) * scale;

    softmax(scores);

    out.fill(0.0);
    for j in 0..prefix_len {
        let p = scores[j];
        let v = &cached_values[j * head_dim..(j + 1) * head_dim];
        for (o, &vv) in out.iter_mut().zip(v.iter()) {
            *o += p * vv;
        }
    }
    let p = scores[prefix_len];
    for (o, &vv) in out.iter_mut().zip(current_v.iter()) {
        *o += p * vv;
    }
}

/// Attend the position currently being decoded against the cached prefix
///
/// `query` is `[n_heads × head_dim]`; `current_k` / `current_v` are this
/// position's projections, `[n_kv_heads × head_dim]`, not yet appended to
/// the cache. Returns `[n_heads × head_dim]`.
///
/// # Errors
///
/// Returns `InvalidLayer` for an out-of-range layer, `InvalidShape` on
/// operand length disagreement, `InvalidConfiguration` for a head-count
/// mismatch.
#[allow(clippy::too_many_arguments)]
pub fn attention_step(
    query: &[f32],
    current_k: &[f32],
    current_v: &[f32],
    cache: &KvCache,
    layer: usize,
    n_heads: usize,
    pool: &BufferPool,
) -> Result<Vec<f32>> {
    let n_kv_heads = cache.config().num_kv_heads;
    let head_dim = cache.config().head_dim;
    check_group(n_heads, n_kv_heads)?;

    if query.len() != n_heads * head_dim
        || current_k.len() != n_kv_heads * head_dim
        || current_v.len() != n_kv_heads * head_dim
    {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "attention step: query {}, k {}, v {} vs {n_heads}/{n_kv_heads} heads of {head_dim}",
                query.len(),
                current_k.len(),
                current_v.len()
            ),
        });
    }

    let keys: Vec<&[f32]> = (0..n_kv_heads)
        .map(|h| cache.keys(layer, h))
        .collect::<Result<_>>()?;
    let values: Vec<&[f32]> = (0..n_kv_heads)
        .map(|h| cache.values(layer, h))
        .collect::<Result<_>>()?;

    let total = cache.len() + 1;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut output = vec![0.0f32; n_heads * head_dim];

    let run_head = |head: usize, out: &mut [f32]| {
        let kv_head = kv_head_for_query(head, n_heads, n_kv_heads);
        let mut scores = pool.rent(total);
        attend_head(
            &query[head * head_dim..(head + 1) * head_dim],
            keys[kv_head],
            values[kv_head],
            &current_k[kv_head * head_dim..(kv_head + 1) * head_dim],
            &current_v[kv_head * head_dim..(kv_head + 1) * head_dim],
            head_dim,
            scale,
            &mut scores,
            out,
        );
    };

    if n_heads >= PARALLEL_HEAD_THRESHOLD {
        output
            .par_chunks_mut(head_dim)
            .enumerate()
            .for_each(|(head, out)| run_head(head, out));
    } else {
        for (head, out) in output.chunks_mut(head_dim).enumerate() {
            run_head(head, out);
        }
    }

    Ok(output)
}

/// Full causal attention over a prompt
///
/// `queries` is `[seq_len × n_heads × head_dim]`; `keys` / `values` are
/// `[seq_len × n_kv_heads × head_dim]`. Position `i` attends positions
/// `j ≤ i` only. Returns `[seq_len × n_heads × head_dim]`.
///
/// # Errors
///
/// Returns `InvalidShape` on operand length disagreement,
/// `InvalidConfiguration` for a head-count mismatch.
#[allow(clippy::too_many_arguments)]
pub fn attention_prefill(
    queries: &[f32],
    keys: &[f32],
    values: &[f32],
    seq_len: usize,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    pool: &BufferPool,
) -> Result<Vec<f32>> {
    check_group(n_heads, n_kv_heads)?;
    if queries.len() != seq_len * n_heads * head_dim
        || keys.len() != seq_len * n_kv_heads * head_dim
        || values.len() != seq_len * n_kv_heads * head_dim
    {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "attention prefill: query {}, k {}, v {} vs seq {seq_len}",
                queries.len(),
                keys.len(),
                values.len()
            ),
        });
    }

    let scale = 1.0 / (head_dim as f32).sqrt();
    let q_stride = n_heads * head_dim;
    let kv_stride = n_kv_heads * head_dim;
    let mut output = vec![0.0f32; seq_len * n_heads * head_dim];

    let run_head = |head: usize, out_head: &mut [f32]| {
        let kv_head = kv_head_for_query(head, n_heads, n_kv_heads);
        let mut scores = pool.rent(seq_len);
        for i in 0..seq_len {
            let q = &queries[i * q_stride + head * head_dim..][..head_dim];
            for j in 0..=i {
                let k = &keys[j * kv_stride + kv_head * head_dim..][..head_dim];
                scores[j] = dot(q, k) * scale;
            }
            // Masked tail is never exponentiated, only zeroed
            causal_softmax(&mut scores, i + 1);

            let out = &mut out_head[i * head_dim..(i + 1) * head_dim];
            out.fill(0.0);
            for j in 0..=i {
                let p = scores[j];
                let v = &values[j * kv_stride + kv_head * head_dim..][..head_dim];
                for (o, &vv) in out.iter_mut().zip(v.iter()) {
                    *o += p * vv;
                }
            }
        }
    };

    // Per-head contiguous staging keeps the parallel split disjoint
    let mut staged: Vec<_> = (0..n_heads).map(|_| pool.rent(seq_len * head_dim)).collect();
    if n_heads >= PARALLEL_HEAD_THRESHOLD {
        staged
            .par_iter_mut()
            .enumerate()
            .for_each(|(head, out_head)| run_head(head, out_head));
    } else {
        for (head, out_head) in staged.iter_mut().enumerate() {
            run_head(head, out_head);
        }
    }

    for (head, out_head) in staged.iter().enumerate() {
        for i in 0..seq_len {
            output[i * q_stride + head * head_dim..][..head_dim]
                .copy_from_slice(&out_head[i * head_dim..(i + 1) * head_dim]);
        }
    }

    Ok(output)
}
