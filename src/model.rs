//! Minimal transformer model and forward pass
//!
//! Consumes a [`WeightSource`] of named tensors (container parsing happens
//! elsewhere; only in-memory descriptors arrive here) and runs the standard
//! decoder stack: embeddings, per-layer norm → QKV (+RoPE) → cached causal
//! attention → output projection and residual → norm → gated FFN and
//! residual, then final norm and vocab projection.
//!
//! Normalization and activation variants are tagged enums resolved at
//! construction, keeping the per-token path monomorphic. Projections are
//! either dense f32 or fused Q8_0, chosen per tensor by what the weight
//! source provides.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::attention::{attention_prefill, attention_step};
use crate::cache::{KvCache, KvCacheConfig};
use crate::error::{InferirError, Result};
use crate::kernels::{gelu, layer_norm_into, matvec_into, rms_norm_into, silu, vec_add, vec_mul};
use crate::pool::BufferPool;
use crate::quantize::{matvec_q8_0_into, Q8_0Block, BLOCK_SIZE};
use crate::tensor::Tensor;

/// Normalization variant, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    /// Root-mean-square norm (no mean subtraction)
    RmsNorm,
    /// Full LayerNorm (mean and variance)
    LayerNorm,
}

/// FFN activation variant, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
    /// SiLU gate (SwiGLU-style FFN)
    Silu,
    /// GELU gate
    Gelu,
}

/// Model geometry and numeric settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Transformer layer count
    pub num_layers: usize,
    /// Residual stream width
    pub hidden_dim: usize,
    /// Query head count
    pub num_heads: usize,
    /// Key/value head count (grouped-query when < `num_heads`)
    pub num_kv_heads: usize,
    /// FFN inner width
    pub ffn_dim: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum context length
    pub max_context: usize,
    /// Normalization variant
    pub norm: NormKind,
    /// FFN activation variant
    pub activation: ActivationKind,
    /// Normalization epsilon
    pub norm_eps: f32,
    /// RoPE base frequency
    pub rope_theta: f32,
}

impl ModelConfig {
    /// Per-head dimension
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.num_heads
    }

    /// Key/value projection width
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim()
    }

    /// Check the geometry once, at construction
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0
            || self.hidden_dim == 0
            || self.num_heads == 0
            || self.num_kv_heads == 0
            || self.ffn_dim == 0
            || self.vocab_size == 0
            || self.max_context == 0
        {
            return Err(InferirError::InvalidConfiguration {
                reason: "model geometry has a zero dimension".to_string(),
            });
        }
        if self.hidden_dim % self.num_heads != 0 {
            return Err(InferirError::InvalidConfiguration {
                reason: format!(
                    "hidden_dim {} not divisible by {} heads",
                    self.hidden_dim, self.num_heads
                ),
            });
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(InferirError::InvalidConfiguration {
                reason: format!(
                    "{} heads not divisible into {} kv heads",
                    self.num_heads, self.num_kv_heads
                ),
            });
        }
        if !self.norm_eps.is_finite() || self.norm_eps <= 0.0 {
            return Err(InferirError::InvalidConfiguration {
                reason: format!("norm_eps must be positive, got {}", self.norm_eps),
            });
        }
        Ok(())
    }

    /// Cache geometry for this model at the given capacity
    #[must_use]
    pub fn kv_cache_config(&self, capacity: usize) -> KvCacheConfig {
        KvCacheConfig {
            num_layers: self.num_layers,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim(),
            capacity,
        }
    }
}

// ============================================================================
// Weight source
// ============================================================================

/// Tensor payload as delivered by a weight source
#[derive(Debug, Clone)]
pub enum WeightData {
    /// Full-precision weights
    F32(Vec<f32>),
    /// Q8_0 blocks, row-major
    Q8_0(Vec<Q8_0Block>),
}

/// One named tensor: shape metadata plus payload
#[derive(Debug, Clone)]
pub struct WeightTensor {
    /// Row-major shape, `[out_dim, in_dim]` for projections
    pub shape: Vec<usize>,
    /// Payload
    pub data: WeightData,
}

/// Source of named model tensors
///
/// Implementations hold already-parsed, in-memory descriptors; this crate
/// never touches files or the network.
pub trait WeightSource {
    /// Fetch a tensor by name
    ///
    /// # Errors
    ///
    /// Returns `MissingTensor` if the source has no tensor of that name.
    fn tensor(&self, name: &str) -> Result<WeightTensor>;
}

/// In-memory weight source backed by a map
#[derive(Debug, Default)]
pub struct MapWeightSource {
    tensors: HashMap<String, WeightTensor>,
}

impl MapWeightSource {
    /// Empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tensor
    pub fn insert(&mut self, name: impl Into<String>, tensor: WeightTensor) {
        self.tensors.insert(name.into(), tensor);
    }
}

impl WeightSource for MapWeightSource {
    fn tensor(&self, name: &str) -> Result<WeightTensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| InferirError::MissingTensor {
                name: name.to_string(),
            })
    }
}

// ============================================================================
// Projections
// ============================================================================

/// A linear projection, dense or fused-quantized
#[derive(Debug, Clone)]
pub enum Linear {
    /// Dense f32 weights, shape `[out_dim, in_dim]`
    Dense {
        /// Weight matrix
        weight: Tensor<f32>,
    },
    /// Q8_0 blocks dotted against f32 activations without dequantizing
    Quant8 {
        /// Row-major blocks, `in_dim / 32` per row
        blocks: Vec<Q8_0Block>,
        /// Input width
        in_dim: usize,
        /// Output width
        out_dim: usize,
    },
}

impl Linear {
    /// Build from a weight tensor, checking the declared shape
    ///
    /// # Errors
    ///
    /// Returns `DataShapeMismatch` when the tensor disagrees with the
    /// expected dimensions, `FormatError` for a quantized tensor whose input
    /// width is not a block multiple.
    pub fn from_tensor(tensor: WeightTensor, in_dim: usize, out_dim: usize) -> Result<Self> {
        if tensor.shape != [out_dim, in_dim] {
            return Err(InferirError::DataShapeMismatch {
                data_size: tensor.shape.iter().product(),
                shape: tensor.shape,
                expected: out_dim * in_dim,
            });
        }
        match tensor.data {
            WeightData::F32(weight) => {
                // Tensor construction rechecks the payload length
                let weight = Tensor::from_vec(vec![out_dim, in_dim], weight)?;
                Ok(Self::Dense { weight })
            }
            WeightData::Q8_0(blocks) => {
                if in_dim % BLOCK_SIZE != 0 {
                    return Err(InferirError::FormatError {
                        reason: format!(
                            "Q8_0 projection needs in_dim multiple of {BLOCK_SIZE}, got {in_dim}"
                        ),
                    });
                }
                if blocks.len() != out_dim * in_dim / BLOCK_SIZE {
                    return Err(InferirError::DataShapeMismatch {
                        data_size: blocks.len() * BLOCK_SIZE,
                        shape: vec![out_dim, in_dim],
                        expected: out_dim * in_dim,
                    });
                }
                Ok(Self::Quant8 {
                    blocks,
                    in_dim,
                    out_dim,
                })
            }
        }
    }

    /// Output width
    #[must_use]
    pub fn out_dim(&self) -> usize {
        match self {
            Self::Dense { weight } => weight.shape()[0],
            Self::Quant8 { out_dim, .. } => *out_dim,
        }
    }

    /// Apply to one activation vector
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on activation length disagreement.
    pub fn forward_into(&self, x: &[f32], output: &mut [f32]) -> Result<()> {
        match self {
            Self::Dense { weight } => {
                matvec_into(weight.data(), x, weight.shape()[1], weight.shape()[0], output)
            }
            Self::Quant8 {
                blocks,
                in_dim,
                out_dim,
            } => matvec_q8_0_into(blocks, x, *in_dim, *out_dim, output),
        }
    }

    /// Allocating wrapper around [`forward_into`](Self::forward_into)
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on activation length disagreement.
    pub fn forward(&self, x: &[f32]) -> Result<Vec<f32>> {
        let mut output = vec![0.0; self.out_dim()];
        self.forward_into(x, &mut output)?;
        Ok(output)
    }
}

// ============================================================================
// RoPE
// ============================================================================

/// Rotate adjacent pairs of each head by position-dependent angles
///
/// Pair `i` of a head turns by `pos / theta^(2i / head_dim)`.
pub fn apply_rope(x: &mut [f32], n_heads: usize, head_dim: usize, pos: usize, theta: f32) {
    for head in 0..n_heads {
        let base = head * head_dim;
        for i in 0..head_dim / 2 {
            let freq = theta.powf(-2.0 * i as f32 / head_dim as f32);
            let angle = pos as f32 * freq;
            let (sin, cos) = angle.sin_cos();
            let x0 = x[base + 2 * i];
            let x1 = x[base + 2 * i + 1];
            x[base + 2 * i] = x0 * cos - x1 * sin;
            x[base + 2 * i + 1] = x0 * sin + x1 * cos;
        }
    }
}

// ============================================================================
// Model
// ============================================================================

/// One layer's weights
#[derive(Debug, Clone)]
struct LayerWeights {
    attn_norm: Vec<f32>,
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    ffn_norm: Vec<f32>,
    w_gate: Linear,
    w_up: Linear,
    w_down: Linear,
}

/// A loaded transformer ready to decode
#[derive(Debug)]
pub struct Model {
    config: ModelConfig,
    token_embedding: Tensor<f32>,
    layers: Vec<LayerWeights>,
    final_norm: Vec<f32>,
    output: Linear,
}

fn norm_weight(source: &dyn WeightSource, name: &str, dim: usize) -> Result<Vec<f32>> {
    let tensor = source.tensor(name)?;
    match tensor.data {
        WeightData::F32(data) if data.len() == dim => Ok(data),
        WeightData::F32(data) => Err(InferirError::DataShapeMismatch {
            data_size: data.len(),
            shape: tensor.shape,
            expected: dim,
        }),
        WeightData::Q8_0(_) => Err(InferirError::FormatError {
            reason: format!("norm weight {name} must be f32"),
        }),
    }
}

impl Model {
    /// Load every tensor the forward pass needs
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for bad geometry, `MissingTensor` for
    /// an absent tensor, shape/format errors for payload disagreement.
    pub fn from_source(config: ModelConfig, source: &dyn WeightSource) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_dim;
        let kv_dim = config.kv_dim();

        let embedding = source.tensor("token_embd.weight")?;
        let token_embedding = match embedding.data {
            WeightData::F32(data) => Tensor::from_vec(vec![config.vocab_size, hidden], data)?,
            WeightData::Q8_0(_) => {
                return Err(InferirError::FormatError {
                    reason: "token embedding must be f32".to_string(),
                })
            }
        };

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let t = |suffix: &str| source.tensor(&format!("blk.{i}.{suffix}"));
            layers.push(LayerWeights {
                attn_norm: norm_weight(source, &format!("blk.{i}.attn_norm.weight"), hidden)?,
                wq: Linear::from_tensor(t("attn_q.weight")?, hidden, hidden)?,
                wk: Linear::from_tensor(t("attn_k.weight")?, hidden, kv_dim)?,
                wv: Linear::from_tensor(t("attn_v.weight")?, hidden, kv_dim)?,
                wo: Linear::from_tensor(t("attn_output.weight")?, hidden, hidden)?,
                ffn_norm: norm_weight(source, &format!("blk.{i}.ffn_norm.weight"), hidden)?,
                w_gate: Linear::from_tensor(t("ffn_gate.weight")?, hidden, config.ffn_dim)?,
                w_up: Linear::from_tensor(t("ffn_up.weight")?, hidden, config.ffn_dim)?,
                w_down: Linear::from_tensor(t("ffn_down.weight")?, config.ffn_dim, hidden)?,
            });
        }

        let final_norm = norm_weight(source, "output_norm.weight", hidden)?;
        let output = Linear::from_tensor(
            source.tensor("output.weight")?,
            hidden,
            config.vocab_size,
        )?;

        Ok(Self {
            config,
            token_embedding,
            layers,
            final_norm,
            output,
        })
    }

    /// Model geometry
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn norm_into(&self, input: &[f32], weight: &[f32], output: &mut [f32]) {
        match self.config.norm {
            NormKind::RmsNorm => rms_norm_into(input, weight, self.config.norm_eps, output),
            NormKind::LayerNorm => {
                layer_norm_into(input, weight, None, self.config.norm_eps, output);
            }
        }
    }

    fn activate(&self, data: &mut [f32]) {
        match self.config.activation {
            ActivationKind::Silu => silu(data),
            ActivationKind::Gelu => gelu(data),
        }
    }

    fn embed(&self, token: u32) -> Result<Vec<f32>> {
        let idx = token as usize;
        if idx >= self.config.vocab_size {
            return Err(InferirError::InvalidShape {
                reason: format!(
                    "token id {token} outside vocabulary of {}",
                    self.config.vocab_size
                ),
            });
        }
        Ok(self.token_embedding.row(idx).to_vec())
    }

    /// Run one layer's attention half on a single position
    #[allow(clippy::too_many_arguments)]
    fn attention_block(
        &self,
        layer_idx: usize,
        layer: &LayerWeights,
        x: &mut [f32],
        pos: usize,
        cache: &mut KvCache,
        pool: &BufferPool,
    ) -> Result<()> {
        let cfg = &self.config;
        let mut normed = pool.rent(cfg.hidden_dim);
        self.norm_into(x, &layer.attn_norm, &mut normed);

        let mut q = layer.wq.forward(&normed)?;
        let mut k = layer.wk.forward(&normed)?;
        let v = layer.wv.forward(&normed)?;
        apply_rope(&mut q, cfg.num_heads, cfg.head_dim(), pos, cfg.rope_theta);
        apply_rope(&mut k, cfg.num_kv_heads, cfg.head_dim(), pos, cfg.rope_theta);

        let attn = attention_step(&q, &k, &v, cache, layer_idx, cfg.num_heads, pool)?;
        cache.append(layer_idx, &k, &v)?;

        let mut projected = pool.rent(cfg.hidden_dim);
        layer.wo.forward_into(&attn, &mut projected)?;
        vec_add(x, &projected);
        Ok(())
    }

    /// Run one layer's FFN half on a single position
    fn ffn_block(&self, layer: &LayerWeights, x: &mut [f32], pool: &BufferPool) -> Result<()> {
        let cfg = &self.config;
        let mut normed = pool.rent(cfg.hidden_dim);
        self.norm_into(x, &layer.ffn_norm, &mut normed);

        let mut gate = layer.w_gate.forward(&normed)?;
        let up = layer.w_up.forward(&normed)?;
        self.activate(&mut gate);
        vec_mul(&mut gate, &up);

        let mut down = pool.rent(cfg.hidden_dim);
        layer.w_down.forward_into(&gate, &mut down)?;
        vec_add(x, &down);
        Ok(())
    }

    /// Decode one token at `pos`, reading and extending the cache
    ///
    /// Appends this position's keys/values to every layer, advances the
    /// cache once, and returns the vocabulary logits.
    ///
    /// # Errors
    ///
    /// Returns `ContextLimitExceeded` past `max_context`,
    /// `CapacityExceeded` when the cache is full, plus load-time shape
    /// errors surfaced by the projections.
    pub fn forward_step(
        &self,
        token: u32,
        pos: usize,
        cache: &mut KvCache,
        pool: &BufferPool,
    ) -> Result<Vec<f32>> {
        if pos >= self.config.max_context {
            return Err(InferirError::ContextLimitExceeded {
                length: pos + 1,
                max: self.config.max_context,
            });
        }

        let mut x = self.embed(token)?;
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            self.attention_block(layer_idx, layer, &mut x, pos, cache, pool)?;
            self.ffn_block(layer, &mut x, pool)?;
        }
        cache.advance()?;

        let mut normed = pool.rent(self.config.hidden_dim);
        self.norm_into(&x, &self.final_norm, &mut normed);
        self.output.forward(&normed)
    }

    /// Recompute the whole prompt from scratch, no cache involved
    ///
    /// Returns logits for every position. This is the reference path the
    /// incremental path is tested against; it is also useful for scoring.
    ///
    /// # Errors
    ///
    /// Returns `ContextLimitExceeded` for a prompt past `max_context`,
    /// plus shape errors surfaced by the projections.
    pub fn forward_prefill(&self, tokens: &[u32], pool: &BufferPool) -> Result<Vec<Vec<f32>>> {
        let cfg = &self.config;
        if tokens.len() > cfg.max_context {
            return Err(InferirError::ContextLimitExceeded {
                length: tokens.len(),
                max: cfg.max_context,
            });
        }

        let seq_len = tokens.len();
        let hidden = cfg.hidden_dim;
        let kv_dim = cfg.kv_dim();

        let mut states: Vec<Vec<f32>> = tokens
            .iter()
            .map(|&t| self.embed(t))
            .collect::<Result<_>>()?;

        for layer in &self.layers {
            // Attention half, all positions at once
            let mut queries = vec![0.0f32; seq_len * hidden];
            let mut keys = vec![0.0f32; seq_len * kv_dim];
            let mut values = vec![0.0f32; seq_len * kv_dim];
            for (pos, x) in states.iter().enumerate() {
                let mut normed = pool.rent(hidden);
                self.norm_into(x, &layer.attn_norm, &mut normed);

                let q_row = &mut queries[pos * hidden..(pos + 1) * hidden];
                layer.wq.forward_into(&normed, q_row)?;
                apply_rope(q_row, cfg.num_heads, cfg.head_dim(), pos, cfg.rope_theta);

                let k_row = &mut keys[pos * kv_dim..(pos + 1) * kv_dim];
                layer.wk.forward_into(&normed, k_row)?;
                apply_rope(k_row, cfg.num_kv_heads, cfg.head_dim(), pos, cfg.rope_theta);

                layer
                    .wv
                    .forward_into(&normed, &mut values[pos * kv_dim..(pos + 1) * kv_dim])?;
            }

            let attn = attention_prefill(
                &queries,
                &keys,
                &values,
                seq_len,
                cfg.num_heads,
                cfg.num_kv_heads,
                cfg.head_dim(),
                pool,
            )?;

            for (pos, x) in states.iter_mut().enumerate() {
                let mut projected = pool.rent(hidden);
                layer
                    .wo
                    .forward_into(&attn[pos * hidden..(pos + 1) * hidden], &mut projected)?;
                vec_add(x, &projected);
                self.ffn_block(layer, x, pool)?;
            }
        }

        states
            .iter()
            .map(|x| {
                let mut normed = pool.rent(hidden);
                self.norm_into(x, &self.final_norm, &mut normed);
                self.output.forward(&normed)
            })
            .collect()
    }
}

// ============================================================================
// Deterministic tiny model for tests
// ============================================================================
