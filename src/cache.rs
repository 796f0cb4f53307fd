//! Key/value cache for incremental decoding
//!
//! Persists, per layer and kv head, every decoded position's key and value
//! vectors so each step recomputes only the newest position. Storage is
//! pre-allocated at session creation to `[layers][kv_heads][capacity ×
//! head_dim]`, head-major, so one head's positions are contiguous. Appends
//! past capacity fail rather than silently growing.
//!
//! One decode step appends to every layer at the same position, then calls
//! [`KvCache::advance`] exactly once. Position `p` is readable only after
//! the step that produced it.

use serde::{Deserialize, Serialize};

use crate::error::{InferirError, Result};

/// Cache geometry, fixed at session creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheConfig {
    /// Transformer layer count
    pub num_layers: usize,
    /// Key/value head count (≤ query head count under grouped attention)
    pub num_kv_heads: usize,
    /// Per-head vector dimension
    pub head_dim: usize,
    /// Maximum positions stored; appends beyond this fail
    pub capacity: usize,
}

impl KvCacheConfig {
    /// Bytes of f32 storage this geometry pre-allocates (keys + values)
    #[must_use]
    pub fn storage_bytes(&self) -> usize {
        2 * self.num_layers
            * self.num_kv_heads
            * self.capacity
            * self.head_dim
            * std::mem::size_of::<f32>()
    }
}

/// Pre-allocated append-only key/value storage
pub struct KvCache {
    config: KvCacheConfig,
    keys: Vec<f32>,
    values: Vec<f32>,
    len: usize,
}

impl KvCache {
    /// Allocate a cache for the given geometry
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if any dimension is zero.
    pub fn new(config: KvCacheConfig) -> Result<Self> {
        if config.num_layers == 0
            || config.num_kv_heads == 0
            || config.head_dim == 0
            || config.capacity == 0
        {
            return Err(InferirError::InvalidConfiguration {
                reason: format!("KV-cache geometry has a zero dimension: {config:?}"),
            });
        }

        let elems = config.num_layers * config.num_kv_heads * config.capacity * config.head_dim;
        Ok(Self {
            config,
            keys: vec![0.0; elems],
            values: vec![0.0; elems],
            len: 0,
        })
    }

    /// Positions currently stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no position has been stored yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum positions this cache can hold
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Cache geometry
    #[must_use]
    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    /// Start of `(layer, kv_head)`'s position run
    #[inline]
    fn head_offset(&self, layer: usize, kv_head: usize) -> usize {
        ((layer * self.config.num_kv_heads + kv_head) * self.config.capacity)
            * self.config.head_dim
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        if layer >= self.config.num_layers {
            return Err(InferirError::InvalidLayer {
                layer,
                num_layers: self.config.num_layers,
            });
        }
        Ok(())
    }

    /// Write one position's keys and values for every kv head of `layer`
    ///
    /// `keys` and `values` are `[num_kv_heads × head_dim]`, head-major. The
    /// write lands at the current position; call [`advance`](Self::advance)
    /// once per step after all layers have appended.
    ///
    /// # Errors
    ///
    /// Returns `InvalidLayer` for an out-of-range layer, `CapacityExceeded`
    /// when the cache is full, `InvalidShape` on slice length disagreement.
    pub fn append(&mut self, layer: usize, keys: &[f32], values: &[f32]) -> Result<()> {
        self.check_layer(layer)?;
        if self.len >= self.config.capacity {
            return Err(InferirError::CapacityExceeded {
                capacity: self.config.capacity,
            });
        }

        let expected = self.config.num_kv_heads * self.config.head_dim;
        if keys.len() != expected || values.len() != expected {
            return Err(InferirError::InvalidShape {
                reason: format!(
                    "KV append: keys {}, values {} vs expected {expected}",
                    keys.len(),
                    values.len()
                ),
            });
        }

        let head_dim = self.config.head_dim;
        for kv_head in 0..self.config.num_kv_heads {
            let dst = self.head_offset(layer, kv_head) + self.len * head_dim;
            let src = kv_head * head_dim;
            self.keys[dst..dst + head_dim].copy_from_slice(&keys[src..src + head_dim]);
            self.values[dst..dst + head_dim].copy_from_slice(&values[src..src + head_dim]);
        }
        Ok(())
    }

    /// Commit the current position, making it readable
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the cache is already full.
    pub fn advance(&mut self) -> Result<()> {
        if self.len >= self.config.capacity {
            return Err(InferirError::CapacityExceeded {
                capacity: self.config.capacity,
            });
        }
        self.len += 1;
        Ok(())
    }

    /// Valid key prefix for `(layer, kv_head)`: `len × head_dim` floats,
    /// position-major
    ///
    /// # Errors
    ///
    /// Returns `InvalidLayer` for an out-of-range layer.
    pub fn keys(&self, layer: usize, kv_head: usize) -> Result<&[f32]> {
        self.check_layer(layer)?;
        let start = self.head_offset(layer, kv_head);
        Ok(&self.keys[start..start + self.len * self.config.head_dim])
    }

    /// Valid value prefix for `(layer, kv_head)`
    ///
    /// # Errors
    ///
    /// Returns `InvalidLayer` for an out-of-range layer.
    pub fn values(&self, layer: usize, kv_head: usize) -> Result<&[f32]> {
        self.check_layer(layer)?;
        let start = self.head_offset(layer, kv_head);
        Ok(&self.values[start..start + self.len * self.config.head_dim])
    }

    /// Forget all positions; storage stays allocated
    pub fn reset(&mut self) {
        self.len = 0;
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("config", &self.config)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> KvCacheConfig {
        KvCacheConfig {
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 4,
            capacity: 3,
        }
    }

    fn kv(seed: f32) -> Vec<f32> {
        (0..8).map(|i| seed + i as f32).collect()
    }

    #[test]
    fn test_new_rejects_zero_dimension() {
        let mut config = small_config();
        config.head_dim = 0;
        assert!(matches!(
            KvCache::new(config).unwrap_err(),
            InferirError::InvalidConfiguration { .. }
        ));
    }

    #[test]
    fn test_append_and_read_prefix() {
        let mut cache = KvCache::new(small_config()).unwrap();
        assert!(cache.is_empty());
        assert!(cache.keys(0, 0).unwrap().is_empty());

        cache.append(0, &kv(10.0), &kv(20.0)).unwrap();
        cache.append(1, &kv(30.0), &kv(40.0)).unwrap();
        cache.advance().unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.keys(0, 0).unwrap(), &[10.0, 11.0, 12.0, 13.0]);
        assert_eq!(cache.keys(0, 1).unwrap(), &[14.0, 15.0, 16.0, 17.0]);
        assert_eq!(cache.values(1, 0).unwrap(), &[40.0, 41.0, 42.0, 43.0]);
    }

    #[test]
    fn test_positions_are_contiguous_per_head() {
        let mut cache = KvCache::new(small_config()).unwrap();
        for step in 0..2 {
            cache
                .append(0, &kv(step as f32 * 100.0), &kv(0.0))
                .unwrap();
            cache.append(1, &kv(0.0), &kv(0.0)).unwrap();
            cache.advance().unwrap();
        }
        let keys = cache.keys(0, 0).unwrap();
        assert_eq!(keys.len(), 8);
        assert_eq!(&keys[0..4], &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(&keys[4..8], &[100.0, 101.0, 102.0, 103.0]);
    }

    #[test]
    fn test_invalid_layer() {
        let mut cache = KvCache::new(small_config()).unwrap();
        assert!(matches!(
            cache.append(2, &kv(0.0), &kv(0.0)).unwrap_err(),
            InferirError::InvalidLayer {
                layer: 2,
                num_layers: 2
            }
        ));
        assert!(cache.keys(5, 0).is_err());
    }

    #[test]
    fn test_capacity_boundary() {
        let mut cache = KvCache::new(small_config()).unwrap();
        // Fill exactly to capacity
        for _ in 0..3 {
            cache.append(0, &kv(0.0), &kv(0.0)).unwrap();
            cache.append(1, &kv(0.0), &kv(0.0)).unwrap();
            cache.advance().unwrap();
        }
        assert_eq!(cache.len(), 3);

        // One more append must fail, no silent growth
        assert!(matches!(
            cache.append(0, &kv(0.0), &kv(0.0)).unwrap_err(),
            InferirError::CapacityExceeded { capacity: 3 }
        ));
        assert!(cache.advance().is_err());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_shape_validation() {
        let mut cache = KvCache::new(small_config()).unwrap();
        assert!(matches!(
            cache.append(0, &[0.0; 7], &[0.0; 8]).unwrap_err(),
            InferirError::InvalidShape { .. }
        ));
    }

    #[test]
    fn test_reset_reuses_storage() {
        let mut cache = KvCache::new(small_config()).unwrap();
        cache.append(0, &kv(1.0), &kv(2.0)).unwrap();
        cache.advance().unwrap();
        cache.reset();
        assert!(cache.is_empty());
        assert!(cache.keys(0, 0).unwrap().is_empty());
        // Still usable after reset
        cache.append(0, &kv(5.0), &kv(6.0)).unwrap();
        cache.advance().unwrap();
        assert_eq!(cache.keys(0, 0).unwrap(), &[5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_storage_bytes() {
        let config = small_config();
        // 2 tensors * 2 layers * 2 heads * 3 capacity * 4 dim * 4 bytes
        assert_eq!(config.storage_bytes(), 2 * 2 * 2 * 3 * 4 * 4);
    }
}
