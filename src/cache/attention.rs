// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention pattern cache for storing and querying per-layer attention weights.
//!
//! [`AttentionCache`] stores post-softmax attention patterns from each layer
//! of a forward pass over a single sequence, enabling head classification
//! and heatmap rendering.
//!
//! Each stored tensor has shape `[n_heads, dest, src]`.

use candle_core::{DType, IndexOp, Tensor};

use super::PatternLookup;
use crate::error::{MIError, Result};
use crate::hooks::{HookCache, HookPoint};

/// Stores per-layer attention weights from a forward pass.
///
/// Each tensor has shape `[n_heads, dest, src]`: row `i` of head `h` is the
/// distribution destination position `i` places over source positions.
///
/// # Example
///
/// ```
/// use cirvis::AttentionCache;
/// use candle_core::{DType, Device, Tensor};
///
/// let mut cache = AttentionCache::with_capacity(2);
/// // a leading batch axis of size 1 is dropped on insertion
/// cache.push(Tensor::zeros((1, 4, 6, 6), DType::F32, &Device::Cpu).unwrap()).unwrap();
/// assert_eq!(cache.get_layer(0).unwrap().dims(), &[4, 6, 6]);
///
/// let head = cache.head_pattern(0, 3).unwrap();
/// assert_eq!(head.dims(), &[6, 6]);
/// ```
#[derive(Debug, Clone)]
pub struct AttentionCache {
    /// Attention patterns per layer, each shape `[n_heads, dest, src]`.
    patterns: Vec<Tensor>,
}

impl AttentionCache {
    /// Create an empty cache with capacity for `n_layers` layers.
    #[must_use]
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            patterns: Vec::with_capacity(n_layers),
        }
    }

    /// Collect the `AttnPattern` captures of layers `0..n_layers`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if a layer's pattern was not captured and
    /// [`MIError::ShapeMismatch`] if a capture has an unusable shape.
    pub fn from_hook_cache(hook_cache: &HookCache, n_layers: usize) -> Result<Self> {
        let mut cache = Self::with_capacity(n_layers);
        for layer in 0..n_layers {
            let pattern = hook_cache.require(&HookPoint::AttnPattern(layer))?;
            // BORROW: candle tensors are reference-counted, clone is cheap
            cache.push(pattern.clone())?;
        }
        Ok(cache)
    }

    /// Add an attention pattern for the next layer.
    ///
    /// # Shapes
    ///
    /// - `pattern`: `[n_heads, dest, src]` or `[1, n_heads, dest, src]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::ShapeMismatch`] for any other rank, for a batch
    /// axis larger than 1, or for a non-square pattern.
    pub fn push(&mut self, pattern: Tensor) -> Result<()> {
        let pattern = strip_batch_axis(&pattern)?;
        self.patterns.push(pattern);
        Ok(())
    }

    /// Number of cached layers.
    #[must_use]
    pub const fn n_layers(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Get the raw attention tensor for a specific layer.
    ///
    /// # Shapes
    ///
    /// - returns: `[n_heads, dest, src]`
    #[must_use]
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.patterns.get(layer)
    }

    /// Attention matrix of one head.
    ///
    /// # Shapes
    ///
    /// - returns: `[dest, src]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::InvalidArgument`] if the layer or head is out of range.
    pub fn head_pattern(&self, layer: usize, head: usize) -> Result<Tensor> {
        let pattern = self.patterns.get(layer).ok_or_else(|| {
            MIError::InvalidArgument(format!(
                "layer {layer} not in attention cache (n_layers={})",
                self.patterns.len()
            ))
        })?;
        let n_heads = pattern.dim(0)?;
        if head >= n_heads {
            return Err(MIError::InvalidArgument(format!(
                "head {head} out of range (n_heads={n_heads})"
            )));
        }
        Ok(pattern.i(head)?)
    }

    /// Attention matrix of one head as nested rows, for heatmap rendering.
    ///
    /// # Shapes
    ///
    /// - returns: `dest` rows of `src` weights
    ///
    /// # Errors
    ///
    /// Same as [`head_pattern`](Self::head_pattern).
    pub fn head_pattern_rows(&self, layer: usize, head: usize) -> Result<Vec<Vec<f32>>> {
        // PROMOTE: patterns may be stored in half precision
        let rows: Vec<Vec<f32>> = self
            .head_pattern(layer, head)?
            .to_dtype(DType::F32)?
            .to_vec2()?;
        Ok(rows)
    }

    /// All cached patterns as a slice.
    #[must_use]
    pub fn patterns(&self) -> &[Tensor] {
        &self.patterns
    }
}

impl PatternLookup for AttentionCache {
    fn layer_pattern(&self, layer: usize) -> Result<&Tensor> {
        self.patterns.get(layer).ok_or_else(|| {
            MIError::ShapeMismatch(format!(
                "layer {layer} not in attention cache (n_layers={})",
                self.patterns.len()
            ))
        })
    }
}

/// Normalise a layer pattern to `[n_heads, dest, src]`.
///
/// # Errors
///
/// Returns [`MIError::ShapeMismatch`] unless the input is a square
/// `[n_heads, n, n]` pattern, optionally behind a batch axis of size 1.
pub(crate) fn strip_batch_axis(pattern: &Tensor) -> Result<Tensor> {
    let pattern = match pattern.dims() {
        [_, _, _] => pattern.clone(),
        [1, _, _, _] => pattern.squeeze(0)?,
        [batch, _, _, _] => {
            return Err(MIError::ShapeMismatch(format!(
                "attention cache holds a single sequence, got batch of {batch}"
            )));
        }
        dims => {
            return Err(MIError::ShapeMismatch(format!(
                "expected [n_heads, dest, src] pattern, got shape {dims:?}"
            )));
        }
    };
    let (_, dest, src) = pattern.dims3()?;
    if dest != src {
        return Err(MIError::ShapeMismatch(format!(
            "attention pattern must be square, got [{dest}, {src}]"
        )));
    }
    Ok(pattern)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Single-layer cache with 2 heads over 3 positions.
    ///
    /// - Head 0: causal uniform
    /// - Head 1: previous-token (position 0 attends to itself)
    fn sample_cache() -> AttentionCache {
        #[rustfmt::skip]
        let data: Vec<f32> = vec![
            // Head 0
            1.0, 0.0, 0.0,
            0.5, 0.5, 0.0,
            1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0,
            // Head 1
            1.0, 0.0, 0.0,
            1.0, 0.0, 0.0,
            0.0, 1.0, 0.0,
        ];
        let tensor = Tensor::from_vec(data, (1, 2, 3, 3), &Device::Cpu).unwrap();
        let mut cache = AttentionCache::with_capacity(1);
        cache.push(tensor).unwrap();
        cache
    }

    #[test]
    fn empty_cache() {
        let cache = AttentionCache::with_capacity(2);
        assert_eq!(cache.n_layers(), 0);
        assert!(cache.is_empty());
        assert!(cache.get_layer(0).is_none());
        assert!(matches!(
            cache.layer_pattern(0),
            Err(MIError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn push_strips_unit_batch() {
        let cache = sample_cache();
        assert_eq!(cache.n_layers(), 1);
        assert_eq!(cache.get_layer(0).unwrap().dims(), &[2, 3, 3]);
        assert_eq!(cache.patterns().len(), 1);
    }

    #[test]
    fn push_rejects_real_batch() {
        let mut cache = AttentionCache::with_capacity(1);
        let pattern = Tensor::zeros((2, 2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            cache.push(pattern),
            Err(MIError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn push_rejects_non_square() {
        let mut cache = AttentionCache::with_capacity(1);
        let pattern = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(cache.push(pattern).is_err());
    }

    #[test]
    fn head_pattern_rows_values() {
        let cache = sample_cache();
        let rows = cache.head_pattern_rows(0, 1).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn head_pattern_out_of_range() {
        let cache = sample_cache();
        assert!(matches!(
            cache.head_pattern(0, 2),
            Err(MIError::InvalidArgument(_))
        ));
        assert!(cache.head_pattern(1, 0).is_err());
    }

    #[test]
    fn from_hook_cache_collects_layers() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let mut hook_cache = HookCache::new(logits);
        for layer in 0..2 {
            let pattern = Tensor::zeros((1, 2, 3, 3), DType::F32, &Device::Cpu).unwrap();
            hook_cache.store(HookPoint::AttnPattern(layer), pattern);
        }
        let cache = AttentionCache::from_hook_cache(&hook_cache, 2).unwrap();
        assert_eq!(cache.n_layers(), 2);

        assert!(matches!(
            AttentionCache::from_hook_cache(&hook_cache, 3),
            Err(MIError::Hook(_))
        ));
    }
}
