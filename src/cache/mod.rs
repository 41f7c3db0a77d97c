// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention pattern caching.
//!
//! - [`AttentionCache`] : per-layer post-softmax attention patterns with the
//!   batch axis removed.
//! - [`PatternLookup`] : the read-only accessor the head classifier consumes;
//!   implemented by [`AttentionCache`] and by [`HookCache`](crate::HookCache).

pub(crate) mod attention;

pub use attention::AttentionCache;

use candle_core::Tensor;

use crate::error::Result;

/// Lookup of the attention pattern captured for a layer.
///
/// The returned tensor is either `[n_heads, dest, src]` or
/// `[1, n_heads, dest, src]`; callers normalise the batch axis.
pub trait PatternLookup {
    /// Pattern tensor for `layer`.
    ///
    /// # Errors
    ///
    /// Returns an error if no pattern was captured for `layer`.
    fn layer_pattern(&self, layer: usize) -> Result<&Tensor>;
}
