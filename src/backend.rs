// SPDX-License-Identifier: MIT OR Apache-2.0

//! Backend trait, model wrapper, and the ablation-capable runner interface.
//!
//! [`MIBackend`] is what an external transformer implementation provides: a
//! hook-aware forward pass.  [`MIModel`] wraps a backend with its device.
//! [`ModelRunner`] is the narrow capability the ablation scorer needs; the
//! head to ablate is an argument of each call, so no hook state outlives the
//! pass it was meant for.

use candle_core::{Device, Tensor};

use crate::cache::AttentionCache;
use crate::config::ModelConfig;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec, Intervention};
use crate::interp::ablation::HeadAblation;

// ---------------------------------------------------------------------------
// MIBackend trait
// ---------------------------------------------------------------------------

/// Unified interface for model backends with hook-aware forward passes.
///
/// The caller specifies captures and interventions via [`HookSpec`]; the
/// backend returns a [`HookCache`] containing the logits plus any requested
/// activations.  Backends must support at least:
///
/// - capture of [`HookPoint::AttnPattern`] as `[batch, n_heads, dest, src]`;
/// - interventions at [`HookPoint::AttnV`] on `[batch, n_heads, seq, d_head]`
///   values, before heads are combined (see [`HookSpec::apply_at`]).
pub trait MIBackend: Send + Sync {
    /// Model dimensions.
    fn config(&self) -> &ModelConfig;

    /// Forward pass with optional hook capture and interventions.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing logits at `[batch, seq, d_vocab]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) on tensor failures
    /// and [`MIError::Intervention`](crate::MIError::Intervention) if an
    /// intervention does not fit the model.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    /// Number of layers.
    fn num_layers(&self) -> usize {
        self.config().n_layers
    }

    /// Number of attention heads per layer.
    fn num_heads(&self) -> usize {
        self.config().n_heads
    }

    /// Vocabulary size.
    fn vocab_size(&self) -> usize {
        self.config().d_vocab
    }
}

// ---------------------------------------------------------------------------
// ModelRunner trait
// ---------------------------------------------------------------------------

/// Forward-pass capability consumed by [`score_ablation`](crate::score_ablation).
///
/// Implementors apply the optional [`HeadAblation`] for the duration of a
/// single call only.
pub trait ModelRunner {
    /// Number of layers.
    fn n_layers(&self) -> usize;

    /// Attention heads per layer.
    fn n_heads(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Beginning-of-sequence token id.
    fn bos_token_id(&self) -> u32;

    /// Forward pass, optionally with one head's value output zeroed.
    ///
    /// # Shapes
    /// - `tokens`: `[batch, seq]`
    /// - returns: logits `[batch, seq, vocab]`
    ///
    /// # Errors
    ///
    /// Implementation-defined; the scorer treats any error as fatal.
    fn run_ablated(&self, tokens: &Tensor, ablation: Option<HeadAblation>) -> Result<Tensor>;

    /// Plain forward pass.
    ///
    /// # Errors
    ///
    /// Same as [`run_ablated`](Self::run_ablated).
    fn run(&self, tokens: &Tensor) -> Result<Tensor> {
        self.run_ablated(tokens, None)
    }

    /// Forward pass with head `head` of layer `layer` zeroed at every
    /// position and batch element.
    ///
    /// # Errors
    ///
    /// Same as [`run_ablated`](Self::run_ablated).
    fn run_with_head_zeroed(&self, tokens: &Tensor, layer: usize, head: usize) -> Result<Tensor> {
        self.run_ablated(tokens, Some(HeadAblation::new(layer, head)))
    }
}

// ---------------------------------------------------------------------------
// MIModel
// ---------------------------------------------------------------------------

/// High-level model wrapper combining a backend with its device.
pub struct MIModel {
    /// The underlying model backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    backend: Box<dyn MIBackend>,
    /// The device this model lives on.
    device: Device,
}

impl MIModel {
    /// Wrap an existing backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn MIBackend>, device: Device) -> Self {
        Self { backend, device }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Model dimensions.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        self.backend.config()
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Number of attention heads per layer.
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.backend.num_heads()
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Run a forward pass with the given hook specification.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing logits at `[batch, seq, d_vocab]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.backend.forward(input_ids, hooks)
    }

    /// Forward pass capturing every layer's attention pattern.
    ///
    /// # Shapes
    /// - `input_ids`: `[1, seq]` -- a single sequence
    /// - returns: logits `[1, seq, d_vocab]` and an [`AttentionCache`] of
    ///   `[n_heads, seq, seq]` patterns
    ///
    /// # Errors
    ///
    /// Propagates backend errors; returns
    /// [`MIError::Hook`](crate::MIError::Hook) if the backend skipped a
    /// requested capture and
    /// [`MIError::ShapeMismatch`](crate::MIError::ShapeMismatch) for batches
    /// larger than one.
    pub fn run_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, AttentionCache)> {
        let n_layers = self.num_layers();
        let mut hooks = HookSpec::new();
        for layer in 0..n_layers {
            hooks.capture(HookPoint::AttnPattern(layer));
        }
        let hook_cache = self.backend.forward(input_ids, &hooks)?;
        let cache = AttentionCache::from_hook_cache(&hook_cache, n_layers)?;
        Ok((hook_cache.into_output(), cache))
    }

    /// Access the underlying backend.
    // TRAIT_OBJECT: caller needs dynamic dispatch for backend-specific methods
    #[must_use]
    pub fn backend(&self) -> &dyn MIBackend {
        &*self.backend
    }
}

/// Ablation is a one-shot [`Intervention::ZeroHead`] at
/// [`HookPoint::AttnV`]; the [`HookSpec`] is dropped when the call returns.
impl ModelRunner for MIModel {
    fn n_layers(&self) -> usize {
        self.num_layers()
    }

    fn n_heads(&self) -> usize {
        self.num_heads()
    }

    fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    fn bos_token_id(&self) -> u32 {
        self.config().bos_token_id
    }

    fn run_ablated(&self, tokens: &Tensor, ablation: Option<HeadAblation>) -> Result<Tensor> {
        let mut hooks = HookSpec::new();
        if let Some(ablation) = ablation {
            ablation.validate(self.num_layers(), self.num_heads())?;
            hooks.intervene(
                HookPoint::AttnV(ablation.layer),
                Intervention::ZeroHead(ablation.head),
            );
        }
        Ok(self.backend.forward(tokens, &hooks)?.into_output())
    }
}
