// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and intervention.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookSpec`] (what to capture and where to intervene for ONE pass), and
//! [`HookCache`] (captured tensors from that pass).
//!
//! A `HookSpec` is an argument, not installed state: backends read it for
//! the duration of a single [`forward`](crate::MIBackend::forward) call and
//! nothing survives into the next call.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::cache::PatternLookup;
use crate::error::{MIError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or interventions applied.
///
/// Mirrors the `TransformerLens` hook point naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// ```
/// use cirvis::HookPoint;
///
/// let hook = HookPoint::AttnPattern(1);
/// assert_eq!(hook.to_string(), "blocks.1.attn.hook_pattern");
///
/// let parsed: HookPoint = "blocks.0.attn.hook_v".parse().unwrap();
/// assert_eq!(parsed, HookPoint::AttnV(0));
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Value vectors in layer `i` (`blocks.{i}.attn.hook_v`).
    ///
    /// Shape: `[batch, n_heads, seq, d_head]`.
    AttnV(usize),
    /// Post-softmax attention pattern in layer `i` (`blocks.{i}.attn.hook_pattern`).
    ///
    /// Shape: `[batch, n_heads, dest, src]`.
    AttnPattern(usize),
    /// Backend-specific hook point not covered by the standard enum.
    Custom(String),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttnV(i) => write!(f, "blocks.{i}.attn.hook_v"),
            Self::AttnPattern(i) => write!(f, "blocks.{i}.attn.hook_pattern"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`] for unknown patterns.
fn parse_hook_string(s: &str) -> HookPoint {
    let layer_hook = s
        .strip_prefix("blocks.")
        .and_then(|rest| rest.split_once('.'))
        .and_then(|(layer, suffix)| Some((layer.parse::<usize>().ok()?, suffix)));

    match layer_hook {
        Some((layer, "attn.hook_v")) => HookPoint::AttnV(layer),
        Some((layer, "attn.hook_pattern")) => HookPoint::AttnPattern(layer),
        _ => HookPoint::Custom(s.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// An intervention to apply at a hook point during one forward pass.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intervention {
    /// Zero a single head along the head axis (axis 1).
    ///
    /// Used at [`HookPoint::AttnV`] for single-head zero ablation.
    ZeroHead(usize),
}

/// Apply a single [`Intervention`] to a tensor.
///
/// Backends call this at each hook point that supports interventions.
///
/// # Shapes
/// - `tensor`: rank >= 2 with heads on axis 1.
/// - returns: same shape as `tensor`.
///
/// # Errors
///
/// Returns [`MIError::Intervention`] if a `ZeroHead` index is out of range,
/// or [`MIError::Model`] if the underlying tensor operation fails.
pub fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match *intervention {
        Intervention::ZeroHead(head) => zero_head(tensor, head),
    }
}

/// Multiply axis 1 by a one-hot-inverted mask so only `head` becomes zero.
fn zero_head(tensor: &Tensor, head: usize) -> Result<Tensor> {
    if tensor.rank() < 2 {
        return Err(MIError::Intervention(format!(
            "head ablation needs a tensor with a head axis, got rank {}",
            tensor.rank()
        )));
    }
    let n_heads = tensor.dim(1)?;
    if head >= n_heads {
        return Err(MIError::Intervention(format!(
            "head {head} out of range (n_heads={n_heads})"
        )));
    }

    let keep: Vec<f32> = (0..n_heads)
        .map(|h| if h == head { 0.0 } else { 1.0 })
        .collect();
    let mut mask_shape = vec![1_usize; tensor.rank()];
    if let Some(axis) = mask_shape.get_mut(1) {
        *axis = n_heads;
    }
    let mask = Tensor::from_vec(keep, n_heads, tensor.device())?
        .to_dtype(tensor.dtype())?
        .reshape(mask_shape)?;
    Ok(tensor.broadcast_mul(&mask)?)
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which interventions to apply
/// during one forward pass.
///
/// ```
/// use cirvis::{HookPoint, HookSpec, Intervention};
///
/// let mut hooks = HookSpec::new();
/// hooks
///     .capture(HookPoint::AttnPattern(0))
///     .intervene(HookPoint::AttnV(1), Intervention::ZeroHead(4));
/// assert_eq!(hooks.num_interventions(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
    /// Interventions to apply, stored as (`hook_point`, intervention) pairs.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification (no captures, no interventions).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Register an intervention at the given hook point.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Check whether this spec has no captures and no interventions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered interventions.
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Iterate over interventions registered at a specific hook point.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Check whether any intervention targets the given hook point.
    #[must_use]
    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.interventions.iter().any(|(h, _)| h == hook)
    }

    /// Apply every intervention registered at `hook`, in registration order.
    ///
    /// Returns the input unchanged when nothing targets `hook`.
    ///
    /// # Errors
    ///
    /// Propagates [`apply_intervention`] failures.
    pub fn apply_at(&self, hook: &HookPoint, tensor: Tensor) -> Result<Tensor> {
        let mut current = tensor;
        for intervention in self.interventions_at(hook) {
            current = apply_intervention(&current, intervention)?;
        }
        Ok(current)
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the output logits.
///
/// ```
/// use cirvis::{HookCache, HookPoint};
/// use candle_core::{DType, Device, Tensor};
///
/// let logits = Tensor::zeros((1, 5, 10), DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
/// let pattern = Tensor::zeros((1, 4, 5, 5), DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::AttnPattern(0), pattern);
///
/// assert!(cache.get(&HookPoint::AttnPattern(0)).is_some());
/// assert_eq!(cache.output().dims(), &[1, 5, 10]);
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| MIError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation. Called by backend implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

/// A `HookCache` with `AttnPattern` captures is itself a pattern cache.
impl PatternLookup for HookCache {
    fn layer_pattern(&self, layer: usize) -> Result<&Tensor> {
        self.require(&HookPoint::AttnPattern(layer))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::AttnV(1), "blocks.1.attn.hook_v"),
            (HookPoint::AttnPattern(0), "blocks.0.attn.hook_pattern"),
            (HookPoint::AttnPattern(11), "blocks.11.attn.hook_pattern"),
            (HookPoint::Custom("hook_embed".into()), "hook_embed"),
        ];

        for (hook, expected_str) in cases {
            assert_eq!(hook.to_string(), expected_str, "Display failed for {hook:?}");
            let parsed: HookPoint = expected_str.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected_str:?}");
        }
    }

    #[test]
    fn unknown_string_becomes_custom() {
        for s in ["blocks.x.attn.hook_v", "blocks.0.attn.hook_q", "blocks.3"] {
            let hook: HookPoint = s.parse().unwrap();
            assert_eq!(hook, HookPoint::Custom(s.to_string()));
        }
    }

    #[test]
    fn hook_spec_intervention_query() {
        let mut spec = HookSpec::new();
        assert!(spec.is_empty());
        spec.capture("blocks.0.attn.hook_pattern");
        spec.intervene(HookPoint::AttnV(1), Intervention::ZeroHead(4));
        spec.intervene(HookPoint::AttnV(1), Intervention::ZeroHead(0));

        assert!(spec.is_captured(&HookPoint::AttnPattern(0)));
        assert!(spec.has_intervention_at(&HookPoint::AttnV(1)));
        assert!(!spec.has_intervention_at(&HookPoint::AttnV(0)));
        assert_eq!(spec.interventions_at(&HookPoint::AttnV(1)).count(), 2);
    }

    #[test]
    fn zero_head_only_touches_one_head() {
        // [batch=1, heads=3, seq=2, d_head=2] of ones
        let v = Tensor::ones((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let out = apply_intervention(&v, &Intervention::ZeroHead(1)).unwrap();
        assert_eq!(out.dims(), &[1, 3, 2, 2]);

        let per_head: Vec<f32> = out.sum((0, 2, 3)).unwrap().to_vec1().unwrap();
        assert_eq!(per_head, vec![4.0, 0.0, 4.0]);
    }

    #[test]
    fn zero_head_out_of_range() {
        let v = Tensor::ones((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let err = apply_intervention(&v, &Intervention::ZeroHead(3)).unwrap_err();
        assert!(matches!(err, MIError::Intervention(_)));
    }

    #[test]
    fn apply_at_stacks_interventions_on_one_hook() {
        let mut spec = HookSpec::new();
        spec.intervene(HookPoint::AttnV(0), Intervention::ZeroHead(0))
            .intervene(HookPoint::AttnV(0), Intervention::ZeroHead(2))
            .intervene(HookPoint::AttnV(1), Intervention::ZeroHead(1));
        let v = Tensor::ones((1, 3, 2, 1), DType::F32, &Device::Cpu).unwrap();
        let out = spec.apply_at(&HookPoint::AttnV(0), v).unwrap();
        let per_head: Vec<f32> = out.sum((0, 2, 3)).unwrap().to_vec1().unwrap();
        assert_eq!(per_head, vec![0.0, 2.0, 0.0]);
    }

    #[test]
    fn apply_at_without_interventions_is_identity() {
        let spec = HookSpec::new();
        let v = Tensor::ones((1, 2, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let out = spec.apply_at(&HookPoint::AttnV(0), v).unwrap();
        let total: f32 = out.sum_all().unwrap().to_scalar().unwrap();
        assert!((total - 8.0).abs() < 1e-6);
    }

    #[test]
    fn hook_cache_pattern_lookup() {
        let logits = Tensor::zeros((1, 3, 5), DType::F32, &Device::Cpu).unwrap();
        let mut cache = HookCache::new(logits);
        let pattern = Tensor::zeros((1, 2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        cache.store(HookPoint::AttnPattern(0), pattern);

        assert!(cache.layer_pattern(0).is_ok());
        assert!(matches!(cache.layer_pattern(1), Err(MIError::Hook(_))));
    }
}
