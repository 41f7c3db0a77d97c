// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-head zero ablation for causal importance scores.
//!
//! For every `(layer, head)` the model is re-run with that head's value
//! output forced to zero, and the induction-region loss is compared with an
//! unablated baseline.  The difference `ablated - baseline` is the head's
//! importance: positive means the model needs the head for the task.
//!
//! ## Cost
//!
//! `n_layers * n_heads + 1` forward passes.  Only one ablated pass's logits
//! are alive at a time.

use candle_core::{Device, Tensor};
use serde::Serialize;

use crate::backend::ModelRunner;
use crate::error::{MIError, Result};
use crate::util::loss::induction_region_loss;

// ---------------------------------------------------------------------------
// HeadAblation
// ---------------------------------------------------------------------------

/// Which head to zero during one forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HeadAblation {
    /// Layer index.
    pub layer: usize,
    /// Head index within the layer.
    pub head: usize,
}

impl HeadAblation {
    /// Ablate `head` of `layer`.
    #[must_use]
    pub const fn new(layer: usize, head: usize) -> Self {
        Self { layer, head }
    }

    /// Validate against model dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::InvalidArgument`] if the layer or head is out of range.
    pub fn validate(&self, n_layers: usize, n_heads: usize) -> Result<()> {
        if self.layer >= n_layers {
            return Err(MIError::InvalidArgument(format!(
                "layer {} out of range (model has {n_layers} layers)",
                self.layer
            )));
        }
        if self.head >= n_heads {
            return Err(MIError::InvalidArgument(format!(
                "head {} out of range (model has {n_heads} heads)",
                self.head
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AblationScoreMatrix
// ---------------------------------------------------------------------------

/// Dense `[layer, head]` loss deltas (`ablated - baseline`).
///
/// Every cell is populated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AblationScoreMatrix {
    /// Number of layers (rows).
    n_layers: usize,
    /// Heads per layer (columns).
    n_heads: usize,
    /// Loss of the unablated run.
    baseline_loss: f32,
    /// Row-major loss deltas.
    scores: Vec<f32>,
}

impl AblationScoreMatrix {
    /// Number of layers.
    #[must_use]
    pub const fn n_layers(&self) -> usize {
        self.n_layers
    }

    /// Heads per layer.
    #[must_use]
    pub const fn n_heads(&self) -> usize {
        self.n_heads
    }

    /// Induction-region loss of the unablated model.
    #[must_use]
    pub const fn baseline_loss(&self) -> f32 {
        self.baseline_loss
    }

    /// Number of cells (`n_layers * n_heads`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Whether the matrix has no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Loss delta of one head.
    #[must_use]
    pub fn get(&self, layer: usize, head: usize) -> Option<f32> {
        if layer >= self.n_layers || head >= self.n_heads {
            return None;
        }
        self.scores.get(layer * self.n_heads + head).copied()
    }

    /// Loss deltas of one layer.
    #[must_use]
    pub fn row(&self, layer: usize) -> Option<&[f32]> {
        if layer >= self.n_layers {
            return None;
        }
        let start = layer * self.n_heads;
        self.scores.get(start..start + self.n_heads)
    }

    /// All deltas, row-major.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.scores
    }

    /// The `k` heads whose removal hurts most, as `(layer, head, delta)`,
    /// largest delta first.
    #[must_use]
    pub fn top_heads(&self, k: usize) -> Vec<(usize, usize, f32)> {
        let mut ranked: Vec<(usize, usize, f32)> = self
            .scores
            .iter()
            .enumerate()
            .map(|(idx, &delta)| (idx / self.n_heads, idx % self.n_heads, delta))
            .collect();
        ranked.sort_by(|a, b| b.2.total_cmp(&a.2));
        ranked.truncate(k);
        ranked
    }

    /// The matrix as a `[n_layers, n_heads]` tensor.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] if tensor allocation fails.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        // BORROW: Tensor::from_vec takes ownership of its buffer
        Ok(Tensor::from_vec(
            self.scores.clone(),
            (self.n_layers, self.n_heads),
            device,
        )?)
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Run the runner once, tagging any failure with `context`.
fn checked_loss<R: ModelRunner + ?Sized>(
    runner: &R,
    tokens: &Tensor,
    ablation: Option<HeadAblation>,
    context: &str,
) -> Result<f32> {
    let logits = runner
        .run_ablated(tokens, ablation)
        .map_err(|e| MIError::collaborator(context, e))?;
    let loss = induction_region_loss(&logits, tokens)?;
    if !loss.is_finite() {
        return Err(MIError::collaborator(
            context,
            MIError::Model(candle_core::Error::Msg(format!(
                "runner produced non-finite loss {loss}"
            ))),
        ));
    }
    Ok(loss)
}

/// Score every head by how much zero-ablating it raises induction loss.
///
/// `tokens` must be a batch of repeated sequences
/// (`[batch, 2 * seq_len + 1]`, see [`crate::util::repeated`]) with
/// `seq_len >= 2`.  Passes run layer-major, head-minor.
///
/// # Shapes
/// - `tokens`: `[batch, 2 * seq_len + 1]`
///
/// # Errors
///
/// - [`MIError::InvalidArgument`] if `tokens` is not 2-D, is too short, or
///   the runner reports zero layers or heads; nothing is run.
/// - [`MIError::Collaborator`] if any forward pass fails or yields a
///   non-finite loss; the sweep stops and no partial matrix is returned.
/// - [`MIError::ShapeMismatch`] if the runner returns logits that do not
///   match `tokens`.
pub fn score_ablation<R: ModelRunner + ?Sized>(
    runner: &R,
    tokens: &Tensor,
) -> Result<AblationScoreMatrix> {
    let n_layers = runner.n_layers();
    let n_heads = runner.n_heads();
    if n_layers == 0 || n_heads == 0 {
        return Err(MIError::InvalidArgument(format!(
            "runner reports {n_layers} layers x {n_heads} heads"
        )));
    }
    let (_, total) = tokens.dims2().map_err(|_| {
        MIError::InvalidArgument(format!(
            "tokens must be [batch, seq], got {:?}",
            tokens.dims()
        ))
    })?;
    let seq_len = total.saturating_sub(1) / 2;
    if seq_len < 2 {
        return Err(MIError::InvalidArgument(format!(
            "repeated sequence of total length {total} is too short to score (need seq_len >= 2)"
        )));
    }

    let baseline_loss = checked_loss(runner, tokens, None, "baseline pass")?;
    tracing::info!(
        n_layers,
        n_heads,
        passes = n_layers * n_heads,
        baseline_loss,
        "starting head ablation sweep"
    );

    let mut scores = Vec::with_capacity(n_layers * n_heads);
    for layer in 0..n_layers {
        for head in 0..n_heads {
            let context = format!("ablation of layer {layer} head {head}");
            let ablated_loss =
                checked_loss(runner, tokens, Some(HeadAblation::new(layer, head)), &context)?;
            let delta = ablated_loss - baseline_loss;
            tracing::debug!(layer, head, ablated_loss, delta, "head ablated");
            scores.push(delta);
        }
        tracing::info!(layer, of = n_layers, "layer ablation complete");
    }

    Ok(AblationScoreMatrix {
        n_layers,
        n_heads,
        baseline_loss,
        scores,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::as_conversions
)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    const VOCAB: usize = 16;

    /// `[1, 2 * seq_len + 1]` repeated tokens `[0, 1..=s, 1..=s]`.
    fn repeated_tokens(seq_len: usize) -> (Vec<u32>, Tensor) {
        let block: Vec<u32> = (1..=seq_len as u32).collect();
        let mut ids = vec![0];
        ids.extend_from_slice(&block);
        ids.extend_from_slice(&block);
        let tensor = Tensor::from_vec(ids.clone(), (1, ids.len()), &Device::Cpu).unwrap();
        (ids, tensor)
    }

    /// Logits `[1, seq, VOCAB]` with `strength` on each true next token.
    fn peaked_logits(ids: &[u32], strength: f32) -> Tensor {
        let mut data = vec![0.0_f32; ids.len() * VOCAB];
        for t in 0..ids.len() - 1 {
            data[t * VOCAB + ids[t + 1] as usize] = strength;
        }
        Tensor::from_vec(data, (1, ids.len(), VOCAB), &Device::Cpu).unwrap()
    }

    /// Test runner: logits depend only on which head (if any) is ablated.
    struct ScriptedRunner {
        ids: Vec<u32>,
        /// Heads whose ablation weakens the prediction.
        important: Vec<(HeadAblation, f32)>,
        /// Head whose pass fails, if any.
        fail_on: Option<HeadAblation>,
        /// Every call, in order.
        calls: RefCell<Vec<Option<HeadAblation>>>,
    }

    impl ScriptedRunner {
        fn new(ids: Vec<u32>) -> Self {
            Self {
                ids,
                important: Vec::new(),
                fail_on: None,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ModelRunner for ScriptedRunner {
        fn n_layers(&self) -> usize {
            2
        }

        fn n_heads(&self) -> usize {
            3
        }

        fn vocab_size(&self) -> usize {
            VOCAB
        }

        fn bos_token_id(&self) -> u32 {
            0
        }

        fn run_ablated(&self, _tokens: &Tensor, ablation: Option<HeadAblation>) -> Result<Tensor> {
            self.calls.borrow_mut().push(ablation);
            if ablation.is_some() && ablation == self.fail_on {
                return Err(MIError::Model(candle_core::Error::Msg(
                    "out of device memory".into(),
                )));
            }
            let strength = self
                .important
                .iter()
                .find(|(head, _)| Some(*head) == ablation)
                .map_or(8.0, |(_, s)| *s);
            Ok(peaked_logits(&self.ids, strength))
        }
    }

    #[test]
    fn no_op_heads_score_zero() {
        let (ids, tokens) = repeated_tokens(5);
        let runner = ScriptedRunner::new(ids);
        let scores = score_ablation(&runner, &tokens).unwrap();

        assert_eq!(scores.len(), 6);
        assert_eq!(scores.n_layers(), 2);
        assert_eq!(scores.n_heads(), 3);
        for layer in 0..2 {
            for head in 0..3 {
                let delta = scores.get(layer, head).unwrap();
                assert!(delta.is_finite());
                assert!(delta.abs() < 1e-6);
            }
        }
    }

    #[test]
    fn important_head_has_positive_delta() {
        let (ids, tokens) = repeated_tokens(6);
        let mut runner = ScriptedRunner::new(ids);
        runner.important = vec![(HeadAblation::new(1, 2), 1.0)];
        let scores = score_ablation(&runner, &tokens).unwrap();

        assert!(scores.get(1, 2).unwrap() > 0.5);
        assert!(scores.get(0, 0).unwrap().abs() < 1e-6);
        let top = scores.top_heads(1);
        assert_eq!((top[0].0, top[0].1), (1, 2));
        assert!(scores.baseline_loss().is_finite());
    }

    #[test]
    fn passes_run_layer_major() {
        let (ids, tokens) = repeated_tokens(3);
        let runner = ScriptedRunner::new(ids);
        score_ablation(&runner, &tokens).unwrap();

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 2 * 3 + 1);
        assert_eq!(calls[0], None);
        assert_eq!(calls[1], Some(HeadAblation::new(0, 0)));
        assert_eq!(calls[3], Some(HeadAblation::new(0, 2)));
        assert_eq!(calls[4], Some(HeadAblation::new(1, 0)));
    }

    #[test]
    fn runner_failure_aborts_sweep() {
        let (ids, tokens) = repeated_tokens(4);
        let mut runner = ScriptedRunner::new(ids);
        runner.fail_on = Some(HeadAblation::new(1, 0));

        let err = score_ablation(&runner, &tokens).unwrap_err();
        match err {
            MIError::Collaborator { context, .. } => {
                assert!(context.contains("layer 1 head 0"), "context = {context}");
            }
            other => panic!("expected collaborator failure, got {other:?}"),
        }
        // baseline + layer 0 (3 heads) + the failing pass, nothing after it
        assert_eq!(runner.calls.borrow().len(), 5);
    }

    #[test]
    fn short_sequences_rejected_before_running() {
        let (ids, tokens) = repeated_tokens(1);
        let runner = ScriptedRunner::new(ids);
        assert!(matches!(
            score_ablation(&runner, &tokens),
            Err(MIError::InvalidArgument(_))
        ));
        assert!(runner.calls.borrow().is_empty());

        let flat = Tensor::zeros(7, candle_core::DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            score_ablation(&runner, &flat),
            Err(MIError::InvalidArgument(_))
        ));
    }

    #[test]
    fn non_finite_loss_is_collaborator_failure() {
        let (ids, tokens) = repeated_tokens(4);
        let mut runner = ScriptedRunner::new(ids);
        runner.important = vec![(HeadAblation::new(0, 1), f32::NAN)];
        assert!(matches!(
            score_ablation(&runner, &tokens),
            Err(MIError::Collaborator { .. })
        ));
    }

    #[test]
    fn head_ablation_validation() {
        assert!(HeadAblation::new(1, 11).validate(2, 12).is_ok());
        assert!(matches!(
            HeadAblation::new(2, 0).validate(2, 12),
            Err(MIError::InvalidArgument(_))
        ));
        assert!(HeadAblation::new(0, 12).validate(2, 12).is_err());
    }

    #[test]
    fn matrix_accessors() {
        let (ids, tokens) = repeated_tokens(3);
        let runner = ScriptedRunner::new(ids);
        let scores = score_ablation(&runner, &tokens).unwrap();
        assert_eq!(scores.row(1).unwrap().len(), 3);
        assert!(scores.row(2).is_none());
        assert!(scores.get(0, 3).is_none());
        assert_eq!(scores.as_slice().len(), 6);
        assert_eq!(scores.to_tensor(&Device::Cpu).unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn matrix_out_of_range_indices_are_none() {
        let (ids, tokens) = repeated_tokens(3);
        let runner = ScriptedRunner::new(ids);
        let scores = score_ablation(&runner, &tokens).unwrap();
        assert!(scores.get(usize::MAX, 0).is_none());
        assert!(scores.get(2, 0).is_none());
        assert!(scores.get(0, usize::MAX).is_none());
        assert!(scores.row(usize::MAX).is_none());
        assert!(scores.row(usize::MAX / 3).is_none());
    }
}
