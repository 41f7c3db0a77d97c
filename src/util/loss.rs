// SPDX-License-Identifier: MIT OR Apache-2.0

//! Next-token log-probabilities and cross-entropy loss.
//!
//! All functions take logits `[batch, seq, vocab]` and the token ids
//! `[batch, seq]` they were computed from.  Position `t` is scored on how
//! well it predicts `tokens[t + 1]`, so a sequence of length `seq` yields
//! `seq - 1` predictions.

use candle_core::{D, DType, Tensor};
use serde::Serialize;

use crate::error::{MIError, Result};

/// Check logits/tokens agreement and return `(batch, seq, vocab)`.
fn check_shapes(logits: &Tensor, tokens: &Tensor) -> Result<(usize, usize, usize)> {
    let (batch, seq, vocab) = logits.dims3().map_err(|_| {
        MIError::ShapeMismatch(format!(
            "logits must be [batch, seq, vocab], got {:?}",
            logits.dims()
        ))
    })?;
    let (tok_batch, tok_seq) = tokens.dims2().map_err(|_| {
        MIError::ShapeMismatch(format!(
            "tokens must be [batch, seq], got {:?}",
            tokens.dims()
        ))
    })?;
    if (batch, seq) != (tok_batch, tok_seq) {
        return Err(MIError::ShapeMismatch(format!(
            "logits [{batch}, {seq}, _] do not match tokens [{tok_batch}, {tok_seq}]"
        )));
    }
    if seq < 2 {
        return Err(MIError::InvalidArgument(format!(
            "need at least 2 positions to score next-token predictions, got {seq}"
        )));
    }
    Ok((batch, seq, vocab))
}

/// Log-probability assigned to each actual next token.
///
/// Log-softmax over the vocabulary, then gather at `tokens[:, 1:]`.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - `tokens`: `[batch, seq]`
/// - returns: `[batch, seq - 1]` (F32)
///
/// # Errors
///
/// Returns [`MIError::ShapeMismatch`] if the shapes disagree,
/// [`MIError::InvalidArgument`] if `seq < 2` or a target id is outside the
/// vocabulary, and [`MIError::Model`] on tensor failures.
pub fn log_probs_for_targets(logits: &Tensor, tokens: &Tensor) -> Result<Tensor> {
    let (_, seq, vocab) = check_shapes(logits, tokens)?;

    let targets = tokens.narrow(1, 1, seq - 1)?.to_dtype(DType::U32)?;
    let max_target: u32 = targets.flatten_all()?.max(0)?.to_scalar()?;
    if usize::try_from(max_target).map_or(true, |t| t >= vocab) {
        return Err(MIError::InvalidArgument(format!(
            "token id {max_target} outside vocabulary of size {vocab}"
        )));
    }

    // PROMOTE: log-softmax over F16/BF16 loses too much precision
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    // CONTIGUOUS: gather requires contiguous source and index layouts
    let predicted = log_probs.narrow(1, 0, seq - 1)?.contiguous()?;
    let index = targets.contiguous()?.unsqueeze(D::Minus1)?;
    Ok(predicted.gather(&index, D::Minus1)?.squeeze(D::Minus1)?)
}

/// Mean negative log-probability of the correct next token.
///
/// Equivalent to `-mean(log_softmax(logits)[:, :-1] gathered at tokens[:, 1:])`.
///
/// # Errors
///
/// Same as [`log_probs_for_targets`].
pub fn cross_entropy(logits: &Tensor, tokens: &Tensor) -> Result<f32> {
    let log_probs = log_probs_for_targets(logits, tokens)?;
    let mean: f32 = log_probs.mean_all()?.to_scalar()?;
    Ok(-mean)
}

/// Cross-entropy over the repeated block of a repeated sequence.
///
/// With `seq_len = (total - 1) / 2`, only the last `seq_len` positions are
/// scored; inside that window every next token is a copy of an earlier one.
///
/// # Errors
///
/// Returns [`MIError::InvalidArgument`] if `seq_len < 2` (no prediction
/// would remain inside the window), plus the errors of [`cross_entropy`].
pub fn induction_region_loss(logits: &Tensor, tokens: &Tensor) -> Result<f32> {
    let (_, total, _) = check_shapes(logits, tokens)?;
    let seq_len = (total - 1) / 2;
    if seq_len < 2 {
        return Err(MIError::InvalidArgument(format!(
            "repeated block of length {seq_len} leaves nothing to score (total length {total})"
        )));
    }
    let start = total - seq_len;
    cross_entropy(
        &logits.narrow(1, start, seq_len)?,
        &tokens.narrow(1, start, seq_len)?,
    )
}

/// Per-position next-token log-probabilities on a repeated sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepetitionLogProbs {
    /// Length of the random block.
    pub seq_len: usize,
    /// Batch-averaged log-probability of the correct next token at each
    /// position, `2 * seq_len` entries.
    pub per_position: Vec<f32>,
    /// Mean over the predictions of the random block.
    pub random_mean: f32,
    /// Mean over the predictions of the repeated block.
    pub repeated_mean: f32,
}

impl RepetitionLogProbs {
    /// How much better the repeated block is predicted than the random one.
    #[must_use]
    pub fn induction_gain(&self) -> f32 {
        self.repeated_mean - self.random_mean
    }
}

/// Split next-token log-probabilities into random and repeated halves.
///
/// Predictions `0..seq_len` target the random block (the first one is made
/// from BOS alone); predictions `seq_len..2 * seq_len` target the repeat.
///
/// # Errors
///
/// Same as [`log_probs_for_targets`]; a sequence with `seq_len == 0` is
/// [`MIError::InvalidArgument`].
pub fn repetition_log_probs(logits: &Tensor, tokens: &Tensor) -> Result<RepetitionLogProbs> {
    let per_position: Vec<f32> = log_probs_for_targets(logits, tokens)?.mean(0)?.to_vec1()?;
    let seq_len = per_position.len() / 2;
    let random = per_position.get(..seq_len).unwrap_or_default();
    let repeated = per_position.get(seq_len..2 * seq_len).unwrap_or_default();
    if random.is_empty() || repeated.is_empty() {
        return Err(MIError::InvalidArgument(
            "sequence too short to split into random and repeated blocks".into(),
        ));
    }

    let random_mean = mean(random);
    let repeated_mean = mean(repeated);
    let per_position = per_position.get(..2 * seq_len).unwrap_or_default().to_vec();
    Ok(RepetitionLogProbs {
        seq_len,
        per_position,
        random_mean,
        repeated_mean,
    })
}

/// Arithmetic mean of a non-empty slice.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn mean(values: &[f32]) -> f32 {
    values.iter().sum::<f32>() / values.len() as f32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Logits `[1, seq, vocab]` with `strength` on each true next token.
    fn peaked_logits(tokens: &[u32], vocab: usize, strength: f32) -> Tensor {
        let seq = tokens.len();
        let mut data = vec![0.0_f32; seq * vocab];
        for t in 0..seq - 1 {
            data[t * vocab + tokens[t + 1] as usize] = strength;
        }
        Tensor::from_vec(data, (1, seq, vocab), &Device::Cpu).unwrap()
    }

    fn token_tensor(tokens: &[u32]) -> Tensor {
        Tensor::from_vec(tokens.to_vec(), (1, tokens.len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn confident_correct_logits_give_zero_loss() {
        let tokens = [0, 3, 1, 4, 1, 5];
        let logits = peaked_logits(&tokens, 8, 100.0);
        let loss = cross_entropy(&logits, &token_tensor(&tokens)).unwrap();
        assert!(loss.abs() < 1e-5, "loss = {loss}");
    }

    #[test]
    fn uniform_logits_give_log_vocab() {
        let tokens = [0, 1, 2, 3];
        let logits = Tensor::zeros((1, 4, 16), DType::F32, &Device::Cpu).unwrap();
        let loss = cross_entropy(&logits, &token_tensor(&tokens)).unwrap();
        assert!((loss - 16.0_f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn log_probs_shape_and_values() {
        let tokens = [2, 0, 1];
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let log_probs = log_probs_for_targets(&logits, &token_tensor(&tokens)).unwrap();
        assert_eq!(log_probs.dims(), &[1, 2]);
        let values: Vec<Vec<f32>> = log_probs.to_vec2().unwrap();
        for v in &values[0] {
            assert!((v - (0.25_f32).ln()).abs() < 1e-6);
        }
    }

    #[test]
    fn shape_mismatch_detected() {
        let logits = Tensor::zeros((1, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let err = cross_entropy(&logits, &token_tensor(&[0, 1, 2])).unwrap_err();
        assert!(matches!(err, MIError::ShapeMismatch(_)));

        let flat = Tensor::zeros((5, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            cross_entropy(&flat, &token_tensor(&[0, 1, 2, 3, 0])),
            Err(MIError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn single_position_rejected() {
        let logits = Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            cross_entropy(&logits, &token_tensor(&[0])),
            Err(MIError::InvalidArgument(_))
        ));
    }

    #[test]
    fn target_outside_vocab_rejected() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            cross_entropy(&logits, &token_tensor(&[0, 1, 9])),
            Err(MIError::InvalidArgument(_))
        ));
    }

    #[test]
    fn induction_region_ignores_random_block() {
        // seq_len = 3: [bos, a, b, c, a, b, c]
        let tokens = [0, 5, 6, 7, 5, 6, 7];
        let vocab = 8;
        let mut logits = peaked_logits(&tokens, vocab, 100.0);
        // Wreck the predictions inside the random block only.
        let wrong = Tensor::zeros((1, 4, vocab), DType::F32, &Device::Cpu).unwrap();
        logits = Tensor::cat(&[&wrong, &logits.narrow(1, 4, 3).unwrap()], 1).unwrap();

        let region = induction_region_loss(&logits, &token_tensor(&tokens)).unwrap();
        assert!(region.abs() < 1e-5, "region loss = {region}");
        let full = cross_entropy(&logits, &token_tensor(&tokens)).unwrap();
        assert!(full > 1.0);
    }

    #[test]
    fn induction_region_needs_two_positions() {
        let tokens = [0, 5, 5];
        let logits = peaked_logits(&tokens, 8, 1.0);
        assert!(matches!(
            induction_region_loss(&logits, &token_tensor(&tokens)),
            Err(MIError::InvalidArgument(_))
        ));
    }

    #[test]
    fn repetition_split_means() {
        let tokens = [0, 1, 2, 3, 1, 2, 3];
        let vocab = 4;
        // Uniform on the random block, confident on the repeat.
        let peaked = peaked_logits(&tokens, vocab, 100.0);
        let uniform = Tensor::zeros((1, 3, vocab), DType::F32, &Device::Cpu).unwrap();
        let logits = Tensor::cat(&[&uniform, &peaked.narrow(1, 3, 4).unwrap()], 1).unwrap();

        let split = repetition_log_probs(&logits, &token_tensor(&tokens)).unwrap();
        assert_eq!(split.seq_len, 3);
        assert_eq!(split.per_position.len(), 6);
        assert!((split.random_mean - (0.25_f32).ln()).abs() < 1e-5);
        assert!(split.repeated_mean.abs() < 1e-5);
        assert!(split.induction_gain() > 1.0);
    }
}
