// SPDX-License-Identifier: MIT OR Apache-2.0

//! Repeated random token sequences for eliciting induction behaviour.
//!
//! Each row is `[bos, r_1 .. r_s, r_1 .. r_s]`: a beginning-of-sequence
//! marker, `s` tokens drawn uniformly from the vocabulary, then an exact copy
//! of those `s` tokens.  On the second block a model can only predict the
//! next token by finding the earlier occurrence of the current token and
//! copying what followed it, which is what induction heads do.

use candle_core::{Device, Tensor};
use rand::Rng;

use crate::backend::MIModel;
use crate::cache::AttentionCache;
use crate::error::{MIError, Result};

/// A batch of repeated token sequences, shape `[batch, 2 * seq_len + 1]`.
///
/// ```
/// use cirvis::util::repeated::generate_repeated_sequence;
///
/// let seq = generate_repeated_sequence(5, 2, 100, 0).unwrap();
/// assert_eq!(seq.total_len(), 11);
/// for b in 0..seq.batch() {
///     assert_eq!(seq.random_block(b), seq.repeated_block(b));
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    /// Row-major token ids, `batch * total_len` entries.
    ids: Vec<u32>,
    /// Number of rows.
    batch: usize,
    /// Length of the random block (half of the sequence after BOS).
    seq_len: usize,
}

impl TokenSequence {
    /// Number of rows.
    #[must_use]
    pub const fn batch(&self) -> usize {
        self.batch
    }

    /// Length of the random block.
    #[must_use]
    pub const fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Length of one row: `2 * seq_len + 1`.
    #[must_use]
    pub const fn total_len(&self) -> usize {
        2 * self.seq_len + 1
    }

    /// All ids, row-major.
    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.ids
    }

    /// One full row, BOS included.
    #[must_use]
    pub fn row(&self, b: usize) -> Option<&[u32]> {
        let start = b.checked_mul(self.total_len())?;
        self.ids.get(start..start + self.total_len())
    }

    /// The random block of row `b` (positions `1..=seq_len`).
    #[must_use]
    pub fn random_block(&self, b: usize) -> Option<&[u32]> {
        self.row(b)?.get(1..=self.seq_len)
    }

    /// The repeated block of row `b` (positions `seq_len + 1..`).
    #[must_use]
    pub fn repeated_block(&self, b: usize) -> Option<&[u32]> {
        self.row(b)?.get(self.seq_len + 1..)
    }

    /// Build the `[batch, 2 * seq_len + 1]` `u32` input tensor.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] if tensor allocation on `device` fails.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        // BORROW: Tensor::from_vec takes ownership of its buffer
        Ok(Tensor::from_vec(
            self.ids.clone(),
            (self.batch, self.total_len()),
            device,
        )?)
    }
}

/// Generate repeated sequences with the thread-local RNG.
///
/// # Errors
///
/// Returns [`MIError::InvalidArgument`] if `seq_len` or `batch` is zero, or
/// `vocab_size` is zero or does not fit `u32` token ids.
pub fn generate_repeated_sequence(
    seq_len: usize,
    batch: usize,
    vocab_size: usize,
    bos_id: u32,
) -> Result<TokenSequence> {
    let mut rng = rand::thread_rng();
    generate_repeated_sequence_with_rng(&mut rng, seq_len, batch, vocab_size, bos_id)
}

/// Generate repeated sequences from a caller-supplied RNG.
///
/// Passing a seeded RNG (e.g. `StdRng::seed_from_u64`) makes the output
/// reproducible.
///
/// # Errors
///
/// Same as [`generate_repeated_sequence`].
pub fn generate_repeated_sequence_with_rng<R: Rng + ?Sized>(
    rng: &mut R,
    seq_len: usize,
    batch: usize,
    vocab_size: usize,
    bos_id: u32,
) -> Result<TokenSequence> {
    if seq_len == 0 {
        return Err(MIError::InvalidArgument("seq_len must be at least 1".into()));
    }
    if batch == 0 {
        return Err(MIError::InvalidArgument("batch must be at least 1".into()));
    }
    if vocab_size == 0 {
        return Err(MIError::InvalidArgument("vocab_size must be positive".into()));
    }
    let vocab = u32::try_from(vocab_size).map_err(|_| {
        MIError::InvalidArgument(format!("vocab_size {vocab_size} exceeds u32 token ids"))
    })?;

    let total_len = 2 * seq_len + 1;
    let mut ids = Vec::with_capacity(batch * total_len);
    for _ in 0..batch {
        let block: Vec<u32> = (0..seq_len).map(|_| rng.gen_range(0..vocab)).collect();
        ids.push(bos_id);
        ids.extend_from_slice(&block);
        ids.extend_from_slice(&block);
    }

    Ok(TokenSequence {
        ids,
        batch,
        seq_len,
    })
}

// ---------------------------------------------------------------------------
// Run-and-cache helper
// ---------------------------------------------------------------------------

/// Output of [`run_and_cache_repeated_tokens`].
#[derive(Debug)]
pub struct RepeatedRun {
    /// The single repeated sequence that was run.
    pub tokens: TokenSequence,
    /// Logits, `[1, 2 * seq_len + 1, d_vocab]`.
    pub logits: Tensor,
    /// Attention patterns of every layer, batch axis removed.
    pub cache: AttentionCache,
}

/// Generate one repeated sequence for `model` and run it with every
/// attention pattern captured.
///
/// Tokens are drawn from the model's vocabulary and prefixed with its BOS id.
///
/// # Errors
///
/// Returns [`MIError::InvalidArgument`] for a zero `seq_len`, and
/// propagates forward-pass and cache-construction errors.
pub fn run_and_cache_repeated_tokens<R: Rng + ?Sized>(
    model: &MIModel,
    seq_len: usize,
    rng: &mut R,
) -> Result<RepeatedRun> {
    let config = model.config();
    let tokens =
        generate_repeated_sequence_with_rng(rng, seq_len, 1, config.d_vocab, config.bos_token_id)?;
    if tokens.total_len() > config.n_ctx {
        return Err(MIError::InvalidArgument(format!(
            "sequence of {} tokens exceeds context length {}",
            tokens.total_len(),
            config.n_ctx
        )));
    }

    let input = tokens.to_tensor(model.device())?;
    let (logits, cache) = model.run_with_cache(&input)?;
    tracing::debug!(
        seq_len,
        layers = cache.n_layers(),
        "cached repeated-token run"
    );

    Ok(RepeatedRun {
        tokens,
        logits,
        cache,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn second_half_repeats_first_half() {
        for (seq_len, batch) in [(1, 1), (7, 3), (50, 2)] {
            let seq = generate_repeated_sequence(seq_len, batch, 1000, 0).unwrap();
            assert_eq!(seq.batch(), batch);
            assert_eq!(seq.as_slice().len(), batch * (2 * seq_len + 1));
            for b in 0..batch {
                let row = seq.row(b).unwrap();
                assert_eq!(row.len(), 2 * seq_len + 1);
                assert_eq!(row[0], 0);
                assert_eq!(seq.random_block(b).unwrap(), seq.repeated_block(b).unwrap());
            }
        }
    }

    #[test]
    fn tokens_stay_in_vocab() {
        let seq = generate_repeated_sequence(200, 2, 7, 6).unwrap();
        assert!(seq.as_slice().iter().all(|&t| t < 7));
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let a = generate_repeated_sequence_with_rng(&mut StdRng::seed_from_u64(398), 25, 2, 50278, 0)
            .unwrap();
        let b = generate_repeated_sequence_with_rng(&mut StdRng::seed_from_u64(398), 25, 2, 50278, 0)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_arguments_rejected() {
        assert!(matches!(
            generate_repeated_sequence(0, 1, 10, 0),
            Err(MIError::InvalidArgument(_))
        ));
        assert!(matches!(
            generate_repeated_sequence(3, 0, 10, 0),
            Err(MIError::InvalidArgument(_))
        ));
        assert!(matches!(
            generate_repeated_sequence(3, 1, 0, 0),
            Err(MIError::InvalidArgument(_))
        ));
    }

    #[test]
    fn out_of_range_row_is_none() {
        let seq = generate_repeated_sequence(3, 1, 10, 0).unwrap();
        assert!(seq.row(1).is_none());
        assert!(seq.random_block(1).is_none());
    }

    #[test]
    fn to_tensor_shape() {
        let seq = generate_repeated_sequence(4, 3, 10, 0).unwrap();
        let tensor = seq.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, 9]);
        let rows: Vec<Vec<u32>> = tensor.to_vec2().unwrap();
        assert_eq!(rows[2].as_slice(), seq.row(2).unwrap());
    }
}
