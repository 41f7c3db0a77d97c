// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: the full induction-head pipeline against a synthetic
//! two-layer backend.
//!
//! The backend plants induction heads at layer 1 heads 4 and 10: their
//! attention patterns sit on the induction diagonal, and their value outputs
//! gate a logit boost for the token that followed the previous occurrence of
//! the current token.  Every other head attends uniformly and has no effect
//! on the logits.
//!
//! Run:
//!   `cargo test --test induction_pipeline`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    missing_docs
)]

use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;

use cirvis::{
    HeadAblation, HeadClassifier, HeadTemplate, HookCache, HookPoint, HookSpec, MIBackend, MIError,
    MIModel, ModelConfig, ModelRunner, classify_heads, induction_region_loss,
    repetition_log_probs, run_and_cache_repeated_tokens, score_ablation,
};

// ---------------------------------------------------------------------------
// Synthetic backend
// ---------------------------------------------------------------------------

const INDUCTION_HEADS: [(usize, usize); 2] = [(1, 4), (1, 10)];
const STRENGTH: f32 = 4.0;

struct ToyInductionBackend {
    config: ModelConfig,
}

impl ToyInductionBackend {
    fn new() -> Self {
        Self {
            config: ModelConfig {
                n_layers: 2,
                n_heads: 12,
                d_head: 1,
                d_model: 12,
                d_vocab: 64,
                n_ctx: 256,
                bos_token_id: 0,
            },
        }
    }

    /// `[n_heads, t, t]` pattern for one layer.
    fn layer_pattern(&self, layer: usize, t: usize) -> Vec<f32> {
        let half = (t - 1) / 2;
        let mut data = Vec::with_capacity(self.config.n_heads * t * t);
        for head in 0..self.config.n_heads {
            let induction = INDUCTION_HEADS.contains(&(layer, head));
            for i in 0..t {
                for j in 0..t {
                    // rows before the induction diagonal starts attend uniformly
                    let target = (i + 1).checked_sub(half).filter(|_| induction);
                    let weight = if let Some(target) = target {
                        if j == target { 1.0 } else { 0.0 }
                    } else if j <= i {
                        1.0 / (i + 1) as f32
                    } else {
                        0.0
                    };
                    data.push(weight);
                }
            }
        }
        data
    }

    /// Mean of head `head`'s value output after interventions.
    fn head_gate(values: &Tensor, head: usize) -> f32 {
        values
            .narrow(1, head, 1)
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }
}

impl MIBackend for ToyInductionBackend {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> cirvis::Result<HookCache> {
        let (batch, t) = input_ids.dims2()?;
        let device = input_ids.device();
        let n_heads = self.config.n_heads;
        let mut captured = Vec::new();
        let mut boost = 0.0_f32;

        for layer in 0..self.config.n_layers {
            if hooks.is_captured(&HookPoint::AttnPattern(layer)) {
                let one = Tensor::from_vec(self.layer_pattern(layer, t), (1, n_heads, t, t), device)?;
                let pattern = one.repeat((batch, 1, 1, 1))?;
                captured.push((HookPoint::AttnPattern(layer), pattern));
            }

            let values = Tensor::ones((batch, n_heads, t, 1), DType::F32, device)?;
            let values = hooks.apply_at(&HookPoint::AttnV(layer), values)?;
            for &(l, head) in &INDUCTION_HEADS {
                if l == layer {
                    boost += STRENGTH * Self::head_gate(&values, head);
                }
            }
        }

        let ids: Vec<Vec<u32>> = input_ids.to_vec2()?;
        let vocab = self.config.d_vocab;
        let half = (t - 1) / 2;
        let mut logits = vec![0.0_f32; batch * t * vocab];
        for (b, row) in ids.iter().enumerate() {
            for pos in half + 1..t - 1 {
                let predicted = row[pos + 1 - half] as usize;
                logits[(b * t + pos) * vocab + predicted] += boost;
            }
        }

        let mut cache = HookCache::new(Tensor::from_vec(logits, (batch, t, vocab), device)?);
        for (hook, tensor) in captured {
            cache.store(hook, tensor);
        }
        Ok(cache)
    }
}

fn toy_model() -> MIModel {
    MIModel::new(Box::new(ToyInductionBackend::new()), Device::Cpu)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn classifies_planted_induction_heads() {
    let model = toy_model();
    let run = run_and_cache_repeated_tokens(&model, 50, &mut StdRng::seed_from_u64(7)).unwrap();
    assert_eq!(run.tokens.total_len(), 101);
    assert_eq!(run.logits.dims(), &[1, 101, 64]);
    assert_eq!(run.cache.n_layers(), 2);

    let induction = classify_heads(&run.cache, 2, 12, HeadTemplate::Induction, 0.4).unwrap();
    assert_eq!(induction.get(1), Some(&[4, 10][..]));
    assert!(induction.get(0).is_none());
    assert_eq!(induction.num_heads(), 2);

    let classifier = HeadClassifier::from_config(model.config());
    for (template, heads) in classifier.classify_all(&run.cache).unwrap() {
        if template != HeadTemplate::Induction {
            assert!(heads.is_empty(), "{template} matched {heads:?}");
        }
    }
}

#[test]
fn ablation_singles_out_induction_heads() {
    let model = toy_model();
    let run = run_and_cache_repeated_tokens(&model, 20, &mut StdRng::seed_from_u64(11)).unwrap();
    let tokens = run.tokens.to_tensor(&Device::Cpu).unwrap();

    let scores = score_ablation(&model, &tokens).unwrap();
    assert_eq!(scores.len(), 24);
    for layer in 0..2 {
        for head in 0..12 {
            let delta = scores.get(layer, head).unwrap();
            assert!(delta.is_finite());
            if INDUCTION_HEADS.contains(&(layer, head)) {
                assert!(delta > 0.0, "head {layer}.{head} delta {delta}");
            } else {
                assert!(delta.abs() < 1e-6, "head {layer}.{head} delta {delta}");
            }
        }
    }

    let top: Vec<(usize, usize)> = scores
        .top_heads(2)
        .into_iter()
        .map(|(l, h, _)| (l, h))
        .collect();
    assert!(top.contains(&(1, 4)));
    assert!(top.contains(&(1, 10)));
}

#[test]
fn ablation_is_scoped_to_one_call() {
    let model = toy_model();
    let run = run_and_cache_repeated_tokens(&model, 10, &mut StdRng::seed_from_u64(3)).unwrap();
    let tokens = run.tokens.to_tensor(&Device::Cpu).unwrap();

    let before = induction_region_loss(&model.run(&tokens).unwrap(), &tokens).unwrap();
    let ablated = model.run_with_head_zeroed(&tokens, 1, 4).unwrap();
    let ablated_loss = induction_region_loss(&ablated, &tokens).unwrap();
    let after = induction_region_loss(&model.run(&tokens).unwrap(), &tokens).unwrap();

    assert!(ablated_loss > before);
    assert!((after - before).abs() < 1e-6);
}

#[test]
fn repeated_block_is_predicted_better() {
    let model = toy_model();
    let run = run_and_cache_repeated_tokens(&model, 30, &mut StdRng::seed_from_u64(5)).unwrap();
    let tokens = run.tokens.to_tensor(&Device::Cpu).unwrap();

    let log_probs = repetition_log_probs(&run.logits, &tokens).unwrap();
    assert_eq!(log_probs.seq_len, 30);
    assert_eq!(log_probs.per_position.len(), 60);
    assert!(log_probs.induction_gain() > 1.0);
}

#[test]
fn out_of_range_ablation_is_rejected() {
    let model = toy_model();
    let tokens = Tensor::zeros((1, 9), DType::U32, &Device::Cpu).unwrap();

    assert!(matches!(
        model.run_with_head_zeroed(&tokens, 2, 0),
        Err(MIError::InvalidArgument(_))
    ));
    assert!(matches!(
        model.run_ablated(&tokens, Some(HeadAblation::new(0, 12))),
        Err(MIError::InvalidArgument(_))
    ));
}

#[test]
fn sequence_longer_than_context_is_rejected() {
    let model = toy_model();
    let err = run_and_cache_repeated_tokens(&model, 200, &mut StdRng::seed_from_u64(1)).unwrap_err();
    assert!(matches!(err, MIError::InvalidArgument(_)));
}
