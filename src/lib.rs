// SPDX-License-Identifier: MIT OR Apache-2.0

//! # cirvis
//!
//! Circuit discovery for small attention-only transformers, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! cirvis finds the attention heads behind in-context copying.  It feeds a
//! model repeated random token sequences, captures every layer's attention
//! pattern through `TransformerLens`-style hook points, and then:
//!
//! - classifies heads against diagonal attention templates (current token,
//!   previous token, first token, induction);
//! - scores every head causally by zero-ablating it and measuring the rise
//!   in next-token loss on the repeated half.
//!
//! The forward pass itself comes from an [`MIBackend`] implementation; the
//! crate ships the analysis, not the model.
//!
//! ## Example
//!
//! ```
//! use cirvis::{HeadScoreMap, ModelConfig};
//!
//! let config = ModelConfig::attn_only_2l();
//! assert_eq!(config.n_heads, 12);
//!
//! let mut induction = HeadScoreMap::new();
//! induction.insert(1, 10);
//! induction.insert(1, 4);
//! assert_eq!(induction.get(1), Some(&[4, 10][..]));
//! ```

#![deny(warnings)]
#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod hooks;
pub mod interp;
pub mod util;

// --- Core re-exports ---

pub use backend::{MIBackend, MIModel, ModelRunner};
pub use cache::{AttentionCache, PatternLookup};
pub use config::ModelConfig;
pub use error::{MIError, Result};
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention, apply_intervention};

// --- Interpretability re-exports ---

pub use interp::ablation::{AblationScoreMatrix, HeadAblation, score_ablation};
pub use interp::heads::{
    DEFAULT_THRESHOLD, HeadClassifier, HeadScoreGrid, HeadScoreMap, HeadTemplate, classify_heads,
    template_score,
};

// --- Utility re-exports ---

pub use util::loss::{
    RepetitionLogProbs, cross_entropy, induction_region_loss, log_probs_for_targets,
    repetition_log_probs,
};
pub use util::repeated::{
    RepeatedRun, TokenSequence, generate_repeated_sequence, generate_repeated_sequence_with_rng,
    run_and_cache_repeated_tokens,
};
