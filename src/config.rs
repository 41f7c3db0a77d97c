// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model configuration and `config.json` parsing.
//!
//! [`ModelConfig`] is the read-only description of the transformer under
//! study: the handful of dimensions the classifier, the ablation scorer and
//! the repeated-sequence generator need.  It accepts both
//! `TransformerLens`-style keys (`n_layers`, `d_model`, ...) and their
//! `HuggingFace` aliases (`num_hidden_layers`, `hidden_size`, ...).
//!
//! # Usage
//!
//! ```
//! use cirvis::ModelConfig;
//!
//! let json = serde_json::json!({
//!     "n_layers": 2, "n_heads": 12, "d_model": 768,
//!     "d_vocab": 50278, "n_ctx": 2048
//! });
//! let config = ModelConfig::from_json(&json).unwrap();
//! assert_eq!(config.d_head, 64);
//! assert_eq!(config.bos_token_id, 0);
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{MIError, Result};

/// Immutable description of a transformer's dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// Number of transformer blocks.
    pub n_layers: usize,
    /// Attention heads per block.
    pub n_heads: usize,
    /// Dimension of each head.
    pub d_head: usize,
    /// Residual stream width.
    pub d_model: usize,
    /// Vocabulary size.
    pub d_vocab: usize,
    /// Maximum context length.
    pub n_ctx: usize,
    /// Beginning-of-sequence token id.
    pub bos_token_id: u32,
}

impl ModelConfig {
    /// The two-layer attention-only model used for induction-head studies.
    ///
    /// 12 heads of width 64 per layer, GPT-NeoX vocabulary (BOS id 0).
    #[must_use]
    pub const fn attn_only_2l() -> Self {
        Self {
            n_layers: 2,
            n_heads: 12,
            d_head: 64,
            d_model: 768,
            d_vocab: 50278,
            n_ctx: 2048,
            bos_token_id: 0,
        }
    }

    /// Parse a configuration from a JSON object.
    ///
    /// `d_head` falls back to `d_model / n_heads`; `bos_token_id` defaults
    /// to `0`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if a required field is missing, a size is
    /// zero, or a value overflows.
    pub fn from_json(config: &Value) -> Result<Self> {
        let n_layers = get_usize_any(config, &["n_layers", "num_hidden_layers"])?;
        let n_heads = get_usize_any(config, &["n_heads", "num_attention_heads"])?;
        let d_model = get_usize_any(config, &["d_model", "hidden_size"])?;
        let d_vocab = get_usize_any(config, &["d_vocab", "vocab_size"])?;
        let n_ctx = get_usize_any(config, &["n_ctx", "max_position_embeddings"])?;
        let d_head = get_head_dim(config, d_model, n_heads)?;
        let bos_token_id = get_bos_token_id(config)?;

        let parsed = Self {
            n_layers,
            n_heads,
            d_head,
            d_model,
            d_vocab,
            n_ctx,
            bos_token_id,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check that every dimension is non-zero and the BOS id is in the vocabulary.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] on the first offending field.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("d_head", self.d_head),
            ("d_model", self.d_model),
            ("d_vocab", self.d_vocab),
            ("n_ctx", self.n_ctx),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(MIError::Config(format!("{name} must be non-zero")));
            }
        }
        let bos = usize::try_from(self.bos_token_id)
            .map_err(|_| MIError::Config("bos_token_id overflows usize".into()))?;
        if bos >= self.d_vocab {
            return Err(MIError::Config(format!(
                "bos_token_id {bos} outside vocabulary of size {}",
                self.d_vocab
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}L x {}H (d_model={}, d_head={}, d_vocab={}, n_ctx={})",
            self.n_layers, self.n_heads, self.d_model, self.d_head, self.d_vocab, self.n_ctx
        )
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field under the first key present.
fn get_usize_any(config: &Value, keys: &[&str]) -> Result<usize> {
    for key in keys {
        if let Some(raw) = config.get(*key) {
            let val = raw
                .as_u64()
                .ok_or_else(|| MIError::Config(format!("field '{key}' is not an integer")))?;
            return usize::try_from(val)
                .map_err(|_| MIError::Config(format!("field '{key}' value {val} overflows usize")));
        }
    }
    Err(MIError::Config(format!(
        "missing field '{}'",
        keys.first().copied().unwrap_or_default()
    )))
}

/// Extract `d_head`, falling back to `d_model / n_heads`.
fn get_head_dim(config: &Value, d_model: usize, n_heads: usize) -> Result<usize> {
    match config.get("d_head").or_else(|| config.get("head_dim")) {
        Some(raw) => {
            let val = raw
                .as_u64()
                .ok_or_else(|| MIError::Config("field 'd_head' is not an integer".into()))?;
            usize::try_from(val).map_err(|_| MIError::Config("d_head overflows usize".into()))
        }
        None if n_heads == 0 => Err(MIError::Config(
            "n_heads is 0, cannot compute d_head".into(),
        )),
        None => Ok(d_model / n_heads),
    }
}

/// Extract `bos_token_id`, defaulting to `0`.
fn get_bos_token_id(config: &Value) -> Result<u32> {
    match config.get("bos_token_id").and_then(Value::as_u64) {
        Some(val) => u32::try_from(val)
            .map_err(|_| MIError::Config(format!("bos_token_id {val} overflows u32"))),
        None => Ok(0),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_transformer_lens_keys() {
        let json = serde_json::json!({
            "n_layers": 2,
            "n_heads": 12,
            "d_head": 64,
            "d_model": 768,
            "d_vocab": 50278,
            "n_ctx": 2048
        });
        let config = ModelConfig::from_json(&json).unwrap();
        assert_eq!(config, ModelConfig::attn_only_2l());
    }

    #[test]
    fn parse_huggingface_aliases() {
        let json = serde_json::json!({
            "num_hidden_layers": 4,
            "num_attention_heads": 8,
            "hidden_size": 512,
            "vocab_size": 1000,
            "max_position_embeddings": 256,
            "bos_token_id": 1
        });
        let config = ModelConfig::from_json(&json).unwrap();
        assert_eq!(config.n_layers, 4);
        assert_eq!(config.n_heads, 8);
        assert_eq!(config.d_head, 64);
        assert_eq!(config.bos_token_id, 1);
    }

    #[test]
    fn missing_field_is_config_error() {
        let json = serde_json::json!({ "n_layers": 2, "n_heads": 12 });
        let err = ModelConfig::from_json(&json).unwrap_err();
        assert!(matches!(err, MIError::Config(_)));
    }

    #[test]
    fn zero_heads_rejected() {
        let json = serde_json::json!({
            "n_layers": 2, "n_heads": 0, "d_model": 768,
            "d_vocab": 100, "n_ctx": 64
        });
        assert!(ModelConfig::from_json(&json).is_err());
    }

    #[test]
    fn bos_outside_vocab_rejected() {
        let config = ModelConfig {
            bos_token_id: 10,
            d_vocab: 10,
            ..ModelConfig::attn_only_2l()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn display_summary() {
        let text = ModelConfig::attn_only_2l().to_string();
        assert!(text.starts_with("2L x 12H"));
    }
}
