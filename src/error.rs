// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for cirvis.

/// Errors that can occur while classifying or ablating attention heads.
#[derive(Debug, thiserror::Error)]
pub enum MIError {
    /// Tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Bad sequence length, batch size, threshold, layer or head index.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Cache or logits dimensions disagree with the declared model shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The injected model runner failed during a forward pass.
    #[error("model runner failed during {context}: {source}")]
    Collaborator {
        /// Which pass was running (baseline, or a specific layer/head).
        context: String,
        /// The underlying failure.
        #[source]
        source: Box<MIError>,
    },

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Intervention validation or application error.
    #[error("intervention error: {0}")]
    Intervention(String),

    /// Model configuration parsing error.
    #[error("config error: {0}")]
    Config(String),
}

impl MIError {
    /// Wrap a runner failure with the pass it happened in.
    pub(crate) fn collaborator(context: impl Into<String>, source: Self) -> Self {
        Self::Collaborator {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// Result type alias for cirvis operations.
pub type Result<T> = std::result::Result<T, MIError>;
