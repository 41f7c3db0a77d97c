// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interpretability tools: head classification and ablation scoring.
//!
//! - [`heads`] : Diagonal-offset templates that sort heads into
//!   current-token, previous-token, first-token and induction heads.
//! - [`ablation`] : Single-head zero ablation and loss-delta importance
//!   scores.

pub mod ablation;
pub mod heads;
