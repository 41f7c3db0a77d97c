// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: repeated-sequence generation and next-token loss.

pub mod loss;
pub mod repeated;
