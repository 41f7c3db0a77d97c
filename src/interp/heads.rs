// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention-head classification by diagonal-offset templates.
//!
//! Each [`HeadTemplate`] reduces one head's `[dest, src]` attention matrix
//! to a scalar: the mean attention along one diagonal (or column).  A head
//! belongs to a category when that mean is strictly above a threshold
//! ([`DEFAULT_THRESHOLD`] unless overridden).
//!
//! | Template | Entries averaged |
//! |----------|------------------|
//! | current-token | `[i, i]` |
//! | previous-token | `[i, i - 1]` |
//! | first-token | `[i, 0]` |
//! | induction | `[i, i - (h - 1)]`, `h = (n - 1) / 2` |
//!
//! The induction offset is derived from the matrix's own size `n`, so it is
//! only meaningful for patterns computed on a repeated sequence
//! (`[bos, block, block]`, see [`crate::util::repeated`]).  On any other
//! input the score is still computed but carries no meaning.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use serde::Serialize;

use crate::cache::PatternLookup;
use crate::cache::attention::strip_batch_axis;
use crate::config::ModelConfig;
use crate::error::{MIError, Result};

/// Score a head must exceed to be classified.
pub const DEFAULT_THRESHOLD: f32 = 0.4;

// ---------------------------------------------------------------------------
// HeadTemplate
// ---------------------------------------------------------------------------

/// Behavioural template a head's attention pattern is scored against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeadTemplate {
    /// Attends to its own position.
    CurrentToken,
    /// Attends to the position just before it.
    PreviousToken,
    /// Attends to the first position.
    FirstToken,
    /// Attends to the token after the previous occurrence of the current token.
    Induction,
}

impl HeadTemplate {
    /// Every template, in display order.
    pub const ALL: [Self; 4] = [
        Self::CurrentToken,
        Self::PreviousToken,
        Self::FirstToken,
        Self::Induction,
    ];

    /// Short lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CurrentToken => "current-token",
            Self::PreviousToken => "previous-token",
            Self::FirstToken => "first-token",
            Self::Induction => "induction",
        }
    }

    /// Reduce a square `[dest, src]` matrix to this template's score.
    ///
    /// Returns NaN when the selected entries are empty (e.g. the previous-token
    /// diagonal of a 1x1 matrix); NaN never exceeds a threshold.
    #[must_use]
    pub fn score(self, rows: &[Vec<f32>]) -> f32 {
        match self {
            Self::CurrentToken => lower_diagonal_mean(rows, 0),
            Self::PreviousToken => lower_diagonal_mean(rows, 1),
            Self::FirstToken => column_mean(rows, 0),
            Self::Induction => {
                let half = rows.len().saturating_sub(1) / 2;
                match half.checked_sub(1) {
                    Some(lag) => lower_diagonal_mean(rows, lag),
                    // half == 0: the offset lands one above the main diagonal
                    None => upper_diagonal_mean(rows, 1),
                }
            }
        }
    }
}

impl fmt::Display for HeadTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HeadTemplate {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "current" | "current-token" | "current_token" => Ok(Self::CurrentToken),
            "previous" | "prev" | "previous-token" | "previous_token" => Ok(Self::PreviousToken),
            "first" | "first-token" | "first_token" => Ok(Self::FirstToken),
            "induction" => Ok(Self::Induction),
            other => Err(MIError::InvalidArgument(format!(
                "unknown head template '{other}'"
            ))),
        }
    }
}

/// Mean of entries `[i, i - lag]`.
fn lower_diagonal_mean(rows: &[Vec<f32>], lag: usize) -> f32 {
    mean_of(
        rows.iter()
            .enumerate()
            .filter_map(|(i, row)| i.checked_sub(lag).and_then(|j| row.get(j)).copied()),
    )
}

/// Mean of entries `[i, i + lead]`.
fn upper_diagonal_mean(rows: &[Vec<f32>], lead: usize) -> f32 {
    mean_of(
        rows.iter()
            .enumerate()
            .filter_map(|(i, row)| row.get(i + lead).copied()),
    )
}

/// Mean of column `col` over every row.
fn column_mean(rows: &[Vec<f32>], col: usize) -> f32 {
    mean_of(rows.iter().filter_map(|row| row.get(col).copied()))
}

/// Mean of an iterator, NaN when empty.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn mean_of(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0.0_f32, 0_usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        f32::NAN
    } else {
        sum / count as f32
    }
}

/// Score a single head's attention matrix.
///
/// # Shapes
/// - `pattern`: `[dest, src]`
///
/// # Errors
///
/// Returns [`MIError::ShapeMismatch`] if `pattern` is not a square matrix.
pub fn template_score(pattern: &Tensor, template: HeadTemplate) -> Result<f32> {
    let (dest, src) = pattern.dims2().map_err(|_| {
        MIError::ShapeMismatch(format!(
            "expected a [dest, src] matrix, got {:?}",
            pattern.dims()
        ))
    })?;
    if dest != src {
        return Err(MIError::ShapeMismatch(format!(
            "attention pattern must be square, got [{dest}, {src}]"
        )));
    }
    // PROMOTE: patterns may be stored in half precision
    let rows: Vec<Vec<f32>> = pattern.to_dtype(DType::F32)?.to_vec2()?;
    Ok(template.score(&rows))
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Sparse map from layer to the heads that passed a template.
///
/// Head lists are ascending and duplicate-free; layers with no qualifying
/// head are absent rather than mapped to an empty list.
///
/// ```
/// use cirvis::HeadScoreMap;
///
/// let map: HeadScoreMap = [(1, vec![10, 4, 4]), (0, vec![])].into_iter().collect();
/// assert_eq!(map.get(1), Some(&[4, 10][..]));
/// assert_eq!(map.get(0), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HeadScoreMap(BTreeMap<usize, Vec<usize>>);

impl HeadScoreMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `head` in `layer` qualifies.
    ///
    /// Keeps the layer's list sorted; inserting an existing head is a no-op.
    pub fn insert(&mut self, layer: usize, head: usize) {
        let heads = self.0.entry(layer).or_default();
        if let Err(pos) = heads.binary_search(&head) {
            heads.insert(pos, head);
        }
    }

    /// Heads of `layer`, if any qualified.
    #[must_use]
    pub fn get(&self, layer: usize) -> Option<&[usize]> {
        self.0.get(&layer).map(Vec::as_slice)
    }

    /// Whether `(layer, head)` qualified.
    #[must_use]
    pub fn contains(&self, layer: usize, head: usize) -> bool {
        self.get(layer)
            .is_some_and(|heads| heads.binary_search(&head).is_ok())
    }

    /// Iterate `(layer, heads)` in ascending layer order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[usize])> {
        self.0.iter().map(|(layer, heads)| (*layer, heads.as_slice()))
    }

    /// Iterate every qualifying `(layer, head)` pair, layer-major.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.0
            .iter()
            .flat_map(|(layer, heads)| heads.iter().map(move |head| (*layer, *head)))
    }

    /// Whether no head qualified.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of qualifying heads.
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// The underlying nested mapping.
    #[must_use]
    pub const fn as_map(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.0
    }
}

impl FromIterator<(usize, Vec<usize>)> for HeadScoreMap {
    fn from_iter<I: IntoIterator<Item = (usize, Vec<usize>)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (layer, heads) in iter {
            for head in heads {
                map.insert(layer, head);
            }
        }
        map
    }
}

impl From<HeadScoreMap> for BTreeMap<usize, Vec<usize>> {
    fn from(map: HeadScoreMap) -> Self {
        map.0
    }
}

/// Dense `[layer, head]` template scores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeadScoreGrid {
    /// Template the scores were computed for.
    template: HeadTemplate,
    /// Number of layers (rows).
    n_layers: usize,
    /// Heads per layer (columns).
    n_heads: usize,
    /// Row-major scores.
    scores: Vec<f32>,
}

impl HeadScoreGrid {
    /// Template the scores were computed for.
    #[must_use]
    pub const fn template(&self) -> HeadTemplate {
        self.template
    }

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

    /// Score of one head.
    #[must_use]
    pub fn get(&self, layer: usize, head: usize) -> Option<f32> {
        if layer >= self.n_layers || head >= self.n_heads {
            return None;
        }
        self.scores.get(layer * self.n_heads + head).copied()
    }

    /// Scores of one layer.
    #[must_use]
    pub fn row(&self, layer: usize) -> Option<&[f32]> {
        if layer >= self.n_layers {
            return None;
        }
        let start = layer * self.n_heads;
        self.scores.get(start..start + self.n_heads)
    }

    /// Threshold the grid into a sparse [`HeadScoreMap`] (strict `>`).
    #[must_use]
    pub fn above(&self, threshold: f32) -> HeadScoreMap {
        let mut map = HeadScoreMap::new();
        for layer in 0..self.n_layers {
            for head in 0..self.n_heads {
                if self.get(layer, head).is_some_and(|score| score > threshold) {
                    map.insert(layer, head);
                }
            }
        }
        map
    }

    /// The grid as a `[n_layers, n_heads]` tensor.
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
// HeadClassifier
// ---------------------------------------------------------------------------

/// Classifies attention heads of a cached forward pass.
///
/// Read-only over the cache: calling it repeatedly, or from several threads
/// at once, returns identical results.
///
/// ```
/// use cirvis::{AttentionCache, HeadClassifier, HeadTemplate};
/// use candle_core::{Device, Tensor};
///
/// // One layer, one head, attending to the previous position.
/// #[rustfmt::skip]
/// let pattern = Tensor::from_vec(vec![
///     1.0_f32, 0.0, 0.0,
///     1.0,     0.0, 0.0,
///     0.0,     1.0, 0.0,
/// ], (1, 3, 3), &Device::Cpu).unwrap();
/// let mut cache = AttentionCache::with_capacity(1);
/// cache.push(pattern).unwrap();
///
/// let classifier = HeadClassifier::new(1, 1);
/// let prev = classifier.classify(&cache, HeadTemplate::PreviousToken).unwrap();
/// assert!(prev.contains(0, 0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadClassifier {
    /// Declared number of layers.
    n_layers: usize,
    /// Declared heads per layer.
    n_heads: usize,
    /// Strict lower bound a score must exceed.
    threshold: f32,
}

impl HeadClassifier {
    /// Classifier for a model with the given shape, at [`DEFAULT_THRESHOLD`].
    #[must_use]
    pub const fn new(n_layers: usize, n_heads: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Classifier for the model described by `config`.
    #[must_use]
    pub const fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.n_layers, config.n_heads)
    }

    /// Replace the threshold.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::InvalidArgument`] if `threshold` is NaN or infinite.
    pub fn with_threshold(mut self, threshold: f32) -> Result<Self> {
        if !threshold.is_finite() {
            return Err(MIError::InvalidArgument(format!(
                "threshold must be finite, got {threshold}"
            )));
        }
        self.threshold = threshold;
        Ok(self)
    }

    /// Current threshold.
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Dense per-head scores for `template`.
    ///
    /// Every layer is looked up and shape-checked before any score is
    /// computed.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::ShapeMismatch`] if a layer is missing from the
    /// cache or its pattern is not `[n_heads, n, n]`.
    pub fn scores<C: PatternLookup + ?Sized>(
        &self,
        cache: &C,
        template: HeadTemplate,
    ) -> Result<HeadScoreGrid> {
        let layers = self.load_layers(cache)?;

        let mut scores = Vec::with_capacity(self.n_layers * self.n_heads);
        for layer in &layers {
            // PROMOTE: patterns may be stored in half precision
            let heads: Vec<Vec<Vec<f32>>> = layer.to_dtype(DType::F32)?.to_vec3()?;
            scores.extend(heads.iter().map(|rows| template.score(rows)));
        }

        Ok(HeadScoreGrid {
            template,
            n_layers: self.n_layers,
            n_heads: self.n_heads,
            scores,
        })
    }

    /// Heads whose `template` score is strictly above the threshold.
    ///
    /// # Errors
    ///
    /// Same as [`scores`](Self::scores).
    pub fn classify<C: PatternLookup + ?Sized>(
        &self,
        cache: &C,
        template: HeadTemplate,
    ) -> Result<HeadScoreMap> {
        let map = self.scores(cache, template)?.above(self.threshold);
        tracing::debug!(
            template = %template,
            threshold = self.threshold,
            heads = map.num_heads(),
            "classified heads"
        );
        Ok(map)
    }

    /// Run every template in [`HeadTemplate::ALL`].
    ///
    /// # Errors
    ///
    /// Same as [`scores`](Self::scores).
    pub fn classify_all<C: PatternLookup + ?Sized>(
        &self,
        cache: &C,
    ) -> Result<Vec<(HeadTemplate, HeadScoreMap)>> {
        HeadTemplate::ALL
            .iter()
            .map(|&template| Ok((template, self.classify(cache, template)?)))
            .collect()
    }

    /// Fetch and validate the pattern of every declared layer.
    fn load_layers<C: PatternLookup + ?Sized>(&self, cache: &C) -> Result<Vec<Tensor>> {
        let mut layers = Vec::with_capacity(self.n_layers);
        for layer in 0..self.n_layers {
            let raw = cache.layer_pattern(layer).map_err(|e| {
                MIError::ShapeMismatch(format!(
                    "cache has no pattern for layer {layer} of {}: {e}",
                    self.n_layers
                ))
            })?;
            let pattern = strip_batch_axis(raw)?;
            let n_heads = pattern.dim(0)?;
            if n_heads != self.n_heads {
                return Err(MIError::ShapeMismatch(format!(
                    "layer {layer} pattern has {n_heads} heads, model declares {}",
                    self.n_heads
                )));
            }
            layers.push(pattern);
        }
        Ok(layers)
    }
}

/// Classify heads against one template.
///
/// Convenience wrapper over [`HeadClassifier`].
///
/// # Errors
///
/// Returns [`MIError::InvalidArgument`] for a non-finite threshold and
/// [`MIError::ShapeMismatch`] if the cache disagrees with
/// `n_layers` / `n_heads`.
pub fn classify_heads<C: PatternLookup + ?Sized>(
    cache: &C,
    n_layers: usize,
    n_heads: usize,
    template: HeadTemplate,
    threshold: f32,
) -> Result<HeadScoreMap> {
    HeadClassifier::new(n_layers, n_heads)
        .with_threshold(threshold)?
        .classify(cache, template)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]
mod tests {
    use super::*;
    use crate::cache::AttentionCache;
    use crate::hooks::{HookCache, HookPoint};

    /// `[n, n]` matrix with 1.0 at `[i, f(i)]` where `f` returns a column.
    fn one_hot(n: usize, f: impl Fn(usize) -> Option<usize>) -> Vec<f32> {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            if let Some(j) = f(i) {
                data[i * n + j] = 1.0;
            }
        }
        data
    }

    /// `[n, n]` causal uniform attention.
    fn causal_uniform(n: usize) -> Vec<f32> {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                data[i * n + j] = 1.0 / (i + 1) as f32;
            }
        }
        data
    }

    /// Cache with `n_layers` layers of `heads` (flattened `[n, n]` each).
    fn cache_from(layers: Vec<Vec<Vec<f32>>>, n: usize) -> AttentionCache {
        let mut cache = AttentionCache::with_capacity(layers.len());
        for heads in layers {
            let n_heads = heads.len();
            let flat: Vec<f32> = heads.into_iter().flatten().collect();
            cache
                .push(Tensor::from_vec(flat, (n_heads, n, n), &Device::Cpu).unwrap())
                .unwrap();
        }
        cache
    }

    fn rows(data: &[f32], n: usize) -> Vec<Vec<f32>> {
        data.chunks(n).map(<[f32]>::to_vec).collect()
    }

    #[test]
    fn previous_token_diagonal_scores() {
        let n = 8;
        let prev = rows(&one_hot(n, |i| i.checked_sub(1)), n);
        assert_eq!(HeadTemplate::PreviousToken.score(&prev), 1.0);
        assert_eq!(HeadTemplate::CurrentToken.score(&prev), 0.0);

        let cache = cache_from(vec![vec![one_hot(n, |i| i.checked_sub(1))]], n);
        let classifier = HeadClassifier::new(1, 1);
        let prev_map = classifier.classify(&cache, HeadTemplate::PreviousToken).unwrap();
        let cur_map = classifier.classify(&cache, HeadTemplate::CurrentToken).unwrap();
        assert_eq!(prev_map, [(0, vec![0])].into_iter().collect());
        assert!(cur_map.is_empty());
    }

    #[test]
    fn first_token_column_scores() {
        let n = 6;
        let sink = rows(&one_hot(n, |_| Some(0)), n);
        assert_eq!(HeadTemplate::FirstToken.score(&sink), 1.0);
        // Only [0, 0] lies on the main diagonal.
        assert!((HeadTemplate::CurrentToken.score(&sink) - 1.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn induction_offset_follows_matrix_size() {
        // seq_len = 4 -> n = 9, half = 4, entries [i, i - 3]
        let n = 9;
        let induction = rows(&one_hot(n, |i| i.checked_sub(3)), n);
        assert_eq!(HeadTemplate::Induction.score(&induction), 1.0);
        assert_eq!(HeadTemplate::PreviousToken.score(&induction), 0.0);
    }

    #[test]
    fn tiny_matrices_degenerate_without_failing() {
        let single = vec![vec![1.0]];
        assert!(HeadTemplate::PreviousToken.score(&single).is_nan());
        assert!(HeadTemplate::Induction.score(&single).is_nan());

        // n = 2: half = 0, offset lands above the diagonal
        let two = vec![vec![1.0, 0.0], vec![0.5, 0.5]];
        assert_eq!(HeadTemplate::Induction.score(&two), 0.0);

        let cache = cache_from(vec![vec![vec![1.0]]], 1);
        let map = classify_heads(&cache, 1, 1, HeadTemplate::Induction, 0.4).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn induction_heads_on_repeated_sequence() {
        // seq_len = 50 -> n = 101, half = 50, induction lag 49
        let seq_len = 50;
        let n = 2 * seq_len + 1;
        let induction = one_hot(n, |i| i.checked_sub(seq_len - 1));
        let layers: Vec<Vec<Vec<f32>>> = (0..2)
            .map(|layer| {
                (0..12)
                    .map(|head| {
                        if layer == 1 && (head == 4 || head == 10) {
                            induction.clone()
                        } else {
                            causal_uniform(n)
                        }
                    })
                    .collect()
            })
            .collect();
        let cache = cache_from(layers, n);

        let map = classify_heads(&cache, 2, 12, HeadTemplate::Induction, DEFAULT_THRESHOLD).unwrap();
        assert_eq!(map, [(1, vec![4, 10])].into_iter().collect());
        assert_eq!(map.get(0), None);
    }

    #[test]
    fn classification_is_idempotent() {
        let n = 7;
        let cache = cache_from(
            vec![vec![causal_uniform(n), one_hot(n, |i| Some(i))]],
            n,
        );
        let classifier = HeadClassifier::new(1, 2);
        for template in HeadTemplate::ALL {
            let first = classifier.classify(&cache, template).unwrap();
            let second = classifier.classify(&cache, template).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn raising_threshold_never_adds_heads() {
        let n = 9;
        let blend: Vec<f32> = causal_uniform(n)
            .iter()
            .zip(one_hot(n, |i| i.checked_sub(1)))
            .map(|(u, p)| 0.5 * u + 0.5 * p)
            .collect();
        let cache = cache_from(
            vec![
                vec![causal_uniform(n), blend.clone(), one_hot(n, |_| Some(0))],
                vec![one_hot(n, |i| i.checked_sub(1)), blend, causal_uniform(n)],
            ],
            n,
        );

        for template in HeadTemplate::ALL {
            let mut previous: Option<HeadScoreMap> = None;
            for step in 0..=20 {
                let threshold = step as f32 * 0.05;
                let map = classify_heads(&cache, 2, 3, template, threshold).unwrap();
                if let Some(lower) = &previous {
                    assert!(map.pairs().all(|(l, h)| lower.contains(l, h)));
                }
                previous = Some(map);
            }
        }
    }

    #[test]
    fn scores_grid_is_dense() {
        let n = 5;
        let cache = cache_from(
            vec![vec![causal_uniform(n), one_hot(n, |i| Some(i))]; 3],
            n,
        );
        let grid = HeadClassifier::new(3, 2)
            .scores(&cache, HeadTemplate::CurrentToken)
            .unwrap();
        assert_eq!(grid.template(), HeadTemplate::CurrentToken);
        assert_eq!(grid.n_layers(), 3);
        assert_eq!(grid.row(2).unwrap().len(), 2);
        assert_eq!(grid.get(1, 1), Some(1.0));
        assert_eq!(grid.get(0, 2), None);
        assert_eq!(grid.to_tensor(&Device::Cpu).unwrap().dims(), &[3, 2]);
    }

    #[test]
    fn classify_all_covers_every_template() {
        let n = 5;
        let cache = cache_from(vec![vec![one_hot(n, |i| Some(i))]], n);
        let all = HeadClassifier::new(1, 1).classify_all(&cache).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].0, HeadTemplate::CurrentToken);
        assert!(all[0].1.contains(0, 0));
        assert!(all[1].1.is_empty());
    }

    #[test]
    fn shape_mismatch_before_scoring() {
        let n = 4;
        let cache = cache_from(vec![vec![causal_uniform(n); 2]; 2], n);

        let wrong_heads = classify_heads(&cache, 2, 12, HeadTemplate::Induction, 0.4);
        assert!(matches!(wrong_heads, Err(MIError::ShapeMismatch(_))));

        let wrong_layers = classify_heads(&cache, 3, 2, HeadTemplate::Induction, 0.4);
        assert!(matches!(wrong_layers, Err(MIError::ShapeMismatch(_))));
    }

    #[test]
    fn non_finite_threshold_rejected() {
        let cache = cache_from(vec![vec![causal_uniform(3)]], 3);
        for threshold in [f32::NAN, f32::INFINITY] {
            assert!(matches!(
                classify_heads(&cache, 1, 1, HeadTemplate::FirstToken, threshold),
                Err(MIError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn hook_cache_with_batch_axis_is_accepted() {
        let n = 4;
        let logits = Tensor::zeros((1, n, 3), DType::F32, &Device::Cpu).unwrap();
        let mut hook_cache = HookCache::new(logits);
        let pattern = Tensor::from_vec(one_hot(n, |_| Some(0)), (1, 1, n, n), &Device::Cpu).unwrap();
        hook_cache.store(HookPoint::AttnPattern(0), pattern);

        let map = classify_heads(&hook_cache, 1, 1, HeadTemplate::FirstToken, 0.4).unwrap();
        assert!(map.contains(0, 0));
    }

    #[test]
    fn template_score_on_tensor() {
        let n = 4;
        let pattern = Tensor::from_vec(one_hot(n, |i| Some(i)), (n, n), &Device::Cpu).unwrap();
        let score = template_score(&pattern, HeadTemplate::CurrentToken).unwrap();
        assert_eq!(score, 1.0);

        let flat = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        assert!(template_score(&flat, HeadTemplate::CurrentToken).is_err());
    }

    #[test]
    fn template_names_parse() {
        for template in HeadTemplate::ALL {
            assert_eq!(template.name().parse::<HeadTemplate>().unwrap(), template);
        }
        assert_eq!("prev".parse::<HeadTemplate>().unwrap(), HeadTemplate::PreviousToken);
        assert!("diagonal".parse::<HeadTemplate>().is_err());
    }

    #[test]
    fn score_map_keeps_invariants() {
        let mut map = HeadScoreMap::new();
        map.insert(3, 7);
        map.insert(3, 2);
        map.insert(3, 7);
        map.insert(0, 1);
        assert_eq!(map.get(3), Some(&[2, 7][..]));
        assert_eq!(map.num_heads(), 3);
        assert_eq!(map.iter().map(|(l, _)| l).collect::<Vec<_>>(), vec![0, 3]);

        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"0":[1],"3":[2,7]}"#);
    }

    #[test]
    fn grid_out_of_range_indices_are_none() {
        let n = 4;
        let cache = cache_from(vec![vec![causal_uniform(n); 3]; 2], n);
        let grid = HeadClassifier::new(2, 3)
            .scores(&cache, HeadTemplate::FirstToken)
            .unwrap();
        assert_eq!(grid.get(usize::MAX, 0), None);
        assert_eq!(grid.get(2, 0), None);
        assert_eq!(grid.get(0, usize::MAX), None);
        assert!(grid.row(usize::MAX).is_none());
        assert!(grid.row(usize::MAX / 3).is_none());
        assert!(grid.row(2).is_none());
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn classifier_and_cache_are_thread_safe() {
        assert_send_sync::<HeadClassifier>();
        assert_send_sync::<AttentionCache>();
        assert_send_sync::<HeadScoreMap>();

        let n = 7;
        let cache = cache_from(
            vec![vec![one_hot(n, |i| i.checked_sub(1)), causal_uniform(n)]; 2],
            n,
        );
        let classifier = HeadClassifier::new(2, 2);
        let expected = classifier.classify(&cache, HeadTemplate::PreviousToken).unwrap();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| classifier.classify(&cache, HeadTemplate::PreviousToken)))
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap().unwrap(), expected);
            }
        });
    }
}
