// Change-Point Detector
// Partitions sample sequences and decides whether partitions differ significantly

pub mod energy;
pub mod permutation;

// Re-export key types
pub use energy::{energy, SplitStatistics};
pub use permutation::{p_value, EXACT_LIMIT, PERMUTATIONS};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use thiserror::Error;

/// p-value at or below which two partitions are considered different
pub const SIGNIFICANCE: f64 = 0.05;

/// Fraction of the best split's energy within which neighbouring splits tie
pub const TIE_RATIO: f64 = 0.9;

/// Segments shorter than this are not split any further
const MIN_SEGMENT_LEN: usize = 4;

/// Upper bound on segments examined by one search
const MAX_SEGMENTS: usize = 10_000;

/// Seed of the generator used by [`cluster_and_compare`]
const COMPARE_SEED: u64 = 0x5eed;

/// Result of comparing two sample sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Different,
    Same,
    Unknown,
}

impl std::fmt::Display for Comparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Comparison::Different => "different",
            Comparison::Same => "same",
            Comparison::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// No statistically significant split exists in the sequence.
///
/// This is an expected outcome, not a failure of the caller.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("insufficient data to find a significant change point")]
pub struct InsufficientData;

/// A detected change: the best split index and the range of indices tied with it
pub type Split = (usize, (usize, usize));

/// Split a sequence into a prefix and a suffix at `index` (clamped to the length)
pub fn cluster<T>(sequence: &[T], index: usize) -> (&[T], &[T]) {
    sequence.split_at(index.min(sequence.len()))
}

/// Middle index of a sequence, rounding down
pub fn midpoint<T>(sequence: &[T]) -> usize {
    sequence.len().saturating_sub(1) / 2
}

/// Compare the two sides of `sequence` split at `index` with a reproducible
/// permutation test
pub fn cluster_and_compare(sequence: &[f64], index: usize) -> (Comparison, &[f64], &[f64]) {
    let mut rng = StdRng::seed_from_u64(COMPARE_SEED);
    cluster_and_compare_with(sequence, index, &mut rng)
}

/// Like [`cluster_and_compare`], drawing permutations from `rng`
pub fn cluster_and_compare_with<'a, R: Rng + ?Sized>(
    sequence: &'a [f64],
    index: usize,
    rng: &mut R,
) -> (Comparison, &'a [f64], &'a [f64]) {
    let (prefix, suffix) = cluster(sequence, index);
    if prefix.is_empty() || suffix.is_empty() {
        return (Comparison::Unknown, prefix, suffix);
    }

    let comparison = if p_value(sequence, prefix.len(), rng) <= SIGNIFICANCE {
        Comparison::Different
    } else {
        Comparison::Same
    };
    (comparison, prefix, suffix)
}

/// Reproducible p-value of the split at `index`; `None` when either side is empty
pub fn compare_p_value(sequence: &[f64], index: usize) -> Option<f64> {
    if index == 0 || index >= sequence.len() {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(COMPARE_SEED);
    Some(p_value(sequence, index, &mut rng))
}

/// Find all statistically significant change points in `values`.
///
/// Segments are examined breadth-first starting from the whole sequence. The
/// split maximizing the scaled energy statistic is accepted when the two sides
/// differ significantly, and both sides are searched again. Every segment is
/// examined at most once and segments strictly shrink, so the search ends even
/// when neighbouring segments keep proposing splits near the same boundary.
pub fn cluster_and_find_split<R: Rng + ?Sized>(
    values: &[f64],
    rng: &mut R,
) -> Result<Vec<Split>, InsufficientData> {
    if values.len() < MIN_SEGMENT_LEN {
        return Err(InsufficientData);
    }

    let mut queue = VecDeque::from([(0usize, values.len())]);
    let mut seen = HashSet::new();
    let mut splits = BTreeSet::new();

    while let Some((start, end)) = queue.pop_front() {
        if end - start < MIN_SEGMENT_LEN || !seen.insert((start, end)) {
            continue;
        }
        if seen.len() > MAX_SEGMENTS {
            break;
        }

        let segment = &values[start..end];
        let stats = SplitStatistics::compute(segment);
        let Some(split) = stats.estimate() else {
            continue;
        };

        let (comparison, _, _) = cluster_and_compare_with(segment, split, rng);
        if comparison != Comparison::Different {
            continue;
        }

        let (low, high) = stats.tie_range(split, TIE_RATIO);
        splits.insert((start + split, (start + low, start + high)));

        queue.push_back((start, start + split));
        queue.push_back((start + split, end));
    }

    if splits.is_empty() {
        return Err(InsufficientData);
    }
    Ok(splits.into_iter().collect())
}
