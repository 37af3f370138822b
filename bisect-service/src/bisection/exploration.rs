// Exploration
// Growth requests for the search space and midpoint resolution of differing pairs

use crate::change::{Change, MidpointError};
use crate::services::SourceControl;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Changes to bisect and changes that need more attempts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exploration {
    /// Adjacent pairs that differ; a midpoint should be inserted between them
    pub bisect: Vec<(Change, Change)>,

    /// Changes whose attempt count should grow to the given total
    pub refine: Vec<(Change, usize)>,
}

impl Exploration {
    pub fn is_empty(&self) -> bool {
        self.bisect.is_empty() && self.refine.is_empty()
    }
}

/// What to do with a pair of differing changes
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    /// Insert `midpoint` between `before` and `after`
    Midpoint {
        before: Change,
        after: Change,
        midpoint: Change,
    },

    /// Nothing lies between the changes; `before` is the culprit
    Culprit { before: Change, after: Change },

    /// The pair cannot be bisected (different repositories or patches)
    Unresolvable {
        before: Change,
        after: Change,
        reason: String,
    },

    /// The lookup failed transiently; try again on a later evaluation
    Retry {
        before: Change,
        after: Change,
        reason: String,
    },
}

/// Look up the midpoint of every pair.
///
/// `existing` holds the changes already in the search space; a midpoint that is
/// already present cannot make progress and the pair is reported unresolvable.
pub async fn resolve_pairs(
    pairs: &[(Change, Change)],
    existing: &[Change],
    source_control: &dyn SourceControl,
) -> Vec<PairOutcome> {
    let mut outcomes = Vec::with_capacity(pairs.len());
    for (before, after) in pairs {
        let before = before.clone();
        let after = after.clone();
        let outcome = match Change::midpoint(&before, &after, source_control).await {
            Ok(midpoint) if midpoint == before || midpoint == after => {
                PairOutcome::Unresolvable {
                    reason: format!("no change between {} and {}", before, after),
                    before,
                    after,
                }
            }
            Ok(midpoint) if existing.contains(&midpoint) => PairOutcome::Unresolvable {
                reason: format!("midpoint {} is already being explored", midpoint),
                before,
                after,
            },
            Ok(midpoint) => {
                debug!(before = %before, after = %after, midpoint = %midpoint, "found midpoint");
                PairOutcome::Midpoint {
                    before,
                    after,
                    midpoint,
                }
            }
            Err(MidpointError::NonLinear(error)) if error.is_adjacent() => {
                PairOutcome::Culprit { before, after }
            }
            Err(MidpointError::NonLinear(error)) => PairOutcome::Unresolvable {
                reason: error.to_string(),
                before,
                after,
            },
            Err(MidpointError::Backend(error)) if error.is_transient() => PairOutcome::Retry {
                reason: error.to_string(),
                before,
                after,
            },
            Err(MidpointError::Backend(error)) => PairOutcome::Unresolvable {
                reason: error.to_string(),
                before,
                after,
            },
        };
        outcomes.push(outcome);
    }
    outcomes
}
