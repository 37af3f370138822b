// Bisection Module
// Task-graph construction and evaluators that drive a regression bisection

pub mod exploration;
pub mod find_culprit;
pub mod pipeline;
pub mod serializer;
pub mod stages;

// Re-export key types
pub use exploration::{resolve_pairs, Exploration, PairOutcome};
pub use find_culprit::FindCulpritEvaluator;
pub use pipeline::{
    add_attempts, attempt_count, build_graph, find_isolate_id, job_evaluator, read_value_id,
    run_test_id, Attempt, FIND_CULPRIT_TASK,
};
pub use serializer::serialize_state;
pub use stages::ExecutionEvaluator;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the changes of a job are compared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonMode {
    /// Bisect the range until every significant change is isolated
    #[default]
    Performance,
    /// Compare exactly two changes, typically with and without a patch
    Try,
}

impl fmt::Display for ComparisonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonMode::Performance => write!(f, "performance"),
            ComparisonMode::Try => write!(f, "try"),
        }
    }
}

impl FromStr for ComparisonMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "performance" => Ok(ComparisonMode::Performance),
            "try" => Ok(ComparisonMode::Try),
            other => Err(format!("unknown comparison mode '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_mode_parsing() {
        assert_eq!(
            "Performance".parse::<ComparisonMode>().unwrap(),
            ComparisonMode::Performance
        );
        assert_eq!("try".parse::<ComparisonMode>().unwrap(), ComparisonMode::Try);
        assert!("functional".parse::<ComparisonMode>().is_err());
        assert_eq!(ComparisonMode::default().to_string(), "performance");
    }
}
