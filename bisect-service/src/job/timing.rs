// Timing Records
// Durations of finished jobs and run-time estimates for similar jobs

use crate::bisection::ComparisonMode;
use crate::config::ConfigError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Most timings returned by an estimate
pub const MAX_ESTIMATE_TIMINGS: usize = 50;

/// Attributes that make two jobs comparable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingTags {
    #[serde(default)]
    pub configuration: Option<String>,
    #[serde(default)]
    pub benchmark: Option<String>,
    #[serde(default)]
    pub story: Option<String>,
    #[serde(default)]
    pub mode: ComparisonMode,
}

impl TimingTags {
    /// The same tags with progressively fewer attributes, most specific first
    fn fallbacks(&self) -> Vec<TimingTags> {
        let exact = self.clone();
        let without_story = TimingTags {
            story: None,
            ..exact.clone()
        };
        let without_benchmark = TimingTags {
            benchmark: None,
            ..without_story.clone()
        };
        let mode_only = TimingTags {
            configuration: None,
            ..without_benchmark.clone()
        };
        vec![exact, without_story, without_benchmark, mode_only]
    }

    /// Whether a record with `tags` matches these tags; `None` fields match anything
    fn matches(&self, tags: &TimingTags) -> bool {
        let field = |wanted: &Option<String>, actual: &Option<String>| {
            wanted.is_none() || wanted == actual
        };
        self.mode == tags.mode
            && field(&self.configuration, &tags.configuration)
            && field(&self.benchmark, &tags.benchmark)
            && field(&self.story, &tags.story)
    }
}

/// How long one finished job took
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub job_id: String,
    pub tags: TimingTags,
    pub duration_secs: f64,
    pub completed: DateTime<Utc>,
}

/// Durations of similar jobs and the tags that found them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub timings: Vec<f64>,
    pub tags: TimingTags,
}

/// Append-only history of job durations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimingRecords {
    records: Vec<TimingRecord>,
}

impl TimingRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn record(&mut self, record: TimingRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Durations of jobs similar to `tags`, newest first.
    ///
    /// Tries the exact tags, then without the story, without the benchmark and
    /// finally any job with the same comparison mode. Returns `None` when even
    /// the last level has no records.
    pub fn estimate(&self, tags: &TimingTags) -> Option<Estimate> {
        tags.fallbacks().into_iter().find_map(|candidate| {
            let mut matching: Vec<&TimingRecord> = self
                .records
                .iter()
                .filter(|r| candidate.matches(&r.tags))
                .collect();
            if matching.is_empty() {
                return None;
            }
            matching.sort_by(|a, b| b.completed.cmp(&a.completed));
            Some(Estimate {
                timings: matching
                    .iter()
                    .take(MAX_ESTIMATE_TIMINGS)
                    .map(|r| r.duration_secs)
                    .collect(),
                tags: candidate,
            })
        })
    }
}
