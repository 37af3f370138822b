// Job Arguments
// Job definition as submitted by a user, and the quests and changes derived from it

use crate::bisection::ComparisonMode;
use crate::change::{Change, Commit, Patch};
use crate::job::timing::TimingTags;
use crate::quest::{BuildDedup, FindIsolate, Quest, ReadValue, ReadValueMode, RunTest, Statistic};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Queue used for jobs without a configuration
pub const DEFAULT_CONFIGURATION: &str = "(none)";

#[derive(Debug, Error)]
pub enum ArgumentsError {
    #[error("Failed to read job file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid job definition: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Missing required argument: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

fn default_bucket() -> String {
    "ci".to_string()
}

fn default_target() -> String {
    "performance_test_suite".to_string()
}

fn default_results_filename() -> String {
    "perf_results.json".to_string()
}

/// Everything needed to create a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArguments {
    /// Bot configuration; names the scheduler queue
    #[serde(default)]
    pub configuration: Option<String>,

    pub repository: String,
    pub start_git_hash: String,
    pub end_git_hash: String,

    /// Review URL of a patch applied to every change
    #[serde(default)]
    pub patch: Option<String>,

    #[serde(default)]
    pub comparison_mode: ComparisonMode,

    // Build
    pub builder: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub fallback_target: Option<String>,

    // Test
    #[serde(default)]
    pub swarming_server: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub benchmark: Option<String>,
    #[serde(default)]
    pub story: Option<String>,

    // Read value
    #[serde(default = "default_results_filename")]
    pub results_filename: String,
    #[serde(default)]
    pub read_mode: ReadValueMode,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub grouping_label: Option<String>,
    #[serde(default)]
    pub statistic: Option<Statistic>,
    #[serde(default)]
    pub chart: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,

    // Bookkeeping
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bug_id: Option<u64>,
    /// Lower runs first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub batch_id: Option<String>,
    /// Attempts per change; the configured minimum when absent
    #[serde(default)]
    pub initial_attempt_count: Option<usize>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl JobArguments {
    pub fn from_yaml(content: &str) -> Result<Self, ArgumentsError> {
        let arguments: Self = serde_yaml::from_str(content)?;
        arguments.validate()?;
        Ok(arguments)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ArgumentsError> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ArgumentsError> {
        if self.repository.is_empty() {
            return Err(ArgumentsError::Missing("repository"));
        }
        if self.start_git_hash.is_empty() {
            return Err(ArgumentsError::Missing("start_git_hash"));
        }
        if self.end_git_hash.is_empty() {
            return Err(ArgumentsError::Missing("end_git_hash"));
        }
        if self.builder.is_empty() {
            return Err(ArgumentsError::Missing("builder"));
        }
        match self.read_mode {
            ReadValueMode::HistogramSets if self.metric.is_none() => {
                return Err(ArgumentsError::Missing("metric"))
            }
            ReadValueMode::GraphJson if self.chart.is_none() => {
                return Err(ArgumentsError::Missing("chart"))
            }
            _ => {}
        }
        if self.patch.is_some() && self.parsed_patch().is_none() {
            return Err(ArgumentsError::Invalid {
                field: "patch",
                message: "expected a review URL".to_string(),
            });
        }
        if self.initial_attempt_count == Some(0) {
            return Err(ArgumentsError::Invalid {
                field: "initial_attempt_count",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn parsed_patch(&self) -> Option<Patch> {
        self.patch.as_deref().and_then(Patch::from_url)
    }

    /// Name of the scheduler queue for this job
    pub fn configuration_name(&self) -> &str {
        self.configuration.as_deref().unwrap_or(DEFAULT_CONFIGURATION)
    }

    /// The initial search space.
    ///
    /// Performance jobs bisect from the start to the end commit, both with the
    /// patch when one is given. Try jobs with a patch compare the start commit
    /// without and with the patch; without a patch they compare start and end.
    pub fn changes(&self) -> Result<Vec<Change>, ArgumentsError> {
        let patch = self.parsed_patch();
        let start = Commit::new(self.repository.clone(), self.start_git_hash.clone());
        let end = Commit::new(self.repository.clone(), self.end_git_hash.clone());

        let changes = match (self.comparison_mode, patch) {
            (ComparisonMode::Try, Some(patch)) => vec![
                Change::from_commit(start.clone()),
                Change::new([start], Some(patch)),
            ],
            (ComparisonMode::Try, None) => {
                vec![Change::from_commit(start), Change::from_commit(end)]
            }
            (ComparisonMode::Performance, patch) => vec![
                Change::new([start], patch.clone()),
                Change::new([end], patch),
            ],
        };
        if changes[0] == changes[1] {
            return Err(ArgumentsError::Invalid {
                field: "end_git_hash",
                message: "start and end describe the same change".to_string(),
            });
        }
        Ok(changes)
    }

    /// Arguments passed to the test runner
    pub fn test_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(benchmark) = &self.benchmark {
            args.push("--benchmarks".to_string());
            args.push(benchmark.clone());
        }
        if let Some(story) = &self.story {
            args.push("--story-filter".to_string());
            args.push(format!("^{}$", story));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Build, test and read-value quests, in pipeline order
    pub fn quests(&self, dedup: &BuildDedup, job_id: &str) -> Vec<Quest> {
        let mut tags = self.tags.clone();
        tags.insert("job_id".to_string(), job_id.to_string());
        if let Some(user) = &self.user {
            tags.insert("user".to_string(), user.clone());
        }

        let mut find_isolate =
            FindIsolate::new(&self.builder, &self.target, &self.bucket, dedup.clone())
                .with_tags(tags);
        if let Some(fallback) = &self.fallback_target {
            find_isolate = find_isolate.with_fallback_target(fallback);
        }

        let run_test = RunTest::new(&self.swarming_server, self.dimensions.clone())
            .with_extra_args(self.test_args());

        let mut read_value = match self.read_mode {
            ReadValueMode::HistogramSets => ReadValue::histograms(
                &self.results_filename,
                self.metric.clone().unwrap_or_default(),
                self.story.clone(),
            ),
            ReadValueMode::GraphJson => ReadValue::graph_json(
                &self.results_filename,
                self.chart.clone().unwrap_or_default(),
                self.trace.clone(),
            ),
        };
        if let Some(statistic) = self.statistic {
            read_value = read_value.with_statistic(statistic);
        }
        if let Some(label) = &self.grouping_label {
            read_value = read_value.with_grouping_label(label);
        }

        vec![
            Quest::FindIsolate(find_isolate),
            Quest::RunTest(run_test),
            Quest::ReadValue(read_value),
        ]
    }

    /// Tags identifying similar jobs for run-time estimates
    pub fn timing_tags(&self) -> TimingTags {
        TimingTags {
            configuration: self.configuration.clone(),
            benchmark: self.benchmark.clone(),
            story: self.story.clone(),
            mode: self.comparison_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quest::new_build_dedup;

    const JOB: &str = r#"
configuration: linux-perf
repository: chromium
start_git_hash: "1111"
end_git_hash: "2222"
builder: Linux Builder Perf
swarming_server: https://swarming.example.com
dimensions:
  pool: perf
benchmark: speedometer2
story: Speedometer2
metric: RunsPerMinute
user: dev@example.com
"#;

    #[test]
    fn test_parse_job_yaml() {
        let arguments = JobArguments::from_yaml(JOB).unwrap();
        assert_eq!(arguments.configuration_name(), "linux-perf");
        assert_eq!(arguments.comparison_mode, ComparisonMode::Performance);
        assert_eq!(arguments.target, "performance_test_suite");
        assert_eq!(arguments.bucket, "ci");
        assert_eq!(arguments.results_filename, "perf_results.json");
        assert_eq!(arguments.priority, 0);
        assert_eq!(arguments.dimensions["pool"], "perf");
    }

    #[test]
    fn test_missing_fields_rejected() {
        let result = JobArguments::from_yaml(&JOB.replace("metric: RunsPerMinute", ""));
        assert!(matches!(result, Err(ArgumentsError::Missing("metric"))));

        let result = JobArguments::from_yaml(&JOB.replace("builder: Linux Builder Perf", ""));
        assert!(matches!(result, Err(ArgumentsError::Yaml(_))));
    }

    #[test]
    fn test_performance_changes() {
        let arguments = JobArguments::from_yaml(JOB).unwrap();
        let changes = arguments.changes().unwrap();
        assert_eq!(changes[0], Change::from_commit(Commit::new("chromium", "1111")));
        assert_eq!(changes[1], Change::from_commit(Commit::new("chromium", "2222")));
    }

    #[test]
    fn test_try_changes_with_patch() {
        let mut arguments = JobArguments::from_yaml(JOB).unwrap();
        arguments.comparison_mode = ComparisonMode::Try;
        arguments.patch = Some("https://review.example.com/c/chromium/+/12345/3".to_string());

        let changes = arguments.changes().unwrap();
        assert_eq!(changes[0].patch(), None);
        assert_eq!(changes[1].commits(), changes[0].commits());
        assert_eq!(changes[1].patch().unwrap().change, "12345");
    }

    #[test]
    fn test_quests_and_test_args() {
        let arguments = JobArguments::from_yaml(JOB).unwrap();
        let quests = arguments.quests(&new_build_dedup(), "abc");
        let names: Vec<_> = quests.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["Build", "Test", "Get values"]);

        match &quests[0] {
            Quest::FindIsolate(quest) => {
                assert_eq!(quest.tags["job_id"], "abc");
                assert_eq!(quest.tags["user"], "dev@example.com");
            }
            other => panic!("unexpected quest {:?}", other),
        }
        assert_eq!(
            arguments.test_args(),
            vec!["--benchmarks", "speedometer2", "--story-filter", "^Speedometer2$"]
        );
    }

    #[test]
    fn test_read_value_quest_options() {
        let yaml = format!("{}grouping_label: load_news\nstatistic: avg\n", JOB);
        let arguments = JobArguments::from_yaml(&yaml).unwrap();
        let quests = arguments.quests(&new_build_dedup(), "abc");

        match &quests[2] {
            Quest::ReadValue(quest) => {
                assert_eq!(quest.grouping_label.as_deref(), Some("load_news"));
                assert_eq!(quest.statistic, Some(Statistic::Avg));
                assert_eq!(quest.metric.as_deref(), Some("RunsPerMinute"));
            }
            other => panic!("unexpected quest {:?}", other),
        }
    }
}
