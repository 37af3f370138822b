// Read Value
// Extracts measurements from a test output's results file

use super::error::{ExecutionError, ReadValueError};
use super::execution::{Detail, Step};
use crate::services::{BackendError, Isolate, Services};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Layout of the results file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadValueMode {
    #[default]
    HistogramSets,
    GraphJson,
}

/// Summary statistic reduced from each matching histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Avg,
    Count,
    Max,
    Min,
    Sum,
    Std,
}

impl Statistic {
    /// Reduce a histogram, preferring its `running` summary over its samples.
    ///
    /// `running` is `[count, max, meanlogs, mean, min, sum, variance]`. A
    /// histogram without samples yields nothing.
    fn reduce(&self, samples: &[f64], running: Option<&[f64]>) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        match running {
            Some(running) if running.len() >= 7 => Some(match self {
                Statistic::Count => running[0],
                Statistic::Max => running[1],
                Statistic::Avg => running[3],
                Statistic::Min => running[4],
                Statistic::Sum => running[5],
                Statistic::Std => running[6].max(0.0).sqrt(),
            }),
            _ => self.apply(samples),
        }
    }

    fn apply(&self, samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        let count = samples.len() as f64;
        let sum: f64 = samples.iter().sum();
        let value = match self {
            Statistic::Avg => sum / count,
            Statistic::Count => count,
            Statistic::Max => samples.iter().copied().fold(f64::MIN, f64::max),
            Statistic::Min => samples.iter().copied().fold(f64::MAX, f64::min),
            Statistic::Sum => sum,
            Statistic::Std => {
                if samples.len() < 2 {
                    0.0
                } else {
                    let mean = sum / count;
                    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                        / (count - 1.0);
                    variance.sqrt()
                }
            }
        };
        Some(value)
    }
}

impl FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Statistic::Avg),
            "count" => Ok(Statistic::Count),
            "max" => Ok(Statistic::Max),
            "min" => Ok(Statistic::Min),
            "sum" => Ok(Statistic::Sum),
            "std" => Ok(Statistic::Std),
            other => Err(format!("unknown statistic: {}", other)),
        }
    }
}

/// Quest: read values out of a results file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadValue {
    pub results_filename: String,
    pub mode: ReadValueMode,
    /// Histogram name (histogram sets)
    pub metric: Option<String>,
    /// Only histograms with this grouping label, when any has it (histogram sets)
    pub grouping_label: Option<String>,
    /// Only histograms tagged with this story (histogram sets)
    pub story: Option<String>,
    /// Reduce each histogram to one value instead of using raw samples
    pub statistic: Option<Statistic>,
    /// Chart name (graph JSON)
    pub chart: Option<String>,
    /// Trace name within the chart (graph JSON), defaults to `summary`
    pub trace: Option<String>,
}

impl ReadValue {
    pub fn histograms(
        results_filename: impl Into<String>,
        metric: impl Into<String>,
        story: Option<String>,
    ) -> Self {
        Self {
            results_filename: results_filename.into(),
            mode: ReadValueMode::HistogramSets,
            metric: Some(metric.into()),
            story,
            ..Default::default()
        }
    }

    pub fn graph_json(
        results_filename: impl Into<String>,
        chart: impl Into<String>,
        trace: Option<String>,
    ) -> Self {
        Self {
            results_filename: results_filename.into(),
            mode: ReadValueMode::GraphJson,
            chart: Some(chart.into()),
            trace,
            ..Default::default()
        }
    }

    pub fn with_grouping_label(mut self, label: impl Into<String>) -> Self {
        self.grouping_label = Some(label.into());
        self
    }

    pub fn with_statistic(mut self, statistic: Statistic) -> Self {
        self.statistic = Some(statistic);
        self
    }

    /// Pull values out of a parsed results file
    pub fn extract(&self, results: &Value) -> Result<Vec<f64>, ReadValueError> {
        match self.mode {
            ReadValueMode::HistogramSets => self.extract_histograms(results),
            ReadValueMode::GraphJson => self.extract_graph_json(results),
        }
    }

    fn extract_histograms(&self, results: &Value) -> Result<Vec<f64>, ReadValueError> {
        let histograms = results
            .as_array()
            .ok_or_else(|| ReadValueError::UnknownFormat("expected a list of histograms".into()))?;

        let label = self.grouping_label.as_deref();
        match self.extract_matching(histograms, label) {
            // No histogram carries the label: match without it
            Err(ReadValueError::NotFound(_)) if label.is_some() => {
                self.extract_matching(histograms, None)
            }
            result => result,
        }
    }

    fn extract_matching(
        &self,
        histograms: &[Value],
        grouping_label: Option<&str>,
    ) -> Result<Vec<f64>, ReadValueError> {
        let mut values = Vec::new();
        let mut matched = 0usize;
        for histogram in histograms {
            let Some(name) = histogram.get("name").and_then(Value::as_str) else {
                continue;
            };
            if self.metric.as_deref().is_some_and(|metric| metric != name) {
                continue;
            }
            if let Some(story) = &self.story {
                if !histogram_stories(histogram).iter().any(|s| s == story) {
                    continue;
                }
            }
            if grouping_label.is_some_and(|label| histogram_grouping_label(histogram) != label) {
                continue;
            }

            matched += 1;
            let samples = numbers(histogram.get("sampleValues"));
            match self.statistic {
                Some(statistic) => {
                    let running = histogram.get("running").map(|r| numbers(Some(r)));
                    values.extend(statistic.reduce(&samples, running.as_deref()));
                }
                None => values.extend(samples),
            }
        }

        if matched == 0 {
            let mut reason = format!(
                "metric {}",
                self.metric.as_deref().unwrap_or("<any>")
            );
            if let Some(label) = grouping_label {
                reason.push_str(&format!(" grouping label {}", label));
            }
            if let Some(story) = &self.story {
                reason.push_str(&format!(" story {}", story));
            }
            return Err(ReadValueError::NotFound(reason));
        }
        if values.is_empty() {
            return Err(ReadValueError::NoValues);
        }
        Ok(values)
    }

    fn extract_graph_json(&self, results: &Value) -> Result<Vec<f64>, ReadValueError> {
        let chart_name = self.chart.as_deref().unwrap_or_default();
        let trace_name = self.trace.as_deref().unwrap_or("summary");

        let chart = results
            .get(chart_name)
            .ok_or_else(|| ReadValueError::ChartNotFound(chart_name.to_string()))?;
        let trace = chart
            .get("traces")
            .and_then(|traces| traces.get(trace_name))
            .and_then(Value::as_array)
            .ok_or_else(|| ReadValueError::TraceNotFound(trace_name.to_string()))?;

        // A trace is [value, stddev]; values may be numbers or numeric strings.
        let value = trace
            .first()
            .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| ReadValueError::UnknownFormat(format!("trace {}", trace_name)))?;
        Ok(vec![value])
    }
}

/// Numbers of a JSON array; non-numeric entries are skipped
fn numbers(value: Option<&Value>) -> Vec<f64> {
    value
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

/// Diagnostic values, either a plain list or `{"values": [...]}`
fn diagnostic_strings(histogram: &Value, name: &str) -> Vec<String> {
    let Some(diagnostic) = histogram.get("diagnostics").and_then(|d| d.get(name)) else {
        return Vec::new();
    };
    let list = diagnostic
        .get("values")
        .and_then(Value::as_array)
        .or_else(|| diagnostic.as_array());
    list.map(|l| {
        l.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Grouping label from `key:value` story tags: the values ordered by key, joined by `_`
fn histogram_grouping_label(histogram: &Value) -> String {
    let mut tags: Vec<(String, String)> = diagnostic_strings(histogram, "storyTags")
        .into_iter()
        .filter_map(|tag| {
            tag.split_once(':')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect();
    tags.sort();
    tags.into_iter()
        .map(|(_, value)| value)
        .collect::<Vec<_>>()
        .join("_")
}

/// Stories attached to a histogram
fn histogram_stories(histogram: &Value) -> Vec<String> {
    diagnostic_strings(histogram, "stories")
}

#[derive(Debug, Clone)]
pub(crate) struct ReadValueExecution {
    quest: ReadValue,
    output: Isolate,
    values: Option<usize>,
}

impl ReadValueExecution {
    pub(crate) fn new(quest: ReadValue, output: Isolate) -> Self {
        Self {
            quest,
            output,
            values: None,
        }
    }

    pub(crate) async fn poll(&mut self, services: &Services) -> Result<Step, ExecutionError> {
        let results = match services
            .results
            .fetch(&self.output, &self.quest.results_filename)
            .await
        {
            Ok(results) => results,
            Err(BackendError::NotFound(_)) => {
                return Err(ReadValueError::NoFile(self.quest.results_filename.clone()).into())
            }
            Err(e) => return Err(e.into()),
        };

        let values = self.quest.extract(&results)?;
        self.values = Some(values.len());
        Ok(Step::Done {
            arguments: BTreeMap::new(),
            values,
        })
    }

    pub(crate) fn details(&self) -> Vec<Detail> {
        let mut details = vec![Detail::new("results", &self.quest.results_filename)];
        if let Some(count) = self.values {
            details.push(Detail::new("values", count.to_string()));
        }
        details
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn histograms() -> Value {
        json!([
            {"name": "timeToFirstPaint", "sampleValues": [1.0, 2.0, 3.0],
             "diagnostics": {"stories": ["load:news"]}},
            {"name": "timeToFirstPaint", "sampleValues": [10.0, null],
             "diagnostics": {"stories": {"values": ["load:search"]}}},
            {"name": "memory", "sampleValues": [99.0]},
        ])
    }

    #[test]
    fn test_histogram_samples() {
        let quest = ReadValue::histograms("perf_results.json", "timeToFirstPaint", None);
        assert_eq!(quest.extract(&histograms()).unwrap(), vec![1.0, 2.0, 3.0, 10.0]);
    }

    #[test]
    fn test_histogram_story_filter() {
        let quest = ReadValue::histograms(
            "perf_results.json",
            "timeToFirstPaint",
            Some("load:search".to_string()),
        );
        assert_eq!(quest.extract(&histograms()).unwrap(), vec![10.0]);
    }

    #[test]
    fn test_histogram_statistic() {
        let quest = ReadValue::histograms("perf_results.json", "timeToFirstPaint", None)
            .with_statistic(Statistic::Avg);
        assert_eq!(quest.extract(&histograms()).unwrap(), vec![2.0, 10.0]);

        let quest = quest.with_statistic(Statistic::Count);
        assert_eq!(quest.extract(&histograms()).unwrap(), vec![3.0, 1.0]);
    }

    #[test]
    fn test_statistic_from_running_summary() {
        // Samples are truncated; the running summary covers every sample
        let results = json!([
            {"name": "timeToFirstPaint", "sampleValues": [1.0, 2.0],
             "running": [10, 9.0, 0.5, 4.5, 0.5, 45.0, 4.0]},
        ]);
        let quest = ReadValue::histograms("perf_results.json", "timeToFirstPaint", None);
        let read = |statistic| quest.clone().with_statistic(statistic).extract(&results).unwrap();
        assert_eq!(read(Statistic::Avg), vec![4.5]);
        assert_eq!(read(Statistic::Count), vec![10.0]);
        assert_eq!(read(Statistic::Max), vec![9.0]);
        assert_eq!(read(Statistic::Min), vec![0.5]);
        assert_eq!(read(Statistic::Sum), vec![45.0]);
        assert_eq!(read(Statistic::Std), vec![2.0]);

        let empty = json!([{"name": "timeToFirstPaint", "sampleValues": [],
                            "running": [0, 0, 0, 0, 0, 0, 0]}]);
        assert!(matches!(
            quest.with_statistic(Statistic::Avg).extract(&empty),
            Err(ReadValueError::NoValues)
        ));
    }

    #[test]
    fn test_histogram_grouping_label() {
        let results = json!([
            {"name": "timeToFirstPaint", "sampleValues": [1.0],
             "diagnostics": {"storyTags": ["case:load", "group:news"]}},
            {"name": "timeToFirstPaint", "sampleValues": [2.0],
             "diagnostics": {"storyTags": {"values": ["case:browse", "group:news", "smoke"]}}},
        ]);
        let quest = ReadValue::histograms("perf_results.json", "timeToFirstPaint", None);
        assert_eq!(
            quest.clone().with_grouping_label("load_news").extract(&results).unwrap(),
            vec![1.0]
        );
        assert_eq!(
            quest.clone().with_grouping_label("browse_news").extract(&results).unwrap(),
            vec![2.0]
        );
        // No histogram carries the label
        assert_eq!(
            quest.clone().with_grouping_label("idle").extract(&results).unwrap(),
            vec![1.0, 2.0]
        );
        assert_ne!(quest.clone().with_grouping_label("load_news"), quest);
    }

    #[test]
    fn test_histogram_not_found() {
        let quest = ReadValue::histograms("perf_results.json", "cpuTime", None);
        assert!(matches!(
            quest.extract(&histograms()),
            Err(ReadValueError::NotFound(_))
        ));
        assert!(matches!(
            quest.extract(&json!({"not": "a list"})),
            Err(ReadValueError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_graph_json() {
        let results = json!({
            "warm_times": {"traces": {"page_load": ["12.5", "0.3"], "summary": [7.0, 0.1]}}
        });
        let quest = ReadValue::graph_json("results.json", "warm_times", None);
        assert_eq!(quest.extract(&results).unwrap(), vec![7.0]);

        let quest = ReadValue::graph_json("results.json", "warm_times", Some("page_load".into()));
        assert_eq!(quest.extract(&results).unwrap(), vec![12.5]);

        let quest = ReadValue::graph_json("results.json", "cold_times", None);
        assert!(matches!(
            quest.extract(&results),
            Err(ReadValueError::ChartNotFound(_))
        ));
    }

    #[test]
    fn test_statistics() {
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(Statistic::Max.apply(&samples), Some(9.0));
        assert_eq!(Statistic::Min.apply(&samples), Some(2.0));
        assert_eq!(Statistic::Sum.apply(&samples), Some(40.0));
        let std = Statistic::Std.apply(&samples).unwrap();
        assert!((std - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!(Statistic::Avg.apply(&[]), None);
        assert_eq!("std".parse::<Statistic>(), Ok(Statistic::Std));
    }
}
