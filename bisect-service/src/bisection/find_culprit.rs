// Find Culprit Evaluator
// Compares adjacent changes and decides where the search space grows

use super::exploration::Exploration;
use super::stages::{accumulated_status, payload_errors};
use super::ComparisonMode;
use crate::change::Change;
use crate::config::BisectionSettings;
use crate::detector::{compare_p_value, Comparison};
use crate::task::{Accumulator, Action, Evaluator, Event, Task, TaskStatus};

use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Attempts and results gathered for one change
#[derive(Debug, Default)]
struct ChangeData {
    attempts: usize,
    terminal: usize,
    failed: usize,
    values: Vec<f64>,
}

impl ChangeData {
    fn finished(&self) -> bool {
        self.attempts > 0 && self.terminal == self.attempts
    }
}

/// Handler of the find-culprit task.
///
/// Reads the status and result values of every read-value dependency from the
/// accumulator, compares the changes pairwise, and either asks for more data,
/// asks the host to explore, or completes the task.
#[derive(Debug, Clone)]
pub struct FindCulpritEvaluator {
    mode: ComparisonMode,
    significance: f64,
    inconclusive_level: f64,
    max_attempts: usize,
}

impl FindCulpritEvaluator {
    pub fn new(settings: &BisectionSettings, mode: ComparisonMode) -> Self {
        Self {
            mode,
            significance: settings.significance,
            inconclusive_level: settings.inconclusive_level,
            max_attempts: settings.max_attempts,
        }
    }

    /// Compare the values of two changes. `None` while either side has no values.
    pub fn compare_values(
        &self,
        a: &[f64],
        b: &[f64],
        attempts_a: usize,
        attempts_b: usize,
    ) -> Option<Comparison> {
        let sequence: Vec<f64> = a.iter().chain(b).copied().collect();
        let p = compare_p_value(&sequence, a.len())?;
        if p <= self.significance {
            Some(Comparison::Different)
        } else if p <= self.inconclusive_level && attempts_a.min(attempts_b) < self.max_attempts {
            Some(Comparison::Unknown)
        } else {
            Some(Comparison::Same)
        }
    }

    /// Attempt total after refining a change that has `attempts`
    fn refined_attempts(&self, attempts: usize) -> usize {
        let grown = (attempts * 3).div_ceil(2).max(attempts + 1);
        grown.min(self.max_attempts)
    }

    fn fail(&self, task: &Task, reason: &str, message: String) -> Option<Vec<Action>> {
        let mut errors = payload_errors(&task.payload);
        errors.push(json!({"reason": reason, "message": message}));
        let mut payload = Map::new();
        payload.insert("errors".to_string(), Value::Array(errors));
        Some(vec![Action::update(
            task.id.clone(),
            Some(TaskStatus::Failed),
            payload,
        )])
    }

    fn gather(&self, task: &Task, accumulator: &Accumulator) -> HashMap<Change, ChangeData> {
        let mut data: HashMap<Change, ChangeData> = HashMap::new();
        for dependency in &task.dependencies {
            let Some(entry) = accumulator.get(dependency) else {
                continue;
            };
            let Some(change) = entry
                .get("change")
                .and_then(|c| serde_json::from_value::<Change>(c.clone()).ok())
            else {
                continue;
            };
            let status = accumulated_status(accumulator, dependency).unwrap_or_default();

            let change_data = data.entry(change).or_default();
            change_data.attempts += 1;
            if status.is_terminal() {
                change_data.terminal += 1;
            }
            if matches!(status, TaskStatus::Failed | TaskStatus::Cancelled) {
                change_data.failed += 1;
            }
            if status == TaskStatus::Completed {
                if let Some(values) = entry.get("result_values").and_then(Value::as_array) {
                    change_data
                        .values
                        .extend(values.iter().filter_map(Value::as_f64));
                }
            }
        }
        data
    }
}

fn payload_pairs(payload: &Map<String, Value>, key: &str) -> Vec<(Change, Change)> {
    payload
        .get(key)
        .and_then(|pairs| serde_json::from_value(pairs.clone()).ok())
        .unwrap_or_default()
}

impl Evaluator for FindCulpritEvaluator {
    fn evaluate(&self, task: &Task, _: &Event, accumulator: &mut Accumulator) -> Option<Vec<Action>> {
        let changes: Vec<Change> = match task
            .payload
            .get("changes")
            .map(|c| serde_json::from_value(c.clone()))
        {
            Some(Ok(changes)) => changes,
            _ => {
                return self.fail(
                    task,
                    "InvalidPayload",
                    "Task payload has no valid \"changes\" list".to_string(),
                )
            }
        };

        let data = self.gather(task, accumulator);
        let empty = ChangeData::default();
        let data_for = |change: &Change| data.get(change).unwrap_or(&empty);

        let attempts: usize = data.values().map(|d| d.attempts).sum();
        let all_terminal = data.values().all(ChangeData::finished);
        if attempts > 0 && all_terminal {
            if data.values().all(|d| d.failed == d.attempts) {
                return self.fail(
                    task,
                    "BisectionFailed",
                    "All attempts in all dependencies failed.".to_string(),
                );
            }
            if let Some(change) = changes.iter().find(|&c| data_for(c).values.is_empty()) {
                return self.fail(
                    task,
                    "BisectionFailed",
                    format!("No result values from successful test runs for {}", change),
                );
            }
        }

        let culprits = payload_pairs(&task.payload, "culprits");
        let failed_pairs = payload_pairs(&task.payload, "failed_pairs");
        let resolved = |a: &Change, b: &Change| {
            culprits
                .iter()
                .chain(&failed_pairs)
                .any(|(x, y)| x == a && y == b)
        };

        let pairs: Vec<(usize, usize)> = match self.mode {
            ComparisonMode::Performance => (1..changes.len()).map(|i| (i - 1, i)).collect(),
            ComparisonMode::Try if changes.len() >= 2 => vec![(0, 1)],
            ComparisonMode::Try => Vec::new(),
        };

        let mut comparisons: Vec<Option<Comparison>> = Vec::with_capacity(pairs.len());
        let mut exploration = Exploration::default();
        let mut pending = !all_terminal;
        let mut refine: HashMap<Change, usize> = HashMap::new();

        for &(i, j) in &pairs {
            let (a, b) = (&changes[i], &changes[j]);
            let (data_a, data_b) = (data_for(a), data_for(b));
            if !data_a.finished() || !data_b.finished() {
                comparisons.push(None);
                pending = true;
                continue;
            }

            let comparison =
                self.compare_values(&data_a.values, &data_b.values, data_a.attempts, data_b.attempts);
            comparisons.push(comparison);
            match comparison {
                None => pending = true,
                Some(Comparison::Different) => {
                    if self.mode == ComparisonMode::Performance && !resolved(a, b) {
                        exploration.bisect.push((a.clone(), b.clone()));
                    }
                }
                Some(Comparison::Unknown) => {
                    let fewest = data_a.attempts.min(data_b.attempts);
                    for (change, change_data) in [(a, data_a), (b, data_b)] {
                        if change_data.attempts == fewest {
                            let target = self.refined_attempts(fewest);
                            let entry = refine.entry(change.clone()).or_insert(target);
                            *entry = (*entry).max(target);
                        }
                    }
                }
                Some(Comparison::Same) => {}
            }
        }

        // Keep refinement in search-space order
        exploration.refine = changes
            .iter()
            .filter_map(|c| refine.get(c).map(|&n| (c.clone(), n)))
            .filter(|(c, n)| *n > data_for(c).attempts)
            .collect();

        let mut payload = Map::new();
        let summary = json!(comparison_summary(&changes, &pairs, &comparisons));
        if task.payload.get("comparisons") != Some(&summary) {
            payload.insert("comparisons".to_string(), summary);
        }
        let values = json!(changes
            .iter()
            .map(|c| data_for(c).values.clone())
            .collect::<Vec<_>>());
        if task.payload.get("result_values") != Some(&values) {
            payload.insert("result_values".to_string(), values);
        }

        if !exploration.is_empty() {
            return Some(vec![
                Action::update(task.id.clone(), Some(TaskStatus::Ongoing), payload),
                Action::Explore {
                    task_id: task.id.clone(),
                    exploration,
                },
            ]);
        }

        if pending {
            if task.status == TaskStatus::Pending || !payload.is_empty() {
                return Some(vec![Action::update(
                    task.id.clone(),
                    Some(TaskStatus::Ongoing),
                    payload,
                )]);
            }
            return None;
        }

        Some(vec![Action::update(
            task.id.clone(),
            Some(TaskStatus::Completed),
            payload,
        )])
    }
}

/// Per change, the comparison with the previous and the next change
fn comparison_summary(
    changes: &[Change],
    pairs: &[(usize, usize)],
    comparisons: &[Option<Comparison>],
) -> Vec<Value> {
    let mut summary = vec![json!({"prev": null, "next": null}); changes.len()];
    for (&(i, j), comparison) in pairs.iter().zip(comparisons) {
        summary[i]["next"] = json!(comparison);
        summary[j]["prev"] = json!(comparison);
    }
    summary
}
