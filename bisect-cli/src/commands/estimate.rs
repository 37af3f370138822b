use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use bisect_service::{EngineConfig, JobArguments, TimingRecords};

/// Estimate a job's duration from the durations of similar jobs
#[derive(Args, Debug)]
pub struct EstimateArgs {
    /// Path to the job YAML file
    pub job: PathBuf,

    /// Timing history (default: ~/.bisect/timings.yaml)
    #[arg(long, value_name = "FILE")]
    pub history: Option<PathBuf>,

    /// Print the estimate as JSON
    #[arg(long)]
    pub json: bool,
}

/// Median of an unsorted slice
fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

pub fn execute(args: EstimateArgs) -> Result<()> {
    let arguments = JobArguments::from_file(&args.job)?;
    let history_path = args.history.unwrap_or_else(|| {
        EngineConfig::default_path().with_file_name("timings.yaml")
    });
    if !history_path.exists() {
        color_eyre::eyre::bail!("Timing history not found: {}", history_path.display());
    }
    let history = TimingRecords::from_file(&history_path)?;
    output::status(
        "Estimating",
        &format!("from {} past jobs", history.len()),
    );

    let tags = arguments.timing_tags();
    let estimate = history.estimate(&tags);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
        return Ok(());
    }

    match estimate {
        Some(estimate) => {
            let matched = serde_yaml::to_string(&estimate.tags)?;
            output::info(&format!("Matched on:\n{}", matched.trim_end()));
            if let Some(median) = median(&estimate.timings) {
                output::success(&format!(
                    "About {} (median of {} jobs)",
                    output::duration(median),
                    estimate.timings.len()
                ));
            }
        }
        None => output::warning("No similar jobs in the history"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
    }
}
