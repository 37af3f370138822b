use crate::commands::run::{drive, load_job, Report};
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use bisect_service::{progress_channel, Engine, EngineConfig, Services, SimulatedBackend};

/// Ticks allowed when the configuration sets no limit
const DEFAULT_MAX_TICKS: u64 = 10_000;

/// Run a job against a simulated linear commit history.
///
/// The job's repository and commit range are replaced by the simulated
/// history, oldest commit first.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Path to the job YAML file
    pub job: PathBuf,

    /// Index of the commit that introduces the regression
    #[arg(long)]
    pub culprit: usize,

    /// Number of commits in the history
    #[arg(long, default_value_t = 32)]
    pub length: usize,

    /// Value reported up to and including the culprit
    #[arg(long, default_value_t = 1.0)]
    pub before: f64,

    /// Value reported after the culprit
    #[arg(long, default_value_t = 5.0)]
    pub after: f64,

    /// Deterministic spread added around each value
    #[arg(long, default_value_t = 0.0)]
    pub noise: f64,

    /// Values reported per test run
    #[arg(long, default_value_t = 3)]
    pub samples: usize,

    /// Commits whose builds fail (can be repeated)
    #[arg(long = "fail-build", value_name = "INDEX")]
    pub failing_builds: Vec<usize>,

    /// Print the final job status as JSON
    #[arg(long)]
    pub json: bool,

    /// Include the per-change state in the JSON status
    #[arg(long, requires = "json")]
    pub state: bool,
}

pub async fn execute(args: SimulateArgs, mut config: EngineConfig) -> Result<()> {
    if args.length < 2 {
        color_eyre::eyre::bail!("A simulated history needs at least 2 commits");
    }
    if args.culprit + 1 >= args.length {
        color_eyre::eyre::bail!(
            "Culprit {} must be before the last commit ({})",
            args.culprit,
            args.length - 1
        );
    }

    let mut arguments = load_job(&args.job)?;
    let repository = if arguments.repository.is_empty() {
        "simulated".to_string()
    } else {
        arguments.repository.clone()
    };

    let mut backend = SimulatedBackend::linear(repository, args.length)
        .with_regression(args.culprit, args.before, args.after)
        .with_noise(args.noise)
        .with_samples(args.samples);
    if let Some(metric) = &arguments.metric {
        backend = backend.with_metric(metric.clone());
    }
    if let Some(story) = &arguments.story {
        backend = backend.with_story(story.clone());
    }
    for index in &args.failing_builds {
        backend = backend.with_failing_build(*index);
    }
    let backend = Arc::new(backend);

    arguments.repository = backend.repository().to_string();
    arguments.start_git_hash = backend.commit(0).git_hash;
    arguments.end_git_hash = backend.commit(args.length - 1).git_hash;
    output::info(&format!(
        "Simulating {} commits of '{}', regression after commit {}",
        args.length,
        backend.repository(),
        args.culprit
    ));

    config.engine.max_ticks.get_or_insert(DEFAULT_MAX_TICKS);
    let (tx, rx) = progress_channel();
    let engine = Engine::new(config, Services::from_backend(backend.clone())).with_progress(tx);
    let report = Report {
        json: args.json,
        state: args.state,
    };

    let result = drive(engine, arguments, rx, report, true).await;
    output::dim(&format!("{} builds requested", backend.build_requests()));
    result
}
