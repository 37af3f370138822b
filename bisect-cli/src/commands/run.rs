use crate::output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use tracing::debug;

use bisect_service::{
    progress_channel, Engine, EngineConfig, HttpServices, JobArguments, JobStatus,
    ProgressReceiver, StatusOptions,
};

/// Run a bisection job against the configured services
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the job YAML file
    pub job: PathBuf,

    /// Print the final job status as JSON
    #[arg(long)]
    pub json: bool,

    /// Include the per-change state in the JSON status
    #[arg(long, requires = "json")]
    pub state: bool,
}

/// Output options shared by the commands that drive a job
#[derive(Debug, Clone, Copy)]
pub struct Report {
    pub json: bool,
    pub state: bool,
}

pub fn load_job(path: &Path) -> Result<JobArguments> {
    if !path.exists() {
        color_eyre::eyre::bail!("Job file not found: {}", path.display());
    }
    output::status("Loading", &format!("{}", path.display()));
    Ok(JobArguments::from_file(path)?)
}

pub async fn execute(args: RunArgs, config: EngineConfig) -> Result<()> {
    let arguments = load_job(&args.job)?;
    let services = HttpServices::new(config.services.clone()).into_services();

    let (tx, rx) = progress_channel();
    let engine = Engine::new(config, services).with_progress(tx);
    let report = Report {
        json: args.json,
        state: args.state,
    };
    drive(engine, arguments, rx, report, false).await
}

/// Submit one job, tick the engine until it is idle and report the outcome.
///
/// Exits with status 1 when the job does not complete.
pub async fn drive(
    engine: Engine,
    arguments: JobArguments,
    mut rx: ProgressReceiver,
    report: Report,
    without_sleeping: bool,
) -> Result<()> {
    let job_id = engine.submit(arguments).await?;
    debug!(job_id = %job_id, "job submitted");
    let engine = Arc::new(engine);

    let runner = engine.clone();
    let mut handle = tokio::spawn(async move {
        if without_sleeping {
            runner.run_until_idle().await
        } else {
            runner.run().await
        }
    });

    // Render events in the foreground until the engine goes idle
    let ticks = loop {
        tokio::select! {
            Some(event) = rx.recv() => output::event(&event),
            ticks = &mut handle => break ticks?,
        }
    };
    while let Ok(event) = rx.try_recv() {
        output::event(&event);
    }
    output::dim(&format!("{} ticks", ticks));

    let status = engine
        .job_status(
            &job_id,
            StatusOptions {
                state: report.state,
                estimate: false,
            },
        )
        .await?;
    if report.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else if let Some(exception) = status["exception"].as_str() {
        output::error(exception);
    }

    let completed = engine
        .store()
        .update(&job_id, |job| job.status == JobStatus::Completed)
        .await
        .unwrap_or(false);
    if !completed {
        std::process::exit(1);
    }
    Ok(())
}
