// Output formatting helpers for CLI commands

use bisect_service::task::TaskStatus;
use bisect_service::{EngineEvent, JobStatus};

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a warning message
pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

/// Print an info message
pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

/// Print a dim failure message
pub fn dim_failure(message: &str) {
    eprintln!("\x1b[31m{}\x1b[0m", message);
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// Seconds as "1h 02m 03s", "2m 03s" or "3.2s"
pub fn duration(secs: f64) -> String {
    let whole = secs.round() as u64;
    match whole {
        0..=59 => format!("{:.1}s", secs),
        60..=3599 => format!("{}m {:02}s", whole / 60, whole % 60),
        _ => format!("{}h {:02}m {:02}s", whole / 3600, (whole % 3600) / 60, whole % 60),
    }
}

/// Render one engine event
pub fn event(event: &EngineEvent) {
    match event {
        EngineEvent::JobQueued {
            job_id,
            configuration,
        } => status("Queued", &format!("job {} on '{}'", job_id, configuration)),

        EngineEvent::JobStarted { job_id, changes } => {
            header(&format!("Job {} ({} changes)", job_id, changes));
        }

        EngineEvent::TaskUpdated {
            task_id, status, ..
        } => match status {
            TaskStatus::Failed => dim_failure(&format!("    {} failed", task_id)),
            _ => dim(&format!("    {} {:?}", task_id, status)),
        },

        EngineEvent::ChangeAdded {
            change,
            before,
            after,
            ..
        } => info(&format!("Testing {} between {} and {}", change, before, after)),

        EngineEvent::CulpritFound { culprit, next, .. } => {
            success(&format!("Culprit {} (next {})", culprit, next));
        }

        EngineEvent::JobFinished {
            status,
            difference_count,
            duration: elapsed,
            ..
        } => {
            let elapsed = duration(elapsed.as_secs_f64());
            if *status == JobStatus::Completed {
                success(&format!(
                    "Job completed in {} with {} difference(s)",
                    elapsed, difference_count
                ));
            } else {
                failure(&format!("Job {} after {}", status, elapsed));
            }
        }

        EngineEvent::JobCancelled { job_id, reason } => {
            warning(&format!("Job {} cancelled: {}", job_id, reason));
        }
    }
}
