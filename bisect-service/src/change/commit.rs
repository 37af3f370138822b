// Commit
// A repository pinned to a revision, and midpoint search over commit ranges

use crate::services::{BackendError, CommitInfo, SourceControl};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Raised when two points cannot be bisected any further
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NonLinearError {
    #[error("Repositories differ between commits: {0} vs {1}")]
    RepositoryMismatch(String, String),

    #[error("Commit \"{0}\" does not come before commit \"{1}\"")]
    NotAncestor(String, String),

    #[error("Commits {0} and {1} are adjacent")]
    Adjacent(String, String),

    #[error("Patches differ between changes: {0} vs {1}")]
    PatchMismatch(String, String),
}

impl NonLinearError {
    /// Adjacent commits are the expected end of a bisection, not malformed input
    pub fn is_adjacent(&self) -> bool {
        matches!(self, NonLinearError::Adjacent(..))
    }
}

/// Errors from a midpoint lookup
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MidpointError {
    #[error(transparent)]
    NonLinear(#[from] NonLinearError),

    #[error("Commit range lookup failed: {0}")]
    Backend(#[from] BackendError),
}

/// A git repository pinned to a particular commit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Commit {
    pub repository: String,
    pub git_hash: String,
}

impl Commit {
    pub fn new(repository: impl Into<String>, git_hash: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            git_hash: git_hash.into(),
        }
    }

    /// Unique string for this repository and hash
    pub fn id_string(&self) -> String {
        format!("{}@{}", self.repository, self.git_hash)
    }

    /// Commits after `from` up to and including `to` along the first-parent chain,
    /// newest first. Merged side branches are skipped.
    pub async fn commit_range(
        from: &Commit,
        to: &Commit,
        source_control: &dyn SourceControl,
    ) -> Result<Vec<CommitInfo>, BackendError> {
        let log = source_control
            .commit_range(&from.repository, &from.git_hash, &to.git_hash)
            .await?;

        let mut expected_parent = to.git_hash.clone();
        let mut commits = Vec::new();
        for info in log {
            if info.commit != expected_parent {
                continue;
            }
            if let Some(parent) = info.parents.first() {
                expected_parent = parent.clone();
            }
            commits.push(info);
        }

        Ok(commits)
    }

    /// Return the commit halfway between `a` and `b`.
    ///
    /// Returns `a` when both are the same commit, without touching the
    /// source-control service. When the range has an even number of commits,
    /// the commit before the middle is chosen.
    pub async fn midpoint(
        a: &Commit,
        b: &Commit,
        source_control: &dyn SourceControl,
    ) -> Result<Commit, MidpointError> {
        if a == b {
            return Ok(a.clone());
        }

        if a.repository != b.repository {
            return Err(NonLinearError::RepositoryMismatch(
                a.repository.clone(),
                b.repository.clone(),
            )
            .into());
        }

        let mut commits = Self::commit_range(a, b, source_control).await?;

        if commits.is_empty() {
            return Err(NonLinearError::NotAncestor(a.to_string(), b.to_string()).into());
        }

        if commits.len() == 1 {
            return Err(NonLinearError::Adjacent(a.to_string(), b.to_string()).into());
        }

        // Drop `b` itself; what remains is strictly between the two.
        commits.remove(0);

        let middle = &commits[commits.len() / 2];
        Ok(Commit::new(a.repository.clone(), middle.commit.clone()))
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.git_hash.get(..7).unwrap_or(&self.git_hash);
        write!(f, "{}@{}", self.repository, short)
    }
}
