// Change Module
// Points in the bisection search space: a set of commits plus an optional patch

pub mod commit;
pub mod patch;

// Re-export key types
pub use commit::{Commit, MidpointError, NonLinearError};
pub use patch::Patch;

use crate::services::SourceControl;

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the search space: commits (one per repository) plus an optional patch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Change {
    commits: Vec<Commit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patch: Option<Patch>,
}

impl Change {
    /// Create a change; later commits for an already present repository are dropped
    pub fn new(commits: impl IntoIterator<Item = Commit>, patch: Option<Patch>) -> Self {
        let mut unique: Vec<Commit> = Vec::new();
        for commit in commits {
            if !unique.iter().any(|c| c.repository == commit.repository) {
                unique.push(commit);
            }
        }
        Self {
            commits: unique,
            patch,
        }
    }

    /// A change consisting of a single commit
    pub fn from_commit(commit: Commit) -> Self {
        Self::new([commit], None)
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn patch(&self) -> Option<&Patch> {
        self.patch.as_ref()
    }

    /// The commit a build is based on
    pub fn base_commit(&self) -> Option<&Commit> {
        self.commits.first()
    }

    pub fn last_commit(&self) -> Option<&Commit> {
        self.commits.last()
    }

    /// Unique, stable string usable in task ids
    pub fn id_string(&self) -> String {
        let mut id = self
            .commits
            .iter()
            .map(Commit::id_string)
            .collect::<Vec<_>>()
            .join("+");
        if let Some(patch) = &self.patch {
            id.push_str(&format!("+patch:{}/{}", patch.change, patch.revision));
        }
        id
    }

    /// Return the change halfway between `a` and `b`.
    ///
    /// The first differing commit is bisected; every other commit is taken from `a`.
    /// Equal changes return `a` without any service lookups.
    pub async fn midpoint(
        a: &Change,
        b: &Change,
        source_control: &dyn SourceControl,
    ) -> Result<Change, MidpointError> {
        if a == b {
            return Ok(a.clone());
        }

        if a.patch != b.patch {
            return Err(NonLinearError::PatchMismatch(
                a.patch.as_ref().map(ToString::to_string).unwrap_or_default(),
                b.patch.as_ref().map(ToString::to_string).unwrap_or_default(),
            )
            .into());
        }

        let repositories = |c: &Change| {
            c.commits
                .iter()
                .map(|commit| commit.repository.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };
        if repositories(a) != repositories(b) {
            return Err(NonLinearError::RepositoryMismatch(repositories(a), repositories(b)).into());
        }

        for (index, (commit_a, commit_b)) in a.commits.iter().zip(&b.commits).enumerate() {
            if commit_a == commit_b {
                continue;
            }
            let midpoint = Commit::midpoint(commit_a, commit_b, source_control).await?;
            let mut commits = a.commits.clone();
            commits[index] = midpoint;
            return Ok(Change::new(commits, a.patch.clone()));
        }

        Ok(a.clone())
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let commits = self
            .commits
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        match &self.patch {
            Some(patch) => write!(f, "{} + {}", commits, patch),
            None => write!(f, "{}", commits),
        }
    }
}
