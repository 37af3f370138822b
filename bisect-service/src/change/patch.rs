// Patch
// A code review patch applied on top of a set of commits

use serde::{Deserialize, Serialize};
use std::fmt;

/// A patch on a code review server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Patch {
    pub server: String,
    pub change: String,
    pub revision: String,
}

impl Patch {
    pub fn new(
        server: impl Into<String>,
        change: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            change: change.into(),
            revision: revision.into(),
        }
    }

    /// Parse a review URL of the form `https://host/c/project/+/<change>/<revision>`
    /// or `https://host/<change>/<revision>`
    pub fn from_url(url: &str) -> Option<Self> {
        let (scheme, rest) = url.split_once("://")?;
        let (host, path) = rest.split_once('/')?;
        let parts: Vec<&str> = path
            .split('/')
            .filter(|p| !p.is_empty() && *p != "c" && *p != "+")
            .collect();

        let numeric: Vec<&str> = parts
            .iter()
            .copied()
            .filter(|p| p.chars().all(|c| c.is_ascii_digit()))
            .collect();

        let change = numeric.first()?;
        let revision = numeric.get(1).copied().unwrap_or("current");
        Some(Self::new(format!("{}://{}", scheme, host), *change, revision))
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.server, self.change, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url() {
        let patch =
            Patch::from_url("https://review.example.com/c/project/+/658277/4").unwrap();
        assert_eq!(patch.server, "https://review.example.com");
        assert_eq!(patch.change, "658277");
        assert_eq!(patch.revision, "4");

        let patch = Patch::from_url("https://review.example.com/658277").unwrap();
        assert_eq!(patch.revision, "current");
    }

    #[test]
    fn test_from_url_invalid() {
        assert!(Patch::from_url("not a url").is_none());
        assert!(Patch::from_url("https://review.example.com/c/project").is_none());
    }
}
