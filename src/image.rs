use std::fmt;

use serde::{Deserialize, Serialize};

pub const LATEST_TAG: &str = "latest";
const COMMIT_TAG_LEN: usize = 12;

/// `repository:tag` pair for a container image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Immutable reference derived from the triggering commit.
    pub fn for_commit(repository: &str, commit: &str) -> Self {
        Self::new(repository, commit_tag(commit))
    }

    pub fn latest(&self) -> Self {
        Self::new(self.repository.clone(), LATEST_TAG)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// `sha-` plus the first 12 characters of the commit, normalised to a valid tag.
pub fn commit_tag(commit: &str) -> String {
    let normalised: String = commit
        .trim()
        .chars()
        .take(COMMIT_TAG_LEN)
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("sha-{normalised}")
}
