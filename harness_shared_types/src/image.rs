//! Container image references.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Identifies a container image by repository and tag or digest.
///
/// A version starting with `sha256:` is treated as a digest and rendered
/// as `repository@digest`; anything else is a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub version: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            version: version.into(),
        }
    }

    /// Parse `repo[:tag]` or `repo@sha256:...`. A missing tag means `latest`.
    pub fn parse(reference: &str) -> Result<Self, JobError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(JobError::InvalidSpec("image reference is empty".to_string()));
        }

        if let Some((repository, digest)) = reference.split_once('@') {
            if repository.is_empty() || digest.is_empty() {
                return Err(JobError::InvalidSpec(format!(
                    "malformed digest reference: {}",
                    reference
                )));
            }
            return Ok(Self::new(repository, digest));
        }

        // A colon inside the last path segment separates the tag; a colon
        // before a slash belongs to a registry host:port.
        let last_segment = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        match reference[last_segment..].rfind(':') {
            Some(pos) => {
                let split = last_segment + pos;
                let (repository, tag) = (&reference[..split], &reference[split + 1..]);
                if repository.is_empty() || tag.is_empty() {
                    return Err(JobError::InvalidSpec(format!(
                        "malformed image reference: {}",
                        reference
                    )));
                }
                Ok(Self::new(repository, tag))
            }
            None => Ok(Self::new(reference, "latest")),
        }
    }

    /// Whether the version is a content digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        self.version.starts_with("sha256:")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_digest() {
            write!(f, "{}@{}", self.repository, self.version)
        } else {
            write!(f, "{}:{}", self.repository, self.version)
        }
    }
}
