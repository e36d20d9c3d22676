//! Repository client: source-control operations against one target repository.
//!
//! Role agents only ever read through this interface. The orchestrator is
//! the single writer and materializes a run's ChangeSet once, serially, in
//! the finalizing step.

mod github;
mod memory;

pub use github::{GitHubConnector, GitHubRepository};
pub use memory::{InMemoryRepository, PullRequestRecord};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::retry::{RetryClass, Retryable};
use crate::task::ChangeSet;

/// A pull request opened (or found) for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
    pub branch: String,
}

/// Everything needed to open a pull request.
#[derive(Debug, Clone)]
pub struct PullRequestDraft {
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RepoError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Branch or pull request already exists, or a ref update lost a race
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Repository API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid repository '{0}', expected owner/name")]
    InvalidRepository(String),

    #[error("No repository configured")]
    NotConfigured,
}

impl Retryable for RepoError {
    fn retry_class(&self) -> RetryClass {
        match self {
            RepoError::RateLimited { .. } => RetryClass::RateLimited,
            // every publish failure gets its one retry, permission errors included
            RepoError::Conflict(_)
            | RepoError::Network(_)
            | RepoError::Api { .. }
            | RepoError::NotFound(_)
            | RepoError::PermissionDenied(_) => RetryClass::Transient,
            RepoError::InvalidRepository(_) | RepoError::NotConfigured => RetryClass::Fatal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RepoError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Source-control operations the orchestrator depends on.
///
/// Every operation is atomic from the caller's point of view: a failed
/// `commit_changes` leaves the branch where it was.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Repository in `owner/name` form.
    fn repository(&self) -> &str;

    /// File content at `git_ref`, `None` when the file does not exist.
    async fn read_file(&self, git_ref: &str, path: &str) -> Result<Option<String>, RepoError>;

    /// File paths at `git_ref` under `prefix` (empty prefix lists everything).
    async fn list_files(&self, git_ref: &str, prefix: &str) -> Result<Vec<String>, RepoError>;

    async fn branch_exists(&self, name: &str) -> Result<bool, RepoError>;

    /// Create `name` from the head of `base`. Fails with `Conflict` if it exists.
    async fn create_branch(&self, base: &str, name: &str) -> Result<(), RepoError>;

    /// Commit the whole ChangeSet as a single commit; returns the commit id.
    async fn commit_changes(
        &self,
        branch: &str,
        changes: &ChangeSet,
        message: &str,
    ) -> Result<String, RepoError>;

    /// An open pull request from `branch`, if any.
    async fn find_pull_request(&self, branch: &str) -> Result<Option<PullRequestRef>, RepoError>;

    async fn open_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequestRef, RepoError>;
}

/// Resolves the repository a run targets (default or per-run override).
pub trait RepositoryConnector: Send + Sync {
    fn connect(&self, repository: Option<&str>) -> Result<Arc<dyn RepositoryClient>, RepoError>;
}

/// Split and validate `owner/name`.
pub fn parse_repository(repository: &str) -> Result<(String, String), RepoError> {
    let trimmed = repository
        .trim()
        .trim_start_matches("https://github.com/")
        .trim_end_matches(".git")
        .trim_matches('/');
    let mut parts = trimmed.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
            Ok((owner.to_string(), name.to_string()))
        }
        _ => Err(RepoError::InvalidRepository(repository.to_string())),
    }
}
