//! Tracker client: issues in an external project tracker.
//!
//! The tracker is observability, not a dependency of correctness. Every
//! call from the orchestrator is best effort; failures are logged and
//! dropped.

mod linear;
mod memory;
pub mod webhook;

pub use linear::LinearTracker;
pub use memory::{InMemoryTracker, NoopTracker, TrackerCall};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::retry::{RetryClass, Retryable};
use crate::run::RunState;

/// Status the orchestrator reports for a run's issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    InProgress,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl TrackerStatus {
    /// The status for a terminal run state, `None` for non-terminal states.
    pub fn for_run_state(state: RunState) -> Option<Self> {
        match state {
            RunState::Succeeded => Some(TrackerStatus::Succeeded),
            RunState::PartiallyFailed => Some(TrackerStatus::PartiallyFailed),
            RunState::Failed => Some(TrackerStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerStatus::InProgress => "in_progress",
            TrackerStatus::Succeeded => "succeeded",
            TrackerStatus::PartiallyFailed => "partially_failed",
            TrackerStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackerError {
    #[error("Tracker is not configured")]
    NotConfigured,

    #[error("Tracker unavailable: {0}")]
    Unavailable(String),

    #[error("Tracker rate limited: {0}")]
    RateLimited(String),

    #[error("Tracker rejected the request: {0}")]
    Rejected(String),

    #[error("Unknown workflow state '{0}'")]
    UnknownState(String),
}

impl Retryable for TrackerError {
    fn retry_class(&self) -> RetryClass {
        match self {
            TrackerError::RateLimited(_) => RetryClass::RateLimited,
            TrackerError::Unavailable(_) => RetryClass::Transient,
            _ => RetryClass::Fatal,
        }
    }
}

/// Issue operations the orchestrator depends on.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Create an issue; returns its id.
    async fn create_issue(
        &self,
        project: Option<&str>,
        title: &str,
        body: &str,
    ) -> Result<String, TrackerError>;

    async fn update_issue_status(&self, issue_id: &str, status: TrackerStatus) -> Result<(), TrackerError>;

    async fn add_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError>;
}

/// Inbound status notification, normalized from a tracker webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerEvent {
    pub event: String,
    pub issue_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}
