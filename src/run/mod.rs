//! Runs: one end-to-end execution of a requirement.
//!
//! The orchestrator owns a `Run` while it executes and publishes owned
//! snapshots to the [`RunStore`] after every transition.
//!
//! # State Machine
//! ```text
//! Intake -> Decomposing -> Dispatching -> Reviewing -> Finalizing -> Succeeded
//!                                 ^  \          |                \-> PartiallyFailed
//!                                 |   \         |                \-> Failed
//!                                 |    \-> Finalizing (run deadline)
//!                                 \--------- (fix cycle, once)
//! any non-terminal state -> Failed
//! ```

mod report;
mod store;

pub use report::{RunReport, TaskReport};
pub use store::{InMemoryRunStore, IssueLink, RunStore, DEFAULT_RETAINED_RUNS};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::{ReviewVerdict, Role};
use crate::repo::PullRequestRef;
use crate::task::{ChangeSet, PathConflict, Task, TaskId};

/// Current time as RFC3339.
pub(crate) fn now_string() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// All 32 hex digits without hyphens, used in branch names.
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Intake,
    Decomposing,
    Dispatching,
    Reviewing,
    Finalizing,
    Succeeded,
    Failed,
    PartiallyFailed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::PartiallyFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Intake => "intake",
            RunState::Decomposing => "decomposing",
            RunState::Dispatching => "dispatching",
            RunState::Reviewing => "reviewing",
            RunState::Finalizing => "finalizing",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::PartiallyFailed => "partially_failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error codes for failed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailureCode {
    InvalidInput,
    DecompositionFailed,
    AllTasksFailed,
    Timeout,
    PublishFailed,
    /// Reviewer disapproved and review approval is required
    ReviewRejected,
}

impl RunFailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunFailureCode::InvalidInput => "invalid_input",
            RunFailureCode::DecompositionFailed => "decomposition_failed",
            RunFailureCode::AllTasksFailed => "all_tasks_failed",
            RunFailureCode::Timeout => "timeout",
            RunFailureCode::PublishFailed => "publish_failed",
            RunFailureCode::ReviewRejected => "review_rejected",
        }
    }
}

impl std::fmt::Display for RunFailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Published {
        pull_request: PullRequestRef,
        /// The pull request already existed and was reused
        #[serde(default)]
        reused: bool,
    },
    Failed {
        code: RunFailureCode,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "4" => Ok(Priority::Low),
            "normal" | "medium" | "3" | "0" => Ok(Priority::Normal),
            "high" | "2" => Ok(Priority::High),
            "urgent" | "1" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

/// Trigger input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub requirement: String,
    /// Target repository override (`owner/name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Tracker project; an issue is created there when none is linked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_project: Option<String>,
    /// Existing tracker issue the run reports to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_issue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Worker role the requirement is addressed to; skips decomposition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl RunRequest {
    pub fn new(requirement: impl Into<String>) -> Self {
        Self {
            requirement: requirement.into(),
            ..Self::default()
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_tracker_issue(mut self, issue: impl Into<String>) -> Self {
        self.tracker_issue = Some(issue.into());
        self
    }

    pub fn with_tracker_project(mut self, project: impl Into<String>) -> Self {
        self.tracker_project = Some(project.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// A short title for branches, issues and pull requests.
    pub fn title(&self) -> String {
        let first_line = self.requirement.trim().lines().next().unwrap_or("").trim();
        let mut title: String = first_line.chars().take(72).collect();
        if first_line.chars().count() > 72 {
            title.push_str("...");
        }
        title
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
}

/// One line of a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub at: String,
    pub level: EventLevel,
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunError {
    #[error("Run already finished in state {0}")]
    AlreadyTerminal(RunState),

    #[error("Invalid run transition from {from} to {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("The review fix cycle already ran")]
    FixCycleExhausted,
}

/// One end-to-end execution of a requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub request: RunRequest,
    pub created_at: String,
    pub updated_at: String,
    pub state: RunState,
    /// Tasks in decomposition order
    pub tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_summary: Option<String>,
    /// Aggregate of successful task outputs
    #[serde(default)]
    pub changes: ChangeSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<PathConflict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    /// Some tasks failed; the run can at best end `PartiallyFailed`
    pub partial: bool,
    /// The review fix cycle ran
    pub redispatched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_issue: Option<String>,
    /// Last status reported by the tracker webhook
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_status: Option<String>,
    pub history: Vec<RunEvent>,
}

impl Run {
    pub fn new(request: RunRequest) -> Self {
        let now = now_string();
        Self {
            id: RunId::new(),
            tracker_issue: request.tracker_issue.clone(),
            request,
            created_at: now.clone(),
            updated_at: now,
            state: RunState::Intake,
            tasks: Vec::new(),
            plan_summary: None,
            changes: ChangeSet::new(),
            conflicts: Vec::new(),
            review: None,
            outcome: None,
            partial: false,
            redispatched: false,
            external_status: None,
            history: Vec::new(),
        }
    }

    fn allowed(&self, to: RunState) -> bool {
        use RunState::*;
        if to == Failed {
            return true;
        }
        matches!(
            (self.state, to),
            (Intake, Decomposing)
                | (Decomposing, Dispatching)
                | (Dispatching, Reviewing)
                | (Dispatching, Finalizing)
                | (Reviewing, Dispatching)
                | (Reviewing, Finalizing)
                | (Finalizing, Succeeded)
                | (Finalizing, PartiallyFailed)
        )
    }

    /// Move to `to`, enforcing the transition table.
    pub fn transition(&mut self, to: RunState) -> Result<(), RunError> {
        if self.state.is_terminal() {
            return Err(RunError::AlreadyTerminal(self.state));
        }
        if !self.allowed(to) {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        if (self.state, to) == (RunState::Reviewing, RunState::Dispatching) {
            if self.redispatched {
                return Err(RunError::FixCycleExhausted);
            }
            self.redispatched = true;
        }

        tracing::info!("Run {}: {} -> {}", self.id, self.state, to);
        self.record(EventLevel::Info, format!("{} -> {}", self.state, to));
        self.state = to;
        Ok(())
    }

    /// Terminate with a stable failure code.
    pub fn fail(&mut self, code: RunFailureCode, message: impl Into<String>) -> Result<(), RunError> {
        let message = message.into();
        self.transition(RunState::Failed)?;
        tracing::warn!("Run {} failed ({}): {}", self.id, code, message);
        self.outcome = Some(RunOutcome::Failed { code, message });
        Ok(())
    }

    /// Terminate after publication; `PartiallyFailed` when some tasks failed.
    pub fn complete(&mut self, pull_request: PullRequestRef, reused: bool) -> Result<(), RunError> {
        let to = if self.partial {
            RunState::PartiallyFailed
        } else {
            RunState::Succeeded
        };
        self.transition(to)?;
        self.outcome = Some(RunOutcome::Published {
            pull_request,
            reused,
        });
        Ok(())
    }

    pub fn record(&mut self, level: EventLevel, message: impl Into<String>) {
        let now = now_string();
        self.history.push(RunEvent {
            at: now.clone(),
            level,
            message: message.into(),
        });
        self.updated_at = now;
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("Run {}: {}", self.id, message);
        self.record(EventLevel::Warn, message);
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id() == id)
    }

    pub fn failure_code(&self) -> Option<RunFailureCode> {
        match &self.outcome {
            Some(RunOutcome::Failed { code, .. }) => Some(*code),
            _ => None,
        }
    }

    pub fn pull_request(&self) -> Option<&PullRequestRef> {
        match &self.outcome {
            Some(RunOutcome::Published { pull_request, .. }) => Some(pull_request),
            _ => None,
        }
    }

    pub fn succeeded_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.state().is_success())
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.failure().is_some())
    }

    /// Work branch for this run; deterministic so re-publishing finds it again.
    pub fn branch_name(&self, prefix: &str) -> String {
        let prefix = prefix.trim_end_matches('/');
        format!("{}/run-{}", prefix, self.id.simple())
    }

    pub fn report(&self) -> RunReport {
        RunReport::from_run(self)
    }
}
