//! Core Task type and its state machine.
//!
//! # Invariants
//! - `id` is unique; a Task belongs to exactly one Run (`run_id`)
//! - `depends_on` only names Tasks of the same Run
//! - A Task is never deleted; it only reaches a terminal state
//!   (or is reopened by the review fix cycle, which bumps `revision`)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::changeset::ChangeSet;
use crate::agents::Role;
use crate::run::RunId;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    /// Output did not match the role's contract after the re-prompt
    RoleOutputInvalid { detail: String },
    /// Per-task timeout or run deadline
    Timeout,
    /// Model gateway failure after retries
    Model { detail: String },
    /// A prerequisite did not succeed
    DependencyFailed { dependency: TaskId },
}

impl TaskFailure {
    /// Stable snake-case code.
    pub fn code(&self) -> &'static str {
        match self {
            TaskFailure::RoleOutputInvalid { .. } => "role_output_invalid",
            TaskFailure::Timeout => "timeout",
            TaskFailure::Model { .. } => "model_error",
            TaskFailure::DependencyFailed { .. } => "dependency_failed",
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskFailure::RoleOutputInvalid { detail } => write!(f, "invalid role output: {}", detail),
            TaskFailure::Timeout => write!(f, "timed out"),
            TaskFailure::Model { detail } => write!(f, "model gateway error: {}", detail),
            TaskFailure::DependencyFailed { dependency } => {
                write!(f, "prerequisite task {} did not succeed", dependency)
            }
        }
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Running -> Succeeded
///       |           \-> Failed
///       \-> Failed (dependency failure, run deadline)
/// Succeeded -> Pending (review fix cycle only, via `reopen`)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed { failure: TaskFailure },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskState::Succeeded)
    }

    fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Running => "Running",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed { .. } => "Failed",
        }
    }
}

/// Result payload of a successful task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub summary: String,
    /// ChangeSet fragment produced by the task
    pub changes: ChangeSet,
}

/// One decomposed unit of work, assigned to a single role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    run_id: RunId,
    /// Position in the decomposition
    index: usize,
    role: Role,
    description: String,
    /// Target hints (file paths, schema names)
    artifacts: Vec<String>,
    depends_on: Vec<TaskId>,
    state: TaskState,
    output: Option<TaskOutput>,
    /// Reviewer note attached when the task is reopened
    #[serde(skip_serializing_if = "Option::is_none")]
    review_note: Option<String>,
    /// Tracker issue filed for this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tracker_issue: Option<String>,
    /// Agent invocations started for this task
    attempts: u32,
    revision: u32,
}

impl Task {
    /// Create a new pending task.
    ///
    /// # Errors
    /// Returns `TaskError::EmptyDescription` if `description` is blank.
    pub fn new(
        run_id: RunId,
        index: usize,
        role: Role,
        description: impl Into<String>,
    ) -> Result<Self, TaskError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(TaskError::EmptyDescription);
        }

        Ok(Self {
            id: TaskId::new(),
            run_id,
            index,
            role,
            description,
            artifacts: Vec::new(),
            depends_on: Vec::new(),
            state: TaskState::Pending,
            output: None,
            review_note: None,
            tracker_issue: None,
            attempts: 0,
            revision: 0,
        })
    }

    /// Used when ids are allocated ahead of time so dependencies can refer to them.
    pub(crate) fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_dependencies(mut self, depends_on: Vec<TaskId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn artifacts(&self) -> &[String] {
        &self.artifacts
    }

    pub fn depends_on(&self) -> &[TaskId] {
        &self.depends_on
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        self.output.as_ref()
    }

    pub fn review_note(&self) -> Option<&str> {
        self.review_note.as_deref()
    }

    pub fn tracker_issue(&self) -> Option<&str> {
        self.tracker_issue.as_deref()
    }

    pub fn set_tracker_issue(&mut self, issue_id: impl Into<String>) {
        self.tracker_issue = Some(issue_id.into());
    }

    /// One-line label used in tracker issues and pull request annotations.
    pub fn headline(&self) -> String {
        format!(
            "Task {} ({}): {}",
            self.index + 1,
            self.role,
            self.description.lines().next().unwrap_or_default().trim()
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// The failure, if the task ended in `Failed`.
    pub fn failure(&self) -> Option<&TaskFailure> {
        match &self.state {
            TaskState::Failed { failure } => Some(failure),
            _ => None,
        }
    }

    // State transitions - explicit and validated

    /// `Pending -> Running`.
    pub fn start(&mut self) -> Result<(), TaskError> {
        match self.state {
            TaskState::Pending => {
                self.state = TaskState::Running;
                self.attempts += 1;
                Ok(())
            }
            ref other => Err(TaskError::invalid(other, "Running")),
        }
    }

    /// `Running -> Succeeded`, recording the output.
    pub fn succeed(&mut self, output: TaskOutput) -> Result<(), TaskError> {
        match self.state {
            TaskState::Running => {
                self.state = TaskState::Succeeded;
                self.output = Some(output);
                Ok(())
            }
            ref other => Err(TaskError::invalid(other, "Succeeded")),
        }
    }

    /// `Running -> Failed`, or `Pending -> Failed` for dependency failures and timeouts.
    pub fn fail(&mut self, failure: TaskFailure) -> Result<(), TaskError> {
        let allowed = match self.state {
            TaskState::Running => true,
            TaskState::Pending => matches!(
                failure,
                TaskFailure::DependencyFailed { .. } | TaskFailure::Timeout
            ),
            _ => false,
        };
        if !allowed {
            return Err(TaskError::invalid(&self.state, "Failed"));
        }
        self.state = TaskState::Failed { failure };
        Ok(())
    }

    /// `Succeeded -> Pending` for the review fix cycle.
    ///
    /// The previous output is kept so it can be restored if the rerun fails.
    pub fn reopen(&mut self, note: impl Into<String>) -> Result<(), TaskError> {
        match self.state {
            TaskState::Succeeded => {
                self.state = TaskState::Pending;
                self.review_note = Some(note.into());
                self.revision += 1;
                Ok(())
            }
            ref other => Err(TaskError::invalid(other, "Pending")),
        }
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task description cannot be empty")]
    EmptyDescription,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl TaskError {
    fn invalid(from: &TaskState, to: &str) -> Self {
        TaskError::InvalidTransition {
            from: from.name().to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(RunId::new(), 0, Role::Backend, "add upload endpoint").unwrap()
    }

    #[test]
    fn test_empty_description_rejected() {
        let err = Task::new(RunId::new(), 0, Role::Frontend, "   ").unwrap_err();
        assert!(matches!(err, TaskError::EmptyDescription));
    }

    #[test]
    fn test_happy_path() {
        let mut t = task();
        t.start().unwrap();
        assert_eq!(t.attempts(), 1);
        t.succeed(TaskOutput::default()).unwrap();
        assert!(t.state().is_success());
        assert!(t.output().is_some());
    }

    #[test]
    fn test_terminal_states_cannot_restart() {
        let mut t = task();
        t.start().unwrap();
        t.fail(TaskFailure::Timeout).unwrap();
        assert!(t.start().is_err());
        assert!(t.succeed(TaskOutput::default()).is_err());
        assert!(t.fail(TaskFailure::Timeout).is_err());
    }

    #[test]
    fn test_pending_may_only_fail_for_dependency_or_deadline() {
        let mut t = task();
        let err = t
            .fail(TaskFailure::RoleOutputInvalid {
                detail: "x".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));

        t.fail(TaskFailure::DependencyFailed {
            dependency: TaskId::new(),
        })
        .unwrap();
        assert_eq!(t.failure().map(|f| f.code()), Some("dependency_failed"));
    }

    #[test]
    fn test_reopen_keeps_output_and_bumps_revision() {
        let mut t = task();
        t.start().unwrap();
        t.succeed(TaskOutput {
            summary: "first".to_string(),
            changes: ChangeSet::new(),
        })
        .unwrap();

        t.reopen("validate file size").unwrap();
        assert_eq!(t.state(), &TaskState::Pending);
        assert_eq!(t.revision(), 1);
        assert_eq!(t.review_note(), Some("validate file size"));
        assert_eq!(t.output().map(|o| o.summary.as_str()), Some("first"));

        // only a succeeded task can be reopened
        assert!(t.reopen("again").is_err());
    }
}
