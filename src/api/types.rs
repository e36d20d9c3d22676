//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::agents::Role;
use crate::run::{Priority, Run, RunEvent, RunFailureCode, RunId, RunReport, RunRequest, RunState};

/// Request to start a run.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunRequest {
    /// What should be built
    pub requirement: String,

    /// Target repository (`owner/name`); defaults to `GITHUB_REPO`
    pub repository: Option<String>,

    /// Tracker project to open an issue in
    pub tracker_project: Option<String>,

    pub priority: Option<Priority>,

    /// Send the requirement straight to one worker role, without planning
    pub role: Option<Role>,
}

impl From<CreateRunRequest> for RunRequest {
    fn from(req: CreateRunRequest) -> Self {
        RunRequest {
            requirement: req.requirement,
            repository: req.repository,
            tracker_project: req.tracker_project,
            tracker_issue: None,
            priority: req.priority,
            role: req.role,
        }
    }
}

/// Response after accepting a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunResponse {
    pub run_id: RunId,
    pub state: RunState,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Runs accepted but not yet started
    pub queued_runs: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// One line of the run list.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: RunId,
    pub title: String,
    pub state: RunState,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<RunFailureCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id,
            title: run.request.title(),
            state: run.state,
            created_at: run.created_at.clone(),
            updated_at: run.updated_at.clone(),
            error_code: run.failure_code(),
            pull_request_url: run.pull_request().map(|pr| pr.url.clone()),
        }
    }
}

/// Full run view: the report plus bookkeeping the report leaves out.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub report: RunReport,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_issue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_status: Option<String>,
    pub history: Vec<RunEvent>,
}

impl From<&Run> for RunDetail {
    fn from(run: &Run) -> Self {
        Self {
            report: run.report(),
            created_at: run.created_at.clone(),
            updated_at: run.updated_at.clone(),
            tracker_issue: run.tracker_issue.clone(),
            external_status: run.external_status.clone(),
            history: run.history.clone(),
        }
    }
}

/// What a webhook delivery led to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// A new run was queued
    Started {
        #[serde(rename = "runId")]
        run_id: RunId,
    },
    /// The status was recorded on an existing run
    Correlated {
        #[serde(rename = "runId")]
        run_id: RunId,
    },
    Ignored { reason: String },
}
