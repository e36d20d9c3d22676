//! Human-readable run summaries.
//!
//! A terminal run carries enough detail to render the CLI summary and the
//! tracker comment without going back to the logs.

use serde::Serialize;

use super::{EventLevel, Run, RunFailureCode, RunOutcome, RunState};
use crate::agents::Role;

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: String,
    pub index: usize,
    pub role: Role,
    pub description: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub requirement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<RunFailureCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
    pub tasks: Vec<TaskReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_summary: Option<String>,
    pub requested_changes: Vec<String>,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn from_run(run: &Run) -> Self {
        let (error_code, error_message) = match &run.outcome {
            Some(RunOutcome::Failed { code, message }) => (Some(*code), Some(message.clone())),
            _ => (None, None),
        };

        let tasks = run
            .tasks
            .iter()
            .map(|t| TaskReport {
                id: t.id().to_string(),
                index: t.index(),
                role: t.role(),
                description: t.description().to_string(),
                state: match t.failure() {
                    Some(f) => format!("failed ({})", f.code()),
                    None if t.state().is_success() => "succeeded".to_string(),
                    None => "pending".to_string(),
                },
                failure: t.failure().map(|f| f.to_string()),
                summary: t.output().map(|o| o.summary.clone()).filter(|s| !s.is_empty()),
                files: t
                    .output()
                    .map(|o| o.changes.paths().map(str::to_string).collect())
                    .unwrap_or_default(),
            })
            .collect();

        let requested_changes = run
            .review
            .as_ref()
            .map(|review| {
                review
                    .requested_changes
                    .iter()
                    .map(|c| {
                        let task = run
                            .task(c.task_id)
                            .map(|t| format!("task {} ({})", t.index() + 1, t.role()))
                            .unwrap_or_else(|| format!("task {}", c.task_id));
                        format!("{}: {}", task, c.note)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            run_id: run.id.to_string(),
            state: run.state,
            requirement: run.request.requirement.clone(),
            error_code,
            error_message,
            pull_request_url: run.pull_request().map(|pr| pr.url.clone()),
            tasks,
            review_summary: run.review.as_ref().map(|r| r.summary.clone()),
            requested_changes,
            warnings: run
                .history
                .iter()
                .filter(|e| e.level == EventLevel::Warn)
                .map(|e| e.message.clone())
                .collect(),
        }
    }

    /// Markdown rendering, used for tracker comments and CLI output.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("**Run {}**: {}\n", self.run_id, self.state);
        if let Some(code) = &self.error_code {
            out.push_str(&format!(
                "\nError `{}`: {}\n",
                code,
                self.error_message.as_deref().unwrap_or("")
            ));
        }
        if let Some(url) = &self.pull_request_url {
            out.push_str(&format!("\nPull request: {}\n", url));
        }

        if !self.tasks.is_empty() {
            out.push_str("\n| # | Role | Task | Result |\n|---|---|---|---|\n");
            for t in &self.tasks {
                out.push_str(&format!(
                    "| {} | {} | {} | {} |\n",
                    t.index + 1,
                    t.role,
                    t.description.replace('|', "\\|"),
                    t.state
                ));
            }
            for t in self.tasks.iter().filter(|t| t.failure.is_some()) {
                out.push_str(&format!(
                    "\n- Task {} failed: {}",
                    t.index + 1,
                    t.failure.as_deref().unwrap_or("")
                ));
            }
            out.push('\n');
        }

        if let Some(summary) = &self.review_summary {
            out.push_str(&format!("\nReview: {}\n", summary));
        }
        for change in &self.requested_changes {
            out.push_str(&format!("- [ ] {}\n", change));
        }
        if !self.warnings.is_empty() {
            out.push_str("\nWarnings:\n");
            for w in &self.warnings {
                out.push_str(&format!("- {}\n", w));
            }
        }
        out
    }
}
