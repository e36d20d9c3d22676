//! Reviewer role: judges the aggregated ChangeSet.
//!
//! Every requested change must name a Task of the run, either by id or by
//! its 1-based position. A verdict naming anything else is malformed and is
//! re-prompted under the same policy as worker output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::json::extract_json;
use super::{AgentContext, AgentError, AgentSession, RoleBinding};
use crate::task::{ChangeSet, Task, TaskId, TaskState};

const MAX_FILE_CHARS: usize = 8_000;
const MAX_TOTAL_CHARS: usize = 120_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedChange {
    pub task_id: TaskId,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub approved: bool,
    pub summary: String,
    #[serde(default)]
    pub requested_changes: Vec<RequestedChange>,
    /// The requested changes can be applied by the original roles without a human
    #[serde(default)]
    pub auto_fix: bool,
}

impl ReviewVerdict {
    /// Tasks named by requested changes, first mention first.
    pub fn tasks_to_fix(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = Vec::new();
        for change in &self.requested_changes {
            if !ids.contains(&change.task_id) {
                ids.push(change.task_id);
            }
        }
        ids
    }

    /// All notes addressed to `task`, joined.
    pub fn notes_for(&self, task: TaskId) -> String {
        self.requested_changes
            .iter()
            .filter(|c| c.task_id == task)
            .map(|c| format!("- {}", c.note))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReviewError {
    #[error("Reviewer failed: {0}")]
    Agent(AgentError),

    #[error("Reviewer output invalid: {0}")]
    Malformed(String),
}

/// What the reviewer looks at.
#[derive(Debug, Clone, Copy)]
pub struct ReviewInput<'a> {
    pub requirement: &'a str,
    pub tasks: &'a [Task],
    pub changes: &'a ChangeSet,
}

fn resolve_task_id(value: &Value, tasks: &[Task]) -> Result<TaskId, String> {
    let raw = match value {
        Value::String(s) => s.trim().trim_start_matches('#').to_string(),
        Value::Number(n) => n.to_string(),
        _ => return Err("requested change has no task_id".to_string()),
    };

    if let Ok(id) = raw.parse::<TaskId>() {
        if tasks.iter().any(|t| t.id() == id) {
            return Ok(id);
        }
    } else if let Ok(position) = raw.parse::<usize>() {
        if let Some(task) = tasks.iter().find(|t| t.index() + 1 == position) {
            return Ok(task.id());
        }
    }
    Err(format!("requested change references unknown task '{}'", raw))
}

/// Parse one reviewer reply against the tasks of the run.
pub fn parse_verdict(text: &str, tasks: &[Task]) -> Result<ReviewVerdict, String> {
    let json = extract_json(text)?;

    let approved = json["approved"]
        .as_bool()
        .ok_or_else(|| "missing boolean \"approved\"".to_string())?;
    let summary = json["summary"].as_str().unwrap_or_default().trim().to_string();

    let mut requested_changes = Vec::new();
    if let Some(entries) = json["requested_changes"].as_array() {
        for entry in entries {
            let task_id = resolve_task_id(&entry["task_id"], tasks)?;
            let note = entry["note"].as_str().unwrap_or_default().trim();
            if note.is_empty() {
                return Err("requested change has an empty note".to_string());
            }
            requested_changes.push(RequestedChange {
                task_id,
                note: note.to_string(),
            });
        }
    }

    Ok(ReviewVerdict {
        approved,
        summary,
        requested_changes,
        auto_fix: json["auto_fix"].as_bool().unwrap_or(false),
    })
}

fn build_prompt(input: &ReviewInput<'_>) -> String {
    let mut prompt = format!("## Requirement\n{}\n\n## Tasks\n", input.requirement.trim());
    for task in input.tasks {
        let status = match task.state() {
            TaskState::Succeeded => "succeeded".to_string(),
            TaskState::Failed { failure } => format!("failed: {}", failure),
            _ => "not run".to_string(),
        };
        prompt.push_str(&format!(
            "{}. [{}] ({}) {} | {}\n",
            task.index() + 1,
            task.id(),
            task.role(),
            task.description(),
            status
        ));
        if let Some(output) = task.output() {
            if !output.summary.is_empty() {
                prompt.push_str(&format!("   Summary: {}\n", output.summary));
            }
        }
    }

    prompt.push_str("\n## Changes\n");
    let mut budget = MAX_TOTAL_CHARS;
    let mut omitted = Vec::new();
    for (path, change) in input.changes.iter() {
        if change.is_delete() {
            prompt.push_str(&format!("\n### {} (deleted)\n", path));
            continue;
        }
        if budget == 0 {
            omitted.push(path);
            continue;
        }
        let limit = MAX_FILE_CHARS.min(budget);
        let mut end = change.content.len().min(limit);
        while !change.content.is_char_boundary(end) {
            end -= 1;
        }
        budget -= end;
        prompt.push_str(&format!("\n### {}\n```\n{}", path, &change.content[..end]));
        if end < change.content.len() {
            prompt.push_str("\n... [truncated]");
        }
        prompt.push_str("\n```\n");
    }
    if !omitted.is_empty() {
        prompt.push_str(&format!("\nNot shown (size limit): {}\n", omitted.join(", ")));
    }
    prompt
}

/// Review the aggregated changes, re-prompting malformed verdicts `retries` times.
pub async fn review(
    binding: &RoleBinding,
    ctx: &AgentContext,
    input: ReviewInput<'_>,
    retries: u32,
) -> Result<ReviewVerdict, ReviewError> {
    let mut session = AgentSession::new(binding, ctx);
    let attempts = retries + 1;
    let mut prompt = build_prompt(&input);
    let mut last = String::new();

    for attempt in 1..=attempts {
        let detail = match session.send(prompt).await {
            Ok(text) => match parse_verdict(&text, input.tasks) {
                Ok(verdict) => {
                    tracing::info!(
                        "Review verdict: approved={} requested_changes={}",
                        verdict.approved,
                        verdict.requested_changes.len()
                    );
                    return Ok(verdict);
                }
                Err(detail) => detail,
            },
            Err(AgentError::InvalidOutput(detail)) => detail,
            Err(e) => return Err(ReviewError::Agent(e)),
        };

        tracing::warn!("Review attempt {}/{} unusable: {}", attempt, attempts, detail);
        prompt = format!(
            "Your previous response could not be used: {}\n\
             Only reference the task ids or task numbers listed above. \
             Reply again with only the JSON object described in the Output section.",
            detail
        );
        last = detail;
    }

    Err(ReviewError::Malformed(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Role, RoleRegistry};
    use crate::config::Config;
    use crate::llm::Completion;
    use crate::repo::InMemoryRepository;
    use crate::run::RunId;
    use crate::task::{FileChange, TaskOutput};
    use crate::testing::ScriptedLlm;
    use serde_json::json;
    use std::sync::Arc;

    fn tasks() -> Vec<Task> {
        let run = RunId::new();
        let mut backend = Task::new(run, 0, Role::Backend, "upload endpoint").unwrap();
        backend.start().unwrap();
        backend
            .succeed(TaskOutput {
                summary: "POST /api/uploads".to_string(),
                changes: ChangeSet::new(),
            })
            .unwrap();
        let frontend = Task::new(run, 1, Role::Frontend, "upload button").unwrap();
        vec![backend, frontend]
    }

    #[test]
    fn test_parse_verdict_by_number_and_id() {
        let tasks = tasks();
        let text = json!({
            "approved": false,
            "summary": "needs validation",
            "requested_changes": [
                {"task_id": 1, "note": "validate file size"},
                {"task_id": tasks[1].id().to_string(), "note": "show progress"},
                {"task_id": "#1", "note": "limit mime types"}
            ],
            "auto_fix": true
        })
        .to_string();

        let verdict = parse_verdict(&text, &tasks).unwrap();
        assert!(!verdict.approved);
        assert!(verdict.auto_fix);
        assert_eq!(verdict.requested_changes[0].task_id, tasks[0].id());
        assert_eq!(verdict.requested_changes[1].task_id, tasks[1].id());
        assert_eq!(verdict.tasks_to_fix(), vec![tasks[0].id(), tasks[1].id()]);
        assert_eq!(
            verdict.notes_for(tasks[0].id()),
            "- validate file size\n- limit mime types"
        );
    }

    #[test]
    fn test_unknown_task_is_malformed() {
        let tasks = tasks();
        let unknown = json!({
            "approved": false,
            "summary": "",
            "requested_changes": [{"task_id": 7, "note": "x"}]
        });
        assert!(parse_verdict(&unknown.to_string(), &tasks)
            .unwrap_err()
            .contains("unknown task"));

        let stranger = json!({
            "approved": false,
            "summary": "",
            "requested_changes": [{"task_id": TaskId::new().to_string(), "note": "x"}]
        });
        assert!(parse_verdict(&stranger.to_string(), &tasks).is_err());
        assert!(parse_verdict("{\"summary\": \"ok\"}", &tasks).is_err());
    }

    #[tokio::test]
    async fn test_review_reprompts_on_unknown_task() {
        let tasks = tasks();
        let llm = ScriptedLlm::new(vec![
            Completion::text(r#"{"approved": false, "summary": "x", "requested_changes": [{"task_id": 9, "note": "n"}]}"#),
            Completion::text(r#"{"approved": true, "summary": "looks good"}"#),
        ]);
        let config = Config::new("key".to_string(), "test/model".to_string());
        let registry = RoleRegistry::from_config(&config);
        let ctx = AgentContext::new(
            Arc::new(llm.clone()),
            Arc::new(InMemoryRepository::new("acme/app", "main")),
            "main",
        );
        let changes = ChangeSet::new().with("server/routers/upload.py", FileChange::full("router"));
        let input = ReviewInput {
            requirement: "Image upload",
            tasks: &tasks,
            changes: &changes,
        };

        let verdict = review(registry.get(Role::Reviewer), &ctx, input, 1)
            .await
            .unwrap();
        assert!(verdict.approved);

        let calls = llm.calls();
        assert!(calls[0].last_user.contains("server/routers/upload.py"));
        assert!(calls[1].last_user.contains("unknown task '9'"));
    }

    #[test]
    fn test_large_changesets_are_truncated() {
        let tasks = tasks();
        let big = "x".repeat(MAX_FILE_CHARS * 2);
        let mut changes = ChangeSet::new();
        for i in 0..20 {
            changes.insert(format!("server/f{:02}.py", i), FileChange::full(big.clone()));
        }
        let prompt = build_prompt(&ReviewInput {
            requirement: "r",
            tasks: &tasks,
            changes: &changes,
        });
        assert!(prompt.contains("[truncated]"));
        assert!(prompt.contains("Not shown (size limit)"));
        assert!(prompt.len() < MAX_TOTAL_CHARS + 10_000);
    }
}
