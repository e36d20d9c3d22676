//! Worker roles: one Task in, one ChangeSet fragment out.
//!
//! Inputs are owned so an invocation can be spawned onto its own tokio task.
//! Patch entries are resolved against the base branch here, before the
//! fragment leaves the worker, so downstream code only sees full contents
//! and deletions.

use serde::Deserialize;
use serde_json::Value;

use super::json::extract_json;
use super::session::normalize_path;
use super::{AgentContext, AgentError, AgentSession, Role, RoleBinding};
use crate::task::{apply_patch, ChangeSet, FileChange, Task, TaskFailure, TaskOutput};

/// Largest prerequisite file body copied into a worker prompt.
const MAX_CONTEXT_CHARS: usize = 6_000;

/// Output of a task this one depends on.
#[derive(Debug, Clone)]
pub struct Prerequisite {
    pub index: usize,
    pub role: Role,
    pub description: String,
    pub output: TaskOutput,
}

#[derive(Debug, Clone)]
pub struct WorkerInput {
    pub task: Task,
    pub requirement: String,
    pub prerequisites: Vec<Prerequisite>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("Model gateway error: {0}")]
    Model(String),

    #[error("Role output invalid: {0}")]
    InvalidOutput(String),
}

impl WorkerError {
    pub fn into_failure(self) -> TaskFailure {
        match self {
            WorkerError::Model(detail) => TaskFailure::Model { detail },
            WorkerError::InvalidOutput(detail) => TaskFailure::RoleOutputInvalid { detail },
        }
    }
}

/// How a proposed file should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposedMode {
    #[serde(alias = "create", alias = "update", alias = "replace")]
    Full,
    #[serde(alias = "diff")]
    Patch,
    #[serde(alias = "remove")]
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProposedFile {
    pub path: String,
    #[serde(default = "default_mode")]
    pub mode: ProposedMode,
    #[serde(default)]
    pub content: Option<String>,
}

fn default_mode() -> ProposedMode {
    ProposedMode::Full
}

/// Parsed worker reply, before paths and patches are resolved.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerReply {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files: Vec<ProposedFile>,
}

pub fn parse_worker_output(text: &str) -> Result<WorkerReply, String> {
    let mut json = extract_json(text)?;
    // modes are matched case-insensitively
    if let Some(files) = json.get_mut("files").and_then(Value::as_array_mut) {
        for file in files {
            if let Some(Value::String(mode)) = file.get_mut("mode") {
                *mode = mode.to_ascii_lowercase();
            }
        }
    }
    serde_json::from_value(json).map_err(|e| format!("output does not match the schema: {}", e))
}

/// Turn a reply plus any files staged through `write_file` into a fragment.
async fn resolve(
    reply: WorkerReply,
    staged: &ChangeSet,
    binding: &RoleBinding,
    ctx: &AgentContext,
) -> Result<ChangeSet, String> {
    let mut changes = staged.clone();

    for file in reply.files {
        let path = normalize_path(&file.path)?;
        if !binding.can_write(&path) {
            return Err(format!(
                "{} is outside the paths the {} role may write ({})",
                path,
                binding.role,
                binding.write_scope.join(", ")
            ));
        }

        let change = match file.mode {
            ProposedMode::Delete => FileChange::delete(),
            ProposedMode::Full => {
                let content = file
                    .content
                    .ok_or_else(|| format!("{} has mode \"full\" but no content", path))?;
                FileChange::full(content)
            }
            ProposedMode::Patch => {
                let diff = file
                    .content
                    .ok_or_else(|| format!("{} has mode \"patch\" but no diff", path))?;
                let base = match changes.get(&path) {
                    Some(staged) if !staged.is_delete() => staged.content.clone(),
                    _ => ctx
                        .repo
                        .read_file(&ctx.base_ref, &path)
                        .await
                        .map_err(|e| format!("could not read {} to apply the patch: {}", path, e))?
                        .unwrap_or_default(),
                };
                let patched = apply_patch(&base, &diff)
                    .map_err(|e| format!("patch for {} does not apply: {}", path, e))?;
                FileChange::full(patched)
            }
        };
        changes.insert(path, change);
    }

    if changes.is_empty() {
        return Err("no files were produced".to_string());
    }
    Ok(changes)
}

fn push_files(prompt: &mut String, changes: &ChangeSet) {
    for (path, change) in changes.iter() {
        if change.is_delete() {
            prompt.push_str(&format!("- {} (deleted)\n", path));
            continue;
        }
        let body = if change.content.len() > MAX_CONTEXT_CHARS {
            let mut end = MAX_CONTEXT_CHARS;
            while !change.content.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}\n... [truncated]", &change.content[..end])
        } else {
            change.content.clone()
        };
        prompt.push_str(&format!("- {}\n```\n{}\n```\n", path, body));
    }
}

fn build_prompt(input: &WorkerInput) -> String {
    let task = &input.task;
    let mut prompt = format!(
        "## Task {} ({})\n{}\n",
        task.index() + 1,
        task.role(),
        task.description()
    );
    if !task.artifacts().is_empty() {
        prompt.push_str(&format!("\nExpected files: {}\n", task.artifacts().join(", ")));
    }

    prompt.push_str(&format!("\n## Overall requirement\n{}\n", input.requirement.trim()));

    if !input.prerequisites.is_empty() {
        prompt.push_str("\n## Work already done by earlier tasks\n");
        for pre in &input.prerequisites {
            prompt.push_str(&format!(
                "\n### Task {} ({}): {}\n{}\n",
                pre.index + 1,
                pre.role,
                pre.description,
                pre.output.summary
            ));
            push_files(&mut prompt, &pre.output.changes);
        }
    }

    if let Some(note) = task.review_note() {
        prompt.push_str(&format!("\n## Review feedback to address\n{}\n", note));
        if let Some(previous) = task.output() {
            prompt.push_str("\n## Your previous output\n");
            prompt.push_str(&previous.summary);
            prompt.push('\n');
            push_files(&mut prompt, &previous.changes);
            prompt.push_str("\nReturn the complete revised set of files for this task.\n");
        }
    }

    prompt
}

/// Run one task through its role agent.
///
/// A reply that violates the output contract is re-prompted `retries` times
/// with the validation error before the task is given up on.
pub async fn run_worker(
    binding: &RoleBinding,
    ctx: &AgentContext,
    input: &WorkerInput,
    retries: u32,
) -> Result<TaskOutput, WorkerError> {
    let mut session = AgentSession::new(binding, ctx);
    let attempts = retries + 1;
    let mut prompt = build_prompt(input);
    let mut last = String::new();

    for attempt in 1..=attempts {
        let result = match session.send(prompt).await {
            Ok(text) => match parse_worker_output(&text) {
                Ok(reply) => {
                    let summary = reply.summary.clone();
                    resolve(reply, session.staged(), binding, ctx)
                        .await
                        .map(|changes| TaskOutput { summary, changes })
                }
                Err(e) => Err(e),
            },
            Err(AgentError::InvalidOutput(detail)) => Err(detail),
            Err(AgentError::MaxIterations(n)) => {
                return Err(WorkerError::InvalidOutput(format!(
                    "no final answer after {} tool rounds",
                    n
                )))
            }
            Err(e) => return Err(WorkerError::Model(e.to_string())),
        };

        match result {
            Ok(output) => {
                tracing::debug!(
                    "Task {} ({}) produced {} files",
                    input.task.index() + 1,
                    binding.role,
                    output.changes.len()
                );
                return Ok(output);
            }
            Err(detail) => {
                tracing::warn!(
                    "Task {} ({}) attempt {}/{} output invalid: {}",
                    input.task.index() + 1,
                    binding.role,
                    attempt,
                    attempts,
                    detail
                );
                prompt = format!(
                    "Your previous response could not be used: {}\n\
                     Reply again with only the JSON object described in the Output section.",
                    detail
                );
                last = detail;
            }
        }
    }

    Err(WorkerError::InvalidOutput(last))
}
