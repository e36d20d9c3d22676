//! Product-manager decomposition: requirement in, validated [`TaskPlan`] out.

use serde_json::Value;

use super::json::extract_json;
use super::{AgentContext, AgentError, AgentSession, Role, RoleBinding};
use crate::run::RunRequest;
use crate::task::{PlannedTask, TaskPlan, TaskPlanError};

/// Why one planner reply could not be turned into a plan.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    #[error("{0}")]
    Malformed(String),

    #[error(transparent)]
    Invalid(#[from] TaskPlanError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DecompositionError {
    #[error("Planner failed: {0}")]
    Agent(AgentError),

    #[error("Planner output invalid after {attempts} attempts: {last}")]
    Malformed { attempts: u32, last: PlanError },

    #[error("Task plan is structurally invalid: {0}")]
    Structural(TaskPlanError),
}

/// Parse and validate one planner reply.
pub fn parse_plan(text: &str) -> Result<TaskPlan, PlanError> {
    let json = extract_json(text).map_err(PlanError::Malformed)?;

    let summary = json["summary"].as_str().unwrap_or_default().to_string();
    let entries = json["tasks"]
        .as_array()
        .ok_or_else(|| PlanError::Malformed("missing \"tasks\" array".to_string()))?;

    let mut tasks = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let role: Role = entry["role"]
            .as_str()
            .ok_or_else(|| PlanError::Malformed(format!("task {} has no \"role\"", index)))?
            .parse()
            .map_err(|e| PlanError::Malformed(format!("task {}: {}", index, e)))?;

        let description = entry["description"].as_str().unwrap_or_default();

        let artifacts = match &entry["artifacts"] {
            Value::Array(items) => items
                .iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let mut planned = PlannedTask::new(role, description).with_artifacts(artifacts);
        if let Value::Array(deps) = &entry["depends_on"] {
            for dep in deps {
                let dep = dep.as_u64().ok_or_else(|| {
                    PlanError::Malformed(format!(
                        "task {} has a non-numeric dependency {}",
                        index, dep
                    ))
                })?;
                planned = planned.with_dependency(dep as usize);
            }
        }
        tasks.push(planned);
    }

    Ok(TaskPlan::new(summary, tasks)?)
}

fn initial_prompt(request: &RunRequest) -> String {
    let mut prompt = format!("## Requirement\n{}\n", request.requirement.trim());
    if let Some(priority) = request.priority {
        prompt.push_str(&format!("\nPriority: {}\n", priority));
    }
    prompt.push_str(
        "\nInspect the repository as needed, then break the requirement into tasks for the \
         frontend, backend and database roles.",
    );
    prompt
}

/// Ask the PM role for a plan, re-prompting on malformed replies.
///
/// `retries` counts extra attempts after the first. Self-dependencies and
/// cycles fail immediately.
pub async fn decompose(
    binding: &RoleBinding,
    ctx: &AgentContext,
    request: &RunRequest,
    retries: u32,
) -> Result<TaskPlan, DecompositionError> {
    let mut session = AgentSession::new(binding, ctx);
    let attempts = retries + 1;
    let mut prompt = initial_prompt(request);
    let mut last = PlanError::Malformed("no response".to_string());

    for attempt in 1..=attempts {
        let error = match session.send(prompt).await {
            Ok(text) => match parse_plan(&text) {
                Ok(plan) => {
                    tracing::info!(
                        "Decomposed requirement into {} tasks (attempt {})",
                        plan.tasks().len(),
                        attempt
                    );
                    return Ok(plan);
                }
                Err(PlanError::Invalid(e)) if e.is_structural() => {
                    tracing::warn!("Planner produced a structurally invalid plan: {}", e);
                    return Err(DecompositionError::Structural(e));
                }
                Err(e) => e,
            },
            Err(AgentError::InvalidOutput(detail)) => PlanError::Malformed(detail),
            Err(e) => return Err(DecompositionError::Agent(e)),
        };

        tracing::warn!(
            "Planner attempt {}/{} unusable: {}",
            attempt,
            attempts,
            error
        );
        prompt = format!(
            "Your previous response could not be used: {}\n\
             Reply again with only the JSON object described in the Output section.",
            error
        );
        last = error;
    }

    Err(DecompositionError::Malformed { attempts, last })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::RoleRegistry;
    use crate::config::Config;
    use crate::llm::Completion;
    use crate::repo::InMemoryRepository;
    use crate::testing::ScriptedLlm;
    use std::sync::Arc;

    const GOOD_PLAN: &str = r#"```json
{"summary": "upload", "tasks": [
  {"role": "database", "description": "images table", "artifacts": ["supabase/migrations/003_images.sql"]},
  {"role": "backend", "description": "upload endpoint", "depends_on": [0]},
  {"role": "frontend", "description": "upload button", "depends_on": [1]}
]}
```"#;

    fn context(llm: ScriptedLlm) -> (RoleRegistry, AgentContext) {
        let config = Config::new("key".to_string(), "test/model".to_string());
        let repo = InMemoryRepository::new("acme/app", "main");
        (
            RoleRegistry::from_config(&config),
            AgentContext::new(Arc::new(llm), Arc::new(repo), "main"),
        )
    }

    #[test]
    fn test_parse_plan() {
        let plan = parse_plan(GOOD_PLAN).unwrap();
        assert_eq!(plan.summary(), "upload");
        assert_eq!(plan.tasks().len(), 3);
        assert_eq!(plan.tasks()[1].depends_on, vec![0]);
        assert_eq!(plan.tasks()[2].role, Role::Frontend);
    }

    #[test]
    fn test_parse_plan_errors() {
        assert!(matches!(parse_plan("no"), Err(PlanError::Malformed(_))));
        assert!(matches!(
            parse_plan(r#"{"tasks": [{"role": "designer", "description": "x"}]}"#),
            Err(PlanError::Malformed(_))
        ));
        assert!(matches!(
            parse_plan(r#"{"tasks": []}"#),
            Err(PlanError::Invalid(TaskPlanError::Empty))
        ));
        assert!(matches!(
            parse_plan(r#"{"tasks": [{"role": "backend", "description": "x", "depends_on": [0]}]}"#),
            Err(PlanError::Invalid(TaskPlanError::SelfDependency { index: 0 }))
        ));
    }

    #[tokio::test]
    async fn test_decompose_recovers_after_malformed_reply() {
        let llm = ScriptedLlm::new(vec![
            Completion::text("Sure, here is my plan: first the database..."),
            Completion::text(GOOD_PLAN),
        ]);
        let (registry, ctx) = context(llm.clone());
        let request = RunRequest::new("Add image upload to posts");

        let plan = decompose(registry.get(Role::ProductManager), &ctx, &request, 2)
            .await
            .unwrap();
        assert_eq!(plan.tasks().len(), 3);

        let calls = llm.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].last_user.contains("could not be used"));
    }

    #[tokio::test]
    async fn test_decompose_gives_up() {
        let llm = ScriptedLlm::new(vec![
            Completion::text("not json"),
            Completion::text("{\"tasks\": \"nope\"}"),
        ]);
        let (registry, ctx) = context(llm);
        let err = decompose(
            registry.get(Role::ProductManager),
            &ctx,
            &RunRequest::new("x"),
            1,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DecompositionError::Malformed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_structural_errors_do_not_retry() {
        let llm = ScriptedLlm::new(vec![Completion::text(
            r#"{"tasks": [
                {"role": "backend", "description": "a", "depends_on": [1]},
                {"role": "frontend", "description": "b", "depends_on": [0]}
            ]}"#,
        )]);
        let (registry, ctx) = context(llm.clone());
        let err = decompose(
            registry.get(Role::ProductManager),
            &ctx,
            &RunRequest::new("x"),
            2,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            DecompositionError::Structural(TaskPlanError::CircularDependency)
        ));
        assert_eq!(llm.call_count(), 1);
    }
}
