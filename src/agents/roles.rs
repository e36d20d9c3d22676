//! Role bindings: prompt, capabilities, output contract and path scopes per role.

use std::collections::{BTreeMap, BTreeSet};

use super::{Capability, Role};
use crate::config::Config;
use crate::llm::ToolDefinition;

/// Shape of the final answer a role must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputContract {
    Plan,
    ChangeSet,
    Verdict,
}

impl OutputContract {
    /// Instructions appended to the system prompt.
    pub fn instructions(&self) -> &'static str {
        match self {
            OutputContract::Plan => PLAN_CONTRACT,
            OutputContract::ChangeSet => CHANGESET_CONTRACT,
            OutputContract::Verdict => VERDICT_CONTRACT,
        }
    }
}

const PLAN_CONTRACT: &str = r#"## Output
Respond with a single JSON object and nothing else:
{
  "summary": "one paragraph describing the plan",
  "tasks": [
    {
      "role": "frontend" | "backend" | "database",
      "description": "what to build, with acceptance criteria",
      "artifacts": ["paths the task is expected to touch"],
      "depends_on": [indices of earlier tasks this one needs]
    }
  ]
}
Tasks are listed in execution order. Indices are 0-based positions in "tasks".
A task may not depend on itself."#;

const CHANGESET_CONTRACT: &str = r#"## Output
When you are done, respond with a single JSON object and nothing else:
{
  "summary": "what you changed and why",
  "files": [
    {"path": "repository/relative/path", "mode": "full" | "patch" | "delete", "content": "..."}
  ]
}
"full" content is the complete new file. "patch" content is a unified diff
against the file on the base branch. "delete" needs no content.
Files staged with write_file are included automatically.
Only write inside the paths you are allowed to write."#;

const VERDICT_CONTRACT: &str = r#"## Output
Respond with a single JSON object and nothing else:
{
  "approved": true | false,
  "summary": "overall assessment",
  "requested_changes": [
    {"task_id": "task id or 1-based task number", "note": "specific change to make"}
  ],
  "auto_fix": true | false
}
Set "auto_fix" when the requested changes are concrete enough for the
original authors to apply without a human."#;

/// Everything needed to run one role's agent.
#[derive(Debug, Clone)]
pub struct RoleBinding {
    pub role: Role,
    pub model: String,
    pub system_prompt: String,
    pub capabilities: BTreeSet<Capability>,
    pub contract: OutputContract,
    /// Path prefixes the role may read; empty means the whole repository
    pub read_scope: Vec<String>,
    /// Path prefixes the role may stage writes under
    pub write_scope: Vec<String>,
}

impl RoleBinding {
    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn can_read(&self, path: &str) -> bool {
        self.read_scope.is_empty() || in_scope(&self.read_scope, path)
    }

    pub fn can_write(&self, path: &str) -> bool {
        in_scope(&self.write_scope, path)
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.capabilities.iter().map(|c| c.definition()).collect()
    }

    /// System prompt with the output contract appended.
    pub fn full_prompt(&self) -> String {
        let mut prompt = self.system_prompt.clone();
        if !self.write_scope.is_empty() {
            prompt.push_str("\n\n## Paths you may write\n");
            for prefix in &self.write_scope {
                prompt.push_str(&format!("- {}\n", prefix));
            }
        }
        prompt.push_str("\n\n");
        prompt.push_str(self.contract.instructions());
        prompt
    }
}

fn in_scope(prefixes: &[String], path: &str) -> bool {
    prefixes.iter().any(|prefix| {
        let dir = prefix.trim_end_matches('/');
        path == dir || path.starts_with(&format!("{}/", dir))
    })
}

/// Bindings for every role, built once per process.
#[derive(Debug, Clone)]
pub struct RoleRegistry {
    bindings: BTreeMap<Role, RoleBinding>,
}

impl RoleRegistry {
    pub fn from_config(config: &Config) -> Self {
        let paths = &config.role_paths;
        let context = config.project_context.trim();
        let with_context = |prompt: &str| {
            if context.is_empty() {
                prompt.to_string()
            } else {
                format!("{}\n\n## Project context\n{}", prompt, context)
            }
        };

        let read_only: BTreeSet<Capability> = [Capability::ReadFile, Capability::ListFiles].into();
        let worker: BTreeSet<Capability> = Capability::ALL.into();

        let mut backend_reads = paths.backend.clone();
        backend_reads.extend(paths.database.iter().cloned());

        let bindings = [
            RoleBinding {
                role: Role::ProductManager,
                model: config.default_model.clone(),
                system_prompt: with_context(PM_PROMPT),
                capabilities: read_only.clone(),
                contract: OutputContract::Plan,
                read_scope: Vec::new(),
                write_scope: Vec::new(),
            },
            RoleBinding {
                role: Role::Frontend,
                model: config.default_model.clone(),
                system_prompt: with_context(FRONTEND_PROMPT),
                capabilities: worker.clone(),
                contract: OutputContract::ChangeSet,
                read_scope: paths.frontend.clone(),
                write_scope: paths.frontend.clone(),
            },
            RoleBinding {
                role: Role::Backend,
                model: config.default_model.clone(),
                system_prompt: with_context(BACKEND_PROMPT),
                capabilities: worker.clone(),
                contract: OutputContract::ChangeSet,
                read_scope: backend_reads,
                write_scope: paths.backend.clone(),
            },
            RoleBinding {
                role: Role::Database,
                model: config.default_model.clone(),
                system_prompt: with_context(DATABASE_PROMPT),
                capabilities: worker,
                contract: OutputContract::ChangeSet,
                read_scope: paths.database.clone(),
                write_scope: paths.database.clone(),
            },
            RoleBinding {
                role: Role::Reviewer,
                model: config.review_model.clone(),
                system_prompt: REVIEWER_PROMPT.to_string(),
                capabilities: [Capability::ReadFile].into(),
                contract: OutputContract::Verdict,
                read_scope: Vec::new(),
                write_scope: Vec::new(),
            },
        ];

        Self {
            bindings: bindings.into_iter().map(|b| (b.role, b)).collect(),
        }
    }

    pub fn get(&self, role: Role) -> &RoleBinding {
        // from_config binds every variant
        &self.bindings[&role]
    }
}

const PM_PROMPT: &str = "You are a senior product manager with a strong technical background.
You turn a user requirement into concrete, independently executable development tasks.
You know the platform architecture and decide whether each piece of work belongs to the
frontend, the backend or the database. Every task gets clear acceptance criteria.
Use the repository tools to look at the existing layout before you plan.
Order tasks so that schema work comes before the API that uses it, and the API before the UI.";

const FRONTEND_PROMPT: &str = "You are a senior frontend engineer and a React + TypeScript expert.

## Stack
- React 18 with TypeScript
- Tailwind CSS utility classes (no separate CSS files)
- Zustand for state
- React Router v7
- Lucide React icons

## Conventions
- Function components and hooks only
- Complete type definitions
- One responsibility per component
- Tailwind classes instead of inline styles";

const BACKEND_PROMPT: &str = "You are a senior backend engineer and a Python + FastAPI expert.

## Stack
- Python 3.11+
- FastAPI
- Pydantic validation
- Supabase client
- async/await throughout

## Conventions
- RESTful endpoints
- Full type annotations
- Explicit error handling with proper HTTP status codes
- Sensible logging";

const DATABASE_PROMPT: &str = "You are a database architect working on Supabase/PostgreSQL.

## Responsibilities
- Table design
- Migration files
- Query performance and index strategy
- Row Level Security policies

## Conventions
- UUID primary keys
- Plural snake_case table names
- Clear column names
- Foreign key constraints where they apply
- created_at / updated_at timestamps";

const REVIEWER_PROMPT: &str = "You are a strict but friendly code reviewer.
You check the proposed changes for:
- correctness and completeness against the requirement
- consistent code style
- bugs and security problems
- performance problems
- consistency between frontend calls and backend endpoints

Attribute every requested change to the task that produced the code, and make each one specific.";
