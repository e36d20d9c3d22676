//! Agents module - role-specialized model workers.
//!
//! # Roles
//! - **ProductManager**: decomposes a requirement into a [`TaskPlan`](crate::task::TaskPlan)
//! - **Frontend / Backend / Database**: turn one Task into a ChangeSet fragment
//! - **Reviewer**: judges the aggregated ChangeSet and returns a [`ReviewVerdict`]
//!
//! # Capabilities
//! Tool calls are a closed set ([`Capability`]). Each role is bound to a
//! subset in its [`RoleBinding`]; a call outside that subset is rejected by
//! the [`AgentSession`] before anything runs.

mod context;
mod json;
mod planner;
mod reviewer;
mod roles;
mod session;
mod worker;

pub use context::AgentContext;
pub use planner::{decompose, parse_plan, DecompositionError, PlanError};
pub use reviewer::{parse_verdict, review, RequestedChange, ReviewError, ReviewInput, ReviewVerdict};
pub use roles::{OutputContract, RoleBinding, RoleRegistry};
pub use session::AgentSession;
pub use worker::{
    parse_worker_output, run_worker, Prerequisite, ProposedFile, ProposedMode, WorkerError,
    WorkerInput, WorkerReply,
};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::llm::{FunctionDefinition, LlmError, ToolDefinition};
use crate::repo::RepoError;

/// Fixed role variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[serde(alias = "pm")]
    ProductManager,
    Frontend,
    Backend,
    Database,
    Reviewer,
}

impl Role {
    /// Roles that can be assigned decomposed tasks.
    pub const WORKERS: [Role; 3] = [Role::Frontend, Role::Backend, Role::Database];

    pub fn is_dispatchable(&self) -> bool {
        Self::WORKERS.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ProductManager => "product_manager",
            Role::Frontend => "frontend",
            Role::Backend => "backend",
            Role::Database => "database",
            Role::Reviewer => "reviewer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "pm" | "product_manager" => Ok(Role::ProductManager),
            "frontend" | "front_end" | "ui" => Ok(Role::Frontend),
            "backend" | "back_end" | "api" | "server" => Ok(Role::Backend),
            "database" | "db" | "schema" => Ok(Role::Database),
            "reviewer" | "review" => Ok(Role::Reviewer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Closed set of tool calls an agent may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadFile,
    ListFiles,
    /// Stage a file into the task's ChangeSet fragment (never source control)
    WriteFile,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::ReadFile, Capability::ListFiles, Capability::WriteFile];

    pub fn tool_name(&self) -> &'static str {
        match self {
            Capability::ReadFile => "read_file",
            Capability::ListFiles => "list_files",
            Capability::WriteFile => "write_file",
        }
    }

    pub fn from_tool_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.tool_name() == name)
    }

    /// Tool schema sent to the model.
    pub fn definition(&self) -> ToolDefinition {
        let (description, parameters) = match self {
            Capability::ReadFile => (
                "Read a file from the base branch of the repository.",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string", "description": "Repository-relative path"}},
                    "required": ["path"]
                }),
            ),
            Capability::ListFiles => (
                "List files under a directory prefix of the base branch.",
                json!({
                    "type": "object",
                    "properties": {"prefix": {"type": "string", "description": "Directory prefix, e.g. src/components/"}},
                    "required": []
                }),
            ),
            Capability::WriteFile => (
                "Stage the full new content of a file (or delete it) for this task.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"},
                        "delete": {"type": "boolean"}
                    },
                    "required": ["path"]
                }),
            ),
        };
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: self.tool_name().to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

/// Errors that can occur in a single agent conversation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("Model gateway error: {0}")]
    Model(#[from] LlmError),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),

    #[error("Max tool iterations reached: {0}")]
    MaxIterations(usize),
}
