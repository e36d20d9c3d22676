//! Configuration management for devcrew.
//!
//! Configuration is read once from environment variables at process start and
//! shared as an immutable `Arc<Config>` by the orchestrator and every client.
//!
//! - `OPENROUTER_API_KEY` - Required. Model gateway key.
//! - `DEFAULT_MODEL` - Optional. Model used by every role. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `REVIEW_MODEL` - Optional. Model used by the reviewer. Defaults to `DEFAULT_MODEL`.
//! - `HOST` / `PORT` - Optional. HTTP bind address. Defaults to `127.0.0.1:3000`.
//! - `GITHUB_TOKEN` / `GITHUB_REPO` - Optional. Target repository (`owner/name`).
//! - `GITHUB_BASE_BRANCH` - Optional. Pull request base. Defaults to `main`.
//! - `BRANCH_PREFIX` - Optional. Work branch prefix. Defaults to `ai-dev`.
//! - `LINEAR_API_KEY` / `LINEAR_TEAM_ID` - Optional. Tracker; disabled when unset.
//! - `LINEAR_STATE_SUCCEEDED` / `LINEAR_STATE_PARTIAL` / `LINEAR_STATE_FAILED` - Optional. Workflow state names.
//! - `WEBHOOK_SECRET` - Optional. HMAC secret for inbound webhooks.
//! - `PROJECT_CONTEXT` / `PROJECT_CONTEXT_FILE` - Optional. Architecture hints for the planner.
//! - `FRONTEND_PATHS` / `BACKEND_PATHS` / `DATABASE_PATHS` - Optional. Comma-separated path scopes per role.
//! - `DECOMPOSITION_RETRIES` - Optional. Defaults to `2`.
//! - `ROLE_OUTPUT_RETRIES` - Optional. Defaults to `1`.
//! - `MAX_TOOL_ITERATIONS` - Optional. Defaults to `12`.
//! - `MAX_CONCURRENT_TASKS` / `MAX_CONCURRENT_RUNS` - Optional. Default to `4` / `2`.
//! - `TASK_TIMEOUT_SECS` / `RUN_TIMEOUT_SECS` - Optional. Default to `300` / `1800`.
//! - `REQUIRE_REVIEW_APPROVAL` - Optional. Block publication unless the reviewer approves. Defaults to `false`.
//! - `TRACK_TASK_ISSUES` - Optional. File one tracker issue per decomposed task. Defaults to `false`.
//! - `MAX_RETAINED_RUNS` - Optional. Runs the server keeps in memory. Defaults to `1000`.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetrySettings;
use crate::run::DEFAULT_RETAINED_RUNS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read {0}: {1}")]
    Io(String, String),
}

const DEFAULT_PROJECT_CONTEXT: &str = "\
Frontend lives under src/ (React + TypeScript, Vite, Tailwind CSS, Zustand stores in src/stores/, \
routes in src/routes/, components in src/components/, pages in src/pages/, hooks in src/hooks/, \
API calls in src/api/).
Backend lives under server/ (Python + FastAPI, routers in server/routers/, models in server/models/, \
services in server/services/, Pydantic validation).
Database is Supabase (PostgreSQL); migrations live in supabase/migrations/.";

/// GitHub repository settings.
#[derive(Debug, Clone, Default)]
pub struct GitHubConfig {
    pub token: Option<String>,
    /// Default repository in `owner/name` form
    pub repository: Option<String>,
    pub base_branch: String,
    pub branch_prefix: String,
}

impl GitHubConfig {
    /// Whether the GitHub client can be constructed.
    pub fn is_enabled(&self) -> bool {
        self.token.is_some() && self.repository.is_some()
    }
}

/// Linear tracker settings.
#[derive(Debug, Clone, Default)]
pub struct LinearConfig {
    pub api_key: Option<String>,
    pub team_id: Option<String>,
    /// Workflow state names used for terminal run states
    pub state_succeeded: String,
    pub state_partial: String,
    pub state_failed: String,
}

impl LinearConfig {
    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some() && self.team_id.is_some()
    }
}

/// Path scopes for the worker roles.
#[derive(Debug, Clone)]
pub struct RolePaths {
    pub frontend: Vec<String>,
    pub backend: Vec<String>,
    pub database: Vec<String>,
}

impl Default for RolePaths {
    fn default() -> Self {
        Self {
            frontend: vec!["src/".to_string()],
            backend: vec!["server/".to_string()],
            database: vec!["supabase/migrations/".to_string()],
        }
    }
}

/// Orchestration limits and policies.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Extra decomposition attempts after a malformed planner response
    pub decomposition_retries: u32,
    /// Extra prompts after a schema-invalid role output
    pub role_output_retries: u32,
    /// Maximum tool-call rounds in a single agent conversation
    pub max_tool_iterations: usize,
    pub max_concurrent_tasks: usize,
    pub max_concurrent_runs: usize,
    pub task_timeout: Duration,
    pub run_timeout: Duration,
    /// When set, only an approving review lets the pull request open
    pub require_review_approval: bool,
    /// File a tracker issue for every task of a run that has an issue or project
    pub track_task_issues: bool,
    /// Run snapshots kept by the server before finished runs are evicted
    pub max_retained_runs: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            decomposition_retries: 2,
            role_output_retries: 1,
            max_tool_iterations: 12,
            max_concurrent_tasks: 4,
            max_concurrent_runs: 2,
            task_timeout: Duration::from_secs(300),
            run_timeout: Duration::from_secs(1800),
            require_review_approval: false,
            track_task_issues: false,
            max_retained_runs: DEFAULT_RETAINED_RUNS,
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// Model used by the planner and worker roles
    pub default_model: String,

    /// Model used by the reviewer
    pub review_model: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Architecture hints handed to the planner and workers
    pub project_context: String,

    pub github: GitHubConfig,

    pub linear: LinearConfig,

    /// Shared secret for webhook signatures
    pub webhook_secret: Option<String>,

    pub role_paths: RolePaths,

    pub orchestrator: OrchestratorConfig,

    /// Backoff policies for external calls
    pub retry: RetrySettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let default_model = std::env::var("DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());
        let review_model = std::env::var("REVIEW_MODEL").unwrap_or_else(|_| default_model.clone());

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_env("PORT", 3000u16)?;

        let project_context = load_project_context(
            std::env::var("PROJECT_CONTEXT_FILE").ok(),
            std::env::var("PROJECT_CONTEXT").ok(),
        )?;

        let github = GitHubConfig {
            token: std::env::var("GITHUB_TOKEN").ok(),
            repository: std::env::var("GITHUB_REPO").ok(),
            base_branch: std::env::var("GITHUB_BASE_BRANCH").unwrap_or_else(|_| "main".to_string()),
            branch_prefix: std::env::var("BRANCH_PREFIX").unwrap_or_else(|_| "ai-dev".to_string()),
        };

        let linear = LinearConfig {
            api_key: std::env::var("LINEAR_API_KEY").ok(),
            team_id: std::env::var("LINEAR_TEAM_ID").ok(),
            state_succeeded: std::env::var("LINEAR_STATE_SUCCEEDED")
                .unwrap_or_else(|_| "In Review".to_string()),
            state_partial: std::env::var("LINEAR_STATE_PARTIAL")
                .unwrap_or_else(|_| "In Review".to_string()),
            state_failed: std::env::var("LINEAR_STATE_FAILED")
                .unwrap_or_else(|_| "Canceled".to_string()),
        };

        let defaults = RolePaths::default();
        let role_paths = RolePaths {
            frontend: parse_list("FRONTEND_PATHS").unwrap_or(defaults.frontend),
            backend: parse_list("BACKEND_PATHS").unwrap_or(defaults.backend),
            database: parse_list("DATABASE_PATHS").unwrap_or(defaults.database),
        };

        let base = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig {
            decomposition_retries: parse_env("DECOMPOSITION_RETRIES", base.decomposition_retries)?,
            role_output_retries: parse_env("ROLE_OUTPUT_RETRIES", base.role_output_retries)?,
            max_tool_iterations: parse_env("MAX_TOOL_ITERATIONS", base.max_tool_iterations)?,
            max_concurrent_tasks: parse_env("MAX_CONCURRENT_TASKS", base.max_concurrent_tasks)?
                .max(1),
            max_concurrent_runs: parse_env("MAX_CONCURRENT_RUNS", base.max_concurrent_runs)?.max(1),
            task_timeout: Duration::from_secs(parse_env(
                "TASK_TIMEOUT_SECS",
                base.task_timeout.as_secs(),
            )?),
            run_timeout: Duration::from_secs(parse_env(
                "RUN_TIMEOUT_SECS",
                base.run_timeout.as_secs(),
            )?),
            require_review_approval: parse_env(
                "REQUIRE_REVIEW_APPROVAL",
                base.require_review_approval,
            )?,
            track_task_issues: parse_env("TRACK_TASK_ISSUES", base.track_task_issues)?,
            max_retained_runs: parse_env("MAX_RETAINED_RUNS", base.max_retained_runs)?.max(1),
        };

        Ok(Self {
            api_key,
            default_model,
            review_model,
            host,
            port,
            project_context,
            github,
            linear,
            webhook_secret: std::env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
            role_paths,
            orchestrator,
            retry: RetrySettings::default(),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String) -> Self {
        Self {
            api_key,
            review_model: default_model.clone(),
            default_model,
            host: "127.0.0.1".to_string(),
            port: 3000,
            project_context: DEFAULT_PROJECT_CONTEXT.to_string(),
            github: GitHubConfig {
                token: None,
                repository: None,
                base_branch: "main".to_string(),
                branch_prefix: "ai-dev".to_string(),
            },
            linear: LinearConfig {
                api_key: None,
                team_id: None,
                state_succeeded: "In Review".to_string(),
                state_partial: "In Review".to_string(),
                state_failed: "Canceled".to_string(),
            },
            webhook_secret: None,
            role_paths: RolePaths::default(),
            orchestrator: OrchestratorConfig::default(),
            retry: RetrySettings::default(),
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// A context file wins over inline text; blank values fall back to the built-in hints.
fn load_project_context(file: Option<String>, inline: Option<String>) -> Result<String, ConfigError> {
    if let Some(path) = file.filter(|p| !p.trim().is_empty()) {
        return std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(path, e.to_string()));
    }
    Ok(inline
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PROJECT_CONTEXT.to_string()))
}

fn parse_list(name: &str) -> Option<Vec<String>> {
    split_list(&std::env::var(name).ok()?)
}

fn split_list(raw: &str) -> Option<Vec<String>> {
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_split_list_trims_and_drops_empty_items() {
        assert_eq!(
            split_list(" web/, app/src/ ,,"),
            Some(vec!["web/".to_string(), "app/src/".to_string()])
        );
        assert_eq!(split_list(" , "), None);
    }

    #[test]
    fn test_project_context_file_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("context.md");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "Frontend lives under web/").expect("write");

        let context = load_project_context(
            Some(path.to_string_lossy().to_string()),
            Some("inline".to_string()),
        )
        .unwrap();
        assert_eq!(context.trim(), "Frontend lives under web/");

        assert_eq!(
            load_project_context(None, Some("inline".to_string())).unwrap(),
            "inline"
        );
        assert_eq!(
            load_project_context(None, Some("  ".to_string())).unwrap(),
            DEFAULT_PROJECT_CONTEXT
        );
    }

    #[test]
    fn test_missing_context_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("nope.md").to_string_lossy().to_string();
        assert!(matches!(
            load_project_context(Some(missing), None),
            Err(ConfigError::Io(_, _))
        ));
    }

    #[test]
    fn test_new_uses_default_model_for_review() {
        let config = Config::new("key".to_string(), "test/model".to_string());
        assert_eq!(config.review_model, "test/model");
        assert_eq!(config.github.branch_prefix, "ai-dev");
        assert!(!config.orchestrator.require_review_approval);
        assert!(!config.orchestrator.track_task_issues);
        assert_eq!(config.orchestrator.max_retained_runs, 1000);
    }
}
