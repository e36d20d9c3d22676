//! Shared inputs for an agent conversation.

use std::sync::Arc;

use crate::llm::LlmClient;
use crate::repo::RepositoryClient;
use crate::retry::RetryPolicies;

/// Immutable collaborators handed to every agent call of a run.
///
/// Cloning is cheap; spawned task invocations each get their own copy.
#[derive(Clone)]
pub struct AgentContext {
    pub llm: Arc<dyn LlmClient>,

    /// Read-only from the agents' side
    pub repo: Arc<dyn RepositoryClient>,

    /// Ref all reads are served from
    pub base_ref: String,

    /// Backoff for model gateway calls
    pub model_retry: RetryPolicies,

    /// Maximum tool-call rounds per conversation turn
    pub max_tool_iterations: usize,
}

impl AgentContext {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        repo: Arc<dyn RepositoryClient>,
        base_ref: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            repo,
            base_ref: base_ref.into(),
            model_retry: RetryPolicies::none(),
            max_tool_iterations: 12,
        }
    }

    pub fn with_model_retry(mut self, policies: RetryPolicies) -> Self {
        self.model_retry = policies;
        self
    }

    pub fn with_max_tool_iterations(mut self, max: usize) -> Self {
        self.max_tool_iterations = max.max(1);
        self
    }
}
