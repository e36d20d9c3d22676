//! Scripted collaborators for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::llm::{ChatMessage, Completion, CompletionRequest, LlmClient, LlmError, Role};

/// One scripted gateway reply.
#[derive(Debug, Clone)]
pub struct Step {
    delay: Duration,
    result: Result<Completion, LlmError>,
}

impl Step {
    pub fn reply(completion: Completion) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(completion),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::reply(Completion::text(text))
    }

    pub fn fail(error: LlmError) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(error),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl From<Completion> for Step {
    fn from(completion: Completion) -> Self {
        Step::reply(completion)
    }
}

/// A recorded gateway call.
#[derive(Debug, Clone)]
pub struct LoggedCall {
    pub model: String,
    pub system_prompt: String,
    /// First user message of the conversation
    pub opening: String,
    /// Latest user message of the conversation
    pub last_user: String,
    pub tools: Vec<String>,
    pub started: Instant,
    pub finished: Option<Instant>,
}

#[derive(Default)]
struct State {
    /// (needle, replies); matched against system prompt + opening message
    routes: Vec<(String, VecDeque<Step>)>,
    fallback: VecDeque<Step>,
    calls: Vec<LoggedCall>,
}

/// Gateway that replays scripted steps.
///
/// Routed steps are picked by a substring of the system prompt or of the
/// first user message, so concurrent conversations stay deterministic.
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    state: Arc<Mutex<State>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Completion>) -> Self {
        Self::from_steps(replies.into_iter().map(Step::from).collect())
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        let llm = Self::default();
        llm.lock().fallback = steps.into();
        llm
    }

    /// Add replies for conversations mentioning `needle`.
    pub fn route(self, needle: &str, steps: Vec<Step>) -> Self {
        self.lock().routes.push((needle.to_string(), steps.into()));
        self
    }

    pub fn calls(&self) -> Vec<LoggedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Calls whose conversation mentions `needle`.
    pub fn calls_matching(&self, needle: &str) -> Vec<LoggedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.system_prompt.contains(needle) || c.opening.contains(needle))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn user_texts(messages: &[ChatMessage]) -> impl Iterator<Item = &str> {
    messages
        .iter()
        .filter(|m| m.role == Role::User)
        .filter_map(|m| m.text_content())
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let opening = user_texts(&request.messages).next().unwrap_or_default().to_string();
        let last_user = user_texts(&request.messages).last().unwrap_or_default().to_string();

        let (step, index) = {
            let mut state = self.lock();
            let haystack = format!("{}\n{}", request.system_prompt, opening);
            let routed = state
                .routes
                .iter_mut()
                .find(|(needle, steps)| !steps.is_empty() && haystack.contains(needle.as_str()))
                .and_then(|(_, steps)| steps.pop_front());
            let step = routed.or_else(|| state.fallback.pop_front());

            state.calls.push(LoggedCall {
                model: request.model.clone(),
                system_prompt: request.system_prompt.clone(),
                opening,
                last_user,
                tools: request.tools.iter().map(|t| t.function.name.clone()).collect(),
                started: Instant::now(),
                finished: None,
            });
            (step, state.calls.len() - 1)
        };

        let Some(step) = step else {
            return Err(LlmError::invalid_request(None, "script exhausted"));
        };
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        self.lock().calls[index].finished = Some(Instant::now());
        step.result
    }
}
