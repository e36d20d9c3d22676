//! One role's conversation with the model gateway, including tool calls.
//!
//! The session keeps the message history so a caller can re-prompt after a
//! schema violation without losing what the model already read. Tool calls
//! are checked against the role's [`RoleBinding`] before they run: unknown
//! tools, unbound capabilities and out-of-scope paths come back to the model
//! as error results and are never executed.

use serde_json::Value;

use super::{AgentContext, AgentError, Capability, RoleBinding};
use crate::llm::{ChatMessage, CompletionRequest, Role as MessageRole, ToolCall};
use crate::task::{ChangeSet, FileChange};

/// Largest file body returned to the model from a single read.
const MAX_READ_CHARS: usize = 60_000;
const MAX_LISTED_FILES: usize = 400;

pub struct AgentSession<'a> {
    binding: &'a RoleBinding,
    ctx: &'a AgentContext,
    system_prompt: String,
    messages: Vec<ChatMessage>,
    staged: ChangeSet,
    tool_log: Vec<String>,
}

impl<'a> AgentSession<'a> {
    pub fn new(binding: &'a RoleBinding, ctx: &'a AgentContext) -> Self {
        Self {
            binding,
            ctx,
            system_prompt: binding.full_prompt(),
            messages: Vec::new(),
            staged: ChangeSet::new(),
            tool_log: Vec::new(),
        }
    }

    /// Files staged through `write_file` so far.
    pub fn staged(&self) -> &ChangeSet {
        &self.staged
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn tool_log(&self) -> &[String] {
        &self.tool_log
    }

    /// Send a user message and drive tool calls until the model answers in text.
    pub async fn send(&mut self, message: impl Into<String>) -> Result<String, AgentError> {
        self.messages.push(ChatMessage::user(message));

        let tools = self.binding.tool_definitions();
        let label = format!("{} completion", self.binding.role);
        let max_iterations = self.ctx.max_tool_iterations;

        for iteration in 0..max_iterations {
            tracing::debug!("{} iteration {}", label, iteration + 1);

            let request = CompletionRequest::new(&self.binding.model, &self.system_prompt)
                .with_messages(self.messages.clone())
                .with_tools(tools.clone());
            let llm = &self.ctx.llm;
            let completion = self
                .ctx
                .model_retry
                .run(&label, || llm.complete(&request))
                .await?;

            if completion.wants_tools() {
                self.messages.push(ChatMessage::assistant_tool_calls(
                    completion.content.clone(),
                    completion.tool_calls.clone(),
                ));
                for call in &completion.tool_calls {
                    self.tool_log.push(format!(
                        "Tool: {} Args: {}",
                        call.function.name, call.function.arguments
                    ));
                    let result = match self.execute_tool_call(call).await {
                        Ok(output) => output,
                        Err(e) => format!("Error: {}", e),
                    };
                    self.messages.push(ChatMessage::tool_result(&call.id, result));
                }
                continue;
            }

            return match completion.content {
                Some(text) => {
                    self.messages
                        .push(ChatMessage::new(MessageRole::Assistant, text.clone()));
                    Ok(text)
                }
                None => Err(AgentError::InvalidOutput(
                    "model returned an empty response".to_string(),
                )),
            };
        }

        Err(AgentError::MaxIterations(max_iterations))
    }

    async fn execute_tool_call(&mut self, call: &ToolCall) -> Result<String, String> {
        let name = call.function.name.as_str();
        let Some(capability) = Capability::from_tool_name(name) else {
            tracing::warn!("{} requested unknown tool '{}'", self.binding.role, name);
            return Err(format!("unknown tool '{}'", name));
        };
        if !self.binding.allows(capability) {
            tracing::warn!(
                "{} requested '{}' outside its capabilities",
                self.binding.role,
                name
            );
            return Err(format!(
                "tool '{}' is not available to the {} role",
                name, self.binding.role
            ));
        }

        let args: Value = if call.function.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.function.arguments)
                .map_err(|e| format!("invalid arguments: {}", e))?
        };

        match capability {
            Capability::ReadFile => self.read_file(&args).await,
            Capability::ListFiles => self.list_files(&args).await,
            Capability::WriteFile => self.write_file(&args),
        }
    }

    async fn read_file(&self, args: &Value) -> Result<String, String> {
        let path = normalize_path(required_str(args, "path")?)?;
        if !self.binding.can_read(&path) {
            return Err(format!("{} is outside the paths you may read", path));
        }

        if let Some(change) = self.staged.get(&path) {
            if change.is_delete() {
                return Err(format!("{} is staged for deletion", path));
            }
            return Ok(truncate(&change.content));
        }

        match self.ctx.repo.read_file(&self.ctx.base_ref, &path).await {
            Ok(Some(content)) => Ok(truncate(&content)),
            Ok(None) => Err(format!("{} does not exist on {}", path, self.ctx.base_ref)),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn list_files(&self, args: &Value) -> Result<String, String> {
        let prefix = match args["prefix"].as_str() {
            Some(p) if !p.trim().is_empty() && p.trim() != "." && p.trim() != "/" => {
                normalize_path(p)?
            }
            _ => String::new(),
        };

        let files = self
            .ctx
            .repo
            .list_files(&self.ctx.base_ref, &prefix)
            .await
            .map_err(|e| e.to_string())?;
        let visible: Vec<String> = files
            .into_iter()
            .filter(|f| self.binding.can_read(f))
            .collect();

        if visible.is_empty() {
            return Ok(format!("No readable files under '{}'", prefix));
        }
        let mut out = visible
            .iter()
            .take(MAX_LISTED_FILES)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if visible.len() > MAX_LISTED_FILES {
            out.push_str(&format!("\n... and {} more", visible.len() - MAX_LISTED_FILES));
        }
        Ok(out)
    }

    fn write_file(&mut self, args: &Value) -> Result<String, String> {
        let path = normalize_path(required_str(args, "path")?)?;
        if !self.binding.can_write(&path) {
            return Err(format!("{} is outside the paths you may write", path));
        }

        let change = if args["delete"].as_bool().unwrap_or(false) {
            FileChange::delete()
        } else {
            FileChange::full(required_str(args, "content")?)
        };
        let verb = if change.is_delete() { "deletion" } else { "write" };
        self.staged.insert(path.clone(), change);
        Ok(format!("Staged {} of {}", verb, path))
    }
}

fn required_str<'v>(args: &'v Value, key: &str) -> Result<&'v str, String> {
    args[key]
        .as_str()
        .ok_or_else(|| format!("missing string argument '{}'", key))
}

/// Normalize a repository-relative path; rejects absolute paths and `..`.
pub(crate) fn normalize_path(path: &str) -> Result<String, String> {
    let trimmed = path.trim();
    if trimmed.starts_with('/') || trimmed.contains('\\') {
        return Err(format!("path '{}' must be repository-relative", trimmed));
    }

    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(format!("path '{}' may not contain '..'", trimmed)),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err("path is empty".to_string());
    }
    Ok(parts.join("/"))
}

fn truncate(content: &str) -> String {
    if content.len() <= MAX_READ_CHARS {
        return content.to_string();
    }
    let mut end = MAX_READ_CHARS;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [truncated, {} bytes total]", &content[..end], content.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Role, RoleRegistry};
    use crate::config::Config;
    use crate::llm::Completion;
    use crate::repo::InMemoryRepository;
    use crate::testing::ScriptedLlm;
    use serde_json::json;
    use std::sync::Arc;

    async fn setup(llm: ScriptedLlm) -> (RoleRegistry, AgentContext) {
        let config = Config::new("key".to_string(), "test/model".to_string());
        let repo = InMemoryRepository::new("acme/app", "main");
        repo.seed_file("main", "server/main.py", "app = FastAPI()\n").await;
        repo.seed_file("main", "src/App.tsx", "export default App;\n").await;
        let ctx = AgentContext::new(Arc::new(llm), Arc::new(repo), "main").with_max_tool_iterations(4);
        (RoleRegistry::from_config(&config), ctx)
    }

    #[tokio::test]
    async fn test_tool_loop_reads_and_stages() {
        let llm = ScriptedLlm::new(vec![
            Completion::tool_calls(vec![
                ToolCall::new("c1", "read_file", json!({"path": "server/main.py"})),
                ToolCall::new(
                    "c2",
                    "write_file",
                    json!({"path": "./server/routers/upload.py", "content": "router = APIRouter()\n"}),
                ),
            ]),
            Completion::text("done"),
        ]);
        let (registry, ctx) = setup(llm.clone()).await;
        let binding = registry.get(Role::Backend);
        let mut session = AgentSession::new(binding, &ctx);

        assert_eq!(session.send("build it").await.unwrap(), "done");
        assert!(session.staged().contains("server/routers/upload.py"));

        let results: Vec<&str> = session
            .messages()
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .filter_map(|m| m.text_content())
            .collect();
        assert_eq!(results[0], "app = FastAPI()\n");
        assert!(results[1].starts_with("Staged write"));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unbound_and_unknown_tools_are_rejected() {
        let llm = ScriptedLlm::new(vec![
            Completion::tool_calls(vec![
                ToolCall::new("c1", "write_file", json!({"path": "src/x.ts", "content": "x"})),
                ToolCall::new("c2", "open_pull_request", json!({})),
            ]),
            Completion::text("{}"),
        ]);
        let (registry, ctx) = setup(llm).await;
        let binding = registry.get(Role::Reviewer);
        let mut session = AgentSession::new(binding, &ctx);
        session.send("review").await.unwrap();

        assert!(session.staged().is_empty());
        let errors = session
            .messages()
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .filter(|m| m.text_content().unwrap_or("").starts_with("Error:"))
            .count();
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn test_scope_is_enforced() {
        let llm = ScriptedLlm::new(vec![
            Completion::tool_calls(vec![
                ToolCall::new("c1", "read_file", json!({"path": "server/main.py"})),
                ToolCall::new("c2", "write_file", json!({"path": "server/main.py", "content": "x"})),
                ToolCall::new("c3", "write_file", json!({"path": "src/../server/x.py", "content": "x"})),
            ]),
            Completion::text("ok"),
        ]);
        let (registry, ctx) = setup(llm).await;
        let mut session = AgentSession::new(registry.get(Role::Frontend), &ctx);
        session.send("ui").await.unwrap();
        assert!(session.staged().is_empty());
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let call = Completion::tool_calls(vec![ToolCall::new(
            "c",
            "list_files",
            json!({"prefix": "src/"}),
        )]);
        let llm = ScriptedLlm::new(vec![call.clone(), call.clone(), call.clone(), call]);
        let (registry, ctx) = setup(llm).await;
        let mut session = AgentSession::new(registry.get(Role::Frontend), &ctx);
        assert!(matches!(
            session.send("loop").await,
            Err(AgentError::MaxIterations(4))
        ));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src//a.ts").unwrap(), "src/a.ts");
        assert!(normalize_path("/etc/passwd").is_err());
        assert!(normalize_path("src/../../x").is_err());
        assert!(normalize_path("  ").is_err());
    }
}
