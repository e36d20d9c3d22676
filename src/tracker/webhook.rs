//! Inbound webhook payloads.
//!
//! Linear issue events either start a run or correlate an external status
//! onto an existing run. Issues labelled `ai-task` / `ai-plan`, or titled
//! `[AI] ...`, are planned by the product manager. Issues addressed to one
//! worker role (`[backend] ...`, a `frontend` label, or anything labelled
//! `ai-generated` with such a tag) go straight to that role. GitHub comments
//! that mention `@ai-dev` or `/ai` start a run from the comment text.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use super::TrackerEvent;
use crate::agents::Role;
use crate::run::{Priority, RunRequest};

const TRIGGER_LABELS: &[&str] = &["ai-task", "ai-plan", "ai-planning"];
/// Marks an issue as ready to execute; it is never planned again
const EXECUTE_LABEL: &str = "ai-generated";
const PLAN_TAG: &str = "ai";
const SETTLED_STATES: &[&str] = &["done", "planned", "canceled", "cancelled", "规划完成"];
const COMMENT_TRIGGERS: &[&str] = &["@ai-dev", "/ai"];

/// Title tags (`[backend]`) and labels that address an issue to one worker role.
const ROLE_TAGS: &[(Role, &[&str])] = &[
    (Role::Frontend, &["frontend", "前端"]),
    (Role::Backend, &["backend", "后端"]),
    (Role::Database, &["database", "数据库", "db"]),
];

fn role_for_tag(tag: &str) -> Option<Role> {
    ROLE_TAGS
        .iter()
        .find(|(_, tags)| tags.contains(&tag))
        .map(|(role, _)| *role)
}

/// `[AI] add dark mode` -> `add dark mode`; other titles are only trimmed.
fn strip_tag(title: &str) -> &str {
    let trimmed = title.trim();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let tag = rest[..end].trim().to_lowercase();
            if tag == PLAN_TAG || role_for_tag(&tag).is_some() {
                return rest[end + 1..].trim();
            }
        }
    }
    trimmed
}

/// How an issue event should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueRoute {
    /// Decompose with the product manager
    Plan,
    /// One task for this worker role, no decomposition
    Direct(Role),
}

/// Check an HMAC-SHA256 signature header (`<hex>` or `sha256=<hex>`).
///
/// Without a configured secret every request is accepted.
pub fn verify_signature(secret: Option<&str>, body: &[u8], header: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    let Some(header) = header else {
        return false;
    };
    let hex_sig = header.trim();
    let hex_sig = hex_sig.strip_prefix("sha256=").unwrap_or(hex_sig);
    let Ok(signature) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// A Linear `Issue` create/update event.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearIssueEvent {
    pub action: String,
    pub issue_id: String,
    pub identifier: Option<String>,
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub state: Option<String>,
    pub priority: Option<Priority>,
}

impl LinearIssueEvent {
    /// How this issue should run, `None` when it asks for nothing.
    pub fn route(&self) -> Option<IssueRoute> {
        if let Some(state) = &self.state {
            if SETTLED_STATES.contains(&state.to_lowercase().as_str()) {
                return None;
            }
        }
        let labels: Vec<String> = self.labels.iter().map(|l| l.to_lowercase()).collect();
        let has_label = |wanted: &str| labels.iter().any(|l| l == wanted);

        if has_label(EXECUTE_LABEL) {
            return self.addressed_role(&labels).map(IssueRoute::Direct);
        }
        let tagged = self
            .title
            .trim()
            .to_lowercase()
            .starts_with(&format!("[{}]", PLAN_TAG));
        if tagged || TRIGGER_LABELS.iter().any(|t| has_label(*t)) {
            return Some(IssueRoute::Plan);
        }
        self.addressed_role(&labels).map(IssueRoute::Direct)
    }

    /// Whether this issue asks for a new run.
    pub fn wants_run(&self) -> bool {
        self.route().is_some()
    }

    fn addressed_role(&self, labels: &[String]) -> Option<Role> {
        let title = self.title.to_lowercase();
        ROLE_TAGS
            .iter()
            .find(|(_, tags)| {
                tags.iter()
                    .any(|t| title.contains(&format!("[{}]", t)) || labels.iter().any(|l| l == t))
            })
            .map(|(role, _)| *role)
    }

    pub fn to_request(&self) -> RunRequest {
        let mut requirement = strip_tag(&self.title).to_string();
        if !self.description.trim().is_empty() {
            requirement.push_str("\n\n");
            requirement.push_str(self.description.trim());
        }

        let mut request = RunRequest::new(requirement).with_tracker_issue(self.issue_id.clone());
        request.priority = self.priority;
        if let Some(IssueRoute::Direct(role)) = self.route() {
            request.role = Some(role);
        }
        request
    }

    pub fn to_tracker_event(&self) -> TrackerEvent {
        TrackerEvent {
            event: format!("issue.{}", self.action),
            issue_id: self.issue_id.clone(),
            status: self.state.clone(),
        }
    }
}

/// Normalize a Linear webhook body; `None` for events other than issue create/update.
pub fn parse_linear(payload: &Value) -> Option<LinearIssueEvent> {
    let action = payload["action"].as_str()?;
    if payload["type"].as_str() != Some("Issue") || !matches!(action, "create" | "update") {
        return None;
    }
    let data = &payload["data"];
    let issue_id = data["id"].as_str()?.to_string();

    // labels arrive either as an array or as a GraphQL connection
    let label_values = data["labels"]
        .as_array()
        .or_else(|| data["labels"]["nodes"].as_array());
    let labels = label_values
        .map(|values| {
            values
                .iter()
                .filter_map(|l| l["name"].as_str().or_else(|| l.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let priority = match &data["priority"] {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };

    Some(LinearIssueEvent {
        action: action.to_string(),
        issue_id,
        identifier: data["identifier"].as_str().map(str::to_string),
        title: data["title"].as_str().unwrap_or_default().to_string(),
        description: data["description"].as_str().unwrap_or_default().to_string(),
        labels,
        state: data["state"]["name"].as_str().map(str::to_string),
        priority,
    })
}

/// A run request from a GitHub comment, if the comment asks for one.
pub fn parse_github(event: &str, payload: &Value) -> Option<RunRequest> {
    if !matches!(event, "issue_comment" | "pull_request_review_comment") {
        return None;
    }
    if payload["action"].as_str() != Some("created") {
        return None;
    }
    let comment = &payload["comment"];
    if comment["user"]["type"].as_str() == Some("Bot") {
        return None;
    }
    let body = comment["body"].as_str()?;
    let lowered = body.to_lowercase();
    if !COMMENT_TRIGGERS.iter().any(|t| lowered.contains(t)) {
        return None;
    }

    let subject = payload["issue"]["title"]
        .as_str()
        .or_else(|| payload["pull_request"]["title"].as_str())
        .unwrap_or("");
    let requirement = if subject.is_empty() {
        body.trim().to_string()
    } else {
        format!("Feedback on \"{}\":\n\n{}", subject, body.trim())
    };

    let mut request = RunRequest::new(requirement);
    request.repository = payload["repository"]["full_name"].as_str().map(str::to_string);
    Some(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_signature_verification() {
        let body = br#"{"type":"Issue"}"#;
        let sig = sign("s3cret", body);

        assert!(verify_signature(Some("s3cret"), body, Some(&sig)));
        assert!(verify_signature(Some("s3cret"), body, Some(&format!("sha256={}", sig))));
        assert!(!verify_signature(Some("other"), body, Some(&sig)));
        assert!(!verify_signature(Some("s3cret"), body, None));
        assert!(!verify_signature(Some("s3cret"), body, Some("not-hex")));
        assert!(verify_signature(None, body, None));
    }

    #[test]
    fn test_labelled_issue_starts_a_run() {
        let payload = json!({
            "type": "Issue",
            "action": "create",
            "data": {
                "id": "9f1c",
                "identifier": "Y-12",
                "title": "Image upload",
                "description": "Let authors attach images in the post editor",
                "labels": [{"name": "AI-Task"}],
                "state": {"name": "Todo"},
                "priority": 2
            }
        });
        let event = parse_linear(&payload).unwrap();
        assert!(event.wants_run());

        let request = event.to_request();
        assert_eq!(request.tracker_issue.as_deref(), Some("9f1c"));
        assert_eq!(request.priority, Some(Priority::High));
        assert!(request.requirement.starts_with("Image upload\n\nLet authors"));
    }

    #[test]
    fn test_ai_prefix_is_stripped() {
        let payload = json!({
            "type": "Issue",
            "action": "update",
            "data": {"id": "1", "title": "[AI] add dark mode", "labels": {"nodes": []}}
        });
        let event = parse_linear(&payload).unwrap();
        assert!(event.wants_run());
        assert_eq!(event.to_request().requirement, "add dark mode");
        assert_eq!(event.to_tracker_event().event, "issue.update");
    }

    #[test]
    fn test_settled_or_unlabelled_issues_are_skipped() {
        let done = json!({
            "type": "Issue",
            "action": "update",
            "data": {"id": "1", "title": "[AI] x", "state": {"name": "Done"}}
        });
        assert!(!parse_linear(&done).unwrap().wants_run());

        let plain = json!({"type": "Issue", "action": "create", "data": {"id": "2", "title": "x"}});
        assert!(!parse_linear(&plain).unwrap().wants_run());

        let comment = json!({"type": "Comment", "action": "create", "data": {"id": "3"}});
        assert!(parse_linear(&comment).is_none());
    }

    fn issue(title: &str, labels: &[&str]) -> LinearIssueEvent {
        let payload = json!({
            "type": "Issue",
            "action": "create",
            "data": {
                "id": "iss-7",
                "title": title,
                "labels": labels.iter().map(|l| json!({"name": l})).collect::<Vec<_>>(),
                "state": {"name": "Todo"}
            }
        });
        parse_linear(&payload).unwrap()
    }

    #[test]
    fn test_role_tagged_issues_skip_planning() {
        let tagged = issue("[Backend] add a file size limit to uploads", &[]);
        assert_eq!(tagged.route(), Some(IssueRoute::Direct(Role::Backend)));
        let request = tagged.to_request();
        assert_eq!(request.role, Some(Role::Backend));
        assert_eq!(request.requirement, "add a file size limit to uploads");

        let labelled = issue("Profile picture column", &["db"]);
        assert_eq!(labelled.route(), Some(IssueRoute::Direct(Role::Database)));

        let localized = issue("[前端] 上传按钮", &[]);
        assert_eq!(localized.route(), Some(IssueRoute::Direct(Role::Frontend)));
        assert_eq!(localized.to_request().requirement, "上传按钮");
    }

    #[test]
    fn test_execute_label_wins_over_planning_triggers() {
        let generated = issue("[AI] [frontend] upload button", &["ai-generated", "ai-task"]);
        assert_eq!(generated.route(), Some(IssueRoute::Direct(Role::Frontend)));

        // an executable issue without a role tag is left alone
        let untagged = issue("[AI] upload button", &["ai-generated"]);
        assert_eq!(untagged.route(), None);

        let planned = issue("[AI] image upload", &["backend"]);
        assert_eq!(planned.route(), Some(IssueRoute::Plan));
        assert_eq!(planned.to_request().role, None);
    }

    #[test]
    fn test_github_comment_trigger() {
        let payload = json!({
            "action": "created",
            "comment": {"body": "@AI-dev please validate the file size", "user": {"type": "User"}},
            "issue": {"title": "Image upload"},
            "repository": {"full_name": "acme/app"}
        });
        let request = parse_github("issue_comment", &payload).unwrap();
        assert_eq!(request.repository.as_deref(), Some("acme/app"));
        assert!(request.requirement.contains("validate the file size"));

        assert!(parse_github("push", &payload).is_none());

        let bot = json!({
            "action": "created",
            "comment": {"body": "/ai", "user": {"type": "Bot"}}
        });
        assert!(parse_github("issue_comment", &bot).is_none());

        let quiet = json!({"action": "created", "comment": {"body": "lgtm"}});
        assert!(parse_github("issue_comment", &quiet).is_none());
    }
}
