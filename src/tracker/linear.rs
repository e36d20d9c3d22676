//! Linear GraphQL tracker client.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{TrackerClient, TrackerError, TrackerStatus};
use crate::config::LinearConfig;

const LINEAR_API_URL: &str = "https://api.linear.app/graphql";

const CREATE_ISSUE: &str = r#"
mutation CreateIssue($input: IssueCreateInput!) {
    issueCreate(input: $input) {
        success
        issue { id identifier url }
    }
}"#;

const TEAM_STATES: &str = r#"
query TeamStates($teamId: String!) {
    team(id: $teamId) {
        states { nodes { id name } }
    }
}"#;

const UPDATE_ISSUE: &str = r#"
mutation UpdateIssue($id: String!, $stateId: String!) {
    issueUpdate(id: $id, input: { stateId: $stateId }) {
        success
    }
}"#;

const CREATE_COMMENT: &str = r#"
mutation CreateComment($issueId: String!, $body: String!) {
    commentCreate(input: { issueId: $issueId, body: $body }) {
        success
    }
}"#;

pub struct LinearTracker {
    client: Client,
    api_key: String,
    team_id: String,
    state_succeeded: String,
    state_partial: String,
    state_failed: String,
    state_in_progress: String,
}

impl LinearTracker {
    /// Build from config; `None` when the tracker is not configured.
    pub fn from_config(config: &LinearConfig) -> Option<Self> {
        let (api_key, team_id) = match (&config.api_key, &config.team_id) {
            (Some(key), Some(team)) => (key.clone(), team.clone()),
            _ => return None,
        };
        Some(Self {
            client: Client::new(),
            api_key,
            team_id,
            state_succeeded: config.state_succeeded.clone(),
            state_partial: config.state_partial.clone(),
            state_failed: config.state_failed.clone(),
            state_in_progress: "In Progress".to_string(),
        })
    }

    fn state_name(&self, status: TrackerStatus) -> &str {
        match status {
            TrackerStatus::InProgress => &self.state_in_progress,
            TrackerStatus::Succeeded => &self.state_succeeded,
            TrackerStatus::PartiallyFailed => &self.state_partial,
            TrackerStatus::Failed => &self.state_failed,
        }
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, TrackerError> {
        let response = self
            .client
            .post(LINEAR_API_URL)
            .header("Authorization", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&json!({"query": query, "variables": variables}))
            .send()
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            return Err(TrackerError::RateLimited(body));
        }
        if status.is_server_error() {
            return Err(TrackerError::Unavailable(format!("HTTP {}: {}", status, body)));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| TrackerError::Rejected(format!("HTTP {}: {} ({})", status, body, e)))?;
        if let Some(errors) = value.get("errors").filter(|e| !e.is_null()) {
            return Err(TrackerError::Rejected(errors.to_string()));
        }
        if !status.is_success() {
            return Err(TrackerError::Rejected(format!("HTTP {}: {}", status, body)));
        }
        Ok(value["data"].clone())
    }

    async fn resolve_state_id(&self, name: &str) -> Result<String, TrackerError> {
        let data = self
            .graphql(TEAM_STATES, json!({"teamId": self.team_id}))
            .await?;
        find_state_id(&data, name).ok_or_else(|| TrackerError::UnknownState(name.to_string()))
    }
}

/// Case-insensitive lookup in a `team.states.nodes` response.
fn find_state_id(data: &Value, name: &str) -> Option<String> {
    data["team"]["states"]["nodes"]
        .as_array()?
        .iter()
        .find(|s| {
            s["name"]
                .as_str()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|s| s["id"].as_str())
        .map(str::to_string)
}

#[async_trait]
impl TrackerClient for LinearTracker {
    async fn create_issue(
        &self,
        project: Option<&str>,
        title: &str,
        body: &str,
    ) -> Result<String, TrackerError> {
        let mut input = json!({
            "teamId": self.team_id,
            "title": title,
            "description": body,
        });
        if let Some(project) = project {
            input["projectId"] = json!(project);
        }

        let data = self.graphql(CREATE_ISSUE, json!({"input": input})).await?;
        let issue = &data["issueCreate"]["issue"];
        let id = issue["id"]
            .as_str()
            .ok_or_else(|| TrackerError::Rejected("issueCreate returned no issue".to_string()))?;
        tracing::info!(
            "Created Linear issue {} ({})",
            issue["identifier"].as_str().unwrap_or(id),
            issue["url"].as_str().unwrap_or("")
        );
        Ok(id.to_string())
    }

    async fn update_issue_status(&self, issue_id: &str, status: TrackerStatus) -> Result<(), TrackerError> {
        let state_id = self.resolve_state_id(self.state_name(status)).await?;
        let data = self
            .graphql(UPDATE_ISSUE, json!({"id": issue_id, "stateId": state_id}))
            .await?;
        if data["issueUpdate"]["success"].as_bool() != Some(true) {
            return Err(TrackerError::Rejected(format!("issueUpdate failed for {}", issue_id)));
        }
        Ok(())
    }

    async fn add_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError> {
        let data = self
            .graphql(CREATE_COMMENT, json!({"issueId": issue_id, "body": body}))
            .await?;
        if data["commentCreate"]["success"].as_bool() != Some(true) {
            return Err(TrackerError::Rejected(format!("commentCreate failed for {}", issue_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_credentials() {
        assert!(LinearTracker::from_config(&LinearConfig::default()).is_none());
    }

    #[test]
    fn test_state_lookup_ignores_case() {
        let data = json!({"team": {"states": {"nodes": [
            {"id": "s1", "name": "Todo"},
            {"id": "s2", "name": "In Review"},
        ]}}});
        assert_eq!(find_state_id(&data, "in review"), Some("s2".to_string()));
        assert_eq!(find_state_id(&data, "Done"), None);
    }

    #[test]
    fn test_status_maps_to_configured_state() {
        let config = LinearConfig {
            api_key: Some("k".to_string()),
            team_id: Some("t".to_string()),
            state_succeeded: "In Review".to_string(),
            state_partial: "Needs Attention".to_string(),
            state_failed: "Canceled".to_string(),
        };
        let tracker = LinearTracker::from_config(&config).unwrap();
        assert_eq!(tracker.state_name(TrackerStatus::PartiallyFailed), "Needs Attention");
        assert_eq!(tracker.state_name(TrackerStatus::Failed), "Canceled");
    }
}
