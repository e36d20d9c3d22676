//! GitHub REST repository client.
//!
//! Commits go through the git data API (blobs, tree, commit, ref update) so
//! the branch only moves once the whole ChangeSet is in place.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::{
    parse_repository, PullRequestDraft, PullRequestRef, RepoError, RepositoryClient,
    RepositoryConnector,
};
use crate::task::ChangeSet;

const GITHUB_API_URL: &str = "https://api.github.com";

/// Builds [`GitHubRepository`] clients sharing one HTTP connection pool.
pub struct GitHubConnector {
    client: Client,
    token: String,
    default_repository: Option<String>,
    api_url: String,
}

impl GitHubConnector {
    pub fn new(token: String, default_repository: Option<String>) -> Self {
        Self {
            client: Client::new(),
            token,
            default_repository,
            api_url: GITHUB_API_URL.to_string(),
        }
    }
}

impl RepositoryConnector for GitHubConnector {
    fn connect(&self, repository: Option<&str>) -> Result<Arc<dyn RepositoryClient>, RepoError> {
        let repository = repository
            .or(self.default_repository.as_deref())
            .ok_or(RepoError::NotConfigured)?;
        let (owner, name) = parse_repository(repository)?;
        Ok(Arc::new(GitHubRepository {
            client: self.client.clone(),
            token: self.token.clone(),
            api_url: self.api_url.clone(),
            full_name: format!("{}/{}", owner, name),
        }))
    }
}

pub struct GitHubRepository {
    client: Client,
    token: String,
    api_url: String,
    /// `owner/name`
    full_name: String,
}

impl GitHubRepository {
    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}", self.api_url, self.full_name, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "devcrew")
    }

    /// Send a request and map non-success statuses to [`RepoError`].
    async fn send(&self, builder: RequestBuilder) -> Result<Value, RepoError> {
        let response = self
            .authed(builder)
            .send()
            .await
            .map_err(|e| RepoError::Network(e.to_string()))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let rate_exhausted = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            == Some("0");
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body).map_err(|e| RepoError::Api {
                status: status.as_u16(),
                message: format!("invalid JSON from GitHub: {}", e),
            });
        }

        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(body);

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => RepoError::RateLimited {
                message,
                retry_after,
            },
            StatusCode::FORBIDDEN if rate_exhausted => RepoError::RateLimited {
                message,
                retry_after,
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RepoError::PermissionDenied(message),
            StatusCode::NOT_FOUND => RepoError::NotFound(message),
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => RepoError::Conflict(message),
            other => RepoError::Api {
                status: other.as_u16(),
                message,
            },
        })
    }

    async fn head_sha(&self, branch: &str) -> Result<String, RepoError> {
        let value = self
            .send(self.client.get(self.url(&format!("git/ref/heads/{}", branch))))
            .await?;
        value["object"]["sha"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RepoError::Api {
                status: 200,
                message: format!("ref heads/{} has no sha", branch),
            })
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn str_field(value: &Value, field: &str) -> Result<String, RepoError> {
    value[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RepoError::Api {
            status: 200,
            message: format!("missing '{}' in GitHub response", field),
        })
}

#[derive(Debug, Deserialize)]
struct PullSummary {
    number: u64,
    html_url: String,
}

#[async_trait]
impl RepositoryClient for GitHubRepository {
    fn repository(&self) -> &str {
        &self.full_name
    }

    async fn read_file(&self, git_ref: &str, path: &str) -> Result<Option<String>, RepoError> {
        let request = self
            .client
            .get(self.url(&format!("contents/{}", encode_path(path))))
            .query(&[("ref", git_ref)]);

        let value = match self.send(request).await {
            Ok(v) => v,
            Err(RepoError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        // directories come back as arrays
        let Some(encoded) = value["content"].as_str() else {
            return Ok(None);
        };
        let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| RepoError::Api {
                status: 200,
                message: format!("invalid base64 content for {}: {}", path, e),
            })?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn list_files(&self, git_ref: &str, prefix: &str) -> Result<Vec<String>, RepoError> {
        let value = self
            .send(
                self.client
                    .get(self.url(&format!("git/trees/{}", encode_path(git_ref))))
                    .query(&[("recursive", "1")]),
            )
            .await?;

        if value["truncated"].as_bool() == Some(true) {
            tracing::warn!("Tree listing for {} was truncated by GitHub", self.full_name);
        }

        let files = value["tree"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e["type"].as_str() == Some("blob"))
                    .filter_map(|e| e["path"].as_str())
                    .filter(|p| p.starts_with(prefix))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(files)
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, RepoError> {
        match self
            .send(self.client.get(self.url(&format!("git/ref/heads/{}", name))))
            .await
        {
            Ok(_) => Ok(true),
            Err(RepoError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_branch(&self, base: &str, name: &str) -> Result<(), RepoError> {
        let sha = self.head_sha(base).await?;
        self.send(self.client.post(self.url("git/refs")).json(&json!({
            "ref": format!("refs/heads/{}", name),
            "sha": sha,
        })))
        .await?;
        tracing::info!("Created branch {} from {} in {}", name, base, self.full_name);
        Ok(())
    }

    async fn commit_changes(
        &self,
        branch: &str,
        changes: &ChangeSet,
        message: &str,
    ) -> Result<String, RepoError> {
        let parent = self.head_sha(branch).await?;
        let parent_commit = self
            .send(self.client.get(self.url(&format!("git/commits/{}", parent))))
            .await?;
        let base_tree = parent_commit["tree"]["sha"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RepoError::Api {
                status: 200,
                message: format!("commit {} has no tree", parent),
            })?;

        let mut entries = Vec::with_capacity(changes.len());
        for (path, change) in changes.iter() {
            if change.is_delete() {
                entries.push(json!({"path": path, "mode": "100644", "type": "blob", "sha": null}));
                continue;
            }
            let blob = self
                .send(self.client.post(self.url("git/blobs")).json(&json!({
                    "content": base64::engine::general_purpose::STANDARD.encode(&change.content),
                    "encoding": "base64",
                })))
                .await?;
            entries.push(json!({
                "path": path,
                "mode": "100644",
                "type": "blob",
                "sha": str_field(&blob, "sha")?,
            }));
        }

        let tree = self
            .send(self.client.post(self.url("git/trees")).json(&json!({
                "base_tree": base_tree,
                "tree": entries,
            })))
            .await?;
        let commit = self
            .send(self.client.post(self.url("git/commits")).json(&json!({
                "message": message,
                "tree": str_field(&tree, "sha")?,
                "parents": [parent],
            })))
            .await?;
        let commit_sha = str_field(&commit, "sha")?;

        self.send(
            self.client
                .patch(self.url(&format!("git/refs/heads/{}", branch)))
                .json(&json!({"sha": commit_sha, "force": false})),
        )
        .await?;

        tracing::info!(
            "Committed {} file(s) to {}:{} ({})",
            changes.len(),
            self.full_name,
            branch,
            commit_sha
        );
        Ok(commit_sha)
    }

    async fn find_pull_request(&self, branch: &str) -> Result<Option<PullRequestRef>, RepoError> {
        let owner = self.full_name.split('/').next().unwrap_or_default();
        let value = self
            .send(self.client.get(self.url("pulls")).query(&[
                ("head", format!("{}:{}", owner, branch)),
                ("state", "open".to_string()),
            ]))
            .await?;

        let pulls: Vec<PullSummary> = serde_json::from_value(value).unwrap_or_default();
        Ok(pulls.into_iter().next().map(|p| PullRequestRef {
            number: p.number,
            url: p.html_url,
            branch: branch.to_string(),
        }))
    }

    async fn open_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequestRef, RepoError> {
        let value = self
            .send(self.client.post(self.url("pulls")).json(&json!({
                "title": draft.title,
                "head": draft.branch,
                "base": draft.base,
                "body": draft.body,
            })))
            .await?;
        let pull: PullSummary = serde_json::from_value(value).map_err(|e| RepoError::Api {
            status: 201,
            message: format!("unexpected pull request payload: {}", e),
        })?;

        tracing::info!("Opened pull request #{} on {}", pull.number, self.full_name);
        Ok(PullRequestRef {
            number: pull.number,
            url: pull.html_url,
            branch: draft.branch.clone(),
        })
    }
}
