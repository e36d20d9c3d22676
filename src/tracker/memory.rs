//! Trackers that stay in-process.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{TrackerClient, TrackerError, TrackerStatus};

/// Used when no tracker is configured. Issue creation reports `NotConfigured`.
pub struct NoopTracker;

#[async_trait]
impl TrackerClient for NoopTracker {
    async fn create_issue(&self, _: Option<&str>, _: &str, _: &str) -> Result<String, TrackerError> {
        Err(TrackerError::NotConfigured)
    }

    async fn update_issue_status(&self, issue_id: &str, status: TrackerStatus) -> Result<(), TrackerError> {
        tracing::debug!("No tracker configured; dropping status {} for {}", status, issue_id);
        Ok(())
    }

    async fn add_comment(&self, _: &str, _: &str) -> Result<(), TrackerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCall {
    CreateIssue { id: String, title: String },
    UpdateStatus { issue_id: String, status: TrackerStatus },
    Comment { issue_id: String, body: String },
}

#[derive(Default)]
struct State {
    calls: Vec<TrackerCall>,
    next_id: u32,
    /// While set, every call fails with this error
    outage: Option<TrackerError>,
}

/// Records every call; optionally simulates an outage.
#[derive(Clone, Default)]
pub struct InMemoryTracker {
    state: Arc<Mutex<State>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_outage(&self, error: Option<TrackerError>) {
        self.state.lock().await.outage = error;
    }

    pub async fn calls(&self) -> Vec<TrackerCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn status_updates(&self) -> Vec<(String, TrackerStatus)> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                TrackerCall::UpdateStatus { issue_id, status } => Some((issue_id, status)),
                _ => None,
            })
            .collect()
    }
}

impl State {
    fn check(&self) -> Result<(), TrackerError> {
        match &self.outage {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TrackerClient for InMemoryTracker {
    async fn create_issue(
        &self,
        _project: Option<&str>,
        title: &str,
        _body: &str,
    ) -> Result<String, TrackerError> {
        let mut state = self.state.lock().await;
        state.check()?;
        state.next_id += 1;
        let id = format!("MEM-{}", state.next_id);
        state.calls.push(TrackerCall::CreateIssue {
            id: id.clone(),
            title: title.to_string(),
        });
        Ok(id)
    }

    async fn update_issue_status(&self, issue_id: &str, status: TrackerStatus) -> Result<(), TrackerError> {
        let mut state = self.state.lock().await;
        // attempts are recorded even during an outage
        state.calls.push(TrackerCall::UpdateStatus {
            issue_id: issue_id.to_string(),
            status,
        });
        state.check()
    }

    async fn add_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError> {
        let mut state = self.state.lock().await;
        state.check()?;
        state.calls.push(TrackerCall::Comment {
            issue_id: issue_id.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
