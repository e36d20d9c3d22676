//! Run storage shared by the orchestrator and the HTTP surface.
//!
//! Writers hand over owned snapshots; the lock is never held across an
//! external call.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{now_string, Run, RunId};
use crate::task::TaskId;

/// Runs kept by default before finished runs are evicted.
pub const DEFAULT_RETAINED_RUNS: usize = 1000;

/// Where a tracker issue is linked: the run itself, or one of its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueLink {
    pub run_id: RunId,
    pub task_id: Option<TaskId>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace a run snapshot.
    async fn save(&self, run: Run) -> Result<(), String>;

    async fn get(&self, id: RunId) -> Result<Option<Run>, String>;

    /// Most recently updated first.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Run>, String>;

    /// The newest run linked to a tracker issue, directly or through a task.
    async fn find_by_tracker_issue(&self, issue_id: &str) -> Result<Option<IssueLink>, String>;

    /// Record a status reported by the tracker; observability only.
    async fn set_external_status(&self, id: RunId, status: &str) -> Result<(), String>;
}

/// Keeps at most `limit` runs; the least recently updated finished runs go first.
/// Runs still in flight are never evicted.
#[derive(Clone)]
pub struct InMemoryRunStore {
    runs: Arc<RwLock<HashMap<RunId, Run>>>,
    limit: usize,
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::with_limit(DEFAULT_RETAINED_RUNS)
    }
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            runs: Arc::default(),
            limit: limit.max(1),
        }
    }
}

fn evict_finished(runs: &mut HashMap<RunId, Run>, limit: usize) {
    let excess = runs.len().saturating_sub(limit);
    if excess == 0 {
        return;
    }
    let mut finished: Vec<(String, RunId)> = runs
        .values()
        .filter(|r| r.state.is_terminal())
        .map(|r| (r.updated_at.clone(), r.id))
        .collect();
    finished.sort();
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
        tracing::debug!("Evicted finished run {} from the run store", id);
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, run: Run) -> Result<(), String> {
        let mut runs = self.runs.write().await;
        // external status arrives out of band; keep it across snapshots
        let external = runs.get(&run.id).and_then(|r| r.external_status.clone());
        let mut run = run;
        if run.external_status.is_none() {
            run.external_status = external;
        }
        runs.insert(run.id, run);
        evict_finished(&mut runs, self.limit);
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<Run>, String> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Run>, String> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(runs.into_iter().skip(offset).take(limit).collect())
    }

    async fn find_by_tracker_issue(&self, issue_id: &str) -> Result<Option<IssueLink>, String> {
        let runs = self.runs.read().await;
        let link = |run: &Run| {
            if run.tracker_issue.as_deref() == Some(issue_id) {
                return Some(IssueLink {
                    run_id: run.id,
                    task_id: None,
                });
            }
            run.tasks
                .iter()
                .find(|t| t.tracker_issue() == Some(issue_id))
                .map(|t| IssueLink {
                    run_id: run.id,
                    task_id: Some(t.id()),
                })
        };
        Ok(runs
            .values()
            .filter_map(|r| link(r).map(|l| (r.created_at.as_str(), l)))
            .max_by(|a, b| a.0.cmp(b.0))
            .map(|(_, l)| l))
    }

    async fn set_external_status(&self, id: RunId, status: &str) -> Result<(), String> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| format!("Run {} not found", id))?;
        run.external_status = Some(status.to_string());
        run.updated_at = now_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Role;
    use crate::run::{RunFailureCode, RunRequest, RunState};
    use crate::task::Task;

    #[tokio::test]
    async fn test_save_get_and_list() {
        let store = InMemoryRunStore::new();
        let a = Run::new(RunRequest::new("first"));
        let b = Run::new(RunRequest::new("second"));
        store.save(a.clone()).await.unwrap();
        store.save(b.clone()).await.unwrap();

        assert_eq!(
            store.get(a.id).await.unwrap().map(|r| r.request.requirement),
            Some("first".to_string())
        );
        assert_eq!(store.list(10, 0).await.unwrap().len(), 2);
        assert_eq!(store.list(1, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_external_status_survives_snapshots() {
        let store = InMemoryRunStore::new();
        let run = Run::new(RunRequest::new("x").with_tracker_issue("LIN-42"));
        store.save(run.clone()).await.unwrap();

        let found = store.find_by_tracker_issue("LIN-42").await.unwrap();
        assert_eq!(
            found,
            Some(IssueLink {
                run_id: run.id,
                task_id: None
            })
        );
        store.set_external_status(run.id, "In Progress").await.unwrap();

        // orchestrator saves a newer snapshot that never saw the webhook
        store.save(run.clone()).await.unwrap();
        let stored = store.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.external_status.as_deref(), Some("In Progress"));

        assert!(store.set_external_status(RunId::new(), "Done").await.is_err());
    }

    #[tokio::test]
    async fn test_task_issues_link_back_to_their_run() {
        let store = InMemoryRunStore::new();
        let mut run = Run::new(RunRequest::new("x").with_tracker_issue("LIN-1"));
        let mut task = Task::new(run.id, 0, Role::Backend, "endpoint").unwrap();
        task.set_tracker_issue("LIN-2");
        let task_id = task.id();
        run.tasks.push(task);
        store.save(run.clone()).await.unwrap();

        assert_eq!(
            store.find_by_tracker_issue("LIN-2").await.unwrap(),
            Some(IssueLink {
                run_id: run.id,
                task_id: Some(task_id)
            })
        );
        assert_eq!(store.find_by_tracker_issue("LIN-3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_only_finished_runs_are_evicted() {
        let store = InMemoryRunStore::with_limit(2);
        let running = Run::new(RunRequest::new("still going"));
        store.save(running.clone()).await.unwrap();

        let mut finished = Vec::new();
        for i in 0..3 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            let mut run = Run::new(RunRequest::new(format!("done {}", i)));
            run.fail(RunFailureCode::InvalidInput, "empty").unwrap();
            store.save(run.clone()).await.unwrap();
            finished.push(run.id);
            assert!(store.list(10, 0).await.unwrap().len() <= 2);
        }

        assert!(store.get(running.id).await.unwrap().is_some());
        let last = finished[2];
        assert_eq!(
            store.get(last).await.unwrap().map(|r| r.state),
            Some(RunState::Failed)
        );
        assert!(store.get(finished[0]).await.unwrap().is_none());
    }
}
