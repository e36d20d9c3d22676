//! In-memory repository (non-persistent).
//!
//! Used by the CLI dry-run mode and throughout the tests. Every call is
//! recorded so callers can assert which operations happened.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    PullRequestDraft, PullRequestRef, RepoError, RepositoryClient, RepositoryConnector,
};
use crate::task::ChangeSet;

/// A pull request opened against the in-memory repository.
#[derive(Debug, Clone)]
pub struct PullRequestRecord {
    pub reference: PullRequestRef,
    pub base: String,
    pub title: String,
    pub body: String,
}

#[derive(Default)]
struct State {
    /// branch -> path -> content
    branches: HashMap<String, BTreeMap<String, String>>,
    pulls: Vec<PullRequestRecord>,
    commits: u64,
    calls: Vec<String>,
    /// Errors returned by the next publish operations (branch, commit, PR)
    publish_failures: VecDeque<RepoError>,
}

#[derive(Clone)]
pub struct InMemoryRepository {
    name: String,
    state: Arc<Mutex<State>>,
}

impl InMemoryRepository {
    /// A repository with an empty `base` branch.
    pub fn new(name: impl Into<String>, base: &str) -> Self {
        let mut state = State::default();
        state.branches.insert(base.to_string(), BTreeMap::new());
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Seed a file on a branch without recording a call.
    pub async fn seed_file(&self, branch: &str, path: &str, content: &str) {
        let mut state = self.state.lock().await;
        state
            .branches
            .entry(branch.to_string())
            .or_default()
            .insert(path.to_string(), content.to_string());
    }

    /// Make the next publish operations fail with `errors`, in order.
    pub async fn fail_publish_with(&self, errors: Vec<RepoError>) {
        self.state.lock().await.publish_failures.extend(errors);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn pull_requests(&self) -> Vec<PullRequestRecord> {
        self.state.lock().await.pulls.clone()
    }

    pub async fn files(&self, branch: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .await
            .branches
            .get(branch)
            .cloned()
            .unwrap_or_default()
    }
}

impl State {
    fn take_failure(&mut self) -> Result<(), RepoError> {
        match self.publish_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RepositoryClient for InMemoryRepository {
    fn repository(&self) -> &str {
        &self.name
    }

    async fn read_file(&self, git_ref: &str, path: &str) -> Result<Option<String>, RepoError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("read_file {} {}", git_ref, path));
        let branch = state
            .branches
            .get(git_ref)
            .ok_or_else(|| RepoError::NotFound(format!("ref {}", git_ref)))?;
        Ok(branch.get(path).cloned())
    }

    async fn list_files(&self, git_ref: &str, prefix: &str) -> Result<Vec<String>, RepoError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("list_files {} {}", git_ref, prefix));
        let branch = state
            .branches
            .get(git_ref)
            .ok_or_else(|| RepoError::NotFound(format!("ref {}", git_ref)))?;
        Ok(branch
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, RepoError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("branch_exists {}", name));
        Ok(state.branches.contains_key(name))
    }

    async fn create_branch(&self, base: &str, name: &str) -> Result<(), RepoError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("create_branch {} {}", base, name));
        state.take_failure()?;
        if state.branches.contains_key(name) {
            return Err(RepoError::Conflict(format!("branch {} already exists", name)));
        }
        let files = state
            .branches
            .get(base)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("base branch {}", base)))?;
        state.branches.insert(name.to_string(), files);
        Ok(())
    }

    async fn commit_changes(
        &self,
        branch: &str,
        changes: &ChangeSet,
        message: &str,
    ) -> Result<String, RepoError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("commit_changes {} {}", branch, message));
        state.take_failure()?;
        state.commits += 1;
        let sha = format!("{:040x}", state.commits);

        let files = state
            .branches
            .get_mut(branch)
            .ok_or_else(|| RepoError::NotFound(format!("branch {}", branch)))?;
        for (path, change) in changes.iter() {
            if change.is_delete() {
                files.remove(path);
            } else {
                files.insert(path.to_string(), change.content.clone());
            }
        }
        Ok(sha)
    }

    async fn find_pull_request(&self, branch: &str) -> Result<Option<PullRequestRef>, RepoError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("find_pull_request {}", branch));
        Ok(state
            .pulls
            .iter()
            .find(|p| p.reference.branch == branch)
            .map(|p| p.reference.clone()))
    }

    async fn open_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequestRef, RepoError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("open_pull_request {}", draft.branch));
        state.take_failure()?;
        if state.pulls.iter().any(|p| p.reference.branch == draft.branch) {
            return Err(RepoError::Conflict(format!(
                "a pull request for {} already exists",
                draft.branch
            )));
        }
        if !state.branches.contains_key(&draft.branch) {
            return Err(RepoError::NotFound(format!("branch {}", draft.branch)));
        }

        let number = state.pulls.len() as u64 + 1;
        let reference = PullRequestRef {
            number,
            url: format!("memory://{}/pull/{}", self.name, number),
            branch: draft.branch.clone(),
        };
        state.pulls.push(PullRequestRecord {
            reference: reference.clone(),
            base: draft.base.clone(),
            title: draft.title.clone(),
            body: draft.body.clone(),
        });
        Ok(reference)
    }
}

impl RepositoryConnector for InMemoryRepository {
    fn connect(&self, repository: Option<&str>) -> Result<Arc<dyn RepositoryClient>, RepoError> {
        match repository {
            Some(name) if name != self.name => Err(RepoError::NotFound(format!(
                "repository {} (only {} is available)",
                name, self.name
            ))),
            _ => Ok(Arc::new(self.clone())),
        }
    }
}
