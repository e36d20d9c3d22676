//! Orchestrator: drives one Run from intake to a terminal state.
//!
//! # Flow
//! 1. **Intake**: validate the request, connect the repository, link a tracker issue
//! 2. **Decomposing**: PM role produces a validated task plan (or one task,
//!    when the request is addressed to a worker role)
//! 3. **Dispatching**: worker roles run in dependency order, bounded concurrency
//! 4. **Reviewing**: reviewer verdict, at most one fix cycle
//! 5. **Finalizing**: branch + commit + pull request, idempotently
//!
//! The orchestrator owns the `Run` while it executes and only hands owned
//! snapshots to the [`RunStore`]. Spawned agent invocations never see it.

mod dispatch;
mod publish;

pub use publish::pull_request_body;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::agents::{decompose, review, AgentContext, ReviewInput, ReviewVerdict, Role, RoleRegistry};
use crate::config::Config;
use crate::llm::{LlmClient, OpenRouterClient};
use crate::repo::{GitHubConnector, InMemoryRepository, RepositoryConnector};
use crate::run::{Run, RunError, RunFailureCode, RunRequest, RunState, RunStore};
use crate::task::{ChangeSet, TaskPlan};
use crate::tracker::{LinearTracker, NoopTracker, TrackerClient, TrackerStatus};

/// Time left before `deadline`, zero once it has passed.
fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Code used when a run has to be closed from an unexpected state.
fn fallback_code(state: RunState) -> RunFailureCode {
    match state {
        RunState::Intake => RunFailureCode::InvalidInput,
        RunState::Decomposing => RunFailureCode::DecompositionFailed,
        RunState::Finalizing => RunFailureCode::PublishFailed,
        _ => RunFailureCode::AllTasksFailed,
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    roles: Arc<RoleRegistry>,
    llm: Arc<dyn LlmClient>,
    repos: Arc<dyn RepositoryConnector>,
    tracker: Arc<dyn TrackerClient>,
    store: Arc<dyn RunStore>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        llm: Arc<dyn LlmClient>,
        repos: Arc<dyn RepositoryConnector>,
        tracker: Arc<dyn TrackerClient>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        let roles = Arc::new(RoleRegistry::from_config(&config));
        Self {
            config,
            roles,
            llm,
            repos,
            tracker,
            store,
        }
    }

    /// Wire the production collaborators selected by `config`.
    ///
    /// Without a GitHub token, runs publish into an in-memory repository
    /// (dry run). Without Linear credentials, tracker updates are dropped.
    pub fn from_config(config: Arc<Config>, store: Arc<dyn RunStore>) -> Self {
        let llm: Arc<dyn LlmClient> = Arc::new(OpenRouterClient::new(config.api_key.clone()));

        let repos: Arc<dyn RepositoryConnector> = match &config.github.token {
            Some(token) => Arc::new(GitHubConnector::new(
                token.clone(),
                config.github.repository.clone(),
            )),
            None => {
                let name = config
                    .github
                    .repository
                    .clone()
                    .unwrap_or_else(|| "local/dry-run".to_string());
                tracing::warn!(
                    "GITHUB_TOKEN not set; runs for {} publish to an in-memory repository",
                    name
                );
                Arc::new(InMemoryRepository::new(name, &config.github.base_branch))
            }
        };

        let tracker: Arc<dyn TrackerClient> = match LinearTracker::from_config(&config.linear) {
            Some(linear) => Arc::new(linear),
            None => {
                tracing::info!("Linear not configured; tracker updates are disabled");
                Arc::new(NoopTracker)
            }
        };

        Self::new(config, llm, repos, tracker, store)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Create a run for `request` and execute it to completion.
    pub async fn submit(&self, request: RunRequest) -> Run {
        self.execute(Run::new(request)).await
    }

    /// Execute `run` until it reaches a terminal state and report it.
    pub async fn execute(&self, mut run: Run) -> Run {
        let deadline = Instant::now() + self.config.orchestrator.run_timeout;
        tracing::info!("Run {} started: {}", run.id, run.request.title());

        self.save(&run).await;

        if let Err(e) = self.drive(&mut run, deadline).await {
            tracing::error!("Run {} hit an invalid transition: {}", run.id, e);
            if !run.state.is_terminal() {
                let code = fallback_code(run.state);
                if let Err(e) = run.fail(code, format!("internal error: {}", e)) {
                    tracing::error!("Run {} could not be closed: {}", run.id, e);
                }
            }
        }

        self.save(&run).await;
        self.report_to_tracker(&run).await;

        tracing::info!(
            "Run {} finished: {}{}",
            run.id,
            run.state,
            run.failure_code()
                .map(|c| format!(" ({})", c))
                .unwrap_or_default()
        );
        run
    }

    async fn drive(&self, run: &mut Run, deadline: Instant) -> Result<(), RunError> {
        if run.request.requirement.trim().is_empty() {
            return run.fail(RunFailureCode::InvalidInput, "requirement is empty");
        }

        if let Some(role) = run.request.role.filter(|r| !r.is_dispatchable()) {
            return run.fail(
                RunFailureCode::InvalidInput,
                format!("role '{}' cannot take tasks", role),
            );
        }
        let repo = match self.repos.connect(run.request.repository.as_deref()) {
            Ok(repo) => repo,
            Err(e) => return run.fail(RunFailureCode::InvalidInput, e.to_string()),
        };
        self.link_tracker_issue(run).await;
        self.save(run).await;

        let ctx = AgentContext::new(
            Arc::clone(&self.llm),
            Arc::clone(&repo),
            self.config.github.base_branch.clone(),
        )
        .with_model_retry(self.config.retry.model)
        .with_max_tool_iterations(self.config.orchestrator.max_tool_iterations);

        // Decomposing
        run.transition(RunState::Decomposing)?;
        self.save(run).await;

        let plan = match run.request.role {
            Some(role) => match TaskPlan::single(role, run.request.requirement.trim()) {
                Ok(plan) => {
                    tracing::info!("Run {} routed directly to the {} role", run.id, role);
                    plan
                }
                Err(e) => return run.fail(RunFailureCode::InvalidInput, e.to_string()),
            },
            None => {
                let planned = tokio::time::timeout(
                    remaining(deadline),
                    decompose(
                        self.roles.get(Role::ProductManager),
                        &ctx,
                        &run.request,
                        self.config.orchestrator.decomposition_retries,
                    ),
                )
                .await;
                match planned {
                    Ok(Ok(plan)) => plan,
                    Ok(Err(e)) => {
                        return run.fail(RunFailureCode::DecompositionFailed, e.to_string())
                    }
                    Err(_) => {
                        return run.fail(
                            RunFailureCode::Timeout,
                            "run deadline expired during decomposition",
                        )
                    }
                }
            }
        };
        if !plan.summary().trim().is_empty() {
            run.plan_summary = Some(plan.summary().to_string());
        }
        run.tasks = plan.into_tasks(run.id);
        if self.config.orchestrator.track_task_issues {
            self.file_task_issues(run).await;
        }

        // Dispatching
        run.transition(RunState::Dispatching)?;
        self.save(run).await;
        self.dispatch(run, &ctx, deadline).await;

        let failed = run.failed_tasks().count();
        if run.succeeded_tasks().next().is_none() {
            let code = if remaining(deadline).is_zero() {
                RunFailureCode::Timeout
            } else {
                RunFailureCode::AllTasksFailed
            };
            return run.fail(code, format!("all {} tasks failed", run.tasks.len()));
        }
        run.partial = failed > 0;
        aggregate(run);

        if remaining(deadline).is_zero() {
            run.warn("Run deadline reached; review skipped");
        } else {
            run.transition(RunState::Reviewing)?;
            self.save(run).await;
            self.review_cycle(run, &ctx, deadline).await?;
        }

        // the gate needs an approving verdict; a missing review does not pass
        if self.config.orchestrator.require_review_approval {
            match run.review.as_ref() {
                None => return run.fail(RunFailureCode::ReviewRejected, "no review verdict"),
                Some(verdict) if !verdict.approved => {
                    let message = format!("review not approved: {}", verdict.summary);
                    return run.fail(RunFailureCode::ReviewRejected, message);
                }
                Some(_) => {}
            }
        }

        // Finalizing
        run.transition(RunState::Finalizing)?;
        self.save(run).await;
        self.finalize(run, repo.as_ref()).await
    }

    /// First review, plus one fix cycle when the reviewer asks for it.
    async fn review_cycle(
        &self,
        run: &mut Run,
        ctx: &AgentContext,
        deadline: Instant,
    ) -> Result<(), RunError> {
        let verdict = match self.review_once(run, ctx, deadline).await {
            Ok(verdict) => verdict,
            Err(e) => {
                run.warn(format!("Review unavailable: {}", e));
                return Ok(());
            }
        };
        run.review = Some(verdict.clone());
        self.save(run).await;

        if verdict.approved || !verdict.auto_fix {
            return Ok(());
        }
        let fixable: Vec<_> = verdict
            .tasks_to_fix()
            .into_iter()
            .filter(|id| run.task(*id).is_some_and(|t| t.state().is_success()))
            .collect();
        if fixable.is_empty() {
            return Ok(());
        }
        if remaining(deadline).is_zero() {
            run.warn("Run deadline reached; fix cycle skipped");
            return Ok(());
        }

        run.transition(RunState::Dispatching)?;
        for id in &fixable {
            let note = verdict.notes_for(*id);
            if let Some(task) = run.tasks.iter_mut().find(|t| t.id() == *id) {
                if let Err(e) = task.reopen(note) {
                    tracing::error!("Task {} could not be reopened: {}", id, e);
                }
            }
        }
        self.save(run).await;
        self.dispatch(run, ctx, deadline).await;
        aggregate(run);

        run.transition(RunState::Reviewing)?;
        self.save(run).await;
        match self.review_once(run, ctx, deadline).await {
            Ok(second) => run.review = Some(second),
            Err(e) => run.warn(format!("Re-review unavailable, keeping the first verdict: {}", e)),
        }
        Ok(())
    }

    async fn review_once(
        &self,
        run: &Run,
        ctx: &AgentContext,
        deadline: Instant,
    ) -> Result<ReviewVerdict, String> {
        let input = ReviewInput {
            requirement: &run.request.requirement,
            tasks: &run.tasks,
            changes: &run.changes,
        };
        let reviewed = tokio::time::timeout(
            remaining(deadline),
            review(
                self.roles.get(Role::Reviewer),
                ctx,
                input,
                self.config.orchestrator.role_output_retries,
            ),
        )
        .await;
        match reviewed {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err("run deadline expired during review".to_string()),
        }
    }

    /// Attach the run to a tracker issue, creating one when only a project is given.
    async fn link_tracker_issue(&self, run: &mut Run) {
        if run.tracker_issue.is_some() {
            return;
        }
        let Some(project) = run.request.tracker_project.clone() else {
            return;
        };

        let title = run.request.title();
        let body = run.request.requirement.clone();
        let created = self
            .config
            .retry
            .tracker
            .run("tracker create issue", || {
                self.tracker.create_issue(Some(&project), &title, &body)
            })
            .await;
        match created {
            Ok(issue) => {
                tracing::info!("Run {} linked to new tracker issue {}", run.id, issue);
                run.tracker_issue = Some(issue);
            }
            Err(e) => run.warn(format!("Could not create tracker issue: {}", e)),
        }
    }

    /// One tracker issue per task, filed next to the run's issue.
    ///
    /// Only runs that already report to a tracker (an issue or a project)
    /// get task issues. A failed creation leaves that task untracked.
    async fn file_task_issues(&self, run: &mut Run) {
        if run.tracker_issue.is_none() && run.request.tracker_project.is_none() {
            return;
        }
        let project = run.request.tracker_project.clone();
        let parent = run.tracker_issue.clone();
        let policy = self.config.retry.tracker;

        let mut filed = Vec::new();
        for task in &run.tasks {
            let title = task.headline();
            let mut body = task.description().to_string();
            if !task.artifacts().is_empty() {
                body.push_str(&format!("\n\nArtifacts: {}", task.artifacts().join(", ")));
            }
            body.push_str(&format!("\n\nPart of run {}", run.id));
            if let Some(parent) = &parent {
                body.push_str(&format!(" (issue {})", parent));
            }

            let created = policy
                .run("tracker create task issue", || {
                    self.tracker.create_issue(project.as_deref(), &title, &body)
                })
                .await;
            match created {
                Ok(issue) => filed.push((task.id(), issue)),
                Err(e) => {
                    tracing::warn!("Could not file tracker issue for {}: {}", title, e);
                }
            }
        }

        for (task_id, issue) in filed {
            if let Some(task) = run.tasks.iter_mut().find(|t| t.id() == task_id) {
                task.set_tracker_issue(issue);
            }
        }
        self.save(run).await;
    }

    /// Terminal status updates plus a summary comment. Never fails the run.
    async fn report_to_tracker(&self, run: &Run) {
        self.report_task_issues(run).await;

        let Some(issue) = run.tracker_issue.as_deref() else {
            return;
        };
        let Some(status) = TrackerStatus::for_run_state(run.state) else {
            return;
        };

        let policy = self.config.retry.tracker;
        if let Err(e) = policy
            .run("tracker status update", || {
                self.tracker.update_issue_status(issue, status)
            })
            .await
        {
            tracing::warn!("Tracker status update for run {} dropped: {}", run.id, e);
            return;
        }

        let comment = run.report().to_markdown();
        if let Err(e) = self.tracker.add_comment(issue, &comment).await {
            tracing::warn!("Tracker comment for run {} dropped: {}", run.id, e);
        }
    }

    /// One terminal status per task issue; unfinished tasks report as failed.
    async fn report_task_issues(&self, run: &Run) {
        let policy = self.config.retry.tracker;
        for task in &run.tasks {
            let Some(issue) = task.tracker_issue() else {
                continue;
            };
            let status = if task.state().is_success() {
                TrackerStatus::Succeeded
            } else {
                TrackerStatus::Failed
            };
            if let Err(e) = policy
                .run("tracker task status update", || {
                    self.tracker.update_issue_status(issue, status)
                })
                .await
            {
                tracing::warn!("Tracker status for {} dropped: {}", task.headline(), e);
            }
        }
    }

    async fn save(&self, run: &Run) {
        if let Err(e) = self.store.save(run.clone()).await {
            tracing::warn!("Failed to store snapshot of run {}: {}", run.id, e);
        }
    }
}

/// Rebuild the run's aggregate ChangeSet from its successful tasks.
fn aggregate(run: &mut Run) {
    let (changes, conflicts) = ChangeSet::aggregate(
        run.succeeded_tasks()
            .filter_map(|t| t.output().map(|o| (t.id(), &o.changes))),
    );
    let previous = std::mem::replace(&mut run.conflicts, conflicts);
    run.changes = changes;

    let messages: Vec<String> = run
        .conflicts
        .iter()
        .filter(|c| !previous.contains(c))
        .map(|c| {
            let index = |id| run.task(id).map(|t| t.index() + 1).unwrap_or_default();
            format!(
                "{} written by tasks {} and {}; keeping task {}",
                c.path,
                index(c.overridden),
                index(c.winner),
                index(c.winner)
            )
        })
        .collect();
    for message in messages {
        run.warn(message);
    }
}
