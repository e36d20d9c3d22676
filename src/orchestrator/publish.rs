//! Finalizing: materialize the aggregate ChangeSet as branch + commit + PR.
//!
//! Publication is idempotent per run. The branch name is derived from the
//! run id, and an open pull request for that branch short-circuits the whole
//! step, so re-running `Finalizing` never opens a second PR.

use super::Orchestrator;
use crate::repo::{PullRequestDraft, PullRequestRef, RepoError, RepositoryClient};
use crate::run::{Run, RunError, RunFailureCode};

/// Pull request description for a run about to be published.
pub fn pull_request_body(run: &Run) -> String {
    let mut body = format!("## Requirement\n\n{}\n", run.request.requirement.trim());
    if let Some(summary) = &run.plan_summary {
        body.push_str(&format!("\n## Plan\n\n{}\n", summary));
    }

    body.push_str("\n## Tasks\n\n| # | Role | Task | Result | Files |\n|---|---|---|---|---|\n");
    for task in &run.tasks {
        let result = match task.failure() {
            Some(failure) => format!("failed ({})", failure.code()),
            None if task.state().is_success() => "succeeded".to_string(),
            None => "not run".to_string(),
        };
        let files = task
            .output()
            .map(|o| o.changes.len().to_string())
            .unwrap_or_else(|| "-".to_string());
        body.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            task.index() + 1,
            task.role(),
            task.description().replace('|', "\\|").replace('\n', " "),
            result,
            files
        ));
    }

    let failed: Vec<_> = run.failed_tasks().collect();
    if !failed.is_empty() {
        body.push_str("\n## Failed tasks\n\n");
        for task in failed {
            if let Some(failure) = task.failure() {
                body.push_str(&format!(
                    "- Task {} ({}): {}\n",
                    task.index() + 1,
                    task.role(),
                    failure
                ));
            }
        }
    }

    match &run.review {
        Some(review) => {
            let verdict = if review.approved {
                "Approved"
            } else {
                "Changes requested"
            };
            body.push_str(&format!("\n## Review\n\n**{}**: {}\n", verdict, review.summary));
            if !review.requested_changes.is_empty() {
                body.push('\n');
                for change in &review.requested_changes {
                    let task = run
                        .task(change.task_id)
                        .map(|t| format!("Task {} ({})", t.index() + 1, t.role()))
                        .unwrap_or_else(|| change.task_id.to_string());
                    body.push_str(&format!("- [ ] {}: {}\n", task, change.note));
                }
            }
            if run.redispatched {
                body.push_str("\nOne automatic fix cycle was applied before this review.\n");
            }
        }
        None => body.push_str("\n## Review\n\nNo review was recorded for this run.\n"),
    }

    if !run.conflicts.is_empty() {
        body.push_str("\n## Path conflicts\n\n");
        for conflict in &run.conflicts {
            let index = |id| {
                run.task(id)
                    .map(|t| (t.index() + 1).to_string())
                    .unwrap_or_else(|| "?".to_string())
            };
            body.push_str(&format!(
                "- `{}`: task {} overrode task {}\n",
                conflict.path,
                index(conflict.winner),
                index(conflict.overridden)
            ));
        }
    }

    body.push_str(&format!("\n---\nRun `{}`\n", run.id));
    body
}

fn commit_message(run: &Run) -> String {
    let mut message = format!("{}\n\n", run.request.title());
    for task in run.succeeded_tasks() {
        message.push_str(&format!(
            "- task {} ({}): {}\n",
            task.index() + 1,
            task.role(),
            task.description().lines().next().unwrap_or_default()
        ));
    }
    message.push_str(&format!("\nRun: {}\n", run.id));
    message
}

impl Orchestrator {
    /// Publish the run and move it to its terminal state.
    pub(super) async fn finalize(
        &self,
        run: &mut Run,
        repo: &dyn RepositoryClient,
    ) -> Result<(), RunError> {
        let branch = run.branch_name(&self.config.github.branch_prefix);
        let policy = self.config.retry.publish;

        match policy
            .run("find pull request", || repo.find_pull_request(&branch))
            .await
        {
            Ok(Some(existing)) => {
                tracing::info!(
                    "Run {} already published as #{}; reusing it",
                    run.id,
                    existing.number
                );
                return run.complete(existing, true);
            }
            Ok(None) => {}
            Err(e) => return run.fail(RunFailureCode::PublishFailed, e.to_string()),
        }

        match self.publish(run, repo, &branch).await {
            Ok((pull_request, reused)) => {
                tracing::info!("Run {} opened {}", run.id, pull_request.url);
                run.complete(pull_request, reused)
            }
            Err(e) => run.fail(RunFailureCode::PublishFailed, e.to_string()),
        }
    }

    async fn publish(
        &self,
        run: &Run,
        repo: &dyn RepositoryClient,
        branch: &str,
    ) -> Result<(PullRequestRef, bool), RepoError> {
        let base = self.config.github.base_branch.as_str();
        let policy = self.config.retry.publish;

        if !policy
            .run("branch lookup", || repo.branch_exists(branch))
            .await?
        {
            match policy
                .run("create branch", || repo.create_branch(base, branch))
                .await
            {
                Ok(()) => {}
                Err(RepoError::Conflict(_)) => {
                    tracing::debug!("Branch {} appeared concurrently; reusing it", branch);
                }
                Err(e) => return Err(e),
            }
        }

        let message = commit_message(run);
        let sha = policy
            .run("commit changes", || {
                repo.commit_changes(branch, &run.changes, &message)
            })
            .await?;
        tracing::debug!("Committed {} files to {} ({})", run.changes.len(), branch, sha);

        let draft = PullRequestDraft {
            branch: branch.to_string(),
            base: base.to_string(),
            title: format!("[AI] {}", run.request.title()),
            body: pull_request_body(run),
        };
        match policy
            .run("open pull request", || repo.open_pull_request(&draft))
            .await
        {
            Ok(pull_request) => Ok((pull_request, false)),
            Err(RepoError::Conflict(message)) => match repo.find_pull_request(branch).await? {
                Some(existing) => Ok((existing, true)),
                None => Err(RepoError::Conflict(message)),
            },
            Err(e) => Err(e),
        }
    }
}
