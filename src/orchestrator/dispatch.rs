//! Dependency-aware task dispatch.
//!
//! The dispatcher is the only writer of Task state. Agent invocations run on
//! a `JoinSet`, bounded by a semaphore, and receive owned inputs; results
//! come back through `join_next` and are applied here, one at a time.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::{remaining, Orchestrator};
use crate::agents::{run_worker, AgentContext, Prerequisite, WorkerInput};
use crate::run::Run;
use crate::task::{Task, TaskFailure, TaskOutput, TaskState};

type TaskResult = (usize, Result<TaskOutput, TaskFailure>);

enum Readiness {
    Ready,
    Waiting,
    Blocked(TaskFailure),
}

fn readiness(run: &Run, task: &Task) -> Readiness {
    for dep in task.depends_on() {
        match run.task(*dep).map(|t| t.state()) {
            Some(TaskState::Succeeded) => {}
            Some(TaskState::Failed { .. }) | None => {
                return Readiness::Blocked(TaskFailure::DependencyFailed { dependency: *dep })
            }
            Some(_) => return Readiness::Waiting,
        }
    }
    Readiness::Ready
}

fn prerequisites(run: &Run, task: &Task) -> Vec<Prerequisite> {
    task.depends_on()
        .iter()
        .filter_map(|id| run.task(*id))
        .filter_map(|dep| {
            dep.output().map(|output| Prerequisite {
                index: dep.index(),
                role: dep.role(),
                description: dep.description().to_string(),
                output: output.clone(),
            })
        })
        .collect()
}

impl Orchestrator {
    /// Run every pending task of `run` whose prerequisites allow it.
    ///
    /// Returns once no task is pending or running. Tasks that cannot start
    /// before the run deadline fail with `Timeout`.
    pub(super) async fn dispatch(&self, run: &mut Run, ctx: &AgentContext, deadline: Instant) {
        let limits = &self.config.orchestrator;
        let semaphore = Arc::new(Semaphore::new(limits.max_concurrent_tasks.max(1)));
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();

        loop {
            if join_set.is_empty() {
                // nothing is in flight, so a running task lost its invocation to a panic
                for position in 0..run.tasks.len() {
                    if matches!(run.tasks[position].state(), TaskState::Running) {
                        let failure = TaskFailure::Model {
                            detail: "agent invocation panicked".to_string(),
                        };
                        self.settle(run, position, Err(failure));
                    }
                }
            }

            let expired = remaining(deadline).is_zero();
            let mut ready = Vec::new();

            for position in 0..run.tasks.len() {
                if !matches!(run.tasks[position].state(), TaskState::Pending) {
                    continue;
                }
                if expired {
                    self.settle(run, position, Err(TaskFailure::Timeout));
                    continue;
                }
                match readiness(run, &run.tasks[position]) {
                    Readiness::Ready => ready.push(position),
                    Readiness::Waiting => {}
                    Readiness::Blocked(failure) => self.settle(run, position, Err(failure)),
                }
            }

            for position in ready {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                if let Err(e) = run.tasks[position].start() {
                    tracing::error!("Task could not start: {}", e);
                    continue;
                }

                let task = run.tasks[position].clone();
                let input = WorkerInput {
                    prerequisites: prerequisites(run, &task),
                    requirement: run.request.requirement.clone(),
                    task,
                };
                let binding = self.roles.get(input.task.role()).clone();
                let ctx = ctx.clone();
                let retries = limits.role_output_retries;
                let limit = limits.task_timeout.min(remaining(deadline));

                tracing::info!(
                    "Dispatching task {} ({}) revision {}",
                    input.task.index() + 1,
                    input.task.role(),
                    input.task.revision()
                );
                join_set.spawn(async move {
                    let _permit = permit;
                    let outcome =
                        tokio::time::timeout(limit, run_worker(&binding, &ctx, &input, retries))
                            .await;
                    let result = match outcome {
                        Ok(Ok(output)) => Ok(output),
                        Ok(Err(e)) => Err(e.into_failure()),
                        Err(_) => Err(TaskFailure::Timeout),
                    };
                    (position, result)
                });
            }
            self.save(run).await;

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok((position, result)) => self.settle(run, position, result),
                Err(e) => tracing::error!("Agent invocation panicked: {}", e),
            }
        }
    }

    /// Apply one task result.
    ///
    /// A rerun from the review fix cycle that fails keeps the previous output.
    fn settle(&self, run: &mut Run, position: usize, result: Result<TaskOutput, TaskFailure>) {
        let task = &mut run.tasks[position];
        let label = format!("Task {} ({})", task.index() + 1, task.role());

        let applied = match result {
            Ok(output) => {
                tracing::info!("{} succeeded with {} files", label, output.changes.len());
                task.succeed(output)
            }
            Err(failure) => match task.output().cloned().filter(|_| task.revision() > 0) {
                Some(previous) => {
                    let message =
                        format!("{} fix failed ({}); keeping its previous output", label, failure);
                    let pending = matches!(task.state(), TaskState::Pending);
                    let restored = if pending {
                        task.start().and_then(|_| task.succeed(previous))
                    } else {
                        task.succeed(previous)
                    };
                    run.warn(message);
                    restored
                }
                None => {
                    tracing::warn!("{} failed: {}", label, failure);
                    task.fail(failure)
                }
            },
        };

        if let Err(e) = applied {
            tracing::error!("{}: {}", label, e);
        }
    }
}
