//! Work queue between the HTTP listener and the orchestrator.
//!
//! Handlers only create a run, store its first snapshot and hand it over.
//! A single consumer drains the channel and executes at most
//! `max_concurrent_runs` runs at a time.

use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::orchestrator::Orchestrator;
use crate::run::{Run, RunRequest, RunStore};

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("Run queue is full")]
    Full,

    #[error("Run queue is closed")]
    Closed,

    #[error("Failed to store run: {0}")]
    Store(String),
}

/// Producer side of the queue; cheap to clone.
#[derive(Clone)]
pub struct RunQueue {
    tx: mpsc::Sender<Run>,
    store: Arc<dyn RunStore>,
}

impl RunQueue {
    pub fn new(store: Arc<dyn RunStore>, capacity: usize) -> (Self, mpsc::Receiver<Run>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, store }, rx)
    }

    /// Create a run for `request` and enqueue it.
    ///
    /// The slot is reserved before the snapshot is stored, so a stored
    /// run is always picked up by the consumer.
    pub async fn submit(&self, request: RunRequest) -> Result<Run, QueueError> {
        let permit = self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => QueueError::Full,
            mpsc::error::TrySendError::Closed(()) => QueueError::Closed,
        })?;

        let run = Run::new(request);
        self.store
            .save(run.clone())
            .await
            .map_err(QueueError::Store)?;
        permit.send(run.clone());

        tracing::info!("Run {} queued ({} waiting)", run.id, self.waiting());
        Ok(run)
    }

    /// Runs accepted but not yet picked up.
    pub fn waiting(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Drain `rx`, running at most `max_concurrent` runs at once.
pub fn spawn_consumer(
    mut rx: mpsc::Receiver<Run>,
    orchestrator: Arc<Orchestrator>,
    max_concurrent: usize,
) -> JoinHandle<()> {
    let slots = Arc::new(Semaphore::new(max_concurrent.max(1)));
    tokio::spawn(async move {
        while let Some(run) = rx.recv().await {
            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                break;
            };
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let _permit = permit;
                orchestrator.execute(run).await;
            });
        }
        tracing::debug!("Run queue closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::repo::InMemoryRepository;
    use crate::retry::RetrySettings;
    use crate::run::{InMemoryRunStore, RunFailureCode, RunState};
    use crate::testing::ScriptedLlm;
    use crate::tracker::NoopTracker;
    use std::time::Duration;

    #[tokio::test]
    async fn test_submit_stores_before_enqueueing() {
        let store = InMemoryRunStore::new();
        let (queue, mut rx) = RunQueue::new(Arc::new(store.clone()), 4);

        let run = queue.submit(RunRequest::new("Add dark mode")).await.unwrap();

        assert_eq!(queue.waiting(), 1);
        let stored = store.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Intake);
        assert_eq!(rx.recv().await.unwrap().id, run.id);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_storing() {
        let store = InMemoryRunStore::new();
        let (queue, _rx) = RunQueue::new(Arc::new(store.clone()), 1);

        queue.submit(RunRequest::new("first")).await.unwrap();
        let err = queue.submit(RunRequest::new("second")).await.unwrap_err();

        assert!(matches!(err, QueueError::Full));
        assert_eq!(store.list(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_consumer_executes_queued_runs() {
        let mut config = Config::new("key".to_string(), "test/model".to_string());
        config.retry = RetrySettings::immediate();
        let store = InMemoryRunStore::new();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(config),
            Arc::new(ScriptedLlm::default()),
            Arc::new(InMemoryRepository::new("acme/app", "main")),
            Arc::new(NoopTracker),
            Arc::new(store.clone()),
        ));
        let (queue, rx) = RunQueue::new(Arc::new(store.clone()), 4);
        let consumer = spawn_consumer(rx, orchestrator, 1);

        // the script is empty, so decomposition fails
        let run = queue.submit(RunRequest::new("Add dark mode")).await.unwrap();

        let mut finished = None;
        for _ in 0..100 {
            let stored = store.get(run.id).await.unwrap().unwrap();
            if stored.state.is_terminal() {
                finished = Some(stored);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let finished = finished.expect("run did not finish");
        assert_eq!(
            finished.failure_code(),
            Some(RunFailureCode::DecompositionFailed)
        );

        drop(queue);
        consumer.await.unwrap();
    }
}
