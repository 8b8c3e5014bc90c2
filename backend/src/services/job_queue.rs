//! Dispatch queue between the scheduler and workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::job_run::JobRun;
use crate::services::store::SyncStore;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Hand a freshly created run to the workers.
    async fn push(&self, run: JobRun) -> Result<()>;

    /// Wait for the next run. Returns `None` once `cancel` fires or the
    /// queue is closed.
    async fn pop(&self, cancel: &CancellationToken) -> Option<JobRun>;
}

// ── In-process queue ────────────────────────────────────────────────────────

/// Queue for a scheduler and worker sharing one process.
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<JobRun>,
    rx: Mutex<mpsc::UnboundedReceiver<JobRun>>,
}

impl ChannelQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Default for ChannelQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn push(&self, run: JobRun) -> Result<()> {
        self.tx
            .send(run)
            .map_err(|e| AppError::Internal(format!("job queue closed, dropped run {}", e.0.id)))
    }

    async fn pop(&self, cancel: &CancellationToken) -> Option<JobRun> {
        let mut rx = tokio::select! {
            _ = cancel.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            _ = cancel.cancelled() => None,
            run = rx.recv() => run,
        }
    }
}

// ── Store-backed queue ──────────────────────────────────────────────────────

/// Queue that claims pending runs straight from the durable store, so any
/// number of worker processes can share one scheduler.
pub struct StoreQueue {
    store: Arc<dyn SyncStore>,
    worker: String,
    poll_interval: Duration,
}

impl StoreQueue {
    pub fn new(store: Arc<dyn SyncStore>, worker: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            store,
            worker: worker.into(),
            poll_interval,
        }
    }
}

#[async_trait]
impl JobQueue for StoreQueue {
    async fn push(&self, _run: JobRun) -> Result<()> {
        // The run is already pending in the store.
        Ok(())
    }

    async fn pop(&self, cancel: &CancellationToken) -> Option<JobRun> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.store.claim_next_pending(&self.worker).await {
                Ok(Some(run)) => return Some(run),
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to claim pending job run: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job_run::{JobRunStatus, JobSpec, NewJobRun, TaskKind};
    use crate::services::store::MemoryStore;
    use chrono::Utc;

    fn new_run(group: &str) -> NewJobRun {
        let now = Utc::now();
        NewJobRun {
            server_name: "pulp1.example.com".to_string(),
            task: TaskKind::RepoGroupSync {
                group: group.to_string(),
            },
            spec: JobSpec::default(),
            scheduled_for: now,
            deadline: now + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_channel_queue_fifo() {
        let store = MemoryStore::new();
        let queue = ChannelQueue::new();
        let a = store.create_job_run_if_idle(new_run("a")).await.unwrap().unwrap();
        let b = store.create_job_run_if_idle(new_run("b")).await.unwrap().unwrap();
        queue.push(a.clone()).await.unwrap();
        queue.push(b.clone()).await.unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(queue.pop(&cancel).await.unwrap().id, a.id);
        assert_eq!(queue.pop(&cancel).await.unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_channel_queue_pop_cancelled() {
        let queue = ChannelQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.pop(&cancel).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_queue_claims_pending() {
        let store: Arc<dyn SyncStore> = Arc::new(MemoryStore::new());
        let queue = StoreQueue::new(store.clone(), "worker-1", Duration::from_secs(5));
        let created = store.create_job_run_if_idle(new_run("a")).await.unwrap().unwrap();

        let cancel = CancellationToken::new();
        let claimed = queue.pop(&cancel).await.unwrap();
        assert_eq!(claimed.id, created.id);
        assert_eq!(claimed.status, JobRunStatus::Running);
        assert_eq!(claimed.worker.as_deref(), Some("worker-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_queue_waits_until_cancelled() {
        let store: Arc<dyn SyncStore> = Arc::new(MemoryStore::new());
        let queue = StoreQueue::new(store, "worker-1", Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            canceller.cancel();
        });
        assert!(queue.pop(&cancel).await.is_none());
    }
}
