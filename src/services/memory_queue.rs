//! In-process broker with the same delivery semantics as `RedisQueue`.
//!
//! Timing uses `tokio::time::Instant`, so tests can drive leases and
//! backoff with a paused clock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::queue::{
    AckOutcome, Delivery, FailOutcome, JobQueue, MessageState, QueueCounts, QueueError,
    QueueMessage, RetryPolicy, StalledSweep,
};

#[derive(Debug)]
struct Entry {
    message: QueueMessage,
    state: MessageState,
    attempts_made: u32,
    stalled_count: u32,
    /// Ready-at for delayed entries, lease deadline for active ones.
    due: Instant,
    finished_at: Option<Instant>,
    error: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Uuid, Entry>,
    waiting: VecDeque<Uuid>,
    connected: bool,
}

impl Inner {
    fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.connected {
            Ok(())
        } else {
            Err(QueueError::Closed("in-memory broker disconnected".to_string()))
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, Uuid)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == MessageState::Delayed && e.due <= now)
            .map(|(id, e)| (e.due, *id))
            .collect();
        due.sort();
        for (_, id) in due {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.state = MessageState::Waiting;
                self.waiting.push_back(id);
            }
        }
    }

    fn prune_finished(&mut self, now: Instant, retention: Duration) {
        self.entries.retain(|_, e| match e.finished_at {
            Some(at) => now.duration_since(at) < retention,
            None => true,
        });
    }

    fn finish(&mut self, job_id: Uuid, state: MessageState, error: Option<String>) {
        if let Some(entry) = self.entries.get_mut(&job_id) {
            entry.state = state;
            entry.finished_at = Some(Instant::now());
            if error.is_some() {
                entry.error = error;
            }
        }
    }

    fn purge(&mut self, job_id: Uuid) {
        self.waiting.retain(|id| *id != job_id);
        self.entries.remove(&job_id);
    }
}

pub struct MemoryQueue {
    inner: Mutex<Inner>,
    retry: RetryPolicy,
    retention: Duration,
}

impl MemoryQueue {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                connected: true,
                ..Inner::default()
            }),
            retry,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// How long finished messages are kept for inspection.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Simulate losing the broker connection: every call fails until reconnected.
    pub async fn disconnect(&self) {
        self.inner.lock().await.connected = false;
    }

    pub async fn reconnect(&self) {
        self.inner.lock().await.connected = true;
    }

    /// Attempts made so far and the last recorded error.
    pub async fn attempts(&self, job_id: Uuid) -> Option<(u32, Option<String>)> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .get(&job_id)
            .map(|e| (e.attempts_made, e.error.clone()))
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_connected()?;

        let job_id = message.job_id;
        if let Some(existing) = inner.entries.get(&job_id) {
            if matches!(
                existing.state,
                MessageState::Waiting | MessageState::Delayed | MessageState::Active
            ) {
                return Ok(());
            }
        }
        inner.entries.insert(
            job_id,
            Entry {
                message: message.clone(),
                state: MessageState::Waiting,
                attempts_made: 0,
                stalled_count: 0,
                due: Instant::now(),
                finished_at: None,
                error: None,
            },
        );
        inner.waiting.push_back(job_id);
        Ok(())
    }

    async fn reserve(&self, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_connected()?;

        let now = Instant::now();
        inner.prune_finished(now, self.retention);
        inner.promote_due(now);

        while let Some(job_id) = inner.waiting.pop_front() {
            let Some(entry) = inner.entries.get_mut(&job_id) else {
                continue;
            };
            if entry.state != MessageState::Waiting {
                continue;
            }
            entry.state = MessageState::Active;
            entry.attempts_made += 1;
            entry.due = now + lease;
            return Ok(Some(Delivery {
                message: entry.message.clone(),
                attempts_made: entry.attempts_made,
            }));
        }
        Ok(None)
    }

    async fn heartbeat(&self, job_id: Uuid, lease: Duration) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_connected()?;
        if let Some(entry) = inner.entries.get_mut(&job_id) {
            if entry.state == MessageState::Active {
                entry.due = Instant::now() + lease;
            }
        }
        Ok(())
    }

    async fn complete(&self, delivery: &Delivery) -> Result<AckOutcome, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_connected()?;

        let job_id = delivery.message.job_id;
        let active = inner
            .entries
            .get(&job_id)
            .is_some_and(|e| e.state == MessageState::Active);
        if !active {
            return Ok(AckOutcome::Superseded);
        }
        inner.finish(job_id, MessageState::Completed, None);
        Ok(AckOutcome::Acknowledged)
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_connected()?;

        let job_id = delivery.message.job_id;
        let Some(entry) = inner.entries.get_mut(&job_id) else {
            return Ok(FailOutcome::Superseded);
        };
        if entry.state != MessageState::Active {
            return Ok(FailOutcome::Superseded);
        }

        entry.error = Some(error.to_string());
        if retryable && self.retry.allows_retry(delivery.attempts_made) {
            let delay = self.retry.backoff_for(delivery.attempts_made);
            entry.state = MessageState::Delayed;
            entry.due = Instant::now() + delay;
            return Ok(FailOutcome::Retrying { delay });
        }

        inner.finish(job_id, MessageState::Failed, None);
        Ok(FailOutcome::Exhausted)
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_connected()?;

        let job_id = delivery.message.job_id;
        let Some(entry) = inner.entries.get_mut(&job_id) else {
            return Ok(());
        };
        if entry.state != MessageState::Active {
            return Ok(());
        }
        entry.state = MessageState::Waiting;
        entry.attempts_made = entry.attempts_made.saturating_sub(1);
        inner.waiting.push_front(job_id);
        Ok(())
    }

    async fn remove_job(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_connected()?;

        match inner.entries.get(&job_id).map(|e| e.state) {
            None => {}
            Some(MessageState::Active) => {
                inner.finish(job_id, MessageState::Failed, Some("job cancelled".to_string()));
            }
            Some(_) => inner.purge(job_id),
        }
        Ok(())
    }

    async fn recover_stalled(&self, max_stalled: u32) -> Result<StalledSweep, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_connected()?;

        let now = Instant::now();
        let mut expired: Vec<(Instant, Uuid)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.state == MessageState::Active && e.due <= now)
            .map(|(id, e)| (e.due, *id))
            .collect();
        expired.sort();

        let mut sweep = StalledSweep::default();
        for (_, job_id) in expired {
            let Some(entry) = inner.entries.get_mut(&job_id) else {
                continue;
            };
            entry.stalled_count += 1;
            if entry.stalled_count > max_stalled {
                let reason = "job stalled more than allowable limit".to_string();
                inner.finish(job_id, MessageState::Failed, Some(reason));
                sweep.failed.push(job_id);
            } else {
                entry.state = MessageState::Waiting;
                inner.waiting.push_back(job_id);
                sweep.recovered.push(job_id);
            }
        }
        Ok(sweep)
    }

    async fn state(&self, job_id: Uuid) -> Result<Option<MessageState>, QueueError> {
        let inner = self.inner.lock().await;
        inner.ensure_connected()?;
        Ok(inner.entries.get(&job_id).map(|e| e.state))
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_connected()?;
        inner.prune_finished(Instant::now(), self.retention);

        let mut counts = QueueCounts::default();
        for entry in inner.entries.values() {
            match entry.state {
                MessageState::Waiting => counts.waiting += 1,
                MessageState::Delayed => counts.delayed += 1,
                MessageState::Active => counts.active += 1,
                MessageState::Completed => counts.completed += 1,
                MessageState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.inner.lock().await.ensure_connected()
    }
}
