//! Restarts the worker pool after it loses its broker connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::services::worker_pool::{WorkerEvent, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Worker pool closed {attempts} times in a row: {reason}")]
    RestartsExhausted { attempts: u32, reason: String },
}

pub struct RestartSupervisor {
    pool: Arc<WorkerPool>,
    policy: RestartPolicy,
    events: broadcast::Receiver<WorkerEvent>,
}

impl RestartSupervisor {
    /// Subscribes to the pool immediately, so create it before starting the pool.
    pub fn new(pool: Arc<WorkerPool>, policy: RestartPolicy) -> Self {
        let events = pool.subscribe();
        Self {
            pool,
            policy,
            events,
        }
    }

    /// Watch pool events until `shutdown` fires or restarts run out.
    ///
    /// Only consecutive failed restarts count toward the bound: the counter
    /// resets once a generation reaches the broker or a job completes.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        let mut attempts = 0u32;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = self.events.recv() => event,
            };

            match event {
                Ok(WorkerEvent::Closed { reason }) => {
                    attempts += 1;
                    if attempts > self.policy.max_attempts {
                        let err = SupervisorError::RestartsExhausted {
                            attempts: self.policy.max_attempts,
                            reason,
                        };
                        self.pool.mark_fatal(&err.to_string()).await;
                        return Err(err);
                    }

                    tracing::warn!(
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        delay_secs = self.policy.delay.as_secs(),
                        reason = %reason,
                        "Worker pool closed, scheduling restart"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.policy.delay) => {}
                    }
                    if !self.pool.restart().await {
                        tracing::info!("Worker pool was stopped during the restart delay, leaving it stopped");
                        attempts = 0;
                    }
                }
                Ok(WorkerEvent::Connected | WorkerEvent::Completed { .. }) => {
                    if attempts > 0 {
                        tracing::info!(after_attempts = attempts, "Worker pool recovered");
                    }
                    attempts = 0;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Supervisor lagged behind worker events");
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}
