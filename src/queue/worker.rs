use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{ClaimLock, Job, TaskError, TaskRunner};
use crate::config::QueueConfig;
use crate::data::{Database, EventQueueItem};
use crate::error::AppError;
use crate::metrics::{QUEUE_CLAIMS_LOST, QUEUE_JOBS_EXECUTED};
use crate::pipeline::ProcessingLock;

/// Jobs read per poll.
const BATCH_SIZE: i64 = 50;

/// Delay before retry number `attempt` (1-based): `attempt² × base`.
pub fn retry_delay(attempt: i64, base_minutes: i64) -> Duration {
    let attempt = attempt.max(1);
    Duration::minutes(attempt * attempt * base_minutes)
}

/// The per-process polling loop over `event_queue`.
pub struct QueueWorker {
    db: Database,
    runner: TaskRunner,
    claims: Arc<dyn ClaimLock>,
    processing: ProcessingLock,
    notify: Arc<Notify>,
    config: QueueConfig,
}

impl QueueWorker {
    pub fn new(
        db: Database,
        runner: TaskRunner,
        claims: Arc<dyn ClaimLock>,
        processing: ProcessingLock,
        notify: Arc<Notify>,
        config: QueueConfig,
    ) -> Self {
        Self {
            db,
            runner,
            claims,
            processing,
            notify,
            config,
        }
    }

    /// Start polling on a background task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tracing::info!("Queue worker spawned");
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        loop {
            let executed = match self.run_once().await {
                Ok(executed) => executed,
                Err(e) => {
                    tracing::error!(error = %e, "Queue poll failed");
                    0
                }
            };
            if let Err(e) = self.db.prune_expired_claims().await {
                tracing::warn!(error = %e, "Pruning job claims failed");
            }

            let wait = self.idle_wait(executed).await;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Time until the earliest pending job, capped so that jobs queued by
    /// other processes are picked up.
    async fn idle_wait(&self, executed: usize) -> std::time::Duration {
        let cap = std::time::Duration::from_secs(self.config.max_idle_seconds);
        // Due jobs we just lost to other processes must not spin the loop.
        let floor = if executed == 0 {
            std::time::Duration::from_secs(1).min(cap)
        } else {
            std::time::Duration::ZERO
        };

        match self.db.next_event_time().await {
            Ok(Some(next)) => (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
                .clamp(floor, cap),
            Ok(None) => cap,
            Err(e) => {
                tracing::warn!(error = %e, "Reading next job time failed");
                cap
            }
        }
    }

    /// Execute every due job this process can claim; returns how many ran.
    pub async fn run_once(&self) -> Result<usize, AppError> {
        let due = self.db.due_events(Utc::now(), BATCH_SIZE).await?;
        let ttl = Duration::seconds(self.config.claim_ttl_seconds);
        let mut executed = 0;

        for event in due {
            if !self.claims.try_claim(&event.claim_key(), ttl).await? {
                QUEUE_CLAIMS_LOST.inc();
                tracing::debug!(id = event.id, action = %event.action, "Job claimed elsewhere");
                continue;
            }
            self.execute(event).await?;
            executed += 1;
        }
        Ok(executed)
    }

    async fn execute(&self, event: EventQueueItem) -> Result<(), AppError> {
        let job = match Job::from_event(&event) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(id = event.id, action = %event.action, error = %e, "Dropping undecodable job");
                QUEUE_JOBS_EXECUTED
                    .with_label_values(&[event.action.as_str(), "invalid"])
                    .inc();
                return self.db.delete_event(event.id).await;
            }
        };

        let outcome = {
            let _processing = self.processing.lock().await;
            self.runner.run(&self.db, &job).await
        };

        let result = match outcome {
            Ok(()) => {
                self.db.delete_event(event.id).await?;
                tracing::debug!(id = event.id, action = job.action(), "Job done");
                "ok"
            }
            Err(TaskError::Fatal(reason)) => {
                self.db.delete_event(event.id).await?;
                tracing::warn!(id = event.id, action = job.action(), reason = %reason, "Job dropped");
                "fatal"
            }
            Err(TaskError::Retry(reason)) => {
                let attempt = event.attempt_count + 1;
                let next_attempt =
                    Utc::now() + retry_delay(attempt, self.config.backoff_base_minutes);
                self.db
                    .reschedule_event(event.id, event.attempt_count, next_attempt)
                    .await?;
                tracing::info!(
                    id = event.id,
                    action = job.action(),
                    attempt,
                    next_attempt = %next_attempt,
                    reason = %reason,
                    "Job will be retried"
                );
                "retry"
            }
        };
        QUEUE_JOBS_EXECUTED
            .with_label_values(&[job.action(), result])
            .inc();
        Ok(())
    }
}
