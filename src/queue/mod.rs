//! Background task queue
//!
//! Jobs are rows of `event_queue`, appended in the same transaction as the
//! state change they follow from. A single worker per process polls for
//! due jobs; the [`ClaimLock`] makes sure one `(job, next_attempt)` pair is
//! executed by exactly one process.

mod lease;
mod tasks;
mod worker;

#[cfg(test)]
pub use lease::MockClaimLock;
pub use lease::{ClaimLock, SqliteClaimLock};
pub use tasks::{TaskError, TaskRunner};
pub use worker::{QueueWorker, retry_delay};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::data::{Database, EventQueueItem};
use crate::error::AppError;
use crate::metrics::QUEUE_JOBS_ENQUEUED;

/// POST an activity to an inbox, or run the inbox pipeline when the inbox
/// is ours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeliverToActivityPub {
    pub target_inbox: String,
    pub object_id: String,
}

/// Send an activity as a Salmon magic envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeliverToSalmon {
    pub salmon_url: String,
    pub object_id: String,
}

/// Push an Atom entry to one WebSub subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeliverToWebSub {
    pub subscription: i64,
    pub source_user_id: String,
    pub object_id: String,
    /// Outbox key of the object, used as the entry cursor
    pub collection_item: Option<i64>,
}

/// Subscribe to or unsubscribe from a legacy actor's hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebSubClientJob {
    pub unsubscribe: bool,
    #[serde(rename = "ActorID")]
    pub actor_id: String,
    #[serde(rename = "ToFollowID")]
    pub to_follow_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    DeliverToActivityPub(DeliverToActivityPub),
    DeliverToSalmon(DeliverToSalmon),
    DeliverToWebSub(DeliverToWebSub),
    WebSubClient(WebSubClientJob),
}

impl Job {
    /// The `action` column value.
    pub fn action(&self) -> &'static str {
        match self {
            Job::DeliverToActivityPub(_) => "DeliverToActivityPub",
            Job::DeliverToSalmon(_) => "DeliverToSalmon",
            Job::DeliverToWebSub(_) => "DeliverToWebSub",
            Job::WebSubClient(_) => "WebSubClient",
        }
    }

    pub fn payload(&self) -> Result<String, AppError> {
        let payload = match self {
            Job::DeliverToActivityPub(job) => serde_json::to_string(job),
            Job::DeliverToSalmon(job) => serde_json::to_string(job),
            Job::DeliverToWebSub(job) => serde_json::to_string(job),
            Job::WebSubClient(job) => serde_json::to_string(job),
        };
        payload.map_err(|e| AppError::Internal(e.into()))
    }

    /// Decode a stored row.
    pub fn from_event(event: &EventQueueItem) -> Result<Self, AppError> {
        let job = match event.action.as_str() {
            "DeliverToActivityPub" => Job::DeliverToActivityPub(serde_json::from_str(&event.data)?),
            "DeliverToSalmon" => Job::DeliverToSalmon(serde_json::from_str(&event.data)?),
            "DeliverToWebSub" => Job::DeliverToWebSub(serde_json::from_str(&event.data)?),
            "WebSubClient" => Job::WebSubClient(serde_json::from_str(&event.data)?),
            other => {
                return Err(AppError::Validation(format!("Unknown job action: {}", other)));
            }
        };
        Ok(job)
    }
}

/// Append a job due immediately. Runs on whatever transaction `db` holds.
pub async fn enqueue(db: &Database, job: &Job) -> Result<i64, AppError> {
    let id = db
        .enqueue_event(job.action(), &job.payload()?, Utc::now())
        .await?;
    QUEUE_JOBS_ENQUEUED
        .with_label_values(&[job.action()])
        .inc();
    tracing::debug!(id, action = job.action(), "Job enqueued");
    Ok(id)
}
