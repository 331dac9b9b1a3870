//! Job execution
//!
//! Each job kind maps to one outbound request, or to a local inbox run when
//! the target inbox belongs to this server. Outcomes are classified for the
//! worker: peers answering 5xx or not answering at all are retried, any
//! other refusal is final.

use chrono::{Duration, Utc};
use reqwest::header::{CONTENT_TYPE, LINK};
use std::sync::Arc;
use std::time::Instant;

use super::{DeliverToActivityPub, DeliverToSalmon, DeliverToWebSub, Job, WebSubClientJob};
use crate::config::AppConfig;
use crate::data::{ASObject, Database, Entity, SigningKey, entity_type, host_of};
use crate::entity::{EntityStore, StoreOptions};
use crate::error::AppError;
use crate::federation::{
    HostPolicy, MAGIC_ENVELOPE_CONTENT_TYPE, magic_envelope, render_entry, render_feed,
    sign_request,
};
use crate::metrics::DELIVERY_DURATION_SECONDS;
use crate::pipeline::Pipeline;
use crate::websub::{is_expired, push_signature, random_token};

const ACTIVITY_JSON: &str = "application/activity+json";
const ATOM_XML: &str = "application/atom+xml";

/// Levels of nesting rendered into delivered documents.
const DELIVERY_DEPTH: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Try again after the backoff delay
    #[error("retryable failure: {0}")]
    Retry(String),
    /// Retrying cannot help; the job is dropped
    #[error("permanent failure: {0}")]
    Fatal(String),
}

impl From<AppError> for TaskError {
    fn from(error: AppError) -> Self {
        match error {
            AppError::Database(_) | AppError::HttpClient(_) | AppError::Federation(_) => {
                TaskError::Retry(error.to_string())
            }
            other => TaskError::Fatal(other.to_string()),
        }
    }
}

/// Runs decoded jobs against the network and the local pipeline.
pub struct TaskRunner {
    config: Arc<AppConfig>,
    pipeline: Arc<Pipeline>,
    http: reqwest::Client,
    policy: HostPolicy,
}

impl TaskRunner {
    pub fn new(config: Arc<AppConfig>, pipeline: Arc<Pipeline>, http: reqwest::Client) -> Self {
        let policy = HostPolicy::new(config.federation.allow_private_addresses);
        Self {
            config,
            pipeline,
            http,
            policy,
        }
    }

    pub async fn run(&self, db: &Database, job: &Job) -> Result<(), TaskError> {
        let started = Instant::now();
        let result = match job {
            Job::DeliverToActivityPub(job) => self.deliver_activitypub(db, job).await,
            Job::DeliverToSalmon(job) => self.deliver_salmon(db, job).await,
            Job::DeliverToWebSub(job) => self.deliver_websub(db, job).await,
            Job::WebSubClient(job) => self.websub_client(db, job).await,
        };
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[job.action()])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn deliver_activitypub(
        &self,
        db: &Database,
        job: &DeliverToActivityPub,
    ) -> Result<(), TaskError> {
        let Some(activity) = db.get_entity(&job.object_id).await? else {
            tracing::debug!(object = %job.object_id, "Delivered object is gone");
            return Ok(());
        };
        let document = self.render(db, &activity).await?;

        if let Some(receiver) = self.local_inbox_owner(db, &job.target_inbox).await? {
            return match self.pipeline.post_inbox(db, &receiver, document).await {
                Ok(_) => Ok(()),
                Err(e @ (AppError::Database(_) | AppError::Internal(_))) => {
                    Err(TaskError::Retry(e.to_string()))
                }
                Err(e) => {
                    tracing::warn!(inbox = %job.target_inbox, object = %job.object_id, error = %e, "Local inbox refused activity");
                    Ok(())
                }
            };
        }

        let key = self.sender_key(db, &activity).await?;
        let url = self.policy.check(&job.target_inbox).await?;
        let body = serde_json::to_vec(&document.with_context())
            .map_err(|e| TaskError::Fatal(e.to_string()))?;
        let signature = sign_request("POST", url.as_str(), Some(&body), &key)?;

        let request = signature.apply(
            self.http
                .post(url)
                .header(CONTENT_TYPE, ACTIVITY_JSON)
                .body(body),
        );
        self.send(request, &job.target_inbox).await
    }

    async fn deliver_salmon(&self, db: &Database, job: &DeliverToSalmon) -> Result<(), TaskError> {
        let Some(activity) = db.get_entity(&job.object_id).await? else {
            return Ok(());
        };
        let key = self.sender_key(db, &activity).await?;
        let document = self.render(db, &activity).await?;

        let envelope = magic_envelope(&render_entry(&document, true), &key)?;
        let url = self.policy.check(&job.salmon_url).await?;
        let request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, MAGIC_ENVELOPE_CONTENT_TYPE)
            .body(envelope);
        self.send(request, &job.salmon_url).await
    }

    async fn deliver_websub(&self, db: &Database, job: &DeliverToWebSub) -> Result<(), TaskError> {
        let Some(subscription) = db.get_websub_subscription(job.subscription).await? else {
            tracing::debug!(subscription = job.subscription, "Subscription is gone");
            return Ok(());
        };
        if is_expired(subscription.expiry) {
            tracing::debug!(subscription = job.subscription, "Subscription expired");
            return Ok(());
        }
        let Some(activity) = db.get_entity(&job.object_id).await? else {
            return Ok(());
        };

        let document = self.render(db, &activity).await?;
        let feed = render_feed(&job.source_user_id, &job.source_user_id, &document);
        let hub = format!("{}/websub/hub", self.config.server.base_url());

        let mut request = self
            .http
            .post(&subscription.callback)
            .header(CONTENT_TYPE, ATOM_XML)
            .header(
                LINK,
                format!(
                    "<{}>; rel=\"hub\", <{}>; rel=\"self\"",
                    hub, job.source_user_id
                ),
            );
        if let Some(secret) = &subscription.secret {
            request = request.header("X-Hub-Signature", push_signature(secret, feed.as_bytes()));
        }
        self.send(request.body(feed), &subscription.callback).await
    }

    async fn websub_client(&self, db: &Database, job: &WebSubClientJob) -> Result<(), TaskError> {
        let hub_form = |mode: &str, client_id: i64, topic: &str| {
            vec![
                ("hub.mode".to_string(), mode.to_string()),
                ("hub.topic".to_string(), topic.to_string()),
                (
                    "hub.callback".to_string(),
                    format!("{}/websub/callback/{}", self.config.server.base_url(), client_id),
                ),
            ]
        };

        if job.unsubscribe {
            let Some(client) = db.find_websub_client(&job.actor_id, &job.to_follow_id).await? else {
                return Ok(());
            };
            let url = self.policy.check(&client.hub).await?;
            let form = hub_form("unsubscribe", client.id, &client.topic);
            return self.send(self.http.post(url).form(&form), &client.hub).await;
        }

        let chain = self.pipeline.stores().build(
            db,
            StoreOptions {
                viewer: None,
                signer: Some(job.actor_id.clone()),
            },
        );
        let followee = chain
            .staging
            .get_entity(&job.to_follow_id, true)
            .await?
            .ok_or_else(|| TaskError::Retry(format!("{} is unreachable", job.to_follow_id)))?;
        let hub = followee
            .data
            .first_id("_:hubUrl")
            .ok_or_else(|| TaskError::Fatal(format!("{} has no hub", followee.id)))?;
        let topic = followee
            .data
            .first_id("_:atomRetrieveUrl")
            .unwrap_or_else(|| followee.id.clone());

        let secret = random_token();
        // Pending until the hub verifies; the callback extends the expiry.
        let client = db
            .upsert_websub_client(&job.actor_id, &followee.id, &hub, &topic, &secret, Utc::now())
            .await?;

        let url = self.policy.check(&hub).await?;
        let mut form = hub_form("subscribe", client.id, &topic);
        form.push(("hub.secret".to_string(), secret));
        form.push((
            "hub.lease_seconds".to_string(),
            Duration::days(10).num_seconds().to_string(),
        ));
        self.send(self.http.post(url).form(&form), &hub).await
    }

    /// The actor whose inbox `inbox` is, when the inbox is ours.
    async fn local_inbox_owner(
        &self,
        db: &Database,
        inbox: &str,
    ) -> Result<Option<String>, AppError> {
        if host_of(inbox) != host_of(&self.config.server.base_url()) {
            return Ok(None);
        }
        Ok(db
            .get_entity(inbox)
            .await?
            .filter(|entity| entity.is_owner && entity.entity_type == entity_type::INBOX)
            .and_then(|entity| entity.data.first_id("attributedTo")))
    }

    async fn sender_key(&self, db: &Database, activity: &Entity) -> Result<SigningKey, TaskError> {
        let sender = activity
            .data
            .first_id("actor")
            .ok_or_else(|| TaskError::Fatal(format!("{} has no actor", activity.id)))?;
        db.get_signing_key(&sender)
            .await?
            .ok_or_else(|| TaskError::Fatal(format!("No signing key for {}", sender)))
    }

    /// The delivered form of a stored activity, without blind recipients.
    async fn render(&self, db: &Database, activity: &Entity) -> Result<ASObject, AppError> {
        let chain = self.pipeline.stores().build(db, StoreOptions::default());
        self.pipeline
            .stores()
            .flattener()
            .unflatten(chain.staging.as_ref(), activity, DELIVERY_DEPTH, false)
            .await
    }

    async fn send(&self, request: reqwest::RequestBuilder, target: &str) -> Result<(), TaskError> {
        let timeout = std::time::Duration::from_secs(self.config.queue.delivery_timeout_seconds);
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TaskError::Retry(format!("{}: {}", target, e)))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(target, status = status.as_u16(), "Delivered");
            Ok(())
        } else if status.is_server_error() {
            Err(TaskError::Retry(format!("{} answered {}", target, status)))
        } else {
            tracing::warn!(target, status = status.as_u16(), "Peer refused delivery");
            Ok(())
        }
    }
}
