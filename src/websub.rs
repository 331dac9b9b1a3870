//! WebSub for legacy peers
//!
//! The hub side lets remote servers subscribe to a local actor's feed; the
//! topic is the actor id. Subscriptions are persisted only after the
//! subscriber echoed our challenge. Pushes are Atom documents signed with
//! the subscriber's secret.
//!
//! The client side is the callback our own subscriptions to remote hubs
//! are verified and delivered through.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha1::Sha1;

use crate::data::{Database, WebSubClient};
use crate::error::AppError;
use crate::federation::HostPolicy;

type HmacSha1 = Hmac<Sha1>;

/// Lease granted when the subscriber does not ask for one.
pub const DEFAULT_LEASE_SECONDS: i64 = 10 * 24 * 3600;

/// Longest lease the hub grants.
pub const MAX_LEASE_SECONDS: i64 = 30 * 24 * 3600;

pub(crate) fn random_token() -> String {
    let mut bytes = [0_u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// `X-Hub-Signature` value for a push body.
pub fn push_signature(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check an `X-Hub-Signature` header against `secret`.
pub fn verify_push_signature(secret: &str, body: &[u8], header: &str) -> Result<(), AppError> {
    let hex_digest = header
        .strip_prefix("sha1=")
        .ok_or_else(|| AppError::Validation("Unsupported X-Hub-Signature".to_string()))?;
    let expected = hex::decode(hex_digest)
        .map_err(|_| AppError::Validation("Malformed X-Hub-Signature".to_string()))?;

    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| AppError::InvalidSignature)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubMode {
    Subscribe,
    Unsubscribe,
}

impl HubMode {
    fn parse(mode: &str) -> Result<Self, AppError> {
        match mode {
            "subscribe" => Ok(Self::Subscribe),
            "unsubscribe" => Ok(Self::Unsubscribe),
            other => Err(AppError::Validation(format!("Unknown hub.mode {}", other))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Form body of a hub request.
#[derive(Debug, Clone, Deserialize)]
pub struct HubRequest {
    #[serde(rename = "hub.mode")]
    pub mode: String,
    #[serde(rename = "hub.topic")]
    pub topic: String,
    #[serde(rename = "hub.callback")]
    pub callback: String,
    #[serde(rename = "hub.secret")]
    pub secret: Option<String>,
    #[serde(rename = "hub.lease_seconds")]
    pub lease_seconds: Option<i64>,
}

/// Query of a verification request sent to a callback.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationQuery {
    #[serde(rename = "hub.mode")]
    pub mode: String,
    #[serde(rename = "hub.topic")]
    pub topic: String,
    #[serde(rename = "hub.challenge")]
    pub challenge: String,
    #[serde(rename = "hub.lease_seconds")]
    pub lease_seconds: Option<i64>,
}

/// Hub for local actors' feeds.
pub struct WebSubHub {
    http: reqwest::Client,
    policy: HostPolicy,
}

impl WebSubHub {
    pub fn new(http: reqwest::Client, policy: HostPolicy) -> Self {
        Self { http, policy }
    }

    /// Handle one subscribe or unsubscribe request.
    ///
    /// The callback must echo a fresh challenge before anything is stored.
    pub async fn handle_request(&self, db: &Database, request: HubRequest) -> Result<(), AppError> {
        let mode = HubMode::parse(&request.mode)?;

        let is_local_actor = db
            .get_entity(&request.topic)
            .await?
            .is_some_and(|actor| actor.is_owner && actor.is_actor());
        if !is_local_actor {
            return Err(AppError::Validation(format!(
                "Unknown topic {}",
                request.topic
            )));
        }

        let lease = request
            .lease_seconds
            .unwrap_or(DEFAULT_LEASE_SECONDS)
            .clamp(1, MAX_LEASE_SECONDS);
        let callback = self.policy.check(&request.callback).await?;

        let challenge = random_token();
        let lease_text = lease.to_string();
        let response = self
            .http
            .get(callback)
            .query(&[
                ("hub.mode", mode.as_str()),
                ("hub.topic", request.topic.as_str()),
                ("hub.challenge", challenge.as_str()),
                ("hub.lease_seconds", lease_text.as_str()),
            ])
            .send()
            .await?;
        let confirmed = response.status().is_success() && response.text().await? == challenge;
        if !confirmed {
            tracing::warn!(callback = %request.callback, topic = %request.topic, "WebSub callback did not confirm");
            return Err(AppError::Validation(
                "Callback did not confirm the subscription".to_string(),
            ));
        }

        match mode {
            HubMode::Subscribe => {
                db.upsert_websub_subscription(
                    &request.topic,
                    &request.callback,
                    request.secret.as_deref().filter(|secret| !secret.is_empty()),
                    Utc::now() + Duration::seconds(lease),
                )
                .await?;
            }
            HubMode::Unsubscribe => {
                db.delete_websub_subscription(&request.topic, &request.callback)
                    .await?;
            }
        }

        tracing::info!(
            topic = %request.topic,
            callback = %request.callback,
            mode = mode.as_str(),
            lease,
            "WebSub subscription verified"
        );
        Ok(())
    }
}

/// Answer a hub verifying one of our subscriptions.
///
/// Returns the challenge to echo. A confirmed subscription's expiry is
/// extended by the granted lease; a confirmed unsubscription drops the row.
pub async fn confirm_client_subscription(
    db: &Database,
    client_id: i64,
    query: &VerificationQuery,
) -> Result<String, AppError> {
    let client = db
        .get_websub_client(client_id)
        .await?
        .filter(|client| client.topic == query.topic)
        .ok_or(AppError::NotFound)?;

    match HubMode::parse(&query.mode)? {
        HubMode::Subscribe => {
            let lease = query.lease_seconds.unwrap_or(DEFAULT_LEASE_SECONDS).max(1);
            db.upsert_websub_client(
                &client.for_user,
                &client.target_user,
                &client.hub,
                &client.topic,
                &client.secret,
                Utc::now() + Duration::seconds(lease),
            )
            .await?;
        }
        HubMode::Unsubscribe => db.delete_websub_client(client.id).await?,
    }

    tracing::info!(client = client.id, topic = %client.topic, mode = %query.mode, "WebSub hub verified our request");
    Ok(query.challenge.clone())
}

/// Look up the subscription a push arrived for and check its signature.
pub async fn authenticate_push(
    db: &Database,
    client_id: i64,
    body: &[u8],
    signature: Option<&str>,
) -> Result<WebSubClient, AppError> {
    let client = db
        .get_websub_client(client_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let signature = signature.ok_or(AppError::InvalidSignature)?;
    verify_push_signature(&client.secret, body, signature)?;
    Ok(client)
}

/// Whether a pending client subscription is past its lease.
pub fn is_expired(expiry: DateTime<Utc>) -> bool {
    expiry <= Utc::now()
}
