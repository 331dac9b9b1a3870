//! Data models
//!
//! Rust structs representing stored entities, collection rows and queue jobs.
//! IDs minted by this server use ULIDs; timestamps are chrono UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::object::ASObject;
use crate::error::AppError;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Entity
// =============================================================================

/// Type tags stored alongside entity documents.
///
/// Tags beginning with `_` mark collections the server maintains itself;
/// their contents live in `collection_items`, not in the document.
pub mod entity_type {
    pub const INBOX: &str = "_inbox";
    pub const OUTBOX: &str = "_outbox";
    pub const FOLLOWING: &str = "_following";
    pub const FOLLOWERS: &str = "_followers";
    pub const LIKED: &str = "_liked";
    pub const LIKES: &str = "_likes";
    pub const SHARES: &str = "_shares";
    pub const REPLIES: &str = "_replies";
    pub const BLOCKS: &str = "_blocks";
    pub const BLOCKED: &str = "_blocked";
    /// Collections created by clients (targets of `Add`/`Remove`)
    pub const COLLECTION: &str = "_collection";
    /// Href-only placeholder left behind by legacy ingestion
    pub const LAZY_LOAD: &str = "_:LazyLoad";
    pub const UNKNOWN: &str = "Unknown";
}

/// A stored, addressable document.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub data: ASObject,
    pub entity_type: String,
    /// This server is authoritative for the document
    pub is_owner: bool,
    /// Last time the document was written or refetched
    pub updated: DateTime<Utc>,
}

impl Entity {
    /// Build an entity from a document, taking the type tag from its first `type`.
    pub fn new(id: impl Into<String>, data: ASObject, is_owner: bool) -> Self {
        let entity_type = data
            .first_type()
            .unwrap_or(entity_type::UNKNOWN)
            .to_string();
        Self {
            id: id.into(),
            data,
            entity_type,
            is_owner,
            updated: Utc::now(),
        }
    }

    pub fn with_type(mut self, entity_type: &str) -> Self {
        self.entity_type = entity_type.to_string();
        self
    }

    /// A server-maintained collection (`_inbox`, `_followers`, ...).
    pub fn is_internal_collection(&self) -> bool {
        self.entity_type.starts_with('_') && self.entity_type != entity_type::LAZY_LOAD
    }

    pub fn is_lazy_load(&self) -> bool {
        self.entity_type == entity_type::LAZY_LOAD
    }

    pub fn is_actor(&self) -> bool {
        self.data.is_actor()
    }
}

/// Raw `entities` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntityRow {
    pub id: String,
    pub data: String,
    pub entity_type: String,
    pub is_owner: bool,
    pub updated: DateTime<Utc>,
}

impl TryFrom<EntityRow> for Entity {
    type Error = AppError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        let value: serde_json::Value = serde_json::from_str(&row.data)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt entity {}: {}", row.id, e)))?;
        let data = ASObject::from_value(value).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("entity {} is not an object", row.id))
        })?;

        Ok(Self {
            id: row.id,
            data,
            entity_type: row.entity_type,
            is_owner: row.is_owner,
            updated: row.updated,
        })
    }
}

// =============================================================================
// Collections
// =============================================================================

/// One membership row of a server-maintained collection.
///
/// Keys are assigned in insertion order and double as page cursors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollectionItem {
    pub collection_item_id: i64,
    pub collection_id: String,
    pub element_id: String,
    /// Computed once from the element's audience when inserted
    pub is_public: bool,
}

// =============================================================================
// Event queue
// =============================================================================

/// A durable background job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventQueueItem {
    pub id: i64,
    pub action: String,
    pub data: String,
    pub added: DateTime<Utc>,
    pub next_attempt: DateTime<Utc>,
    pub attempt_count: i64,
}

impl EventQueueItem {
    /// Key identifying one execution attempt of this job.
    pub fn claim_key(&self) -> String {
        format!("{}:{}", self.id, self.next_attempt.timestamp_millis())
    }
}

// =============================================================================
// Actor support
// =============================================================================

/// RSA key pair of an owned actor.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SigningKey {
    pub entity_id: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl SigningKey {
    /// The `keyId` advertised for this key.
    pub fn key_id(&self) -> String {
        format!("{}#key", self.entity_id)
    }
}

/// Authenticated caller resolved from a bearer token.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccessToken {
    pub user_id: String,
    /// Actor the token acts as when reading collections
    pub actor_id: Option<String>,
}

// =============================================================================
// WebSub
// =============================================================================

/// A verified subscriber of one of our actors' feeds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebSubSubscription {
    pub id: i64,
    /// Local actor whose feed is subscribed to
    pub user_id: String,
    pub callback: String,
    pub secret: Option<String>,
    pub expiry: DateTime<Utc>,
}

/// Our subscription to a legacy actor's hub.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebSubClient {
    pub id: i64,
    /// Local actor that follows
    pub for_user: String,
    /// Remote actor being followed
    pub target_user: String,
    pub hub: String,
    pub topic: String,
    pub secret: String,
    pub expiry: DateTime<Utc>,
}
