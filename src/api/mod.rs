//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (entities, inboxes, outboxes, actor creation)
//! - WebSub hub and subscription callbacks
//! - Metrics (Prometheus)

mod activitypub;
mod auth;
pub mod metrics;
mod websub;

pub use activitypub::{ACTIVITY_JSON, activitypub_router, entity_fallback};
pub use auth::{CurrentUser, MaybeUser};
pub use metrics::{metrics_router, track_requests};
pub use websub::websub_router;
