//! Durable layer of the store chain

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::EntityStore;
use crate::data::{Database, Entity};
use crate::error::AppError;

/// Reads and writes the `entities` table.
///
/// Cached copies of remote documents expire after `remote_ttl`; an expired
/// copy reads as missing so the layer above refetches it.
pub struct DatabaseStore {
    db: Database,
    remote_ttl: Duration,
}

impl DatabaseStore {
    pub fn new(db: Database, remote_ttl: Duration) -> Self {
        Self { db, remote_ttl }
    }
}

#[async_trait]
impl EntityStore for DatabaseStore {
    async fn get_entity(&self, id: &str, _allow_remote: bool) -> Result<Option<Entity>, AppError> {
        let Some(entity) = self.db.get_entity(id).await? else {
            return Ok(None);
        };

        if !entity.is_owner && Utc::now() - entity.updated > self.remote_ttl {
            tracing::debug!(id, updated = %entity.updated, "Cached remote entity is stale");
            return Ok(None);
        }

        Ok(Some(entity))
    }

    async fn store_entity(&self, mut entity: Entity) -> Result<Entity, AppError> {
        entity.updated = Utc::now();
        self.db.upsert_entity(&entity).await?;
        Ok(entity)
    }
}
