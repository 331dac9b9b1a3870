//! Request-scoped write buffer

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{EntityStore, SharedStore};
use crate::data::Entity;
use crate::error::AppError;

#[derive(Default)]
struct Overlay {
    entities: HashMap<String, Entity>,
    /// Ids written since the last commit, in write order
    dirty: Vec<String>,
}

/// Read-through cache and write buffer over the rest of the chain.
///
/// Writes stay invisible to every other request until
/// [`commit_changes`](EntityStore::commit_changes) flushes them to the next
/// layer. Reads served from below are cached but never flushed.
pub struct StagingStore {
    next: SharedStore,
    overlay: Mutex<Overlay>,
}

impl StagingStore {
    pub fn new(next: SharedStore) -> Self {
        Self {
            next,
            overlay: Mutex::new(Overlay::default()),
        }
    }

    /// The layer below the overlay.
    pub fn next(&self) -> SharedStore {
        self.next.clone()
    }

    /// Number of writes waiting for commit.
    pub fn pending(&self) -> usize {
        self.overlay.lock().map(|o| o.dirty.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Overlay>, AppError> {
        self.overlay
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("staging overlay poisoned")))
    }
}

#[async_trait]
impl EntityStore for StagingStore {
    async fn get_entity(&self, id: &str, allow_remote: bool) -> Result<Option<Entity>, AppError> {
        if let Some(entity) = self.lock()?.entities.get(id) {
            return Ok(Some(entity.clone()));
        }

        let found = self.next.get_entity(id, allow_remote).await?;
        // A layer below may answer with a different entity (a lazy-load
        // target, a document behind a fragment); only cache exact hits.
        if let Some(entity) = found.as_ref().filter(|entity| entity.id == id) {
            self.lock()?
                .entities
                .entry(id.to_string())
                .or_insert_with(|| entity.clone());
        }
        Ok(found)
    }

    async fn store_entity(&self, entity: Entity) -> Result<Entity, AppError> {
        let mut overlay = self.lock()?;
        if !overlay.dirty.contains(&entity.id) {
            overlay.dirty.push(entity.id.clone());
        }
        overlay.entities.insert(entity.id.clone(), entity.clone());
        Ok(entity)
    }

    async fn commit_changes(&self) -> Result<(), AppError> {
        let pending: Vec<Entity> = {
            let mut overlay = self.lock()?;
            let dirty = std::mem::take(&mut overlay.dirty);
            let pending = dirty
                .iter()
                .filter_map(|id| overlay.entities.get(id).cloned())
                .collect();
            overlay.entities.clear();
            pending
        };

        tracing::debug!(count = pending.len(), "Committing staged entities");
        for entity in pending {
            self.next.store_entity(entity).await?;
        }
        self.next.commit_changes().await
    }
}
