//! Synthesized views of server-maintained collections
//!
//! `GET {collection}` yields a roll-up; `GET {collection}?from_id=K` yields
//! the page of visible items with key `<= K`. The `next` link of a page is
//! the oldest key it returned minus one, so every page a reader walks is
//! full until the collection runs out.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{EntityStore, SharedStore};
use crate::collections::CollectionTools;
use crate::data::{ASObject, Entity};
use crate::error::AppError;

const PAGE_QUERY: &str = "?from_id=";

/// Split `{collection}?from_id=K` into the collection id and `K`.
pub fn split_page_id(id: &str) -> Option<(&str, i64)> {
    let (base, key) = id.split_once(PAGE_QUERY)?;
    let key = key.parse::<i64>().ok()?;
    Some((base, key))
}

pub fn page_id(collection_id: &str, from_key: i64) -> String {
    format!("{}{}{}", collection_id, PAGE_QUERY, from_key)
}

/// Intercepts reads of internal collections.
pub struct CollectionStore {
    next: SharedStore,
    tools: CollectionTools,
    page_size: usize,
    viewer: Option<String>,
}

impl CollectionStore {
    pub fn new(
        next: SharedStore,
        tools: CollectionTools,
        page_size: usize,
        viewer: Option<String>,
    ) -> Self {
        Self {
            next,
            tools,
            page_size,
            viewer,
        }
    }

    async fn roll_up(&self, collection: Entity) -> Result<Entity, AppError> {
        let total = self.tools.count(&collection).await?;
        let newest = self
            .tools
            .get_items(&collection, i64::MAX, 1, self.viewer.as_deref())
            .await?
            .first()
            .map(|item| item.collection_item_id)
            .unwrap_or(0);

        let mut data = collection.data.clone();
        if !data.is_collection() {
            data.set_str("type", "OrderedCollection");
        }
        data.set("totalItems", json!(total));
        let first = page_id(&collection.id, newest);
        data.set_str("first", &first);
        data.set_str("current", &first);

        Ok(Entity { data, ..collection })
    }

    async fn page(&self, collection: &Entity, from_key: i64) -> Result<Entity, AppError> {
        let limit = self.page_size as i64;
        // `from_id` is inclusive: `first` names the newest key and `next` the
        // oldest returned key minus one, so both must land on their own row.
        // `get_items` takes an exclusive bound, hence the `+ 1`. One extra
        // row tells whether another page exists.
        let mut items = self
            .tools
            .get_items(
                collection,
                from_key.saturating_add(1),
                limit + 1,
                self.viewer.as_deref(),
            )
            .await?;
        let has_more = items.len() as i64 > limit;
        items.truncate(self.page_size);

        let id = page_id(&collection.id, from_key);
        let mut data = ASObject::new();
        data.set_id(&id);
        data.set_str("type", "OrderedCollectionPage");
        data.set_str("partOf", &collection.id);
        if let Some(owner) = collection.data.first_id("attributedTo") {
            data.set_str("attributedTo", &owner);
        }
        if has_more {
            if let Some(oldest) = items.last() {
                data.set_str("next", &page_id(&collection.id, oldest.collection_item_id - 1));
            }
        }
        data.set(
            "orderedItems",
            Value::Array(
                items
                    .into_iter()
                    .map(|item| Value::String(item.element_id))
                    .collect(),
            ),
        );

        Ok(Entity::new(id, data, collection.is_owner))
    }
}

#[async_trait]
impl EntityStore for CollectionStore {
    async fn get_entity(&self, id: &str, allow_remote: bool) -> Result<Option<Entity>, AppError> {
        if let Some((base, from_key)) = split_page_id(id) {
            if let Some(collection) = self.next.get_entity(base, false).await? {
                if collection.is_internal_collection() {
                    return Ok(Some(self.page(&collection, from_key).await?));
                }
            }
            return self.next.get_entity(id, allow_remote).await;
        }

        match self.next.get_entity(id, allow_remote).await? {
            Some(collection) if collection.is_internal_collection() => {
                Ok(Some(self.roll_up(collection).await?))
            }
            other => Ok(other),
        }
    }

    async fn store_entity(&self, mut entity: Entity) -> Result<Entity, AppError> {
        if entity.is_internal_collection() {
            // Synthesized fields never reach storage.
            for predicate in ["totalItems", "first", "current", "items", "orderedItems"] {
                entity.data.remove(predicate);
            }
        }
        self.next.store_entity(entity).await
    }

    async fn commit_changes(&self) -> Result<(), AppError> {
        self.next.commit_changes().await
    }
}
