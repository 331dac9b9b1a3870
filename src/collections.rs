//! Collection membership and audience-filtered enumeration
//!
//! Server-maintained collections (inboxes, outboxes, followers, ...) keep
//! their members in `collection_items`, never in the collection document.
//! Keys grow with insertion and double as page cursors.

use crate::data::{CollectionItem, Database, Entity, ItemFilter};
use crate::entity::EntityStore;
use crate::error::AppError;

/// Membership operations over one database handle.
#[derive(Debug, Clone)]
pub struct CollectionTools {
    db: Database,
}

impl CollectionTools {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an element.
    ///
    /// `IsPublic` is decided here, once: the element is public when its
    /// audience names the public collection or when it is an actor.
    pub async fn add_to_collection(
        &self,
        store: &dyn EntityStore,
        collection_id: &str,
        element_id: &str,
    ) -> Result<CollectionItem, AppError> {
        let is_public = match store.get_entity(element_id, false).await? {
            Some(element) => element.data.is_public() || element.is_actor(),
            None => false,
        };

        let item = self
            .db
            .insert_collection_item(collection_id, element_id, is_public)
            .await?;
        tracing::debug!(
            collection = collection_id,
            element = element_id,
            key = item.collection_item_id,
            is_public,
            "Added to collection"
        );
        Ok(item)
    }

    /// Remove an element; false when it was not a member.
    pub async fn remove_from_collection(
        &self,
        collection_id: &str,
        element_id: &str,
    ) -> Result<bool, AppError> {
        self.db
            .delete_collection_item(collection_id, element_id)
            .await
    }

    pub async fn contains(&self, collection_id: &str, element_id: &str) -> Result<bool, AppError> {
        Ok(self
            .db
            .find_collection_item(collection_id, element_id)
            .await?
            .is_some())
    }

    /// Up to `count` items with key below `before_key`, newest first,
    /// limited to what `viewer` may see.
    ///
    /// The collection's `attributedTo` sees every item; other viewers see
    /// public items plus those addressed to them; anonymous readers see
    /// public items only.
    pub async fn get_items(
        &self,
        collection: &Entity,
        before_key: i64,
        count: i64,
        viewer: Option<&str>,
    ) -> Result<Vec<CollectionItem>, AppError> {
        let owner = collection.data.first_id("attributedTo");
        let filter = match viewer {
            Some(viewer) if owner.as_deref() == Some(viewer) => ItemFilter::All,
            Some(viewer) => ItemFilter::Viewer(viewer),
            None => ItemFilter::Public,
        };

        self.db
            .get_collection_items(&collection.id, before_key, count, filter)
            .await
    }

    /// Number of members.
    ///
    /// Owned collections are counted; for remote ones the last known
    /// `totalItems` is reported.
    pub async fn count(&self, collection: &Entity) -> Result<i64, AppError> {
        if collection.is_owner {
            return self.db.count_collection_items(&collection.id).await;
        }

        Ok(collection
            .data
            .first("totalItems")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0))
    }

    /// Every member, unfiltered. Used for delivery.
    pub async fn get_all(&self, collection_id: &str) -> Result<Vec<String>, AppError> {
        self.db.all_collection_elements(collection_id).await
    }

    /// Collections of type tag `entity_type` that contain `element_id`.
    pub async fn collections_containing(
        &self,
        element_id: &str,
        entity_type: &str,
    ) -> Result<Vec<String>, AppError> {
        self.db
            .collections_containing(element_id, entity_type)
            .await
    }
}
