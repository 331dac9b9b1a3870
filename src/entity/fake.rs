//! Derived sub-resources of owned actors

use async_trait::async_trait;
use serde_json::json;

use super::{EntityStore, SharedStore};
use crate::data::{ASObject, Database, Entity};
use crate::error::AppError;

const KEY_FRAGMENT: &str = "key";
const ENDPOINTS_FRAGMENT: &str = "endpoints";

/// Synthesizes `{actor}#key` and `{actor}#endpoints` on demand.
///
/// Neither document is ever stored; they are rebuilt from the signing key
/// table and the server base URL on every read.
pub struct FakeStore {
    next: SharedStore,
    db: Database,
    base_url: String,
}

impl FakeStore {
    pub fn new(next: SharedStore, db: Database, base_url: String) -> Self {
        Self { next, db, base_url }
    }

    async fn synthesize(&self, actor_id: &str, fragment: &str) -> Result<Option<Entity>, AppError> {
        let Some(actor) = self.next.get_entity(actor_id, false).await? else {
            return Ok(None);
        };
        if !actor.is_owner || !actor.is_actor() {
            return Ok(None);
        }

        let id = format!("{}#{}", actor_id, fragment);
        let doc = match fragment {
            KEY_FRAGMENT => {
                let Some(key) = self.db.get_signing_key(actor_id).await? else {
                    return Ok(None);
                };
                json!({
                    "id": id,
                    "type": "Key",
                    "owner": actor_id,
                    "publicKeyPem": key.public_key_pem,
                })
            }
            ENDPOINTS_FRAGMENT => json!({
                "id": id,
                "sharedInbox": format!("{}/inbox", self.base_url),
            }),
            _ => return Ok(None),
        };

        let data = ASObject::from_value(doc)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("synthesized document")))?;
        Ok(Some(Entity::new(id, data, true)))
    }
}

#[async_trait]
impl EntityStore for FakeStore {
    async fn get_entity(&self, id: &str, allow_remote: bool) -> Result<Option<Entity>, AppError> {
        if let Some((actor_id, fragment)) = id.split_once('#') {
            if matches!(fragment, KEY_FRAGMENT | ENDPOINTS_FRAGMENT) {
                if let Some(entity) = self.synthesize(actor_id, fragment).await? {
                    return Ok(Some(entity));
                }
            }
        }

        self.next.get_entity(id, allow_remote).await
    }

    async fn store_entity(&self, entity: Entity) -> Result<Entity, AppError> {
        self.next.store_entity(entity).await
    }

    async fn commit_changes(&self) -> Result<(), AppError> {
        self.next.commit_changes().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SigningKey;
    use crate::entity::DatabaseStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn fake_store() -> (FakeStore, Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"), 4)
            .await
            .unwrap();
        let next = Arc::new(DatabaseStore::new(db.clone(), chrono::Duration::days(7)));
        (
            FakeStore::new(next, db.clone(), "https://local.example".to_string()),
            db,
            temp_dir,
        )
    }

    async fn seed_actor(db: &Database, id: &str, is_owner: bool) {
        let doc = ASObject::from_value(json!({"id": id, "type": "Person"})).unwrap();
        db.upsert_entity(&Entity::new(id, doc, is_owner)).await.unwrap();
        db.insert_signing_key(&SigningKey {
            entity_id: id.to_string(),
            private_key_pem: "PRIVATE".to_string(),
            public_key_pem: "PUBLIC".to_string(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn owned_actor_key_is_synthesized() {
        let (store, db, _dir) = fake_store().await;
        seed_actor(&db, "https://local.example/users/a", true).await;

        let key = store
            .get_entity("https://local.example/users/a#key", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.data.first_str("owner"), Some("https://local.example/users/a"));
        assert_eq!(key.data.first_str("publicKeyPem"), Some("PUBLIC"));

        let endpoints = store
            .get_entity("https://local.example/users/a#endpoints", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            endpoints.data.first_str("sharedInbox"),
            Some("https://local.example/inbox")
        );
    }

    #[tokio::test]
    async fn remote_actor_fragments_pass_through() {
        let (store, db, _dir) = fake_store().await;
        seed_actor(&db, "https://remote.example/users/b", false).await;

        assert!(
            store
                .get_entity("https://remote.example/users/b#key", false)
                .await
                .unwrap()
                .is_none()
        );
    }
}
