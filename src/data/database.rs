//! SQLite database operations
//!
//! All database access goes through this module.
//!
//! A `Database` is either pool-backed or bound to one open `BEGIN IMMEDIATE`
//! transaction. Cloning a transactional handle shares the transaction, so
//! every store layer of one pipeline run writes through the same connection.

use chrono::{DateTime, Duration, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

use super::models::*;
use super::object::AUDIENCE;
use crate::error::AppError;

/// Which collection rows a reader may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFilter<'a> {
    /// Every row (collection owner)
    All,
    /// Public rows only (anonymous reader)
    Public,
    /// Public rows plus rows whose element addresses the viewer
    Viewer(&'a str),
}

/// Hash a bearer token for storage and lookup.
pub fn hash_access_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("sha256:{}", URL_SAFE_NO_PAD.encode(digest))
}

/// Connection held by an open transaction.
///
/// A transaction dropped without commit or rollback detaches its connection
/// so the pool never hands out a connection stuck inside `BEGIN`.
struct TxSlot {
    conn: Option<PoolConnection<Sqlite>>,
}

impl Drop for TxSlot {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!("Transaction dropped without commit; discarding connection");
            drop(conn.detach());
        }
    }
}

/// A borrowed connection: pooled, or the one owned by the current transaction.
struct Conn<'a> {
    inner: ConnInner<'a>,
}

enum ConnInner<'a> {
    Pooled(PoolConnection<Sqlite>),
    /// The open transaction's connection, borrowed under the slot lock
    Transaction(MappedMutexGuard<'a, PoolConnection<Sqlite>>),
}

impl Deref for Conn<'_> {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        match &self.inner {
            ConnInner::Pooled(conn) => &**conn,
            ConnInner::Transaction(conn) => &***conn,
        }
    }
}

impl DerefMut for Conn<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.inner {
            ConnInner::Pooled(conn) => &mut **conn,
            ConnInner::Transaction(conn) => &mut ***conn,
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    tx: Option<Arc<Mutex<TxSlot>>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("transactional", &self.tx.is_some())
            .finish()
    }
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path, max_connections: u32) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(2))
            .connect_with(options)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool, tx: None })
    }

    /// True when this handle is bound to an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Open a write transaction.
    ///
    /// The returned handle (and its clones) run every query inside it until
    /// [`commit`](Self::commit) or [`rollback`](Self::rollback). Calling
    /// `begin` on a transactional handle joins the open transaction.
    pub async fn begin(&self) -> Result<Database, AppError> {
        if self.tx.is_some() {
            return Ok(self.clone());
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        Ok(Self {
            pool: self.pool.clone(),
            tx: Some(Arc::new(Mutex::new(TxSlot { conn: Some(conn) }))),
        })
    }

    /// Commit the open transaction. No-op for pool-backed handles.
    pub async fn commit(&self) -> Result<(), AppError> {
        self.finish("COMMIT").await
    }

    /// Roll back the open transaction. No-op for pool-backed handles.
    pub async fn rollback(&self) -> Result<(), AppError> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&self, statement: &str) -> Result<(), AppError> {
        let Some(slot) = &self.tx else {
            return Ok(());
        };
        let mut slot = slot.lock().await;
        let Some(mut conn) = slot.conn.take() else {
            return Ok(());
        };

        if let Err(error) = sqlx::query(statement).execute(&mut *conn).await {
            // Leave no half-finished transaction on a pooled connection.
            drop(conn.detach());
            return Err(error.into());
        }
        Ok(())
    }

    async fn conn(&self) -> Result<Conn<'_>, AppError> {
        match &self.tx {
            None => Ok(Conn {
                inner: ConnInner::Pooled(self.pool.acquire().await?),
            }),
            Some(slot) => {
                let conn = MutexGuard::try_map(slot.lock().await, |slot| slot.conn.as_mut())
                    .map_err(|_| {
                        AppError::Internal(anyhow::anyhow!("transaction already finished"))
                    })?;
                Ok(Conn {
                    inner: ConnInner::Transaction(conn),
                })
            }
        }
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// Get a stored entity by id
    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>, AppError> {
        let mut conn = self.conn().await?;
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT id, data, entity_type, is_owner, updated FROM entities WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(Entity::try_from).transpose()
    }

    /// Insert or replace an entity
    pub async fn upsert_entity(&self, entity: &Entity) -> Result<(), AppError> {
        let data = serde_json::to_string(&entity.data)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize entity: {}", e)))?;

        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO entities (id, data, entity_type, is_owner, updated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                entity_type = excluded.entity_type,
                is_owner = excluded.is_owner,
                updated = excluded.updated
            "#,
        )
        .bind(&entity.id)
        .bind(&data)
        .bind(&entity.entity_type)
        .bind(entity.is_owner)
        .bind(entity.updated)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Collection items
    // =========================================================================

    /// Append an element to a collection, returning the new row
    pub async fn insert_collection_item(
        &self,
        collection_id: &str,
        element_id: &str,
        is_public: bool,
    ) -> Result<CollectionItem, AppError> {
        let mut conn = self.conn().await?;
        let result = sqlx::query(
            "INSERT INTO collection_items (collection_id, element_id, is_public) VALUES (?, ?, ?)",
        )
        .bind(collection_id)
        .bind(element_id)
        .bind(is_public)
        .execute(&mut *conn)
        .await?;

        Ok(CollectionItem {
            collection_item_id: result.last_insert_rowid(),
            collection_id: collection_id.to_string(),
            element_id: element_id.to_string(),
            is_public,
        })
    }

    /// Remove every row linking an element to a collection
    pub async fn delete_collection_item(
        &self,
        collection_id: &str,
        element_id: &str,
    ) -> Result<bool, AppError> {
        let mut conn = self.conn().await?;
        let result =
            sqlx::query("DELETE FROM collection_items WHERE collection_id = ? AND element_id = ?")
                .bind(collection_id)
                .bind(element_id)
                .execute(&mut *conn)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// The row linking an element to a collection, if any
    pub async fn find_collection_item(
        &self,
        collection_id: &str,
        element_id: &str,
    ) -> Result<Option<CollectionItem>, AppError> {
        let mut conn = self.conn().await?;
        let item = sqlx::query_as::<_, CollectionItem>(
            r#"
            SELECT collection_item_id, collection_id, element_id, is_public
            FROM collection_items
            WHERE collection_id = ? AND element_id = ?
            ORDER BY collection_item_id DESC
            LIMIT 1
            "#,
        )
        .bind(collection_id)
        .bind(element_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(item)
    }

    pub async fn count_collection_items(&self, collection_id: &str) -> Result<i64, AppError> {
        let mut conn = self.conn().await?;
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM collection_items WHERE collection_id = ?")
                .bind(collection_id)
                .fetch_one(&mut *conn)
                .await?;

        Ok(count)
    }

    /// Newest-first page of rows with key strictly below `before_key`
    ///
    /// Visibility is evaluated against the stored element document: a viewer
    /// sees a non-public row when it is the element itself or appears in one
    /// of the element's audience predicates.
    pub async fn get_collection_items(
        &self,
        collection_id: &str,
        before_key: i64,
        count: i64,
        filter: ItemFilter<'_>,
    ) -> Result<Vec<CollectionItem>, AppError> {
        let mut query = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT ci.collection_item_id, ci.collection_id, ci.element_id, ci.is_public
            FROM collection_items ci
            LEFT JOIN entities e ON e.id = ci.element_id
            WHERE ci.collection_id = "#,
        );
        query.push_bind(collection_id);
        query.push(" AND ci.collection_item_id < ");
        query.push_bind(before_key);

        match filter {
            ItemFilter::All => {}
            ItemFilter::Public => {
                query.push(" AND ci.is_public = 1");
            }
            ItemFilter::Viewer(viewer) => {
                query.push(" AND (ci.is_public = 1 OR ci.element_id = ");
                query.push_bind(viewer.to_string());
                for predicate in AUDIENCE {
                    query.push(format!(
                        " OR EXISTS (SELECT 1 FROM json_each(e.data, '$.{predicate}') j WHERE j.value = "
                    ));
                    query.push_bind(viewer.to_string());
                    query.push(")");
                }
                query.push(")");
            }
        }

        query.push(" ORDER BY ci.collection_item_id DESC LIMIT ");
        query.push_bind(count);

        let mut conn = self.conn().await?;
        let items = query
            .build_query_as::<CollectionItem>()
            .fetch_all(&mut *conn)
            .await?;

        Ok(items)
    }

    /// Every element id of a collection, newest first
    pub async fn all_collection_elements(
        &self,
        collection_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let mut conn = self.conn().await?;
        let elements = sqlx::query_scalar::<_, String>(
            "SELECT element_id FROM collection_items WHERE collection_id = ? ORDER BY collection_item_id DESC",
        )
        .bind(collection_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(elements)
    }

    /// Collections of the given type tag that contain an element
    pub async fn collections_containing(
        &self,
        element_id: &str,
        entity_type: &str,
    ) -> Result<Vec<String>, AppError> {
        let mut conn = self.conn().await?;
        let collections = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT ci.collection_id
            FROM collection_items ci
            JOIN entities e ON e.id = ci.collection_id
            WHERE ci.element_id = ? AND e.entity_type = ?
            "#,
        )
        .bind(element_id)
        .bind(entity_type)
        .fetch_all(&mut *conn)
        .await?;

        Ok(collections)
    }

    // =========================================================================
    // Event queue
    // =========================================================================

    /// Append a job, returning its id
    pub async fn enqueue_event(
        &self,
        action: &str,
        data: &str,
        next_attempt: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let mut conn = self.conn().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO event_queue (action, data, added, next_attempt, attempt_count)
            VALUES (?, ?, ?, ?, 0)
            "#,
        )
        .bind(action)
        .bind(data)
        .bind(Utc::now())
        .bind(next_attempt)
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Jobs due at `now`, oldest first
    pub async fn due_events(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventQueueItem>, AppError> {
        let mut conn = self.conn().await?;
        let events = sqlx::query_as::<_, EventQueueItem>(
            r#"
            SELECT id, action, data, added, next_attempt, attempt_count
            FROM event_queue
            WHERE next_attempt <= ?
            ORDER BY next_attempt ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        Ok(events)
    }

    /// Earliest scheduled attempt of any job
    pub async fn next_event_time(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        let mut conn = self.conn().await?;
        let next = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT next_attempt FROM event_queue ORDER BY next_attempt ASC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await?;

        Ok(next)
    }

    pub async fn get_event(&self, id: i64) -> Result<Option<EventQueueItem>, AppError> {
        let mut conn = self.conn().await?;
        let event = sqlx::query_as::<_, EventQueueItem>(
            "SELECT id, action, data, added, next_attempt, attempt_count FROM event_queue WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(event)
    }

    pub async fn delete_event(&self, id: i64) -> Result<(), AppError> {
        let mut conn = self.conn().await?;
        sqlx::query("DELETE FROM event_queue WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// Record a failed attempt
    ///
    /// Only applies when the row still carries `previous_attempt_count`, so a
    /// failure is never counted twice.
    pub async fn reschedule_event(
        &self,
        id: i64,
        previous_attempt_count: i64,
        next_attempt: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut conn = self.conn().await?;
        let result = sqlx::query(
            r#"
            UPDATE event_queue
            SET attempt_count = attempt_count + 1, next_attempt = ?
            WHERE id = ? AND attempt_count = ?
            "#,
        )
        .bind(next_attempt)
        .bind(id)
        .bind(previous_attempt_count)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Job claims
    // =========================================================================

    /// Atomically bump the claim counter for `key`
    ///
    /// An expired claim restarts at 1. Returns the counter after the bump;
    /// the caller that observes 1 owns the claim until it expires.
    pub async fn increment_claim(&self, key: &str, ttl: Duration) -> Result<i64, AppError> {
        let now = Utc::now();
        let mut conn = self.conn().await?;
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_claims (claim_key, claim_count, expires_at)
            VALUES (?, 1, ?)
            ON CONFLICT(claim_key) DO UPDATE SET
                claim_count = CASE
                    WHEN job_claims.expires_at <= ? THEN 1
                    ELSE job_claims.claim_count + 1
                END,
                expires_at = CASE
                    WHEN job_claims.expires_at <= ? THEN excluded.expires_at
                    ELSE job_claims.expires_at
                END
            RETURNING claim_count
            "#,
        )
        .bind(key)
        .bind(now + ttl)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        Ok(count)
    }

    /// Drop claims that can no longer block anyone
    pub async fn prune_expired_claims(&self) -> Result<u64, AppError> {
        let mut conn = self.conn().await?;
        let result = sqlx::query("DELETE FROM job_claims WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Signing keys
    // =========================================================================

    pub async fn insert_signing_key(&self, key: &SigningKey) -> Result<(), AppError> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO signing_keys (entity_id, private_key_pem, public_key_pem)
            VALUES (?, ?, ?)
            ON CONFLICT(entity_id) DO UPDATE SET
                private_key_pem = excluded.private_key_pem,
                public_key_pem = excluded.public_key_pem
            "#,
        )
        .bind(&key.entity_id)
        .bind(&key.private_key_pem)
        .bind(&key.public_key_pem)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn get_signing_key(&self, entity_id: &str) -> Result<Option<SigningKey>, AppError> {
        let mut conn = self.conn().await?;
        let key = sqlx::query_as::<_, SigningKey>(
            "SELECT entity_id, private_key_pem, public_key_pem FROM signing_keys WHERE entity_id = ?",
        )
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(key)
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub async fn grant_actor_permission(
        &self,
        user_id: &str,
        actor_id: &str,
        is_admin: bool,
    ) -> Result<(), AppError> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO actor_permissions (user_id, actor_id, is_admin) VALUES (?, ?, ?)
            ON CONFLICT(user_id, actor_id) DO UPDATE SET is_admin = excluded.is_admin
            "#,
        )
        .bind(user_id)
        .bind(actor_id)
        .bind(is_admin)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn has_actor_permission(
        &self,
        user_id: &str,
        actor_id: &str,
    ) -> Result<bool, AppError> {
        let mut conn = self.conn().await?;
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM actor_permissions WHERE user_id = ? AND actor_id = ? LIMIT 1",
        )
        .bind(user_id)
        .bind(actor_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(found.is_some())
    }

    /// Store a bearer token (hashed)
    pub async fn insert_access_token(
        &self,
        token: &str,
        user_id: &str,
        actor_id: Option<&str>,
    ) -> Result<(), AppError> {
        let mut conn = self.conn().await?;
        sqlx::query(
            "INSERT INTO access_tokens (token_hash, user_id, actor_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(hash_access_token(token))
        .bind(user_id)
        .bind(actor_id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn find_access_token(&self, token: &str) -> Result<Option<AccessToken>, AppError> {
        let mut conn = self.conn().await?;
        let found = sqlx::query_as::<_, AccessToken>(
            "SELECT user_id, actor_id FROM access_tokens WHERE token_hash = ?",
        )
        .bind(hash_access_token(token))
        .fetch_optional(&mut *conn)
        .await?;

        Ok(found)
    }

    // =========================================================================
    // WebSub
    // =========================================================================

    /// Create or refresh a subscription to a local actor's feed
    pub async fn upsert_websub_subscription(
        &self,
        user_id: &str,
        callback: &str,
        secret: Option<&str>,
        expiry: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO websub_subscriptions (user_id, callback, secret, expiry)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, callback) DO UPDATE SET
                secret = excluded.secret,
                expiry = excluded.expiry
            "#,
        )
        .bind(user_id)
        .bind(callback)
        .bind(secret)
        .bind(expiry)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn delete_websub_subscription(
        &self,
        user_id: &str,
        callback: &str,
    ) -> Result<bool, AppError> {
        let mut conn = self.conn().await?;
        let result =
            sqlx::query("DELETE FROM websub_subscriptions WHERE user_id = ? AND callback = ?")
                .bind(user_id)
                .bind(callback)
                .execute(&mut *conn)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_websub_subscription(
        &self,
        id: i64,
    ) -> Result<Option<WebSubSubscription>, AppError> {
        let mut conn = self.conn().await?;
        let subscription = sqlx::query_as::<_, WebSubSubscription>(
            "SELECT id, user_id, callback, secret, expiry FROM websub_subscriptions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(subscription)
    }

    /// Unexpired subscribers of a local actor
    pub async fn active_websub_subscriptions(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebSubSubscription>, AppError> {
        let mut conn = self.conn().await?;
        let subscriptions = sqlx::query_as::<_, WebSubSubscription>(
            r#"
            SELECT id, user_id, callback, secret, expiry
            FROM websub_subscriptions
            WHERE user_id = ? AND expiry > ?
            ORDER BY id
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&mut *conn)
        .await?;

        Ok(subscriptions)
    }

    /// Create or refresh our subscription to a remote hub
    pub async fn upsert_websub_client(
        &self,
        for_user: &str,
        target_user: &str,
        hub: &str,
        topic: &str,
        secret: &str,
        expiry: DateTime<Utc>,
    ) -> Result<WebSubClient, AppError> {
        let mut conn = self.conn().await?;
        let client = sqlx::query_as::<_, WebSubClient>(
            r#"
            INSERT INTO websub_clients (for_user, target_user, hub, topic, secret, expiry)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(for_user, target_user) DO UPDATE SET
                hub = excluded.hub,
                topic = excluded.topic,
                secret = excluded.secret,
                expiry = excluded.expiry
            RETURNING id, for_user, target_user, hub, topic, secret, expiry
            "#,
        )
        .bind(for_user)
        .bind(target_user)
        .bind(hub)
        .bind(topic)
        .bind(secret)
        .bind(expiry)
        .fetch_one(&mut *conn)
        .await?;

        Ok(client)
    }

    pub async fn get_websub_client(&self, id: i64) -> Result<Option<WebSubClient>, AppError> {
        let mut conn = self.conn().await?;
        let client = sqlx::query_as::<_, WebSubClient>(
            "SELECT id, for_user, target_user, hub, topic, secret, expiry FROM websub_clients WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(client)
    }

    pub async fn find_websub_client(
        &self,
        for_user: &str,
        target_user: &str,
    ) -> Result<Option<WebSubClient>, AppError> {
        let mut conn = self.conn().await?;
        let client = sqlx::query_as::<_, WebSubClient>(
            r#"
            SELECT id, for_user, target_user, hub, topic, secret, expiry
            FROM websub_clients
            WHERE for_user = ? AND target_user = ?
            "#,
        )
        .bind(for_user)
        .bind(target_user)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(client)
    }

    pub async fn delete_websub_client(&self, id: i64) -> Result<(), AppError> {
        let mut conn = self.conn().await?;
        sqlx::query("DELETE FROM websub_clients WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }
}
