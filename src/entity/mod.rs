//! Entity store chain
//!
//! Every read and write of an addressable document goes through an
//! [`EntityStore`]. Stores are layered by delegation, outermost first:
//!
//! ```text
//! Staging -> Fake -> Collection -> Retrieving -> Database
//! ```
//!
//! - `Staging` buffers the writes of one request until committed
//! - `Fake` synthesizes `#key` and `#endpoints` of owned actors
//! - `Collection` synthesizes roll-ups and pages of internal collections
//! - `Retrieving` dereferences remote URIs and materializes them
//! - `Database` is the durable ground truth
//!
//! A chain is assembled per request by [`EntityStoreFactory`] over a
//! database handle that is usually bound to the request's transaction.

mod collection_store;
mod convert;
mod database_store;
mod fake;
mod flattener;
mod minter;
mod retrieving;
mod staging;

pub use collection_store::{CollectionStore, page_id, split_page_id};
pub use convert::{ConverterRegistry, DocumentConverter, JsonConverter};
pub use database_store::DatabaseStore;
pub use fake::FakeStore;
pub use flattener::{EntityFlattener, FlattenResult, GRAPH_PREDICATES};
pub use minter::{IdMinter, UlidMinter};
pub use retrieving::{RemoteFetcher, RetrievingStore};
pub use staging::StagingStore;

use async_trait::async_trait;
use std::sync::Arc;

use crate::collections::CollectionTools;
use crate::config::AppConfig;
use crate::data::{Database, Entity};
use crate::error::AppError;

/// Uniform get/put/commit contract keyed by URI.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Look up an entity. `allow_remote` permits network dereferencing.
    ///
    /// Missing entities are `Ok(None)`, never an error.
    async fn get_entity(&self, id: &str, allow_remote: bool) -> Result<Option<Entity>, AppError>;

    /// Upsert an entity, returning what was stored.
    async fn store_entity(&self, entity: Entity) -> Result<Entity, AppError>;

    /// Flush buffered writes to the next layer.
    async fn commit_changes(&self) -> Result<(), AppError> {
        Ok(())
    }
}

pub type SharedStore = Arc<dyn EntityStore>;

/// Per-request parameters of a store chain.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Actor reading collections; controls page visibility
    pub viewer: Option<String>,
    /// Owned actor whose key signs remote fetches
    pub signer: Option<String>,
}

/// A composed chain plus the handles the pipeline needs beside it.
#[derive(Clone)]
pub struct StoreChain {
    pub staging: Arc<StagingStore>,
    pub db: Database,
    pub collections: CollectionTools,
}

impl StoreChain {
    /// The chain without the staging overlay.
    pub fn committed(&self) -> SharedStore {
        self.staging.next()
    }
}

/// Builds store chains. Created once at startup.
pub struct EntityStoreFactory {
    config: Arc<AppConfig>,
    fetcher: Arc<RemoteFetcher>,
    flattener: Arc<EntityFlattener>,
}

impl EntityStoreFactory {
    pub fn new(
        config: Arc<AppConfig>,
        fetcher: Arc<RemoteFetcher>,
        flattener: Arc<EntityFlattener>,
    ) -> Self {
        Self {
            config,
            fetcher,
            flattener,
        }
    }

    pub fn flattener(&self) -> &Arc<EntityFlattener> {
        &self.flattener
    }

    /// Compose `Staging -> Fake -> Collection -> Retrieving -> Database`.
    pub fn build(&self, db: &Database, options: StoreOptions) -> StoreChain {
        let collections = CollectionTools::new(db.clone());

        let database: SharedStore = Arc::new(DatabaseStore::new(
            db.clone(),
            chrono::Duration::days(self.config.federation.remote_cache_ttl_days),
        ));
        let retrieving: SharedStore = Arc::new(RetrievingStore::new(
            database,
            self.fetcher.clone(),
            self.flattener.clone(),
            db.clone(),
            options.signer,
        ));
        let collection: SharedStore = Arc::new(CollectionStore::new(
            retrieving,
            collections.clone(),
            self.config.collections.page_size,
            options.viewer,
        ));
        let fake: SharedStore = Arc::new(FakeStore::new(
            collection,
            db.clone(),
            self.config.server.base_url(),
        ));
        let staging = Arc::new(StagingStore::new(fake));

        StoreChain {
            staging,
            db: db.clone(),
            collections,
        }
    }
}
