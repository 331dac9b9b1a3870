//! Activity handler pipeline
//!
//! An activity is turned into committed state by running it through an
//! ordered list of [`ActivityHandler`]s. Two fixed chains exist: the
//! client-to-server chain for outbox submissions and the server-to-server
//! chain for inbox deliveries.
//!
//! One run is one database transaction. Every handler works against the
//! run's staging store; the run commits only when every handler returned
//! without error. A handler stops the chain early with [`Outcome::Abort`]
//! (the transaction still commits what was flushed so far) and rejects the
//! activity by returning an error (everything rolls back).

mod client;
mod server;
mod shared;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::collections::CollectionTools;
use crate::config::AppConfig;
use crate::data::{
    ADDRESSING, ASObject, CollectionItem, Database, Entity, entity_type, host_of, is_public_address,
};
use crate::entity::{EntityFlattener, EntityStore, EntityStoreFactory, StoreChain, StoreOptions};
use crate::error::AppError;
use crate::federation::DeliveryService;
use crate::metrics::{ACTIVITIES_RECEIVED, ACTIVITIES_SUBMITTED, PIPELINE_RUNS_TOTAL};

/// Serializes inbox processing against the queue worker.
pub type ProcessingLock = Arc<tokio::sync::Mutex<()>>;

/// How a handler wants the chain to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// Stop here; the activity is not an error but needs no further work
    Abort,
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError>;
}

/// State shared by the handlers of one run.
pub struct HandlerContext {
    pub chain: StoreChain,
    /// The activity being processed
    pub main_object: String,
    /// Acting actor (client chain) or receiving actor (server chain)
    pub actor: String,
    /// Outbox (client chain) or inbox (server chain) the activity targets
    pub target_box: String,
    /// Authenticated user behind a client submission
    pub user: Option<String>,
    /// Entities delivered with an inbound activity, not yet stored
    pub incoming: Vec<Entity>,
    /// Ids this submission brings into existence; only these may be created
    pub created: HashSet<String>,
    pub config: Arc<AppConfig>,
    pub flattener: Arc<EntityFlattener>,
}

impl HandlerContext {
    pub fn store(&self) -> &dyn EntityStore {
        self.chain.staging.as_ref()
    }

    pub fn db(&self) -> &Database {
        &self.chain.db
    }

    pub fn collections(&self) -> &CollectionTools {
        &self.chain.collections
    }

    pub fn delivery(&self) -> DeliveryService<'_> {
        DeliveryService::new(self.store(), &self.chain.collections, &self.chain.db)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Entity>, AppError> {
        self.store().get_entity(id, false).await
    }

    /// Like [`get`](Self::get), dereferencing remote ids.
    pub async fn fetch(&self, id: &str) -> Result<Option<Entity>, AppError> {
        self.store().get_entity(id, true).await
    }

    pub async fn require(&self, id: &str) -> Result<Entity, AppError> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::InvalidOperation(format!("Unknown object {}", id)))
    }

    pub async fn main(&self) -> Result<Entity, AppError> {
        self.require(&self.main_object).await
    }

    pub async fn actor_entity(&self) -> Result<Entity, AppError> {
        self.require(&self.actor).await
    }

    pub async fn put(&self, entity: Entity) -> Result<Entity, AppError> {
        self.store().store_entity(entity).await
    }

    pub async fn add_to(
        &self,
        collection_id: &str,
        element_id: &str,
    ) -> Result<CollectionItem, AppError> {
        self.chain
            .collections
            .add_to_collection(self.store(), collection_id, element_id)
            .await
    }

    /// Store a new owned document under a freshly minted id.
    pub async fn mint(&self, mut doc: ASObject) -> Result<Entity, AppError> {
        let id = self.flattener.minter().mint(&doc);
        doc.set_id(&id);
        self.put(Entity::new(id, doc, true)).await
    }

    pub fn base_url(&self) -> String {
        self.config.server.base_url()
    }
}

/// References a run may dereference remotely, besides its addressing.
const REFERENCES: [&str; 4] = ["actor", "object", "target", "inReplyTo"];

/// Passes of [`Pipeline::prefetch`]: the references themselves, then the
/// authors of whatever they resolved to.
const PREFETCH_HOPS: usize = 2;

/// Remote-looking references of `doc`, including the authors of embedded
/// objects.
fn remote_references(doc: &ASObject, local_host: Option<&str>) -> Vec<String> {
    let mut ids = Vec::new();
    for predicate in REFERENCES.iter().chain(ADDRESSING.iter()) {
        for value in doc.values(predicate) {
            match value {
                Value::String(id) => ids.push(id.clone()),
                Value::Object(embedded) => {
                    if let Some(Value::String(author)) = embedded.get("attributedTo") {
                        ids.push(author.clone());
                    }
                }
                _ => {}
            }
        }
    }
    ids.retain(|id| !is_public_address(id) && host_of(id).as_deref() != local_host);
    ids
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Builds and runs the two handler chains.
pub struct Pipeline {
    config: Arc<AppConfig>,
    stores: Arc<EntityStoreFactory>,
    queue_notify: Arc<Notify>,
    client_chain: Vec<Box<dyn ActivityHandler>>,
    server_chain: Vec<Box<dyn ActivityHandler>>,
}

impl Pipeline {
    pub fn new(
        config: Arc<AppConfig>,
        stores: Arc<EntityStoreFactory>,
        queue_notify: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            stores,
            queue_notify,
            client_chain: client::chain(),
            server_chain: server::chain(),
        }
    }

    pub fn stores(&self) -> &Arc<EntityStoreFactory> {
        &self.stores
    }

    /// Handle an outbox submission by `actor`.
    ///
    /// Returns the final activity; a bare object comes back wrapped in its
    /// `Create`.
    pub async fn post_outbox(
        &self,
        db: &Database,
        actor: &str,
        user: Option<&str>,
        doc: ASObject,
    ) -> Result<Entity, AppError> {
        self.run_client(db, actor, user, doc, None).await
    }

    /// Bootstrap a local actor, running its `Create` through the client chain
    /// with the new actor acting for itself.
    pub async fn create_actor(
        &self,
        db: &Database,
        user: &str,
        preferred_username: &str,
        name: Option<&str>,
        summary: Option<&str>,
    ) -> Result<Entity, AppError> {
        let valid = !preferred_username.is_empty()
            && preferred_username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(AppError::Validation(
                "preferredUsername must be non-empty and alphanumeric".to_string(),
            ));
        }

        let actor_id = format!("{}/users/{}", self.config.server.base_url(), preferred_username);
        if db.get_entity(&actor_id).await?.is_some() {
            return Err(AppError::Validation(format!(
                "Username {} is taken",
                preferred_username
            )));
        }

        let mut actor = ASObject::new();
        actor.set_id(&actor_id);
        actor.set_str("type", "Person");
        actor.set_str("preferredUsername", preferred_username);
        if let Some(name) = name {
            actor.set_str("name", name);
        }
        if let Some(summary) = summary {
            actor.set_str("summary", summary);
        }

        let mut create = ASObject::new();
        create.set_str("type", "Create");
        create.set_str("actor", &actor_id);
        create.set("object", actor.into_value());
        create.set_str("to", crate::data::PUBLIC_COLLECTION);

        let created = self
            .run_client(db, &actor_id, Some(user), create, Some(&actor_id))
            .await?;
        tracing::info!(actor = %actor_id, user, "Actor created");
        Ok(created)
    }

    async fn run_client(
        &self,
        db: &Database,
        actor: &str,
        user: Option<&str>,
        doc: ASObject,
        new_actor: Option<&str>,
    ) -> Result<Entity, AppError> {
        self.prefetch(db, &doc, actor).await?;
        let tx = db.begin().await?;
        let chain = self.stores.build(
            &tx,
            StoreOptions {
                viewer: Some(actor.to_string()),
                signer: Some(actor.to_string()),
            },
        );

        let staged = async {
            let flattened = self
                .stores
                .flattener()
                .flatten(chain.staging.as_ref(), doc, true)
                .await?;
            let root = flattened
                .root_entity()
                .ok_or_else(|| AppError::Internal(anyhow::anyhow!("flatten lost its root")))?;

            // Submitted documents only replace stored ones for Update/Delete;
            // everything else already stored is a plain reference.
            let replaces_object = root.data.is_any_type(&["Update", "Delete"]);
            let object_id = root.data.first_id("object");

            let mut created = flattened.minted.clone();
            if let Some(new_actor) = new_actor {
                created.insert(new_actor.to_string());
            }

            for mut entity in flattened.entities.iter().cloned() {
                let is_new_actor = Some(entity.id.as_str()) == new_actor;
                if is_new_actor {
                    entity.is_owner = true;
                }
                let keep = created.contains(&entity.id)
                    || (replaces_object && object_id.as_deref() == Some(entity.id.as_str()));
                if keep {
                    chain.staging.store_entity(entity).await?;
                }
            }
            Ok::<_, AppError>((flattened.root, created))
        }
        .await;

        let (root, created) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        let mut ctx = HandlerContext {
            chain,
            main_object: root,
            actor: actor.to_string(),
            target_box: String::new(),
            user: user.map(str::to_string),
            incoming: Vec::new(),
            created,
            config: self.config.clone(),
            flattener: self.stores.flattener().clone(),
        };
        if let Some(actor) = ctx.get(actor).await? {
            ctx.target_box = actor.data.first_id("outbox").unwrap_or_default();
        }

        let result = self.run("client", &self.client_chain, &mut ctx, &tx).await?;
        if let Some(kind) = result.data.first_type() {
            ACTIVITIES_SUBMITTED.with_label_values(&[kind]).inc();
        }
        Ok(result)
    }

    /// Deliver an inbound activity to the inbox of local actor `receiver`.
    ///
    /// Returns `None` when the activity was already in that inbox.
    pub async fn post_inbox(
        &self,
        db: &Database,
        receiver: &str,
        doc: ASObject,
    ) -> Result<Option<Entity>, AppError> {
        let inbox = db
            .get_entity(receiver)
            .await?
            .filter(|actor| actor.is_owner && actor.is_actor())
            .and_then(|actor| actor.data.first_id("inbox"))
            .ok_or(AppError::NotFound)?;

        self.prefetch(db, &doc, receiver).await?;
        let tx = db.begin().await?;
        let chain = self.stores.build(
            &tx,
            StoreOptions {
                viewer: Some(receiver.to_string()),
                signer: Some(receiver.to_string()),
            },
        );

        let flattened = match self
            .stores
            .flattener()
            .flatten(chain.staging.as_ref(), doc, false)
            .await
        {
            Ok(flattened) => flattened,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        let activity_type = flattened
            .root_entity()
            .map(|root| root.entity_type.clone())
            .unwrap_or_else(|| entity_type::UNKNOWN.to_string());

        let mut ctx = HandlerContext {
            chain,
            main_object: flattened.root,
            actor: receiver.to_string(),
            target_box: inbox,
            user: None,
            incoming: flattened.entities,
            created: HashSet::new(),
            config: self.config.clone(),
            flattener: self.stores.flattener().clone(),
        };

        let result = self.run_checked("server", &self.server_chain, &mut ctx, &tx).await?;
        ACTIVITIES_RECEIVED
            .with_label_values(&[activity_type.as_str()])
            .inc();
        Ok(result)
    }

    /// Resolve the remote references of `doc` through a pool-backed chain
    /// before the run opens its transaction.
    ///
    /// Whatever is fetched is materialized with autocommit, so the run reads
    /// it from the database instead of doing HTTP under the write lock.
    async fn prefetch(&self, db: &Database, doc: &ASObject, signer: &str) -> Result<(), AppError> {
        let local_host = host_of(&self.config.server.base_url());
        let chain = self.stores.build(
            db,
            StoreOptions {
                viewer: None,
                signer: Some(signer.to_string()),
            },
        );

        let mut seen = HashSet::new();
        let mut pending = remote_references(doc, local_host.as_deref());
        for _ in 0..PREFETCH_HOPS {
            let mut next = Vec::new();
            for id in pending {
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(entity) = chain.staging.get_entity(&id, true).await? {
                    next.extend(entity.data.ids("attributedTo"));
                }
            }
            next.retain(|id| host_of(id).as_deref() != local_host.as_deref());
            pending = next;
        }
        Ok(())
    }

    /// Local actors an activity posted to the shared inbox is meant for:
    /// owned actors it addresses, plus the owners of following collections
    /// that hold its sender.
    pub async fn shared_inbox_recipients(
        &self,
        db: &Database,
        activity: &ASObject,
    ) -> Result<Vec<String>, AppError> {
        let local_host = host_of(&self.config.server.base_url());
        let mut recipients = Vec::new();

        for address in activity.audience() {
            if host_of(&address) != local_host || recipients.contains(&address) {
                continue;
            }
            if let Some(entity) = db.get_entity(&address).await? {
                if entity.is_owner && entity.is_actor() {
                    recipients.push(address);
                }
            }
        }

        if let Some(sender) = activity.first_id("actor") {
            for following in db
                .collections_containing(&sender, entity_type::FOLLOWING)
                .await?
            {
                let owner = db
                    .get_entity(&following)
                    .await?
                    .and_then(|collection| collection.data.first_id("attributedTo"));
                if let Some(owner) = owner {
                    if !recipients.contains(&owner) {
                        recipients.push(owner);
                    }
                }
            }
        }

        Ok(recipients)
    }

    async fn run_checked(
        &self,
        chain_name: &'static str,
        handlers: &[Box<dyn ActivityHandler>],
        ctx: &mut HandlerContext,
        tx: &Database,
    ) -> Result<Option<Entity>, AppError> {
        match self.execute(chain_name, handlers, ctx, tx).await? {
            (Outcome::Continue, entity) => Ok(entity),
            (Outcome::Abort, _) => Ok(None),
        }
    }

    async fn run(
        &self,
        chain_name: &'static str,
        handlers: &[Box<dyn ActivityHandler>],
        ctx: &mut HandlerContext,
        tx: &Database,
    ) -> Result<Entity, AppError> {
        let (_, entity) = self.execute(chain_name, handlers, ctx, tx).await?;
        entity.ok_or_else(|| AppError::InvalidOperation(format!("Unknown object {}", ctx.main_object)))
    }

    /// Run `handlers` in order and settle the transaction.
    async fn execute(
        &self,
        chain_name: &'static str,
        handlers: &[Box<dyn ActivityHandler>],
        ctx: &mut HandlerContext,
        tx: &Database,
    ) -> Result<(Outcome, Option<Entity>), AppError> {
        let outcome = async {
            for handler in handlers {
                match handler.handle(ctx).await {
                    Ok(Outcome::Continue) => {}
                    Ok(Outcome::Abort) => {
                        tracing::debug!(
                            chain = chain_name,
                            handler = handler.name(),
                            activity = %ctx.main_object,
                            "Pipeline stopped"
                        );
                        return Ok(Outcome::Abort);
                    }
                    Err(e) => {
                        tracing::info!(
                            chain = chain_name,
                            handler = handler.name(),
                            activity = %ctx.main_object,
                            error = %e,
                            "Activity rejected"
                        );
                        return Err(e);
                    }
                }
            }
            Ok(Outcome::Continue)
        }
        .await;

        let settled = async {
            let outcome = outcome?;
            let entity = ctx.get(&ctx.main_object).await?;
            if outcome == Outcome::Continue {
                if entity.is_none() {
                    return Err(AppError::InvalidOperation(format!(
                        "Unknown object {}",
                        ctx.main_object
                    )));
                }
                ctx.chain.staging.commit_changes().await?;
            }
            tx.commit().await?;
            Ok::<_, AppError>((outcome, entity))
        }
        .await;

        match settled {
            Ok((outcome, entity)) => {
                let result = match outcome {
                    Outcome::Continue => "committed",
                    Outcome::Abort => "aborted",
                };
                PIPELINE_RUNS_TOTAL
                    .with_label_values(&[chain_name, result])
                    .inc();
                self.queue_notify.notify_one();
                tracing::info!(chain = chain_name, activity = %ctx.main_object, result, "Pipeline finished");
                Ok((outcome, entity))
            }
            Err(e) => {
                PIPELINE_RUNS_TOTAL
                    .with_label_values(&[chain_name, "failed"])
                    .inc();
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests;
