//! Graph <-> tree transform
//!
//! Documents arrive as trees: an activity embeds its object, which embeds
//! its attachments. Storage is flat: one entity per id, with nested
//! documents replaced by their id. [`EntityFlattener::flatten`] goes from
//! tree to graph, [`EntityFlattener::unflatten`] back, to a bounded depth.
//!
//! Only the predicates in [`GRAPH_PREDICATES`] are walked.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::{EntityStore, IdMinter};
use crate::data::{ASObject, Entity, is_public_address};
use crate::error::AppError;

/// Predicates whose values may be documents in their own right.
pub const GRAPH_PREDICATES: [&str; 38] = [
    "actor",
    "object",
    "target",
    "result",
    "origin",
    "instrument",
    "attributedTo",
    "inReplyTo",
    "to",
    "bto",
    "cc",
    "bcc",
    "audience",
    "tag",
    "attachment",
    "generator",
    "icon",
    "image",
    "location",
    "preview",
    "replies",
    "likes",
    "shares",
    "inbox",
    "outbox",
    "followers",
    "following",
    "liked",
    "first",
    "last",
    "current",
    "next",
    "prev",
    "partOf",
    "items",
    "orderedItems",
    "context",
    "publicKey",
];

/// Predicates never sent to anyone.
const BLIND: [&str; 2] = ["bto", "bcc"];

/// Fragments synthesized for owned actors and inlined on output.
const ACTOR_FRAGMENTS: [(&str, &str); 2] = [("publicKey", "key"), ("endpoints", "endpoints")];

/// Entities produced by one flatten.
#[derive(Debug, Clone)]
pub struct FlattenResult {
    /// Id of the top-level document
    pub root: String,
    /// Every produced entity, nested documents before their parents
    pub entities: Vec<Entity>,
    /// Ids allocated during this flatten
    pub minted: HashSet<String>,
}

impl FlattenResult {
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|entity| entity.id == id)
    }

    pub fn root_entity(&self) -> Option<&Entity> {
        self.get(&self.root)
    }
}

pub struct EntityFlattener {
    minter: Arc<dyn IdMinter>,
}

type ExpandFuture<'a> = Pin<Box<dyn Future<Output = Result<ASObject, AppError>> + Send + 'a>>;

impl EntityFlattener {
    pub fn new(minter: Arc<dyn IdMinter>) -> Self {
        Self { minter }
    }

    pub fn minter(&self) -> &Arc<dyn IdMinter> {
        &self.minter
    }

    /// Split a document into addressable entities.
    ///
    /// Nested documents with an id become references to their own entity.
    /// Transient documents (`"id": null`) stay embedded. With `generate_id`,
    /// documents without an id get a fresh one and are marked owned;
    /// without it they stay embedded, except the top-level document, which
    /// must carry an id.
    ///
    /// Entities that already exist keep their stored ownership.
    pub async fn flatten(
        &self,
        store: &dyn EntityStore,
        doc: ASObject,
        generate_id: bool,
    ) -> Result<FlattenResult, AppError> {
        let mut walk = Walk {
            minter: self.minter.as_ref(),
            generate_id,
            entities: Vec::new(),
            index: HashMap::new(),
            minted: HashSet::new(),
        };

        let root = match doc.id() {
            Some(id) => id.to_string(),
            None if generate_id => self.minter.mint(&doc),
            None => {
                return Err(AppError::InvalidOperation(
                    "Document has no id".to_string(),
                ));
            }
        };
        let mut doc = doc;
        if doc.id().is_none() {
            doc.set_id(&root);
            walk.minted.insert(root.clone());
        }
        walk.predicates(&mut doc);
        walk.emit(root.clone(), doc);

        let Walk {
            mut entities,
            minted,
            ..
        } = walk;

        for entity in entities.iter_mut() {
            if minted.contains(&entity.id) {
                entity.is_owner = true;
                continue;
            }
            if let Some(existing) = store.get_entity(&entity.id, false).await? {
                entity.is_owner = existing.is_owner;
                if existing.is_internal_collection() {
                    entity.entity_type = existing.entity_type;
                }
            }
        }

        Ok(FlattenResult {
            root,
            entities,
            minted,
        })
    }

    /// [`flatten`](Self::flatten), then store every produced entity.
    pub async fn flatten_and_store(
        &self,
        store: &dyn EntityStore,
        doc: ASObject,
        generate_id: bool,
    ) -> Result<FlattenResult, AppError> {
        let mut result = self.flatten(store, doc, generate_id).await?;
        let mut stored = Vec::with_capacity(result.entities.len());
        for entity in result.entities {
            stored.push(store.store_entity(entity).await?);
        }
        result.entities = stored;
        Ok(result)
    }

    /// Rebuild a tree from `entity`, expanding references `depth` levels deep.
    ///
    /// `depth == 0` returns the stored document as is. Otherwise `bto` and
    /// `bcc` are dropped at every level, and a reference stays a bare id
    /// when it is public, unknown, a server-maintained collection, a lazy
    /// stub, already expanded elsewhere in the tree, or not owned while
    /// `remote` is false.
    pub async fn unflatten(
        &self,
        store: &dyn EntityStore,
        entity: &Entity,
        depth: u32,
        remote: bool,
    ) -> Result<ASObject, AppError> {
        if depth == 0 {
            return Ok(entity.data.clone());
        }

        let mut mapped = HashSet::from([entity.id.clone()]);
        let owned_actor = entity.is_owner && entity.is_actor();
        self.expand(
            store,
            &entity.id,
            owned_actor,
            entity.data.clone(),
            depth,
            remote,
            &mut mapped,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    fn expand<'a>(
        &'a self,
        store: &'a dyn EntityStore,
        id: &'a str,
        owned_actor: bool,
        mut doc: ASObject,
        depth: u32,
        remote: bool,
        mapped: &'a mut HashSet<String>,
    ) -> ExpandFuture<'a> {
        Box::pin(async move {
            for predicate in BLIND {
                doc.remove(predicate);
            }
            if depth == 0 {
                return Ok(doc);
            }

            for predicate in GRAPH_PREDICATES {
                let Some(value) = doc.remove(predicate) else {
                    continue;
                };
                let value = match value {
                    Value::Array(items) => {
                        let mut expanded = Vec::with_capacity(items.len());
                        for item in items {
                            expanded.push(
                                self.expand_value(store, item, depth, remote, mapped)
                                    .await?,
                            );
                        }
                        Value::Array(expanded)
                    }
                    single => {
                        self.expand_value(store, single, depth, remote, mapped)
                            .await?
                    }
                };
                doc.set(predicate, value);
            }

            if owned_actor {
                for (predicate, fragment) in ACTOR_FRAGMENTS {
                    let fragment_id = format!("{}#{}", id, fragment);
                    let inline = match doc.get(predicate) {
                        None => true,
                        Some(Value::String(existing)) => *existing == fragment_id,
                        Some(_) => false,
                    };
                    if !inline {
                        continue;
                    }
                    if let Some(derived) = store.get_entity(&fragment_id, false).await? {
                        doc.set(predicate, derived.data.into_value());
                    }
                }
            }

            Ok(doc)
        })
    }

    async fn expand_value(
        &self,
        store: &dyn EntityStore,
        value: Value,
        depth: u32,
        remote: bool,
        mapped: &mut HashSet<String>,
    ) -> Result<Value, AppError> {
        match value {
            Value::String(id) => {
                if is_public_address(&id) || mapped.contains(&id) {
                    return Ok(Value::String(id));
                }
                let Some(target) = store.get_entity(&id, false).await? else {
                    return Ok(Value::String(id));
                };
                if target.is_internal_collection()
                    || target.is_lazy_load()
                    || (!target.is_owner && !remote)
                {
                    return Ok(Value::String(id));
                }

                mapped.insert(id);
                let owned_actor = target.is_owner && target.is_actor();
                let expanded = self
                    .expand(
                        store,
                        &target.id,
                        owned_actor,
                        target.data.clone(),
                        depth - 1,
                        remote,
                        mapped,
                    )
                    .await?;
                Ok(expanded.into_value())
            }
            Value::Object(map) => {
                // Embedded documents belong to the current level.
                let embedded = ASObject::from(map);
                let id = embedded.id().unwrap_or_default().to_string();
                let expanded = self
                    .expand(store, &id, false, embedded, depth, remote, mapped)
                    .await?;
                Ok(expanded.into_value())
            }
            other => Ok(other),
        }
    }
}

/// State of one synchronous flatten walk.
struct Walk<'a> {
    minter: &'a dyn IdMinter,
    generate_id: bool,
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
    minted: HashSet<String>,
}

impl Walk<'_> {
    fn predicates(&mut self, doc: &mut ASObject) {
        for predicate in GRAPH_PREDICATES {
            let Some(value) = doc.remove(predicate) else {
                continue;
            };
            let value = match value {
                Value::Array(items) => {
                    Value::Array(items.into_iter().map(|item| self.value(item)).collect())
                }
                single => self.value(single),
            };
            doc.set(predicate, value);
        }
    }

    fn value(&mut self, value: Value) -> Value {
        let Value::Object(map) = value else {
            return value;
        };

        match map.get("id") {
            Some(Value::String(id)) if map.len() == 1 => Value::String(id.clone()),
            Some(Value::String(id)) => {
                let id = id.clone();
                self.nested(id.clone(), map);
                Value::String(id)
            }
            None if self.generate_id => {
                let mut doc = ASObject::from(map);
                let id = self.minter.mint(&doc);
                doc.set_id(&id);
                self.minted.insert(id.clone());
                self.predicates(&mut doc);
                self.emit(id.clone(), doc);
                Value::String(id)
            }
            _ => {
                let mut doc = ASObject::from(map);
                self.predicates(&mut doc);
                doc.into_value()
            }
        }
    }

    fn nested(&mut self, id: String, map: Map<String, Value>) {
        let mut doc = ASObject::from(map);
        self.predicates(&mut doc);
        self.emit(id, doc);
    }

    /// Record an entity. A repeated id keeps its first position and its
    /// richest document.
    fn emit(&mut self, id: String, doc: ASObject) {
        match self.index.get(&id) {
            Some(&at) => {
                if doc.as_map().len() > self.entities[at].data.as_map().len() {
                    self.entities[at] = Entity::new(id, doc, false);
                }
            }
            None => {
                self.index.insert(id.clone(), self.entities.len());
                self.entities.push(Entity::new(id, doc, false));
            }
        }
    }
}
