//! Client-to-server chain: outbox submissions by a local actor

use async_trait::async_trait;
use serde_json::Value;

use super::shared::{CommitChanges, actor_id, collection_of, object_id, same_host};
use super::{ActivityHandler, HandlerContext, Outcome, now_rfc3339};
use crate::data::{ADDRESSING, ASObject, Entity, SigningKey, entity_type};
use crate::error::AppError;
use crate::federation::generate_key_pair;
use crate::queue::{self, Job, WebSubClientJob};

pub(super) fn chain() -> Vec<Box<dyn ActivityHandler>> {
    vec![
        Box::new(ObjectWrapper),
        Box::new(ActivityMissingFields),
        Box::new(CreateActivity),
        Box::new(UpdateDelete),
        Box::new(CommitChanges),
        Box::new(FollowLike),
        Box::new(AddRemove),
        Box::new(Undo),
        Box::new(Block),
        Box::new(Delivery),
        Box::new(WebSubSubscribe),
    ]
}

/// Collections every local actor owns: predicate and type tag.
const ACTOR_COLLECTIONS: [(&str, &str); 5] = [
    ("inbox", entity_type::INBOX),
    ("outbox", entity_type::OUTBOX),
    ("following", entity_type::FOLLOWING),
    ("followers", entity_type::FOLLOWERS),
    ("liked", entity_type::LIKED),
];

/// Private per-actor indexes, never shown to anyone.
const ACTOR_INDEXES: [(&str, &str, &str); 2] = [
    ("_:blocks", "blocks", entity_type::BLOCKS),
    ("_:blocked", "blocked", entity_type::BLOCKED),
];

/// Collections every other created object gets.
const OBJECT_COLLECTIONS: [(&str, &str); 3] = [
    ("likes", entity_type::LIKES),
    ("shares", entity_type::SHARES),
    ("replies", entity_type::REPLIES),
];

/// Predicates an `Update` may not change.
const IMMUTABLE: [&str; 15] = [
    "id",
    "type",
    "actor",
    "attributedTo",
    "published",
    "inbox",
    "outbox",
    "following",
    "followers",
    "liked",
    "likes",
    "shares",
    "replies",
    "_:blocks",
    "_:blocked",
];

/// Stores an empty server-maintained collection.
async fn new_collection(
    ctx: &HandlerContext,
    id: &str,
    owner: &str,
    kind: &str,
    tag: &str,
) -> Result<(), AppError> {
    let mut doc = ASObject::new();
    doc.set_id(id);
    doc.set_str("type", kind);
    doc.set_str("attributedTo", owner);
    ctx.put(Entity::new(id, doc, true).with_type(tag)).await?;
    Ok(())
}

/// Union of `predicate` over two documents, or `None` when `target`
/// already holds every value.
fn merged(target: &ASObject, source: &ASObject, predicate: &str) -> Option<Value> {
    let mut ids = target.ids(predicate);
    let before = ids.len();
    for id in source.ids(predicate) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    (ids.len() != before).then(|| Value::Array(ids.into_iter().map(Value::String).collect()))
}

/// Wraps a bare object in a `Create`.
struct ObjectWrapper;

#[async_trait]
impl ActivityHandler for ObjectWrapper {
    fn name(&self) -> &'static str {
        "object_wrapper"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let object = ctx.main().await?;
        if object.data.is_activity() {
            return Ok(Outcome::Continue);
        }

        let mut create = ASObject::new();
        create.set_str("type", "Create");
        create.set_str("actor", &ctx.actor);
        create.set_str("object", &object.id);
        for predicate in ADDRESSING {
            if let Some(value) = object.data.get(predicate) {
                create.set(predicate, value.clone());
            }
        }

        let create = ctx.mint(create).await?;
        tracing::debug!(object = %object.id, create = %create.id, "Wrapped object in Create");
        ctx.main_object = create.id;
        Ok(Outcome::Continue)
    }
}

/// Fills `actor` and `published`, and aligns the addressing of a `Create`
/// with its object.
struct ActivityMissingFields;

#[async_trait]
impl ActivityHandler for ActivityMissingFields {
    fn name(&self) -> &'static str {
        "activity_missing_fields"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let mut activity = ctx.main().await?;
        match activity.data.first_id("actor") {
            None => activity.data.set_str("actor", &ctx.actor),
            Some(actor) if actor != ctx.actor => return Err(AppError::Forbidden),
            Some(_) => {}
        }
        let published = match activity.data.first_str("published") {
            Some(published) => published.to_string(),
            None => {
                let now = now_rfc3339();
                activity.data.set_str("published", &now);
                now
            }
        };

        if activity.data.is_type("Create") {
            let target = object_id(&activity)?;
            if let Some(mut object) = ctx.get(&target).await? {
                if ctx.created.contains(&object.id) {
                    for predicate in ADDRESSING {
                        if let Some(value) = merged(&activity.data, &object.data, predicate) {
                            activity.data.set(predicate, value);
                        }
                        if let Some(value) = merged(&object.data, &activity.data, predicate) {
                            object.data.set(predicate, value);
                        }
                    }
                    if !object.is_actor() && !object.data.contains("attributedTo") {
                        object.data.set_str("attributedTo", &ctx.actor);
                    }
                    if !object.data.contains("published") {
                        object.data.set_str("published", &published);
                    }
                    ctx.put(object).await?;
                }
            }
        }

        ctx.put(activity).await?;
        Ok(Outcome::Continue)
    }
}

/// Allocates the collections, keys and permissions a created object needs.
struct CreateActivity;

impl CreateActivity {
    async fn create_actor(&self, ctx: &HandlerContext, actor: &mut Entity) -> Result<(), AppError> {
        let id = actor.id.clone();
        for (predicate, tag) in ACTOR_COLLECTIONS {
            let collection = format!("{}/{}", id, predicate);
            new_collection(ctx, &collection, &id, "OrderedCollection", tag).await?;
            actor.data.set_str(predicate, &collection);
        }
        for (predicate, suffix, tag) in ACTOR_INDEXES {
            let collection = format!("{}/{}", id, suffix);
            new_collection(ctx, &collection, &id, "Collection", tag).await?;
            actor.data.set_str(predicate, &collection);
        }

        let bits = ctx.config.federation.key_bits;
        let (private_key_pem, public_key_pem) =
            tokio::task::spawn_blocking(move || generate_key_pair(bits))
                .await
                .map_err(|e| AppError::Internal(e.into()))??;
        ctx.db()
            .insert_signing_key(&SigningKey {
                entity_id: id.clone(),
                private_key_pem,
                public_key_pem,
            })
            .await?;

        if let Some(user) = &ctx.user {
            ctx.db().grant_actor_permission(user, &id, true).await?;
        }
        Ok(())
    }

    async fn create_object(&self, ctx: &HandlerContext, object: &mut Entity) -> Result<(), AppError> {
        if object.data.is_collection() {
            object.entity_type = entity_type::COLLECTION.to_string();
            return Ok(());
        }

        for (predicate, tag) in OBJECT_COLLECTIONS {
            let collection = format!("{}/{}", object.id, predicate);
            new_collection(ctx, &collection, &ctx.actor, "OrderedCollection", tag).await?;
            object.data.set_str(predicate, &collection);
        }

        if let Some(parent_id) = object.data.first_id("inReplyTo") {
            if let Some(parent) = ctx.get(&parent_id).await? {
                if parent.is_owner {
                    if let Some(replies) = parent.data.first_id("replies") {
                        ctx.add_to(&replies, &object.id).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityHandler for CreateActivity {
    fn name(&self) -> &'static str {
        "create_activity"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        if !activity.data.is_type("Create") {
            return Ok(Outcome::Continue);
        }

        // Allocation would hand keys and collections of an existing object
        // to the poster.
        let mut object = ctx.require(&object_id(&activity)?).await?;
        if !ctx.created.contains(&object.id) {
            return Err(AppError::InvalidOperation(format!(
                "Create needs a new object, {} already exists",
                object.id
            )));
        }

        if object.is_actor() {
            self.create_actor(ctx, &mut object).await?;
        } else {
            self.create_object(ctx, &mut object).await?;
        }
        ctx.put(object).await?;
        Ok(Outcome::Continue)
    }
}

/// Applies `Update` and `Delete` to stored objects the actor owns.
struct UpdateDelete;

#[async_trait]
impl ActivityHandler for UpdateDelete {
    fn name(&self) -> &'static str {
        "update_delete"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        let is_update = activity.data.is_type("Update");
        if !is_update && !activity.data.is_type("Delete") {
            return Ok(Outcome::Continue);
        }

        let target = object_id(&activity)?;
        let original = ctx
            .chain
            .committed()
            .get_entity(&target, false)
            .await?
            .ok_or_else(|| AppError::InvalidOperation(format!("Unknown object {}", target)))?;

        let owned_by_actor = original.id == ctx.actor
            || original.data.first_id("attributedTo").as_deref() == Some(ctx.actor.as_str());
        if !original.is_owner || !owned_by_actor || !same_host(&original.id, &ctx.actor) {
            return Err(AppError::Forbidden);
        }

        let updated = if is_update {
            let submitted = ctx.require(&target).await?;
            let mut data = original.data.clone();
            for (predicate, value) in submitted.data.as_map() {
                if original.data.get(predicate) == Some(value) {
                    continue;
                }
                if IMMUTABLE.contains(&predicate.as_str()) {
                    return Err(AppError::InvalidOperation(format!(
                        "{} cannot be changed",
                        predicate
                    )));
                }
                if value.is_null() {
                    data.remove(predicate);
                } else {
                    data.set(predicate, value.clone());
                }
            }
            data.set_str("updated", &now_rfc3339());
            Entity { data, ..original }
        } else {
            let mut tombstone = ASObject::new();
            tombstone.set_id(&original.id);
            tombstone.set_str("type", "Tombstone");
            if let Some(former) = original.data.first_type() {
                tombstone.set_str("formerType", former);
            }
            tombstone.set_str("deleted", &now_rfc3339());
            Entity::new(original.id.clone(), tombstone, true)
        };

        tracing::info!(object = %updated.id, update = is_update, "Object changed by owner");
        ctx.put(updated).await?;
        Ok(Outcome::Continue)
    }
}

/// A `Follow` lands in the actor's `following`, a `Like` in its `liked`.
///
/// A later `Reject` from the followee takes the follow back out.
struct FollowLike;

#[async_trait]
impl ActivityHandler for FollowLike {
    fn name(&self) -> &'static str {
        "follow_like"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        let predicate = if activity.data.is_type("Follow") {
            "following"
        } else if activity.data.is_type("Like") {
            "liked"
        } else {
            return Ok(Outcome::Continue);
        };

        let collection = collection_of(&ctx.actor_entity().await?, predicate)?;
        let target = object_id(&activity)?;
        if !ctx.collections().contains(&collection, &target).await? {
            ctx.add_to(&collection, &target).await?;
        }
        Ok(Outcome::Continue)
    }
}

/// `Add`/`Remove` against client-created collections of the actor.
struct AddRemove;

#[async_trait]
impl ActivityHandler for AddRemove {
    fn name(&self) -> &'static str {
        "add_remove"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        let is_add = activity.data.is_type("Add");
        if !is_add && !activity.data.is_type("Remove") {
            return Ok(Outcome::Continue);
        }

        let target_id = activity.data.first_id("target").ok_or_else(|| {
            AppError::InvalidOperation(format!("{} has no target", activity.entity_type))
        })?;
        let target = ctx.require(&target_id).await?;
        let writable = target.is_owner
            && target.entity_type == entity_type::COLLECTION
            && target.data.first_id("attributedTo").as_deref() == Some(ctx.actor.as_str());
        if !writable {
            return Err(AppError::Forbidden);
        }

        let element = object_id(&activity)?;
        if is_add {
            ctx.add_to(&target.id, &element).await?;
        } else {
            ctx.collections()
                .remove_from_collection(&target.id, &element)
                .await?;
        }
        Ok(Outcome::Continue)
    }
}

/// Reverses an earlier `Follow`, `Like` or `Block` of the actor.
struct Undo;

#[async_trait]
impl ActivityHandler for Undo {
    fn name(&self) -> &'static str {
        "undo"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        if !activity.data.is_type("Undo") {
            return Ok(Outcome::Continue);
        }

        let undone = ctx.require(&object_id(&activity)?).await?;
        if actor_id(&undone)? != ctx.actor {
            return Err(AppError::Forbidden);
        }
        let actor = ctx.actor_entity().await?;
        let undone_object = object_id(&undone)?;

        if undone.data.is_type("Follow") {
            let following = collection_of(&actor, "following")?;
            ctx.collections()
                .remove_from_collection(&following, &undone_object)
                .await?;
        } else if undone.data.is_type("Like") {
            let liked = collection_of(&actor, "liked")?;
            ctx.collections()
                .remove_from_collection(&liked, &undone_object)
                .await?;
        } else if undone.data.is_type("Block") {
            let blocks = collection_of(&actor, "_:blocks")?;
            let blocked = collection_of(&actor, "_:blocked")?;
            ctx.collections()
                .remove_from_collection(&blocks, &undone.id)
                .await?;
            ctx.collections()
                .remove_from_collection(&blocked, &undone_object)
                .await?;
        } else {
            return Err(AppError::InvalidOperation(format!(
                "Cannot undo {}",
                undone.entity_type
            )));
        }
        Ok(Outcome::Continue)
    }
}

/// Records a `Block` privately. Blocks are never delivered.
struct Block;

#[async_trait]
impl ActivityHandler for Block {
    fn name(&self) -> &'static str {
        "block"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        if !activity.data.is_type("Block") {
            return Ok(Outcome::Continue);
        }

        let actor = ctx.actor_entity().await?;
        let blocked_actor = object_id(&activity)?;
        ctx.add_to(&collection_of(&actor, "_:blocks")?, &activity.id)
            .await?;
        let blocked = collection_of(&actor, "_:blocked")?;
        if !ctx.collections().contains(&blocked, &blocked_actor).await? {
            ctx.add_to(&blocked, &blocked_actor).await?;
        }
        tracing::info!(actor = %ctx.actor, blocked = %blocked_actor, "Actor blocked");
        Ok(Outcome::Abort)
    }
}

/// Appends the activity to the outbox and queues its delivery.
struct Delivery;

#[async_trait]
impl ActivityHandler for Delivery {
    fn name(&self) -> &'static str {
        "delivery"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        let outbox = if ctx.target_box.is_empty() {
            collection_of(&ctx.actor_entity().await?, "outbox")?
        } else {
            ctx.target_box.clone()
        };

        let item = ctx.add_to(&outbox, &activity.id).await?;
        ctx.delivery()
            .queue_for_entity(&activity, &ctx.actor, false, Some(item.collection_item_id))
            .await?;
        Ok(Outcome::Continue)
    }
}

/// Follows of legacy actors go through their WebSub hub.
struct WebSubSubscribe;

#[async_trait]
impl ActivityHandler for WebSubSubscribe {
    fn name(&self) -> &'static str {
        "websub_subscribe"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        let (follow, unsubscribe) = if activity.data.is_type("Follow") {
            (activity, false)
        } else if activity.data.is_type("Undo") {
            let undone = ctx.require(&object_id(&activity)?).await?;
            if !undone.data.is_type("Follow") {
                return Ok(Outcome::Continue);
            }
            (undone, true)
        } else {
            return Ok(Outcome::Continue);
        };

        let followee_id = object_id(&follow)?;
        let Some(followee) = ctx.fetch(&followee_id).await? else {
            return Ok(Outcome::Continue);
        };
        let is_legacy =
            followee.data.contains("_:hubUrl") && followee.data.first_id("inbox").is_none();
        if !is_legacy {
            return Ok(Outcome::Continue);
        }

        queue::enqueue(
            ctx.db(),
            &Job::WebSubClient(WebSubClientJob {
                unsubscribe,
                actor_id: ctx.actor.clone(),
                to_follow_id: followee_id,
            }),
        )
        .await?;
        Ok(Outcome::Continue)
    }
}
