//! Server-to-server chain: activities delivered to a local inbox

use async_trait::async_trait;
use serde_json::Value;

use super::shared::{CommitChanges, actor_id, collection_of, object_id, same_host};
use super::{ActivityHandler, HandlerContext, Outcome, now_rfc3339};
use crate::data::{ASObject, Entity};
use crate::error::AppError;

pub(super) fn chain() -> Vec<Box<dyn ActivityHandler>> {
    vec![
        Box::new(VerifyOwnership),
        Box::new(Sanitize),
        Box::new(DeleteHandler),
        Box::new(CommitChanges),
        Box::new(LikeFollowAnnounce),
        Box::new(AcceptReject),
        Box::new(UndoHandler),
        Box::new(DeliveryAndForward),
    ]
}

/// Predicates that carry HTML from remote servers.
const HTML_PREDICATES: [&str; 2] = ["content", "summary"];

/// Checks the activity belongs to its actor's server, drops duplicates and
/// blocked senders, then stages what was delivered.
struct VerifyOwnership;

#[async_trait]
impl ActivityHandler for VerifyOwnership {
    fn name(&self) -> &'static str {
        "verify_ownership"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let root = ctx
            .incoming
            .iter()
            .find(|entity| entity.id == ctx.main_object)
            .cloned()
            .ok_or_else(|| AppError::InvalidOperation("Activity has no id".to_string()))?;
        let sender = actor_id(&root)?;
        if !same_host(&root.id, &sender) {
            tracing::warn!(activity = %root.id, actor = %sender, "Activity host does not match actor");
            return Err(AppError::Forbidden);
        }

        let receiver = ctx.actor_entity().await?;
        if let Some(blocked) = receiver.data.first_id("_:blocked") {
            if ctx.collections().contains(&blocked, &sender).await? {
                tracing::info!(receiver = %ctx.actor, actor = %sender, "Dropped activity from blocked actor");
                return Err(AppError::Forbidden);
            }
        }

        if ctx.collections().contains(&ctx.target_box, &root.id).await? {
            return Ok(Outcome::Abort);
        }

        let incoming = std::mem::take(&mut ctx.incoming);
        for entity in incoming {
            if entity.is_owner || !same_host(&entity.id, &root.id) {
                continue;
            }
            ctx.put(entity).await?;
        }
        Ok(Outcome::Continue)
    }
}

/// Cleans the HTML of remote objects before anyone renders it.
struct Sanitize;

#[async_trait]
impl ActivityHandler for Sanitize {
    fn name(&self) -> &'static str {
        "sanitize"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        if !activity.data.is_type("Create") {
            return Ok(Outcome::Continue);
        }

        let Some(mut object) = ctx.get(&object_id(&activity)?).await? else {
            return Ok(Outcome::Continue);
        };
        if object.is_owner {
            return Ok(Outcome::Continue);
        }

        let mut changed = false;
        for predicate in HTML_PREDICATES {
            let cleaned = match object.data.get(predicate) {
                Some(Value::String(html)) => {
                    let clean = ammonia::clean(html);
                    (clean != *html).then_some(clean)
                }
                _ => None,
            };
            if let Some(clean) = cleaned {
                object.data.set_str(predicate, &clean);
                changed = true;
            }
        }
        if changed {
            ctx.put(object).await?;
        }
        Ok(Outcome::Continue)
    }
}

/// A remote `Delete` tombstones the sender's own object.
struct DeleteHandler;

#[async_trait]
impl ActivityHandler for DeleteHandler {
    fn name(&self) -> &'static str {
        "delete"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        if !activity.data.is_type("Delete") || activity.is_owner {
            return Ok(Outcome::Continue);
        }

        let target = object_id(&activity)?;
        let sender = actor_id(&activity)?;
        let existing = ctx.chain.committed().get_entity(&target, false).await?;
        if existing.as_ref().is_some_and(|object| object.is_owner) || !same_host(&target, &sender) {
            return Err(AppError::Forbidden);
        }

        let mut tombstone = ASObject::new();
        tombstone.set_id(&target);
        tombstone.set_str("type", "Tombstone");
        if let Some(former) = existing.as_ref().and_then(|object| object.data.first_type()) {
            tombstone.set_str("formerType", former);
        }
        tombstone.set_str("deleted", &now_rfc3339());
        ctx.put(Entity::new(target, tombstone, false)).await?;
        Ok(Outcome::Continue)
    }
}

/// Keeps `likes`, `shares`, `replies` and `followers` of local objects
/// current, and accepts follows.
struct LikeFollowAnnounce;

impl LikeFollowAnnounce {
    /// Append `element` to the `predicate` collection of a local object.
    async fn add_to_local(
        &self,
        ctx: &HandlerContext,
        object_id: &str,
        predicate: &str,
        element: &str,
    ) -> Result<(), AppError> {
        let Some(object) = ctx.get(object_id).await? else {
            return Ok(());
        };
        if !object.is_owner {
            return Ok(());
        }
        let Some(collection) = object.data.first_id(predicate) else {
            return Ok(());
        };
        if !ctx.collections().contains(&collection, element).await? {
            ctx.add_to(&collection, element).await?;
        }
        Ok(())
    }

    async fn follow(&self, ctx: &HandlerContext, follow: &Entity) -> Result<(), AppError> {
        if object_id(follow)? != ctx.actor {
            return Ok(());
        }
        let receiver = ctx.actor_entity().await?;
        if receiver.data.first("manuallyApprovesFollowers") == Some(&Value::Bool(true)) {
            tracing::debug!(actor = %ctx.actor, follow = %follow.id, "Follow awaits approval");
            return Ok(());
        }

        let follower = actor_id(follow)?;
        let followers = collection_of(&receiver, "followers")?;
        if !ctx.collections().contains(&followers, &follower).await? {
            ctx.add_to(&followers, &follower).await?;
        }

        let mut accept = ASObject::new();
        accept.set_str("type", "Accept");
        accept.set_str("actor", &ctx.actor);
        accept.set_str("object", &follow.id);
        accept.set_str("to", &follower);
        accept.set_str("published", &now_rfc3339());
        let accept = ctx.mint(accept).await?;

        let outbox = collection_of(&receiver, "outbox")?;
        let item = ctx.add_to(&outbox, &accept.id).await?;
        ctx.delivery()
            .queue_for_entity(&accept, &ctx.actor, false, Some(item.collection_item_id))
            .await?;
        tracing::info!(actor = %ctx.actor, follower = %follower, "Follow accepted");
        Ok(())
    }
}

#[async_trait]
impl ActivityHandler for LikeFollowAnnounce {
    fn name(&self) -> &'static str {
        "like_follow_announce"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        if activity.data.is_type("Like") {
            self.add_to_local(ctx, &object_id(&activity)?, "likes", &activity.id)
                .await?;
        } else if activity.data.is_type("Announce") {
            self.add_to_local(ctx, &object_id(&activity)?, "shares", &activity.id)
                .await?;
        } else if activity.data.is_type("Create") {
            let object = ctx.get(&object_id(&activity)?).await?;
            if let Some(object) = object {
                if let Some(parent) = object.data.first_id("inReplyTo") {
                    self.add_to_local(ctx, &parent, "replies", &object.id)
                        .await?;
                }
            }
        } else if activity.data.is_type("Follow") {
            self.follow(ctx, &activity).await?;
        }
        Ok(Outcome::Continue)
    }
}

/// Answers to a `Follow` the receiver sent.
struct AcceptReject;

#[async_trait]
impl ActivityHandler for AcceptReject {
    fn name(&self) -> &'static str {
        "accept_reject"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        let accepted = activity.data.is_type("Accept");
        if !accepted && !activity.data.is_type("Reject") {
            return Ok(Outcome::Continue);
        }

        let Some(follow) = ctx.get(&object_id(&activity)?).await? else {
            return Ok(Outcome::Continue);
        };
        let ours = follow.is_owner
            && follow.data.is_type("Follow")
            && follow.data.first_id("actor").as_deref() == Some(ctx.actor.as_str());
        if !ours {
            return Ok(Outcome::Continue);
        }

        let followee = object_id(&follow)?;
        if actor_id(&activity)? != followee {
            return Err(AppError::Forbidden);
        }

        let following = collection_of(&ctx.actor_entity().await?, "following")?;
        if accepted {
            if !ctx.collections().contains(&following, &followee).await? {
                ctx.add_to(&following, &followee).await?;
            }
        } else {
            ctx.collections()
                .remove_from_collection(&following, &followee)
                .await?;
        }
        tracing::info!(actor = %ctx.actor, followee = %followee, accepted, "Follow answered");
        Ok(Outcome::Continue)
    }
}

/// Reverses a remote `Follow`, `Like` or `Announce`.
struct UndoHandler;

#[async_trait]
impl ActivityHandler for UndoHandler {
    fn name(&self) -> &'static str {
        "undo"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        if !activity.data.is_type("Undo") {
            return Ok(Outcome::Continue);
        }

        let Some(undone) = ctx.get(&object_id(&activity)?).await? else {
            return Ok(Outcome::Continue);
        };
        let sender = actor_id(&activity)?;
        if actor_id(&undone)? != sender {
            return Err(AppError::Forbidden);
        }

        let target = object_id(&undone)?;
        let (collection_owner, predicate, element) = if undone.data.is_type("Follow") {
            (ctx.actor.clone(), "followers", sender)
        } else if undone.data.is_type("Like") {
            (target, "likes", undone.id.clone())
        } else if undone.data.is_type("Announce") {
            (target, "shares", undone.id.clone())
        } else {
            return Ok(Outcome::Continue);
        };

        let Some(owner) = ctx.get(&collection_owner).await? else {
            return Ok(Outcome::Continue);
        };
        if !owner.is_owner {
            return Ok(Outcome::Continue);
        }
        if let Some(collection) = owner.data.first_id(predicate) {
            ctx.collections()
                .remove_from_collection(&collection, &element)
                .await?;
        }
        Ok(Outcome::Continue)
    }
}

/// Files the activity into the inbox and forwards it to local collections
/// it addresses.
struct DeliveryAndForward;

#[async_trait]
impl ActivityHandler for DeliveryAndForward {
    fn name(&self) -> &'static str {
        "delivery_and_forward"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        let activity = ctx.main().await?;
        ctx.add_to(&ctx.target_box, &activity.id).await?;
        ctx.delivery()
            .queue_for_entity(&activity, &ctx.actor, true, None)
            .await?;
        Ok(Outcome::Continue)
    }
}
