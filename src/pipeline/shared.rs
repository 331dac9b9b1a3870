use async_trait::async_trait;

use super::{ActivityHandler, HandlerContext, Outcome};
use crate::data::{Entity, host_of};
use crate::entity::EntityStore;
use crate::error::AppError;

/// Flush everything staged so far into the run's transaction.
///
/// Later handlers read committed-looking state and write collection rows
/// that refer to it.
pub struct CommitChanges;

#[async_trait]
impl ActivityHandler for CommitChanges {
    fn name(&self) -> &'static str {
        "commit_changes"
    }

    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Outcome, AppError> {
        ctx.chain.staging.commit_changes().await?;
        Ok(Outcome::Continue)
    }
}

/// The `object` reference of an activity.
pub fn object_id(activity: &Entity) -> Result<String, AppError> {
    activity.data.first_id("object").ok_or_else(|| {
        AppError::InvalidOperation(format!("{} has no object", activity.entity_type))
    })
}

/// The `actor` reference of an activity.
pub fn actor_id(activity: &Entity) -> Result<String, AppError> {
    activity.data.first_id("actor").ok_or_else(|| {
        AppError::InvalidOperation(format!("{} has no actor", activity.entity_type))
    })
}

pub fn same_host(a: &str, b: &str) -> bool {
    match (host_of(a), host_of(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Id of a collection an actor or object advertises under `predicate`.
pub fn collection_of(entity: &Entity, predicate: &str) -> Result<String, AppError> {
    entity.data.first_id(predicate).ok_or_else(|| {
        AppError::InvalidOperation(format!("{} has no {} collection", entity.id, predicate))
    })
}
