//! Audience resolution and delivery fan-out
//!
//! Turns an activity's addressing into queue jobs: one per distinct inbox,
//! one per legacy Salmon endpoint, and one per WebSub subscriber when the
//! activity is public.

use chrono::Utc;
use std::collections::{HashSet, VecDeque};

use crate::collections::CollectionTools;
use crate::data::{ADDRESSING, Database, Entity, is_public_address};
use crate::entity::EntityStore;
use crate::error::AppError;
use crate::queue::{self, DeliverToActivityPub, DeliverToSalmon, DeliverToWebSub, Job};

/// Collections nested deeper than this are not expanded.
pub const MAX_EXPANSION_DEPTH: u32 = 3;

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
pub fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    inbox_uris
        .into_iter()
        .filter(|inbox| seen.insert(inbox.clone()))
        .collect()
}

/// Where one resolved recipient wants to receive.
#[derive(Debug, Default)]
struct Recipients {
    inboxes: Vec<String>,
    salmon: Vec<String>,
}

/// Jobs queued for one activity.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeliveryPlan {
    pub inboxes: Vec<String>,
    pub salmon: Vec<String>,
    pub websub: Vec<i64>,
}

impl DeliveryPlan {
    pub fn job_count(&self) -> usize {
        self.inboxes.len() + self.salmon.len() + self.websub.len()
    }
}

/// Queues delivery jobs inside the caller's transaction.
pub struct DeliveryService<'a> {
    store: &'a dyn EntityStore,
    collections: &'a CollectionTools,
    db: &'a Database,
}

impl<'a> DeliveryService<'a> {
    pub fn new(store: &'a dyn EntityStore, collections: &'a CollectionTools, db: &'a Database) -> Self {
        Self {
            store,
            collections,
            db,
        }
    }

    /// Resolve the audience of `activity` and enqueue one job per target.
    ///
    /// Only collections attributed to `sender` are expanded, to at most
    /// [`MAX_EXPANSION_DEPTH`] levels. Members reached through such a
    /// collection are served through their shared inbox when they publish
    /// one. With `forwarding`, directly addressed actors are skipped (the
    /// origin server already delivered to them) and WebSub is not pushed.
    pub async fn queue_for_entity(
        &self,
        activity: &Entity,
        sender: &str,
        forwarding: bool,
        collection_item: Option<i64>,
    ) -> Result<DeliveryPlan, AppError> {
        let mut is_public = false;
        let mut addresses = Vec::new();
        for predicate in ADDRESSING {
            for address in activity.data.ids(predicate) {
                if is_public_address(&address) {
                    is_public = true;
                } else {
                    addresses.push(address);
                }
            }
        }

        let recipients = self.resolve(addresses, sender, forwarding).await?;

        let sender_inbox = match self.store.get_entity(sender, false).await? {
            Some(actor) => actor.data.first_id("inbox"),
            None => None,
        };
        let inboxes: Vec<String> = unique_inbox_targets(recipients.inboxes)
            .into_iter()
            .filter(|inbox| Some(inbox) != sender_inbox.as_ref())
            .collect();
        let salmon = unique_inbox_targets(recipients.salmon);

        for inbox in &inboxes {
            queue::enqueue(
                self.db,
                &Job::DeliverToActivityPub(DeliverToActivityPub {
                    target_inbox: inbox.clone(),
                    object_id: activity.id.clone(),
                }),
            )
            .await?;
        }
        for salmon_url in &salmon {
            queue::enqueue(
                self.db,
                &Job::DeliverToSalmon(DeliverToSalmon {
                    salmon_url: salmon_url.clone(),
                    object_id: activity.id.clone(),
                }),
            )
            .await?;
        }

        let mut websub = Vec::new();
        if is_public && !forwarding {
            for subscription in self
                .db
                .active_websub_subscriptions(sender, Utc::now())
                .await?
            {
                queue::enqueue(
                    self.db,
                    &Job::DeliverToWebSub(DeliverToWebSub {
                        subscription: subscription.id,
                        source_user_id: sender.to_string(),
                        object_id: activity.id.clone(),
                        collection_item,
                    }),
                )
                .await?;
                websub.push(subscription.id);
            }
        }

        let plan = DeliveryPlan {
            inboxes,
            salmon,
            websub,
        };
        tracing::info!(
            activity = %activity.id,
            sender,
            forwarding,
            jobs = plan.job_count(),
            "Queued delivery"
        );
        Ok(plan)
    }

    async fn resolve(
        &self,
        addresses: Vec<String>,
        sender: &str,
        forwarding: bool,
    ) -> Result<Recipients, AppError> {
        let mut recipients = Recipients::default();
        let mut visited = HashSet::new();
        let mut worklist: VecDeque<(String, u32)> =
            addresses.into_iter().map(|address| (address, 0)).collect();

        while let Some((address, depth)) = worklist.pop_front() {
            if !visited.insert(address.clone()) {
                continue;
            }
            let Some(target) = self.store.get_entity(&address, true).await? else {
                tracing::debug!(address = %address, "Skipping unresolvable address");
                continue;
            };

            if target.is_actor() {
                if forwarding && depth == 0 {
                    continue;
                }
                let via_collection = depth > 0;
                if let Some(inbox) = actor_inbox(&target, via_collection) {
                    recipients.inboxes.push(inbox);
                } else if let Some(salmon_url) = target.data.first_str("_:salmonUrl") {
                    recipients.salmon.push(salmon_url.to_string());
                } else {
                    tracing::debug!(actor = %address, "Actor has no inbox");
                }
                continue;
            }

            let is_collection = target.is_internal_collection() || target.data.is_collection();
            if !is_collection {
                continue;
            }
            if target.data.first_id("attributedTo").as_deref() != Some(sender) {
                tracing::debug!(collection = %address, "Not expanding foreign collection");
                continue;
            }
            if depth >= MAX_EXPANSION_DEPTH {
                tracing::debug!(collection = %address, depth, "Collection nested too deep");
                continue;
            }

            let members = if target.is_internal_collection() && target.is_owner {
                self.collections.get_all(&target.id).await?
            } else {
                let mut members = target.data.ids("items");
                members.extend(target.data.ids("orderedItems"));
                members
            };
            worklist.extend(members.into_iter().map(|member| (member, depth + 1)));
        }

        Ok(recipients)
    }
}

/// Personal inbox, or the shared inbox for members reached through a
/// collection. Owned actors are always served through their own inbox.
fn actor_inbox(actor: &Entity, via_collection: bool) -> Option<String> {
    if via_collection && !actor.is_owner {
        let shared = actor
            .data
            .first("endpoints")
            .and_then(|endpoints| endpoints.get("sharedInbox"))
            .and_then(|shared| shared.as_str());
        if let Some(shared) = shared {
            return Some(shared.to_string());
        }
    }
    actor.data.first_id("inbox")
}
