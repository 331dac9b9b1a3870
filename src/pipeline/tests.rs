use super::*;
use crate::config::test_config;
use crate::data::PUBLIC_COLLECTION;
use crate::entity::{ConverterRegistry, RemoteFetcher, UlidMinter};
use crate::federation::HostPolicy;
use crate::queue::Job;
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

const ALICE: &str = "https://local.example/users/alice";
const BOB: &str = "https://remote.example/users/bob";
const BOB_INBOX: &str = "https://remote.example/users/bob/inbox";
const BOB_NOTE: &str = "https://remote.example/notes/1";

struct Fixture {
    pipeline: Pipeline,
    db: Database,
    _dir: TempDir,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(test_config(dir.path().join("test.db")));
    let db = Database::connect(&config.database.path, 4).await.unwrap();

    let fetcher = Arc::new(RemoteFetcher::new(
        reqwest::Client::new(),
        ConverterRegistry::new(),
        HostPolicy::new(true),
        Duration::from_secs(2),
    ));
    let flattener = Arc::new(EntityFlattener::new(Arc::new(UlidMinter::new(
        config.server.base_url(),
    ))));
    let stores = Arc::new(EntityStoreFactory::new(config.clone(), fetcher, flattener));
    let pipeline = Pipeline::new(config, stores, Arc::new(Notify::new()));

    let f = Fixture {
        pipeline,
        db,
        _dir: dir,
    };
    f.pipeline
        .create_actor(&f.db, "user-1", "alice", Some("Alice"), None)
        .await
        .unwrap();

    put_remote(
        &f.db,
        BOB,
        json!({"type": "Person", "inbox": BOB_INBOX, "outbox": format!("{BOB}/outbox")}),
    )
    .await;
    put_remote(
        &f.db,
        BOB_NOTE,
        json!({"type": "Note", "attributedTo": BOB, "content": "hi", "to": PUBLIC_COLLECTION}),
    )
    .await;
    f
}

async fn put_remote(db: &Database, id: &str, mut doc: serde_json::Value) {
    doc["id"] = json!(id);
    let entity = Entity::new(id, ASObject::from_value(doc).unwrap(), false);
    db.upsert_entity(&entity).await.unwrap();
}

fn doc(value: serde_json::Value) -> ASObject {
    ASObject::from_value(value).unwrap()
}

async fn alice(db: &Database) -> Entity {
    db.get_entity(ALICE).await.unwrap().unwrap()
}

async fn collection(db: &Database, predicate: &str) -> String {
    alice(db).await.data.first_id(predicate).unwrap()
}

async fn queued(db: &Database) -> Vec<Job> {
    db.due_events(Utc::now() + chrono::Duration::seconds(5), 100)
        .await
        .unwrap()
        .iter()
        .map(|event| Job::from_event(event).unwrap())
        .collect()
}

fn inbox_targets(jobs: &[Job]) -> Vec<String> {
    jobs.iter()
        .filter_map(|job| match job {
            Job::DeliverToActivityPub(job) => Some(job.target_inbox.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn create_actor_allocates_collections_key_and_permission() {
    let f = fixture().await;
    let actor = alice(&f.db).await;

    assert!(actor.is_owner);
    for (predicate, suffix) in [
        ("inbox", "inbox"),
        ("outbox", "outbox"),
        ("following", "following"),
        ("followers", "followers"),
        ("liked", "liked"),
        ("_:blocks", "blocks"),
        ("_:blocked", "blocked"),
    ] {
        let id = actor.data.first_id(predicate).unwrap();
        assert_eq!(id, format!("{ALICE}/{suffix}"));
        let stored = f.db.get_entity(&id).await.unwrap().unwrap();
        assert!(stored.is_internal_collection(), "{predicate} is not internal");
        assert_eq!(stored.data.first_id("attributedTo").as_deref(), Some(ALICE));
    }

    assert!(f.db.get_signing_key(ALICE).await.unwrap().is_some());
    assert!(f.db.has_actor_permission("user-1", ALICE).await.unwrap());

    let outbox = collection(&f.db, "outbox").await;
    assert_eq!(f.db.count_collection_items(&outbox).await.unwrap(), 1);
    assert!(queued(&f.db).await.is_empty());
}

#[tokio::test]
async fn create_actor_rejects_taken_username() {
    let f = fixture().await;
    let result = f
        .pipeline
        .create_actor(&f.db, "user-2", "alice", None, None)
        .await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn like_lands_in_liked_outbox_and_queue() {
    let f = fixture().await;

    let like = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Like", "object": BOB_NOTE, "to": BOB})),
        )
        .await
        .unwrap();

    assert!(like.is_owner);
    assert_eq!(like.data.first_id("actor").as_deref(), Some(ALICE));
    assert!(like.data.contains("published"));

    let liked = collection(&f.db, "liked").await;
    assert!(f.db.find_collection_item(&liked, BOB_NOTE).await.unwrap().is_some());
    let outbox = collection(&f.db, "outbox").await;
    assert!(f.db.find_collection_item(&outbox, &like.id).await.unwrap().is_some());

    assert_eq!(inbox_targets(&queued(&f.db).await), vec![BOB_INBOX.to_string()]);
}

#[tokio::test]
async fn bare_object_is_wrapped_in_create() {
    let f = fixture().await;

    let create = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Note", "content": "hello", "to": BOB})),
        )
        .await
        .unwrap();

    assert!(create.data.is_type("Create"));
    assert_eq!(create.data.ids("to"), vec![BOB.to_string()]);
    let note = f
        .db
        .get_entity(&create.data.first_id("object").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(note.is_owner);
    assert_eq!(note.data.first_id("attributedTo").as_deref(), Some(ALICE));
    assert!(note.data.first_id("likes").is_some());
    assert!(note.data.first_id("replies").is_some());
}

#[tokio::test]
async fn acting_as_someone_else_is_forbidden_and_rolled_back() {
    let f = fixture().await;
    let outbox = collection(&f.db, "outbox").await;

    let result = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Like", "actor": BOB, "object": BOB_NOTE})),
        )
        .await;

    assert!(matches!(result, Err(AppError::Forbidden)));
    assert_eq!(f.db.count_collection_items(&outbox).await.unwrap(), 1);
    let liked = collection(&f.db, "liked").await;
    assert_eq!(f.db.count_collection_items(&liked).await.unwrap(), 0);
}

#[tokio::test]
async fn update_merges_fields_and_guards_immutable_ones() {
    let f = fixture().await;
    let create = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Note", "content": "draft"})),
        )
        .await
        .unwrap();
    let note_id = create.data.first_id("object").unwrap();

    f.pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Update", "object": {"id": note_id, "content": "final"}})),
        )
        .await
        .unwrap();
    let note = f.db.get_entity(&note_id).await.unwrap().unwrap();
    assert_eq!(note.data.first_str("content"), Some("final"));
    assert_eq!(note.data.first_id("attributedTo").as_deref(), Some(ALICE));

    let result = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Update", "object": {"id": note_id, "attributedTo": BOB}})),
        )
        .await;
    assert!(matches!(result, Err(AppError::InvalidOperation(_))));
}

#[tokio::test]
async fn update_of_foreign_object_is_forbidden() {
    let f = fixture().await;
    let result = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Update", "object": {"id": BOB_NOTE, "content": "mine now"}})),
        )
        .await;
    assert!(matches!(result, Err(AppError::Forbidden)));
}

#[tokio::test]
async fn delete_leaves_tombstone() {
    let f = fixture().await;
    let create = f
        .pipeline
        .post_outbox(&f.db, ALICE, Some("user-1"), doc(json!({"type": "Note", "content": "x"})))
        .await
        .unwrap();
    let note_id = create.data.first_id("object").unwrap();

    f.pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Delete", "object": note_id})),
        )
        .await
        .unwrap();

    let note = f.db.get_entity(&note_id).await.unwrap().unwrap();
    assert!(note.data.is_type("Tombstone"));
    assert_eq!(note.data.first_str("formerType"), Some("Note"));
}

#[tokio::test]
async fn inbox_like_is_recorded_once() {
    let f = fixture().await;
    let create = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Note", "content": "x", "to": PUBLIC_COLLECTION})),
        )
        .await
        .unwrap();
    let note_id = create.data.first_id("object").unwrap();
    let like = json!({
        "id": "https://remote.example/likes/1",
        "type": "Like",
        "actor": BOB,
        "object": note_id,
        "to": ALICE
    });

    let first = f.pipeline.post_inbox(&f.db, ALICE, doc(like.clone())).await.unwrap();
    assert!(first.is_some());
    let second = f.pipeline.post_inbox(&f.db, ALICE, doc(like)).await.unwrap();
    assert!(second.is_none());

    let note = f.db.get_entity(&note_id).await.unwrap().unwrap();
    let likes = note.data.first_id("likes").unwrap();
    assert_eq!(f.db.count_collection_items(&likes).await.unwrap(), 1);
    let inbox = collection(&f.db, "inbox").await;
    assert_eq!(f.db.count_collection_items(&inbox).await.unwrap(), 1);
}

#[tokio::test]
async fn inbox_rejects_activity_hosted_elsewhere_than_actor() {
    let f = fixture().await;
    let result = f
        .pipeline
        .post_inbox(
            &f.db,
            ALICE,
            doc(json!({
                "id": "https://evil.example/likes/1",
                "type": "Like",
                "actor": BOB,
                "object": ALICE
            })),
        )
        .await;
    assert!(matches!(result, Err(AppError::Forbidden)));
    assert!(f.db.get_entity("https://evil.example/likes/1").await.unwrap().is_none());
}

#[tokio::test]
async fn follow_is_accepted_automatically() {
    let f = fixture().await;
    f.pipeline
        .post_inbox(
            &f.db,
            ALICE,
            doc(json!({
                "id": "https://remote.example/follows/1",
                "type": "Follow",
                "actor": BOB,
                "object": ALICE
            })),
        )
        .await
        .unwrap()
        .unwrap();

    let followers = collection(&f.db, "followers").await;
    assert!(f.db.find_collection_item(&followers, BOB).await.unwrap().is_some());

    let outbox = collection(&f.db, "outbox").await;
    assert_eq!(f.db.count_collection_items(&outbox).await.unwrap(), 2);
    assert_eq!(inbox_targets(&queued(&f.db).await), vec![BOB_INBOX.to_string()]);
}

#[tokio::test]
async fn blocked_actor_cannot_deliver() {
    let f = fixture().await;
    let block = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Block", "object": BOB})),
        )
        .await
        .unwrap();
    assert!(block.data.is_type("Block"));

    let blocked = collection(&f.db, "_:blocked").await;
    assert!(f.db.find_collection_item(&blocked, BOB).await.unwrap().is_some());
    // Blocks stay private: nothing in the outbox, nothing queued.
    let outbox = collection(&f.db, "outbox").await;
    assert_eq!(f.db.count_collection_items(&outbox).await.unwrap(), 1);
    assert!(queued(&f.db).await.is_empty());

    let result = f
        .pipeline
        .post_inbox(
            &f.db,
            ALICE,
            doc(json!({
                "id": "https://remote.example/follows/2",
                "type": "Follow",
                "actor": BOB,
                "object": ALICE
            })),
        )
        .await;
    assert!(matches!(result, Err(AppError::Forbidden)));
}

#[tokio::test]
async fn undo_follow_removes_follower() {
    let f = fixture().await;
    let follow = json!({
        "id": "https://remote.example/follows/1",
        "type": "Follow",
        "actor": BOB,
        "object": ALICE
    });
    f.pipeline.post_inbox(&f.db, ALICE, doc(follow)).await.unwrap();

    f.pipeline
        .post_inbox(
            &f.db,
            ALICE,
            doc(json!({
                "id": "https://remote.example/undo/1",
                "type": "Undo",
                "actor": BOB,
                "object": "https://remote.example/follows/1"
            })),
        )
        .await
        .unwrap();

    let followers = collection(&f.db, "followers").await;
    assert_eq!(f.db.count_collection_items(&followers).await.unwrap(), 0);
}

#[tokio::test]
async fn inbox_for_unknown_receiver_is_not_found() {
    let f = fixture().await;
    let result = f
        .pipeline
        .post_inbox(
            &f.db,
            "https://local.example/users/nobody",
            doc(json!({"id": "https://remote.example/likes/9", "type": "Like", "actor": BOB})),
        )
        .await;
    assert!(matches!(result, Err(AppError::NotFound)));
}

#[tokio::test]
async fn shared_inbox_finds_addressed_and_following_actors() {
    let f = fixture().await;
    let activity = doc(json!({
        "type": "Create",
        "actor": BOB,
        "to": [ALICE, "https://local.example/users/nobody", PUBLIC_COLLECTION]
    }));
    let recipients = f
        .pipeline
        .shared_inbox_recipients(&f.db, &activity)
        .await
        .unwrap();
    assert_eq!(recipients, vec![ALICE.to_string()]);
}

#[tokio::test]
async fn create_of_existing_actor_is_rejected() {
    let f = fixture().await;
    let carol = "https://local.example/users/carol";
    f.pipeline
        .create_actor(&f.db, "user-2", "carol", None, None)
        .await
        .unwrap();
    let key_before = f.db.get_signing_key(carol).await.unwrap().unwrap();

    let result = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Create", "object": {"id": carol, "type": "Person"}})),
        )
        .await;

    assert!(matches!(result, Err(AppError::InvalidOperation(_))));
    assert!(!f.db.has_actor_permission("user-1", carol).await.unwrap());
    let key_after = f.db.get_signing_key(carol).await.unwrap().unwrap();
    assert_eq!(key_after.public_key_pem, key_before.public_key_pem);
}

#[tokio::test]
async fn create_of_existing_object_is_rejected() {
    let f = fixture().await;
    let create = f
        .pipeline
        .post_outbox(&f.db, ALICE, Some("user-1"), doc(json!({"type": "Note", "content": "x"})))
        .await
        .unwrap();
    let note_id = create.data.first_id("object").unwrap();
    let likes = f
        .db
        .get_entity(&note_id)
        .await
        .unwrap()
        .unwrap()
        .data
        .first_id("likes");

    let result = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Create", "object": note_id})),
        )
        .await;

    assert!(matches!(result, Err(AppError::InvalidOperation(_))));
    let note = f.db.get_entity(&note_id).await.unwrap().unwrap();
    assert_eq!(note.data.first_id("likes"), likes);
}

#[tokio::test]
async fn follow_lands_in_following_until_rejected() {
    let f = fixture().await;
    let follow = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Follow", "object": BOB, "to": BOB})),
        )
        .await
        .unwrap();

    let following = collection(&f.db, "following").await;
    assert!(f.db.find_collection_item(&following, BOB).await.unwrap().is_some());
    assert_eq!(inbox_targets(&queued(&f.db).await), vec![BOB_INBOX.to_string()]);

    f.pipeline
        .post_inbox(
            &f.db,
            ALICE,
            doc(json!({
                "id": "https://remote.example/rejects/1",
                "type": "Reject",
                "actor": BOB,
                "object": follow.id,
                "to": ALICE
            })),
        )
        .await
        .unwrap();
    assert_eq!(f.db.count_collection_items(&following).await.unwrap(), 0);
}

#[tokio::test]
async fn remote_references_are_fetched_before_the_run() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let f = fixture().await;
    let server = MockServer::start().await;
    let carl = format!("{}/users/carl", server.uri());
    Mock::given(method("GET"))
        .and(path("/users/carl"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/activity+json")
                .set_body_json(json!({
                    "id": carl,
                    "type": "Person",
                    "inbox": format!("{carl}/inbox")
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let create = f
        .pipeline
        .post_outbox(
            &f.db,
            ALICE,
            Some("user-1"),
            doc(json!({"type": "Note", "content": "x", "to": PUBLIC_COLLECTION})),
        )
        .await
        .unwrap();
    let note_id = create.data.first_id("object").unwrap();

    let like = doc(json!({
        "id": format!("{}/likes/1", server.uri()),
        "type": "Like",
        "actor": carl,
        "object": note_id,
        "to": ALICE
    }));
    f.pipeline.prefetch(&f.db, &like, ALICE).await.unwrap();
    // Materialized outside any transaction.
    assert!(f.db.get_entity(&carl).await.unwrap().is_some());

    // The run itself is served from the database.
    assert!(f.pipeline.post_inbox(&f.db, ALICE, like).await.unwrap().is_some());
}
