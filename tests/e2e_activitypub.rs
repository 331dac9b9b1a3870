//! E2E tests for ActivityPub endpoints

mod common;

use apcore::data::SigningKey;
use apcore::federation::{generate_key_pair, sign_request};
use common::{BASE_URL, TestServer};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A remote actor served by a mock peer.
struct RemotePeer {
    server: MockServer,
    actor_id: String,
    key: SigningKey,
}

async fn remote_peer() -> RemotePeer {
    let server = MockServer::start().await;
    let actor_id = format!("{}/users/bob", server.uri());
    let (private_key_pem, public_key_pem) = generate_key_pair(1024).unwrap();
    let key = SigningKey {
        entity_id: actor_id.clone(),
        private_key_pem,
        public_key_pem,
    };

    let actor = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": actor_id,
        "type": "Person",
        "preferredUsername": "bob",
        "inbox": format!("{}/inbox", actor_id),
        "outbox": format!("{}/outbox", actor_id),
        "publicKey": {
            "id": key.key_id(),
            "owner": actor_id,
            "publicKeyPem": key.public_key_pem
        }
    });
    Mock::given(method("GET"))
        .and(path("/users/bob"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(serde_json::to_vec(&actor).unwrap(), "application/activity+json"),
        )
        .mount(&server)
        .await;

    RemotePeer {
        server,
        actor_id,
        key,
    }
}

async fn post_signed(
    server: &TestServer,
    url: &str,
    key: &SigningKey,
    activity: &Value,
) -> reqwest::Response {
    let body = serde_json::to_vec(activity).unwrap();
    let headers = sign_request("POST", url, Some(&body), key).unwrap();
    headers
        .apply(server.client.post(url))
        .header("Content-Type", "application/activity+json")
        .body(body)
        .send()
        .await
        .unwrap()
}

/// Id of a reference that may come back nested.
fn id_of(value: &Value) -> String {
    value
        .as_str()
        .or_else(|| value["id"].as_str())
        .expect("reference has an id")
        .to_string()
}

async fn post_note(server: &TestServer, actor: &Value, token: &str) -> Value {
    let response = server
        .client
        .post(server.url_of(&id_of(&actor["outbox"])))
        .bearer_auth(token)
        .header("Content-Type", "application/activity+json")
        .json(&json!({
            "type": "Note",
            "content": "Hello, fediverse",
            "to": "https://www.w3.org/ns/activitystreams#Public"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    response.json().await.unwrap()
}

async fn total_items(server: &TestServer, collection: &str, token: Option<&str>) -> i64 {
    let response = server.get_json(&server.url_of(collection), token).await;
    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    json["totalItems"].as_i64().unwrap()
}

#[tokio::test]
async fn test_create_actor_returns_rendered_actor() {
    let server = TestServer::new().await;
    let token = server
        .create_test_token("user-1", Some(&format!("{}/users/alice", BASE_URL)))
        .await;

    let response = server
        .client
        .post(server.url("/actors"))
        .bearer_auth(&token)
        .json(&json!({ "preferredUsername": "alice", "name": "Alice" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    let actor_id = format!("{}/users/alice", BASE_URL);
    assert_eq!(response.headers()["location"].to_str().unwrap(), actor_id);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/activity+json"
    );

    let actor: Value = response.json().await.unwrap();
    assert_eq!(actor["@context"], "https://www.w3.org/ns/activitystreams");
    assert_eq!(actor["id"], actor_id);
    assert_eq!(actor["type"], "Person");
    assert_eq!(actor["name"], "Alice");
    assert_eq!(actor["inbox"], format!("{}/inbox", actor_id));
    assert_eq!(actor["outbox"], format!("{}/outbox", actor_id));
    assert!(actor["publicKey"]["publicKeyPem"].is_string());
    assert!(
        actor.as_object().unwrap().keys().all(|key| !key.starts_with("_:")),
        "private predicates leaked: {}",
        actor
    );
}

#[tokio::test]
async fn test_create_actor_requires_token() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/actors"))
        .json(&json!({ "preferredUsername": "alice" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_create_actor_rejects_taken_username() {
    let server = TestServer::new().await;
    let (_, token) = server.create_test_actor("user-1", "alice").await;

    let response = server
        .client
        .post(server.url("/actors"))
        .bearer_auth(&token)
        .json(&json!({ "preferredUsername": "alice" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_actor_endpoint() {
    let server = TestServer::new().await;
    server.create_test_actor("user-1", "alice").await;

    let response = server.get_json(&server.url("/users/alice"), None).await;

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "Person");
    assert!(json.get("inbox").is_some());
    assert!(json.get("outbox").is_some());
    assert!(json.get("publicKey").is_some());
}

#[tokio::test]
async fn test_unknown_entity_is_not_found() {
    let server = TestServer::new().await;

    let response = server.get_json(&server.url("/users/nobody"), None).await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_outbox_post_creates_note() {
    let server = TestServer::new().await;
    let (actor, token) = server.create_test_actor("user-1", "alice").await;

    let create = post_note(&server, &actor, &token).await;
    assert_eq!(create["type"], "Create");
    assert_eq!(id_of(&create["actor"]), id_of(&actor["id"]));

    let note_id = id_of(&create["object"]);
    let response = server.get_json(&server.url_of(&note_id), None).await;
    assert_eq!(response.status(), 200);
    let note: Value = response.json().await.unwrap();
    assert_eq!(note["type"], "Note");
    assert_eq!(id_of(&note["attributedTo"]), id_of(&actor["id"]));
    assert!(note["likes"].is_string());

    // The actor's own Create plus the note's.
    assert_eq!(total_items(&server, &id_of(&actor["outbox"]), None).await, 2);
}

#[tokio::test]
async fn test_outbox_post_sets_location() {
    let server = TestServer::new().await;
    let (actor, token) = server.create_test_actor("user-1", "alice").await;

    let response = server
        .client
        .post(server.url_of(&id_of(&actor["outbox"])))
        .bearer_auth(&token)
        .json(&json!({ "type": "Note", "content": "hi" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    let location = response.headers()["location"].to_str().unwrap().to_string();
    let create: Value = response.json().await.unwrap();
    assert_eq!(create["id"], location);
}

#[tokio::test]
async fn test_outbox_requires_token() {
    let server = TestServer::new().await;
    let (actor, _) = server.create_test_actor("user-1", "alice").await;

    let response = server
        .client
        .post(server.url_of(&id_of(&actor["outbox"])))
        .json(&json!({ "type": "Note", "content": "hi" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_outbox_rejects_other_users() {
    let server = TestServer::new().await;
    let (actor, _) = server.create_test_actor("user-1", "alice").await;
    let stranger = server.create_test_token("user-2", None).await;

    let response = server
        .client
        .post(server.url_of(&id_of(&actor["outbox"])))
        .bearer_auth(&stranger)
        .json(&json!({ "type": "Note", "content": "hi" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_outbox_rejects_acting_as_someone_else() {
    let server = TestServer::new().await;
    let (actor, token) = server.create_test_actor("user-1", "alice").await;

    let response = server
        .client
        .post(server.url_of(&id_of(&actor["outbox"])))
        .bearer_auth(&token)
        .json(&json!({
            "type": "Like",
            "actor": "https://remote.example/users/mallory",
            "object": "https://remote.example/notes/1"
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_outbox_pages_walk_newest_first() {
    let server = TestServer::new().await;
    let (actor, token) = server.create_test_actor("user-1", "alice").await;
    let first = post_note(&server, &actor, &token).await;
    let second = post_note(&server, &actor, &token).await;

    let response = server
        .get_json(&server.url_of(&id_of(&actor["outbox"])), Some(&token))
        .await;
    let outbox: Value = response.json().await.unwrap();
    assert_eq!(outbox["type"], "OrderedCollection");
    assert_eq!(outbox["totalItems"], 3);

    let page_url = server.url_of(&id_of(&outbox["first"]));
    let page: Value = server
        .get_json(&page_url, Some(&token))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(page["type"], "OrderedCollectionPage");
    assert_eq!(page["partOf"], outbox["id"]);
    let items: Vec<String> = page["orderedItems"]
        .as_array()
        .unwrap()
        .iter()
        .map(id_of)
        .collect();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0], id_of(&second["id"]));
    assert_eq!(items[1], id_of(&first["id"]));
}

#[tokio::test]
async fn test_block_lists_are_private() {
    let server = TestServer::new().await;
    let (actor, token) = server.create_test_actor("user-1", "alice").await;
    let blocked = format!("{}/blocked", id_of(&actor["id"]));

    let anonymous = server.get_json(&server.url_of(&blocked), None).await;
    assert_eq!(anonymous.status(), 404);

    let owner = server.get_json(&server.url_of(&blocked), Some(&token)).await;
    assert_eq!(owner.status(), 200);
}

#[tokio::test]
async fn test_inbox_endpoint_rejects_unsigned_activity() {
    let server = TestServer::new().await;
    let (actor, _) = server.create_test_actor("user-1", "alice").await;

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example.com/follows/1",
        "type": "Follow",
        "actor": "https://remote.example.com/users/alice",
        "object": actor["id"]
    });

    let response = server
        .client
        .post(server.url_of(&id_of(&actor["inbox"])))
        .header("Content-Type", "application/activity+json")
        .json(&activity)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_inbox_rejects_signature_key_id_actor_mismatch() {
    let server = TestServer::new().await;
    let (actor, _) = server.create_test_actor("user-1", "alice").await;
    let peer = remote_peer().await;

    let mallory = SigningKey {
        entity_id: format!("{}/users/mallory", peer.server.uri()),
        ..peer.key.clone()
    };
    let activity = json!({
        "id": format!("{}/follows/1", peer.server.uri()),
        "type": "Follow",
        "actor": peer.actor_id,
        "object": actor["id"]
    });

    let inbox = server.url_of(&id_of(&actor["inbox"]));
    let response = post_signed(&server, &inbox, &mallory, &activity).await;

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_inbox_rejects_wrong_key() {
    let server = TestServer::new().await;
    let (actor, _) = server.create_test_actor("user-1", "alice").await;
    let peer = remote_peer().await;

    let (private_key_pem, public_key_pem) = generate_key_pair(1024).unwrap();
    let forged = SigningKey {
        entity_id: peer.actor_id.clone(),
        private_key_pem,
        public_key_pem,
    };
    let activity = json!({
        "id": format!("{}/follows/1", peer.server.uri()),
        "type": "Follow",
        "actor": peer.actor_id,
        "object": actor["id"]
    });

    let inbox = server.url_of(&id_of(&actor["inbox"]));
    let response = post_signed(&server, &inbox, &forged, &activity).await;

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_signed_like_is_recorded_once() {
    let server = TestServer::new().await;
    let (actor, token) = server.create_test_actor("user-1", "alice").await;
    let create = post_note(&server, &actor, &token).await;
    let note_id = id_of(&create["object"]);
    let peer = remote_peer().await;

    let like = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/likes/1", peer.server.uri()),
        "type": "Like",
        "actor": peer.actor_id,
        "object": note_id,
        "to": actor["id"]
    });
    let inbox = server.url_of(&id_of(&actor["inbox"]));

    let response = post_signed(&server, &inbox, &peer.key, &like).await;
    assert_eq!(response.status(), 202);

    let note: Value = server
        .get_json(&server.url_of(&note_id), None)
        .await
        .json()
        .await
        .unwrap();
    let likes = id_of(&note["likes"]);
    assert_eq!(total_items(&server, &likes, None).await, 1);

    // Redelivery is acknowledged but changes nothing.
    let response = post_signed(&server, &inbox, &peer.key, &like).await;
    assert_eq!(response.status(), 202);
    assert_eq!(total_items(&server, &likes, None).await, 1);
    assert_eq!(
        total_items(&server, &id_of(&actor["inbox"]), Some(&token)).await,
        1
    );
}

#[tokio::test]
async fn test_shared_inbox_routes_to_addressed_actors() {
    let server = TestServer::new().await;
    let (alice, alice_token) = server.create_test_actor("user-1", "alice").await;
    let (carol, carol_token) = server.create_test_actor("user-2", "carol").await;
    let peer = remote_peer().await;

    let note = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/activities/1", peer.server.uri()),
        "type": "Create",
        "actor": peer.actor_id,
        "to": alice["id"],
        "object": {
            "id": format!("{}/notes/1", peer.server.uri()),
            "type": "Note",
            "attributedTo": peer.actor_id,
            "content": "<p>hi</p><script>alert(1)</script>",
            "to": alice["id"]
        }
    });

    let response = post_signed(&server, &server.url("/inbox"), &peer.key, &note).await;
    assert_eq!(response.status(), 202);

    assert_eq!(
        total_items(&server, &id_of(&alice["inbox"]), Some(&alice_token)).await,
        1
    );
    assert_eq!(
        total_items(&server, &id_of(&carol["inbox"]), Some(&carol_token)).await,
        0
    );

    let stored = server
        .state
        .db
        .get_entity(&format!("{}/notes/1", peer.server.uri()))
        .await
        .unwrap()
        .unwrap();
    let content = stored.data.first_str("content").unwrap();
    assert!(!content.contains("<script>"));
}

#[tokio::test]
async fn test_unsigned_inbox_accepted_when_not_required() {
    let server = TestServer::with_config(|config| {
        config.federation.require_signatures = false;
    })
    .await;
    let (actor, token) = server.create_test_actor("user-1", "alice").await;
    let peer = remote_peer().await;

    let follow = json!({
        "id": format!("{}/follows/1", peer.server.uri()),
        "type": "Follow",
        "actor": peer.actor_id,
        "object": actor["id"]
    });

    let response = server
        .client
        .post(server.url_of(&id_of(&actor["inbox"])))
        .json(&follow)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    // Auto-accepted: the follower is listed and an Accept was published.
    assert_eq!(
        total_items(&server, &id_of(&actor["followers"]), Some(&token)).await,
        1
    );
    assert_eq!(
        total_items(&server, &id_of(&actor["outbox"]), Some(&token)).await,
        2
    );
}
