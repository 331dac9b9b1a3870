//! Remote dereferencing
//!
//! Misses with `allow_remote` are fetched over HTTP, flattened and
//! materialized into the layer below, then read back from it.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LINK};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{ConverterRegistry, EntityFlattener, EntityStore, SharedStore};
use crate::data::{ASObject, Database, Entity, PUBLIC_COLLECTION, SigningKey, host_of, is_public_address};
use crate::error::AppError;
use crate::federation::{HostPolicy, sign_request};
use crate::metrics::REMOTE_FETCHES_TOTAL;

const ACCEPT_ACTIVITY: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\", application/activity+json";

/// Result of one GET.
enum Fetched {
    Document(ASObject, String),
    Alternate(String),
    Nothing,
}

/// HTTP side of retrieval, shared by every store chain.
pub struct RemoteFetcher {
    http: reqwest::Client,
    converters: ConverterRegistry,
    policy: HostPolicy,
    timeout: Duration,
}

impl RemoteFetcher {
    pub fn new(
        http: reqwest::Client,
        converters: ConverterRegistry,
        policy: HostPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            converters,
            policy,
            timeout,
        }
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.converters
    }

    /// Fetch and parse the document at `url`.
    ///
    /// Tries `url` itself, then one `Link: rel="alternate"` hop, then the
    /// `.atom` sibling. Returns the document together with the URL it was
    /// finally read from.
    pub async fn fetch(
        &self,
        url: &str,
        key: Option<&SigningKey>,
    ) -> Result<Option<(ASObject, String)>, AppError> {
        match self.get(url, key).await? {
            Fetched::Document(doc, source) => return Ok(Some((doc, source))),
            Fetched::Alternate(alternate) => {
                tracing::debug!(url, alternate = %alternate, "Following alternate link");
                if let Fetched::Document(doc, source) = self.get(&alternate, key).await? {
                    return Ok(Some((doc, source)));
                }
            }
            Fetched::Nothing => {}
        }

        if !url.ends_with(".atom") {
            let sibling = format!("{}.atom", url);
            if let Fetched::Document(doc, source) = self.get(&sibling, key).await? {
                return Ok(Some((doc, source)));
            }
        }

        Ok(None)
    }

    async fn get(&self, url: &str, key: Option<&SigningKey>) -> Result<Fetched, AppError> {
        let parsed = self.policy.check(url).await?;

        let mut request = self
            .http
            .get(parsed.as_str())
            .header(ACCEPT, ACCEPT_ACTIVITY)
            .timeout(self.timeout);
        if let Some(key) = key {
            request = sign_request("GET", parsed.as_str(), None, key)?.apply(request);
        }

        let response = request.send().await?;
        let final_url = response.url().to_string();
        if !response.status().is_success() {
            tracing::debug!(url, status = %response.status(), "Remote fetch failed");
            return Ok(Fetched::Nothing);
        }

        let alternate = response
            .headers()
            .get_all(LINK)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(alternate_link)
            .and_then(|href| parsed.join(&href).ok())
            .map(|url| url.to_string());
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response.bytes().await?;

        match self.converters.convert(&content_type, &body, &final_url)? {
            Some(doc) => Ok(Fetched::Document(doc, final_url)),
            None => Ok(alternate.map(Fetched::Alternate).unwrap_or(Fetched::Nothing)),
        }
    }
}

/// Target of a `Link` header entry with `rel="alternate"`.
fn alternate_link(header: &str) -> Option<String> {
    header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_alternate = parts.any(|param| {
            let param = param.trim();
            param.eq_ignore_ascii_case("rel=\"alternate\"") || param.eq_ignore_ascii_case("rel=alternate")
        });
        if !is_alternate {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

/// Store layer that dereferences what the layers below do not know.
pub struct RetrievingStore {
    next: SharedStore,
    fetcher: Arc<RemoteFetcher>,
    flattener: Arc<EntityFlattener>,
    db: Database,
    signer: Option<String>,
}

impl RetrievingStore {
    pub fn new(
        next: SharedStore,
        fetcher: Arc<RemoteFetcher>,
        flattener: Arc<EntityFlattener>,
        db: Database,
        signer: Option<String>,
    ) -> Self {
        Self {
            next,
            fetcher,
            flattener,
            db,
            signer,
        }
    }

    fn public_collection() -> Entity {
        let data = ASObject::from_value(json!({
            "id": PUBLIC_COLLECTION,
            "type": "Collection",
        }))
        .unwrap_or_default();
        Entity::new(PUBLIC_COLLECTION, data, false)
    }

    /// Fetch `url` and materialize it under `id`.
    async fn retrieve(&self, id: &str, url: &str) -> Result<Option<Entity>, AppError> {
        let key = match &self.signer {
            Some(signer) => self.db.get_signing_key(signer).await?,
            None => None,
        };

        let fetched = match self.fetcher.fetch(url, key.as_ref()).await {
            Ok(Some(fetched)) => fetched,
            Ok(None) => {
                REMOTE_FETCHES_TOTAL.with_label_values(&["not_found"]).inc();
                return Ok(None);
            }
            Err(e) => {
                REMOTE_FETCHES_TOTAL.with_label_values(&["failure"]).inc();
                tracing::warn!(id, url, error = %e, "Remote fetch failed");
                return Ok(None);
            }
        };
        let (mut doc, source) = fetched;

        if doc.id().is_none() {
            doc.set_id(id);
        }
        let source_host = host_of(&source);
        let doc_id = doc.id().unwrap_or(id).to_string();
        if host_of(&doc_id) != source_host {
            REMOTE_FETCHES_TOTAL.with_label_values(&["rejected"]).inc();
            tracing::warn!(id, doc_id = %doc_id, source = %source, "Fetched document claims a foreign id");
            return Ok(None);
        }

        let flattened = match self.flattener.flatten(self.next.as_ref(), doc, false).await {
            Ok(flattened) => flattened,
            Err(e) => {
                REMOTE_FETCHES_TOTAL.with_label_values(&["rejected"]).inc();
                tracing::warn!(id, error = %e, "Fetched document could not be flattened");
                return Ok(None);
            }
        };

        // `id` may name a part of the fetched document, like `actor#key`.
        let wanted = if flattened.get(id).is_some() {
            id.to_string()
        } else {
            flattened.root.clone()
        };

        for entity in flattened.entities {
            if entity.is_owner || host_of(&entity.id) != source_host {
                continue;
            }
            self.next.store_entity(entity).await?;
        }
        REMOTE_FETCHES_TOTAL.with_label_values(&["success"]).inc();
        tracing::debug!(id, source = %source, entity = %wanted, "Materialized remote entity");

        self.next.get_entity(&wanted, false).await
    }
}

#[async_trait]
impl EntityStore for RetrievingStore {
    async fn get_entity(&self, id: &str, allow_remote: bool) -> Result<Option<Entity>, AppError> {
        if is_public_address(id) {
            return Ok(Some(Self::public_collection()));
        }

        if let Some(entity) = self.next.get_entity(id, allow_remote).await? {
            if allow_remote && entity.is_lazy_load() {
                if let Some(href) = entity.data.first_str("href").map(str::to_string) {
                    if let Some(loaded) = self.retrieve(id, &href).await? {
                        return Ok(Some(loaded));
                    }
                }
            }
            return Ok(Some(entity));
        }

        if id.starts_with("tag:") || !allow_remote {
            return Ok(None);
        }

        self.retrieve(id, id).await
    }

    async fn store_entity(&self, entity: Entity) -> Result<Entity, AppError> {
        self.next.store_entity(entity).await
    }

    async fn commit_changes(&self) -> Result<(), AppError> {
        self.next.commit_changes().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::entity_type;
    use crate::entity::{DatabaseStore, StagingStore, UlidMinter};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        store: RetrievingStore,
        db: Database,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("test.db"), 4)
            .await
            .unwrap();
        let next: SharedStore = Arc::new(DatabaseStore::new(db.clone(), chrono::Duration::days(7)));
        let fetcher = Arc::new(RemoteFetcher::new(
            reqwest::Client::new(),
            ConverterRegistry::new(),
            HostPolicy::new(true),
            Duration::from_secs(5),
        ));
        let flattener = Arc::new(EntityFlattener::new(Arc::new(UlidMinter::new(
            "https://local.example",
        ))));
        Fixture {
            store: RetrievingStore::new(next, fetcher, flattener, db.clone(), None),
            db,
            _dir: dir,
        }
    }

    fn activity_json(body: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "application/activity+json")
            .set_body_json(body)
    }

    #[tokio::test]
    async fn public_collection_resolves_without_io() {
        let f = fixture().await;
        let public = f
            .store
            .get_entity(PUBLIC_COLLECTION, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(public.data.first_str("type"), Some("Collection"));
    }

    #[tokio::test]
    async fn tag_uris_and_local_only_reads_do_not_fetch() {
        let f = fixture().await;
        assert!(
            f.store
                .get_entity("tag:remote.example,2018:objectId=1", true)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            f.store
                .get_entity("https://remote.example/n/1", false)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn misses_are_fetched_and_materialized() {
        let f = fixture().await;
        let server = MockServer::start().await;
        let actor_id = format!("{}/users/b", server.uri());

        Mock::given(method("GET"))
            .and(path("/users/b"))
            .respond_with(activity_json(json!({
                "id": actor_id,
                "type": "Person",
                "inbox": format!("{}/inbox", actor_id),
                "publicKey": {
                    "id": format!("{}#main-key", actor_id),
                    "owner": actor_id,
                    "publicKeyPem": "PEM"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let actor = f.store.get_entity(&actor_id, true).await.unwrap().unwrap();
        assert!(!actor.is_owner);
        assert_eq!(actor.entity_type, "Person");
        assert_eq!(
            actor.data.first_str("publicKey"),
            Some(format!("{}#main-key", actor_id).as_str())
        );
        assert!(
            f.db.get_entity(&format!("{}#main-key", actor_id))
                .await
                .unwrap()
                .is_some()
        );

        // Served from the database the second time.
        assert!(f.store.get_entity(&actor_id, true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn key_fragment_resolves_to_the_key_through_staging() {
        let f = fixture().await;
        let server = MockServer::start().await;
        let actor_id = format!("{}/users/b", server.uri());
        let key_id = format!("{}#main-key", actor_id);

        Mock::given(method("GET"))
            .and(path("/users/b"))
            .respond_with(activity_json(json!({
                "id": actor_id,
                "type": "Person",
                "inbox": format!("{}/inbox", actor_id),
                "publicKey": {
                    "id": key_id,
                    "owner": actor_id,
                    "publicKeyPem": "PEM"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let staging = StagingStore::new(Arc::new(f.store));
        let key = staging.get_entity(&key_id, true).await.unwrap().unwrap();
        assert_eq!(key.id, key_id);
        assert_eq!(key.data.first_str("publicKeyPem"), Some("PEM"));

        // The actor came along with its key and is now served locally.
        let actor = staging.get_entity(&actor_id, true).await.unwrap().unwrap();
        assert_eq!(actor.id, actor_id);
        assert_eq!(actor.data.first_id("publicKey"), Some(key_id.clone()));
        assert_eq!(
            staging.get_entity(&key_id, false).await.unwrap().unwrap().id,
            key_id
        );
    }

    #[tokio::test]
    async fn foreign_ids_are_rejected() {
        let f = fixture().await;
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/n/1"))
            .respond_with(activity_json(json!({
                "id": "https://elsewhere.example/n/1",
                "type": "Note"
            })))
            .mount(&server)
            .await;

        let url = format!("{}/n/1", server.uri());
        assert!(f.store.get_entity(&url, true).await.unwrap().is_none());
        assert!(
            f.db.get_entity("https://elsewhere.example/n/1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn alternate_link_is_followed_once() {
        let f = fixture().await;
        let server = MockServer::start().await;
        let url = format!("{}/notice/1", server.uri());

        Mock::given(method("GET"))
            .and(path("/notice/1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .insert_header(
                        "link",
                        "</objects/1>; rel=\"alternate\"; type=\"application/activity+json\"",
                    )
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/objects/1"))
            .respond_with(activity_json(json!({"type": "Note", "content": "hi"})))
            .mount(&server)
            .await;

        let note = f.store.get_entity(&url, true).await.unwrap().unwrap();
        assert_eq!(note.id, url);
        assert_eq!(note.data.first_str("content"), Some("hi"));
    }

    #[tokio::test]
    async fn network_failure_reads_as_missing() {
        let f = fixture().await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = format!("{}/users/gone", server.uri());
        assert!(f.store.get_entity(&url, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lazy_load_stub_is_replaced() {
        let f = fixture().await;
        let server = MockServer::start().await;
        let stub_id = format!("{}/n/lazy", server.uri());

        let stub = Entity::new(
            &stub_id,
            ASObject::from_value(json!({"id": stub_id, "href": format!("{}/n/lazy.json", server.uri())}))
                .unwrap(),
            false,
        )
        .with_type(entity_type::LAZY_LOAD);
        f.db.upsert_entity(&stub).await.unwrap();

        Mock::given(method("GET"))
            .and(path("/n/lazy.json"))
            .respond_with(activity_json(json!({"id": stub_id, "type": "Note"})))
            .mount(&server)
            .await;

        let loaded = f.store.get_entity(&stub_id, true).await.unwrap().unwrap();
        assert_eq!(loaded.entity_type, "Note");

        // The stub row itself was overwritten.
        let raw = f.db.get_entity(&stub_id).await.unwrap().unwrap();
        assert_eq!(raw.entity_type, "Note");
    }

    #[test]
    fn alternate_link_parsing() {
        assert_eq!(
            alternate_link("<https://r.example/a>; rel=\"alternate\"; type=\"application/activity+json\""),
            Some("https://r.example/a".to_string())
        );
        assert_eq!(alternate_link("<https://r.example/a>; rel=\"self\""), None);
    }
}
