//! ActivityPub endpoints
//!
//! Entities are served from the URL they are named by: any path not
//! routed elsewhere is looked up as `{base_url}{path}`. `POST` to such a
//! path is accepted only when it names a local inbox or outbox.
//!
//! - `GET  /*`       - any stored entity or collection page
//! - `POST /*`       - a local actor's inbox (signed) or outbox (bearer token)
//! - `POST /inbox`   - shared inbox
//! - `POST /actors`  - create a local actor for the token's user

use axum::body::Bytes;
use axum::{
    Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Json, Response},
    routing::{MethodRouter, get, post},
};
use serde::Deserialize;

use super::auth::{CurrentUser, MaybeUser};
use crate::AppState;
use crate::data::{ASObject, Entity, entity_type, strip_fragment};
use crate::entity::{EntityStore, StoreChain, StoreOptions, split_page_id};
use crate::error::AppError;
use crate::federation::{
    extract_signature_key_id, key_id_matches_actor, public_key_pem_from, verify_signature,
};

pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Named routes. Entity reads and box posts are the fallback, see
/// [`entity_fallback`].
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/inbox", post(shared_inbox))
        .route("/actors", post(create_actor))
}

/// `GET` and `POST` for every path that names an entity.
pub fn entity_fallback() -> MethodRouter<AppState> {
    get(get_entity).post(post_to_box)
}

/// The id a request path names.
fn entity_id(state: &AppState, uri: &Uri) -> String {
    let base = state.config.server.base_url();
    match uri.query() {
        Some(query) => format!("{}{}?{}", base, uri.path(), query),
        None => format!("{}{}", base, uri.path()),
    }
}

fn activity_response(status: StatusCode, location: Option<&str>, doc: ASObject) -> Response {
    let mut response = (
        status,
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        Json(doc.into_value()),
    )
        .into_response();
    if let Some(location) = location.and_then(|l| HeaderValue::from_str(l).ok()) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    response
}

fn parse_document(body: &[u8]) -> Result<ASObject, AppError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
    ASObject::from_value(value)
        .ok_or_else(|| AppError::Validation("Expected a JSON object".to_string()))
}

/// Render `entity` for output: nested one level, private predicates
/// removed, `@context` added.
async fn render(state: &AppState, chain: &StoreChain, entity: &Entity) -> Result<ASObject, AppError> {
    let doc = state
        .pipeline
        .stores()
        .flattener()
        .unflatten(chain.staging.as_ref(), entity, 1, false)
        .await?;
    Ok(doc.without_private().with_context())
}

/// Whether `viewer` may read `entity`.
///
/// Actors and server-maintained collections are readable by anyone (the
/// collection filters its items per viewer), except the block lists which
/// only their owner sees. Other objects need to be public or address the
/// viewer.
fn visible_to(entity: &Entity, viewer: Option<&str>) -> bool {
    let owner = entity.data.first_id("attributedTo");
    match entity.entity_type.as_str() {
        entity_type::BLOCKS | entity_type::BLOCKED => {
            viewer.is_some() && owner.as_deref() == viewer
        }
        _ if entity.is_actor() || entity.is_internal_collection() => true,
        _ => {
            entity.data.is_public()
                || viewer.is_some_and(|viewer| entity.data.audience().iter().any(|id| id == viewer))
        }
    }
}

/// GET /*
///
/// Content-Type: application/activity+json
async fn get_entity(
    State(state): State<AppState>,
    user: MaybeUser,
    uri: Uri,
) -> Result<Response, AppError> {
    let id = entity_id(&state, &uri);
    let viewer = user.viewer();

    // Pages are guarded by the collection they belong to.
    let guarded = split_page_id(&id).map(|(base, _)| base).unwrap_or(&id);
    let stored = state
        .db
        .get_entity(guarded)
        .await?
        .filter(|entity| entity.is_owner)
        .ok_or(AppError::NotFound)?;
    if !visible_to(&stored, viewer.as_deref()) {
        return Err(AppError::NotFound);
    }

    let chain = state.pipeline.stores().build(
        &state.db,
        StoreOptions {
            viewer,
            signer: None,
        },
    );
    let entity = chain
        .staging
        .get_entity(&id, false)
        .await?
        .ok_or(AppError::NotFound)?;
    let doc = render(&state, &chain, &entity).await?;
    Ok(activity_response(StatusCode::OK, None, doc))
}

/// POST /*
///
/// Inbox deliveries answer 202, outbox submissions 201 with the activity's
/// `Location`.
async fn post_to_box(
    State(state): State<AppState>,
    user: MaybeUser,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let id = entity_id(&state, &uri);
    let target = state
        .db
        .get_entity(&id)
        .await?
        .filter(|entity| entity.is_owner)
        .ok_or(AppError::NotFound)?;
    let owner = target
        .data
        .first_id("attributedTo")
        .ok_or(AppError::NotFound)?;

    match target.entity_type.as_str() {
        entity_type::INBOX => {
            let activity = parse_document(&body)?;
            verify_inbound(&state, &uri, &headers, &body, &activity).await?;

            let delivered = {
                let _processing = state.processing.lock().await;
                state.pipeline.post_inbox(&state.db, &owner, activity).await?
            };
            match delivered {
                Some(activity) => {
                    tracing::debug!(inbox = %id, activity = %activity.id, "Inbox delivery accepted");
                }
                None => tracing::debug!(inbox = %id, "Duplicate inbox delivery ignored"),
            }
            Ok(StatusCode::ACCEPTED.into_response())
        }
        entity_type::OUTBOX => {
            let token = user.0.ok_or(AppError::Unauthorized)?;
            if !state.db.has_actor_permission(&token.user_id, &owner).await? {
                tracing::warn!(user = %token.user_id, actor = %owner, "User may not act as actor");
                return Err(AppError::Forbidden);
            }

            let doc = parse_document(&body)?;
            let activity = state
                .pipeline
                .post_outbox(&state.db, &owner, Some(&token.user_id), doc)
                .await?;

            let chain = state.pipeline.stores().build(
                &state.db,
                StoreOptions {
                    viewer: Some(owner),
                    signer: None,
                },
            );
            let doc = render(&state, &chain, &activity).await?;
            Ok(activity_response(StatusCode::CREATED, Some(&activity.id), doc))
        }
        _ => Err(AppError::NotFound),
    }
}

/// POST /inbox
///
/// Shared inbox: the activity is delivered to the inbox of every local
/// actor it is meant for.
async fn shared_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let activity = parse_document(&body)?;
    verify_inbound(&state, &uri, &headers, &body, &activity).await?;

    let recipients = state
        .pipeline
        .shared_inbox_recipients(&state.db, &activity)
        .await?;
    if recipients.is_empty() {
        tracing::debug!(activity = ?activity.id(), "Shared inbox delivery has no local recipients");
    }

    let _processing = state.processing.lock().await;
    for receiver in recipients {
        if let Err(e) = state
            .pipeline
            .post_inbox(&state.db, &receiver, activity.clone())
            .await
        {
            tracing::warn!(receiver = %receiver, error = %e, "Shared inbox delivery rejected");
        }
    }
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateActorRequest {
    preferred_username: String,
    name: Option<String>,
    summary: Option<String>,
}

/// POST /actors
async fn create_actor(
    State(state): State<AppState>,
    CurrentUser(token): CurrentUser,
    Json(request): Json<CreateActorRequest>,
) -> Result<Response, AppError> {
    let create = state
        .pipeline
        .create_actor(
            &state.db,
            &token.user_id,
            &request.preferred_username,
            request.name.as_deref(),
            request.summary.as_deref(),
        )
        .await?;

    let actor_id = create
        .data
        .first_id("object")
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Create lost its actor")))?;
    let chain = state.pipeline.stores().build(
        &state.db,
        StoreOptions {
            viewer: Some(actor_id.clone()),
            signer: None,
        },
    );
    let actor = chain
        .staging
        .get_entity(&actor_id, false)
        .await?
        .ok_or(AppError::NotFound)?;
    let doc = render(&state, &chain, &actor).await?;
    Ok(activity_response(StatusCode::CREATED, Some(&actor_id), doc))
}

/// Check the HTTP signature of an inbound delivery against its actor's key.
///
/// Unsigned deliveries pass only when signatures are not required.
async fn verify_inbound(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
    activity: &ASObject,
) -> Result<(), AppError> {
    if headers.get("signature").is_none() {
        if state.config.federation.require_signatures {
            return Err(AppError::Unauthorized);
        }
        tracing::debug!(activity = ?activity.id(), "Accepting unsigned delivery");
        return Ok(());
    }

    let actor = activity
        .first_id("actor")
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?;

    // Ensure keyId points to the same actor before fetching remote key material.
    let key_id = extract_signature_key_id(headers)?;
    if !key_id_matches_actor(&key_id, &actor) {
        return Err(AppError::Validation(
            "Signature keyId actor mismatch".to_string(),
        ));
    }

    let chain = state
        .pipeline
        .stores()
        .build(&state.db, StoreOptions::default());
    let public_key_pem = find_public_key(&chain, &key_id, &actor)
        .await?
        .ok_or(AppError::InvalidSignature)?;

    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.path());
    verify_signature("POST", path, headers, Some(body), &public_key_pem)
}

/// Resolve the PEM behind `key_id`, from the key document itself or from
/// the actor that publishes it.
async fn find_public_key(
    chain: &StoreChain,
    key_id: &str,
    actor: &str,
) -> Result<Option<String>, AppError> {
    for candidate in [key_id, strip_fragment(actor)] {
        let Some(document) = chain.staging.get_entity(candidate, true).await? else {
            continue;
        };
        if let Some(pem) = public_key_pem_from(&document.data, key_id) {
            return Ok(Some(pem));
        }

        // Embedded keys are stored as entities of their own.
        let mut keys = document.data.ids("publicKey");
        keys.sort_by_key(|id| id != key_id);
        for id in keys {
            let pem = chain
                .staging
                .get_entity(&id, false)
                .await?
                .and_then(|key| key.data.first_str("publicKeyPem").map(str::to_string));
            if pem.is_some() {
                return Ok(pem);
            }
        }
    }
    Ok(None)
}
