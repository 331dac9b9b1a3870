//! WebSub endpoints
//!
//! - `POST /websub/hub`           - subscribe to a local actor's feed
//! - `GET  /websub/callback/:id`  - a remote hub verifies our subscription
//! - `POST /websub/callback/:id`  - a remote hub pushes content

use axum::body::Bytes;
use axum::{
    Form, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    routing::{get, post},
};

use crate::AppState;
use crate::error::AppError;
use crate::websub::{HubRequest, VerificationQuery, authenticate_push, confirm_client_subscription};

pub fn websub_router() -> Router<AppState> {
    Router::new()
        .route("/websub/hub", post(hub))
        .route("/websub/callback/:id", get(verify_callback).post(push_callback))
}

/// POST /websub/hub
///
/// Answers 202 once the subscriber echoed the challenge.
async fn hub(
    State(state): State<AppState>,
    Form(request): Form<HubRequest>,
) -> Result<StatusCode, AppError> {
    state.hub.handle_request(&state.db, request).await?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /websub/callback/:id
async fn verify_callback(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<VerificationQuery>,
) -> Result<String, AppError> {
    confirm_client_subscription(&state.db, id, &query).await
}

/// POST /websub/callback/:id
///
/// The pushed feed is converted and delivered to the inbox of the local
/// actor that subscribed. Feeds no converter understands are acknowledged
/// and dropped.
async fn push_callback(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let signature = headers
        .get("x-hub-signature")
        .and_then(|value| value.to_str().ok());
    let client = authenticate_push(&state.db, id, &body, signature).await?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/atom+xml");
    let Some(activity) = state
        .fetcher
        .converters()
        .convert(content_type, &body, &client.topic)?
    else {
        tracing::debug!(client = client.id, content_type, "No converter for pushed content");
        return Ok(StatusCode::ACCEPTED);
    };

    let _processing = state.processing.lock().await;
    state
        .pipeline
        .post_inbox(&state.db, &client.for_user, activity)
        .await?;
    Ok(StatusCode::ACCEPTED)
}
