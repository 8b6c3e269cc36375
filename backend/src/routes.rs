//! HTTP control plane: session creation/joining, the anchor REST surface,
//! and the health endpoint.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use lattice_types::ColocalizationMethod;

use crate::anchors::{AnchorQuery, CreateAnchor, SpatialAnchor, UpdateAnchor};
use crate::app::AppState;
use crate::error::ApiError;
use crate::fanout::{identity_from_bearer, sync_broadcast, ws_handler};
use crate::persistence::PermissionLevel;
use crate::protocol::{check_metadata, check_position, check_rotation, MessageError};
use crate::sessions::ANONYMOUS_MAX_PLAYERS;
use crate::sync::AnchorEvent;
use crate::util::now_ms;

pub fn control_plane() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ws/:session_id", get(ws_handler))
        .route("/api/v1/session/create", post(create_session))
        .route("/api/v1/session/anonymous/create", post(create_anonymous_session))
        .route("/api/v1/session/anonymous/join", post(join_anonymous_session))
        .route("/api/session/:id_or_code", get(session_info))
        .route("/anchors", post(create_anchor))
        .route("/anchors/query", post(query_anchors))
        .route(
            "/anchors/:id",
            get(get_anchor).put(update_anchor).delete(delete_anchor),
        )
        .route("/anchors/:id/share", post(share_anchor))
        .route("/sessions/:id/anchors", get(session_anchors))
        .route("/nearby", get(nearby_anchors))
        .route("/users/:id/shared-anchors", get(shared_anchors))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization").and_then(|v| v.to_str().ok())
}

fn validation(e: MessageError) -> ApiError {
    match e {
        MessageError::InvalidJson => ApiError::InvalidJson,
        MessageError::Validation(detail) => ApiError::Validation(detail),
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

async fn health(State(app): State<AppState>) -> Json<Value> {
    let persistence_healthy = app.anchors.health().await;
    let uptime_secs = (now_ms() - app.started_at_ms) / 1000;
    Json(json!({
        "status": if persistence_healthy { "healthy" } else { "degraded" },
        "service": "lattice-backend",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime_secs,
        "active_sessions": app.sessions.session_count().await,
        "sync_clients": app.sync.client_count().await,
        "persistence": persistence_healthy,
        "upstreams": app.registry.status_summary().await,
    }))
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    #[serde(default = "default_max_players")]
    max_players: u32,
    #[serde(default)]
    colocalization_method: ColocalizationMethod,
}

fn default_max_players() -> u32 {
    8
}

async fn create_session(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<Json<Value>, ApiError> {
    let identity = identity_from_bearer(&app, bearer(&headers)).await?;
    let permissions = app.auth.permissions_for(&identity);
    if permissions.max_sessions == 0 {
        return Err(ApiError::PermissionDenied("not allowed to create sessions".into()));
    }

    let request = body.map(|Json(r)| r).unwrap_or(CreateSessionRequest {
        max_players: default_max_players(),
        colocalization_method: ColocalizationMethod::default(),
    });

    let max_players = request.max_players.clamp(1, crate::sessions::MAX_PLAYERS_CAP);
    let session_id = app
        .sessions
        .create_session(identity.id(), max_players, request.colocalization_method)
        .await;

    Ok(Json(json!({
        "success": true,
        "session_id": session_id.to_string(),
        "max_players": max_players,
        "colocalization_method": request.colocalization_method,
        "creator": identity.display_name(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct AnonymousCreateRequest {
    display_name: Option<String>,
    #[serde(default)]
    colocalization_method: ColocalizationMethod,
}

async fn create_anonymous_session(
    State(app): State<AppState>,
    body: Option<Json<AnonymousCreateRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let creator = app.auth.mint_anonymous(request.display_name);
    let session_id = app
        .sessions
        .create_session(creator.id(), ANONYMOUS_MAX_PLAYERS, request.colocalization_method)
        .await;
    let share_code = app.codes.issue(session_id).await?;

    Ok(Json(json!({
        "session_id": session_id.to_string(),
        "share_code": share_code,
        "creator": {
            "id": creator.id(),
            "display_name": creator.display_name(),
            "is_anonymous": true,
        },
        "expires_in": app.codes.ttl_secs(),
        "max_players": ANONYMOUS_MAX_PLAYERS,
        "created_at": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
struct AnonymousJoinRequest {
    code: String,
    display_name: Option<String>,
}

async fn join_anonymous_session(
    State(app): State<AppState>,
    Json(request): Json<AnonymousJoinRequest>,
) -> Result<Json<Value>, ApiError> {
    let session_id = app
        .codes
        .resolve(&request.code)
        .await
        .ok_or(ApiError::SessionNotFound)?;
    let summary = app.sessions.summary(session_id).await.ok_or(ApiError::SessionNotFound)?;

    let user = app.auth.mint_anonymous(request.display_name);
    app.codes.extend(session_id).await;
    let expires_in = app.codes.expires_in(session_id).await.unwrap_or(0);

    Ok(Json(json!({
        "session_id": session_id.to_string(),
        "user": {
            "id": user.id(),
            "display_name": user.display_name(),
            "is_anonymous": true,
        },
        "share_code": request.code.to_ascii_uppercase(),
        "session_info": {
            "max_players": summary.max_players,
            "expires_in": expires_in,
        },
    })))
}

async fn session_info(
    State(app): State<AppState>,
    Path(id_or_code): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = match id_or_code.parse::<Uuid>() {
        Ok(id) => id,
        Err(_) => app
            .codes
            .resolve(&id_or_code)
            .await
            .ok_or(ApiError::SessionNotFound)?,
    };
    let summary = app.sessions.summary(session_id).await.ok_or(ApiError::SessionNotFound)?;
    Ok(Json(serde_json::to_value(summary).unwrap_or_default()))
}

// ── Anchor REST ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateAnchorRequest {
    session_id: String,
    user_id: String,
    position: [f64; 3],
    rotation: [f64; 4],
    #[serde(default)]
    anchor_type: lattice_types::AnchorType,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    lifetime_hours: Option<f64>,
}

async fn create_anchor(
    State(app): State<AppState>,
    Json(request): Json<CreateAnchorRequest>,
) -> Result<Json<SpatialAnchor>, ApiError> {
    check_position(&request.position).map_err(validation)?;
    check_rotation(&request.rotation).map_err(validation)?;
    check_metadata(request.metadata.as_ref()).map_err(validation)?;

    let session_id = request.session_id.clone();
    let anchor = app
        .anchors
        .create(CreateAnchor {
            session_id: request.session_id,
            user_id: request.user_id,
            anchor_id: None,
            position: request.position,
            rotation: request.rotation,
            anchor_type: request.anchor_type,
            metadata: request.metadata,
            lifetime_hours: request.lifetime_hours,
        })
        .await?;

    if let Ok(session_id) = session_id.parse::<Uuid>() {
        sync_broadcast(&app, session_id, AnchorEvent::Created(anchor.clone()), None).await;
    }
    Ok(Json(anchor))
}

async fn get_anchor(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SpatialAnchor>, ApiError> {
    app.anchors.get(&id).await.map(Json).ok_or(ApiError::AnchorNotFound)
}

async fn update_anchor(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<UpdateAnchor>,
) -> Result<Json<SpatialAnchor>, ApiError> {
    if let Some(position) = &update.position {
        check_position(position).map_err(validation)?;
    }
    if let Some(rotation) = &update.rotation {
        check_rotation(rotation).map_err(validation)?;
    }
    check_metadata(update.metadata.as_ref()).map_err(validation)?;

    let anchor = app
        .anchors
        .update(&id, update)
        .await?
        .ok_or(ApiError::AnchorNotFound)?;

    if let Ok(session_id) = anchor.session_id.parse::<Uuid>() {
        sync_broadcast(&app, session_id, AnchorEvent::Updated(anchor.clone()), None).await;
    }
    Ok(Json(anchor))
}

async fn delete_anchor(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = app.anchors.get(&id).await.map(|a| a.session_id);
    let deleted = app.anchors.delete(&id).await?;

    if deleted {
        if let Some(session_id) = session_id.and_then(|s| s.parse::<Uuid>().ok()) {
            sync_broadcast(&app, session_id, AnchorEvent::Deleted(id.clone()), None).await;
        }
    }
    Ok(Json(json!({ "success": true, "deleted": deleted })))
}

async fn query_anchors(
    State(app): State<AppState>,
    Json(query): Json<AnchorQuery>,
) -> Json<Vec<SpatialAnchor>> {
    Json(app.anchors.query(&query).await)
}

async fn session_anchors(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<SpatialAnchor>> {
    Json(app.anchors.session_anchors(&id).await)
}

#[derive(Debug, Deserialize)]
struct NearbyParams {
    x: f64,
    y: f64,
    z: f64,
    radius: f64,
    #[serde(default = "default_nearby_limit")]
    limit: usize,
}

fn default_nearby_limit() -> usize {
    50
}

async fn nearby_anchors(
    State(app): State<AppState>,
    Query(params): Query<NearbyParams>,
) -> Result<Json<Vec<SpatialAnchor>>, ApiError> {
    let anchors = app
        .anchors
        .nearby([params.x, params.y, params.z], params.radius, params.limit)
        .await?;
    Ok(Json(anchors))
}

#[derive(Debug, Deserialize)]
struct ShareAnchorRequest {
    shared_with_user: String,
    #[serde(default)]
    permission_level: PermissionLevel,
    #[serde(default)]
    expires_hours: Option<f64>,
}

async fn share_anchor(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ShareAnchorRequest>,
) -> Result<Json<Value>, ApiError> {
    // The grantor of record is the authenticated caller
    let identity = identity_from_bearer(&app, bearer(&headers)).await?;
    let expires_at = request
        .expires_hours
        .map(|h| Utc::now() + ChronoDuration::milliseconds((h * 3_600_000.0) as i64));

    app.anchors
        .share(
            &id,
            &request.shared_with_user,
            identity.id(),
            request.permission_level,
            expires_at,
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "anchor_id": id,
        "shared_with": request.shared_with_user,
        "permission_level": request.permission_level,
        "granted_by": identity.id(),
    })))
}

async fn shared_anchors(
    State(app): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<SpatialAnchor>>, ApiError> {
    Ok(Json(app.anchors.shared_with(&user_id).await?))
}
