//! WebSocket session fan-out: admission, inbound dispatch, and best-effort
//! selective broadcast.
//!
//! Each connection gets a bounded outbound queue drained by a writer task;
//! the read loop owns all inbound handling. Broadcast sends are per-recipient
//! best-effort — a full or closed queue marks that peer for disconnection
//! without aborting the broadcast. Per-socket emission order is FIFO; there
//! is no cross-client ordering.

use std::collections::HashMap;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;
use tracing::{debug, info, warn};

use lattice_types::ColocalizationMethod;

use crate::app::AppState;
use crate::auth::{Identity, Permissions};
use crate::error::ApiError;
use crate::protocol::{parse_client_message, ClientMessage, PoseData, ServerMessage};
use crate::sessions::{Player, Removal, PLAYER_QUEUE_DEPTH};
use crate::sync::AnchorEvent;
use crate::util::{now_ms, now_secs};

/// Application close codes (authn / authz), plus 1003 for an unusable
/// session reference in the path.
const CLOSE_AUTH_FAILED: u16 = 4001;
const CLOSE_ACCESS_DENIED: u16 = 4003;

// ── Upgrade Endpoint ──────────────────────────────────────────────────────────

/// `GET /ws/:session_id?token=<optional>`
pub async fn ws_handler(
    State(app): State<AppState>,
    Path(session_ref): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_connection(app, session_ref, token, socket))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}

async fn handle_connection(
    app: AppState,
    session_ref: String,
    token: Option<String>,
    socket: WebSocket,
) {
    // Resolve the path segment: a session UUID or a 6-char share code
    let session_id = match session_ref.parse::<Uuid>() {
        Ok(id) => Some(id),
        Err(_) => app.codes.resolve(&session_ref).await,
    };
    let Some(session_id) = session_id else {
        close_with(socket, close_code::UNSUPPORTED, "unusable session reference").await;
        return;
    };

    // Admission: bearer token or anonymous
    let identity = match &token {
        Some(token) => match app.auth.verify_token(token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("WebSocket auth failed for session {session_id}: {e}");
                close_with(socket, CLOSE_AUTH_FAILED, "Authentication failed").await;
                return;
            }
        },
        None => app.auth.mint_anonymous(None),
    };
    let permissions = app.auth.permissions_for(&identity);
    if !permissions.can_join {
        close_with(socket, CLOSE_ACCESS_DENIED, "Access denied").await;
        return;
    }

    let user_id = identity.id().to_string();
    let display_name = identity.display_name().to_string();
    let is_anonymous = identity.is_anonymous();
    info!(
        "{} user {user_id} connecting to session {session_id}",
        if is_anonymous { "Anonymous" } else { "Authenticated" }
    );

    // Writer task: drains the bounded outbound queue into the socket
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(PLAYER_QUEUE_DEPTH);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    if !app.sessions.exists(session_id).await {
        let _ = tx.send(ServerMessage::error(ApiError::SessionNotFound.code(), "session not found")).await;
        drop(tx);
        let _ = writer.await;
        return;
    }

    let player = Player {
        user_id: user_id.clone(),
        display_name: display_name.clone(),
        tx: tx.clone(),
        permissions,
        pose: None,
        join_time: now_secs(),
        is_host: false,
        is_anonymous,
        last_ping: now_secs(),
        colocalized: false,
    };

    let is_host = match app.sessions.join(session_id, player).await {
        Ok(is_host) => is_host,
        Err(e) => {
            let _ = tx.send(ServerMessage::error(e.code(), e.public_message())).await;
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    // Anonymous-session activity slides the share code TTL
    app.codes.extend(session_id).await;

    // Peers learn about the join; the joiner is not echoed
    broadcast_to_session(
        &app,
        session_id,
        ServerMessage::UserJoined {
            user_id: user_id.clone(),
            display_name: display_name.clone(),
            is_host,
            is_anonymous,
            colocalized: None,
            timestamp: now_ms(),
        },
        Some(&user_id),
        false,
    )
    .await;

    // Immediate session_state for the new client
    let session_anchors = app.anchors.session_anchors(&session_id.to_string()).await;
    let state_frame = app
        .sessions
        .with_session(session_id, |session| ServerMessage::SessionState {
            session_id: session_id.to_string(),
            coordinate_system: session.coordinate_system,
            colocalization_method: session.colocalization_method,
            is_colocalized: session.is_colocalized,
            anchors: session_anchors.clone(),
            players: session.roster(),
            timestamp: now_ms(),
        })
        .await;
    if let Some(frame) = state_frame {
        let _ = tx.send(frame).await;
    }

    // Register on the anchor sync plane (initial_anchors batches)
    let client_id = Uuid::new_v4().to_string();
    app.sync
        .register(&client_id, &user_id, &session_id.to_string(), tx.clone(), session_anchors)
        .await;

    // Inbound loop: client frames arrive in order and are handled in order
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                handle_frame(&app, session_id, &user_id, &display_name, &client_id, &permissions, &tx, &text)
                    .await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Teardown
    info!("User {user_id} disconnected from session {session_id}");
    app.sync.unregister(&client_id).await;
    app.rate_limiter.forget(&user_id).await;
    if let Some(removal) = app.sessions.remove_player(session_id, &user_id).await {
        announce_removal(&app, &removal).await;
    }
    drop(tx);
    let _ = writer.await;
}

// ── Inbound Dispatch ──────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    app: &AppState,
    session_id: Uuid,
    user_id: &str,
    display_name: &str,
    client_id: &str,
    permissions: &Permissions,
    tx: &mpsc::Sender<ServerMessage>,
    text: &str,
) {
    // Rate limit precedes parsing — malformed floods are still floods
    if !app.rate_limiter.check(user_id, now_secs()).await {
        let _ = tx
            .send(ServerMessage::error(
                ApiError::RateLimitExceeded.code(),
                "rate limit exceeded, slow down",
            ))
            .await;
        return;
    }

    let message = match parse_client_message(text, now_ms()) {
        Ok(message) => message,
        Err(e) => {
            let _ = tx.send(e.to_frame()).await;
            return;
        }
    };

    app.sessions.touch(session_id, user_id).await;
    app.sync.touch(client_id).await;
    app.codes.extend(session_id).await;

    match message {
        ClientMessage::PoseUpdate { pose, .. } => {
            handle_pose_update(app, session_id, user_id, pose).await;
        }

        ClientMessage::AnchorCreate {
            anchor_id,
            position,
            rotation,
            anchor_type,
            metadata,
            lifetime_hours,
            ..
        } => {
            if !permissions.can_create_anchors {
                let _ = tx
                    .send(ServerMessage::error(
                        ApiError::PermissionDenied(String::new()).code(),
                        "permission denied: cannot create anchors",
                    ))
                    .await;
                return;
            }
            let created = app
                .anchors
                .create(crate::anchors::CreateAnchor {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    anchor_id: Some(anchor_id),
                    position,
                    rotation,
                    anchor_type,
                    metadata,
                    lifetime_hours,
                })
                .await;
            match created {
                Ok(anchor) => {
                    info!("Anchor created: {} by {user_id}", anchor.id);
                    sync_broadcast(app, session_id, AnchorEvent::Created(anchor), Some(client_id))
                        .await;
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::error(e.code(), e.public_message())).await;
                }
            }
        }

        ClientMessage::AnchorUpdate {
            anchor_id,
            position,
            rotation,
            confidence,
            tracking_state,
            metadata,
            ..
        } => {
            let updated = app
                .anchors
                .update(
                    &anchor_id,
                    crate::anchors::UpdateAnchor {
                        position,
                        rotation,
                        confidence,
                        tracking_state,
                        metadata,
                    },
                )
                .await;
            match updated {
                Ok(Some(anchor)) => {
                    sync_broadcast(app, session_id, AnchorEvent::Updated(anchor), Some(client_id))
                        .await;
                }
                Ok(None) => {
                    let _ = tx
                        .send(ServerMessage::error(
                            ApiError::AnchorNotFound.code(),
                            "anchor not found",
                        ))
                        .await;
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::error(e.code(), e.public_message())).await;
                }
            }
        }

        ClientMessage::AnchorDelete { anchor_id, .. } => {
            if !permissions.can_delete_anchors {
                let _ = tx
                    .send(ServerMessage::error(
                        ApiError::PermissionDenied(String::new()).code(),
                        "permission denied: cannot delete anchors",
                    ))
                    .await;
                return;
            }
            // Creator or host may delete; moderators pass the gate above
            let Some(anchor) = app.anchors.get(&anchor_id).await else {
                let _ = tx
                    .send(ServerMessage::error(ApiError::AnchorNotFound.code(), "anchor not found"))
                    .await;
                return;
            };
            let is_host = app
                .sessions
                .with_session(session_id, |s| s.host_user_id.as_deref() == Some(user_id))
                .await
                .unwrap_or(false);
            if anchor.user_id != user_id && !is_host && !permissions.can_moderate {
                let _ = tx
                    .send(ServerMessage::error(
                        ApiError::PermissionDenied(String::new()).code(),
                        "permission denied: not the anchor creator or host",
                    ))
                    .await;
                return;
            }
            match app.anchors.delete(&anchor_id).await {
                Ok(true) => {
                    info!("Anchor deleted: {anchor_id} by {user_id}");
                    sync_broadcast(app, session_id, AnchorEvent::Deleted(anchor_id), Some(client_id))
                        .await;
                }
                Ok(false) => {}
                Err(e) => {
                    let _ = tx.send(ServerMessage::error(e.code(), e.public_message())).await;
                }
            }
        }

        ClientMessage::ColocalizationData { colocalized, method, coordinate_system, .. } => {
            handle_colocalization(app, session_id, user_id, colocalized, method, coordinate_system)
                .await;
        }

        ClientMessage::ChatMessage { message, .. } => {
            broadcast_to_session(
                app,
                session_id,
                ServerMessage::ChatMessage {
                    user_id: user_id.to_string(),
                    display_name: display_name.to_string(),
                    message,
                    timestamp: now_ms(),
                },
                None,
                false,
            )
            .await;
        }

        ClientMessage::Ping { timestamp } => {
            let _ = tx
                .send(ServerMessage::Pong { timestamp: now_ms(), client_timestamp: Some(timestamp) })
                .await;
        }

        // Liveness already refreshed above
        ClientMessage::Pong { .. } => {}

        ClientMessage::SubscribeAnchor { anchor_id, .. } => {
            app.sync.subscribe(client_id, &anchor_id).await;
            if let Some(anchor) = app.anchors.get(&anchor_id).await {
                let _ = tx.send(ServerMessage::AnchorState { anchor, timestamp: now_ms() }).await;
            }
        }

        ClientMessage::UnsubscribeAnchor { anchor_id, .. } => {
            app.sync.unsubscribe(client_id, &anchor_id).await;
        }
    }
}

async fn handle_pose_update(app: &AppState, session_id: Uuid, user_id: &str, pose: PoseData) {
    let sender_colocalized = app
        .sessions
        .with_session_mut(session_id, |session| {
            if let Some(player) = session.players.get_mut(user_id) {
                player.pose = Some(pose.clone());
                player.colocalized
            } else {
                false
            }
        })
        .await
        .unwrap_or(false);

    // Pose traffic is only meaningful between peers sharing a frame
    if sender_colocalized {
        broadcast_to_session(
            app,
            session_id,
            ServerMessage::PoseUpdate {
                user_id: user_id.to_string(),
                pose,
                timestamp: now_ms(),
            },
            Some(user_id),
            true,
        )
        .await;
    }
}

async fn handle_colocalization(
    app: &AppState,
    session_id: Uuid,
    user_id: &str,
    colocalized: Option<bool>,
    method: Option<ColocalizationMethod>,
    coordinate_system: Option<lattice_types::CoordinateSystem>,
) {
    let is_host = app
        .sessions
        .with_session(session_id, |s| s.host_user_id.as_deref() == Some(user_id))
        .await
        .unwrap_or(false);

    // Only the host publishes the shared frame
    if is_host {
        if let Some(cs) = coordinate_system {
            let update = app
                .sessions
                .with_session_mut(session_id, |session| {
                    session.coordinate_system = Some(cs);
                    if let Some(method) = method {
                        session.colocalization_method = method;
                    }
                    session.is_colocalized = true;
                    ServerMessage::CoordinateSystemUpdate {
                        coordinate_system: cs,
                        colocalization_method: session.colocalization_method,
                        is_colocalized: true,
                        timestamp: now_ms(),
                    }
                })
                .await;
            if let Some(update) = update {
                info!("Coordinate system established by host {user_id} in session {session_id}");
                broadcast_to_session(app, session_id, update, None, false).await;
            }
        }
    }

    if let Some(colocalized) = colocalized {
        let info = app
            .sessions
            .with_session_mut(session_id, |session| {
                session.players.get_mut(user_id).map(|player| {
                    player.colocalized = colocalized;
                    player.info()
                })
            })
            .await
            .flatten();
        if let Some(info) = info {
            broadcast_to_session(
                app,
                session_id,
                ServerMessage::UserJoined {
                    user_id: info.user_id,
                    display_name: info.display_name,
                    is_host: info.is_host,
                    is_anonymous: info.is_anonymous,
                    colocalized: Some(colocalized),
                    timestamp: now_ms(),
                },
                Some(user_id),
                false,
            )
            .await;
        }
    }
}

// ── Broadcast ─────────────────────────────────────────────────────────────────

/// Best-effort fan-out to a session's players. A failed send marks that
/// recipient for disconnection; the broadcast itself never aborts.
pub async fn broadcast_to_session(
    app: &AppState,
    session_id: Uuid,
    message: ServerMessage,
    exclude_user: Option<&str>,
    colocalized_only: bool,
) {
    let targets = app.sessions.broadcast_targets(session_id).await;
    let mut slow_peers = Vec::new();

    for (peer_id, tx, peer_colocalized) in targets {
        if exclude_user == Some(peer_id.as_str()) {
            continue;
        }
        if colocalized_only && !peer_colocalized {
            continue;
        }
        if tx.try_send(message.clone()).is_err() {
            slow_peers.push(peer_id);
        }
    }

    for peer_id in slow_peers {
        debug!("Disconnecting slow peer {peer_id} from session {session_id}");
        if let Some(removal) = app.sessions.remove_player(session_id, &peer_id).await {
            announce_removal(app, &removal).await;
        }
    }
}

/// Emit `user_left` (and a host transfer, when one happened) for a removal.
/// Sends here are fire-and-forget: a full queue will be caught by the next
/// broadcast or the heartbeat sweep.
pub async fn announce_removal(app: &AppState, removal: &Removal) {
    if removal.session_deleted {
        app.codes.remove_session(removal.session_id).await;
        return;
    }

    let targets = app.sessions.broadcast_targets(removal.session_id).await;
    let left = ServerMessage::UserLeft {
        user_id: removal.user_id.clone(),
        timestamp: now_ms(),
    };
    for (_, tx, _) in &targets {
        let _ = tx.try_send(left.clone());
    }

    if let Some(new_host) = &removal.new_host {
        let host_frame = app
            .sessions
            .with_session(removal.session_id, |session| {
                session.players.get(new_host).map(|player| ServerMessage::UserJoined {
                    user_id: player.user_id.clone(),
                    display_name: player.display_name.clone(),
                    is_host: true,
                    is_anonymous: player.is_anonymous,
                    colocalized: Some(player.colocalized),
                    timestamp: now_ms(),
                })
            })
            .await
            .flatten();
        if let Some(frame) = host_frame {
            for (_, tx, _) in &targets {
                let _ = tx.try_send(frame.clone());
            }
        }
    }
}

/// Anchor-plane broadcast; failed sync clients are dropped from the registry.
pub(crate) async fn sync_broadcast(
    app: &AppState,
    session_id: Uuid,
    event: AnchorEvent,
    exclude_client: Option<&str>,
) {
    let failed = app
        .sync
        .broadcast(&session_id.to_string(), event, exclude_client)
        .await;
    for client_id in failed {
        debug!("Dropping unresponsive sync client {client_id}");
        app.sync.unregister(&client_id).await;
    }
}

// ── Identity helper for HTTP handlers ─────────────────────────────────────────

/// Resolve a bearer token from an Authorization header value.
pub async fn identity_from_bearer(
    app: &AppState,
    authorization: Option<&str>,
) -> Result<Identity, ApiError> {
    let header = authorization.ok_or_else(|| ApiError::AuthFailed("authorization header required".into()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::AuthFailed("bearer token required".into()))?;
    app.auth.verify_token(token).await
}
