//! In-memory AR session store: session/player lifecycle, host election, and
//! idle sweeping.
//!
//! Sessions live only in memory — a restart loses them by design. The store
//! is a process-wide map behind a reader-writer lock with a `user → session`
//! reverse index for fast disconnect handling.
//!
//! Invariant: whenever a session has players, exactly one of them is host.
//! On host departure the earliest-joined remaining player is elected, ties
//! broken by `user_id` so the choice is deterministic.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use lattice_types::{ColocalizationMethod, CoordinateSystem};

use crate::auth::Permissions;
use crate::error::ApiError;
use crate::protocol::{PlayerInfo, PoseData, ServerMessage};
use crate::util::now_secs;

/// Outbound queue depth per player. Overflow marks the peer as slow and
/// disconnects it rather than blocking broadcasts.
pub const PLAYER_QUEUE_DEPTH: usize = 64;

/// Hard cap on configurable session sizes
pub const MAX_PLAYERS_CAP: u32 = 50;
/// Anonymous sessions are fixed at this size
pub const ANONYMOUS_MAX_PLAYERS: u32 = 10;

// ── Player & Session ──────────────────────────────────────────────────────────

pub struct Player {
    pub user_id: String,
    pub display_name: String,
    pub tx: mpsc::Sender<ServerMessage>,
    pub permissions: Permissions,
    pub pose: Option<PoseData>,
    pub join_time: f64,
    pub is_host: bool,
    pub is_anonymous: bool,
    pub last_ping: f64,
    pub colocalized: bool,
}

impl Player {
    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            is_host: self.is_host,
            is_anonymous: self.is_anonymous,
            colocalized: self.colocalized,
            join_time: self.join_time,
        }
    }
}

pub struct Session {
    pub id: Uuid,
    pub creation_time: f64,
    pub host_user_id: Option<String>,
    pub max_players: u32,
    pub colocalization_method: ColocalizationMethod,
    pub coordinate_system: Option<CoordinateSystem>,
    pub is_colocalized: bool,
    pub players: HashMap<String, Player>,
}

impl Session {
    pub fn roster(&self) -> Vec<PlayerInfo> {
        let mut roster: Vec<PlayerInfo> = self.players.values().map(Player::info).collect();
        roster.sort_by(|a, b| a.join_time.total_cmp(&b.join_time));
        roster
    }

    /// Earliest-joined player, ties broken by user id. Deterministic given
    /// the same membership.
    fn elect_host(&self) -> Option<String> {
        self.players
            .values()
            .min_by(|a, b| {
                a.join_time
                    .total_cmp(&b.join_time)
                    .then_with(|| a.user_id.cmp(&b.user_id))
            })
            .map(|p| p.user_id.clone())
    }
}

/// Public snapshot used by the HTTP control plane.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub player_count: usize,
    pub max_players: u32,
    pub is_colocalized: bool,
    pub colocalization_method: ColocalizationMethod,
    pub creation_time: f64,
}

/// What happened when a player was removed.
pub struct Removal {
    pub session_id: Uuid,
    pub user_id: String,
    /// Newly elected host, if the departing player was host and peers remain
    pub new_host: Option<String>,
    pub session_deleted: bool,
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
    user_index: RwLock<HashMap<String, Uuid>>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            user_index: RwLock::new(HashMap::new()),
        })
    }

    /// Allocate a session with an origin+identity coordinate system and the
    /// creator recorded as prospective host.
    pub async fn create_session(
        &self,
        creator_user_id: &str,
        max_players: u32,
        colocalization_method: ColocalizationMethod,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let session = Session {
            id,
            creation_time: now_secs(),
            host_user_id: Some(creator_user_id.to_string()),
            max_players: max_players.min(MAX_PLAYERS_CAP).max(1),
            colocalization_method,
            coordinate_system: Some(CoordinateSystem::default()),
            is_colocalized: false,
            players: HashMap::new(),
        };
        self.sessions.write().await.insert(id, session);
        info!("Created AR session {id} (creator {creator_user_id})");
        id
    }

    pub async fn exists(&self, id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    pub async fn summary(&self, id: Uuid) -> Option<SessionSummary> {
        self.sessions.read().await.get(&id).map(|s| SessionSummary {
            session_id: s.id.to_string(),
            player_count: s.players.len(),
            max_players: s.max_players,
            is_colocalized: s.is_colocalized,
            colocalization_method: s.colocalization_method,
            creation_time: s.creation_time,
        })
    }

    /// Insert a player. The first player in a session becomes host.
    pub async fn join(
        &self,
        session_id: Uuid,
        mut player: Player,
    ) -> Result<bool, ApiError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&session_id).ok_or(ApiError::SessionNotFound)?;

        if session.players.len() as u32 >= session.max_players {
            return Err(ApiError::SessionFull);
        }

        let is_host = session.players.is_empty();
        player.is_host = is_host;
        let user_id = player.user_id.clone();
        if is_host {
            session.host_user_id = Some(user_id.clone());
            info!("User {user_id} is now host of session {session_id}");
        }
        session.players.insert(user_id.clone(), player);
        drop(sessions);

        self.user_index.write().await.insert(user_id, session_id);
        Ok(is_host)
    }

    /// Remove a player, electing a new host if needed and deleting the
    /// session once empty. Idempotent for already-gone players.
    pub async fn remove_player(&self, session_id: Uuid, user_id: &str) -> Option<Removal> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&session_id)?;
        session.players.remove(user_id)?;
        self.user_index.write().await.remove(user_id);

        let mut new_host = None;
        if session.host_user_id.as_deref() == Some(user_id) {
            session.host_user_id = session.elect_host();
            if let Some(host_id) = &session.host_user_id {
                if let Some(host) = session.players.get_mut(host_id) {
                    host.is_host = true;
                }
                info!("Host of session {session_id} transferred to {host_id}");
                new_host = session.host_user_id.clone();
            }
        }

        let session_deleted = session.players.is_empty();
        if session_deleted {
            sessions.remove(&session_id);
            info!("Session {session_id} deleted (no players)");
        }

        Some(Removal {
            session_id,
            user_id: user_id.to_string(),
            new_host,
            session_deleted,
        })
    }

    pub async fn session_for_user(&self, user_id: &str) -> Option<Uuid> {
        self.user_index.read().await.get(user_id).copied()
    }

    /// Run a closure against a session under the write lock.
    pub async fn with_session_mut<F, R>(&self, session_id: Uuid, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(&session_id).map(f)
    }

    /// Run a closure against a session under the read lock.
    pub async fn with_session<F, R>(&self, session_id: Uuid, f: F) -> Option<R>
    where
        F: FnOnce(&Session) -> R,
    {
        let sessions = self.sessions.read().await;
        sessions.get(&session_id).map(f)
    }

    pub async fn touch(&self, session_id: Uuid, user_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(player) = sessions
            .get_mut(&session_id)
            .and_then(|s| s.players.get_mut(user_id))
        {
            player.last_ping = now_secs();
        }
    }

    /// Outbound handles for a broadcast: `(user_id, tx, colocalized)` per
    /// player, collected under the read lock so sends happen outside it.
    pub async fn broadcast_targets(
        &self,
        session_id: Uuid,
    ) -> Vec<(String, mpsc::Sender<ServerMessage>, bool)> {
        let sessions = self.sessions.read().await;
        match sessions.get(&session_id) {
            Some(session) => session
                .players
                .values()
                .map(|p| (p.user_id.clone(), p.tx.clone(), p.colocalized))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Remove idle players across all sessions. Returns one `Removal` per
    /// reaped player so the caller can emit `user_left`/host transfers.
    pub async fn sweep_idle(&self, max_idle_secs: f64) -> Vec<Removal> {
        let cutoff = now_secs() - max_idle_secs;
        let idle: Vec<(Uuid, String)> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .flat_map(|s| {
                    s.players
                        .values()
                        .filter(|p| p.last_ping < cutoff)
                        .map(|p| (s.id, p.user_id.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let mut removals = Vec::new();
        for (session_id, user_id) in idle {
            debug!("Reaping idle player {user_id} from session {session_id}");
            if let Some(removal) = self.remove_player(session_id, &user_id).await {
                removals.push(removal);
            }
        }
        removals
    }

    /// Delete a session outright (expired share code, empty sweep).
    pub async fn delete_session(&self, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.remove(&session_id) {
            let mut index = self.user_index.write().await;
            for user_id in session.players.keys() {
                index.remove(user_id);
            }
            true
        } else {
            false
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
