//! Real-time anchor synchronization: per-session client registry,
//! per-client subscription sets, and selective broadcast.
//!
//! Routing rules:
//! - `anchor_created` fans out to every session peer except the originator —
//!   peers must learn an anchor exists before they can subscribe to it.
//! - `anchor_updated` goes only to peers subscribed to that anchor id.
//! - `anchor_deleted` goes to everyone so subscribers can clean up.
//!
//! Conflict policy is last-writer-wins, decided by the server's receive
//! order: concurrent edits from different clients silently lose the loser's
//! change. There is no per-field merge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::anchors::SpatialAnchor;
use crate::protocol::ServerMessage;
use crate::util::{now_ms, now_secs};

pub const SYNC_BATCH_SIZE: usize = 100;

pub struct SyncClient {
    pub client_id: String,
    pub user_id: String,
    pub session_id: String,
    pub subscriptions: HashSet<String>,
    pub tx: mpsc::Sender<ServerMessage>,
    pub last_heartbeat: f64,
    pub is_active: bool,
}

/// What changed, for broadcast routing.
pub enum AnchorEvent {
    Created(SpatialAnchor),
    Updated(SpatialAnchor),
    Deleted(String),
}

pub struct SyncEngine {
    clients: RwLock<HashMap<String, SyncClient>>,
    session_clients: RwLock<HashMap<String, HashSet<String>>>,
    batch_size: usize,
}

impl SyncEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            session_clients: RwLock::new(HashMap::new()),
            batch_size: SYNC_BATCH_SIZE,
        })
    }

    // ── Client lifecycle ──────────────────────────────────────────────────────

    /// Register a connected client and push the session's current anchors in
    /// `initial_anchors` batches.
    pub async fn register(
        &self,
        client_id: &str,
        user_id: &str,
        session_id: &str,
        tx: mpsc::Sender<ServerMessage>,
        session_anchors: Vec<SpatialAnchor>,
    ) {
        let client = SyncClient {
            client_id: client_id.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            subscriptions: HashSet::new(),
            tx: tx.clone(),
            last_heartbeat: now_secs(),
            is_active: true,
        };
        self.clients.write().await.insert(client_id.to_string(), client);
        self.session_clients
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .insert(client_id.to_string());
        info!("Registered sync client {client_id} for user {user_id} in session {session_id}");

        let total = session_anchors.len();
        if total == 0 {
            return;
        }
        let total_batches = crate::protocol::batch_count(total, self.batch_size);
        for (batch_index, batch) in session_anchors.chunks(self.batch_size).enumerate() {
            let _ = tx
                .send(ServerMessage::InitialAnchors {
                    anchors: batch.to_vec(),
                    batch_index,
                    total_batches,
                    total_anchors: total,
                    timestamp: now_ms(),
                })
                .await;
        }
    }

    pub async fn unregister(&self, client_id: &str) -> bool {
        let Some(client) = self.clients.write().await.remove(client_id) else {
            return false;
        };
        let mut sessions = self.session_clients.write().await;
        if let Some(set) = sessions.get_mut(&client.session_id) {
            set.remove(client_id);
            if set.is_empty() {
                sessions.remove(&client.session_id);
            }
        }
        debug!("Unregistered sync client {client_id}");
        true
    }

    pub async fn touch(&self, client_id: &str) {
        if let Some(client) = self.clients.write().await.get_mut(client_id) {
            client.last_heartbeat = now_secs();
        }
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    pub async fn subscribe(&self, client_id: &str, anchor_id: &str) {
        if let Some(client) = self.clients.write().await.get_mut(client_id) {
            client.subscriptions.insert(anchor_id.to_string());
        }
    }

    pub async fn unsubscribe(&self, client_id: &str, anchor_id: &str) {
        if let Some(client) = self.clients.write().await.get_mut(client_id) {
            client.subscriptions.remove(anchor_id);
        }
    }

    // ── Broadcast ─────────────────────────────────────────────────────────────

    /// Fan an anchor event out to the session's sync clients. Returns the
    /// client ids whose queues rejected the send (for disconnection).
    pub async fn broadcast(
        &self,
        session_id: &str,
        event: AnchorEvent,
        exclude_client: Option<&str>,
    ) -> Vec<String> {
        let timestamp = now_ms();
        let targets: Vec<(String, mpsc::Sender<ServerMessage>, bool)> = {
            let session_clients = self.session_clients.read().await;
            let Some(client_ids) = session_clients.get(session_id) else {
                return Vec::new();
            };
            let clients = self.clients.read().await;
            client_ids
                .iter()
                .filter(|id| exclude_client.map_or(true, |ex| ex != id.as_str()))
                .filter_map(|id| clients.get(id))
                .filter(|c| c.is_active)
                .map(|c| {
                    let subscribed = match &event {
                        AnchorEvent::Updated(anchor) => c.subscriptions.contains(&anchor.id),
                        AnchorEvent::Created(_) | AnchorEvent::Deleted(_) => true,
                    };
                    (c.client_id.clone(), c.tx.clone(), subscribed)
                })
                .collect()
        };

        let message = match event {
            AnchorEvent::Created(anchor) => ServerMessage::AnchorCreated { anchor, timestamp },
            AnchorEvent::Updated(anchor) => ServerMessage::AnchorUpdated { anchor, timestamp },
            AnchorEvent::Deleted(anchor_id) => {
                ServerMessage::AnchorDeleted { anchor_id, timestamp }
            }
        };

        let mut failed = Vec::new();
        for (client_id, tx, wants_message) in targets {
            if !wants_message {
                continue;
            }
            if tx.try_send(message.clone()).is_err() {
                failed.push(client_id);
            }
        }
        failed
    }

    /// Clients whose last heartbeat predates `cutoff` (for the idle sweep).
    pub async fn idle_clients(&self, max_idle_secs: f64) -> Vec<String> {
        let cutoff = now_secs() - max_idle_secs;
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.last_heartbeat < cutoff)
            .map(|c| c.client_id.clone())
            .collect()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lattice_types::{AnchorType, TrackingState};

    fn anchor(id: &str, session: &str) -> SpatialAnchor {
        SpatialAnchor {
            id: id.to_string(),
            session_id: session.to_string(),
            user_id: "u1".to_string(),
            position: [0.0, 0.0, 0.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
            confidence: 1.0,
            tracking_state: TrackingState::Tracking,
            anchor_type: AnchorType::Persistent,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expires_at: None,
        }
    }

    async fn client(
        engine: &SyncEngine,
        client_id: &str,
        session: &str,
        anchors: Vec<SpatialAnchor>,
    ) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(256);
        engine.register(client_id, &format!("user-{client_id}"), session, tx, anchors).await;
        rx
    }

    #[tokio::test]
    async fn initial_anchors_are_batched() {
        let engine = SyncEngine::new();
        let anchors: Vec<SpatialAnchor> =
            (0..250).map(|i| anchor(&format!("a{i}"), "s1")).collect();
        let mut rx = client(&engine, "c1", "s1", anchors).await;

        let mut batches = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ServerMessage::InitialAnchors {
                anchors, batch_index, total_batches, total_anchors, ..
            } = msg
            {
                batches.push((batch_index, anchors.len(), total_batches, total_anchors));
            }
        }
        assert_eq!(
            batches,
            vec![(0, 100, 3, 250), (1, 100, 3, 250), (2, 50, 3, 250)]
        );
    }

    #[tokio::test]
    async fn empty_session_sends_no_initial_batch() {
        let engine = SyncEngine::new();
        let mut rx = client(&engine, "c1", "s1", Vec::new()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn created_reaches_all_peers_except_originator() {
        let engine = SyncEngine::new();
        let mut rx1 = client(&engine, "c1", "s1", Vec::new()).await;
        let mut rx2 = client(&engine, "c2", "s1", Vec::new()).await;
        let mut rx3 = client(&engine, "c3", "s1", Vec::new()).await;

        engine
            .broadcast("s1", AnchorEvent::Created(anchor("a1", "s1")), Some("c1"))
            .await;

        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv().unwrap(), ServerMessage::AnchorCreated { .. }));
        assert!(matches!(rx3.try_recv().unwrap(), ServerMessage::AnchorCreated { .. }));
    }

    #[tokio::test]
    async fn updates_go_only_to_subscribers() {
        let engine = SyncEngine::new();
        let mut rx_sub = client(&engine, "sub", "s1", Vec::new()).await;
        let mut rx_other = client(&engine, "other", "s1", Vec::new()).await;
        engine.subscribe("sub", "a1").await;

        engine
            .broadcast("s1", AnchorEvent::Updated(anchor("a1", "s1")), None)
            .await;

        assert!(matches!(rx_sub.try_recv().unwrap(), ServerMessage::AnchorUpdated { .. }));
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_updates() {
        let engine = SyncEngine::new();
        let mut rx = client(&engine, "c1", "s1", Vec::new()).await;
        engine.subscribe("c1", "a1").await;
        engine.unsubscribe("c1", "a1").await;

        engine
            .broadcast("s1", AnchorEvent::Updated(anchor("a1", "s1")), None)
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deletes_reach_everyone() {
        let engine = SyncEngine::new();
        let mut rx_sub = client(&engine, "sub", "s1", Vec::new()).await;
        let mut rx_other = client(&engine, "other", "s1", Vec::new()).await;
        engine.subscribe("sub", "a1").await;

        engine
            .broadcast("s1", AnchorEvent::Deleted("a1".to_string()), None)
            .await;

        assert!(matches!(rx_sub.try_recv().unwrap(), ServerMessage::AnchorDeleted { .. }));
        assert!(matches!(rx_other.try_recv().unwrap(), ServerMessage::AnchorDeleted { .. }));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let engine = SyncEngine::new();
        let mut rx_s1 = client(&engine, "c1", "s1", Vec::new()).await;
        let mut rx_s2 = client(&engine, "c2", "s2", Vec::new()).await;

        engine
            .broadcast("s1", AnchorEvent::Created(anchor("a1", "s1")), None)
            .await;

        assert!(rx_s1.try_recv().is_ok());
        assert!(rx_s2.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_cleans_session_set() {
        let engine = SyncEngine::new();
        let _rx = client(&engine, "c1", "s1", Vec::new()).await;
        assert_eq!(engine.client_count().await, 1);

        assert!(engine.unregister("c1").await);
        assert!(!engine.unregister("c1").await);
        assert_eq!(engine.client_count().await, 0);

        // Broadcasting into the emptied session is a no-op
        let failed = engine
            .broadcast("s1", AnchorEvent::Created(anchor("a1", "s1")), None)
            .await;
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn full_queue_reports_failed_client() {
        let engine = SyncEngine::new();
        let (tx, _rx) = mpsc::channel(1);
        engine.register("slow", "u1", "s1", tx, Vec::new()).await;

        // First delete fills the depth-1 queue, second overflows
        engine.broadcast("s1", AnchorEvent::Deleted("a1".into()), None).await;
        let failed = engine
            .broadcast("s1", AnchorEvent::Deleted("a2".into()), None)
            .await;
        assert_eq!(failed, vec!["slow".to_string()]);
    }
}
