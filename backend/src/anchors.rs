//! Anchor lifecycle: in-memory cache with write-through persistence,
//! spatial queries, and the expiry sweeper.
//!
//! The manager owns every anchor. Failed writes revert the in-memory change
//! so the cache never gets ahead of the durable store for longer than one
//! in-flight write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lattice_types::{AnchorType, Quat, TrackingState, Vec3};

use crate::error::ApiError;
use crate::persistence::{AnchorPersistence, HistoryAction, PermissionLevel, ShareGrant};

// ── Anchor Data ───────────────────────────────────────────────────────────────

/// A persistent 6-DoF pose in a session's world frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialAnchor {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub position: [f64; 3],
    /// Unit quaternion [x, y, z, w]
    pub rotation: [f64; 4],
    pub confidence: f64,
    pub tracking_state: TrackingState,
    pub anchor_type: AnchorType,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SpatialAnchor {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }

    pub fn position_vec(&self) -> Vec3 {
        Vec3::from(self.position)
    }
}

/// Creation parameters (WS `anchor_create` and the REST surface).
#[derive(Debug, Clone)]
pub struct CreateAnchor {
    pub session_id: String,
    pub user_id: String,
    /// Caller-chosen id, or minted when absent
    pub anchor_id: Option<String>,
    pub position: [f64; 3],
    pub rotation: [f64; 4],
    pub anchor_type: AnchorType,
    pub metadata: Option<Value>,
    pub lifetime_hours: Option<f64>,
}

/// Partial update; absent fields keep their value. Metadata is
/// shallow-merged key by key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAnchor {
    pub position: Option<[f64; 3]>,
    pub rotation: Option<[f64; 4]>,
    pub confidence: Option<f64>,
    pub tracking_state: Option<TrackingState>,
    pub metadata: Option<Value>,
}

/// Query filters; all optional, combined conjunctively.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnchorQuery {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub anchor_type: Option<AnchorType>,
    pub tracking_state: Option<TrackingState>,
    pub min_confidence: Option<f64>,
    pub position: Option<[f64; 3]>,
    pub radius: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AnchorConfig {
    pub max_anchors_per_session: usize,
    pub default_lifetime: ChronoDuration,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            max_anchors_per_session: 100,
            default_lifetime: ChronoDuration::hours(24),
        }
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct AnchorManager {
    store: Arc<dyn AnchorPersistence>,
    config: AnchorConfig,
    cache: RwLock<HashMap<String, SpatialAnchor>>,
    session_index: RwLock<HashMap<String, Vec<String>>>,
}

impl AnchorManager {
    pub fn new(store: Arc<dyn AnchorPersistence>, config: AnchorConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            cache: RwLock::new(HashMap::new()),
            session_index: RwLock::new(HashMap::new()),
        })
    }

    /// Warm the cache from persistence at startup.
    pub async fn initialize(&self) -> Result<(), ApiError> {
        let anchors = self
            .store
            .load_active()
            .await
            .map_err(|e| ApiError::Persistence(e.to_string()))?;
        let count = anchors.len();

        let mut cache = self.cache.write().await;
        let mut index = self.session_index.write().await;
        for anchor in anchors {
            index
                .entry(anchor.session_id.clone())
                .or_default()
                .push(anchor.id.clone());
            cache.insert(anchor.id.clone(), anchor);
        }
        info!("Loaded {count} active anchors from persistence");
        Ok(())
    }

    // ── Create ────────────────────────────────────────────────────────────────

    pub async fn create(&self, params: CreateAnchor) -> Result<SpatialAnchor, ApiError> {
        {
            let index = self.session_index.read().await;
            if let Some(ids) = index.get(&params.session_id) {
                if ids.len() >= self.config.max_anchors_per_session {
                    return Err(ApiError::AnchorLimitExceeded);
                }
            }
        }

        let quat = Quat::from(params.rotation);
        if !quat.is_normalized() {
            return Err(ApiError::Validation("rotation is not a unit quaternion".into()));
        }

        let id = match params.anchor_id {
            Some(id) => {
                if self.cache.read().await.contains_key(&id) {
                    return Err(ApiError::Validation(format!("anchor {id} already exists")));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let now = Utc::now();
        let expires_at = match params.lifetime_hours {
            Some(hours) if hours > 0.0 => {
                Some(now + ChronoDuration::milliseconds((hours * 3_600_000.0) as i64))
            }
            Some(_) => {
                return Err(ApiError::Validation("lifetime must be positive".into()));
            }
            None if params.anchor_type == AnchorType::Temporary => {
                Some(now + self.config.default_lifetime)
            }
            None => None,
        };

        let anchor = SpatialAnchor {
            id: id.clone(),
            session_id: params.session_id.clone(),
            user_id: params.user_id,
            position: params.position,
            rotation: quat.normalized().to_array(),
            confidence: 1.0,
            tracking_state: TrackingState::Tracking,
            anchor_type: params.anchor_type,
            metadata: params.metadata.unwrap_or_else(|| json!({})),
            created_at: now,
            updated_at: now,
            expires_at,
        };

        // Insert into cache + index, then write through; revert on failure
        self.cache.write().await.insert(id.clone(), anchor.clone());
        self.session_index
            .write()
            .await
            .entry(params.session_id.clone())
            .or_default()
            .push(id.clone());

        if let Err(e) = self.store.store(&anchor, HistoryAction::Created).await {
            error!("Anchor create persistence failed, reverting {id}: {e}");
            self.evict(&id, &params.session_id).await;
            return Err(ApiError::Persistence(e.to_string()));
        }

        info!("Created anchor {id} for session {}", params.session_id);
        Ok(anchor)
    }

    // ── Update ────────────────────────────────────────────────────────────────

    /// Partial update. Returns `None` for an unknown id (callers map to 404).
    pub async fn update(
        &self,
        anchor_id: &str,
        update: UpdateAnchor,
    ) -> Result<Option<SpatialAnchor>, ApiError> {
        let Some(previous) = self.get(anchor_id).await else {
            return Ok(None);
        };

        let mut anchor = previous.clone();
        if let Some(position) = update.position {
            anchor.position = position;
        }
        if let Some(rotation) = update.rotation {
            let quat = Quat::from(rotation);
            if !quat.is_normalized() {
                return Err(ApiError::Validation("rotation is not a unit quaternion".into()));
            }
            anchor.rotation = quat.normalized().to_array();
        }
        if let Some(confidence) = update.confidence {
            anchor.confidence = confidence.clamp(0.0, 1.0);
        }
        if let Some(state) = update.tracking_state {
            anchor.tracking_state = state;
        }
        if let Some(metadata) = update.metadata {
            shallow_merge(&mut anchor.metadata, metadata);
        }
        anchor.updated_at = Utc::now();

        self.cache.write().await.insert(anchor.id.clone(), anchor.clone());

        if let Err(e) = self.store.store(&anchor, HistoryAction::Updated).await {
            error!("Anchor update persistence failed, reverting {anchor_id}: {e}");
            self.cache.write().await.insert(previous.id.clone(), previous);
            return Err(ApiError::Persistence(e.to_string()));
        }

        debug!("Updated anchor {anchor_id}");
        Ok(Some(anchor))
    }

    // ── Delete ────────────────────────────────────────────────────────────────

    /// Idempotent delete. Returns whether an anchor was actually removed.
    pub async fn delete(&self, anchor_id: &str) -> Result<bool, ApiError> {
        let removed = self.cache.write().await.remove(anchor_id);
        if let Some(anchor) = &removed {
            let mut index = self.session_index.write().await;
            if let Some(ids) = index.get_mut(&anchor.session_id) {
                ids.retain(|id| id != anchor_id);
                if ids.is_empty() {
                    index.remove(&anchor.session_id);
                }
            }
        }

        let in_store = self
            .store
            .delete(anchor_id)
            .await
            .map_err(|e| ApiError::Persistence(e.to_string()))?;

        if removed.is_some() || in_store {
            info!("Deleted anchor {anchor_id}");
        }
        Ok(removed.is_some() || in_store)
    }

    // ── Read Paths ────────────────────────────────────────────────────────────

    /// Cache-first lookup; falls back to persistence and fills the cache.
    /// Expired anchors are never returned.
    pub async fn get(&self, anchor_id: &str) -> Option<SpatialAnchor> {
        let now = Utc::now();
        if let Some(anchor) = self.cache.read().await.get(anchor_id) {
            if anchor.is_expired(now) {
                return None;
            }
            return Some(anchor.clone());
        }

        match self.store.load(anchor_id).await {
            Ok(Some(anchor)) if !anchor.is_expired(now) => {
                self.cache
                    .write()
                    .await
                    .insert(anchor.id.clone(), anchor.clone());
                self.session_index
                    .write()
                    .await
                    .entry(anchor.session_id.clone())
                    .or_default()
                    .push(anchor.id.clone());
                Some(anchor)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Anchor load failed for {anchor_id}: {e}");
                None
            }
        }
    }

    /// Filtered query. Starts from the session index when `session_id` is
    /// given; sorts by distance when a position is present.
    pub async fn query(&self, query: &AnchorQuery) -> Vec<SpatialAnchor> {
        let now = Utc::now();
        let cache = self.cache.read().await;

        let base: Vec<&SpatialAnchor> = match &query.session_id {
            Some(session_id) => {
                let index = self.session_index.read().await;
                index
                    .get(session_id)
                    .map(|ids| ids.iter().filter_map(|id| cache.get(id)).collect())
                    .unwrap_or_default()
            }
            None => cache.values().collect(),
        };

        let center = query.position.map(Vec3::from);
        let mut matches: Vec<SpatialAnchor> = base
            .into_iter()
            .filter(|a| !a.is_expired(now))
            .filter(|a| query.user_id.as_deref().map_or(true, |u| a.user_id == u))
            .filter(|a| query.anchor_type.map_or(true, |t| a.anchor_type == t))
            .filter(|a| query.tracking_state.map_or(true, |t| a.tracking_state == t))
            .filter(|a| query.min_confidence.map_or(true, |c| a.confidence >= c))
            .filter(|a| match (&center, query.radius) {
                (Some(center), Some(radius)) => a.position_vec().distance(center) <= radius,
                _ => true,
            })
            .cloned()
            .collect();

        if let Some(center) = center {
            matches.sort_by(|a, b| {
                a.position_vec()
                    .distance(&center)
                    .total_cmp(&b.position_vec().distance(&center))
            });
        }
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        matches
    }

    pub async fn session_anchors(&self, session_id: &str) -> Vec<SpatialAnchor> {
        self.query(&AnchorQuery {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        })
        .await
    }

    /// Spatially-optimized nearby search: delegates to the persistence
    /// index when no session filter narrows the candidate set.
    pub async fn nearby(
        &self,
        position: [f64; 3],
        radius: f64,
        limit: usize,
    ) -> Result<Vec<SpatialAnchor>, ApiError> {
        self.store
            .find_nearby(position, radius, limit as i64)
            .await
            .map_err(|e| ApiError::Persistence(e.to_string()))
    }

    // ── Sharing ───────────────────────────────────────────────────────────────

    pub async fn share(
        &self,
        anchor_id: &str,
        shared_with_user: &str,
        granted_by: &str,
        permission_level: PermissionLevel,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        if self.get(anchor_id).await.is_none() {
            return Err(ApiError::AnchorNotFound);
        }
        let grant = ShareGrant {
            anchor_id: anchor_id.to_string(),
            shared_with_user: shared_with_user.to_string(),
            shared_by_user: granted_by.to_string(),
            permission_level,
            created_at: Utc::now(),
            expires_at,
        };
        self.store
            .share(&grant)
            .await
            .map_err(|e| ApiError::Persistence(e.to_string()))
    }

    pub async fn shared_with(&self, user_id: &str) -> Result<Vec<SpatialAnchor>, ApiError> {
        self.store
            .shared_with(user_id)
            .await
            .map_err(|e| ApiError::Persistence(e.to_string()))
    }

    // ── Expiry Sweep & Shutdown ───────────────────────────────────────────────

    /// Remove expired anchors from cache and store. Returns the removed
    /// anchors so the sync engine can emit `anchor_deleted` broadcasts.
    pub async fn sweep_expired(&self) -> Vec<SpatialAnchor> {
        let now = Utc::now();
        let expired: Vec<SpatialAnchor> = {
            let cache = self.cache.read().await;
            cache.values().filter(|a| a.is_expired(now)).cloned().collect()
        };

        for anchor in &expired {
            if let Err(e) = self.delete(&anchor.id).await {
                warn!("Failed to delete expired anchor {}: {e}", anchor.id);
            }
        }

        // Catch rows that never made it into the cache
        if let Err(e) = self.store.cleanup_expired().await {
            warn!("Persistence expiry cleanup failed: {e}");
        }

        if !expired.is_empty() {
            info!("Expired {} anchors", expired.len());
        }
        expired
    }

    /// Best-effort flush of the cache on shutdown.
    pub async fn shutdown_flush(&self) {
        let anchors: Vec<SpatialAnchor> = self.cache.read().await.values().cloned().collect();
        for anchor in anchors {
            if let Err(e) = self.store.store(&anchor, HistoryAction::Updated).await {
                warn!("Failed to flush anchor {} during shutdown: {e}", anchor.id);
            }
        }
    }

    pub async fn health(&self) -> bool {
        self.store.health().await
    }

    async fn evict(&self, anchor_id: &str, session_id: &str) {
        self.cache.write().await.remove(anchor_id);
        let mut index = self.session_index.write().await;
        if let Some(ids) = index.get_mut(session_id) {
            ids.retain(|id| id != anchor_id);
            if ids.is_empty() {
                index.remove(session_id);
            }
        }
    }
}

/// Merge `incoming`'s top-level keys into `target` (object-into-object);
/// non-object payloads replace the target wholesale.
fn shallow_merge(target: &mut Value, incoming: Value) {
    match (target.as_object_mut(), incoming) {
        (Some(target_map), Value::Object(incoming_map)) => {
            for (k, v) in incoming_map {
                target_map.insert(k, v);
            }
        }
        (_, incoming) => *target = incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryAnchorStore, PersistenceError};
    use async_trait::async_trait;

    fn manager() -> (Arc<AnchorManager>, Arc<MemoryAnchorStore>) {
        let store = Arc::new(MemoryAnchorStore::new());
        let manager = AnchorManager::new(store.clone(), AnchorConfig::default());
        (manager, store)
    }

    fn create_params(session: &str, id: Option<&str>) -> CreateAnchor {
        CreateAnchor {
            session_id: session.to_string(),
            user_id: "u1".to_string(),
            anchor_id: id.map(|s| s.to_string()),
            position: [1.0, 2.0, 3.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
            anchor_type: AnchorType::Persistent,
            metadata: None,
            lifetime_hours: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trip() {
        let (manager, _) = manager();
        let created = manager.create(create_params("s1", Some("a1"))).await.unwrap();
        let fetched = manager.get("a1").await.unwrap();

        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.position, [1.0, 2.0, 3.0]);
        assert_eq!(fetched.rotation, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(fetched.confidence, 1.0);
        assert_eq!(fetched.tracking_state, TrackingState::Tracking);
        assert_eq!(fetched.created_at, created.created_at);
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let store = Arc::new(MemoryAnchorStore::new());
        let manager = AnchorManager::new(
            store,
            AnchorConfig { max_anchors_per_session: 3, ..Default::default() },
        );

        for i in 0..3 {
            manager
                .create(create_params("s1", Some(&format!("a{i}"))))
                .await
                .unwrap();
        }
        let err = manager.create(create_params("s1", Some("a3"))).await.unwrap_err();
        assert!(matches!(err, ApiError::AnchorLimitExceeded));

        // Other sessions are unaffected
        assert!(manager.create(create_params("s2", Some("b0"))).await.is_ok());
    }

    #[tokio::test]
    async fn temporary_anchor_gets_default_expiry() {
        let (manager, _) = manager();
        let mut params = create_params("s1", Some("tmp"));
        params.anchor_type = AnchorType::Temporary;
        let anchor = manager.create(params).await.unwrap();

        let lifetime = anchor.expires_at.unwrap() - anchor.created_at;
        assert_eq!(lifetime.num_hours(), 24);
    }

    #[tokio::test]
    async fn explicit_lifetime_overrides_default() {
        let (manager, _) = manager();
        let mut params = create_params("s1", Some("short"));
        params.lifetime_hours = Some(0.01); // 36 seconds
        let anchor = manager.create(params).await.unwrap();

        let lifetime = anchor.expires_at.unwrap() - anchor.created_at;
        assert!((lifetime.num_seconds() - 36).abs() <= 1);
    }

    #[tokio::test]
    async fn denormalized_rotation_is_rejected() {
        let (manager, _) = manager();
        let mut params = create_params("s1", Some("bad"));
        params.rotation = [0.2, 0.2, 0.2, 0.2];
        assert!(matches!(
            manager.create(params).await,
            Err(ApiError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn update_shallow_merges_metadata() {
        let (manager, _) = manager();
        let mut params = create_params("s1", Some("a1"));
        params.metadata = Some(json!({"color": "red", "label": "door"}));
        manager.create(params).await.unwrap();

        let updated = manager
            .update(
                "a1",
                UpdateAnchor {
                    metadata: Some(json!({"label": "window", "floor": 2})),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.metadata["color"], "red");
        assert_eq!(updated.metadata["label"], "window");
        assert_eq!(updated.metadata["floor"], 2);
    }

    #[tokio::test]
    async fn update_unknown_returns_none() {
        let (manager, _) = manager();
        let result = manager.update("ghost", UpdateAnchor::default()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (manager, _) = manager();
        manager.create(create_params("s1", Some("a1"))).await.unwrap();

        assert!(manager.delete("a1").await.unwrap());
        assert!(!manager.delete("a1").await.unwrap());
        assert!(manager.get("a1").await.is_none());
    }

    #[tokio::test]
    async fn expired_anchors_are_invisible_and_swept() {
        let (manager, _) = manager();
        let mut params = create_params("s1", Some("gone"));
        params.lifetime_hours = Some(1e-9); // expires immediately
        manager.create(params).await.unwrap();
        manager.create(create_params("s1", Some("kept"))).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // Invariant: expired anchors never come back from any read path
        assert!(manager.get("gone").await.is_none());
        let listed = manager.session_anchors("s1").await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "kept");

        let swept = manager.sweep_expired().await;
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, "gone");

        // Second sweep finds nothing
        assert!(manager.sweep_expired().await.is_empty());
    }

    #[tokio::test]
    async fn query_filters_and_distance_sort() {
        let (manager, _) = manager();
        for (id, pos) in [("near", [1.0, 0.0, 0.0]), ("far", [50.0, 0.0, 0.0]), ("mid", [10.0, 0.0, 0.0])]
        {
            let mut params = create_params("s1", Some(id));
            params.position = pos;
            manager.create(params).await.unwrap();
        }

        let result = manager
            .query(&AnchorQuery {
                session_id: Some("s1".into()),
                position: Some([0.0, 0.0, 0.0]),
                radius: Some(20.0),
                ..Default::default()
            })
            .await;

        let ids: Vec<&str> = result.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
    }

    #[tokio::test]
    async fn query_by_confidence_and_type() {
        let (manager, _) = manager();
        manager.create(create_params("s1", Some("a1"))).await.unwrap();
        manager
            .update(
                "a1",
                UpdateAnchor { confidence: Some(0.4), ..Default::default() },
            )
            .await
            .unwrap();
        let mut params = create_params("s1", Some("a2"));
        params.anchor_type = AnchorType::Shared;
        manager.create(params).await.unwrap();

        let high_confidence = manager
            .query(&AnchorQuery {
                session_id: Some("s1".into()),
                min_confidence: Some(0.9),
                ..Default::default()
            })
            .await;
        assert_eq!(high_confidence.len(), 1);
        assert_eq!(high_confidence[0].id, "a2");

        let shared_only = manager
            .query(&AnchorQuery {
                anchor_type: Some(AnchorType::Shared),
                ..Default::default()
            })
            .await;
        assert_eq!(shared_only.len(), 1);
    }

    #[tokio::test]
    async fn share_requires_existing_anchor() {
        let (manager, _) = manager();
        let err = manager
            .share("ghost", "u2", "u1", PermissionLevel::Read, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AnchorNotFound));

        manager.create(create_params("s1", Some("a1"))).await.unwrap();
        manager
            .share("a1", "u2", "u1", PermissionLevel::Write, None)
            .await
            .unwrap();
        let shared = manager.shared_with("u2").await.unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].id, "a1");
    }

    // A store that fails every write, for the revert path
    struct FailingStore;

    #[async_trait]
    impl AnchorPersistence for FailingStore {
        async fn store(
            &self,
            _: &SpatialAnchor,
            _: HistoryAction,
        ) -> Result<(), PersistenceError> {
            Err(PersistenceError::CorruptRow("write refused".into()))
        }
        async fn load(&self, _: &str) -> Result<Option<SpatialAnchor>, PersistenceError> {
            Ok(None)
        }
        async fn load_active(&self) -> Result<Vec<SpatialAnchor>, PersistenceError> {
            Ok(Vec::new())
        }
        async fn load_session(&self, _: &str) -> Result<Vec<SpatialAnchor>, PersistenceError> {
            Ok(Vec::new())
        }
        async fn delete(&self, _: &str) -> Result<bool, PersistenceError> {
            Ok(false)
        }
        async fn find_nearby(
            &self,
            _: [f64; 3],
            _: f64,
            _: i64,
        ) -> Result<Vec<SpatialAnchor>, PersistenceError> {
            Ok(Vec::new())
        }
        async fn share(&self, _: &ShareGrant) -> Result<(), PersistenceError> {
            Err(PersistenceError::CorruptRow("write refused".into()))
        }
        async fn shared_with(&self, _: &str) -> Result<Vec<SpatialAnchor>, PersistenceError> {
            Ok(Vec::new())
        }
        async fn cleanup_expired(&self) -> Result<u64, PersistenceError> {
            Ok(0)
        }
        async fn health(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn failed_persistence_reverts_create() {
        let manager = AnchorManager::new(Arc::new(FailingStore), AnchorConfig::default());

        let err = manager.create(create_params("s1", Some("a1"))).await.unwrap_err();
        assert!(matches!(err, ApiError::Persistence(_)));
        // In-memory state rolled back: nothing visible anywhere
        assert!(manager.get("a1").await.is_none());
        assert!(manager.session_anchors("s1").await.is_empty());
    }

    // Delegates to the in-memory store until `fail_writes` flips
    struct FlakyStore {
        inner: MemoryAnchorStore,
        fail_writes: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryAnchorStore::new(),
                fail_writes: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn start_failing(&self) {
            self.fail_writes.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AnchorPersistence for FlakyStore {
        async fn store(
            &self,
            anchor: &SpatialAnchor,
            action: HistoryAction,
        ) -> Result<(), PersistenceError> {
            if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(PersistenceError::CorruptRow("write refused".into()));
            }
            self.inner.store(anchor, action).await
        }
        async fn load(&self, id: &str) -> Result<Option<SpatialAnchor>, PersistenceError> {
            self.inner.load(id).await
        }
        async fn load_active(&self) -> Result<Vec<SpatialAnchor>, PersistenceError> {
            self.inner.load_active().await
        }
        async fn load_session(&self, sid: &str) -> Result<Vec<SpatialAnchor>, PersistenceError> {
            self.inner.load_session(sid).await
        }
        async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
            self.inner.delete(id).await
        }
        async fn find_nearby(
            &self,
            p: [f64; 3],
            r: f64,
            l: i64,
        ) -> Result<Vec<SpatialAnchor>, PersistenceError> {
            self.inner.find_nearby(p, r, l).await
        }
        async fn share(&self, grant: &ShareGrant) -> Result<(), PersistenceError> {
            self.inner.share(grant).await
        }
        async fn shared_with(&self, u: &str) -> Result<Vec<SpatialAnchor>, PersistenceError> {
            self.inner.shared_with(u).await
        }
        async fn cleanup_expired(&self) -> Result<u64, PersistenceError> {
            self.inner.cleanup_expired().await
        }
        async fn health(&self) -> bool {
            self.inner.health().await
        }
    }

    #[tokio::test]
    async fn failed_persistence_reverts_update() {
        let store = Arc::new(FlakyStore::new());
        let manager = AnchorManager::new(store.clone(), AnchorConfig::default());
        manager.create(create_params("s1", Some("a1"))).await.unwrap();

        store.start_failing();
        let err = manager
            .update(
                "a1",
                UpdateAnchor { confidence: Some(0.2), ..Default::default() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Persistence(_)));

        // The cached anchor rolled back to its pre-update state
        let anchor = manager.get("a1").await.unwrap();
        assert_eq!(anchor.confidence, 1.0);
    }

    #[tokio::test]
    async fn history_records_lifecycle() {
        let (manager, store) = manager();
        manager.create(create_params("s1", Some("a1"))).await.unwrap();
        manager
            .update("a1", UpdateAnchor { confidence: Some(0.5), ..Default::default() })
            .await
            .unwrap();
        manager.delete("a1").await.unwrap();

        let history = store.history().await;
        let actions: Vec<HistoryAction> = history.iter().map(|(_, a, _)| *a).collect();
        assert_eq!(
            actions,
            vec![HistoryAction::Created, HistoryAction::Updated, HistoryAction::Deleted]
        );
    }
}
