//! Durable anchor storage.
//!
//! The production store is PostgreSQL with the PostGIS geometry extension:
//! anchors carry a 2-D spatial point (x, y) with z tucked into
//! `metadata.z_coordinate` — the spatial index is 2-D by design, so vertical
//! filtering stays linear. A sharing table and an append-only history log
//! ride alongside.
//!
//! An in-memory implementation of the same seam backs development mode and
//! the test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use lattice_types::{AnchorType, TrackingState};

use crate::anchors::SpatialAnchor;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

// ── Sharing & History ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    #[default]
    Read,
    Write,
    Admin,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// One sharing grant; unique per `(anchor_id, shared_with_user)`.
#[derive(Debug, Clone, Serialize)]
pub struct ShareGrant {
    pub anchor_id: String,
    pub shared_with_user: String,
    pub shared_by_user: String,
    pub permission_level: PermissionLevel,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAction {
    Created,
    Updated,
    Deleted,
    Shared,
    Expired,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Shared => "shared",
            Self::Expired => "expired",
        }
    }
}

// ── Persistence Seam ──────────────────────────────────────────────────────────

/// Durable store behind the anchor manager. Write effects become visible to
/// subscribers only after these calls return.
#[async_trait]
pub trait AnchorPersistence: Send + Sync {
    /// Upsert an anchor row (and a history entry for the action).
    async fn store(&self, anchor: &SpatialAnchor, action: HistoryAction)
        -> Result<(), PersistenceError>;

    async fn load(&self, anchor_id: &str) -> Result<Option<SpatialAnchor>, PersistenceError>;

    /// All non-expired anchors (startup cache warm-up).
    async fn load_active(&self) -> Result<Vec<SpatialAnchor>, PersistenceError>;

    async fn load_session(&self, session_id: &str)
        -> Result<Vec<SpatialAnchor>, PersistenceError>;

    /// Delete an anchor; cascades sharing grants and records a `deleted`
    /// history row. Returns whether a row existed.
    async fn delete(&self, anchor_id: &str) -> Result<bool, PersistenceError>;

    /// Anchors within `radius_meters` of `position`, non-expired, in
    /// `tracking` state, nearest first. 2-D distance (see module docs).
    async fn find_nearby(
        &self,
        position: [f64; 3],
        radius_meters: f64,
        limit: i64,
    ) -> Result<Vec<SpatialAnchor>, PersistenceError>;

    /// Upsert a sharing grant and record a `shared` history row.
    async fn share(&self, grant: &ShareGrant) -> Result<(), PersistenceError>;

    /// Anchors shared with a user, both sides non-expired.
    async fn shared_with(&self, user_id: &str) -> Result<Vec<SpatialAnchor>, PersistenceError>;

    /// Delete expired anchors and their grants in one transaction; returns
    /// the number of anchors removed.
    async fn cleanup_expired(&self) -> Result<u64, PersistenceError>;

    /// Trivial liveness gate (`SELECT 1` for the database store).
    async fn health(&self) -> bool;
}

// ── PostgreSQL / PostGIS ──────────────────────────────────────────────────────

pub struct PgAnchorStore {
    pool: PgPool,
}

impl PgAnchorStore {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!("Anchor persistence connected");
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spatial_anchors (
                id VARCHAR(255) PRIMARY KEY,
                session_id VARCHAR(255) NOT NULL,
                user_id VARCHAR(255) NOT NULL,
                position GEOMETRY(POINT, 4326),
                rotation_x FLOAT NOT NULL,
                rotation_y FLOAT NOT NULL,
                rotation_z FLOAT NOT NULL,
                rotation_w FLOAT NOT NULL,
                confidence FLOAT DEFAULT 1.0,
                tracking_state VARCHAR(50) DEFAULT 'tracking',
                anchor_type VARCHAR(50) DEFAULT 'persistent',
                metadata JSONB DEFAULT '{}',
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                expires_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS anchor_sharing (
                id SERIAL PRIMARY KEY,
                anchor_id VARCHAR(255) REFERENCES spatial_anchors(id) ON DELETE CASCADE,
                shared_with_user VARCHAR(255) NOT NULL,
                shared_by_user VARCHAR(255) NOT NULL,
                permission_level VARCHAR(50) DEFAULT 'read',
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                expires_at TIMESTAMPTZ,
                UNIQUE(anchor_id, shared_with_user)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS anchor_history (
                id SERIAL PRIMARY KEY,
                anchor_id VARCHAR(255) NOT NULL,
                action VARCHAR(50) NOT NULL,
                user_id VARCHAR(255) NOT NULL,
                position_before GEOMETRY(POINT, 4326),
                position_after GEOMETRY(POINT, 4326),
                metadata_changes JSONB DEFAULT '{}',
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_spatial_anchors_position ON spatial_anchors USING GIST(position)",
            "CREATE INDEX IF NOT EXISTS idx_spatial_anchors_session ON spatial_anchors(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_spatial_anchors_user ON spatial_anchors(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_spatial_anchors_type ON spatial_anchors(anchor_type)",
            "CREATE INDEX IF NOT EXISTS idx_spatial_anchors_expires ON spatial_anchors(expires_at) WHERE expires_at IS NOT NULL",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        debug!("Anchor schema ensured");
        Ok(())
    }

    const SELECT_COLUMNS: &'static str = r#"
        id, session_id, user_id,
        ST_X(position) AS x, ST_Y(position) AS y,
        rotation_x, rotation_y, rotation_z, rotation_w,
        confidence, tracking_state, anchor_type, metadata,
        created_at, updated_at, expires_at
    "#;

    fn row_to_anchor(row: &PgRow) -> Result<SpatialAnchor, PersistenceError> {
        let metadata: Value = row.try_get("metadata")?;
        // z rides in the metadata sidecar
        let z = metadata
            .get("z_coordinate")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let tracking_state: String = row.try_get("tracking_state")?;
        let anchor_type: String = row.try_get("anchor_type")?;

        Ok(SpatialAnchor {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            user_id: row.try_get("user_id")?,
            position: [row.try_get("x")?, row.try_get("y")?, z],
            rotation: [
                row.try_get("rotation_x")?,
                row.try_get("rotation_y")?,
                row.try_get("rotation_z")?,
                row.try_get("rotation_w")?,
            ],
            confidence: row.try_get("confidence")?,
            tracking_state: TrackingState::parse(&tracking_state)
                .ok_or_else(|| PersistenceError::CorruptRow(format!(
                    "unknown tracking_state {tracking_state}"
                )))?,
            anchor_type: AnchorType::parse(&anchor_type)
                .ok_or_else(|| PersistenceError::CorruptRow(format!(
                    "unknown anchor_type {anchor_type}"
                )))?,
            metadata,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[async_trait]
impl AnchorPersistence for PgAnchorStore {
    async fn store(
        &self,
        anchor: &SpatialAnchor,
        action: HistoryAction,
    ) -> Result<(), PersistenceError> {
        let mut metadata = anchor.metadata.clone();
        if let Some(object) = metadata.as_object_mut() {
            object.insert("z_coordinate".into(), json!(anchor.position[2]));
        }
        let point = format!("POINT({} {})", anchor.position[0], anchor.position[1]);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO spatial_anchors
                (id, session_id, user_id, position,
                 rotation_x, rotation_y, rotation_z, rotation_w,
                 confidence, tracking_state, anchor_type, metadata,
                 created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, ST_GeomFromText($4, 4326),
                    $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                position = ST_GeomFromText($4, 4326),
                rotation_x = $5, rotation_y = $6, rotation_z = $7, rotation_w = $8,
                confidence = $9, tracking_state = $10, metadata = $12, updated_at = $14,
                expires_at = $15
            "#,
        )
        .bind(&anchor.id)
        .bind(&anchor.session_id)
        .bind(&anchor.user_id)
        .bind(&point)
        .bind(anchor.rotation[0])
        .bind(anchor.rotation[1])
        .bind(anchor.rotation[2])
        .bind(anchor.rotation[3])
        .bind(anchor.confidence)
        .bind(anchor.tracking_state.as_str())
        .bind(anchor.anchor_type.as_str())
        .bind(&metadata)
        .bind(anchor.created_at)
        .bind(anchor.updated_at)
        .bind(anchor.expires_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO anchor_history (anchor_id, action, user_id, position_after)
            VALUES ($1, $2, $3, ST_GeomFromText($4, 4326))
            "#,
        )
        .bind(&anchor.id)
        .bind(action.as_str())
        .bind(&anchor.user_id)
        .bind(&point)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Stored anchor {}", anchor.id);
        Ok(())
    }

    async fn load(&self, anchor_id: &str) -> Result<Option<SpatialAnchor>, PersistenceError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM spatial_anchors WHERE id = $1",
            Self::SELECT_COLUMNS
        ))
        .bind(anchor_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_anchor).transpose()
    }

    async fn load_active(&self) -> Result<Vec<SpatialAnchor>, PersistenceError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {} FROM spatial_anchors
               WHERE expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP
               ORDER BY created_at DESC"#,
            Self::SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_anchor).collect()
    }

    async fn load_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<SpatialAnchor>, PersistenceError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {} FROM spatial_anchors
               WHERE session_id = $1
                 AND (expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP)
               ORDER BY created_at DESC"#,
            Self::SELECT_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_anchor).collect()
    }

    async fn delete(&self, anchor_id: &str) -> Result<bool, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO anchor_history (anchor_id, action, user_id)
            SELECT id, 'deleted', user_id FROM spatial_anchors WHERE id = $1
            "#,
        )
        .bind(anchor_id)
        .execute(&mut *tx)
        .await?;

        // Sharing grants cascade via the foreign key
        let result = sqlx::query("DELETE FROM spatial_anchors WHERE id = $1")
            .bind(anchor_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_nearby(
        &self,
        position: [f64; 3],
        radius_meters: f64,
        limit: i64,
    ) -> Result<Vec<SpatialAnchor>, PersistenceError> {
        let point = format!("POINT({} {})", position[0], position[1]);
        let rows = sqlx::query(&format!(
            r#"SELECT {},
                      ST_Distance(position, ST_GeomFromText($1, 4326)) AS distance
               FROM spatial_anchors
               WHERE ST_DWithin(position, ST_GeomFromText($1, 4326), $2)
                 AND (expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP)
                 AND tracking_state = 'tracking'
               ORDER BY distance ASC
               LIMIT $3"#,
            Self::SELECT_COLUMNS
        ))
        .bind(&point)
        .bind(radius_meters)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_anchor).collect()
    }

    async fn share(&self, grant: &ShareGrant) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO anchor_sharing
                (anchor_id, shared_with_user, shared_by_user, permission_level, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (anchor_id, shared_with_user) DO UPDATE SET
                permission_level = EXCLUDED.permission_level,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&grant.anchor_id)
        .bind(&grant.shared_with_user)
        .bind(&grant.shared_by_user)
        .bind(grant.permission_level.as_str())
        .bind(grant.expires_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO anchor_history (anchor_id, action, user_id, metadata_changes)
            VALUES ($1, 'shared', $2, $3)
            "#,
        )
        .bind(&grant.anchor_id)
        .bind(&grant.shared_by_user)
        .bind(json!({
            "shared_with": grant.shared_with_user,
            "permission": grant.permission_level.as_str(),
        }))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            "Shared anchor {} with user {}",
            grant.anchor_id, grant.shared_with_user
        );
        Ok(())
    }

    async fn shared_with(&self, user_id: &str) -> Result<Vec<SpatialAnchor>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.session_id, a.user_id,
                   ST_X(a.position) AS x, ST_Y(a.position) AS y,
                   a.rotation_x, a.rotation_y, a.rotation_z, a.rotation_w,
                   a.confidence, a.tracking_state, a.anchor_type, a.metadata,
                   a.created_at, a.updated_at, a.expires_at
            FROM spatial_anchors a
            JOIN anchor_sharing s ON a.id = s.anchor_id
            WHERE s.shared_with_user = $1
              AND (a.expires_at IS NULL OR a.expires_at > CURRENT_TIMESTAMP)
              AND (s.expires_at IS NULL OR s.expires_at > CURRENT_TIMESTAMP)
            ORDER BY a.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_anchor).collect()
    }

    async fn cleanup_expired(&self) -> Result<u64, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO anchor_history (anchor_id, action, user_id)
            SELECT id, 'expired', user_id FROM spatial_anchors
            WHERE expires_at IS NOT NULL AND expires_at <= CURRENT_TIMESTAMP
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM spatial_anchors
            WHERE expires_at IS NOT NULL AND expires_at <= CURRENT_TIMESTAMP
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM anchor_sharing
            WHERE expires_at IS NOT NULL AND expires_at <= CURRENT_TIMESTAMP
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        let count = deleted.rows_affected();
        if count > 0 {
            info!("Cleaned up {count} expired anchors");
        }
        Ok(count)
    }

    async fn health(&self) -> bool {
        match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Persistence health check failed: {e}");
                false
            }
        }
    }
}

// ── In-Memory Store ───────────────────────────────────────────────────────────

/// Development/test implementation of the persistence seam. Same visible
/// semantics as the database store, including the 2-D nearby search.
#[derive(Default)]
pub struct MemoryAnchorStore {
    anchors: RwLock<HashMap<String, SpatialAnchor>>,
    grants: RwLock<HashMap<(String, String), ShareGrant>>,
    history: RwLock<Vec<(String, HistoryAction, String)>>,
}

impl MemoryAnchorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded `(anchor_id, action, user_id)` rows, for tests
    pub async fn history(&self) -> Vec<(String, HistoryAction, String)> {
        self.history.read().await.clone()
    }
}

fn is_expired(anchor: &SpatialAnchor, now: DateTime<Utc>) -> bool {
    anchor.expires_at.map(|e| e <= now).unwrap_or(false)
}

#[async_trait]
impl AnchorPersistence for MemoryAnchorStore {
    async fn store(
        &self,
        anchor: &SpatialAnchor,
        action: HistoryAction,
    ) -> Result<(), PersistenceError> {
        let mut stored = anchor.clone();
        if let Some(object) = stored.metadata.as_object_mut() {
            object.insert("z_coordinate".into(), json!(anchor.position[2]));
        }
        self.anchors.write().await.insert(stored.id.clone(), stored);
        self.history
            .write()
            .await
            .push((anchor.id.clone(), action, anchor.user_id.clone()));
        Ok(())
    }

    async fn load(&self, anchor_id: &str) -> Result<Option<SpatialAnchor>, PersistenceError> {
        Ok(self.anchors.read().await.get(anchor_id).cloned())
    }

    async fn load_active(&self) -> Result<Vec<SpatialAnchor>, PersistenceError> {
        let now = Utc::now();
        Ok(self
            .anchors
            .read()
            .await
            .values()
            .filter(|a| !is_expired(a, now))
            .cloned()
            .collect())
    }

    async fn load_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<SpatialAnchor>, PersistenceError> {
        let now = Utc::now();
        Ok(self
            .anchors
            .read()
            .await
            .values()
            .filter(|a| a.session_id == session_id && !is_expired(a, now))
            .cloned()
            .collect())
    }

    async fn delete(&self, anchor_id: &str) -> Result<bool, PersistenceError> {
        let removed = self.anchors.write().await.remove(anchor_id);
        if let Some(anchor) = &removed {
            self.grants
                .write()
                .await
                .retain(|key, _| key.0 != anchor_id);
            self.history.write().await.push((
                anchor_id.to_string(),
                HistoryAction::Deleted,
                anchor.user_id.clone(),
            ));
        }
        Ok(removed.is_some())
    }

    async fn find_nearby(
        &self,
        position: [f64; 3],
        radius_meters: f64,
        limit: i64,
    ) -> Result<Vec<SpatialAnchor>, PersistenceError> {
        let now = Utc::now();
        let planar = |a: &SpatialAnchor| {
            let dx = a.position[0] - position[0];
            let dy = a.position[1] - position[1];
            (dx * dx + dy * dy).sqrt()
        };

        let mut matches: Vec<SpatialAnchor> = self
            .anchors
            .read()
            .await
            .values()
            .filter(|a| {
                !is_expired(a, now)
                    && a.tracking_state == TrackingState::Tracking
                    && planar(a) <= radius_meters
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| planar(a).total_cmp(&planar(b)));
        matches.truncate(limit.max(0) as usize);
        Ok(matches)
    }

    async fn share(&self, grant: &ShareGrant) -> Result<(), PersistenceError> {
        self.grants.write().await.insert(
            (grant.anchor_id.clone(), grant.shared_with_user.clone()),
            grant.clone(),
        );
        self.history.write().await.push((
            grant.anchor_id.clone(),
            HistoryAction::Shared,
            grant.shared_by_user.clone(),
        ));
        Ok(())
    }

    async fn shared_with(&self, user_id: &str) -> Result<Vec<SpatialAnchor>, PersistenceError> {
        let now = Utc::now();
        let grants = self.grants.read().await;
        let anchors = self.anchors.read().await;
        Ok(grants
            .values()
            .filter(|g| {
                g.shared_with_user == user_id
                    && g.expires_at.map(|e| e > now).unwrap_or(true)
            })
            .filter_map(|g| anchors.get(&g.anchor_id))
            .filter(|a| !is_expired(a, now))
            .cloned()
            .collect())
    }

    async fn cleanup_expired(&self) -> Result<u64, PersistenceError> {
        let now = Utc::now();
        let mut anchors = self.anchors.write().await;
        let expired: Vec<String> = anchors
            .values()
            .filter(|a| is_expired(a, now))
            .map(|a| a.id.clone())
            .collect();
        let mut history = self.history.write().await;
        for id in &expired {
            if let Some(anchor) = anchors.remove(id) {
                history.push((id.clone(), HistoryAction::Expired, anchor.user_id));
            }
        }
        self.grants.write().await.retain(|key, grant| {
            !expired.contains(&key.0) && grant.expires_at.map(|e| e > now).unwrap_or(true)
        });
        Ok(expired.len() as u64)
    }

    async fn health(&self) -> bool {
        true
    }
}
