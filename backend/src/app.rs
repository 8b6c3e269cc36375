//! Service container: every long-lived component, built once at startup and
//! injected into handlers through axum state. No module-level singletons.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::anchors::{AnchorConfig, AnchorManager};
use crate::auth::AuthEngine;
use crate::codes::ShareCodeDirectory;
use crate::config::AppConfig;
use crate::gateway::RequestRouter;
use crate::persistence::{AnchorPersistence, MemoryAnchorStore, PgAnchorStore};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::registry::ServiceRegistry;
use crate::sessions::SessionStore;
use crate::sync::SyncEngine;
use crate::util::now_ms;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthEngine>,
    pub sessions: Arc<SessionStore>,
    pub codes: Arc<ShareCodeDirectory>,
    pub anchors: Arc<AnchorManager>,
    pub sync: Arc<SyncEngine>,
    pub registry: Arc<ServiceRegistry>,
    pub router: Arc<RequestRouter>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Present only when running against PostgreSQL; used to close the pool
    /// on shutdown
    pub pg_store: Option<Arc<PgAnchorStore>>,
    pub started_at_ms: i64,
}

impl AppState {
    pub async fn build(config: AppConfig) -> Result<Self> {
        let (store, pg_store): (Arc<dyn AnchorPersistence>, Option<Arc<PgAnchorStore>>) =
            match &config.database_url {
                Some(url) => {
                    let pg = Arc::new(PgAnchorStore::connect(url).await?);
                    (pg.clone(), Some(pg))
                }
                None => {
                    warn!("DATABASE_URL not set — anchors held in memory only");
                    (Arc::new(MemoryAnchorStore::new()), None)
                }
            };

        let anchors = AnchorManager::new(store, AnchorConfig::default());
        anchors
            .initialize()
            .await
            .map_err(|e| anyhow::anyhow!("anchor warm-up failed: {e}"))?;

        let registry = ServiceRegistry::new(config.health_check_interval);
        registry.register_defaults().await;

        let state = Self {
            auth: AuthEngine::new(&config.jwt_secret),
            sessions: SessionStore::new(),
            codes: Arc::new(ShareCodeDirectory::new(config.share_code_ttl)),
            anchors,
            sync: SyncEngine::new(),
            router: RequestRouter::new(registry.clone()),
            registry,
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            pg_store,
            started_at_ms: now_ms(),
            config: Arc::new(config),
        };
        info!("Service container ready");
        Ok(state)
    }
}
