//! Service discovery and health monitoring for the gateway's upstreams.
//!
//! A background ticker probes every registered service concurrently with a
//! 5-second per-probe timeout and atomically updates each entry. Readers ask
//! `get_url`/`is_healthy`; unhealthy services resolve to no URL so routing
//! fails fast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub base_url: String,
    pub health_path: String,
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub response_time_ms: Option<f64>,
}

impl ServiceInfo {
    fn health_url(&self) -> String {
        format!("{}{}", self.base_url, self.health_path)
    }
}

pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceInfo>>,
    client: reqwest::Client,
    check_interval: Duration,
}

impl ServiceRegistry {
    pub fn new(check_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            services: RwLock::new(HashMap::new()),
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_default(),
            check_interval,
        })
    }

    pub async fn register(&self, name: &str, base_url: &str, health_path: &str) {
        let info = ServiceInfo {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            health_path: health_path.to_string(),
            healthy: false,
            last_check: None,
            response_time_ms: None,
        };
        info!("Registered service: {name} -> {}", info.base_url);
        self.services.write().await.insert(name.to_string(), info);
    }

    /// The default upstream set behind the gateway.
    pub async fn register_defaults(&self) {
        self.register("localization", "http://localization:8080", "/health").await;
        self.register("mapping", "http://mapping-processor:8080", "/health").await;
        self.register("nakama", "http://nakama:7350", "/").await;
    }

    /// Base URL for a healthy service; `None` while it is down.
    pub async fn get_url(&self, name: &str) -> Option<String> {
        let services = self.services.read().await;
        services
            .get(name)
            .filter(|s| s.healthy)
            .map(|s| s.base_url.clone())
    }

    pub async fn is_healthy(&self, name: &str) -> bool {
        self.services
            .read()
            .await
            .get(name)
            .map(|s| s.healthy)
            .unwrap_or(false)
    }

    pub async fn status_summary(&self) -> Value {
        let services = self.services.read().await;
        let mut status = serde_json::Map::new();
        let mut healthy_count = 0;
        for (name, service) in services.iter() {
            if service.healthy {
                healthy_count += 1;
            }
            status.insert(
                name.clone(),
                json!({
                    "url": service.base_url,
                    "healthy": service.healthy,
                    "last_check": service.last_check.map(|t| t.to_rfc3339()),
                    "response_time_ms": service.response_time_ms,
                }),
            );
        }
        json!({
            "services": status,
            "summary": {
                "total_services": services.len(),
                "healthy_services": healthy_count,
            }
        })
    }

    /// Probe every service concurrently and fold the results back in.
    pub async fn check_all(&self) {
        let targets: Vec<(String, String)> = {
            let services = self.services.read().await;
            services
                .values()
                .map(|s| (s.name.clone(), s.health_url()))
                .collect()
        };

        let probes = targets.into_iter().map(|(name, url)| {
            let client = self.client.clone();
            async move {
                let started = Instant::now();
                let result = client.get(&url).send().await;
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                let healthy = matches!(&result, Ok(r) if r.status().is_success());
                (name, healthy, elapsed_ms, result.err().map(|e| e.to_string()))
            }
        });

        let results = futures_util::future::join_all(probes).await;
        let mut services = self.services.write().await;
        for (name, healthy, elapsed_ms, error) in results {
            if let Some(service) = services.get_mut(&name) {
                service.healthy = healthy;
                service.last_check = Some(Utc::now());
                service.response_time_ms = if healthy { Some(elapsed_ms) } else { None };
                match (healthy, error) {
                    (true, _) => debug!("Service {name} healthy ({elapsed_ms:.1}ms)"),
                    (false, Some(e)) => warn!("Service {name} check failed: {e}"),
                    (false, None) => warn!("Service {name} unhealthy (non-2xx)"),
                }
            }
        }
    }

    /// Health-probe loop; exits when the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.check_all().await,
                _ = shutdown.changed() => {
                    info!("Service registry probe loop stopped");
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    pub async fn force_health(&self, name: &str, healthy: bool) {
        if let Some(service) = self.services.write().await.get_mut(name) {
            service.healthy = healthy;
            service.last_check = Some(Utc::now());
        }
    }
}
