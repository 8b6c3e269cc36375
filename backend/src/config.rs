//! Startup configuration, read once from the environment.
//!
//! Production refuses to boot with a missing or placeholder JWT secret;
//! development generates a throwaway secret so local runs need no setup.

use std::time::Duration;

use anyhow::{bail, Result};
use rand::RngCore;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub port: u16,
    /// When absent in development, the anchor store falls back to the
    /// in-memory implementation.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub cors_origins: String,
    /// Service registry probe cadence
    pub health_check_interval: Duration,
    /// Session/sync heartbeat sweep cadence
    pub heartbeat_interval: Duration,
    /// Players idle longer than this are reaped
    pub idle_timeout: Duration,
    /// Anchor expiry sweep cadence
    pub anchor_cleanup_interval: Duration,
    /// Share-code TTL, slid forward on session activity
    pub share_code_ttl: Duration,
}

const PLACEHOLDER_SECRETS: &[&str] = &["", "secret", "change-me", "changeme", "dev-secret", "placeholder"];

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let environment = match std::env::var("ENVIRONMENT").as_deref() {
            Ok("production") => Environment::Production,
            _ => Environment::Development,
        };

        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(s) if !PLACEHOLDER_SECRETS.contains(&s.trim()) => s,
            Ok(_) if environment == Environment::Production => {
                bail!("JWT_SECRET is a placeholder value; refusing to start in production")
            }
            Err(_) if environment == Environment::Production => {
                bail!("JWT_SECRET environment variable required in production")
            }
            _ => {
                warn!("Using generated JWT secret for development. Set JWT_SECRET for production.");
                generated_secret()
            }
        };

        let database_url = std::env::var("DATABASE_URL").ok();
        if database_url.is_none() && environment == Environment::Production {
            bail!("DATABASE_URL environment variable required in production");
        }

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let health_check_interval = env_secs("HEALTH_CHECK_INTERVAL_SECS", 30);

        Ok(Self {
            environment,
            port,
            database_url,
            jwt_secret,
            cors_origins: std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string()),
            health_check_interval,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            anchor_cleanup_interval: Duration::from_secs(300),
            share_code_ttl: Duration::from_secs(3600),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

fn generated_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
