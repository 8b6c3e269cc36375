//! Token verification, anonymous identity minting, and permission derivation.
//!
//! Two admission modes:
//! - **Token-admitted**: HS256-signed bearer tokens with short expiry. Bad
//!   signature, expiry, wrong token type, unknown subject, or an inactive
//!   account all reject with `AuthFailed`.
//! - **Anonymous**: a fresh `anon_<12 hex>` identity with a `Player_<4 digits>`
//!   display name, no credentials required.
//!
//! Permissions are derived exactly once at admission and never mutated for
//! the life of the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::ApiError;

// ── Identity Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub is_active: bool,
}

/// Who a connection belongs to, resolved at admission time.
#[derive(Debug, Clone)]
pub enum Identity {
    User { id: String, username: String, roles: Vec<String> },
    Anonymous { id: String, display_name: String },
}

impl Identity {
    pub fn id(&self) -> &str {
        match self {
            Self::User { id, .. } => id,
            Self::Anonymous { id, .. } => id,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Self::User { username, .. } => username,
            Self::Anonymous { display_name, .. } => display_name,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous { .. })
    }
}

/// Session-level permissions, fixed for the connection lifetime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Permissions {
    pub can_join: bool,
    pub can_create_anchors: bool,
    pub can_delete_anchors: bool,
    pub can_moderate: bool,
    pub max_sessions: u32,
}

// ── JWT Claims ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    roles: Option<Vec<String>>,
    exp: i64,
    iat: i64,
    #[serde(rename = "type")]
    token_type: String,
}

// ── Auth Engine ───────────────────────────────────────────────────────────────

pub struct AuthEngine {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_expiry: Duration,
    refresh_expiry: Duration,
    users: RwLock<HashMap<String, User>>,
    /// refresh token -> user id; removal revokes the token
    refresh_tokens: RwLock<HashMap<String, String>>,
}

impl AuthEngine {
    pub fn new(jwt_secret: &str) -> Arc<Self> {
        Arc::new(Self {
            encoding_key: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            access_expiry: Duration::from_secs(24 * 3600),
            refresh_expiry: Duration::from_secs(7 * 24 * 3600),
            users: RwLock::new(HashMap::new()),
            refresh_tokens: RwLock::new(HashMap::new()),
        })
    }

    // ── User directory ────────────────────────────────────────────────────────

    /// Register a user in the in-memory directory. Account CRUD is out of
    /// scope for this service; the directory is fed by the deployment
    /// (seed users, upstream identity sync).
    pub async fn insert_user(&self, user: User) {
        info!("Registered user: {} ({})", user.username, user.id);
        self.users.write().await.insert(user.id.clone(), user);
    }

    pub async fn deactivate_user(&self, user_id: &str) {
        if let Some(user) = self.users.write().await.get_mut(user_id) {
            user.is_active = false;
        }
    }

    // ── Token issuance ────────────────────────────────────────────────────────

    pub async fn issue_access_token(&self, user_id: &str) -> Result<String, ApiError> {
        let users = self.users.read().await;
        let user = users
            .get(user_id)
            .ok_or_else(|| ApiError::AuthFailed("unknown user".into()))?;
        self.encode_token(user, "access", self.access_expiry)
    }

    pub async fn issue_refresh_token(&self, user_id: &str) -> Result<String, ApiError> {
        let token = {
            let users = self.users.read().await;
            let user = users
                .get(user_id)
                .ok_or_else(|| ApiError::AuthFailed("unknown user".into()))?;
            self.encode_token(user, "refresh", self.refresh_expiry)?
        };
        self.refresh_tokens
            .write()
            .await
            .insert(token.clone(), user_id.to_string());
        Ok(token)
    }

    fn encode_token(
        &self,
        user: &User,
        token_type: &str,
        expiry: Duration,
    ) -> Result<String, ApiError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id.clone(),
            username: Some(user.username.clone()),
            roles: Some(user.roles.clone()),
            exp: (now + chrono::Duration::from_std(expiry).unwrap_or_default()).timestamp(),
            iat: now.timestamp(),
            token_type: token_type.to_string(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ApiError::Internal(format!("token encoding failed: {e}")))
    }

    // ── Token verification ────────────────────────────────────────────────────

    /// Verify an access token and resolve it to a live user identity.
    pub async fn verify_token(&self, token: &str) -> Result<Identity, ApiError> {
        let claims = self.decode_claims(token)?;
        if claims.token_type != "access" {
            return Err(ApiError::AuthFailed("invalid token type".into()));
        }

        let mut users = self.users.write().await;
        let user = users
            .get_mut(&claims.sub)
            .ok_or_else(|| ApiError::AuthFailed("user not found".into()))?;
        if !user.is_active {
            return Err(ApiError::AuthFailed("account inactive".into()));
        }
        user.last_active = Utc::now();

        Ok(Identity::User {
            id: user.id.clone(),
            username: user.username.clone(),
            roles: user.roles.clone(),
        })
    }

    /// Exchange a refresh token for a new access token. Revoked tokens are
    /// rejected even when their signature is still valid.
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<String, ApiError> {
        let claims = match self.decode_claims(refresh_token) {
            Ok(c) => c,
            Err(e) => {
                // Expired refresh tokens are dropped from the live set
                self.refresh_tokens.write().await.remove(refresh_token);
                return Err(e);
            }
        };
        if claims.token_type != "refresh" {
            return Err(ApiError::AuthFailed("invalid token type".into()));
        }
        if !self.refresh_tokens.read().await.contains_key(refresh_token) {
            return Err(ApiError::AuthFailed("refresh token revoked".into()));
        }
        self.issue_access_token(&claims.sub).await
    }

    pub async fn revoke_refresh_token(&self, refresh_token: &str) {
        if self.refresh_tokens.write().await.remove(refresh_token).is_some() {
            debug!("Refresh token revoked");
        }
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| ApiError::AuthFailed(format!("token rejected: {e}")))
    }

    // ── Anonymous identities ──────────────────────────────────────────────────

    /// Mint a fresh anonymous identity: `anon_<12 lowercase hex>` with an
    /// optional caller-chosen display name.
    pub fn mint_anonymous(&self, display_name: Option<String>) -> Identity {
        let mut rng = rand::thread_rng();
        let mut hasher = Sha256::new();
        hasher.update(crate::util::now_ms().to_le_bytes());
        hasher.update(rng.gen::<u64>().to_le_bytes());
        let digest = hex::encode(hasher.finalize());

        Identity::Anonymous {
            id: format!("anon_{}", &digest[..12]),
            display_name: display_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("Player_{}", rng.gen_range(1000..10000))),
        }
    }

    // ── Permissions ───────────────────────────────────────────────────────────

    /// Derive session permissions from identity kind and roles. Called once
    /// at admission.
    pub fn permissions_for(&self, identity: &Identity) -> Permissions {
        match identity {
            Identity::Anonymous { .. } => Permissions {
                can_join: true,
                can_create_anchors: true,
                can_delete_anchors: false,
                can_moderate: false,
                max_sessions: 1,
            },
            Identity::User { roles, .. } => {
                let is_admin = roles.iter().any(|r| r == "admin");
                let is_moderator = roles.iter().any(|r| r == "moderator");
                let is_premium = roles.iter().any(|r| r == "premium");
                Permissions {
                    can_join: true,
                    can_create_anchors: true,
                    can_delete_anchors: is_admin || is_moderator,
                    can_moderate: is_admin || is_moderator,
                    max_sessions: if is_admin {
                        100
                    } else if is_premium {
                        20
                    } else {
                        5
                    },
                }
            }
        }
    }
}
