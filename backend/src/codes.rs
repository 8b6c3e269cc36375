//! Share-code directory for anonymous sessions: 6-character codes
//! (`ABC123` — three uppercase letters, three digits) mapped to session ids
//! with a TTL that slides forward on any session activity.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::util::now_secs;

const CODE_RETRY_LIMIT: usize = 100;

struct Directory {
    codes: HashMap<String, Uuid>,
    /// session id → (code, expiry unix seconds)
    sessions: HashMap<Uuid, (String, f64)>,
}

pub struct ShareCodeDirectory {
    inner: RwLock<Directory>,
    ttl: Duration,
}

impl ShareCodeDirectory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Directory { codes: HashMap::new(), sessions: HashMap::new() }),
            ttl,
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// Issue a fresh code for a session, retrying on collision.
    pub async fn issue(&self, session_id: Uuid) -> Result<String, ApiError> {
        let mut inner = self.inner.write().await;
        for _ in 0..CODE_RETRY_LIMIT {
            let code = generate_code();
            if inner.codes.contains_key(&code) {
                continue;
            }
            inner.codes.insert(code.clone(), session_id);
            inner
                .sessions
                .insert(session_id, (code.clone(), now_secs() + self.ttl.as_secs_f64()));
            info!("Issued share code {code} for session {session_id}");
            return Ok(code);
        }
        Err(ApiError::Internal("share code space exhausted".into()))
    }

    /// Resolve a code to its session. Case-insensitive; expired entries are
    /// removed lazily and report not-found.
    pub async fn resolve(&self, code: &str) -> Option<Uuid> {
        if !valid_code_format(code) {
            return None;
        }
        let code = code.to_ascii_uppercase();

        let mut inner = self.inner.write().await;
        let session_id = *inner.codes.get(&code)?;
        match inner.sessions.get(&session_id) {
            Some((_, expires_at)) if *expires_at > now_secs() => Some(session_id),
            _ => {
                debug!("Share code {code} expired");
                inner.codes.remove(&code);
                inner.sessions.remove(&session_id);
                None
            }
        }
    }

    /// Slide the expiry forward on session activity.
    pub async fn extend(&self, session_id: Uuid) {
        let mut inner = self.inner.write().await;
        let ttl = self.ttl.as_secs_f64();
        if let Some((_, expires_at)) = inner.sessions.get_mut(&session_id) {
            *expires_at = now_secs() + ttl;
        }
    }

    /// Seconds until the session's code expires
    pub async fn expires_in(&self, session_id: Uuid) -> Option<u64> {
        let inner = self.inner.read().await;
        let (_, expires_at) = inner.sessions.get(&session_id)?;
        Some((expires_at - now_secs()).max(0.0) as u64)
    }

    pub async fn code_for(&self, session_id: Uuid) -> Option<String> {
        let inner = self.inner.read().await;
        inner.sessions.get(&session_id).map(|(code, _)| code.clone())
    }

    pub async fn remove_session(&self, session_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some((code, _)) = inner.sessions.remove(&session_id) {
            inner.codes.remove(&code);
        }
    }

    /// Drop expired entries; returns the affected session ids so their
    /// sessions can be reaped as well.
    pub async fn reap_expired(&self) -> Vec<Uuid> {
        let now = now_secs();
        let mut inner = self.inner.write().await;
        let expired: Vec<Uuid> = inner
            .sessions
            .iter()
            .filter(|(_, (_, expires_at))| *expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for session_id in &expired {
            if let Some((code, _)) = inner.sessions.remove(session_id) {
                inner.codes.remove(&code);
                info!("Reaped expired share code {code} (session {session_id})");
            }
        }
        expired
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let letters: String = (0..3).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect();
    let digits: String = (0..3).map(|_| rng.gen_range(b'0'..=b'9') as char).collect();
    format!("{letters}{digits}")
}

fn valid_code_format(code: &str) -> bool {
    let code = code.as_bytes();
    code.len() == 6
        && code[..3].iter().all(|b| b.is_ascii_alphabetic())
        && code[3..].iter().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_match_format() {
        for _ in 0..200 {
            let code = generate_code();
            assert!(valid_code_format(&code), "bad code {code}");
            assert!(code.chars().take(3).all(|c| c.is_ascii_uppercase()));
        }
    }

    #[tokio::test]
    async fn resolve_is_case_insensitive() {
        let dir = ShareCodeDirectory::new(Duration::from_secs(3600));
        let session = Uuid::new_v4();
        let code = dir.issue(session).await.unwrap();

        assert_eq!(dir.resolve(&code.to_ascii_lowercase()).await, Some(session));
        assert_eq!(dir.resolve(&code).await, Some(session));
    }

    #[tokio::test]
    async fn malformed_codes_do_not_resolve() {
        let dir = ShareCodeDirectory::new(Duration::from_secs(3600));
        let session = Uuid::new_v4();
        dir.issue(session).await.unwrap();

        assert_eq!(dir.resolve("AB123").await, None);
        assert_eq!(dir.resolve("123ABC").await, None);
        assert_eq!(dir.resolve("ABCDEF").await, None);
        assert_eq!(dir.resolve("").await, None);
    }

    #[tokio::test]
    async fn expired_code_is_removed_lazily() {
        let dir = ShareCodeDirectory::new(Duration::from_millis(10));
        let session = Uuid::new_v4();
        let code = dir.issue(session).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(dir.resolve(&code).await, None);
        // Entry is fully gone, not just hidden
        assert_eq!(dir.code_for(session).await, None);
    }

    #[tokio::test]
    async fn extend_slides_expiry_forward() {
        let dir = ShareCodeDirectory::new(Duration::from_millis(50));
        let session = Uuid::new_v4();
        let code = dir.issue(session).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        dir.extend(session).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        // 60 ms after issue, but only 30 ms after the extension
        assert_eq!(dir.resolve(&code).await, Some(session));
    }

    #[tokio::test]
    async fn reap_returns_expired_sessions() {
        let dir = ShareCodeDirectory::new(Duration::from_millis(10));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        dir.issue(a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        dir.issue(b).await.unwrap();

        let reaped = dir.reap_expired().await;
        assert_eq!(reaped, vec![a]);
        assert!(dir.code_for(b).await.is_some());
    }

    #[tokio::test]
    async fn codes_are_unique_at_issue() {
        let dir = ShareCodeDirectory::new(Duration::from_secs(3600));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let code = dir.issue(Uuid::new_v4()).await.unwrap();
            assert!(seen.insert(code));
        }
    }
}
