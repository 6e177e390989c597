use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::SESSION_TTL_MS;
use crate::model::Ms;

/// Verified profile returned by the external identity provider. The engine
/// trusts this result and never sees credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityProfile {
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
}

#[derive(Debug)]
pub enum IdentityError {
    InvalidSession,
    Unavailable(String),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::InvalidSession => write!(f, "invalid session"),
            IdentityError::Unavailable(reason) => write!(f, "identity provider unavailable: {reason}"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// External identity collaborator: exchanges an opaque session id for a
/// verified profile.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, session_id: &str) -> Result<IdentityProfile, IdentityError>;
}

/// Development provider deriving a deterministic profile from the opaque id.
/// Real deployments wire the hosted auth broker behind the same trait.
pub struct StubIdentityProvider;

#[async_trait]
impl IdentityProvider for StubIdentityProvider {
    async fn resolve(&self, session_id: &str) -> Result<IdentityProfile, IdentityError> {
        let handle: String = session_id
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .take(64)
            .collect();
        if handle.is_empty() {
            return Err(IdentityError::InvalidSession);
        }
        Ok(IdentityProfile {
            email: format!("{}@parkd.dev", handle.to_lowercase()),
            name: handle,
            picture: None,
        })
    }
}

struct Session {
    user_id: Ulid,
    expires_at: Ms,
}

/// In-memory session table: bearer token → user. Sessions are deliberately
/// not persisted; a restart just asks users to sign in again.
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self { sessions: DashMap::new() }
    }

    /// Mint a fresh bearer token for a user.
    pub fn mint(&self, user_id: Ulid, now: Ms) -> String {
        let token = Ulid::new().to_string();
        self.sessions.insert(
            token.clone(),
            Session { user_id, expires_at: now + SESSION_TTL_MS },
        );
        token
    }

    /// Resolve a bearer token, dropping it if expired.
    pub fn resolve(&self, token: &str, now: Ms) -> Option<Ulid> {
        let expired = match self.sessions.get(token) {
            Some(s) if s.expires_at > now => return Some(s.user_id),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.sessions.remove(token);
        }
        None
    }

    pub fn revoke(&self, token: &str) {
        self.sessions.remove(token);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_provider_is_deterministic() {
        let a = StubIdentityProvider.resolve("Alice-42").await.unwrap();
        let b = StubIdentityProvider.resolve("Alice-42").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.email, "alice-42@parkd.dev");
    }

    #[tokio::test]
    async fn stub_provider_rejects_garbage() {
        assert!(StubIdentityProvider.resolve("").await.is_err());
        assert!(StubIdentityProvider.resolve("///").await.is_err());
    }

    #[test]
    fn sessions_expire() {
        let store = SessionStore::new();
        let user = Ulid::new();
        let token = store.mint(user, 1_000);

        assert_eq!(store.resolve(&token, 2_000), Some(user));
        assert_eq!(store.resolve(&token, 1_000 + SESSION_TTL_MS + 1), None);
        // Expired resolution drops the session entirely.
        assert_eq!(store.resolve(&token, 2_000), None);
    }

    #[test]
    fn revoked_sessions_are_gone() {
        let store = SessionStore::new();
        let token = store.mint(Ulid::new(), 0);
        store.revoke(&token);
        assert_eq!(store.resolve(&token, 1), None);
    }
}
