//! Session, one-time-code and token authentication for the site backend.
//!
//! All three credential kinds resolve to the same opaque principal
//! identifier. Codes and sessions are ephemeral and live in managed
//! [`TimedStore`]s: codes are single-use with a fixed TTL, sessions have a
//! sliding TTL refreshed on every successful lookup. Long-lived tokens go
//! through the [`AuthTokenRepository`] port to a durable store.

mod repository;

pub use repository::{
    AuthTokenRecord, AuthTokenRepository, InMemoryTokenRepository,
};

use std::{any::type_name_of_val, fmt, sync::Arc, time::Duration};

use rand::{TryRngCore, rngs::OsRng};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{TimedStore, create_managed_store, now_ms};

const DEFAULT_CODE_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const AUTH_CODE_BYTES: usize = 8;

/// Errors surfaced by the auth service. Lookup misses are not errors; they
/// come back as `None`.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The durable token repository failed.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// TTLs for the three credential kinds.
#[derive(Debug, Clone, Copy)]
pub struct AuthConfig {
    /// One-time code lifetime (default 5 minutes).
    pub code_ttl: Duration,
    /// Sliding session lifetime (default 60 minutes).
    pub session_ttl: Duration,
    /// Durable token lifetime (default 7 days).
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            code_ttl: DEFAULT_CODE_TTL,
            session_ttl: DEFAULT_SESSION_TTL,
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

impl AuthConfig {
    /// Override the one-time code TTL (primarily for tests).
    pub fn with_code_ttl(mut self, ttl: Duration) -> Self {
        self.code_ttl = ttl;
        self
    }

    /// Override the sliding session TTL (primarily for tests).
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Override the durable token TTL (primarily for tests).
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }
}

/// A freshly issued durable token pair.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Identifier the client presents alongside the secret.
    pub auth_id: String,
    /// The secret itself.
    pub token: String,
}

/// Authentication over one-time codes, sliding sessions and durable tokens.
pub struct AuthService<R>
where
    R: AuthTokenRepository + ?Sized,
{
    code_store: TimedStore<String>,
    session_store: TimedStore<String>,
    repository: Arc<R>,
    config: AuthConfig,
}

impl<R> Clone for AuthService<R>
where
    R: AuthTokenRepository + ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            code_store: self.code_store.clone(),
            session_store: self.session_store.clone(),
            repository: Arc::clone(&self.repository),
            config: self.config,
        }
    }
}

impl<R> fmt::Debug for AuthService<R>
where
    R: AuthTokenRepository + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthService")
            .field("repository", &type_name_of_val(self.repository.as_ref()))
            .field("config", &self.config)
            .finish()
    }
}

impl<R> AuthService<R>
where
    R: AuthTokenRepository + ?Sized,
{
    /// Creates a service with default TTLs. The code and session stores are
    /// registered for coordinated shutdown.
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            code_store: create_managed_store(),
            session_store: create_managed_store(),
            repository,
            config: AuthConfig::default(),
        }
    }

    /// Override the TTL configuration.
    pub fn with_config(mut self, config: AuthConfig) -> Self {
        self.config = config;
        self
    }

    /// Issues a one-time auth code for `principal`, valid for the code TTL.
    pub async fn start_code_auth(&self, principal: &str) -> String {
        let code = random_auth_code();
        let expires_at = now_ms() + self.config.code_ttl.as_millis() as i64;
        self.code_store
            .set(code.clone(), principal.to_string(), expires_at)
            .await;
        debug!(principal, "issued one-time auth code");
        code
    }

    /// Resolves a one-time code to its principal. A successful lookup
    /// consumes the code; a second attempt returns `None`.
    pub async fn auth_by_code(&self, code: &str) -> Option<String> {
        let principal = self.code_store.get(code).await?;
        // Single-use: deletion is this caller's job, not the store's.
        self.code_store.delete(code).await;
        Some(principal)
    }

    /// Opens a session for `principal` and returns its id.
    pub async fn create_session(&self, principal: &str) -> String {
        let session_id = Uuid::new_v4().to_string();
        let expires_at = now_ms() + self.config.session_ttl.as_millis() as i64;
        self.session_store
            .set(session_id.clone(), principal.to_string(), expires_at)
            .await;
        session_id
    }

    /// Resolves a session id to its principal, refreshing the sliding
    /// expiry on success.
    pub async fn auth_by_session(&self, session_id: &str) -> Option<String> {
        let principal = self.session_store.get(session_id).await?;
        let expires_at = now_ms() + self.config.session_ttl.as_millis() as i64;
        self.session_store
            .set(session_id.to_string(), principal.clone(), expires_at)
            .await;
        Some(principal)
    }

    /// Issues a durable token for `principal` through the repository.
    pub async fn create_auth_token(
        &self,
        principal: &str,
    ) -> Result<IssuedToken, AuthError> {
        // v7 ids sort by issue time, matching how the durable store indexes.
        let auth_id = Uuid::now_v7().to_string();
        let token = Uuid::new_v4().simple().to_string();
        self.repository
            .insert(AuthTokenRecord {
                auth_id: auth_id.clone(),
                principal: principal.to_string(),
                token: token.clone(),
                expires_at_ms: now_ms()
                    + self.config.token_ttl.as_millis() as i64,
            })
            .await?;
        Ok(IssuedToken { auth_id, token })
    }

    /// Resolves an auth id plus token secret to its principal.
    pub async fn auth_by_token(
        &self,
        auth_id: &str,
        token: &str,
    ) -> Result<Option<String>, AuthError> {
        let Some(record) = self.repository.find(auth_id).await? else {
            return Ok(None);
        };
        if record.token == token && record.expires_at_ms >= now_ms() {
            Ok(Some(record.principal))
        } else {
            Ok(None)
        }
    }

    /// Extends an existing token's life by the token TTL. Returns `false`
    /// when the token does not exist for this principal.
    pub async fn refresh_auth_token(
        &self,
        principal: &str,
        auth_id: &str,
    ) -> Result<bool, AuthError> {
        let expires_at = now_ms() + self.config.token_ttl.as_millis() as i64;
        Ok(self
            .repository
            .update_expiry(principal, auth_id, expires_at)
            .await?)
    }

    /// Removes every credential for `principal`: pending codes, live
    /// sessions and durable tokens.
    pub async fn expire_all_auth(
        &self,
        principal: &str,
    ) -> Result<(), AuthError> {
        let principal_value = principal.to_string();
        self.code_store.delete_all_values(&principal_value).await;
        self.session_store.delete_all_values(&principal_value).await;
        let revoked = self.repository.revoke_for_principal(principal).await?;
        info!(principal, revoked, "expired all credentials for principal");
        Ok(())
    }
}

/// 16 uppercase hex characters from the OS RNG.
fn random_auth_code() -> String {
    let mut bytes = [0u8; AUTH_CODE_BYTES];
    let mut rng = OsRng;
    rng.try_fill_bytes(&mut bytes)
        .expect("secure random generation available");

    let mut out = String::with_capacity(AUTH_CODE_BYTES * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02X}"));
    }
    out
}
