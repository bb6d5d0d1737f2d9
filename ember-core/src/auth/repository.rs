use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::now_ms;

/// A durable auth token as stored by the backing repository.
#[derive(Debug, Clone)]
pub struct AuthTokenRecord {
    /// Monotonic identifier handed to the client alongside the token.
    pub auth_id: String,
    /// Opaque principal the token authenticates.
    pub principal: String,
    /// The secret compared on lookup.
    pub token: String,
    /// Absolute expiry, ms since epoch.
    pub expires_at_ms: i64,
}

/// Port to the transactional external store holding long-lived auth tokens.
///
/// Tokens are the one credential kind that must survive a process restart,
/// so they live behind this seam rather than in a [`TimedStore`]. The
/// repository owns its own expiry enforcement for stale rows; callers still
/// check `expires_at_ms` on every lookup.
///
/// [`TimedStore`]: crate::store::TimedStore
#[async_trait]
pub trait AuthTokenRepository: Send + Sync {
    /// Persists a freshly issued token.
    async fn insert(&self, record: AuthTokenRecord) -> anyhow::Result<()>;

    /// Looks up a token by its auth id.
    async fn find(&self, auth_id: &str)
    -> anyhow::Result<Option<AuthTokenRecord>>;

    /// Pushes out the expiry of an existing token. Returns `false` when no
    /// token exists for this principal and auth id.
    async fn update_expiry(
        &self,
        principal: &str,
        auth_id: &str,
        expires_at_ms: i64,
    ) -> anyhow::Result<bool>;

    /// Revokes every token belonging to `principal`, returning how many
    /// were removed.
    async fn revoke_for_principal(&self, principal: &str)
    -> anyhow::Result<u64>;
}

/// Repository backed by process memory. Suitable for tests and single-node
/// setups that accept losing tokens on restart.
#[derive(Debug, Default)]
pub struct InMemoryTokenRepository {
    records: Mutex<HashMap<String, AuthTokenRecord>>,
}

impl InMemoryTokenRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthTokenRepository for InMemoryTokenRepository {
    async fn insert(&self, record: AuthTokenRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .await
            .insert(record.auth_id.clone(), record);
        Ok(())
    }

    async fn find(
        &self,
        auth_id: &str,
    ) -> anyhow::Result<Option<AuthTokenRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .get(auth_id)
            .filter(|record| record.expires_at_ms >= now_ms())
            .cloned())
    }

    async fn update_expiry(
        &self,
        principal: &str,
        auth_id: &str,
        expires_at_ms: i64,
    ) -> anyhow::Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(auth_id) {
            Some(record) if record.principal == principal => {
                record.expires_at_ms = expires_at_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_for_principal(
        &self,
        principal: &str,
    ) -> anyhow::Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.principal != principal);
        Ok((before - records.len()) as u64)
    }
}
