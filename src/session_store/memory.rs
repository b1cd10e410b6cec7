use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{PaymentSession, SessionStore, StoreError};

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<Uuid, Expiring<PaymentSession>>,
    buyers: HashMap<String, Expiring<Uuid>>,
    claims: HashMap<Uuid, Instant>,
}

impl Inner {
    /// Drops every expired session, index entry and claim.
    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.sessions.retain(|_, entry| entry.expires_at > now);
        self.buyers.retain(|_, entry| entry.expires_at > now);
        self.claims.retain(|_, expires_at| *expires_at > now);
    }

    fn live_session(&mut self, session_id: Uuid) -> Option<PaymentSession> {
        match self.sessions.get(&session_id) {
            Some(entry) if entry.is_expired() => {
                self.sessions.remove(&session_id);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

/// Process-local session store for single-node deployments and tests.
/// One lock guards sessions, the buyer index and claims so every operation
/// is atomic with respect to the others.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.sessions.values().filter(|e| !e.is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(
        &self,
        session: &PaymentSession,
        ttl: Duration,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.evict_expired();

        inner.sessions.insert(
            session.session_id,
            Expiring::new(session.clone(), ttl),
        );
        let previous = inner
            .buyers
            .insert(
                session.user_id.clone(),
                Expiring::new(session.session_id, ttl),
            )
            .map(|entry| entry.value)
            .filter(|id| *id != session.session_id);

        if let Some(previous) = previous {
            inner.sessions.remove(&previous);
        }
        Ok(previous)
    }

    async fn load(&self, session_id: Uuid) -> Result<Option<PaymentSession>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live_session(session_id))
    }

    async fn pending_for_buyer(
        &self,
        buyer_id: &str,
    ) -> Result<Option<PaymentSession>, StoreError> {
        let mut inner = self.inner.lock().await;
        let session_id = match inner.buyers.get(buyer_id) {
            Some(entry) if entry.is_expired() => {
                inner.buyers.remove(buyer_id);
                return Ok(None);
            }
            Some(entry) => entry.value,
            None => return Ok(None),
        };
        Ok(inner.live_session(session_id))
    }

    async fn remove(&self, session: &PaymentSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(&session.session_id);
        let points_here = inner
            .buyers
            .get(&session.user_id)
            .map(|entry| entry.value == session.session_id)
            .unwrap_or(false);
        if points_here {
            inner.buyers.remove(&session.user_id);
        }
        Ok(())
    }

    async fn try_claim(&self, session_id: Uuid, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.evict_expired();
        let now = Instant::now();
        match inner.claims.get(&session_id) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                inner.claims.insert(session_id, now + ttl);
                Ok(true)
            }
        }
    }

    async fn release_claim(&self, session_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.claims.remove(&session_id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
