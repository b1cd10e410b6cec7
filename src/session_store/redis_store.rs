use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisError, Script};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    buyer_index_key, claim_key, session_key, PaymentSession, SessionStore, StoreError,
    SESSION_KEY_PREFIX,
};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

// Stores the session, repoints the buyer index and deletes the session the
// index previously named. Returns that session's id, or nil.
const SAVE_SESSION_SCRIPT: &str = r#"
local previous = redis.call('GET', KEYS[2])
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
if previous and previous ~= ARGV[2] then
    redis.call('DEL', ARGV[4] .. ':' .. previous)
    return previous
end
return false
"#;

// Deletes the session and clears the buyer index only while it still points
// at this session, so a newer session for the same buyer keeps its index.
const REMOVE_SESSION_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1])
if redis.call('GET', KEYS[2]) == ARGV[1] then
    redis.call('DEL', KEYS[2])
end
return 1
"#;

/// Session store backed by Redis; session records expire through key TTLs.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
    save_script: Script,
    remove_script: Script,
}

impl RedisSessionStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            save_script: Script::new(SAVE_SESSION_SCRIPT),
            remove_script: Script::new(REMOVE_SESSION_SCRIPT),
        }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    async fn save(
        &self,
        session: &PaymentSession,
        ttl: Duration,
    ) -> Result<Option<Uuid>, StoreError> {
        let payload = serde_json::to_string(session)?;
        let secs = ttl_secs(ttl);
        let mut conn = self.conn.clone();

        let previous: Option<String> = self
            .save_script
            .key(session_key(session.session_id))
            .key(buyer_index_key(&session.user_id))
            .arg(payload)
            .arg(session.session_id.to_string())
            .arg(secs)
            .arg(SESSION_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;

        debug!(ttl_secs = secs, "Payment session stored");
        Ok(previous.and_then(|raw| match Uuid::parse_str(&raw) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(value = %raw, "Replaced malformed buyer session index");
                None
            }
        }))
    }

    async fn load(&self, session_id: Uuid) -> Result<Option<PaymentSession>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(session_key(session_id))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn pending_for_buyer(
        &self,
        buyer_id: &str,
    ) -> Result<Option<PaymentSession>, StoreError> {
        let mut conn = self.conn.clone();
        let indexed: Option<String> = redis::cmd("GET")
            .arg(buyer_index_key(buyer_id))
            .query_async(&mut conn)
            .await?;

        let Some(indexed) = indexed else {
            return Ok(None);
        };
        let session_id = match Uuid::parse_str(&indexed) {
            Ok(id) => id,
            Err(_) => {
                warn!(buyer_id, value = %indexed, "Ignoring malformed buyer session index");
                return Ok(None);
            }
        };

        self.load(session_id).await
    }

    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    async fn remove(&self, session: &PaymentSession) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.remove_script
            .key(session_key(session.session_id))
            .key(buyer_index_key(&session.user_id))
            .arg(session.session_id.to_string())
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_claim(&self, session_id: Uuid, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(claim_key(session_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn release_claim(&self, session_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(claim_key(session_id))
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_store::test_support::sample_session;

    async fn store() -> RedisSessionStore {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisSessionStore::connect(&url).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn save_load_and_remove_round_trip() {
        let store = store().await;
        let session = sample_session(&format!("buyer-{}", Uuid::new_v4()));

        store.save(&session, Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.load(session.session_id).await.unwrap(), Some(session.clone()));
        assert_eq!(
            store
                .pending_for_buyer(&session.user_id)
                .await
                .unwrap()
                .map(|s| s.session_id),
            Some(session.session_id)
        );

        store.remove(&session).await.unwrap();
        assert!(store.load(session.session_id).await.unwrap().is_none());
        assert!(store.pending_for_buyer(&session.user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn removing_superseded_session_keeps_newer_index() {
        let store = store().await;
        let buyer = format!("buyer-{}", Uuid::new_v4());
        let old = sample_session(&buyer);
        let new = sample_session(&buyer);

        store.save(&old, Duration::from_secs(60)).await.unwrap();
        store.save(&new, Duration::from_secs(60)).await.unwrap();
        store.remove(&old).await.unwrap();

        let pending = store.pending_for_buyer(&buyer).await.unwrap();
        assert_eq!(pending.map(|s| s.session_id), Some(new.session_id));
        store.remove(&new).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn saving_a_new_session_deletes_the_one_it_replaces() {
        let store = store().await;
        let buyer = format!("buyer-{}", Uuid::new_v4());
        let old = sample_session(&buyer);
        let new = sample_session(&buyer);

        assert_eq!(store.save(&old, Duration::from_secs(60)).await.unwrap(), None);
        assert_eq!(
            store.save(&new, Duration::from_secs(60)).await.unwrap(),
            Some(old.session_id)
        );
        assert!(store.load(old.session_id).await.unwrap().is_none());
        assert_eq!(store.save(&new, Duration::from_secs(60)).await.unwrap(), None);
        store.remove(&new).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn claim_is_exclusive_until_released() {
        let store = store().await;
        let id = Uuid::new_v4();
        assert!(store.try_claim(id, Duration::from_secs(30)).await.unwrap());
        assert!(!store.try_claim(id, Duration::from_secs(30)).await.unwrap());
        store.release_claim(id).await.unwrap();
        assert!(store.try_claim(id, Duration::from_secs(30)).await.unwrap());
        store.release_claim(id).await.unwrap();
    }
}
