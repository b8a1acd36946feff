//! Membership lists: the fast-path registry of monitored addresses.
//!
//! Lists are chain-scoped (`monitored:evm`, `monitored:sol`). The production
//! backend keeps each list as a Redis set; batch lookups use `SMISMEMBER` so a
//! whole block is answered in one round trip.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::{debug, error, info};

use crate::error::{AppError, AppResult};
use crate::types::ChainType;

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Parallel membership flags for `keys`, answered in a single call.
    async fn contains_batch(&self, list: &str, keys: &[String]) -> AppResult<Vec<bool>>;

    /// Returns `false` when the key was already present, so callers can tell
    /// an entry they created from one another writer owns.
    async fn add(&self, list: &str, key: &str) -> AppResult<bool>;

    async fn remove(&self, list: &str, key: &str) -> AppResult<()>;
}

#[derive(Clone)]
pub struct RedisMembershipStore {
    conn_manager: ConnectionManager,
    redis_url: String,
}

impl fmt::Debug for RedisMembershipStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisMembershipStore")
            .field("redis_url", &self.redis_url)
            .finish_non_exhaustive()
    }
}

impl RedisMembershipStore {
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        info!("Connecting to membership store at {}", redis_url);
        let client = redis::Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to create Redis ConnectionManager: {}", e);
            AppError::from(e)
        })?;
        Ok(Self {
            conn_manager,
            redis_url: redis_url.to_string(),
        })
    }
}

#[async_trait]
impl MembershipStore for RedisMembershipStore {
    async fn contains_batch(&self, list: &str, keys: &[String]) -> AppResult<Vec<bool>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn_manager.clone();
        let flags: Vec<bool> = redis::cmd("SMISMEMBER")
            .arg(list)
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        debug!("SMISMEMBER {} checked {} keys", list, keys.len());
        Ok(flags)
    }

    async fn add(&self, list: &str, key: &str) -> AppResult<bool> {
        let mut conn = self.conn_manager.clone();
        let inserted: usize = conn.sadd(list, key).await?;
        Ok(inserted > 0)
    }

    async fn remove(&self, list: &str, key: &str) -> AppResult<()> {
        let mut conn = self.conn_manager.clone();
        conn.srem::<_, _, ()>(list, key).await?;
        Ok(())
    }
}

/// Answers "is this address monitored" for the webhook path.
#[derive(Clone)]
pub struct MembershipOracle {
    store: Arc<dyn MembershipStore>,
}

impl MembershipOracle {
    pub fn new(store: Arc<dyn MembershipStore>) -> Self {
        Self { store }
    }

    /// One store call per invocation; any failure aborts the caller's delivery.
    pub async fn contains(&self, chain: ChainType, addresses: &[String]) -> AppResult<Vec<bool>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        let flags = self
            .store
            .contains_batch(chain.list_key(), addresses)
            .await
            .map_err(|e| match e {
                AppError::UpstreamUnavailable(_) => e,
                other => AppError::UpstreamUnavailable(other.to_string()),
            })?;

        if flags.len() != addresses.len() {
            return Err(AppError::UpstreamUnavailable(format!(
                "Membership store answered {} flags for {} keys",
                flags.len(),
                addresses.len()
            )));
        }
        Ok(flags)
    }
}
