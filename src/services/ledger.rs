//! Result ledger and notification fallback storage on Redis.
//!
//! Two surfaces share the connection: the FIFO list workers append charge
//! outcomes to, and the key-value space holding notifications the broker
//! rejected. Ledger entries have no TTL; they live until popped.

use crate::error::AppError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;

pub const LEDGER_KEY: &str = "renewal_status_report";
pub const FALLBACK_PREFIX: &str = "notification:fallback:";

#[async_trait]
pub trait ResultLedger: Send + Sync {
    /// Append a serialized outcome to the ledger tail.
    async fn push_outcome(&self, raw: &str) -> Result<(), AppError>;

    /// Pop the oldest outcome, if any.
    async fn pop_outcome(&self) -> Result<Option<String>, AppError>;

    async fn ledger_len(&self) -> Result<u64, AppError>;

    async fn fallback_get(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn fallback_set(&self, key: &str, value: &str) -> Result<(), AppError>;
    async fn fallback_delete(&self, key: &str) -> Result<(), AppError>;

    /// All keys currently holding fallback messages.
    async fn fallback_keys(&self) -> Result<Vec<String>, AppError>;
}

#[derive(Clone)]
pub struct RedisLedger {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisLedger {
    pub async fn new(url: &str, key_prefix: Option<String>) -> Result<Self, AppError> {
        tracing::info!("Connecting to Redis");
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        tracing::info!("Redis connection established");

        Ok(Self::from_manager(manager, key_prefix))
    }

    pub fn from_manager(manager: ConnectionManager, key_prefix: Option<String>) -> Self {
        Self {
            manager,
            key_prefix: key_prefix.unwrap_or_default(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultLedger for RedisLedger {
    async fn push_outcome(&self, raw: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(self.key(LEDGER_KEY))
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_outcome(&self) -> Result<Option<String>, AppError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("LPOP")
            .arg(self.key(LEDGER_KEY))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn ledger_len(&self) -> Result<u64, AppError> {
        let mut conn = self.manager.clone();
        let len: u64 = redis::cmd("LLEN")
            .arg(self.key(LEDGER_KEY))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn fallback_get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn fallback_set(&self, key: &str, value: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn fallback_delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn fallback_keys(&self) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}{}*", self.key_prefix, FALLBACK_PREFIX);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            // Hand logical keys back without the instance prefix.
            keys.extend(
                batch
                    .into_iter()
                    .map(|k| k.trim_start_matches(&self.key_prefix).to_string()),
            );

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }
}
