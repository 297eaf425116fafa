//! State store adapter: per-service hashes, the shared `tk` scalar, and the
//! per-service rate channels, all backed by redis.
//!
//! The adapter is the only module that talks to the store. The controller
//! holds the authoritative in-memory copy during its lifetime, so every write
//! here is write-through and most are best-effort.

mod subscription;

pub use subscription::subscribe;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use snafu::{ResultExt, Snafu};

pub const SERVICE_KEY_PREFIX: &str = "service:";
pub const TK_KEY: &str = "tk";

pub fn rate_channel(service: &str) -> String {
    format!("admission_rate:{}", service)
}

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("Failed to connect to state store: {}", source))]
    Connect { source: redis::RedisError },
    #[snafu(display("State store command failed: {}", source))]
    Command { source: redis::RedisError },
}

/// The persisted fields of hash `service:<name>`.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceFields {
    pub raw_admission_rate: f64,
    pub curr_weight: f64,
    pub emptyq_weight: f64,
    pub beta: f64,
    pub alpha: u32,
}

/// Write access to the persisted control-plane state. The controller is
/// generic over this so tests can record writes instead of needing a store.
#[async_trait]
pub trait StateWriter: Send + Sync {
    async fn write_service(&self, name: &str, fields: &ServiceFields) -> Result<(), StoreError>;
    async fn set_tk(&self, tk: i64) -> Result<(), StoreError>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;
}

pub struct StateStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl StateStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).context(ConnectSnafu)?;
        let manager = client
            .get_tokio_connection_manager()
            .await
            .context(ConnectSnafu)?;
        Ok(Self { client, manager })
    }

    /// A client handle for pub/sub use. Subscriptions need a dedicated
    /// connection, so they build their own from this.
    pub fn subscriber_client(&self) -> redis::Client {
        self.client.clone()
    }

    pub async fn get_tk(&self) -> Result<Option<i64>, StoreError> {
        let mut conn = self.manager.clone();
        let tk: Option<i64> = conn.get(TK_KEY).await.context(CommandSnafu)?;
        Ok(tk)
    }
}

#[async_trait]
impl StateWriter for StateStore {
    async fn write_service(&self, name: &str, fields: &ServiceFields) -> Result<(), StoreError> {
        let key = format!("{}{}", SERVICE_KEY_PREFIX, name);
        let items = [
            ("raw_admission_rate", fields.raw_admission_rate.to_string()),
            ("curr_weight", fields.curr_weight.to_string()),
            ("emptyq_weight", fields.emptyq_weight.to_string()),
            ("beta", fields.beta.to_string()),
            ("alpha", fields.alpha.to_string()),
        ];

        let mut conn = self.manager.clone();
        conn.hset_multiple(key, &items).await.context(CommandSnafu)
    }

    async fn set_tk(&self, tk: i64) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        conn.set(TK_KEY, tk).await.context(CommandSnafu)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        conn.publish(channel, payload).await.context(CommandSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_channel_layout() {
        assert_eq!(rate_channel("service1"), "admission_rate:service1");
    }
}
