use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;

use crate::{
    config::Config,
    models::retry::RetryConfig,
    services::redelivery::RedeliveryTracker,
    utils::retry_with_backoff,
};

/// Redelivery counts kept in Redis, shared by every consumer group member
/// regardless of which process it runs in.
pub struct RedisRedeliveryTracker {
    connection: MultiplexedConnection,
    ttl_seconds: u64,
    retry_config: RetryConfig,
}

impl RedisRedeliveryTracker {
    pub async fn connect(redis_url: &str, config: &Config) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client = Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            ttl_seconds: config.redelivery_ttl_seconds,
            retry_config: config.retry_config(),
        })
    }
}

fn redelivery_key(event_id: &str) -> String {
    format!("redelivery:{}", event_id)
}

#[async_trait]
impl RedeliveryTracker for RedisRedeliveryTracker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn record_failure(&self, event_id: &str) -> Result<u32, Error> {
        let key = redelivery_key(event_id);
        let mut connection = self.connection.clone();

        let (count,): (u32,) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, self.ttl_seconds as i64)
            .ignore()
            .query_async(&mut connection)
            .await
            .map_err(|e| anyhow!("Failed to record redelivery for {}: {}", event_id, e))?;

        Ok(count)
    }

    async fn clear(&self, event_id: &str) -> Result<(), Error> {
        let key = redelivery_key(event_id);

        retry_with_backoff(&self.retry_config, || {
            let key = key.clone();
            let mut connection = self.connection.clone();

            async move {
                connection
                    .del::<_, ()>(&key)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| anyhow!("Failed to clear redelivery count for {}: {}", event_id, e))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error> {
        let mut connection = self.connection.clone();

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| anyhow!("Redis ping failed: {}", e))?;

        Ok(())
    }
}
