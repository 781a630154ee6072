//! The reference broker driver, targeting a real Redis-compatible
//! store. Storage layout (see spec §6):
//!
//!   - `{queue}`            — list of task ids, tail-pushed on publish.
//!   - `{queue}:delay`      — sorted set of task ids scored by eta (ms).
//!   - `{queue}:task:{id}`  — the serialized task record.
//!
//! `publish` and `promote_delayed` run as server-side Lua scripts so
//! the data write and the list/set insertion are atomic, per the
//! broker contract.

use super::{Broker, Counts};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

const PUBLISH_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
if ARGV[2] ~= '' then
  redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
else
  redis.call('RPUSH', KEYS[2], ARGV[3])
end
return 1
"#;

const PROMOTE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
if #ids > 0 then
  for _, id in ipairs(ids) do
    redis.call('RPUSH', KEYS[2], id)
  end
  redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
return ids
"#;

pub struct RedisBroker {
    manager: ConnectionManager,
    publish_script: Script,
    promote_script: Script,
}

impl RedisBroker {
    pub async fn connect(config: &RedisBrokerConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(Error::broker)?;
        let manager = ConnectionManager::new(client).await.map_err(Error::broker)?;
        Ok(Self {
            manager,
            publish_script: Script::new(PUBLISH_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
        })
    }

    fn task_key(queue: &str, id: &str) -> String {
        format!("{queue}:task:{id}")
    }

    fn delay_key(queue: &str) -> String {
        format!("{queue}:delay")
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn initialize(&self) -> Result<()> {
        self.ping().await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Error::broker)?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        id: &str,
        data: &[u8],
        eta: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = self.manager.clone();
        let eta_ms = match eta {
            Some(eta) if eta > Utc::now() => eta.timestamp_millis().to_string(),
            _ => String::new(),
        };

        self.publish_script
            .key(Self::task_key(queue, id))
            .key(queue)
            .key(Self::delay_key(queue))
            .arg(data)
            .arg(eta_ms)
            .arg(id)
            .invoke_async::<_, ()>(&mut conn)
            .await
            .map_err(Error::broker)?;
        Ok(())
    }

    async fn consume(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String, Vec<u8>)>> {
        if queues.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }

        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("BRPOP");
        for queue in queues {
            cmd.arg(queue);
        }
        cmd.arg(timeout.as_secs_f64());

        let popped: Option<(String, String)> =
            cmd.query_async(&mut conn).await.map_err(Error::broker)?;

        let Some((queue, id)) = popped else {
            return Ok(None);
        };

        let data: Vec<u8> = conn
            .get(Self::task_key(&queue, &id))
            .await
            .map_err(Error::broker)?;
        Ok(Some((queue, id, data)))
    }

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        conn.get(Self::task_key(queue, id))
            .await
            .map_err(Error::broker)
    }

    async fn delete(&self, queue: &str, id: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .del(Self::task_key(queue, id))
            .await
            .map_err(Error::broker)?;
        let _: () = conn.lrem(queue, 0, id).await.map_err(Error::broker)?;
        let _: () = conn
            .zrem(Self::delay_key(queue), id)
            .await
            .map_err(Error::broker)?;
        Ok(())
    }

    async fn set(&self, queue: &str, id: &str, data: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(Self::task_key(queue, id), data, ttl.as_secs().max(1))
            .await
            .map_err(Error::broker)?;
        Ok(())
    }

    async fn empty(&self, queue: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(queue).await.map_err(Error::broker)?;
        let _: () = conn
            .del(Self::delay_key(queue))
            .await
            .map_err(Error::broker)?;
        Ok(())
    }

    async fn count(&self, queue: &str) -> Result<Counts> {
        let mut conn = self.manager.clone();
        let direct: u64 = conn.llen(queue).await.map_err(Error::broker)?;
        let delayed: u64 = conn
            .zcard(Self::delay_key(queue))
            .await
            .map_err(Error::broker)?;
        Ok(Counts { direct, delayed })
    }

    async fn list(&self, queue: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.lrange(queue, 0, -1).await.map_err(Error::broker)
    }

    async fn cancel(&self, queue: &str, id: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.lrem(queue, 0, id).await.map_err(Error::broker)?;
        let _: () = conn
            .zrem(Self::delay_key(queue), id)
            .await
            .map_err(Error::broker)?;
        Ok(())
    }

    async fn promote_delayed(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        self.promote_script
            .key(Self::delay_key(queue))
            .key(queue)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(Error::broker)
    }
}
