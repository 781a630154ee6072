//! The broker protocol: the only component that touches the remote
//! store. Implementations lay out each queue as a live list, a delayed
//! sorted set, and per-id metadata records (see `redis.rs` for the
//! concrete key layout), and expose the atomic primitives the rest of
//! the crate needs to move a task between states without ever losing
//! or duplicating it.

mod memory;
mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::{RedisBroker, RedisBrokerConfig};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Sizes of a queue's live list and delayed set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub direct: u64,
    pub delayed: u64,
}

impl Counts {
    pub fn total(&self) -> u64 {
        self.direct + self.delayed
    }
}

/// Durable queue storage with the atomic primitives the core needs.
///
/// All operations may fail with a transient I/O error; `initialize`
/// must be called before any other operation and is the only place
/// where connection-level faults are treated as fatal by the engine.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    /// Store `data` under `{queue}:task:{id}`; if `eta` is in the
    /// future, add `id` to `{queue}:delay` scored by `eta`; otherwise
    /// tail-push `id` onto `{queue}`. Atomic across the write and the
    /// list/set insertion.
    async fn publish(
        &self,
        queue: &str,
        id: &str,
        data: &[u8],
        eta: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Block up to `timeout` popping one task id from any of `queues`
    /// (round-robin fair across calls), returning its data. `None` on
    /// timeout with nothing ready.
    async fn consume(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String, Vec<u8>)>>;

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the data record and purge `id` from the live list and
    /// delayed set. Idempotent.
    async fn delete(&self, queue: &str, id: &str) -> Result<()>;

    /// Overwrite the data record with a TTL, for post-terminal inspection.
    async fn set(&self, queue: &str, id: &str, data: &[u8], ttl: Duration) -> Result<()>;

    /// Drop the live list and delayed set. Leaves per-id metadata alone.
    async fn empty(&self, queue: &str) -> Result<()>;

    async fn count(&self, queue: &str) -> Result<Counts>;

    /// Ids currently on the live list.
    async fn list(&self, queue: &str) -> Result<Vec<String>>;

    /// Remove `id` from the live list and delayed set. Metadata is left
    /// so callers can observe a canceled status if one was written.
    async fn cancel(&self, queue: &str, id: &str) -> Result<()>;

    /// Atomically move every id in the delayed set scored <= `now`
    /// onto the tail of the live list. Returns the promoted ids.
    async fn promote_delayed(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<String>>;
}
