//! In-process broker backed by a mutex-guarded map. Used by the
//! crate's own test suite (the scenarios in spec.md §8 run against
//! this rather than a real store) and usable by downstream crates that
//! want to unit-test handlers without standing up Redis.

use super::{Broker, Counts};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

struct Record {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct QueueData {
    live: VecDeque<String>,
    delayed: Vec<(DateTime<Utc>, String)>,
    records: HashMap<String, Record>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueData>,
}

/// In-memory `Broker` implementation. Cloning shares the same state
/// (it is an `Arc` internally), matching the "safe for concurrent use"
/// requirement on broker connections.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune_expired(data: &mut QueueData) {
        let now = Instant::now();
        data.records
            .retain(|_, record| !matches!(record.expires_at, Some(t) if t <= now));
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        id: &str,
        data: &[u8],
        eta: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner.queues.entry(queue.to_string()).or_default();
        entry.records.insert(
            id.to_string(),
            Record {
                data: data.to_vec(),
                expires_at: None,
            },
        );

        match eta {
            Some(eta) if eta > Utc::now() => entry.delayed.push((eta, id.to_string())),
            _ => entry.live.push_back(id.to_string()),
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String, Vec<u8>)>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().await;
                for queue in queues {
                    if let Some(data) = inner.queues.get_mut(queue) {
                        if let Some(id) = data.live.pop_front() {
                            let bytes = data
                                .records
                                .get(&id)
                                .map(|r| r.data.clone())
                                .unwrap_or_default();
                            return Ok(Some((queue.clone(), id, bytes)));
                        }
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        let Some(data) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };
        Self::prune_expired(data);
        Ok(data.records.get(id).map(|r| r.data.clone()))
    }

    async fn delete(&self, queue: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(data) = inner.queues.get_mut(queue) {
            data.records.remove(id);
            data.live.retain(|existing| existing != id);
            data.delayed.retain(|(_, existing)| existing != id);
        }
        Ok(())
    }

    async fn set(&self, queue: &str, id: &str, data: &[u8], ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner.queues.entry(queue.to_string()).or_default();
        entry.records.insert(
            id.to_string(),
            Record {
                data: data.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn empty(&self, queue: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(data) = inner.queues.get_mut(queue) {
            data.live.clear();
            data.delayed.clear();
        }
        Ok(())
    }

    async fn count(&self, queue: &str) -> Result<Counts> {
        let inner = self.inner.lock().await;
        let Some(data) = inner.queues.get(queue) else {
            return Ok(Counts::default());
        };
        Ok(Counts {
            direct: data.live.len() as u64,
            delayed: data.delayed.len() as u64,
        })
    }

    async fn list(&self, queue: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queues
            .get(queue)
            .map(|data| data.live.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn cancel(&self, queue: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(data) = inner.queues.get_mut(queue) {
            data.live.retain(|existing| existing != id);
            data.delayed.retain(|(_, existing)| existing != id);
        }
        Ok(())
    }

    async fn promote_delayed(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let Some(data) = inner.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut ready = Vec::new();
        let mut still_delayed = Vec::new();
        for (eta, id) in data.delayed.drain(..) {
            if eta <= now {
                ready.push(id);
            } else {
                still_delayed.push((eta, id));
            }
        }
        data.delayed = still_delayed;
        for id in &ready {
            data.live.push_back(id.clone());
        }
        drop(inner);
        if !ready.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(ready)
    }
}
