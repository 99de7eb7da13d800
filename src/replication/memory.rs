//! In-process stand-in for a shared store, so several adapters in one test
//! can behave like nodes of one fleet.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};

use super::store::{SharedStore, StoreMessage};
use super::ReplicationResult;
use crate::error::ReplicationError;

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    hashes: Mutex<HashMap<String, HashMap<String, i64>>>,
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    bus: broadcast::Sender<StoreMessage>,
    listener_epoch: watch::Sender<u64>,
    failing: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (bus, _) = broadcast::channel(1024);
        let (listener_epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                hashes: Mutex::new(HashMap::new()),
                sets: Mutex::new(HashMap::new()),
                bus,
                listener_epoch,
                failing: AtomicBool::new(false),
            }),
        }
    }
}

impl MemoryStore {
    /// While set, every command fails the way a dropped store connection
    /// would.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Ends every open `listen` stream, like a dropped pub/sub connection.
    pub fn drop_listeners(&self) {
        self.inner.listener_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Raw field read that ignores `set_failing`.
    pub fn field(&self, key: &str, field: &str) -> Option<i64> {
        self.inner
            .hashes
            .lock()
            .expect("hashes lock")
            .get(key)
            .and_then(|fields| fields.get(field).copied())
    }

    fn check(&self) -> ReplicationResult<()> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(ReplicationError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "memory store offline",
            ))));
        }
        Ok(())
    }
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn hash_get(&self, key: &str, field: &str) -> ReplicationResult<i64> {
        self.check()?;
        Ok(self.field(key, field).unwrap_or(0))
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> ReplicationResult<i64> {
        self.check()?;
        let mut hashes = self.inner.hashes.lock().expect("hashes lock");
        let value = hashes
            .entry(key.to_owned())
            .or_default()
            .entry(field.to_owned())
            .or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn hash_max(&self, key: &str, field: &str, value: i64) -> ReplicationResult<i64> {
        self.check()?;
        let mut hashes = self.inner.hashes.lock().expect("hashes lock");
        let stored = hashes
            .entry(key.to_owned())
            .or_default()
            .entry(field.to_owned())
            .or_insert(0);
        *stored = (*stored).max(value);
        Ok(*stored)
    }

    async fn release_member(
        &self,
        key: &str,
        field: &str,
        set_key: &str,
        member: &str,
    ) -> ReplicationResult<i64> {
        self.check()?;
        let mut hashes = self.inner.hashes.lock().expect("hashes lock");
        let mut sets = self.inner.sets.lock().expect("sets lock");
        let value = hashes
            .entry(key.to_owned())
            .or_default()
            .entry(field.to_owned())
            .or_insert(0);
        *value = (*value - 1).max(0);
        if *value == 0 {
            if let Some(members) = sets.get_mut(set_key) {
                members.remove(member);
            }
        }
        Ok(*value)
    }

    async fn set_add(&self, key: &str, member: &str) -> ReplicationResult<()> {
        self.check()?;
        self.inner
            .sets
            .lock()
            .expect("sets lock")
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> ReplicationResult<Vec<String>> {
        self.check()?;
        Ok(self
            .inner
            .sets
            .lock()
            .expect("sets lock")
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: String) -> ReplicationResult<()> {
        self.check()?;
        let _ = self.inner.bus.send(StoreMessage {
            channel: channel.to_owned(),
            payload,
        });
        Ok(())
    }

    async fn listen(
        &self,
        pattern: &str,
    ) -> ReplicationResult<mpsc::UnboundedReceiver<StoreMessage>> {
        self.check()?;
        let mut bus = self.inner.bus.subscribe();
        let mut epoch = self.inner.listener_epoch.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = pattern.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = epoch.changed() => break,
                    received = bus.recv() => match received {
                        Ok(message) => {
                            if pattern_matches(&pattern, &message.channel)
                                && tx.send(message).is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(rx)
    }
}
