use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::{SharedStore, StoreMessage};
use super::{
    active_apps_key, channel_pattern, Broadcast, Counter, Delivery, DeliveryFeed,
    ReplicationAdapter, ReplicationResult, SlotClaim, Topic,
};
use crate::error::ReplicationError;

const RELISTEN_BACKOFF_MIN: Duration = Duration::from_millis(50);
const RELISTEN_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// What travels on the store bus for every channel publish.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    except: Option<String>,
    payload: String,
}

/// Fleet backend. Counters and the active-apps set live in the shared store;
/// publishes go through its bus.
///
/// The node listens once on every channel topic of its namespace and keeps
/// only those it has joined, so `join`/`leave` never touch the network. A
/// dropped subscription is re-established in the background. Its own
/// publishes are delivered locally when made and the bus echo is dropped.
pub struct DistributedAdapter<S: SharedStore> {
    node_id: String,
    namespace: String,
    store: Arc<S>,
    joined: Arc<Mutex<HashSet<Topic>>>,
    feed: mpsc::UnboundedSender<Delivery>,
    listener: JoinHandle<()>,
}

impl<S: SharedStore> DistributedAdapter<S> {
    pub async fn start(
        store: Arc<S>,
        node_id: impl Into<String>,
        namespace: impl Into<String>,
    ) -> ReplicationResult<(Self, DeliveryFeed)> {
        let node_id = node_id.into();
        let namespace = namespace.into();
        let messages = store.listen(&channel_pattern(&namespace)).await?;
        let joined = Arc::new(Mutex::new(HashSet::new()));
        let (feed, deliveries) = mpsc::unbounded_channel();
        let relay = Relay {
            store: store.clone(),
            node_id: node_id.clone(),
            namespace: namespace.clone(),
            joined: joined.clone(),
            feed: feed.clone(),
        };
        let listener = tokio::spawn(relay.run(messages));
        Ok((
            Self {
                node_id,
                namespace,
                store,
                joined,
                feed,
                listener,
            },
            deliveries,
        ))
    }

    fn app_key(&self, app_id: &str) -> String {
        Topic::app(app_id).key(&self.namespace)
    }

    async fn finish_claim(&self, app_id: &str, key: &str, connections: i64) -> ReplicationResult<()> {
        self.store
            .hash_max(key, Counter::PeakConnectionCount.field(), connections)
            .await?;
        self.store
            .set_add(&active_apps_key(&self.namespace), app_id)
            .await
    }

    /// Atomic on the store: clamped decrement, and the app leaves the
    /// active set in the same step that takes it to zero.
    async fn return_slot(&self, app_id: &str, key: &str) -> ReplicationResult<i64> {
        self.store
            .release_member(
                key,
                Counter::Connections.field(),
                &active_apps_key(&self.namespace),
                app_id,
            )
            .await
    }

    async fn rollback_claim(&self, app_id: &str, key: &str) {
        if let Err(err) = self.return_slot(app_id, key).await {
            warn!("could not roll back connection claim for app {app_id}: {err}");
        }
    }
}

impl<S: SharedStore> Drop for DistributedAdapter<S> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct Relay<S: SharedStore> {
    store: Arc<S>,
    node_id: String,
    namespace: String,
    joined: Arc<Mutex<HashSet<Topic>>>,
    feed: mpsc::UnboundedSender<Delivery>,
}

impl<S: SharedStore> Relay<S> {
    /// Forwards remote publishes on joined topics to the feed. Listens
    /// again with backoff whenever the store drops the subscription; stops
    /// once the feed has no receiver.
    async fn run(self, mut messages: mpsc::UnboundedReceiver<StoreMessage>) {
        loop {
            if !self.forward(&mut messages).await {
                break;
            }
            warn!(
                "replication bus for node {} lost, remote publishes paused",
                self.node_id
            );
            let Some(restored) = self.listen_again().await else {
                break;
            };
            info!("replication bus for node {} restored", self.node_id);
            messages = restored;
        }
        debug!("bus relay for node {} stopped", self.node_id);
    }

    /// Returns false once the feed is closed, true when the bus ended.
    async fn forward(&self, messages: &mut mpsc::UnboundedReceiver<StoreMessage>) -> bool {
        while let Some(message) = messages.recv().await {
            let Some(topic) = Topic::parse(&self.namespace, &message.channel) else {
                debug!("ignoring bus message on {}", message.channel);
                continue;
            };
            let envelope: Envelope = match serde_json::from_str(&message.payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!("dropping malformed publish on {}: {err}", message.channel);
                    continue;
                }
            };
            if envelope.node == self.node_id || !self.joined.lock().await.contains(&topic) {
                continue;
            }
            let delivery = Delivery {
                topic,
                broadcast: Broadcast {
                    payload: envelope.payload,
                    except: envelope.except,
                },
            };
            if self.feed.send(delivery).is_err() {
                return false;
            }
        }
        !self.feed.is_closed()
    }

    async fn listen_again(&self) -> Option<mpsc::UnboundedReceiver<StoreMessage>> {
        let pattern = channel_pattern(&self.namespace);
        let mut backoff = RELISTEN_BACKOFF_MIN;
        loop {
            tokio::time::sleep(backoff).await;
            if self.feed.is_closed() {
                return None;
            }
            match self.store.listen(&pattern).await {
                Ok(messages) => return Some(messages),
                Err(err) => {
                    warn!("could not listen on {pattern} again: {err}");
                    backoff = (backoff * 2).min(RELISTEN_BACKOFF_MAX);
                }
            }
        }
    }
}

#[async_trait]
impl<S: SharedStore> ReplicationAdapter for DistributedAdapter<S> {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn counter_get(&self, topic: &Topic, counter: Counter) -> ReplicationResult<i64> {
        self.store
            .hash_get(&topic.key(&self.namespace), counter.field())
            .await
    }

    async fn counter_add(
        &self,
        topic: &Topic,
        counter: Counter,
        delta: i64,
    ) -> ReplicationResult<i64> {
        self.store
            .hash_incr(&topic.key(&self.namespace), counter.field(), delta)
            .await
    }

    async fn claim_slot(&self, app_id: &str, capacity: Option<u64>) -> ReplicationResult<SlotClaim> {
        let key = self.app_key(app_id);
        let connections = self
            .store
            .hash_incr(&key, Counter::Connections.field(), 1)
            .await?;
        if let Some(capacity) = capacity {
            if connections > i64::try_from(capacity).unwrap_or(i64::MAX) {
                self.rollback_claim(app_id, &key).await;
                return Ok(SlotClaim::Lost {
                    observed: connections,
                });
            }
        }
        if let Err(err) = self.finish_claim(app_id, &key, connections).await {
            self.rollback_claim(app_id, &key).await;
            return Err(err);
        }
        Ok(SlotClaim::Granted { connections })
    }

    async fn release_slot(&self, app_id: &str) -> ReplicationResult<i64> {
        let key = self.app_key(app_id);
        self.return_slot(app_id, &key).await
    }

    async fn active_apps(&self) -> ReplicationResult<Vec<String>> {
        let mut apps = self
            .store
            .set_members(&active_apps_key(&self.namespace))
            .await?;
        apps.sort();
        Ok(apps)
    }

    async fn join(&self, topic: &Topic) -> ReplicationResult<()> {
        self.joined.lock().await.insert(topic.clone());
        Ok(())
    }

    async fn leave(&self, topic: &Topic) -> ReplicationResult<()> {
        self.joined.lock().await.remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &Topic, broadcast: Broadcast) -> ReplicationResult<()> {
        let envelope = serde_json::to_string(&Envelope {
            node: self.node_id.clone(),
            except: broadcast.except.clone(),
            payload: broadcast.payload.clone(),
        })?;
        if self.joined.lock().await.contains(topic) {
            self.feed
                .send(Delivery {
                    topic: topic.clone(),
                    broadcast,
                })
                .map_err(|_| ReplicationError::FeedClosed)?;
        }
        self.store
            .publish(&topic.key(&self.namespace), envelope)
            .await
    }
}
