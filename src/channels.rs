use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{Outbound, SocketId};
use crate::replication::{
    Broadcast, Delivery, DeliveryFeed, ReplicationAdapter, ReplicationResult, Topic,
};

type Subscribers = HashMap<SocketId, mpsc::Sender<Outbound>>;

/// Local channel membership. The first local subscriber of a channel joins
/// its replication topic and the last one out leaves it.
pub struct ChannelManager {
    replication: Arc<dyn ReplicationAdapter>,
    topics: Mutex<HashMap<Topic, Subscribers>>,
}

impl ChannelManager {
    pub fn new(replication: Arc<dyn ReplicationAdapter>) -> Self {
        Self {
            replication,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false if the socket was already subscribed.
    pub async fn subscribe(
        &self,
        app_id: &str,
        channel: &str,
        socket_id: &SocketId,
        tx: mpsc::Sender<Outbound>,
    ) -> bool {
        let topic = Topic::channel(app_id, channel);
        // Join/leave run under the index lock so a topic's first-in and
        // last-out transitions cannot interleave.
        let mut topics = self.topics.lock().await;
        let first = !topics.contains_key(&topic);
        let subscribers = topics.entry(topic.clone()).or_default();
        if subscribers.contains_key(socket_id) {
            return false;
        }
        subscribers.insert(socket_id.clone(), tx);
        if first {
            if let Err(err) = self.replication.join(&topic).await {
                warn!("failed to join topic for {app_id}/{channel}: {err}");
            }
        }
        true
    }

    /// Returns false if the socket was not subscribed.
    pub async fn unsubscribe(&self, app_id: &str, channel: &str, socket_id: &SocketId) -> bool {
        let topic = Topic::channel(app_id, channel);
        let mut topics = self.topics.lock().await;
        let Some(subscribers) = topics.get_mut(&topic) else {
            return false;
        };
        if subscribers.remove(socket_id).is_none() {
            return false;
        }
        if subscribers.is_empty() {
            topics.remove(&topic);
            if let Err(err) = self.replication.leave(&topic).await {
                warn!("failed to leave topic for {app_id}/{channel}: {err}");
            }
        }
        true
    }

    pub async fn publish(
        &self,
        app_id: &str,
        channel: &str,
        broadcast: Broadcast,
    ) -> ReplicationResult<()> {
        self.replication
            .publish(&Topic::channel(app_id, channel), broadcast)
            .await
    }

    /// Hands a publish to every local subscriber of its topic without
    /// waiting on any of them. Returns how many sockets accepted it.
    pub async fn deliver(&self, delivery: Delivery) -> usize {
        let mut topics = self.topics.lock().await;
        let Some(subscribers) = topics.get_mut(&delivery.topic) else {
            return 0;
        };
        let except = delivery.broadcast.except.as_deref();
        let mut delivered = 0;
        let mut stale = Vec::new();
        for (socket_id, tx) in subscribers.iter() {
            if except == Some(socket_id.as_str()) {
                continue;
            }
            match tx.try_send(Outbound::Text(delivery.broadcast.payload.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("dropping delivery to slow socket {socket_id}");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => stale.push(socket_id.clone()),
            }
        }
        for socket_id in stale {
            subscribers.remove(&socket_id);
        }
        if subscribers.is_empty() {
            topics.remove(&delivery.topic);
            if let Err(err) = self.replication.leave(&delivery.topic).await {
                warn!(
                    "failed to leave abandoned topic {}/{}: {err}",
                    delivery.topic.app_id(),
                    delivery.topic.channel_name().unwrap_or_default()
                );
            }
        }
        delivered
    }

    /// Drains the replication feed into [`ChannelManager::deliver`] until the
    /// feed closes.
    pub fn spawn_delivery_pump(self: Arc<Self>, mut feed: DeliveryFeed) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(delivery) = feed.recv().await {
                self.deliver(delivery).await;
            }
            debug!("delivery feed closed");
        })
    }

    #[cfg(test)]
    async fn subscriber_count(&self, app_id: &str, channel: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(&Topic::channel(app_id, channel))
            .map(HashMap::len)
            .unwrap_or(0)
    }
}
