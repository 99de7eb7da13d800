use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{
    Broadcast, Counter, Delivery, DeliveryFeed, ReplicationAdapter, ReplicationResult, SlotClaim,
    Topic,
};
use crate::error::ReplicationError;

#[derive(Default)]
struct LocalState {
    counters: HashMap<(Topic, Counter), i64>,
    active_apps: BTreeSet<String>,
}

impl LocalState {
    fn get(&self, topic: &Topic, counter: Counter) -> i64 {
        self.counters
            .get(&(topic.clone(), counter))
            .copied()
            .unwrap_or(0)
    }

    fn set(&mut self, topic: &Topic, counter: Counter, value: i64) {
        self.counters.insert((topic.clone(), counter), value);
    }
}

/// Single-process backend: counters behind one mutex, publishes handed
/// straight to this process's delivery feed.
pub struct LocalAdapter {
    node_id: String,
    namespace: String,
    state: Mutex<LocalState>,
    joined: Mutex<HashSet<Topic>>,
    feed: mpsc::UnboundedSender<Delivery>,
}

impl LocalAdapter {
    pub fn new(node_id: impl Into<String>, namespace: impl Into<String>) -> (Self, DeliveryFeed) {
        let (feed, deliveries) = mpsc::unbounded_channel();
        (
            Self {
                node_id: node_id.into(),
                namespace: namespace.into(),
                state: Mutex::new(LocalState::default()),
                joined: Mutex::new(HashSet::new()),
                feed,
            },
            deliveries,
        )
    }
}

#[async_trait]
impl ReplicationAdapter for LocalAdapter {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn counter_get(&self, topic: &Topic, counter: Counter) -> ReplicationResult<i64> {
        Ok(self.state.lock().await.get(topic, counter))
    }

    async fn counter_add(
        &self,
        topic: &Topic,
        counter: Counter,
        delta: i64,
    ) -> ReplicationResult<i64> {
        let mut state = self.state.lock().await;
        let next = state.get(topic, counter).saturating_add(delta);
        state.set(topic, counter, next);
        Ok(next)
    }

    async fn claim_slot(&self, app_id: &str, capacity: Option<u64>) -> ReplicationResult<SlotClaim> {
        let topic = Topic::app(app_id);
        let mut state = self.state.lock().await;
        let current = state.get(&topic, Counter::Connections);
        if let Some(capacity) = capacity {
            if current.saturating_add(1) > i64::try_from(capacity).unwrap_or(i64::MAX) {
                return Err(ReplicationError::ConnectionsOverCapacity {
                    app_id: app_id.to_owned(),
                    current,
                    capacity,
                });
            }
        }
        let connections = current + 1;
        state.set(&topic, Counter::Connections, connections);
        let peak = state.get(&topic, Counter::PeakConnectionCount);
        if connections > peak {
            state.set(&topic, Counter::PeakConnectionCount, connections);
        }
        state.active_apps.insert(app_id.to_owned());
        Ok(SlotClaim::Granted { connections })
    }

    async fn release_slot(&self, app_id: &str) -> ReplicationResult<i64> {
        let topic = Topic::app(app_id);
        let mut state = self.state.lock().await;
        let connections = (state.get(&topic, Counter::Connections) - 1).max(0);
        state.set(&topic, Counter::Connections, connections);
        if connections == 0 {
            state.active_apps.remove(app_id);
        }
        Ok(connections)
    }

    async fn active_apps(&self) -> ReplicationResult<Vec<String>> {
        Ok(self.state.lock().await.active_apps.iter().cloned().collect())
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
        if !self.joined.lock().await.contains(topic) {
            debug!("publish on {} has no local subscribers", topic.key(&self.namespace));
            return Ok(());
        }
        self.feed
            .send(Delivery {
                topic: topic.clone(),
                broadcast,
            })
            .map_err(|_| ReplicationError::FeedClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn concurrent_claims_never_exceed_capacity() {
        let (adapter, _feed) = LocalAdapter::new("node-a", "ns");
        let adapter = Arc::new(adapter);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let adapter = adapter.clone();
            handles.push(tokio::spawn(async move {
                adapter.claim_slot("1234", Some(5)).await
            }));
        }
        let mut granted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(SlotClaim::Granted { .. }) => granted += 1,
                Err(ReplicationError::ConnectionsOverCapacity { capacity, .. }) => {
                    assert_eq!(capacity, 5);
                    rejected += 1;
                }
                other => panic!("unexpected claim outcome: {other:?}"),
            }
        }
        assert_eq!((granted, rejected), (5, 11));
        let app = Topic::app("1234");
        assert_eq!(
            adapter.counter_get(&app, Counter::Connections).await.expect("get"),
            5
        );

        assert_eq!(adapter.release_slot("1234").await.expect("release"), 4);
        assert!(matches!(
            adapter.claim_slot("1234", Some(5)).await,
            Ok(SlotClaim::Granted { connections: 5 })
        ));
        assert_eq!(
            adapter
                .counter_get(&app, Counter::PeakConnectionCount)
                .await
                .expect("get"),
            5
        );
    }

    #[tokio::test]
    async fn release_clamps_at_zero_and_tracks_active_apps() {
        let (adapter, _feed) = LocalAdapter::new("node-a", "ns");
        adapter.claim_slot("a", None).await.expect("claim");
        assert_eq!(adapter.active_apps().await.expect("apps"), vec!["a".to_owned()]);
        assert_eq!(adapter.release_slot("a").await.expect("release"), 0);
        assert_eq!(adapter.release_slot("a").await.expect("release"), 0);
        assert!(adapter.active_apps().await.expect("apps").is_empty());
    }

    #[tokio::test]
    async fn publishes_reach_the_feed_only_for_joined_topics() {
        let (adapter, mut feed) = LocalAdapter::new("node-a", "ns");
        let topic = Topic::channel("a", "news");
        let broadcast = Broadcast {
            payload: "{}".to_owned(),
            except: None,
        };
        adapter.publish(&topic, broadcast.clone()).await.expect("publish");
        assert!(feed.try_recv().is_err());

        adapter.join(&topic).await.expect("join");
        adapter.join(&topic).await.expect("join twice");
        adapter.publish(&topic, broadcast.clone()).await.expect("publish");
        let delivery = feed.try_recv().expect("delivery");
        assert_eq!(delivery.topic, topic);
        assert_eq!(delivery.broadcast, broadcast);
        assert!(feed.try_recv().is_err());

        adapter.leave(&topic).await.expect("leave");
        adapter.leave(&topic).await.expect("leave twice");
        adapter.publish(&topic, broadcast).await.expect("publish");
        assert!(feed.try_recv().is_err());
    }
}
