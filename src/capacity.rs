use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ReplicationError;
use crate::replication::{Counter, ReplicationAdapter, ReplicationResult, SlotClaim, Topic};

/// Result of an admission check, the same for every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { connections: i64 },
    OverCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub app_id: String,
    pub connections: i64,
    pub peak_connection_count: i64,
    pub websocket_message_count: i64,
}

/// Per-app connection limits and usage metrics over the replication
/// counters. One instance per process.
pub struct CapacityController {
    replication: Arc<dyn ReplicationAdapter>,
}

impl CapacityController {
    pub fn new(replication: Arc<dyn ReplicationAdapter>) -> Self {
        Self { replication }
    }

    /// Takes one slot for `app_id`. A store failure is returned as an error;
    /// no counter change survives it.
    pub async fn try_admit(
        &self,
        app_id: &str,
        capacity: Option<u64>,
    ) -> Result<Admission, ReplicationError> {
        match self.replication.claim_slot(app_id, capacity).await {
            Ok(SlotClaim::Granted { connections }) => Ok(Admission::Admitted { connections }),
            Ok(SlotClaim::Lost { observed }) => {
                debug!("app {app_id} lost an admission race at {observed} connections");
                Ok(Admission::OverCapacity)
            }
            Err(ReplicationError::ConnectionsOverCapacity {
                current, capacity, ..
            }) => {
                debug!("app {app_id} is full ({current}/{capacity})");
                Ok(Admission::OverCapacity)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn release(&self, app_id: &str) {
        if let Err(err) = self.replication.release_slot(app_id).await {
            warn!("failed to release connection slot for app {app_id}: {err}");
        }
    }

    /// Counts one client-originated message.
    pub async fn record_message(&self, app_id: &str) {
        if let Err(err) = self
            .replication
            .counter_add(&Topic::app(app_id), Counter::WebsocketMessageCount, 1)
            .await
        {
            warn!("failed to record message for app {app_id}: {err}");
        }
    }

    pub async fn usage(&self, app_id: &str) -> ReplicationResult<UsageSnapshot> {
        let topic = Topic::app(app_id);
        Ok(UsageSnapshot {
            app_id: app_id.to_owned(),
            connections: self
                .replication
                .counter_get(&topic, Counter::Connections)
                .await?,
            peak_connection_count: self
                .replication
                .counter_get(&topic, Counter::PeakConnectionCount)
                .await?,
            websocket_message_count: self
                .replication
                .counter_get(&topic, Counter::WebsocketMessageCount)
                .await?,
        })
    }

    pub async fn active_apps(&self) -> ReplicationResult<Vec<String>> {
        self.replication.active_apps().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::distributed::DistributedAdapter;
    use crate::replication::local::LocalAdapter;
    use crate::replication::memory::MemoryStore;

    fn local_controller() -> CapacityController {
        let (adapter, _feed) = LocalAdapter::new("node-a", "ns");
        CapacityController::new(Arc::new(adapter))
    }

    #[tokio::test]
    async fn peak_is_monotone_and_survives_release() {
        let controller = local_controller();
        let mut last_peak = 0;
        for step in [true, true, false, true, true, false, false, false, true] {
            if step {
                let admitted = controller.try_admit("a", None).await.expect("admit");
                assert!(matches!(admitted, Admission::Admitted { .. }));
            } else {
                controller.release("a").await;
            }
            let usage = controller.usage("a").await.expect("usage");
            assert!(usage.peak_connection_count >= last_peak);
            assert!(usage.peak_connection_count >= usage.connections);
            assert!(usage.connections >= 0);
            last_peak = usage.peak_connection_count;
        }
        let usage = controller.usage("a").await.expect("usage");
        assert_eq!((usage.connections, usage.peak_connection_count), (1, 3));
    }

    #[tokio::test]
    async fn capacity_rejects_and_frees_slots() {
        let controller = local_controller();
        for _ in 0..2 {
            assert!(matches!(
                controller.try_admit("a", Some(2)).await.expect("admit"),
                Admission::Admitted { .. }
            ));
        }
        assert_eq!(
            controller.try_admit("a", Some(2)).await.expect("admit"),
            Admission::OverCapacity
        );
        controller.release("a").await;
        assert_eq!(
            controller.try_admit("a", Some(2)).await.expect("admit"),
            Admission::Admitted { connections: 2 }
        );
        assert_eq!(controller.usage("a").await.expect("usage").connections, 2);
    }

    #[tokio::test]
    async fn record_message_counts_per_app() {
        let controller = local_controller();
        controller.record_message("a").await;
        controller.record_message("a").await;
        controller.record_message("b").await;
        assert_eq!(
            controller.usage("a").await.expect("usage").websocket_message_count,
            2
        );
        assert_eq!(
            controller.usage("b").await.expect("usage").websocket_message_count,
            1
        );
    }

    #[tokio::test]
    async fn distributed_race_losers_are_soft_rejected() {
        let store = MemoryStore::default();
        let (adapter, _feed) = DistributedAdapter::start(Arc::new(store.clone()), "a", "ns")
            .await
            .expect("start");
        let controller = CapacityController::new(Arc::new(adapter));
        controller.try_admit("1234", Some(1)).await.expect("admit");
        assert_eq!(
            controller.try_admit("1234", Some(1)).await.expect("admit"),
            Admission::OverCapacity
        );
        assert_eq!(controller.usage("1234").await.expect("usage").connections, 1);

        store.set_failing(true);
        assert!(controller.try_admit("1234", Some(5)).await.is_err());
        controller.release("1234").await;
        store.set_failing(false);
        assert_eq!(controller.usage("1234").await.expect("usage").connections, 1);
    }
}
