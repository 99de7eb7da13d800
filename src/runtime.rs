use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{debug, info};

use crate::apps::StaticAppDirectory;
use crate::capacity::CapacityController;
use crate::channels::ChannelManager;
use crate::config::{Config, ReplicationConfig, ReplicationDriver};
use crate::replication::distributed::DistributedAdapter;
use crate::replication::local::LocalAdapter;
use crate::replication::redis_store::RedisStore;
use crate::replication::{DeliveryFeed, ReplicationAdapter};
use crate::server::GatewayServer;
use crate::session::{SessionContext, SessionSettings};

pub struct GatewayRuntime {
    config: Config,
}

impl GatewayRuntime {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let node_id = resolve_node_id(&self.config.replication);
        let apps = Arc::new(StaticAppDirectory::from_config(&self.config.apps));
        info!(
            "starting runtime (node={node_id}, driver={:?}, namespace={}, apps={})",
            self.config.replication.driver,
            self.config.replication.namespace,
            apps.len()
        );

        let (replication, feed) = build_replication(&self.config.replication, &node_id).await?;
        debug!(
            "replication ready (node={}, namespace={})",
            replication.node_id(),
            replication.namespace()
        );
        let channels = Arc::new(ChannelManager::new(replication.clone()));
        let pump = channels.clone().spawn_delivery_pump(feed);
        let ctx = Arc::new(SessionContext {
            apps,
            capacity: Arc::new(CapacityController::new(replication)),
            channels,
            settings: SessionSettings::from_server_config(&self.config.server),
        });

        let server = GatewayServer::new(self.config.server.clone(), ctx, node_id);
        let result = server
            .run_until(async {
                let _ = signal::ctrl_c().await;
                info!("received ctrl-c, shutting down");
            })
            .await;
        pump.abort();
        let _ = pump.await;
        result
    }
}

/// Picks the replication backend once for the life of the process.
pub async fn build_replication(
    cfg: &ReplicationConfig,
    node_id: &str,
) -> Result<(Arc<dyn ReplicationAdapter>, DeliveryFeed)> {
    match cfg.driver {
        ReplicationDriver::Local => {
            let (adapter, feed) = LocalAdapter::new(node_id, cfg.namespace.as_str());
            Ok((Arc::new(adapter), feed))
        }
        ReplicationDriver::Redis => {
            let store = RedisStore::connect(&cfg.redis_url)
                .await
                .with_context(|| format!("failed connecting to redis at {}", cfg.redis_url))?;
            let (adapter, feed) =
                DistributedAdapter::start(Arc::new(store), node_id, cfg.namespace.as_str())
                    .await
                    .context("failed subscribing to the replication bus")?;
            Ok((Arc::new(adapter), feed))
        }
    }
}

pub fn resolve_node_id(cfg: &ReplicationConfig) -> String {
    cfg.node_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("node-{:08x}", rand::random::<u32>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_prefers_configured_value() {
        let mut cfg = ReplicationConfig::default();
        cfg.node_id = Some(" edge-1 ".to_owned());
        assert_eq!(resolve_node_id(&cfg), "edge-1");

        cfg.node_id = Some("  ".to_owned());
        let generated = resolve_node_id(&cfg);
        assert!(generated.starts_with("node-"));
        assert_eq!(generated.len(), "node-".len() + 8);
    }

    #[tokio::test]
    async fn local_driver_builds_an_in_process_backend() {
        let mut cfg = ReplicationConfig::default();
        cfg.namespace = "pgw".to_owned();
        let (replication, _feed) = build_replication(&cfg, "node-a").await.expect("build");
        assert_eq!(replication.node_id(), "node-a");
        assert_eq!(replication.namespace(), "pgw");
    }
}
