//! Cross-process replication of counters and channel fan-out.
//!
//! Two backends share [`ReplicationAdapter`]: [`local::LocalAdapter`] keeps
//! everything in this process, [`distributed::DistributedAdapter`] shares it
//! through a [`store::SharedStore`]. The backend is chosen once at startup.

pub mod distributed;
pub mod local;
#[cfg(test)]
pub mod memory;
pub mod redis_store;
pub mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ReplicationError;

pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Publishes reaching this node, in arrival order.
pub type DeliveryFeed = mpsc::UnboundedReceiver<Delivery>;

const APP_SEGMENT: &str = "app";
const CHANNEL_SEGMENT: &str = "channel";
const ACTIVE_APPS_SEGMENT: &str = "active_apps";

/// Replication-layer address of an app (counters) or an app channel
/// (fan-out).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    app_id: String,
    channel: Option<String>,
}

impl Topic {
    pub fn app(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            channel: None,
        }
    }

    pub fn channel(app_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            channel: Some(channel.into()),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn channel_name(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Store key for this topic.
    ///
    /// `{ns}:app:{len}:{app_id}` or `{ns}:channel:{len}:{app_id}:{channel}`.
    /// The length prefix keeps the mapping injective even when ids contain
    /// `:`.
    pub fn key(&self, namespace: &str) -> String {
        match &self.channel {
            None => format!(
                "{namespace}:{APP_SEGMENT}:{}:{}",
                self.app_id.len(),
                self.app_id
            ),
            Some(channel) => format!(
                "{namespace}:{CHANNEL_SEGMENT}:{}:{}:{channel}",
                self.app_id.len(),
                self.app_id
            ),
        }
    }

    pub fn parse(namespace: &str, key: &str) -> Option<Self> {
        let rest = key.strip_prefix(namespace)?.strip_prefix(':')?;
        let (segment, rest) = rest.split_once(':')?;
        let (len, rest) = rest.split_once(':')?;
        if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let len: usize = len.parse().ok()?;
        if rest.len() < len || !rest.is_char_boundary(len) {
            return None;
        }
        let (app_id, tail) = rest.split_at(len);
        match segment {
            APP_SEGMENT if tail.is_empty() => Some(Self::app(app_id)),
            CHANNEL_SEGMENT => tail
                .strip_prefix(':')
                .map(|channel| Self::channel(app_id, channel)),
            _ => None,
        }
    }
}

/// Pattern matching every channel topic of a namespace.
pub fn channel_pattern(namespace: &str) -> String {
    format!("{namespace}:{CHANNEL_SEGMENT}:*")
}

/// Fleet-wide set of app ids with at least one open connection.
pub fn active_apps_key(namespace: &str) -> String {
    format!("{namespace}:{ACTIVE_APPS_SEGMENT}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Connections,
    PeakConnectionCount,
    WebsocketMessageCount,
}

impl Counter {
    pub fn field(self) -> &'static str {
        match self {
            Self::Connections => "connections",
            Self::PeakConnectionCount => "peak_connection_count",
            Self::WebsocketMessageCount => "websocket_message_count",
        }
    }
}

/// A frame to fan out on a channel topic. `except` names a socket that must
/// not receive it (the sender of a client event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: Topic,
    pub broadcast: Broadcast,
}

/// Outcome of a connection-slot claim that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClaim {
    Granted { connections: i64 },
    /// Lost an optimistic race: the counter overshot and was rolled back.
    Lost { observed: i64 },
}

#[async_trait]
pub trait ReplicationAdapter: Send + Sync {
    fn node_id(&self) -> &str;

    fn namespace(&self) -> &str;

    async fn counter_get(&self, topic: &Topic, counter: Counter) -> ReplicationResult<i64>;

    async fn counter_add(
        &self,
        topic: &Topic,
        counter: Counter,
        delta: i64,
    ) -> ReplicationResult<i64>;

    /// Takes one connection slot for `app_id`, raising the peak counter on
    /// success. `capacity = None` never rejects.
    async fn claim_slot(&self, app_id: &str, capacity: Option<u64>) -> ReplicationResult<SlotClaim>;

    /// Returns one slot; the connection counter never drops below zero.
    async fn release_slot(&self, app_id: &str) -> ReplicationResult<i64>;

    async fn active_apps(&self) -> ReplicationResult<Vec<String>>;

    /// Starts receiving publishes on `topic`. Idempotent.
    async fn join(&self, topic: &Topic) -> ReplicationResult<()>;

    /// Stops receiving publishes on `topic`. Idempotent.
    async fn leave(&self, topic: &Topic) -> ReplicationResult<()>;

    /// Delivers to every subscriber of `topic` on every node exactly once per
    /// node.
    async fn publish(&self, topic: &Topic, broadcast: Broadcast) -> ReplicationResult<()>;
}
