use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ReplicationResult;

/// A message received on the store's pub/sub bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Primitives the distributed backend needs from a shared store.
///
/// Every mutation must be atomic per key on the store side. Missing hash
/// fields read as zero.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn hash_get(&self, key: &str, field: &str) -> ReplicationResult<i64>;

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> ReplicationResult<i64>;

    /// Raises the field to `value` if it is lower; returns the stored value.
    async fn hash_max(&self, key: &str, field: &str, value: i64) -> ReplicationResult<i64>;

    /// Decrements the field, clamping it at zero, and removes `member` from
    /// the set at `set_key` once the field reaches zero. Runs as one atomic
    /// step on the store; returns the remaining value.
    async fn release_member(
        &self,
        key: &str,
        field: &str,
        set_key: &str,
        member: &str,
    ) -> ReplicationResult<i64>;

    async fn set_add(&self, key: &str, member: &str) -> ReplicationResult<()>;

    async fn set_members(&self, key: &str) -> ReplicationResult<Vec<String>>;

    async fn publish(&self, channel: &str, payload: String) -> ReplicationResult<()>;

    /// Streams every message published on a channel matching the glob
    /// `pattern`, including this process's own publishes. The stream ends
    /// when the underlying subscription is lost; callers listen again.
    async fn listen(&self, pattern: &str)
        -> ReplicationResult<mpsc::UnboundedReceiver<StoreMessage>>;
}
