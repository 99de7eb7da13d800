use thiserror::Error;

use crate::protocol::codes;

/// Failures raised while admitting a socket.
///
/// Both are transport-level refusals: no protocol frame is ever sent for
/// them. Over-capacity and store failures are soft rejections instead; see
/// [`crate::session::OpenOutcome`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown app key `{0}`")]
    UnknownAppKey(String),

    #[error("origin {} is not allowed for app {app_id}", .origin.as_deref().unwrap_or("<absent>"))]
    OriginNotAllowed {
        app_id: String,
        origin: Option<String>,
    },
}

impl GatewayError {
    /// Close code the transport uses when refusing the socket.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::UnknownAppKey(_) => codes::APP_NOT_FOUND,
            Self::OriginNotAllowed { .. } => codes::ORIGIN_NOT_ALLOWED,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Raised by the in-process backend when a slot claim would exceed the
    /// app's capacity. The counter is left untouched.
    #[error("app {app_id} is over capacity ({current}/{capacity})")]
    ConnectionsOverCapacity {
        app_id: String,
        current: i64,
        capacity: u64,
    },

    #[error("replication store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed replication payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("replication feed closed")]
    FeedClosed,
}
