//! Pusher wire frames.
//!
//! Inbound frames are `{event, data, channel?}` where `data` may arrive either
//! as an object or as a JSON-encoded string. Outbound frames follow the
//! Pusher convention: `connection_established` and `subscription_succeeded`
//! carry string-encoded data, `pusher:error` carries an object.

use std::fmt;

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const EVENT_PING: &str = "pusher:ping";
pub const EVENT_PONG: &str = "pusher:pong";
pub const EVENT_SUBSCRIBE: &str = "pusher:subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const EVENT_ERROR: &str = "pusher:error";
pub const EVENT_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const EVENT_SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const CLIENT_EVENT_PREFIX: &str = "client-";

pub const MAX_CHANNEL_NAME_LEN: usize = 164;

/// Error and close codes used on the wire.
pub mod codes {
    pub const APP_NOT_FOUND: u16 = 4001;
    pub const ORIGIN_NOT_ALLOWED: u16 = 4009;
    pub const OVER_CAPACITY: u16 = 4100;
    pub const CAPACITY_UNCONFIRMED: u16 = 4200;
    /// Generic "reconnect now", sent to open sockets on shutdown.
    pub const RECONNECT_IMMEDIATELY: u16 = 4200;
    pub const PONG_NOT_RECEIVED: u16 = 4201;
    pub const CLIENT_EVENT_REJECTED: u16 = 4301;
}

/// Something the session wants written to its socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl PusherFrame {
    /// `data` as structured JSON, decoding the string form when needed.
    pub fn data_value(&self) -> Value {
        match &self.data {
            Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| self.data.clone()),
            other => other.clone(),
        }
    }

    pub fn is_client_event(&self) -> bool {
        self.event.starts_with(CLIENT_EVENT_PREFIX)
    }
}

pub fn parse_frame_text(text: &str) -> Result<PusherFrame> {
    let frame: PusherFrame = serde_json::from_str(text).context("invalid pusher frame")?;
    if frame.event.trim().is_empty() {
        anyhow::bail!("pusher frame is missing an event name");
    }
    Ok(frame)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscribeData {
    pub channel: String,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub channel_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnsubscribeData {
    pub channel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    pub fn of(channel: &str) -> Self {
        if channel.starts_with("presence-") {
            Self::Presence
        } else if channel.starts_with("private-") {
            Self::Private
        } else {
            Self::Public
        }
    }

    pub fn requires_auth(self) -> bool {
        !matches!(self, Self::Public)
    }
}

pub fn is_valid_channel_name(channel: &str) -> bool {
    !channel.is_empty()
        && channel.len() <= MAX_CHANNEL_NAME_LEN
        && channel
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "_-=@,.;".contains(ch))
}

/// Pusher socket ids look like `"123456.7890123"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(String);

impl SocketId {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let left: u32 = rng.gen_range(1..u32::MAX);
        let right: u32 = rng.gen_range(1..u32::MAX);
        Self(format!("{left}.{right}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SocketId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Extracts the app key from `/app/{key}` (query string and trailing slash
/// tolerated).
pub fn app_key_from_path(path: &str) -> Option<String> {
    let path = path.split('?').next().unwrap_or(path);
    let segments = path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    match segments.as_slice() {
        ["app", key] => Some((*key).to_owned()),
        _ => None,
    }
}

pub fn connection_established_frame(socket_id: &SocketId, activity_timeout_secs: u64) -> String {
    let data = json!({
        "socket_id": socket_id.as_str(),
        "activity_timeout": activity_timeout_secs,
    });
    json!({
        "event": EVENT_CONNECTION_ESTABLISHED,
        "data": data.to_string(),
    })
    .to_string()
}

pub fn pong_frame() -> String {
    json!({ "event": EVENT_PONG, "data": "{}" }).to_string()
}

pub fn ping_frame() -> String {
    json!({ "event": EVENT_PING, "data": "{}" }).to_string()
}

pub fn error_frame(message: &str, code: Option<u16>) -> String {
    json!({
        "event": EVENT_ERROR,
        "data": {
            "message": message,
            "code": code,
        }
    })
    .to_string()
}

pub fn subscription_succeeded_frame(channel: &str) -> String {
    json!({
        "event": EVENT_SUBSCRIPTION_SUCCEEDED,
        "channel": channel,
        "data": "{}",
    })
    .to_string()
}

pub fn subscription_error_frame(channel: &str, error: &str, status: u16) -> String {
    json!({
        "event": EVENT_SUBSCRIPTION_ERROR,
        "channel": channel,
        "data": {
            "type": "AuthError",
            "error": error,
            "status": status,
        }
    })
    .to_string()
}

/// Re-encodes a client event for fan-out: `{event, channel, data}` only.
pub fn client_event_frame(frame: &PusherFrame, channel: &str) -> String {
    json!({
        "event": frame.event,
        "channel": channel,
        "data": frame.data,
    })
    .to_string()
}
