//! Per-socket Pusher protocol state machine.
//!
//! A [`Session`] is owned by the task serving one socket. Frames it wants
//! written go to that socket's outbound queue; the caller drives it with
//! [`Session::open`], [`Session::handle_text`] and [`Session::close`] in
//! receipt order.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::apps::{App, AppDirectory};
use crate::auth::verify_channel_auth;
use crate::capacity::{Admission, CapacityController};
use crate::channels::ChannelManager;
use crate::config::{EmptyOriginList, ServerConfig};
use crate::error::GatewayError;
use crate::origin::origin_allowed;
use crate::protocol::{
    app_key_from_path, client_event_frame, codes, connection_established_frame, error_frame,
    is_valid_channel_name, parse_frame_text, ping_frame, pong_frame, subscription_error_frame,
    subscription_succeeded_frame, ChannelKind, Outbound, PusherFrame, SocketId, SubscribeData,
    UnsubscribeData, EVENT_PING, EVENT_PONG, EVENT_SUBSCRIBE, EVENT_UNSUBSCRIBE,
};
use crate::replication::Broadcast;

const OVER_CAPACITY_MESSAGE: &str = "Over capacity";
const CAPACITY_UNCONFIRMED_MESSAGE: &str = "Unable to confirm capacity, reconnect later";
const AUTH_FAILURE_STATUS: u16 = 401;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    /// Established and holding at least one subscription.
    Active,
    Closed,
    Rejected,
}

/// How an `open` that got past key and origin checks ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Established,
    /// An error frame and a close were queued with `code`.
    SoftRejected { code: u16 },
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub activity_timeout_secs: u64,
    pub max_message_bytes: usize,
    pub empty_origin_list: EmptyOriginList,
}

impl SessionSettings {
    pub fn from_server_config(server: &ServerConfig) -> Self {
        Self {
            activity_timeout_secs: server.activity_timeout_secs,
            max_message_bytes: server.max_message_bytes,
            empty_origin_list: server.empty_origin_list,
        }
    }
}

/// Process-wide services every session talks to.
pub struct SessionContext {
    pub apps: Arc<dyn AppDirectory>,
    pub capacity: Arc<CapacityController>,
    pub channels: Arc<ChannelManager>,
    pub settings: SessionSettings,
}

pub struct Session {
    ctx: Arc<SessionContext>,
    socket_id: SocketId,
    outbound: mpsc::Sender<Outbound>,
    state: ConnectionState,
    app: Option<Arc<App>>,
    channels: BTreeSet<String>,
}

impl Session {
    pub fn new(ctx: Arc<SessionContext>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            ctx,
            socket_id: SocketId::generate(),
            outbound,
            state: ConnectionState::Connecting,
            app: None,
            channels: BTreeSet::new(),
        }
    }

    pub fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn app(&self) -> Option<&Arc<App>> {
        self.app.as_ref()
    }

    pub fn subscribed_channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    /// Resolves the app, checks the origin, then asks for a connection slot.
    /// Called once per socket.
    ///
    /// Key and origin failures come back as errors with nothing queued.
    /// Capacity failures are soft: the socket gets an error frame and a
    /// close.
    pub async fn open(
        &mut self,
        path: &str,
        origin: Option<&str>,
    ) -> Result<OpenOutcome, GatewayError> {
        let key = app_key_from_path(path).unwrap_or_default();
        let Some(app) = self.ctx.apps.resolve(&key).await else {
            self.state = ConnectionState::Rejected;
            return Err(GatewayError::UnknownAppKey(key));
        };
        if !origin_allowed(
            origin,
            &app.allowed_origins,
            self.ctx.settings.empty_origin_list,
        ) {
            self.state = ConnectionState::Rejected;
            return Err(GatewayError::OriginNotAllowed {
                app_id: app.id.clone(),
                origin: origin.map(str::to_owned),
            });
        }

        match self.ctx.capacity.try_admit(&app.id, app.capacity).await {
            Ok(Admission::Admitted { connections }) => {
                info!(
                    "socket {} admitted to app {} [{}] ({connections} open)",
                    self.socket_id, app.id, app.name
                );
                self.app = Some(app);
                self.state = ConnectionState::Established;
                self.send_text(connection_established_frame(
                    &self.socket_id,
                    self.ctx.settings.activity_timeout_secs,
                ))
                .await;
                Ok(OpenOutcome::Established)
            }
            Ok(Admission::OverCapacity) => {
                info!("socket {} rejected: app {} over capacity", self.socket_id, app.id);
                Ok(self
                    .soft_reject(OVER_CAPACITY_MESSAGE, codes::OVER_CAPACITY)
                    .await)
            }
            Err(err) => {
                warn!("could not confirm capacity for app {}: {err}", app.id);
                Ok(self
                    .soft_reject(CAPACITY_UNCONFIRMED_MESSAGE, codes::CAPACITY_UNCONFIRMED)
                    .await)
            }
        }
    }

    async fn soft_reject(&mut self, message: &str, code: u16) -> OpenOutcome {
        self.state = ConnectionState::Rejected;
        self.send_text(error_frame(message, Some(code))).await;
        self.send(Outbound::Close {
            code,
            reason: message.to_owned(),
        })
        .await;
        OpenOutcome::SoftRejected { code }
    }

    /// Handles one inbound text frame. Protocol violations are answered
    /// with an error frame and never end the session.
    pub async fn handle_text(&mut self, text: &str) {
        if !matches!(
            self.state,
            ConnectionState::Established | ConnectionState::Active
        ) {
            debug!("ignoring frame on socket {} in state {:?}", self.socket_id, self.state);
            return;
        }
        if text.len() > self.ctx.settings.max_message_bytes {
            self.send_text(error_frame("Message exceeds the size limit", None))
                .await;
            return;
        }
        let frame = match parse_frame_text(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("bad frame on socket {}: {err:#}", self.socket_id);
                self.send_text(error_frame("Invalid frame", None)).await;
                return;
            }
        };
        match frame.event.as_str() {
            EVENT_PING => self.send_text(pong_frame()).await,
            EVENT_PONG => {}
            EVENT_SUBSCRIBE => self.subscribe(&frame).await,
            EVENT_UNSUBSCRIBE => self.unsubscribe(&frame).await,
            _ if frame.is_client_event() => self.client_event(&frame).await,
            other => debug!("ignoring event {other} on socket {}", self.socket_id),
        }
    }

    /// Queues a server-initiated keepalive ping.
    pub async fn send_ping(&self) {
        self.send_text(ping_frame()).await;
    }

    /// Releases the slot and every subscription. Safe to call repeatedly.
    pub async fn close(&mut self) {
        match self.state {
            ConnectionState::Closed | ConnectionState::Rejected => return,
            ConnectionState::Connecting => {
                self.state = ConnectionState::Closed;
                return;
            }
            ConnectionState::Established | ConnectionState::Active => {}
        }
        self.state = ConnectionState::Closed;
        let Some(app) = self.app.clone() else {
            return;
        };
        for channel in std::mem::take(&mut self.channels) {
            self.ctx
                .channels
                .unsubscribe(&app.id, &channel, &self.socket_id)
                .await;
        }
        self.ctx.capacity.release(&app.id).await;
        info!("socket {} closed for app {}", self.socket_id, app.id);
    }

    async fn subscribe(&mut self, frame: &PusherFrame) {
        let Some(app) = self.app.clone() else {
            return;
        };
        let request: SubscribeData = match serde_json::from_value(frame.data_value()) {
            Ok(request) => request,
            Err(_) => {
                self.send_text(error_frame("Invalid subscribe payload", None))
                    .await;
                return;
            }
        };
        let channel = request.channel.trim().to_owned();
        if !is_valid_channel_name(&channel) {
            self.send_text(error_frame(&format!("Invalid channel name `{channel}`"), None))
                .await;
            return;
        }
        let kind = ChannelKind::of(&channel);
        if kind.requires_auth() {
            if kind == ChannelKind::Presence && request.channel_data.is_none() {
                self.send_text(subscription_error_frame(
                    &channel,
                    "presence channels require channel_data",
                    AUTH_FAILURE_STATUS,
                ))
                .await;
                return;
            }
            if let Err(err) = verify_channel_auth(
                &app,
                &self.socket_id,
                &channel,
                request.channel_data.as_deref(),
                request.auth.as_deref(),
            ) {
                debug!("socket {} denied {channel}: {}", self.socket_id, err.message());
                self.send_text(subscription_error_frame(
                    &channel,
                    err.message(),
                    AUTH_FAILURE_STATUS,
                ))
                .await;
                return;
            }
        }

        if self.channels.insert(channel.clone()) {
            self.ctx
                .channels
                .subscribe(&app.id, &channel, &self.socket_id, self.outbound.clone())
                .await;
        }
        self.state = ConnectionState::Active;
        self.send_text(subscription_succeeded_frame(&channel)).await;
    }

    async fn unsubscribe(&mut self, frame: &PusherFrame) {
        let Some(app) = self.app.clone() else {
            return;
        };
        let Ok(request) = serde_json::from_value::<UnsubscribeData>(frame.data_value()) else {
            self.send_text(error_frame("Invalid unsubscribe payload", None))
                .await;
            return;
        };
        let channel = request.channel.trim();
        if self.channels.remove(channel) {
            self.ctx
                .channels
                .unsubscribe(&app.id, channel, &self.socket_id)
                .await;
        }
        if self.channels.is_empty() {
            self.state = ConnectionState::Established;
        }
    }

    async fn client_event(&mut self, frame: &PusherFrame) {
        let Some(app) = self.app.clone() else {
            return;
        };
        if !app.enable_client_messages {
            self.reject_client_event("Client events are not enabled for this app")
                .await;
            return;
        }
        let Some(channel) = frame
            .channel
            .as_deref()
            .map(str::trim)
            .filter(|channel| self.channels.contains(*channel))
            .map(str::to_owned)
        else {
            self.reject_client_event("Client events require a subscribed channel")
                .await;
            return;
        };
        if !ChannelKind::of(&channel).requires_auth() {
            self.reject_client_event("Client events are only allowed on private and presence channels")
                .await;
            return;
        }

        self.ctx.capacity.record_message(&app.id).await;
        let broadcast = Broadcast {
            payload: client_event_frame(frame, &channel),
            except: Some(self.socket_id.to_string()),
        };
        if let Err(err) = self.ctx.channels.publish(&app.id, &channel, broadcast).await {
            warn!("failed to publish client event on {}/{channel}: {err}", app.id);
        }
    }

    async fn reject_client_event(&self, message: &str) {
        self.send_text(error_frame(message, Some(codes::CLIENT_EVENT_REJECTED)))
            .await;
    }

    async fn send_text(&self, text: String) {
        self.send(Outbound::Text(text)).await;
    }

    async fn send(&self, frame: Outbound) {
        if self.outbound.send(frame).await.is_err() {
            debug!("socket {} writer is gone", self.socket_id);
        }
    }
}
