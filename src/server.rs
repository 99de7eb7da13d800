use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::protocol::{codes, Outbound};
use crate::session::{ConnectionState, OpenOutcome, Session, SessionContext};

const CONTROL_HTTP_MAX_REQUEST_BYTES: usize = 16 * 1024;
const CONTROL_HTTP_READ_CHUNK_BYTES: usize = 4096;
const MIN_OUTBOUND_QUEUE: usize = 8;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Accepts Pusher sockets on `server.bind` and, when configured, the
/// control HTTP surface on `server.http_bind`.
pub struct GatewayServer {
    server: ServerConfig,
    ctx: Arc<SessionContext>,
    node_id: String,
}

struct ServerState {
    ctx: Arc<SessionContext>,
    node_id: String,
}

#[derive(Debug, Clone, Copy)]
struct SocketSettings {
    activity_timeout: Duration,
    pong_timeout: Duration,
    outbound_queue_capacity: usize,
}

impl SocketSettings {
    fn from_server(server: &ServerConfig) -> Self {
        Self {
            activity_timeout: Duration::from_secs(server.activity_timeout_secs.max(1)),
            pong_timeout: Duration::from_secs(server.pong_timeout_secs.max(1)),
            outbound_queue_capacity: server.outbound_queue_capacity.max(MIN_OUTBOUND_QUEUE),
        }
    }
}

/// What the upgrade request told us before the socket exists.
#[derive(Debug, Default)]
struct Handshake {
    path: String,
    origin: Option<String>,
}

impl GatewayServer {
    pub fn new(server: ServerConfig, ctx: Arc<SessionContext>, node_id: String) -> Self {
        Self {
            server,
            ctx,
            node_id,
        }
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.server.bind)
            .await
            .with_context(|| format!("failed binding websocket listener on {}", self.server.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("pusher gateway listening on ws://{bound_addr} (node {})", self.node_id);

        let settings = SocketSettings::from_server(&self.server);
        let state = Arc::new(ServerState {
            ctx: self.ctx.clone(),
            node_id: self.node_id.clone(),
        });
        let http_task = self.spawn_control_http_task(state);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let ctx = self.ctx.clone();
                            let stop = stop_rx.clone();
                            connections.spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, ctx, settings, stop).await {
                                    debug!("connection from {remote_addr} ended with error: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("websocket accept failed: {err}");
                        }
                    }
                }
            }
        }
        drop(listener);
        info!("pusher gateway stopped accepting connections");

        if let Some(task) = http_task {
            task.abort();
            let _ = task.await;
        }
        drain_connections(&mut connections, &stop_tx).await;
        Ok(())
    }

    fn spawn_control_http_task(
        &self,
        state: Arc<ServerState>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let bind = self.server.http_bind.clone()?;
        if bind.trim().is_empty() {
            return None;
        }
        Some(tokio::spawn(async move {
            let listener = match TcpListener::bind(&bind).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!("control-http bind failed on {bind}: {err}");
                    return;
                }
            };
            let bound = listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or(bind.clone());
            info!("control-http listening on http://{bound}");
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_control_http_connection(stream, state).await {
                                warn!("control-http connection {remote_addr} failed: {err:#}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("control-http accept failed: {err}");
                    }
                }
            }
        }))
    }
}

/// Tells every open socket to close and waits for their sessions to return
/// their slots. Sockets still open after the grace period are cut off.
async fn drain_connections(connections: &mut JoinSet<()>, stop: &watch::Sender<bool>) {
    let open = connections.len();
    let _ = stop.send(true);
    if open == 0 {
        return;
    }
    info!("closing {open} open socket(s)");
    let drained = timeout(SHUTDOWN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "{} socket(s) still open after {:?}, aborting",
            connections.len(),
            SHUTDOWN_GRACE
        );
        connections.shutdown().await;
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    remote_addr: std::net::SocketAddr,
    ctx: Arc<SessionContext>,
    settings: SocketSettings,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let mut handshake = Handshake::default();
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        handshake.path = request.uri().to_string();
        handshake.origin = request
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        Ok(response)
    };
    let ws = accept_hdr_async(stream, capture)
        .await
        .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;
    let (mut write, mut read) = ws.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(settings.outbound_queue_capacity);
    let mut session = Session::new(ctx, out_tx.clone());
    match session
        .open(&handshake.path, handshake.origin.as_deref())
        .await
    {
        Ok(OpenOutcome::Established) => {}
        Ok(OpenOutcome::SoftRejected { code }) => {
            debug!("socket from {remote_addr} soft-rejected with {code}");
        }
        Err(err) => {
            info!("refusing socket from {remote_addr}: {err}");
            write
                .send(Message::Close(Some(close_frame(
                    err.close_code(),
                    err.to_string(),
                ))))
                .await
                .context("failed sending refusal close frame")?;
            return Ok(());
        }
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let (message, closing) = match frame {
                Outbound::Text(text) => (Message::Text(text), false),
                Outbound::Close { code, reason } => {
                    (Message::Close(Some(close_frame(code, reason))), true)
                }
            };
            if write.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    if session.state() != ConnectionState::Rejected {
        serve_session(&mut session, &mut read, &out_tx, settings, stop).await;
        if let Some(app) = session.app() {
            debug!(
                "socket {} of app {} leaving {} channel(s)",
                session.socket_id(),
                app.id,
                session.subscribed_channels().count()
            );
        }
        session.close().await;
    }

    drop(session);
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Reads frames in order until the peer leaves, stops answering pings, or
/// the server shuts down.
async fn serve_session<S>(
    session: &mut Session,
    read: &mut S,
    out_tx: &mpsc::Sender<Outbound>,
    settings: SocketSettings,
    mut stop: watch::Receiver<bool>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut awaiting_pong = false;
    loop {
        let wait = if awaiting_pong {
            settings.pong_timeout
        } else {
            settings.activity_timeout
        };
        let received = tokio::select! {
            biased;
            _ = stop.changed() => {
                debug!("socket {} closing for shutdown", session.socket_id());
                let _ = out_tx
                    .send(Outbound::Close {
                        code: codes::RECONNECT_IMMEDIATELY,
                        reason: "Server shutting down".to_owned(),
                    })
                    .await;
                return;
            }
            received = timeout(wait, read.next()) => received,
        };
        let inbound = match received {
            Ok(inbound) => inbound,
            Err(_) if awaiting_pong => {
                info!("socket {} missed its pong, closing", session.socket_id());
                let _ = out_tx
                    .send(Outbound::Close {
                        code: codes::PONG_NOT_RECEIVED,
                        reason: "Pong reply not received".to_owned(),
                    })
                    .await;
                return;
            }
            Err(_) => {
                session.send_ping().await;
                awaiting_pong = true;
                continue;
            }
        };
        let message = match inbound {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!("socket {} read failed: {err}", session.socket_id());
                return;
            }
            None => return,
        };
        awaiting_pong = false;
        match message {
            Message::Text(text) => session.handle_text(&text).await,
            Message::Close(_) => return,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

async fn handle_control_http_connection(
    mut stream: tokio::net::TcpStream,
    state: Arc<ServerState>,
) -> Result<()> {
    let Some(request) = read_control_http_request(&mut stream).await? else {
        return Ok(());
    };
    let segments = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => {
            let payload = json!({ "ok": true, "node_id": state.node_id });
            write_http_json_response(&mut stream, 200, &payload).await
        }
        ("GET", ["usage", app_id]) => {
            if state.ctx.apps.find_by_id(app_id).await.is_none() {
                let payload = json!({ "ok": false, "error": "unknown_app", "app_id": app_id });
                return write_http_json_response(&mut stream, 404, &payload).await;
            }
            match state.ctx.capacity.usage(app_id).await {
                Ok(usage) => {
                    let payload =
                        serde_json::to_value(&usage).context("failed encoding usage snapshot")?;
                    write_http_json_response(&mut stream, 200, &payload).await
                }
                Err(err) => write_store_error(&mut stream, &err.to_string()).await,
            }
        }
        ("GET", ["apps", "active"]) => match state.ctx.capacity.active_apps().await {
            Ok(apps) => {
                let payload = json!({ "ok": true, "count": apps.len(), "apps": apps });
                write_http_json_response(&mut stream, 200, &payload).await
            }
            Err(err) => write_store_error(&mut stream, &err.to_string()).await,
        },
        ("GET", _) => {
            let payload = json!({
                "ok": false,
                "error": "not_found",
                "path": request.path
            });
            write_http_json_response(&mut stream, 404, &payload).await
        }
        _ => {
            let payload = json!({
                "ok": false,
                "error": "method_not_allowed"
            });
            write_http_json_response(&mut stream, 405, &payload).await
        }
    }
}

async fn write_store_error(stream: &mut tokio::net::TcpStream, message: &str) -> Result<()> {
    let payload = json!({ "ok": false, "error": "store_unavailable", "message": message });
    write_http_json_response(stream, 503, &payload).await
}

#[derive(Debug)]
struct ControlHttpRequest {
    method: String,
    path: String,
}

fn find_http_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .or_else(|| buf.windows(2).position(|window| window == b"\n\n"))
}

async fn read_control_http_request(
    stream: &mut tokio::net::TcpStream,
) -> Result<Option<ControlHttpRequest>> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = vec![0_u8; CONTROL_HTTP_READ_CHUNK_BYTES];
    let header_end = loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading control-http request bytes")?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            anyhow::bail!("invalid control-http request: missing header terminator");
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(end) = find_http_header_terminator(&buffer) {
            break end;
        }
        if buffer.len() > CONTROL_HTTP_MAX_REQUEST_BYTES {
            anyhow::bail!("control-http request exceeds max size");
        }
    };

    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let request_line = headers.lines().next().unwrap_or_default();
    let mut segments = request_line.split_whitespace();
    let method = segments
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    if method.is_empty() {
        anyhow::bail!("invalid control-http request line");
    }
    let path_raw = segments.next().unwrap_or("/").trim();
    let path = path_raw
        .split('?')
        .next()
        .unwrap_or(path_raw)
        .trim()
        .to_owned();
    Ok(Some(ControlHttpRequest { method, path }))
}

async fn write_http_json_response(
    stream: &mut tokio::net::TcpStream,
    status_code: u16,
    payload: &Value,
) -> Result<()> {
    let body = serde_json::to_vec(payload).context("failed serializing control-http JSON body")?;
    let status_text = match status_code {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        503 => "Service Unavailable",
        _ => "OK",
    };
    let head = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing control-http headers")?;
    stream
        .write_all(&body)
        .await
        .context("failed writing control-http body")?;
    let _ = stream.shutdown().await;
    Ok(())
}

fn close_frame(code: u16, reason: impl Into<Cow<'static, str>>) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;

    use super::GatewayServer;
    use crate::apps::{App, StaticAppDirectory};
    use crate::capacity::CapacityController;
    use crate::channels::ChannelManager;
    use crate::config::{EmptyOriginList, ServerConfig};
    use crate::replication::distributed::DistributedAdapter;
    use crate::replication::local::LocalAdapter;
    use crate::replication::memory::MemoryStore;
    use crate::replication::{DeliveryFeed, ReplicationAdapter};
    use crate::session::{SessionContext, SessionSettings};

    type WsStream = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    const ORIGIN: &str = "https://example.com";

    fn reserve_bind() -> Result<String> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        Ok(addr.to_string())
    }

    fn test_server_config(bind: String) -> ServerConfig {
        ServerConfig {
            bind,
            http_bind: None,
            activity_timeout_secs: 120,
            pong_timeout_secs: 30,
            outbound_queue_capacity: 16,
            max_message_bytes: 10_240,
            empty_origin_list: EmptyOriginList::AllowAny,
        }
    }

    fn test_context(server: &ServerConfig) -> Arc<SessionContext> {
        let (adapter, feed) = LocalAdapter::new("node-test", "test");
        context_over(server, Arc::new(adapter), feed)
    }

    fn context_over(
        server: &ServerConfig,
        adapter: Arc<dyn ReplicationAdapter>,
        feed: DeliveryFeed,
    ) -> Arc<SessionContext> {
        let channels = Arc::new(ChannelManager::new(adapter.clone()));
        channels.clone().spawn_delivery_pump(feed);
        let apps = StaticAppDirectory::new([App {
            id: "1234".to_owned(),
            key: "app-key".to_owned(),
            secret: "app-secret".to_owned(),
            name: "demo".to_owned(),
            allowed_origins: vec![ORIGIN.to_owned()],
            capacity: Some(1),
            enable_client_messages: false,
        }]);
        Arc::new(SessionContext {
            apps: Arc::new(apps),
            capacity: Arc::new(CapacityController::new(adapter)),
            channels,
            settings: SessionSettings::from_server_config(server),
        })
    }

    async fn start(server: ServerConfig) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let ctx = test_context(&server);
        start_with(server, ctx).await
    }

    async fn start_with(
        server: ServerConfig,
        ctx: Arc<SessionContext>,
    ) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let gateway = GatewayServer::new(server, ctx, "node-test".to_owned());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            gateway
                .run_until(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        (shutdown_tx, task)
    }

    async fn connect_ws_with_retry(url: &str, origin: Option<&str>) -> Result<WsStream> {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..5 {
            let mut request = url.into_client_request()?;
            if let Some(origin) = origin {
                request
                    .headers_mut()
                    .insert("Origin", HeaderValue::from_str(origin)?);
            }
            match connect_async(request).await {
                Ok((ws, _)) => return Ok(ws),
                Err(err) => {
                    last_err = Some(err.into());
                    if attempt < 4 {
                        tokio::time::sleep(Duration::from_millis(30 * (attempt + 1) as u64)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("websocket connect failed")))
    }

    async fn next_json(ws: &mut WsStream) -> Result<Value> {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("socket ended"))??;
        Ok(serde_json::from_str(message.to_text()?)?)
    }

    async fn next_close_code(ws: &mut WsStream) -> Result<u16> {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await?
                .ok_or_else(|| anyhow::anyhow!("socket ended without close frame"))??;
            if let Message::Close(frame) = message {
                let frame = frame.ok_or_else(|| anyhow::anyhow!("close without code"))?;
                return Ok(u16::from(frame.code));
            }
        }
    }

    async fn http_get_json(bind: &str, path: &str) -> Result<Value> {
        let mut stream = TcpStream::connect(bind).await?;
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {bind}\r\nAccept: application/json\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        let idx = raw
            .windows(4)
            .position(|chunk| chunk == b"\r\n\r\n")
            .ok_or_else(|| anyhow::anyhow!("missing HTTP body"))?;
        Ok(serde_json::from_slice(&raw[idx + 4..])?)
    }

    #[tokio::test]
    async fn serves_pusher_handshake_ping_and_subscribe() -> Result<()> {
        let bind = reserve_bind()?;
        let (shutdown_tx, task) = start(test_server_config(bind.clone())).await;

        let url = format!("ws://{bind}/app/app-key?protocol=7&client=js&version=8.4.0");
        let mut ws = connect_ws_with_retry(&url, Some(ORIGIN)).await?;
        let established = next_json(&mut ws).await?;
        assert_eq!(established["event"], "pusher:connection_established");
        let data: Value = serde_json::from_str(established["data"].as_str().unwrap_or_default())?;
        assert_eq!(data["activity_timeout"], 120);
        assert!(data["socket_id"].as_str().is_some_and(|id| id.contains('.')));

        ws.send(Message::Text(json!({"event": "pusher:ping", "data": {}}).to_string()))
            .await?;
        assert_eq!(next_json(&mut ws).await?["event"], "pusher:pong");

        ws.send(Message::Text(
            json!({"event": "pusher:subscribe", "data": {"channel": "news"}}).to_string(),
        ))
        .await?;
        let succeeded = next_json(&mut ws).await?;
        assert_eq!(succeeded["event"], "pusher_internal:subscription_succeeded");
        assert_eq!(succeeded["channel"], "news");

        let _ = shutdown_tx.send(());
        task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn refuses_unknown_keys_and_origins_with_close_codes() -> Result<()> {
        let bind = reserve_bind()?;
        let (shutdown_tx, task) = start(test_server_config(bind.clone())).await;

        let mut ws = connect_ws_with_retry(&format!("ws://{bind}/app/bad"), Some(ORIGIN)).await?;
        assert_eq!(next_close_code(&mut ws).await?, 4001);

        let mut ws = connect_ws_with_retry(&format!("ws://{bind}/app/app-key"), None).await?;
        assert_eq!(next_close_code(&mut ws).await?, 4009);

        let _ = shutdown_tx.send(());
        task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn soft_rejects_over_capacity_and_frees_the_slot_on_close() -> Result<()> {
        let ws_bind = reserve_bind()?;
        let http_bind = reserve_bind()?;
        let mut server = test_server_config(ws_bind.clone());
        server.http_bind = Some(http_bind.clone());
        let (shutdown_tx, task) = start(server).await;
        let url = format!("ws://{ws_bind}/app/app-key");

        let mut first = connect_ws_with_retry(&url, Some(ORIGIN)).await?;
        assert_eq!(
            next_json(&mut first).await?["event"],
            "pusher:connection_established"
        );

        let mut second = connect_ws_with_retry(&url, Some(ORIGIN)).await?;
        let error = next_json(&mut second).await?;
        assert_eq!(
            error,
            json!({"event": "pusher:error", "data": {"message": "Over capacity", "code": 4100}})
        );
        assert_eq!(next_close_code(&mut second).await?, 4100);

        let usage = http_get_json(&http_bind, "/usage/1234").await?;
        assert_eq!(usage["connections"], 1);
        assert_eq!(usage["peak_connection_count"], 1);
        let active = http_get_json(&http_bind, "/apps/active").await?;
        assert_eq!(active["apps"], json!(["1234"]));
        let health = http_get_json(&http_bind, "/health").await?;
        assert_eq!(health["node_id"], "node-test");
        let missing = http_get_json(&http_bind, "/usage/nope").await?;
        assert_eq!(missing["error"], "unknown_app");

        first.close(None).await?;
        let mut released = false;
        for _ in 0..50 {
            let usage = http_get_json(&http_bind, "/usage/1234").await?;
            if usage["connections"] == 0 {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released, "closing the socket must release its slot");

        let _ = shutdown_tx.send(());
        task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_closes_open_sockets_and_returns_their_slots() -> Result<()> {
        let bind = reserve_bind()?;
        let server = test_server_config(bind.clone());
        let store = MemoryStore::default();
        let (adapter, feed) =
            DistributedAdapter::start(Arc::new(store.clone()), "node-test", "test").await?;
        let ctx = context_over(&server, Arc::new(adapter), feed);
        let (shutdown_tx, task) = start_with(server, ctx.clone()).await;

        let mut ws =
            connect_ws_with_retry(&format!("ws://{bind}/app/app-key"), Some(ORIGIN)).await?;
        assert_eq!(
            next_json(&mut ws).await?["event"],
            "pusher:connection_established"
        );
        assert_eq!(store.field("test:app:4:1234", "connections"), Some(1));
        assert_eq!(ctx.capacity.active_apps().await?, vec!["1234".to_owned()]);

        let _ = shutdown_tx.send(());
        assert_eq!(next_close_code(&mut ws).await?, 4200);
        tokio::time::timeout(Duration::from_secs(5), task).await???;

        assert_eq!(store.field("test:app:4:1234", "connections"), Some(0));
        assert!(ctx.capacity.active_apps().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn silent_sockets_are_pinged_then_closed() -> Result<()> {
        let bind = reserve_bind()?;
        let mut server = test_server_config(bind.clone());
        server.activity_timeout_secs = 1;
        server.pong_timeout_secs = 1;
        let (shutdown_tx, task) = start(server).await;

        let mut ws =
            connect_ws_with_retry(&format!("ws://{bind}/app/app-key"), Some(ORIGIN)).await?;
        assert_eq!(
            next_json(&mut ws).await?["event"],
            "pusher:connection_established"
        );
        assert_eq!(next_json(&mut ws).await?["event"], "pusher:ping");
        assert_eq!(next_close_code(&mut ws).await?, 4201);

        let _ = shutdown_tx.send(());
        task.await??;
        Ok(())
    }
}
