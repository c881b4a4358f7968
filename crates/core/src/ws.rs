//! WebSocket messaging over plain or TLS streams.
//!
//! Framing (RFC 6455 text/binary/ping/pong/close) is handled by
//! tungstenite; this module supplies the lifecycle, callback fan-out, and
//! session bookkeeping around it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, client_async};

use crate::callback::{CallbackSlot, WsClientCallbacks, WsServerCallbacks};
use crate::error::{ErrorCode, NetError, NetResult};
use crate::lifecycle::LifecycleManager;
use crate::startable::Startable;
use crate::tls::{NoTls, Tls, TlsConfig, TlsPolicy};

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

static NEXT_WS_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// WebSocket client.
pub struct WsClient<P: TlsPolicy = NoTls> {
    client_id: String,
    lifecycle: LifecycleManager,
    connected: AtomicBool,
    callbacks: WsClientCallbacks,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pump_abort: Mutex<Option<AbortHandle>>,
    path: Mutex<String>,
    ping_interval: Duration,
    policy: P,
    weak_self: Weak<Self>,
}

impl WsClient<NoTls> {
    pub fn new(client_id: impl Into<String>) -> Arc<Self> {
        Self::with_policy(client_id, NoTls, DEFAULT_PING_INTERVAL)
    }
}

impl WsClient<Tls> {
    pub fn with_tls(client_id: impl Into<String>, config: &TlsConfig) -> NetResult<Arc<Self>> {
        Ok(Self::with_policy(
            client_id,
            Tls::client(config)?,
            DEFAULT_PING_INTERVAL,
        ))
    }
}

impl<P: TlsPolicy> WsClient<P> {
    pub fn with_policy(
        client_id: impl Into<String>,
        policy: P,
        ping_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            client_id: client_id.into(),
            lifecycle: LifecycleManager::new(),
            connected: AtomicBool::new(false),
            callbacks: WsClientCallbacks::default(),
            outgoing: Mutex::new(None),
            pump_abort: Mutex::new(None),
            path: Mutex::new("/".to_owned()),
            ping_interval,
            policy,
            weak_self: weak_self.clone(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Request path used during the WebSocket handshake. Default "/".
    pub fn set_path(&self, path: impl Into<String>) {
        *self.path.lock() = path.into();
    }

    pub async fn start_client(&self, host: &str, port: u16) -> NetResult<()> {
        self.do_start((host.to_owned(), port)).await
    }

    pub async fn stop_client(&self) -> NetResult<()> {
        self.do_stop().await
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub async fn wait_for_stop(&self) {
        self.lifecycle.wait_for_stop().await;
    }

    pub fn send_text(&self, text: impl Into<String>) -> NetResult<()> {
        self.enqueue(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> NetResult<()> {
        self.enqueue(Message::Binary(data))
    }

    fn enqueue(&self, message: Message) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetError::new(
                ErrorCode::ConnectionClosed,
                "client is not connected",
                "ws_client::send",
            )
            .with_context(self.client_id.clone()));
        }
        let sender = self.outgoing.lock().clone();
        let Some(sender) = sender else {
            return Err(NetError::new(
                ErrorCode::ConnectionClosed,
                "connection already closed",
                "ws_client::send",
            ));
        };
        sender.send(message).map_err(|_| {
            NetError::new(
                ErrorCode::SendFailed,
                "outgoing channel closed",
                "ws_client::send",
            )
        })
    }

    pub fn set_message_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.callbacks.message.set(Arc::new(callback));
    }

    pub fn set_text_message_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.text_message.set(Arc::new(callback));
    }

    pub fn set_binary_message_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.callbacks.binary_message.set(Arc::new(callback));
    }

    pub fn set_connected_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.connected.set(Arc::new(callback));
    }

    pub fn set_disconnected_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.disconnected.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(&NetError) + Send + Sync + 'static) {
        self.callbacks.error.set(Arc::new(callback));
    }

    fn dispatch_incoming(&self, message: Message) {
        match message {
            Message::Text(text) => {
                self.callbacks.text_message.invoke_with(|cb| cb(&text));
                self.callbacks
                    .message
                    .invoke_with(|cb| cb(text.as_bytes()));
            }
            Message::Binary(data) => {
                self.callbacks.binary_message.invoke_with(|cb| cb(&data));
                self.callbacks.message.invoke_with(|cb| cb(&data));
            }
            other => {
                log::debug!("[{}] ignoring frame {other:?}", self.client_id);
            }
        }
    }
}

#[async_trait]
impl<P: TlsPolicy> Startable for WsClient<P> {
    type StartArgs = (String, u16);

    fn component_name(&self) -> &str {
        &self.client_id
    }

    fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    async fn do_start_impl(&self, (host, port): (String, u16)) -> NetResult<()> {
        if host.is_empty() {
            return Err(NetError::new(
                ErrorCode::InvalidArgument,
                "host must not be empty",
                "ws_client::start",
            ));
        }

        let socket = TcpStream::connect((host.as_str(), port)).await.map_err(|e| {
            NetError::new(
                ErrorCode::ConnectionFailed,
                format!("failed to connect to {host}:{port}: {e}"),
                "ws_client::start",
            )
        })?;
        let stream = self.policy.connect(&host, socket).await?;

        let scheme = if P::ENABLED { "wss" } else { "ws" };
        let url = format!("{scheme}://{host}:{port}{}", self.path.lock());
        let (ws, _response) = client_async(url, stream).await.map_err(|e| {
            NetError::new(
                ErrorCode::ConnectionFailed,
                format!("websocket handshake failed: {e}"),
                "ws_client::start",
            )
        })?;

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outgoing.lock() = Some(tx);

        let weak = self.weak_self.clone();
        let ping_interval = self.ping_interval;
        let pump = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                log::warn!("failed to answer ping: {e}");
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(message)) => {
                            let Some(client) = weak.upgrade() else { break };
                            client.dispatch_incoming(message);
                        }
                        Some(Err(e)) => {
                            if let Some(client) = weak.upgrade() {
                                if client.is_running() && !client.lifecycle.is_stop_initiated() {
                                    let error = NetError::new(
                                        ErrorCode::ConnectionClosed,
                                        format!("websocket read failed: {e}"),
                                        "ws_client::pump",
                                    );
                                    client.callbacks.error.invoke_with(|cb| cb(&error));
                                }
                            }
                            break;
                        }
                    },
                    outgoing = rx.recv() => match outgoing {
                        Some(message) => {
                            if let Err(e) = write.send(message).await {
                                log::warn!("websocket send failed: {e}");
                            }
                        }
                        None => break,
                    },
                    _ = interval.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            log::warn!("websocket ping failed: {e}");
                        }
                    }
                }
            }

            // Connection is gone; stop the client unless a stop is already
            // driving this shutdown.
            if let Some(client) = weak.upgrade() {
                if client.is_running() && !client.lifecycle.is_stop_initiated() {
                    tokio::spawn(async move {
                        let _ = client.stop_client().await;
                    });
                }
            }
        });
        *self.pump_abort.lock() = Some(pump.abort_handle());

        self.connected.store(true, Ordering::Release);
        log::info!("[{}] connected to {scheme}://{host}:{port}", self.client_id);
        self.callbacks.connected.invoke_with(|cb| cb());
        Ok(())
    }

    async fn do_stop_impl(&self) -> NetResult<()> {
        self.connected.store(false, Ordering::Release);
        if let Some(sender) = self.outgoing.lock().take() {
            let _ = sender.send(Message::Close(None));
        }
        // Give the pump a moment to flush the close frame.
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(abort) = self.pump_abort.lock().take() {
            abort.abort();
        }
        Ok(())
    }

    async fn on_stopped(&self) {
        self.callbacks.disconnected.invoke_with(|cb| cb());
    }
}

/// One accepted WebSocket connection.
pub struct WsSession {
    id: u64,
    peer: SocketAddr,
    server_id: String,
    is_stopped: AtomicBool,
    outgoing: mpsc::UnboundedSender<Message>,
    pump_abort: Mutex<Option<AbortHandle>>,
    on_closed: CallbackSlot<dyn Fn(&str) + Send + Sync>,
}

impl WsSession {
    fn new(peer: SocketAddr, server_id: String, outgoing: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: NEXT_WS_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            server_id,
            is_stopped: AtomicBool::new(false),
            outgoing,
            pump_abort: Mutex::new(None),
            on_closed: CallbackSlot::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopped.load(Ordering::Acquire)
    }

    pub fn send_text(&self, text: impl Into<String>) -> NetResult<()> {
        self.enqueue(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> NetResult<()> {
        self.enqueue(Message::Binary(data))
    }

    fn enqueue(&self, message: Message) -> NetResult<()> {
        if self.is_stopped() {
            return Err(NetError::new(
                ErrorCode::ConnectionClosed,
                "session is stopped",
                "ws_session::send",
            ));
        }
        self.outgoing.send(message).map_err(|_| {
            NetError::new(
                ErrorCode::SendFailed,
                "outgoing channel closed",
                "ws_session::send",
            )
        })
    }

    /// Stops the session: best-effort close frame, pump cancellation, and the
    /// server's disconnection fan-out exactly once.
    pub fn stop_session(&self) {
        if self.is_stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outgoing.send(Message::Close(None));
        if let Some(abort) = self.pump_abort.lock().take() {
            abort.abort();
        }
        self.on_closed.invoke_with(|cb| cb(&self.server_id));
    }
}

/// WebSocket server.
pub struct WsServer<P: TlsPolicy = NoTls> {
    server_id: String,
    lifecycle: LifecycleManager,
    callbacks: WsServerCallbacks<WsSession>,
    sessions: Mutex<Vec<Arc<WsSession>>>,
    accept_abort: Mutex<Option<AbortHandle>>,
    cleanup_abort: Mutex<Option<AbortHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
    policy: P,
    weak_self: Weak<Self>,
}

impl WsServer<NoTls> {
    pub fn new(server_id: impl Into<String>) -> Arc<Self> {
        Self::with_policy(server_id, NoTls)
    }
}

impl WsServer<Tls> {
    pub fn with_tls(server_id: impl Into<String>, config: &TlsConfig) -> NetResult<Arc<Self>> {
        Ok(Self::with_policy(server_id, Tls::server(config)?))
    }
}

impl<P: TlsPolicy> WsServer<P> {
    pub fn with_policy(server_id: impl Into<String>, policy: P) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            server_id: server_id.into(),
            lifecycle: LifecycleManager::new(),
            callbacks: WsServerCallbacks::default(),
            sessions: Mutex::new(Vec::new()),
            accept_abort: Mutex::new(None),
            cleanup_abort: Mutex::new(None),
            local_addr: Mutex::new(None),
            policy,
            weak_self: weak_self.clone(),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub async fn start_server(&self, port: u16) -> NetResult<()> {
        self.do_start(port).await
    }

    pub async fn stop_server(&self) -> NetResult<()> {
        self.do_stop().await
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub async fn wait_for_stop(&self) {
        self.lifecycle.wait_for_stop().await;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn set_connection_callback(
        &self,
        callback: impl Fn(Arc<WsSession>) + Send + Sync + 'static,
    ) {
        self.callbacks.connection.set(Arc::new(callback));
    }

    pub fn set_disconnection_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.disconnection.set(Arc::new(callback));
    }

    pub fn set_message_callback(
        &self,
        callback: impl Fn(Arc<WsSession>, &[u8]) + Send + Sync + 'static,
    ) {
        self.callbacks.message.set(Arc::new(callback));
    }

    pub fn set_text_message_callback(
        &self,
        callback: impl Fn(Arc<WsSession>, &str) + Send + Sync + 'static,
    ) {
        self.callbacks.text_message.set(Arc::new(callback));
    }

    pub fn set_binary_message_callback(
        &self,
        callback: impl Fn(Arc<WsSession>, &[u8]) + Send + Sync + 'static,
    ) {
        self.callbacks.binary_message.set(Arc::new(callback));
    }

    pub fn set_error_callback(
        &self,
        callback: impl Fn(Option<Arc<WsSession>>, &NetError) + Send + Sync + 'static,
    ) {
        self.callbacks.error.set(Arc::new(callback));
    }

    async fn on_accept(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let stream = match self.policy.accept(socket).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("[{}] handshake with {peer} failed: {e}", self.server_id);
                return;
            }
        };

        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::error!(
                    "[{}] websocket upgrade with {peer} failed: {e}",
                    self.server_id
                );
                return;
            }
        };

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let session = Arc::new(WsSession::new(peer, self.server_id.clone(), tx));

        let weak_server = self.weak_self.clone();
        session.on_closed.set(Arc::new(move |server_id: &str| {
            if let Some(server) = weak_server.upgrade() {
                server
                    .callbacks
                    .disconnection
                    .invoke_with(|cb| cb(server_id));
            }
        }));

        // Register and announce the session before the pump can deliver its
        // first message, so connection always precedes message callbacks.
        self.sessions.lock().push(session.clone());
        log::debug!("[{}] websocket connection from {peer}", self.server_id);
        self.callbacks
            .connection
            .invoke_with(|cb| cb(session.clone()));

        let weak_server = self.weak_self.clone();
        let weak_session = Arc::downgrade(&session);
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                log::warn!("failed to answer ping: {e}");
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(message)) => {
                            let (Some(server), Some(session)) =
                                (weak_server.upgrade(), weak_session.upgrade())
                            else {
                                break;
                            };
                            server.dispatch_incoming(session, message);
                        }
                        Some(Err(e)) => {
                            if let (Some(server), session) =
                                (weak_server.upgrade(), weak_session.upgrade())
                            {
                                let error = NetError::new(
                                    ErrorCode::ConnectionClosed,
                                    format!("websocket read failed: {e}"),
                                    "ws_server::pump",
                                );
                                server.callbacks.error.invoke_with(|cb| cb(session, &error));
                            }
                            break;
                        }
                    },
                    outgoing = rx.recv() => match outgoing {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if let Err(e) = write.send(message).await {
                                log::debug!("websocket send failed: {e}");
                                break;
                            }
                            if closing {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }

            if let Some(session) = weak_session.upgrade() {
                session.stop_session();
            }
        });
        *session.pump_abort.lock() = Some(pump.abort_handle());
    }

    fn dispatch_incoming(&self, session: Arc<WsSession>, message: Message) {
        match message {
            Message::Text(text) => {
                self.callbacks
                    .text_message
                    .invoke_with(|cb| cb(session.clone(), &text));
                self.callbacks
                    .message
                    .invoke_with(|cb| cb(session, text.as_bytes()));
            }
            Message::Binary(data) => {
                self.callbacks
                    .binary_message
                    .invoke_with(|cb| cb(session.clone(), &data));
                self.callbacks.message.invoke_with(|cb| cb(session, &data));
            }
            other => {
                log::debug!("[{}] ignoring frame {other:?}", self.server_id);
            }
        }
    }

    fn cleanup_dead_sessions(&self) {
        self.sessions.lock().retain(|session| !session.is_stopped());
    }
}

#[async_trait]
impl<P: TlsPolicy> Startable for WsServer<P> {
    type StartArgs = u16;

    fn component_name(&self) -> &str {
        &self.server_id
    }

    fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    async fn do_start_impl(&self, port: u16) -> NetResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
            NetError::new(
                ErrorCode::BindFailed,
                format!("failed to bind port {port}: {e}"),
                "ws_server::start",
            )
            .with_context(self.server_id.clone())
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            NetError::new(
                ErrorCode::InternalError,
                format!("failed to read local address: {e}"),
                "ws_server::start",
            )
        })?;
        *self.local_addr.lock() = Some(local_addr);

        let weak = self.weak_self.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let Some(server) = weak.upgrade() else { break };
                        // Handshakes run off the loop so a stalled peer
                        // cannot hold up the next accept.
                        tokio::spawn(server.on_accept(socket, peer));
                    }
                    Err(e) => {
                        let Some(server) = weak.upgrade() else { break };
                        if !server.is_running() {
                            break;
                        }
                        log::error!("[{}] accept failed: {e}", server.server_id);
                    }
                }
            }
        });
        *self.accept_abort.lock() = Some(accept_task.abort_handle());

        let weak = self.weak_self.clone();
        let cleanup_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(server) = weak.upgrade() else { break };
                server.cleanup_dead_sessions();
            }
        });
        *self.cleanup_abort.lock() = Some(cleanup_task.abort_handle());

        log::info!("[{}] websocket server on {local_addr}", self.server_id);
        Ok(())
    }

    async fn do_stop_impl(&self) -> NetResult<()> {
        if let Some(abort) = self.accept_abort.lock().take() {
            abort.abort();
        }
        if let Some(abort) = self.cleanup_abort.lock().take() {
            abort.abort();
        }

        let drained: Vec<_> = self.sessions.lock().drain(..).collect();
        for session in drained {
            session.stop_session();
        }

        *self.local_addr.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn started_pair() -> (Arc<WsServer>, Arc<WsClient>) {
        let server = WsServer::new("ws-server");
        server.start_server(0).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let client = WsClient::new("ws-client");
        client.start_client("127.0.0.1", port).await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn text_and_binary_reach_matching_callbacks() {
        let server = WsServer::new("ws-echo");
        let texts = Arc::new(Mutex::new(Vec::new()));
        let binaries = Arc::new(Mutex::new(Vec::new()));
        let all = Arc::new(Mutex::new(Vec::new()));

        let texts2 = texts.clone();
        server.set_text_message_callback(move |_session, text| {
            texts2.lock().push(text.to_owned());
        });
        let binaries2 = binaries.clone();
        server.set_binary_message_callback(move |_session, data| {
            binaries2.lock().push(data.to_vec());
        });
        let all2 = all.clone();
        server.set_message_callback(move |_session, data| {
            all2.lock().push(data.to_vec());
        });

        server.start_server(0).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let client = WsClient::new("ws-c1");
        client.start_client("127.0.0.1", port).await.unwrap();
        client.send_text("hello").unwrap();
        client.send_binary(vec![1, 2, 3]).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*texts.lock(), vec!["hello".to_owned()]);
        assert_eq!(*binaries.lock(), vec![vec![1, 2, 3]]);
        assert_eq!(all.lock().len(), 2);

        client.stop_client().await.unwrap();
        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn server_replies_through_session() {
        let (server, client) = started_pair().await;

        server.set_text_message_callback(|session, text| {
            let _ = session.send_text(format!("echo: {text}"));
        });

        let texts = Arc::new(Mutex::new(Vec::new()));
        let texts2 = texts.clone();
        client.set_text_message_callback(move |text| {
            texts2.lock().push(text.to_owned());
        });

        client.send_text("ping").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*texts.lock(), vec!["echo: ping".to_owned()]);

        client.stop_client().await.unwrap();
        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn client_disconnect_is_observed_once() {
        let (server, client) = started_pair().await;
        let disconnections = Arc::new(Mutex::new(Vec::new()));

        let disconnections2 = disconnections.clone();
        server.set_disconnection_callback(move |server_id| {
            disconnections2.lock().push(server_id.to_owned());
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        client.stop_client().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*disconnections.lock(), vec!["ws-server".to_owned()]);
        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let client = WsClient::new("ws-c2");
        let err = client.send_text("x").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
    }
}
