//! QUIC messaging: streams and datagrams over quinn.
//!
//! QUIC is always secured; both ends are built from a [`TlsConfig`]. The
//! datagram path maps to the `receive` callback, whole uni/bi stream
//! payloads to `stream_receive`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::callback::{QuicClientCallbacks, QuicServerCallbacks};
use crate::error::{ErrorCode, NetError, NetResult};
use crate::lifecycle::LifecycleManager;
use crate::startable::Startable;
use crate::tls::{client_rustls_config, server_rustls_config, TlsConfig};

/// Default ALPN protocol id.
pub const DEFAULT_ALPN: &[u8] = b"netsys";

/// Whole-stream reads are capped at this size.
const MAX_STREAM_PAYLOAD: usize = 1024 * 1024;

fn map_quinn_error(e: impl std::fmt::Display, origin: &'static str) -> NetError {
    NetError::new(ErrorCode::InternalError, format!("quic error: {e}"), origin)
}

/// QUIC server endpoint.
pub struct QuicServer {
    server_id: String,
    lifecycle: LifecycleManager,
    callbacks: QuicServerCallbacks,
    tls: TlsConfig,
    alpn: Vec<Vec<u8>>,
    endpoint: Mutex<Option<quinn::Endpoint>>,
    accept_abort: Mutex<Option<AbortHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
    weak_self: Weak<Self>,
}

impl QuicServer {
    pub fn new(server_id: impl Into<String>, tls: TlsConfig) -> Arc<Self> {
        Self::with_alpn(server_id, tls, vec![DEFAULT_ALPN.to_vec()])
    }

    pub fn with_alpn(
        server_id: impl Into<String>,
        tls: TlsConfig,
        alpn: Vec<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            server_id: server_id.into(),
            lifecycle: LifecycleManager::new(),
            callbacks: QuicServerCallbacks::default(),
            tls,
            alpn,
            endpoint: Mutex::new(None),
            accept_abort: Mutex::new(None),
            local_addr: Mutex::new(None),
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

    pub fn set_connection_callback(&self, callback: impl Fn(SocketAddr) + Send + Sync + 'static) {
        self.callbacks.connection.set(Arc::new(callback));
    }

    pub fn set_disconnection_callback(
        &self,
        callback: impl Fn(SocketAddr) + Send + Sync + 'static,
    ) {
        self.callbacks.disconnection.set(Arc::new(callback));
    }

    pub fn set_receive_callback(
        &self,
        callback: impl Fn(SocketAddr, &[u8]) + Send + Sync + 'static,
    ) {
        self.callbacks.receive.set(Arc::new(callback));
    }

    pub fn set_stream_receive_callback(
        &self,
        callback: impl Fn(SocketAddr, &[u8]) + Send + Sync + 'static,
    ) {
        self.callbacks.stream_receive.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(&NetError) + Send + Sync + 'static) {
        self.callbacks.error.set(Arc::new(callback));
    }

    async fn drive_connection(self: Arc<Self>, connection: quinn::Connection) {
        let remote = connection.remote_address();
        self.callbacks.connection.invoke_with(|cb| cb(remote));

        loop {
            tokio::select! {
                datagram = connection.read_datagram() => match datagram {
                    Ok(bytes) => {
                        self.callbacks.receive.invoke_with(|cb| cb(remote, &bytes));
                    }
                    Err(_) => break,
                },
                stream = connection.accept_uni() => match stream {
                    Ok(recv) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.read_stream(remote, recv).await;
                        });
                    }
                    Err(_) => break,
                },
                stream = connection.accept_bi() => match stream {
                    Ok((_send, recv)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.read_stream(remote, recv).await;
                        });
                    }
                    Err(_) => break,
                },
            }
        }

        self.callbacks.disconnection.invoke_with(|cb| cb(remote));
        log::debug!("[{}] connection from {remote} closed", self.server_id);
    }

    async fn read_stream(&self, remote: SocketAddr, mut recv: quinn::RecvStream) {
        match recv.read_to_end(MAX_STREAM_PAYLOAD).await {
            Ok(payload) => {
                self.callbacks
                    .stream_receive
                    .invoke_with(|cb| cb(remote, &payload));
            }
            Err(e) => {
                let error = NetError::new(
                    ErrorCode::InternalError,
                    format!("stream read from {remote} failed: {e}"),
                    "quic_server::stream",
                );
                log::warn!("[{}] {error}", self.server_id);
                self.callbacks.error.invoke_with(|cb| cb(&error));
            }
        }
    }
}

#[async_trait]
impl Startable for QuicServer {
    type StartArgs = u16;

    fn component_name(&self) -> &str {
        &self.server_id
    }

    fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    async fn do_start_impl(&self, port: u16) -> NetResult<()> {
        let mut tls_config = server_rustls_config(&self.tls)?;
        tls_config.alpn_protocols = self.alpn.clone();

        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(tls_config))
            .map_err(|e| {
                NetError::new(
                    ErrorCode::InvalidArgument,
                    format!("TLS configuration unusable for QUIC: {e}"),
                    "quic_server::start",
                )
            })?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
        let endpoint = quinn::Endpoint::server(server_config, bind_addr).map_err(|e| {
            NetError::new(
                ErrorCode::BindFailed,
                format!("failed to bind port {port}: {e}"),
                "quic_server::start",
            )
            .with_context(self.server_id.clone())
        })?;

        let local_addr = endpoint.local_addr().map_err(|e| {
            NetError::new(
                ErrorCode::InternalError,
                format!("failed to read local address: {e}"),
                "quic_server::start",
            )
        })?;
        *self.local_addr.lock() = Some(local_addr);

        let weak = self.weak_self.clone();
        let accept_endpoint = endpoint.clone();
        let accept_task = tokio::spawn(async move {
            while let Some(incoming) = accept_endpoint.accept().await {
                let Some(server) = weak.upgrade() else { break };
                match incoming.await {
                    Ok(connection) => {
                        tokio::spawn(server.drive_connection(connection));
                    }
                    Err(e) => {
                        if server.is_running() {
                            log::warn!("[{}] connection attempt failed: {e}", server.server_id);
                        }
                    }
                }
            }
        });
        *self.accept_abort.lock() = Some(accept_task.abort_handle());
        *self.endpoint.lock() = Some(endpoint);

        log::info!("[{}] quic server on {local_addr}", self.server_id);
        Ok(())
    }

    async fn do_stop_impl(&self) -> NetResult<()> {
        if let Some(endpoint) = self.endpoint.lock().take() {
            endpoint.close(0u32.into(), b"server stopped");
        }
        if let Some(abort) = self.accept_abort.lock().take() {
            abort.abort();
        }
        *self.local_addr.lock() = None;
        Ok(())
    }
}

/// QUIC client endpoint.
pub struct QuicClient {
    client_id: String,
    lifecycle: LifecycleManager,
    connected: AtomicBool,
    callbacks: QuicClientCallbacks,
    tls: TlsConfig,
    alpn: Vec<Vec<u8>>,
    endpoint: Mutex<Option<quinn::Endpoint>>,
    connection: Mutex<Option<quinn::Connection>>,
    drive_abort: Mutex<Option<AbortHandle>>,
    weak_self: Weak<Self>,
}

impl QuicClient {
    pub fn new(client_id: impl Into<String>, tls: TlsConfig) -> Arc<Self> {
        Self::with_alpn(client_id, tls, vec![DEFAULT_ALPN.to_vec()])
    }

    pub fn with_alpn(
        client_id: impl Into<String>,
        tls: TlsConfig,
        alpn: Vec<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            client_id: client_id.into(),
            lifecycle: LifecycleManager::new(),
            connected: AtomicBool::new(false),
            callbacks: QuicClientCallbacks::default(),
            tls,
            alpn,
            endpoint: Mutex::new(None),
            connection: Mutex::new(None),
            drive_abort: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
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

    /// Sends one unreliable datagram.
    pub fn send_datagram(&self, data: Vec<u8>) -> NetResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let connection = self.require_connection()?;
        connection.send_datagram(data.into()).map_err(|e| {
            NetError::new(
                ErrorCode::SendFailed,
                format!("datagram send failed: {e}"),
                "quic_client::send_datagram",
            )
        })
    }

    /// Opens a uni stream, writes the payload, and finishes the stream.
    pub async fn send_stream(&self, data: Vec<u8>) -> NetResult<()> {
        let connection = self.require_connection()?;
        let mut stream = connection
            .open_uni()
            .await
            .map_err(|e| map_quinn_error(e, "quic_client::send_stream"))?;
        stream
            .write_all(&data)
            .await
            .map_err(|e| {
                NetError::new(
                    ErrorCode::SendFailed,
                    format!("stream write failed: {e}"),
                    "quic_client::send_stream",
                )
            })?;
        stream
            .finish()
            .map_err(|e| map_quinn_error(e, "quic_client::send_stream"))?;
        Ok(())
    }

    fn require_connection(&self) -> NetResult<quinn::Connection> {
        if !self.is_connected() {
            return Err(NetError::new(
                ErrorCode::ConnectionClosed,
                "client is not connected",
                "quic_client::send",
            )
            .with_context(self.client_id.clone()));
        }
        self.connection.lock().clone().ok_or_else(|| {
            NetError::new(
                ErrorCode::ConnectionClosed,
                "connection already closed",
                "quic_client::send",
            )
        })
    }

    pub fn set_receive_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.callbacks.receive.set(Arc::new(callback));
    }

    pub fn set_stream_receive_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.callbacks.stream_receive.set(Arc::new(callback));
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
}

#[async_trait]
impl Startable for QuicClient {
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
                "quic_client::start",
            ));
        }

        let mut tls_config = client_rustls_config(&self.tls)?;
        tls_config.alpn_protocols = self.alpn.clone();

        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::new(tls_config))
            .map_err(|e| {
                NetError::new(
                    ErrorCode::InvalidArgument,
                    format!("TLS configuration unusable for QUIC: {e}"),
                    "quic_client::start",
                )
            })?;
        let client_config = quinn::ClientConfig::new(Arc::new(crypto));

        let endpoint =
            quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0))).map_err(|e| {
                NetError::new(
                    ErrorCode::BindFailed,
                    format!("failed to bind local endpoint: {e}"),
                    "quic_client::start",
                )
            })?;

        let remote = tokio::net::lookup_host((host.as_str(), port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                NetError::new(
                    ErrorCode::ConnectionFailed,
                    format!("failed to resolve {host}:{port}"),
                    "quic_client::start",
                )
            })?;

        let connection = endpoint
            .connect_with(client_config, remote, &host)
            .map_err(|e| {
                NetError::new(
                    ErrorCode::ConnectionFailed,
                    format!("failed to start connection to {host}:{port}: {e}"),
                    "quic_client::start",
                )
            })?
            .await
            .map_err(|e| {
                NetError::new(
                    ErrorCode::ConnectionFailed,
                    format!("failed to connect to {host}:{port}: {e}"),
                    "quic_client::start",
                )
            })?;

        let weak = self.weak_self.clone();
        let drive_connection = connection.clone();
        let drive_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    datagram = drive_connection.read_datagram() => match datagram {
                        Ok(bytes) => {
                            let Some(client) = weak.upgrade() else { break };
                            client.callbacks.receive.invoke_with(|cb| cb(&bytes));
                        }
                        Err(_) => break,
                    },
                    stream = drive_connection.accept_uni() => match stream {
                        Ok(mut recv) => {
                            let Some(client) = weak.upgrade() else { break };
                            match recv.read_to_end(MAX_STREAM_PAYLOAD).await {
                                Ok(payload) => {
                                    client
                                        .callbacks
                                        .stream_receive
                                        .invoke_with(|cb| cb(&payload));
                                }
                                Err(e) => {
                                    log::warn!("[{}] stream read failed: {e}", client.client_id);
                                }
                            }
                        }
                        Err(_) => break,
                    },
                }
            }

            if let Some(client) = weak.upgrade() {
                if client.is_running() && !client.lifecycle.is_stop_initiated() {
                    let error = NetError::new(
                        ErrorCode::ConnectionClosed,
                        "connection closed by peer",
                        "quic_client::drive",
                    );
                    client.callbacks.error.invoke_with(|cb| cb(&error));
                    tokio::spawn(async move {
                        let _ = client.stop_client().await;
                    });
                }
            }
        });
        *self.drive_abort.lock() = Some(drive_task.abort_handle());

        *self.connection.lock() = Some(connection);
        *self.endpoint.lock() = Some(endpoint);
        self.connected.store(true, Ordering::Release);
        log::info!("[{}] connected to {host}:{port}", self.client_id);
        self.callbacks.connected.invoke_with(|cb| cb());
        Ok(())
    }

    async fn do_stop_impl(&self) -> NetResult<()> {
        self.connected.store(false, Ordering::Release);
        if let Some(connection) = self.connection.lock().take() {
            connection.close(0u32.into(), b"client stopped");
        }
        if let Some(endpoint) = self.endpoint.lock().take() {
            endpoint.close(0u32.into(), b"client stopped");
        }
        if let Some(abort) = self.drive_abort.lock().take() {
            abort.abort();
        }
        Ok(())
    }

    async fn on_stopped(&self) {
        self.callbacks.disconnected.invoke_with(|cb| cb());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_without_certificates_fails_cleanly() {
        let server = QuicServer::new("quic-s1", TlsConfig::default());
        let err = server.start_server(0).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn client_send_before_connect_fails() {
        let client = QuicClient::new(
            "quic-c1",
            TlsConfig {
                verify_peer: false,
                ..Default::default()
            },
        );
        let err = client.send_datagram(b"x".to_vec()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
    }

    #[tokio::test]
    async fn empty_datagram_is_noop() {
        let client = QuicClient::new("quic-c2", TlsConfig::default());
        client.send_datagram(Vec::new()).unwrap();
    }
}
