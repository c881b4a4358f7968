//! Datagram messaging over UDP.
//!
//! Plain UDP only: there is no handshake, so the client's connected callback
//! fires right after a successful start, and the server's client_connected /
//! client_disconnected slots exist for API parity but are never invoked.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::AbortHandle;

use crate::callback::{UdpClientCallbacks, UdpServerCallbacks};
use crate::error::{ErrorCode, NetError, NetResult};
use crate::lifecycle::LifecycleManager;
use crate::startable::Startable;

const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

/// UDP client bound to one remote peer.
pub struct UdpClient {
    client_id: String,
    lifecycle: LifecycleManager,
    connected: AtomicBool,
    callbacks: UdpClientCallbacks,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    recv_abort: Mutex<Option<AbortHandle>>,
    weak_self: Weak<Self>,
}

impl UdpClient {
    pub fn new(client_id: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            client_id: client_id.into(),
            lifecycle: LifecycleManager::new(),
            connected: AtomicBool::new(false),
            callbacks: UdpClientCallbacks::default(),
            socket: Mutex::new(None),
            recv_abort: Mutex::new(None),
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

    pub async fn send_packet(&self, data: Vec<u8>) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetError::new(
                ErrorCode::ConnectionClosed,
                "client is not connected",
                "udp_client::send_packet",
            )
            .with_context(self.client_id.clone()));
        }
        if data.is_empty() {
            return Ok(());
        }

        let socket = self.socket.lock().clone();
        let Some(socket) = socket else {
            return Err(NetError::new(
                ErrorCode::ConnectionClosed,
                "socket already closed",
                "udp_client::send_packet",
            ));
        };
        socket.send(&data).await.map_err(|e| {
            NetError::new(
                ErrorCode::SendFailed,
                format!("datagram send failed: {e}"),
                "udp_client::send_packet",
            )
        })?;
        Ok(())
    }

    pub fn set_receive_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.callbacks.receive.set(Arc::new(callback));
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
impl Startable for UdpClient {
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
                "udp_client::start",
            ));
        }

        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(|e| {
            NetError::new(
                ErrorCode::BindFailed,
                format!("failed to bind local socket: {e}"),
                "udp_client::start",
            )
        })?;
        socket.connect((host.as_str(), port)).await.map_err(|e| {
            NetError::new(
                ErrorCode::ConnectionFailed,
                format!("failed to connect to {host}:{port}: {e}"),
                "udp_client::start",
            )
        })?;

        let socket = Arc::new(socket);
        *self.socket.lock() = Some(socket.clone());

        let weak = self.weak_self.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(n) => {
                        let Some(client) = weak.upgrade() else { break };
                        client.callbacks.receive.invoke_with(|cb| cb(&buf[..n]));
                    }
                    Err(e) => {
                        let Some(client) = weak.upgrade() else { break };
                        if client.lifecycle.is_stop_initiated() || !client.is_running() {
                            break;
                        }
                        let error = NetError::new(
                            ErrorCode::ConnectionClosed,
                            format!("datagram receive failed: {e}"),
                            "udp_client::recv",
                        );
                        log::error!("[{}] {error}", client.client_id);
                        client.callbacks.error.invoke_with(|cb| cb(&error));
                        tokio::spawn(async move {
                            let _ = client.stop_client().await;
                        });
                        break;
                    }
                }
            }
        });
        *self.recv_abort.lock() = Some(recv_task.abort_handle());

        self.connected.store(true, Ordering::Release);
        log::info!("[{}] bound towards {host}:{port}", self.client_id);
        self.callbacks.connected.invoke_with(|cb| cb());
        Ok(())
    }

    async fn do_stop_impl(&self) -> NetResult<()> {
        self.connected.store(false, Ordering::Release);
        *self.socket.lock() = None;
        if let Some(abort) = self.recv_abort.lock().take() {
            abort.abort();
        }
        Ok(())
    }

    async fn on_stopped(&self) {
        self.callbacks.disconnected.invoke_with(|cb| cb());
    }
}

/// UDP server delivering (peer, datagram) pairs to the receive callback.
pub struct UdpServer {
    server_id: String,
    lifecycle: LifecycleManager,
    callbacks: UdpServerCallbacks,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    recv_abort: Mutex<Option<AbortHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
    weak_self: Weak<Self>,
}

impl UdpServer {
    pub fn new(server_id: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            server_id: server_id.into(),
            lifecycle: LifecycleManager::new(),
            callbacks: UdpServerCallbacks::default(),
            socket: Mutex::new(None),
            recv_abort: Mutex::new(None),
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

    pub async fn send_to(&self, peer: SocketAddr, data: Vec<u8>) -> NetResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let socket = self.socket.lock().clone();
        let Some(socket) = socket else {
            return Err(NetError::new(
                ErrorCode::ServerNotStarted,
                "server is not running",
                "udp_server::send_to",
            )
            .with_context(self.server_id.clone()));
        };
        socket.send_to(&data, peer).await.map_err(|e| {
            NetError::new(
                ErrorCode::SendFailed,
                format!("datagram send to {peer} failed: {e}"),
                "udp_server::send_to",
            )
        })?;
        Ok(())
    }

    pub fn set_receive_callback(
        &self,
        callback: impl Fn(SocketAddr, &[u8]) + Send + Sync + 'static,
    ) {
        self.callbacks.receive.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(&NetError) + Send + Sync + 'static) {
        self.callbacks.error.set(Arc::new(callback));
    }
}

#[async_trait]
impl Startable for UdpServer {
    type StartArgs = u16;

    fn component_name(&self) -> &str {
        &self.server_id
    }

    fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    async fn do_start_impl(&self, port: u16) -> NetResult<()> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await.map_err(|e| {
            NetError::new(
                ErrorCode::BindFailed,
                format!("failed to bind port {port}: {e}"),
                "udp_server::start",
            )
            .with_context(self.server_id.clone())
        })?;

        let local_addr = socket.local_addr().map_err(|e| {
            NetError::new(
                ErrorCode::InternalError,
                format!("failed to read local address: {e}"),
                "udp_server::start",
            )
        })?;
        *self.local_addr.lock() = Some(local_addr);

        let socket = Arc::new(socket);
        *self.socket.lock() = Some(socket.clone());

        let weak = self.weak_self.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, peer)) => {
                        let Some(server) = weak.upgrade() else { break };
                        server
                            .callbacks
                            .receive
                            .invoke_with(|cb| cb(peer, &buf[..n]));
                    }
                    Err(e) => {
                        let Some(server) = weak.upgrade() else { break };
                        if !server.is_running() {
                            break;
                        }
                        let error = NetError::new(
                            ErrorCode::InternalError,
                            format!("datagram receive failed: {e}"),
                            "udp_server::recv",
                        );
                        log::error!("[{}] {error}", server.server_id);
                        server.callbacks.error.invoke_with(|cb| cb(&error));
                    }
                }
            }
        });
        *self.recv_abort.lock() = Some(recv_task.abort_handle());

        log::info!("[{}] listening on {local_addr}", self.server_id);
        Ok(())
    }

    async fn do_stop_impl(&self) -> NetResult<()> {
        *self.socket.lock() = None;
        if let Some(abort) = self.recv_abort.lock().take() {
            abort.abort();
        }
        *self.local_addr.lock() = None;
        Ok(())
    }
}
