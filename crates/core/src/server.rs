//! TCP messaging server: acceptor loop, session registry, periodic sweep.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

use crate::callback::TcpServerCallbacks;
use crate::config::Monitor;
use crate::error::{ErrorCode, NetError, NetResult};
use crate::lifecycle::LifecycleManager;
use crate::session::MessagingSession;
use crate::startable::Startable;
use crate::tls::{NoTls, Tls, TlsConfig, TlsPolicy};

/// Interval of the dead-session sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// A server that accepts TCP connections and wraps each one in a
/// [`MessagingSession`]. Parameterised over the TLS policy: with [`Tls`] the
/// session only becomes visible to user callbacks after a successful
/// handshake.
///
/// Callbacks fire from the server's I/O tasks. No internal lock is held
/// while user code runs; lock order is acceptor → sessions → per-session.
pub struct MessagingServer<P: TlsPolicy = NoTls> {
    server_id: String,
    lifecycle: LifecycleManager,
    callbacks: TcpServerCallbacks<MessagingSession<P::Stream>>,
    sessions: Mutex<Vec<Arc<MessagingSession<P::Stream>>>>,
    accept_abort: Mutex<Option<AbortHandle>>,
    cleanup_abort: Mutex<Option<AbortHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
    monitor: Mutex<Option<Arc<dyn Monitor>>>,
    policy: P,
    weak_self: Weak<Self>,
}

impl MessagingServer<NoTls> {
    pub fn new(server_id: impl Into<String>) -> Arc<Self> {
        Self::with_policy(server_id, NoTls)
    }
}

impl MessagingServer<Tls> {
    /// Secure variant; the TLS context is built from `config` up front.
    pub fn with_tls(server_id: impl Into<String>, config: &TlsConfig) -> NetResult<Arc<Self>> {
        Ok(Self::with_policy(server_id, Tls::server(config)?))
    }
}

impl<P: TlsPolicy> MessagingServer<P> {
    pub fn with_policy(server_id: impl Into<String>, policy: P) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            server_id: server_id.into(),
            lifecycle: LifecycleManager::new(),
            callbacks: TcpServerCallbacks::default(),
            sessions: Mutex::new(Vec::new()),
            accept_abort: Mutex::new(None),
            cleanup_abort: Mutex::new(None),
            local_addr: Mutex::new(None),
            monitor: Mutex::new(None),
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

    /// Address the acceptor is bound to, once running. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn set_connection_callback(
        &self,
        callback: impl Fn(Arc<MessagingSession<P::Stream>>) + Send + Sync + 'static,
    ) {
        self.callbacks.connection.set(Arc::new(callback));
    }

    pub fn set_disconnection_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.disconnection.set(Arc::new(callback));
    }

    pub fn set_receive_callback(
        &self,
        callback: impl Fn(Arc<MessagingSession<P::Stream>>, &[u8]) + Send + Sync + 'static,
    ) {
        self.callbacks.receive.set(Arc::new(callback));
    }

    pub fn set_error_callback(
        &self,
        callback: impl Fn(Option<Arc<MessagingSession<P::Stream>>>, &NetError) + Send + Sync + 'static,
    ) {
        self.callbacks.error.set(Arc::new(callback));
    }

    pub fn set_monitor(&self, monitor: Arc<dyn Monitor>) {
        *self.monitor.lock() = Some(monitor);
    }

    fn incr_metric(&self, name: &str) {
        if let Some(monitor) = self.monitor.lock().clone() {
            monitor.incr(name);
        }
    }

    fn record_metric(&self, name: &str, value: f64) {
        if let Some(monitor) = self.monitor.lock().clone() {
            monitor.record(name, value);
        }
    }

    async fn on_accept(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let stream = match self.policy.accept(socket).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!(
                    "[{}] handshake with {peer} failed, dropping connection: {e}",
                    self.server_id
                );
                self.incr_metric("connection_errors");
                return;
            }
        };

        let session = Arc::new(MessagingSession::new(stream, self.server_id.clone()));

        // Session callbacks funnel into the server-level registry. Weak
        // handles on both sides keep the callbacks from extending lifetimes.
        let weak_server = self.weak_self.clone();
        let weak_session = Arc::downgrade(&session);
        session.set_receive_callback(move |data| {
            let (Some(server), Some(session)) = (weak_server.upgrade(), weak_session.upgrade())
            else {
                return;
            };
            server.incr_metric("messages_received");
            server
                .callbacks
                .receive
                .invoke_with(|cb| cb(session.clone(), data));
        });

        let weak_server = self.weak_self.clone();
        session.set_disconnection_callback(move |server_id| {
            if let Some(server) = weak_server.upgrade() {
                server
                    .callbacks
                    .disconnection
                    .invoke_with(|cb| cb(server_id));
            }
        });

        let weak_server = self.weak_self.clone();
        let weak_session = Arc::downgrade(&session);
        session.set_error_callback(move |error| {
            if let Some(server) = weak_server.upgrade() {
                let session = weak_session.upgrade();
                server
                    .callbacks
                    .error
                    .invoke_with(|cb| cb(session.clone(), error));
            }
        });

        let active = {
            let mut sessions = self.sessions.lock();
            sessions.push(session.clone());
            sessions.len()
        };
        self.record_metric("active_connections", active as f64);

        log::debug!("[{}] accepted connection from {peer}", self.server_id);
        self.callbacks
            .connection
            .invoke_with(|cb| cb(session.clone()));
        session.start_session();
    }

    fn cleanup_dead_sessions(&self) {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|session| !session.is_stopped());
        let after = sessions.len();
        drop(sessions);

        if after != before {
            log::debug!(
                "[{}] swept {} stopped session(s)",
                self.server_id,
                before - after
            );
            self.record_metric("active_connections", after as f64);
        }
    }
}

#[async_trait]
impl<P: TlsPolicy> Startable for MessagingServer<P> {
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
                "server::start",
            )
            .with_context(self.server_id.clone())
        })?;

        let local_addr = listener.local_addr().map_err(|e| {
            NetError::new(
                ErrorCode::InternalError,
                format!("failed to read local address: {e}"),
                "server::start",
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
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            // The first tick completes immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(server) = weak.upgrade() else { break };
                server.cleanup_dead_sessions();
            }
        });
        *self.cleanup_abort.lock() = Some(cleanup_task.abort_handle());

        log::info!("[{}] listening on {local_addr}", self.server_id);
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
            session.stop_session().await;
        }

        *self.local_addr.lock() = None;
        log::info!("[{}] stopped", self.server_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordingMonitor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn started_server() -> (Arc<MessagingServer>, SocketAddr) {
        let server = MessagingServer::new("test-server");
        server.start_server(0).await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn double_start_reports_already_exists() {
        let (server, _addr) = started_server().await;
        let err = server.start_server(0).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);
        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_reports_bind_failed_and_rolls_back() {
        let (server, addr) = started_server().await;

        let other = MessagingServer::new("other");
        let err = other.start_server(addr.port()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BindFailed);
        assert!(!other.is_running());

        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn echoes_bytes_through_session() {
        let (server, addr) = started_server().await;
        server.set_receive_callback(|session, data| {
            session.send_packet(data.to_vec());
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");

        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn connection_callback_precedes_receive() {
        let (server, addr) = started_server().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let order2 = order.clone();
        server.set_connection_callback(move |_session| {
            order2.lock().push("connection");
        });
        let order2 = order.clone();
        server.set_receive_callback(move |_session, _data| {
            order2.lock().push("receive");
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let order = order.lock();
        assert_eq!(order.first().map(|s| *s), Some("connection"));
        assert!(order.contains(&"receive"));

        drop(order);
        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn stop_empties_session_list_and_disconnects() {
        let (server, addr) = started_server().await;
        let disconnections = Arc::new(AtomicUsize::new(0));

        let disconnections2 = disconnections.clone();
        server.set_disconnection_callback(move |_server_id| {
            disconnections2.fetch_add(1, Ordering::SeqCst);
        });

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.session_count(), 2);

        server.stop_server().await.unwrap();
        assert_eq!(server.session_count(), 0);
        assert_eq!(disconnections.load(Ordering::SeqCst), 2);

        // A second stop is idempotent and fires nothing further.
        server.stop_server().await.unwrap();
        assert_eq!(disconnections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn monitor_sees_received_messages() {
        let (server, addr) = started_server().await;
        let monitor = Arc::new(RecordingMonitor::new());
        server.set_monitor(monitor.clone());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"metric me").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(monitor.counter("messages_received") >= 1);
        assert_eq!(monitor.value("active_connections"), Some(1.0));

        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_stop_works() {
        let (server, _addr) = started_server().await;
        server.stop_server().await.unwrap();
        server.start_server(0).await.unwrap();
        assert!(server.is_running());
        server.stop_server().await.unwrap();
    }
}
