//! TCP messaging client: resolve, connect, optional TLS handshake, read loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;

use crate::callback::TcpClientCallbacks;
use crate::error::{ErrorCode, NetError, NetResult};
use crate::lifecycle::LifecycleManager;
use crate::startable::Startable;
use crate::tls::{NoTls, Tls, TlsConfig, TlsPolicy};

const READ_BUFFER_SIZE: usize = 8192;

/// A messaging client over TCP, plain or TLS depending on the policy.
///
/// `running` and `connected` are independent: the client is running from
/// `start_client` until `stop_client`, and connected once the connect (and
/// handshake, when secured) completed. `start_client` awaits both, so a
/// successful return implies connected.
pub struct MessagingClient<P: TlsPolicy = NoTls> {
    client_id: String,
    lifecycle: LifecycleManager,
    connected: AtomicBool,
    callbacks: TcpClientCallbacks,
    writer: tokio::sync::Mutex<Option<WriteHalf<P::Stream>>>,
    read_abort: Mutex<Option<AbortHandle>>,
    policy: P,
    weak_self: Weak<Self>,
}

impl MessagingClient<NoTls> {
    pub fn new(client_id: impl Into<String>) -> Arc<Self> {
        Self::with_policy(client_id, NoTls)
    }
}

impl MessagingClient<Tls> {
    /// Secure variant; the TLS context is built from `config` up front.
    pub fn with_tls(client_id: impl Into<String>, config: &TlsConfig) -> NetResult<Arc<Self>> {
        Ok(Self::with_policy(client_id, Tls::client(config)?))
    }
}

impl<P: TlsPolicy> MessagingClient<P> {
    pub fn with_policy(client_id: impl Into<String>, policy: P) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            client_id: client_id.into(),
            lifecycle: LifecycleManager::new(),
            connected: AtomicBool::new(false),
            callbacks: TcpClientCallbacks::default(),
            writer: tokio::sync::Mutex::new(None),
            read_abort: Mutex::new(None),
            policy,
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

    /// Sends bytes to the peer. Fails with `connection_closed` when not
    /// connected; an empty payload is a no-op.
    pub async fn send_packet(&self, data: Vec<u8>) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetError::new(
                ErrorCode::ConnectionClosed,
                "client is not connected",
                "client::send_packet",
            )
            .with_context(self.client_id.clone()));
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(NetError::new(
                ErrorCode::ConnectionClosed,
                "socket already closed",
                "client::send_packet",
            ));
        };
        w.write_all(&data).await.map_err(|e| {
            NetError::new(
                ErrorCode::SendFailed,
                format!("socket write failed: {e}"),
                "client::send_packet",
            )
        })?;
        w.flush().await.map_err(|e| {
            NetError::new(
                ErrorCode::SendFailed,
                format!("socket flush failed: {e}"),
                "client::send_packet",
            )
        })
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

    fn spawn_read_loop(&self, mut reader: ReadHalf<P::Stream>) {
        let weak: Weak<Self> = self.weak_self.clone();
        let read_task = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        Self::handle_read_failure(&weak, None);
                        break;
                    }
                    Ok(n) => {
                        let Some(client) = weak.upgrade() else { break };
                        client.callbacks.receive.invoke_with(|cb| cb(&buf[..n]));
                    }
                    Err(e) => {
                        Self::handle_read_failure(&weak, Some(e));
                        break;
                    }
                }
            }
        });
        *self.read_abort.lock() = Some(read_task.abort_handle());
    }

    /// Read-loop termination: report the error if the user could observe it,
    /// then stop from a detached task (the read task itself gets aborted by
    /// the stop path).
    fn handle_read_failure(weak: &Weak<Self>, error: Option<std::io::Error>) {
        let Some(client) = weak.upgrade() else { return };
        if client.lifecycle.is_stop_initiated() || !client.is_running() {
            return;
        }

        let error = match error {
            Some(e) => NetError::new(
                ErrorCode::ConnectionClosed,
                format!("socket read failed: {e}"),
                "client::read",
            ),
            None => NetError::new(
                ErrorCode::ConnectionClosed,
                "connection closed by peer",
                "client::read",
            ),
        };
        log::error!("[{}] {error}", client.client_id);
        client.callbacks.error.invoke_with(|cb| cb(&error));

        tokio::spawn(async move {
            let _ = client.stop_client().await;
        });
    }
}

#[async_trait]
impl<P: TlsPolicy> Startable for MessagingClient<P> {
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
                "client::start",
            )
            .with_context(self.client_id.clone()));
        }

        let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| {
                NetError::new(
                    ErrorCode::ConnectionFailed,
                    format!("failed to resolve {host}:{port}: {e}"),
                    "client::start",
                )
            })?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::new(
                ErrorCode::ConnectionFailed,
                format!("no addresses for {host}:{port}"),
                "client::start",
            ));
        }

        let mut socket = None;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    socket = Some(stream);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let Some(socket) = socket else {
            return Err(NetError::new(
                ErrorCode::ConnectionFailed,
                format!(
                    "failed to connect to {host}:{port}: {}",
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                ),
                "client::start",
            ));
        };

        let stream = self.policy.connect(&host, socket).await?;
        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);
        self.spawn_read_loop(reader);

        self.connected.store(true, Ordering::Release);
        log::info!("[{}] connected to {host}:{port}", self.client_id);
        self.callbacks.connected.invoke_with(|cb| cb());
        Ok(())
    }

    async fn do_stop_impl(&self) -> NetResult<()> {
        self.connected.store(false, Ordering::Release);

        {
            let mut writer = self.writer.lock().await;
            if let Some(mut w) = writer.take() {
                if let Err(e) = w.shutdown().await {
                    log::debug!("[{}] error closing socket: {e}", self.client_id);
                }
            }
        }

        if let Some(abort) = self.read_abort.lock().take() {
            abort.abort();
        }

        log::info!("[{}] stopped", self.client_id);
        Ok(())
    }

    async fn on_stopped(&self) {
        self.callbacks.disconnected.invoke_with(|cb| cb());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MessagingServer;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn echo_server() -> (Arc<MessagingServer>, u16) {
        let server = MessagingServer::new("echo");
        server.set_receive_callback(|session, data| {
            session.send_packet(data.to_vec());
        });
        server.start_server(0).await.unwrap();
        let port = server.local_addr().unwrap().port();
        (server, port)
    }

    #[tokio::test]
    async fn connects_and_round_trips() {
        let (server, port) = echo_server().await;

        let client = MessagingClient::new("c1");
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        client.set_receive_callback(move |data| {
            received2.lock().extend_from_slice(data);
        });

        client.start_client("127.0.0.1", port).await.unwrap();
        assert!(client.is_running());
        assert!(client.is_connected());

        client.send_packet(b"round trip".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(&*received.lock(), b"round trip");

        client.stop_client().await.unwrap();
        assert!(!client.is_connected());
        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn empty_host_is_invalid_argument() {
        let client = MessagingClient::new("c2");
        let err = client.start_client("", 80).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn connect_failure_leaves_client_stopped() {
        // Bind a listener and drop it so the port is very likely closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = MessagingClient::new("c3");
        let err = client.start_client("127.0.0.1", port).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionFailed);
        assert!(!client.is_running());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn send_before_start_is_connection_closed() {
        let client = MessagingClient::new("c4");
        let err = client.send_packet(b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
    }

    #[tokio::test]
    async fn empty_send_is_noop() {
        let (server, port) = echo_server().await;
        let client = MessagingClient::new("c5");
        client.start_client("127.0.0.1", port).await.unwrap();
        client.send_packet(Vec::new()).await.unwrap();
        client.stop_client().await.unwrap();
        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_reports_already_exists() {
        let (server, port) = echo_server().await;
        let client = MessagingClient::new("c6");
        client.start_client("127.0.0.1", port).await.unwrap();

        let err = client.start_client("127.0.0.1", port).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);
        assert!(err.message.contains("c6 is already running"));

        client.stop_client().await.unwrap();
        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_fires_exactly_once() {
        let (server, port) = echo_server().await;
        let client = MessagingClient::new("c7");
        let disconnects = Arc::new(AtomicUsize::new(0));

        let disconnects2 = disconnects.clone();
        client.set_disconnected_callback(move || {
            disconnects2.fetch_add(1, Ordering::SeqCst);
        });

        client.start_client("127.0.0.1", port).await.unwrap();
        client.stop_client().await.unwrap();
        client.stop_client().await.unwrap();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn connected_precedes_receive() {
        let (server, port) = echo_server().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let client = MessagingClient::new("c8");
        let order2 = order.clone();
        client.set_connected_callback(move || {
            order2.lock().push("connected");
        });
        let order2 = order.clone();
        client.set_receive_callback(move |_data| {
            order2.lock().push("receive");
        });

        client.start_client("127.0.0.1", port).await.unwrap();
        client.send_packet(b"hi".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let order = order.lock();
            assert_eq!(order.first().copied(), Some("connected"));
            assert!(order.contains(&"receive"));
        }

        client.stop_client().await.unwrap();
        server.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn server_close_triggers_error_and_stop() {
        let (server, port) = echo_server().await;
        let client = MessagingClient::new("c9");
        let errors = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let errors2 = errors.clone();
        client.set_error_callback(move |_err| {
            errors2.fetch_add(1, Ordering::SeqCst);
        });
        let disconnects2 = disconnects.clone();
        client.set_disconnected_callback(move || {
            disconnects2.fetch_add(1, Ordering::SeqCst);
        });

        client.start_client("127.0.0.1", port).await.unwrap();
        server.stop_server().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!client.is_running());
    }
}
