//! Per-connection session: lifetime, bounded receive queue, backpressure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::callback::{CallbackSlot, ErrorCallback, ReceiveCallback};
use crate::compression::CompressionPipeline;
use crate::error::{ErrorCode, NetError, NetResult};

/// Queue length at which the session starts logging backpressure warnings.
pub const QUEUE_WARN_LIMIT: usize = 1000;
/// Queue length at which the session disconnects the peer.
pub const QUEUE_DISCONNECT_LIMIT: usize = 2000;

const READ_BUFFER_SIZE: usize = 8192;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Transform flags applied on the send path. Compression runs through the
/// session's [`CompressionPipeline`]; encryption is carried by the TLS layer
/// below the session, the flag only records the caller's intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineMode {
    pub compress: bool,
    pub encrypt: bool,
}

/// One accepted connection, as seen by the server side.
///
/// Owns the socket halves, a bounded queue of received chunks, and the user
/// callbacks. Received bytes are copied into the queue on the read task; a
/// separate processing task drains the queue one message at a time and runs
/// the receive callback, so a slow consumer makes the queue grow instead of
/// stalling the socket. At [`QUEUE_WARN_LIMIT`] the session logs a warning;
/// at [`QUEUE_DISCONNECT_LIMIT`] it disconnects the peer.
pub struct MessagingSession<S> {
    id: u64,
    server_id: String,
    is_stopped: AtomicBool,
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<S>>>,
    read_abort: Mutex<Option<AbortHandle>>,
    process_abort: Mutex<Option<AbortHandle>>,
    pending: Mutex<VecDeque<Vec<u8>>>,
    process_notify: Arc<Notify>,
    mode: Mutex<PipelineMode>,
    pipeline: CompressionPipeline,
    pub(crate) receive_callback: CallbackSlot<ReceiveCallback>,
    pub(crate) disconnection_callback: CallbackSlot<dyn Fn(&str) + Send + Sync>,
    pub(crate) error_callback: CallbackSlot<ErrorCallback>,
}

impl<S> MessagingSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, server_id: impl Into<String>) -> Self {
        Self::with_pipeline(stream, server_id, CompressionPipeline::passthrough())
    }

    pub fn with_pipeline(
        stream: S,
        server_id: impl Into<String>,
        pipeline: CompressionPipeline,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            server_id: server_id.into(),
            is_stopped: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            read_abort: Mutex::new(None),
            process_abort: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            process_notify: Arc::new(Notify::new()),
            mode: Mutex::new(PipelineMode::default()),
            pipeline,
            receive_callback: CallbackSlot::new(),
            disconnection_callback: CallbackSlot::new(),
            error_callback: CallbackSlot::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopped.load(Ordering::Acquire)
    }

    /// Enables payload compression on the send path.
    ///
    /// The wire carries no compressed-or-not indicator; both ends must agree
    /// on the mode. A receiver in compress mode attempts to decompress and
    /// falls back to the raw bytes when the frame does not decode (the
    /// compressor keeps incompressible payloads verbatim).
    pub fn set_compress_mode(&self, enabled: bool) {
        self.mode.lock().compress = enabled;
    }

    pub fn set_encrypt_mode(&self, enabled: bool) {
        self.mode.lock().encrypt = enabled;
    }

    pub fn set_receive_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.receive_callback.set(Arc::new(callback));
    }

    pub fn set_disconnection_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.disconnection_callback.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(&NetError) + Send + Sync + 'static) {
        self.error_callback.set(Arc::new(callback));
    }

    /// Wires the read and processing tasks and begins reading.
    ///
    /// Both tasks hold only a weak handle to the session so the session's
    /// own callbacks cannot keep it alive.
    pub fn start_session(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let Some(mut reader) = self.reader.lock().take() else {
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let read_task = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        if let Some(session) = weak.upgrade() {
                            session
                                .on_error(NetError::new(
                                    ErrorCode::ConnectionClosed,
                                    "connection closed by peer",
                                    "session::read",
                                ))
                                .await;
                        }
                        break;
                    }
                    Ok(n) => {
                        let Some(session) = weak.upgrade() else { break };
                        session.on_receive(&buf[..n]).await;
                    }
                    Err(e) => {
                        if let Some(session) = weak.upgrade() {
                            session
                                .on_error(NetError::new(
                                    ErrorCode::ConnectionClosed,
                                    format!("socket read failed: {e}"),
                                    "session::read",
                                ))
                                .await;
                        }
                        break;
                    }
                }
            }
        });
        *self.read_abort.lock() = Some(read_task.abort_handle());

        let weak: Weak<Self> = Arc::downgrade(self);
        let notify = self.process_notify.clone();
        let process_task = tokio::spawn(async move {
            loop {
                let notified = notify.notified();
                loop {
                    let Some(session) = weak.upgrade() else { return };
                    if session.is_stopped() {
                        return;
                    }
                    if !session.process_next_message() {
                        break;
                    }
                }
                notified.await;
            }
        });
        *self.process_abort.lock() = Some(process_task.abort_handle());

        log::info!("[session {}] started on server {}", self.id, self.server_id);
    }

    /// Stops the session: cancels reads, closes the socket (absorbing
    /// errors), and fires the disconnection callback exactly once.
    pub async fn stop_session(&self) {
        if self.is_stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut writer = self.writer.lock().await;
            if let Some(mut w) = writer.take() {
                if let Err(e) = w.shutdown().await {
                    log::debug!("[session {}] error closing socket: {e}", self.id);
                }
            }
        }

        self.disconnection_callback
            .invoke_with(|cb| cb(&self.server_id));

        // Aborting last lets a read task that initiated its own stop finish
        // this function before the cancellation lands.
        if let Some(abort) = self.read_abort.lock().take() {
            abort.abort();
        }
        if let Some(abort) = self.process_abort.lock().take() {
            abort.abort();
        }

        log::info!("[session {}] stopped", self.id);
    }

    /// Fire-and-forget send. Returns silently when the session is stopped;
    /// write errors are reported through the error callback.
    pub fn send_packet(self: &Arc<Self>, data: Vec<u8>) {
        if self.is_stopped() {
            log::debug!("[session {}] send_packet on stopped session", self.id);
            return;
        }
        if data.is_empty() {
            return;
        }

        let mode = *self.mode.lock();
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.write_through_pipeline(data, mode).await {
                log::error!("[session {}] send error: {e}", session.id);
                session.error_callback.invoke_with(|cb| cb(&e));
            }
        });
    }

    /// Synchronous-completion send used by the HTTP response path. Writes
    /// the bytes verbatim (no pipeline) and reports failures to the caller.
    pub async fn send_packet_sync(&self, data: Vec<u8>) -> NetResult<()> {
        if self.is_stopped() {
            return Err(NetError::new(
                ErrorCode::ConnectionClosed,
                "session is stopped",
                "session::send_packet_sync",
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.write_all(&data).await
    }

    async fn write_through_pipeline(&self, data: Vec<u8>, mode: PipelineMode) -> NetResult<()> {
        let payload = if mode.compress {
            self.pipeline.compress(&data)?
        } else {
            data
        };
        self.write_all(&payload).await
    }

    async fn write_all(&self, payload: &[u8]) -> NetResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(NetError::new(
                ErrorCode::ConnectionClosed,
                "socket already closed",
                "session::write",
            ));
        };
        w.write_all(payload).await.map_err(|e| {
            NetError::new(
                ErrorCode::SendFailed,
                format!("socket write failed: {e}"),
                "session::write",
            )
        })?;
        w.flush().await.map_err(|e| {
            NetError::new(
                ErrorCode::SendFailed,
                format!("socket flush failed: {e}"),
                "session::write",
            )
        })
    }

    pub(crate) async fn on_receive(&self, data: &[u8]) {
        if self.is_stopped() {
            return;
        }

        let overflow = {
            let mut queue = self.pending.lock();
            let queue_size = queue.len();
            if queue_size >= QUEUE_WARN_LIMIT {
                tracing::warn!(
                    session = self.id,
                    queue_size,
                    "receive queue reached limit ({QUEUE_WARN_LIMIT}), applying backpressure"
                );
            }
            if queue_size >= QUEUE_DISCONNECT_LIMIT {
                true
            } else {
                queue.push_back(data.to_vec());
                false
            }
        };

        if overflow {
            tracing::error!(session = self.id, "receive queue overflow, disconnecting abusive peer");
            self.stop_session().await;
            return;
        }

        self.process_notify.notify_one();
    }

    /// Pops one queued message and runs the receive callback. Returns false
    /// when the queue was empty.
    fn process_next_message(&self) -> bool {
        let Some(message) = self.pending.lock().pop_front() else {
            return false;
        };

        let message = if self.mode.lock().compress {
            // No wire-level indicator: fall back to the raw bytes when the
            // frame does not decode.
            self.pipeline.decompress(&message).unwrap_or(message)
        } else {
            message
        };

        self.receive_callback.invoke_with(|cb| cb(&message));
        true
    }

    pub(crate) async fn on_error(&self, error: NetError) {
        if self.is_stopped() {
            return;
        }
        log::error!("[session {}] socket error: {error}", self.id);
        self.error_callback.invoke_with(|cb| cb(&error));
        self.stop_session().await;
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl<S> Drop for MessagingSession<S> {
    fn drop(&mut self) {
        if let Some(abort) = self.read_abort.get_mut().take() {
            abort.abort();
        }
        if let Some(abort) = self.process_abort.get_mut().take() {
            abort.abort();
        }
    }
}
