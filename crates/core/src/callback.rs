//! Per-component callback registries.
//!
//! Every slot hands out a copy of the stored callback under its mutex and
//! runs the copy with the mutex released, so a handler can re-register or
//! clear callbacks on the same component without deadlocking.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::NetError;

/// A single thread-safe callback slot.
pub struct CallbackSlot<F: ?Sized> {
    slot: Mutex<Option<Arc<F>>>,
}

impl<F: ?Sized> Default for CallbackSlot<F> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<F: ?Sized> CallbackSlot<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, callback: Arc<F>) {
        *self.slot.lock() = Some(callback);
    }

    /// Copy of the stored callback, taken under the lock.
    pub fn get(&self) -> Option<Arc<F>> {
        self.slot.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }

    /// Invokes the stored callback, if any. The mutex is not held while the
    /// callback runs.
    pub fn invoke_with(&self, call: impl FnOnce(&F)) {
        if let Some(callback) = self.get() {
            call(&callback);
        }
    }

    pub fn invoke_if(&self, condition: bool, call: impl FnOnce(&F)) {
        if condition {
            self.invoke_with(call);
        }
    }
}

pub type ReceiveCallback = dyn Fn(&[u8]) + Send + Sync;
pub type ConnectedCallback = dyn Fn() + Send + Sync;
pub type DisconnectedCallback = dyn Fn() + Send + Sync;
pub type ErrorCallback = dyn Fn(&NetError) + Send + Sync;

/// Callbacks for TCP clients: receive, connected, disconnected, error.
#[derive(Default)]
pub struct TcpClientCallbacks {
    pub receive: CallbackSlot<ReceiveCallback>,
    pub connected: CallbackSlot<ConnectedCallback>,
    pub disconnected: CallbackSlot<DisconnectedCallback>,
    pub error: CallbackSlot<ErrorCallback>,
}

impl TcpClientCallbacks {
    pub fn clear_all(&self) {
        self.receive.clear();
        self.connected.clear();
        self.disconnected.clear();
        self.error.clear();
    }
}

/// Callbacks for TCP servers: connection, disconnection, receive, error.
///
/// `S` is the session type the server hands to user code.
pub struct TcpServerCallbacks<S> {
    pub connection: CallbackSlot<dyn Fn(Arc<S>) + Send + Sync>,
    pub disconnection: CallbackSlot<dyn Fn(&str) + Send + Sync>,
    pub receive: CallbackSlot<dyn Fn(Arc<S>, &[u8]) + Send + Sync>,
    pub error: CallbackSlot<dyn Fn(Option<Arc<S>>, &NetError) + Send + Sync>,
}

impl<S> Default for TcpServerCallbacks<S> {
    fn default() -> Self {
        Self {
            connection: CallbackSlot::new(),
            disconnection: CallbackSlot::new(),
            receive: CallbackSlot::new(),
            error: CallbackSlot::new(),
        }
    }
}

impl<S> TcpServerCallbacks<S> {
    pub fn clear_all(&self) {
        self.connection.clear();
        self.disconnection.clear();
        self.receive.clear();
        self.error.clear();
    }
}

/// Callbacks for UDP clients. Connected fires right after a successful start;
/// plain UDP has no handshake to wait for.
#[derive(Default)]
pub struct UdpClientCallbacks {
    pub receive: CallbackSlot<ReceiveCallback>,
    pub connected: CallbackSlot<ConnectedCallback>,
    pub disconnected: CallbackSlot<DisconnectedCallback>,
    pub error: CallbackSlot<ErrorCallback>,
}

impl UdpClientCallbacks {
    pub fn clear_all(&self) {
        self.receive.clear();
        self.connected.clear();
        self.disconnected.clear();
        self.error.clear();
    }
}

/// Callbacks for UDP servers. Receive carries the peer address alongside the
/// datagram bytes.
#[derive(Default)]
pub struct UdpServerCallbacks {
    pub receive: CallbackSlot<dyn Fn(std::net::SocketAddr, &[u8]) + Send + Sync>,
    pub client_connected: CallbackSlot<dyn Fn(std::net::SocketAddr) + Send + Sync>,
    pub client_disconnected: CallbackSlot<dyn Fn(std::net::SocketAddr) + Send + Sync>,
    pub error: CallbackSlot<ErrorCallback>,
}

impl UdpServerCallbacks {
    pub fn clear_all(&self) {
        self.receive.clear();
        self.client_connected.clear();
        self.client_disconnected.clear();
        self.error.clear();
    }
}

/// Callbacks for WebSocket clients. `message` fires for both text and binary
/// frames, after the kind-specific callback.
#[derive(Default)]
pub struct WsClientCallbacks {
    pub message: CallbackSlot<ReceiveCallback>,
    pub text_message: CallbackSlot<dyn Fn(&str) + Send + Sync>,
    pub binary_message: CallbackSlot<ReceiveCallback>,
    pub connected: CallbackSlot<ConnectedCallback>,
    pub disconnected: CallbackSlot<DisconnectedCallback>,
    pub error: CallbackSlot<ErrorCallback>,
}

impl WsClientCallbacks {
    pub fn clear_all(&self) {
        self.message.clear();
        self.text_message.clear();
        self.binary_message.clear();
        self.connected.clear();
        self.disconnected.clear();
        self.error.clear();
    }
}

/// Callbacks for WebSocket servers.
pub struct WsServerCallbacks<S> {
    pub connection: CallbackSlot<dyn Fn(Arc<S>) + Send + Sync>,
    pub disconnection: CallbackSlot<dyn Fn(&str) + Send + Sync>,
    pub message: CallbackSlot<dyn Fn(Arc<S>, &[u8]) + Send + Sync>,
    pub text_message: CallbackSlot<dyn Fn(Arc<S>, &str) + Send + Sync>,
    pub binary_message: CallbackSlot<dyn Fn(Arc<S>, &[u8]) + Send + Sync>,
    pub error: CallbackSlot<dyn Fn(Option<Arc<S>>, &NetError) + Send + Sync>,
}

impl<S> Default for WsServerCallbacks<S> {
    fn default() -> Self {
        Self {
            connection: CallbackSlot::new(),
            disconnection: CallbackSlot::new(),
            message: CallbackSlot::new(),
            text_message: CallbackSlot::new(),
            binary_message: CallbackSlot::new(),
            error: CallbackSlot::new(),
        }
    }
}

impl<S> WsServerCallbacks<S> {
    pub fn clear_all(&self) {
        self.connection.clear();
        self.disconnection.clear();
        self.message.clear();
        self.text_message.clear();
        self.binary_message.clear();
        self.error.clear();
    }
}

/// Callbacks for QUIC clients. `receive` delivers datagrams, `stream_receive`
/// delivers whole uni-stream payloads.
#[derive(Default)]
pub struct QuicClientCallbacks {
    pub receive: CallbackSlot<ReceiveCallback>,
    pub stream_receive: CallbackSlot<ReceiveCallback>,
    pub connected: CallbackSlot<ConnectedCallback>,
    pub disconnected: CallbackSlot<DisconnectedCallback>,
    pub error: CallbackSlot<ErrorCallback>,
}

impl QuicClientCallbacks {
    pub fn clear_all(&self) {
        self.receive.clear();
        self.stream_receive.clear();
        self.connected.clear();
        self.disconnected.clear();
        self.error.clear();
    }
}

/// Callbacks for QUIC servers.
#[derive(Default)]
pub struct QuicServerCallbacks {
    pub connection: CallbackSlot<dyn Fn(std::net::SocketAddr) + Send + Sync>,
    pub disconnection: CallbackSlot<dyn Fn(std::net::SocketAddr) + Send + Sync>,
    pub receive: CallbackSlot<dyn Fn(std::net::SocketAddr, &[u8]) + Send + Sync>,
    pub stream_receive: CallbackSlot<dyn Fn(std::net::SocketAddr, &[u8]) + Send + Sync>,
    pub error: CallbackSlot<ErrorCallback>,
}

impl QuicServerCallbacks {
    pub fn clear_all(&self) {
        self.connection.clear();
        self.disconnection.clear();
        self.receive.clear();
        self.stream_receive.clear();
        self.error.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn invoke_runs_copy_without_holding_lock() {
        let slot: CallbackSlot<dyn Fn() + Send + Sync> = CallbackSlot::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = hits.clone();
        slot.set(Arc::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        slot.invoke_with(|cb| cb());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_replace_itself_while_running() {
        let slot: Arc<CallbackSlot<dyn Fn() + Send + Sync>> = Arc::new(CallbackSlot::new());
        let slot2 = slot.clone();
        // Re-registering from inside the callback must not deadlock.
        slot.set(Arc::new(move || {
            slot2.set(Arc::new(|| {}));
        }));
        slot.invoke_with(|cb| cb());
        assert!(slot.is_set());
    }

    #[test]
    fn clear_empties_the_slot() {
        let callbacks = TcpClientCallbacks::default();
        callbacks.receive.set(Arc::new(|_data: &[u8]| {}));
        callbacks.connected.set(Arc::new(|| {}));
        assert!(callbacks.receive.is_set());
        callbacks.clear_all();
        assert!(!callbacks.receive.is_set());
        assert!(!callbacks.connected.is_set());
    }

    #[test]
    fn invoke_if_respects_condition() {
        let slot: CallbackSlot<dyn Fn() + Send + Sync> = CallbackSlot::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        slot.set(Arc::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        slot.invoke_if(false, |cb| cb());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        slot.invoke_if(true, |cb| cb());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
