//! netsys-core: a uniform messaging and connection layer over TCP, UDP,
//! WebSocket, and QUIC, in plain and TLS-secured variants.
//!
//! The crate is organised around a small set of shared pieces — the
//! [`lifecycle::LifecycleManager`], the [`callback`] registries, the
//! [`startable::Startable`] contract, and the [`compression`] pipeline —
//! with symmetric client/server facades per transport on top.

pub mod callback;
pub mod client;
pub mod compression;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod quic;
pub mod server;
pub mod session;
pub mod startable;
pub mod tls;
pub mod udp;
pub mod ws;

pub use client::MessagingClient;
pub use compression::{CompressionAlgorithm, CompressionPipeline};
pub use config::{Monitor, NetworkConfig, NetworkContext, RuntimeProfile};
pub use error::{ErrorCode, NetError, NetResult};
pub use server::MessagingServer;
pub use session::MessagingSession;
pub use startable::Startable;
pub use tls::{NoTls, Tls, TlsConfig, TlsPolicy};
