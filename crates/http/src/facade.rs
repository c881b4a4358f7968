//! Validated constructors for HTTP clients and servers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netsys_core::error::{ErrorCode, NetError, NetResult};

use crate::client::HttpClient;
use crate::server::HttpServer;

static SERVER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Configuration for [`HttpFacade::create_client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client identifier; auto-generated when empty.
    pub client_id: String,
    /// Total-request timeout.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for [`HttpFacade::create_server`].
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub port: u16,
    /// Server identifier; auto-generated when empty.
    pub server_id: String,
}

/// Stamps out HTTP clients and servers with validated configs and
/// zero-padded identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFacade;

impl HttpFacade {
    pub fn new() -> Self {
        Self
    }

    pub fn create_client(&self, config: ClientConfig) -> NetResult<HttpClient> {
        if config.timeout.is_zero() {
            return Err(NetError::new(
                ErrorCode::InvalidArgument,
                "timeout must be positive",
                "http_facade::create_client",
            ));
        }
        let client_id = if config.client_id.is_empty() {
            generate_client_id()
        } else {
            config.client_id
        };
        Ok(HttpClient::with_timeout(client_id, config.timeout))
    }

    /// The server is constructed but not started; call `start` with
    /// `config.port`.
    pub fn create_server(&self, config: ServerConfig) -> NetResult<(Arc<HttpServer>, u16)> {
        if config.port == 0 {
            return Err(NetError::new(
                ErrorCode::InvalidArgument,
                "port must be between 1 and 65535",
                "http_facade::create_server",
            ));
        }
        let server_id = if config.server_id.is_empty() {
            generate_server_id()
        } else {
            config.server_id
        };
        Ok((HttpServer::new(server_id), config.port))
    }
}

fn generate_server_id() -> String {
    let id = SERVER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("http_server_{id:08}")
}

fn generate_client_id() -> String {
    let id = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("http_client_{id:08}")
}
