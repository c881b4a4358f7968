//! HTTP/1.1 server on top of the TCP messaging server.
//!
//! The TCP receive callback feeds each session's [`RequestBuffer`] until a
//! complete request exists, then the dispatcher parses it, runs the matching
//! route handler, and queues the serialised response on the session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use netsys_core::compression::{CompressionAlgorithm, CompressionPipeline};
use netsys_core::error::NetResult;
use netsys_core::server::MessagingServer;
use netsys_core::session::MessagingSession;
use netsys_core::tls::{NoTls, Tls, TlsConfig, TlsPolicy};

use crate::buffer::RequestBuffer;
use crate::error::{
    build_html_error, build_json_error, HttpError, HttpErrorCode,
};
use crate::parser::{parse_request, serialize_response};
use crate::router::{HttpHandler, HttpRequestContext, Router};
use crate::types::{HttpMethod, HttpRequest, HttpResponse};

pub type ErrorHandler = Arc<dyn Fn(&HttpError) -> HttpResponse + Send + Sync>;

const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpServer<P: TlsPolicy = NoTls> {
    tcp: Arc<MessagingServer<P>>,
    router: Router,
    buffers: Mutex<HashMap<u64, RequestBuffer>>,
    not_found_handler: Mutex<HttpHandler>,
    error_handlers: Mutex<HashMap<HttpErrorCode, ErrorHandler>>,
    default_error_handler: Mutex<Option<ErrorHandler>>,
    use_json_errors: AtomicBool,
    compression_enabled: AtomicBool,
    compression_threshold: AtomicUsize,
    request_timeout: Mutex<Duration>,
    weak_self: Weak<Self>,
}

impl<P: TlsPolicy> std::fmt::Debug for HttpServer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer").finish_non_exhaustive()
    }
}

impl HttpServer<NoTls> {
    pub fn new(server_id: impl Into<String>) -> Arc<Self> {
        Self::with_tcp_server(MessagingServer::new(server_id))
    }
}

impl HttpServer<Tls> {
    /// HTTPS variant; the TLS context is built from `config` up front.
    pub fn with_tls(server_id: impl Into<String>, config: &TlsConfig) -> NetResult<Arc<Self>> {
        Ok(Self::with_tcp_server(MessagingServer::with_tls(
            server_id, config,
        )?))
    }
}

impl<P: TlsPolicy> HttpServer<P> {
    fn with_tcp_server(tcp: Arc<MessagingServer<P>>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            tcp,
            router: Router::new(),
            buffers: Mutex::new(HashMap::new()),
            not_found_handler: Mutex::new(Arc::new(|_ctx: &HttpRequestContext| {
                Err(HttpError::new(HttpErrorCode::NotFound, "Not Found"))
            })),
            error_handlers: Mutex::new(HashMap::new()),
            default_error_handler: Mutex::new(None),
            use_json_errors: AtomicBool::new(false),
            compression_enabled: AtomicBool::new(false),
            compression_threshold: AtomicUsize::new(DEFAULT_COMPRESSION_THRESHOLD),
            request_timeout: Mutex::new(DEFAULT_REQUEST_TIMEOUT),
            weak_self: weak_self.clone(),
        })
    }

    pub fn server_id(&self) -> &str {
        self.tcp.server_id()
    }

    pub async fn start(&self, port: u16) -> NetResult<()> {
        let weak = self.weak_self.clone();
        self.tcp.set_receive_callback(move |session, chunk| {
            if let Some(server) = weak.upgrade() {
                server.on_chunk(session, chunk);
            }
        });
        self.tcp.start_server(port).await
    }

    pub async fn stop(&self) -> NetResult<()> {
        let result = self.tcp.stop_server().await;
        self.buffers.lock().clear();
        result
    }

    pub async fn wait_for_stop(&self) {
        self.tcp.wait_for_stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.tcp.is_running()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr()
    }

    // Route registration

    pub fn get(&self, pattern: &str, handler: impl IntoHandler) {
        self.router.add(HttpMethod::Get, pattern, handler.into_handler());
    }

    pub fn post(&self, pattern: &str, handler: impl IntoHandler) {
        self.router.add(HttpMethod::Post, pattern, handler.into_handler());
    }

    pub fn put(&self, pattern: &str, handler: impl IntoHandler) {
        self.router.add(HttpMethod::Put, pattern, handler.into_handler());
    }

    pub fn del(&self, pattern: &str, handler: impl IntoHandler) {
        self.router.add(HttpMethod::Delete, pattern, handler.into_handler());
    }

    pub fn patch(&self, pattern: &str, handler: impl IntoHandler) {
        self.router.add(HttpMethod::Patch, pattern, handler.into_handler());
    }

    pub fn head(&self, pattern: &str, handler: impl IntoHandler) {
        self.router.add(HttpMethod::Head, pattern, handler.into_handler());
    }

    pub fn options(&self, pattern: &str, handler: impl IntoHandler) {
        self.router.add(HttpMethod::Options, pattern, handler.into_handler());
    }

    // Handler and behaviour configuration

    pub fn set_not_found_handler(&self, handler: impl IntoHandler) {
        *self.not_found_handler.lock() = handler.into_handler();
    }

    /// Responder for one specific status code.
    pub fn set_error_handler(
        &self,
        code: HttpErrorCode,
        handler: impl Fn(&HttpError) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.error_handlers.lock().insert(code, Arc::new(handler));
    }

    pub fn set_default_error_handler(
        &self,
        handler: impl Fn(&HttpError) -> HttpResponse + Send + Sync + 'static,
    ) {
        *self.default_error_handler.lock() = Some(Arc::new(handler));
    }

    /// Switches built-in error responses between RFC 7807 JSON and HTML.
    pub fn set_json_error_responses(&self, enabled: bool) {
        self.use_json_errors.store(enabled, Ordering::Relaxed);
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.compression_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_compression_threshold(&self, threshold: usize) {
        self.compression_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Total-request timeout surfaced to clients of this server's facade.
    /// Enforcement lives in the HTTP client; the server stores the knob.
    pub fn set_request_timeout(&self, timeout: Duration) {
        *self.request_timeout.lock() = timeout;
    }

    pub fn request_timeout(&self) -> Duration {
        *self.request_timeout.lock()
    }

    // Receive path

    fn on_chunk(&self, session: Arc<MessagingSession<P::Stream>>, chunk: &[u8]) {
        let session_id = session.id();

        let outcome = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.entry(session_id).or_default();

            if !buffer.append(chunk) {
                let over_total = buffer.over_request_size(chunk.len());
                buffers.remove(&session_id);
                Some(Err(if over_total {
                    HttpError::new(HttpErrorCode::PayloadTooLarge, "Payload Too Large")
                } else {
                    HttpError::new(
                        HttpErrorCode::RequestHeaderFieldsTooLarge,
                        "Request Header Fields Too Large",
                    )
                }))
            } else if buffer.is_complete() {
                let buffer = buffers.remove(&session_id).unwrap_or_default();
                Some(Ok(buffer.data))
            } else {
                None
            }
        };

        let (response_bytes, close_after) = match outcome {
            None => return,
            Some(Ok(request_data)) => self.process_complete_request(&request_data),
            Some(Err(error)) => {
                let response = self.finish_response(self.build_error_response(&error), None);
                (serialize_response(&response), true)
            }
        };

        tokio::spawn(async move {
            if let Err(e) = session.send_packet_sync(response_bytes).await {
                log::warn!("[session {}] failed to send response: {e}", session.id());
                return;
            }
            if close_after {
                session.stop_session().await;
            }
        });
    }

    /// Parses and dispatches one complete request, returning the serialised
    /// response and whether the connection closes afterwards.
    fn process_complete_request(&self, request_data: &[u8]) -> (Vec<u8>, bool) {
        let request = match parse_request(request_data) {
            Ok(request) => request,
            Err(e) => {
                let error = HttpError::new(HttpErrorCode::BadRequest, "Bad Request")
                    .with_detail(e.message);
                let response = self.finish_response(self.build_error_response(&error), None);
                return (serialize_response(&response), true);
            }
        };

        let response = self.dispatch(request);
        // Connection: close is the default; a handler opting into keep-alive
        // keeps the session open for the next request.
        let close_after = !response
            .header("Connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("keep-alive"));
        (serialize_response(&response), close_after)
    }

    fn dispatch(&self, request: HttpRequest) -> HttpResponse {
        let mut ctx = HttpRequestContext::new(request);

        let handler = match self.router.find(ctx.request.method, &ctx.request.uri) {
            Some((handler, params)) => {
                ctx.path_params = params;
                handler
            }
            None => self.not_found_handler.lock().clone(),
        };

        let result = catch_unwind(AssertUnwindSafe(|| handler(&ctx)));
        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => self.build_error_response(&error),
            Err(_panicked) => {
                log::error!(
                    "handler for {} {} panicked",
                    ctx.request.method.as_str(),
                    ctx.request.uri
                );
                self.build_error_response(&HttpError::internal("handler failed"))
            }
        };

        self.finish_response(response, Some(&ctx.request))
    }

    /// Applies response compression and the default headers.
    fn finish_response(
        &self,
        mut response: HttpResponse,
        request: Option<&HttpRequest>,
    ) -> HttpResponse {
        if let Some(request) = request {
            self.apply_compression(request, &mut response);
        }

        if response.header("Content-Length").is_none() {
            let length = response.body.len().to_string();
            response.set_header("Content-Length", &length);
        }
        if response.header("Server").is_none() {
            response.set_header("Server", "NetworkSystem-HTTP-Server/1.0");
        }
        if response.header("Connection").is_none() {
            response.set_header("Connection", "close");
        }
        response
    }

    fn apply_compression(&self, request: &HttpRequest, response: &mut HttpResponse) {
        if !self.compression_enabled.load(Ordering::Relaxed) {
            return;
        }
        if response.body.len() <= self.compression_threshold.load(Ordering::Relaxed) {
            return;
        }
        let Some(accept_encoding) = request.header("Accept-Encoding") else {
            return;
        };
        let Some(algorithm) = choose_compression_algorithm(accept_encoding) else {
            return;
        };

        let pipeline = CompressionPipeline::new(algorithm, 0);
        match pipeline.compress(&response.body) {
            Ok(compressed) if compressed.len() < response.body.len() => {
                response.body = compressed;
                response.set_header("Content-Encoding", algorithm.as_str());
                let length = response.body.len().to_string();
                response.set_header("Content-Length", &length);
            }
            Ok(_) => {}
            Err(e) => log::warn!("response compression failed: {e}"),
        }
    }

    #[cfg(test)]
    fn respond(&self, request_data: &[u8]) -> Vec<u8> {
        self.process_complete_request(request_data).0
    }

    fn build_error_response(&self, error: &HttpError) -> HttpResponse {
        if let Some(handler) = self.error_handlers.lock().get(&error.code) {
            return handler(error);
        }
        if let Some(handler) = self.default_error_handler.lock().as_ref() {
            return handler(error);
        }
        if self.use_json_errors.load(Ordering::Relaxed) {
            build_json_error(error)
        } else {
            build_html_error(error)
        }
    }
}

/// Accepts both fallible and infallible route handlers.
pub trait IntoHandler {
    fn into_handler(self) -> HttpHandler;
}

impl<F> IntoHandler for F
where
    F: Fn(&HttpRequestContext) -> Result<HttpResponse, HttpError> + Send + Sync + 'static,
{
    fn into_handler(self) -> HttpHandler {
        Arc::new(self)
    }
}

/// First supported token in the Accept-Encoding header, in header order.
fn choose_compression_algorithm(accept_encoding: &str) -> Option<CompressionAlgorithm> {
    for token in accept_encoding.split(',') {
        let name = token.split(';').next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case("gzip") {
            return Some(CompressionAlgorithm::Gzip);
        }
        if name.eq_ignore_ascii_case("deflate") {
            return Some(CompressionAlgorithm::Deflate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_response;

    fn plain_server() -> Arc<HttpServer> {
        HttpServer::new("http-test")
    }

    fn request_bytes(raw: &str) -> Vec<u8> {
        raw.as_bytes().to_vec()
    }

    #[tokio::test]
    async fn dispatches_to_registered_route() {
        let server = plain_server();
        server.get("/", |_ctx: &HttpRequestContext| {
            Ok(HttpResponse::ok().with_body("text/plain", "Hello, World!"))
        });

        let raw = server.respond(&request_bytes("GET / HTTP/1.1\r\n\r\n"));
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body_string(), "Hello, World!");
        assert_eq!(response.header("Content-Length"), Some("13"));
        assert_eq!(
            response.header("Server"),
            Some("NetworkSystem-HTTP-Server/1.0")
        );
        assert_eq!(response.header("Connection"), Some("close"));
    }

    #[tokio::test]
    async fn path_params_reach_the_handler() {
        let server = plain_server();
        server.get("/users/:id", |ctx: &HttpRequestContext| {
            let id = ctx.path_param("id").unwrap_or("?");
            Ok(HttpResponse::ok().with_body("text/plain", format!("User ID: {id}")))
        });

        let raw =
            server.respond(&request_bytes("GET /users/42 HTTP/1.1\r\n\r\n"));
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.body_string(), "User ID: 42");
    }

    #[tokio::test]
    async fn unknown_route_yields_404_with_body() {
        let server = plain_server();
        let raw =
            server.respond(&request_bytes("GET /nonexistent HTTP/1.1\r\n\r\n"));
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.status_code, 404);
        assert!(!response.body.is_empty());
    }

    #[tokio::test]
    async fn malformed_request_yields_400() {
        let server = plain_server();
        let raw = server.respond(b"NONSENSE\r\n\r\n");
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.status_code, 400);
    }

    #[tokio::test]
    async fn handler_error_routes_to_500() {
        let server = plain_server();
        server.get("/boom", |_ctx: &HttpRequestContext| {
            Err(HttpError::internal("the handler gave up"))
        });

        let raw = server.respond(&request_bytes("GET /boom HTTP/1.1\r\n\r\n"));
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.status_code, 500);
    }

    #[tokio::test]
    async fn handler_panic_routes_to_500() {
        let server = plain_server();
        server.get("/panic", |_ctx: &HttpRequestContext| panic!("unreachable state"));

        let raw = server.respond(&request_bytes("GET /panic HTTP/1.1\r\n\r\n"));
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.status_code, 500);
    }

    #[tokio::test]
    async fn per_code_error_handler_overrides_default() {
        let server = plain_server();
        server.set_error_handler(HttpErrorCode::NotFound, |_error| {
            HttpResponse::new(404).with_body("text/plain", "custom not found")
        });

        let raw = server.respond(&request_bytes("GET /nope HTTP/1.1\r\n\r\n"));
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.body_string(), "custom not found");
    }

    #[tokio::test]
    async fn json_error_flag_switches_format() {
        let server = plain_server();
        server.set_json_error_responses(true);

        let raw = server.respond(&request_bytes("GET /nope HTTP/1.1\r\n\r\n"));
        let response = parse_response(&raw).unwrap();
        assert_eq!(
            response.header("Content-Type"),
            Some("application/problem+json; charset=utf-8")
        );
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["status"], 404);
    }

    #[tokio::test]
    async fn response_compression_honours_accept_encoding() {
        let server = plain_server();
        server.set_compression_enabled(true);
        let body: String = "compress me ".repeat(500);
        let body2 = body.clone();
        server.get("/big", move |_ctx: &HttpRequestContext| {
            Ok(HttpResponse::ok().with_body("text/plain", body2.clone()))
        });

        let raw = server.respond(&request_bytes(
            "GET /big HTTP/1.1\r\nAccept-Encoding: gzip, deflate\r\n\r\n",
        ));
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.header("Content-Encoding"), Some("gzip"));
        assert!(response.body.len() < body.len());
        assert_eq!(
            response.header("Content-Length"),
            Some(response.body.len().to_string().as_str())
        );

        // Without Accept-Encoding the body stays verbatim.
        let raw = server.respond(&request_bytes("GET /big HTTP/1.1\r\n\r\n"));
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.header("Content-Encoding"), None);
        assert_eq!(response.body_string(), body);
    }

    #[tokio::test]
    async fn small_bodies_skip_compression() {
        let server = plain_server();
        server.set_compression_enabled(true);
        server.get("/small", |_ctx: &HttpRequestContext| {
            Ok(HttpResponse::ok().with_body("text/plain", "tiny"))
        });

        let raw = server.respond(&request_bytes(
            "GET /small HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n",
        ));
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.header("Content-Encoding"), None);
        assert_eq!(response.body_string(), "tiny");
    }

    #[test]
    fn accept_encoding_tokens_are_matched_in_order() {
        assert_eq!(
            choose_compression_algorithm("gzip, deflate"),
            Some(CompressionAlgorithm::Gzip)
        );
        assert_eq!(
            choose_compression_algorithm("deflate, gzip"),
            Some(CompressionAlgorithm::Deflate)
        );
        assert_eq!(
            choose_compression_algorithm("br;q=1.0, gzip;q=0.8"),
            Some(CompressionAlgorithm::Gzip)
        );
        assert_eq!(choose_compression_algorithm("br, zstd"), None);
    }
}
