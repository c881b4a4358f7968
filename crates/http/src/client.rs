//! HTTP/1.1 client: one messaging client per request, Content-Length
//! response assembly, and a total-request timeout.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::Notify;

use netsys_core::client::MessagingClient;
use netsys_core::error::{ErrorCode, NetError, NetResult};

use crate::parser::{parse_query_string, parse_response, serialize_request};
use crate::types::{HttpMethod, HttpRequest, HttpResponse, HttpVersion};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// Parsed `scheme://host[:port][/path][?query]` URL.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: BTreeMap<String, String>,
}

// Matches http(s)://host[:port][/path][?query].
static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(https?)://([^:/\s]+)(?::(\d+))?(/[^?]*)?(?:\?(.*))?$").expect("url pattern")
});

impl HttpUrl {
    pub fn parse(url: &str) -> NetResult<Self> {
        let captures = URL_REGEX.captures(url).ok_or_else(|| {
            NetError::new(
                ErrorCode::InvalidArgument,
                format!("invalid URL format: {url}"),
                "http_url::parse",
            )
        })?;

        let scheme = captures[1].to_ascii_lowercase();
        let host = captures[2].to_owned();
        let port = match captures.get(3) {
            Some(m) => m.as_str().parse().map_err(|_| {
                NetError::new(
                    ErrorCode::InvalidArgument,
                    "invalid port number in URL",
                    "http_url::parse",
                )
            })?,
            None => default_port(&scheme),
        };
        let path = captures
            .get(4)
            .map(|m| m.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());
        let query = captures
            .get(5)
            .map(|m| parse_query_string(m.as_str()))
            .unwrap_or_default();

        Ok(Self {
            scheme,
            host,
            port,
            path,
            query,
        })
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme == "https" {
        443
    } else {
        80
    }
}

/// State shared with the per-request messaging client's callbacks.
struct ResponseState {
    data: Mutex<Vec<u8>>,
    complete: AtomicBool,
    failed: Mutex<Option<NetError>>,
    notify: Notify,
}

impl ResponseState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(Vec::new()),
            complete: AtomicBool::new(false),
            failed: Mutex::new(None),
            notify: Notify::new(),
        })
    }
}

/// Returns true once the buffered bytes hold a complete response, judged by
/// Content-Length. Responses without one complete on connection close.
fn response_is_complete(data: &[u8]) -> bool {
    let Some(headers_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let Ok(head) = std::str::from_utf8(&data[..headers_end]) else {
        return false;
    };

    for line in head.split("\r\n") {
        let Some(colon) = line.find(':') else { continue };
        if line[..colon].trim().eq_ignore_ascii_case("content-length") {
            let value = line[colon + 1..].trim();
            let Ok(content_length) = value.parse::<usize>() else {
                // Unparseable Content-Length: treat what we have as complete.
                return true;
            };
            return data.len() >= headers_end + 4 + content_length;
        }
    }
    false
}

/// HTTP client. Each request runs its own connection (`Connection: close`).
pub struct HttpClient {
    client_id: String,
    timeout: Mutex<Duration>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl HttpClient {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            timeout: Mutex::new(DEFAULT_TIMEOUT),
        }
    }

    pub fn with_timeout(client_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client_id: client_id.into(),
            timeout: Mutex::new(timeout),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    pub async fn get(&self, url: &str) -> NetResult<HttpResponse> {
        self.request(HttpMethod::Get, url, Vec::new(), &BTreeMap::new(), &BTreeMap::new())
            .await
    }

    pub async fn get_with(
        &self,
        url: &str,
        query: &BTreeMap<String, String>,
        headers: &BTreeMap<String, String>,
    ) -> NetResult<HttpResponse> {
        self.request(HttpMethod::Get, url, Vec::new(), headers, query)
            .await
    }

    pub async fn post(
        &self,
        url: &str,
        body: impl Into<Vec<u8>>,
        headers: &BTreeMap<String, String>,
    ) -> NetResult<HttpResponse> {
        self.request(HttpMethod::Post, url, body.into(), headers, &BTreeMap::new())
            .await
    }

    pub async fn put(
        &self,
        url: &str,
        body: impl Into<Vec<u8>>,
        headers: &BTreeMap<String, String>,
    ) -> NetResult<HttpResponse> {
        self.request(HttpMethod::Put, url, body.into(), headers, &BTreeMap::new())
            .await
    }

    pub async fn delete(&self, url: &str) -> NetResult<HttpResponse> {
        self.request(
            HttpMethod::Delete,
            url,
            Vec::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
    }

    pub async fn head(&self, url: &str) -> NetResult<HttpResponse> {
        self.request(
            HttpMethod::Head,
            url,
            Vec::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
    }

    pub async fn patch(
        &self,
        url: &str,
        body: impl Into<Vec<u8>>,
        headers: &BTreeMap<String, String>,
    ) -> NetResult<HttpResponse> {
        self.request(HttpMethod::Patch, url, body.into(), headers, &BTreeMap::new())
            .await
    }

    pub async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: Vec<u8>,
        headers: &BTreeMap<String, String>,
        query: &BTreeMap<String, String>,
    ) -> NetResult<HttpResponse> {
        let mut url_info = HttpUrl::parse(url)?;
        for (key, value) in query {
            url_info.query.insert(key.clone(), value.clone());
        }

        if url_info.scheme == "https" {
            return Err(NetError::new(
                ErrorCode::InvalidArgument,
                "HTTPS is not supported by this client; use http",
                "http_client::request",
            ));
        }

        let request = build_request(method, &url_info, body, headers);
        let request_bytes = serialize_request(&request);

        let transport = MessagingClient::new(format!(
            "{}_{:08}",
            self.client_id,
            NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
        ));

        let state = ResponseState::new();

        let state2 = state.clone();
        transport.set_receive_callback(move |chunk| {
            let mut data = state2.data.lock();
            data.extend_from_slice(chunk);
            if response_is_complete(&data) {
                state2.complete.store(true, Ordering::Release);
                state2.notify.notify_one();
            }
        });

        let state2 = state.clone();
        transport.set_error_callback(move |error| {
            if state2.complete.load(Ordering::Acquire) {
                return;
            }
            // Connection close marks a headers-complete response done; with
            // nothing buffered it is a transport failure.
            if state2.data.lock().is_empty() {
                *state2.failed.lock() = Some(error.clone());
            }
            state2.complete.store(true, Ordering::Release);
            state2.notify.notify_one();
        });

        transport
            .start_client(&url_info.host, url_info.port)
            .await
            .map_err(|e| {
                NetError::new(
                    ErrorCode::ConnectionFailed,
                    format!(
                        "failed to connect to {}:{}: {}",
                        url_info.host, url_info.port, e.message
                    ),
                    "http_client::request",
                )
            })?;

        let outcome = async {
            transport.send_packet(request_bytes).await.map_err(|e| {
                NetError::new(
                    ErrorCode::SendFailed,
                    format!("failed to send request: {}", e.message),
                    "http_client::request",
                )
            })?;

            loop {
                if state.complete.load(Ordering::Acquire) {
                    break;
                }
                state.notify.notified().await;
            }
            Ok(())
        };

        let result = tokio::time::timeout(self.timeout(), outcome).await;
        let _ = transport.stop_client().await;

        match result {
            Err(_elapsed) => {
                return Err(NetError::new(
                    ErrorCode::ConnectionTimeout,
                    format!("request to {url} timed out"),
                    "http_client::request",
                ));
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }

        if let Some(error) = state.failed.lock().take() {
            return Err(NetError::new(
                ErrorCode::ConnectionFailed,
                format!("request failed: {}", error.message),
                "http_client::request",
            ));
        }

        let data = state.data.lock();
        parse_response(&data)
    }
}

fn build_request(
    method: HttpMethod,
    url_info: &HttpUrl,
    body: Vec<u8>,
    headers: &BTreeMap<String, String>,
) -> HttpRequest {
    let mut request = HttpRequest::new(method, url_info.path.clone());
    request.version = HttpVersion::Http11;
    request.query_params = url_info.query.clone();

    for (name, value) in headers {
        request.set_header(name, value);
    }

    request.set_header("Host", &url_info.host);
    request.set_header("Connection", "close");
    request.set_header("Accept", "*/*");
    if !body.is_empty() {
        let length = body.len().to_string();
        request.set_header("Content-Length", &length);
        request.body = body;
    }
    if request.header("User-Agent").is_none() {
        request.set_header("User-Agent", "NetworkSystem-HTTP-Client/1.0");
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_urls() {
        let url = HttpUrl::parse("http://example.com:8080/api/items?limit=5").unwrap();
        assert_eq!(url.scheme, "http");
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/api/items");
        assert_eq!(url.query.get("limit").map(String::as_str), Some("5"));
    }

    #[test]
    fn default_ports_follow_the_scheme() {
        assert_eq!(HttpUrl::parse("http://example.com").unwrap().port, 80);
        assert_eq!(HttpUrl::parse("https://example.com").unwrap().port, 443);
        assert_eq!(HttpUrl::parse("http://example.com").unwrap().path, "/");
    }

    #[test]
    fn rejects_malformed_urls() {
        for url in ["ftp://example.com", "example.com", "http://", "http://host:banana"] {
            let err = HttpUrl::parse(url).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidArgument, "{url}");
        }
    }

    #[tokio::test]
    async fn https_is_rejected_at_request_time() {
        let client = HttpClient::new("test-client");
        let err = client.get("https://example.com/").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn build_request_sets_the_default_headers() {
        let url = HttpUrl::parse("http://example.com/submit").unwrap();
        let request = build_request(HttpMethod::Post, &url, b"payload".to_vec(), &BTreeMap::new());
        assert_eq!(request.header("Host"), Some("example.com"));
        assert_eq!(request.header("Connection"), Some("close"));
        assert_eq!(request.header("Accept"), Some("*/*"));
        assert_eq!(request.header("Content-Length"), Some("7"));
        assert_eq!(
            request.header("User-Agent"),
            Some("NetworkSystem-HTTP-Client/1.0")
        );
    }

    #[test]
    fn custom_user_agent_is_kept() {
        let url = HttpUrl::parse("http://example.com/").unwrap();
        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_owned(), "custom/2.0".to_owned());
        let request = build_request(HttpMethod::Get, &url, Vec::new(), &headers);
        assert_eq!(request.header("User-Agent"), Some("custom/2.0"));
    }

    #[test]
    fn completeness_follows_content_length() {
        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        let mut data = head.to_vec();
        assert!(!response_is_complete(&data));
        data.extend_from_slice(b"hel");
        assert!(!response_is_complete(&data));
        data.extend_from_slice(b"lo");
        assert!(response_is_complete(&data));
    }

    #[test]
    fn completeness_without_content_length_waits_for_close() {
        let data = b"HTTP/1.1 200 OK\r\n\r\npartial body";
        assert!(!response_is_complete(data));
    }
}
