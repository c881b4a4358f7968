//! HTTP/1.1 message types.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Connect,
    Trace,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            "HEAD" => Some(HttpMethod::Head),
            "OPTIONS" => Some(HttpMethod::Options),
            "PATCH" => Some(HttpMethod::Patch),
            "CONNECT" => Some(HttpMethod::Connect),
            "TRACE" => Some(HttpMethod::Trace),
            _ => None,
        }
    }
}

/// Known protocol versions. 2.0 is accepted on input only; this library
/// speaks 1.1 framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Http20,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Http20 => "HTTP/2.0",
        }
    }

    pub fn parse(version: &str) -> Option<Self> {
        match version {
            "HTTP/1.0" => Some(HttpVersion::Http10),
            "HTTP/1.1" => Some(HttpVersion::Http11),
            "HTTP/2.0" | "HTTP/2" => Some(HttpVersion::Http20),
            _ => None,
        }
    }
}

/// Canonical reason phrase for a status code, `"Unknown"` otherwise.
pub fn status_message(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        101 => "Switching Protocols",

        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",

        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",

        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",

        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",

        _ => "Unknown",
    }
}

fn get_header_case_insensitive<'a>(
    headers: &'a BTreeMap<String, String>,
    name: &str,
) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn set_header_case_insensitive(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
    headers.insert(name.to_owned(), value.to_owned());
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub uri: String,
    pub version: HttpVersion,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: HttpVersion::Http11,
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Header lookup; names are case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        get_header_case_insensitive(&self.headers, name)
    }

    /// Replaces any case-variant of `name` with the given value.
    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header_case_insensitive(&mut self.headers, name, value);
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn set_body_string(&mut self, content: &str) {
        self.body = content.as_bytes().to_vec();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub version: HttpVersion,
    pub status_code: u16,
    pub status_message: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub use_chunked_encoding: bool,
}

impl HttpResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            version: HttpVersion::Http11,
            status_code,
            status_message: status_message(status_code).to_owned(),
            headers: BTreeMap::new(),
            body: Vec::new(),
            use_chunked_encoding: false,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        get_header_case_insensitive(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header_case_insensitive(&mut self.headers, name, value);
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn set_body_string(&mut self, content: &str) {
        self.body = content.as_bytes().to_vec();
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.set_header("Content-Type", content_type);
        self.body = body.into();
        self
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_strings_round_trip() {
        for method in [
            HttpMethod::Get,
            HttpMethod::Post,
            HttpMethod::Put,
            HttpMethod::Delete,
            HttpMethod::Head,
            HttpMethod::Options,
            HttpMethod::Patch,
            HttpMethod::Connect,
            HttpMethod::Trace,
        ] {
            assert_eq!(HttpMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(HttpMethod::parse("get"), Some(HttpMethod::Get));
        assert_eq!(HttpMethod::parse("BREW"), None);
    }

    #[test]
    fn version_accepts_short_http2_spelling() {
        assert_eq!(HttpVersion::parse("HTTP/2"), Some(HttpVersion::Http20));
        assert_eq!(HttpVersion::parse("HTTP/1.1"), Some(HttpVersion::Http11));
        assert_eq!(HttpVersion::parse("HTTP/9"), None);
    }

    #[test]
    fn status_messages_match_rfc_phrases() {
        assert_eq!(status_message(200), "OK");
        assert_eq!(status_message(404), "Not Found");
        assert_eq!(status_message(413), "Payload Too Large");
        assert_eq!(status_message(431), "Request Header Fields Too Large");
        assert_eq!(status_message(999), "Unknown");
    }

    #[test]
    fn headers_are_case_insensitive() {
        let mut request = HttpRequest::new(HttpMethod::Get, "/");
        request.set_header("Content-Type", "text/plain");
        assert_eq!(request.header("content-type"), Some("text/plain"));
        assert_eq!(request.header("CONTENT-TYPE"), Some("text/plain"));

        // Setting replaces any case-variant.
        request.set_header("content-type", "application/json");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header("Content-Type"), Some("application/json"));
    }

    #[test]
    fn response_defaults_to_canonical_reason() {
        let response = HttpResponse::new(204);
        assert_eq!(response.status_message, "No Content");
        assert_eq!(response.version, HttpVersion::Http11);
        assert!(!response.use_chunked_encoding);
    }
}
