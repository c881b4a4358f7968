//! HTTP error descriptions and the configurable error responders.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::types::HttpResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpErrorCode {
    BadRequest,
    Unauthorized,
    PaymentRequired,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    ProxyAuthenticationRequired,
    RequestTimeout,
    Conflict,
    Gone,
    LengthRequired,
    PreconditionFailed,
    PayloadTooLarge,
    UriTooLong,
    UnsupportedMediaType,
    RangeNotSatisfiable,
    ExpectationFailed,
    MisdirectedRequest,
    UnprocessableEntity,
    UpgradeRequired,
    PreconditionRequired,
    TooManyRequests,
    RequestHeaderFieldsTooLarge,
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    HttpVersionNotSupported,
}

impl HttpErrorCode {
    pub fn status_code(self) -> u16 {
        match self {
            HttpErrorCode::BadRequest => 400,
            HttpErrorCode::Unauthorized => 401,
            HttpErrorCode::PaymentRequired => 402,
            HttpErrorCode::Forbidden => 403,
            HttpErrorCode::NotFound => 404,
            HttpErrorCode::MethodNotAllowed => 405,
            HttpErrorCode::NotAcceptable => 406,
            HttpErrorCode::ProxyAuthenticationRequired => 407,
            HttpErrorCode::RequestTimeout => 408,
            HttpErrorCode::Conflict => 409,
            HttpErrorCode::Gone => 410,
            HttpErrorCode::LengthRequired => 411,
            HttpErrorCode::PreconditionFailed => 412,
            HttpErrorCode::PayloadTooLarge => 413,
            HttpErrorCode::UriTooLong => 414,
            HttpErrorCode::UnsupportedMediaType => 415,
            HttpErrorCode::RangeNotSatisfiable => 416,
            HttpErrorCode::ExpectationFailed => 417,
            HttpErrorCode::MisdirectedRequest => 421,
            HttpErrorCode::UnprocessableEntity => 422,
            HttpErrorCode::UpgradeRequired => 426,
            HttpErrorCode::PreconditionRequired => 428,
            HttpErrorCode::TooManyRequests => 429,
            HttpErrorCode::RequestHeaderFieldsTooLarge => 431,
            HttpErrorCode::InternalServerError => 500,
            HttpErrorCode::NotImplemented => 501,
            HttpErrorCode::BadGateway => 502,
            HttpErrorCode::ServiceUnavailable => 503,
            HttpErrorCode::GatewayTimeout => 504,
            HttpErrorCode::HttpVersionNotSupported => 505,
        }
    }

    pub fn status_text(self) -> &'static str {
        match self {
            HttpErrorCode::BadRequest => "Bad Request",
            HttpErrorCode::Unauthorized => "Unauthorized",
            HttpErrorCode::PaymentRequired => "Payment Required",
            HttpErrorCode::Forbidden => "Forbidden",
            HttpErrorCode::NotFound => "Not Found",
            HttpErrorCode::MethodNotAllowed => "Method Not Allowed",
            HttpErrorCode::NotAcceptable => "Not Acceptable",
            HttpErrorCode::ProxyAuthenticationRequired => "Proxy Authentication Required",
            HttpErrorCode::RequestTimeout => "Request Timeout",
            HttpErrorCode::Conflict => "Conflict",
            HttpErrorCode::Gone => "Gone",
            HttpErrorCode::LengthRequired => "Length Required",
            HttpErrorCode::PreconditionFailed => "Precondition Failed",
            HttpErrorCode::PayloadTooLarge => "Payload Too Large",
            HttpErrorCode::UriTooLong => "URI Too Long",
            HttpErrorCode::UnsupportedMediaType => "Unsupported Media Type",
            HttpErrorCode::RangeNotSatisfiable => "Range Not Satisfiable",
            HttpErrorCode::ExpectationFailed => "Expectation Failed",
            HttpErrorCode::MisdirectedRequest => "Misdirected Request",
            HttpErrorCode::UnprocessableEntity => "Unprocessable Entity",
            HttpErrorCode::UpgradeRequired => "Upgrade Required",
            HttpErrorCode::PreconditionRequired => "Precondition Required",
            HttpErrorCode::TooManyRequests => "Too Many Requests",
            HttpErrorCode::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            HttpErrorCode::InternalServerError => "Internal Server Error",
            HttpErrorCode::NotImplemented => "Not Implemented",
            HttpErrorCode::BadGateway => "Bad Gateway",
            HttpErrorCode::ServiceUnavailable => "Service Unavailable",
            HttpErrorCode::GatewayTimeout => "Gateway Timeout",
            HttpErrorCode::HttpVersionNotSupported => "HTTP Version Not Supported",
        }
    }

    pub fn from_status(status_code: u16) -> Option<Self> {
        match status_code {
            400 => Some(HttpErrorCode::BadRequest),
            401 => Some(HttpErrorCode::Unauthorized),
            402 => Some(HttpErrorCode::PaymentRequired),
            403 => Some(HttpErrorCode::Forbidden),
            404 => Some(HttpErrorCode::NotFound),
            405 => Some(HttpErrorCode::MethodNotAllowed),
            406 => Some(HttpErrorCode::NotAcceptable),
            407 => Some(HttpErrorCode::ProxyAuthenticationRequired),
            408 => Some(HttpErrorCode::RequestTimeout),
            409 => Some(HttpErrorCode::Conflict),
            410 => Some(HttpErrorCode::Gone),
            411 => Some(HttpErrorCode::LengthRequired),
            412 => Some(HttpErrorCode::PreconditionFailed),
            413 => Some(HttpErrorCode::PayloadTooLarge),
            414 => Some(HttpErrorCode::UriTooLong),
            415 => Some(HttpErrorCode::UnsupportedMediaType),
            416 => Some(HttpErrorCode::RangeNotSatisfiable),
            417 => Some(HttpErrorCode::ExpectationFailed),
            421 => Some(HttpErrorCode::MisdirectedRequest),
            422 => Some(HttpErrorCode::UnprocessableEntity),
            426 => Some(HttpErrorCode::UpgradeRequired),
            428 => Some(HttpErrorCode::PreconditionRequired),
            429 => Some(HttpErrorCode::TooManyRequests),
            431 => Some(HttpErrorCode::RequestHeaderFieldsTooLarge),
            500 => Some(HttpErrorCode::InternalServerError),
            501 => Some(HttpErrorCode::NotImplemented),
            502 => Some(HttpErrorCode::BadGateway),
            503 => Some(HttpErrorCode::ServiceUnavailable),
            504 => Some(HttpErrorCode::GatewayTimeout),
            505 => Some(HttpErrorCode::HttpVersionNotSupported),
            _ => None,
        }
    }
}

/// A user-visible HTTP failure, fed to the configured responder.
#[derive(Debug, Clone)]
pub struct HttpError {
    pub code: HttpErrorCode,
    pub message: String,
    pub detail: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl HttpError {
    pub fn new(code: HttpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: String::new(),
            request_id: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn status_code(&self) -> u16 {
        self.code.status_code()
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(HttpErrorCode::InternalServerError, message)
    }
}

/// RFC 7807 problem document.
pub fn build_json_error(error: &HttpError) -> HttpResponse {
    let mut body = serde_json::json!({
        "type": "about:blank",
        "title": error.code.status_text(),
        "status": error.status_code(),
        "detail": if error.detail.is_empty() { &error.message } else { &error.detail },
        "timestamp": error.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    if !error.request_id.is_empty() {
        body["instance"] = serde_json::Value::String(error.request_id.clone());
    }

    let mut response = HttpResponse::new(error.status_code());
    response.status_message = error.code.status_text().to_owned();
    response.set_body_string(&serde_json::to_string_pretty(&body).unwrap_or_default());
    response.set_header("Content-Type", "application/problem+json; charset=utf-8");
    response
}

/// Minimal HTML error document.
pub fn build_html_error(error: &HttpError) -> HttpResponse {
    let status_code = error.status_code();
    let status_text = escape_html(error.code.status_text());

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
    html.push_str("  <meta charset=\"utf-8\">\n");
    html.push_str(&format!("  <title>{status_code} {status_text}</title>\n"));
    html.push_str("</head>\n<body>\n");
    html.push_str(&format!("  <h1>{status_code} {status_text}</h1>\n"));
    if !error.message.is_empty() {
        html.push_str(&format!("  <p>{}</p>\n", escape_html(&error.message)));
    }
    if !error.detail.is_empty() {
        html.push_str(&format!(
            "  <p><strong>Details:</strong> {}</p>\n",
            escape_html(&error.detail)
        ));
    }
    if !error.request_id.is_empty() {
        html.push_str(&format!(
            "  <p>Request ID: {}</p>\n",
            escape_html(&error.request_id)
        ));
    }
    html.push_str("  <hr>\n  <p><em>NetworkSystem HTTP Server</em></p>\n");
    html.push_str("</body>\n</html>\n");

    let mut response = HttpResponse::new(status_code);
    response.status_message = error.code.status_text().to_owned();
    response.set_body_string(&html);
    response.set_header("Content-Type", "text/html; charset=utf-8");
    response
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_is_rfc7807_shaped() {
        let error = HttpError::new(HttpErrorCode::NotFound, "no such route")
            .with_detail("GET /missing matched nothing")
            .with_request_id("req-17");
        let response = build_json_error(&error);

        assert_eq!(response.status_code, 404);
        assert_eq!(
            response.header("Content-Type"),
            Some("application/problem+json; charset=utf-8")
        );

        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["type"], "about:blank");
        assert_eq!(body["title"], "Not Found");
        assert_eq!(body["status"], 404);
        assert_eq!(body["detail"], "GET /missing matched nothing");
        assert_eq!(body["instance"], "req-17");
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn json_escaping_survives_hostile_detail() {
        let error = HttpError::new(HttpErrorCode::BadRequest, "quote \" backslash \\ newline \n");
        let response = build_json_error(&error);
        // Must stay parseable despite the control characters.
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["detail"], "quote \" backslash \\ newline \n");
    }

    #[test]
    fn html_error_escapes_markup() {
        let error = HttpError::new(HttpErrorCode::BadRequest, "<script>alert('x')</script>");
        let response = build_html_error(&error);
        let body = response.body_string();
        assert!(body.contains("&lt;script&gt;"));
        assert!(!body.contains("<script>alert"));
        assert!(body.contains("400 Bad Request"));
    }

    #[test]
    fn escape_html_covers_the_five_characters() {
        assert_eq!(escape_html("&<>\"'"), "&amp;&lt;&gt;&quot;&#39;");
    }

    #[test]
    fn status_code_mapping_round_trips() {
        for code in [
            HttpErrorCode::BadRequest,
            HttpErrorCode::NotFound,
            HttpErrorCode::PayloadTooLarge,
            HttpErrorCode::RequestHeaderFieldsTooLarge,
            HttpErrorCode::InternalServerError,
            HttpErrorCode::GatewayTimeout,
        ] {
            assert_eq!(HttpErrorCode::from_status(code.status_code()), Some(code));
        }
        assert_eq!(HttpErrorCode::from_status(200), None);
    }
}
