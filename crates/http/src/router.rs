//! Route table: `:name` patterns compiled to anchored regexes.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;

use netsys_core::error::{ErrorCode, NetError, NetResult};

use crate::cookie::parse_cookie_header;
use crate::error::HttpError;
use crate::multipart::{parse_multipart, MultipartForm};
use crate::types::{HttpMethod, HttpRequest, HttpResponse};

/// Request plus the path parameters captured by the matched route.
#[derive(Debug, Clone)]
pub struct HttpRequestContext {
    pub request: HttpRequest,
    pub path_params: BTreeMap<String, String>,
}

impl HttpRequestContext {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            request,
            path_params: BTreeMap::new(),
        }
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.request.query_params.get(name).map(String::as_str)
    }

    /// Cookies sent with the request, parsed from the `Cookie` header.
    pub fn cookies(&self) -> BTreeMap<String, String> {
        self.request
            .header("Cookie")
            .map(parse_cookie_header)
            .unwrap_or_default()
    }

    /// Parses the body as multipart/form-data when the request's
    /// Content-Type declares a boundary.
    pub fn multipart(&self) -> NetResult<MultipartForm> {
        let content_type = self.request.header("Content-Type").ok_or_else(|| {
            NetError::new(
                ErrorCode::InvalidArgument,
                "request carries no Content-Type header",
                "http::context",
            )
        })?;
        parse_multipart(content_type, &self.request.body)
    }
}

/// Route handlers run concurrently across connections; failures map to the
/// server's error responders.
pub type HttpHandler =
    Arc<dyn Fn(&HttpRequestContext) -> Result<HttpResponse, HttpError> + Send + Sync>;

pub struct Route {
    pub method: HttpMethod,
    pub pattern: String,
    pub regex: Regex,
    pub param_names: Vec<String>,
    pub handler: HttpHandler,
}

impl Route {
    fn matches(
        &self,
        method: HttpMethod,
        path: &str,
        params: &mut BTreeMap<String, String>,
    ) -> bool {
        if self.method != method {
            return false;
        }
        let Some(captures) = self.regex.captures(path) else {
            return false;
        };

        params.clear();
        for (index, name) in self.param_names.iter().enumerate() {
            if let Some(capture) = captures.get(index + 1) {
                params.insert(name.clone(), capture.as_str().to_owned());
            }
        }
        true
    }
}

/// Converts a route pattern into an anchored regex string plus the capture
/// names. Each `:ident` run becomes `([^/]+)`; regex metacharacters in the
/// literal sections are escaped.
pub fn pattern_to_regex(pattern: &str) -> (String, Vec<String>) {
    let mut regex = String::from("^");
    let mut param_names = Vec::new();

    let bytes = pattern.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == b':' {
            let mut end = pos + 1;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
            {
                end += 1;
            }
            param_names.push(pattern[pos + 1..end].to_owned());
            regex.push_str("([^/]+)");
            pos = end;
        } else {
            let c = bytes[pos] as char;
            if matches!(
                c,
                '.' | '*' | '+' | '?' | '[' | ']' | '(' | ')' | '{' | '}' | '^' | '$' | '|' | '\\'
            ) {
                regex.push('\\');
            }
            regex.push(c);
            pos += 1;
        }
    }

    regex.push('$');
    (regex, param_names)
}

/// Mutex-guarded list of routes, scanned linearly in registration order.
#[derive(Default)]
pub struct Router {
    routes: Mutex<Vec<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, method: HttpMethod, pattern: &str, handler: HttpHandler) {
        let (regex_str, param_names) = pattern_to_regex(pattern);
        let regex = match Regex::new(&regex_str) {
            Ok(regex) => regex,
            Err(e) => {
                log::error!("route pattern {pattern:?} did not compile: {e}");
                return;
            }
        };
        self.routes.lock().push(Route {
            method,
            pattern: pattern.to_owned(),
            regex,
            param_names,
            handler,
        });
    }

    /// First matching route's handler and its captured parameters.
    pub fn find(
        &self,
        method: HttpMethod,
        path: &str,
    ) -> Option<(HttpHandler, BTreeMap<String, String>)> {
        let routes = self.routes.lock();
        let mut params = BTreeMap::new();
        for route in routes.iter() {
            if route.matches(method, path, &mut params) {
                return Some((route.handler.clone(), params));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_handler() -> HttpHandler {
        Arc::new(|_ctx: &HttpRequestContext| Ok(HttpResponse::ok()))
    }

    #[test]
    fn literal_pattern_matches_itself_only() {
        let (regex_str, params) = pattern_to_regex("/health");
        assert_eq!(regex_str, "^/health$");
        assert!(params.is_empty());

        let regex = Regex::new(&regex_str).unwrap();
        assert!(regex.is_match("/health"));
        assert!(!regex.is_match("/health/x"));
        assert!(!regex.is_match("/healthy"));
        assert!(!regex.is_match("prefix/health"));
    }

    #[test]
    fn params_become_slash_free_captures() {
        let (regex_str, params) = pattern_to_regex("/users/:id/posts/:post_id");
        assert_eq!(regex_str, "^/users/([^/]+)/posts/([^/]+)$");
        assert_eq!(params, vec!["id".to_owned(), "post_id".to_owned()]);

        let regex = Regex::new(&regex_str).unwrap();
        let captures = regex.captures("/users/42/posts/seven").unwrap();
        assert_eq!(&captures[1], "42");
        assert_eq!(&captures[2], "seven");
        assert!(!regex.is_match("/users/42/posts/a/b"));
        assert!(!regex.is_match("/users//posts/x"));
    }

    #[test]
    fn metacharacters_in_literals_are_escaped() {
        let (regex_str, _params) = pattern_to_regex("/api/v1.0/items");
        let regex = Regex::new(&regex_str).unwrap();
        assert!(regex.is_match("/api/v1.0/items"));
        assert!(!regex.is_match("/api/v1X0/items"));
    }

    #[test]
    fn context_exposes_cookies_and_multipart() {
        let mut request = HttpRequest::new(HttpMethod::Post, "/upload");
        request.set_header("Cookie", "session=xyz; theme=dark");
        request.set_header("Content-Type", "multipart/form-data; boundary=B");
        request.body = b"--B\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--B--"
            .to_vec();

        let ctx = HttpRequestContext::new(request);
        assert_eq!(ctx.cookies().get("session").map(String::as_str), Some("xyz"));
        let form = ctx.multipart().unwrap();
        assert_eq!(form.fields.get("note").map(String::as_str), Some("hello"));
    }

    #[test]
    fn find_respects_method_and_fills_params() {
        let router = Router::new();
        router.add(HttpMethod::Get, "/users/:id", dummy_handler());

        assert!(router.find(HttpMethod::Post, "/users/42").is_none());
        let (_handler, params) = router.find(HttpMethod::Get, "/users/42").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn routes_match_in_registration_order() {
        let router = Router::new();
        router.add(
            HttpMethod::Get,
            "/items/special",
            Arc::new(|_ctx: &HttpRequestContext| Ok(HttpResponse::new(201))),
        );
        router.add(
            HttpMethod::Get,
            "/items/:id",
            Arc::new(|_ctx: &HttpRequestContext| Ok(HttpResponse::new(200))),
        );

        let ctx = HttpRequestContext::new(HttpRequest::new(HttpMethod::Get, "/items/special"));
        let (handler, _params) = router.find(HttpMethod::Get, "/items/special").unwrap();
        assert_eq!(handler(&ctx).unwrap().status_code, 201);

        let (handler, params) = router.find(HttpMethod::Get, "/items/17").unwrap();
        assert_eq!(handler(&ctx).unwrap().status_code, 200);
        assert_eq!(params.get("id").map(String::as_str), Some("17"));
    }
}
