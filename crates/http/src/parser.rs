//! HTTP/1.1 parsing and serialisation, plus URL and query-string codecs.

use std::collections::BTreeMap;

use netsys_core::error::{ErrorCode, NetError, NetResult};

use crate::types::{status_message, HttpMethod, HttpRequest, HttpResponse, HttpVersion};

const CRLF: &str = "\r\n";

fn parse_error(message: impl Into<String>) -> NetError {
    NetError::new(ErrorCode::InvalidArgument, message, "http::parser")
}

fn split_line(data: &str) -> (&str, &str) {
    match data.find(CRLF) {
        Some(pos) => (&data[..pos], &data[pos + 2..]),
        None => (data, ""),
    }
}

fn parse_headers(section: &str, headers: &mut BTreeMap<String, String>) -> bool {
    let mut rest = section;
    while !rest.is_empty() {
        let (line, tail) = split_line(rest);
        rest = tail;
        if line.is_empty() {
            break;
        }
        let Some(colon) = line.find(':') else {
            return false;
        };
        let name = line[..colon].trim();
        let value = line[colon + 1..].trim();
        headers.insert(name.to_owned(), value.to_owned());
    }
    true
}

fn parse_request_line(line: &str) -> NetResult<HttpRequest> {
    let Some(first_space) = line.find(' ') else {
        return Err(parse_error("invalid request line: no spaces found"));
    };
    let method = HttpMethod::parse(&line[..first_space])
        .ok_or_else(|| parse_error(format!("invalid HTTP method: {}", &line[..first_space])))?;

    let rest = &line[first_space + 1..];
    let Some(second_space) = rest.find(' ') else {
        return Err(parse_error("invalid request line: missing HTTP version"));
    };
    let uri_with_query = &rest[..second_space];
    let version_str = &rest[second_space + 1..];
    let version = HttpVersion::parse(version_str)
        .ok_or_else(|| parse_error(format!("invalid HTTP version: {version_str}")))?;

    let mut request = HttpRequest::new(method, "");
    request.version = version;
    match uri_with_query.find('?') {
        Some(query_pos) => {
            request.uri = uri_with_query[..query_pos].to_owned();
            request.query_params = parse_query_string(&uri_with_query[query_pos + 1..]);
        }
        None => request.uri = uri_with_query.to_owned(),
    }
    Ok(request)
}

fn parse_status_line(line: &str) -> NetResult<HttpResponse> {
    let Some(first_space) = line.find(' ') else {
        return Err(parse_error("invalid status line: no spaces found"));
    };
    let version = HttpVersion::parse(&line[..first_space])
        .ok_or_else(|| parse_error(format!("invalid HTTP version: {}", &line[..first_space])))?;

    let rest = &line[first_space + 1..];
    let (code_str, message) = match rest.find(' ') {
        Some(second_space) => (&rest[..second_space], &rest[second_space + 1..]),
        None => (rest, ""),
    };
    let status_code: u16 = code_str
        .parse()
        .map_err(|_| parse_error(format!("invalid status code: {code_str}")))?;

    let mut response = HttpResponse::new(status_code);
    response.version = version;
    if !message.is_empty() {
        response.status_message = message.to_owned();
    } else {
        response.status_message = status_message(status_code).to_owned();
    }
    Ok(response)
}

/// Splits a raw message into the UTF-8 head (start line + headers) and the
/// body bytes. The body may be arbitrary binary; only the head must decode.
fn split_head(data: &[u8]) -> NetResult<(&str, &[u8])> {
    match data.windows(4).position(|window| window == b"\r\n\r\n") {
        Some(pos) => {
            let head = std::str::from_utf8(&data[..pos])
                .map_err(|_| parse_error("message head is not valid UTF-8"))?;
            Ok((head, &data[pos + 4..]))
        }
        None => {
            let head = std::str::from_utf8(data)
                .map_err(|_| parse_error("message head is not valid UTF-8"))?;
            Ok((head, &[]))
        }
    }
}

pub fn parse_request(data: &[u8]) -> NetResult<HttpRequest> {
    let (head, body) = split_head(data)?;
    let (request_line, header_section) = split_line(head);
    if request_line.is_empty() {
        return Err(parse_error("empty HTTP request"));
    }

    let mut request = parse_request_line(request_line)?;
    if !parse_headers(header_section, &mut request.headers) {
        return Err(parse_error("failed to parse headers"));
    }
    if !body.is_empty() {
        request.body = body.to_vec();
    }
    Ok(request)
}

pub fn parse_response(data: &[u8]) -> NetResult<HttpResponse> {
    let (head, body) = split_head(data)?;
    let (status_line, header_section) = split_line(head);
    if status_line.is_empty() {
        return Err(parse_error("empty HTTP response"));
    }

    let mut response = parse_status_line(status_line)?;
    if !parse_headers(header_section, &mut response.headers) {
        return Err(parse_error("failed to parse headers"));
    }
    if !body.is_empty() {
        response.body = body.to_vec();
    }
    Ok(response)
}

pub fn serialize_request(request: &HttpRequest) -> Vec<u8> {
    let mut head = String::new();
    head.push_str(request.method.as_str());
    head.push(' ');
    head.push_str(&request.uri);
    if !request.query_params.is_empty() {
        head.push('?');
        head.push_str(&build_query_string(&request.query_params));
    }
    head.push(' ');
    head.push_str(request.version.as_str());
    head.push_str(CRLF);

    for (name, value) in &request.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str(CRLF);
    }
    head.push_str(CRLF);

    let mut out = head.into_bytes();
    out.extend_from_slice(&request.body);
    out
}

pub fn serialize_response(response: &HttpResponse) -> Vec<u8> {
    let mut head = String::new();
    head.push_str(response.version.as_str());
    head.push(' ');
    head.push_str(&response.status_code.to_string());
    head.push(' ');
    head.push_str(&response.status_message);
    head.push_str(CRLF);

    for (name, value) in &response.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str(CRLF);
    }
    head.push_str(CRLF);

    let mut out = head.into_bytes();
    if response.use_chunked_encoding && !response.body.is_empty() {
        // One chunk carrying the whole body, then the zero-length terminator.
        out.extend_from_slice(format!("{:x}{CRLF}", response.body.len()).as_bytes());
        out.extend_from_slice(&response.body);
        out.extend_from_slice(CRLF.as_bytes());
        out.extend_from_slice(b"0\r\n\r\n");
    } else {
        out.extend_from_slice(&response.body);
    }
    out
}

/// Percent-encodes everything except unreserved characters, with uppercase
/// hex digits.
pub fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Decodes `%XX` escapes and treats `+` as space. Incomplete or malformed
/// escapes are passed through leniently.
pub fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 2 < bytes.len() {
                    let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                    match u8::from_str_radix(hex, 16) {
                        Ok(byte) => {
                            out.push(byte);
                            i += 3;
                        }
                        Err(_) => {
                            out.push(b'%');
                            i += 1;
                        }
                    }
                } else {
                    // Trailing escape with fewer than two digits is dropped.
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn parse_query_string(query: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.find('=') {
            Some(eq) => {
                params.insert(url_decode(&pair[..eq]), url_decode(&pair[eq + 1..]));
            }
            None => {
                params.insert(url_decode(pair), String::new());
            }
        }
    }
    params
}

pub fn build_query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", url_encode(key), url_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_get() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.uri, "/index.html");
        assert_eq!(request.version, HttpVersion::Http11);
        assert_eq!(request.header("host"), Some("example.com"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn parses_query_parameters() {
        let raw = b"GET /search?q=hello%20world&page=2 HTTP/1.1\r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.uri, "/search");
        assert_eq!(request.query_params.get("q").map(String::as_str), Some("hello world"));
        assert_eq!(request.query_params.get("page").map(String::as_str), Some("2"));
    }

    #[test]
    fn parses_body_after_headers() {
        let raw = b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.body, b"hello");
    }

    #[test]
    fn rejects_malformed_request_lines() {
        assert!(parse_request(b"GARBAGE\r\n\r\n").is_err());
        assert!(parse_request(b"BREW / HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request(b"GET /\r\n\r\n").is_err());
        assert!(parse_request(b"GET / HTTP/9.9\r\n\r\n").is_err());
    }

    #[test]
    fn request_round_trips_through_serialiser() {
        let mut request = HttpRequest::new(HttpMethod::Post, "/echo");
        request.set_header("Content-Type", "text/plain");
        request.set_header("Content-Length", "4");
        request.query_params.insert("k".into(), "v 1".into());
        request.body = b"body".to_vec();

        let parsed = parse_request(&serialize_request(&request)).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn response_round_trips_through_serialiser() {
        let mut response = HttpResponse::new(201);
        response.set_header("Content-Type", "application/json");
        response.set_header("Content-Length", "2");
        response.body = b"{}".to_vec();

        let parsed = parse_response(&serialize_response(&response)).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn status_line_without_message_uses_canonical_reason() {
        let response = parse_response(b"HTTP/1.1 204\r\n\r\n").unwrap();
        assert_eq!(response.status_code, 204);
        assert_eq!(response.status_message, "No Content");
    }

    #[test]
    fn chunked_serialisation_emits_single_chunk_and_terminator() {
        let mut response = HttpResponse::new(200);
        response.body = b"hello world".to_vec();
        response.use_chunked_encoding = true;

        let bytes = serialize_response(&response);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with("b\r\nhello world\r\n0\r\n\r\n"));
    }

    #[test]
    fn chunked_flag_with_empty_body_emits_nothing_extra() {
        let mut response = HttpResponse::new(204);
        response.use_chunked_encoding = true;
        let bytes = serialize_response(&response);
        assert!(String::from_utf8(bytes).unwrap().ends_with("\r\n\r\n"));
    }

    #[test]
    fn url_encoding_uses_uppercase_hex_and_passes_unreserved() {
        assert_eq!(url_encode("AZaz09-_.~"), "AZaz09-_.~");
        assert_eq!(url_encode("a b"), "a%20b");
        assert_eq!(url_encode("100%"), "100%25");
        assert_eq!(url_encode("/"), "%2F");
    }

    #[test]
    fn url_decoding_accepts_plus_and_percent_space() {
        assert_eq!(url_decode("a%20b"), "a b");
        assert_eq!(url_decode("a+b"), "a b");
        assert_eq!(url_decode("%41%42"), "AB");
        // Lenient on malformed escapes.
        assert_eq!(url_decode("100%ZZ"), "100%ZZ");
    }

    #[test]
    fn query_string_round_trips() {
        let mut params = BTreeMap::new();
        params.insert("name".to_owned(), "Jane Doe".to_owned());
        params.insert("tag".to_owned(), "a/b".to_owned());
        let encoded = build_query_string(&params);
        assert_eq!(parse_query_string(&encoded), params);
    }
}
