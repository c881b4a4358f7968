//! multipart/form-data parsing.

use std::collections::BTreeMap;

use netsys_core::error::{ErrorCode, NetError, NetResult};

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultipartForm {
    pub fields: BTreeMap<String, String>,
    pub files: BTreeMap<String, UploadedFile>,
}

fn invalid(message: impl Into<String>) -> NetError {
    NetError::new(ErrorCode::InvalidArgument, message, "http::multipart")
}

/// Extracts the `boundary` parameter from a Content-Type header value.
pub fn extract_boundary(content_type: &str) -> Option<String> {
    for part in content_type.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }
    None
}

/// Parses a multipart/form-data body. Text parts land in `fields`, parts
/// carrying a filename in `files`.
pub fn parse_multipart(content_type: &str, body: &[u8]) -> NetResult<MultipartForm> {
    let boundary = extract_boundary(content_type)
        .ok_or_else(|| invalid("Content-Type carries no boundary parameter"))?;
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut form = MultipartForm::default();

    let mut segments = split_on(body, delimiter);
    // Everything before the first delimiter is a preamble.
    if segments.is_empty() {
        return Err(invalid("body contains no boundary"));
    }
    segments.remove(0);

    for segment in segments {
        // The final delimiter is followed by "--".
        if segment.starts_with(b"--") {
            break;
        }
        let part = segment
            .strip_prefix(b"\r\n")
            .unwrap_or(segment);
        let Some(headers_end) = part.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let Ok(header_text) = std::str::from_utf8(&part[..headers_end]) else {
            continue;
        };
        let mut content = &part[headers_end + 4..];
        // Trailing CRLF before the next delimiter belongs to the framing.
        if content.ends_with(b"\r\n") {
            content = &content[..content.len() - 2];
        }

        let mut name = None;
        let mut filename = None;
        let mut part_content_type = String::new();
        for line in header_text.split("\r\n") {
            let Some(colon) = line.find(':') else { continue };
            let header_name = line[..colon].trim();
            let header_value = line[colon + 1..].trim();
            if header_name.eq_ignore_ascii_case("content-disposition") {
                name = disposition_param(header_value, "name");
                filename = disposition_param(header_value, "filename");
            } else if header_name.eq_ignore_ascii_case("content-type") {
                part_content_type = header_value.to_owned();
            }
        }

        let Some(name) = name else { continue };
        match filename {
            Some(filename) => {
                form.files.insert(
                    name,
                    UploadedFile {
                        filename,
                        content_type: part_content_type,
                        data: content.to_vec(),
                    },
                );
            }
            None => {
                form.fields
                    .insert(name, String::from_utf8_lossy(content).into_owned());
            }
        }
    }

    Ok(form)
}

fn disposition_param(header_value: &str, param: &str) -> Option<String> {
    for part in header_value.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix(&format!("{param}=")) {
            return Some(value.trim_matches('"').to_owned());
        }
    }
    None
}

/// Splits `data` on every occurrence of `delimiter`, delimiter excluded.
fn split_on<'a>(data: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut pos = 0;
    while pos + delimiter.len() <= data.len() {
        if &data[pos..pos + delimiter.len()] == delimiter {
            segments.push(&data[start..pos]);
            pos += delimiter.len();
            start = pos;
        } else {
            pos += 1;
        }
    }
    segments.push(&data[start..]);
    segments
}
