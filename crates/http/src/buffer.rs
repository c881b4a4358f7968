//! Per-session request assembly.
//!
//! TCP delivers arbitrary byte fragments; this buffer accumulates them until
//! a complete request (header terminator plus Content-Length bytes of body)
//! is present, enforcing the size caps along the way.

/// Hard cap on a whole request. Exceeding it maps to 413.
pub const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;
/// Hard cap on the header section. Exceeding it before the terminator is
/// found maps to 431.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct RequestBuffer {
    pub data: Vec<u8>,
    pub headers_complete: bool,
    /// Index just past the `\r\n\r\n` terminator.
    pub headers_end: usize,
    pub content_length: usize,
}

impl RequestBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk. Returns false when a size cap was exceeded; the
    /// caller decides between 413 (`data` grew past [`MAX_REQUEST_SIZE`])
    /// and 431 (no header terminator within [`MAX_HEADER_SIZE`]).
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        if self.data.len() + chunk.len() > MAX_REQUEST_SIZE {
            return false;
        }
        self.data.extend_from_slice(chunk);

        if !self.headers_complete {
            match find_header_end(&self.data) {
                Some(pos) => {
                    self.headers_complete = true;
                    self.headers_end = pos + 4;
                    self.content_length = parse_content_length(&self.data, self.headers_end);
                }
                None => {
                    if self.data.len() > MAX_HEADER_SIZE {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.headers_complete && self.data.len() >= self.headers_end + self.content_length
    }

    /// True when the last `append` failed because of the total-size cap
    /// rather than the header cap.
    pub fn over_request_size(&self, incoming: usize) -> bool {
        self.data.len() + incoming > MAX_REQUEST_SIZE
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Scans header lines for the first whose lowercased name is
/// `content-length:` and parses the leading integer of its value. Absent or
/// unparseable values default to 0.
fn parse_content_length(data: &[u8], headers_end: usize) -> usize {
    let section = &data[..headers_end.min(data.len())];
    let Ok(text) = std::str::from_utf8(section) else {
        return 0;
    };

    for line in text.split("\r\n") {
        let Some(colon) = line.find(':') else { continue };
        if !line[..colon].trim().eq_ignore_ascii_case("content-length") {
            continue;
        }
        let value = line[colon + 1..].trim();
        let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
        return digits.parse().unwrap_or(0);
    }
    0
}
