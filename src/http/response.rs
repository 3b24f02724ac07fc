//! HTTP/1.1 response composition.
//!
//! Every response carries the common header block (`Server`,
//! `Referrer-Policy`, `Access-Control-Allow-Origin`) and a `Date` copied
//! from the now cache.

/// Headers present on every response the server writes.
pub const COMMON_HEADERS: &str =
    "Server: turfwar\r\nReferrer-Policy: origin\r\nAccess-Control-Allow-Origin: *\r\n";

/// Incrementally composed response: status line and headers first, then
/// one of the finishers.
pub struct Response {
    buf: Vec<u8>,
}

impl Response {
    /// Start a response with the status line, the common headers, and
    /// `Date`.
    pub fn new(status: &str, date: &str) -> Response {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(b"HTTP/1.1 ");
        buf.extend_from_slice(status.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(COMMON_HEADERS.as_bytes());
        buf.extend_from_slice(b"Date: ");
        buf.extend_from_slice(date.as_bytes());
        buf.extend_from_slice(b"\r\n");
        Response { buf }
    }

    pub fn header(mut self, name: &str, value: &str) -> Response {
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.extend_from_slice(b": ");
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    /// Finish a bodyless response (304 and friends).
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(b"\r\n");
        self.buf
    }

    /// Finish with `Content-Length` and `body`; `include_body` is false
    /// for HEAD, which sends the length but suppresses the payload.
    pub fn payload(mut self, body: &[u8], include_body: bool) -> Vec<u8> {
        self.buf.extend_from_slice(b"Content-Length: ");
        self.buf.extend_from_slice(body.len().to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n\r\n");
        if include_body {
            self.buf.extend_from_slice(body);
        }
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATE: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

    #[test]
    fn carries_the_common_header_block() {
        let bytes = Response::new("200 OK", DATE).payload(b"hi", true);
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: turfwar\r\n"));
        assert!(text.contains("Referrer-Policy: origin\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.contains("Date: Thu, 01 Jan 1970 00:00:00 GMT\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn head_suppresses_the_body_but_not_the_length() {
        let bytes = Response::new("200 OK", DATE)
            .header("Content-Type", "text/plain")
            .payload(b"body bytes", false);
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn finish_leaves_no_body() {
        let bytes = Response::new("304 Not Modified", DATE)
            .header("Vary", "Accept-Encoding")
            .finish();
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("Vary: Accept-Encoding\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
