//! Thin request wrapper over `httparse` plus the header lookups the
//! server routes on.

use httparse::{EMPTY_HEADER, Request, Status};

/// Header slots per request; anything beyond this fails to parse.
pub const MAX_HEADERS: usize = 64;

/// Method subset the keepalive rule distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Other,
}

/// One parsed HTTP request and derived routing facts. Borrows the read
/// buffer for its whole lifetime.
pub struct HttpRequest<'a> {
    pub method: Method,
    pub method_name: &'a str,
    /// Full request target, query string included, as routed on.
    pub target: &'a str,
    /// Query string without the `?`, empty when absent.
    pub query: &'a str,
    /// HTTP minor version; only `1` is served.
    pub minor_version: u8,
    /// Bytes the request occupied in the read buffer.
    pub len: usize,
    headers: Vec<(&'a str, &'a [u8])>,
}

impl<'a> HttpRequest<'a> {
    /// One-shot parse: a partial or malformed message is a parse
    /// failure, never a wait for more bytes.
    pub fn parse(buf: &'a [u8]) -> Option<HttpRequest<'a>> {
        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut req = Request::new(&mut headers);
        let len = match req.parse(buf) {
            Ok(Status::Complete(len)) => len,
            _ => return None,
        };
        let target = req.path?;
        let method_name = req.method?;
        let method = match method_name {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            _ => Method::Other,
        };
        let query = match target.split_once('?') {
            Some((_, query)) => query,
            None => "",
        };
        Some(HttpRequest {
            method,
            method_name,
            target,
            query,
            minor_version: req.version?,
            len,
            headers: req.headers.iter().map(|h| (h.name, h.value)).collect(),
        })
    }

    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&'a [u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }

    /// Same, decoded as UTF-8; undecodable values read as absent.
    pub fn header_str(&self, name: &str) -> Option<&'a str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }
}

/// Does a comma-separated header value list `needle` as an element,
/// parameters ignored, case-insensitive? Covers both `Accept` media
/// ranges and `Accept-Encoding` codings.
pub fn list_has(value: &str, needle: &str) -> bool {
    value.split(',').any(|item| {
        item.split(';')
            .next()
            .unwrap_or("")
            .trim()
            .eq_ignore_ascii_case(needle)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_get_with_headers() {
        let raw = b"GET /claim?name=Alice HTTP/1.1\r\nHost: x\r\nAccept: image/gif\r\n\r\n";
        let req = HttpRequest::parse(raw).expect("parse");
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.method_name, "GET");
        assert_eq!(req.target, "/claim?name=Alice");
        assert_eq!(req.query, "name=Alice");
        assert_eq!(req.minor_version, 1);
        assert_eq!(req.len, raw.len());
        assert_eq!(req.header_str("accept"), Some("image/gif"));
        assert_eq!(req.header_str("ACCEPT"), Some("image/gif"));
        assert!(req.has_header("Host"));
        assert!(!req.has_header("Content-Length"));
    }

    #[test]
    fn rejects_partials_and_garbage() {
        assert!(HttpRequest::parse(b"GET / HTTP/1.1\r\nHost: x\r\n").is_none());
        assert!(HttpRequest::parse(b"\x16\x03\x01 not http").is_none());
        assert!(HttpRequest::parse(b"").is_none());
    }

    #[test]
    fn reports_the_minor_version() {
        let req = HttpRequest::parse(b"GET / HTTP/1.0\r\n\r\n").expect("parse");
        assert_eq!(req.minor_version, 0);
    }

    #[test]
    fn head_and_other_methods() {
        let head = HttpRequest::parse(b"HEAD / HTTP/1.1\r\n\r\n").expect("parse");
        assert_eq!(head.method, Method::Head);
        let post = HttpRequest::parse(b"POST /claim HTTP/1.1\r\n\r\n").expect("parse");
        assert_eq!(post.method, Method::Other);
    }

    #[test]
    fn list_matching_ignores_parameters_and_case() {
        assert!(list_has("text/html, application/xml;q=0.9, */*;q=0.8", "*/*"));
        assert!(list_has("image/avif,image/webp,image/*", "image/*"));
        assert!(list_has("GZIP, deflate", "gzip"));
        assert!(list_has("text/plain", "text/plain"));
        assert!(!list_has("text/html", "text/plain"));
        assert!(!list_has("gzipped", "gzip"));
    }
}
