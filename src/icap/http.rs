//! Minimal parsing of encapsulated HTTP heads.
//!
//! ICAP carries the original HTTP request and response headers as opaque
//! byte sections. The gateway only needs a few facts out of them (the
//! destination host, the content encoding) plus the ability to rewrite
//! `Content-Length` when a body is re-encoded, so this stays a thin
//! line-oriented parser rather than a full HTTP implementation.

use crate::dlp::domains::normalize_host;
use crate::error::{Result, TollgateError};

/// A parsed encapsulated HTTP head: the start line plus headers, with the
/// original bytes kept for bit-exact re-emission.
#[derive(Debug, Clone)]
pub struct HttpHead {
    pub start_line: String,
    /// Header names lowercased, values trimmed, order preserved.
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| TollgateError::Protocol("non-UTF8 HTTP head".to_string()))?;
        let mut lines = text.split("\r\n");
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| TollgateError::Protocol("empty HTTP head".to_string()))?
            .to_string();
        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| TollgateError::Protocol(format!("malformed HTTP header: {}", line)))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
        Ok(HttpHead {
            start_line,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Destination host of a request head: the `Host` header, falling
    /// back to the authority of an absolute-form request target.
    pub fn host(&self) -> Option<String> {
        if let Some(h) = self.header("host") {
            return Some(normalize_host(h));
        }
        let target = self.start_line.split_whitespace().nth(1)?;
        let rest = target
            .strip_prefix("https://")
            .or_else(|| target.strip_prefix("http://"))?;
        let authority = rest.split('/').next()?;
        Some(normalize_host(authority))
    }

    pub fn is_gzip_encoded(&self) -> bool {
        self.header("content-encoding")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("gzip")))
            .unwrap_or(false)
    }

    /// Serialize back to wire form, replacing `Content-Length` with the
    /// given value (inserting it if absent) and dropping any
    /// `Transfer-Encoding` header, since the re-emitted body carries an
    /// exact length.
    pub fn serialize_with_length(&self, content_length: u64) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&self.start_line);
        out.push_str("\r\n");
        let mut wrote_length = false;
        for (name, value) in &self.headers {
            match name.as_str() {
                "content-length" => {
                    out.push_str(&format!("Content-Length: {}\r\n", content_length));
                    wrote_length = true;
                }
                "transfer-encoding" => {}
                _ => {
                    out.push_str(&format!("{}: {}\r\n", canonical(name), value));
                }
            }
        }
        if !wrote_length {
            out.push_str(&format!("Content-Length: {}\r\n", content_length));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Re-capitalize a lowercased header name for emission (`content-type` ->
/// `Content-Type`).
fn canonical(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(c) => c.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_head_and_host() {
        let head = HttpHead::parse(
            b"POST /v1/messages HTTP/1.1\r\nHost: API.Anthropic.com:443\r\nContent-Type: application/json\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.start_line, "POST /v1/messages HTTP/1.1");
        assert_eq!(head.host().as_deref(), Some("api.anthropic.com"));
        assert_eq!(head.header("content-type"), Some("application/json"));
    }

    #[test]
    fn absolute_form_target_supplies_host() {
        let head =
            HttpHead::parse(b"GET https://example.com/path HTTP/1.1\r\nAccept: */*\r\n\r\n")
                .unwrap();
        assert_eq!(head.host().as_deref(), Some("example.com"));
    }

    #[test]
    fn gzip_detection_from_content_encoding() {
        let head = HttpHead::parse(
            b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: 10\r\n\r\n",
        )
        .unwrap();
        assert!(head.is_gzip_encoded());

        let plain = HttpHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n").unwrap();
        assert!(!plain.is_gzip_encoded());
    }

    #[test]
    fn serialize_rewrites_content_length_and_drops_te() {
        let head = HttpHead::parse(
            b"HTTP/1.1 200 OK\r\nContent-Length: 999\r\nTransfer-Encoding: chunked\r\nX-Custom: v\r\n\r\n",
        )
        .unwrap();
        let out = head.serialize_with_length(42);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Content-Length: 42\r\n"));
        assert!(!text.contains("999"));
        assert!(!text.to_lowercase().contains("transfer-encoding"));
        assert!(text.contains("X-Custom: v\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn serialize_inserts_missing_content_length() {
        let head = HttpHead::parse(b"HTTP/1.1 200 OK\r\nServer: o\r\n\r\n").unwrap();
        let text = String::from_utf8(head.serialize_with_length(7)).unwrap();
        assert!(text.contains("Content-Length: 7\r\n"));
    }

    #[test]
    fn malformed_head_is_a_protocol_error() {
        assert!(HttpHead::parse(b"").is_err());
        assert!(HttpHead::parse(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n").is_err());
    }
}
