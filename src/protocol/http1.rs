use std::collections::HashMap;

use memchr::memmem;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The header block (or the declared body) has not fully arrived.
    #[error("incomplete request")]
    Incomplete,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("malformed header line")]
    BadHeader,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtocolKind {
    Http11,
    /// Arrived as HTTP/2.0 and rewritten to HTTP/1.1
    Http2Downgrade,
    WebSocket,
}

/// Header map keyed by lowercased name. Repeated headers keep the last value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Headers {
    map: HashMap<String, String>,
}

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.map.insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether the comma-separated header value lists `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name).is_some_and(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub protocol: ProtocolKind,
}

impl HttpRequest {
    /// HTTP/1.0 without keep-alive, or an explicit `Connection: close`.
    pub fn wants_close(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return true;
        }
        self.version == "HTTP/1.0" && !self.headers.has_token("connection", "keep-alive")
    }
}

/// Parse one request from the start of `buf`.
pub fn parse_request(buf: &[u8]) -> Result<HttpRequest, ParseError> {
    let Some(head_end) = memmem::find(buf, b"\r\n\r\n") else {
        return Err(ParseError::Incomplete);
    };
    let head = &buf[..head_end];
    let rest = &buf[head_end + 4..];

    let line_end = memmem::find(head, b"\r\n").unwrap_or(head.len());
    let (method, path, version) = parse_request_line(&head[..line_end])?;

    let mut headers = Headers::default();
    let mut line_start = line_end + 2;
    while line_start < head.len() {
        let line_end = memmem::find(&head[line_start..], b"\r\n")
            .map_or(head.len(), |rel| line_start + rel);
        let line = &head[line_start..line_end];
        line_start = line_end + 2;

        let Some(colon) = memchr::memchr(b':', line) else {
            return Err(ParseError::BadHeader);
        };
        let name = trim_ascii_whitespace(&line[..colon]);
        if name.is_empty() {
            return Err(ParseError::BadHeader);
        }
        let value = trim_ascii_whitespace(&line[colon + 1..]);
        headers.insert(
            &String::from_utf8_lossy(name),
            &String::from_utf8_lossy(value),
        );
    }

    let body = match headers.get("content-length") {
        Some(v) => {
            let len = parse_usize_decimal_strict(v.as_bytes()).ok_or(ParseError::BadHeader)?;
            if rest.len() < len {
                return Err(ParseError::Incomplete);
            }
            rest[..len].to_vec()
        }
        None => rest.to_vec(),
    };

    let mut request = HttpRequest {
        method,
        path,
        version,
        headers,
        body,
        protocol: ProtocolKind::Http11,
    };
    detect_protocol(&mut request);
    Ok(request)
}

fn parse_request_line(line: &[u8]) -> Result<(String, String, String), ParseError> {
    let mut fields = line
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|f| !f.is_empty());
    let method = fields.next().ok_or(ParseError::BadRequestLine)?;
    let path = fields.next().ok_or(ParseError::BadRequestLine)?;
    let version = fields.next().ok_or(ParseError::BadRequestLine)?;
    if fields.next().is_some() || !version.starts_with(b"HTTP/") {
        return Err(ParseError::BadRequestLine);
    }
    Ok((
        String::from_utf8_lossy(method).into_owned(),
        String::from_utf8_lossy(path).into_owned(),
        String::from_utf8_lossy(version).into_owned(),
    ))
}

fn detect_protocol(request: &mut HttpRequest) {
    if request
        .headers
        .get("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        request.protocol = ProtocolKind::WebSocket;
    } else if request.version == "HTTP/2.0" {
        request.protocol = ProtocolKind::Http2Downgrade;
        request.version = "HTTP/1.1".to_string();
    }
}

#[inline]
fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[inline]
fn parse_usize_decimal_strict(input: &[u8]) -> Option<usize> {
    let digits = trim_ascii_whitespace(input);
    if digits.is_empty() {
        return None;
    }
    let mut value: usize = 0;
    for &ch in digits {
        if !ch.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((ch - b'0') as usize)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_get() {
        let req = parse_request(b"GET /infer HTTP/1.1\r\nHost: x\r\nX-Client-Id:  abc \r\n\r\n").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/infer");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.headers.get("x-client-id"), Some("abc"));
        assert_eq!(req.headers.get("HOST"), Some("x"));
        assert_eq!(req.protocol, ProtocolKind::Http11);
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_body_respects_content_length() {
        let req = parse_request(b"POST /p HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcdef").unwrap();
        assert_eq!(req.body, b"abc");
        assert_eq!(
            parse_request(b"POST /p HTTP/1.1\r\nContent-Length: 9\r\n\r\nabc"),
            Err(ParseError::Incomplete)
        );
    }

    #[test]
    fn test_incomplete_and_malformed() {
        assert_eq!(parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n"), Err(ParseError::Incomplete));
        assert_eq!(parse_request(b"GET /\r\n\r\n"), Err(ParseError::BadRequestLine));
        assert_eq!(
            parse_request(b"GET / HTTP/1.1\r\nno colon here\r\n\r\n"),
            Err(ParseError::BadHeader)
        );
    }

    #[test]
    fn test_websocket_and_h2_downgrade() {
        let ws = parse_request(b"GET /ws HTTP/1.1\r\nUpgrade: WebSocket\r\n\r\n").unwrap();
        assert_eq!(ws.protocol, ProtocolKind::WebSocket);

        let h2 = parse_request(b"GET / HTTP/2.0\r\n\r\n").unwrap();
        assert_eq!(h2.protocol, ProtocolKind::Http2Downgrade);
        assert_eq!(h2.version, "HTTP/1.1");
    }

    #[test]
    fn test_wants_close() {
        let close = parse_request(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(close.wants_close());
        let old = parse_request(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(old.wants_close());
        let keep = parse_request(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert!(!keep.wants_close());
    }
}
