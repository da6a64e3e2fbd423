//! WebSocket upgrade handshake (RFC 6455).
//!
//! The handshake is an HTTP-style exchange: the client sends a `GET`
//! request with an upgrade nonce, the server echoes the nonce transformed
//! through SHA-1 and base64. Parsing here is streaming-friendly: callers
//! accumulate bytes and probe with [`find_header_end`] until the header
//! block is complete.

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this implementation accepts.
pub const WS_VERSION: u8 = 13;

/// Locate the end of the HTTP-style header block (`\r\n\r\n`).
///
/// Returns the index one past the delimiter, i.e. the offset where body
/// bytes begin, or `None` if the block is still incomplete.
#[must_use]
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Computes the Sec-WebSocket-Accept value from the client's Sec-WebSocket-Key.
///
/// The accept token is `Base64(SHA-1(key + GUID))`.
///
/// # Example
///
/// ```
/// use asock::websocket::compute_accept_key;
///
/// let key = "dGhlIHNhbXBsZSBub25jZQ==";
/// assert_eq!(compute_accept_key(key), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a fresh upgrade nonce: 16 random bytes, base64-encoded.
///
/// # Errors
///
/// Fails only if the system entropy source is unavailable.
pub fn generate_nonce() -> Result<String> {
    let mut raw = [0u8; 16];
    getrandom::getrandom(&mut raw)
        .map_err(|e| Error::Io(format!("entropy source failed: {e}")))?;
    Ok(BASE64.encode(raw))
}

/// Constant-time byte comparison for nonce echo validation.
///
/// The comparison touches every byte of both inputs regardless of where
/// they first differ.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Parse header lines into a case-insensitive map, rejecting duplicates of
/// security-critical headers.
fn parse_headers<'a, I>(lines: I, security_headers: &[&str]) -> Result<HashMap<String, String>>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers: HashMap<String, String> = HashMap::new();

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name_lower = name.trim().to_lowercase();
            if security_headers.contains(&name_lower.as_str()) && headers.contains_key(&name_lower)
            {
                return Err(Error::InvalidHandshake(format!(
                    "Duplicate header: {}",
                    name.trim()
                )));
            }
            headers.insert(name_lower, value.trim().to_string());
        }
    }

    Ok(headers)
}

fn validate_header_value(header: &str, value: &str) -> Result<()> {
    if value.contains('\r') || value.contains('\n') {
        return Err(Error::InvalidHandshake(format!(
            "{header} contains CR or LF characters"
        )));
    }
    Ok(())
}

/// Strip an optional `:port` suffix from a Host header value.
pub(crate) fn hostname_of(host: &str) -> String {
    // Bracketed IPv6 literals keep their brackets; everything after the
    // closing bracket (or the first colon otherwise) is the port.
    if let Some(end) = host.strip_prefix('[').and_then(|r| r.find(']')) {
        return host[..end + 2].to_string();
    }
    match host.split_once(':') {
        Some((name, _)) => name.to_string(),
        None => host.to_string(),
    }
}

/// Parsed client upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// The request URI (e.g. `/channel`).
    pub uri: String,
    /// The Host header value as sent.
    pub host: String,
    /// The Host value with any `:port` suffix removed.
    pub hostname: String,
    /// The Origin header value, if present.
    pub origin: Option<String>,
    /// The Cookie header value, if present.
    pub cookie: Option<String>,
    /// The Sec-WebSocket-Key upgrade nonce.
    pub key: String,
    /// The Sec-WebSocket-Version value.
    pub version: u8,
    /// Offered Sec-WebSocket-Protocol tokens, in client preference order.
    pub protocols: Vec<String>,
}

impl HandshakeRequest {
    /// Parse a complete request header block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the request line is
    /// malformed, the method is not `GET`, the HTTP version is not 1.1,
    /// or any required header is missing or duplicated.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidHandshake("Invalid UTF-8".into()))?;

        let mut lines = text.lines();
        let request_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("Empty request".into()))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Error::InvalidHandshake("Invalid request line".into()));
        }
        if parts[0] != "GET" {
            return Err(Error::InvalidHandshake(format!(
                "Expected GET method, got {}",
                parts[0]
            )));
        }
        if !parts[2].starts_with("HTTP/1.1") {
            return Err(Error::InvalidHandshake(format!(
                "Expected HTTP/1.1, got {}",
                parts[2]
            )));
        }
        let uri = parts[1].to_string();

        let security_headers = [
            "host",
            "upgrade",
            "connection",
            "sec-websocket-key",
            "sec-websocket-version",
        ];
        let headers = parse_headers(lines, &security_headers)?;

        let upgrade = headers
            .get("upgrade")
            .ok_or_else(|| Error::InvalidHandshake("Missing Upgrade header".into()))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Upgrade header: {upgrade}"
            )));
        }

        let connection = headers
            .get("connection")
            .ok_or_else(|| Error::InvalidHandshake("Missing Connection header".into()))?;
        if !connection.to_lowercase().contains("upgrade") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Connection header: {connection}"
            )));
        }

        let host = headers
            .get("host")
            .ok_or_else(|| Error::InvalidHandshake("Missing Host header".into()))?
            .clone();

        let key = headers
            .get("sec-websocket-key")
            .ok_or_else(|| Error::InvalidHandshake("Missing Sec-WebSocket-Key header".into()))?
            .clone();

        let version_str = headers.get("sec-websocket-version").ok_or_else(|| {
            Error::InvalidHandshake("Missing Sec-WebSocket-Version header".into())
        })?;
        let version: u8 = version_str
            .parse()
            .map_err(|_| Error::InvalidHandshake(format!("Invalid version: {version_str}")))?;

        let origin = headers.get("origin").cloned();
        let cookie = headers.get("cookie").cloned();
        let protocols = headers
            .get("sec-websocket-protocol")
            .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        Ok(Self {
            hostname: hostname_of(&host),
            uri,
            host,
            origin,
            cookie,
            key,
            version,
            protocols,
        })
    }

    /// Validate the parsed request for an upgrade to version 13.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the version is unsupported,
    /// the key does not decode to 16 bytes, or the Host is empty.
    pub fn validate(&self) -> Result<()> {
        if self.version != WS_VERSION {
            return Err(Error::InvalidHandshake(format!(
                "Unsupported WebSocket version: {} (expected {WS_VERSION})",
                self.version
            )));
        }

        match BASE64.decode(&self.key) {
            Ok(decoded) if decoded.len() == 16 => {}
            Ok(decoded) => {
                return Err(Error::InvalidHandshake(format!(
                    "Sec-WebSocket-Key must be 16 bytes, got {}",
                    decoded.len()
                )));
            }
            Err(_) => {
                return Err(Error::InvalidHandshake(
                    "Invalid Sec-WebSocket-Key: not valid Base64".into(),
                ));
            }
        }

        if self.host.is_empty() {
            return Err(Error::InvalidHandshake("Host header cannot be empty".into()));
        }

        Ok(())
    }

    /// Serialize this request as the client's upgrade header block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if any header value would
    /// inject CR/LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        validate_header_value("URI", &self.uri)?;
        validate_header_value("Host", &self.host)?;

        buf.extend_from_slice(format!("GET {} HTTP/1.1\r\n", self.uri).as_bytes());
        buf.extend_from_slice(format!("Host: {}\r\n", self.host).as_bytes());
        buf.extend_from_slice(b"Upgrade: websocket\r\n");
        buf.extend_from_slice(b"Connection: Upgrade\r\n");
        buf.extend_from_slice(format!("Sec-WebSocket-Key: {}\r\n", self.key).as_bytes());
        buf.extend_from_slice(format!("Sec-WebSocket-Version: {}\r\n", self.version).as_bytes());

        if let Some(ref origin) = self.origin {
            validate_header_value("Origin", origin)?;
            buf.extend_from_slice(format!("Origin: {origin}\r\n").as_bytes());
        }
        if let Some(ref cookie) = self.cookie {
            validate_header_value("Cookie", cookie)?;
            buf.extend_from_slice(format!("Cookie: {cookie}\r\n").as_bytes());
        }
        if !self.protocols.is_empty() {
            let joined = self.protocols.join(", ");
            validate_header_value("Sec-WebSocket-Protocol", &joined)?;
            buf.extend_from_slice(format!("Sec-WebSocket-Protocol: {joined}\r\n").as_bytes());
        }

        buf.extend_from_slice(b"\r\n");
        Ok(())
    }
}

/// Server upgrade response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// The Sec-WebSocket-Accept token.
    pub accept: String,
    /// The selected sub-protocol, if any.
    pub protocol: Option<String>,
}

impl HandshakeResponse {
    /// Build the response for a validated request, selecting `protocol`.
    #[must_use]
    pub fn from_request(req: &HandshakeRequest, protocol: Option<String>) -> Self {
        Self {
            accept: compute_accept_key(&req.key),
            protocol,
        }
    }

    /// Serialize the `101 Switching Protocols` response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the selected protocol would
    /// inject CR/LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.extend_from_slice(b"Upgrade: websocket\r\n");
        buf.extend_from_slice(b"Connection: Upgrade\r\n");
        buf.extend_from_slice(format!("Sec-WebSocket-Accept: {}\r\n", self.accept).as_bytes());

        if let Some(ref proto) = self.protocol {
            validate_header_value("Sec-WebSocket-Protocol", proto)?;
            buf.extend_from_slice(format!("Sec-WebSocket-Protocol: {proto}\r\n").as_bytes());
        }

        buf.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Parse a complete response header block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the status is not 101 or
    /// required headers are missing.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidHandshake("Invalid UTF-8".into()))?;

        let mut lines = text.lines();
        let status_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("Empty response".into()))?;

        if !status_line.starts_with("HTTP/1.1 101") {
            return Err(Error::InvalidHandshake(format!(
                "Expected 101 status, got: {status_line}"
            )));
        }

        let headers = parse_headers(lines, &[])?;

        let upgrade = headers
            .get("upgrade")
            .ok_or_else(|| Error::InvalidHandshake("Missing Upgrade header in response".into()))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Upgrade header: {upgrade}"
            )));
        }

        let connection = headers.get("connection").ok_or_else(|| {
            Error::InvalidHandshake("Missing Connection header in response".into())
        })?;
        if !connection.to_lowercase().contains("upgrade") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Connection header: {connection}"
            )));
        }

        let accept = headers
            .get("sec-websocket-accept")
            .ok_or_else(|| Error::InvalidHandshake("Missing Sec-WebSocket-Accept header".into()))?
            .clone();

        let protocol = headers.get("sec-websocket-protocol").cloned();

        Ok(Self { accept, protocol })
    }

    /// Validate the echoed accept token against the nonce this side sent.
    ///
    /// Uses a constant-time comparison.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] on mismatch.
    pub fn validate_accept(&self, nonce: &str) -> Result<()> {
        let expected = compute_accept_key(nonce);
        if !constant_time_eq(self.accept.as_bytes(), expected.as_bytes()) {
            return Err(Error::InvalidHandshake(
                "Sec-WebSocket-Accept does not match nonce".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn sample_request() -> Vec<u8> {
        b"GET /channel HTTP/1.1\r\n\
          Host: server.example.com:8080\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\
          Origin: http://example.com\r\n\
          Cookie: session=abc123\r\n\
          Sec-WebSocket-Protocol: binary, base64\r\n\
          \r\n"
            .to_vec()
    }

    #[test]
    fn test_compute_accept_key_rfc_example() {
        // RFC 6455 Section 1.3 example
        assert_eq!(compute_accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_header_end(b""), None);
        // Body bytes after the delimiter do not move the boundary.
        assert_eq!(find_header_end(b"X\r\n\r\nBODY"), Some(5));
    }

    #[test]
    fn test_parse_valid_request() {
        let req = HandshakeRequest::parse(&sample_request()).unwrap();
        assert_eq!(req.uri, "/channel");
        assert_eq!(req.host, "server.example.com:8080");
        assert_eq!(req.hostname, "server.example.com");
        assert_eq!(req.origin, Some("http://example.com".to_string()));
        assert_eq!(req.cookie, Some("session=abc123".to_string()));
        assert_eq!(req.key, SAMPLE_KEY);
        assert_eq!(req.version, 13);
        assert_eq!(req.protocols, vec!["binary", "base64"]);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_parse_request_missing_version() {
        let request = b"GET / HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";

        let result = HandshakeRequest::parse(request);
        assert!(
            matches!(result, Err(Error::InvalidHandshake(msg)) if msg.contains("Version"))
        );
    }

    #[test]
    fn test_parse_request_missing_key() {
        let request = b"GET / HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";

        let result = HandshakeRequest::parse(request);
        assert!(
            matches!(result, Err(Error::InvalidHandshake(msg)) if msg.contains("Sec-WebSocket-Key"))
        );
    }

    #[test]
    fn test_parse_request_wrong_method() {
        let request = b"POST / HTTP/1.1\r\n\
            Host: x\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";

        let result = HandshakeRequest::parse(request);
        assert!(matches!(result, Err(Error::InvalidHandshake(msg)) if msg.contains("GET")));
    }

    #[test]
    fn test_validate_wrong_version() {
        let mut req = HandshakeRequest::parse(&sample_request()).unwrap();
        req.version = 8;
        let result = req.validate();
        assert!(matches!(result, Err(Error::InvalidHandshake(msg)) if msg.contains("version")));
    }

    #[test]
    fn test_validate_short_key() {
        let mut req = HandshakeRequest::parse(&sample_request()).unwrap();
        req.key = "c2hvcnQ=".to_string(); // "short" - 5 bytes
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_duplicate_host_header_rejected() {
        let request = b"GET / HTTP/1.1\r\n\
Host: example.com\r\n\
Host: evil.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

        let result = HandshakeRequest::parse(request);
        assert!(matches!(result, Err(Error::InvalidHandshake(msg)) if msg.contains("Duplicate")));
    }

    #[test]
    fn test_request_write_roundtrip() {
        let original = HandshakeRequest {
            uri: "/channel".to_string(),
            host: "example.com".to_string(),
            hostname: "example.com".to_string(),
            origin: Some("http://example.com".to_string()),
            cookie: None,
            key: SAMPLE_KEY.to_string(),
            version: 13,
            protocols: vec!["base64".to_string()],
        };

        let mut buf = Vec::new();
        original.write(&mut buf).unwrap();
        let parsed = HandshakeRequest::parse(&buf).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_crlf_injection_rejected() {
        let req = HandshakeRequest {
            uri: "/".to_string(),
            host: "example.com".to_string(),
            hostname: "example.com".to_string(),
            origin: Some("http://x\r\nX-Evil: yes".to_string()),
            cookie: None,
            key: SAMPLE_KEY.to_string(),
            version: 13,
            protocols: vec![],
        };
        let mut buf = Vec::new();
        assert!(req.write(&mut buf).is_err());
    }

    #[test]
    fn test_response_roundtrip_and_accept() {
        let req = HandshakeRequest::parse(&sample_request()).unwrap();
        let resp = HandshakeResponse::from_request(&req, Some("binary".to_string()));

        let mut buf = Vec::new();
        resp.write(&mut buf).unwrap();
        let parsed = HandshakeResponse::parse(&buf).unwrap();

        assert_eq!(parsed.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(parsed.protocol, Some("binary".to_string()));
        assert!(parsed.validate_accept(SAMPLE_KEY).is_ok());
    }

    #[test]
    fn test_response_accept_mismatch() {
        let resp = HandshakeResponse {
            accept: "bm90IHRoZSByaWdodCB0b2tlbg==".to_string(),
            protocol: None,
        };
        assert!(resp.validate_accept(SAMPLE_KEY).is_err());
    }

    #[test]
    fn test_response_missing_accept() {
        let response = b"HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            \r\n";

        let result = HandshakeResponse::parse(response);
        assert!(
            matches!(result, Err(Error::InvalidHandshake(msg)) if msg.contains("Sec-WebSocket-Accept"))
        );
    }

    #[test]
    fn test_response_wrong_status() {
        let response = b"HTTP/1.1 400 Bad Request\r\n\r\n";
        let result = HandshakeResponse::parse(response);
        assert!(matches!(result, Err(Error::InvalidHandshake(msg)) if msg.contains("101")));
    }

    #[test]
    fn test_generate_nonce_shape() {
        let nonce = generate_nonce().unwrap();
        let decoded = BASE64.decode(&nonce).unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(nonce, generate_nonce().unwrap());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"sane"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_hostname_of() {
        assert_eq!(hostname_of("example.com:8080"), "example.com");
        assert_eq!(hostname_of("example.com"), "example.com");
        assert_eq!(hostname_of("[::1]:8080"), "[::1]");
    }
}
