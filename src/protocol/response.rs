use std::io::BufRead;

use crate::error::{ParseErrorKind, RelayError};
use crate::protocol::{RTSP_VERSION, find_header, read_body, read_head};

/// An RTSP response (RFC 2326 §7).
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// The server builds responses with the chaining builder and
/// [`serialize`](Self::serialize); the client control session parses them
/// with [`read_from`](Self::read_from). `Content-Length` is computed
/// automatically when a body is present.
#[derive(Debug)]
#[must_use]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Server identification string included in every RTSP response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = "relay-rs/0.1";

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// 200 OK — success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 400 Bad Request — malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 405 Method Not Allowed — method not supported on this resource.
    pub fn method_not_allowed() -> Self {
        Self::new(405, "Method Not Allowed")
    }

    /// 454 Session Not Found (RFC 2326 §7.1.1).
    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    /// 461 Unsupported Transport (RFC 2326 §7.1.1).
    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether the status denotes success.
    pub fn is_ok(&self) -> bool {
        self.status_code == 200
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut response = format!("{} {} {}\r\n", RTSP_VERSION, self.status_code, self.status_text);

        for (name, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
            response.push_str("\r\n");
            response.push_str(body);
        } else {
            response.push_str("\r\n");
        }
        response
    }

    /// Parse a response head (status line + headers) from its text form.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let status_line = lines.next().ok_or(RelayError::Parse {
            kind: ParseErrorKind::EmptyMessage,
        })?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        let code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or(RelayError::Parse {
                kind: ParseErrorKind::InvalidStatusLine,
            })?;
        let reason = parts.next().unwrap_or("").to_string();

        if !version.starts_with("RTSP/") {
            return Err(RelayError::Parse {
                kind: ParseErrorKind::InvalidStatusLine,
            });
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon_pos = line.find(':').ok_or(RelayError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();
            headers.push((name, value));
        }

        Ok(RtspResponse {
            status_code: code,
            status_text: reason,
            headers,
            body: None,
        })
    }

    /// Read one complete response (head + `Content-Length` body) off a
    /// connection. Returns `Ok(None)` on clean EOF.
    pub fn read_from<R: BufRead>(reader: &mut R) -> crate::error::Result<Option<Self>> {
        let head = match read_head(reader)? {
            Some(head) => head,
            None => return Ok(None),
        };
        let mut response = Self::parse(&head)?;

        if let Some(len) = response
            .get_header("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            if len > 0 {
                response.body = Some(read_body(reader, len)?);
            }
        }
        Ok(Some(response))
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// CSeq header parsed as an integer.
    pub fn cseq(&self) -> Option<u32> {
        self.get_header("CSeq").and_then(|v| v.trim().parse().ok())
    }

    /// Session ID from the `Session` header, with any `;` parameter
    /// (e.g. `;timeout=60`) stripped.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn serialize_no_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS");
        let s = resp.serialize();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("Server: relay-rs/0.1\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.ends_with("\r\n"));
    }

    #[test]
    fn serialize_with_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n".to_string());
        let s = resp.serialize();
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("v=0\r\n"));
    }

    #[test]
    fn parse_ok_status_line() {
        let resp = RtspResponse::parse("RTSP/1.0 200 OK\r\nCSeq: 7\r\n\r\n").unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.cseq(), Some(7));
    }

    #[test]
    fn parse_error_status() {
        let resp = RtspResponse::parse("RTSP/1.0 454 Session Not Found\r\nCSeq: 3\r\n\r\n").unwrap();
        assert!(!resp.is_ok());
        assert_eq!(resp.status_code, 454);
        assert_eq!(resp.status_text, "Session Not Found");
    }

    #[test]
    fn parse_rejects_non_rtsp() {
        assert!(RtspResponse::parse("HTTP/1.1 200 OK\r\n\r\n").is_err());
        assert!(RtspResponse::parse("garbage\r\n\r\n").is_err());
    }

    #[test]
    fn session_id_strips_parameters() {
        let resp =
            RtspResponse::parse("RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: 12AB;timeout=60\r\n\r\n")
                .unwrap();
        assert_eq!(resp.session_id(), Some("12AB"));
    }

    #[test]
    fn read_from_consumes_body() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 5\r\n\r\nv=0\r\n";
        let mut reader = BufReader::new(raw.as_bytes());
        let resp = RtspResponse::read_from(&mut reader).unwrap().unwrap();
        assert_eq!(resp.body.as_deref(), Some("v=0\r\n"));
    }

    #[test]
    fn read_from_clean_eof_is_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(RtspResponse::read_from(&mut reader).unwrap().is_none());
    }
}
