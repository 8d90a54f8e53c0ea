use std::io::BufRead;

use crate::error::{ParseErrorKind, RelayError};
use crate::protocol::{RTSP_VERSION, find_header, read_body, read_head};

/// An RTSP request (RFC 2326 §6).
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// The server side parses requests with [`parse`](Self::parse) /
/// [`read_from`](Self::read_from); the client control session builds them
/// with [`new`](Self::new) and the chaining builder methods, then
/// [`serialize`](Self::serialize)s. `Content-Length` is computed
/// automatically when a body is present.
///
/// Header lookup is case-insensitive per RFC 2326 §4.2.
#[derive(Debug)]
#[must_use]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, etc.).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/stream`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs, stored as-received.
    pub headers: Vec<(String, String)>,
    /// Message body (e.g. SET_PARAMETER parameter lines).
    pub body: Option<String>,
}

impl RtspRequest {
    pub fn new(method: &str, uri: &str) -> Self {
        RtspRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            version: RTSP_VERSION.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut request = format!("{} {} {}\r\n", self.method, self.uri, self.version);

        for (name, value) in &self.headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
            request.push_str("\r\n");
            request.push_str(body);
        } else {
            request.push_str("\r\n");
        }
        request
    }

    /// Parse a request head (start line + headers) from its text form.
    ///
    /// The body, if any, is attached separately by [`read_from`](Self::read_from).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines.next().ok_or(RelayError::Parse {
            kind: ParseErrorKind::EmptyMessage,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(RelayError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != RTSP_VERSION {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
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

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body: None,
        })
    }

    /// Read one complete request (head + `Content-Length` body) from a
    /// connection. Returns `Ok(None)` on clean EOF.
    pub fn read_from<R: BufRead>(reader: &mut R) -> crate::error::Result<Option<Self>> {
        let head = match read_head(reader)? {
            Some(head) => head,
            None => return Ok(None),
        };
        let mut request = Self::parse(&head)?;

        if let Some(len) = request
            .get_header("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            if len > 0 {
                request.body = Some(read_body(reader, len)?);
            }
        }
        Ok(Some(request))
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns the CSeq header value, which correlates RTSP request/response
    /// pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Session ID from the `Session` header, with any `;timeout=` suffix
    /// stripped.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }
}
