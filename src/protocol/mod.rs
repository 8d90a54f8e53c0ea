//! RTSP protocol implementation (RFC 2326).
//!
//! Text-based RTSP signaling, used from both directions:
//!
//! - the **server** shim parses [`RtspRequest`]s off a connection and
//!   serializes [`RtspResponse`]s;
//! - the **client** control session serializes [`RtspRequest`]s and parses
//!   [`RtspResponse`]s as they arrive.
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Both message types read optional `Content-Length` bodies and look up
//! headers case-insensitively (RFC 2326 §4.2). SDP bodies are handled by
//! [`sdp`].

pub mod request;
pub mod response;
pub mod sdp;

use std::io::{BufRead, Read};

pub use request::RtspRequest;
pub use response::RtspResponse;

/// RTSP protocol version emitted and expected by this crate.
pub const RTSP_VERSION: &str = "RTSP/1.0";

/// Read one message head (start line + headers) up to the blank line.
///
/// Returns `Ok(None)` on clean EOF before any byte of a new message.
pub(crate) fn read_head<R: BufRead>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            if head.trim().is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-message",
            ));
        }
        if line == "\r\n" || line == "\n" {
            if head.trim().is_empty() {
                // Tolerate stray blank lines between messages.
                continue;
            }
            return Ok(Some(head));
        }
        head.push_str(&line);
    }
}

/// Read a `Content-Length` body following a message head.
pub(crate) fn read_body<R: BufRead>(reader: &mut R, len: usize) -> std::io::Result<String> {
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Case-insensitive header lookup over ordered (name, value) pairs.
pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
