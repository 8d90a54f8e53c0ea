//! Per-method reply decoding.
//!
//! Every in-flight request carries a [`ReplyKind`] tag; when the matching
//! response arrives, [`decode`] turns the raw [`RtspResponse`] into the
//! typed [`RtspReply`] the caller's callback receives. Decoding is a pure
//! function of the tag and the response, so the pending-request table stays
//! a plain data structure.

use crate::error::{ParseErrorKind, RelayError, Result};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::{SdpDescription, parse_sdp};

/// Which decoder to apply to a pending request's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Describe,
    Setup,
    Play,
    /// GET_PARAMETER and SET_PARAMETER; both acknowledge without payload.
    Parameter,
}

/// Decoded result of a successful RTSP reply.
#[derive(Debug)]
pub enum RtspReply {
    Describe {
        /// `Content-Base` header, the base URL for relative track controls.
        content_base: Option<String>,
        sdp: SdpDescription,
    },
    Setup {
        /// Session identifier with any `;timeout=` suffix stripped.
        session_id: String,
    },
    Play,
    Parameter,
}

/// Decode a success reply according to its request's kind.
pub fn decode(kind: ReplyKind, response: &RtspResponse) -> Result<RtspReply> {
    match kind {
        ReplyKind::Describe => {
            let content_base = response
                .get_header("Content-Base")
                .map(|s| s.to_string());
            let sdp = parse_sdp(response.body.as_deref().unwrap_or(""));
            Ok(RtspReply::Describe { content_base, sdp })
        }
        ReplyKind::Setup => {
            let session_id = response
                .session_id()
                .map(|s| s.to_string())
                .ok_or(RelayError::Parse {
                    kind: ParseErrorKind::InvalidHeader,
                })?;
            Ok(RtspReply::Setup { session_id })
        }
        ReplyKind::Play => Ok(RtspReply::Play),
        ReplyKind::Parameter => Ok(RtspReply::Parameter),
    }
}
