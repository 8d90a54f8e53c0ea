//! SDP generation and parsing (RFC 4566 / RFC 8866).
//!
//! The server generates the SDP body for DESCRIBE responses from a source
//! description; the client parses DESCRIBE reply bodies into
//! [`SdpDescription`], the structured result reported to the caller.
//!
//! Generated format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                             ← session name
//! c=IN IP4 <addr>                              ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=tool:relay-rs
//! a=sendonly
//! a=control:*
//! m=video 0 RTP/AVP 96                         ← media description
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;...           ← codec parameters
//! a=control:track1                             ← track control URL
//! ```
//!
//! The `a=fmtp` line carries `sprop-parameter-sets` (base64 SPS,PPS) and a
//! `profile-level-id` derived from the SPS profile bytes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::source::SourceDescription;

/// A parsed SDP session description (the subset this relay consumes).
#[derive(Debug, Clone, Default)]
pub struct SdpDescription {
    /// Session name (`s=`).
    pub session_name: String,
    /// Session-level `a=control` attribute, usually `*`.
    pub session_control: Option<String>,
    /// Media sections, in declaration order.
    pub media: Vec<SdpMedia>,
}

/// One `m=` section of an SDP body.
#[derive(Debug, Clone, Default)]
pub struct SdpMedia {
    /// Media kind (`video`, `audio`, ...).
    pub kind: String,
    /// RTP payload type from the `m=` line.
    pub payload_type: u8,
    /// `a=rtpmap:<pt> <codec>/<clock>` value, without the prefix.
    pub rtpmap: Option<String>,
    /// `a=fmtp:<pt> ...` value, without the prefix.
    pub fmtp: Option<String>,
    /// Media-level `a=control` attribute (relative or absolute track URL).
    pub control: Option<String>,
}

/// Generate an SDP session description for one media stream.
pub fn generate_sdp(
    desc: &SourceDescription,
    ip: &str,
    session_id: &str,
    session_version: &str,
    username: &str,
    session_name: &str,
) -> String {
    let pt = desc.payload_type;
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        username, session_id, session_version, ip
    ));
    sdp.push(format!("s={}", session_name));
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:relay-rs".to_string());
    sdp.push("a=sendonly".to_string());
    sdp.push("a=control:*".to_string());
    sdp.push(format!("m=video 0 RTP/AVP {}", pt));
    sdp.push(format!("a=rtpmap:{} {}/{}", pt, desc.codec, desc.clock_rate));
    sdp.push(format!("a=fmtp:{} {}", pt, fmtp_value(desc)));
    sdp.push("a=control:track1".to_string());

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

fn fmtp_value(desc: &SourceDescription) -> String {
    let mut value = "packetization-mode=1".to_string();

    // profile_idc, constraint flags and level_idc follow the SPS NAL header.
    if desc.sps.len() >= 4 {
        value.push_str(&format!(
            ";profile-level-id={:02x}{:02x}{:02x}",
            desc.sps[1], desc.sps[2], desc.sps[3]
        ));
    }
    if !desc.sps.is_empty() && !desc.pps.is_empty() {
        value.push_str(&format!(
            ";sprop-parameter-sets={},{}",
            BASE64.encode(&desc.sps),
            BASE64.encode(&desc.pps)
        ));
    }
    value
}

/// Parse an SDP body into the structured subset the client reports.
///
/// Unknown lines are skipped; attributes before the first `m=` line are
/// session-level.
pub fn parse_sdp(body: &str) -> SdpDescription {
    let mut desc = SdpDescription::default();

    for line in body.lines() {
        let line = line.trim_end();
        if let Some(name) = line.strip_prefix("s=") {
            desc.session_name = name.to_string();
        } else if let Some(media_line) = line.strip_prefix("m=") {
            // m=<kind> <port> <proto> <pt>
            let mut parts = media_line.split_whitespace();
            let kind = parts.next().unwrap_or("").to_string();
            let payload_type = parts.nth(2).and_then(|pt| pt.parse().ok()).unwrap_or(0);
            desc.media.push(SdpMedia {
                kind,
                payload_type,
                ..SdpMedia::default()
            });
        } else if let Some(attr) = line.strip_prefix("a=") {
            match desc.media.last_mut() {
                None => {
                    if let Some(control) = attr.strip_prefix("control:") {
                        desc.session_control = Some(control.to_string());
                    }
                }
                Some(media) => {
                    if let Some(control) = attr.strip_prefix("control:") {
                        media.control = Some(control.to_string());
                    } else if let Some(rtpmap) = attr.strip_prefix("rtpmap:") {
                        media.rtpmap = Some(rtpmap.to_string());
                    } else if let Some(fmtp) = attr.strip_prefix("fmtp:") {
                        media.fmtp = Some(fmtp.to_string());
                    }
                }
            }
        }
    }
    desc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_description() -> SourceDescription {
        SourceDescription {
            codec: "H264".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
            sps: vec![0x67, 0x42, 0x00, 0x1f, 0xe9],
            pps: vec![0x68, 0xce, 0x38, 0x80],
        }
    }

    #[test]
    fn generates_h264_sdp() {
        let sdp = generate_sdp(
            &h264_description(),
            "192.168.1.100",
            "1234567890",
            "1",
            "server",
            "Test Session",
        );
        assert!(sdp.contains("v=0\r\n"));
        assert!(sdp.contains("o=server 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=Test Session\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("a=sendonly\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("profile-level-id=42001f"));
        assert!(sdp.contains("sprop-parameter-sets="));
        assert!(sdp.contains("a=control:track1\r\n"));
        assert!(sdp.ends_with("\r\n"));

        // rtpmap must precede fmtp (RFC 6184 §8.2.1), media attrs follow m=.
        let rtpmap_idx = sdp.find("a=rtpmap").unwrap();
        let fmtp_idx = sdp.find("a=fmtp").unwrap();
        let m_idx = sdp.find("m=video").unwrap();
        assert!(rtpmap_idx < fmtp_idx);
        assert!(m_idx < rtpmap_idx);
    }

    #[test]
    fn parse_roundtrips_generated_sdp() {
        let sdp = generate_sdp(&h264_description(), "10.0.0.1", "0", "0", "-", "Stream");
        let parsed = parse_sdp(&sdp);

        assert_eq!(parsed.session_name, "Stream");
        assert_eq!(parsed.session_control.as_deref(), Some("*"));
        assert_eq!(parsed.media.len(), 1);

        let media = &parsed.media[0];
        assert_eq!(media.kind, "video");
        assert_eq!(media.payload_type, 96);
        assert_eq!(media.rtpmap.as_deref(), Some("96 H264/90000"));
        assert_eq!(media.control.as_deref(), Some("track1"));
        assert!(media.fmtp.as_deref().unwrap().contains("packetization-mode=1"));
    }

    #[test]
    fn parse_skips_unknown_lines() {
        let body = "v=0\r\nb=AS:5000\r\ns=cam\r\nm=video 0 RTP/AVP 98\r\na=rtpmap:98 H264/90000\r\n";
        let parsed = parse_sdp(body);
        assert_eq!(parsed.session_name, "cam");
        assert_eq!(parsed.media[0].payload_type, 98);
    }
}
