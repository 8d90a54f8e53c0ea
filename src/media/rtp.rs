//! Interleaved RTP packet encoder (RFC 3550 §5.1, RFC 2326 §10.12).
//!
//! Each media unit becomes one interleaved data frame carrying one RTP
//! packet:
//!
//! ```text
//! +---+---------+-------------------+
//! |'$'| channel |   length (u16)    |   4-byte interleaved frame header
//! +---+---------+-------------------+
//! |V=2|P|X| CC  |M|  PT |  sequence |
//! |            timestamp            |  12-byte RTP fixed header
//! |              SSRC               |
//! +---------------------------------+
//! |            payload…             |
//! +---------------------------------+
//! ```
//!
//! Version is always 2; padding, extension and CSRC count are always 0; the
//! marker bit is set on every packet (one unit per packet). Sequence number
//! and timestamp are supplied by the caller — the scheduler owns the
//! wrapping counter so it survives encoder replacement.

use rand::Rng;

use crate::media::PacketEncoder;
use crate::source::MediaUnit;

/// Interleaved frame header length.
pub const INTERLEAVED_HEADER_LEN: usize = 4;
/// RTP fixed header length (no CSRCs).
pub const RTP_HEADER_LEN: usize = 12;
/// Interleaved channel carrying media data.
pub const DATA_CHANNEL: u8 = 0;

/// [`PacketEncoder`] producing interleaved RTP frames on channel 0.
#[derive(Debug)]
pub struct InterleavedRtpEncoder {
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
}

impl InterleavedRtpEncoder {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self { payload_type, ssrc }
    }

    /// Create with a random SSRC.
    ///
    /// Per RFC 3550 §8.1, the SSRC is chosen randomly to minimize the
    /// probability of collisions between independent sessions.
    pub fn with_random_ssrc(payload_type: u8) -> Self {
        let ssrc = rand::rng().random::<u32>();
        Self::new(payload_type, ssrc)
    }
}

impl PacketEncoder for InterleavedRtpEncoder {
    fn estimate_size(&self, unit: &MediaUnit) -> usize {
        INTERLEAVED_HEADER_LEN + RTP_HEADER_LEN + unit.payload.len()
    }

    fn encode(&self, buf: &mut Vec<u8>, unit: &MediaUnit, seq: u16, rtp_timestamp: u32) {
        let rtp_len = RTP_HEADER_LEN + unit.payload.len();

        buf.push(b'$');
        buf.push(DATA_CHANNEL);
        buf.extend_from_slice(&(rtp_len as u16).to_be_bytes());

        buf.push(2 << 6);
        buf.push(0x80 | self.payload_type);
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&rtp_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());

        buf.extend_from_slice(&unit.payload);
    }
}
