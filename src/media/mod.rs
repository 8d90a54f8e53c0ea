//! Packet encoding.
//!
//! The scheduler batches [`MediaUnit`]s and hands each one to a
//! [`PacketEncoder`] together with the session's RTP sequence counter and a
//! clock-rate-scaled timestamp. The encoder appends exactly
//! [`estimate_size`](PacketEncoder::estimate_size) bytes, which lets the
//! scheduler size one shared output buffer for a whole batch up front.
//!
//! The concrete wire layout (interleaved framing + RTP fixed header) lives
//! in [`rtp`].

pub mod rtp;

use crate::source::MediaUnit;

pub use rtp::InterleavedRtpEncoder;

/// Turns one media unit into wire bytes.
pub trait PacketEncoder: Send {
    /// Exact number of bytes [`encode`](Self::encode) will append for `unit`.
    fn estimate_size(&self, unit: &MediaUnit) -> usize;

    /// Append the encoded packet for `unit` to `buf`.
    ///
    /// `seq` is the 16-bit wrapping RTP sequence number, `rtp_timestamp` the
    /// presentation timestamp already scaled to the codec clock rate.
    fn encode(&self, buf: &mut Vec<u8>, unit: &MediaUnit, seq: u16, rtp_timestamp: u32);
}
