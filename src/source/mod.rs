//! Media sources.
//!
//! A [`MediaSource`] produces an ordered sequence of timestamped media
//! units — encoded payload plus a decode timestamp in milliseconds. Where
//! the units come from (a demuxed file, a remote camera, a generator) is
//! the implementation's business; the scheduler only pulls, paces, and
//! closes. Container demuxing and codec parameter extraction happen behind
//! this trait.

pub mod memory;

use crate::error::Result;

pub use memory::{MemorySource, MemorySourceFactory};

/// One encoded media unit.
///
/// The payload is owned: the scheduler holds it exclusively from the pull
/// until the batch is encoded, then drops it.
#[derive(Debug, Clone)]
pub struct MediaUnit {
    /// Encoded payload bytes (opaque to the relay).
    pub payload: Vec<u8>,
    /// Decode timestamp in milliseconds. Negative timestamps mark units
    /// the scheduler discards while priming.
    pub dts_ms: i64,
}

impl MediaUnit {
    pub fn new(payload: Vec<u8>, dts_ms: i64) -> Self {
        Self { payload, dts_ms }
    }
}

/// Static description of a source's single media stream.
///
/// Carries what SDP generation needs: codec identity and the opaque
/// codec parameter sets (e.g. H.264 SPS/PPS for `sprop-parameter-sets`).
#[derive(Debug, Clone)]
pub struct SourceDescription {
    /// Codec name for the `a=rtpmap` attribute (e.g. `"H264"`).
    pub codec: String,
    /// RTP payload type (dynamic range 96–127).
    pub payload_type: u8,
    /// RTP clock rate in Hz (90000 for video per RFC 3551 §4).
    pub clock_rate: u32,
    /// Sequence parameter set, as extracted from the container.
    pub sps: Vec<u8>,
    /// Picture parameter set, as extracted from the container.
    pub pps: Vec<u8>,
}

/// An ordered, possibly finite sequence of media units.
///
/// Contract:
/// - [`next`](Self::next) may only be called while [`has_next`](Self::has_next)
///   is true; past the end it fails with
///   [`RelayError::SourceExhausted`](crate::RelayError::SourceExhausted).
/// - [`close`](Self::close) releases underlying resources; the instance is
///   unusable afterwards. Reopening means asking the factory for a fresh
///   instance.
pub trait MediaSource: Send {
    /// Whether another unit is available.
    fn has_next(&self) -> bool;

    /// Pull the next unit, transferring ownership to the caller.
    fn next(&mut self) -> Result<MediaUnit>;

    /// Release underlying resources.
    fn close(&mut self) -> Result<()>;

    /// Static stream description, independent of the read position.
    fn description(&self) -> SourceDescription;
}

/// Opens fresh [`MediaSource`] instances.
///
/// One factory backs one stream; the scheduler opens an instance per
/// session run (and again on every loop restart).
pub trait SourceFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn MediaSource>>;
}
