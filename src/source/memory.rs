//! In-memory media source.
//!
//! Replays a fixed sequence of units from memory. Used by the standalone
//! server binary (synthetic stream) and throughout the test suite; a real
//! deployment would put a demuxer behind [`MediaSource`] instead.

use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::source::{MediaSource, MediaUnit, SourceDescription, SourceFactory};

/// A [`MediaSource`] reading from a shared in-memory unit sequence.
pub struct MemorySource {
    units: Arc<Vec<MediaUnit>>,
    description: SourceDescription,
    pos: usize,
    closed: bool,
}

impl MediaSource for MemorySource {
    fn has_next(&self) -> bool {
        !self.closed && self.pos < self.units.len()
    }

    fn next(&mut self) -> Result<MediaUnit> {
        if !self.has_next() {
            return Err(RelayError::SourceExhausted);
        }
        let unit = self.units[self.pos].clone();
        self.pos += 1;
        Ok(unit)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn description(&self) -> SourceDescription {
        self.description.clone()
    }
}

/// Factory handing out [`MemorySource`] instances over one shared sequence.
///
/// Cloning the factory is cheap; the unit sequence is shared via `Arc`.
#[derive(Clone)]
pub struct MemorySourceFactory {
    units: Arc<Vec<MediaUnit>>,
    description: SourceDescription,
}

impl MemorySourceFactory {
    pub fn new(units: Vec<MediaUnit>, description: SourceDescription) -> Self {
        Self {
            units: Arc::new(units),
            description,
        }
    }

    /// Build a synthetic H.264-shaped stream: `frames` units of
    /// `payload_len` bytes each, timestamped at a fixed `fps` cadence
    /// starting at dts 0.
    ///
    /// The payloads are filler, not a decodable bitstream; the parameter
    /// sets are minimal placeholders so DESCRIBE produces a well-formed SDP.
    pub fn synthetic(frames: usize, fps: u32, payload_len: usize) -> Self {
        let interval_ms = 1000 / i64::from(fps.max(1));
        let units = (0..frames)
            .map(|i| MediaUnit::new(vec![(i % 251) as u8; payload_len], i as i64 * interval_ms))
            .collect();

        let description = SourceDescription {
            codec: "H264".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
            // Baseline profile SPS/PPS stubs, enough for sprop generation.
            sps: vec![0x67, 0x42, 0x00, 0x1f, 0xe9, 0x01, 0x40, 0x7b, 0x20],
            pps: vec![0x68, 0xce, 0x38, 0x80],
        };
        Self::new(units, description)
    }
}

impl SourceFactory for MemorySourceFactory {
    fn open(&self) -> Result<Box<dyn MediaSource>> {
        Ok(Box::new(MemorySource {
            units: self.units.clone(),
            description: self.description.clone(),
            pos: 0,
            closed: false,
        }))
    }
}
