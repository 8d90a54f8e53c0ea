//! RTSP media relay: a client-side control session and a real-time
//! fan-out scheduler, joined by a small interleaved-TCP RTSP server.
//!
//! The three public surfaces:
//!
//! - [`client::RtspControlSession`] drives the control connection to an
//!   RTSP server: DESCRIBE/SETUP/PLAY/GET_PARAMETER/SET_PARAMETER with
//!   CSeq correlation and a keep-alive chain.
//! - [`scheduler::StreamingScheduler`] paces one media stream to a group
//!   of consumers in real time: batching under byte/count/span limits,
//!   drift absorption under backpressure, lockstep broadcast.
//! - [`server::Server`] serves the scheduler's stream to RTSP viewers
//!   over interleaved TCP.

pub mod client;
pub mod consumer;
pub mod error;
pub mod media;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod source;
pub mod stats;
pub mod timer;

pub use client::{ConnectOptions, RtspControlSession, RtspReply, SessionObserver};
pub use consumer::{Consumer, ConsumerGroup};
pub use error::{RelayError, Result};
pub use scheduler::{BatchLimits, StreamingScheduler};
pub use server::{Server, ServerConfig};
pub use source::{MediaSource, MediaUnit, MemorySourceFactory, SourceDescription, SourceFactory};
pub use stats::StreamStats;
