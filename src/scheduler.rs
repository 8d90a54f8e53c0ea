//! Real-time fan-out scheduler.
//!
//! A [`StreamingScheduler`] owns one streaming session: a consumer group, a
//! live media source while the session runs, and exactly one pending pacing
//! tick. The first attached consumer starts the session; removing the last
//! one stops it. Each tick pulls a bounded batch from the source, encodes it
//! into one shared buffer, broadcasts it to every consumer in lockstep, and
//! reschedules itself so that delivery tracks the units' decode timestamps
//! in real time.
//!
//! Backpressure (any consumer's send queue full) pauses pulling: the stall
//! time flows into a drift accumulator so later pacing projections absorb
//! the stall instead of trying to catch up instantaneously, and into the
//! session's lag metric. A slow consumer is never disconnected here — it
//! only slows its whole group.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::consumer::{Consumer, ConsumerGroup};
use crate::error::Result;
use crate::media::{InterleavedRtpEncoder, PacketEncoder};
use crate::source::{MediaSource, MediaUnit, SourceDescription, SourceFactory};
use crate::stats::StreamStats;
use crate::timer::{TickTimer, TimerHandle};

/// Delay before re-priming after a loop restart.
const REOPEN_DELAY: Duration = Duration::from_millis(40);

/// Ratio between the RTP clock (90 kHz) and millisecond timestamps.
const RTP_TICKS_PER_MS: i64 = 90;

/// Per-tick batching limits.
///
/// A tick stops pulling units as soon as the batch reaches any limit:
/// cumulative payload bytes, unit count, or projected timeline span.
#[derive(Debug, Clone)]
pub struct BatchLimits {
    pub max_batch_bytes: usize,
    pub max_batch_count: usize,
    pub max_batch_span_ms: i64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_batch_bytes: 64 * 1024,
            max_batch_count: 100,
            max_batch_span_ms: 200,
        }
    }
}

struct SchedulerShared {
    factory: Box<dyn SourceFactory>,
    limits: BatchLimits,
    looping: bool,
    group: ConsumerGroup,
    stats: Arc<StreamStats>,
    /// Pending tick handle, tagged with the session generation so a worker
    /// tearing itself down never wipes a successor session's handle.
    timer: Mutex<Option<(u64, TimerHandle)>>,
    generation: AtomicU64,
}

impl SchedulerShared {
    fn clear_timer(&self, generation: u64) {
        let mut timer = self.timer.lock();
        if matches!(*timer, Some((g, _)) if g == generation) {
            *timer = None;
        }
    }
}

/// Paces one media stream to a group of downstream consumers.
pub struct StreamingScheduler {
    shared: Arc<SchedulerShared>,
}

impl StreamingScheduler {
    pub fn new(
        factory: Box<dyn SourceFactory>,
        limits: BatchLimits,
        looping: bool,
        stats: Arc<StreamStats>,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                factory,
                limits,
                looping,
                group: ConsumerGroup::new(),
                stats,
                timer: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.shared.stats.clone()
    }

    /// Whether a session is currently running.
    pub fn is_running(&self) -> bool {
        self.shared.timer.lock().is_some()
    }

    /// Attach a consumer. The first consumer of an idle scheduler opens a
    /// fresh media source and schedules the first pacing tick immediately.
    ///
    /// If the source cannot be opened the attach is rolled back and the
    /// error propagated.
    pub fn attach(&self, consumer: Arc<dyn Consumer>) -> Result<()> {
        let consumer_id = consumer.id();
        let was_empty = self.shared.group.add(consumer);
        if was_empty {
            if let Err(e) = self.start() {
                tracing::error!(error = %e, "failed to start streaming session");
                self.shared.group.close_all();
                return Err(e);
            }
        }
        tracing::debug!(consumer_id, viewers = self.shared.group.len(), "viewer attached");
        Ok(())
    }

    /// Detach a consumer by id. Removing the last member cancels the
    /// pending tick and tears the session down; the source close runs on
    /// the tick worker as it unwinds. Safe to call for ids that were
    /// already detached (e.g. a close racing an explicit teardown).
    pub fn detach(&self, consumer_id: u64) {
        let (removed, now_empty) = self.shared.group.remove(consumer_id);
        if removed && now_empty {
            self.stop();
        }
    }

    /// Obtain the stream description without touching a running session:
    /// opens a transient source and closes it right away.
    pub fn describe(&self) -> Result<SourceDescription> {
        let mut source = self.shared.factory.open()?;
        let description = source.description();
        if let Err(e) = source.close() {
            tracing::error!(error = %e, "error closing transient media source");
        }
        Ok(description)
    }

    fn start(&self) -> Result<()> {
        let source = self.shared.factory.open()?;
        let payload_type = source.description().payload_type;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut worker = PacingWorker::new(
            self.shared.clone(),
            generation,
            source,
            Box::new(InterleavedRtpEncoder::with_random_ssrc(payload_type)),
        );
        let handle = TickTimer::spawn("pacing", Duration::ZERO, move || worker.tick());
        *self.shared.timer.lock() = Some((generation, handle));
        tracing::info!(generation, "streaming session started");
        Ok(())
    }

    fn stop(&self) {
        if let Some((generation, handle)) = self.shared.timer.lock().take() {
            handle.cancel();
            tracing::info!(generation, "streaming session stopped");
        }
    }
}

enum TickOutcome {
    Reschedule(Duration),
    Stop,
}

/// Pacing state machine for one session run.
///
/// Owned by the tick timer thread; all state is session-local so no
/// locking is needed. Two macro-states: *priming* (find the timestamp
/// baseline) and *steady* (batch, send, reschedule).
struct PacingWorker {
    shared: Arc<SchedulerShared>,
    generation: u64,
    source: Option<Box<dyn MediaSource>>,
    encoder: Box<dyn PacketEncoder>,
    priming: bool,
    first_dts: i64,
    started_at: Instant,
    prev_tick: Instant,
    drift_ms: i64,
    rtp_seq: u16,
    batch: Vec<MediaUnit>,
}

impl PacingWorker {
    fn new(
        shared: Arc<SchedulerShared>,
        generation: u64,
        source: Box<dyn MediaSource>,
        encoder: Box<dyn PacketEncoder>,
    ) -> Self {
        let now = Instant::now();
        Self {
            shared,
            generation,
            source: Some(source),
            encoder,
            priming: true,
            first_dts: 0,
            started_at: now,
            prev_tick: now,
            drift_ms: 0,
            rtp_seq: 0,
            batch: Vec::new(),
        }
    }

    fn tick(&mut self) -> Option<Duration> {
        match self.tick_at(Instant::now()) {
            TickOutcome::Reschedule(delay) => Some(delay),
            TickOutcome::Stop => None,
        }
    }

    fn tick_at(&mut self, now: Instant) -> TickOutcome {
        let delta = now.saturating_duration_since(self.prev_tick);
        self.prev_tick = now;

        if self.priming {
            return self.prime(now);
        }

        let Some(source) = self.source.as_mut() else {
            return TickOutcome::Stop;
        };

        if !source.has_next() {
            if self.shared.looping {
                if let Err(e) = self.reopen() {
                    tracing::error!(error = %e, "failed to reopen media source for loop");
                    self.teardown();
                    return TickOutcome::Stop;
                }
                self.priming = true;
                TickOutcome::Reschedule(REOPEN_DELAY)
            } else {
                tracing::info!("media source exhausted, stopping session");
                self.teardown();
                TickOutcome::Stop
            }
        } else if self.shared.group.all_writable() {
            match self.pull_batch(now) {
                Ok(span_ms) => {
                    self.send_batch();
                    TickOutcome::Reschedule(Duration::from_millis(span_ms.max(0) as u64))
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to pull from media source");
                    self.teardown();
                    TickOutcome::Stop
                }
            }
        } else {
            // Backpressure: pull nothing, absorb the stall into the drift
            // accumulator and retry after the same interval.
            let stalled_ms = delta.as_millis() as i64;
            self.drift_ms += stalled_ms;
            self.shared.stats.add_lag_ms(stalled_ms as u64);
            tracing::warn!(stalled_ms, "backpressure: consumer send buffers full");
            TickOutcome::Reschedule(delta)
        }
    }

    /// First tick of a session run: discard units with negative decode
    /// timestamps, take the first non-negative one as the pacing baseline
    /// and send it immediately.
    fn prime(&mut self, now: Instant) -> TickOutcome {
        let Some(source) = self.source.as_mut() else {
            return TickOutcome::Stop;
        };
        loop {
            match source.next() {
                Ok(unit) => {
                    if unit.dts_ms < 0 {
                        continue;
                    }
                    self.first_dts = unit.dts_ms;
                    self.batch.push(unit);
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to prime media source");
                    self.teardown();
                    return TickOutcome::Stop;
                }
            }
        }
        self.started_at = now;
        self.drift_ms = 0;
        self.send_batch();
        self.priming = false;
        TickOutcome::Reschedule(Duration::ZERO)
    }

    /// Pull units until a batch limit is hit. Returns the projected span of
    /// the last accepted unit — how far ahead of real time it sits — which
    /// becomes the delay until the next tick.
    fn pull_batch(&mut self, now: Instant) -> Result<i64> {
        let limits = &self.shared.limits;
        let elapsed_ms = now.duration_since(self.started_at).as_millis() as i64;
        let Some(source) = self.source.as_mut() else {
            return Ok(0);
        };

        let mut bytes = 0usize;
        let mut count = 0usize;
        let mut span_ms = 0i64;
        while source.has_next()
            && bytes < limits.max_batch_bytes
            && count < limits.max_batch_count
            && span_ms < limits.max_batch_span_ms
        {
            let unit = source.next()?;
            bytes += unit.payload.len();
            count += 1;
            span_ms = (unit.dts_ms - self.first_dts) - elapsed_ms + self.drift_ms;
            self.batch.push(unit);
        }
        Ok(span_ms)
    }

    /// Encode the batch into one shared buffer and broadcast it to every
    /// consumer, then drop the units.
    fn send_batch(&mut self) {
        let consumers = self.shared.group.len();
        if consumers >= 1 {
            let size: usize = self
                .batch
                .iter()
                .map(|u| self.encoder.estimate_size(u))
                .sum();
            let mut buf = Vec::with_capacity(size);
            for unit in &self.batch {
                let rtp_timestamp = unit.dts_ms.wrapping_mul(RTP_TICKS_PER_MS) as u32;
                self.encoder.encode(&mut buf, unit, self.rtp_seq, rtp_timestamp);
                self.rtp_seq = self.rtp_seq.wrapping_add(1);
            }
            let frame = Arc::new(buf);
            self.shared.group.broadcast(&frame);
            self.shared
                .stats
                .add_throughput_bits(8 * size as u64 * consumers as u64);
        }
        self.batch.clear();
    }

    /// Close and reopen the source for a loop restart. Errors here are
    /// fatal to the session.
    fn reopen(&mut self) -> Result<()> {
        if let Some(mut source) = self.source.take() {
            source.close()?;
        }
        self.source = Some(self.shared.factory.open()?);
        Ok(())
    }

    /// Tear the session down from inside a tick: close every consumer,
    /// release the pending-tick slot and close the source (close errors
    /// are logged, not propagated — the session is ending anyway).
    fn teardown(&mut self) {
        self.shared.group.close_all();
        self.shared.clear_timer(self.generation);
        self.close_source_logged();
    }

    fn close_source_logged(&mut self) {
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.close() {
                tracing::error!(error = %e, "error closing media source");
            }
        }
    }
}

impl Drop for PacingWorker {
    fn drop(&mut self) {
        // Covers cancellation: the timer thread drops the worker after the
        // pending tick is cancelled.
        self.close_source_logged();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::next_consumer_id;
    use crate::error::RelayError;
    use crate::media::rtp::{INTERLEAVED_HEADER_LEN, RTP_HEADER_LEN};
    use crate::source::MemorySourceFactory;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct StubConsumer {
        id: u64,
        open: AtomicBool,
        writable: AtomicBool,
        frames: Mutex<Vec<Arc<Vec<u8>>>>,
    }

    impl StubConsumer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_consumer_id(),
                open: AtomicBool::new(true),
                writable: AtomicBool::new(true),
                frames: Mutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<Arc<Vec<u8>>> {
            self.frames.lock().clone()
        }
    }

    impl Consumer for StubConsumer {
        fn id(&self) -> u64 {
            self.id
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        fn is_writable(&self) -> bool {
            self.writable.load(Ordering::SeqCst)
        }
        fn send(&self, frame: Arc<Vec<u8>>) {
            self.frames.lock().push(frame);
        }
        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    /// Factory wrapper counting opens (and optionally failing after N).
    struct CountingFactory {
        inner: MemorySourceFactory,
        opens: AtomicUsize,
        fail_after: Option<usize>,
    }

    impl CountingFactory {
        fn new(inner: MemorySourceFactory) -> Self {
            Self {
                inner,
                opens: AtomicUsize::new(0),
                fail_after: None,
            }
        }
    }

    impl SourceFactory for CountingFactory {
        fn open(&self) -> Result<Box<dyn MediaSource>> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_after {
                if n >= limit {
                    return Err(RelayError::Io(std::io::Error::other("open failed")));
                }
            }
            self.inner.open()
        }
    }

    fn shared_with(
        factory: Box<dyn SourceFactory>,
        limits: BatchLimits,
        looping: bool,
    ) -> Arc<SchedulerShared> {
        Arc::new(SchedulerShared {
            factory,
            limits,
            looping,
            group: ConsumerGroup::new(),
            stats: Arc::new(StreamStats::new()),
            timer: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    fn worker_for(shared: &Arc<SchedulerShared>) -> PacingWorker {
        let source = shared.factory.open().unwrap();
        PacingWorker::new(
            shared.clone(),
            1,
            source,
            Box::new(InterleavedRtpEncoder::new(96, 0x01020304)),
        )
    }

    fn one_unit_limits() -> BatchLimits {
        BatchLimits {
            max_batch_count: 1,
            ..BatchLimits::default()
        }
    }

    fn expect_delay(outcome: TickOutcome) -> Duration {
        match outcome {
            TickOutcome::Reschedule(d) => d,
            TickOutcome::Stop => panic!("expected reschedule, got stop"),
        }
    }

    #[test]
    fn priming_sends_first_unit_with_zero_delay() {
        // dts = 0, 40, 80 at 25 fps.
        let factory = MemorySourceFactory::synthetic(3, 25, 100);
        let shared = shared_with(Box::new(factory), one_unit_limits(), false);
        let consumer = StubConsumer::new();
        shared.group.add(consumer.clone());

        let mut worker = worker_for(&shared);
        let t0 = Instant::now();
        let delay = expect_delay(worker.tick_at(t0));
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(consumer.frames().len(), 1);
    }

    #[test]
    fn steady_tick_delay_tracks_next_dts() {
        let factory = MemorySourceFactory::synthetic(3, 25, 100);
        let shared = shared_with(Box::new(factory), one_unit_limits(), false);
        let consumer = StubConsumer::new();
        shared.group.add(consumer.clone());

        let mut worker = worker_for(&shared);
        let t0 = Instant::now();
        expect_delay(worker.tick_at(t0));
        // Next tick immediately after priming: unit dts=40, elapsed 0,
        // projected span = 40 ms.
        let delay = expect_delay(worker.tick_at(t0));
        assert_eq!(delay, Duration::from_millis(40));
        assert_eq!(consumer.frames().len(), 2);
    }

    #[test]
    fn priming_discards_negative_dts_units() {
        let units = vec![
            MediaUnit::new(vec![1u8; 10], -80),
            MediaUnit::new(vec![2u8; 10], -40),
            MediaUnit::new(vec![3u8; 20], 0),
        ];
        let desc = MemorySourceFactory::synthetic(1, 25, 1)
            .open()
            .unwrap()
            .description();
        let factory = MemorySourceFactory::new(units, desc);
        let shared = shared_with(Box::new(factory), BatchLimits::default(), false);
        let consumer = StubConsumer::new();
        shared.group.add(consumer.clone());

        let mut worker = worker_for(&shared);
        worker.tick_at(Instant::now());

        let frames = consumer.frames();
        assert_eq!(frames.len(), 1);
        // Only the dts=0 unit was encoded.
        assert_eq!(
            frames[0].len(),
            INTERLEAVED_HEADER_LEN + RTP_HEADER_LEN + 20
        );
    }

    #[test]
    fn backpressure_accumulates_drift_and_lag() {
        let factory = MemorySourceFactory::synthetic(5, 25, 100);
        let shared = shared_with(Box::new(factory), one_unit_limits(), false);
        let consumer = StubConsumer::new();
        shared.group.add(consumer.clone());

        let mut worker = worker_for(&shared);
        let t0 = Instant::now();
        expect_delay(worker.tick_at(t0));

        // Consumer stalls for 50 ms.
        consumer.writable.store(false, Ordering::SeqCst);
        let delay = expect_delay(worker.tick_at(t0 + Duration::from_millis(50)));
        assert_eq!(delay, Duration::from_millis(50));
        assert_eq!(worker.drift_ms, 50);
        assert_eq!(shared.stats.lag_ms(), 50);
        // No units were pulled during the stall.
        assert_eq!(consumer.frames().len(), 1);

        // Once writable again, the drift keeps the projection from trying
        // to catch up: unit dts=40 at elapsed 100 ms projects to
        // (40 - 0) - 100 + 50 = -10, clamped to zero delay.
        consumer.writable.store(true, Ordering::SeqCst);
        let delay = expect_delay(worker.tick_at(t0 + Duration::from_millis(100)));
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(consumer.frames().len(), 2);
    }

    #[test]
    fn looping_reopens_and_reprimes() {
        let factory = MemorySourceFactory::synthetic(2, 25, 50);
        let shared = shared_with(Box::new(factory), BatchLimits::default(), true);
        let consumer = StubConsumer::new();
        shared.group.add(consumer.clone());

        let mut worker = worker_for(&shared);
        let t0 = Instant::now();
        worker.tick_at(t0); // prime, unit 0
        worker.tick_at(t0); // steady, unit 40, source now exhausted

        let delay = expect_delay(worker.tick_at(t0 + Duration::from_millis(80)));
        assert_eq!(delay, REOPEN_DELAY);
        assert!(worker.priming);

        // Fresh loop: baseline resets to the new first unit.
        let t1 = t0 + Duration::from_millis(120);
        worker.tick_at(t1);
        assert_eq!(worker.first_dts, 0);
        assert_eq!(worker.started_at, t1);
        assert_eq!(consumer.frames().len(), 3);
    }

    #[test]
    fn exhaustion_without_looping_stops_and_closes_consumers() {
        let factory = MemorySourceFactory::synthetic(1, 25, 50);
        let shared = shared_with(Box::new(factory), BatchLimits::default(), false);
        let consumer = StubConsumer::new();
        shared.group.add(consumer.clone());

        let mut worker = worker_for(&shared);
        let t0 = Instant::now();
        worker.tick_at(t0);
        assert!(matches!(worker.tick_at(t0), TickOutcome::Stop));
        assert!(!consumer.is_open());
        assert!(shared.group.is_empty());
    }

    #[test]
    fn reopen_failure_is_fatal() {
        let mut factory = CountingFactory::new(MemorySourceFactory::synthetic(1, 25, 50));
        factory.fail_after = Some(1);
        let shared = shared_with(Box::new(factory), BatchLimits::default(), true);
        let consumer = StubConsumer::new();
        shared.group.add(consumer.clone());

        let mut worker = worker_for(&shared);
        let t0 = Instant::now();
        worker.tick_at(t0); // prime, source exhausted after one unit
        assert!(matches!(worker.tick_at(t0), TickOutcome::Stop));
        assert!(!consumer.is_open());
    }

    #[test]
    fn rtp_sequence_wraps_modulo_65536() {
        let factory = MemorySourceFactory::synthetic(3, 25, 10);
        let shared = shared_with(Box::new(factory), BatchLimits::default(), false);
        let consumer = StubConsumer::new();
        shared.group.add(consumer.clone());

        let mut worker = worker_for(&shared);
        worker.rtp_seq = u16::MAX;
        worker.tick_at(Instant::now()); // prime: one unit at seq 65535
        worker.tick_at(Instant::now()); // steady: two units at seq 0, 1

        let frames = consumer.frames();
        assert_eq!(frames.len(), 2);
        let seq_of = |buf: &[u8], packet_start: usize| {
            u16::from_be_bytes([buf[packet_start + 6], buf[packet_start + 7]])
        };
        assert_eq!(seq_of(&frames[0], 0), u16::MAX);
        let packet_len = INTERLEAVED_HEADER_LEN + RTP_HEADER_LEN + 10;
        assert_eq!(seq_of(&frames[1], 0), 0);
        assert_eq!(seq_of(&frames[1], packet_len), 1);
    }

    #[test]
    fn throughput_counts_bits_per_consumer() {
        let factory = MemorySourceFactory::synthetic(1, 25, 100);
        let shared = shared_with(Box::new(factory), BatchLimits::default(), false);
        let a = StubConsumer::new();
        let b = StubConsumer::new();
        shared.group.add(a);
        shared.group.add(b);

        let mut worker = worker_for(&shared);
        worker.tick_at(Instant::now());

        let frame_bytes = (INTERLEAVED_HEADER_LEN + RTP_HEADER_LEN + 100) as u64;
        assert_eq!(shared.stats.throughput_bits(), 8 * frame_bytes * 2);
    }

    #[test]
    fn attach_detach_lifecycle_is_exactly_once() {
        let factory = Arc::new(CountingFactory::new(MemorySourceFactory::synthetic(
            100, 25, 100,
        )));

        struct SharedFactory(Arc<CountingFactory>);
        impl SourceFactory for SharedFactory {
            fn open(&self) -> Result<Box<dyn MediaSource>> {
                self.0.open()
            }
        }

        let scheduler = StreamingScheduler::new(
            Box::new(SharedFactory(factory.clone())),
            BatchLimits::default(),
            true,
            Arc::new(StreamStats::new()),
        );

        let a = StubConsumer::new();
        let b = StubConsumer::new();
        scheduler.attach(a.clone()).unwrap();
        scheduler.attach(b.clone()).unwrap();
        assert!(scheduler.is_running());
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);

        scheduler.detach(a.id());
        assert!(scheduler.is_running());
        scheduler.detach(b.id());
        assert!(!scheduler.is_running());

        // Re-attach starts a fresh session with a fresh source.
        let c = StubConsumer::new();
        scheduler.attach(c.clone()).unwrap();
        assert!(scheduler.is_running());
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
        scheduler.detach(c.id());
    }

    #[test]
    fn describe_does_not_disturb_idle_state() {
        let factory = MemorySourceFactory::synthetic(3, 25, 100);
        let scheduler = StreamingScheduler::new(
            Box::new(factory),
            BatchLimits::default(),
            true,
            Arc::new(StreamStats::new()),
        );
        let desc = scheduler.describe().unwrap();
        assert_eq!(desc.codec, "H264");
        assert!(!scheduler.is_running());
    }
}
