//! Re-arming tick timer.
//!
//! Both the pacing loop and the RTSP keep-alive chain are "run, then sleep
//! for a computed delay, then run again" loops. Instead of recursive
//! self-rescheduling closures, [`TickTimer`] makes the loop explicit: the
//! tick callback returns the delay until the next tick (or `None` to stop),
//! and the returned [`TimerHandle`] supports explicit cancellation.
//!
//! Ticks for one timer run serialized on a dedicated named thread, so two
//! ticks of the same timer never overlap. Cancellation is not preemptive:
//! it interrupts at most one pending sleep, and a tick that is already
//! executing runs to completion.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct TimerShared {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

/// Handle to a spawned [`TickTimer`] worker.
///
/// Dropping the handle does not cancel the timer; call
/// [`cancel`](Self::cancel) explicitly.
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Cancel the pending tick and stop the worker thread.
    ///
    /// Idempotent. A tick that is currently executing finishes first.
    pub fn cancel(&self) {
        let mut cancelled = self.shared.cancelled.lock();
        *cancelled = true;
        self.shared.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shared.cancelled.lock()
    }
}

/// Repeating timer driving a tick callback on its own thread.
pub struct TickTimer;

impl TickTimer {
    /// Spawn a timer thread named `name`.
    ///
    /// The worker waits `initial_delay`, then invokes `tick` repeatedly,
    /// sleeping between invocations for whatever delay the previous tick
    /// returned. The loop ends when `tick` returns `None` or the handle is
    /// cancelled, whichever comes first; the closure (and anything it owns)
    /// is dropped on the worker thread.
    pub fn spawn<F>(name: &str, initial_delay: Duration, mut tick: F) -> TimerHandle
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            cancelled: Mutex::new(false),
            cond: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let thread_name = format!("tick-{name}");

        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut delay = initial_delay;
                loop {
                    let deadline = Instant::now() + delay;
                    {
                        let mut cancelled = worker_shared.cancelled.lock();
                        while !*cancelled {
                            if worker_shared
                                .cond
                                .wait_until(&mut cancelled, deadline)
                                .timed_out()
                            {
                                break;
                            }
                        }
                        if *cancelled {
                            break;
                        }
                    }
                    match tick() {
                        Some(next) => delay = next,
                        None => break,
                    }
                }
                tracing::trace!(timer = %thread_name, "timer worker exited");
            });

        if let Err(e) = spawned {
            // Thread spawn failure leaves the timer permanently cancelled.
            tracing::error!(error = %e, "failed to spawn timer thread");
            *shared.cancelled.lock() = true;
        }

        TimerHandle { shared }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = TickTimer::spawn("test-stop", Duration::ZERO, move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Some(Duration::from_millis(1))
            } else {
                None
            }
        });
        // Worker stops on its own after three ticks.
        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn cancel_prevents_future_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = TickTimer::spawn("test-cancel", Duration::from_secs(60), move || {
            c.fetch_add(1, Ordering::SeqCst);
            Some(Duration::from_secs(60))
        });
        handle.cancel();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let handle = TickTimer::spawn("test-idem", Duration::from_secs(60), || None);
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
