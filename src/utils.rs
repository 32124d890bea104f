use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

/// Granularity of interruptible sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Run-scoped cancellation flag shared by every thread of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep for `duration` unless stopped first. Returns `false` when the
    /// sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Exponential backoff bounded both in attempts and in delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    attempts_left: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, attempts: u32) -> Self {
        Self {
            next: initial,
            max: max.max(initial),
            attempts_left: attempts,
        }
    }

    /// Fixed delay between attempts
    pub fn constant(delay: Duration, attempts: u32) -> Self {
        Self::new(delay, delay, attempts)
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_left == 0 {
            return None;
        }
        self.attempts_left -= 1;
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        Some(delay)
    }
}

/// Pin the calling thread to a core, wrapping around the available cores.
pub fn pin_current_thread(index: usize) -> bool {
    let Some(cores) = core_affinity::get_core_ids() else {
        return false;
    };
    if cores.is_empty() {
        return false;
    }
    let core = cores[index % cores.len()];
    let pinned = core_affinity::set_for_current(core);
    debug!(?core, pinned, "Pinning thread {}", index);
    pinned
}
