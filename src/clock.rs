use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time source used to decide which cycle "now" falls into.
///
/// Implementations must be cheap to call: appenders consult the clock on every write.
pub trait Clock: Send + Sync + 'static {
    /// Nanoseconds since the UNIX epoch.
    fn now(&self) -> u64;

    /// Milliseconds since the UNIX epoch.
    fn now_ms(&self) -> i64 {
        (self.now() / 1_000_000) as i64
    }
}

/// Wall clock backed by `SystemTime`. Follows NTP adjustments.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// TSC clock via `quanta`, anchored to wall time when constructed and monotonic afterwards.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ns: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        Self {
            clock,
            start_wall_ns: SystemClock.now(),
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ns + delta.as_nanos() as u64
    }
}

/// Manually driven clock. Lets callers step across cycle boundaries deterministically.
#[derive(Debug, Default)]
pub struct SetClock {
    now_ms: AtomicI64,
}

impl SetClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::AcqRel);
    }
}

impl Clock for SetClock {
    fn now(&self) -> u64 {
        (self.now_ms.load(Ordering::Acquire).max(0) as u64) * 1_000_000
    }

    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Acquire)
    }
}
