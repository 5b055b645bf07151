use std::time::{Duration, Instant};

/// How a waiter burns time between attempts on a contended resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseStrategy {
    /// Spin on the CPU. Lowest hand-off latency, burns a core.
    BusySpin,
    /// Spin for `spin_us`, then yield, then sleep with doubling back-off up to `max_sleep`.
    SpinThenSleep { spin_us: u32, max_sleep: Duration },
    /// Fixed sleep between attempts.
    Sleep(Duration),
}

impl Default for PauseStrategy {
    fn default() -> Self {
        PauseStrategy::SpinThenSleep {
            spin_us: 50,
            max_sleep: Duration::from_millis(1),
        }
    }
}

/// Returned by [`TimingPauser::pause`] once the accumulated wait exceeds the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut {
    pub waited: Duration,
}

const YIELDS_BEFORE_SLEEP: u32 = 32;
const MIN_SLEEP: Duration = Duration::from_micros(20);

/// Pauser that remembers when the current wait started so callers can give up after a timeout.
#[derive(Debug)]
pub struct TimingPauser {
    strategy: PauseStrategy,
    started: Option<Instant>,
    yields: u32,
    sleep: Duration,
}

impl TimingPauser {
    pub fn new(strategy: PauseStrategy) -> Self {
        Self {
            strategy,
            started: None,
            yields: 0,
            sleep: MIN_SLEEP,
        }
    }

    pub fn reset(&mut self) {
        self.started = None;
        self.yields = 0;
        self.sleep = MIN_SLEEP;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map(|start| start.elapsed()).unwrap_or_default()
    }

    /// Waits a little. Fails once more than `timeout` has passed since the first pause after
    /// construction or the last `reset`.
    pub fn pause(&mut self, timeout: Duration) -> Result<(), TimedOut> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(TimedOut { waited });
        }
        match self.strategy {
            PauseStrategy::BusySpin => std::hint::spin_loop(),
            PauseStrategy::Sleep(duration) => std::thread::sleep(duration.min(timeout - waited)),
            PauseStrategy::SpinThenSleep { spin_us, max_sleep } => {
                if waited < Duration::from_micros(spin_us as u64) {
                    std::hint::spin_loop();
                } else if self.yields < YIELDS_BEFORE_SLEEP {
                    self.yields += 1;
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(self.sleep.min(timeout - waited));
                    self.sleep = (self.sleep * 2).min(max_sleep.max(MIN_SLEEP));
                }
            }
        }
        Ok(())
    }
}
