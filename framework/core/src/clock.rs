use std::fmt::Debug;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::abort::AbortListener;
use crate::error::AbortedError;

/// Source of time for anything that waits on the cloud.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration) -> Result<(), AbortedError>;
}

/// Real time. Sleeps are interrupted by a hard abort when a listener is attached.
#[derive(Debug, Clone, Default)]
pub struct SystemClock {
    abort: Option<AbortListener>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_abort(abort: AbortListener) -> Self {
        Self { abort: Some(abort) }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Result<(), AbortedError> {
        match &self.abort {
            Some(abort) => abort.sleep(duration),
            None => {
                std::thread::sleep(duration);
                Ok(())
            }
        }
    }
}

/// Virtual time that only moves when something sleeps on it or it is advanced by hand.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }

    fn sleep(&self, duration: Duration) -> Result<(), AbortedError> {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortHandle;

    #[test]
    fn manual_clock_records_sleeps() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(2)).unwrap();
        clock.sleep(Duration::from_millis(500)).unwrap();

        assert_eq!(Duration::from_millis(2500), clock.now() - start);
        assert_eq!(
            vec![Duration::from_secs(2), Duration::from_millis(500)],
            clock.sleeps()
        );
    }

    #[test]
    fn system_clock_honours_hard_abort() {
        let handle = AbortHandle::new();
        let clock = SystemClock::with_abort(handle.new_listener());
        handle.hard_abort();

        assert!(clock.sleep(Duration::from_secs(60)).is_err());
    }
}
