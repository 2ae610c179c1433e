use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::{Receiver, Sender};

use crate::error::AbortedError;

const NOT_ABORTED: u8 = 0;
const SOFT: u8 = 1;
const HARD: u8 = 2;

/// How forcefully a run is being stopped.
///
/// A soft abort stops scheduling new iterations and lets in-flight iterations finish. A hard abort
/// additionally wakes any worker that is sleeping inside the poller or `sleep_between`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AbortLevel {
    Soft,
    Hard,
}

impl AbortLevel {
    fn as_u8(self) -> u8 {
        match self {
            AbortLevel::Soft => SOFT,
            AbortLevel::Hard => HARD,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            SOFT => Some(AbortLevel::Soft),
            HARD => Some(AbortLevel::Hard),
            NOT_ABORTED => None,
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct AbortState {
    level: AtomicU8,
    lock: Mutex<()>,
    wake: Condvar,
}

#[derive(Debug, Clone)]
pub struct AbortHandle {
    sender: Sender<AbortLevel>,
    state: Arc<AbortState>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            sender: tokio::sync::broadcast::channel(4).0,
            state: Arc::new(AbortState::default()),
        }
    }

    /// Escalate the abort level. Requesting a lower level than the current one is a no-op.
    pub fn abort(&self, level: AbortLevel) {
        let previous = self.state.level.fetch_max(level.as_u8(), Ordering::SeqCst);
        if previous >= level.as_u8() {
            return;
        }

        {
            // Taking the lock orders this notification after any sleeper's level check.
            let _guard = self.state.lock.lock();
            self.state.wake.notify_all();
        }

        if let Err(e) = self.sender.send(level) {
            // Will fail if nobody is listening asynchronously, which is normal for runs that only
            // use the synchronous checks.
            log::trace!("No async listeners for abort signal: {e:?}");
        }
    }

    pub fn soft_abort(&self) {
        self.abort(AbortLevel::Soft);
    }

    pub fn hard_abort(&self) {
        self.abort(AbortLevel::Hard);
    }

    pub fn level(&self) -> Option<AbortLevel> {
        AbortLevel::from_u8(self.state.level.load(Ordering::SeqCst))
    }

    pub fn new_listener(&self) -> AbortListener {
        AbortListener::new(self.sender.subscribe(), self.state.clone())
    }
}

#[derive(Clone, Debug)]
pub struct AbortListener {
    receiver: Arc<tokio::sync::Mutex<Receiver<AbortLevel>>>,
    state: Arc<AbortState>,
}

impl AbortListener {
    pub(crate) fn new(receiver: Receiver<AbortLevel>, state: Arc<AbortState>) -> Self {
        Self {
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            state,
        }
    }

    pub fn level(&self) -> Option<AbortLevel> {
        AbortLevel::from_u8(self.state.level.load(Ordering::SeqCst))
    }

    /// Point in time check for any abort. Workers call this between iterations.
    pub fn should_stop(&self) -> bool {
        self.level().is_some()
    }

    pub fn is_hard_aborted(&self) -> bool {
        self.level() == Some(AbortLevel::Hard)
    }

    /// Block the current thread for `duration`, returning early with an error on hard abort.
    ///
    /// A soft abort does not interrupt the sleep.
    pub fn sleep(&self, duration: Duration) -> Result<(), AbortedError> {
        let deadline = Instant::now() + duration;
        let mut guard = self.state.lock.lock();
        loop {
            if self.is_hard_aborted() {
                return Err(AbortedError::default());
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            self.state.wake.wait_until(&mut guard, deadline);
        }
    }

    /// Block for up to `duration`, waking early on any abort. Returns whether an abort was seen.
    pub fn wait_for_stop(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.state.lock.lock();
        loop {
            if self.should_stop() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.state.wake.wait_until(&mut guard, deadline);
        }
    }

    /// Wait until a hard abort is requested. It is safe to race this with another future so that
    /// the abort can be used to cancel async work in progress.
    pub async fn wait_for_hard_abort(&self) {
        let mut receiver = self.receiver.lock().await;
        loop {
            if self.is_hard_aborted() {
                return;
            }
            match receiver.recv().await {
                Ok(AbortLevel::Hard) => return,
                Ok(AbortLevel::Soft) | Err(RecvError::Lagged(_)) => continue,
                // Every handle is gone so nothing can abort us any more.
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}
