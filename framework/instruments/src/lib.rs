// Lets the attribute macro refer to this crate by name from inside it.
extern crate self as cloudbench_instruments;

mod report;

use std::any::Any;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use cloudbench_core::prelude::{error_kind, Clock, PollError, SystemClock};
use cloudbench_summary_model::{AtomicActionRecord, ErrorInfo};
use parking_lot::Mutex;

pub use cloudbench_instruments_derive::atomic_action;
pub use report::{
    JsonlFileReportCollector, ReportCollector, ReportConfig, Reporter, SummaryReportCollector,
};

pub mod prelude {
    pub use crate::{
        atomic_action, AtomicActions, AtomicActionsHost, AtomicTimer, ReportCollector,
        ReportConfig, Reporter,
    };
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct ActionsState {
    records: Vec<AtomicActionRecord>,
    open: usize,
}

/// The ordered list of atomic actions recorded during one iteration.
///
/// Clones share the same list.
#[derive(Debug, Clone)]
pub struct AtomicActions {
    inner: Arc<Mutex<ActionsState>>,
    clock: Arc<dyn Clock>,
}

impl Default for AtomicActions {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }
}

impl AtomicActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Measure durations on `clock`, which should be the clock the iteration is timed with.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::default(),
            clock,
        }
    }

    /// Number of timers that were started and are not finished yet.
    pub fn open_count(&self) -> usize {
        self.inner.lock().open
    }

    /// Records in the order their timers were started.
    pub fn records(&self) -> Vec<AtomicActionRecord> {
        self.inner.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` as a named atomic action.
    pub fn time<T, E, F>(&self, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Display + Debug + 'static,
    {
        let timer = AtomicTimer::start(self, name);
        let result = f();
        timer.finish_with(&result);
        result
    }
}

/// Implemented by anything that owns the atomic actions of an iteration, so that its methods can
/// use `#[atomic_action]`.
pub trait AtomicActionsHost {
    fn atomic_actions(&self) -> &AtomicActions;
}

impl AtomicActionsHost for AtomicActions {
    fn atomic_actions(&self) -> &AtomicActions {
        self
    }
}

fn error_info<E: Display + Debug + 'static>(err: &E) -> ErrorInfo {
    let any = err as &dyn Any;
    let etype = if let Some(err) = any.downcast_ref::<anyhow::Error>() {
        error_kind(err)
    } else if let Some(err) = any.downcast_ref::<PollError>() {
        err.kind()
    } else {
        "Error"
    };

    ErrorInfo::new(etype, err.to_string(), format!("{err:?}"))
}

/// Times one atomic action. The record is added when the timer starts so that the list follows
/// start order, and completed when the timer is finished or dropped.
#[must_use = "an atomic timer measures until it is finished or dropped"]
#[derive(Debug)]
pub struct AtomicTimer {
    actions: AtomicActions,
    index: usize,
    started: Instant,
    finished: bool,
}

impl AtomicTimer {
    pub fn start(actions: &AtomicActions, name: &str) -> Self {
        let started_at = unix_now();
        let index = {
            let mut state = actions.inner.lock();
            let depth = state.open;
            state.open += 1;
            state.records.push(AtomicActionRecord {
                name: name.to_string(),
                started_at,
                finished_at: started_at,
                duration: 0.0,
                depth,
                error: None,
            });
            state.records.len() - 1
        };

        Self {
            actions: actions.clone(),
            index,
            started: actions.clock.now(),
            finished: false,
        }
    }

    pub fn finish(mut self) {
        self.complete(None);
    }

    pub fn fail(mut self, error: ErrorInfo) {
        self.complete(Some(error));
    }

    pub fn finish_with<T, E>(mut self, result: &Result<T, E>)
    where
        E: Display + Debug + 'static,
    {
        self.complete(result.as_ref().err().map(error_info));
    }

    fn complete(&mut self, error: Option<ErrorInfo>) {
        let duration = self
            .actions
            .clock
            .now()
            .saturating_duration_since(self.started)
            .as_secs_f64();
        let mut state = self.actions.inner.lock();
        state.open = state.open.saturating_sub(1);
        if let Some(record) = state.records.get_mut(self.index) {
            record.duration = duration;
            record.finished_at = record.started_at + duration;
            record.error = error;
        }
        self.finished = true;
    }
}

impl Drop for AtomicTimer {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let msg = if std::thread::panicking() {
            "atomic action interrupted by a panic"
        } else {
            "atomic action was not finished"
        };
        self.complete(Some(ErrorInfo::new("Interrupted", msg, "")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudbench_core::prelude::ManualClock;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Default)]
    struct Scenario {
        actions: AtomicActions,
        boots: usize,
    }

    impl AtomicActionsHost for Scenario {
        fn atomic_actions(&self) -> &AtomicActions {
            &self.actions
        }
    }

    impl Scenario {
        #[atomic_action("nova.boot_server")]
        fn boot(&mut self, fail: bool) -> anyhow::Result<usize> {
            if fail {
                anyhow::bail!("no valid host");
            }
            self.boots += 1;
            Ok(self.boots)
        }

        #[atomic_action("nova.boot_and_wait")]
        fn boot_and_wait(&mut self) -> anyhow::Result<()> {
            self.boot(false)?;
            Ok(())
        }
    }

    #[test]
    fn records_follow_start_order_with_duplicates() {
        let mut scenario = Scenario::default();

        scenario.boot(false).unwrap();
        scenario.boot(false).unwrap();
        assert!(scenario.boot(true).is_err());

        let records = scenario.actions.records();
        assert_eq!(
            vec!["nova.boot_server"; 3],
            records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>()
        );
        assert!(records[..2].iter().all(|r| r.error.is_none()));
        assert_eq!("no valid host", records[2].error.as_ref().unwrap().msg);
    }

    #[test]
    fn nested_actions_record_depth() {
        let mut scenario = Scenario::default();

        scenario.boot_and_wait().unwrap();

        let records = scenario.actions.records();
        assert_eq!("nova.boot_and_wait", records[0].name);
        assert_eq!(0, records[0].depth);
        assert_eq!("nova.boot_server", records[1].name);
        assert_eq!(1, records[1].depth);
        assert!(records[1].duration <= records[0].duration);
    }

    #[test]
    fn dropped_timer_is_interrupted() {
        let actions = AtomicActions::new();

        let run = || -> anyhow::Result<()> {
            let _timer = AtomicTimer::start(&actions, "cinder.create_volume");
            anyhow::bail!("early return");
        };
        assert!(run().is_err());

        let records = actions.records();
        assert_eq!(1, records.len());
        assert_eq!("Interrupted", records[0].error.as_ref().unwrap().etype);
    }

    #[test]
    fn durations_follow_the_given_clock() {
        let clock = Arc::new(ManualClock::new());
        let actions = AtomicActions::with_clock(clock.clone());

        let timer = AtomicTimer::start(&actions, "heat.create_stack");
        assert_eq!(1, actions.open_count());
        clock.advance(Duration::from_secs(3));
        timer.finish();

        assert_eq!(0, actions.open_count());
        assert_eq!(3.0, actions.records()[0].duration);
    }

    #[test]
    fn time_closure() {
        let actions = AtomicActions::new();

        let value: Result<u32, String> = actions.time("keystone.authenticate", || Ok(7));
        assert_eq!(Ok(7), value);

        let failed: Result<(), String> = actions.time("keystone.authenticate", || Err("denied".to_string()));
        assert!(failed.is_err());

        let records = actions.records();
        assert_eq!(2, records.len());
        assert!(records[0].error.is_none());
        assert_eq!("denied", records[1].error.as_ref().unwrap().msg);
        assert_eq!(0, records[1].depth);
    }
}
