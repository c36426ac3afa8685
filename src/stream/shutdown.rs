//! Shutdown protocol shared by the four stages of a stream.
//!
//! Every stage walks `Running -> Draining -> Closed` and reports each step to the
//! [`Coordinator`]. On the normal path the steps happen in a fixed order:
//!
//! ```text
//!  Sender   Running --(defer End)--> Draining ------------------------------+
//!                                       | closes loopback                   |
//!                                       v                                   |
//!  Handler  Running --(entry + loopback closed)--> Draining --> Closed      |
//!                                                      | closes fwd         |
//!                                                      v                    |
//!  Writer   Running --(input closed)--> Draining --> Closed                 |
//!                                                      | closes fwd         v
//!  Sender                                              +--------------> Closed
//!
//!  Dispatcher closes once Handler and Sender have both dropped their result queues.
//! ```
//!
//! A fatal error anywhere cancels the coordinator's token. Stages observe the
//! cancellation, go straight to `Closed` and drop their queues, so no peer waits
//! on a stage that is gone.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Handler,
    Writer,
    Sender,
    Dispatcher,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Handler, Stage::Writer, Stage::Sender, Stage::Dispatcher];

    fn idx(self) -> usize {
        match self {
            Stage::Handler => 0,
            Stage::Writer => 1,
            Stage::Sender => 2,
            Stage::Dispatcher => 3,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Handler => "handler",
            Stage::Writer => "writer",
            Stage::Sender => "sender",
            Stage::Dispatcher => "dispatcher",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageState {
    Running,
    Draining,
    Closed,
}

/// Requests a stage makes about itself. The graph decides whether they apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSignal {
    /// No more input will arrive; finish what is in hand.
    BeginDrain,
    /// Everything is flushed and the outgoing queues are closed.
    Finish,
    /// Abandon work and close now.
    Fail,
}

pub struct ShutdownGraph;

impl ShutdownGraph {
    /// Pure function: (current state, signal) -> new state.
    /// Returns None if the transition is invalid.
    pub fn transition(current: StageState, signal: StageSignal) -> Option<StageState> {
        use StageSignal::*;
        use StageState::*;

        match (current, signal) {
            (Running, BeginDrain) => Some(Draining),
            (Draining, Finish) => Some(Closed),
            (Running, Fail) | (Draining, Fail) => Some(Closed),
            _ => None,
        }
    }

    /// Which peer must already be at which state before `stage` may close
    /// on the normal path.
    fn close_preconditions(stage: Stage) -> &'static [(Stage, StageState)] {
        match stage {
            Stage::Handler => &[(Stage::Sender, StageState::Draining)],
            Stage::Writer => &[(Stage::Handler, StageState::Closed)],
            Stage::Sender => &[(Stage::Writer, StageState::Closed)],
            Stage::Dispatcher => &[
                (Stage::Handler, StageState::Closed),
                (Stage::Sender, StageState::Closed),
            ],
        }
    }
}

#[derive(Debug)]
struct Inner {
    states: [StageState; 4],
    fatal: Option<Error>,
    violations: u32,
}

/// Single owner of the per-stage shutdown states of one stream.
#[derive(Debug)]
pub struct Coordinator {
    stream_id: String,
    inner: Mutex<Inner>,
    token: CancellationToken,
}

impl Coordinator {
    pub fn new(stream_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            stream_id: stream_id.into(),
            inner: Mutex::new(Inner {
                states: [StageState::Running; 4],
                fatal: None,
                violations: 0,
            }),
            token: CancellationToken::new(),
        })
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self, stage: Stage) -> StageState {
        self.inner.lock().states[stage.idx()]
    }

    /// Stages that have not reached `Closed`.
    pub fn active_stages(&self) -> usize {
        self.inner
            .lock()
            .states
            .iter()
            .filter(|s| **s != StageState::Closed)
            .count()
    }

    /// Out-of-order closes seen on the normal path. Always 0 when the protocol holds.
    pub fn protocol_violations(&self) -> u32 {
        self.inner.lock().violations
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().fatal.is_some()
    }

    pub fn fatal_error(&self) -> Option<Error> {
        self.inner.lock().fatal.clone()
    }

    /// Applies `signal` for `stage` and returns the resulting state.
    pub fn signal(&self, stage: Stage, signal: StageSignal) -> StageState {
        let mut inner = self.inner.lock();
        let current = inner.states[stage.idx()];
        let Some(next) = ShutdownGraph::transition(current, signal) else {
            warn!(stream = %self.stream_id, %stage, ?current, ?signal, "ignored invalid stage transition");
            return current;
        };

        if next == StageState::Closed && inner.fatal.is_none() {
            for (peer, required) in ShutdownGraph::close_preconditions(stage) {
                let actual = inner.states[peer.idx()];
                if actual < *required {
                    inner.violations += 1;
                    error!(
                        stream = %self.stream_id, %stage, %peer, ?actual, ?required,
                        "stage closed out of order"
                    );
                }
            }
        }

        inner.states[stage.idx()] = next;
        debug!(stream = %self.stream_id, %stage, from = ?current, to = ?next, "stage transition");
        next
    }

    /// Records the first fatal error and starts the forced shutdown path.
    pub fn fail(&self, stage: Stage, err: Error) {
        {
            let mut inner = self.inner.lock();
            if inner.fatal.is_none() {
                error!(stream = %self.stream_id, %stage, error = %err, "fatal stage error, forcing shutdown");
                inner.fatal = Some(err);
            } else {
                debug!(stream = %self.stream_id, %stage, error = %err, "additional stage error during forced shutdown");
            }
        }
        self.token.cancel();
    }
}

/// Held by a running stage. If the stage goes away without reaching `Closed`
/// (panic or early return) the drop records the failure and forces `Closed`.
pub(crate) struct StageGuard {
    coordinator: Arc<Coordinator>,
    stage: Stage,
}

impl StageGuard {
    pub(crate) fn new(coordinator: Arc<Coordinator>, stage: Stage) -> Self {
        Self { coordinator, stage }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        if self.coordinator.state(self.stage) == StageState::Closed {
            return;
        }
        let err = if std::thread::panicking() {
            Error::StagePanicked {
                stage: self.stage.to_string(),
                reason: "panicked while running".to_string(),
            }
        } else {
            Error::Fatal(format!("{} exited without finishing", self.stage))
        };
        self.coordinator.fail(self.stage, err);
        self.coordinator.signal(self.stage, StageSignal::Fail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_happy_path() {
        let s = ShutdownGraph::transition(StageState::Running, StageSignal::BeginDrain);
        assert_eq!(s, Some(StageState::Draining));
        let s = ShutdownGraph::transition(StageState::Draining, StageSignal::Finish);
        assert_eq!(s, Some(StageState::Closed));
    }

    #[test]
    fn test_graph_rejects_skips_and_reopen() {
        assert_eq!(ShutdownGraph::transition(StageState::Running, StageSignal::Finish), None);
        assert_eq!(ShutdownGraph::transition(StageState::Closed, StageSignal::BeginDrain), None);
        assert_eq!(ShutdownGraph::transition(StageState::Closed, StageSignal::Fail), None);
        assert_eq!(
            ShutdownGraph::transition(StageState::Running, StageSignal::Fail),
            Some(StageState::Closed)
        );
    }

    #[test]
    fn test_ordered_cascade_has_no_violations() {
        let c = Coordinator::new("t");
        c.signal(Stage::Sender, StageSignal::BeginDrain);
        c.signal(Stage::Handler, StageSignal::BeginDrain);
        c.signal(Stage::Handler, StageSignal::Finish);
        c.signal(Stage::Writer, StageSignal::BeginDrain);
        c.signal(Stage::Writer, StageSignal::Finish);
        c.signal(Stage::Sender, StageSignal::Finish);
        c.signal(Stage::Dispatcher, StageSignal::BeginDrain);
        c.signal(Stage::Dispatcher, StageSignal::Finish);

        assert_eq!(c.active_stages(), 0);
        assert_eq!(c.protocol_violations(), 0);
    }

    #[test]
    fn test_out_of_order_close_is_counted() {
        let c = Coordinator::new("t");
        c.signal(Stage::Writer, StageSignal::BeginDrain);
        c.signal(Stage::Writer, StageSignal::Finish);
        assert_eq!(c.protocol_violations(), 1);
        assert_eq!(c.state(Stage::Writer), StageState::Closed);
    }

    #[test]
    fn test_fail_cancels_and_keeps_first_error() {
        let c = Coordinator::new("t");
        let token = c.token();
        c.fail(Stage::Writer, Error::Log("disk full".into()));
        c.fail(Stage::Sender, Error::Fatal("later".into()));
        assert!(token.is_cancelled());
        assert!(matches!(c.fatal_error(), Some(Error::Log(_))));

        // ordering is not enforced once the stream has failed
        c.signal(Stage::Writer, StageSignal::Fail);
        assert_eq!(c.protocol_violations(), 0);
    }

    #[test]
    fn test_guard_forces_close() {
        let c = Coordinator::new("t");
        {
            let _guard = StageGuard::new(Arc::clone(&c), Stage::Handler);
        }
        assert_eq!(c.state(Stage::Handler), StageState::Closed);
        assert!(c.is_failed());
    }
}
