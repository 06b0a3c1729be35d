//! Status channel protocol shared by every asynchronous worker.
//!
//! A worker receives a [`StatusSender`] when it starts and reports each
//! transition of the subject it owns (an artifact fetch, a dryad dispatch) as
//! a [`StatusChange`]. The consumer owns the receiving side; sending never
//! blocks, so a slow or unreachable remote resource cannot stall a registry
//! API call.
//!
//! Workers wrap the sender in a [`StatusReporter`], which guarantees exactly
//! one terminal event per subject: reports after the terminal one are dropped,
//! and a reporter dropped before reporting a terminal status (panic, early
//! return) emits [`Lifecycle::abandoned`] on the worker's behalf.

use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// A status enumeration with terminal states.
pub trait Lifecycle: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn is_terminal(self) -> bool;

    /// Status reported for a worker that stopped without a terminal event.
    fn abandoned() -> Self;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange<S> {
    /// ID of the subject (artifact or job) whose status changed.
    pub id: u64,
    pub status: S,
    pub info: String,
    pub at: DateTime<Utc>,
}

pub type StatusSender<S> = mpsc::UnboundedSender<StatusChange<S>>;
pub type StatusReceiver<S> = mpsc::UnboundedReceiver<StatusChange<S>>;

pub fn status_channel<S>() -> (StatusSender<S>, StatusReceiver<S>) {
    mpsc::unbounded_channel()
}

/// Producer side of the protocol held by a single worker.
#[derive(Debug)]
pub struct StatusReporter<S: Lifecycle> {
    id: u64,
    tx: StatusSender<S>,
    finished: bool,
}

impl<S: Lifecycle> StatusReporter<S> {
    pub fn new(id: u64, tx: StatusSender<S>) -> Self {
        Self {
            id,
            tx,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Send a status change. Returns false if the event was not delivered,
    /// either because a terminal status was already reported or because the
    /// consumer went away.
    pub fn report(&mut self, status: S, info: impl Into<String>) -> bool {
        if self.finished {
            tracing::warn!(
                id = self.id,
                status = %status,
                "Dropping status report after terminal status"
            );
            return false;
        }
        if status.is_terminal() {
            self.finished = true;
        }
        self.tx
            .send(StatusChange {
                id: self.id,
                status,
                info: info.into(),
                at: Utc::now(),
            })
            .is_ok()
    }
}

impl<S: Lifecycle> Drop for StatusReporter<S> {
    fn drop(&mut self) {
        if !self.finished {
            self.report(
                S::abandoned(),
                "worker stopped without reporting a terminal status",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Busy,
        Done,
        Lost,
    }

    impl fmt::Display for Phase {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Lifecycle for Phase {
        fn is_terminal(self) -> bool {
            matches!(self, Phase::Done | Phase::Lost)
        }

        fn abandoned() -> Self {
            Phase::Lost
        }
    }

    #[test]
    fn reports_are_delivered_in_order() {
        let (tx, mut rx) = status_channel();
        let mut reporter = StatusReporter::new(7, tx);
        assert!(reporter.report(Phase::Busy, "working"));
        assert!(reporter.report(Phase::Done, "done"));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!((first.id, first.status), (7, Phase::Busy));
        assert_eq!((second.id, second.status), (7, Phase::Done));
    }

    #[test]
    fn nothing_is_sent_after_terminal_status() {
        let (tx, mut rx) = status_channel();
        let mut reporter = StatusReporter::new(1, tx);
        reporter.report(Phase::Done, "");
        assert!(!reporter.report(Phase::Busy, "late"));
        drop(reporter);

        assert_eq!(rx.try_recv().unwrap().status, Phase::Done);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_reporter_emits_abandoned_status() {
        let (tx, mut rx) = status_channel();
        {
            let mut reporter = StatusReporter::new(3, tx);
            reporter.report(Phase::Busy, "");
        }
        assert_eq!(rx.try_recv().unwrap().status, Phase::Busy);
        assert_eq!(rx.try_recv().unwrap().status, Phase::Lost);
    }

    #[test]
    fn report_fails_when_consumer_is_gone() {
        let (tx, rx) = status_channel();
        drop(rx);
        let mut reporter = StatusReporter::new(1, tx);
        assert!(!reporter.report(Phase::Busy, ""));
    }
}
