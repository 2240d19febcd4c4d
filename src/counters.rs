//! Boundary to the coverage-counter subsystem (hardware counters,
//! instruction trace, software trace).

use crate::config::SessionConfig;
use crate::worker::WorkerState;
use nix::unistd::Pid;

pub trait Counters {
    /// One-time subsystem initialization at session start.
    fn init(&mut self, config: &SessionConfig) -> bool;

    /// Closes the worker's counter handles; must happen before the next
    /// fork.
    fn close(&mut self, worker: &mut WorkerState);

    /// Opens counters for a freshly created (or externally monitored)
    /// target. Returns false when no usable counters could be set up.
    fn open(&mut self, pid: Pid, config: &SessionConfig, worker: &mut WorkerState) -> bool;

    /// Starts counting once the target is ready to run.
    fn enable(&mut self, config: &SessionConfig, worker: &mut WorkerState) -> bool;

    /// Consumes the counters collected over the finished iteration.
    fn analyze(&mut self, config: &SessionConfig, worker: &mut WorkerState);
}

/// Counter subsystem that collects nothing; the worker's handles stay
/// closed.
#[derive(Debug, Default)]
pub struct NullCounters;

impl Counters for NullCounters {
    fn init(&mut self, _config: &SessionConfig) -> bool {
        true
    }

    fn close(&mut self, worker: &mut WorkerState) {
        worker.counters.reset();
    }

    fn open(&mut self, pid: Pid, _config: &SessionConfig, _worker: &mut WorkerState) -> bool {
        log::debug!("null counters: open for pid {}", pid);
        true
    }

    fn enable(&mut self, _config: &SessionConfig, _worker: &mut WorkerState) -> bool {
        true
    }

    fn analyze(&mut self, _config: &SessionConfig, _worker: &mut WorkerState) {}
}
