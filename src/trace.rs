//! Boundary to the crash/backtrace classifier.

use crate::config::SessionConfig;
use crate::worker::WorkerState;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Classifier the supervisor forwards target events to. Implementations
/// inspect registers/memory of the reported process; the supervisor only
/// routes events.
pub trait Tracer {
    /// Places `pid` (all of its threads) under inspection. When `pid` is the
    /// worker's own child, it is parked in its rendezvous SIGSTOP and the
    /// implementation must release it once inspection is in place; the
    /// coordinator only resumes the child itself when the monitored target
    /// is an external process. Returns false on failure; the iteration
    /// still proceeds with degraded monitoring.
    fn attach(&mut self, config: &SessionConfig, pid: Pid) -> bool;

    /// Waits until `pid` is in a stopped state.
    fn wait_for_stopped(&mut self, pid: Pid) -> bool;

    /// Classifies one state-change event reported for `pid`.
    fn analyze_event(
        &mut self,
        config: &SessionConfig,
        status: WaitStatus,
        pid: Pid,
        worker: &mut WorkerState,
    );

    /// Best-effort post-mortem analysis keyed on `pid`, driven by an
    /// out-of-band crash report.
    fn analyze_from_artifact(&mut self, config: &SessionConfig, pid: Pid, worker: &mut WorkerState);

    /// Derives the set of crash-worthy signals from the configuration.
    fn init_signal_set(&mut self, config: &SessionConfig);
}

/// Tracer that never attaches; targets are observed through wait statuses
/// only.
#[derive(Debug, Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn attach(&mut self, _config: &SessionConfig, pid: Pid) -> bool {
        log::debug!("null tracer: attach to pid {}", pid);
        // No inspection to set up; just release the rendezvous stop.
        kill(pid, Signal::SIGCONT).is_ok()
    }

    fn wait_for_stopped(&mut self, _pid: Pid) -> bool {
        true
    }

    fn analyze_event(
        &mut self,
        _config: &SessionConfig,
        status: WaitStatus,
        pid: Pid,
        _worker: &mut WorkerState,
    ) {
        log::debug!("null tracer: pid {} event {:?}", pid, status);
    }

    fn analyze_from_artifact(
        &mut self,
        _config: &SessionConfig,
        pid: Pid,
        _worker: &mut WorkerState,
    ) {
        log::debug!("null tracer: artifact analysis for pid {}", pid);
    }

    fn init_signal_set(&mut self, _config: &SessionConfig) {}
}
