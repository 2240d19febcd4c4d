//! Per-worker supervision state.

use crate::signal::SignalGate;
use nix::unistd::Pid;
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Instant;

/// Coverage-counter descriptors owned exclusively by one worker. Opened
/// fresh for every target and closed before the next fork.
#[derive(Debug, Default)]
pub struct CounterHandles {
    pub instr_fd: Option<RawFd>,
    pub branch_fd: Option<RawFd>,
    pub trace_fd: Option<RawFd>,
}

impl CounterHandles {
    pub fn reset(&mut self) {
        self.instr_fd = None;
        self.branch_fd = None;
        self.trace_fd = None;
    }

    pub fn is_closed(&self) -> bool {
        self.instr_fd.is_none() && self.branch_fd.is_none() && self.trace_fd.is_none()
    }
}

/// State of one supervisor worker; re-populated every iteration while
/// attachment and persistent-child state carry across.
pub struct WorkerState {
    pub id: u64,
    /// The process being fuzzed this iteration.
    pub pid: Option<Pid>,
    /// The process the tracer is currently attached to; may lag behind
    /// `pid` when attachment is reused across iterations.
    pub attached_pid: Option<Pid>,
    /// Long-lived child in persistent mode.
    pub persistent_pid: Option<Pid>,
    /// Parent end of the persistent-round channel.
    pub persistent_chan: Option<RawFd>,
    /// Current input fed to the target.
    pub input_path: PathBuf,
    /// Backtrace hash captured in-band by a prior analysis step.
    pub backtrace: Option<u64>,
    pub counters: CounterHandles,
    /// Start of the current iteration, for the wall-clock limit.
    pub iter_start: Instant,
}

impl WorkerState {
    pub fn new(id: u64, input_path: PathBuf) -> Self {
        Self {
            id,
            pid: None,
            attached_pid: None,
            persistent_pid: None,
            persistent_chan: None,
            input_path,
            backtrace: None,
            counters: CounterHandles::default(),
            iter_start: Instant::now(),
        }
    }

    /// One-time initialization on the worker's own thread: counters start
    /// closed, and the thread's signal mask becomes the reaper's gate.
    pub fn thread_init(&mut self) -> io::Result<SignalGate> {
        self.counters.reset();
        SignalGate::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_reset() {
        let mut handles = CounterHandles {
            instr_fd: Some(10),
            branch_fd: Some(11),
            trace_fd: None,
        };
        assert!(!handles.is_closed());
        handles.reset();
        assert!(handles.is_closed());
    }

    #[test]
    fn fresh_worker_has_no_child() {
        let worker = WorkerState::new(0, PathBuf::from("input"));
        assert_eq!(worker.pid, None);
        assert_eq!(worker.attached_pid, None);
        assert_eq!(worker.persistent_pid, None);
        assert!(worker.counters.is_closed());
    }
}
