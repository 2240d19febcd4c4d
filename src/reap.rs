//! Event reaper: waits on the worker's signal gate, drains child
//! state-change events, routes them to the crash classifier, and finishes
//! the iteration with counter and coverage analysis.

use crate::config::SessionConfig;
use crate::counters::Counters;
use crate::sancov::CoverageSink;
use crate::signal::{GateEvent, SignalGate};
use crate::trace::Tracer;
use crate::utils;
use crate::worker::WorkerState;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{self, MsgFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Gate tick; bounds how late termination and time-limit checks can run.
pub const EVENT_TICK: Duration = Duration::from_millis(250);
/// Application-level byte the persistent target writes after each round.
pub const ROUND_DONE_MARKER: u8 = b'A';
/// Prefix of out-of-band sanitizer crash reports in the working directory.
pub const SAN_REPORT_PREFIX: &str = "HF.sanitizer.log";

#[derive(Debug, Error)]
pub enum ReapError {
    #[error("signal gate: {0}")]
    Gate(#[source] io::Error),
    #[error("retrieving child state: {0}")]
    Wait(#[source] Errno),
}

/// Source of child state-change events. The kernel in production; scripted
/// sequences in tests.
pub trait WaitSource {
    fn wait_any(&mut self) -> nix::Result<WaitStatus>;
}

/// Non-blocking wait over every child of the calling thread.
pub struct KernelWait;

impl WaitSource for KernelWait {
    fn wait_any(&mut self) -> nix::Result<WaitStatus> {
        waitpid(
            None,
            Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD),
        )
    }
}

/// Runs the event loop for one iteration, then reconciles out-of-band
/// sanitizer reports and hands the iteration to the coverage analyzers.
pub fn reap_target<T, C, S>(
    config: &SessionConfig,
    worker: &mut WorkerState,
    gate: &SignalGate,
    tracer: &mut T,
    counters: &mut C,
    sancov: &mut S,
) -> Result<(), ReapError>
where
    T: Tracer,
    C: Counters,
    S: CoverageSink,
{
    let mut wait = KernelWait;
    loop {
        match gate.wait(EVENT_TICK).map_err(ReapError::Gate)? {
            GateEvent::TimedOut => {
                check_time_limit(config, worker);
                check_termination(config, worker);
            }
            GateEvent::Signal(_) => {}
        }
        if persistent_round_done(config, worker) {
            break;
        }
        if drain_events(config, worker, tracer, &mut wait)? {
            break;
        }
    }

    if config.sanitizers {
        if let Some(monitored) = config.monitor_pid().or(worker.pid) {
            reconcile_sanitizer_report(config, worker, tracer, monitored);
        }
    }

    counters.analyze(config, worker);
    sancov.analyze(config, worker);
    Ok(())
}

/// Drains every queued state-change event without blocking. Returns true
/// when the iteration is complete.
pub(crate) fn drain_events<T: Tracer, W: WaitSource>(
    config: &SessionConfig,
    worker: &mut WorkerState,
    tracer: &mut T,
    wait: &mut W,
) -> Result<bool, ReapError> {
    let child = worker.pid;
    let monitored = config.monitor_pid().or(child);

    loop {
        let status = match wait.wait_any() {
            Ok(WaitStatus::StillAlive) => return Ok(false),
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                log::debug!("no more processes to track");
                return Ok(true);
            }
            Err(e) => return Err(ReapError::Wait(e)),
        };
        let pid = match status.pid() {
            Some(pid) => pid,
            None => continue,
        };
        log::debug!("pid {} reported: {:?}", pid, status);

        if config.persistent && Some(pid) == worker.persistent_pid && is_terminal(status) {
            tracer.analyze_event(config, status, pid, worker);
            worker.persistent_pid = None;
            if !config.stop_soon() {
                log::warn!("persistent target {} went away: {:?}", pid, status);
            }
            return Ok(true);
        }
        // Ordinary case: the monitored process is our own child. Every
        // event it produces is classification input, including the many
        // intermediate stops of a traced process; its disappearance
        // surfaces as ECHILD above.
        if monitored == child {
            tracer.analyze_event(config, status, pid, worker);
            continue;
        }
        // External-target case: the worker's own child only gates
        // iteration completion, while events from any other pid feed the
        // classifier.
        if Some(pid) == child && is_terminal(status) {
            return Ok(true);
        }
        if Some(pid) == child {
            continue;
        }
        tracer.analyze_event(config, status, pid, worker);
    }
}

fn is_terminal(status: WaitStatus) -> bool {
    matches!(
        status,
        WaitStatus::Exited(..) | WaitStatus::Signaled(..)
    )
}

/// Checks the channel for the round-completion byte without blocking.
fn persistent_round_done(config: &SessionConfig, worker: &WorkerState) -> bool {
    if !config.persistent {
        return false;
    }
    let chan = match worker.persistent_chan {
        Some(chan) => chan,
        None => return false,
    };
    let mut buf = [0u8; 1];
    match socket::recv(chan, &mut buf, MsgFlags::MSG_DONTWAIT) {
        Ok(1) if buf[0] == ROUND_DONE_MARKER => true,
        Ok(n) => {
            if n > 0 {
                log::warn!("unexpected byte {:#04x} on persistent channel", buf[0]);
            }
            false
        }
        Err(_) => false,
    }
}

/// True when the current iteration has outlived the configured wall-clock
/// limit.
pub(crate) fn time_limit_exceeded(config: &SessionConfig, worker: &WorkerState) -> bool {
    match config.time_limit {
        Some(limit) => worker.iter_start.elapsed() > limit,
        None => false,
    }
}

fn check_time_limit(config: &SessionConfig, worker: &WorkerState) {
    if !time_limit_exceeded(config, worker) {
        return;
    }
    let pid = match worker.pid {
        Some(pid) => pid,
        None => return,
    };
    log::warn!(
        "pid {} ran for {}ms (limit {}ms), terminating it",
        pid,
        worker.iter_start.elapsed().as_millis(),
        config.time_limit.unwrap_or_default().as_millis()
    );
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        log::warn!("couldn't terminate pid {}: {}", pid, e);
    }
}

fn check_termination(config: &SessionConfig, worker: &WorkerState) {
    if !config.stop_soon() {
        return;
    }
    if let Some(pid) = worker.pid {
        let _ = kill(pid, Signal::SIGKILL);
    }
}

/// After an iteration, a sanitizer runtime may have left a crash report
/// named after the monitored pid. With an in-band backtrace it is
/// redundant; without one the runtime died before signalling and the
/// report is the only evidence left.
pub(crate) fn reconcile_sanitizer_report<T: Tracer>(
    config: &SessionConfig,
    worker: &mut WorkerState,
    tracer: &mut T,
    monitored: Pid,
) {
    let report = config
        .work_dir
        .join(format!("{}.{}", SAN_REPORT_PREFIX, monitored));
    if !utils::file_exists(&report) {
        return;
    }
    if worker.backtrace.is_some() {
        let _ = fs::remove_file(&report);
    } else {
        log::warn!(
            "unhandled sanitizer report '{}' (input: '{}'), trying post-mortem analysis",
            report.display(),
            worker.input_path.display()
        );
        tracer.analyze_from_artifact(config, monitored, worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    struct ScriptedWait {
        events: VecDeque<nix::Result<WaitStatus>>,
    }

    impl ScriptedWait {
        fn new(events: Vec<nix::Result<WaitStatus>>) -> Self {
            Self {
                events: events.into(),
            }
        }
    }

    impl WaitSource for ScriptedWait {
        fn wait_any(&mut self) -> nix::Result<WaitStatus> {
            self.events
                .pop_front()
                .unwrap_or(Ok(WaitStatus::StillAlive))
        }
    }

    #[derive(Default)]
    struct RecordingTracer {
        analyzed: Vec<(Pid, WaitStatus)>,
        artifacts: Vec<Pid>,
    }

    impl Tracer for RecordingTracer {
        fn attach(&mut self, _config: &SessionConfig, _pid: Pid) -> bool {
            true
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
            self.analyzed.push((pid, status));
        }

        fn analyze_from_artifact(
            &mut self,
            _config: &SessionConfig,
            pid: Pid,
            _worker: &mut WorkerState,
        ) {
            self.artifacts.push(pid);
        }

        fn init_signal_set(&mut self, _config: &SessionConfig) {}
    }

    fn worker_with_child(pid: i32) -> WorkerState {
        let mut worker = WorkerState::new(0, PathBuf::from("input"));
        worker.pid = Some(Pid::from_raw(pid));
        worker
    }

    #[test]
    fn drain_classifies_every_event_until_children_are_gone() {
        let config = SessionConfig::default();
        let mut worker = worker_with_child(1234);
        let mut tracer = RecordingTracer::default();
        let child = Pid::from_raw(1234);
        let mut wait = ScriptedWait::new(vec![
            Ok(WaitStatus::Stopped(child, Signal::SIGTRAP)),
            Ok(WaitStatus::Stopped(child, Signal::SIGSEGV)),
            Ok(WaitStatus::Exited(child, 0)),
            Err(Errno::ECHILD),
        ]);

        let done = drain_events(&config, &mut worker, &mut tracer, &mut wait).unwrap();
        assert!(done);
        assert_eq!(tracer.analyzed.len(), 3);
        assert!(tracer.analyzed.iter().all(|(pid, _)| *pid == child));
    }

    #[test]
    fn drain_returns_incomplete_when_queue_is_empty() {
        let config = SessionConfig::default();
        let mut worker = worker_with_child(1234);
        let mut tracer = RecordingTracer::default();
        let child = Pid::from_raw(1234);
        let mut wait = ScriptedWait::new(vec![
            Ok(WaitStatus::Stopped(child, Signal::SIGTRAP)),
            Ok(WaitStatus::StillAlive),
        ]);

        let done = drain_events(&config, &mut worker, &mut tracer, &mut wait).unwrap();
        assert!(!done);
        assert_eq!(tracer.analyzed.len(), 1);
    }

    #[test]
    fn echild_completes_without_classification() {
        let config = SessionConfig::default();
        let mut worker = worker_with_child(1234);
        let mut tracer = RecordingTracer::default();
        let mut wait = ScriptedWait::new(vec![Err(Errno::ECHILD)]);

        let done = drain_events(&config, &mut worker, &mut tracer, &mut wait).unwrap();
        assert!(done);
        assert!(tracer.analyzed.is_empty());
    }

    #[test]
    fn eintr_is_transparent() {
        let child = Pid::from_raw(1234);
        let events = |interrupted: bool| {
            let mut events = Vec::new();
            if interrupted {
                events.push(Err(Errno::EINTR));
            }
            events.push(Ok(WaitStatus::Exited(child, 0)));
            events.push(Err(Errno::ECHILD));
            events
        };

        for interrupted in [false, true] {
            let config = SessionConfig::default();
            let mut worker = worker_with_child(1234);
            let mut tracer = RecordingTracer::default();
            let mut wait = ScriptedWait::new(events(interrupted));
            let done = drain_events(&config, &mut worker, &mut tracer, &mut wait).unwrap();
            assert!(done);
            assert_eq!(tracer.analyzed.len(), 1);
        }
    }

    #[test]
    fn fatal_wait_error_propagates() {
        let config = SessionConfig::default();
        let mut worker = worker_with_child(1234);
        let mut tracer = RecordingTracer::default();
        let mut wait = ScriptedWait::new(vec![Err(Errno::EINVAL)]);

        assert!(matches!(
            drain_events(&config, &mut worker, &mut tracer, &mut wait),
            Err(ReapError::Wait(Errno::EINVAL))
        ));
    }

    #[test]
    fn persistent_child_death_ends_iteration() {
        let config = SessionConfig {
            persistent: true,
            ..Default::default()
        };
        let child = Pid::from_raw(1234);
        let mut worker = worker_with_child(1234);
        worker.persistent_pid = Some(child);
        let mut tracer = RecordingTracer::default();
        let mut wait = ScriptedWait::new(vec![Ok(WaitStatus::Signaled(
            child,
            Signal::SIGSEGV,
            false,
        ))]);

        let done = drain_events(&config, &mut worker, &mut tracer, &mut wait).unwrap();
        assert!(done);
        assert_eq!(tracer.analyzed.len(), 1);
        assert_eq!(worker.persistent_pid, None);
    }

    #[test]
    fn external_monitor_keeps_child_events_out_of_classification() {
        let config = SessionConfig::default();
        config.set_monitor_pid(Pid::from_raw(4242));
        let child = Pid::from_raw(1000);
        let monitor = Pid::from_raw(4242);
        let mut worker = worker_with_child(1000);
        let mut tracer = RecordingTracer::default();
        let mut wait = ScriptedWait::new(vec![
            Ok(WaitStatus::Stopped(child, Signal::SIGSTOP)),
            Ok(WaitStatus::Stopped(monitor, Signal::SIGSEGV)),
            Ok(WaitStatus::Exited(child, 0)),
        ]);

        let done = drain_events(&config, &mut worker, &mut tracer, &mut wait).unwrap();
        assert!(done);
        // Only the monitored process's event is classification input; the
        // child's stop and exit merely gate completion.
        assert_eq!(tracer.analyzed.len(), 1);
        assert_eq!(tracer.analyzed[0].0, monitor);
    }

    #[test]
    fn time_limit_decision() {
        let mut worker = worker_with_child(1234);

        let config = SessionConfig::default();
        assert!(!time_limit_exceeded(&config, &worker));

        let config = SessionConfig {
            time_limit: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        assert!(!time_limit_exceeded(&config, &worker));

        worker.iter_start = std::time::Instant::now() - Duration::from_secs(2);
        let config = SessionConfig {
            time_limit: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(time_limit_exceeded(&config, &worker));
    }

    #[test]
    fn redundant_sanitizer_report_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            sanitizers: true,
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let monitored = Pid::from_raw(4242);
        let report = dir
            .path()
            .join(format!("{}.{}", SAN_REPORT_PREFIX, monitored));
        std::fs::write(&report, "==4242==ERROR: AddressSanitizer").unwrap();

        let mut worker = worker_with_child(4242);
        worker.backtrace = Some(0xdead_beef);
        let mut tracer = RecordingTracer::default();
        reconcile_sanitizer_report(&config, &mut worker, &mut tracer, monitored);

        assert!(!report.exists());
        assert!(tracer.artifacts.is_empty());
    }

    #[test]
    fn unhandled_sanitizer_report_triggers_post_mortem_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            sanitizers: true,
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let monitored = Pid::from_raw(4242);
        let report = dir
            .path()
            .join(format!("{}.{}", SAN_REPORT_PREFIX, monitored));
        std::fs::write(&report, "==4242==ERROR: AddressSanitizer").unwrap();

        let mut worker = worker_with_child(4242);
        let mut tracer = RecordingTracer::default();
        reconcile_sanitizer_report(&config, &mut worker, &mut tracer, monitored);

        assert_eq!(tracer.artifacts, vec![monitored]);
        // Left in place for inspection.
        assert!(report.exists());
    }

    #[test]
    fn missing_report_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            sanitizers: true,
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut worker = worker_with_child(4242);
        let mut tracer = RecordingTracer::default();
        reconcile_sanitizer_report(&config, &mut worker, &mut tracer, Pid::from_raw(4242));
        assert!(tracer.artifacts.is_empty());
    }
}
