//! Attach coordinator: decides whether the tracer must (re-)attach this
//! iteration, reconciles externally monitored targets, and releases the
//! child from its rendezvous stop.

use crate::config::SessionConfig;
use crate::counters::Counters;
use crate::trace::Tracer;
use crate::utils;
use crate::worker::WorkerState;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("no live child to prepare")]
    NoChild,
    #[error("re-reading monitored pid from '{path}': {source}")]
    PidFile { path: PathBuf, source: io::Error },
    #[error("monitored pid {0} read from file is not alive")]
    MonitorDead(Pid),
    #[error("pid {0} is not in a stopped state")]
    NotStopped(Pid),
    #[error("resuming pid {pid}: {source}")]
    Resume { pid: Pid, source: Errno },
}

/// Attachment is reused when the tracer already holds the persistent child
/// or the externally specified target; every other case re-attaches.
pub fn should_attach(config: &SessionConfig, worker: &WorkerState) -> bool {
    if config.persistent && worker.pid.is_some() && worker.attached_pid == worker.pid {
        return false;
    }
    if let Some(monitor) = config.monitor_pid() {
        if worker.attached_pid == Some(monitor) {
            return false;
        }
    }
    true
}

/// Readies this iteration's target: tracer attachment, liveness
/// reconciliation for external targets, counter enablement, and resumption
/// of a child held in its self-stop.
pub fn prepare_target<T: Tracer, C: Counters>(
    config: &SessionConfig,
    worker: &mut WorkerState,
    tracer: &mut T,
    counters: &mut C,
) -> Result<(), AttachError> {
    let child = worker.pid.ok_or(AttachError::NoChild)?;
    let mut monitored = config.monitor_pid().unwrap_or(child);

    if should_attach(config, worker) {
        if !tracer.attach(config, monitored) {
            log::error!("tracer attach to pid {} failed, monitoring degraded", monitored);
        }
        worker.attached_pid = Some(monitored);
    }

    // A long-lived external target could have exited without us noticing.
    if child != monitored && kill(monitored, None).is_err() {
        if let Some(pid_file) = config.pid_file.as_ref() {
            // Auto-restarting daemons update their pid file; re-read it and
            // probe again.
            let new_pid = utils::read_pid_from_file(pid_file).map_err(|source| {
                AttachError::PidFile {
                    path: pid_file.clone(),
                    source,
                }
            })?;
            kill(new_pid, None).map_err(|_| AttachError::MonitorDead(new_pid))?;
            log::debug!("monitored pid updated to {}", new_pid);
            config.set_monitor_pid(new_pid);
            monitored = new_pid;
        }
    }

    if !counters.enable(config, worker) {
        log::error!("couldn't enable coverage counters for pid {}", monitored);
    }

    if child != monitored {
        // The child parked itself with SIGSTOP; release it now that the
        // tracer is in place.
        if !tracer.wait_for_stopped(child) {
            return Err(AttachError::NotStopped(child));
        }
        kill(child, Signal::SIGCONT).map_err(|source| AttachError::Resume {
            pid: child,
            source,
        })?;
    }
    Ok(())
}
