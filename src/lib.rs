//! warden: a Linux target-process supervisor for coverage-guided fuzzing.
//!
//! One iteration launches (or reuses) a target process, coordinates tracer
//! attachment, feeds every child state-change event to the crash classifier,
//! and ends with counter and coverage analysis. The classifier, counter, and
//! coverage subsystems plug in behind the traits in [`trace`], [`counters`]
//! and [`sancov`].

pub mod attach;
pub mod bootstrap;
pub mod config;
pub mod counters;
pub mod launch;
pub mod reap;
pub mod sancov;
pub mod session;
pub mod signal;
pub mod trace;
pub mod utils;
pub mod worker;

use crate::config::SessionConfig;
use crate::counters::Counters;
use crate::launch::Forked;
use crate::sancov::CoverageSink;
use crate::signal::SignalGate;
use crate::trace::Tracer;
use crate::worker::WorkerState;
use std::process;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] launch::LaunchError),
    #[error(transparent)]
    Attach(#[from] attach::AttachError),
    #[error(transparent)]
    Reap(#[from] reap::ReapError),
    #[error(transparent)]
    Session(#[from] session::SessionError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The target ran and every event was reaped and analyzed.
    Completed,
    /// Setup failed in a way worth retrying with the same input.
    Retry,
}

/// Runs one full supervision iteration on the calling worker thread.
///
/// In persistent mode a live long-lived child is reused; otherwise a fresh
/// target is forked and bootstrapped. The child side of the fork never
/// returns from here.
pub fn run_iteration<T, C, S>(
    config: &SessionConfig,
    worker: &mut WorkerState,
    gate: &SignalGate,
    tracer: &mut T,
    counters: &mut C,
    sancov: &mut S,
) -> Result<IterationOutcome, SupervisorError>
where
    T: Tracer,
    C: Counters,
    S: CoverageSink,
{
    worker.backtrace = None;

    if config.persistent && worker.persistent_pid.is_some() {
        worker.pid = worker.persistent_pid;
    } else {
        match launch::fork_target(config, worker, counters) {
            Ok(Forked::Child) => {
                let err = match bootstrap::launch_target(config, &worker.input_path) {
                    Err(e) => e,
                    Ok(never) => match never {},
                };
                log::error!("target bootstrap failed: {}", err);
                process::exit(1);
            }
            Ok(Forked::Parent(child)) => {
                worker.pid = Some(child);
                if config.persistent {
                    worker.persistent_pid = Some(child);
                }
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("launch setup failed ({}), retrying", e);
                return Ok(IterationOutcome::Retry);
            }
            Err(e) => return Err(e.into()),
        }
    }

    worker.iter_start = Instant::now();
    attach::prepare_target(config, worker, tracer, counters)?;
    reap::reap_target(config, worker, gate, tracer, counters, sancov)?;
    Ok(IterationOutcome::Completed)
}
