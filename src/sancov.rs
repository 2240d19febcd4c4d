//! Boundary to the sanitizer-coverage consumer.

use crate::config::SessionConfig;
use crate::worker::WorkerState;

/// Consumes coverage the sanitizer runtime wrote out for the finished
/// iteration.
pub trait CoverageSink {
    fn analyze(&mut self, config: &SessionConfig, worker: &mut WorkerState);
}

/// Sink that discards coverage.
#[derive(Debug, Default)]
pub struct NullSink;

impl CoverageSink for NullSink {
    fn analyze(&mut self, _config: &SessionConfig, _worker: &mut WorkerState) {}
}
