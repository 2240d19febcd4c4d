//! Session-wide configuration, shared read-mostly across workers.

use iota::iota;
use nix::sched::CloneFlags;
use nix::unistd::Pid;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Placeholder token replaced with the current input path in argv templates.
pub const FILE_PLACEHOLDER: &str = "___FILE___";

/// Default stack unwind depth for crash classification.
pub const UNWIND_DEPTH_DEFAULT: usize = 7;
/// Unwind depth used when sanitizer runtime frames occupy the stack top.
pub const UNWIND_DEPTH_SANITIZERS: usize = 14;

/// Bitset selecting the coverage feedback methods.
pub type CovMethods = u32;

pub const COV_NONE: CovMethods = 0;

iota! {
    pub const COV_INSTR_COUNT: CovMethods = 1 << (iota); // hardware instruction counter
    , COV_BRANCH_COUNT                                   // hardware branch counter
    , COV_BTS_BLOCK                                      // Intel BTS block trace
    , COV_BTS_EDGE                                       // Intel BTS edge trace
    , COV_IPT_BLOCK                                      // Intel PT block trace
    , COV_SOFT                                           // software trace
}

/// Methods that need the newer kernel baseline (see `session`).
pub const COV_HW_TRACE: CovMethods = COV_BTS_BLOCK | COV_BTS_EDGE | COV_IPT_BLOCK;

/// One instance per fuzzing session. Mutated only during `session_init`,
/// except for the monitored pid (single-writer, see `set_monitor_pid`) and
/// the termination flag.
pub struct SessionConfig {
    /// Target command line; one argument may contain [`FILE_PLACEHOLDER`].
    pub cmdline: Vec<String>,
    /// Directory for crash artifacts and other session output.
    pub work_dir: PathBuf,
    /// Reuse one long-lived target across rounds over a channel.
    pub persistent: bool,
    /// Target reads inputs from stdin; disables argv substitution.
    pub fuzz_stdin: bool,
    /// Target carries sanitizer instrumentation.
    pub sanitizers: bool,
    /// SIGABRT counts as crash-worthy.
    pub monitor_sigabrt: bool,
    /// Selected coverage feedback methods.
    pub cov_methods: CovMethods,
    /// Path to re-read the monitored pid from when it goes away.
    pub pid_file: Option<PathBuf>,
    /// Human-readable invocation of the monitored process, from procfs.
    pub monitor_cmdline: Option<String>,
    /// Namespaces to unshare before forking the target.
    pub clone_flags: CloneFlags,
    /// Disable ASLR in the target (best effort).
    pub disable_aslr: bool,
    /// Target executable, opened once at session init and kept open for
    /// descriptor-relative re-execution.
    pub exe: Option<File>,
    /// Per-iteration wall-clock limit, checked on reaper ticks.
    pub time_limit: Option<Duration>,
    /// Stack unwind depth handed to the crash classifier.
    pub unwind_depth: usize,

    /// Externally specified monitored pid; 0 means none. Access through
    /// `monitor_pid`/`set_monitor_pid`.
    pub(crate) monitor_pid: AtomicI32,
    /// Process-wide termination request.
    pub(crate) stop: Arc<AtomicBool>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cmdline: Vec::new(),
            work_dir: PathBuf::from("./"),
            persistent: false,
            fuzz_stdin: false,
            sanitizers: false,
            monitor_sigabrt: true,
            cov_methods: COV_NONE,
            pid_file: None,
            monitor_cmdline: None,
            clone_flags: CloneFlags::empty(),
            disable_aslr: false,
            exe: None,
            time_limit: None,
            unwind_depth: UNWIND_DEPTH_DEFAULT,
            monitor_pid: AtomicI32::new(0),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl SessionConfig {
    pub fn monitor_pid(&self) -> Option<Pid> {
        let pid = self.monitor_pid.load(Ordering::Relaxed);
        if pid > 0 {
            Some(Pid::from_raw(pid))
        } else {
            None
        }
    }

    /// Single writer: session init, or the attach coordinator after a
    /// pid-file re-read.
    pub fn set_monitor_pid(&self, pid: Pid) {
        self.monitor_pid.store(pid.as_raw(), Ordering::Relaxed)
    }

    pub fn stop_soon(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Requests a process-wide stop; workers notice on their next check.
    pub fn stop_req(&self) {
        self.stop.store(true, Ordering::Relaxed)
    }

    /// Flag handle for signal-driven shutdown registration.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_pid_roundtrip() {
        let config = SessionConfig::default();
        assert_eq!(config.monitor_pid(), None);
        config.set_monitor_pid(Pid::from_raw(4242));
        assert_eq!(config.monitor_pid(), Some(Pid::from_raw(4242)));
    }

    #[test]
    fn stop_flag_is_shared() {
        let config = SessionConfig::default();
        let flag = config.stop_flag();
        assert!(!config.stop_soon());
        flag.store(true, Ordering::Relaxed);
        assert!(config.stop_soon());
    }

    #[test]
    fn hw_trace_methods() {
        assert_eq!(COV_HW_TRACE & COV_BRANCH_COUNT, 0);
        assert_ne!(COV_HW_TRACE & COV_IPT_BLOCK, 0);
        assert_ne!(COV_HW_TRACE & COV_BTS_BLOCK, 0);
        assert_ne!(COV_HW_TRACE & COV_BTS_EDGE, 0);
    }
}
