//! Signal gate: the two asynchronous events a worker cares about
//! (child state change, persistent channel readiness), turned into a
//! synchronous timed wait.

use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;

/// What a gate wait yielded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// One of the gated signals was delivered.
    Signal(i32),
    /// Nothing arrived within the timeout; this is the reaper's tick.
    TimedOut,
}

/// Thread-local mask over SIGCHLD and SIGIO. Built once per worker thread
/// and never mutated while the reaper loop runs.
pub struct SignalGate {
    mask: libc::sigset_t,
}

impl SignalGate {
    /// Blocks SIGCHLD and SIGIO on the calling thread so they queue for
    /// `wait` instead of reaching an asynchronous handler.
    pub fn new() -> io::Result<Self> {
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGCHLD);
            libc::sigaddset(&mut mask, libc::SIGIO);
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, ptr::null_mut());
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(SignalGate { mask })
        }
    }

    /// Waits for one gated signal. A timeout (or an interrupted wait) is a
    /// tick, not an error.
    pub fn wait(&self, timeout: Duration) -> io::Result<GateEvent> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let sig = unsafe { libc::sigtimedwait(&self.mask, ptr::null_mut(), &ts) };
        if sig == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(GateEvent::TimedOut),
                _ => Err(err),
            }
        } else {
            Ok(GateEvent::Signal(sig))
        }
    }
}
