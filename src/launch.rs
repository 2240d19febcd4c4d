//! Process launcher: namespace setup, the fork that creates the target,
//! and parent-side arming of the persistent channel and coverage counters.

use crate::config::SessionConfig;
use crate::counters::Counters;
use crate::worker::WorkerState;
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType};
use nix::unistd::{self, close, dup2, fork, ForkResult, Pid};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Fixed descriptor the persistent target uses for the round channel.
pub const PERSISTENT_CHANNEL_FD: RawFd = 1023;
/// Outbound buffer grown on the channel so the target rarely blocks on it.
const PERSISTENT_SNDBUF: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("fork: {0}")]
    Fork(#[source] Errno),
    #[error("persistent channel: {0}")]
    Channel(#[source] Errno),
    #[error("arming persistent channel fd {fd}: {source}")]
    ArmChannel { fd: RawFd, source: io::Error },
    #[error("coverage counters unavailable for pid {0}")]
    CounterOpen(Pid),
}

impl LaunchError {
    /// Counter-open failure is the only per-iteration recoverable launch
    /// failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LaunchError::CounterOpen(_))
    }
}

/// Which side of the fork the caller is on.
pub enum Forked {
    /// The freshly forked process; bootstrap must run next and never
    /// return.
    Child,
    /// Parent side, with the new child's pid.
    Parent(Pid),
}

/// Creates the next target process. The worker's counter handles are closed
/// before the fork and reopened (for the child or the externally monitored
/// pid) after it.
pub fn fork_target<C: Counters>(
    config: &SessionConfig,
    worker: &mut WorkerState,
    counters: &mut C,
) -> Result<Forked, LaunchError> {
    counters.close(worker);

    let mut child_chan = None;
    if config.persistent {
        // One channel per long-lived child; a stale one belongs to a dead
        // target.
        if let Some(old) = worker.persistent_chan.take() {
            let _ = close(old);
        }
        let (parent_end, child_end) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(LaunchError::Channel)?;
        worker.persistent_chan = Some(parent_end);
        child_chan = Some(child_end);
    }

    if !config.clone_flags.is_empty() {
        if let Err(e) = unshare(config.clone_flags) {
            log::error!("unshare({:?}): {}", config.clone_flags, e);
        }
    }

    match unsafe { fork() }.map_err(LaunchError::Fork)? {
        ForkResult::Child => {
            // Die with the supervisor instead of outliving it.
            if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) } == -1
            {
                log::warn!(
                    "prctl(PR_SET_PDEATHSIG, SIGKILL): {}",
                    io::Error::last_os_error()
                );
            }
            if let Some(chan) = child_chan {
                if let Err(e) = dup2(chan, PERSISTENT_CHANNEL_FD) {
                    log::error!("dup2 persistent channel to fd {}: {}", PERSISTENT_CHANNEL_FD, e);
                }
                let _ = close(chan);
                if let Some(parent_end) = worker.persistent_chan.take() {
                    let _ = close(parent_end);
                }
            }
            if config.clone_flags.contains(CloneFlags::CLONE_NEWNET) {
                if let Err(e) = iface_up("lo") {
                    log::warn!("cannot bring interface 'lo' up: {}", e);
                }
            }
            Ok(Forked::Child)
        }
        ForkResult::Parent { child } => {
            if let Some(chan) = child_chan {
                let _ = close(chan);
            }
            if config.persistent {
                let chan = worker.persistent_chan.unwrap();
                if let Err(source) = arm_channel(chan) {
                    // The child is parked in its self-stop; don't leak it.
                    let _ = kill(child, Signal::SIGKILL);
                    return Err(LaunchError::ArmChannel { fd: chan, source });
                }
                if let Err(e) = socket::setsockopt(chan, sockopt::SndBuf, &PERSISTENT_SNDBUF) {
                    log::warn!(
                        "couldn't grow channel fd {} send buffer to {} bytes: {}",
                        chan,
                        PERSISTENT_SNDBUF,
                        e
                    );
                }
            }

            let counter_pid = config.monitor_pid().unwrap_or(child);
            if !counters.open(counter_pid, config, worker) {
                // The child is parked in its self-stop; don't leak it.
                let _ = kill(child, Signal::SIGKILL);
                return Err(LaunchError::CounterOpen(counter_pid));
            }
            Ok(Forked::Parent(child))
        }
    }
}

// Linux <fcntl.h> directed-ownership bits missing from the libc crate on
// this target.
const F_SETOWN_EX: libc::c_int = 15;
const F_SETSIG: libc::c_int = 10;
const F_OWNER_TID: libc::c_int = 0;

#[repr(C)]
struct f_owner_ex {
    type_: libc::c_int,
    pid: libc::pid_t,
}

/// Makes channel readiness raise SIGIO at the owning thread, so the reaper's
/// gate wakes up on round completion.
fn arm_channel(fd: RawFd) -> io::Result<()> {
    let owner = f_owner_ex {
        type_: F_OWNER_TID,
        pid: unistd::gettid().as_raw(),
    };
    if unsafe { libc::fcntl(fd, F_SETOWN_EX, &owner) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, F_SETSIG, libc::SIGIO) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_ASYNC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Brings a network interface administratively up inside a fresh network
/// namespace.
fn iface_up(name: &str) -> io::Result<()> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_IP) };
    if sock == -1 {
        return Err(io::Error::last_os_error());
    }

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    let res = unsafe {
        if libc::ioctl(sock, libc::SIOCGIFFLAGS, &mut ifr) == -1 {
            Err(io::Error::last_os_error())
        } else {
            ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
            if libc::ioctl(sock, libc::SIOCSIFFLAGS, &ifr) == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    };
    unsafe { libc::close(sock) };
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_counter_open_is_recoverable() {
        assert!(LaunchError::CounterOpen(Pid::from_raw(1)).is_recoverable());
        assert!(!LaunchError::Fork(Errno::EAGAIN).is_recoverable());
        assert!(!LaunchError::Channel(Errno::EMFILE).is_recoverable());
    }

    #[test]
    fn arming_rejects_closed_descriptor() {
        assert!(arm_channel(-1).is_err());
    }
}
