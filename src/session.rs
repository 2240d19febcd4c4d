//! Session initializer: one-time environment validation and setup before
//! any worker starts.

use crate::config::{
    CovMethods, SessionConfig, COV_HW_TRACE, COV_NONE, UNWIND_DEPTH_DEFAULT,
    UNWIND_DEPTH_SANITIZERS,
};
use crate::counters::Counters;
use crate::trace::Tracer;
use crate::utils;
use nix::errno::Errno;
use nix::unistd::{access, AccessFlags, Pid};
use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::mem;
use std::path::PathBuf;
use thiserror::Error;

/// Upper bound on the /proc cmdline read for the monitored process.
const PROC_CMDLINE_MAX: usize = 8192;

/// Kernel baseline for hardware counter methods.
const KERNEL_MIN_DEFAULT: (u32, u32) = (3, 7);
/// Kernel baseline for BTS/IPT trace methods.
const KERNEL_MIN_HW_TRACE: (u32, u32) = (4, 1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("'{path}' is not an executable file: {source}")]
    NotExecutable { path: PathBuf, source: Errno },
    #[error("opening target executable '{path}': {source}")]
    OpenExe { path: PathBuf, source: io::Error },
    #[error("cannot determine the running kernel version")]
    KernelVersion,
    #[error("kernel {found} is too old for the selected coverage methods (need >= {}.{})", .need.0, .need.1)]
    KernelTooOld { found: String, need: (u32, u32) },
    #[error("coverage counter subsystem failed to initialize")]
    CountersInit,
    #[error("reading monitored pid from '{path}': {source}")]
    PidFile { path: PathBuf, source: io::Error },
    #[error("reading command line of monitored pid {pid}: {source}")]
    MonitorCmdline { pid: Pid, source: io::Error },
}

/// Validates the session and performs every one-time setup step. Runs once,
/// before workers are spawned.
pub fn session_init<T: Tracer, C: Counters>(
    config: &mut SessionConfig,
    tracer: &mut T,
    counters: &mut C,
) -> Result<(), SessionError> {
    let exe_path = PathBuf::from(config.cmdline.first().cloned().unwrap_or_default());
    access(&exe_path, AccessFlags::X_OK).map_err(|source| SessionError::NotExecutable {
        path: exe_path.clone(),
        source,
    })?;
    // Kept open for the whole session; the bootstrap re-executes from this
    // descriptor even if the path is replaced underneath us.
    let exe = File::open(&exe_path).map_err(|source| SessionError::OpenExe {
        path: exe_path.clone(),
        source,
    })?;
    config.exe = Some(exe);

    check_glibc();

    if config.cov_methods != COV_NONE {
        let release = kernel_release().ok_or(SessionError::KernelVersion)?;
        let found = parse_major_minor(&release).ok_or(SessionError::KernelVersion)?;
        let need = min_kernel_for(config.cov_methods);
        if !version_at_least(found, need) {
            return Err(SessionError::KernelTooOld {
                found: release,
                need,
            });
        }
    }

    if !counters.init(config) {
        return Err(SessionError::CountersInit);
    }

    if let Some(pid_file) = config.pid_file.clone() {
        let pid = utils::read_pid_from_file(&pid_file)
            .map_err(|source| SessionError::PidFile {
                path: pid_file,
                source,
            })?;
        config.set_monitor_pid(pid);
    }

    if let Some(pid) = config.monitor_pid() {
        let raw = utils::read_file_bounded(
            &PathBuf::from(format!("/proc/{}/cmdline", pid)),
            PROC_CMDLINE_MAX,
        )
        .map_err(|source| SessionError::MonitorCmdline { pid, source })?;
        let cmdline = normalize_cmdline(&raw);
        log::info!("monitoring external process {}: '{}'", pid, cmdline);
        config.monitor_cmdline = Some(cmdline);
    }

    tracer.init_signal_set(config);

    // Sanitizer runtimes put their own frames on top of the stack; widen
    // the unwind so the faulting frames stay visible.
    if config.sanitizers && config.monitor_sigabrt && config.unwind_depth == UNWIND_DEPTH_DEFAULT {
        config.unwind_depth = UNWIND_DEPTH_SANITIZERS;
    }

    Ok(())
}

#[cfg(target_env = "gnu")]
fn check_glibc() {
    extern "C" {
        fn gnu_get_libc_version() -> *const libc::c_char;
    }
    let version = unsafe { std::ffi::CStr::from_ptr(gnu_get_libc_version()) };
    let version = version.to_string_lossy();
    if let Some(found) = parse_major_minor(&version) {
        if !version_at_least(found, (2, 24)) {
            log::warn!(
                "glibc {} has known malloc/ptrace interaction bugs, consider upgrading",
                version
            );
        }
    }
}

#[cfg(not(target_env = "gnu"))]
fn check_glibc() {}

fn kernel_release() -> Option<String> {
    let mut uts: libc::utsname = unsafe { mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Some(release.to_string_lossy().into_owned())
}

/// Minimum kernel version required by the selected coverage methods.
pub(crate) fn min_kernel_for(methods: CovMethods) -> (u32, u32) {
    if methods & COV_HW_TRACE != 0 {
        KERNEL_MIN_HW_TRACE
    } else {
        KERNEL_MIN_DEFAULT
    }
}

/// Extracts `major.minor` from a version string such as `5.15.0-91-generic`.
pub(crate) fn parse_major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

pub(crate) fn version_at_least(found: (u32, u32), need: (u32, u32)) -> bool {
    found.0 > need.0 || (found.0 == need.0 && found.1 >= need.1)
}

/// Turns the NUL-separated /proc cmdline image into one printable line.
pub(crate) fn normalize_cmdline(raw: &[u8]) -> String {
    let trimmed = match raw.iter().rposition(|&b| b != 0) {
        Some(last) => &raw[..=last],
        None => &[],
    };
    trimmed
        .iter()
        .map(|&b| if b == 0 { ' ' } else { b as char })
        .collect()
}
