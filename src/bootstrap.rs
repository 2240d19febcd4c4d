//! Target bootstrap: runs inside the freshly forked process and replaces it
//! with the target image. Never returns on success.

use crate::config::{SessionConfig, FILE_PLACEHOLDER};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{alarm, execv, getpid};
use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::ptr;
use thiserror::Error;

/// Upper bound on argv entries passed to the target.
pub const ARGS_MAX: usize = 512;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("prctl(PR_SET_DUMPABLE, 1): {0}")]
    Dumpable(#[source] io::Error),
    #[error("empty command line")]
    EmptyCmdline,
    #[error("argument contains a NUL byte: {0:?}")]
    BadArg(String),
    #[error("stopping self for tracer rendezvous: {0}")]
    SelfStop(#[source] Errno),
    #[error("exec '{path}' (fd={fd}): {source}")]
    Exec {
        path: String,
        fd: RawFd,
        source: Errno,
    },
}

/// Hardens the new process, rewrites its argv from the template, parks it
/// for the tracer, and replaces its image with the target binary.
pub fn launch_target(config: &SessionConfig, input: &Path) -> Result<Infallible, BootstrapError> {
    // Stay attachable even after any privilege drop in the target.
    if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 1 as libc::c_ulong) } == -1 {
        return Err(BootstrapError::Dumpable(io::Error::last_os_error()));
    }

    // Abort instead of limping on after detected heap corruption, unless
    // the caller picked its own policy.
    if env::var_os("MALLOC_CHECK_").is_none() {
        env::set_var("MALLOC_CHECK_", "7");
    }

    // Refused in some sandboxes (Docker filters the syscall).
    if config.disable_aslr
        && unsafe { libc::personality(libc::ADDR_NO_RANDOMIZE as libc::c_ulong) } == -1
    {
        log::debug!(
            "personality(ADDR_NO_RANDOMIZE): {}",
            io::Error::last_os_error()
        );
    }

    let args = build_args(config, input)?;
    log::debug!(
        "launching '{}' on '{}'",
        args[0].to_string_lossy(),
        if config.persistent {
            "PERSISTENT_MODE".into()
        } else {
            input.display().to_string()
        }
    );

    // Alarms survive fork; none may fire inside the new image.
    let _ = alarm::cancel();

    // Rendezvous: park stopped until the attach coordinator resumes us.
    kill(getpid(), Signal::SIGSTOP).map_err(BootstrapError::SelfStop)?;

    let exe_fd = config.exe.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1);
    if exe_fd != -1 {
        exec_by_fd(exe_fd, &args);
    }
    let err = match execv(args[0].as_c_str(), &args) {
        Err(e) => e,
        Ok(never) => match never {},
    };

    // Emergency exit path so a confused caller can't hang here forever.
    let _ = alarm::set(1);
    Err(BootstrapError::Exec {
        path: args[0].to_string_lossy().into_owned(),
        fd: exe_fd,
        source: err,
    })
}

/// Descriptor-relative image replacement from the session's executable
/// handle; only returns when the mechanism is unavailable.
fn exec_by_fd(fd: RawFd, args: &[CString]) {
    let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(ptr::null());

    let env: Vec<CString> = env::vars_os()
        .filter_map(|(k, v)| {
            let mut kv = k.as_bytes().to_vec();
            kv.push(b'=');
            kv.extend_from_slice(v.as_bytes());
            CString::new(kv).ok()
        })
        .collect();
    let mut envp: Vec<*const libc::c_char> = env.iter().map(|e| e.as_ptr()).collect();
    envp.push(ptr::null());

    let empty = CString::new("").unwrap();
    unsafe {
        libc::syscall(
            libc::SYS_execveat,
            fd,
            empty.as_ptr(),
            argv.as_ptr(),
            envp.as_ptr(),
            libc::AT_EMPTY_PATH,
        );
    }
}

/// Builds the target argv from the command-line template. Placeholder
/// tokens are substituted with the input path (whole-token or in-token,
/// keeping prefix and suffix) unless inputs travel over stdin or the
/// persistent channel. Capped at [`ARGS_MAX`] entries.
pub(crate) fn build_args(config: &SessionConfig, input: &Path) -> Result<Vec<CString>, BootstrapError> {
    if config.cmdline.is_empty() {
        return Err(BootstrapError::EmptyCmdline);
    }
    let substitute = !config.fuzz_stdin && !config.persistent;
    let input = input.to_string_lossy();

    let mut args = Vec::with_capacity(config.cmdline.len().min(ARGS_MAX));
    for arg in config.cmdline.iter().take(ARGS_MAX) {
        let arg = if substitute && arg.contains(FILE_PLACEHOLDER) {
            arg.replacen(FILE_PLACEHOLDER, &input, 1)
        } else {
            arg.clone()
        };
        let arg = CString::new(arg.as_bytes()).map_err(|_| BootstrapError::BadArg(arg.clone()))?;
        args.push(arg);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn config_with(cmdline: &[&str]) -> SessionConfig {
        SessionConfig {
            cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn as_strs(args: &[CString]) -> Vec<&str> {
        args.iter().map(|a| a.to_str().unwrap()).collect()
    }

    #[test]
    fn whole_token_placeholder_replaced_exactly() {
        let config = config_with(&["./target", "-q", "___FILE___", "-x"]);
        let args = build_args(&config, Path::new("/tmp/input.bin")).unwrap();
        assert_eq!(as_strs(&args), ["./target", "-q", "/tmp/input.bin", "-x"]);
    }

    #[test]
    fn in_token_placeholder_keeps_prefix_and_suffix() {
        let config = config_with(&["./target", "--file=___FILE___.raw"]);
        let args = build_args(&config, Path::new("/tmp/input")).unwrap();
        assert_eq!(as_strs(&args)[1], "--file=/tmp/input.raw");
    }

    #[test]
    fn no_substitution_when_fuzzing_stdin() {
        let mut config = config_with(&["./target", "___FILE___"]);
        config.fuzz_stdin = true;
        let args = build_args(&config, Path::new("/tmp/input")).unwrap();
        assert_eq!(as_strs(&args)[1], "___FILE___");
    }

    #[test]
    fn no_substitution_in_persistent_mode() {
        let mut config = config_with(&["./target", "--file=___FILE___"]);
        config.persistent = true;
        let args = build_args(&config, Path::new("/tmp/input")).unwrap();
        assert_eq!(as_strs(&args)[1], "--file=___FILE___");
    }

    #[test]
    fn argv_is_capped() {
        let cmdline: Vec<String> = (0..ARGS_MAX + 10).map(|i| format!("arg{}", i)).collect();
        let config = SessionConfig {
            cmdline,
            ..Default::default()
        };
        let args = build_args(&config, Path::new("/tmp/input")).unwrap();
        assert_eq!(args.len(), ARGS_MAX);
    }

    #[test]
    fn empty_cmdline_rejected() {
        let config = SessionConfig::default();
        assert!(matches!(
            build_args(&config, Path::new("/tmp/input")),
            Err(BootstrapError::EmptyCmdline)
        ));
    }

    #[test]
    fn nul_in_argument_rejected() {
        let config = config_with(&["./target", "bad\0arg"]);
        assert!(matches!(
            build_args(&config, Path::new("/tmp/input")),
            Err(BootstrapError::BadArg(_))
        ));
    }
}
