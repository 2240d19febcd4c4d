//! Small filesystem helpers consumed across the supervisor.

use nix::unistd::Pid;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub fn file_exists(path: &Path) -> bool {
    path.exists()
}

/// Reads at most `max_bytes` from `path`.
pub fn read_file_bounded(path: &Path, max_bytes: usize) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut buf = Vec::with_capacity(max_bytes.min(4096));
    file.take(max_bytes as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Parses a positive pid from a file holding its decimal representation.
pub fn read_pid_from_file(path: &Path) -> io::Result<Pid> {
    let content = std::fs::read_to_string(path)?;
    let pid: i32 = content.trim().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("'{}' does not hold a pid", path.display()),
        )
    })?;
    if pid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("non-positive pid {} in '{}'", pid, path.display()),
        ));
    }
    Ok(Pid::from_raw(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pid_file_parse() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "  1234 ").unwrap();
        assert_eq!(read_pid_from_file(f.path()).unwrap(), Pid::from_raw(1234));
    }

    #[test]
    fn pid_file_rejects_garbage() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "not-a-pid").unwrap();
        assert!(read_pid_from_file(f.path()).is_err());

        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "-5").unwrap();
        assert!(read_pid_from_file(f.path()).is_err());
    }

    #[test]
    fn bounded_read_truncates() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[b'x'; 100]).unwrap();
        let data = read_file_bounded(f.path(), 10).unwrap();
        assert_eq!(data.len(), 10);
    }
}
