//! Pidfile management for the arbiter.

use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// The arbiter's pidfile: one line, one pid.
///
/// During a binary upgrade the old arbiter renames its file to `<path>.2`
/// so the successor can claim the canonical path.
#[derive(Debug)]
pub(crate) struct PidFile {
    path: PathBuf,
    pid: Pid,
}

impl PidFile {
    /// Write the current pid, after validating any file already there.
    pub(crate) fn create(path: &Path) -> Result<PidFile> {
        let pid = nix::unistd::getpid();
        if let Some(old_pid) = read_pid(path) {
            if old_pid != pid {
                // EPERM still proves the process exists
                let alive = !matches!(kill(old_pid, None), Err(Errno::ESRCH));
                if alive {
                    return Err(Error::new_config(format!(
                        "already running on PID {} (file {})",
                        old_pid,
                        path.display()
                    )));
                }
                debug!("removing stale pidfile: {}", path.display());
                let _ = std::fs::remove_file(path);
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(Error::new_config(format!(
                    "pidfile directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        let tmp = path.with_extension(format!("{}.tmp", pid));
        let mut file = std::fs::File::create(&tmp)
            .map_err(|e| Error::new_config(format!("cannot write pidfile: {}", e)))?;
        writeln!(file, "{}", pid).map_err(|e| Error::new_config(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::new_config(e.to_string()))?;

        Ok(PidFile {
            path: path.to_owned(),
            pid,
        })
    }

    /// Move the pidfile, keeping ownership of the inode.
    pub(crate) fn rename(&mut self, to: &Path) -> Result<()> {
        std::fs::rename(&self.path, to).map_err(Error::new_os)?;
        self.path = to.to_owned();
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file, but only while it still names this process.
    pub(crate) fn unlink(&self) {
        match read_pid(&self.path) {
            Some(pid) if pid == self.pid => {
                let _ = std::fs::remove_file(&self.path);
            }
            Some(other) => {
                warn!(
                    "pidfile {} taken over by pid {}, leaving it",
                    self.path.display(),
                    other
                );
            }
            None => {}
        }
    }
}

fn read_pid(path: &Path) -> Option<Pid> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.trim().parse::<i32>().ok().map(Pid::from_raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bantam.pid");
        let pidfile = PidFile::create(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents.trim().parse::<i32>().unwrap(),
            nix::unistd::getpid().as_raw()
        );
        pidfile.unlink();
        assert!(!path.exists());
    }

    #[test]
    fn test_refuses_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bantam.pid");
        // pid 1 is always alive
        std::fs::write(&path, "1\n").unwrap();
        let err = PidFile::create(&path).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_takes_over_stale_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bantam.pid");
        // a pid that cannot exist
        std::fs::write(&path, "999999999\n").unwrap();
        let pidfile = PidFile::create(&path).unwrap();
        pidfile.unlink();
    }

    #[test]
    fn test_rename_dance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bantam.pid");
        let mut pidfile = PidFile::create(&path).unwrap();
        let moved = dir.path().join("bantam.pid.2");
        pidfile.rename(&moved).unwrap();
        assert!(!path.exists());
        assert!(moved.exists());
        pidfile.unlink();
        assert!(!moved.exists());
    }

    #[test]
    fn test_unlink_respects_new_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bantam.pid");
        let pidfile = PidFile::create(&path).unwrap();
        // a successor took the file over
        std::fs::write(&path, "1\n").unwrap();
        pidfile.unlink();
        assert!(path.exists());
    }
}
