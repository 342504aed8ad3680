//! The per-worker heartbeat file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::util;

/// An anonymous temporary file whose mtime is the worker's liveness signal.
///
/// The arbiter creates it before forking, the worker inherits the fd and
/// calls [`WorkerTmp::notify`] from its serve loop; the arbiter only ever
/// reads the timestamp. The path is unlinked immediately after creation, so
/// the inode disappears with the last fd.
///
/// If the backing filesystem can stall on metadata writes, point
/// `worker_tmp_dir` at something RAM-backed instead.
#[derive(Debug)]
pub(crate) struct WorkerTmp {
    file: File,
}

impl WorkerTmp {
    pub(crate) fn new(dir: Option<&Path>) -> Result<WorkerTmp> {
        let dir = dir
            .map(Path::to_owned)
            .unwrap_or_else(std::env::temp_dir);
        let pid = std::process::id();

        for attempt in 0..64 {
            let unique = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(attempt);
            let path = dir.join(format!("wbantam-{}-{}-{}", pid, attempt, unique));
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(file) => {
                    // the name was only needed to create the inode
                    std::fs::remove_file(&path)
                        .map_err(|e| Error::new_os(format!("cannot unlink {}: {}", path.display(), e)))?;
                    return Ok(WorkerTmp { file });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(Error::new_os(format!(
                        "cannot create worker tmp in {}: {}",
                        dir.display(),
                        e
                    )))
                }
            }
        }
        Err(Error::new_os(format!(
            "cannot create a unique worker tmp in {}",
            dir.display()
        )))
    }

    /// Refresh the heartbeat by touching the inode's timestamps.
    pub(crate) fn notify(&self) {
        // a failed touch only matters if it persists; the arbiter will
        // notice the stalled clock either way
        let _ = util::touch_fd(self.file.as_raw_fd());
    }

    /// When the worker last notified.
    pub(crate) fn last_update(&self) -> io::Result<SystemTime> {
        self.file.metadata()?.modified()
    }
}

impl AsRawFd for WorkerTmp {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_notify_advances_mtime() {
        let tmp = WorkerTmp::new(None).unwrap();
        let t1 = tmp.last_update().unwrap();
        sleep(Duration::from_millis(25));
        tmp.notify();
        let t2 = tmp.last_update().unwrap();
        assert!(t2 > t1);

        // monotone across repeated notifies
        sleep(Duration::from_millis(25));
        tmp.notify();
        let t3 = tmp.last_update().unwrap();
        assert!(t3 >= t2);
    }

    #[test]
    fn test_custom_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = WorkerTmp::new(Some(dir.path())).unwrap();
        tmp.notify();
        // the directory entry is already gone
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
