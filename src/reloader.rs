//! Development auto-reload.
//!
//! A background thread stat-polls the server binary and any configured
//! extra files; when one changes the worker finishes its current request
//! and exits, letting the arbiter boot a replacement that sees the new
//! code. Strictly a development convenience.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) struct Reloader {
    changed: Arc<AtomicBool>,
}

impl Reloader {
    /// Start watching; the thread dies once a change has been flagged.
    pub(crate) fn spawn(extra_files: Vec<PathBuf>) -> Reloader {
        let mut files = extra_files;
        if let Ok(exe) = std::env::current_exe() {
            files.push(exe);
        }

        let changed = Arc::new(AtomicBool::new(false));
        let flag = changed.clone();
        let builder = std::thread::Builder::new().name("reloader".to_owned());
        let spawned = builder.spawn(move || {
            let mut seen: HashMap<PathBuf, Option<SystemTime>> = files
                .iter()
                .map(|f| (f.clone(), mtime(f)))
                .collect();
            debug!("watching {} file(s) for changes", seen.len());
            loop {
                std::thread::sleep(POLL_INTERVAL);
                for (file, old) in seen.iter_mut() {
                    let new = mtime(file);
                    if new != *old {
                        info!("{} modified, restarting worker", file.display());
                        flag.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        });
        if let Err(e) = spawned {
            debug!("cannot start reloader thread: {}", e);
        }
        Reloader { changed }
    }

    pub(crate) fn changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }
}

fn mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flags_a_touched_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let reloader = Reloader::spawn(vec![file.path().to_owned()]);
        assert!(!reloader.changed());

        std::thread::sleep(Duration::from_millis(1100));
        writeln!(file, "changed").unwrap();
        file.flush().unwrap();

        // give the poll loop two intervals to notice
        for _ in 0..30 {
            if reloader.changed() {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("reloader never noticed the change");
    }
}
