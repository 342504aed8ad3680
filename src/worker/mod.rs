//! The worker process runtime.
//!
//! A worker is forked by the arbiter, inherits the listening sockets plus a
//! heartbeat file, and serves one request at a time until told to stop. All
//! signal handlers only flip atomics; the serve loop notices them at its
//! next iteration (an in-flight request is never interrupted — a worker
//! that blocks past `timeout` is killed by the arbiter instead).

mod sync;
pub(crate) mod tmp;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use nix::unistd::Pid;
use tracing::{debug, error, info};

use crate::app::{AppFactory, Application};
use crate::config::Config;
use crate::reloader::Reloader;
use crate::sock::Listener;
use crate::util;

use self::tmp::WorkerTmp;

/// Exit status a worker uses when it cannot finish booting; the arbiter
/// treats a streak of these as fatal instead of respawning forever.
pub(crate) const WORKER_BOOT_ERROR: i32 = 3;

static TERM_FLAG: AtomicBool = AtomicBool::new(false);
static QUIT_FLAG: AtomicBool = AtomicBool::new(false);
static USR1_FLAG: AtomicBool = AtomicBool::new(false);
static ABRT_FLAG: AtomicBool = AtomicBool::new(false);
/// Write end of the worker→arbiter pipe, for the abort handler.
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

/// Only async-signal-safe work here: flip a flag, maybe write one byte.
extern "C" fn worker_signal_handler(signum: libc::c_int) {
    match signum {
        libc::SIGTERM => TERM_FLAG.store(true, Ordering::SeqCst),
        libc::SIGQUIT | libc::SIGINT => QUIT_FLAG.store(true, Ordering::SeqCst),
        libc::SIGUSR1 => USR1_FLAG.store(true, Ordering::SeqCst),
        libc::SIGABRT => {
            ABRT_FLAG.store(true, Ordering::SeqCst);
            let fd = NOTIFY_FD.load(Ordering::SeqCst);
            if fd >= 0 {
                unsafe {
                    libc::write(fd, b"!".as_ptr() as *const libc::c_void, 1);
                }
            }
        }
        _ => {}
    }
}

/// One worker process.
pub struct Worker {
    id: u32,
    age: u64,
    ppid: Pid,
    cfg: Arc<Config>,
    tmp: WorkerTmp,
    listeners: Vec<Listener>,
    life_fd: OwnedFd,
    notify_fd: OwnedFd,
    app: Option<Arc<dyn Application>>,
    handled: usize,
    max_requests: usize,
    reloader: Option<Reloader>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u32,
        age: u64,
        cfg: Arc<Config>,
        tmp: WorkerTmp,
        listeners: Vec<Listener>,
        life_fd: OwnedFd,
        notify_fd: OwnedFd,
        app: Option<Arc<dyn Application>>,
    ) -> Worker {
        let max_requests = jitter_max_requests(cfg.max_requests, cfg.max_requests_jitter);
        Worker {
            id,
            age,
            ppid: nix::unistd::getppid(),
            cfg,
            tmp,
            listeners,
            life_fd,
            notify_fd,
            app,
            handled: 0,
            max_requests,
            reloader: None,
        }
    }

    /// The dense worker id (1..=workers).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The worker's generation serial; strictly increasing across the
    /// arbiter's lifetime.
    pub fn age(&self) -> u64 {
        self.age
    }

    /// Requests handled so far by this process.
    pub fn handled_requests(&self) -> usize {
        self.handled
    }

    /// One-shot initialization after fork, then the serve loop.
    ///
    /// Returns the process exit code; never touches the arbiter's state.
    pub(crate) fn init_process(mut self, factory: &dyn AppFactory) -> i32 {
        NOTIFY_FD.store(self.notify_fd.as_raw_fd(), Ordering::SeqCst);
        if let Err(e) = init_signals() {
            error!("cannot install worker signal handlers: {}", e);
            return WORKER_BOOT_ERROR;
        }

        if self.cfg.user.is_some() || self.cfg.group.is_some() {
            if util::can_switch_user() {
                if let Err(e) = util::set_owner_process(
                    self.cfg.user.as_deref(),
                    self.cfg.group.as_deref(),
                ) {
                    error!("cannot drop privileges: {}", e);
                    return WORKER_BOOT_ERROR;
                }
            } else {
                debug!("not enough privileges to switch user, continuing as-is");
            }
        }

        if self.app.is_none() {
            match factory.load() {
                Ok(app) => self.app = Some(app),
                Err(e) => {
                    error!("application failed to load: {}", e);
                    return WORKER_BOOT_ERROR;
                }
            }
        }

        if let Some(hook) = self.cfg.hooks.post_worker_init {
            hook(&self);
        }

        if self.cfg.reload {
            self.reloader = Some(Reloader::spawn(self.cfg.reload_extra_files.clone()));
        }

        for listener in &self.listeners {
            if let Err(e) = listener.set_non_blocking(true) {
                error!("cannot prepare listener {}: {}", listener, e);
                return WORKER_BOOT_ERROR;
            }
        }

        let code = self.run();
        if let Some(hook) = self.cfg.hooks.worker_exit {
            hook(&self);
        }
        info!("worker exiting (pid: {})", std::process::id());
        code
    }

    /// The synchronous serve loop.
    fn run(&mut self) -> i32 {
        // wake at least twice per timeout window so a heartbeat always
        // lands inside it
        let budget_ms: i32 = if self.cfg.timeout > 0 {
            std::cmp::max(self.cfg.timeout * 1000 / 2, 1000) as i32
        } else {
            1000
        };

        loop {
            self.tmp.notify();

            if QUIT_FLAG.load(Ordering::SeqCst) {
                if let Some(hook) = self.cfg.hooks.worker_int {
                    hook(self);
                }
                return 0;
            }
            if ABRT_FLAG.load(Ordering::SeqCst) {
                if let Some(hook) = self.cfg.hooks.worker_abort {
                    hook(self);
                }
                return 1;
            }
            if TERM_FLAG.load(Ordering::SeqCst) {
                return 0;
            }
            if USR1_FLAG.swap(false, Ordering::SeqCst) {
                // log files are the subscriber's concern; the signal only
                // has to reach us without disturbing a request
                debug!("worker received USR1");
            }
            if self.reloader.as_ref().map_or(false, Reloader::changed) {
                return 0;
            }
            if self.max_requests > 0 && self.handled >= self.max_requests {
                info!("autorestarting worker after {} requests", self.handled);
                return 0;
            }
            if nix::unistd::getppid() != self.ppid {
                info!("parent changed, shutting down worker");
                return 0;
            }

            let mut fds: Vec<libc::pollfd> = self
                .listeners
                .iter()
                .map(|l| libc::pollfd {
                    fd: l.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();
            fds.push(libc::pollfd {
                fd: self.life_fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });

            let ready = match util::poll_fds(&mut fds, budget_ms) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("worker poll failed: {}", e);
                    return 1;
                }
            };
            if ready == 0 {
                continue;
            }

            let life = fds.last().expect("life fd is always polled");
            if life.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                info!("parent pipe closed, shutting down worker");
                return 0;
            }

            for (idx, pollfd) in fds[..self.listeners.len()].iter().enumerate() {
                if pollfd.revents & libc::POLLIN == 0 {
                    continue;
                }
                match self.listeners[idx].accept() {
                    Ok((stream, peer)) => {
                        let (server_name, server_port) =
                            self.listeners[idx].server_name_port();
                        self.handle_connection(stream, peer, server_name, server_port);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) if is_connection_error(&e) => {
                        debug!("accepted connection already errored: {}", e);
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("age", &self.age)
            .field("handled", &self.handled)
            .finish()
    }
}

fn init_signals() -> std::io::Result<()> {
    unsafe {
        // drop anything inherited from the arbiter first
        for sig in [
            libc::SIGHUP,
            libc::SIGTTIN,
            libc::SIGTTOU,
            libc::SIGUSR2,
            libc::SIGCHLD,
        ] {
            libc::signal(sig, libc::SIG_DFL);
        }
        libc::signal(libc::SIGWINCH, libc::SIG_IGN);

        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = worker_signal_handler as usize;
        // no SA_RESTART: a pending stop must interrupt the poll
        for sig in [
            libc::SIGTERM,
            libc::SIGINT,
            libc::SIGQUIT,
            libc::SIGUSR1,
            libc::SIGABRT,
        ] {
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// This function defines errors that are per-connection: getting one from
/// `accept()` means the next connection might be ready to go.
fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}

/// `max_requests` plus a stable per-process random jitter, so a fleet
/// restarted together does not recycle in lockstep.
fn jitter_max_requests(max_requests: usize, jitter: usize) -> usize {
    if max_requests == 0 || jitter == 0 {
        return max_requests;
    }
    let mut hasher = DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
        .hash(&mut hasher);
    max_requests + (hasher.finish() as usize) % (jitter + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(jitter_max_requests(0, 10), 0);
        assert_eq!(jitter_max_requests(100, 0), 100);
        for _ in 0..50 {
            let n = jitter_max_requests(100, 10);
            assert!((100..=110).contains(&n), "jittered value {}", n);
        }
    }
}
