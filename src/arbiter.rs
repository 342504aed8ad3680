//! The arbiter: the master process.
//!
//! The arbiter never touches HTTP. It binds (or inherits) the listening
//! sockets, forks the worker fleet, and then loops: reap exited children,
//! dispatch one pending signal, kill workers whose heartbeat went stale,
//! top the fleet back up, park for at most a second. Signal handlers do
//! the absolute minimum — set a bit, write one byte into the self-pipe —
//! and the loop interprets everything.

use std::collections::{HashMap, VecDeque};
use std::ffi::{CString, OsString};
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::app::{AppFactory, Application};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pidfile::PidFile;
use crate::sock::{self, Listener};
use crate::util;
use crate::worker::tmp::WorkerTmp;
use crate::worker::{Worker, WORKER_BOOT_ERROR};

/// Consecutive boot failures before the arbiter gives up.
const BOOT_FAILURE_LIMIT: u32 = 5;

/// Write end of the arbiter's self-pipe, for the signal handler.
static SELF_PIPE_W: AtomicI32 = AtomicI32::new(-1);
/// Pending signals as a bitmask by signal number.
static PENDING_SIGNALS: AtomicU64 = AtomicU64::new(0);

const HANDLED_SIGNALS: [libc::c_int; 10] = [
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGTTIN,
    libc::SIGTTOU,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGWINCH,
    libc::SIGCHLD,
];

/// Async-signal-safe only: one atomic or, one pipe write.
extern "C" fn arbiter_signal_handler(signum: libc::c_int) {
    if (0..64).contains(&signum) {
        PENDING_SIGNALS.fetch_or(1u64 << signum, Ordering::SeqCst);
    }
    let fd = SELF_PIPE_W.load(Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::write(fd, b".".as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Where a supervised worker is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Spawning,
    Running,
    GracefulStopping,
    Terminating,
    Reaped,
}

/// The arbiter's book-keeping for one worker.
pub struct WorkerInfo {
    id: u32,
    pid: Option<Pid>,
    age: u64,
    state: WorkerState,
    aborted: bool,
    spawned_at: Instant,
    tmp: WorkerTmp,
    /// Read end of the worker→arbiter pipe (ABRT notifications).
    notify_rx: OwnedFd,
    /// Write end of the arbiter→worker liveness pipe; closing it (by the
    /// arbiter dying) tells the worker to self-terminate.
    life_tx: OwnedFd,
}

impl WorkerInfo {
    /// The dense worker id (1..=workers).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// OS pid; `None` until the fork completed.
    pub fn pid(&self) -> Option<i32> {
        self.pid.map(Pid::as_raw)
    }

    /// The generation serial; never reused.
    pub fn age(&self) -> u64 {
        self.age
    }
}

impl fmt::Debug for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerInfo")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("age", &self.age)
            .field("state", &self.state)
            .finish()
    }
}

/// The master process supervising the worker fleet.
pub struct Arbiter {
    cfg: Arc<Config>,
    factory: Arc<dyn AppFactory>,
    app: Option<Arc<dyn Application>>,
    listeners: Vec<Listener>,
    workers: HashMap<Pid, WorkerInfo>,
    sig_queue: VecDeque<libc::c_int>,
    worker_age: u64,
    num_workers: usize,
    pidfile: Option<PidFile>,
    pipe_r: Option<OwnedFd>,
    pipe_w: Option<OwnedFd>,
    master_pid: Pid,
    reexec_pid: Option<Pid>,
    boot_failures: u32,
    start_args: Vec<OsString>,
    start_cwd: PathBuf,
    config_loader: Option<Arc<dyn Fn() -> Result<Config> + Send + Sync>>,
}

impl Arbiter {
    /// Validate the configuration and prepare an arbiter; nothing is bound
    /// or forked until [`Arbiter::run`].
    pub fn new(cfg: Config, factory: Arc<dyn AppFactory>) -> Result<Arbiter> {
        cfg.validate()?;
        let num_workers = cfg.workers;
        Ok(Arbiter {
            cfg: Arc::new(cfg),
            factory,
            app: None,
            listeners: Vec::new(),
            workers: HashMap::new(),
            sig_queue: VecDeque::new(),
            worker_age: 0,
            num_workers,
            pidfile: None,
            pipe_r: None,
            pipe_w: None,
            master_pid: nix::unistd::getpid(),
            reexec_pid: None,
            boot_failures: 0,
            start_args: std::env::args_os().collect(),
            start_cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_loader: None,
        })
    }

    /// Install a callback that rebuilds the configuration on `HUP`, so a
    /// reload re-reads whatever sources originally produced it.
    pub fn with_config_loader<F>(mut self, loader: F) -> Arbiter
    where
        F: Fn() -> Result<Config> + Send + Sync + 'static,
    {
        self.config_loader = Some(Arc::new(loader));
        self
    }

    /// The current configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The current number of live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run until shutdown; returns the process exit code.
    pub fn run(mut self) -> Result<i32> {
        if let Some(dir) = &self.cfg.chdir {
            std::env::set_current_dir(dir)
                .map_err(|e| Error::new_config(format!("cannot chdir: {}", e)))?;
            self.start_cwd = dir.clone();
        }
        for (key, value) in &self.cfg.raw_env {
            std::env::set_var(key, value);
        }
        unsafe {
            libc::umask(self.cfg.umask as libc::mode_t);
        }
        if self.cfg.daemon {
            util::daemonize()?;
            self.master_pid = nix::unistd::getpid();
        }

        self.listeners = sock::create_listeners(&self.cfg)?;
        if let Some(hook) = self.cfg.hooks.on_starting {
            hook(&self);
        }
        if let Some(path) = self.cfg.pidfile.clone() {
            self.pidfile = Some(PidFile::create(&path)?);
        }
        self.init_self_pipe()?;
        init_signals().map_err(Error::new_os)?;

        if self.cfg.preload_app {
            self.app = Some(self.factory.load()?);
        }

        info!(
            "starting bantam {} (pid: {})",
            env!("CARGO_PKG_VERSION"),
            self.master_pid
        );
        self.manage_workers()?;
        if let Some(hook) = self.cfg.hooks.when_ready {
            hook(&self);
        }

        let code = loop {
            self.reap_workers()?;
            match self.pop_signal() {
                Some(sig) => {
                    if let Some(code) = self.handle_signal(sig)? {
                        break code;
                    }
                }
                None => {
                    self.murder_workers();
                    self.manage_workers()?;
                    self.park();
                }
            }
        };

        self.halt();
        Ok(code)
    }

    fn init_self_pipe(&mut self) -> Result<()> {
        use nix::fcntl::OFlag;
        let (r, w) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(Error::new_os)?;
        SELF_PIPE_W.store(w.as_raw_fd(), Ordering::SeqCst);
        self.pipe_r = Some(r);
        self.pipe_w = Some(w);
        Ok(())
    }

    /// Move freshly delivered signals into the local queue, deduplicated,
    /// and pop one. Duplicate deliveries inside one iteration collapse.
    fn pop_signal(&mut self) -> Option<libc::c_int> {
        let mask = PENDING_SIGNALS.swap(0, Ordering::SeqCst);
        if mask != 0 {
            for sig in HANDLED_SIGNALS {
                if sig == libc::SIGCHLD {
                    // reaping happens every iteration anyway
                    continue;
                }
                if mask & (1u64 << sig) != 0 && !self.sig_queue.contains(&sig) {
                    self.sig_queue.push_back(sig);
                }
            }
        }
        self.sig_queue.pop_front()
    }

    /// Dispatch one signal. `Some(code)` ends the main loop.
    fn handle_signal(&mut self, sig: libc::c_int) -> Result<Option<i32>> {
        match sig {
            libc::SIGHUP => {
                self.reload()?;
                Ok(None)
            }
            libc::SIGTERM | libc::SIGINT => {
                info!("shutting down: TERM/INT");
                self.stop(false)?;
                Ok(Some(0))
            }
            libc::SIGQUIT => {
                info!("shutting down gracefully: QUIT");
                self.stop(true)?;
                Ok(Some(0))
            }
            libc::SIGTTIN => {
                self.update_num_workers(self.num_workers + 1);
                self.manage_workers()?;
                Ok(None)
            }
            libc::SIGTTOU => {
                if self.num_workers <= 1 {
                    warn!("cannot scale below one worker");
                } else {
                    self.update_num_workers(self.num_workers - 1);
                    self.manage_workers()?;
                }
                Ok(None)
            }
            libc::SIGUSR1 => {
                info!("reopening log files and signaling workers: USR1");
                self.kill_all_workers(Signal::SIGUSR1);
                Ok(None)
            }
            libc::SIGUSR2 => {
                self.reexec()?;
                Ok(None)
            }
            libc::SIGWINCH => {
                if self.cfg.daemon {
                    info!("gracefully stopping workers: WINCH");
                    self.update_num_workers(0);
                    self.kill_all_workers(Signal::SIGTERM);
                } else {
                    debug!("ignoring WINCH when not daemonized");
                }
                Ok(None)
            }
            other => {
                debug!("ignoring unexpected signal: {}", other);
                Ok(None)
            }
        }
    }

    fn update_num_workers(&mut self, new: usize) {
        let old = self.num_workers;
        if new == old {
            return;
        }
        self.num_workers = new;
        info!("worker count changed: {} -> {}", old, new);
        if let Some(hook) = self.cfg.hooks.nworkers_changed {
            hook(self, new, old);
        }
    }

    /// Park until a signal, a child exit, or the 1-second tick.
    fn park(&mut self) {
        let Some(pipe_r) = &self.pipe_r else { return };
        let mut fds = [libc::pollfd {
            fd: pipe_r.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        match util::poll_fds(&mut fds, 1000) {
            Ok(0) => {}
            Ok(_) => {
                // drain every wakeup byte; the pipe is non-blocking
                let mut buf = [0u8; 64];
                loop {
                    let n = unsafe {
                        libc::read(
                            fds[0].fd,
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    };
                    if n <= 0 {
                        break;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => warn!("arbiter poll failed: {}", e),
        }
    }

    /// `waitpid(-1, WNOHANG)` until the kernel has nothing more for us.
    fn reap_workers(&mut self) -> Result<()> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => self.handle_child_exit(pid, Some(code))?,
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    debug!("worker {} killed by {:?}", pid, signal);
                    self.handle_child_exit(pid, None)?;
                }
                Ok(_) => break,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::new_os(e)),
            }
        }
        Ok(())
    }

    fn handle_child_exit(&mut self, pid: Pid, code: Option<i32>) -> Result<()> {
        if self.reexec_pid == Some(pid) {
            warn!("re-executed master {} exited", pid);
            self.reexec_pid = None;
            // take the canonical pidfile name back
            if let (Some(pidfile), Some(path)) = (&mut self.pidfile, self.cfg.pidfile.clone()) {
                let _ = pidfile.rename(&path);
            }
            return Ok(());
        }

        let Some(mut worker) = self.workers.remove(&pid) else {
            debug!("reaped unknown child: {}", pid);
            return Ok(());
        };
        worker.state = WorkerState::Reaped;
        if worker.aborted {
            info!("worker reaped after timeout kill (pid: {})", pid);
        } else {
            info!("worker exited (pid: {}, code: {:?})", pid, code);
        }

        // a worker dying with the boot-error status right after fork means
        // the application cannot start; forking forever would not fix it
        if code == Some(WORKER_BOOT_ERROR) && worker.spawned_at.elapsed() < Duration::from_secs(30)
        {
            self.boot_failures += 1;
            if self.boot_failures >= BOOT_FAILURE_LIMIT {
                return Err(Error::new_worker_class("worker failed to boot"));
            }
        } else {
            self.boot_failures = 0;
        }

        if let Some(hook) = self.cfg.hooks.child_exit {
            hook(self, &worker);
        }
        Ok(())
    }

    /// Kill workers whose heartbeat file went stale: first ABRT so the
    /// worker can run its abort hook, then KILL one scan later.
    fn murder_workers(&mut self) {
        if self.cfg.timeout == 0 {
            return;
        }
        let limit = Duration::from_secs(self.cfg.timeout);
        let now = SystemTime::now();
        for (pid, worker) in self.workers.iter_mut() {
            // a byte on the notify pipe is the worker reporting its own
            // abort; it is already on the way out
            let mut scratch = [0u8; 16];
            let n = unsafe {
                libc::read(
                    worker.notify_rx.as_raw_fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                )
            };
            if n > 0 {
                debug!("worker {} reported an abort", pid);
                worker.state = WorkerState::Terminating;
            }

            let last = worker.tmp.last_update().unwrap_or(now);
            let stale = now
                .duration_since(last)
                .map(|age| age > limit)
                .unwrap_or(false);
            if !stale {
                continue;
            }
            if !worker.aborted {
                error!("WORKER TIMEOUT (pid:{})", pid);
                worker.aborted = true;
                worker.state = WorkerState::Terminating;
                let _ = kill(*pid, Signal::SIGABRT);
            } else {
                let _ = kill(*pid, Signal::SIGKILL);
            }
        }
    }

    /// Bring the live worker count to the target, spawning low ids first
    /// and gracefully retiring the oldest extras.
    fn manage_workers(&mut self) -> Result<()> {
        while self.workers.len() < self.num_workers {
            self.spawn_worker()?;
        }

        if self.workers.len() > self.num_workers {
            let excess = self.workers.len() - self.num_workers;
            let mut candidates: Vec<(u64, Pid)> = self
                .workers
                .iter()
                .filter(|(_, w)| w.state == WorkerState::Running)
                .map(|(pid, w)| (w.age, *pid))
                .collect();
            candidates.sort_unstable();
            for (_, pid) in candidates.into_iter().take(excess) {
                self.stop_worker_gracefully(pid);
            }
        }
        Ok(())
    }

    fn stop_worker_gracefully(&mut self, pid: Pid) {
        if let Some(worker) = self.workers.get_mut(&pid) {
            debug!("gracefully stopping worker (pid: {})", pid);
            worker.state = WorkerState::GracefulStopping;
            let _ = kill(pid, Signal::SIGTERM);
        }
    }

    fn lowest_free_worker_id(&self) -> u32 {
        let mut id = 1;
        let used: Vec<u32> = self.workers.values().map(|w| w.id).collect();
        while used.contains(&id) {
            id += 1;
        }
        id
    }

    fn spawn_worker(&mut self) -> Result<()> {
        use nix::fcntl::OFlag;

        self.worker_age += 1;
        let id = self.lowest_free_worker_id();
        let age = self.worker_age;
        let tmp = WorkerTmp::new(self.cfg.worker_tmp_dir.as_deref())?;
        let (life_r, life_w) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(Error::new_os)?;
        // non-blocking both ways: the murder scan drains without waiting
        // and the worker's abort handler must never block on a full pipe
        let (notify_r, notify_w) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(Error::new_os)?;

        let info = WorkerInfo {
            id,
            pid: None,
            age,
            state: WorkerState::Spawning,
            aborted: false,
            spawned_at: Instant::now(),
            tmp,
            notify_rx: notify_r,
            life_tx: life_w,
        };
        if let Some(hook) = self.cfg.hooks.pre_fork {
            hook(self, &info);
        }

        match unsafe { fork() }.map_err(Error::new_os)? {
            ForkResult::Parent { child } => {
                let mut info = info;
                info.pid = Some(child);
                info.state = WorkerState::Running;
                info!("booting worker with pid: {}", child);
                self.workers.insert(child, info);
                // life_r and notify_w belong to the child alone
                drop(life_r);
                drop(notify_w);
                Ok(())
            }
            ForkResult::Child => {
                // the child exits through process::exit, so raw closes are
                // safe: no Drop will run twice
                SELF_PIPE_W.store(-1, Ordering::SeqCst);
                unsafe {
                    if let Some(fd) = &self.pipe_r {
                        libc::close(fd.as_raw_fd());
                    }
                    if let Some(fd) = &self.pipe_w {
                        libc::close(fd.as_raw_fd());
                    }
                    // siblings' plumbing must not survive in this process:
                    // a held write end would mask a dead arbiter from them
                    for sibling in self.workers.values() {
                        libc::close(sibling.life_tx.as_raw_fd());
                        libc::close(sibling.notify_rx.as_raw_fd());
                        libc::close(sibling.tmp.as_raw_fd());
                    }
                }

                let WorkerInfo {
                    tmp,
                    notify_rx,
                    life_tx,
                    ..
                } = info;
                // this process's own copies of the arbiter-side ends
                drop(notify_rx);
                drop(life_tx);

                let worker = Worker::new(
                    id,
                    age,
                    Arc::clone(&self.cfg),
                    tmp,
                    std::mem::take(&mut self.listeners),
                    life_r,
                    notify_w,
                    self.app.clone(),
                );
                if let Some(hook) = self.cfg.hooks.post_fork {
                    hook(&worker);
                }
                let code = worker.init_process(&*self.factory);
                std::process::exit(code);
            }
        }
    }

    fn kill_all_workers(&self, sig: Signal) {
        for pid in self.workers.keys() {
            let _ = kill(*pid, sig);
        }
    }

    /// `HUP`: rebuild the configuration, boot a fresh cohort, gracefully
    /// retire every worker from before the reload.
    fn reload(&mut self) -> Result<()> {
        info!("hang up: reloading");
        if let Some(hook) = self.cfg.hooks.on_reload {
            hook(self);
        }

        let old_bind = self.cfg.bind.clone();
        if let Some(fresh) = self.refreshed_config() {
            self.cfg = Arc::new(fresh);
        }
        for (key, value) in &self.cfg.raw_env {
            std::env::set_var(key, value);
        }
        self.update_num_workers(self.cfg.workers);

        if self.cfg.bind != old_bind {
            info!("bind addresses changed, rebinding");
            for listener in &self.listeners {
                listener.cleanup();
            }
            self.listeners = sock::create_listeners(&self.cfg)?;
        }

        if !self.cfg.preload_app {
            // fresh workers reload the application on boot
            self.app = None;
        }

        // the post-reload generation starts here; anything older goes
        let cohort_min = self.worker_age + 1;
        for _ in 0..self.num_workers {
            self.spawn_worker()?;
        }
        let old_cohort: Vec<Pid> = self
            .workers
            .iter()
            .filter(|(_, w)| w.age < cohort_min)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in old_cohort {
            self.stop_worker_gracefully(pid);
        }
        Ok(())
    }

    fn refreshed_config(&self) -> Option<Config> {
        let rebuilt = if let Some(loader) = &self.config_loader {
            loader()
        } else if let Some(path) = &self.cfg.config_file {
            let mut cfg = (*self.cfg).clone();
            cfg.load_file(path.clone()).map(|_| cfg)
        } else {
            return None;
        };
        match rebuilt.and_then(|cfg| cfg.validate().map(|_| cfg)) {
            Ok(mut cfg) => {
                // hooks and the loaded-from path are not part of any file
                cfg.hooks = self.cfg.hooks;
                Some(cfg)
            }
            Err(e) => {
                error!("reload failed, keeping the old configuration: {}", e);
                None
            }
        }
    }

    /// `USR2`: launch a new arbiter from the (possibly replaced) binary,
    /// handing it the listening sockets. The old arbiter keeps serving
    /// until told otherwise, so the operator can roll either way.
    fn reexec(&mut self) -> Result<()> {
        if self.reexec_pid.is_some() {
            warn!("USR2 ignored: an upgrade is already in progress");
            return Ok(());
        }

        if let Some(pidfile) = &mut self.pidfile {
            let mut renamed = pidfile.path().as_os_str().to_owned();
            renamed.push(".2");
            pidfile.rename(&PathBuf::from(renamed))?;
        }

        std::env::set_var(util::ENV_FDS, sock::export_fds(&self.listeners));
        std::env::set_var(util::ENV_PID, self.master_pid.to_string());
        if let Some(hook) = self.cfg.hooks.pre_exec {
            hook(self);
        }

        match unsafe { fork() }.map_err(Error::new_os)? {
            ForkResult::Parent { child } => {
                self.reexec_pid = Some(child);
                info!("launching new master: {}", child);
                std::env::remove_var(util::ENV_FDS);
                std::env::remove_var(util::ENV_PID);
                Ok(())
            }
            ForkResult::Child => {
                let _ = nix::unistd::chdir(&self.start_cwd);
                let program = std::env::current_exe()
                    .ok()
                    .and_then(|p| CString::new(p.as_os_str().as_bytes()).ok());
                let args: Vec<CString> = self
                    .start_args
                    .iter()
                    .filter_map(|a| CString::new(a.as_bytes()).ok())
                    .collect();
                if let Some(program) = program {
                    let argv: Vec<&std::ffi::CStr> =
                        args.iter().map(CString::as_c_str).collect();
                    let _ = nix::unistd::execv(&program, &argv);
                }
                // exec failed; nothing sane left to do in this child
                error!("re-exec failed");
                std::process::exit(1);
            }
        }
    }

    /// Stop every worker, then escalate. `graceful` controls whether the
    /// workers may finish their current request (TERM) or must stop at
    /// once (QUIT); either way the arbiter waits at most
    /// `graceful_timeout` before sending KILL.
    fn stop(&mut self, graceful: bool) -> Result<()> {
        // an in-flight upgrade keeps the sockets alive in the new master
        if self.reexec_pid.is_none() {
            for listener in &self.listeners {
                listener.cleanup();
            }
        }
        self.listeners.clear();

        let sig = if graceful {
            Signal::SIGTERM
        } else {
            Signal::SIGQUIT
        };
        self.kill_all_workers(sig);
        for worker in self.workers.values_mut() {
            worker.state = if graceful {
                WorkerState::GracefulStopping
            } else {
                WorkerState::Terminating
            };
        }

        let deadline = Instant::now() + Duration::from_secs(self.cfg.graceful_timeout);
        while !self.workers.is_empty() && Instant::now() < deadline {
            self.reap_workers()?;
            if self.workers.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        if !self.workers.is_empty() {
            warn!(
                "{} worker(s) ignored the stop signal, sending KILL",
                self.workers.len()
            );
            self.kill_all_workers(Signal::SIGKILL);
            let deadline = Instant::now() + Duration::from_secs(2);
            while !self.workers.is_empty() && Instant::now() < deadline {
                self.reap_workers()?;
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        Ok(())
    }

    fn halt(&mut self) {
        if let Some(hook) = self.cfg.hooks.on_exit {
            hook(self);
        }
        if let Some(pidfile) = &self.pidfile {
            pidfile.unlink();
        }
        info!("shutting down: master");
    }
}

impl fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arbiter")
            .field("pid", &self.master_pid)
            .field("num_workers", &self.num_workers)
            .field("live_workers", &self.workers.len())
            .field("worker_age", &self.worker_age)
            .finish()
    }
}

fn init_signals() -> std::io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = arbiter_signal_handler as usize;
        for sig in HANDLED_SIGNALS {
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_signal_mask_collapses_duplicates() {
        PENDING_SIGNALS.store(0, Ordering::SeqCst);
        arbiter_signal_handler(libc::SIGHUP);
        arbiter_signal_handler(libc::SIGHUP);
        arbiter_signal_handler(libc::SIGTTIN);

        let factory = Arc::new(|| -> crate::Result<Arc<dyn Application>> {
            unreachable!("never loaded in this test")
        });
        let mut arbiter = Arbiter::new(Config::default(), factory).unwrap();

        assert_eq!(arbiter.pop_signal(), Some(libc::SIGHUP));
        assert_eq!(arbiter.pop_signal(), Some(libc::SIGTTIN));
        assert_eq!(arbiter.pop_signal(), None);
    }

    #[test]
    fn test_lowest_free_worker_id() {
        let factory = Arc::new(|| -> crate::Result<Arc<dyn Application>> {
            unreachable!("never loaded in this test")
        });
        let arbiter = Arbiter::new(Config::default(), factory).unwrap();
        assert_eq!(arbiter.lowest_free_worker_id(), 1);
    }

    #[test]
    fn test_update_num_workers_fires_hook_once() {
        static CALLS: AtomicU64 = AtomicU64::new(0);
        fn on_change(_: &Arbiter, _new: usize, _old: usize) {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let mut cfg = Config::default();
        cfg.workers = 2;
        cfg.hooks.nworkers_changed = Some(on_change);
        let factory = Arc::new(|| -> crate::Result<Arc<dyn Application>> {
            unreachable!("never loaded in this test")
        });
        let mut arbiter = Arbiter::new(cfg, factory).unwrap();

        arbiter.update_num_workers(3);
        arbiter.update_num_workers(3);
        arbiter.update_num_workers(2);
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }
}
