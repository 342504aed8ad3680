//! Small unix plumbing helpers shared by the arbiter and workers.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

use nix::unistd::{fork, setsid, ForkResult, Gid, Uid};

use crate::error::{Error, Result};

pub(crate) const SERVER_SOFTWARE: &str = concat!("bantam/", env!("CARGO_PKG_VERSION"));

/// Environment variable carrying inherited listener fds across re-exec.
pub(crate) const ENV_FDS: &str = "BANTAM_FD";
/// Environment variable naming the ancestor arbiter during an upgrade.
pub(crate) const ENV_PID: &str = "BANTAM_PID";

/// Detach from the controlling terminal: double fork, new session, stdio
/// pointed at /dev/null.
pub(crate) fn daemonize() -> Result<()> {
    fork_and_exit_parent()?;
    setsid().map_err(Error::new_os)?;
    fork_and_exit_parent()?;

    let devnull = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const _, libc::O_RDWR) };
    if devnull < 0 {
        return Err(Error::new_os(io::Error::last_os_error()));
    }
    for fd in 0..=2 {
        if unsafe { libc::dup2(devnull, fd) } < 0 {
            return Err(Error::new_os(io::Error::last_os_error()));
        }
    }
    if devnull > 2 {
        unsafe { libc::close(devnull) };
    }
    Ok(())
}

fn fork_and_exit_parent() -> Result<()> {
    match unsafe { fork() }.map_err(Error::new_os)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => Ok(()),
    }
}

/// Switch the process to the configured user/group. Requires privileges;
/// workers call this during boot, before touching any request.
pub(crate) fn set_owner_process(user: Option<&str>, group: Option<&str>) -> Result<()> {
    let gid = match group {
        Some(name) => {
            let group = nix::unistd::Group::from_name(name)
                .map_err(Error::new_os)?
                .ok_or_else(|| Error::new_config(format!("unknown group: {:?}", name)))?;
            Some(group.gid)
        }
        None => None,
    };
    let resolved_user = match user {
        Some(name) => Some(
            nix::unistd::User::from_name(name)
                .map_err(Error::new_os)?
                .ok_or_else(|| Error::new_config(format!("unknown user: {:?}", name)))?,
        ),
        None => None,
    };

    if let Some(gid) = gid {
        nix::unistd::setgid(gid).map_err(Error::new_os)?;
    }
    if let Some(user) = resolved_user {
        let name = CString::new(user.name.as_str())
            .map_err(|_| Error::new_config("user name contains NUL"))?;
        let gid = gid.unwrap_or(user.gid);
        nix::unistd::initgroups(&name, gid).map_err(Error::new_os)?;
        nix::unistd::setuid(user.uid).map_err(Error::new_os)?;
    }
    Ok(())
}

/// Whether dropping privileges would even be possible.
pub(crate) fn can_switch_user() -> bool {
    Uid::effective().is_root() || Gid::effective().as_raw() == 0
}

pub(crate) fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if libc::fcntl(fd, libc::F_SETFD, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn set_non_blocking(fd: RawFd, on: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// `poll(2)` over a raw fd set. EINTR surfaces as `ErrorKind::Interrupted`
/// so callers can re-check their signal flags.
pub(crate) fn poll_fds(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    let rv = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rv as usize)
}

/// Touch an fd's timestamps to "now" without writing any data.
pub(crate) fn touch_fd(fd: RawFd) -> io::Result<()> {
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
    ];
    if unsafe { libc::futimens(fd, times.as_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Whether `fd` refers to a live socket.
pub(crate) fn is_socket(fd: RawFd) -> bool {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
        return false;
    }
    let mode = unsafe { stat.assume_init() }.st_mode;
    (mode & libc::S_IFMT) == libc::S_IFSOCK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_touch_fd_advances_mtime() {
        let file = tempfile::tempfile().unwrap();
        let before = file.metadata().unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        touch_fd(file.as_raw_fd()).unwrap();
        let after = file.metadata().unwrap().modified().unwrap();
        assert!(after >= before);
    }

    #[test]
    fn test_is_socket() {
        let file = tempfile::tempfile().unwrap();
        assert!(!is_socket(file.as_raw_fd()));
        let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(is_socket(sock.as_raw_fd()));
    }

    #[test]
    fn test_cloexec_toggle() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        set_cloexec(fd, true).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
        set_cloexec(fd, false).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
    }
}
