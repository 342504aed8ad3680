//! Listener creation and inheritance.
//!
//! Listening sockets are created once by the arbiter and shared with every
//! worker through fork. For binary upgrades the fd numbers are serialized
//! into the `BANTAM_FD` environment variable with close-on-exec cleared, so
//! a re-executed arbiter can adopt them instead of binding again.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::util;

/// One parsed `bind` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BindSpec {
    Tcp(SocketAddr),
    Unix(PathBuf),
    Fd(RawFd),
}

/// Parse a bind spec: `host:port`, `unix:/path`, or `fd://N`.
pub(crate) fn parse_bind(spec: &str) -> Result<BindSpec> {
    if let Some(rest) = spec.strip_prefix("unix:") {
        let path = rest.strip_prefix("//").unwrap_or(rest);
        if path.is_empty() {
            return Err(Error::new_config(format!("empty unix socket path: {:?}", spec)));
        }
        return Ok(BindSpec::Unix(PathBuf::from(path)));
    }
    if let Some(rest) = spec.strip_prefix("fd://") {
        let fd = rest
            .parse::<RawFd>()
            .map_err(|_| Error::new_config(format!("bad fd bind: {:?}", spec)))?;
        return Ok(BindSpec::Fd(fd));
    }
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(BindSpec::Tcp(addr));
    }
    // a host name needs resolving
    match spec.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .map(BindSpec::Tcp)
            .ok_or_else(|| Error::new_config(format!("unresolvable bind: {:?}", spec))),
        Err(e) => Err(Error::new_config(format!("bad bind {:?}: {}", spec, e))),
    }
}

/// A bound listening socket.
pub(crate) enum Listener {
    Tcp {
        listener: TcpListener,
        addr: SocketAddr,
    },
    Unix {
        listener: UnixListener,
        path: PathBuf,
        /// Inode of the bound path, for safe unlink on shutdown.
        ino: u64,
    },
}

impl Listener {
    /// Bind a fresh listener for one parsed `bind` entry.
    pub(crate) fn create(spec: &BindSpec, cfg: &Config) -> Result<Listener> {
        match spec {
            BindSpec::Tcp(addr) => Listener::bind_tcp(*addr, cfg),
            BindSpec::Unix(path) => Listener::bind_unix(path, cfg),
            BindSpec::Fd(fd) => Listener::from_fd(*fd),
        }
    }

    fn bind_tcp(addr: SocketAddr, cfg: &Config) -> Result<Listener> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(Error::new_listen)?;
        socket.set_reuse_address(true).map_err(Error::new_listen)?;
        if cfg.reuse_port {
            socket.set_reuse_port(true).map_err(Error::new_listen)?;
        }
        socket.bind(&addr.into()).map_err(Error::new_listen)?;
        socket.listen(cfg.backlog).map_err(Error::new_listen)?;
        // the fd must survive exec for binary upgrades
        util::set_cloexec(socket.as_raw_fd(), false).map_err(Error::new_listen)?;

        let listener: TcpListener = socket.into();
        let addr = listener.local_addr().map_err(Error::new_listen)?;
        info!("listening at: http://{}", addr);
        Ok(Listener::Tcp { listener, addr })
    }

    /// Bind a UNIX socket atomically: create at `<path>.tmp`, fix the mode,
    /// listen, then rename over the final path.
    fn bind_unix(path: &Path, cfg: &Config) -> Result<Listener> {
        if path.exists() {
            let stale = std::fs::metadata(path)
                .map(|m| (m.mode() & libc::S_IFMT) == libc::S_IFSOCK)
                .unwrap_or(false);
            if !stale {
                return Err(Error::new_listen(format!(
                    "{} exists and is not a socket",
                    path.display()
                )));
            }
            debug!("removing stale unix socket: {}", path.display());
            std::fs::remove_file(path).map_err(Error::new_listen)?;
        }

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        let _ = std::fs::remove_file(&tmp);
        let listener = UnixListener::bind(&tmp).map_err(Error::new_listen)?;
        let mode = 0o777 & !cfg.umask;
        let perms = {
            use std::os::unix::fs::PermissionsExt;
            std::fs::Permissions::from_mode(mode)
        };
        std::fs::set_permissions(&tmp, perms).map_err(Error::new_listen)?;
        std::fs::rename(&tmp, path).map_err(Error::new_listen)?;
        util::set_cloexec(listener.as_raw_fd(), false).map_err(Error::new_listen)?;

        let ino = std::fs::metadata(path).map_err(Error::new_listen)?.ino();
        info!("listening at: unix:{}", path.display());
        Ok(Listener::Unix {
            listener,
            path: path.to_owned(),
            ino,
        })
    }

    /// Adopt an inherited fd, after checking it still refers to a socket.
    pub(crate) fn from_fd(fd: RawFd) -> Result<Listener> {
        if !util::is_socket(fd) {
            return Err(Error::new_listen(format!("fd {} is not a socket", fd)));
        }
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let addr = socket.local_addr().map_err(Error::new_listen)?;
        util::set_cloexec(fd, false).map_err(Error::new_listen)?;

        if let Some(tcp_addr) = addr.as_socket() {
            let listener = unsafe { TcpListener::from_raw_fd(socket.into_raw_fd()) };
            info!("inherited socket: http://{} (fd {})", tcp_addr, fd);
            Ok(Listener::Tcp {
                listener,
                addr: tcp_addr,
            })
        } else if addr.domain() == Domain::UNIX {
            let path = addr
                .as_pathname()
                .map(Path::to_owned)
                .unwrap_or_default();
            let ino = std::fs::metadata(&path).map(|m| m.ino()).unwrap_or(0);
            let listener = unsafe { UnixListener::from_raw_fd(socket.into_raw_fd()) };
            info!("inherited socket: unix:{} (fd {})", path.display(), fd);
            Ok(Listener::Unix {
                listener,
                path,
                ino,
            })
        } else {
            Err(Error::new_listen(format!(
                "fd {} has an unsupported address family",
                fd
            )))
        }
    }

    pub(crate) fn accept(&self) -> io::Result<(Stream, Peer)> {
        match self {
            Listener::Tcp { listener, .. } => {
                let (stream, peer) = listener.accept()?;
                let _ = stream.set_nodelay(true);
                util::set_non_blocking(stream.as_raw_fd(), false)?;
                Ok((Stream::Tcp(stream), Peer::Tcp(peer)))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept()?;
                util::set_non_blocking(stream.as_raw_fd(), false)?;
                Ok((Stream::Unix(stream), Peer::Unix))
            }
        }
    }

    pub(crate) fn set_non_blocking(&self, on: bool) -> io::Result<()> {
        util::set_non_blocking(self.as_raw_fd(), on)
    }

    /// `(SERVER_NAME, SERVER_PORT)` for requests accepted here.
    pub(crate) fn server_name_port(&self) -> (String, String) {
        match self {
            Listener::Tcp { addr, .. } => (addr.ip().to_string(), addr.port().to_string()),
            Listener::Unix { path, .. } => (format!("unix:{}", path.display()), String::new()),
        }
    }

    /// Remove a UNIX socket path, but only while the inode is still ours.
    pub(crate) fn cleanup(&self) {
        if let Listener::Unix { path, ino, .. } = self {
            match std::fs::metadata(path) {
                Ok(meta) if meta.ino() == *ino => {
                    debug!("unlinking {}", path.display());
                    let _ = std::fs::remove_file(path);
                }
                _ => {}
            }
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp { listener, .. } => listener.as_raw_fd(),
            Listener::Unix { listener, .. } => listener.as_raw_fd(),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Tcp { addr, .. } => write!(f, "Listener({})", addr),
            Listener::Unix { path, .. } => write!(f, "Listener(unix:{})", path.display()),
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Tcp { addr, .. } => write!(f, "http://{}", addr),
            Listener::Unix { path, .. } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// An accepted connection.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            Stream::Unix(s) => s.set_read_timeout(timeout),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// The remote end of an accepted connection.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Peer {
    Tcp(SocketAddr),
    Unix,
}

impl Peer {
    /// `None` for UNIX-socket peers.
    pub(crate) fn ip(&self) -> Option<IpAddr> {
        match self {
            Peer::Tcp(addr) => Some(addr.ip()),
            Peer::Unix => None,
        }
    }

    /// `(REMOTE_ADDR, REMOTE_PORT)`.
    pub(crate) fn addr_strings(&self) -> (String, String) {
        match self {
            Peer::Tcp(addr) => (addr.ip().to_string(), addr.port().to_string()),
            Peer::Unix => (String::new(), String::new()),
        }
    }
}

/// Listener fds handed down by a predecessor, if any. The variable is
/// consumed so workers never see it.
pub(crate) fn inherited_fds() -> Option<Vec<RawFd>> {
    let raw = std::env::var(util::ENV_FDS).ok()?;
    std::env::remove_var(util::ENV_FDS);
    let fds: Vec<RawFd> = raw
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    if fds.is_empty() {
        None
    } else {
        Some(fds)
    }
}

/// Create (or adopt) every configured listener.
pub(crate) fn create_listeners(cfg: &Config) -> Result<Vec<Listener>> {
    if let Some(fds) = inherited_fds() {
        let mut listeners = Vec::with_capacity(fds.len());
        for fd in fds {
            match Listener::from_fd(fd) {
                Ok(listener) => listeners.push(listener),
                // a partially-closed inherited set is not fatal; anything
                // missing is re-bound below
                Err(e) => warn!("skipping inherited fd {}: {}", fd, e),
            }
        }
        if !listeners.is_empty() {
            return Ok(listeners);
        }
    }

    let mut listeners = Vec::with_capacity(cfg.bind.len());
    for spec in &cfg.bind {
        let spec = parse_bind(spec)?;
        listeners.push(Listener::create(&spec, cfg)?);
    }
    Ok(listeners)
}

/// Serialize listener fds for a re-exec'd successor.
pub(crate) fn export_fds(listeners: &[Listener]) -> String {
    listeners
        .iter()
        .map(|l| {
            let fd = l.as_raw_fd();
            let _ = util::set_cloexec(fd, false);
            fd.to_string()
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind_specs() {
        assert_eq!(
            parse_bind("127.0.0.1:8000").unwrap(),
            BindSpec::Tcp("127.0.0.1:8000".parse().unwrap())
        );
        assert_eq!(
            parse_bind("[::1]:8000").unwrap(),
            BindSpec::Tcp("[::1]:8000".parse().unwrap())
        );
        assert_eq!(
            parse_bind("unix:/tmp/sock").unwrap(),
            BindSpec::Unix(PathBuf::from("/tmp/sock"))
        );
        assert_eq!(
            parse_bind("unix:///tmp/sock").unwrap(),
            BindSpec::Unix(PathBuf::from("/tmp/sock"))
        );
        assert_eq!(parse_bind("fd://3").unwrap(), BindSpec::Fd(3));
        parse_bind("not an address").unwrap_err();
        parse_bind("fd://x").unwrap_err();
        parse_bind("unix:").unwrap_err();
    }

    #[test]
    fn test_bind_and_adopt_tcp() {
        let cfg = Config::default();
        let spec = BindSpec::Tcp("127.0.0.1:0".parse().unwrap());
        let listener = Listener::create(&spec, &cfg).unwrap();
        let fd = listener.as_raw_fd();

        // the bound fd must be inheritable across exec
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        // adopting the same fd yields the same address
        let adopted = Listener::from_fd(fd).unwrap();
        match (&listener, &adopted) {
            (Listener::Tcp { addr: a, .. }, Listener::Tcp { addr: b, .. }) => assert_eq!(a, b),
            other => panic!("unexpected listeners: {:?}", other),
        }
        // both values wrap the same fd; forget one side
        std::mem::forget(adopted);
    }

    #[test]
    fn test_bind_unix_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bantam.sock");
        let cfg = Config::default();
        let listener = Listener::create(&BindSpec::Unix(path.clone()), &cfg).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("bantam.sock.tmp").exists());

        // rebinding over a stale socket works
        drop(listener);
        let listener = Listener::create(&BindSpec::Unix(path.clone()), &cfg).unwrap();
        listener.cleanup();
        assert!(!path.exists());
    }

    #[test]
    fn test_from_fd_rejects_non_socket() {
        let file = tempfile::tempfile().unwrap();
        let err = Listener::from_fd(file.as_raw_fd()).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_export_fds_format() {
        let cfg = Config::default();
        let l1 = Listener::create(&BindSpec::Tcp("127.0.0.1:0".parse().unwrap()), &cfg).unwrap();
        let l2 = Listener::create(&BindSpec::Tcp("127.0.0.1:0".parse().unwrap()), &cfg).unwrap();
        let exported = export_fds(&[l1, l2]);
        let fds: Vec<RawFd> = exported.split(',').map(|s| s.parse().unwrap()).collect();
        assert_eq!(fds.len(), 2);
        assert_ne!(fds[0], fds[1]);
    }
}
