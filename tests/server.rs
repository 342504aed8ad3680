//! End-to-end tests: a real arbiter with real workers, driven over TCP.
//!
//! Each test binds its own listener, hands the fd to a forked arbiter via
//! `BANTAM_FD`, and talks plain HTTP/1.x over a client socket. The fork
//! window is serialized so parallel tests cannot see each other's fd
//! variable.

#![cfg(unix)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bantam::{BoxError, Config, Environ, Response};

static FORK_LOCK: Mutex<()> = Mutex::new(());

fn demo_app(environ: &mut Environ) -> Result<Response, BoxError> {
    match (environ.method(), environ.path()) {
        (_, "/") => Ok(Response::text(200, "Hello\n")),
        ("POST", "/echo") => {
            let mut body = Vec::new();
            environ.body().read_to_end(&mut body)?;
            Ok(Response::new(200)
                .with_header("Content-Type", "application/octet-stream")
                .with_body(body))
        }
        _ => Ok(Response::text(404, "Not Found\n")),
    }
}

struct Server {
    pid: nix::unistd::Pid,
    addr: SocketAddr,
}

impl Server {
    fn spawn(mut config: Config) -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let addr = listener.local_addr().unwrap();
        config.bind = vec![format!("fd://{}", listener.as_raw_fd())];

        let guard = FORK_LOCK.lock().unwrap();
        std::env::set_var("BANTAM_FD", listener.as_raw_fd().to_string());
        let fork = unsafe { nix::unistd::fork() }.expect("fork test server");
        std::env::remove_var("BANTAM_FD");
        drop(guard);

        match fork {
            nix::unistd::ForkResult::Child => {
                let code = bantam::run(demo_app, config);
                std::process::exit(code);
            }
            nix::unistd::ForkResult::Parent { child } => {
                drop(listener);
                let server = Server { pid: child, addr };
                server.wait_ready();
                server
            }
        }
    }

    fn wait_ready(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Ok(mut stream) = TcpStream::connect(self.addr) {
                let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
                if stream
                    .write_all(b"GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
                    .is_ok()
                {
                    let mut buf = Vec::new();
                    if stream.read_to_end(&mut buf).is_ok() && !buf.is_empty() {
                        return;
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("server never became ready");
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = nix::sys::signal::kill(self.pid, nix::sys::signal::Signal::SIGTERM);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match nix::sys::wait::waitpid(self.pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
                Ok(nix::sys::wait::WaitStatus::StillAlive) => {
                    if Instant::now() > deadline {
                        let _ =
                            nix::sys::signal::kill(self.pid, nix::sys::signal::Signal::SIGKILL);
                        let _ = nix::sys::wait::waitpid(self.pid, None);
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                _ => break,
            }
        }
    }
}

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Send raw bytes, then read exactly one response off the stream.
fn roundtrip(stream: &mut TcpStream, request: &[u8]) -> Reply {
    stream.write_all(request).expect("write request");
    read_reply(stream)
}

fn read_reply(stream: &mut TcpStream) -> Reply {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).expect("read response head");
        assert!(n > 0, "connection closed before a full response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end]).expect("response head is ascii");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");
    let headers: Vec<(String, String)> = lines
        .map(|line| {
            let (name, value) = line.split_once(':').expect("header line");
            (name.trim().to_owned(), value.trim().to_owned())
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse().expect("numeric content-length"))
        .unwrap_or(0);

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).expect("read response body");
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(body.len(), content_length, "no stray bytes after the body");

    Reply {
        status,
        headers,
        body,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn base_config() -> Config {
    let mut cfg = Config::default();
    cfg.workers = 2;
    cfg.timeout = 20;
    cfg.graceful_timeout = 5;
    cfg.keepalive = 5;
    cfg
}

#[test]
fn hello_roundtrip_with_keep_alive() {
    let server = Server::spawn(base_config());
    let mut stream = server.connect();

    let reply = roundtrip(&mut stream, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"Hello\n");
    assert_eq!(reply.header("content-length"), Some("6"));
    assert_eq!(reply.header("connection"), Some("keep-alive"));
    assert!(reply.header("server").unwrap().starts_with("bantam/"));
    assert!(reply.header("date").unwrap().ends_with("GMT"));

    // the same connection serves another request
    let reply = roundtrip(&mut stream, b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 404);
}

#[test]
fn chunked_upload_is_decoded() {
    let server = Server::spawn(base_config());
    let mut stream = server.connect();

    let reply = roundtrip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"hello");
}

#[test]
fn smuggling_attempt_is_rejected_and_connection_closed() {
    let server = Server::spawn(base_config());
    let mut stream = server.connect();

    // both framings at once, with a pipelined follow-up that must never
    // be parsed as a second request
    let reply = roundtrip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\nGET /missing HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("connection"), Some("close"));

    // the worker closed instead of answering the smuggled request
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("read until close");
    assert!(rest.is_empty());
}

#[test]
fn http10_connection_closes_by_default() {
    let server = Server::spawn(base_config());
    let mut stream = server.connect();

    let reply = roundtrip(&mut stream, b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("connection"), Some("close"));

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("read until close");
    assert!(rest.is_empty());
}

#[test]
fn oversized_request_line_gets_414() {
    let server = Server::spawn(base_config());
    let mut stream = server.connect();

    let mut request = b"GET /".to_vec();
    request.extend(std::iter::repeat(b'a').take(8000));
    request.extend_from_slice(b" HTTP/1.1\r\nHost: x\r\n\r\n");
    let reply = roundtrip(&mut stream, &request);
    assert_eq!(reply.status, 414);
}
