//! Connection handling for the synchronous worker.
//!
//! One connection at a time: parse a head, hand the request to the
//! application, stream the response back, then either wait (briefly) for
//! the next keep-alive request or close.

use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom};
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::app::{Body, Environ, FileBody, Response, ResponseBody, SharedIo};
use crate::error::Parse;
use crate::proto::environ::{build_vars, EnvironContext};
use crate::proto::h1::io::Buffered;
use crate::proto::h1::{encode, Decoder, Encoder, RequestParser};
use crate::proto::RequestHead;
use crate::sock::{Peer, Stream};

use super::{Worker, QUIT_FLAG, TERM_FLAG};

/// How much unread request body gets drained before reusing a connection.
const DISCARD_CAP: usize = 1024 * 1024;

enum HeadError {
    Io(io::Error),
    Parse(Parse),
}

impl Worker {
    pub(super) fn handle_connection(
        &mut self,
        stream: Stream,
        peer: Peer,
        server_name: String,
        server_port: String,
    ) {
        let io: SharedIo = Rc::new(RefCell::new(Buffered::new(stream)));
        let mut requests = 0usize;

        loop {
            let head = match self.read_head(&io, requests > 0) {
                Ok(Some(head)) => head,
                Ok(None) => return,
                Err(HeadError::Io(e)) => {
                    debug!("connection error from {}: {}", peer_label(&peer), e);
                    return;
                }
                Err(HeadError::Parse(Parse::NoMoreData)) => {
                    debug!("client {} hung up mid-request", peer_label(&peer));
                    return;
                }
                Err(HeadError::Parse(p)) => {
                    info!("invalid request from {}: {}", peer_label(&peer), p);
                    self.send_error(&io, p.status(), &p.to_string());
                    return;
                }
            };
            requests += 1;
            self.handled += 1;
            self.tmp.notify();

            let (remote_addr, remote_port) = peer.addr_strings();
            let ctx = EnvironContext {
                cfg: &self.cfg,
                peer_ip: peer.ip(),
                remote_addr,
                remote_port,
                server_name: server_name.clone(),
                server_port: server_port.clone(),
            };
            let vars = match build_vars(&head, &ctx) {
                Ok(vars) => vars,
                Err(p) => {
                    info!("invalid request from {}: {}", peer_label(&peer), p);
                    self.send_error(&io, p.status(), &p.to_string());
                    return;
                }
            };

            let decoder = Decoder::for_framing(
                head.framing,
                self.cfg.limit_request_fields,
                self.cfg.limit_request_field_size,
            );
            let body = Body::new(io.clone(), decoder, self.cfg.forbidden_trailers());
            let mut environ = Environ::new(vars, body);

            if let Some(hook) = self.cfg.hooks.pre_request {
                hook(self, &environ);
            }

            // loaded during init_process, before the serve loop starts
            let app = self.app.clone().expect("application is loaded");
            let result = app.call(&mut environ);

            let mut keep_alive = head.keep_alive()
                && self.cfg.keepalive > 0
                && !TERM_FLAG.load(Ordering::SeqCst)
                && !QUIT_FLAG.load(Ordering::SeqCst)
                && !(self.max_requests > 0 && self.handled >= self.max_requests);

            match result {
                Ok(mut resp) => {
                    match self.write_response(&io, &head, &mut resp, keep_alive) {
                        Ok(keep) => keep_alive = keep,
                        Err(e) => {
                            debug!("error writing response to {}: {}", peer_label(&peer), e);
                            return;
                        }
                    }
                    if let Some(hook) = self.cfg.hooks.post_request {
                        hook(self, &environ, &resp);
                    }
                }
                Err(e) => {
                    // a parse failure surfaced through the body stream is
                    // the client's fault, not the application's
                    if let Some(parse) = parse_failure(e.as_ref()) {
                        info!("invalid request from {}: {}", peer_label(&peer), parse);
                        self.send_error(&io, parse.status(), &parse.to_string());
                    } else {
                        error!("error handling request {:?}: {}", head.target.raw, e);
                        self.send_error(&io, 500, "Internal Server Error");
                    }
                    return;
                }
            }

            if !keep_alive {
                return;
            }
            // the next head cannot be parsed over an unread body
            match environ.body().discard(DISCARD_CAP) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("request body too large to drain, closing connection");
                    return;
                }
                Err(e) => {
                    debug!("error draining request body: {}", e);
                    return;
                }
            }
        }
    }

    /// Read and parse one request head off the connection.
    ///
    /// `Ok(None)` is a quiet close: the peer went away, or a keep-alive
    /// connection idled out without starting another request.
    fn read_head(&self, io: &SharedIo, idle_keepalive: bool) -> Result<Option<RequestHead>, HeadError> {
        let mut parser = RequestParser::new(self.cfg.parse_options());

        // between requests the wait is bounded by `keepalive`; within a
        // request the arbiter's timeout murder is the only clock
        let timeout = if idle_keepalive {
            Some(Duration::from_secs(self.cfg.keepalive))
        } else {
            None
        };
        io.borrow()
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(HeadError::Io)?;

        let mut seen_bytes = !io.borrow().read_buf().is_empty();
        loop {
            {
                let mut buffered = io.borrow_mut();
                if let Some(head) = parser
                    .parse(buffered.read_buf_mut())
                    .map_err(HeadError::Parse)?
                {
                    drop(buffered);
                    io.borrow()
                        .get_ref()
                        .set_read_timeout(None)
                        .map_err(HeadError::Io)?;
                    return Ok(Some(head));
                }
            }

            let filled = io.borrow_mut().fill_read_buf();
            match filled {
                Ok(0) => {
                    if seen_bytes {
                        return Err(HeadError::Parse(Parse::NoMoreData));
                    }
                    return Ok(None);
                }
                Ok(_) => seen_bytes = true,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if idle_keepalive && !seen_bytes {
                        debug!("keep-alive connection idled out");
                        return Ok(None);
                    }
                    return Err(HeadError::Io(e));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if QUIT_FLAG.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(HeadError::Io(e)),
            }
        }
    }

    /// Serialize and stream one response; returns whether the connection
    /// survives for another request.
    fn write_response(
        &self,
        io: &SharedIo,
        head: &RequestHead,
        resp: &mut Response,
        mut keep_alive: bool,
    ) -> io::Result<bool> {
        let mut headers = resp.headers.clone();
        // the server owns the framing; an application cannot pick it
        headers.retain(|(n, _)| !n.eq_ignore_ascii_case("transfer-encoding"));
        if headers.iter().any(|(n, v)| {
            n.eq_ignore_ascii_case("connection") && v.trim().eq_ignore_ascii_case("close")
        }) {
            keep_alive = false;
        }

        let body = std::mem::replace(&mut resp.body, ResponseBody::Empty);
        let body_len = body.len_hint();
        let mut encoder = encode::prepare(
            &head.method,
            head.version,
            resp.status,
            &mut headers,
            body_len,
            &mut keep_alive,
        );
        if !headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("connection"))
        {
            let value = if keep_alive { "keep-alive" } else { "close" };
            headers.push(("Connection".to_owned(), value.to_owned()));
        }

        let mut buf = Vec::new();
        encode::encode_head(&mut buf, head.version, resp.status, resp.reason.as_deref(), &headers);

        let mut io = io.borrow_mut();
        io.write_all(&buf)?;
        match body {
            ResponseBody::Empty => {}
            ResponseBody::Full(bytes) => encoder.encode(&mut *io, &bytes)?,
            ResponseBody::Chunks(chunks) => {
                for chunk in chunks {
                    let chunk = chunk?;
                    encoder.encode(&mut *io, &chunk)?;
                }
            }
            ResponseBody::File(file) => self.write_file(&mut io, file, &mut encoder)?,
        }
        encoder.finish(&mut *io)?;
        io.flush()?;

        if encoder.is_close_delimited() {
            keep_alive = false;
        }
        Ok(keep_alive)
    }

    /// Stream a file body, preferring `sendfile(2)` where it applies.
    fn write_file(
        &self,
        io: &mut Buffered<Stream>,
        mut file: FileBody,
        encoder: &mut Encoder,
    ) -> io::Result<()> {
        let budget = match encoder.sized_remaining() {
            // a HEAD answer or bodyless status: nothing to send
            Some(0) => return Ok(()),
            Some(n) => std::cmp::min(n, file.len),
            None => file.len,
        };

        #[cfg(target_os = "linux")]
        if self.cfg.sendfile && encoder.sized_remaining().is_some() {
            use std::os::unix::io::AsRawFd;
            let out_fd = io.get_ref().as_raw_fd();
            let in_fd = file.file.as_raw_fd();
            let mut offset = file.offset as libc::off_t;
            let mut remaining = budget;
            let mut first = true;
            loop {
                if remaining == 0 {
                    encoder.advance(budget);
                    return Ok(());
                }
                let count = std::cmp::min(remaining, usize::MAX as u64) as usize;
                let rv = unsafe { libc::sendfile(out_fd, in_fd, &mut offset, count) };
                if rv > 0 {
                    remaining -= rv as u64;
                    first = false;
                    continue;
                }
                if rv == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shorter than advertised",
                    ));
                }
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if first {
                    // sendfile is an optimization only; hand the whole job
                    // to the write loop below
                    debug!("sendfile unavailable ({}), falling back", err);
                    break;
                }
                return Err(err);
            }
        }

        file.file.seek(SeekFrom::Start(file.offset))?;
        let mut remaining = budget;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = std::cmp::min(remaining, buf.len() as u64) as usize;
            let n = file.file.read(&mut buf[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shorter than advertised",
                ));
            }
            encoder.encode(io, &buf[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Best-effort synthetic error response; the connection closes after.
    fn send_error(&self, io: &SharedIo, status: u16, detail: &str) {
        let reason = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Error");
        let body = format!(
            "<html>\n  <head>\n    <title>{status} {reason}</title>\n  </head>\n  <body>\n    <h1>{status} {reason}</h1>\n    <p>{detail}</p>\n  </body>\n</html>\n",
            status = status,
            reason = reason,
            detail = detail,
        );
        let headers = vec![
            ("Content-Type".to_owned(), "text/html; charset=utf-8".to_owned()),
            ("Content-Length".to_owned(), body.len().to_string()),
            ("Connection".to_owned(), "close".to_owned()),
        ];
        let mut buf = Vec::new();
        encode::encode_head(&mut buf, (1, 1), status, None, &headers);
        buf.extend_from_slice(body.as_bytes());

        let mut io = io.borrow_mut();
        if let Err(e) = io.write_all(&buf).and_then(|_| io.flush()) {
            debug!("error sending error response: {}", e);
            return;
        }
        // unread request bytes at close time can RST the response out of
        // the client's hands; swallow what already arrived first
        drain_socket(io.get_ref());
    }
}

fn drain_socket(stream: &Stream) {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    if crate::util::set_non_blocking(fd, true).is_err() {
        return;
    }
    let mut scratch = [0u8; 4096];
    let mut budget: usize = 64 * 1024;
    while budget > 0 {
        let n = unsafe {
            libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
        };
        if n <= 0 {
            break;
        }
        budget = budget.saturating_sub(n as usize);
    }
}

/// Walk an error chain looking for a buried parse failure.
fn parse_failure(err: &(dyn std::error::Error + 'static)) -> Option<Parse> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(own) = err.downcast_ref::<crate::Error>() {
            return own.parse();
        }
        current = err.source();
    }
    None
}

fn peer_label(peer: &Peer) -> String {
    match peer {
        Peer::Tcp(addr) => addr.to_string(),
        Peer::Unix => "unix peer".to_owned(),
    }
}
