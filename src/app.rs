//! The application-callable contract.
//!
//! A worker hands every parsed request to an [`Application`], shaped after
//! the CGI convention: a mapping of environ variables plus a streaming
//! request body, answered with a status, ordered headers, and a lazy body.
//! Plain functions and closures implement the trait directly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;

use crate::error::Parse;
use crate::proto::h1::io::Buffered;
use crate::proto::h1::{BodyFrame, Decoder, MemRead};
use crate::sock::Stream;

/// Errors an application may return; they become 500 responses.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// A user-supplied request handler.
///
/// Must be safe to call from N worker processes at once; within one worker
/// calls are strictly sequential.
pub trait Application: Send + Sync {
    /// Handle one request.
    fn call(&self, environ: &mut Environ) -> Result<Response, BoxError>;
}

impl<F> Application for F
where
    F: Fn(&mut Environ) -> Result<Response, BoxError> + Send + Sync,
{
    fn call(&self, environ: &mut Environ) -> Result<Response, BoxError> {
        (self)(environ)
    }
}

/// Builds the application instance.
///
/// With `preload` the factory runs once in the arbiter before any fork;
/// otherwise each worker runs it during boot, so a fresh process gets a
/// fresh application.
pub trait AppFactory: Send + Sync {
    /// Construct (or hand out) the application.
    fn load(&self) -> crate::Result<Arc<dyn Application>>;
}

impl<F> AppFactory for F
where
    F: Fn() -> crate::Result<Arc<dyn Application>> + Send + Sync,
{
    fn load(&self) -> crate::Result<Arc<dyn Application>> {
        (self)()
    }
}

/// The per-request environment handed to the application.
pub struct Environ {
    vars: HashMap<String, String>,
    body: Body,
}

impl Environ {
    pub(crate) fn new(vars: HashMap<String, String>, body: Body) -> Environ {
        Environ { vars, body }
    }

    /// Look up a CGI variable (`REQUEST_METHOD`, `PATH_INFO`, `HTTP_*`, ...).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// The full variable mapping.
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// The request method token.
    pub fn method(&self) -> &str {
        self.get("REQUEST_METHOD").unwrap_or("")
    }

    /// The decoded request path.
    pub fn path(&self) -> &str {
        self.get("PATH_INFO").unwrap_or("")
    }

    /// The raw query string.
    pub fn query(&self) -> &str {
        self.get("QUERY_STRING").unwrap_or("")
    }

    /// The streaming request body.
    ///
    /// A lazy, single-pass stream decoded straight off the socket; it cannot
    /// be rewound.
    pub fn body(&mut self) -> &mut Body {
        &mut self.body
    }
}

impl fmt::Debug for Environ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environ")
            .field("method", &self.method())
            .field("path", &self.path())
            .finish()
    }
}

pub(crate) type SharedIo = Rc<RefCell<Buffered<Stream>>>;

/// The streaming request body.
///
/// Reading pulls bytes off the connection and undoes the message framing on
/// the fly. Trailers of a chunked body are collected separately and exposed
/// through [`Body::trailers`]; they are never merged into the headers.
pub struct Body {
    io: SharedIo,
    decoder: Decoder,
    trailers: Option<HeaderMap>,
    forbidden: Vec<String>,
    chunk: Bytes,
    complete: bool,
}

impl Body {
    pub(crate) fn new(io: SharedIo, decoder: Decoder, forbidden: Vec<String>) -> Body {
        let complete = decoder.is_eof();
        Body {
            io,
            decoder,
            trailers: None,
            forbidden,
            chunk: Bytes::new(),
            complete,
        }
    }

    /// Trailer fields, once the body has been read to the end.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// Whether the body has been consumed to its framed end.
    pub fn is_complete(&self) -> bool {
        self.complete && self.chunk.is_empty()
    }

    /// Throw away the rest of the body, up to `cap` bytes.
    ///
    /// Returns false when the cap was hit first, in which case the
    /// connection cannot be reused.
    pub(crate) fn discard(&mut self, cap: usize) -> io::Result<bool> {
        let mut remaining = cap;
        let mut scratch = [0u8; 8192];
        while !self.is_complete() {
            if remaining == 0 {
                return Ok(false);
            }
            let want = std::cmp::min(remaining, scratch.len());
            let n = self.read(&mut scratch[..want])?;
            if n == 0 {
                break;
            }
            remaining -= n;
        }
        Ok(true)
    }

    fn next_frame(&mut self) -> io::Result<()> {
        struct IoRef<'a>(&'a SharedIo);
        impl MemRead for IoRef<'_> {
            fn read_mem(&mut self, n: usize) -> io::Result<Bytes> {
                self.0.borrow_mut().read_mem(n)
            }
        }

        let frame = self.decoder.decode(&mut IoRef(&self.io)).map_err(|e| {
            // chunk framing violations must answer 400, not bubble up as a
            // bare application failure
            if self.decoder.is_chunked()
                && matches!(
                    e.kind(),
                    io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
                )
            {
                io::Error::new(
                    e.kind(),
                    crate::Error::from(Parse::InvalidChunkSize).with(e),
                )
            } else {
                e
            }
        })?;
        match frame {
            BodyFrame::Data(data) => {
                if data.is_empty() {
                    self.complete = true;
                } else {
                    self.chunk = data;
                }
            }
            BodyFrame::Trailers(map) => {
                for name in map.keys() {
                    if self.forbidden.iter().any(|f| f == name.as_str()) {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            crate::Error::from(Parse::ForbiddenTrailerField),
                        ));
                    }
                }
                self.trailers = Some(map);
                self.complete = true;
            }
        }
        Ok(())
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.chunk.is_empty() {
                let n = std::cmp::min(buf.len(), self.chunk.len());
                buf[..n].copy_from_slice(&self.chunk[..n]);
                self.chunk = self.chunk.split_off(n);
                return Ok(n);
            }
            if self.complete || buf.is_empty() {
                return Ok(0);
            }
            self.next_frame()?;
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("decoder", &self.decoder)
            .field("complete", &self.complete)
            .finish()
    }
}

/// The application's answer to one request.
#[derive(Debug)]
pub struct Response {
    /// The status code.
    pub status: u16,
    /// Overrides the canonical reason phrase when set.
    pub reason: Option<String>,
    /// Header fields, written in order. `Date`, `Server`, `Connection`, and
    /// the body framing header are supplied by the server when absent.
    pub headers: Vec<(String, String)>,
    /// The response body.
    pub body: ResponseBody,
}

impl Response {
    /// An empty response with the given status.
    pub fn new(status: u16) -> Response {
        Response {
            status,
            reason: None,
            headers: Vec::new(),
            body: ResponseBody::Empty,
        }
    }

    /// A plain-text response.
    pub fn text(status: u16, body: impl Into<String>) -> Response {
        Response::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into())
    }

    /// Append a header field.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Response {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a complete in-memory body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Response {
        self.body = ResponseBody::Full(body.into());
        self
    }

    /// Stream the body from an iterator of chunks.
    pub fn streaming<I>(mut self, chunks: I) -> Response
    where
        I: Iterator<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.body = ResponseBody::Chunks(Box::new(chunks));
        self
    }

    /// Serve a file region; uses `sendfile(2)` when enabled.
    pub fn with_file(mut self, file: FileBody) -> Response {
        self.body = ResponseBody::File(file);
        self
    }
}

/// A lazy sequence of response bytes.
pub enum ResponseBody {
    /// No body.
    Empty,
    /// The whole body, in memory.
    Full(Bytes),
    /// Chunks yielded one at a time; total size unknown up front.
    Chunks(Box<dyn Iterator<Item = io::Result<Bytes>> + Send>),
    /// A region of a file, eligible for the sendfile fast path.
    File(FileBody),
}

impl ResponseBody {
    /// The body size when known up front.
    pub(crate) fn len_hint(&self) -> Option<u64> {
        match self {
            ResponseBody::Empty => Some(0),
            ResponseBody::Full(b) => Some(b.len() as u64),
            ResponseBody::Chunks(_) => None,
            ResponseBody::File(f) => Some(f.len),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(b) => f.debug_tuple("Full").field(&b.len()).finish(),
            ResponseBody::Chunks(_) => f.write_str("Chunks(..)"),
            ResponseBody::File(file) => f.debug_tuple("File").field(file).finish(),
        }
    }
}

/// A file region served as a response body.
#[derive(Debug)]
pub struct FileBody {
    pub(crate) file: File,
    pub(crate) offset: u64,
    pub(crate) len: u64,
}

impl FileBody {
    /// Serve the whole file; the length is taken from its metadata.
    pub fn new(file: File) -> io::Result<FileBody> {
        let len = file.metadata()?.len();
        Ok(FileBody {
            file,
            offset: 0,
            len,
        })
    }

    /// Serve `len` bytes starting at `offset`.
    pub fn with_range(file: File, offset: u64, len: u64) -> FileBody {
        FileBody { file, offset, len }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_builders() {
        let resp = Response::text(200, "Hello\n").with_header("X-Extra", "1");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body.len_hint(), Some(6));
        assert_eq!(resp.headers.len(), 2);

        let resp = Response::new(204);
        assert_eq!(resp.body.len_hint(), Some(0));

        let resp = Response::new(200).streaming(std::iter::once(Ok(Bytes::from_static(b"x"))));
        assert_eq!(resp.body.len_hint(), None);
    }
}
