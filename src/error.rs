//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have bantam `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while running the server.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Parse(Parse),
    /// Invalid configuration discovered before the server was usable.
    Config,
    /// An unknown or unsupported worker class was requested.
    WorkerClass,
    /// Failure to bind, adopt, or listen on a socket.
    Listen,
    /// A process-management syscall (fork, pipe, signal, exec) failed.
    Os,
}

/// A parse failure produced by the HTTP engine.
///
/// Every variant maps to a fixed response status; the worker uses
/// [`Parse::status`] to answer the client before closing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parse {
    /// The peer closed the connection before a full message head arrived.
    NoMoreData,
    /// Malformed request line (spacing, line ending, or target).
    InvalidRequestLine,
    /// The method token failed the acceptance predicate.
    InvalidRequestMethod,
    /// Unsupported or malformed HTTP version.
    InvalidHttpVersion,
    /// A header name was empty or contained non-token bytes.
    InvalidHeaderName,
    /// A header value or header structure was malformed.
    InvalidHeader,
    /// A chunk-size line was empty or non-hexadecimal.
    InvalidChunkSize,
    /// The request line exceeded `limit_request_line`.
    LimitRequestLine,
    /// More header fields than `limit_request_fields`.
    LimitRequestHeaders,
    /// A single header field exceeded `limit_request_field_size`.
    LimitRequestFieldSize,
    /// Configured secure-scheme headers disagreed with each other.
    InvalidSchemeHeaders,
    /// Conflicting Content-Length / Transfer-Encoding framing.
    ConflictingFraming,
    /// A trailer tried to smuggle a framing or routing field.
    ForbiddenTrailerField,
}

impl Parse {
    /// The response status sent to the client for this failure.
    pub fn status(&self) -> u16 {
        match *self {
            Parse::LimitRequestLine => 414,
            Parse::LimitRequestHeaders | Parse::LimitRequestFieldSize => 431,
            _ => 400,
        }
    }

    fn description_str(&self) -> &'static str {
        match *self {
            Parse::NoMoreData => "connection closed before message completed",
            Parse::InvalidRequestLine => "invalid request line",
            Parse::InvalidRequestMethod => "invalid request method",
            Parse::InvalidHttpVersion => "invalid HTTP version",
            Parse::InvalidHeaderName => "invalid header name",
            Parse::InvalidHeader => "invalid header",
            Parse::InvalidChunkSize => "invalid chunk size",
            Parse::LimitRequestLine => "request line too long",
            Parse::LimitRequestHeaders => "too many header fields",
            Parse::LimitRequestFieldSize => "header field too large",
            Parse::InvalidSchemeHeaders => "conflicting secure scheme headers",
            Parse::ConflictingFraming => "conflicting message framing",
            Parse::ForbiddenTrailerField => "forbidden trailer field",
        }
    }
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_config<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Config).with(cause)
    }

    pub(crate) fn new_worker_class<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::WorkerClass).with(cause)
    }

    pub(crate) fn new_listen<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_os<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Os).with(cause)
    }

    /// An error representing invalid configuration; maps to exit code 1.
    ///
    /// Public so embedders' configuration loaders can speak the same
    /// error language as the built-in layers.
    pub fn config<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Config).with(cause)
    }

    /// Returns true if this was a parse failure from the HTTP engine.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// The parse failure kind, if this error came from the HTTP engine.
    pub fn parse(&self) -> Option<Parse> {
        match self.inner.kind {
            Kind::Parse(p) => Some(p),
            _ => None,
        }
    }

    /// The process exit code this error maps to.
    ///
    /// 1 for configuration errors, 3 for worker-class misconfiguration,
    /// 4 for bind failures, 1 for anything else fatal.
    pub fn exit_code(&self) -> i32 {
        match self.inner.kind {
            Kind::WorkerClass => 3,
            Kind::Listen => 4,
            _ => 1,
        }
    }

    fn description_str(&self) -> &'static str {
        match self.inner.kind {
            Kind::Parse(ref p) => p.description_str(),
            Kind::Config => "invalid configuration",
            Kind::WorkerClass => "unsupported worker class",
            Kind::Listen => "error creating listening socket",
            Kind::Os => "operating system error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("bantam::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description_str(), cause)
        } else {
            f.write_str(self.description_str())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

impl fmt::Display for Parse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_of() {
        assert_eq!(
            std::mem::size_of::<Error>(),
            std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn parse_status_mapping() {
        assert_eq!(Parse::InvalidRequestLine.status(), 400);
        assert_eq!(Parse::ConflictingFraming.status(), 400);
        assert_eq!(Parse::LimitRequestLine.status(), 414);
        assert_eq!(Parse::LimitRequestHeaders.status(), 431);
        assert_eq!(Parse::LimitRequestFieldSize.status(), 431);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Error::new(Kind::Config).exit_code(), 1);
        assert_eq!(Error::new(Kind::WorkerClass).exit_code(), 3);
        assert_eq!(Error::new(Kind::Listen).exit_code(), 4);
    }
}
