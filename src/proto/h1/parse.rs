use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::Parse;
use crate::proto::{Framing, RequestHead, RequestTarget};

/// Knobs the parser honors, lifted out of the full server configuration.
///
/// Every relaxation defaults to off; the parser fails closed.
#[derive(Debug, Clone)]
pub(crate) struct ParseOptions {
    pub(crate) limit_request_line: usize,
    pub(crate) limit_request_fields: usize,
    pub(crate) limit_request_field_size: usize,
    pub(crate) permit_unconventional_http_method: bool,
    pub(crate) permit_unconventional_http_version: bool,
    pub(crate) casefold_http_method: bool,
    pub(crate) strip_header_spaces: bool,
    pub(crate) permit_obsolete_folding: bool,
    pub(crate) tolerate_dangerous_framing: bool,
}

impl Default for ParseOptions {
    fn default() -> ParseOptions {
        ParseOptions {
            limit_request_line: 4094,
            limit_request_fields: 100,
            limit_request_field_size: 8190,
            permit_unconventional_http_method: false,
            permit_unconventional_http_version: false,
            casefold_http_method: false,
            strip_header_spaces: false,
            permit_obsolete_folding: false,
            tolerate_dangerous_framing: false,
        }
    }
}

#[derive(Debug, PartialEq)]
enum State {
    RequestLine,
    Headers,
    Done,
}

/// An incremental push parser for a single request head.
///
/// The caller feeds whatever bytes it has into [`RequestParser::parse`];
/// complete lines are consumed from the buffer as they arrive, so feeding
/// the same bytes in arbitrary splits consumes the same prefix and yields
/// the same head. `Ok(None)` means "need more bytes".
pub(crate) struct RequestParser {
    opts: ParseOptions,
    state: State,
    method: String,
    target: RequestTarget,
    version: (u8, u8),
    headers: Vec<(String, Bytes)>,
}

impl RequestParser {
    pub(crate) fn new(opts: ParseOptions) -> RequestParser {
        RequestParser {
            opts,
            state: State::RequestLine,
            method: String::new(),
            target: RequestTarget::default(),
            version: (1, 1),
            headers: Vec::new(),
        }
    }

    /// Consume as much of `buf` as possible, returning the parsed head once
    /// the empty line terminating the header section has been seen.
    pub(crate) fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<RequestHead>, Parse> {
        loop {
            match self.state {
                State::RequestLine => {
                    let line = match next_line(
                        buf,
                        self.opts.limit_request_line,
                        Parse::LimitRequestLine,
                        Parse::InvalidRequestLine,
                    )? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    // tolerate blank line(s) before the request line
                    if line.is_empty() {
                        continue;
                    }
                    self.parse_request_line(&line)?;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let line = match next_line(
                        buf,
                        self.opts.limit_request_field_size,
                        Parse::LimitRequestFieldSize,
                        Parse::InvalidHeader,
                    )? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    if line.is_empty() {
                        let framing = self.decide_framing()?;
                        self.state = State::Done;
                        trace!(
                            "request head complete: {} {} framing={:?}",
                            self.method,
                            self.target.raw,
                            framing
                        );
                        return Ok(Some(RequestHead {
                            method: std::mem::take(&mut self.method),
                            target: std::mem::take(&mut self.target),
                            version: self.version,
                            headers: std::mem::take(&mut self.headers),
                            framing,
                        }));
                    }
                    self.parse_header_line(&line)?;
                }
                State::Done => {
                    // a finished parser must not eat pipelined bytes
                    return Err(Parse::InvalidRequestLine);
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &Bytes) -> Result<(), Parse> {
        let mut parts = line.split(|&b| b == b' ');
        let method = parts.next().unwrap_or(b"");
        let target = parts.next().ok_or(Parse::InvalidRequestLine)?;
        let version = parts.next().ok_or(Parse::InvalidRequestLine)?;
        // a fourth part means doubled or trailing spaces
        if parts.next().is_some() || method.is_empty() || target.is_empty() || version.is_empty() {
            return Err(Parse::InvalidRequestLine);
        }

        self.method = self.validate_method(method)?;
        self.target = RequestTarget::parse(target)?;
        self.version = self.parse_version(version)?;
        Ok(())
    }

    fn validate_method(&self, raw: &[u8]) -> Result<String, Parse> {
        if raw.is_empty() || raw.len() > 64 {
            return Err(Parse::InvalidRequestMethod);
        }
        let mut method = raw.to_vec();
        if self.opts.casefold_http_method {
            method.make_ascii_uppercase();
        }
        let accepted = if self.opts.permit_unconventional_http_method {
            method.iter().all(|&b| is_tchar(b))
        } else {
            // the registered-method alphabet: uppercase, digits, `- _ .`
            method
                .iter()
                .all(|&b| b.is_ascii_uppercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'))
        };
        if !accepted {
            debug!("refused method token: {:?}", String::from_utf8_lossy(raw));
            return Err(Parse::InvalidRequestMethod);
        }
        // all-ASCII by the checks above
        Ok(String::from_utf8(method).map_err(|_| Parse::InvalidRequestMethod)?)
    }

    fn parse_version(&self, raw: &[u8]) -> Result<(u8, u8), Parse> {
        match raw {
            b"HTTP/1.1" => return Ok((1, 1)),
            b"HTTP/1.0" => return Ok((1, 0)),
            _ => {}
        }
        if !self.opts.permit_unconventional_http_version {
            return Err(Parse::InvalidHttpVersion);
        }
        let rest = raw
            .strip_prefix(b"HTTP/")
            .ok_or(Parse::InvalidHttpVersion)?;
        let dot = memchr::memchr(b'.', rest).ok_or(Parse::InvalidHttpVersion)?;
        let (major, minor) = (&rest[..dot], &rest[dot + 1..]);
        Ok((parse_version_digits(major)?, parse_version_digits(minor)?))
    }

    fn parse_header_line(&mut self, line: &Bytes) -> Result<(), Parse> {
        if line[0] == b' ' || line[0] == b'\t' {
            // obsolete line folding
            if !self.opts.permit_obsolete_folding {
                debug!("refused obs-fold continuation line");
                return Err(Parse::InvalidHeader);
            }
            let folded = trim_ows(line);
            check_value(folded)?;
            let (_, last) = self.headers.last_mut().ok_or(Parse::InvalidHeader)?;
            let mut joined = BytesMut::with_capacity(last.len() + 1 + folded.len());
            joined.extend_from_slice(last);
            joined.extend_from_slice(b" ");
            joined.extend_from_slice(folded);
            *last = joined.freeze();
            return Ok(());
        }

        let colon = memchr::memchr(b':', line).ok_or(Parse::InvalidHeader)?;
        let mut name = &line[..colon];
        if name.last().map_or(false, |&b| b == b' ' || b == b'\t') {
            if !self.opts.strip_header_spaces {
                return Err(Parse::InvalidHeaderName);
            }
            while name.last().map_or(false, |&b| b == b' ' || b == b'\t') {
                name = &name[..name.len() - 1];
            }
        }
        if name.is_empty() || !name.iter().all(|&b| is_tchar(b)) {
            return Err(Parse::InvalidHeaderName);
        }

        let value = trim_ows(&line[colon + 1..]);
        check_value(value)?;

        self.headers.push((
            // token bytes are ASCII
            String::from_utf8(name.to_vec()).map_err(|_| Parse::InvalidHeaderName)?,
            Bytes::copy_from_slice(value),
        ));
        if self.headers.len() > self.opts.limit_request_fields {
            return Err(Parse::LimitRequestHeaders);
        }
        Ok(())
    }

    /// RFC 7230 §3.3.3 for requests, with the smuggling defenses bolted on.
    fn decide_framing(&mut self) -> Result<Framing, Parse> {
        let codings = self.transfer_codings()?;
        let content_length = self.content_length()?;

        if !codings.is_empty() {
            if self.version == (1, 0) {
                debug!("HTTP/1.0 request with Transfer-Encoding");
                return Err(Parse::InvalidHeader);
            }
            // chunked must be the final coding, applied exactly once
            if codings.last().map(String::as_str) != Some("chunked")
                || codings[..codings.len() - 1].iter().any(|c| c == "chunked")
            {
                debug!("transfer-encoding present but not terminated by chunked");
                return Err(Parse::InvalidHeader);
            }
            if content_length.is_some() {
                if !self.opts.tolerate_dangerous_framing {
                    debug!("request with both Content-Length and Transfer-Encoding");
                    return Err(Parse::ConflictingFraming);
                }
                // tolerant mode: Transfer-Encoding wins, the stale
                // Content-Length must not leak into the environ
                self.headers
                    .retain(|(n, _)| !n.eq_ignore_ascii_case("content-length"));
            }
            return Ok(Framing::Chunked);
        }

        match content_length {
            Some(len) => Ok(Framing::Length(len)),
            None => Ok(Framing::None),
        }
    }

    /// All transfer codings, in order, lowercased. Parameters and empty
    /// codings are refused; so is any coding this server cannot undo.
    fn transfer_codings(&self) -> Result<Vec<String>, Parse> {
        const KNOWN: &[&str] = &["chunked", "compress", "deflate", "gzip", "identity"];
        let mut codings = Vec::new();
        for (name, value) in &self.headers {
            if !name.eq_ignore_ascii_case("transfer-encoding") {
                continue;
            }
            let value = std::str::from_utf8(value).map_err(|_| Parse::InvalidHeader)?;
            for coding in value.split(',') {
                let coding = coding.trim().to_ascii_lowercase();
                if coding.is_empty() || coding.contains(';') {
                    return Err(Parse::InvalidHeader);
                }
                if !KNOWN.contains(&coding.as_str()) {
                    debug!("unknown transfer coding: {:?}", coding);
                    return Err(Parse::InvalidHeader);
                }
                codings.push(coding);
            }
        }
        Ok(codings)
    }

    /// The single agreed Content-Length, if any. Duplicates with the same
    /// value collapse; any disagreement is a framing conflict.
    fn content_length(&self) -> Result<Option<u64>, Parse> {
        let mut seen: Option<u64> = None;
        for (name, value) in &self.headers {
            if !name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let value = std::str::from_utf8(value).map_err(|_| Parse::InvalidHeader)?;
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Parse::InvalidHeader);
                }
                let n: u64 = part.parse().map_err(|_| Parse::InvalidHeader)?;
                match seen {
                    Some(prev) if prev != n => return Err(Parse::ConflictingFraming),
                    _ => seen = Some(n),
                }
            }
        }
        Ok(seen)
    }
}

impl std::fmt::Debug for RequestParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestParser")
            .field("state", &self.state)
            .field("headers", &self.headers.len())
            .finish()
    }
}

/// Pop one CRLF-terminated line off the buffer.
///
/// Returns the line without its terminator, `None` when no full line is
/// buffered yet, `too_long` once the line cannot fit the limit, and
/// `malformed` for a bare-LF ending.
fn next_line(
    buf: &mut BytesMut,
    limit: usize,
    too_long: Parse,
    malformed: Parse,
) -> Result<Option<Bytes>, Parse> {
    let limit = if limit == 0 { usize::MAX } else { limit };
    match memchr::memchr(b'\n', buf) {
        Some(idx) => {
            if idx.saturating_sub(1) > limit {
                return Err(too_long);
            }
            let line = buf.split_to(idx + 1).freeze();
            if idx == 0 || line[idx - 1] != b'\r' {
                debug!("refused bare LF line ending");
                return Err(malformed);
            }
            Ok(Some(line.slice(0..idx - 1)))
        }
        None => {
            // no terminator yet; an over-long prefix can already be refused
            if buf.len() > limit.saturating_add(1) {
                return Err(too_long);
            }
            Ok(None)
        }
    }
}

fn parse_version_digits(raw: &[u8]) -> Result<u8, Parse> {
    if raw.is_empty() || raw.len() > 3 || !raw.iter().all(|b| b.is_ascii_digit()) {
        return Err(Parse::InvalidHttpVersion);
    }
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Parse::InvalidHttpVersion)
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while value.first().map_or(false, |&b| b == b' ' || b == b'\t') {
        value = &value[1..];
    }
    while value.last().map_or(false, |&b| b == b' ' || b == b'\t') {
        value = &value[..value.len() - 1];
    }
    value
}

/// CR, LF, and NUL are forbidden anywhere in a field value, quoted or not.
fn check_value(value: &[u8]) -> Result<(), Parse> {
    if value.iter().any(|&b| b == b'\r' || b == b'\n' || b == b'\0') {
        return Err(Parse::InvalidHeader);
    }
    Ok(())
}

pub(crate) fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~')
        || b.is_ascii_alphanumeric()
}
