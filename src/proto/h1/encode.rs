use std::fmt::Write as _;
use std::io::{self, Write};

use tracing::trace;

use super::date;

const AVERAGE_HEADER_SIZE: usize = 30; // totally scientific

/// Encoders to handle different response body framings.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug, PartialEq, Clone)]
enum Kind {
    /// An encoder for when Content-Length is known.
    ///
    /// Enforces that the body is not longer than the Content-Length header.
    Length(u64),
    /// An encoder for when Transfer-Encoding includes `chunked`.
    Chunked,
    /// An encoder for neither Content-Length nor chunked.
    ///
    /// Only reachable for HTTP/1.0 peers; requires the connection to close
    /// when the body is finished.
    CloseDelimited,
}

impl Encoder {
    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked() -> Encoder {
        Encoder {
            kind: Kind::Chunked,
        }
    }

    pub(crate) fn close_delimited() -> Encoder {
        Encoder {
            kind: Kind::CloseDelimited,
        }
    }

    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked)
    }

    /// Remaining byte budget for a sized body; `None` for other framings.
    pub(crate) fn sized_remaining(&self) -> Option<u64> {
        match self.kind {
            Kind::Length(n) => Some(n),
            _ => None,
        }
    }

    /// Record bytes written outside the encoder (the sendfile fast path).
    pub(crate) fn advance(&mut self, n: u64) {
        if let Kind::Length(ref mut remaining) = self.kind {
            *remaining = remaining.saturating_sub(n);
        }
    }

    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.kind, Kind::CloseDelimited)
    }

    /// Write one body chunk through the framing.
    pub(crate) fn encode<W: Write>(&mut self, dst: &mut W, msg: &[u8]) -> io::Result<()> {
        if msg.is_empty() {
            return Ok(());
        }
        match self.kind {
            Kind::Chunked => {
                trace!("encoding chunked {}B", msg.len());
                let mut size = String::with_capacity(10);
                // hex digits cannot fail to format into a String
                let _ = write!(size, "{:X}", msg.len());
                dst.write_all(size.as_bytes())?;
                dst.write_all(b"\r\n")?;
                dst.write_all(msg)?;
                dst.write_all(b"\r\n")
            }
            Kind::Length(ref mut remaining) => {
                trace!("sized write, len = {}", msg.len());
                if (msg.len() as u64) > *remaining {
                    // the application lied about its Content-Length; truncate
                    // rather than corrupt the framing
                    let limit = *remaining as usize;
                    *remaining = 0;
                    dst.write_all(&msg[..limit])
                } else {
                    *remaining -= msg.len() as u64;
                    dst.write_all(msg)
                }
            }
            Kind::CloseDelimited => {
                trace!("close delimited write, len = {}", msg.len());
                dst.write_all(msg)
            }
        }
    }

    /// Finish the body; writes the last-chunk for chunked framing.
    ///
    /// A sized body that has not been fully written is an error: the peer
    /// would wait forever for the missing bytes.
    pub(crate) fn finish<W: Write>(&mut self, dst: &mut W) -> io::Result<()> {
        match self.kind {
            Kind::Length(0) | Kind::CloseDelimited => Ok(()),
            Kind::Chunked => dst.write_all(b"0\r\n\r\n"),
            Kind::Length(n) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("body is {} bytes short of its Content-Length", n),
            )),
        }
    }
}

/// Pick the response framing and patch the header list accordingly.
///
/// `body_len` is `Some` when the whole body size is known up front. The
/// header list gains `Content-Length` or `Transfer-Encoding: chunked` as
/// needed; `keep_alive` is cleared when only close-delimited framing fits.
pub(crate) fn prepare(
    req_method: &str,
    req_version: (u8, u8),
    status: u16,
    headers: &mut Vec<(String, String)>,
    body_len: Option<u64>,
    keep_alive: &mut bool,
) -> Encoder {
    let head_request = req_method.eq_ignore_ascii_case("HEAD");
    let can_have_body = !head_request && !matches!(status, 100..=199 | 204 | 304);

    let app_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok());

    if !can_have_body {
        headers.retain(|(n, _)| !n.eq_ignore_ascii_case("transfer-encoding"));
        if head_request {
            // HEAD answers carry the headers the GET would have, minus body
            if let (None, Some(len)) = (app_length, body_len) {
                headers.push(("Content-Length".to_owned(), len.to_string()));
            }
        }
        return Encoder::length(0);
    }

    match (app_length, body_len) {
        (Some(len), _) => Encoder::length(len),
        (None, Some(len)) => {
            let mut value = itoa::Buffer::new();
            headers.push(("Content-Length".to_owned(), value.format(len).to_owned()));
            Encoder::length(len)
        }
        (None, None) => {
            if req_version >= (1, 1) {
                headers.push(("Transfer-Encoding".to_owned(), "chunked".to_owned()));
                Encoder::chunked()
            } else {
                *keep_alive = false;
                Encoder::close_delimited()
            }
        }
    }
}

/// Serialize the status line and header section into `dst`.
///
/// `Date` and `Server` are appended when the application did not set them.
pub(crate) fn encode_head(
    dst: &mut Vec<u8>,
    version: (u8, u8),
    status: u16,
    reason: Option<&str>,
    headers: &[(String, String)],
) {
    let init_cap = 30 + headers.len() * AVERAGE_HEADER_SIZE;
    dst.reserve(init_cap);

    if version == (1, 1) && status == 200 && reason.is_none() {
        extend(dst, b"HTTP/1.1 200 OK\r\n");
    } else {
        let reason = reason
            .or_else(|| {
                http::StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
            })
            .unwrap_or("Unknown");
        let _ = write!(
            FastWrite(dst),
            "HTTP/{}.{} {} {}\r\n",
            version.0,
            version.1,
            status,
            reason
        );
    }

    let mut has_date = false;
    let mut has_server = false;
    for (name, value) in headers {
        has_date |= name.eq_ignore_ascii_case("date");
        has_server |= name.eq_ignore_ascii_case("server");
        extend(dst, name.as_bytes());
        extend(dst, b": ");
        extend(dst, value.as_bytes());
        extend(dst, b"\r\n");
    }

    if !has_server {
        extend(dst, b"Server: ");
        extend(dst, crate::util::SERVER_SOFTWARE.as_bytes());
        extend(dst, b"\r\n");
    }
    // the cached date is a lot cheaper than formatting per response
    if !has_date {
        dst.reserve(date::DATE_VALUE_LENGTH + 8);
        extend(dst, b"Date: ");
        date::extend(dst);
        extend(dst, b"\r\n");
    }
    extend(dst, b"\r\n");
}

struct FastWrite<'a>(&'a mut Vec<u8>);

impl<'a> std::fmt::Write for FastWrite<'a> {
    #[inline]
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        extend(self.0, s.as_bytes());
        Ok(())
    }

    #[inline]
    fn write_fmt(&mut self, args: std::fmt::Arguments<'_>) -> std::fmt::Result {
        std::fmt::write(self, args)
    }
}

#[inline]
fn extend(dst: &mut Vec<u8>, data: &[u8]) {
    dst.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_str(version: (u8, u8), status: u16, headers: &[(String, String)]) -> String {
        let mut dst = Vec::new();
        encode_head(&mut dst, version, status, None, headers);
        String::from_utf8(dst).unwrap()
    }

    #[test]
    fn test_encode_head_injects_date_and_server() {
        let head = head_str((1, 1), 200, &[("Content-Length".into(), "6".into())]);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 6\r\n"));
        assert!(head.contains("Server: "));
        assert!(head.contains("Date: "));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_encode_head_respects_app_server_header() {
        let head = head_str((1, 1), 404, &[("Server".into(), "custom".into())]);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(head.matches("Server: ").count(), 1);
        assert!(head.contains("Server: custom\r\n"));
    }

    #[test]
    fn test_prepare_sized_body() {
        let mut headers = Vec::new();
        let mut keep_alive = true;
        let enc = prepare("GET", (1, 1), 200, &mut headers, Some(6), &mut keep_alive);
        assert_eq!(enc, Encoder::length(6));
        assert_eq!(headers, [("Content-Length".to_owned(), "6".to_owned())]);
        assert!(keep_alive);
    }

    #[test]
    fn test_prepare_streaming_bodies() {
        // 1.1 streams chunked
        let mut headers = Vec::new();
        let mut keep_alive = true;
        let enc = prepare("GET", (1, 1), 200, &mut headers, None, &mut keep_alive);
        assert!(enc.is_chunked());
        assert_eq!(
            headers,
            [("Transfer-Encoding".to_owned(), "chunked".to_owned())]
        );

        // 1.0 falls back to close-delimited
        let mut headers = Vec::new();
        let mut keep_alive = true;
        let enc = prepare("GET", (1, 0), 200, &mut headers, None, &mut keep_alive);
        assert!(enc.is_close_delimited());
        assert!(!keep_alive);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_prepare_bodyless_statuses() {
        for status in [204u16, 304] {
            let mut headers = vec![("Transfer-Encoding".to_owned(), "chunked".to_owned())];
            let mut keep_alive = true;
            let enc = prepare("GET", (1, 1), status, &mut headers, None, &mut keep_alive);
            assert_eq!(enc, Encoder::length(0));
            assert!(headers.is_empty(), "status {}", status);
        }
    }

    #[test]
    fn test_prepare_head_request() {
        let mut headers = Vec::new();
        let mut keep_alive = true;
        let enc = prepare("HEAD", (1, 1), 200, &mut headers, Some(6), &mut keep_alive);
        assert_eq!(enc, Encoder::length(0));
        // the body is suppressed but its length is still advertised
        assert_eq!(headers, [("Content-Length".to_owned(), "6".to_owned())]);
    }

    #[test]
    fn test_chunked_encoding() {
        let mut enc = Encoder::chunked();
        let mut out = Vec::new();
        enc.encode(&mut out, b"hello").unwrap();
        enc.encode(&mut out, b"").unwrap();
        enc.finish(&mut out).unwrap();
        assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn test_length_encoding_truncates_excess() {
        let mut enc = Encoder::length(4);
        let mut out = Vec::new();
        enc.encode(&mut out, b"toolong").unwrap();
        enc.finish(&mut out).unwrap();
        assert_eq!(out, b"tool");
    }

    #[test]
    fn test_length_encoding_detects_short_body() {
        let mut enc = Encoder::length(10);
        let mut out = Vec::new();
        enc.encode(&mut out, b"short").unwrap();
        enc.finish(&mut out).unwrap_err();
    }
}
