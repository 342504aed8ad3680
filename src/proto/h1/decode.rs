use std::error::Error as StdError;
use std::fmt;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, trace};

use crate::proto::Framing;

/// Maximum amount of bytes allowed in chunked extensions.
///
/// This limit is applied for the entire body, not per chunk.
const CHUNKED_EXTENSIONS_LIMIT: u64 = 1024 * 16;

/// A source the decoder pulls body bytes from.
///
/// Implementations block until at least one byte (or EOF) is available; a
/// returned empty buffer means EOF on the transport.
pub(crate) trait MemRead {
    fn read_mem(&mut self, n: usize) -> io::Result<Bytes>;
}

/// One step of decoded body.
#[derive(Debug)]
pub(crate) enum BodyFrame {
    /// Decoded payload bytes; empty means the body is complete.
    Data(Bytes),
    /// The trailer section of a chunked body.
    Trailers(HeaderMap),
}

/// Decoders to handle different Transfer-Encodings.
///
/// If a message body does not include a Transfer-Encoding, it *should*
/// include a Content-Length header.
#[derive(Clone, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    /// A decoder for a body framed by a Content-Length header.
    Length(u64),
    /// A decoder for a body with Transfer-Encoding `chunked`.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        extensions_cnt: u64,
        trailers_buf: Option<BytesMut>,
        trailers_cnt: usize,
        max_trailers: usize,
        max_trailer_size: usize,
    },
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder {
    pub(crate) fn length(x: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(x),
        }
    }

    pub(crate) fn chunked(max_trailers: usize, max_trailer_size: usize) -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::Start,
                chunk_len: 0,
                extensions_cnt: 0,
                trailers_buf: None,
                trailers_cnt: 0,
                max_trailers,
                max_trailer_size,
            },
        }
    }

    pub(crate) fn for_framing(
        framing: Framing,
        max_trailers: usize,
        max_trailer_size: usize,
    ) -> Decoder {
        match framing {
            Framing::None => Decoder::length(0),
            Framing::Length(n) => Decoder::length(n),
            Framing::Chunked => Decoder::chunked(max_trailers, max_trailer_size),
        }
    }

    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked { .. })
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self.kind,
            Kind::Length(0)
                | Kind::Chunked {
                    state: ChunkedState::End,
                    ..
                }
        )
    }

    /// Decode the next frame, blocking on the underlying source.
    pub(crate) fn decode<R: MemRead>(&mut self, body: &mut R) -> io::Result<BodyFrame> {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if *remaining == 0 {
                    Ok(BodyFrame::Data(Bytes::new()))
                } else {
                    let to_read = *remaining as usize;
                    let buf = body.read_mem(to_read)?;
                    let num = buf.as_ref().len() as u64;
                    if num > *remaining {
                        *remaining = 0;
                    } else if num == 0 {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, IncompleteBody));
                    } else {
                        *remaining -= num;
                    }
                    Ok(BodyFrame::Data(buf))
                }
            }
            Kind::Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut extensions_cnt,
                ref mut trailers_buf,
                ref mut trailers_cnt,
                max_trailers,
                max_trailer_size,
            } => {
                loop {
                    let mut buf = None;
                    // advances the chunked state
                    *state = state.step(
                        body,
                        chunk_len,
                        extensions_cnt,
                        &mut buf,
                        trailers_buf,
                        trailers_cnt,
                        max_trailers,
                        max_trailer_size,
                    )?;
                    if *state == ChunkedState::End {
                        trace!("end of chunked");
                        if trailers_buf.is_some() {
                            trace!("found possible trailers");
                            if *trailers_cnt >= max_trailers {
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    "chunk trailers count overflow",
                                ));
                            }
                            let mut raw = trailers_buf.take().expect("trailers_buf is None");
                            return decode_trailers(&mut raw, *trailers_cnt)
                                .map(BodyFrame::Trailers);
                        }
                        return Ok(BodyFrame::Data(Bytes::new()));
                    }
                    if let Some(buf) = buf {
                        return Ok(BodyFrame::Data(buf));
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)
    }
}

macro_rules! byte (
    ($rdr:ident) => ({
        let buf = $rdr.read_mem(1)?;
        if !buf.is_empty() {
            buf[0]
        } else {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                                      "unexpected EOF during chunk size line"));
        }
    })
);

macro_rules! or_overflow {
    ($e:expr) => (
        match $e {
            Some(val) => val,
            None => return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk size: overflow",
            )),
        }
    )
}

macro_rules! put_u8 {
    ($trailers_buf:expr, $byte:expr, $limit:expr) => {
        $trailers_buf.put_u8($byte);

        if $trailers_buf.len() >= $limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk trailers bytes over limit",
            ));
        }
    };
}

impl ChunkedState {
    #[allow(clippy::too_many_arguments)]
    fn step<R: MemRead>(
        &self,
        body: &mut R,
        size: &mut u64,
        extensions_cnt: &mut u64,
        buf: &mut Option<Bytes>,
        trailers_buf: &mut Option<BytesMut>,
        trailers_cnt: &mut usize,
        max_trailers: usize,
        max_trailer_size: usize,
    ) -> io::Result<ChunkedState> {
        use self::ChunkedState::*;
        match *self {
            Start => ChunkedState::read_start(body, size),
            Size => ChunkedState::read_size(body, size),
            SizeLws => ChunkedState::read_size_lws(body),
            Extension => ChunkedState::read_extension(body, extensions_cnt),
            SizeLf => ChunkedState::read_size_lf(body, *size),
            Body => ChunkedState::read_body(body, size, buf),
            BodyCr => ChunkedState::read_body_cr(body),
            BodyLf => ChunkedState::read_body_lf(body),
            Trailer => ChunkedState::read_trailer(body, trailers_buf, max_trailer_size),
            TrailerLf => ChunkedState::read_trailer_lf(
                body,
                trailers_buf,
                trailers_cnt,
                max_trailers,
                max_trailer_size,
            ),
            EndCr => ChunkedState::read_end_cr(body, trailers_buf, max_trailer_size),
            EndLf => ChunkedState::read_end_lf(body, trailers_buf, max_trailer_size),
            End => Ok(ChunkedState::End),
        }
    }

    fn read_start<R: MemRead>(rdr: &mut R, size: &mut u64) -> io::Result<ChunkedState> {
        trace!("Read chunk start");

        let radix = 16;
        match byte!(rdr) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Invalid chunk size line: missing size digit",
                ));
            }
        }

        Ok(ChunkedState::Size)
    }

    fn read_size<R: MemRead>(rdr: &mut R, size: &mut u64) -> io::Result<ChunkedState> {
        trace!("Read chunk hex size");

        let radix = 16;
        match byte!(rdr) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Ok(ChunkedState::SizeLws),
            b';' => return Ok(ChunkedState::Extension),
            b'\r' => return Ok(ChunkedState::SizeLf),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Invalid chunk size line: Invalid Size",
                ));
            }
        }
        Ok(ChunkedState::Size)
    }

    fn read_size_lws<R: MemRead>(rdr: &mut R) -> io::Result<ChunkedState> {
        trace!("read_size_lws");
        match byte!(rdr) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => Ok(ChunkedState::SizeLws),
            b';' => Ok(ChunkedState::Extension),
            b'\r' => Ok(ChunkedState::SizeLf),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk size linear white space",
            )),
        }
    }

    fn read_extension<R: MemRead>(rdr: &mut R, extensions_cnt: &mut u64) -> io::Result<ChunkedState> {
        trace!("read_extension");
        // Extensions are ignored, but some implementations may not check for
        // the CR, so plain LF inside an extension is refused as well.
        match byte!(rdr) {
            b'\r' => Ok(ChunkedState::SizeLf),
            b'\n' => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk extension contains newline",
            )),
            _ => {
                *extensions_cnt += 1;
                if *extensions_cnt >= CHUNKED_EXTENSIONS_LIMIT {
                    Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "chunk extensions over limit",
                    ))
                } else {
                    Ok(ChunkedState::Extension)
                }
            }
        }
    }

    fn read_size_lf<R: MemRead>(rdr: &mut R, size: u64) -> io::Result<ChunkedState> {
        trace!("Chunk size is {:?}", size);
        match byte!(rdr) {
            b'\n' => {
                if size == 0 {
                    Ok(ChunkedState::EndCr)
                } else {
                    debug!("incoming chunked header: {0:#X} ({0} bytes)", size);
                    Ok(ChunkedState::Body)
                }
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk size LF",
            )),
        }
    }

    fn read_body<R: MemRead>(
        rdr: &mut R,
        rem: &mut u64,
        buf: &mut Option<Bytes>,
    ) -> io::Result<ChunkedState> {
        trace!("Chunked read, remaining={:?}", rem);

        // cap remaining bytes at the max capacity of usize
        let rem_cap = match *rem {
            r if r > usize::MAX as u64 => usize::MAX,
            r => r as usize,
        };

        let slice = rdr.read_mem(rem_cap)?;
        let count = slice.len();

        if count == 0 {
            *rem = 0;
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, IncompleteBody));
        }
        *buf = Some(slice);
        *rem -= count as u64;

        if *rem > 0 {
            Ok(ChunkedState::Body)
        } else {
            Ok(ChunkedState::BodyCr)
        }
    }

    fn read_body_cr<R: MemRead>(rdr: &mut R) -> io::Result<ChunkedState> {
        match byte!(rdr) {
            b'\r' => Ok(ChunkedState::BodyLf),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk body CR",
            )),
        }
    }

    fn read_body_lf<R: MemRead>(rdr: &mut R) -> io::Result<ChunkedState> {
        match byte!(rdr) {
            b'\n' => Ok(ChunkedState::Start),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk body LF",
            )),
        }
    }

    fn read_trailer<R: MemRead>(
        rdr: &mut R,
        trailers_buf: &mut Option<BytesMut>,
        max_trailer_size: usize,
    ) -> io::Result<ChunkedState> {
        trace!("read_trailer");
        let byte = byte!(rdr);

        put_u8!(
            trailers_buf.as_mut().expect("trailers_buf is None"),
            byte,
            max_trailer_size
        );

        match byte {
            b'\r' => Ok(ChunkedState::TrailerLf),
            _ => Ok(ChunkedState::Trailer),
        }
    }

    fn read_trailer_lf<R: MemRead>(
        rdr: &mut R,
        trailers_buf: &mut Option<BytesMut>,
        trailers_cnt: &mut usize,
        max_trailers: usize,
        max_trailer_size: usize,
    ) -> io::Result<ChunkedState> {
        let byte = byte!(rdr);
        match byte {
            b'\n' => {
                if *trailers_cnt >= max_trailers {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "chunk trailers count overflow",
                    ));
                }
                *trailers_cnt += 1;

                put_u8!(
                    trailers_buf.as_mut().expect("trailers_buf is None"),
                    byte,
                    max_trailer_size
                );

                Ok(ChunkedState::EndCr)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid trailer end LF",
            )),
        }
    }

    fn read_end_cr<R: MemRead>(
        rdr: &mut R,
        trailers_buf: &mut Option<BytesMut>,
        max_trailer_size: usize,
    ) -> io::Result<ChunkedState> {
        let byte = byte!(rdr);
        match byte {
            b'\r' => {
                if let Some(trailers_buf) = trailers_buf {
                    put_u8!(trailers_buf, byte, max_trailer_size);
                }
                Ok(ChunkedState::EndLf)
            }
            byte => {
                match trailers_buf {
                    None => {
                        // 64 will fit a single Expires header without reallocating
                        let mut buf = BytesMut::with_capacity(64);
                        buf.put_u8(byte);
                        *trailers_buf = Some(buf);
                    }
                    Some(ref mut trailers_buf) => {
                        put_u8!(trailers_buf, byte, max_trailer_size);
                    }
                }

                Ok(ChunkedState::Trailer)
            }
        }
    }

    fn read_end_lf<R: MemRead>(
        rdr: &mut R,
        trailers_buf: &mut Option<BytesMut>,
        max_trailer_size: usize,
    ) -> io::Result<ChunkedState> {
        let byte = byte!(rdr);
        match byte {
            b'\n' => {
                if let Some(trailers_buf) = trailers_buf {
                    put_u8!(trailers_buf, byte, max_trailer_size);
                }
                Ok(ChunkedState::End)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk end LF",
            )),
        }
    }
}

fn decode_trailers(buf: &mut BytesMut, count: usize) -> io::Result<HeaderMap> {
    let mut trailers = HeaderMap::new();
    let mut headers = vec![httparse::EMPTY_HEADER; count];
    let res = httparse::parse_headers(buf, &mut headers);
    match res {
        Ok(httparse::Status::Complete((_, headers))) => {
            for header in headers.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Invalid trailer name: {:?}", &header),
                    )
                })?;
                let value = HeaderValue::from_bytes(header.value).map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Invalid trailer value: {:?}", &header),
                    )
                })?;
                trailers.append(name, value);
            }
            Ok(trailers)
        }
        Ok(httparse::Status::Partial) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Partial trailer block",
        )),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
    }
}

#[derive(Debug)]
struct IncompleteBody;

impl fmt::Display for IncompleteBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "end of file before message length reached")
    }
}

impl StdError for IncompleteBody {}

#[cfg(test)]
mod tests {
    use super::*;

    impl MemRead for &[u8] {
        fn read_mem(&mut self, len: usize) -> io::Result<Bytes> {
            let n = std::cmp::min(len, self.len());
            let (a, b) = self.split_at(n);
            let buf = Bytes::copy_from_slice(a);
            *self = b;
            Ok(buf)
        }
    }

    fn drain(decoder: &mut Decoder, mut body: &[u8]) -> io::Result<(Vec<u8>, Option<HeaderMap>)> {
        let mut out = Vec::new();
        loop {
            match decoder.decode(&mut body)? {
                BodyFrame::Data(data) if data.is_empty() => return Ok((out, None)),
                BodyFrame::Data(data) => out.extend_from_slice(&data),
                BodyFrame::Trailers(map) => return Ok((out, Some(map))),
            }
        }
    }

    #[test]
    fn test_read_chunk_size() {
        let _ = pretty_env_logger::try_init();

        fn read_ok(s: &str) -> u64 {
            let mut decoder = Decoder::chunked(100, 8190);
            let (out, _) = drain(&mut decoder, s.as_bytes()).expect(s);
            out.len() as u64
        }
        fn read_err(s: &str) {
            let mut decoder = Decoder::chunked(100, 8190);
            drain(&mut decoder, s.as_bytes()).unwrap_err();
        }

        assert_eq!(read_ok("1\r\nb\r\n0\r\n\r\n"), 1);
        assert_eq!(read_ok("01\r\nb\r\n0\r\n\r\n"), 1);
        assert_eq!(read_ok("0\r\n\r\n"), 0);
        assert_eq!(read_ok("a\r\naaaaaaaaaa\r\n0\r\n\r\n"), 10);
        assert_eq!(read_ok("A\r\naaaaaaaaaa\r\n0\r\n\r\n"), 10);
        // chunk size with an ignored extension
        assert_eq!(read_ok("1;extension\r\nb\r\n0\r\n\r\n"), 1);
        // white space after the size
        assert_eq!(read_ok("1 \r\nb\r\n0\r\n\r\n"), 1);

        // empty size field
        read_err("\r\n\r\n");
        // not hex
        read_err("x\r\n\r\n");
        read_err("1x\r\n\r\n");
        // LF in an extension
        read_err("1;bad\next\r\nb\r\n0\r\n\r\n");
        // overflow
        read_err("ffffffffffffffff1\r\n\r\n");
        // digits after LWS
        read_err("1 1\r\nbb\r\n0\r\n\r\n");
    }

    #[test]
    fn test_chunked_body_and_leftover() {
        let mut body: &[u8] = b"5\r\nhello\r\n0\r\n\r\nGET /next";
        let mut decoder = Decoder::chunked(100, 8190);
        let mut out = Vec::new();
        loop {
            match decoder.decode(&mut body).unwrap() {
                BodyFrame::Data(data) if data.is_empty() => break,
                BodyFrame::Data(data) => out.extend_from_slice(&data),
                BodyFrame::Trailers(_) => panic!("no trailers sent"),
            }
        }
        assert_eq!(out, b"hello");
        assert!(decoder.is_eof());
        // pipelined bytes remain on the source for the caller
        assert_eq!(body, b"GET /next");
    }

    #[test]
    fn test_chunked_trailers() {
        let mut decoder = Decoder::chunked(100, 8190);
        let body: &[u8] = b"5\r\nhello\r\n0\r\nExpires: never\r\nX-More: yes\r\n\r\n";
        let (out, trailers) = drain(&mut decoder, body).unwrap();
        assert_eq!(out, b"hello");
        let trailers = trailers.expect("trailers");
        assert_eq!(trailers.get("expires").unwrap(), "never");
        assert_eq!(trailers.get("x-more").unwrap(), "yes");
    }

    #[test]
    fn test_trailer_limits() {
        // too many trailer fields
        let mut decoder = Decoder::chunked(1, 8190);
        let body: &[u8] = b"0\r\nA: 1\r\nB: 2\r\n\r\n";
        drain(&mut decoder, body).unwrap_err();

        // oversized trailer section
        let mut decoder = Decoder::chunked(100, 16);
        let body: &[u8] = b"0\r\nA-Very-Long-Name: with a very long value\r\n\r\n";
        drain(&mut decoder, body).unwrap_err();
    }

    #[test]
    fn test_length_decoder() {
        let mut decoder = Decoder::length(5);
        let (out, _) = drain(&mut decoder, b"hello leftover").unwrap();
        assert_eq!(out, b"hello");

        // early EOF is an error, not silent truncation
        let mut decoder = Decoder::length(10);
        drain(&mut decoder, b"short").unwrap_err();
    }

    #[test]
    fn test_eof_in_chunk_data() {
        let mut decoder = Decoder::chunked(100, 8190);
        drain(&mut decoder, b"5\r\nhe").unwrap_err();
    }
}
