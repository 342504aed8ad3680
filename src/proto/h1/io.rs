use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};

use super::decode::MemRead;

/// The initial (and growth) size of the read buffer.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

/// A blocking transport with a pull-through read buffer.
///
/// The parser consumes lines straight out of `read_buf`; the body decoder
/// pulls through [`MemRead`], draining buffered bytes before touching the
/// socket again. Leftover bytes after a message belong to the next
/// pipelined request and stay in the buffer.
#[derive(Debug)]
pub(crate) struct Buffered<S> {
    io: S,
    read_buf: BytesMut,
}

impl<S: Read + Write> Buffered<S> {
    pub(crate) fn new(io: S) -> Buffered<S> {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
        }
    }

    pub(crate) fn get_ref(&self) -> &S {
        &self.io
    }

    pub(crate) fn read_buf(&self) -> &[u8] {
        &self.read_buf
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Read more bytes from the transport into the buffer.
    ///
    /// Returns the number of new bytes; 0 means EOF.
    pub(crate) fn fill_read_buf(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; INIT_BUFFER_SIZE];
        let n = self.io.read(&mut chunk)?;
        self.read_buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    pub(crate) fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.io.write_all(data)
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.io.flush()
    }
}

impl<S: Read + Write> MemRead for Buffered<S> {
    fn read_mem(&mut self, n: usize) -> io::Result<Bytes> {
        if self.read_buf.is_empty() {
            if self.fill_read_buf()? == 0 {
                return Ok(Bytes::new());
            }
        }
        let take = std::cmp::min(n, self.read_buf.len());
        Ok(self.read_buf.split_to(take).freeze())
    }
}

impl<S: Read + Write> Write for Buffered<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.io.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // a transport that hands out one byte at a time
    struct Trickle(Vec<u8>, usize);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.1 >= self.0.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.0[self.1];
            self.1 += 1;
            Ok(1)
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_mem_read_drains_buffer_first() {
        let mut io = Buffered::new(Trickle(b"abcdef".to_vec(), 0));
        io.read_buf_mut().extend_from_slice(b"xy");
        assert_eq!(&io.read_mem(1).unwrap()[..], b"x");
        assert_eq!(&io.read_mem(10).unwrap()[..], b"y");
        // buffer empty, next read hits the transport
        assert_eq!(&io.read_mem(10).unwrap()[..], b"a");
    }

    #[test]
    fn test_mem_read_eof() {
        let mut io = Buffered::new(Trickle(Vec::new(), 0));
        assert!(io.read_mem(10).unwrap().is_empty());
    }
}
