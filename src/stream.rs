// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Buffered bidirectional I/O over a socket-like transport.
//!
//! `ByteStream` is the only object in the crate that touches the transport.
//! Reads go through a fixed-capacity input buffer; the slice between the
//! read index and the write end is the *window*, and the parser works
//! directly over it without copying. The input buffer can be swapped out
//! wholesale so that a request's bytes end up inside the buffer that the
//! `Request` object owns.
//!
//! Writes accumulate into an output buffer and only reach the transport on
//! `flush`.

use std::io;
use std::io::Read;
use std::io::Write;

use log::trace;

use crate::ParseError;

/// Default capacity of the input and output buffers, and of every
/// `Request` buffer handed out by the pool.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A bidirectional byte transport. Blanket-implemented for anything that
/// can read and write; the server feeds `TcpStream`s through this, tests
/// feed in-memory pipes.
pub trait Transport: Read + Write + Send {}

impl<T> Transport for T where T: Read + Write + Send {}

/// Buffered reader/writer over a `Transport`.
///
/// Reads and writes on the same stream are strictly serialized: the stream
/// has a single owner at any point in time, and that owner decides when to
/// fill and when to flush.
pub struct ByteStream {
    transport: Option<Box<dyn Transport>>,

    // Input side. `input.len()` is the buffer capacity; the readable
    // window is `input[read_index .. write_end]`.
    input: Vec<u8>,
    read_index: usize,
    write_end: usize,

    // When set, `read_into` bypasses the input buffer entirely and reads
    // from the transport straight into the caller's slice. Used while
    // spooling large bodies to disk.
    unbuffered: bool,

    // Output side. The write cursor is `output.len()`.
    output: Vec<u8>,
}

impl ByteStream {
    /// Creates a detached stream with the given input buffer capacity.
    pub fn new(capacity: usize) -> ByteStream {
        ByteStream {
            transport: None,
            input: vec![0; capacity],
            read_index: 0,
            write_end: 0,
            unbuffered: false,
            output: Vec::with_capacity(1024),
        }
    }

    /// Hands the stream a transport to read from and write to.
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    /// Takes the transport back, leaving the stream detached. Buffered
    /// input that has not been consumed stays in the window.
    pub fn detach(&mut self) -> Option<Box<dyn Transport>> {
        self.transport.take()
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    /// Capacity of the input buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.input.len()
    }

    /// Number of readable bytes currently in the window.
    #[inline]
    pub fn amount_buffered(&self) -> usize {
        self.write_end - self.read_index
    }

    /// The current readable window, without advancing the read index.
    #[inline]
    pub fn read_buffered(&self) -> &[u8] {
        &self.input[self.read_index..self.write_end]
    }

    /// Advances the read index past `amount` bytes of the window.
    #[inline]
    pub fn consume(&mut self, amount: usize) {
        debug_assert!(self.read_index + amount <= self.write_end);
        self.read_index += amount;
    }

    /// Pulls bytes from the transport into the free tail of the input
    /// buffer and returns how many arrived.
    ///
    /// Returns `EndOfBuffer` when the tail is full (the caller must shift
    /// or swap first) and `EndOfStream` when the peer has closed.
    pub fn fill(&mut self) -> Result<usize, ParseError> {
        if self.write_end == self.input.len() {
            return Err(ParseError::EndOfBuffer);
        }

        let transport = self.transport.as_mut().ok_or(ParseError::EndOfStream)?;
        match transport.read(&mut self.input[self.write_end..]) {
            Ok(0) => Err(ParseError::EndOfStream),
            Ok(n) => {
                trace!("filled {} bytes from transport", n);
                self.write_end += n;
                Ok(n)
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(ParseError::Io(e)),
        }
    }

    /// Moves the bytes in `[from, write_end)` to the start of the buffer,
    /// then fills. The parser uses this when its current parse position
    /// must remain addressable but the buffer has run out of tail space.
    pub fn shift_and_fill(&mut self, from: usize) -> Result<usize, ParseError> {
        self.shift(from);
        self.fill()
    }

    /// The memmove half of `shift_and_fill`, without the refill. Called
    /// between requests so the next request head starts at offset zero.
    pub fn shift(&mut self, from: usize) {
        debug_assert!(from <= self.read_index);
        if from == 0 {
            return;
        }
        self.input.copy_within(from..self.write_end, 0);
        self.read_index -= from;
        self.write_end -= from;
    }

    /// Shifts the unread window to the start of the buffer.
    #[inline]
    pub fn compact(&mut self) {
        self.shift(self.read_index);
    }

    /// Pops one byte off the window, or fails with `EndOfBuffer` if the
    /// window is empty.
    #[inline]
    pub fn read_u8_safe(&mut self) -> Result<u8, ParseError> {
        if self.read_index == self.write_end {
            return Err(ParseError::EndOfBuffer);
        }
        let b = self.input[self.read_index];
        self.read_index += 1;
        Ok(b)
    }

    /// Pops one byte off the window. The caller has already checked
    /// `amount_buffered`.
    #[inline]
    pub fn read_u8_unsafe(&mut self) -> u8 {
        debug_assert!(self.read_index < self.write_end);
        let b = self.input[self.read_index];
        self.read_index += 1;
        b
    }

    /// Advances the read index until `pred` returns true for a byte and
    /// returns that terminator byte (consumed). Fails with `EndOfBuffer`
    /// if the window is exhausted first.
    pub fn read_until_expr<P>(&mut self, mut pred: P) -> Result<u8, ParseError>
    where
        P: FnMut(u8) -> bool,
    {
        while self.read_index < self.write_end {
            let b = self.input[self.read_index];
            self.read_index += 1;
            if pred(b) {
                return Ok(b);
            }
        }
        Err(ParseError::EndOfBuffer)
    }

    /// Substitutes the owned input buffer, carrying the unread window over
    /// into the start of the new buffer, and returns the old one.
    ///
    /// This is how the parser arranges for request bytes to land directly
    /// in the `Request`'s own storage: swap the request buffer in before
    /// parsing, swap it back out once the request is complete.
    pub fn swap_input_buffer(&mut self, mut new: Vec<u8>) -> Vec<u8> {
        let window = self.write_end - self.read_index;
        debug_assert!(window <= new.len());
        let carried = window.min(new.len());
        new[..carried].copy_from_slice(&self.input[self.read_index..self.read_index + carried]);

        let old = std::mem::replace(&mut self.input, new);
        self.read_index = 0;
        self.write_end = carried;
        old
    }

    /// Switches direct-to-destination reading on or off.
    #[inline]
    pub fn set_unbuffered(&mut self, unbuffered: bool) {
        self.unbuffered = unbuffered;
    }

    #[inline]
    pub fn is_unbuffered(&self) -> bool {
        self.unbuffered
    }

    /// Reads into `dst`, draining the buffered window first. In unbuffered
    /// mode any remaining demand goes straight from the transport into
    /// `dst` without touching the input buffer.
    pub fn read_into(&mut self, dst: &mut [u8]) -> Result<usize, ParseError> {
        let buffered = self.amount_buffered();
        if buffered > 0 {
            let n = buffered.min(dst.len());
            dst[..n].copy_from_slice(&self.input[self.read_index..self.read_index + n]);
            self.read_index += n;
            return Ok(n);
        }

        if !self.unbuffered {
            let n = self.fill()?;
            let n = n.min(dst.len());
            dst[..n].copy_from_slice(&self.input[self.read_index..self.read_index + n]);
            self.read_index += n;
            return Ok(n);
        }

        let transport = self.transport.as_mut().ok_or(ParseError::EndOfStream)?;
        loop {
            match transport.read(dst) {
                Ok(0) => return Err(ParseError::EndOfStream),
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ParseError::Io(e)),
            }
        }
    }

    /// Appends bytes to the output buffer. Nothing reaches the transport
    /// until `flush`.
    #[inline]
    pub fn write(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    /// Appends a big-endian 16-bit integer to the output buffer.
    #[inline]
    pub fn write_u16_big(&mut self, value: u16) {
        self.output.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a big-endian 64-bit integer to the output buffer.
    #[inline]
    pub fn write_u64_big(&mut self, value: u64) {
        self.output.extend_from_slice(&value.to_be_bytes());
    }

    /// Number of bytes waiting in the output buffer.
    #[inline]
    pub fn amount_pending(&self) -> usize {
        self.output.len()
    }

    /// Drains the output buffer to the transport. Must be called before
    /// the connection goes back to waiting on the peer, so that response
    /// bytes are not withheld by buffering.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.output.is_empty() {
            return Ok(());
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream is detached"))?;
        transport.write_all(&self.output)?;
        transport.flush()?;
        trace!("flushed {} bytes to transport", self.output.len());
        self.output.clear();
        Ok(())
    }

    /// Clears all buffered state and drops the transport, keeping the
    /// allocated buffers for reuse by the pool.
    pub fn reset(&mut self) {
        self.transport = None;
        self.read_index = 0;
        self.write_end = 0;
        self.unbuffered = false;
        self.output.clear();
    }

    // Raw window access for the in-place chunked-body decoder.

    #[inline]
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.input
    }

    #[inline]
    pub(crate) fn window_bounds(&self) -> (usize, usize) {
        (self.read_index, self.write_end)
    }

    #[inline]
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.input
    }

    #[inline]
    pub(crate) fn set_window(&mut self, start: usize, end: usize) {
        debug_assert!(start <= end && end <= self.input.len());
        self.read_index = start;
        self.write_end = end;
    }
}

impl Write for ByteStream {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        ByteStream::flush(self)
    }
}

#[cfg(test)]
mod tests {
    use super::ByteStream;
    use super::DEFAULT_BUFFER_SIZE;
    use crate::ParseError;
    use std::io;
    use std::io::Read;
    use std::io::Write;

    // A transport reading from a canned script and recording writes.
    struct Mock {
        input: io::Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Mock {
        fn new(input: &[u8]) -> Mock {
            Mock {
                input: io::Cursor::new(input.to_vec()),
                written: Vec::new(),
            }
        }
    }

    impl Read for Mock {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Mock {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fill_and_window() {
        let mut stream = ByteStream::new(DEFAULT_BUFFER_SIZE);
        stream.attach(Box::new(Mock::new(b"hello world")));

        let n = stream.fill().unwrap();
        assert_eq!(n, 11);
        assert_eq!(stream.read_buffered(), b"hello world");

        stream.consume(6);
        assert_eq!(stream.read_buffered(), b"world");
        assert_eq!(stream.amount_buffered(), 5);
    }

    #[test]
    fn fill_reports_end_of_stream() {
        let mut stream = ByteStream::new(64);
        stream.attach(Box::new(Mock::new(b"")));
        assert!(matches!(stream.fill(), Err(ParseError::EndOfStream)));
    }

    #[test]
    fn fill_reports_full_buffer() {
        let mut stream = ByteStream::new(4);
        stream.attach(Box::new(Mock::new(b"abcdefgh")));
        stream.fill().unwrap();
        assert!(matches!(stream.fill(), Err(ParseError::EndOfBuffer)));
    }

    #[test]
    fn shift_and_fill_makes_room() {
        let mut stream = ByteStream::new(8);
        stream.attach(Box::new(Mock::new(b"abcdefghij")));
        stream.fill().unwrap();
        assert_eq!(stream.read_buffered(), b"abcdefgh");

        stream.consume(4);
        let n = stream.shift_and_fill(4).unwrap();
        assert_eq!(n, 2);
        assert_eq!(stream.read_buffered(), b"efghij");
    }

    #[test]
    fn read_until_expr_consumes_terminator() {
        let mut stream = ByteStream::new(64);
        stream.attach(Box::new(Mock::new(b"abc:def")));
        stream.fill().unwrap();

        let term = stream.read_until_expr(|b| b == b':').unwrap();
        assert_eq!(term, b':');
        assert_eq!(stream.read_buffered(), b"def");
    }

    #[test]
    fn swap_carries_the_window() {
        let mut stream = ByteStream::new(64);
        stream.attach(Box::new(Mock::new(b"GET / HTTP/1.1\r\n")));
        stream.fill().unwrap();
        stream.consume(4);

        let replacement = vec![0; 64];
        let old = stream.swap_input_buffer(replacement);
        assert_eq!(old.len(), 64);
        assert_eq!(stream.read_buffered(), b"/ HTTP/1.1\r\n");
    }

    #[test]
    fn unbuffered_read_bypasses_buffer() {
        let mut stream = ByteStream::new(8);
        stream.attach(Box::new(Mock::new(b"0123456789abcdef")));
        stream.fill().unwrap();
        stream.set_unbuffered(true);

        // Drains the window first.
        let mut dst = [0u8; 16];
        let n = stream.read_into(&mut dst).unwrap();
        assert_eq!(&dst[..n], b"01234567");

        // Then reads straight from the transport.
        let n = stream.read_into(&mut dst).unwrap();
        assert_eq!(&dst[..n], b"89abcdef");
        assert_eq!(stream.amount_buffered(), 0);
    }

    // A write-only transport sharing its sink with the test body.
    #[derive(Clone)]
    struct SharedSink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Read for SharedSink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_path_buffers_until_flush() {
        let sink = SharedSink(Default::default());
        let mut stream = ByteStream::new(64);
        stream.attach(Box::new(sink.clone()));

        stream.write(b"HTTP/1.1 200 OK\r\n");
        stream.write_u16_big(0x0102);
        assert_eq!(stream.amount_pending(), 19);
        assert!(sink.0.lock().unwrap().is_empty());

        stream.flush().unwrap();
        assert_eq!(stream.amount_pending(), 0);
        assert_eq!(&*sink.0.lock().unwrap(), b"HTTP/1.1 200 OK\r\n\x01\x02");
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut stream = ByteStream::new(32);
        stream.attach(Box::new(Mock::new(b"leftovers")));
        stream.fill().unwrap();
        stream.write(b"pending");

        stream.reset();
        assert!(!stream.is_attached());
        assert_eq!(stream.amount_buffered(), 0);
        assert_eq!(stream.amount_pending(), 0);
        assert_eq!(stream.capacity(), 32);
    }
}
