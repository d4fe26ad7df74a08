// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The HTTP/1.x request parser.
//!
//! `parse_head` runs over the stream's current window without copying a
//! byte: every parsed field is a span into the buffer, which the
//! connection driver has swapped to be the `Request`'s own storage. On a
//! partial parse it reports `EndOfBuffer`; the driver shifts and refills
//! and calls it again from offset zero, so the retry sees the same head
//! with more bytes behind it.
//!
//! Body reading has two fixed modes (in place, or spooled to an atomic
//! temp file once past the spool threshold) plus chunked decoding, which
//! compacts chunk payloads in place toward the start of the body region.

use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use log::debug;
use memchr::memchr;

use crate::ascii;
use crate::request::Content;
use crate::request::HttpVersion;
use crate::request::Method;
use crate::request::Request;
use crate::request::Scheme;
use crate::request::SpooledFile;
use crate::stream::ByteStream;
use crate::Config;
use crate::HeaderMap;
use crate::ParseError;
use crate::Span;

/// Everything learned from the request line and header block.
pub(crate) struct Head {
    pub method: Method,
    pub version: HttpVersion,
    pub scheme: Scheme,
    pub uri: Span,
    pub host: Span,
    pub path: Span,
    pub query: Span,
    pub head: Span,
    pub content_length: Option<u64>,
    pub chunked: bool,
    /// Bytes consumed from the start of the buffer, head terminator
    /// included.
    pub consumed: usize,
}

impl Head {
    pub(crate) fn apply(self, request: &mut Request) {
        request.method = self.method;
        request.version = self.version;
        request.scheme = self.scheme;
        request.uri = self.uri;
        request.host = self.host;
        request.path = self.path;
        request.query = self.query;
        request.head = self.head;
        request.content_length = self.content_length;
        request.chunked = self.chunked;
    }
}

// Little-endian views of the first four method bytes.
const WORD_GET: u32 = u32::from_le_bytes(*b"GET ");
const WORD_PUT: u32 = u32::from_le_bytes(*b"PUT ");
const WORD_POST: u32 = u32::from_le_bytes(*b"POST");
const WORD_HEAD: u32 = u32::from_le_bytes(*b"HEAD");
const WORD_PATC: u32 = u32::from_le_bytes(*b"PATC");
const WORD_DELE: u32 = u32::from_le_bytes(*b"DELE");
const WORD_OPTI: u32 = u32::from_le_bytes(*b"OPTI");

// Bounds check inside the request line. Failing it means either "feed me
// more bytes" or, when the line already fills the allowance, 414.
#[inline]
fn need(
    buf: &[u8],
    pos: usize,
    amount: usize,
    line_start: usize,
    max_line: usize,
) -> Result<(), ParseError> {
    if pos + amount <= buf.len() {
        Ok(())
    } else if buf.len() - line_start >= max_line {
        Err(ParseError::RequestUriTooLong)
    } else {
        Err(ParseError::EndOfBuffer)
    }
}

#[inline]
fn expect(
    buf: &[u8],
    pos: usize,
    expected: &[u8],
    line_start: usize,
    max_line: usize,
) -> Result<(), ParseError> {
    need(buf, pos, expected.len(), line_start, max_line)?;
    if &buf[pos..pos + expected.len()] == expected {
        Ok(())
    } else {
        Err(ParseError::BadRequest)
    }
}

/// Parses the request line and header block at the start of `buf`.
///
/// `headers` is reset and filled with spans into `buf`. A result of
/// `EndOfBuffer` means the head is incomplete; the caller makes room,
/// refills, and retries with the head re-anchored at offset zero.
pub(crate) fn parse_head(
    buf: &[u8],
    headers: &mut HeaderMap,
    config: &Config,
) -> Result<Head, ParseError> {
    headers.reset();
    let mut pos = 0;

    // Tolerate at most one blank line left over from the previous
    // keep-alive request.
    match buf.first() {
        Some(&b'\r') => {
            if buf.len() < 2 {
                return Err(ParseError::EndOfBuffer);
            }
            if buf[1] != b'\n' {
                return Err(ParseError::BadRequest);
            }
            pos = 2;
        }
        Some(&b'\n') => pos = 1,
        Some(_) => {}
        None => return Err(ParseError::EndOfBuffer),
    }

    let line_start = pos;
    let max_line = config.max_request_line_size;

    // Method: match the first four bytes as a little-endian word.
    need(buf, pos, 4, line_start, max_line)?;
    let word = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
    let method = match word {
        WORD_GET => {
            pos += 4;
            Method::Get
        }
        WORD_PUT => {
            pos += 4;
            Method::Put
        }
        WORD_POST => {
            expect(buf, pos + 4, b" ", line_start, max_line)?;
            pos += 5;
            Method::Post
        }
        WORD_HEAD => {
            expect(buf, pos + 4, b" ", line_start, max_line)?;
            pos += 5;
            Method::Head
        }
        WORD_PATC => {
            expect(buf, pos + 4, b"H ", line_start, max_line)?;
            pos += 6;
            Method::Patch
        }
        WORD_DELE => {
            expect(buf, pos + 4, b"TE ", line_start, max_line)?;
            pos += 7;
            Method::Delete
        }
        WORD_OPTI => {
            expect(buf, pos + 4, b"ONS ", line_start, max_line)?;
            pos += 8;
            Method::Options
        }
        _ => return Err(ParseError::BadRequest),
    };

    // Request target. Three forms are recognised; authority form is not.
    need(buf, pos, 1, line_start, max_line)?;
    let uri_start = pos;
    let mut scheme = Scheme::Unknown;
    let mut host = Span::default();
    let (path, query) = match buf[pos] {
        b'/' => parse_path_query(buf, &mut pos, line_start, max_line)?,
        b'*' => {
            need(buf, pos, 2, line_start, max_line)?;
            if buf[pos + 1] != b' ' {
                return Err(ParseError::BadRequest);
            }
            let star = Span::new(pos, pos + 1);
            pos += 2;
            (star, Span::default())
        }
        b'h' | b'H' => {
            need(buf, pos, 4, line_start, max_line)?;
            if !buf[pos..pos + 4].eq_ignore_ascii_case(b"http") {
                return Err(ParseError::BadRequest);
            }
            pos += 4;
            need(buf, pos, 1, line_start, max_line)?;
            scheme = Scheme::Http;
            if buf[pos] == b's' || buf[pos] == b'S' {
                scheme = Scheme::Https;
                pos += 1;
            }
            expect(buf, pos, b"://", line_start, max_line)?;
            pos += 3;

            let host_start = pos;
            loop {
                need(buf, pos, 1, line_start, max_line)?;
                if !ascii::is_host_char(buf[pos]) {
                    break;
                }
                pos += 1;
            }
            if pos == host_start {
                return Err(ParseError::BadRequest);
            }
            host = Span::new(host_start, pos);

            if buf[pos] == b':' {
                pos += 1;
                let digits_start = pos;
                loop {
                    need(buf, pos, 1, line_start, max_line)?;
                    if !ascii::is_digit(buf[pos]) {
                        break;
                    }
                    pos += 1;
                    if pos - digits_start > 5 {
                        return Err(ParseError::BadRequest);
                    }
                }
                if pos == digits_start {
                    return Err(ParseError::BadRequest);
                }
            }

            need(buf, pos, 1, line_start, max_line)?;
            if buf[pos] != b'/' {
                return Err(ParseError::BadRequest);
            }
            parse_path_query(buf, &mut pos, line_start, max_line)?
        }
        _ => return Err(ParseError::BadRequest),
    };
    let uri = Span::new(uri_start, pos - 1);

    // Version: exactly "HTTP/" then one of the four known numbers.
    need(buf, pos, 8, line_start, max_line)?;
    if &buf[pos..pos + 5] != b"HTTP/" {
        return Err(ParseError::UnsupportedHttpVersion);
    }
    let version = match &buf[pos + 5..pos + 8] {
        b"1.0" => HttpVersion::Http1_0,
        b"1.1" => HttpVersion::Http1_1,
        b"2.0" => HttpVersion::Http2_0,
        b"3.0" => HttpVersion::Http3_0,
        _ => return Err(ParseError::UnsupportedHttpVersion),
    };
    pos += 8;

    // Line terminator: optional CR, required LF.
    need(buf, pos, 1, line_start, max_line)?;
    if buf[pos] == b'\r' {
        pos += 1;
        need(buf, pos, 1, line_start, max_line)?;
    }
    if buf[pos] != b'\n' {
        return Err(ParseError::BadRequest);
    }
    pos += 1;

    if pos - line_start > max_line {
        return Err(ParseError::RequestUriTooLong);
    }

    let header_end = headers.parse(buf, pos, config.max_header_size)?;

    let (content_length, chunked) = body_plan(headers, buf, config)?;

    Ok(Head {
        method,
        version,
        scheme,
        uri,
        host,
        path,
        query,
        head: Span::new(line_start, header_end),
        content_length,
        chunked,
        consumed: header_end,
    })
}

// Path and optional query of the request target. `pos` ends up just past
// the terminating space.
fn parse_path_query(
    buf: &[u8],
    pos: &mut usize,
    line_start: usize,
    max_line: usize,
) -> Result<(Span, Span), ParseError> {
    let path_start = *pos;
    loop {
        need(buf, *pos, 1, line_start, max_line)?;
        match buf[*pos] {
            b' ' => {
                let path = Span::new(path_start, *pos);
                *pos += 1;
                return Ok((path, Span::default()));
            }
            b'?' => break,
            b if ascii::is_graph(b) => *pos += 1,
            _ => return Err(ParseError::BadRequest),
        }
    }

    let path = Span::new(path_start, *pos);
    *pos += 1;
    let query_start = *pos;
    loop {
        need(buf, *pos, 1, line_start, max_line)?;
        match buf[*pos] {
            b' ' => {
                let query = Span::new(query_start, *pos);
                *pos += 1;
                return Ok((path, query));
            }
            b if ascii::is_graph(b) => *pos += 1,
            _ => return Err(ParseError::BadRequest),
        }
    }
}

// Works out how the body will arrive from the parsed headers, enforcing
// the Content-Length / Transfer-Encoding rules.
fn body_plan(
    headers: &HeaderMap,
    buf: &[u8],
    config: &Config,
) -> Result<(Option<u64>, bool), ParseError> {
    let mut first_raw: Option<&[u8]> = None;
    let mut content_length: Option<u64> = None;
    let mut chunked = false;

    for (name, value) in headers.iter(buf) {
        if name.eq_ignore_ascii_case("content-length") {
            match first_raw {
                None => {
                    if value.is_empty() || !value.iter().all(|&b| ascii::is_digit(b)) {
                        return Err(ParseError::BadRequest);
                    }
                    let parsed = atoi::atoi::<u64>(value).ok_or(ParseError::BadRequest)?;
                    first_raw = Some(value);
                    content_length = Some(parsed);
                }
                // Duplicates with the same bytes keep the first; anything
                // else is a smuggling attempt.
                Some(first) => {
                    if first != value {
                        return Err(ParseError::BadRequest);
                    }
                }
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            if value
                .split(|&b| b == b',')
                .any(|enc| trim_ascii(enc).eq_ignore_ascii_case(b"chunked"))
            {
                chunked = true;
            } else {
                // An encoding we cannot undo.
                return Err(ParseError::BadRequest);
            }
        }
    }

    if chunked && content_length.is_some() {
        return Err(ParseError::BadRequest);
    }
    if let Some(n) = content_length {
        if n > config.max_content_length {
            return Err(ParseError::RequestEntityTooLarge);
        }
    }

    Ok((content_length, chunked))
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = bytes.len();
    while start < end && (bytes[start] == b' ' || bytes[start] == b'\t') {
        start += 1;
    }
    while end > start && (bytes[end - 1] == b' ' || bytes[end - 1] == b'\t') {
        end -= 1;
    }
    &bytes[start..end]
}

/// Reads the request body off the stream according to the parsed head.
///
/// Expects the stream's input buffer to be the request's storage, with the
/// head already consumed, so the body region begins at the read index.
pub(crate) fn read_body(
    stream: &mut ByteStream,
    request: &mut Request,
    config: &Config,
) -> Result<(), ParseError> {
    if request.chunked {
        return read_chunked_body(stream, request, config);
    }

    match request.content_length {
        None | Some(0) => {
            request.content = None;
            request.read_finished = true;
            Ok(())
        }
        Some(n) => read_fixed_body(stream, request, config, n),
    }
}

fn read_fixed_body(
    stream: &mut ByteStream,
    request: &mut Request,
    config: &Config,
    length: u64,
) -> Result<(), ParseError> {
    let (body_start, _) = stream.window_bounds();
    let capacity = stream.capacity() as u64;

    let fits = body_start as u64 + length <= capacity;
    if length <= config.spool_threshold && fits {
        let length = length as usize;
        let end_of_body = body_start + length;
        loop {
            let (_, write_end) = stream.window_bounds();
            if write_end >= end_of_body {
                break;
            }
            stream.fill()?;
        }
        request.content = Some(Content::Buffered(Span::new(body_start, end_of_body)));
        stream.consume(length);
        request.read_finished = true;
        return Ok(());
    }

    debug!("spooling {} byte body to disk", length);
    spool_body(stream, request, length)
}

// Large fixed bodies go to a temp file: the already-buffered portion is
// flushed out first, then the stream switches to unbuffered reads. The
// file is written completely and only then renamed into its final name,
// so no partially written spool is ever observable under that name.
fn spool_body(
    stream: &mut ByteStream,
    request: &mut Request,
    length: u64,
) -> Result<(), ParseError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".enclume-body.")
        .tempfile()
        .map_err(ParseError::Io)?;

    let mut remaining = length;

    let (read_index, write_end) = stream.window_bounds();
    let buffered = ((write_end - read_index) as u64).min(remaining) as usize;
    if buffered > 0 {
        let chunk = &stream.buffer()[read_index..read_index + buffered];
        tmp.write_all(chunk).map_err(ParseError::Io)?;
        stream.consume(buffered);
        remaining -= buffered as u64;
    }

    stream.set_unbuffered(true);
    let mut scratch = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(scratch.len() as u64) as usize;
        let got = match stream.read_into(&mut scratch[..want]) {
            Ok(got) => got,
            Err(e) => {
                stream.set_unbuffered(false);
                return Err(e);
            }
        };
        if let Err(e) = tmp.write_all(&scratch[..got]) {
            stream.set_unbuffered(false);
            return Err(ParseError::Io(e));
        }
        remaining -= got as u64;
    }
    stream.set_unbuffered(false);

    let path = tmp.path().with_extension("spool");
    let mut file = tmp.persist(&path).map_err(|e| ParseError::Io(e.error))?;
    file.seek(SeekFrom::Start(0)).map_err(ParseError::Io)?;

    request.content = Some(Content::Spooled(SpooledFile {
        file,
        path,
        len: length,
    }));
    request.read_finished = true;
    Ok(())
}

// Chunked transfer decoding, in place. Chunk payloads are compacted
// toward the start of the body region; the size lines and chunk
// terminators between them become dead bytes that can be reclaimed when
// the buffer runs full.
fn read_chunked_body(
    stream: &mut ByteStream,
    request: &mut Request,
    config: &Config,
) -> Result<(), ParseError> {
    let (body_start, _) = stream.window_bounds();
    let mut body_write = body_start;

    loop {
        // Locate the size line.
        let line_end = loop {
            let (read_index, write_end) = stream.window_bounds();
            if let Some(lf) = memchr(b'\n', &stream.buffer()[read_index..write_end]) {
                break read_index + lf;
            }
            grow_window(stream, body_write)?;
        };

        let (read_index, write_end) = stream.window_bounds();
        let mut line = &stream.buffer()[read_index..line_end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        // Chunk extensions after ';' are ignored.
        let digits = match memchr(b';', line) {
            Some(semi) => &line[..semi],
            None => line,
        };
        let size = ascii::parse_hex(trim_ascii(digits)).ok_or(ParseError::BadRequest)?;
        stream.set_window(line_end + 1, write_end);

        if size == 0 {
            // Trailing headers (possibly none) end the body.
            let mark = request.headers.len();
            loop {
                let (read_index, write_end) = stream.window_bounds();
                match request
                    .headers
                    .parse(stream.buffer(), read_index, config.max_header_size)
                {
                    Ok(end) => {
                        stream.set_window(end, write_end);
                        break;
                    }
                    Err(ParseError::EndOfBuffer) => {
                        request.headers.truncate(mark);
                        grow_window(stream, body_write)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            break;
        }

        let decoded = (body_write - body_start) as u64;
        if decoded + size > config.max_content_length {
            return Err(ParseError::RequestEntityTooLarge);
        }
        if body_start as u64 + decoded + size + 2 > stream.capacity() as u64 {
            // Too big to decode in place; chunked bodies are not spooled.
            return Err(ParseError::RequestEntityTooLarge);
        }
        let size = size as usize;

        // Payload plus its terminator.
        loop {
            let (read_index, write_end) = stream.window_bounds();
            if write_end - read_index >= size + 2 {
                break;
            }
            grow_window(stream, body_write)?;
        }

        let (read_index, write_end) = stream.window_bounds();
        stream
            .buffer_mut()
            .copy_within(read_index..read_index + size, body_write);
        body_write += size;

        let after = read_index + size;
        match stream.buffer()[after] {
            b'\r' => {
                if stream.buffer()[after + 1] != b'\n' {
                    return Err(ParseError::BadRequest);
                }
                stream.set_window(after + 2, write_end);
            }
            b'\n' => stream.set_window(after + 1, write_end),
            _ => return Err(ParseError::BadRequest),
        }
    }

    let decoded = body_write - body_start;
    request.content = if decoded > 0 {
        Some(Content::Buffered(Span::new(body_start, body_write)))
    } else {
        None
    };
    request.content_length = Some(decoded as u64);
    request.read_finished = true;
    Ok(())
}

// Makes the window larger: fill if there is tail space, otherwise reclaim
// the dead bytes between the decoded body and the window and fill then.
fn grow_window(stream: &mut ByteStream, reclaim_to: usize) -> Result<(), ParseError> {
    match stream.fill() {
        Ok(_) => Ok(()),
        Err(ParseError::EndOfBuffer) => {
            let (read_index, write_end) = stream.window_bounds();
            if read_index > reclaim_to {
                stream
                    .buffer_mut()
                    .copy_within(read_index..write_end, reclaim_to);
                stream.set_window(reclaim_to, reclaim_to + (write_end - read_index));
                stream
                    .fill()
                    .map(|_| ())
                    .map_err(|e| match e {
                        ParseError::EndOfBuffer => ParseError::RequestEntityTooLarge,
                        other => other,
                    })
            } else {
                Err(ParseError::RequestEntityTooLarge)
            }
        }
        Err(e) => Err(e),
    }
}
