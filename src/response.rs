// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The response object and its deferred writer.
//!
//! Nothing is transmitted while a handler mutates the response: status,
//! headers and body accumulate in memory. The head is emitted on the
//! first flush, and the send mode is decided at that moment: a declared
//! `Content-Length` gives fixed-length streaming, anything else switches
//! transparently to `Transfer-Encoding: chunked`. A handler that never
//! flushes gets the simplest treatment of all: one head with the exact
//! `Content-Length`, then the buffered body.

use std::borrow::Cow;
use std::error;
use std::fmt;
use std::io;
use std::io::Write;
use std::mem;
use std::time::SystemTime;

use log::debug;
use log::warn;

use crate::headers::HeaderMap;
use crate::input::cookies::SetCookie;
use crate::stream::ByteStream;

/// Receives the raw connection stream after a successful protocol
/// upgrade (101 response). The HTTP loop ends once `build` is called.
pub trait Upgrade: Send {
    fn build(&mut self, stream: ByteStream);
}

/// Errors from response mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    /// The status line and headers have already been transmitted.
    HeadersAlreadySent,
    /// The header map is at capacity.
    TooManyHeaders,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResponseError::HeadersAlreadySent => write!(f, "response headers already sent"),
            ResponseError::TooManyHeaders => write!(f, "too many response headers"),
        }
    }
}

impl error::Error for ResponseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    Deferred,
    Streaming,
    Finished,
}

/// A response under construction, and the machinery that sends it.
pub struct Response {
    status_code: u16,
    status_phrase: Option<Cow<'static, str>>,
    headers: HeaderMap,
    cookies: Vec<SetCookie>,
    body: Vec<u8>,

    declared_len: Option<u64>,
    chunked: bool,
    phase: SendPhase,
    streamed: u64,
    connection_close: bool,
    head_only: bool,

    /// When set, the driver hands the raw stream to this object after the
    /// head has been flushed, and stops speaking HTTP on the connection.
    pub upgrade: Option<Box<dyn Upgrade>>,

    stream: Option<ByteStream>,
}

impl Response {
    /// An empty 200 response.
    pub fn new() -> Response {
        Response {
            status_code: 200,
            status_phrase: None,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            declared_len: None,
            chunked: false,
            phase: SendPhase::Deferred,
            streamed: 0,
            connection_close: false,
            head_only: false,
            upgrade: None,
            stream: None,
        }
    }

    /// A `text/plain; charset=utf8` response.
    pub fn text<S>(text: S) -> Response
    where
        S: Into<String>,
    {
        let mut response = Response::new();
        if let Err(e) = response.add_header("Content-Type", "text/plain; charset=utf8") {
            warn!("dropping Content-Type header: {}", e);
        }
        response.body = text.into().into_bytes();
        response
    }

    /// A `text/html; charset=utf8` response.
    pub fn html<S>(html: S) -> Response
    where
        S: Into<String>,
    {
        let mut response = Response::new();
        if let Err(e) = response.add_header("Content-Type", "text/html; charset=utf8") {
            warn!("dropping Content-Type header: {}", e);
        }
        response.body = html.into().into_bytes();
        response
    }

    /// An empty 400 response.
    #[inline]
    pub fn empty_400() -> Response {
        Response::new().with_status_code(400)
    }

    /// An empty 404 response.
    #[inline]
    pub fn empty_404() -> Response {
        Response::new().with_status_code(404)
    }

    #[inline]
    pub fn with_status_code(mut self, code: u16) -> Response {
        self.status_code = code;
        self
    }

    /// Overrides the reason phrase derived from the status code.
    pub fn with_status_phrase<S>(mut self, phrase: S) -> Response
    where
        S: Into<Cow<'static, str>>,
    {
        self.status_phrase = Some(phrase.into());
        self
    }

    pub fn with_header<N, V>(mut self, name: N, value: V) -> Response
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        if let Err(e) = self.add_header(name, value) {
            warn!("dropping response header: {}", e);
        }
        self
    }

    pub fn with_cookie(mut self, cookie: SetCookie) -> Response {
        self.cookies.push(cookie);
        self
    }

    #[inline]
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Returns true if the status code of this response indicates
    /// success. This is the range [200-399].
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status_code >= 200 && self.status_code < 400
    }

    /// Shortcut for `!response.is_success()`.
    #[inline]
    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    #[inline]
    pub fn set_status_code(&mut self, code: u16) {
        self.status_code = code;
    }

    /// First value of a header previously added to this response.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&[], name)
    }

    /// Adds a header to be sent with the response.
    ///
    /// `Content-Length` and `Transfer-Encoding` are not stored: they
    /// configure the send mode instead, and setting one clears the other.
    /// `Connection` and `Trailer` are owned by the connection driver and
    /// are ignored here.
    pub fn add_header<N, V>(&mut self, name: N, value: V) -> Result<(), ResponseError>
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        if self.phase != SendPhase::Deferred {
            return Err(ResponseError::HeadersAlreadySent);
        }
        let name = name.into();
        let value = value.into();

        if name.eq_ignore_ascii_case("content-length") {
            match value.trim().parse::<u64>() {
                Ok(len) => self.set_content_length(len),
                Err(_) => warn!("ignoring unparseable Content-Length {:?}", value),
            }
            return Ok(());
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            if value.to_ascii_lowercase().contains("chunked") {
                self.chunked = true;
                self.declared_len = None;
            }
            return Ok(());
        }
        if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("trailer") {
            debug!("ignoring driver-managed header {:?}", name);
            return Ok(());
        }

        self.headers
            .append(name, value)
            .map_err(|_| ResponseError::TooManyHeaders)
    }

    /// Declares the body length up front, selecting fixed-length
    /// streaming. Clears any chunked setting.
    pub fn set_content_length(&mut self, len: u64) {
        self.declared_len = Some(len);
        self.chunked = false;
    }

    pub fn set_cookie(&mut self, cookie: SetCookie) {
        self.cookies.push(cookie);
    }

    /// Sends everything that is still pending. In deferred phase this
    /// transmits the head first; with no declared content length the
    /// response switches to chunked streaming.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.phase == SendPhase::Deferred {
            self.begin_streaming()?;
        }
        match self.stream.as_mut() {
            Some(stream) => stream.flush(),
            None => Err(detached()),
        }
    }

    /// Completes the response: emits the head and body if still deferred,
    /// or the terminating 0-chunk in chunked mode, and flushes.
    pub fn finish(&mut self) -> io::Result<()> {
        match self.phase {
            SendPhase::Deferred => {
                let body = mem::take(&mut self.body);
                if self.declared_len.is_none() {
                    self.declared_len = Some(body.len() as u64);
                }
                self.send_head()?;
                let declared = self.declared_len.unwrap_or(0);
                if body.len() as u64 != declared {
                    warn!(
                        "buffered body is {} bytes but Content-Length says {}",
                        body.len(),
                        declared
                    );
                    self.connection_close = true;
                }
                let stream = self.stream.as_mut().ok_or_else(detached)?;
                if !self.head_only {
                    stream.write(&body);
                }
                self.phase = SendPhase::Finished;
                stream.flush()
            }
            SendPhase::Streaming => {
                let stream = self.stream.as_mut().ok_or_else(detached)?;
                if self.chunked {
                    if !self.head_only {
                        stream.write(b"0\r\n\r\n");
                    }
                } else if Some(self.streamed) != self.declared_len {
                    warn!(
                        "fixed-length response ended at {} of {:?} bytes",
                        self.streamed, self.declared_len
                    );
                    self.connection_close = true;
                }
                self.phase = SendPhase::Finished;
                stream.flush()
            }
            SendPhase::Finished => Ok(()),
        }
    }

    /// Empties the response in place, retaining allocated capacity. The
    /// attached stream, if any, is not touched.
    pub fn reset(&mut self) {
        self.status_code = 200;
        self.status_phrase = None;
        self.headers.reset();
        self.cookies.clear();
        self.body.clear();
        self.declared_len = None;
        self.chunked = false;
        self.phase = SendPhase::Deferred;
        self.streamed = 0;
        self.connection_close = false;
        self.head_only = false;
        self.upgrade = None;
    }

    // Driver-side plumbing.

    pub(crate) fn attach_stream(&mut self, stream: ByteStream) {
        self.stream = Some(stream);
    }

    pub(crate) fn take_stream(&mut self) -> Option<ByteStream> {
        self.stream.take()
    }

    pub(crate) fn head_sent(&self) -> bool {
        self.phase != SendPhase::Deferred
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.phase == SendPhase::Finished
    }

    pub(crate) fn set_connection_close(&mut self, close: bool) {
        self.connection_close = close;
    }

    pub(crate) fn connection_close(&self) -> bool {
        self.connection_close
    }

    pub(crate) fn set_head_only(&mut self, head_only: bool) {
        self.head_only = head_only;
    }

    /// Replaces this response's status, headers, cookies and body with
    /// another response's, keeping the stream attachment and the driver's
    /// connection flags.
    ///
    /// This is the usual way for a handler to answer with one of the
    /// constructors:
    ///
    /// ```
    /// use enclume::Response;
    ///
    /// # let mut response = Response::new();
    /// response.adopt(Response::text("hello world"));
    /// ```
    pub fn adopt(&mut self, other: Response) {
        let Response {
            status_code,
            status_phrase,
            headers,
            cookies,
            body,
            declared_len,
            chunked,
            upgrade,
            ..
        } = other;
        self.status_code = status_code;
        self.status_phrase = status_phrase;
        self.headers = headers;
        self.cookies = cookies;
        self.body = body;
        self.declared_len = declared_len;
        self.chunked = chunked;
        self.upgrade = upgrade;
    }

    // Decides the send mode and transmits the head, then replays the
    // buffered body through the streaming path.
    fn begin_streaming(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.phase, SendPhase::Deferred);
        if self.declared_len.is_none() {
            self.chunked = true;
        }
        self.send_head()?;
        self.phase = SendPhase::Streaming;
        let body = mem::take(&mut self.body);
        if !body.is_empty() {
            self.stream_write(&body)?;
        }
        Ok(())
    }

    // Emits "HTTP/1.1 <code> <phrase>" and the header block into the
    // stream's output buffer.
    fn send_head(&mut self) -> io::Result<()> {
        let mut itoa_buf = itoa::Buffer::new();

        let phrase: &str = match &self.status_phrase {
            Some(phrase) => phrase,
            None => reason_phrase(self.status_code),
        };

        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(detached()),
        };
        stream.write(b"HTTP/1.1 ");
        stream.write(itoa_buf.format(self.status_code).as_bytes());
        stream.write(b" ");
        stream.write(phrase.as_bytes());
        stream.write(b"\r\n");

        let mut found_server = false;
        let mut found_date = false;
        for (name, value) in self.headers.iter(&[]) {
            if !found_server && name.eq_ignore_ascii_case("Server") {
                found_server = true;
            }
            if !found_date && name.eq_ignore_ascii_case("Date") {
                found_date = true;
            }
            stream.write(name.as_bytes());
            stream.write(b": ");
            stream.write(value);
            stream.write(b"\r\n");
        }

        if !found_server {
            stream.write(b"Server: enclume\r\n");
        }
        if !found_date {
            stream.write(b"Date: ");
            stream.write(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
            stream.write(b"\r\n");
        }

        for cookie in &self.cookies {
            stream.write(b"Set-Cookie: ");
            stream.write(cookie.header_value().as_bytes());
            stream.write(b"\r\n");
        }

        if self.upgrade.is_some() {
            stream.write(b"Connection: Upgrade\r\n");
        } else if self.connection_close {
            stream.write(b"Connection: close\r\n");
        }

        if self.upgrade.is_some() {
            // An upgrade response has no body to frame.
        } else if self.chunked {
            stream.write(b"Transfer-Encoding: chunked\r\n");
        } else if let Some(len) = self.declared_len {
            stream.write(b"Content-Length: ");
            stream.write(itoa_buf.format(len).as_bytes());
            stream.write(b"\r\n");
        }

        stream.write(b"\r\n");
        Ok(())
    }

    // Streams body bytes after the head is out, framing them as a chunk
    // in chunked mode.
    fn stream_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        if self.chunked {
            if self.head_only {
                return Ok(());
            }
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Err(detached()),
            };
            write!(stream, "{:X}\r\n", bytes.len())?;
            stream.write(bytes);
            stream.write(b"\r\n");
            return Ok(());
        }

        let declared = self.declared_len.unwrap_or(0);
        if self.streamed + bytes.len() as u64 > declared {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "body exceeds the declared Content-Length",
            ));
        }
        self.streamed += bytes.len() as u64;
        let head_only = self.head_only;
        let streamed = self.streamed;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(detached()),
        };
        if !head_only {
            stream.write(bytes);
        }
        if streamed == declared {
            stream.flush()?;
        }
        Ok(())
    }
}

impl Default for Response {
    fn default() -> Response {
        Response::new()
    }
}

impl Write for Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.phase {
            SendPhase::Finished => Err(io::Error::new(
                io::ErrorKind::Other,
                "response already finished",
            )),
            SendPhase::Deferred => {
                // A declared length plus an attached stream means we can
                // start fixed-length streaming right away.
                if self.declared_len.is_some() && self.stream.is_some() {
                    self.begin_streaming()?;
                    self.stream_write(buf)?;
                } else {
                    self.body.extend_from_slice(buf);
                }
                Ok(buf.len())
            }
            SendPhase::Streaming => {
                self.stream_write(buf)?;
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Response::flush(self)
    }
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "response has no stream")
}

/// Returns the phrase corresponding to a status code.
pub(crate) fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        118 => "Connection timed out",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        210 => "Content Different",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Time-out",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Request range not satisfiable",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        505 => "HTTP Version not supported",
        _ => "Unknown",
    }
}
