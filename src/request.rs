// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The pooled per-connection request object.
//!
//! A `Request` owns the byte buffer its slices point into. During parsing
//! that buffer is swapped into the connection's `ByteStream`, so the wire
//! bytes land directly inside the request's storage and every parsed field
//! is a span into it. Resetting a request empties the maps and spans and
//! disposes any spooled temp file, but keeps the allocations so the object
//! can go back to the pool.

use std::fmt;
use std::fs;
use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str;

use log::warn;

use crate::headers::HeaderMap;
use crate::input::cookies::CookieMap;
use crate::router::Captures;
use crate::Span;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Patch,
    Head,
    Delete,
    Options,
    Unknown,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl Default for Method {
    fn default() -> Method {
        Method::Unknown
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version. 2.0 and 3.0 are recognised on the wire but
/// rejected before dispatch with a 505.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http1_0,
    Http1_1,
    Http2_0,
    Http3_0,
    Unknown,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http1_0 => "HTTP/1.0",
            HttpVersion::Http1_1 => "HTTP/1.1",
            HttpVersion::Http2_0 => "HTTP/2.0",
            HttpVersion::Http3_0 => "HTTP/3.0",
            HttpVersion::Unknown => "HTTP/?",
        }
    }
}

impl Default for HttpVersion {
    fn default() -> HttpVersion {
        HttpVersion::Unknown
    }
}

/// URI scheme, known only for absolute-form request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Unknown,
}

impl Default for Scheme {
    fn default() -> Scheme {
        Scheme::Unknown
    }
}

// A request body spooled to disk because it was too large to keep in the
// request buffer. The file was fully written before being renamed into
// place, so a reader never observes a partial spool.
pub(crate) struct SpooledFile {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    pub(crate) len: u64,
}

impl SpooledFile {
    fn dispose(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove spooled body {:?}: {}", self.path, e);
        }
    }
}

// Where the request body ended up.
pub(crate) enum Content {
    Buffered(Span),
    Spooled(SpooledFile),
}

/// Borrowed view of a request body.
pub enum RequestBody<'a> {
    /// The body sits in the request buffer.
    Buffered(&'a [u8]),
    /// The body was spooled to a temp file. The file's cursor is at the
    /// start; it is removed when the request is reset.
    Spooled { file: &'a File, len: u64 },
}

/// A parsed HTTP request.
///
/// All string accessors return slices into the request's own buffer; they
/// are valid for as long as the request is.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) version: HttpVersion,
    pub(crate) scheme: Scheme,
    pub(crate) uri: Span,
    pub(crate) host: Span,
    pub(crate) path: Span,
    pub(crate) query: Span,
    pub(crate) head: Span,
    pub(crate) content_length: Option<u64>,
    pub(crate) chunked: bool,
    pub(crate) read_finished: bool,
    pub(crate) captures: Captures,
    pub(crate) headers: HeaderMap,
    pub(crate) cookies: CookieMap,
    pub(crate) buffer: Vec<u8>,
    pub(crate) content: Option<Content>,
    pub(crate) remote_addr: Option<SocketAddr>,
}

impl Request {
    /// Creates an empty request whose buffer has the given capacity.
    pub fn new(buffer_size: usize) -> Request {
        Request {
            method: Method::Unknown,
            version: HttpVersion::Unknown,
            scheme: Scheme::Unknown,
            uri: Span::default(),
            host: Span::default(),
            path: Span::default(),
            query: Span::default(),
            head: Span::default(),
            content_length: None,
            chunked: false,
            read_finished: false,
            captures: Captures::new(),
            headers: HeaderMap::new(),
            cookies: CookieMap::new(),
            buffer: vec![0; buffer_size],
            content: None,
            remote_addr: None,
        }
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn http_version(&self) -> HttpVersion {
        self.version
    }

    #[inline]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The raw request target, exactly as it appeared on the request line.
    pub fn url(&self) -> &str {
        self.resolve(self.uri)
    }

    /// Host component of an absolute-form target, or `""`.
    pub fn host(&self) -> &str {
        self.resolve(self.host)
    }

    /// Path component of the target. Never percent-decoded; that is the
    /// router's or the handler's business.
    pub fn path(&self) -> &str {
        self.resolve(self.path)
    }

    /// Query string without the leading `?`, or `""`.
    pub fn query(&self) -> &str {
        self.resolve(self.query)
    }

    /// The entire request head (request line plus header block), for
    /// logging.
    pub fn raw_head(&self) -> &[u8] {
        self.head.slice(&self.buffer)
    }

    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// True once the whole body has been pulled off the connection.
    #[inline]
    pub fn read_finished(&self) -> bool {
        self.read_finished
    }

    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// First value of the given header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&self.buffer, name)
    }

    /// First value of the given header as raw bytes.
    pub fn header_bytes(&self, name: &str) -> Option<&[u8]> {
        self.headers.get_bytes(&self.buffer, name)
    }

    /// All headers in the order they appeared.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.headers.iter(&self.buffer)
    }

    /// Value of the cookie with the given name, if the request carried
    /// one. The cookie jar is parsed on first access.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        let header = self.headers.get_span(&self.buffer, "Cookie");
        let span = self.cookies.get(&self.buffer, header, name)?;
        str::from_utf8(span.slice(&self.buffer)).ok()
    }

    /// Every cookie pair, in the order they appeared on the header.
    pub fn cookies(&self) -> Vec<(&str, &str)> {
        let header = self.headers.get_span(&self.buffer, "Cookie");
        self.cookies
            .all(&self.buffer, header)
            .into_iter()
            .filter_map(|(name, value)| {
                let name = str::from_utf8(name.slice(&self.buffer)).ok()?;
                let value = str::from_utf8(value.slice(&self.buffer)).ok()?;
                Some((name, value))
            })
            .collect()
    }

    /// The request body, if one was read.
    pub fn data(&self) -> Option<RequestBody<'_>> {
        match &self.content {
            None => None,
            Some(Content::Buffered(span)) => Some(RequestBody::Buffered(span.slice(&self.buffer))),
            Some(Content::Spooled(spool)) => Some(RequestBody::Spooled {
                file: &spool.file,
                len: spool.len,
            }),
        }
    }

    /// URL capture produced by the router, resolved against the path.
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.resolve(self.path(), index)
    }

    pub(crate) fn set_captures(&mut self, captures: Captures) {
        self.captures = captures;
    }

    /// Zeroes the enums, empties the buffer and maps, and disposes any
    /// temp file, keeping every allocation for reuse.
    pub fn reset(&mut self) {
        self.method = Method::Unknown;
        self.version = HttpVersion::Unknown;
        self.scheme = Scheme::Unknown;
        self.uri = Span::default();
        self.host = Span::default();
        self.path = Span::default();
        self.query = Span::default();
        self.head = Span::default();
        self.content_length = None;
        self.chunked = false;
        self.read_finished = false;
        self.captures.reset();
        self.headers.reset();
        self.cookies.reset();
        if let Some(Content::Spooled(spool)) = self.content.take() {
            spool.dispose();
        }
        self.remote_addr = None;
    }

    // Buffer hand-off used by the connection driver to let the parser
    // write directly into this request's storage.

    pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub(crate) fn restore_buffer(&mut self, buffer: Vec<u8>) {
        self.buffer = buffer;
    }

    fn resolve(&self, span: Span) -> &str {
        str::from_utf8(span.slice(&self.buffer)).unwrap_or("")
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(Content::Spooled(spool)) = self.content.take() {
            spool.dispose();
        }
    }
}

#[cfg(test)]
impl Request {
    /// Builds a request by synthesizing the wire bytes and running the
    /// real parser over them. Panics when the synthesized request does
    /// not parse; it is a test helper.
    pub(crate) fn fake_http(
        method: &str,
        url: &str,
        headers: Vec<(String, String)>,
        data: Vec<u8>,
    ) -> Request {
        use crate::Config;

        let mut wire = Vec::new();
        wire.extend_from_slice(method.as_bytes());
        wire.push(b' ');
        wire.extend_from_slice(url.as_bytes());
        wire.extend_from_slice(b" HTTP/1.1\r\n");
        let has_length = headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("Content-Length"));
        for (name, value) in &headers {
            wire.extend_from_slice(name.as_bytes());
            wire.extend_from_slice(b": ");
            wire.extend_from_slice(value.as_bytes());
            wire.extend_from_slice(b"\r\n");
        }
        if !data.is_empty() && !has_length {
            wire.extend_from_slice(format!("Content-Length: {}\r\n", data.len()).as_bytes());
        }
        wire.extend_from_slice(b"\r\n");
        let body_start = wire.len();
        wire.extend_from_slice(&data);

        let mut request = Request::new(wire.len().max(1024));
        request.buffer[..wire.len()].copy_from_slice(&wire);

        let config = Config::default();
        let head =
            crate::parser::parse_head(&request.buffer[..wire.len()], &mut request.headers, &config)
                .expect("fake request does not parse");
        head.apply(&mut request);
        if !data.is_empty() {
            request.content = Some(Content::Buffered(Span::new(body_start, body_start + data.len())));
        }
        request.read_finished = true;
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_request_resolves_fields() {
        let request = Request::fake_http(
            "GET",
            "/users/12?full=1",
            vec![("Host".to_owned(), "example.com".to_owned())],
            Vec::new(),
        );

        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.http_version(), HttpVersion::Http1_1);
        assert_eq!(request.url(), "/users/12?full=1");
        assert_eq!(request.path(), "/users/12");
        assert_eq!(request.query(), "full=1");
        assert_eq!(request.header("host"), Some("example.com"));
    }

    #[test]
    fn body_is_exposed_through_data() {
        let request = Request::fake_http("POST", "/submit", Vec::new(), b"payload".to_vec());
        match request.data() {
            Some(RequestBody::Buffered(bytes)) => assert_eq!(bytes, b"payload"),
            _ => panic!("expected a buffered body"),
        }
        assert_eq!(request.content_length(), Some(7));
    }

    #[test]
    fn reset_clears_parsed_state() {
        let mut request = Request::fake_http(
            "DELETE",
            "/gone",
            vec![("Cookie".to_owned(), "a=b".to_owned())],
            Vec::new(),
        );
        assert_eq!(request.cookie("a"), Some("b"));

        request.reset();
        assert_eq!(request.method(), Method::Unknown);
        assert_eq!(request.url(), "");
        assert_eq!(request.header("Cookie"), None);
        assert!(request.data().is_none());
    }

    #[test]
    fn cookies_parse_lazily() {
        let request = Request::fake_http(
            "GET",
            "/",
            vec![("Cookie".to_owned(), "a=b; hello=world".to_owned())],
            Vec::new(),
        );

        assert_eq!(request.cookie("hello"), Some("world"));
        assert_eq!(request.cookie("a"), Some("b"));
        assert_eq!(request.cookie("absent"), None);
        assert_eq!(
            request.cookies(),
            vec![("a", "b"), ("hello", "world")]
        );
    }
}
