// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The enclume library is an HTTP/1.x server core built for throughput:
//! a zero-copy wire parser, pooled per-connection state, deferred
//! response emission with transparent chunked streaming,
//! `multipart/form-data` parsing and RFC 6455 websocket framing.
//!
//! # Overview
//!
//! Each connection owns a [`ByteStream`] over its transport. The parser
//! runs directly over the stream's buffer, which is swapped to be the
//! [`Request`]'s own storage for the duration of the parse, so parsed
//! fields are views into that buffer rather than copies. A
//! [`Response`] defers its status line and headers until the first
//! flush, picking fixed-length or chunked transmission at that point.
//! Connections, requests and responses are pooled and reset in place
//! between requests.
//!
//! Routing is deliberately not built in: anything implementing
//! [`Router`] can resolve `(method, path)` to a handler. The crate ships
//! the exact-match [`StaticRouter`] for small servers and tests.
//!
//! # Example
//!
//! ```no_run
//! use enclume::{Config, HandlerResult, Method, Request, Response, Server, StaticRouter};
//!
//! fn hello(_request: &Request, response: &mut Response) -> HandlerResult {
//!     response.adopt(Response::text("hello world"));
//!     Ok(())
//! }
//!
//! let router = StaticRouter::new().route(Method::Get, "/", hello);
//! let server = Server::new(Config::default(), std::sync::Arc::new(router)).unwrap();
//! println!("Listening on {:?}", server.server_addr());
//! server.run();
//! ```

use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use log::warn;

pub mod input;
pub mod websocket;

mod ascii;
mod connection;
mod headers;
mod parser;
mod pool;
mod request;
mod response;
mod router;
mod stream;
mod task_pool;

pub use crate::headers::HeaderMap;
pub use crate::headers::HeaderTooLarge;
pub use crate::pool::ObjectPool;
pub use crate::pool::Triple;
pub use crate::request::HttpVersion;
pub use crate::request::Method;
pub use crate::request::Request;
pub use crate::request::RequestBody;
pub use crate::request::Scheme;
pub use crate::response::Response;
pub use crate::response::ResponseError;
pub use crate::response::Upgrade;
pub use crate::router::Captures;
pub use crate::router::Handler;
pub use crate::router::HandlerResult;
pub use crate::router::Middleware;
pub use crate::router::RouteMatch;
pub use crate::router::Router;
pub use crate::router::StaticRouter;
pub use crate::stream::ByteStream;
pub use crate::stream::Transport;
pub use crate::stream::DEFAULT_BUFFER_SIZE;

use crate::connection::ServerContext;
use crate::task_pool::TaskPool;

// A half-open byte range into a request buffer. All parsed request
// fields are spans; resolving one is a bounds-checked slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Span {
    start: u32,
    end: u32,
}

impl Span {
    #[inline]
    pub(crate) fn new(start: usize, end: usize) -> Span {
        debug_assert!(start <= end);
        Span {
            start: start as u32,
            end: end as u32,
        }
    }

    #[inline]
    pub(crate) fn start(self) -> usize {
        self.start as usize
    }

    #[inline]
    pub(crate) fn end(self) -> usize {
        self.end as usize
    }

    #[inline]
    pub(crate) fn is_empty(self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub(crate) fn slice(self, buf: &[u8]) -> &[u8] {
        buf.get(self.start as usize..self.end as usize)
            .unwrap_or(&[])
    }
}

/// The tagged error union of the parsing and I/O layer.
///
/// `EndOfBuffer` is internal flow control ("feed me more bytes") and is
/// never surfaced to a peer; the variants with a status code become the
/// error response that closes the connection.
#[derive(Debug)]
pub enum ParseError {
    /// Malformed request syntax.
    BadRequest,
    /// The version token was not one of the recognised HTTP versions.
    UnsupportedHttpVersion,
    /// The request line exceeds `max_request_line_size`.
    RequestUriTooLong,
    /// The header block exceeds `max_header_size`.
    RequestHeaderFieldsTooLarge,
    /// The body exceeds `max_content_length` or cannot be held.
    RequestEntityTooLarge,
    /// The current window ran out mid-parse; shift and refill.
    EndOfBuffer,
    /// The peer closed the connection.
    EndOfStream,
    /// Transport failure.
    Io(io::Error),
}

impl ParseError {
    /// The response status for errors that get one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ParseError::BadRequest => Some(400),
            ParseError::UnsupportedHttpVersion => Some(505),
            ParseError::RequestUriTooLong => Some(414),
            ParseError::RequestHeaderFieldsTooLarge => Some(431),
            ParseError::RequestEntityTooLarge => Some(413),
            ParseError::EndOfBuffer | ParseError::EndOfStream | ParseError::Io(_) => None,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::BadRequest => write!(f, "malformed request"),
            ParseError::UnsupportedHttpVersion => write!(f, "unsupported http version"),
            ParseError::RequestUriTooLong => write!(f, "request line too long"),
            ParseError::RequestHeaderFieldsTooLarge => write!(f, "header block too large"),
            ParseError::RequestEntityTooLarge => write!(f, "request body too large"),
            ParseError::EndOfBuffer => write!(f, "buffer exhausted mid-parse"),
            ParseError::EndOfStream => write!(f, "peer closed the connection"),
            ParseError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl error::Error for ParseError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ParseError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ParseError {
    fn from(e: io::Error) -> ParseError {
        ParseError::Io(e)
    }
}

/// Server tuning knobs. Every limit maps to the error response emitted
/// when it is exceeded.
#[derive(Debug, Clone)]
pub struct Config {
    /// Request lines longer than this are rejected with 414.
    pub max_request_line_size: usize,
    /// Header blocks larger than this are rejected with 431.
    pub max_header_size: usize,
    /// Declared or decoded bodies larger than this are rejected with 413.
    pub max_content_length: u64,
    /// Fixed bodies above this many bytes are spooled to an atomic temp
    /// file instead of held in the request buffer.
    pub spool_threshold: u64,
    /// How long a keep-alive connection may sit idle before it is
    /// dropped. `None` waits forever.
    pub keep_alive_idle_timeout: Option<Duration>,
    /// Upper bound on live {stream, request, response} triples.
    pub pool_capacity: usize,
    /// Capacity of each connection's input buffer and request buffer.
    pub buffer_size: usize,
    pub listen_address: String,
    pub listen_port: u16,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_request_line_size: 2048,
            max_header_size: 10240,
            max_content_length: 1024 * 1024 * 1024,
            spool_threshold: DEFAULT_BUFFER_SIZE as u64,
            keep_alive_idle_timeout: None,
            pool_capacity: 128,
            buffer_size: DEFAULT_BUFFER_SIZE,
            listen_address: "0.0.0.0".to_owned(),
            listen_port: 8000,
        }
    }
}

impl Config {
    pub fn with_listen<S>(mut self, address: S, port: u16) -> Config
    where
        S: Into<String>,
    {
        self.listen_address = address.into();
        self.listen_port = port;
        self
    }

    pub fn with_max_request_line_size(mut self, limit: usize) -> Config {
        self.max_request_line_size = limit;
        self
    }

    pub fn with_max_header_size(mut self, limit: usize) -> Config {
        self.max_header_size = limit;
        self
    }

    pub fn with_max_content_length(mut self, limit: u64) -> Config {
        self.max_content_length = limit;
        self
    }

    pub fn with_spool_threshold(mut self, threshold: u64) -> Config {
        self.spool_threshold = threshold;
        self
    }

    pub fn with_keep_alive_idle_timeout(mut self, timeout: Option<Duration>) -> Config {
        self.keep_alive_idle_timeout = timeout;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Config {
        self.pool_capacity = capacity;
        self
    }
}

/// A listening server: the thin accept loop around the connection
/// driver. Each accepted socket becomes one task on the worker pool and
/// stays on its worker for its whole keep-alive lifetime.
pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
    workers: TaskPool,
}

impl Server {
    /// Binds to `config.listen_address:config.listen_port` and prepares
    /// the worker pool. The server starts accepting on `run` or `poll`.
    pub fn new(config: Config, router: Arc<dyn Router>) -> io::Result<Server> {
        Server::with_middlewares(config, router, Vec::new())
    }

    /// Like `new`, with pre/post filters wrapped around every handler.
    pub fn with_middlewares(
        config: Config,
        router: Arc<dyn Router>,
        middlewares: Vec<Arc<dyn Middleware>>,
    ) -> io::Result<Server> {
        let listener = TcpListener::bind((config.listen_address.as_str(), config.listen_port))?;
        let pool = ObjectPool::new(config.pool_capacity, config.buffer_size);
        let context = Arc::new(ServerContext {
            config,
            router,
            middlewares,
            pool,
        });

        info!("listening on {:?}", listener.local_addr());
        Ok(Server {
            listener,
            context,
            workers: TaskPool::new(num_cpus::get()),
        })
    }

    /// Returns the address of the listening socket.
    pub fn server_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the server forever, or until the listening socket is somehow
    /// force-closed by the operating system.
    pub fn run(self) {
        for socket in self.listener.incoming() {
            match socket {
                Ok(socket) => self.dispatch(socket),
                Err(e) => warn!("accept failed: {}", e),
            }
        }
    }

    /// Accepts and dispatches every connection currently waiting, then
    /// returns.
    pub fn poll(&self) {
        if self.listener.set_nonblocking(true).is_err() {
            return;
        }
        loop {
            match self.listener.accept() {
                Ok((socket, _)) => {
                    let _ = socket.set_nonblocking(false);
                    self.dispatch(socket);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
        let _ = self.listener.set_nonblocking(false);
    }

    fn dispatch(&self, socket: TcpStream) {
        let remote_addr = socket.peer_addr().ok();
        if let Some(timeout) = self.context.config.keep_alive_idle_timeout {
            // The idle timeout is enforced by arming the blocking read.
            let _ = socket.set_read_timeout(Some(timeout));
        }
        let _ = socket.set_nodelay(true);

        let context = self.context.clone();
        self.workers.spawn(move || {
            connection::handle_connection(&context, Box::new(socket), remote_addr);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_the_documented_limits() {
        let config = Config::default();
        assert_eq!(config.max_request_line_size, 2048);
        assert_eq!(config.max_header_size, 10240);
        assert_eq!(config.max_content_length, 1024 * 1024 * 1024);
        assert_eq!(config.spool_threshold, DEFAULT_BUFFER_SIZE as u64);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn config_builders_compose() {
        let config = Config::default()
            .with_listen("127.0.0.1", 0)
            .with_max_header_size(4096)
            .with_pool_capacity(4);
        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.max_header_size, 4096);
        assert_eq!(config.pool_capacity, 4);
    }

    #[test]
    fn span_resolution_is_bounds_checked() {
        let span = Span::new(2, 5);
        assert_eq!(span.slice(b"0123456"), b"234");
        assert_eq!(span.slice(b"01"), b"");
        assert!(Span::default().is_empty());
    }

    #[test]
    fn parse_errors_map_to_their_statuses() {
        assert_eq!(ParseError::BadRequest.status_code(), Some(400));
        assert_eq!(ParseError::UnsupportedHttpVersion.status_code(), Some(505));
        assert_eq!(ParseError::RequestUriTooLong.status_code(), Some(414));
        assert_eq!(
            ParseError::RequestHeaderFieldsTooLarge.status_code(),
            Some(431)
        );
        assert_eq!(ParseError::RequestEntityTooLarge.status_code(), Some(413));
        assert_eq!(ParseError::EndOfBuffer.status_code(), None);
        assert_eq!(ParseError::EndOfStream.status_code(), None);
    }
}
