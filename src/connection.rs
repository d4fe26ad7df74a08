// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The per-connection state machine.
//!
//! One connection runs Idle → ReadingHead → Dispatching → WritingBody and
//! then either back to Idle (keep-alive) or to Closing. The driver owns
//! the buffer choreography that makes the parser zero-copy: on each
//! request it swaps the `Request`'s buffer into the stream, retries the
//! head parse with shift-and-fill until it completes, reads the body, and
//! swaps the buffer back before the handler runs.
//!
//! Error discipline, in order: a parse failure before anything was sent
//! becomes a 4xx/5xx response and a close; a peer disconnect or I/O
//! failure closes silently; a handler failure becomes a 500 only while
//! the head is unsent, and otherwise tears the connection down.

use std::mem;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::panic;
use std::sync::Arc;

use log::debug;
use log::error;
use log::warn;

use crate::parser;
use crate::pool::ObjectPool;
use crate::pool::Triple;
use crate::request::HttpVersion;
use crate::request::Method;
use crate::response::reason_phrase;
use crate::router::Middleware;
use crate::router::Router;
use crate::stream::ByteStream;
use crate::stream::Transport;
use crate::Config;
use crate::ParseError;
use crate::Request;
use crate::Response;

/// Everything a connection task needs, shared across workers.
pub(crate) struct ServerContext {
    pub(crate) config: Config,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) middlewares: Vec<Arc<dyn Middleware>>,
    pub(crate) pool: ObjectPool,
}

enum Outcome {
    KeepAlive,
    Close,
    Upgraded,
}

/// Runs the HTTP loop over one transport until the connection closes or
/// is upgraded, then returns the triple to the pool.
pub(crate) fn handle_connection(
    ctx: &ServerContext,
    transport: Box<dyn Transport>,
    remote_addr: Option<SocketAddr>,
) {
    let mut triple = ctx.pool.acquire();
    triple.stream.attach(transport);

    loop {
        match one_request(ctx, &mut triple, remote_addr) {
            Outcome::KeepAlive => continue,
            Outcome::Close | Outcome::Upgraded => break,
        }
    }

    // Dropping the transport closes the socket.
    triple.stream.reset();
    ctx.pool.release(triple);
}

fn one_request(ctx: &ServerContext, triple: &mut Triple, remote_addr: Option<SocketAddr>) -> Outcome {
    let config = &ctx.config;
    let Triple {
        stream,
        request,
        response,
    } = triple;

    request.reset();
    response.reset();
    request.remote_addr = remote_addr;

    // Idle: anchor the next head at offset zero of the request's own
    // buffer, so every parsed span survives the swap back.
    stream.compact();
    let spare = stream.swap_input_buffer(request.take_buffer());

    // ReadingHead: parse, and on a partial head shift-and-fill and
    // re-parse from the top.
    let head = loop {
        match parser::parse_head(stream.read_buffered(), &mut request.headers, config) {
            Ok(head) => break head,
            Err(ParseError::EndOfBuffer) => {
                let was_idle = stream.amount_buffered() == 0;
                match stream.shift_and_fill(0) {
                    Ok(_) => {}
                    Err(ParseError::EndOfStream) => {
                        // Peer closed: silently between requests, and
                        // with no response mid-head.
                        if !was_idle {
                            debug!("peer closed in the middle of a request head");
                        }
                        unswap(stream, request, spare);
                        return Outcome::Close;
                    }
                    Err(ParseError::EndOfBuffer) => {
                        // The head outgrew the entire buffer. The size
                        // limits fire long before this; it is a backstop.
                        unswap(stream, request, spare);
                        return send_error(stream, response, 431);
                    }
                    Err(ParseError::Io(e)) => {
                        debug!("i/o error while reading request head: {}", e);
                        unswap(stream, request, spare);
                        return Outcome::Close;
                    }
                    Err(e) => {
                        unswap(stream, request, spare);
                        return send_error(stream, response, status_of(&e));
                    }
                }
            }
            Err(e) => {
                unswap(stream, request, spare);
                return send_error(stream, response, status_of(&e));
            }
        }
    };

    let consumed = head.consumed;
    head.apply(request);
    stream.consume(consumed);

    // HTTP/2 and HTTP/3 are recognised but not spoken here.
    match request.version {
        HttpVersion::Http1_0 | HttpVersion::Http1_1 => {}
        _ => {
            unswap(stream, request, spare);
            return send_error(stream, response, 505);
        }
    }

    // The body is read before dispatch: in place, spooled, or chunked.
    if let Err(e) = parser::read_body(stream, request, config) {
        unswap(stream, request, spare);
        return match e {
            ParseError::EndOfStream => Outcome::Close,
            ParseError::Io(err) => {
                debug!("i/o error while reading request body: {}", err);
                Outcome::Close
            }
            other => send_error(stream, response, status_of(&other)),
        };
    }

    // Head and body are complete: give the request its buffer back so
    // accessors resolve, carrying any pipelined leftover into the spare.
    unswap(stream, request, spare);

    // Keep-alive: the HTTP/1.1 default, unless the client asked to
    // close. HTTP/1.0 keep-alive is not honoured.
    let keep_alive = request.version == HttpVersion::Http1_1 && !wants_close(request);
    response.set_connection_close(!keep_alive);
    response.set_head_only(request.method == Method::Head);

    // Dispatching: pre filters first, any of which may short-circuit.
    let short_circuit = ctx.middlewares.iter().find_map(|m| match m.pre(request) {
        ControlFlow::Break(r) => Some(r),
        ControlFlow::Continue(()) => None,
    });

    // The response streams directly while the handler runs.
    response.attach_stream(mem::replace(stream, ByteStream::new(0)));

    let mut poisoned = false;
    match short_circuit {
        Some(r) => response.adopt(r),
        None => match ctx.router.resolve(request.method(), request.path()) {
            None => response.adopt(error_page(404)),
            Some(route) => {
                request.set_captures(route.captures);
                let handler = route.handler;
                let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                    handler.handle(request, response)
                }));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("handler error: {}", e);
                        poisoned = !internal_error(response);
                    }
                    Err(_) => {
                        error!("handler panicked");
                        poisoned = !internal_error(response);
                    }
                }
            }
        },
    }

    // Post filters, innermost first.
    for middleware in ctx.middlewares.iter().rev() {
        middleware.post(request, response);
    }

    if poisoned {
        // The head is already on the wire; the only safe move is to drop
        // the connection mid-body.
        if let Some(s) = response.take_stream() {
            *stream = s;
        }
        return Outcome::Close;
    }

    // WritingBody.
    let sent = response.finish();

    // A 101 hands the raw stream to the upgrade object and leaves HTTP.
    if sent.is_ok() && response.upgrade.is_some() {
        if let (Some(mut upgrade), Some(s)) = (response.upgrade.take(), response.take_stream()) {
            upgrade.build(s);
        }
        *stream = ByteStream::new(config.buffer_size);
        return Outcome::Upgraded;
    }

    if let Some(s) = response.take_stream() {
        *stream = s;
    }

    match sent {
        Err(e) => {
            debug!("i/o error while writing response: {}", e);
            Outcome::Close
        }
        Ok(()) => {
            let clean = response.is_finished() && !response.connection_close();
            if keep_alive && request.read_finished() && clean {
                Outcome::KeepAlive
            } else {
                Outcome::Close
            }
        }
    }
}

// Swaps the stream's input buffer (the request's storage during parsing)
// back out, restoring it to the request. Unconsumed bytes, the start of a
// pipelined next request, carry over into the spare buffer.
fn unswap(stream: &mut ByteStream, request: &mut Request, spare: Vec<u8>) {
    let buffer = stream.swap_input_buffer(spare);
    request.restore_buffer(buffer);
}

// Emits a minimal error response and decides to close.
fn send_error(stream: &mut ByteStream, response: &mut Response, status: u16) -> Outcome {
    debug!("rejecting request with {}", status);
    response.reset();
    response.adopt(error_page(status));
    response.set_connection_close(true);

    response.attach_stream(mem::replace(stream, ByteStream::new(0)));
    if let Err(e) = response.finish() {
        debug!("failed to transmit {} response: {}", status, e);
    }
    if let Some(s) = response.take_stream() {
        *stream = s;
    }
    Outcome::Close
}

// Replaces whatever the handler half-built with a 500, when the head has
// not been transmitted yet. Returns false if it was too late.
fn internal_error(response: &mut Response) -> bool {
    if response.head_sent() {
        return false;
    }
    response.reset();
    response.adopt(
        Response::html(
            "<h1>Internal Server Error</h1>\
             <p>An internal error has occurred on the server.</p>",
        )
        .with_status_code(500),
    );
    response.set_connection_close(true);
    true
}

fn error_page(status: u16) -> Response {
    Response::html(format!("<h1>{} {}</h1>", status, reason_phrase(status)))
        .with_status_code(status)
}

fn status_of(e: &ParseError) -> u16 {
    e.status_code().unwrap_or(400)
}

// True when the request's Connection header lists the close token.
fn wants_close(request: &Request) -> bool {
    match request.header("Connection") {
        Some(value) => value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("close")),
        None => false,
    }
}
