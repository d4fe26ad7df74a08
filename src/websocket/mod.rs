// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Support for websockets.
//!
//! Using websockets is done with the following steps:
//!
//! - The websocket client (usually the browser through some Javascript)
//!   must send a request to the server to initiate the process.
//! - The handler must answer that request with the `start()` function
//!   defined in this module. This function returns an error if the
//!   request is not a websocket initialization request.
//! - The `start()` function also returns a `Receiver<Websocket>`. Once
//!   that `Receiver` contains a value, the upgrade has happened and the
//!   connection no longer speaks HTTP.
//! - You can then use the `Websocket` object to exchange messages with
//!   the client.
//!
//! # Subprotocols
//!
//! The messages of a websocket connection have no meaning per se; the way
//! they are interpreted is called a *subprotocol*. When you call
//! `start()` you indicate which subprotocol the connection is going to
//! use. It must be one of the subprotocols the client offered, otherwise
//! `start()` returns an error. Passing `None` means the subprotocol is
//! unknown to both sides.
//!
//! # Extensions
//!
//! Extensions offered by the client (`permessage-deflate` in practice)
//! are visible through `requested_protocols`'s sibling
//! `requested_extensions`, but no extension is ever negotiated or applied
//! to payloads.

pub use self::low_level::Frame;
pub use self::low_level::FrameError;
pub use self::low_level::FrameHeader;
pub use self::low_level::Opcode;
pub use self::websocket::Message;
pub use self::websocket::Websocket;

use std::error;
use std::fmt;
use std::sync::mpsc;
use std::vec::IntoIter as VecIntoIter;

use sha1::Digest;
use sha1::Sha1;

use crate::request::Method;
use crate::response::Upgrade;
use crate::stream::ByteStream;
use crate::Request;
use crate::Response;

pub mod low_level;
mod websocket;

/// Error that can happen when attempting to start a websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebsocketError {
    /// The request does not match a websocket request.
    ///
    /// The conditions are:
    /// - The method must be `GET`.
    /// - The `Connection` header must include `upgrade`.
    /// - The `Upgrade` header must include `websocket`.
    /// - The `Sec-WebSocket-Version` header must be `13`.
    /// - Must have a `Sec-WebSocket-Key` header.
    InvalidWebsocketRequest,

    /// The subprotocol passed to the function was not requested by the
    /// client.
    WrongSubprotocol,
}

impl fmt::Display for WebsocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WebsocketError::InvalidWebsocketRequest => {
                write!(f, "the request is not a websocket initialization request")
            }
            WebsocketError::WrongSubprotocol => {
                write!(f, "the subprotocol was not requested by the client")
            }
        }
    }
}

impl error::Error for WebsocketError {}

/// Builds a 101 `Response` that initiates the websocket protocol, and the
/// channel on which the live `Websocket` arrives once the driver has
/// handed over the connection.
pub fn start(
    request: &Request,
    subprotocol: Option<&str>,
) -> Result<(Response, mpsc::Receiver<Websocket>), WebsocketError> {
    if request.method() != Method::Get {
        return Err(WebsocketError::InvalidWebsocketRequest);
    }

    match request.header("Connection") {
        Some(h) if h.to_ascii_lowercase().contains("upgrade") => {}
        _ => return Err(WebsocketError::InvalidWebsocketRequest),
    }

    match request.header("Upgrade") {
        Some(h) if h.to_ascii_lowercase().contains("websocket") => {}
        _ => return Err(WebsocketError::InvalidWebsocketRequest),
    }

    match request.header("Sec-WebSocket-Version") {
        Some(h) if h.trim() == "13" => {}
        _ => return Err(WebsocketError::InvalidWebsocketRequest),
    }

    if let Some(sp) = subprotocol {
        if !requested_protocols(request).any(|p| p == sp) {
            return Err(WebsocketError::WrongSubprotocol);
        }
    }

    let key = match request.header("Sec-WebSocket-Key") {
        Some(h) => convert_key(h.trim()),
        None => return Err(WebsocketError::InvalidWebsocketRequest),
    };

    let (tx, rx) = mpsc::channel();

    let mut response = Response::new()
        .with_status_code(101)
        .with_header("Upgrade", "websocket")
        .with_header("Sec-WebSocket-Accept", key);
    if let Some(sp) = subprotocol {
        response = response.with_header("Sec-WebSocket-Protocol", sp.to_owned());
    }
    response.upgrade = Some(Box::new(WebsocketUpgrade { sender: tx }));

    Ok((response, rx))
}

/// Returns the list of websocket subprotocols requested by the client.
pub fn requested_protocols(request: &Request) -> RequestedProtocolsIter {
    list_header(request, "Sec-WebSocket-Protocol")
}

/// Returns the list of websocket extensions requested by the client.
///
/// Recognising an extension here does not make the codec apply it;
/// payloads are never transformed.
pub fn requested_extensions(request: &Request) -> RequestedProtocolsIter {
    list_header(request, "Sec-WebSocket-Extensions")
}

fn list_header(request: &Request, name: &str) -> RequestedProtocolsIter {
    match request.header(name) {
        None => RequestedProtocolsIter {
            iter: Vec::new().into_iter(),
        },
        Some(h) => {
            let iter = h
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_owned())
                .collect::<Vec<_>>()
                .into_iter();
            RequestedProtocolsIter { iter }
        }
    }
}

/// Iterator over the list of protocols or extensions requested by the
/// client.
pub struct RequestedProtocolsIter {
    iter: VecIntoIter<String>,
}

impl Iterator for RequestedProtocolsIter {
    type Item = String;

    #[inline]
    fn next(&mut self) -> Option<String> {
        self.iter.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

impl ExactSizeIterator for RequestedProtocolsIter {}

// Hands the raw stream over as a `Websocket` once the 101 head is out.
struct WebsocketUpgrade {
    sender: mpsc::Sender<Websocket>,
}

impl Upgrade for WebsocketUpgrade {
    fn build(&mut self, stream: ByteStream) {
        let _ = self.sender.send(Websocket::new(stream));
    }
}

/// Turns a `Sec-WebSocket-Key` into a `Sec-WebSocket-Accept`.
fn convert_key(input: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(input.as_bytes());
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    base64::encode(sha1.finalize())
}
