// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A live websocket connection, built on the frame codec.
//!
//! The wrapper owns the connection's `ByteStream` after the upgrade. It
//! reassembles fragmented messages, answers pings, and echoes the peer's
//! close handshake; the codec below it stays frame-at-a-time.

use log::debug;

use crate::stream::ByteStream;
use crate::websocket::low_level;
use crate::websocket::low_level::FrameError;
use crate::websocket::low_level::Opcode;

/// A complete message received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// A websocket connection.
pub struct Websocket {
    stream: ByteStream,
    // Payload of an unfinished fragmented message, with its first
    // frame's opcode.
    fragments: Vec<u8>,
    fragment_opcode: Option<Opcode>,
    closed: bool,
}

// What to do after a frame has been read, decided while the frame still
// borrows the stream.
enum Step {
    Reply(Opcode, Vec<u8>),
    CloseEcho(Vec<u8>),
    Message(Message),
    Nothing,
}

impl Websocket {
    pub(crate) fn new(stream: ByteStream) -> Websocket {
        Websocket {
            stream,
            fragments: Vec::new(),
            fragment_opcode: None,
            closed: false,
        }
    }

    /// True once the close handshake has happened, in either direction.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Blocks until the next complete message, answering pings along the
    /// way. Returns `None` once the peer has sent a Close frame.
    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        loop {
            if self.closed {
                return Ok(None);
            }

            let step = {
                let frame = low_level::read_frame(&mut self.stream)?;
                match frame.opcode {
                    Opcode::Ping => Step::Reply(Opcode::Pong, frame.payload.to_vec()),
                    Opcode::Pong => Step::Nothing,
                    Opcode::Close => Step::CloseEcho(frame.payload.to_vec()),
                    Opcode::Continue => {
                        if self.fragment_opcode.is_none() {
                            return Err(FrameError::InvalidMessage);
                        }
                        self.fragments.extend_from_slice(frame.payload);
                        if frame.fin {
                            let opcode = self.fragment_opcode.take().ok_or(FrameError::InvalidMessage)?;
                            let payload = std::mem::take(&mut self.fragments);
                            Step::Message(assemble(opcode, payload)?)
                        } else {
                            Step::Nothing
                        }
                    }
                    Opcode::Text | Opcode::Binary => {
                        if self.fragment_opcode.is_some() {
                            // A new data message may not interleave with
                            // an unfinished fragmented one.
                            return Err(FrameError::InvalidMessage);
                        }
                        if frame.fin {
                            Step::Message(assemble(frame.opcode, frame.payload.to_vec())?)
                        } else {
                            self.fragment_opcode = Some(frame.opcode);
                            self.fragments.extend_from_slice(frame.payload);
                            Step::Nothing
                        }
                    }
                }
            };

            match step {
                Step::Reply(opcode, payload) => {
                    low_level::write_frame(&mut self.stream, opcode, true, &payload)?;
                }
                Step::CloseEcho(payload) => {
                    debug!("peer sent close, echoing");
                    let reply = if payload.len() >= 2 {
                        u16::from_be_bytes([payload[0], payload[1]])
                    } else {
                        1000
                    };
                    let _ = low_level::close(&mut self.stream, reply);
                    self.closed = true;
                    return Ok(None);
                }
                Step::Message(message) => return Ok(Some(message)),
                Step::Nothing => {}
            }
        }
    }

    /// Sends a text message as a single frame.
    pub fn send_text(&mut self, text: &str) -> Result<(), FrameError> {
        low_level::write_frame(&mut self.stream, Opcode::Text, true, text.as_bytes())
    }

    /// Sends a binary message as a single frame.
    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), FrameError> {
        low_level::write_frame(&mut self.stream, Opcode::Binary, true, data)
    }

    /// Sends a ping with the given payload.
    pub fn ping(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        low_level::write_frame(&mut self.stream, Opcode::Ping, true, payload)
    }

    /// Sends a Close frame carrying `code` and stops the session.
    pub fn close(&mut self, code: u16) -> Result<(), FrameError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        low_level::close(&mut self.stream, code)
    }
}

fn assemble(opcode: Opcode, payload: Vec<u8>) -> Result<Message, FrameError> {
    match opcode {
        Opcode::Text => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| FrameError::InvalidMessage),
        Opcode::Binary => Ok(Message::Binary(payload)),
        _ => Err(FrameError::InvalidMessage),
    }
}
