// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Parsing data sent with `multipart/form-data` (RFC 7578).
//!
//! The parser splits the body on the boundary, reads each part's headers
//! with the same machinery as request headers, and sorts the entries into
//! two ordered multimaps: textual fields and uploaded files. Everything
//! borrows from the body buffer; a form lives as long as the `Request` it
//! came from.

use std::error;
use std::fmt;
use std::str;

use log::debug;
use mime::Mime;
use rand::distributions::Alphanumeric;
use rand::Rng;
use twoway::find_bytes;

use crate::headers::HeaderMap;
use crate::request::RequestBody;
use crate::Request;

/// Error that can happen when decoding multipart data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartError {
    /// The `Content-Type` header of the request indicates that it doesn't
    /// contain multipart data or is invalid.
    WrongContentType,
    /// The boundary parameter is empty or longer than the 70 bytes RFC
    /// 2046 allows.
    InvalidBoundary,
    /// The terminating `--boundary--` marker is absent.
    FinalBoundaryMissing,
    /// A part's headers or Content-Disposition could not be parsed.
    InvalidPart,
    /// The body was spooled to disk; multipart parsing needs it buffered.
    BodyNotBuffered,
}

impl fmt::Display for MultipartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MultipartError::WrongContentType => {
                write!(f, "the request does not contain multipart/form-data")
            }
            MultipartError::InvalidBoundary => write!(f, "invalid multipart boundary"),
            MultipartError::FinalBoundaryMissing => {
                write!(f, "the final multipart boundary is missing")
            }
            MultipartError::InvalidPart => write!(f, "malformed multipart part"),
            MultipartError::BodyNotBuffered => {
                write!(f, "the request body is spooled to disk, not buffered")
            }
        }
    }
}

impl error::Error for MultipartError {}

/// One uploaded file from a `multipart/form-data` body.
#[derive(Debug, PartialEq)]
pub struct FilePart<'a> {
    /// The filename the client supplied, if any. Never sanitized; do not
    /// use it as a path.
    pub filename: Option<&'a str>,
    /// The part's declared content type, `application/octet-stream` when
    /// absent.
    pub content_type: Mime,
    /// The raw file bytes, borrowed from the request buffer.
    pub data: &'a [u8],
}

/// A parsed `multipart/form-data` body: ordered field and file multimaps.
#[derive(Debug, PartialEq)]
pub struct MultipartForm<'a> {
    fields: Vec<(&'a str, &'a str)>,
    files: Vec<(&'a str, FilePart<'a>)>,
}

impl<'a> MultipartForm<'a> {
    /// First value of the textual field named `name`.
    pub fn field(&self, name: &str) -> Option<&'a str> {
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, v)| v)
    }

    /// Every value of the textual field named `name`, in body order.
    pub fn field_values<'s>(&'s self, name: &'s str) -> impl Iterator<Item = &'a str> + 's {
        self.fields
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|&(_, v)| v)
    }

    /// First file uploaded under `name`.
    pub fn file(&self, name: &str) -> Option<&FilePart<'a>> {
        self.files.iter().find(|(n, _)| *n == name).map(|(_, f)| f)
    }

    /// All fields in body order.
    pub fn fields(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.fields.iter().copied()
    }

    /// All files in body order.
    pub fn files(&self) -> impl Iterator<Item = (&'a str, &FilePart<'a>)> + '_ {
        self.files.iter().map(|(n, f)| (*n, f))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.files.is_empty()
    }
}

/// Attempts to decode the content of the request as `multipart/form-data`
/// data.
///
/// The body must still be in memory; a request whose body was spooled to
/// disk is reported as `BodyNotBuffered`.
pub fn get_multipart_input(request: &Request) -> Result<MultipartForm<'_>, MultipartError> {
    let content_type = request
        .header("Content-Type")
        .ok_or(MultipartError::WrongContentType)?;

    let body = match request.data() {
        Some(RequestBody::Buffered(body)) => body,
        Some(RequestBody::Spooled { .. }) => return Err(MultipartError::BodyNotBuffered),
        None => &[],
    };

    parse_multipart(content_type, body)
}

/// Parses a `multipart/form-data` body given the request's `Content-Type`
/// value and the body bytes.
pub fn parse_multipart<'a>(
    content_type: &str,
    body: &'a [u8],
) -> Result<MultipartForm<'a>, MultipartError> {
    if !content_type
        .trim_start()
        .get(.."multipart/form-data".len())
        .map_or(false, |p| p.eq_ignore_ascii_case("multipart/form-data"))
    {
        return Err(MultipartError::WrongContentType);
    }

    let boundary = multipart_boundary(content_type).ok_or(MultipartError::WrongContentType)?;
    if boundary.is_empty() || boundary.len() > 70 {
        return Err(MultipartError::InvalidBoundary);
    }

    let delim = {
        let mut delim = Vec::with_capacity(boundary.len() + 2);
        delim.extend_from_slice(b"--");
        delim.extend_from_slice(boundary.as_bytes());
        delim
    };
    let final_marker = {
        let mut marker = delim.clone();
        marker.extend_from_slice(b"--");
        marker
    };
    if find_bytes(body, &final_marker).is_none() {
        return Err(MultipartError::FinalBoundaryMissing);
    }

    let crlf_delim = {
        let mut sep = Vec::with_capacity(delim.len() + 2);
        sep.extend_from_slice(b"\r\n");
        sep.extend_from_slice(&delim);
        sep
    };

    // Anything before the first boundary is preamble and is skipped.
    let mut cursor = if body.starts_with(&delim) {
        delim.len()
    } else {
        let first = find_bytes(body, &crlf_delim).ok_or(MultipartError::FinalBoundaryMissing)?;
        first + crlf_delim.len()
    };

    let mut form = MultipartForm {
        fields: Vec::new(),
        files: Vec::new(),
    };

    loop {
        // `cursor` sits just past "--boundary".
        let rest = &body[cursor..];
        if rest.starts_with(b"--") {
            break;
        }
        let after_newline = if rest.starts_with(b"\r\n") {
            cursor + 2
        } else if rest.starts_with(b"\n") {
            cursor + 1
        } else {
            return Err(MultipartError::InvalidPart);
        };

        let sep = find_bytes(&body[after_newline..], &crlf_delim)
            .ok_or(MultipartError::FinalBoundaryMissing)?;
        let part = &body[after_newline..after_newline + sep];
        read_part(part, &mut form)?;

        cursor = after_newline + sep + crlf_delim.len();
    }

    Ok(form)
}

// One part: headers, then a blank line, then the part body.
fn read_part<'a>(part: &'a [u8], form: &mut MultipartForm<'a>) -> Result<(), MultipartError> {
    let mut headers = HeaderMap::new();
    let body_start = headers
        .parse(part, 0, usize::MAX)
        .map_err(|_| MultipartError::InvalidPart)?;
    let data = &part[body_start..];

    let disposition = headers
        .get_span(part, "Content-Disposition")
        .map(|span| span.slice(part))
        .ok_or(MultipartError::InvalidPart)?;
    let disposition = str::from_utf8(disposition).map_err(|_| MultipartError::InvalidPart)?;

    let mut segments = disposition.split(';');
    match segments.next() {
        Some(kind) if kind.trim().eq_ignore_ascii_case("form-data") => {}
        _ => return Err(MultipartError::InvalidPart),
    }

    let name = disposition_param(disposition, "name").ok_or(MultipartError::InvalidPart)?;
    let filename = disposition_param(disposition, "filename");

    if let Some(filename) = filename {
        let content_type = headers
            .get_span(part, "Content-Type")
            .map(|span| span.slice(part))
            .and_then(|v| str::from_utf8(v).ok())
            .and_then(|v| v.trim().parse::<Mime>().ok())
            .unwrap_or(mime::APPLICATION_OCTET_STREAM);

        form.files.push((
            name,
            FilePart {
                filename: if filename.is_empty() {
                    None
                } else {
                    Some(filename)
                },
                content_type,
                data,
            },
        ));
    } else {
        let value = str::from_utf8(data).map_err(|_| MultipartError::InvalidPart)?;
        form.fields.push((name, value));
    }

    Ok(())
}

// Extracts a Content-Disposition parameter. `key*` extended parameters
// (RFC 2231) run through `decode_extended_value`, which currently leaves
// them untouched.
fn disposition_param<'a>(disposition: &'a str, key: &str) -> Option<&'a str> {
    for segment in disposition.split(';').skip(1) {
        let segment = segment.trim();
        let eq = match segment.find('=') {
            Some(eq) => eq,
            None => continue,
        };
        let (k, v) = segment.split_at(eq);
        let v = &v[1..];

        let k = k.trim();
        if k.eq_ignore_ascii_case(key) {
            return Some(trim_quotes(v.trim()));
        }
        if k.len() == key.len() + 1
            && k.ends_with('*')
            && k[..key.len()].eq_ignore_ascii_case(key)
        {
            return Some(decode_extended_value(trim_quotes(v.trim())));
        }
    }
    None
}

// Hook for RFC 2231 extended values and continuations. Decoding is
// deliberately not performed; the value passes through unchanged.
fn decode_extended_value(value: &str) -> &str {
    debug!("extended parameter value passed through undecoded");
    value
}

fn trim_quotes(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}

// The boundary parameter of a Content-Type header, unquoted.
fn multipart_boundary(content_type: &str) -> Option<&str> {
    const BOUNDARY: &str = "boundary=";

    let start = content_type.find(BOUNDARY)? + BOUNDARY.len();
    let end = content_type[start..]
        .find(';')
        .map_or(content_type.len(), |end| start + end);
    Some(trim_quotes(content_type[start..end].trim()))
}

/// Writes the form back out with the given boundary. With the boundary a
/// parsed body came from, the result is byte-equal to the original modulo
/// part-header ordering.
pub fn encode(form: &MultipartForm, boundary: &str, out: &mut Vec<u8>) {
    for (name, value) in &form.fields {
        out.extend_from_slice(b"--");
        out.extend_from_slice(boundary.as_bytes());
        out.extend_from_slice(b"\r\nContent-Disposition: form-data; name=\"");
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b"\"\r\n\r\n");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    for (name, file) in &form.files {
        out.extend_from_slice(b"--");
        out.extend_from_slice(boundary.as_bytes());
        out.extend_from_slice(b"\r\nContent-Disposition: form-data; name=\"");
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b"\"");
        if let Some(filename) = file.filename {
            out.extend_from_slice(b"; filename=\"");
            out.extend_from_slice(filename.as_bytes());
            out.extend_from_slice(b"\"");
        }
        out.extend_from_slice(b"\r\nContent-Type: ");
        out.extend_from_slice(file.content_type.as_ref().as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(file.data);
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"--");
    out.extend_from_slice(boundary.as_bytes());
    out.extend_from_slice(b"--");
}

/// A random boundary suitable for encoding a new form.
pub fn random_boundary() -> String {
    let tail: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("----EnclumeBoundary{}", tail)
}
