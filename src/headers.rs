// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Ordered, case-insensitive header storage shared by requests and
//! responses.
//!
//! A `HeaderMap` entry is either a pair of spans into an external buffer
//! (the zero-copy form produced by the parser, where both name and value
//! point into the `Request`'s buffer) or a pair of owned strings (the form
//! used when building a response). Every lookup therefore takes the
//! backing buffer as a parameter; responses pass an empty slice.

use std::borrow::Cow;
use std::error;
use std::fmt;
use std::str;

use memchr::memchr;

use crate::ascii;
use crate::ParseError;
use crate::Span;

/// Hard cap on the number of entries a single map will hold.
const MAX_ENTRIES: usize = 100;

/// Error returned when an insert would grow a `HeaderMap` past its
/// capacity bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderTooLarge;

impl fmt::Display for HeaderTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "header map is full")
    }
}

impl error::Error for HeaderTooLarge {}

enum HStr {
    Span(Span),
    Owned(Cow<'static, str>),
}

impl HStr {
    fn resolve<'a>(&'a self, buf: &'a [u8]) -> &'a [u8] {
        match self {
            HStr::Span(span) => span.slice(buf),
            HStr::Owned(text) => text.as_bytes(),
        }
    }
}

struct Entry {
    name: HStr,
    value: HStr,
}

/// Ordered sequence of (name, value) pairs with ASCII-case-insensitive
/// lookup.
pub struct HeaderMap {
    entries: Vec<Entry>,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap {
            entries: Vec::with_capacity(32),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the map but keeps its allocation, for pooling.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Appends an owned (name, value) pair.
    pub fn append<N, V>(&mut self, name: N, value: V) -> Result<(), HeaderTooLarge>
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        if self.entries.len() >= MAX_ENTRIES {
            return Err(HeaderTooLarge);
        }
        self.entries.push(Entry {
            name: HStr::Owned(name.into()),
            value: HStr::Owned(value.into()),
        });
        Ok(())
    }

    /// Appends a pair of spans into the request buffer.
    pub(crate) fn append_span(&mut self, name: Span, value: Span) -> Result<(), HeaderTooLarge> {
        if self.entries.len() >= MAX_ENTRIES {
            return Err(HeaderTooLarge);
        }
        self.entries.push(Entry {
            name: HStr::Span(name),
            value: HStr::Span(value),
        });
        Ok(())
    }

    /// Replaces every occurrence of `name` with a single owned pair.
    pub fn set<V>(&mut self, buf: &[u8], name: &'static str, value: V) -> Result<(), HeaderTooLarge>
    where
        V: Into<Cow<'static, str>>,
    {
        self.remove(buf, name);
        self.append(name, value)
    }

    /// Removes every entry named `name`; returns how many were dropped.
    pub fn remove(&mut self, buf: &[u8], name: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !e.name.resolve(buf).eq_ignore_ascii_case(name.as_bytes()));
        before - self.entries.len()
    }

    pub fn contains(&self, buf: &[u8], name: &str) -> bool {
        self.get_bytes(buf, name).is_some()
    }

    /// First value for `name`, raw bytes.
    pub fn get_bytes<'a>(&'a self, buf: &'a [u8], name: &str) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|e| e.name.resolve(buf).eq_ignore_ascii_case(name.as_bytes()))
            .map(|e| e.value.resolve(buf))
    }

    /// First value for `name` as a string. A value that is not valid
    /// UTF-8 (obs-text) is reported as absent; use `get_bytes` for those.
    pub fn get<'a>(&'a self, buf: &'a [u8], name: &str) -> Option<&'a str> {
        self.get_bytes(buf, name).and_then(|v| str::from_utf8(v).ok())
    }

    /// Span of the first value for `name`, when that value lives in the
    /// backing buffer. Owned entries yield `None`.
    pub(crate) fn get_span(&self, buf: &[u8], name: &str) -> Option<Span> {
        self.entries
            .iter()
            .find(|e| e.name.resolve(buf).eq_ignore_ascii_case(name.as_bytes()))
            .and_then(|e| match &e.value {
                HStr::Span(span) => Some(*span),
                HStr::Owned(_) => None,
            })
    }

    /// Drops entries back to a previous length. Used by the chunked-body
    /// trailer parser to undo a partial parse before retrying.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    /// Every value for `name`, in insertion order.
    pub fn get_all<'a, 'n>(
        &'a self,
        buf: &'a [u8],
        name: &'n str,
    ) -> impl Iterator<Item = &'a [u8]> + 'a
    where
        'n: 'a,
    {
        self.entries
            .iter()
            .filter(move |e| e.name.resolve(buf).eq_ignore_ascii_case(name.as_bytes()))
            .map(move |e| e.value.resolve(buf))
    }

    /// All pairs in insertion order, values as raw bytes. Header names are
    /// always ASCII, so they resolve to `&str` unconditionally.
    pub fn iter<'a>(&'a self, buf: &'a [u8]) -> impl Iterator<Item = (&'a str, &'a [u8])> + 'a {
        self.entries.iter().map(move |e| {
            let name = str::from_utf8(e.name.resolve(buf)).unwrap_or("");
            (name, e.value.resolve(buf))
        })
    }

    /// Parses a CRLF-separated header block out of `buf` starting at
    /// `start`, storing spans. Parsing ends at the empty line; the offset
    /// just past its LF is returned.
    ///
    /// Bare LF line endings are tolerated; a bare CR is not. A
    /// continuation line (obs-fold) is rejected. The whole block,
    /// terminator included, must fit in `max_block` bytes.
    pub fn parse(
        &mut self,
        buf: &[u8],
        start: usize,
        max_block: usize,
    ) -> Result<usize, ParseError> {
        let mut pos = start;

        loop {
            let rest = &buf[pos..];
            let lf = match memchr(b'\n', rest) {
                Some(lf) => lf,
                None => {
                    // No terminator in sight: either we genuinely need
                    // more bytes, or the block is already oversized.
                    if rest.len() >= max_block.saturating_sub(pos - start) {
                        return Err(ParseError::RequestHeaderFieldsTooLarge);
                    }
                    return Err(ParseError::EndOfBuffer);
                }
            };

            if pos + lf + 1 - start > max_block {
                return Err(ParseError::RequestHeaderFieldsTooLarge);
            }

            let mut line = &rest[..lf];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            if line.is_empty() {
                return Ok(pos + lf + 1);
            }

            if line[0] == b' ' || line[0] == b'\t' {
                // obs-fold continuation lines are rejected per RFC 7230.
                return Err(ParseError::BadRequest);
            }

            let colon = memchr(b':', line).ok_or(ParseError::BadRequest)?;
            let name = &line[..colon];
            if name.is_empty() || !name.iter().all(|&b| ascii::is_token(b)) {
                return Err(ParseError::BadRequest);
            }

            let mut value_start = colon + 1;
            let mut value_end = line.len();
            while value_start < value_end
                && (line[value_start] == b' ' || line[value_start] == b'\t')
            {
                value_start += 1;
            }
            while value_end > value_start
                && (line[value_end - 1] == b' ' || line[value_end - 1] == b'\t')
            {
                value_end -= 1;
            }
            if !line[value_start..value_end]
                .iter()
                .all(|&b| ascii::is_field_byte(b))
            {
                return Err(ParseError::BadRequest);
            }

            let name_span = Span::new(pos, pos + colon);
            let value_span = Span::new(pos + value_start, pos + value_end);
            self.append_span(name_span, value_span)
                .map_err(|HeaderTooLarge| ParseError::RequestHeaderFieldsTooLarge)?;

            pos += lf + 1;
        }
    }
}

impl Default for HeaderMap {
    fn default() -> HeaderMap {
        HeaderMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::HeaderMap;
    use crate::ParseError;

    #[test]
    fn parse_simple_block() {
        let buf = b"Host: example.com\r\nAccept: */*\r\n\r\nrest";
        let mut map = HeaderMap::new();
        let end = map.parse(buf, 0, 10240).unwrap();

        assert_eq!(end, buf.len() - 4);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(buf, "Host"), Some("example.com"));
        assert_eq!(map.get(buf, "Accept"), Some("*/*"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let buf = b"X-Custom-Header: yes\r\n\r\n";
        let mut map = HeaderMap::new();
        map.parse(buf, 0, 10240).unwrap();

        assert_eq!(map.get(buf, "x-custom-header"), Some("yes"));
        assert_eq!(map.get(buf, "X-CUSTOM-HEADER"), Some("yes"));
        assert_eq!(map.get(buf, "X-Custom-Header"), Some("yes"));
        assert_eq!(map.get(buf, "X-Other"), None);
    }

    #[test]
    fn values_are_trimmed() {
        let buf = b"Name:   padded value  \r\n\r\n";
        let mut map = HeaderMap::new();
        map.parse(buf, 0, 10240).unwrap();
        assert_eq!(map.get(buf, "Name"), Some("padded value"));
    }

    #[test]
    fn bare_lf_is_tolerated() {
        let buf = b"Host: x\nAccept: y\n\n";
        let mut map = HeaderMap::new();
        let end = map.parse(buf, 0, 10240).unwrap();
        assert_eq!(end, buf.len());
        assert_eq!(map.get(buf, "Host"), Some("x"));
        assert_eq!(map.get(buf, "Accept"), Some("y"));
    }

    #[test]
    fn obs_fold_is_rejected() {
        let buf = b"Host: x\r\n folded\r\n\r\n";
        let mut map = HeaderMap::new();
        assert!(matches!(
            map.parse(buf, 0, 10240),
            Err(ParseError::BadRequest)
        ));
    }

    #[test]
    fn missing_colon_is_rejected() {
        let buf = b"NoColonHere\r\n\r\n";
        let mut map = HeaderMap::new();
        assert!(matches!(
            map.parse(buf, 0, 10240),
            Err(ParseError::BadRequest)
        ));
    }

    #[test]
    fn separator_in_name_is_rejected() {
        let buf = b"Bad Header: x\r\n\r\n";
        let mut map = HeaderMap::new();
        assert!(matches!(
            map.parse(buf, 0, 10240),
            Err(ParseError::BadRequest)
        ));
    }

    #[test]
    fn incomplete_block_asks_for_more() {
        let buf = b"Host: example.com\r\nAcc";
        let mut map = HeaderMap::new();
        assert!(matches!(
            map.parse(buf, 0, 10240),
            Err(ParseError::EndOfBuffer)
        ));
    }

    #[test]
    fn block_size_limit_is_exact() {
        // "Name: v\r\n" + "\r\n" == 11 bytes.
        let buf = b"Name: v\r\n\r\n";
        let mut map = HeaderMap::new();
        assert!(map.parse(buf, 0, 11).is_ok());

        let mut map = HeaderMap::new();
        assert!(matches!(
            map.parse(buf, 0, 10),
            Err(ParseError::RequestHeaderFieldsTooLarge)
        ));
    }

    #[test]
    fn duplicates_preserve_order() {
        let buf = b"Set: a\r\nSet: b\r\n\r\n";
        let mut map = HeaderMap::new();
        map.parse(buf, 0, 10240).unwrap();

        let values: Vec<&[u8]> = map.get_all(buf, "set").collect();
        assert_eq!(values, vec![&b"a"[..], &b"b"[..]]);
        // `get` returns the first.
        assert_eq!(map.get(buf, "Set"), Some("a"));
    }

    #[test]
    fn owned_and_spanned_entries_mix() {
        let buf = b"From-Wire: 1\r\n\r\n";
        let mut map = HeaderMap::new();
        map.parse(buf, 0, 10240).unwrap();
        map.append("From-Code", "2").unwrap();

        assert_eq!(map.get(buf, "from-wire"), Some("1"));
        assert_eq!(map.get(buf, "from-code"), Some("2"));

        map.set(buf, "From-Wire", "replaced").unwrap();
        assert_eq!(map.get(buf, "From-Wire"), Some("replaced"));
        assert_eq!(map.len(), 2);
    }
}
