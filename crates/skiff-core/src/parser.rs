// src/parser.rs
//! Incremental HTTP/1.1 request parsing helpers.
//!
//! Nothing here allocates or copies: the line scanner works on the
//! connection's read buffer in place and the line parsers return slices
//! borrowed from it.

use memchr::{memchr, memchr2};

use crate::http::{LineStatus, Method};

/// Longest request target accepted, in bytes.
pub const MAX_TARGET_LEN: usize = 200;

/// Scan `buf[*checked..read]` for the end of the current line.
///
/// On [`LineStatus::Ok`] both terminator bytes are overwritten with NUL and
/// `*checked` points just past them, so the line is `buf[start..*checked - 2]`.
/// A `\r` as the very last byte read is [`LineStatus::Open`]: `*checked` stays
/// on it and the next scan re-examines it once more bytes arrive. Any other
/// lone `\r` or `\n` is [`LineStatus::Bad`].
pub fn parse_line(buf: &mut [u8], checked: &mut usize, read: usize) -> LineStatus {
    let start = *checked;
    if start >= read {
        return LineStatus::Open;
    }

    let Some(offset) = memchr2(b'\r', b'\n', &buf[start..read]) else {
        *checked = read;
        return LineStatus::Open;
    };
    let i = start + offset;
    *checked = i;

    if buf[i] == b'\r' {
        if i + 1 == read {
            return LineStatus::Open;
        }
        if buf[i + 1] == b'\n' {
            buf[i] = 0;
            buf[i + 1] = 0;
            *checked = i + 2;
            return LineStatus::Ok;
        }
        return LineStatus::Bad;
    }

    // A bare '\n' is only acceptable right after a '\r'.
    if i > 1 && buf[i - 1] == b'\r' {
        buf[i - 1] = 0;
        buf[i] = 0;
        *checked = i + 1;
        return LineStatus::Ok;
    }
    LineStatus::Bad
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: Method,
    /// Origin-form path, always starting with `/`.
    pub target: &'a str,
}

fn is_ws(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn skip_ws(text: &[u8]) -> &[u8] {
    let n = text.iter().take_while(|b| is_ws(**b)).count();
    &text[n..]
}

/// Split at the first space or tab, dropping the whitespace run.
fn split_ws(text: &[u8]) -> Option<(&[u8], &[u8])> {
    let i = memchr2(b' ', b'\t', text)?;
    Some((&text[..i], skip_ws(&text[i + 1..])))
}

fn has_parent_segment(target: &str) -> bool {
    target.split('/').any(|seg| seg == "..")
}

/// Parse `METHOD SP target SP HTTP/1.1`. `None` means a bad request.
pub fn parse_request_line(text: &[u8]) -> Option<RequestLine<'_>> {
    let (method, rest) = split_ws(text)?;
    let method = Method::from_bytes(method)?;

    let (mut target, version) = split_ws(rest)?;
    if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
        return None;
    }

    // Absolute form: drop scheme and authority.
    if target.len() >= 7 && target[..7].eq_ignore_ascii_case(b"http://") {
        let authority_and_path = &target[7..];
        let slash = memchr(b'/', authority_and_path)?;
        target = &authority_and_path[slash..];
    }

    if target.first() != Some(&b'/') || target.len() > MAX_TARGET_LEN {
        return None;
    }

    let target = std::str::from_utf8(target).ok()?;
    if has_parent_segment(target) {
        return None;
    }

    Some(RequestLine { method, target })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header<'a> {
    /// The blank line closing the header block.
    End,
    Connection { keep_alive: bool },
    ContentLength(usize),
    Host(&'a [u8]),
    /// Anything else; ignored.
    Other,
}

fn strip_name<'a>(text: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if text.len() >= name.len() && text[..name.len()].eq_ignore_ascii_case(name) {
        Some(skip_ws(&text[name.len()..]))
    } else {
        None
    }
}

/// Classify one header line. `None` means the value is malformed.
pub fn parse_header(text: &[u8]) -> Option<Header<'_>> {
    if text.is_empty() {
        return Some(Header::End);
    }

    if let Some(value) = strip_name(text, b"Connection:") {
        return Some(Header::Connection {
            keep_alive: value.eq_ignore_ascii_case(b"keep-alive"),
        });
    }

    if let Some(value) = strip_name(text, b"Content-Length:") {
        let value = std::str::from_utf8(value).ok()?;
        return value.trim_end().parse().ok().map(Header::ContentLength);
    }

    if let Some(value) = strip_name(text, b"Host:") {
        return Some(Header::Host(value));
    }

    Some(Header::Other)
}
