// src/conn.rs
//! Per-socket HTTP state machine.
//!
//! A `Connection` is driven by one thread at a time: the reactor fills the
//! read buffer and flushes the response, a worker parses and builds the
//! response in between. Ownership moves with the `Box<Connection>`, so no
//! field here needs a lock.

use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::error::{SkiffError, SkiffResult};
use crate::http::{CRLF, CheckState, HttpCode, LineStatus, Method, content_type_for};
use crate::parser::{self, Header};
use crate::resource::{DocumentRoot, Lookup, MappedFile};
use crate::syscalls;
use crate::timer::TimerId;

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 2048;

/// Outcome of one [`Connection::write_response`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The socket would block; wait for writability and call again.
    Pending,
    /// Response sent, connection reset for the next request.
    KeepAlive,
    /// Response sent, the peer did not ask to keep the connection.
    Close,
}

/// Progress through the header segment followed by the body segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScatterCursor {
    header_len: usize,
    body_len: usize,
    sent: usize,
}

impl ScatterCursor {
    pub fn new(header_len: usize, body_len: usize) -> Self {
        Self {
            header_len,
            body_len,
            sent: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.header_len + self.body_len
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn remaining(&self) -> usize {
        self.total() - self.sent
    }

    /// The unsent tails of both segments.
    pub fn segments<'a>(&self, header: &'a [u8], body: &'a [u8]) -> [&'a [u8]; 2] {
        if self.sent < self.header_len {
            [&header[self.sent..self.header_len], &body[..self.body_len]]
        } else {
            let off = self.sent - self.header_len;
            [&[][..], &body[off..self.body_len]]
        }
    }

    pub fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.total());
    }
}

pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    closed: bool,
    timer: Option<TimerId>,
    written: usize,

    read_buf: [u8; READ_BUF_SIZE],
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,
    state: CheckState,

    method: Method,
    target: String,
    host: Option<String>,
    content_length: usize,
    keep_alive: bool,

    write_buf: [u8; WRITE_BUF_SIZE],
    write_idx: usize,
    file: Option<MappedFile>,
    cursor: ScatterCursor,
    code: HttpCode,
}

impl Connection {
    /// Wrap an accepted, non-blocking socket. The connection owns `fd` from
    /// here on and closes it at most once.
    pub fn new(fd: RawFd, peer: SocketAddr) -> Self {
        let mut conn = Self {
            fd,
            peer,
            closed: false,
            timer: None,
            written: 0,
            read_buf: [0; READ_BUF_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            state: CheckState::RequestLine,
            method: Method::Get,
            target: String::new(),
            host: None,
            content_length: 0,
            keep_alive: false,
            write_buf: [0; WRITE_BUF_SIZE],
            write_idx: 0,
            file: None,
            cursor: ScatterCursor::default(),
            code: HttpCode::NoRequest,
        };
        conn.init();
        conn
    }

    /// Reset parse and response state for a new request. Unparsed bytes left
    /// in the read buffer are discarded.
    pub fn init(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.state = CheckState::RequestLine;
        self.method = Method::Get;
        self.target.clear();
        self.host = None;
        self.content_length = 0;
        self.keep_alive = false;
        self.write_idx = 0;
        self.file = None;
        self.cursor = ScatterCursor::default();
        self.code = HttpCode::NoRequest;
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn timer(&self) -> Option<TimerId> {
        self.timer
    }

    pub fn set_timer(&mut self, timer: Option<TimerId>) {
        self.timer = timer;
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn code(&self) -> HttpCode {
        self.code
    }

    /// Total response bytes put on the wire over the connection's lifetime.
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// Drain the socket into the read buffer.
    ///
    /// Returns how many bytes arrived. Zero is possible on a spurious wakeup.
    /// EOF, a full buffer and socket errors are all fatal for the connection.
    pub fn read_request(&mut self) -> SkiffResult<usize> {
        let mut total = 0;
        loop {
            if self.read_idx >= READ_BUF_SIZE {
                return Err(SkiffError::ReadBufferFull);
            }
            match syscalls::read_nonblocking(self.fd, &mut self.read_buf[self.read_idx..])? {
                None => return Ok(total),
                Some(0) => return Err(SkiffError::PeerClosed),
                Some(n) => {
                    self.read_idx += n;
                    total += n;
                }
            }
        }
    }

    /// Parse what has arrived so far and, once the request is complete,
    /// resolve it against `root`.
    ///
    /// `Ok(HttpCode::NoRequest)` means more bytes are needed. Every other
    /// `Ok` code is final and ready for [`Connection::prepare_response`].
    pub fn process(&mut self, root: &DocumentRoot) -> SkiffResult<HttpCode> {
        match self.parse() {
            HttpCode::GetRequest => self.resolve(root),
            code => Ok(code),
        }
    }

    fn parse(&mut self) -> HttpCode {
        loop {
            if self.state == CheckState::Body {
                let needed = self.checked_idx.saturating_add(self.content_length);
                return if self.read_idx >= needed {
                    HttpCode::GetRequest
                } else {
                    HttpCode::NoRequest
                };
            }

            match parser::parse_line(&mut self.read_buf, &mut self.checked_idx, self.read_idx) {
                LineStatus::Ok => {}
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
            }

            let start = self.start_line;
            let end = self.checked_idx - CRLF.len();
            self.start_line = self.checked_idx;
            let line = &self.read_buf[start..end];

            match self.state {
                CheckState::RequestLine => {
                    let Some(request) = parser::parse_request_line(line) else {
                        return HttpCode::BadRequest;
                    };
                    self.method = request.method;
                    self.target.push_str(request.target);
                    self.state = CheckState::Headers;
                }
                CheckState::Headers => match parser::parse_header(line) {
                    None => return HttpCode::BadRequest,
                    Some(Header::End) if self.content_length > 0 => {
                        self.state = CheckState::Body;
                    }
                    Some(Header::End) => return HttpCode::GetRequest,
                    Some(Header::Connection { keep_alive }) => self.keep_alive = keep_alive,
                    Some(Header::ContentLength(n)) => self.content_length = n,
                    Some(Header::Host(host)) => {
                        self.host = Some(String::from_utf8_lossy(host).into_owned());
                    }
                    Some(Header::Other) => {}
                },
                CheckState::Body => return HttpCode::InternalError,
            }
        }
    }

    fn resolve(&mut self, root: &DocumentRoot) -> SkiffResult<HttpCode> {
        let code = match root.lookup(&self.target)? {
            Lookup::Missing => HttpCode::NoResource,
            Lookup::Forbidden => HttpCode::ForbiddenRequest,
            Lookup::Directory => HttpCode::BadRequest,
            Lookup::File(file) => {
                self.file = Some(file);
                HttpCode::FileRequest
            }
        };
        Ok(code)
    }

    fn add_response(&mut self, args: fmt::Arguments<'_>) -> SkiffResult<()> {
        let mut rest = &mut self.write_buf[self.write_idx..];
        let before = rest.len();
        rest.write_fmt(args).map_err(|_| SkiffError::WriteBufferFull)?;
        let written = before - rest.len();
        self.write_idx += written;
        Ok(())
    }

    fn add_headers(&mut self, content_length: usize, content_type: &str) -> SkiffResult<()> {
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.add_response(format_args!("Content-Length: {content_length}\r\n"))?;
        self.add_response(format_args!("Content-Type: {content_type}\r\n"))?;
        self.add_response(format_args!("Connection: {connection}\r\n"))?;
        self.add_response(format_args!("\r\n"))
    }

    /// Assemble the full header (and, for error statuses, the body) in the
    /// write buffer before anything is sent.
    pub fn prepare_response(&mut self, code: HttpCode) -> SkiffResult<()> {
        let (code, (status, title)) = match code.status() {
            Some(line) => (code, line),
            None => (HttpCode::InternalError, (500, "Internal Error")),
        };
        self.code = code;
        self.write_idx = 0;
        self.add_response(format_args!("HTTP/1.1 {status} {title}\r\n"))?;

        match (code, code.error_page()) {
            (HttpCode::FileRequest, _) => {
                let body_len = self.file.as_ref().map_or(0, MappedFile::len);
                let content_type = content_type_for(&self.target);
                self.add_headers(body_len, content_type)?;
                self.cursor = ScatterCursor::new(self.write_idx, body_len);
            }
            (_, page) => {
                let page = page.unwrap_or_default();
                self.file = None;
                self.add_headers(page.len(), "text/html")?;
                self.add_response(format_args!("{page}"))?;
                self.cursor = ScatterCursor::new(self.write_idx, 0);
            }
        }
        Ok(())
    }

    /// Push the prepared response out with vectored writes until it is all
    /// sent or the socket would block.
    ///
    /// The file mapping is released on completion and on error.
    pub fn write_response(&mut self) -> SkiffResult<WriteStatus> {
        while self.cursor.remaining() > 0 {
            let body = self.file.as_ref().map_or(&[][..], MappedFile::as_bytes);
            let segments = self.cursor.segments(&self.write_buf[..self.write_idx], body);
            match syscalls::writev_nonblocking(self.fd, segments) {
                Ok(None) => return Ok(WriteStatus::Pending),
                Ok(Some(n)) => {
                    self.cursor.advance(n);
                    self.written += n;
                }
                Err(e) => {
                    self.file = None;
                    return Err(e);
                }
            }
        }

        self.file = None;
        if self.keep_alive {
            self.init();
            Ok(WriteStatus::KeepAlive)
        } else {
            Ok(WriteStatus::Close)
        }
    }

    /// Close the socket. Returns `false` if it was already closed, so callers
    /// can tie one-time bookkeeping to the close that actually happened.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.file = None;
        syscalls::close_fd(self.fd);
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .field("state", &self.state)
            .field("target", &self.target)
            .field("code", &self.code)
            .finish()
    }
}
