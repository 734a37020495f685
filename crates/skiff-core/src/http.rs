// src/http.rs
use std::path::Path;

/// Only GET is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else {
            None
        }
    }
}

/// Which part of the request the parser is in. Only moves forward until the
/// connection is reset for the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Headers,
    Body,
}

/// Result of scanning for one CRLF-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line was found and its terminator consumed.
    Ok,
    /// Malformed terminator.
    Bad,
    /// No terminator yet; read more.
    Open,
}

/// Outcome of parsing and resolving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Request incomplete; keep reading.
    NoRequest,
    /// A complete request was parsed; resolve it.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    FileRequest,
    /// Unreachable parser state.
    InternalError,
}

impl HttpCode {
    /// Status line parts for codes that produce a response.
    pub fn status(self) -> Option<(u16, &'static str)> {
        match self {
            HttpCode::FileRequest => Some((200, "OK")),
            HttpCode::BadRequest => Some((400, "Bad Request")),
            HttpCode::ForbiddenRequest => Some((403, "Forbidden")),
            HttpCode::NoResource => Some((404, "Not Found")),
            HttpCode::InternalError => Some((500, "Internal Error")),
            HttpCode::NoRequest | HttpCode::GetRequest => None,
        }
    }

    /// Body sent with error statuses.
    pub fn error_page(self) -> Option<&'static str> {
        match self {
            HttpCode::BadRequest => {
                Some("Your request has bad syntax or is inherently impossible to satisfy.\n")
            }
            HttpCode::ForbiddenRequest => {
                Some("You do not have permission to get file from this server.\n")
            }
            HttpCode::NoResource => Some("The requested file was not found on this server.\n"),
            HttpCode::InternalError => {
                Some("There was an unusual problem serving the requested file.\n")
            }
            _ => None,
        }
    }
}

pub const CRLF: &[u8] = b"\r\n";

/// Content-Type by extension of the last path component.
pub fn content_type_for(target: &str) -> &'static str {
    let ext = Path::new(target)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    if ext.eq_ignore_ascii_case("pdf") {
        "application/pdf"
    } else if ext.eq_ignore_ascii_case("zip") {
        "application/octet-stream"
    } else {
        "text/html"
    }
}
