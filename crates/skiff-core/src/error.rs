// src/error.rs
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Central error type for the skiff engine.
///
/// Protocol and resource problems never show up here: the connection state
/// machine maps them to an HTTP status and keeps going. What remains are the
/// failures that end a single connection (transport), refuse new work
/// (capacity), or abort startup.
#[derive(Debug, Error)]
pub enum SkiffError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer performed an orderly shutdown (`recv` returned 0).
    #[error("peer closed the connection")]
    PeerClosed,

    /// The request did not fit in the fixed read buffer.
    #[error("read buffer is full")]
    ReadBufferFull,

    /// The response header did not fit in the fixed write buffer.
    #[error("response header does not fit in the write buffer")]
    WriteBufferFull,

    /// The requested file could not be memory-mapped.
    #[error("failed to map {}: {source}", path.display())]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The worker pool's task queue reached its bound.
    #[error("task queue is full")]
    QueueFull,

    /// The live-connection table reached its capacity.
    #[error("connection table is full")]
    ConnectionsFull,

    /// Startup configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type SkiffResult<T> = Result<T, SkiffError>;
