// src/logging.rs
//! Log sink setup.
//!
//! The server writes its log to an append-only file. The level is controlled
//! by `RUST_LOG` and defaults to `info`:
//!
//! ```bash
//! RUST_LOG=skiff_core=debug skiff 8080 /var/log/skiff.log
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Open `path` for appending, creating it if needed.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber writing to `file`.
///
/// Fails if a global subscriber is already set.
pub fn init_file_logging(file: File) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(io::Error::other)
}
