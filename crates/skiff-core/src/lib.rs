// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod resource;
pub mod server;
pub mod slab;
pub mod stats;
pub mod sync;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use config::ServerConfig;
pub use error::{SkiffError, SkiffResult};
pub use server::Server;
pub use stats::ServerStats;
