// src/config.rs
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{SkiffError, SkiffResult};

/// Server configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0)
    pub host: String,

    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,

    /// Directory every request target is resolved under (default: ./root)
    pub doc_root: PathBuf,

    /// Worker threads (default: CPU count)
    pub workers: usize,

    /// Bound on tasks waiting for a worker (default: 500)
    pub max_queue: usize,

    /// Bound on simultaneously open client sockets (default: 1000)
    pub max_connections: usize,

    /// Close a connection after this long without a successful read (default: 15s)
    pub idle_timeout: Duration,

    /// Interval between idle sweeps (default: 5s)
    pub tick_interval: Duration,

    /// `listen(2)` backlog (default: 5)
    pub backlog: i32,

    /// Readiness events drained per wait (default: 500)
    pub max_events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            doc_root: PathBuf::from("./root"),
            workers: num_cpus::get(),
            max_queue: 500,
            max_connections: 1000,
            idle_timeout: Duration::from_secs(15),
            tick_interval: Duration::from_secs(5),
            backlog: 5,
            max_events: 500,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Defaults overridden by `SKIFF_*` variables (with .env support).
    /// Values that fail to parse keep their default.
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let d = Self::default();
        Self {
            host: std::env::var("SKIFF_HOST").unwrap_or(d.host),
            port: d.port,
            doc_root: std::env::var("SKIFF_DOC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.doc_root),
            workers: env_or("SKIFF_WORKERS", d.workers),
            max_queue: env_or("SKIFF_MAX_QUEUE", d.max_queue),
            max_connections: env_or("SKIFF_MAX_CONNECTIONS", d.max_connections),
            idle_timeout: Duration::from_secs(env_or(
                "SKIFF_IDLE_TIMEOUT_SECS",
                d.idle_timeout.as_secs(),
            )),
            tick_interval: Duration::from_secs(env_or("SKIFF_TICK_SECS", d.tick_interval.as_secs())),
            backlog: env_or("SKIFF_BACKLOG", d.backlog),
            max_events: d.max_events,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn doc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.doc_root = root.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn validate(&self) -> SkiffResult<()> {
        let zero = if self.workers == 0 {
            Some("workers")
        } else if self.max_queue == 0 {
            Some("max_queue")
        } else if self.max_connections == 0 {
            Some("max_connections")
        } else if self.tick_interval.is_zero() {
            Some("tick_interval")
        } else if self.max_events == 0 {
            Some("max_events")
        } else {
            None
        };

        match zero {
            Some(field) => Err(SkiffError::Config(format!("{field} must be greater than zero"))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.max_connections, 1000);
        assert_eq!(c.max_queue, 500);
        assert_eq!(c.backlog, 5);
        assert_eq!(c.max_events, 500);
        assert_eq!(c.tick_interval, Duration::from_secs(5));
        assert_eq!(c.idle_timeout, c.tick_interval * 3);
        assert!(c.workers >= 1);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let c = ServerConfig::new(8080)
            .host("127.0.0.1")
            .doc_root("/srv/www")
            .workers(2)
            .idle_timeout(Duration::from_millis(300));
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 8080);
        assert_eq!(c.doc_root, PathBuf::from("/srv/www"));
        assert_eq!(c.workers, 2);
        assert_eq!(c.idle_timeout, Duration::from_millis(300));
    }

    #[test]
    fn validate_rejects_zeros() {
        for c in [
            ServerConfig::default().workers(0),
            ServerConfig::default().max_queue(0),
            ServerConfig::default().max_connections(0),
            ServerConfig::default().tick_interval(Duration::ZERO),
        ] {
            assert!(matches!(c.validate(), Err(SkiffError::Config(_))));
        }
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        // Names are unique to this test so parallel tests do not race on them.
        unsafe {
            std::env::set_var("SKIFF_TEST_ENV_OR_GOOD", " 42 ");
            std::env::set_var("SKIFF_TEST_ENV_OR_BAD", "lots");
        }
        assert_eq!(env_or("SKIFF_TEST_ENV_OR_GOOD", 7usize), 42);
        assert_eq!(env_or("SKIFF_TEST_ENV_OR_BAD", 7usize), 7);
        assert_eq!(env_or("SKIFF_TEST_ENV_OR_UNSET", 7usize), 7);
    }
}
