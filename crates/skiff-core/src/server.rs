// src/server.rs
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::info;

use crate::config::ServerConfig;
use crate::error::SkiffResult;
use crate::reactor::Reactor;
use crate::stats::ServerStats;
use crate::syscalls;

pub struct Server {
    reactor: Reactor,
    addr: SocketAddr,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Validate `config`, bind the listener and start the worker pool.
    /// Nothing is accepted until [`Server::serve`] runs.
    pub fn bind(config: ServerConfig) -> SkiffResult<Self> {
        config.validate()?;
        syscalls::ignore_sigpipe();

        let listener = syscalls::create_listen_socket(&config.host, config.port, config.backlog)?;
        let addr = syscalls::local_addr(listener.as_raw_fd())?;
        let stats = Arc::new(ServerStats::new());
        let reactor = Reactor::new(listener, &config, stats.clone())?;

        info!(
            %addr,
            root = %config.doc_root.display(),
            workers = reactor.workers(),
            idle_timeout = ?config.idle_timeout,
            "skiff listening"
        );

        Ok(Self {
            reactor,
            addr,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Serve until the process is terminated.
    pub fn serve(self) -> SkiffResult<()> {
        self.serve_until(Arc::new(AtomicBool::new(false)))
    }

    /// Serve until `shutdown` is set. Open connections are closed and the
    /// workers joined before this returns.
    pub fn serve_until(mut self, shutdown: Arc<AtomicBool>) -> SkiffResult<()> {
        self.reactor.run(&shutdown)?;
        info!(
            requests = self.stats.requests(),
            bytes_sent = self.stats.bytes_sent(),
            "skiff stopped"
        );
        Ok(())
    }
}
