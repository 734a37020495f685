// src/reactor.rs
//! The event loop.
//!
//! One thread owns the epoll set, the listener, the connection table and the
//! idle timers. A readable socket's bytes are pulled in here, then the
//! connection itself is moved into a [`Job`] for a pool thread to parse and
//! answer. The worker hands it back through [`Completions`] and only then is
//! the socket re-armed. Client sockets are registered one-shot, so between
//! those two points the kernel reports nothing for them and no other thread
//! can reach the connection.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::conn::{Connection, WriteStatus};
use crate::error::{SkiffError, SkiffResult};
use crate::http::HttpCode;
use crate::pool::{Task, WorkerPool};
use crate::resource::DocumentRoot;
use crate::stats::ServerStats;
use crate::syscalls::{
    self, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll, Ticker,
    Waker, epoll_event,
};
use crate::timer::{Expire, TimerList};

/// Highest socket fd the table can index.
pub const MAX_FD: usize = 65536;

const LISTENER: u64 = u64::MAX;
const TICKER: u64 = u64::MAX - 1;
const WAKER: u64 = u64::MAX - 2;

const CLIENT_READ: i32 = EPOLLIN | EPOLLRDHUP | EPOLLONESHOT | EPOLLET;
const CLIENT_WRITE: i32 = EPOLLOUT | EPOLLRDHUP | EPOLLONESHOT | EPOLLET;
const HANGUP: u32 = (EPOLLERR | EPOLLHUP | EPOLLRDHUP) as u32;

/// Upper bound on one wait so the shutdown flag is noticed.
const WAIT_TIMEOUT_MS: i32 = 1000;

/// What the reactor should do with a connection a worker handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request incomplete; wait for more bytes.
    Read,
    /// Response prepared; wait for writability.
    Write,
    Close,
}

enum Slot {
    Vacant,
    Idle(Box<Connection>),
    /// Moved out to a worker. `evicted` records an idle timeout that fired
    /// meanwhile.
    Busy { evicted: bool },
}

/// Live connections indexed by socket fd.
pub struct ConnectionTable {
    slots: Vec<Slot>,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Vacant).collect(),
        }
    }

    fn slot_mut(&mut self, fd: RawFd) -> Option<&mut Slot> {
        usize::try_from(fd).ok().and_then(|i| self.slots.get_mut(i))
    }

    /// Place a new connection. Hands it back if its fd is out of range or
    /// the slot is taken.
    pub fn insert(&mut self, conn: Box<Connection>) -> Result<(), Box<Connection>> {
        let Some(slot) = self.slot_mut(conn.fd()) else {
            return Err(conn);
        };
        if !matches!(slot, Slot::Vacant) {
            return Err(conn);
        }
        *slot = Slot::Idle(conn);
        Ok(())
    }

    /// The connection, if it is here and not out with a worker.
    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        match self.slot_mut(fd) {
            Some(Slot::Idle(conn)) => Some(conn),
            _ => None,
        }
    }

    /// Move a connection out for a worker, leaving the slot busy.
    pub fn take(&mut self, fd: RawFd) -> Option<Box<Connection>> {
        let slot = self.slot_mut(fd)?;
        swap_out(slot, Slot::Busy { evicted: false })
    }

    /// Put a connection back after a worker is done with it. Returns whether
    /// its idle timer fired while it was away.
    pub fn restore(&mut self, conn: Box<Connection>) -> bool {
        let Some(slot) = self.slot_mut(conn.fd()) else {
            return true;
        };
        let evicted = matches!(slot, Slot::Busy { evicted: true });
        *slot = Slot::Idle(conn);
        evicted
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<Box<Connection>> {
        let slot = self.slot_mut(fd)?;
        swap_out(slot, Slot::Vacant)
    }

    /// Idle connections come out for closing. Busy ones are only marked; the
    /// reactor closes them when they come back.
    pub fn evict(&mut self, fd: RawFd) -> Option<Box<Connection>> {
        let slot = self.slot_mut(fd)?;
        if let Slot::Busy { evicted } = slot {
            *evicted = true;
            return None;
        }
        swap_out(slot, Slot::Vacant)
    }
}

/// Replace an idle slot with `next` and return its connection. Other slots
/// are left alone.
fn swap_out(slot: &mut Slot, next: Slot) -> Option<Box<Connection>> {
    match std::mem::replace(slot, next) {
        Slot::Idle(conn) => Some(conn),
        other => {
            *slot = other;
            None
        }
    }
}

/// Worker to reactor hand-back queue.
pub struct Completions {
    done: Mutex<Vec<(Box<Connection>, Decision)>>,
    waker: Waker,
}

impl Completions {
    pub fn new() -> SkiffResult<Self> {
        Ok(Self {
            done: Mutex::new(Vec::new()),
            waker: Waker::new()?,
        })
    }

    pub fn push(&self, conn: Box<Connection>, decision: Decision) {
        self.done.lock().push((conn, decision));
        self.waker.wake();
    }

    pub fn drain(&self) -> Vec<(Box<Connection>, Decision)> {
        self.waker.drain();
        std::mem::take(&mut *self.done.lock())
    }

    fn fd(&self) -> RawFd {
        self.waker.fd()
    }
}

/// One connection's parse-and-respond step, run on a pool thread.
pub struct Job {
    conn: Box<Connection>,
    root: Arc<DocumentRoot>,
    done: Arc<Completions>,
    stats: Arc<ServerStats>,
}

impl Job {
    fn handle(conn: &mut Connection, root: &DocumentRoot, stats: &ServerStats) -> Decision {
        let code = match conn.process(root) {
            Ok(HttpCode::NoRequest) => return Decision::Read,
            Ok(code) => code,
            Err(e) => {
                warn!(peer = %conn.peer(), path = conn.target(), error = %e, "failed to open resource");
                return Decision::Close;
            }
        };

        stats.inc_req();
        debug!(
            peer = %conn.peer(),
            method = ?conn.method(),
            path = conn.target(),
            host = conn.host(),
            keep_alive = conn.keep_alive(),
            ?code,
            "request complete"
        );
        match conn.prepare_response(code) {
            Ok(()) => Decision::Write,
            Err(e) => {
                warn!(peer = %conn.peer(), error = %e, "failed to build response");
                Decision::Close
            }
        }
    }
}

impl Task for Job {
    fn run(self) {
        let Job {
            mut conn,
            root,
            done,
            stats,
        } = self;

        let decision = panic::catch_unwind(AssertUnwindSafe(|| {
            Job::handle(&mut conn, &root, &stats)
        }))
        .unwrap_or_else(|_| {
            error!(peer = %conn.peer(), "request handling panicked");
            Decision::Close
        });

        done.push(conn, decision);
    }
}

/// Closes whatever an expired timer was guarding.
struct Evict<'a> {
    epoll: &'a Epoll,
    table: &'a mut ConnectionTable,
    stats: &'a ServerStats,
}

impl Expire for Evict<'_> {
    fn expire(&mut self, fd: RawFd) {
        if let Some(mut conn) = self.table.evict(fd) {
            conn.set_timer(None);
            debug!(peer = %conn.peer(), "idle timeout");
            shut(self.epoll, &mut conn, self.stats);
        }
    }
}

fn shut(epoll: &Epoll, conn: &mut Connection, stats: &ServerStats) {
    let _ = epoll.delete(conn.fd());
    if conn.close() {
        stats.dec_conn();
    }
}

pub struct Reactor {
    epoll: Epoll,
    listener: OwnedFd,
    ticker: Ticker,
    completions: Arc<Completions>,
    pool: WorkerPool<Job>,
    table: ConnectionTable,
    timers: TimerList,
    root: Arc<DocumentRoot>,
    stats: Arc<ServerStats>,
    idle_timeout: Duration,
    max_connections: usize,
    events: Vec<epoll_event>,
}

impl Reactor {
    pub fn new(listener: OwnedFd, config: &ServerConfig, stats: Arc<ServerStats>) -> SkiffResult<Self> {
        if config.max_connections > MAX_FD {
            return Err(SkiffError::Config(format!(
                "max_connections may not exceed {MAX_FD}"
            )));
        }

        let epoll = Epoll::new()?;
        let ticker = Ticker::new(config.tick_interval)?;
        let completions = Arc::new(Completions::new()?);
        let pool = WorkerPool::new(config.workers, config.max_queue)?;

        epoll.add(listener.as_raw_fd(), LISTENER, EPOLLIN)?;
        epoll.add(ticker.fd(), TICKER, EPOLLIN)?;
        epoll.add(completions.fd(), WAKER, EPOLLIN)?;

        Ok(Self {
            epoll,
            listener,
            ticker,
            completions,
            pool,
            table: ConnectionTable::new(MAX_FD),
            timers: TimerList::new(config.max_connections),
            root: Arc::new(DocumentRoot::new(config.doc_root.clone())),
            stats,
            idle_timeout: config.idle_timeout,
            max_connections: config.max_connections,
            events: vec![epoll_event { events: 0, u64: 0 }; config.max_events],
        })
    }

    pub fn workers(&self) -> usize {
        self.pool.workers()
    }

    /// Run until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> SkiffResult<()> {
        while !shutdown.load(Ordering::Acquire) {
            let n = self.epoll.wait(&mut self.events, WAIT_TIMEOUT_MS)?;

            // I/O first; the idle sweep waits until the batch is handled.
            let mut sweep = false;
            for i in 0..n {
                let token = self.events[i].u64;
                let flags = self.events[i].events;
                match token {
                    LISTENER => self.accept_all(),
                    TICKER => {
                        self.ticker.drain();
                        sweep = true;
                    }
                    WAKER => self.complete(),
                    _ => self.on_client(token as RawFd, flags),
                }
            }

            if sweep {
                self.sweep();
            }
        }
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            let (fd, peer) = match syscalls::accept_connection(self.listener.as_raw_fd()) {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            };
            self.admit(fd, peer);
        }
    }

    fn admit(&mut self, fd: RawFd, peer: SocketAddr) {
        let live = self.stats.live_conns();
        if live >= self.max_connections {
            warn!(%peer, live, "{}", SkiffError::ConnectionsFull);
            syscalls::close_fd(fd);
            return;
        }

        let mut conn = Box::new(Connection::new(fd, peer));
        let Some(timer) = self.timers.add(Instant::now() + self.idle_timeout, fd) else {
            warn!(%peer, "no idle timer available, rejecting");
            return;
        };
        conn.set_timer(Some(timer));

        if let Err(e) = self.epoll.add(fd, fd as u64, CLIENT_READ) {
            warn!(%peer, error = %e, "failed to register connection");
            self.timers.del(timer);
            return;
        }

        if let Err(mut conn) = self.table.insert(conn) {
            warn!(%peer, fd, "no table slot for connection, rejecting");
            self.timers.del(timer);
            let _ = self.epoll.delete(fd);
            conn.close();
            return;
        }

        self.stats.inc_conn();
        info!(%peer, live = self.stats.live_conns(), "accepted connection");
    }

    fn on_client(&mut self, fd: RawFd, flags: u32) {
        if flags & HANGUP != 0 {
            self.close(fd);
            return;
        }
        if flags & EPOLLIN as u32 != 0 {
            self.on_readable(fd);
        } else if flags & EPOLLOUT as u32 != 0 {
            self.on_writable(fd);
        }
    }

    fn on_readable(&mut self, fd: RawFd) {
        let Some(conn) = self.table.get_mut(fd) else {
            return;
        };

        match conn.read_request() {
            Ok(n) => {
                if n > 0 {
                    if let Some(timer) = conn.timer() {
                        self.timers.adjust(timer, Instant::now() + self.idle_timeout);
                    }
                }
                self.dispatch(fd);
            }
            Err(e) => {
                match e {
                    SkiffError::PeerClosed => debug!(peer = %conn.peer(), "peer closed"),
                    e => info!(peer = %conn.peer(), error = %e, "read failed"),
                }
                self.close(fd);
            }
        }
    }

    fn dispatch(&mut self, fd: RawFd) {
        let Some(conn) = self.table.take(fd) else {
            return;
        };
        let job = Job {
            conn,
            root: self.root.clone(),
            done: self.completions.clone(),
            stats: self.stats.clone(),
        };

        if let Err(job) = self.pool.submit(job) {
            // Left un-armed; the idle timer reclaims it.
            warn!(peer = %job.conn.peer(), queued = self.pool.queued(), "{}", SkiffError::QueueFull);
            self.table.restore(job.conn);
        }
    }

    fn on_writable(&mut self, fd: RawFd) {
        let Some(conn) = self.table.get_mut(fd) else {
            return;
        };

        let before = conn.bytes_written();
        let result = conn.write_response();
        self.stats.add_bytes(conn.bytes_written() - before);

        match result {
            Ok(WriteStatus::Pending) => self.rearm(fd, CLIENT_WRITE),
            Ok(WriteStatus::KeepAlive) => self.rearm(fd, CLIENT_READ),
            Ok(WriteStatus::Close) => self.close(fd),
            Err(e) => {
                info!(peer = %conn.peer(), error = %e, "write failed");
                self.close(fd);
            }
        }
    }

    fn complete(&mut self) {
        for (conn, decision) in self.completions.drain() {
            let fd = conn.fd();
            if self.table.restore(conn) {
                debug!(fd, "closing connection evicted while busy");
                self.close(fd);
                continue;
            }
            match decision {
                Decision::Read => self.rearm(fd, CLIENT_READ),
                Decision::Write => self.rearm(fd, CLIENT_WRITE),
                Decision::Close => self.close(fd),
            }
        }
    }

    fn rearm(&mut self, fd: RawFd, interests: i32) {
        if let Err(e) = self.epoll.modify(fd, fd as u64, interests) {
            warn!(fd, error = %e, "failed to re-arm connection");
            self.close(fd);
        }
    }

    fn close(&mut self, fd: RawFd) {
        if let Some(mut conn) = self.table.remove(fd) {
            if let Some(timer) = conn.timer() {
                self.timers.del(timer);
            }
            shut(&self.epoll, &mut conn, &self.stats);
        }
    }

    fn sweep(&mut self) {
        let mut evict = Evict {
            epoll: &self.epoll,
            table: &mut self.table,
            stats: &self.stats,
        };
        let fired = self.timers.tick(Instant::now(), &mut evict);
        if fired > 0 {
            info!(
                evicted = fired,
                live = self.stats.live_conns(),
                pending = self.timers.len(),
                "idle sweep"
            );
        }
    }
}
