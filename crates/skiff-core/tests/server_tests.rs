use std::fs::{self, File, Permissions};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use skiff_core::{Server, ServerConfig, ServerStats, SkiffResult};

const INDEX: &[u8] = b"<!doctype html><title>skiff</title><p>It works.</p>\n";

struct TestServer {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<SkiffResult<()>>>,
    root: tempfile::TempDir,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(|c| c)
    }

    fn start_with(tune: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        let root = tempfile::tempdir().unwrap();
        put(root.path().join("index.html"), INDEX);
        put(root.path().join("big.zip"), &vec![0xA5; 256 * 1024]);
        fs::create_dir(root.path().join("docs")).unwrap();
        fs::set_permissions(root.path().join("docs"), Permissions::from_mode(0o755)).unwrap();

        let config = tune(
            ServerConfig::new(0)
                .host("127.0.0.1")
                .doc_root(root.path())
                .workers(2)
                .tick_interval(Duration::from_millis(50))
                .idle_timeout(Duration::from_millis(400)),
        );
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr();
        let stats = server.stats();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::spawn(move || server.serve_until(flag));

        Self {
            addr,
            stats,
            shutdown,
            handle: Some(handle),
            root,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn put(path: impl AsRef<std::path::Path>, body: &[u8]) {
    File::create(path.as_ref()).unwrap().write_all(body).unwrap();
    fs::set_permissions(path.as_ref(), Permissions::from_mode(0o644)).unwrap();
}

struct Response {
    status: u16,
    head: String,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().find_map(|line| {
            let (k, v) = line.split_once(": ")?;
            k.eq_ignore_ascii_case(name).then_some(v)
        })
    }
}

fn read_response(stream: &mut TcpStream) -> Response {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let status = head[9..12].parse().unwrap();
    let mut response = Response {
        status,
        head,
        body: Vec::new(),
    };

    let len: usize = response.header("Content-Length").unwrap().parse().unwrap();
    response.body = vec![0u8; len];
    stream.read_exact(&mut response.body).unwrap();
    response
}

fn get(server: &TestServer, target: &str) -> Response {
    let mut stream = server.connect();
    write!(stream, "GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    read_response(&mut stream)
}

/// The server has closed its end: EOF or a reset.
fn assert_closed_by_peer(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, got {n} bytes"),
        Err(e) => assert!(
            matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted),
            "unexpected error {e}"
        ),
    }
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn serves_file_with_exact_body() {
    let server = TestServer::start();
    let res = get(&server, "/index.html");

    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Length"), Some(INDEX.len().to_string().as_str()));
    assert_eq!(res.header("Content-Type"), Some("text/html"));
    assert_eq!(res.header("Connection"), Some("close"));
    assert_eq!(res.body, INDEX);
}

#[test]
fn large_file_survives_partial_writes() {
    let server = TestServer::start();
    let res = get(&server, "/big.zip");

    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Type"), Some("application/octet-stream"));
    assert_eq!(res.body.len(), 256 * 1024);
    assert!(res.body.iter().all(|b| *b == 0xA5));
    wait_for("bytes to be counted", || {
        server.stats.bytes_sent() >= 256 * 1024
    });
}

#[test]
fn missing_path_is_404() {
    let server = TestServer::start();
    let res = get(&server, "/nowhere.html");
    assert_eq!(res.status, 404);
    assert_eq!(res.body, b"The requested file was not found on this server.\n");
}

#[test]
fn directory_is_400() {
    let server = TestServer::start();
    assert_eq!(get(&server, "/docs").status, 400);
}

#[test]
fn malformed_request_is_400() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.write_all(b"DELETE /index.html HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_response(&mut stream).status, 400);
}

#[test]
fn keep_alive_answers_sequential_requests() {
    let server = TestServer::start();
    let mut stream = server.connect();

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let first = read_response(&mut stream);
    assert_eq!(first.status, 200);
    assert_eq!(first.header("Connection"), Some("keep-alive"));
    assert_eq!(first.body, INDEX);

    stream
        .write_all(b"GET /missing HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let second = read_response(&mut stream);
    assert_eq!(second.status, 404);

    stream.write_all(b"GET /index.html HTTP/1.1\r\n\r\n").unwrap();
    let third = read_response(&mut stream);
    assert_eq!(third.status, 200);
    assert_eq!(third.body, INDEX);
    assert_closed_by_peer(&mut stream);

    assert_eq!(server.stats.requests(), 3);
}

#[test]
fn request_split_across_segments() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.set_nodelay(true).unwrap();

    for piece in [&b"GE"[..], b"T /index", b".html HTTP/1.1\r", b"\nHost: x\r\n", b"\r\n"] {
        stream.write_all(piece).unwrap();
        thread::sleep(Duration::from_millis(20));
    }

    let res = read_response(&mut stream);
    assert_eq!(res.status, 200);
    assert_eq!(res.body, INDEX);
}

#[test]
fn idle_connection_is_reaped_and_slot_reused() {
    let server = TestServer::start();
    let mut idle = server.connect();
    wait_for("the connection to be accepted", || server.stats.live_conns() == 1);

    assert_closed_by_peer(&mut idle);
    wait_for("the live count to drop", || server.stats.live_conns() == 0);

    // The server keeps accepting after the eviction.
    assert_eq!(get(&server, "/index.html").status, 200);
}

#[test]
fn reading_pushes_the_idle_deadline_back() {
    let server = TestServer::start();
    let mut stream = server.connect();

    // Trickle bytes in for longer than the idle timeout.
    for piece in [&b"GET /index.html"[..], b" HTTP/1.1\r\n", b"Host: x\r\n", b"X: y\r\n"] {
        stream.write_all(piece).unwrap();
        thread::sleep(Duration::from_millis(200));
    }
    stream.write_all(b"\r\n").unwrap();

    assert_eq!(read_response(&mut stream).status, 200);
}

#[test]
fn connections_beyond_the_limit_are_refused() {
    let server = TestServer::start_with(|c| c.max_connections(1).idle_timeout(Duration::from_secs(10)));

    let _first = server.connect();
    wait_for("the first connection", || server.stats.live_conns() == 1);

    let mut second = server.connect();
    assert_closed_by_peer(&mut second);
    assert_eq!(server.stats.live_conns(), 1);
}

#[test]
fn fifo_in_root_does_not_stall_workers() {
    let server = TestServer::start_with(|c| c.workers(1));
    let fifo = server.root.path().join("pipe.html");
    let c_path = std::ffi::CString::new(fifo.as_os_str().as_encoded_bytes()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) }, 0);
    fs::set_permissions(&fifo, Permissions::from_mode(0o644)).unwrap();

    assert_eq!(get(&server, "/pipe.html").status, 403);
    // The single worker is still free for ordinary files.
    let res = get(&server, "/index.html");
    assert_eq!(res.status, 200);
    assert_eq!(res.body, INDEX);
    wait_for("both connections to close", || server.stats.live_conns() == 0);
}
