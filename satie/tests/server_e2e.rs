//! End-to-end exchanges against a live server on an ephemeral port.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use satie::config::{Config, PgSettings};
use satie::{Server, ShutdownHandle};

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

fn make_doc_root() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "satie-e2e-{}-{}",
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("index.html"), b"hi").unwrap();
    std::fs::write(dir.join("404.html"), b"<html>canned 404</html>").unwrap();
    std::fs::write(dir.join("error.html"), b"<html>login failed</html>").unwrap();
    dir
}

fn test_config(doc_root: &PathBuf, timeout_ms: u64) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        trig_mode: 3,
        timeout_ms,
        opt_linger: false,
        doc_root: doc_root.display().to_string(),
        thread_num: 2,
        body_limit: 1024 * 1024,
        open_log: false,
        log_level: "warn".to_string(),
        log_dir: "./log".to_string(),
        log_queue: 0,
        pg: PgSettings {
            host: String::new(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            pool_size: 1,
        },
    }
}

struct TestServer {
    port: u16,
    handle: ShutdownHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(timeout_ms: u64) -> Self {
        let root = make_doc_root();
        let server = Server::new(test_config(&root, timeout_ms)).unwrap();
        let port = server.port();
        let handle = server.shutdown_handle();
        let thread = thread::spawn(move || server.run().unwrap());
        Self {
            port,
            handle,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn content_length(headers: &str) -> usize {
    headers
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .expect("response carries Content-length")
}

/// Read one full response: header block plus Content-length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_blank_line(&buf) {
            break pos + 4;
        }
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&tmp[..n]);
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let want = content_length(&headers);
    let mut body = buf[header_end..].to_vec();
    while body.len() < want {
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(want);
    (headers, body)
}

#[test]
fn simple_get_serves_file() {
    let server = TestServer::start(60_000);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let (headers, body) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert!(headers.contains("Content-length: 2\r\n"));
    assert!(headers.contains("Connection: keep-alive\r\n"));
    assert_eq!(body, b"hi");
}

#[test]
fn keep_alive_serves_two_requests_on_one_connection() {
    let server = TestServer::start(60_000);
    let mut stream = server.connect();

    for _ in 0..2 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let (headers, body) = read_response(&mut stream);
        assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, b"hi");
    }
}

#[test]
fn missing_file_gets_canned_404_and_http10_closes() {
    let server = TestServer::start(60_000);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /missing.html HTTP/1.0\r\n\r\n")
        .unwrap();

    let (headers, body) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 404 Not Found\r\n"), "{headers}");
    assert!(headers.contains("Connection: close\r\n"));
    assert_eq!(body, b"<html>canned 404</html>");

    // Server side closes after the flush.
    let mut tmp = [0u8; 16];
    assert_eq!(stream.read(&mut tmp).unwrap(), 0);
}

#[test]
fn malformed_request_gets_400_then_close() {
    let server = TestServer::start(60_000);
    let mut stream = server.connect();
    stream.write_all(b"GARBAGE\r\n\r\n").unwrap();

    let (headers, _) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{headers}");
    assert!(headers.contains("Connection: close\r\n"));

    let mut tmp = [0u8; 16];
    assert_eq!(stream.read(&mut tmp).unwrap(), 0);
}

#[test]
fn idle_connection_is_evicted_after_timeout() {
    let server = TestServer::start(300);
    let mut stream = server.connect();

    // Send nothing; the inactivity timer must close the socket.
    let mut tmp = [0u8; 16];
    let n = stream.read(&mut tmp).unwrap();
    assert_eq!(n, 0, "server should have closed the idle connection");
}

#[test]
fn slow_post_body_is_reassembled_across_reads() {
    let server = TestServer::start(60_000);
    let mut stream = server.connect();

    stream
        .write_all(b"POST /index.html HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\n")
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(b"ping").unwrap();

    let (headers, body) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert_eq!(body, b"hi");
}

#[test]
fn login_without_sql_pool_lands_on_error_page() {
    let server = TestServer::start(60_000);
    let mut stream = server.connect();

    let body = b"user=alice&password=secret";
    let request = format!(
        "POST /login HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(request.as_bytes()).unwrap();
    stream.write_all(body).unwrap();

    let (headers, body) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert_eq!(body, b"<html>login failed</html>");
}

#[test]
fn shutdown_leaves_no_listener_behind() {
    let server = TestServer::start(60_000);
    let port = server.port;
    drop(server);

    // The listening socket is gone once run() returns.
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
}
