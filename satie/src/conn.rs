//! Per-connection state and the reactor/worker handoff handle.
//!
//! Exactly one side mutates `Connection` at a time: the reactor while the
//! busy flag is clear, the worker that set it otherwise. The atomics live
//! outside the mutex so the reactor and the timer can consult them without
//! contending with an in-flight task.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use libc::c_int;

use crate::buffer::ByteBuffer;
use crate::http::Request;
use crate::parser::HttpRequestParser;
use crate::response::Response;

/// Where the connection is in its request/response cycle. Drives which epoll
/// interest the reactor re-arms after a worker completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reading,
    Writing,
    Closing,
}

pub struct Connection {
    pub fd: c_int,
    pub peer: SocketAddr,
    pub read_buf: ByteBuffer,
    pub write_buf: ByteBuffer,
    pub parser: HttpRequestParser,
    pub response: Option<Response>,
    /// Bytes of the mapped file body already written.
    pub file_off: usize,
    pub keep_alive: bool,
    pub phase: Phase,
    /// Completed exchanges on this connection (keep-alive reuse count).
    pub requests_served: u32,
}

impl Connection {
    pub fn new(fd: c_int, peer: SocketAddr, body_limit: usize) -> Self {
        Self {
            fd,
            peer,
            read_buf: ByteBuffer::new(),
            write_buf: ByteBuffer::new(),
            parser: HttpRequestParser::new(body_limit),
            response: None,
            file_off: 0,
            keep_alive: false,
            phase: Phase::Reading,
            requests_served: 0,
        }
    }

    pub fn take_request(&mut self) -> Option<Request> {
        self.parser.take_request()
    }

    /// Total bytes still owed to the peer: buffered headers plus the unsent
    /// tail of the mapped body.
    pub fn pending_write_bytes(&self) -> usize {
        let file_rest = self
            .response
            .as_ref()
            .and_then(|r| r.file())
            .map(|f| f.len() - self.file_off)
            .unwrap_or(0);
        self.write_buf.readable_bytes() + file_rest
    }

    /// Rewind for the next request on a keep-alive connection. Any bytes a
    /// client pipelined behind the previous request are discarded.
    pub fn reset_for_next_request(&mut self) {
        self.read_buf.clear();
        self.write_buf.clear();
        self.parser.reset();
        self.response = None;
        self.file_off = 0;
        self.phase = Phase::Reading;
        self.requests_served += 1;
    }
}

/// Shared handle: the table owns it, the reactor and at most one worker
/// task hold clones while the connection is live.
pub struct ConnHandle {
    pub id: c_int,
    pub busy: AtomicBool,
    pub pending_close: AtomicBool,
    pub state: Mutex<Connection>,
}

impl ConnHandle {
    pub fn new(conn: Connection) -> Self {
        Self {
            id: conn.fd,
            busy: AtomicBool::new(false),
            pending_close: AtomicBool::new(false),
            state: Mutex::new(conn),
        }
    }
}
