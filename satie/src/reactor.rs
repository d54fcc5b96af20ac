//! The single-threaded readiness loop.
//!
//! The reactor owns the connection table, the timer heap, and the epoll
//! instance. Workers never touch any of them: a worker task parses and
//! builds inside the connection's mutex, clears the busy flag, and posts the
//! connection id down the wake pipe; the reactor re-arms epoll from the
//! connection's phase. Close always happens here.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libc::c_int;
use tracing::{debug, info, trace, warn};

use satie_pg::PgPool;

use crate::config::Config;
use crate::conn::{ConnHandle, Connection, Phase};
use crate::error::SatieResult;
use crate::http::{Method, Request};
use crate::parser::ParseStatus;
use crate::pool::WorkerPool;
use crate::response::Response;
use crate::syscalls::{
    self, epoll_event, Epoll, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT,
    EPOLLRDHUP,
};
use crate::table::ConnectionTable;
use crate::timer::{HeapTimer, TimerCallback};

const MAX_EVENTS: usize = 1024;
const MAX_CONNECTIONS: usize = 65536;
/// Re-arm interval when an expiry lands on a busy connection.
const EXPIRY_GRACE: Duration = Duration::from_secs(2);

/// State shared with worker tasks.
pub struct EngineContext {
    pub doc_root: PathBuf,
    pub wake_fd: c_int,
    pub sql: Option<Arc<PgPool>>,
}

pub struct Reactor {
    epoll: Epoll,
    listen_fd: c_int,
    wake_rx: c_int,
    table: ConnectionTable,
    timer: HeapTimer,
    expired: Rc<RefCell<Vec<c_int>>>,
    pool: WorkerPool,
    ctx: Arc<EngineContext>,
    timeout: Duration,
    body_limit: usize,
    listen_et: bool,
    conn_et: bool,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(
        listen_fd: c_int,
        wake_rx: c_int,
        cfg: &Config,
        ctx: Arc<EngineContext>,
        shutdown: Arc<AtomicBool>,
    ) -> SatieResult<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            listen_fd,
            wake_rx,
            table: ConnectionTable::new(),
            timer: HeapTimer::new(),
            expired: Rc::new(RefCell::new(Vec::new())),
            pool: WorkerPool::new(cfg.thread_num),
            ctx,
            timeout: Duration::from_millis(cfg.timeout_ms),
            body_limit: cfg.body_limit,
            listen_et: cfg.listener_edge_triggered(),
            conn_et: cfg.conn_edge_triggered(),
            shutdown,
        })
    }

    fn conn_flags(&self) -> u32 {
        EPOLLRDHUP | EPOLLONESHOT | if self.conn_et { EPOLLET } else { 0 }
    }

    pub fn run(&mut self) -> SatieResult<()> {
        let listen_flags = EPOLLIN | if self.listen_et { EPOLLET } else { 0 };
        self.epoll.add(self.listen_fd, self.listen_fd as u64, listen_flags)?;
        // The wake pipe stays level-triggered; it is drained on every event.
        self.epoll.add(self.wake_rx, self.wake_rx as u64, EPOLLIN)?;

        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout_ms = if self.timeout.is_zero() {
                -1
            } else {
                match self.timer.next_tick_ms() {
                    Some(ms) => ms.min(i32::MAX as u64) as i32,
                    None => -1,
                }
            };
            self.reap_expired();

            let n = self.epoll.wait(&mut events, timeout_ms)?;
            for ev in events.iter().take(n) {
                let token = ev.u64 as c_int;
                let bits = ev.events;
                if token == self.listen_fd {
                    self.on_accept();
                } else if token == self.wake_rx {
                    self.on_wake();
                } else if bits & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
                    self.close_connection(token);
                } else if bits & EPOLLIN != 0 {
                    self.on_read(token);
                } else if bits & EPOLLOUT != 0 {
                    self.on_write(token);
                } else {
                    warn!(token, bits, "unexpected readiness event");
                }
            }
        }

        self.teardown();
        Ok(())
    }

    fn expiry_callback(&self, id: c_int) -> TimerCallback {
        let expired = Rc::clone(&self.expired);
        Box::new(move || expired.borrow_mut().push(id))
    }

    /// Apply expiries collected by the last `tick`. A busy connection gets a
    /// grace re-arm instead of a close under the worker.
    fn reap_expired(&mut self) {
        loop {
            let Some(id) = self.expired.borrow_mut().pop() else {
                break;
            };
            let busy = match self.table.get(id) {
                Some(handle) => handle.busy.load(Ordering::Acquire),
                None => continue,
            };
            if busy {
                trace!(id, "expiry deferred, task in flight");
                let cb = self.expiry_callback(id);
                self.timer.add(id, EXPIRY_GRACE, cb);
            } else {
                info!(id, "closing idle connection");
                self.close_connection(id);
            }
        }
    }

    fn on_accept(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    if self.table.len() >= MAX_CONNECTIONS {
                        warn!(fd, "connection limit reached, refusing");
                        syscalls::close_fd(fd);
                        continue;
                    }
                    self.table.insert(Connection::new(fd, peer, self.body_limit));
                    if !self.timeout.is_zero() {
                        let cb = self.expiry_callback(fd);
                        self.timer.add(fd, self.timeout, cb);
                    }
                    if let Err(e) = self.epoll.add(fd, fd as u64, EPOLLIN | self.conn_flags()) {
                        warn!(fd, error = %e, "epoll registration failed");
                        self.timer.del(fd);
                        self.table.remove(fd);
                        syscalls::close_fd(fd);
                        continue;
                    }
                    debug!(fd, peer = %peer, live = self.table.len(), "accepted");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Drain worker completion tokens (and shutdown pokes, id < 0).
    fn on_wake(&mut self) {
        loop {
            match syscalls::recv_token(self.wake_rx) {
                Ok(Some(id)) if id >= 0 => self.on_task_complete(id),
                Ok(Some(_)) => {} // shutdown poke; the loop condition notices
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "wake pipe read failed");
                    break;
                }
            }
        }
    }

    fn on_task_complete(&mut self, id: c_int) {
        let Some(handle) = self.table.get(id).cloned() else {
            return;
        };
        if handle.pending_close.load(Ordering::Acquire) {
            self.close_connection(id);
            return;
        }
        let phase = handle.state.lock().unwrap().phase;
        let armed = match phase {
            Phase::Reading => self.epoll.modify(id, id as u64, EPOLLIN | self.conn_flags()),
            Phase::Writing => self.epoll.modify(id, id as u64, EPOLLOUT | self.conn_flags()),
            Phase::Closing => {
                self.close_connection(id);
                return;
            }
        };
        if let Err(e) = armed {
            warn!(id, error = %e, "re-arm failed");
            self.close_connection(id);
        }
    }

    fn on_read(&mut self, id: c_int) {
        let Some(handle) = self.table.get(id).cloned() else {
            return;
        };
        if handle.busy.load(Ordering::Acquire) {
            return;
        }

        let mut eof = false;
        let mut fatal = false;
        let mut total = 0usize;
        {
            let mut conn = handle.state.lock().unwrap();
            loop {
                match conn.read_buf.read_from_fd(id) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => total += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(id, error = %e, "read failed");
                        fatal = true;
                        break;
                    }
                }
            }
        }

        if fatal || eof {
            self.close_connection(id);
            return;
        }
        if total == 0 {
            // Spurious wakeup; wait for real bytes.
            if self.epoll.modify(id, id as u64, EPOLLIN | self.conn_flags()).is_err() {
                self.close_connection(id);
            }
            return;
        }

        if !self.timeout.is_zero() {
            self.timer.adjust(id, self.timeout);
        }
        handle.busy.store(true, Ordering::Release);
        let task_handle = Arc::clone(&handle);
        let ctx = Arc::clone(&self.ctx);
        if !self.pool.submit(move || process_connection(task_handle, ctx)) {
            handle.busy.store(false, Ordering::Release);
            self.close_connection(id);
        }
    }

    fn on_write(&mut self, id: c_int) {
        let Some(handle) = self.table.get(id).cloned() else {
            return;
        };
        if handle.busy.load(Ordering::Acquire) {
            return;
        }

        let mut done = false;
        let mut failed = false;
        let mut keep = false;
        {
            let mut conn = handle.state.lock().unwrap();
            loop {
                let head_len = conn.write_buf.readable_bytes();
                let result = {
                    let head = conn.write_buf.peek();
                    let file_rest = match conn.response.as_ref().and_then(|r| r.file()) {
                        Some(f) => &f[conn.file_off..],
                        None => &[][..],
                    };
                    if head.is_empty() && file_rest.is_empty() {
                        done = true;
                        break;
                    }
                    syscalls::writev_fd(id, &[head, file_rest])
                };
                match result {
                    // WouldBlock: nothing went out, wait for the next edge.
                    Ok(0) => break,
                    Ok(n) => {
                        let from_head = n.min(head_len);
                        conn.write_buf.consume(from_head);
                        conn.file_off += n - from_head;
                    }
                    Err(e) => {
                        warn!(id, error = %e, "write failed");
                        failed = true;
                        break;
                    }
                }
            }
            if done {
                keep = conn.keep_alive;
                if keep {
                    conn.reset_for_next_request();
                }
            }
        }

        if failed {
            self.close_connection(id);
            return;
        }
        if !done {
            // Stalled mid-response; the inactivity deadline is deliberately
            // not refreshed here.
            if self.epoll.modify(id, id as u64, EPOLLOUT | self.conn_flags()).is_err() {
                self.close_connection(id);
            }
            return;
        }
        if keep && !self.shutdown.load(Ordering::Acquire) {
            if !self.timeout.is_zero() {
                self.timer.adjust(id, self.timeout);
            }
            if self.epoll.modify(id, id as u64, EPOLLIN | self.conn_flags()).is_err() {
                self.close_connection(id);
                return;
            }
            trace!(id, "exchange complete, keep-alive re-armed");
        } else {
            self.close_connection(id);
        }
    }

    /// The one and only teardown path: deregister, cancel the timer, drop
    /// table ownership, close the socket. Safe to call twice.
    fn close_connection(&mut self, id: c_int) {
        let Some(handle) = self.table.remove(id) else {
            return;
        };
        let _ = self.epoll.delete(id);
        self.timer.del(id);
        let mut served = 0;
        if let Ok(mut conn) = handle.state.lock() {
            conn.response = None;
            conn.read_buf.clear();
            conn.write_buf.clear();
            conn.phase = Phase::Closing;
            served = conn.requests_served;
        }
        syscalls::close_fd(id);
        debug!(id, served, live = self.table.len(), "connection closed");
    }

    fn teardown(&mut self) {
        info!("reactor shutting down");
        let _ = self.epoll.delete(self.listen_fd);
        syscalls::close_fd(self.listen_fd);
        // Let in-flight tasks finish before tearing their connections down.
        self.pool.shutdown();
        for id in self.table.ids() {
            self.close_connection(id);
        }
        self.timer.clear();
        let _ = self.epoll.delete(self.wake_rx);
        syscalls::close_fd(self.wake_rx);
    }
}

/// Worker-side step: advance the parser, build the response on completion,
/// hand the connection back through the wake pipe.
fn process_connection(handle: Arc<ConnHandle>, ctx: Arc<EngineContext>) {
    {
        let mut conn = handle.state.lock().unwrap();
        let status = {
            let Connection {
                parser, read_buf, ..
            } = &mut *conn;
            parser.parse(read_buf)
        };
        match status {
            ParseStatus::NeedMore => {
                conn.phase = Phase::Reading;
            }
            ParseStatus::Complete => match conn.take_request() {
                Some(req) => {
                    let keep = req.keep_alive();
                    conn.keep_alive = keep;
                    let path = route_request(&ctx, &req);
                    let resp = Response::resolve(&ctx.doc_root, &path, keep, None);
                    trace!(id = handle.id, path = %path, code = resp.code(), "request resolved");
                    resp.make(&mut conn.write_buf);
                    conn.response = Some(resp);
                    conn.file_off = 0;
                    conn.phase = Phase::Writing;
                }
                None => {
                    handle.pending_close.store(true, Ordering::Release);
                }
            },
            ParseStatus::Failed(code) => {
                debug!(id = handle.id, code, "request rejected");
                conn.keep_alive = false;
                let resp = Response::resolve(&ctx.doc_root, "/", false, Some(code));
                resp.make(&mut conn.write_buf);
                conn.response = Some(resp);
                conn.file_off = 0;
                conn.phase = Phase::Writing;
            }
        }
    }
    handle.busy.store(false, Ordering::Release);
    if let Err(e) = syscalls::send_token(ctx.wake_fd, handle.id) {
        warn!(id = handle.id, error = %e, "wake pipe write failed");
    }
}

/// Map login/register form posts onto their result pages; everything else
/// resolves as-is.
fn route_request(ctx: &EngineContext, req: &Request) -> String {
    if req.method == Method::Post && (req.path == "/login" || req.path == "/register") {
        let verified = match ctx.sql.as_ref() {
            Some(pool) => verify_user(pool, &req.body, req.path == "/register"),
            None => false,
        };
        return if verified {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
    }
    req.path.clone()
}

fn verify_user(pool: &PgPool, body: &[u8], register: bool) -> bool {
    let Some((user, password)) = parse_credentials(body) else {
        return false;
    };
    let mut conn = match pool.acquire() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "sql acquire failed");
            return false;
        }
    };
    match conn.query(
        "SELECT password FROM users WHERE username = $1",
        &[&user],
    ) {
        Ok(rows) if register => {
            if !rows.is_empty() {
                return false;
            }
            conn.execute(
                "INSERT INTO users(username, password) VALUES($1, $2)",
                &[&user, &password],
            )
            .is_ok()
        }
        Ok(rows) => rows
            .first()
            .and_then(|row| row.first())
            .and_then(|col| col.as_deref())
            .map(|stored| stored == password)
            .unwrap_or(false),
        Err(e) => {
            warn!(error = %e, "user lookup failed");
            false
        }
    }
}

/// Pull `user` and `password` out of a urlencoded form body.
fn parse_credentials(body: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(body).ok()?;
    let mut user = None;
    let mut password = None;
    for pair in text.split('&') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "user" => user = Some(url_decode(value)),
            "password" => password = Some(url_decode(value)),
            _ => {}
        }
    }
    Some((user?, password?))
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
