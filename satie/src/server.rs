//! Server facade: binds the listener, wires the pool, table, timer, and
//! reactor together, and runs until a shutdown signal.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libc::c_int;
use tracing::info;

use satie_pg::{PgConfig, PgPool};

use crate::config::Config;
use crate::error::{SatieError, SatieResult};
use crate::reactor::{EngineContext, Reactor};
use crate::syscalls;

/// Cloneable stop switch: flips the shutdown flag and pokes the reactor out
/// of its readiness wait.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake_fd: c_int,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = syscalls::send_token(self.wake_fd, -1);
    }
}

pub struct Server {
    cfg: Config,
    listen_fd: c_int,
    wake_rx: c_int,
    wake_tx: c_int,
    port: u16,
    ctx: Arc<EngineContext>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind and wire everything up. Startup failures (unbindable port,
    /// unusable doc root) are the only errors that terminate the process.
    pub fn new(cfg: Config) -> SatieResult<Self> {
        let doc_root = PathBuf::from(&cfg.doc_root)
            .canonicalize()
            .map_err(|e| SatieError::DocRoot(format!("{}: {}", cfg.doc_root, e)))?;
        if !doc_root.is_dir() {
            return Err(SatieError::DocRoot(format!(
                "{}: not a directory",
                doc_root.display()
            )));
        }

        let listen_fd = syscalls::create_listen_socket(&cfg.host, cfg.port, cfg.opt_linger)?;
        let port = syscalls::local_port(listen_fd)?;
        let (wake_rx, wake_tx) = match syscalls::create_wake_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e);
            }
        };

        let sql = if cfg.pg.enabled() {
            let pg_cfg = PgConfig::new(
                &cfg.pg.host,
                cfg.pg.port,
                &cfg.pg.user,
                &cfg.pg.password,
                &cfg.pg.database,
            );
            info!(host = %cfg.pg.host, db = %cfg.pg.database, "sql pool configured");
            Some(Arc::new(PgPool::new(pg_cfg, cfg.pg.pool_size)))
        } else {
            None
        };

        let ctx = Arc::new(EngineContext {
            doc_root,
            wake_fd: wake_tx,
            sql,
        });

        Ok(Self {
            cfg,
            listen_fd,
            wake_rx,
            wake_tx,
            port,
            ctx,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The bound port; differs from the configured one when it was 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            wake_fd: self.wake_tx,
        }
    }

    /// SIGINT triggers a cooperative shutdown.
    pub fn install_signal_handler(&self) -> SatieResult<()> {
        let handle = self.shutdown_handle();
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            handle.stop();
        })
        .map_err(|e| SatieError::Config(format!("signal handler: {}", e)))
    }

    /// Run the reactor until shutdown. Consumes the server.
    pub fn run(self) -> SatieResult<()> {
        info!(
            port = self.port,
            workers = self.cfg.thread_num,
            doc_root = %self.ctx.doc_root.display(),
            trig_mode = self.cfg.trig_mode,
            "satie listening"
        );
        let mut reactor = Reactor::new(
            self.listen_fd,
            self.wake_rx,
            &self.cfg,
            Arc::clone(&self.ctx),
            Arc::clone(&self.shutdown),
        )?;
        reactor.run()?;
        info!("satie stopped");
        Ok(())
    }
}
