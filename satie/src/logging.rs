//! Tracing initialization.
//!
//! File mode routes formatted records through the bounded blocking queue to
//! a consumer thread appending to a daily-rotated `yyyy_mm_dd.log`. With a
//! zero queue capacity records are written synchronously under a mutex.
//! The level filter honors `RUST_LOG` first, then the configured level.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Local;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::error::{SatieError, SatieResult};
use crate::queue::{BoundedBlockingQueue, Pop};

/// Append-only log file that reopens itself when the calendar day changes.
struct DailyFile {
    dir: PathBuf,
    day: String,
    file: Option<File>,
}

impl DailyFile {
    fn open(dir: PathBuf) -> SatieResult<Self> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| SatieError::LogDir(format!("{}: {}", dir.display(), e)))?;
        let mut this = Self {
            dir,
            day: String::new(),
            file: None,
        };
        this.roll()?;
        Ok(this)
    }

    fn roll(&mut self) -> SatieResult<()> {
        self.day = Local::now().format("%Y_%m_%d").to_string();
        let path = self.dir.join(format!("{}.log", self.day));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SatieError::LogDir(format!("{}: {}", path.display(), e)))?;
        self.file = Some(file);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) {
        let today = Local::now().format("%Y_%m_%d").to_string();
        if today != self.day || self.file.is_none() {
            // Records already queued at midnight land in the new day's file.
            if self.roll().is_err() {
                return;
            }
        }
        if let Some(file) = self.file.as_mut() {
            let _ = file.write_all(bytes);
        }
    }

    fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}

/// Joins the consumer thread and flushes the backlog on shutdown.
pub struct LogGuard {
    queue: Arc<BoundedBlockingQueue<Vec<u8>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LogGuard {
    pub fn shutdown(&mut self) {
        self.queue.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone)]
struct QueueWriter {
    queue: Arc<BoundedBlockingQueue<Vec<u8>>>,
}

struct QueueWriterHandle {
    queue: Arc<BoundedBlockingQueue<Vec<u8>>>,
    buf: Vec<u8>,
}

impl io::Write for QueueWriterHandle {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for QueueWriterHandle {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.queue.push_back(std::mem::take(&mut self.buf));
        }
    }
}

impl<'a> MakeWriter<'a> for QueueWriter {
    type Writer = QueueWriterHandle;

    fn make_writer(&'a self) -> Self::Writer {
        QueueWriterHandle {
            queue: Arc::clone(&self.queue),
            buf: Vec::with_capacity(256),
        }
    }
}

#[derive(Clone)]
struct SyncWriter {
    file: Arc<Mutex<DailyFile>>,
}

struct SyncWriterHandle {
    file: Arc<Mutex<DailyFile>>,
}

impl io::Write for SyncWriterHandle {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock().unwrap();
        file.write(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().unwrap().flush();
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SyncWriter {
    type Writer = SyncWriterHandle;

    fn make_writer(&'a self) -> Self::Writer {
        SyncWriterHandle {
            file: Arc::clone(&self.file),
        }
    }
}

/// Install the global subscriber. Call once, before the server starts.
/// An unwritable log directory is a startup failure.
pub fn init(cfg: &Config) -> SatieResult<Option<LogGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));

    if !cfg.open_log {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return Ok(None);
    }

    let daily = DailyFile::open(PathBuf::from(&cfg.log_dir))?;

    if cfg.log_queue == 0 {
        let writer = SyncWriter {
            file: Arc::new(Mutex::new(daily)),
        };
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
            .init();
        return Ok(None);
    }

    let queue = Arc::new(BoundedBlockingQueue::new(cfg.log_queue));
    let writer = QueueWriter {
        queue: Arc::clone(&queue),
    };

    let consumer_queue = Arc::clone(&queue);
    let handle = thread::Builder::new()
        .name("satie-log".to_string())
        .spawn(move || {
            let mut daily = daily;
            loop {
                match consumer_queue.pop_timeout(Duration::from_secs(3)) {
                    Pop::Item(record) => daily.write(&record),
                    Pop::TimedOut => daily.flush(),
                    Pop::Closed => break,
                }
            }
            daily.flush();
        })
        .map_err(|e| SatieError::LogDir(format!("log consumer spawn: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .init();

    Ok(Some(LogGuard {
        queue,
        handle: Some(handle),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_file_appends_to_dated_log() {
        let dir = std::env::temp_dir().join(format!("satie-log-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let mut daily = DailyFile::open(dir.clone()).unwrap();
        daily.write(b"first line\n");
        daily.write(b"second line\n");
        daily.flush();

        let name = format!("{}.log", Local::now().format("%Y_%m_%d"));
        let contents = std::fs::read_to_string(dir.join(name)).unwrap();
        assert!(contents.contains("first line"));
        assert!(contents.contains("second line"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn queue_writer_hands_records_to_consumer() {
        let queue = Arc::new(BoundedBlockingQueue::new(8));
        let writer = QueueWriter {
            queue: Arc::clone(&queue),
        };
        {
            let mut handle = writer.make_writer();
            handle.write_all(b"a record").unwrap();
        }
        match queue.pop_timeout(Duration::from_millis(100)) {
            Pop::Item(bytes) => assert_eq!(bytes, b"a record"),
            _ => panic!("record not queued"),
        }
    }
}
