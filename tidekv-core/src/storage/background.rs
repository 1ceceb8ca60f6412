//! Background flush, compaction and value log GC threads

use super::database::DbInner;
use super::gc;
use crate::{Result, TideError};
use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Idle wakeup for the flush and compaction threads
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Handles to the running worker threads
pub(super) struct Workers {
    shutdown: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Spawn the workers for `inner`
    pub fn start(
        inner: &Arc<DbInner>,
        flush_rx: Receiver<()>,
        compact_rx: Receiver<()>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let mut workers = Self {
            shutdown: Some(shutdown_tx),
            handles: Vec::new(),
        };

        workers.spawn("tidekv-flush", inner, shutdown_rx.clone(), move |db, stop| {
            run_loop(db, stop, &flush_rx, IDLE_POLL, "flush", |db| {
                db.rotate_if_stale()?;
                db.flush_immutables().map(|_| ())
            })
        })?;

        workers.spawn("tidekv-compaction", inner, shutdown_rx.clone(), move |db, stop| {
            run_loop(db, stop, &compact_rx, IDLE_POLL, "compaction", |db| {
                while db.compactor.maybe_compact()?.is_some() {
                    if db.is_cancelled() {
                        break;
                    }
                }
                Ok(())
            })
        })?;

        let gc_interval = inner.options.value_log_gc_interval_ms;
        if gc_interval > 0 {
            // GC only runs on its timer
            let wake_rx = crossbeam_channel::never::<()>();
            workers.spawn("tidekv-gc", inner, shutdown_rx, move |db, stop| {
                run_loop(
                    db,
                    stop,
                    &wake_rx,
                    Duration::from_millis(gc_interval),
                    "value log GC",
                    |db| {
                        if !db.vlog.sealed_segments().is_empty() {
                            gc::run(db, false)?;
                        }
                        Ok(())
                    },
                )
            })?;
        }

        Ok(workers)
    }

    fn spawn<F>(
        &mut self,
        name: &str,
        inner: &Arc<DbInner>,
        shutdown_rx: Receiver<()>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&DbInner, &Receiver<()>) + Send + 'static,
    {
        let inner = inner.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(&inner, &shutdown_rx))
            .map_err(|e| TideError::Internal(format!("failed to spawn {}: {}", name, e)))?;
        self.handles.push(handle);
        Ok(())
    }

    /// Stop every worker and wait for it to exit
    pub fn shutdown(mut self) {
        // disconnecting the channel wakes every select below
        self.shutdown.take();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "Background thread panicked");
            }
        }
    }
}

enum Wake {
    Work,
    Stop,
}

fn wait(wake: &Receiver<()>, stop: &Receiver<()>, idle: Duration) -> Wake {
    select! {
        recv(wake) -> msg => match msg {
            Ok(()) => Wake::Work,
            Err(_) => Wake::Stop,
        },
        recv(stop) -> _ => Wake::Stop,
        default(idle) => Wake::Work,
    }
}

/// Run `task` on every wakeup until shutdown.
///
/// Failures are retried with exponential backoff; after too many in a row
/// the engine is switched to read-only and the worker exits.
fn run_loop<T>(
    db: &DbInner,
    stop: &Receiver<()>,
    wake: &Receiver<()>,
    idle: Duration,
    what: &str,
    mut task: T,
) where
    T: FnMut(&DbInner) -> Result<()>,
{
    debug!(task = what, "Background worker started");
    loop {
        if let Wake::Stop = wait(wake, stop, idle) {
            break;
        }
        if db.is_cancelled() {
            break;
        }
        if !retry(db, stop, what, &mut task) {
            break;
        }
    }
    debug!(task = what, "Background worker stopped");
}

/// Returns false once the worker should stop.
fn retry<T>(db: &DbInner, stop: &Receiver<()>, what: &str, task: &mut T) -> bool
where
    T: FnMut(&DbInner) -> Result<()>,
{
    let limit = db.options.background_retry_limit;
    let mut backoff = Duration::from_millis(crate::config::BACKGROUND_BACKOFF_MS);
    let max_backoff = Duration::from_millis(crate::config::BACKGROUND_BACKOFF_MAX_MS);
    let mut failures = 0u32;

    loop {
        match task(db) {
            Ok(()) => return true,
            Err(_) if db.is_cancelled() => return false,
            Err(e) => {
                failures += 1;
                if failures >= limit {
                    db.set_read_only(format!(
                        "background {} failed {} times: {}",
                        what, failures, e
                    ));
                    return false;
                }
                warn!(
                    task = what,
                    attempt = failures,
                    retry_in = ?backoff,
                    error = %e,
                    "Background task failed"
                );
                match stop.recv_timeout(backoff) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => return false,
                }
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Db, Options, TideError};
    use bytes::Bytes;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_background_flush_drains_immutables() {
        let dir = TempDir::new().unwrap();
        let options = Options {
            memtable_size_bytes: 2 * 1024,
            value_log_gc_interval_ms: 0,
            ..Default::default()
        };
        let db = Db::open(dir.path(), options).unwrap();

        for i in 0..200u32 {
            db.set(format!("key{:04}", i), vec![b'x'; 64]).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while db.stats().flushes == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(db.stats().flushes > 0);
        for i in 0..200u32 {
            assert_eq!(
                db.get(format!("key{:04}", i).as_bytes()).unwrap().unwrap(),
                Bytes::from(vec![b'x'; 64])
            );
        }
    }

    #[test]
    fn test_stale_memtable_rotated_and_flushed() {
        let dir = TempDir::new().unwrap();
        let options = Options {
            memtable_max_age_ms: 100,
            value_log_gc_interval_ms: 0,
            ..Default::default()
        };
        let db = Db::open(dir.path(), options).unwrap();
        db.set("idle", "value").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while db.stats().flushes == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let stats = db.stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.memtable_bytes, 0);
        assert_eq!(stats.levels[0].tables, 1);
        assert_eq!(db.get(b"idle").unwrap().unwrap(), Bytes::from("value"));
    }

    #[test]
    fn test_young_memtable_not_rotated() {
        let dir = TempDir::new().unwrap();
        let options = Options {
            memtable_max_age_ms: 60_000,
            value_log_gc_interval_ms: 0,
            ..Default::default()
        };
        let db = Db::open(dir.path(), options).unwrap();
        db.set("a", "1").unwrap();
        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(db.stats().flushes, 0);
        assert!(db.stats().memtable_bytes > 0);
    }

    #[test]
    fn test_close_stops_workers() {
        let dir = TempDir::new().unwrap();
        let options = Options {
            value_log_gc_interval_ms: 50,
            ..Default::default()
        };
        let db = Db::open(dir.path(), options).unwrap();
        db.set("a", "1").unwrap();
        db.close().unwrap();
        assert!(matches!(db.set("b", "2"), Err(TideError::Closed)));
    }
}
