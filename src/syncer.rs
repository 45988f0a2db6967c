//! Background thread that replays spooled events once the connection is
//! back online (§4.F).

use crate::connection::ConnectionState;
use crate::spool::DiskSpool;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A batch of events read back off a spool file, handed to the syncer's
/// send callback. The callback returns `true` on a successful upload.
pub type SyncSendFn = Arc<dyn Fn(Vec<crate::event::Event>) -> bool + Send + Sync>;

struct WakeSignal {
    lock: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    fn new() -> Self {
        WakeSignal {
            lock: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn wait(&self, timeout: Duration) {
        let mut signalled = self.lock.lock();
        if !*signalled {
            self.condvar.wait_for(&mut signalled, timeout);
        }
        *signalled = false;
    }

    fn notify(&self) {
        *self.lock.lock() = true;
        self.condvar.notify_one();
    }
}

/// Drives a background thread that periodically (or on demand) attempts to
/// drain pending spool files while the connection is online.
pub struct SpoolSyncer {
    spool: Arc<DiskSpool>,
    connection: Arc<ConnectionState>,
    send: SyncSendFn,
    stop: Arc<AtomicBool>,
    wake: Arc<WakeSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SpoolSyncer {
    pub fn new(spool: Arc<DiskSpool>, connection: Arc<ConnectionState>, send: SyncSendFn) -> Self {
        SpoolSyncer {
            spool,
            connection,
            send,
            stop: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(WakeSignal::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let spool = self.spool.clone();
        let connection = self.connection.clone();
        let send = self.send.clone();
        let stop = self.stop.clone();
        let wake = self.wake.clone();

        *handle = Some(
            thread::Builder::new()
                .name("runtrace-spool-syncer".into())
                .spawn(move || run(spool, connection, send, stop, wake))
                .expect("failed to spawn spool syncer thread"),
        );
        tracing::debug!("spool syncer started");
    }

    pub fn trigger_sync(&self) {
        self.wake.notify();
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(
    spool: Arc<DiskSpool>,
    connection: Arc<ConnectionState>,
    send: SyncSendFn,
    stop: Arc<AtomicBool>,
    wake: Arc<WakeSignal>,
) {
    if let Err(err) = spool.recover() {
        tracing::error!(error = %err, "spool recovery failed");
    }

    let interval = Duration::from_millis(spool.config().sync_interval_ms);

    while !stop.load(Ordering::SeqCst) {
        wake.wait(interval);
        if stop.load(Ordering::SeqCst) {
            break;
        }

        if !connection.is_online() {
            continue;
        }

        if let Err(err) = sync_pending(&spool, &send, &stop) {
            tracing::error!(error = %err, "error syncing spool");
        }

        if let Err(err) = spool.cleanup_old_files() {
            tracing::error!(error = %err, "error cleaning up old spool files");
        }
    }
}

fn sync_pending(
    spool: &DiskSpool,
    send: &SyncSendFn,
    stop: &Arc<AtomicBool>,
) -> Result<(), crate::error::SpoolError> {
    let pending = spool.pending_files()?;

    for path in pending {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let events = match spool.read_spool_file(&path) {
            Ok(events) => events,
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "error reading spool file");
                continue;
            }
        };

        if events.is_empty() {
            spool.mark_synced(&path)?;
            continue;
        }

        let count = events.len();
        if send(events) {
            spool.mark_synced(&path)?;
            tracing::info!(count, "synced events from spool");
        } else {
            tracing::warn!("spool sync failed, will retry later");
            break;
        }
    }

    Ok(())
}

impl Drop for SpoolSyncer {
    fn drop(&mut self) {
        self.stop();
    }
}
