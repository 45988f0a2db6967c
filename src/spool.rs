//! Disk spool for offline event persistence (§4.E).
//!
//! Events accumulate in an in-memory [`SpoolFile`] per run, which is
//! write-ahead flushed to a `.pending` temp file and atomically renamed to
//! `.spool`. Once uploaded a file is renamed again to `.done`, where it
//! waits out its retention window before cleanup.

use crate::error::SpoolError;
use crate::event::Event;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SPOOL_VERSION: u32 = 1;
const SPOOL_EXT: &str = "spool";
const PENDING_EXT: &str = "pending";
const DONE_EXT: &str = "done";

/// Tunables for the disk spool. See `Config` for process-wide defaults.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub spool_dir: PathBuf,
    pub max_file_size_bytes: u64,
    pub max_total_size_bytes: u64,
    pub sync_interval_ms: u64,
    pub retention_hours: u64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        SpoolConfig {
            spool_dir: default_spool_dir(),
            max_file_size_bytes: 10_000_000,
            max_total_size_bytes: 100_000_000,
            sync_interval_ms: 5_000,
            retention_hours: 72,
        }
    }
}

fn default_spool_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".runtrace").join("spool")
}

/// Point-in-time counters about the spool's disk contents.
#[derive(Debug, Clone, Default)]
pub struct SpoolStats {
    pub pending_files: usize,
    pub pending_events: usize,
    pub pending_bytes: u64,
    pub done_files: usize,
    pub total_synced: u64,
    pub last_sync_time: f64,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SpoolFileContent {
    version: u32,
    run_id: String,
    created_at: f64,
    events: Vec<Event>,
}

/// A single run's in-memory accumulation of events awaiting a durable write.
pub struct SpoolFile {
    path: PathBuf,
    run_id: String,
    events: Vec<Event>,
    size_bytes: u64,
    created_at: f64,
}

impl SpoolFile {
    fn new(path: PathBuf, run_id: impl Into<String>) -> Self {
        SpoolFile {
            path,
            run_id: run_id.into(),
            events: Vec::new(),
            size_bytes: 0,
            created_at: now_secs(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    fn append(&mut self, event: Event) {
        // Approximate on-disk cost; exactness isn't required to trigger a
        // size-based roll of the active file.
        self.size_bytes += serde_json::to_vec(&event).map(|v| v.len() as u64).unwrap_or(64);
        self.events.push(event);
    }

    /// Write-ahead flush: serialize to a `.pending` temp file, then
    /// atomically rename to the durable `.spool` path. A no-op if there is
    /// nothing buffered.
    fn flush(&mut self) -> Result<(), SpoolError> {
        if self.events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension(PENDING_EXT);
        let content = SpoolFileContent {
            version: SPOOL_VERSION,
            run_id: self.run_id.clone(),
            created_at: self.created_at,
            events: self.events.clone(),
        };
        let bytes = serde_json::to_vec(&content)?;
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, &self.path)?;
        tracing::debug!(
            path = %self.path.display(),
            events = self.events.len(),
            "flushed spool file"
        );
        Ok(())
    }
}

/// Manages disk-based event spooling for offline mode. Events are written to
/// spool files when the connection is offline; once restored the syncer
/// replays them in (global) mtime order.
pub struct DiskSpool {
    config: SpoolConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    active_files: HashMap<String, SpoolFile>,
    last_known_pending_bytes: u64,
}

impl DiskSpool {
    pub fn new(config: SpoolConfig) -> Result<Self, SpoolError> {
        fs::create_dir_all(&config.spool_dir)?;
        Ok(DiskSpool {
            config,
            inner: Mutex::new(Inner {
                active_files: HashMap::new(),
                last_known_pending_bytes: 0,
            }),
        })
    }

    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    /// Spool a single event to the active file for its run, rolling to a
    /// fresh file (flushing the old one) once the size threshold is crossed.
    /// Returns `Err(SpoolError::CapacityExceeded)` (without panicking) if the
    /// total spool size limit has been reached -- callers bump a
    /// dropped-event counter on that error.
    pub fn spool(&self, event: Event) -> Result<(), SpoolError> {
        let mut inner = self.inner.lock();

        if inner.last_known_pending_bytes >= self.config.max_total_size_bytes {
            tracing::warn!("spool size limit reached, dropping event");
            return Err(SpoolError::CapacityExceeded);
        }

        let run_id = event.run_id.clone();
        let spool_dir = self.config.spool_dir.clone();
        let file = inner
            .active_files
            .entry(run_id.clone())
            .or_insert_with(|| SpoolFile::new(new_spool_path(&spool_dir, &run_id), run_id.clone()));
        file.append(event);

        if file.size_bytes() >= self.config.max_file_size_bytes {
            let mut file = inner.active_files.remove(&run_id).expect("just inserted");
            file.flush()?;
            inner.last_known_pending_bytes += file.size_bytes();
        }

        Ok(())
    }

    /// Flush every active (not-yet-rolled) file to disk. Called on shutdown
    /// and from the syncer's periodic pass.
    pub fn flush_all(&self) -> Result<(), SpoolError> {
        let mut inner = self.inner.lock();
        for file in inner.active_files.values_mut() {
            file.flush()?;
        }
        Ok(())
    }

    /// Pending `.spool` files, oldest first by mtime. Ordering is global
    /// across runs; there is no per-run replay guarantee.
    pub fn pending_files(&self) -> Result<Vec<PathBuf>, SpoolError> {
        list_by_ext_sorted(&self.config.spool_dir, SPOOL_EXT)
    }

    /// Read the events out of a `.spool` (or, for recovery, `.pending`) file.
    /// An empty or missing file reads as zero events.
    pub fn read_spool_file(&self, path: &Path) -> Result<Vec<Event>, SpoolError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let content: SpoolFileContent = serde_json::from_slice(&bytes)?;
        Ok(content.events)
    }

    /// Rename a synced `.spool` file to `.done`.
    pub fn mark_synced(&self, path: &Path) -> Result<(), SpoolError> {
        if path.exists() {
            let done_path = path.with_extension(DONE_EXT);
            fs::rename(path, done_path)?;
        }
        Ok(())
    }

    /// Startup recovery: any leftover `.pending` file means the process died
    /// mid-write-ahead, before the rename to `.spool` completed. The partial
    /// write is never trustworthy, so it's discarded rather than replayed.
    pub fn recover(&self) -> Result<usize, SpoolError> {
        let stale = list_by_ext_sorted(&self.config.spool_dir, PENDING_EXT)?;
        for path in &stale {
            tracing::warn!(path = %path.display(), "discarding incomplete pending spool file");
            fs::remove_file(path)?;
        }

        let pending = self.pending_files()?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "found pending spool files for recovery");
        }
        Ok(pending.len())
    }

    /// Delete `.done` files older than the configured retention window.
    pub fn cleanup_old_files(&self) -> Result<usize, SpoolError> {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(self.config.retention_hours * 3600))
            .unwrap_or(UNIX_EPOCH);

        let mut cleaned = 0;
        for entry in fs::read_dir(&self.config.spool_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DONE_EXT) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if modified < cutoff {
                fs::remove_file(&path)?;
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            tracing::info!(cleaned, "cleaned up old spool files");
        }
        Ok(cleaned)
    }

    /// Compute fresh stats by scanning the spool directory.
    pub fn stats(&self) -> Result<SpoolStats, SpoolError> {
        let pending = self.pending_files()?;
        let done = list_by_ext_sorted(&self.config.spool_dir, DONE_EXT)?;

        let mut pending_bytes = 0u64;
        let mut pending_events = 0usize;
        for path in &pending {
            pending_bytes += fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            pending_events += self.read_spool_file(path).map(|e| e.len()).unwrap_or(0);
        }

        self.inner.lock().last_known_pending_bytes = pending_bytes;

        Ok(SpoolStats {
            pending_files: pending.len(),
            pending_events,
            pending_bytes,
            done_files: done.len(),
            total_synced: 0,
            last_sync_time: 0.0,
        })
    }
}

fn new_spool_path(spool_dir: &Path, run_id: &str) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let filename = format!("{run_id}_{millis}_{}.{}", &suffix[..8], SPOOL_EXT);
    spool_dir.join(filename)
}

fn list_by_ext_sorted(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, SpoolError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(ext) {
            let modified = entry.metadata()?.modified()?;
            entries.push((path, modified));
        }
    }
    entries.sort_by_key(|(_, m)| *m);
    Ok(entries.into_iter().map(|(p, _)| p).collect())
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
