//! Background flush worker (§4.G): drains the queue, folds events through
//! the batcher, and ships the result through the transport, falling back to
//! the disk spool on failure.

use crate::batch::{AdaptiveBatcher, BatchConfig, BatchStats, FlushMetrics, Trigger};
use crate::config::Config;
use crate::connection::ConnectionState;
use crate::event::{Event, EventType, PayloadValue};
use crate::queue::EventQueue;
use crate::spool::DiskSpool;
use crate::transport::{BatchEnvelope, BatchStatsEnvelope, MetricRow, ParamRow, TagRow, Transport};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Condvar, Mutex};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
enum SerializeError {
    #[error("failed to serialize batch envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to gzip batch payload: {0}")]
    Gzip(#[from] std::io::Error),
}

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

/// Cumulative counters surfaced in a run summary on shutdown.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub batch_count: AtomicU64,
    pub error_count: AtomicU64,
    pub spool_writes: AtomicU64,
    pub coalesced_count: AtomicU64,
}

/// Single-consumer daemon that owns the batcher exclusively. Runs on its
/// own `std::thread`; the producer-facing queue is the only shared state.
pub struct FlushWorker {
    queue: Arc<EventQueue>,
    transport: Arc<dyn Transport>,
    connection: Arc<ConnectionState>,
    spool: Option<Arc<DiskSpool>>,
    config: Config,
    counters: Arc<WorkerCounters>,
    flush_metrics: Arc<Mutex<FlushMetrics>>,
    stop: Arc<AtomicBool>,
    wake: Arc<WakeSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlushWorker {
    pub fn new(
        queue: Arc<EventQueue>,
        transport: Arc<dyn Transport>,
        connection: Arc<ConnectionState>,
        spool: Option<Arc<DiskSpool>>,
        config: Config,
    ) -> Self {
        FlushWorker {
            queue,
            transport,
            connection,
            spool,
            config,
            counters: Arc::new(WorkerCounters::default()),
            flush_metrics: Arc::new(Mutex::new(FlushMetrics::default())),
            stop: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(WakeSignal::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn counters(&self) -> &Arc<WorkerCounters> {
        &self.counters
    }

    /// Cumulative flush metrics, readable at any time -- not just at
    /// shutdown -- for a `Pipeline::stats()` snapshot.
    pub fn flush_metrics(&self) -> FlushMetrics {
        self.flush_metrics.lock().clone()
    }

    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let worker = self.clone();
        *handle = Some(
            thread::Builder::new()
                .name("runtrace-flush-worker".into())
                .spawn(move || worker.run())
                .expect("failed to spawn flush worker thread"),
        );
        tracing::debug!("flush worker started");
    }

    /// Trigger an immediate flush attempt (wakes the main loop early).
    pub fn flush(&self) {
        self.wake.notify();
    }

    pub fn stop(&self, timeout: Duration) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify();
        if let Some(handle) = self.handle.lock().take() {
            let name = handle.thread().name().unwrap_or("runtrace-flush-worker").to_string();
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            thread::spawn(move || {
                let _ = done_tx.send(handle.join());
            });
            if done_rx.recv_timeout(timeout).is_err() {
                tracing::warn!(thread = %name, "flush worker did not stop cleanly within timeout");
            }
        }
    }

    fn run(self: Arc<Self>) {
        tracing::debug!("flush worker running");
        let mut batcher = AdaptiveBatcher::new(BatchConfig {
            max_items: self.config.batch_size,
            max_bytes: self.config.batch_max_bytes,
            max_age_ms: self.config.batch_timeout_ms,
            coalesce_metrics: self.config.coalesce_metrics,
            dedupe_params: self.config.dedupe_params,
            dedupe_tags: self.config.dedupe_tags,
        });

        while !self.stop.load(Ordering::SeqCst) {
            let wait = Duration::from_millis(self.config.batch_timeout_ms.min(100));
            self.wake.wait(wait);

            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.drain_into_batcher(&mut batcher);
            }));
            if outcome.is_err() {
                self.counters.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::error!("error in flush worker loop");
                thread::sleep(Duration::from_secs(1));
            }
        }

        // Final drain on shutdown: whatever is left in the queue joins the
        // current batch and goes out under the "shutdown" trigger.
        for event in self.queue.drain() {
            batcher.add(event);
        }
        if !batcher.is_empty() {
            self.do_flush(&mut batcher, Trigger::Shutdown);
        }
        tracing::debug!("flush worker stopped");
    }

    fn drain_into_batcher(&self, batcher: &mut AdaptiveBatcher) {
        loop {
            let events = self.queue.get_batch(self.config.batch_size, Duration::from_millis(50));
            if events.is_empty() {
                break;
            }

            for event in events {
                if batcher.add(event) {
                    let trigger = batcher.fired_trigger().unwrap_or(Trigger::Size);
                    self.do_flush(batcher, trigger);
                }
            }

            if self.queue.is_empty() {
                break;
            }
        }

        if !batcher.is_empty() && batcher.should_flush() {
            self.do_flush(batcher, Trigger::Time);
        }
    }

    fn do_flush(&self, batcher: &mut AdaptiveBatcher, trigger: Trigger) {
        let (events, stats) = batcher.flush();
        if events.is_empty() {
            return;
        }

        let start = Instant::now();
        let success = self.send_batch(&events, &stats);
        let duration_ms = start.elapsed().as_millis() as u64;

        self.counters
            .coalesced_count
            .fetch_add(stats.coalesced_count as u64, Ordering::Relaxed);
        self.flush_metrics.lock().record_flush(&stats, duration_ms, trigger);
        if success {
            self.counters.batch_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.error_count.fetch_add(1, Ordering::Relaxed);
            self.spool_failed_batch(events);
        }
    }

    /// Attempt to ship a batch, retrying retryable failures with exponential
    /// backoff. Returns `false` (never panics) on exhaustion.
    fn send_batch(&self, events: &[Event], stats: &BatchStats) -> bool {
        if !self.connection.is_online() && self.spool.is_some() {
            return false;
        }

        let envelope = build_envelope(events, stats);
        let (compressed, payload) = match self.serialize(&envelope) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize batch");
                return false;
            }
        };

        let mut delay = Duration::from_millis(self.config.retry_delay_ms);
        let max_delay = Duration::from_millis(self.config.retry_max_delay_ms);
        let mut attempt = 0;

        loop {
            match self
                .transport
                .send_batch(&envelope, compressed, Some(&payload))
            {
                Ok(response) => {
                    self.connection.record_success();
                    if response.duplicate {
                        tracing::debug!("server reported duplicate batch, treating as success");
                    }
                    tracing::debug!(
                        metrics = stats.metric_count,
                        params = stats.param_count,
                        tags = stats.tag_count,
                        "sent batch"
                    );
                    return true;
                }
                Err(err) => {
                    self.connection.record_failure();
                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        tracing::error!(error = %err, "failed to send batch");
                        return false;
                    }
                    tracing::warn!(error = %err, attempt = attempt + 1, "retrying batch send");
                    thread::sleep(delay);
                    delay = (delay.mul_f64(self.config.retry_backoff)).min(max_delay);
                    attempt += 1;
                }
            }
        }
    }

    fn serialize(&self, envelope: &BatchEnvelope) -> Result<(bool, Vec<u8>), SerializeError> {
        let json = serde_json::to_vec(envelope)?;
        if self.config.compression_enabled && json.len() >= self.config.compression_min_bytes {
            let mut encoder = GzEncoder::new(
                Vec::new(),
                Compression::new(self.config.compression_level),
            );
            encoder.write_all(&json)?;
            Ok((true, encoder.finish()?))
        } else {
            Ok((false, json))
        }
    }

    fn spool_failed_batch(&self, events: Vec<Event>) {
        let Some(spool) = &self.spool else { return };
        for event in events {
            match spool.spool(event) {
                Ok(()) => {
                    self.counters.spool_writes.fetch_add(1, Ordering::Relaxed);
                }
                Err(crate::error::SpoolError::CapacityExceeded) => {
                    tracing::warn!("spool capacity exceeded, event dropped");
                }
                Err(err) => {
                    tracing::error!(error = %err, "spool write failed");
                }
            }
        }
        if let Err(err) = spool.flush_all() {
            tracing::error!(error = %err, "failed to flush spool after failed send");
        }
    }
}

/// Partition events by kind and build the wire envelope (§6). Also used by
/// the syncer to re-wrap a batch read back off the spool.
pub(crate) fn build_envelope(events: &[Event], stats: &BatchStats) -> BatchEnvelope {
    let run_id = events.first().map(|e| e.run_id.clone()).unwrap_or_default();
    let mut metrics = Vec::new();
    let mut params = Vec::new();
    let mut tags = Vec::new();

    for event in events {
        match event.kind {
            EventType::Metric => metrics.push(MetricRow {
                name: string_field(event, "name"),
                value: number_field(event, "value"),
                step: number_field(event, "step") as i64,
                timestamp: event.timestamp,
            }),
            EventType::Param => params.push(ParamRow {
                name: string_field(event, "name"),
                value: string_field(event, "value"),
            }),
            EventType::Tag => tags.push(TagRow {
                key: string_field(event, "key"),
                value: string_field(event, "value"),
            }),
            _ => {}
        }
    }

    BatchEnvelope {
        run_id,
        metrics,
        params,
        tags,
        timestamp: crate::event::now_secs(),
        batch_id: Some(uuid::Uuid::new_v4().to_string()),
        seq: None,
        stats: BatchStatsEnvelope {
            metric_count: stats.metric_count,
            param_count: stats.param_count,
            tag_count: stats.tag_count,
            coalesced_count: stats.coalesced_count,
        },
    }
}

fn string_field(event: &Event, key: &str) -> String {
    match event.data.get(key) {
        Some(PayloadValue::Str(s)) => s.clone(),
        Some(PayloadValue::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

fn number_field(event: &Event, key: &str) -> f64 {
    match event.data.get(key) {
        Some(PayloadValue::Num(n)) => *n,
        Some(PayloadValue::Str(s)) => s.parse().unwrap_or(0.0),
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FinishRunResponse, InitRunRequest, InitRunResponse};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct FakeTransport {
        fail_times: AtomicUsize,
        sent: StdMutex<Vec<BatchEnvelope>>,
    }

    impl FakeTransport {
        fn new(fail_times: usize) -> Self {
            FakeTransport {
                fail_times: AtomicUsize::new(fail_times),
                sent: StdMutex::new(Vec::new()),
            }
        }
    }

    impl Transport for FakeTransport {
        fn init_run(&self, _request: InitRunRequest) -> Result<InitRunResponse, crate::error::TransportError> {
            unimplemented!()
        }

        fn send_batch(
            &self,
            envelope: &BatchEnvelope,
            _compressed: bool,
            _raw_payload: Option<&[u8]>,
        ) -> Result<crate::transport::SendBatchResponse, crate::error::TransportError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(crate::error::TransportError::Timeout);
            }
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(crate::transport::SendBatchResponse {
                status: "ok".into(),
                accepted: envelope.metrics.len() as i64,
                duplicate: false,
            })
        }

        fn finish_run(&self, _run_id: &str, _status: &str) -> Result<FinishRunResponse, crate::error::TransportError> {
            unimplemented!()
        }

        fn health_check(&self) -> Result<(), crate::error::TransportError> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn test_worker(transport: Arc<dyn Transport>, spool: Option<Arc<DiskSpool>>) -> (Arc<FlushWorker>, Arc<EventQueue>) {
        let queue = Arc::new(EventQueue::new(1000));
        let connection = Arc::new(ConnectionState::new());
        let config = Config {
            batch_timeout_ms: 30,
            retry_delay_ms: 5,
            ..Config::default()
        };
        let worker = Arc::new(FlushWorker::new(queue.clone(), transport, connection, spool, config));
        (worker, queue)
    }

    #[test]
    fn sends_a_batch_after_queueing_events() {
        let transport = Arc::new(FakeTransport::new(0));
        let (worker, queue) = test_worker(transport.clone(), None);
        worker.start();

        queue.put(Event::metric("run-1", "loss", 0.5, 0));
        queue.put(Event::metric("run-1", "accuracy", 0.8, 0));

        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.counters().batch_count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        worker.stop(Duration::from_secs(2));

        assert_eq!(worker.counters().batch_count.load(Ordering::SeqCst), 1);
        assert_eq!(transport.sent.lock().unwrap()[0].metrics.len(), 2);
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let transport = Arc::new(FakeTransport::new(2));
        let (worker, queue) = test_worker(transport.clone(), None);
        worker.start();

        queue.put(Event::metric("run-1", "loss", 0.5, 0));

        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.counters().batch_count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        worker.stop(Duration::from_secs(2));

        assert_eq!(worker.counters().batch_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_retries_spool_the_batch() {
        use crate::spool::SpoolConfig;
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let spool = Arc::new(
            DiskSpool::new(SpoolConfig {
                spool_dir: dir.path().to_path_buf(),
                ..SpoolConfig::default()
            })
            .unwrap(),
        );

        let transport = Arc::new(FakeTransport::new(100));
        let queue = Arc::new(EventQueue::new(1000));
        let connection = Arc::new(ConnectionState::new());
        let config = Config {
            batch_timeout_ms: 30,
            retry_delay_ms: 1,
            max_retries: 1,
            ..Config::default()
        };
        let worker = Arc::new(FlushWorker::new(
            queue.clone(),
            transport,
            connection,
            Some(spool.clone()),
            config,
        ));
        worker.start();

        queue.put(Event::metric("run-1", "loss", 0.5, 0));

        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.counters().spool_writes.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        worker.stop(Duration::from_secs(2));

        assert_eq!(worker.counters().spool_writes.load(Ordering::SeqCst), 1);
        spool.flush_all().unwrap();
        assert_eq!(spool.stats().unwrap().pending_events, 1);
    }
}
