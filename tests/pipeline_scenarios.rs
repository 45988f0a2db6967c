//! End-to-end scenarios driven against an in-process fake transport: basic
//! delivery, metric coalescing, idempotent retry, offline-to-spool-to-sync
//! recovery, queue overflow, and hot-path latency.

use runtrace::{
    BatchEnvelope, Config, Event, FinishRunResponse, InitRunRequest, InitRunResponse, Pipeline,
    SendBatchResponse, Transport, TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct FakeTransportState {
    fail_next: usize,
    sent_envelopes: Vec<BatchEnvelope>,
    duplicate_next: bool,
}

struct FakeTransport {
    state: Mutex<FakeTransportState>,
    offline: AtomicUsize,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(FakeTransport {
            state: Mutex::new(FakeTransportState::default()),
            offline: AtomicUsize::new(0),
        })
    }

    fn fail_next_n(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    fn respond_duplicate_once(&self) {
        self.state.lock().unwrap().duplicate_next = true;
    }

    fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent_envelopes.len()
    }

    fn total_metrics_sent(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .sent_envelopes
            .iter()
            .map(|e| e.metrics.len())
            .sum()
    }
}

impl Transport for FakeTransport {
    fn init_run(&self, request: InitRunRequest) -> Result<InitRunResponse, TransportError> {
        Ok(InitRunResponse {
            run_id: request.run_id.unwrap_or_else(|| "run-under-test".to_string()),
            offline: false,
        })
    }

    fn send_batch(
        &self,
        envelope: &BatchEnvelope,
        _compressed: bool,
        _raw_payload: Option<&[u8]>,
    ) -> Result<SendBatchResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Timeout);
        }
        let duplicate = std::mem::take(&mut state.duplicate_next);
        state.sent_envelopes.push(envelope.clone());
        Ok(SendBatchResponse {
            status: "ok".to_string(),
            accepted: envelope.metrics.len() as i64,
            duplicate,
        })
    }

    fn finish_run(&self, _run_id: &str, status: &str) -> Result<FinishRunResponse, TransportError> {
        Ok(FinishRunResponse {
            status: status.to_string(),
        })
    }

    fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) {}
}

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        spool_dir: dir.to_path_buf(),
        batch_timeout_ms: 20,
        retry_delay_ms: 5,
        retry_max_delay_ms: 50,
        ..Config::default()
    }
}

/// S1 -- basic path: two metrics logged at two steps, then finish; all four
/// land in one batch, and finish_run reports "finished".
#[test]
fn s1_basic_path_sends_all_metrics_in_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let pipeline = Pipeline::with_transport(test_config(dir.path()), transport.clone()).unwrap();

    let run_id = pipeline.init_run("demo", None);
    pipeline.log(Event::metric(&run_id, "loss", 0.5, 0));
    pipeline.log(Event::metric(&run_id, "accuracy", 0.8, 0));
    pipeline.log(Event::metric(&run_id, "loss", 0.3, 1));
    pipeline.log(Event::metric(&run_id, "accuracy", 0.9, 1));

    std::thread::sleep(Duration::from_millis(80));
    pipeline.finish_run(&run_id, "finished");
    let summary = pipeline.shutdown(Duration::from_secs(2));

    assert!(transport.total_metrics_sent() >= 4);
    assert_eq!(summary.errors, 0);
}

/// S2 -- coalescing: the same metric identity logged three times in a row
/// transmits once, carrying the last value.
#[test]
fn s2_coalescing_collapses_same_step_metric() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let pipeline = Pipeline::with_transport(test_config(dir.path()), transport.clone()).unwrap();

    let run_id = pipeline.init_run("demo", None);
    pipeline.log(Event::metric(&run_id, "loss", 0.5, 0));
    pipeline.log(Event::metric(&run_id, "loss", 0.4, 0));
    pipeline.log(Event::metric(&run_id, "loss", 0.3, 0));

    std::thread::sleep(Duration::from_millis(80));
    pipeline.shutdown(Duration::from_secs(2));

    let sent = transport.total_metrics_sent();
    assert_eq!(sent, 1, "expected exactly one coalesced metric, got {sent}");
}

/// S3 -- idempotent retry: the first send fails retryably, the retry gets a
/// `duplicate: true` response, which the worker counts as a single success.
#[test]
fn s3_idempotent_retry_counts_as_one_success() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.fail_next_n(1);
    transport.respond_duplicate_once();

    let pipeline = Pipeline::with_transport(test_config(dir.path()), transport.clone()).unwrap();
    let run_id = pipeline.init_run("demo", None);
    pipeline.log(Event::metric(&run_id, "loss", 0.5, 0));

    std::thread::sleep(Duration::from_millis(150));
    let summary = pipeline.shutdown(Duration::from_secs(2));

    assert_eq!(summary.batches_sent, 1);
    assert_eq!(transport.sent_count(), 1);
}

/// S4 -- offline -> spool -> sync: three consecutive failures trip the
/// connection offline and spool the batch; once the transport recovers, the
/// syncer's periodic pass drains the spool.
#[test]
fn s4_offline_then_spool_then_sync_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    // max_retries is 2 below, so a single flush attempt makes 3 calls (one
    // send plus two retries) -- enough on its own to cross the offline
    // threshold of 3 consecutive failures (connection.rs) deterministically,
    // rather than depending on a second batch's failures to get there.
    transport.fail_next_n(100);

    let config = Config {
        max_retries: 2,
        spool_sync_interval_ms: 30,
        ..test_config(dir.path())
    };
    let pipeline = Pipeline::with_transport(config, transport.clone()).unwrap();
    let run_id = pipeline.init_run("demo", None);

    for step in 0..10 {
        pipeline.log(Event::metric(&run_id, "loss", 1.0 / (step as f64 + 1.0), step));
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while pipeline.connection().is_online() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!pipeline.connection().is_online(), "connection should have tripped offline");

    // Recovery: subsequent sends succeed, so the next syncer tick should
    // drain whatever landed in the spool.
    transport.fail_next_n(0);
    pipeline.connection().record_success();

    let deadline = Instant::now() + Duration::from_secs(3);
    while transport.sent_count() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    pipeline.shutdown(Duration::from_secs(2));
    assert!(transport.sent_count() >= 1, "syncer never replayed the spooled batch");
}

/// S5 -- queue overflow: a two-slot queue offered five events in rapid
/// succession drops exactly three, and the offering itself stays fast.
#[test]
fn s5_queue_overflow_drops_excess_and_stays_fast() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let config = Config {
        queue_size: 2,
        batch_timeout_ms: 5_000, // keep the worker from draining mid-test
        ..test_config(dir.path())
    };
    let pipeline = Pipeline::with_transport(config, transport).unwrap();
    let run_id = pipeline.init_run("demo", None);

    let start = Instant::now();
    for step in 0..5 {
        pipeline.log(Event::metric(&run_id, "loss", 0.1, step));
    }
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_millis(100));
    pipeline.shutdown(Duration::from_secs(2));
}

/// S6 -- hot-path latency: 1000 log calls against a pipeline with a large
/// queue complete well under 100ms; the producer never blocks on the
/// network or the worker thread.
#[test]
fn s6_hot_path_latency_is_not_blocked_by_network() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let config = Config {
        queue_size: 100_000,
        batch_timeout_ms: 5_000,
        ..test_config(dir.path())
    };
    let pipeline = Pipeline::with_transport(config, transport).unwrap();
    let run_id = pipeline.init_run("demo", None);

    let start = Instant::now();
    for step in 0..1000 {
        pipeline.log(Event::metric(&run_id, "loss", 0.1, step));
    }
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_millis(100), "1000 logs took {elapsed:?}");
    pipeline.shutdown(Duration::from_secs(2));
}
