//! Top-level wiring: owns the queue, worker thread, spool, and syncer
//! thread for a single process. No global singleton -- callers construct
//! and hold a `Pipeline` explicitly (see §9, "Global state").

use crate::config::Config;
use crate::connection::ConnectionState;
use crate::error::PipelineError;
use crate::event::Event;
use crate::queue::EventQueue;
use crate::spool::{DiskSpool, SpoolConfig};
use crate::syncer::{SpoolSyncer, SyncSendFn};
use crate::transport::{HttpTransport, InitRunRequest, Transport};
use crate::worker::FlushWorker;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Run-local counters: dropped events, batches sent, errors, spool writes,
/// and coalesce count (§8). Obtainable at any time via `Pipeline::stats`,
/// not only at shutdown.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub dropped_events: u64,
    pub batches_sent: u64,
    pub errors: u64,
    pub spool_writes: u64,
    pub coalesced_count: u64,
}

/// Owns every moving part of the pipeline for one process: the bounded
/// queue producers enqueue into, the flush worker thread, and (when spool
/// is enabled) the disk spool and its background syncer thread.
pub struct Pipeline {
    queue: Arc<EventQueue>,
    worker: Arc<FlushWorker>,
    syncer: Option<SpoolSyncer>,
    connection: Arc<ConnectionState>,
    transport: Arc<dyn Transport>,
    config: Config,
}

impl Pipeline {
    /// Build a pipeline using the default HTTP transport, constructed from
    /// `config.server_url`/`api_key`.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let mut builder = HttpTransport::builder()
            .base_url(&config.server_url)
            .timeout(config.connection_timeout());
        if let Some(key) = &config.api_key {
            builder = builder.api_key(key.clone());
        }
        let transport = Arc::new(builder.build()?);
        Self::with_transport(config, transport)
    }

    /// Build a pipeline around a caller-supplied transport. Used by tests
    /// and by callers wiring in an alternate ingest backend.
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, PipelineError> {
        let queue = Arc::new(EventQueue::new(config.queue_size));
        let connection = Arc::new(ConnectionState::new());

        let spool = if config.spool_enabled {
            let spool_config = SpoolConfig {
                spool_dir: config.spool_dir.clone(),
                max_file_size_bytes: config.spool_max_file_size_bytes,
                max_total_size_bytes: config.spool_max_size_bytes,
                sync_interval_ms: config.spool_sync_interval_ms,
                retention_hours: config.spool_retention_hours,
            };
            Some(Arc::new(DiskSpool::new(spool_config)?))
        } else {
            None
        };

        let worker = Arc::new(FlushWorker::new(
            queue.clone(),
            transport.clone(),
            connection.clone(),
            spool.clone(),
            config.clone(),
        ));
        worker.start();

        let syncer = spool.map(|spool| {
            let transport_for_sync = transport.clone();
            let send: SyncSendFn = Arc::new(move |events: Vec<Event>| {
                send_spooled_batch(&transport_for_sync, &events)
            });
            let syncer = SpoolSyncer::new(spool, connection.clone(), send);
            syncer.start();
            syncer
        });

        Ok(Pipeline {
            queue,
            worker,
            syncer,
            connection,
            transport,
            config,
        })
    }

    /// Producer-facing hot path: never blocks beyond the short queue lock,
    /// never raises. Returns `false` (and the event is dropped) if the queue
    /// is full.
    pub fn log(&self, event: Event) -> bool {
        self.queue.put(event)
    }

    /// Log a metric, validating `value` is finite first (§9). A `NaN` or
    /// infinite value is rejected and never reaches the queue -- logged and
    /// dropped, the same as any other producer-path failure.
    pub fn log_metric(
        &self,
        run_id: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        step: i64,
    ) -> bool {
        if !value.is_finite() {
            tracing::warn!(value, "rejected non-finite metric value");
            return false;
        }
        self.log(Event::metric(run_id, name, value, step))
    }

    pub fn init_run(&self, project: impl Into<String>, name: Option<String>) -> String {
        match self.transport.init_run(InitRunRequest {
            project: project.into(),
            name,
            run_id: None,
            tags: None,
            config: None,
        }) {
            Ok(response) => response.run_id,
            Err(err) => {
                tracing::error!(error = %err, "init_run failed, generating local run id");
                uuid::Uuid::new_v4().to_string()
            }
        }
    }

    pub fn finish_run(&self, run_id: &str, status: &str) {
        if let Err(err) = self.transport.finish_run(run_id, status) {
            tracing::warn!(error = %err, "finish_run failed, will be synced later");
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionState> {
        &self.connection
    }

    pub fn flush(&self) {
        self.worker.flush();
    }

    /// Snapshot of run-local counters, readable at any point during the
    /// run -- not only at shutdown.
    pub fn stats(&self) -> PipelineStats {
        let counters = self.worker.counters();
        PipelineStats {
            dropped_events: self.queue.dropped_count(),
            batches_sent: counters.batch_count.load(Ordering::Relaxed),
            errors: counters.error_count.load(Ordering::Relaxed),
            spool_writes: counters.spool_writes.load(Ordering::Relaxed),
            coalesced_count: counters.coalesced_count.load(Ordering::Relaxed),
        }
    }

    /// Cooperative shutdown: stop the worker (it runs a final drain) and the
    /// syncer, then return a final stats snapshot.
    pub fn shutdown(&self, timeout: Duration) -> PipelineStats {
        self.worker.stop(timeout);
        if let Some(syncer) = &self.syncer {
            syncer.stop();
        }
        self.transport.close();

        self.stats()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn send_spooled_batch(transport: &Arc<dyn Transport>, events: &[Event]) -> bool {
    if events.is_empty() {
        return true;
    }
    let stats = crate::batch::BatchStats {
        event_count: events.len(),
        metric_count: events.iter().filter(|e| e.kind == crate::event::EventType::Metric).count(),
        param_count: events.iter().filter(|e| e.kind == crate::event::EventType::Param).count(),
        tag_count: events.iter().filter(|e| e.kind == crate::event::EventType::Tag).count(),
        estimated_bytes: 0,
        coalesced_count: 0,
        created_at: std::time::Instant::now(),
    };
    let envelope = crate::worker::build_envelope(events, &stats);
    match transport.send_batch(&envelope, false, None) {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(error = %err, "spool replay send failed");
            false
        }
    }
}
