//! runtrace
//!
//! A non-blocking client-side experiment-tracking pipeline: producers log
//! metrics, params, and tags at kilohertz rates without ever blocking on
//! the network; a background worker batches, compresses, and ships them to
//! a remote ingest service, falling back to a durable on-disk spool when
//! the service is unreachable and syncing it back once the connection
//! recovers.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use runtrace::{Config, Event, Pipeline};
//! use std::time::Duration;
//!
//! let pipeline = Pipeline::new(Config::from_env())?;
//! let run_id = pipeline.init_run("demo-project", None);
//!
//! pipeline.log(Event::metric(&run_id, "loss", 0.42, 0));
//! pipeline.log(Event::param(&run_id, "learning_rate", 0.001));
//!
//! pipeline.finish_run(&run_id, "finished");
//! let summary = pipeline.shutdown(Duration::from_secs(5));
//! println!("{summary:?}");
//! # Ok::<(), runtrace::PipelineError>(())
//! ```

mod batch;
mod config;
mod connection;
mod error;
mod event;
mod pipeline;
mod queue;
mod spool;
mod syncer;
mod transport;
mod worker;

pub use batch::{AdaptiveBatcher, BatchConfig, BatchStats, FlushMetrics, Trigger};
pub use config::Config;
pub use connection::{ConnState, ConnectionSnapshot, ConnectionState};
pub use error::{PipelineError, SpoolError, TransportError};
pub use event::{Event, EventType, PayloadValue};
pub use pipeline::{Pipeline, PipelineStats};
pub use queue::EventQueue;
pub use spool::{DiskSpool, SpoolConfig, SpoolStats};
pub use syncer::SpoolSyncer;
pub use transport::{
    BatchEnvelope, BatchStatsEnvelope, FinishRunResponse, HttpTransport, HttpTransportBuilder,
    InitRunRequest, InitRunResponse, MetricRow, ParamRow, SendBatchResponse, TagRow, Transport,
};
pub use worker::FlushWorker;
