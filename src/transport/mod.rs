//! The transport contract (§4.H): what the flush worker and syncer need from
//! any ingest backend, plus the wire envelope (§6) both sides speak.

mod http;

pub use http::{HttpTransport, HttpTransportBuilder};

use crate::error::TransportError;
use serde::{Deserialize, Serialize};

/// One metric row in a batch envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRow {
    pub name: String,
    pub value: f64,
    pub step: i64,
    pub timestamp: f64,
}

/// One param row in a batch envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamRow {
    pub name: String,
    pub value: String,
}

/// One tag row in a batch envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRow {
    pub key: String,
    pub value: String,
}

/// Summary counts carried alongside a batch, mirroring `BatchStats`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchStatsEnvelope {
    pub metric_count: usize,
    pub param_count: usize,
    pub tag_count: usize,
    pub coalesced_count: usize,
}

/// The ingest wire format (§6): `POST /api/v1/ingest/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub run_id: String,
    pub metrics: Vec<MetricRow>,
    pub params: Vec<ParamRow>,
    pub tags: Vec<TagRow>,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub stats: BatchStatsEnvelope,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendBatchResponse {
    pub status: String,
    #[serde(default)]
    pub accepted: i64,
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitRunRequest {
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<std::collections::BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitRunResponse {
    pub run_id: String,
    #[serde(default)]
    pub offline: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinishRunResponse {
    pub status: String,
}

/// What the flush worker and syncer require from any ingest backend.
///
/// A `send_batch` call may be given a pre-serialized (possibly gzipped)
/// `raw_payload`; when present it takes precedence over re-serializing
/// `envelope`, since the worker already did that work once to decide whether
/// to compress.
pub trait Transport: Send + Sync {
    fn init_run(&self, request: InitRunRequest) -> Result<InitRunResponse, TransportError>;

    fn send_batch(
        &self,
        envelope: &BatchEnvelope,
        compressed: bool,
        raw_payload: Option<&[u8]>,
    ) -> Result<SendBatchResponse, TransportError>;

    fn finish_run(&self, run_id: &str, status: &str) -> Result<FinishRunResponse, TransportError>;

    fn health_check(&self) -> Result<(), TransportError>;

    fn close(&self);
}
