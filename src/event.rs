//! Events: the immutable, tagged records producers enqueue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// The kind of an [`Event`], determining how its payload is shaped and how
/// the batcher coalesces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Metric,
    Param,
    Tag,
    Artifact,
    RunStart,
    RunFinish,
}

/// A payload value: either a string or a number. Values are coerced to
/// string at ingest for params and tags; metrics keep their numeric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Str(String),
    Num(f64),
}

impl PayloadValue {
    fn estimate_len(&self) -> usize {
        match self {
            PayloadValue::Str(s) => s.len(),
            // Matches the base system's `len(str(v))` estimate closely enough
            // for the batcher's byte budget; exactness isn't the point.
            PayloadValue::Num(n) => format!("{n}").len(),
        }
    }
}

impl From<String> for PayloadValue {
    fn from(s: String) -> Self {
        PayloadValue::Str(s)
    }
}

impl From<&str> for PayloadValue {
    fn from(s: &str) -> Self {
        PayloadValue::Str(s.to_string())
    }
}

impl From<f64> for PayloadValue {
    fn from(n: f64) -> Self {
        PayloadValue::Num(n)
    }
}

/// A single event queued for delivery. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub run_id: String,
    pub timestamp: f64,
    pub data: BTreeMap<String, PayloadValue>,
}

impl Event {
    /// Build a metric event. This constructor does not itself validate
    /// `value` -- callers on the hot path should go through
    /// `Pipeline::log_metric`, which rejects non-finite values before an
    /// `Event` is ever built.
    pub fn metric(run_id: impl Into<String>, name: impl Into<String>, value: f64, step: i64) -> Self {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), PayloadValue::Str(name.into()));
        data.insert("value".to_string(), PayloadValue::Num(value));
        data.insert("step".to_string(), PayloadValue::Num(step as f64));
        let timestamp = now_secs();
        data.insert("timestamp".to_string(), PayloadValue::Num(timestamp));
        Event {
            kind: EventType::Metric,
            run_id: run_id.into(),
            timestamp,
            data,
        }
    }

    pub fn param(run_id: impl Into<String>, name: impl Into<String>, value: impl ToString) -> Self {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), PayloadValue::Str(name.into()));
        data.insert("value".to_string(), PayloadValue::Str(value.to_string()));
        Event {
            kind: EventType::Param,
            run_id: run_id.into(),
            timestamp: now_secs(),
            data,
        }
    }

    pub fn tag(run_id: impl Into<String>, key: impl Into<String>, value: impl ToString) -> Self {
        let mut data = BTreeMap::new();
        data.insert("key".to_string(), PayloadValue::Str(key.into()));
        data.insert("value".to_string(), PayloadValue::Str(value.to_string()));
        Event {
            kind: EventType::Tag,
            run_id: run_id.into(),
            timestamp: now_secs(),
            data,
        }
    }

    pub fn run_start(run_id: impl Into<String>) -> Self {
        Event {
            kind: EventType::RunStart,
            run_id: run_id.into(),
            timestamp: now_secs(),
            data: BTreeMap::new(),
        }
    }

    pub fn run_finish(run_id: impl Into<String>, status: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert("status".to_string(), PayloadValue::Str(status.into()));
        Event {
            kind: EventType::RunFinish,
            run_id: run_id.into(),
            timestamp: now_secs(),
            data,
        }
    }

    /// Metric coalescing / param dedup / tag dedup identity, where applicable.
    pub(crate) fn coalesce_key(&self) -> Option<CoalesceKey> {
        match self.kind {
            EventType::Metric => {
                let name = match self.data.get("name") {
                    Some(PayloadValue::Str(s)) => s.clone(),
                    _ => String::new(),
                };
                let step = match self.data.get("step") {
                    Some(PayloadValue::Num(n)) => *n as i64,
                    _ => 0,
                };
                Some(CoalesceKey::Metric(name, step))
            }
            EventType::Param => {
                let name = match self.data.get("name") {
                    Some(PayloadValue::Str(s)) => s.clone(),
                    _ => String::new(),
                };
                Some(CoalesceKey::Param(name))
            }
            EventType::Tag => {
                let key = match self.data.get("key") {
                    Some(PayloadValue::Str(s)) => s.clone(),
                    _ => String::new(),
                };
                Some(CoalesceKey::Tag(key))
            }
            _ => None,
        }
    }

    /// `estimated_bytes(e)` from the base spec: 50 + sum(len(k) + len(v) + 10).
    pub(crate) fn estimated_bytes(&self) -> usize {
        let base = 50;
        let data_size: usize = self
            .data
            .iter()
            .map(|(k, v)| k.len() + v.estimate_len() + 10)
            .sum();
        base + data_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum CoalesceKey {
    Metric(String, i64),
    Param(String),
    Tag(String),
}

pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
