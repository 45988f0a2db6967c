//! Adaptive batching: accumulates events, coalesces metrics/params/tags, and
//! decides when a batch should be flushed.

use crate::event::{CoalesceKey, Event, EventType};
use std::collections::HashMap;
use std::time::Instant;

/// Tunables governing when a batch should flush and whether coalescing is
/// applied. See `Config` for the process-wide defaults these are seeded from.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_items: usize,
    pub max_bytes: usize,
    pub max_age_ms: u64,
    pub coalesce_metrics: bool,
    pub dedupe_params: bool,
    pub dedupe_tags: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_items: 1000,
            max_bytes: 1_000_000,
            max_age_ms: 1000,
            coalesce_metrics: true,
            dedupe_params: true,
            dedupe_tags: true,
        }
    }
}

/// Which flush trigger fired, in priority order. Read off the batch's stats
/// immediately before flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Size,
    Bytes,
    Time,
    Manual,
    Shutdown,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Size => "size",
            Trigger::Bytes => "bytes",
            Trigger::Time => "time",
            Trigger::Manual => "manual",
            Trigger::Shutdown => "shutdown",
        }
    }
}

/// Snapshot of a single in-progress (or just-flushed) batch's statistics.
#[derive(Debug, Clone)]
pub struct BatchStats {
    pub event_count: usize,
    pub metric_count: usize,
    pub param_count: usize,
    pub tag_count: usize,
    pub estimated_bytes: usize,
    pub coalesced_count: usize,
    pub created_at: Instant,
}

impl Default for BatchStats {
    fn default() -> Self {
        BatchStats {
            event_count: 0,
            metric_count: 0,
            param_count: 0,
            tag_count: 0,
            estimated_bytes: 0,
            coalesced_count: 0,
            created_at: Instant::now(),
        }
    }
}

impl BatchStats {
    pub fn age_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }
}

/// Accumulates events for a single, worker-owned batch. Not `Sync` by
/// convention: the base spec requires it be owned exclusively by the flush
/// worker, so no internal locking is used.
pub struct AdaptiveBatcher {
    config: BatchConfig,
    events: Vec<Event>,
    stats: BatchStats,
    index: HashMap<CoalesceKey, usize>,
}

impl AdaptiveBatcher {
    pub fn new(config: BatchConfig) -> Self {
        AdaptiveBatcher {
            config,
            events: Vec::new(),
            stats: BatchStats::default(),
            index: HashMap::new(),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.stats.event_count == 0
    }

    /// Add an event to the batch, applying coalescing/dedup per its kind.
    /// Returns `true` if the batch should be flushed after this add.
    pub fn add(&mut self, event: Event) -> bool {
        if self.stats.event_count == 0 {
            self.stats.created_at = Instant::now();
        }

        let coalesce_enabled = match event.kind {
            EventType::Metric => self.config.coalesce_metrics,
            EventType::Param => self.config.dedupe_params,
            EventType::Tag => self.config.dedupe_tags,
            _ => false,
        };

        match (coalesce_enabled, event.coalesce_key()) {
            (true, Some(key)) => self.add_coalesced(key, event),
            _ => self.append(event),
        }

        self.should_flush()
    }

    fn add_coalesced(&mut self, key: CoalesceKey, event: Event) {
        if let Some(&idx) = self.index.get(&key) {
            let old_bytes = self.events[idx].estimated_bytes();
            let new_bytes = event.estimated_bytes();
            self.events[idx] = event;
            self.stats.coalesced_count += 1;
            self.stats.estimated_bytes = self.stats.estimated_bytes + new_bytes - old_bytes;
        } else {
            let idx = self.events.len();
            self.index.insert(key, idx);
            self.append(event);
        }
    }

    fn append(&mut self, event: Event) {
        self.stats.event_count += 1;
        self.stats.estimated_bytes += event.estimated_bytes();
        match event.kind {
            EventType::Metric => self.stats.metric_count += 1,
            EventType::Param => self.stats.param_count += 1,
            EventType::Tag => self.stats.tag_count += 1,
            _ => {}
        }
        self.events.push(event);
    }

    /// Any flush trigger fired.
    pub fn should_flush(&self) -> bool {
        self.stats.event_count >= self.config.max_items
            || self.stats.estimated_bytes >= self.config.max_bytes
            || self.stats.age_ms() >= self.config.max_age_ms
    }

    /// Which trigger fired, in size -> bytes -> time priority order. `None`
    /// if none has fired yet (a manual/shutdown flush is still valid in that
    /// case; the caller supplies the trigger explicitly).
    pub fn fired_trigger(&self) -> Option<Trigger> {
        if self.stats.event_count >= self.config.max_items {
            Some(Trigger::Size)
        } else if self.stats.estimated_bytes >= self.config.max_bytes {
            Some(Trigger::Bytes)
        } else if self.stats.age_ms() >= self.config.max_age_ms {
            Some(Trigger::Time)
        } else {
            None
        }
    }

    /// Flush the batch, returning its events (in first-insert order for
    /// retained identities) and final stats. Resets all internal state.
    pub fn flush(&mut self) -> (Vec<Event>, BatchStats) {
        let events = std::mem::take(&mut self.events);
        let stats = std::mem::take(&mut self.stats);
        self.index.clear();
        (events, stats)
    }
}

/// Cumulative, process-lifetime counters about flush operations -- distinct
/// from the per-batch `BatchStats`, which resets on every flush.
#[derive(Debug, Clone, Default)]
pub struct FlushMetrics {
    pub total_flushes: u64,
    pub total_events_sent: u64,
    pub total_bytes_sent: u64,
    pub total_coalesced: u64,
    pub last_flush_duration_ms: u64,
    pub last_batch_size: usize,
    pub size_triggered: u64,
    pub bytes_triggered: u64,
    pub time_triggered: u64,
    pub manual_triggered: u64,
    pub shutdown_triggered: u64,
}

impl FlushMetrics {
    pub fn record_flush(&mut self, stats: &BatchStats, duration_ms: u64, trigger: Trigger) {
        self.total_flushes += 1;
        self.total_events_sent += stats.event_count as u64;
        self.total_bytes_sent += stats.estimated_bytes as u64;
        self.total_coalesced += stats.coalesced_count as u64;
        self.last_flush_duration_ms = duration_ms;
        self.last_batch_size = stats.event_count;

        match trigger {
            Trigger::Size => self.size_triggered += 1,
            Trigger::Bytes => self.bytes_triggered += 1,
            Trigger::Time => self.time_triggered += 1,
            Trigger::Manual => self.manual_triggered += 1,
            Trigger::Shutdown => self.shutdown_triggered += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_metrics_keeping_last_value_and_slot_position() {
        let mut batcher = AdaptiveBatcher::new(BatchConfig::default());
        batcher.add(Event::metric("r", "loss", 0.5, 0));
        batcher.add(Event::metric("r", "acc", 0.1, 0));
        batcher.add(Event::metric("r", "loss", 0.4, 0));
        batcher.add(Event::metric("r", "loss", 0.3, 0));

        let (events, stats) = batcher.flush();
        assert_eq!(events.len(), 2);
        assert_eq!(stats.coalesced_count, 2);

        // First-insert order preserved: loss (slot 0), acc (slot 1).
        assert_eq!(events[0].data["name"], crate::event::PayloadValue::Str("loss".into()));
        assert_eq!(events[0].data["value"], crate::event::PayloadValue::Num(0.3));
        assert_eq!(events[1].data["name"], crate::event::PayloadValue::Str("acc".into()));
    }

    #[test]
    fn dedupes_params_by_name() {
        let mut batcher = AdaptiveBatcher::new(BatchConfig::default());
        batcher.add(Event::param("r", "lr", 0.1));
        batcher.add(Event::param("r", "lr", 0.01));
        let (events, stats) = batcher.flush();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["value"], crate::event::PayloadValue::Str("0.01".into()));
        assert_eq!(stats.coalesced_count, 1);
    }

    #[test]
    fn dedupes_tags_by_key() {
        let mut batcher = AdaptiveBatcher::new(BatchConfig::default());
        batcher.add(Event::tag("r", "env", "staging"));
        batcher.add(Event::tag("r", "env", "prod"));
        let (events, _) = batcher.flush();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["value"], crate::event::PayloadValue::Str("prod".into()));
    }

    #[test]
    fn disabling_coalescing_makes_batcher_append_only() {
        let config = BatchConfig {
            coalesce_metrics: false,
            ..BatchConfig::default()
        };
        let mut batcher = AdaptiveBatcher::new(config);
        batcher.add(Event::metric("r", "loss", 0.5, 0));
        batcher.add(Event::metric("r", "loss", 0.4, 0));
        let (events, _) = batcher.flush();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn size_trigger_fires_at_max_items() {
        let config = BatchConfig {
            max_items: 2,
            ..BatchConfig::default()
        };
        let mut batcher = AdaptiveBatcher::new(config);
        assert!(!batcher.add(Event::tag("r", "a", "1")));
        assert!(batcher.add(Event::tag("r", "b", "2")));
        assert_eq!(batcher.fired_trigger(), Some(Trigger::Size));
    }

    #[test]
    fn bytes_trigger_fires_before_size_when_smaller() {
        let config = BatchConfig {
            max_items: 10_000,
            max_bytes: 10,
            ..BatchConfig::default()
        };
        let mut batcher = AdaptiveBatcher::new(config);
        assert!(batcher.add(Event::tag("r", "k", "v")));
        assert_eq!(batcher.fired_trigger(), Some(Trigger::Bytes));
    }

    #[test]
    fn flush_resets_all_internal_state() {
        let mut batcher = AdaptiveBatcher::new(BatchConfig::default());
        batcher.add(Event::metric("r", "loss", 0.5, 0));
        batcher.flush();
        assert!(batcher.is_empty());
        assert_eq!(batcher.stats().estimated_bytes, 0);

        // Coalescing index was cleared -- a repeat (name, step) is a fresh slot.
        batcher.add(Event::metric("r", "loss", 0.1, 0));
        let (events, stats) = batcher.flush();
        assert_eq!(events.len(), 1);
        assert_eq!(stats.coalesced_count, 0);
    }
}
