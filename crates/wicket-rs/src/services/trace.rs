//! Per-request trace recording with a bounded in-memory map.
//!
//! Records are created at pipeline entry and removed on completion, when a
//! summary is emitted to the configured sink. The map is bounded by capacity
//! (oldest evicted on overflow) and by TTL (background sweeper), so an
//! abandoned record can never pin memory. Snapshot queries serve live
//! dashboards without touching the hot path.

use crate::context::{RequestContext, RequestOutcome};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An inflight or just-completed request trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub method: String,
    pub path: String,
    pub start: DateTime<Utc>,
    #[serde(skip)]
    started: Instant,
    pub end: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub outcome: &'static str,
    pub error_kind: Option<String>,
    pub identity: Option<String>,
}

/// Completion summary handed to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub method: String,
    pub path: String,
    pub start: DateTime<Utc>,
    pub duration_ms: u64,
    pub status_code: Option<u16>,
    pub outcome: &'static str,
    pub error_kind: Option<String>,
    pub identity: Option<String>,
}

/// Aggregate statistics over completed requests since startup.
#[derive(Debug, Clone, Serialize)]
pub struct TraceStats {
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub average_duration_ms: u64,
}

/// Out-of-core log sink collaborator: one `record` operation.
pub trait TraceSink: Send + Sync {
    fn record(&self, summary: &TraceSummary);
}

/// Writes completion summaries as structured log lines.
pub struct LogSink;

impl TraceSink for LogSink {
    fn record(&self, summary: &TraceSummary) {
        match serde_json::to_string(summary) {
            Ok(line) => log::info!(target: "wicket::trace", "{}", line),
            Err(e) => log::warn!("failed to serialize trace summary: {}", e),
        }
    }
}

/// Bounded concurrent trace map with TTL-based sweeping.
pub struct TraceRecorder {
    records: DashMap<String, TraceRecord>,
    capacity: usize,
    ttl: Duration,
    sink: Arc<dyn TraceSink>,

    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    duration_total_ms: AtomicU64,

    /// Operational counters (e.g. `rate-limit-store-unavailable`).
    counters: DashMap<String, AtomicU64>,
}

impl TraceRecorder {
    pub fn new(capacity: usize, ttl: Duration, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            records: DashMap::new(),
            capacity,
            ttl,
            sink,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            duration_total_ms: AtomicU64::new(0),
            counters: DashMap::new(),
        }
    }

    /// Registers a new inflight request.
    ///
    /// On overflow the oldest record is evicted without a sink event; losing
    /// a trace never rejects a request.
    pub fn start(&self, ctx: &RequestContext) {
        if self.records.len() >= self.capacity {
            self.evict_oldest();
        }

        self.records.insert(
            ctx.trace_id.clone(),
            TraceRecord {
                trace_id: ctx.trace_id.clone(),
                method: ctx.method.clone(),
                path: ctx.path.clone(),
                start: ctx.received_at,
                started: Instant::now(),
                end: None,
                duration_ms: None,
                status_code: None,
                outcome: RequestOutcome::InFlight.as_str(),
                error_kind: None,
                identity: None,
            },
        );
    }

    /// Completes a trace: emits the summary to the sink and drops the record.
    pub fn complete(
        &self,
        ctx: &RequestContext,
        status_code: Option<u16>,
        error_kind: Option<String>,
    ) {
        let duration_ms = ctx
            .duration
            .unwrap_or_else(|| ctx.elapsed())
            .as_millis() as u64;

        match ctx.outcome {
            RequestOutcome::ClientCancelled => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            RequestOutcome::Failed | RequestOutcome::Timeout => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.duration_total_ms.fetch_add(duration_ms, Ordering::Relaxed);

        let summary = TraceSummary {
            trace_id: ctx.trace_id.clone(),
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            start: ctx.received_at,
            duration_ms,
            status_code,
            outcome: ctx.outcome.as_str(),
            error_kind,
            identity: ctx.identity_summary(),
        };

        self.sink.record(&summary);
        self.records.remove(&ctx.trace_id);
    }

    /// Completes a trace as client-cancelled.
    ///
    /// Used by the coordinator's drop guard when the handler future is
    /// dropped mid-flight: the disconnect is recorded from the trace map
    /// alone since the context is gone with the task.
    pub fn cancel(&self, trace_id: &str) {
        let Some((_, record)) = self.records.remove(trace_id) else {
            return;
        };

        let duration_ms = record.started.elapsed().as_millis() as u64;
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        self.duration_total_ms.fetch_add(duration_ms, Ordering::Relaxed);

        self.sink.record(&TraceSummary {
            trace_id: record.trace_id,
            method: record.method,
            path: record.path,
            start: record.start,
            duration_ms,
            status_code: None,
            outcome: RequestOutcome::ClientCancelled.as_str(),
            error_kind: None,
            identity: record.identity,
        });
    }

    /// Read-only lookup of one inflight trace.
    pub fn get(&self, trace_id: &str) -> Option<TraceRecord> {
        self.records.get(trace_id).map(|r| r.clone())
    }

    /// All inflight traces at this instant.
    pub fn active(&self) -> Vec<TraceRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    pub fn aggregate_stats(&self) -> TraceStats {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let cancelled = self.cancelled.load(Ordering::Relaxed);
        let total = completed + failed + cancelled;

        TraceStats {
            active: self.records.len(),
            completed,
            failed,
            cancelled,
            average_duration_ms: if total == 0 {
                0
            } else {
                self.duration_total_ms.load(Ordering::Relaxed) / total
            },
        }
    }

    /// Bumps an operational counter.
    pub fn increment_counter(&self, name: &str) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn evict_oldest(&self) {
        let oldest = self
            .records
            .iter()
            .min_by_key(|r| r.start)
            .map(|r| r.trace_id.clone());
        if let Some(trace_id) = oldest {
            self.records.remove(&trace_id);
        }
    }

    /// Drops records older than the TTL. Abandoned traces (task panicked,
    /// record orphaned) disappear here instead of accumulating.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        let before = self.records.len();
        self.records.retain(|_, record| record.started.elapsed() < ttl);
        let swept = before - self.records.len();
        if swept > 0 {
            log::debug!("trace sweeper removed {} expired records", swept);
        }
    }

    /// Background sweeper on a fixed cadence.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}
