//! Asynchronous audit trail for every terminal decision.
//!
//! Enforcement callers hand records to [`AuditLogger::record`], which
//! enqueues and returns; a background pump drains the queue to an
//! append-only JSONL log and, when enabled, to an OTLP sink. The queue
//! is bounded: under pressure it either evicts the oldest record or
//! makes the caller wait a short capped interval, per configuration.
//! Audit pressure slows or loses audit data, never agent actions.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use agentwarden_core::config::{AuditConfig, OverflowPolicy};
use agentwarden_core::ipc;
use agentwarden_core::types::{AuditRecord, Outcome};

pub mod otel;
pub mod writer;

use otel::OtelExporter;
use writer::JsonlWriter;

/// Longest a caller is held under the block-briefly overflow policy.
const BLOCK_BRIEFLY_MAX: Duration = Duration::from_millis(250);
const DRAIN_BATCH: usize = 64;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) dropped: AtomicU64,
    pub(crate) write_failures: AtomicU64,
    pub(crate) exported: AtomicU64,
    /// Failed delivery attempts plus records evicted from the retry
    /// buffer while the sink was unreachable.
    pub(crate) export_failures: AtomicU64,
}

struct QueueState {
    items: VecDeque<AuditRecord>,
    closed: bool,
}

struct Shared {
    cfg: AuditConfig,
    capacity: usize,
    state: Mutex<QueueState>,
    items_ready: Notify,
    space_ready: Notify,
    counters: Arc<Counters>,
}

impl Shared {
    fn new(cfg: AuditConfig) -> Self {
        let capacity = cfg.queue_capacity.max(1);
        Self {
            cfg,
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            items_ready: Notify::new(),
            space_ready: Notify::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    async fn push(&self, record: AuditRecord) {
        match self.cfg.overflow {
            OverflowPolicy::DropOldest => {
                let mut state = match self.state.lock() {
                    Ok(state) => state,
                    Err(_) => {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                };
                if state.closed {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                if state.items.len() >= self.capacity {
                    state.items.pop_front();
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                state.items.push_back(record);
                drop(state);
                self.items_ready.notify_one();
            }
            OverflowPolicy::BlockBriefly => {
                let deadline = tokio::time::Instant::now() + BLOCK_BRIEFLY_MAX;
                loop {
                    {
                        let mut state = match self.state.lock() {
                            Ok(state) => state,
                            Err(_) => {
                                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                        };
                        if state.closed {
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                        if state.items.len() < self.capacity {
                            state.items.push_back(record);
                            drop(state);
                            self.items_ready.notify_one();
                            return;
                        }
                    }
                    if tokio::time::Instant::now() >= deadline {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("audit queue full, record dropped after brief wait");
                        return;
                    }
                    let _ = tokio::time::timeout_at(deadline, self.space_ready.notified()).await;
                }
            }
        }
    }

    fn depth(&self) -> usize {
        self.state.lock().map(|state| state.items.len()).unwrap_or(0)
    }
}

pub struct AuditLogger {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
    exporter: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Opens the JSONL log under `audit_dir` and starts the drain task
    /// (and the OTLP exporter when enabled).
    pub async fn spawn(cfg: AuditConfig, audit_dir: &Path) -> Result<Self> {
        let writer = JsonlWriter::open(audit_dir).await?;
        let shared = Arc::new(Shared::new(cfg));

        let (otel_tx, exporter_handle) = if shared.cfg.otel.enabled {
            let (tx, handle) =
                OtelExporter::spawn(shared.cfg.otel.clone(), Arc::clone(&shared.counters));
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        let pump_shared = Arc::clone(&shared);
        let pump = tokio::spawn(async move {
            run_pump(pump_shared, writer, otel_tx).await;
        });

        Ok(Self {
            shared,
            pump: Mutex::new(Some(pump)),
            exporter: Mutex::new(exporter_handle),
        })
    }

    /// Enqueues a record for the background pump. Returns once the
    /// record is queued or dropped; it never waits on I/O.
    pub async fn record(&self, mut record: AuditRecord) {
        let loggable = match record.decision.outcome {
            Outcome::Allow | Outcome::SoftDelete => self.shared.cfg.log_allowed,
            Outcome::Deny => self.shared.cfg.log_denied,
            Outcome::ApprovePending { .. } => true,
        };
        if !loggable {
            return;
        }
        if let Some(capture) = record.capture.as_mut() {
            if !self.shared.cfg.include_stdout {
                capture.stdout = None;
            }
            if !self.shared.cfg.include_stderr {
                capture.stderr = None;
            }
        }
        self.shared.push(record).await;
    }

    pub fn stats(&self) -> ipc::AuditStats {
        let counters = &self.shared.counters;
        ipc::AuditStats {
            queued: self.shared.depth(),
            dropped: counters.dropped.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
            exported: counters.exported.load(Ordering::Relaxed),
            export_failures: counters.export_failures.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting records, drains what is queued, and waits for the
    /// pump (and exporter) to finish, bounded by a few seconds each.
    pub async fn shutdown(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.closed = true;
        }
        self.shared.items_ready.notify_waiters();
        self.shared.items_ready.notify_one();

        let pump = self.pump.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = pump {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        let exporter = self.exporter.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = exporter {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

async fn run_pump(shared: Arc<Shared>, mut writer: JsonlWriter, otel_tx: Option<otel::OtelSender>) {
    loop {
        let (batch, closed) = {
            let mut state = match shared.state.lock() {
                Ok(state) => state,
                Err(_) => break,
            };
            let take = state.items.len().min(DRAIN_BATCH);
            let batch: Vec<AuditRecord> = state.items.drain(..take).collect();
            (batch, state.closed)
        };

        if batch.is_empty() {
            if closed {
                break;
            }
            shared.items_ready.notified().await;
            continue;
        }
        shared.space_ready.notify_waiters();

        for record in &batch {
            if let Err(err) = writer.append(record).await {
                shared.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(err = %err, "audit write failed");
            }
            if let Some(tx) = &otel_tx {
                if shared
                    .cfg
                    .otel
                    .filter
                    .admits(record.event.category(), record.severity)
                {
                    tx.send(record.clone());
                }
            }
        }
        if let Err(err) = writer.flush().await {
            shared.counters.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(err = %err, "audit flush failed");
        }
    }
    // Dropping the sender lets the exporter run its final flush.
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentwarden_core::ids::SessionId;
    use agentwarden_core::types::{Capture, Context, Decision, Event, EventPayload, Origin};
    use tempfile::TempDir;

    fn command_record(rationale: &str) -> AuditRecord {
        let event = Event::new(
            SessionId::new(),
            EventPayload::Command {
                program: "curl".to_string(),
                args: vec!["https://example.com".to_string()],
            },
        );
        let context = Context {
            depth: 0,
            origin: Origin::Direct,
        };
        AuditRecord::new(event, context, Decision::allow(None, rationale))
    }

    fn denied_record() -> AuditRecord {
        let event = Event::new(
            SessionId::new(),
            EventPayload::Command {
                program: "sudo".to_string(),
                args: vec![],
            },
        );
        let context = Context {
            depth: 0,
            origin: Origin::Direct,
        };
        AuditRecord::new(event, context, Decision::deny(None, "no rule matched"))
    }

    fn config(capacity: usize, overflow: OverflowPolicy) -> AuditConfig {
        AuditConfig {
            queue_capacity: capacity,
            overflow,
            ..AuditConfig::default()
        }
    }

    #[tokio::test]
    async fn records_drain_to_the_jsonl_log() {
        let dir = TempDir::new().unwrap();
        let logger = AuditLogger::spawn(config(16, OverflowPolicy::DropOldest), dir.path())
            .await
            .unwrap();
        logger.record(command_record("first")).await;
        logger.record(denied_record()).await;
        logger.shutdown().await;

        let contents = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.decision.rationale, "first");
    }

    #[tokio::test]
    async fn log_allowed_false_skips_allow_records() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(16, OverflowPolicy::DropOldest);
        cfg.log_allowed = false;
        let logger = AuditLogger::spawn(cfg, dir.path()).await.unwrap();
        logger.record(command_record("quiet")).await;
        logger.record(denied_record()).await;
        logger.shutdown().await;

        let contents = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let only: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert!(matches!(only.decision.outcome, Outcome::Deny));
    }

    #[tokio::test]
    async fn capture_output_is_scrubbed_unless_configured() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(16, OverflowPolicy::DropOldest);
        cfg.include_stderr = true;
        let logger = AuditLogger::spawn(cfg, dir.path()).await.unwrap();

        let mut record = command_record("with output");
        record.capture = Some(Capture {
            exit_code: Some(0),
            stdout: Some("secret build log".to_string()),
            stderr: Some("warning: deprecated".to_string()),
        });
        logger.record(record).await;
        logger.shutdown().await;

        let contents = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        let stored: AuditRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        let capture = stored.capture.unwrap();
        assert_eq!(capture.stdout, None);
        assert_eq!(capture.stderr.as_deref(), Some("warning: deprecated"));
    }

    #[tokio::test]
    async fn drop_oldest_evicts_the_head_and_counts_it() {
        // No pump attached: exercise the queue directly.
        let shared = Shared::new(config(2, OverflowPolicy::DropOldest));
        shared.push(command_record("one")).await;
        shared.push(command_record("two")).await;
        shared.push(command_record("three")).await;

        let state = shared.state.lock().unwrap();
        assert_eq!(state.items.len(), 2);
        assert_eq!(state.items[0].decision.rationale, "two");
        assert_eq!(state.items[1].decision.rationale, "three");
        drop(state);
        assert_eq!(shared.counters.dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn block_briefly_waits_then_drops_the_new_record() {
        let shared = Shared::new(config(1, OverflowPolicy::BlockBriefly));
        shared.push(command_record("held")).await;

        let started = tokio::time::Instant::now();
        shared.push(command_record("overflow")).await;
        assert!(started.elapsed() >= BLOCK_BRIEFLY_MAX);

        let state = shared.state.lock().unwrap();
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.items[0].decision.rationale, "held");
        drop(state);
        assert_eq!(shared.counters.dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn stats_reflect_queue_depth_and_drops() {
        let shared = Shared::new(config(1, OverflowPolicy::DropOldest));
        shared.push(command_record("a")).await;
        shared.push(command_record("b")).await;
        assert_eq!(shared.depth(), 1);
        assert_eq!(shared.counters.dropped.load(Ordering::Relaxed), 1);
    }
}
