//! OTLP log export over HTTP/JSON.
//!
//! Filtered audit records are batched and POSTed to the collector's
//! `/v1/logs` endpoint. Delivery is at-least-once: a failed POST keeps
//! the batch for the next flush (so a record may arrive twice after a
//! lost response), bounded by a retry buffer that evicts oldest under
//! a long outage. Sink trouble is counted and logged, never surfaced
//! to enforcement.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use agentwarden_core::config::OtelConfig;
use agentwarden_core::types::{AuditRecord, Severity};

use crate::Counters;

const CHANNEL_CAPACITY: usize = 256;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const FLUSH_BATCH: usize = 32;
/// Records retained across failed flushes before evicting oldest.
const MAX_PENDING: usize = 2048;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct OtelSender {
    tx: mpsc::Sender<AuditRecord>,
    counters: Arc<Counters>,
}

impl OtelSender {
    /// Hands a record to the exporter without waiting. A full channel
    /// counts as an export failure.
    pub(crate) fn send(&self, record: AuditRecord) {
        if self.tx.try_send(record).is_err() {
            self.counters.export_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub(crate) struct OtelExporter;

impl OtelExporter {
    pub(crate) fn spawn(cfg: OtelConfig, counters: Arc<Counters>) -> (OtelSender, JoinHandle<()>) {
        if cfg.protocol != "http/json" {
            warn!(
                protocol = %cfg.protocol,
                "only http/json OTLP export is supported, exporting as http/json"
            );
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task_counters = Arc::clone(&counters);
        let handle = tokio::spawn(async move {
            run_exporter(cfg, rx, task_counters).await;
        });
        (OtelSender { tx, counters }, handle)
    }
}

async fn run_exporter(cfg: OtelConfig, mut rx: mpsc::Receiver<AuditRecord>, counters: Arc<Counters>) {
    let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            warn!(err = %err, "failed to build OTLP HTTP client, export disabled");
            // Keep draining so senders never see a closed channel.
            while rx.recv().await.is_some() {
                counters.export_failures.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
    };

    let mut pending: VecDeque<AuditRecord> = VecDeque::new();
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.tick().await; // skip the immediate tick

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(record) => {
                    if pending.len() >= MAX_PENDING {
                        pending.pop_front();
                        counters.export_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    pending.push_back(record);
                    if pending.len() >= FLUSH_BATCH {
                        flush(&client, &cfg.endpoint, &mut pending, &counters).await;
                    }
                }
                None => break,
            },
            _ = interval.tick() => {
                if !pending.is_empty() {
                    flush(&client, &cfg.endpoint, &mut pending, &counters).await;
                }
            }
        }
    }

    if !pending.is_empty() {
        flush(&client, &cfg.endpoint, &mut pending, &counters).await;
    }
}

async fn flush(
    client: &reqwest::Client,
    endpoint: &str,
    pending: &mut VecDeque<AuditRecord>,
    counters: &Counters,
) {
    let count = pending.len();
    let body = otlp_body(pending.iter());

    match client.post(endpoint).json(&body).send().await {
        Ok(resp) if resp.status().is_success() => {
            counters.exported.fetch_add(count as u64, Ordering::Relaxed);
            pending.clear();
            debug!(count, "exported audit records");
        }
        Ok(resp) => {
            counters.export_failures.fetch_add(1, Ordering::Relaxed);
            warn!(status = %resp.status(), "OTLP collector rejected export, will retry");
        }
        Err(err) => {
            counters.export_failures.fetch_add(1, Ordering::Relaxed);
            warn!(err = %err, "OTLP export failed, will retry");
        }
    }
}

fn otlp_body<'a>(records: impl Iterator<Item = &'a AuditRecord>) -> Value {
    let log_records: Vec<Value> = records.map(log_record).collect();
    json!({
        "resourceLogs": [{
            "resource": {
                "attributes": [
                    { "key": "service.name", "value": { "stringValue": "agentwarden" } }
                ]
            },
            "scopeLogs": [{
                "scope": {
                    "name": "agentwarden.audit",
                    "version": env!("CARGO_PKG_VERSION")
                },
                "logRecords": log_records
            }]
        }]
    })
}

fn log_record(record: &AuditRecord) -> Value {
    let (severity_text, severity_number) = severity_fields(record.severity);
    let mut attributes = vec![
        string_attr("event.id", record.event.id.to_string()),
        string_attr("session.id", record.event.session_id.to_string()),
        string_attr("category", record.event.category().to_string()),
        string_attr("outcome", record.decision.outcome.label().to_string()),
        string_attr("origin", record.context.origin.to_string()),
    ];
    if let Some(rule) = &record.decision.matched_rule {
        attributes.push(string_attr("rule", rule.clone()));
    }
    json!({
        "timeUnixNano": record.recorded_at.unix_timestamp_nanos().to_string(),
        "severityNumber": severity_number,
        "severityText": severity_text,
        "body": { "stringValue": record.decision.rationale },
        "attributes": attributes,
    })
}

fn string_attr(key: &str, value: String) -> Value {
    json!({ "key": key, "value": { "stringValue": value } })
}

fn severity_fields(severity: Severity) -> (&'static str, u32) {
    match severity {
        Severity::Info => ("INFO", 9),
        Severity::Warn => ("WARN", 13),
        Severity::Critical => ("ERROR", 17),
    }
}
