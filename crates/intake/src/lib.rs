//! Event intake: context classification, interception-layer coverage,
//! and replay sources.
//!
//! Interception layers (shell shim, filesystem hook, network proxy, env
//! shim) submit events over IPC; this crate classifies each event's call
//! context from the ancestry the layer reports and tracks which expected
//! layers have actually registered, so missing coverage is reported
//! instead of silently widening access.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context as _, Result};

use agentwarden_core::ipc::CoveragePayload;
use agentwarden_core::types::{AuditRecord, Context, Event, Origin};

pub mod ancestry;

/// Derives the call context for one event. Stateless: everything comes
/// from the ancestry the interception layer attached.
///
/// Depth counts process hops from the top-level agent shell (chain index
/// 0) to the issuer (last element). An event with no ancestry was issued
/// by the shim itself and is depth 0. Depth 0 or 1 is `direct` — the
/// agent's own shell, or a process it spawned directly; anything deeper
/// is `nested` and can be held to stricter rules.
pub fn classify(event: &Event) -> Context {
    let depth = event
        .ancestry
        .as_ref()
        .map(|report| report.chain.len().saturating_sub(1) as u32)
        .unwrap_or(0);
    let origin = if depth <= 1 {
        Origin::Direct
    } else {
        Origin::Nested
    };
    Context { depth, origin }
}

/// Which interception layers have checked in. Expected layers come from
/// configuration; a layer that never registers is degraded coverage.
pub struct CoverageTracker {
    expected: Vec<String>,
    registered: Mutex<HashSet<String>>,
}

impl CoverageTracker {
    pub fn new(expected: Vec<String>) -> Self {
        Self {
            expected,
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Marks a layer active. Returns `true` the first time a given layer
    /// registers, `false` on repeats.
    pub fn register(&self, layer: &str) -> bool {
        match self.registered.lock() {
            Ok(mut registered) => registered.insert(layer.to_string()),
            Err(_) => false,
        }
    }

    /// Expected layers that have not registered, in configuration order.
    pub fn degraded(&self) -> Vec<String> {
        let registered = match self.registered.lock() {
            Ok(registered) => registered,
            Err(_) => return self.expected.clone(),
        };
        self.expected
            .iter()
            .filter(|layer| !registered.contains(*layer))
            .cloned()
            .collect()
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded().is_empty()
    }

    pub fn report(&self) -> CoveragePayload {
        let mut active: Vec<String> = match self.registered.lock() {
            Ok(registered) => registered.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };
        active.sort();
        CoveragePayload {
            expected: self.expected.clone(),
            active,
            missing: self.degraded(),
        }
    }
}

/// Source of previously recorded audit lines, for offline re-evaluation.
pub trait RecordSource {
    fn next_record(&mut self) -> Result<Option<AuditRecord>>;
}

/// Reads audit records line by line from a JSONL file.
pub struct JsonlRecordSource {
    reader: BufReader<File>,
}

impl JsonlRecordSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("open audit log {}", path.display()))?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }
}

/// Source with nothing to yield; stands in where replay is optional.
#[derive(Debug, Default)]
pub struct NoopRecordSource;

impl RecordSource for NoopRecordSource {
    fn next_record(&mut self) -> Result<Option<AuditRecord>> {
        Ok(None)
    }
}

impl RecordSource for JsonlRecordSource {
    fn next_record(&mut self) -> Result<Option<AuditRecord>> {
        loop {
            let mut line = String::new();
            let bytes = self.reader.read_line(&mut line)?;
            if bytes == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord =
                serde_json::from_str(&line).context("parse audit record JSON")?;
            return Ok(Some(record));
        }
    }
}
