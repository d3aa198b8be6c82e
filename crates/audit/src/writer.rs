//! Append-only JSONL storage for audit records.
//!
//! Records land one JSON object per line in `audit.jsonl`. When the
//! active file passes 50 MB it is renamed to `audit-{timestamp}.jsonl`
//! and a fresh file is opened; rotated files older than the retention
//! window are pruned. The active file is never pruned.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use agentwarden_core::types::AuditRecord;

const MAX_LOG_FILE_BYTES: u64 = 50 * 1024 * 1024;
const ACTIVE_FILE: &str = "audit.jsonl";

pub struct JsonlWriter {
    audit_dir: PathBuf,
    file: tokio::fs::File,
    bytes_written: u64,
}

impl JsonlWriter {
    /// Opens (or creates) the active log file, appending to any
    /// existing content.
    pub async fn open(audit_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(audit_dir)
            .await
            .with_context(|| format!("create audit dir {}", audit_dir.display()))?;
        let path = audit_dir.join(ACTIVE_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open audit log {}", path.display()))?;
        let bytes_written = file
            .metadata()
            .await
            .context("read audit log metadata")?
            .len();
        Ok(Self {
            audit_dir: audit_dir.to_path_buf(),
            file,
            bytes_written,
        })
    }

    /// Appends one record as a JSON line, rotating first if the active
    /// file is over its size limit.
    pub async fn append(&mut self, record: &AuditRecord) -> Result<()> {
        if self.bytes_written >= MAX_LOG_FILE_BYTES {
            if let Err(err) = self.rotate().await {
                warn!(err = %err, "audit log rotation failed, continuing on current file");
            }
        }

        let mut line = serde_json::to_string(record).context("serialize audit record")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .await
            .context("append audit record")?;
        self.bytes_written += line.len() as u64;
        Ok(())
    }

    /// Pushes buffered lines down to the OS. Called once per drained
    /// batch, not per record.
    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await.context("flush audit log")
    }

    async fn rotate(&mut self) -> Result<()> {
        let active = self.audit_dir.join(ACTIVE_FILE);
        let archive = self.audit_dir.join(archive_name(OffsetDateTime::now_utc()));

        self.file.flush().await.context("flush before rotation")?;
        tokio::fs::rename(&active, &archive)
            .await
            .with_context(|| format!("rename audit log to {}", archive.display()))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active)
            .await
            .context("reopen audit log after rotation")?;
        self.bytes_written = 0;
        Ok(())
    }
}

fn archive_name(now: OffsetDateTime) -> String {
    format!(
        "audit-{:04}{:02}{:02}-{:02}{:02}{:02}.jsonl",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Deletes rotated audit files older than `retention_days`, judged by
/// filesystem mtime. Returns how many were removed; per-file failures
/// are logged and skipped so one bad file cannot abort the pass.
pub async fn prune_rotated(audit_dir: &Path, retention_days: u32) -> Result<u32> {
    let window = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    let cutoff = SystemTime::now()
        .checked_sub(window)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    prune_older_than(audit_dir, cutoff).await
}

async fn prune_older_than(audit_dir: &Path, cutoff: SystemTime) -> Result<u32> {
    if !audit_dir.exists() {
        return Ok(0);
    }
    let mut removed = 0u32;
    let mut entries = tokio::fs::read_dir(audit_dir)
        .await
        .with_context(|| format!("read audit dir {}", audit_dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if name == ACTIVE_FILE || !name.starts_with("audit-") {
            continue;
        }

        let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                warn!(path = %path.display(), err = %err, "could not stat rotated audit file");
                continue;
            }
        };
        if modified < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "pruned rotated audit file");
                    removed += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "failed to prune rotated audit file");
                }
            }
        }
    }
    Ok(removed)
}
