//! The enforcement pipeline: one submitted event in, one terminal
//! decision and one audit record out.
//!
//! Classification, rule evaluation, the approval fold and quarantine all
//! happen here; the IPC layer only moves request and response lines.
//! Evaluation reads the current policy snapshot without locking, so any
//! number of connections can be decided concurrently; the approval wait
//! is the only point where a caller is parked.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use agentwarden_core::config::PolicyFile;
use agentwarden_core::ids::{EventId, SessionId};
use agentwarden_core::ipc::{
    CompletePayload, DecidedPayload, EnvPayload, ErrorCode, ErrorPayload, PurgePayload,
    QuarantineEntryPayload, ReloadedPayload, ResolvePayload, RestoredPayload, RestorePayload,
    StatusPayload, SubmitPayload, TextPayload, WardenRequest, WardenResponse,
};
use agentwarden_core::types::{
    AuditRecord, Capture, Context, Decision, Event, EventPayload, Outcome, Resolution,
};
use approvals::ApprovalBroker;
use audit::AuditLogger;
use dlp::Redactor;
use intake::CoverageTracker;
use policy_engine::PolicyStore;
use quarantine::{RestoreError, TrashStore};

/// How long an allowed command's audit record waits for its Complete
/// message before it is flushed without output.
const CAPTURE_DEADLINE: Duration = Duration::from_secs(10 * 60);

pub struct Engine {
    policy_path: PathBuf,
    pub(crate) started_at: OffsetDateTime,
    /// One sandbox lifetime is one DLP session: its token vault lives
    /// and dies with this daemon.
    session: SessionId,
    store: PolicyStore,
    broker: ApprovalBroker,
    trash: TrashStore,
    audit: AuditLogger,
    redactor: Mutex<Arc<Redactor>>,
    /// Held across the ruleset swap and the redactor swap, so the two
    /// always come from the same policy file.
    reload_lock: Mutex<()>,
    pub(crate) coverage: CoverageTracker,
    capture_enabled: bool,
    captures: AsyncMutex<HashMap<EventId, AuditRecord>>,
}

impl Engine {
    /// Compiles the policy, opens the trash area and the audit log, and
    /// returns the running engine. Any policy error here is fatal: the
    /// daemon refuses to start enforcing a partial rule set.
    pub async fn start(
        policy: PolicyFile,
        policy_path: PathBuf,
        audit_dir: &std::path::Path,
        quarantine_dir: &std::path::Path,
    ) -> Result<Arc<Self>> {
        let store = PolicyStore::from_policy(&policy).context("compile policy")?;
        let redactor = Redactor::compile(&policy.dlp).context("compile DLP patterns")?;
        let trash = TrashStore::open(quarantine_dir, policy.quarantine.ttl_days)
            .context("open quarantine store")?;
        let capture_enabled = policy.audit.include_stdout || policy.audit.include_stderr;
        let audit = AuditLogger::spawn(policy.audit.clone(), audit_dir)
            .await
            .context("start audit logger")?;

        Ok(Arc::new(Self {
            policy_path,
            started_at: OffsetDateTime::now_utc(),
            session: SessionId::new(),
            store,
            broker: ApprovalBroker::new(),
            trash,
            audit,
            redactor: Mutex::new(Arc::new(redactor)),
            reload_lock: Mutex::new(()),
            coverage: CoverageTracker::new(policy.interception.expected_layers.clone()),
            capture_enabled,
            captures: AsyncMutex::new(HashMap::new()),
        }))
    }

    /// Dispatches one IPC request. Never panics and never returns an
    /// enforcement failure for audit or telemetry trouble.
    pub async fn handle(self: &Arc<Self>, request: WardenRequest) -> WardenResponse {
        match request {
            WardenRequest::Ping => WardenResponse::Pong,
            WardenRequest::Status => WardenResponse::Status(self.status().await),
            WardenRequest::Submit(SubmitPayload { event }) => {
                WardenResponse::Decided(self.decide(event).await)
            }
            WardenRequest::Complete(payload) => {
                self.complete(payload).await;
                WardenResponse::Ack
            }
            WardenRequest::RegisterLayer(payload) => {
                if self.coverage.register(&payload.layer) {
                    info!(layer = %payload.layer, "interception layer registered");
                }
                WardenResponse::Ack
            }
            WardenRequest::ApprovalsList => WardenResponse::Approvals(self.broker.list().await),
            WardenRequest::ApprovalResolve(ResolvePayload { event_id, approve }) => {
                match self.broker.resolve(event_id, approve).await {
                    Ok(()) => WardenResponse::Ack,
                    Err(err) => error_response(ErrorCode::NotFound, err.to_string()),
                }
            }
            WardenRequest::QuarantineList => match self.trash.list() {
                Ok(entries) => WardenResponse::QuarantineEntries(
                    entries.into_iter().map(entry_payload).collect(),
                ),
                Err(err) => error_response(ErrorCode::Internal, err.to_string()),
            },
            WardenRequest::QuarantineRestore(RestorePayload { token }) => {
                match self.trash.restore(token) {
                    Ok(path) => WardenResponse::Restored(RestoredPayload { path }),
                    Err(RestoreError::NotFound) => error_response(
                        ErrorCode::NotFound,
                        "unknown or already used restore token".to_string(),
                    ),
                    Err(RestoreError::Conflict(path)) => error_response(
                        ErrorCode::Conflict,
                        format!("{} now holds different content", path.display()),
                    ),
                    Err(RestoreError::Other(err)) => {
                        error_response(ErrorCode::Internal, err.to_string())
                    }
                }
            }
            WardenRequest::QuarantinePurge(PurgePayload { older_than_days }) => {
                let older_than = older_than_days
                    .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60));
                match self.trash.purge(older_than) {
                    Ok(removed) => {
                        WardenResponse::Purged(agentwarden_core::ipc::PurgedPayload { removed })
                    }
                    Err(err) => error_response(ErrorCode::Internal, err.to_string()),
                }
            }
            WardenRequest::Redact(TextPayload { text }) => {
                let redaction = self.redactor().process(self.session, &text);
                if redaction.changed() {
                    debug!(hits = redaction.total(), "payload redacted");
                }
                WardenResponse::Redacted(TextPayload {
                    text: redaction.text,
                })
            }
            WardenRequest::Detokenize(TextPayload { text }) => WardenResponse::Redacted(
                TextPayload {
                    text: self.redactor().detokenize(self.session, &text),
                },
            ),
            WardenRequest::EnvSnapshot(EnvPayload { vars }) => {
                let snapshot = self.store.snapshot();
                let filtered = snapshot.env.filter_environment(&vars);
                if !filtered.truncated.is_empty() {
                    warn!(
                        truncated = filtered.truncated.len(),
                        "environment truncated by aggregate limits"
                    );
                }
                WardenResponse::Environment(EnvPayload {
                    vars: filtered.vars,
                })
            }
            WardenRequest::Reload => match self.reload() {
                Ok(payload) => WardenResponse::Reloaded(payload),
                Err(err) => error_response(ErrorCode::InvalidPolicy, err.to_string()),
            },
            WardenRequest::Shutdown => WardenResponse::Ack,
        }
    }

    /// Runs one event through the pipeline and returns its terminal
    /// decision. Exactly one audit record follows, either immediately or
    /// (for captured commands) when Complete arrives or the capture
    /// deadline passes.
    pub async fn decide(self: &Arc<Self>, event: Event) -> DecidedPayload {
        let context = intake::classify(&event);
        let snapshot = self.store.snapshot();
        let decision = policy_engine::evaluate(&snapshot, &event, context);
        debug!(
            event = %event.id,
            category = %event.category(),
            outcome = decision.outcome.label(),
            rule = decision.matched_rule.as_deref().unwrap_or("-"),
            "evaluated"
        );

        match decision.outcome {
            Outcome::ApprovePending {
                ref message,
                timeout_secs,
            } => {
                let rule = decision.matched_rule.clone().unwrap_or_default();
                let resolution = self
                    .broker
                    .wait(
                        event.id,
                        &rule,
                        message,
                        &summarize(&event.payload),
                        Duration::from_secs(timeout_secs),
                    )
                    .await;
                let terminal = fold_resolution(&decision, resolution);
                self.finish(event, context, terminal, None).await
            }
            Outcome::SoftDelete => {
                let target = match &event.payload {
                    EventPayload::File { path, .. } => path.clone(),
                    // compile() guarantees soft_delete only on file rules.
                    _ => {
                        let denied = Decision::deny(
                            decision.matched_rule.clone(),
                            "soft_delete outcome on a non-file event",
                        );
                        return self.finish(event, context, denied, None).await;
                    }
                };
                match self.trash.quarantine(&target) {
                    Ok(entry) => {
                        info!(path = %target.display(), token = %entry.token, "quarantined");
                        self.finish(event, context, decision, Some(entry.token)).await
                    }
                    Err(err) => {
                        // Fail closed: if the content cannot be preserved
                        // the delete does not happen at all.
                        warn!(path = %target.display(), err = %err, "quarantine failed");
                        let denied = Decision::deny(
                            decision.matched_rule.clone(),
                            format!("quarantine failed: {err}"),
                        );
                        self.finish(event, context, denied, None).await
                    }
                }
            }
            _ => self.finish(event, context, decision, None).await,
        }
    }

    /// Records the terminal decision and builds the caller's response.
    async fn finish(
        self: &Arc<Self>,
        event: Event,
        context: Context,
        decision: Decision,
        restore_token: Option<agentwarden_core::ids::RestoreToken>,
    ) -> DecidedPayload {
        let record = AuditRecord::new(event, context, decision.clone());

        let hold = self.capture_enabled
            && matches!(record.event.payload, EventPayload::Command { .. })
            && matches!(record.decision.outcome, Outcome::Allow);
        if hold {
            let event_id = record.event.id;
            self.captures.lock().await.insert(event_id, record);
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(CAPTURE_DEADLINE).await;
                engine.flush_capture(event_id).await;
            });
        } else {
            self.audit.record(record).await;
        }

        DecidedPayload {
            decision,
            restore_token,
        }
    }

    /// Attaches a finished command's output to its held audit record.
    /// Unknown ids are ignored: the record was either never held or has
    /// already been flushed by the deadline sweep.
    async fn complete(&self, payload: CompletePayload) {
        let record = self.captures.lock().await.remove(&payload.event_id);
        let Some(mut record) = record else {
            debug!(event = %payload.event_id, "complete for an unheld event");
            return;
        };
        record.capture = Some(Capture {
            exit_code: payload.exit_code,
            stdout: payload.stdout,
            stderr: payload.stderr,
        });
        self.audit.record(record).await;
    }

    async fn flush_capture(&self, event_id: EventId) {
        let record = self.captures.lock().await.remove(&event_id);
        if let Some(record) = record {
            debug!(event = %event_id, "capture deadline passed, recording without output");
            self.audit.record(record).await;
        }
    }

    async fn status(&self) -> StatusPayload {
        let snapshot = self.store.snapshot();
        let uptime = OffsetDateTime::now_utc() - self.started_at;
        StatusPayload {
            started_at: self.started_at,
            uptime_seconds: uptime.whole_seconds().max(0) as u64,
            policy_version: snapshot.version,
            rule_counts: snapshot.rule_counts(),
            pending_approvals: self.broker.pending_count().await as u32,
            quarantine_entries: self.trash.len() as u32,
            audit: self.audit.stats(),
            coverage: self.coverage.report(),
        }
    }

    /// Re-reads and recompiles the policy file. A failed reload leaves
    /// the active snapshot and redactor untouched.
    fn reload(&self) -> Result<ReloadedPayload> {
        let policy = PolicyFile::load(&self.policy_path)?;
        let redactor = Redactor::compile(&policy.dlp).context("compile DLP patterns")?;
        // File read and compilation happen before the guard; only the
        // two swaps run under it.
        let _serial = self
            .reload_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ruleset = self.store.reload(&policy).context("compile policy")?;
        let mut current = self
            .redactor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // A fresh redactor starts with an empty token vault; redact
        // placeholders already issued stay stable because tokens are
        // content-derived.
        *current = Arc::new(redactor);
        drop(current);
        info!(version = ruleset.version, "policy reloaded");
        Ok(ReloadedPayload {
            policy_version: ruleset.version,
            rule_counts: ruleset.rule_counts(),
        })
    }

    fn redactor(&self) -> Arc<Redactor> {
        match self.redactor.lock() {
            Ok(current) => Arc::clone(&current),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn purge_expired(&self) -> Result<u32> {
        self.trash.purge(None)
    }

    /// Drains and stops the audit pipeline; pending captures flush
    /// without output so no event loses its record.
    pub async fn shutdown(&self) {
        let held: Vec<AuditRecord> = self.captures.lock().await.drain().map(|(_, r)| r).collect();
        for record in held {
            self.audit.record(record).await;
        }
        self.audit.shutdown().await;
    }
}

fn fold_resolution(pending: &Decision, resolution: Resolution) -> Decision {
    match resolution {
        Resolution::Approved => Decision::allow(
            pending.matched_rule.clone(),
            format!("operator approved ({})", pending.rationale),
        ),
        Resolution::Denied => Decision::deny(
            pending.matched_rule.clone(),
            format!("operator denied ({})", pending.rationale),
        ),
        Resolution::TimedOut => Decision::deny(
            pending.matched_rule.clone(),
            format!("approval timed out ({})", pending.rationale),
        ),
    }
}

/// One-line description of the action shown to the operator.
fn summarize(payload: &EventPayload) -> String {
    match payload {
        EventPayload::Command { program, args } => {
            if args.is_empty() {
                program.clone()
            } else {
                format!("{program} {}", args.join(" "))
            }
        }
        EventPayload::Network { host, port, .. } => format!("connect {host}:{port}"),
        EventPayload::File { path, operation } => format!("{operation} {}", path.display()),
        EventPayload::Env { access } => match access {
            agentwarden_core::types::EnvAccess::Read(key) => format!("env {key}"),
            agentwarden_core::types::EnvAccess::Enumerate => "env enumeration".to_string(),
        },
    }
}

fn error_response(code: ErrorCode, message: String) -> WardenResponse {
    WardenResponse::Error(ErrorPayload { code, message })
}

fn entry_payload(entry: quarantine::TrashEntry) -> QuarantineEntryPayload {
    QuarantineEntryPayload {
        token: entry.token,
        original_path: entry.original_path,
        deleted_at: entry.deleted_at,
        expires_at: entry.expires_at,
        size_bytes: entry.size_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentwarden_core::types::{AncestryReport, EnvAccess, FileOp, ProcessHop};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        _data: TempDir,
        policy_dir: TempDir,
        engine: Arc<Engine>,
        audit_path: PathBuf,
    }

    async fn fixture(toml: &str) -> Fixture {
        let data = TempDir::new().unwrap();
        let policy_dir = TempDir::new().unwrap();
        let policy_path = policy_dir.path().join("policy.toml");
        std::fs::write(&policy_path, toml).unwrap();
        let policy = PolicyFile::load(&policy_path).unwrap();
        let audit_dir = data.path().join("audit");
        let quarantine_dir = data.path().join("quarantine");
        let engine = Engine::start(policy, policy_path, &audit_dir, &quarantine_dir)
            .await
            .unwrap();
        Fixture {
            _data: data,
            policy_dir,
            engine,
            audit_path: audit_dir.join("audit.jsonl"),
        }
    }

    fn command(program: &str, args: &[&str]) -> Event {
        Event::new(
            SessionId::new(),
            EventPayload::Command {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
        )
    }

    fn nested(event: Event) -> Event {
        event.with_ancestry(AncestryReport::new(
            ["bash", "npm", "node"]
                .iter()
                .enumerate()
                .map(|(i, p)| ProcessHop {
                    pid: 100 + i as u32,
                    program: p.to_string(),
                })
                .collect(),
        ))
    }

    async fn audit_lines(fx: &Fixture) -> Vec<AuditRecord> {
        fx.engine.shutdown().await;
        let contents = std::fs::read_to_string(&fx.audit_path).unwrap_or_default();
        contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn denied_command_produces_one_audit_record() {
        let fx = fixture(
            r#"
            [[command_rules]]
            name = "block-shell-escape"
            commands = ["sudo", "su"]
            decision = "deny"
            "#,
        )
        .await;

        let event = command("sudo", &["whoami"]);
        let event_id = event.id;
        let payload = fx.engine.decide(event).await;
        assert!(matches!(payload.decision.outcome, Outcome::Deny));
        assert_eq!(
            payload.decision.matched_rule.as_deref(),
            Some("block-shell-escape")
        );

        let records = audit_lines(&fx).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.id, event_id);
    }

    #[tokio::test]
    async fn soft_delete_round_trips_through_quarantine() {
        let workspace = TempDir::new().unwrap();
        let target = workspace.path().join("notes.txt");
        std::fs::write(&target, b"precious").unwrap();

        let fx = fixture(&format!(
            r#"
            [[file_rules]]
            name = "workspace-soft-delete"
            paths = ["{}/**"]
            operations = ["delete"]
            decision = "soft_delete"
            "#,
            workspace.path().display()
        ))
        .await;

        let event = Event::new(
            SessionId::new(),
            EventPayload::File {
                path: target.clone(),
                operation: FileOp::Delete,
            },
        );
        let payload = fx.engine.decide(event).await;
        assert!(matches!(payload.decision.outcome, Outcome::SoftDelete));
        let token = payload.restore_token.expect("restore token");
        assert!(!target.exists());

        let response = fx
            .engine
            .handle(WardenRequest::QuarantineRestore(RestorePayload { token }))
            .await;
        assert!(matches!(response, WardenResponse::Restored(_)));
        assert_eq!(std::fs::read(&target).unwrap(), b"precious");

        // The consumed token cannot restore twice.
        let response = fx
            .engine
            .handle(WardenRequest::QuarantineRestore(RestorePayload { token }))
            .await;
        match response {
            WardenResponse::Error(err) => assert_eq!(err.code, ErrorCode::NotFound),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn nested_approval_times_out_to_deny() {
        let fx = fixture(
            r#"
            [[command_rules]]
            name = "allow-direct-curl"
            commands = ["curl"]
            context = ["direct"]
            decision = "allow"

            [[command_rules]]
            name = "gate-nested-curl"
            commands = ["curl"]
            context = ["nested"]
            decision = "approve"
            timeout = "1s"
            "#,
        )
        .await;

        let direct = fx.engine.decide(command("curl", &["https://example.com"])).await;
        assert!(matches!(direct.decision.outcome, Outcome::Allow));

        let started = std::time::Instant::now();
        let nested = fx
            .engine
            .decide(nested(command("curl", &["https://example.com"])))
            .await;
        assert!(matches!(nested.decision.outcome, Outcome::Deny));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(nested.decision.rationale.contains("timed out"));

        let records = audit_lines(&fx).await;
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn operator_grant_folds_to_allow() {
        let fx = fixture(
            r#"
            [[command_rules]]
            name = "gate-everything"
            commands = ["*"]
            decision = "approve"
            timeout = "30s"
            "#,
        )
        .await;

        let engine = Arc::clone(&fx.engine);
        let waiter = tokio::spawn(async move { engine.decide(command("curl", &[])).await });

        // Find the pending request, then grant it.
        let event_id = loop {
            if let WardenResponse::Approvals(pending) =
                fx.engine.handle(WardenRequest::ApprovalsList).await
            {
                if let Some(first) = pending.first() {
                    break first.event_id;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let response = fx
            .engine
            .handle(WardenRequest::ApprovalResolve(ResolvePayload {
                event_id,
                approve: true,
            }))
            .await;
        assert!(matches!(response, WardenResponse::Ack));

        let payload = waiter.await.unwrap();
        assert!(matches!(payload.decision.outcome, Outcome::Allow));
        assert!(payload.decision.rationale.contains("operator approved"));
    }

    #[tokio::test]
    async fn captured_commands_record_once_with_output() {
        let fx = fixture(
            r#"
            [audit]
            include_stdout = true
            include_stderr = true

            [[command_rules]]
            name = "allow-ls"
            commands = ["ls"]
            decision = "allow"
            "#,
        )
        .await;

        let event = command("ls", &["-la"]);
        let event_id = event.id;
        fx.engine.decide(event).await;

        fx.engine
            .handle(WardenRequest::Complete(CompletePayload {
                event_id,
                exit_code: Some(0),
                stdout: Some("total 0".to_string()),
                stderr: None,
            }))
            .await;

        let records = audit_lines(&fx).await;
        assert_eq!(records.len(), 1);
        let capture = records[0].capture.as_ref().expect("capture");
        assert_eq!(capture.exit_code, Some(0));
        assert_eq!(capture.stdout.as_deref(), Some("total 0"));
    }

    #[tokio::test]
    async fn shutdown_flushes_held_captures_without_output() {
        let fx = fixture(
            r#"
            [audit]
            include_stdout = true

            [[command_rules]]
            name = "allow-ls"
            commands = ["ls"]
            decision = "allow"
            "#,
        )
        .await;

        fx.engine.decide(command("ls", &[])).await;
        // No Complete ever arrives.
        let records = audit_lines(&fx).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].capture.is_none());
    }

    #[tokio::test]
    async fn env_snapshot_filters_and_injects() {
        let fx = fixture(
            r#"
            [env_policy]
            allow = ["PATH", "HOME"]
            block_iteration = true

            [env_policy.inject]
            HTTPS_PROXY = "http://127.0.0.1:18080"
            "#,
        )
        .await;

        let mut vars = BTreeMap::new();
        vars.insert("PATH".to_string(), "/usr/bin".to_string());
        vars.insert("GITHUB_TOKEN".to_string(), "ghp_x".to_string());
        let response = fx
            .engine
            .handle(WardenRequest::EnvSnapshot(EnvPayload { vars }))
            .await;
        match response {
            WardenResponse::Environment(env) => {
                assert_eq!(env.vars.get("PATH").map(String::as_str), Some("/usr/bin"));
                assert!(!env.vars.contains_key("GITHUB_TOKEN"));
                assert_eq!(
                    env.vars.get("HTTPS_PROXY").map(String::as_str),
                    Some("http://127.0.0.1:18080")
                );
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // Enumeration itself is still a denied event.
        let event = Event::new(
            SessionId::new(),
            EventPayload::Env {
                access: EnvAccess::Enumerate,
            },
        );
        let payload = fx.engine.decide(event).await;
        assert!(matches!(payload.decision.outcome, Outcome::Deny));
    }

    #[tokio::test]
    async fn reload_swaps_rules_and_survives_bad_files() {
        let fx = fixture(
            r#"
            [[command_rules]]
            name = "allow-ls"
            commands = ["ls"]
            decision = "allow"
            "#,
        )
        .await;
        let policy_path = fx.policy_dir.path().join("policy.toml");

        std::fs::write(
            &policy_path,
            r#"
            [[command_rules]]
            name = "deny-ls"
            commands = ["ls"]
            decision = "deny"
            "#,
        )
        .unwrap();
        let response = fx.engine.handle(WardenRequest::Reload).await;
        match response {
            WardenResponse::Reloaded(payload) => assert_eq!(payload.policy_version, 2),
            other => panic!("unexpected response: {other:?}"),
        }
        let payload = fx.engine.decide(command("ls", &[])).await;
        assert!(matches!(payload.decision.outcome, Outcome::Deny));

        // A broken file is rejected and the active snapshot stays.
        std::fs::write(&policy_path, "this is not toml [").unwrap();
        let response = fx.engine.handle(WardenRequest::Reload).await;
        match response {
            WardenResponse::Error(err) => assert_eq!(err.code, ErrorCode::InvalidPolicy),
            other => panic!("unexpected response: {other:?}"),
        }
        let payload = fx.engine.decide(command("ls", &[])).await;
        assert!(matches!(payload.decision.outcome, Outcome::Deny));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_reload_requests_get_distinct_versions() {
        let fx = fixture(
            r#"
            [[command_rules]]
            name = "allow-ls"
            commands = ["ls"]
            decision = "allow"
            "#,
        )
        .await;

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let engine = Arc::clone(&fx.engine);
                tokio::spawn(async move { engine.handle(WardenRequest::Reload).await })
            })
            .collect();

        let mut versions = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                WardenResponse::Reloaded(payload) => versions.push(payload.policy_version),
                other => panic!("unexpected response: {other:?}"),
            }
        }
        versions.sort_unstable();
        assert_eq!(versions, (2..=7).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn redact_verb_rewrites_llm_bound_text() {
        let fx = fixture("").await;
        let response = fx
            .engine
            .handle(WardenRequest::Redact(TextPayload {
                text: "contact ops@example.com".to_string(),
            }))
            .await;
        match response {
            WardenResponse::Redacted(payload) => {
                assert_eq!(payload.text, "contact [REDACTED:EMAIL]");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_reports_coverage_and_counts() {
        let fx = fixture(
            r#"
            [interception]
            expected_layers = ["shell", "network"]
            "#,
        )
        .await;
        fx.engine
            .handle(WardenRequest::RegisterLayer(
                agentwarden_core::ipc::RegisterLayerPayload {
                    layer: "shell".to_string(),
                },
            ))
            .await;

        match fx.engine.handle(WardenRequest::Status).await {
            WardenResponse::Status(status) => {
                assert_eq!(status.policy_version, 1);
                assert_eq!(status.coverage.missing, vec!["network".to_string()]);
                assert!(status.coverage.is_degraded());
                assert_eq!(status.pending_approvals, 0);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
