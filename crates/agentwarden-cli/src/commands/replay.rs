use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use agentwarden_core::config::{ConfigPaths, PolicyFile};
use intake::{JsonlRecordSource, RecordSource};

/// Runs a recorded audit log back through rule evaluation with the
/// current (or a named) policy and reports where the outcomes diverge.
/// Nothing executes: approvals are not re-asked and quarantine is not
/// touched, so an `approve` rule shows up as approve_pending here.
pub fn execute(input: &Path, policy_path: Option<PathBuf>) -> Result<()> {
    let target = match policy_path {
        Some(path) => path,
        None => ConfigPaths::resolve()?.policy_path,
    };
    let policy =
        PolicyFile::load(&target).with_context(|| format!("load policy {}", target.display()))?;
    let ruleset = policy_engine::compile(&policy, 1)?;

    let mut source = JsonlRecordSource::from_path(input)?;
    let mut total = 0u32;
    let mut diverged = 0u32;
    while let Some(record) = source.next_record()? {
        total += 1;
        let context = intake::classify(&record.event);
        let decision = policy_engine::evaluate(&ruleset, &record.event, context);
        let recorded = record.decision.outcome.label();
        let replayed = decision.outcome.label();
        if recorded == replayed {
            println!(
                "{}  {}  {}  (rule {})",
                record.event.id,
                record.event.category(),
                replayed,
                decision.matched_rule.as_deref().unwrap_or("-")
            );
        } else {
            diverged += 1;
            println!(
                "{}  {}  {} -> {}  (was {}, now {})",
                record.event.id,
                record.event.category(),
                recorded,
                replayed,
                record.decision.matched_rule.as_deref().unwrap_or("-"),
                decision.matched_rule.as_deref().unwrap_or("-")
            );
        }
    }
    println!("{total} events replayed, {diverged} diverged.");
    Ok(())
}
