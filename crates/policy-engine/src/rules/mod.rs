//! Per-category matchers. Rules are evaluated in declaration order and
//! the first hit wins; everything here is read-only after compilation.

pub mod command;
pub mod file;
pub mod network;

use std::time::Duration;

use agentwarden_core::config::{DefaultVerdict, Defaults};
use agentwarden_core::types::{Category, Decision, Outcome, Verdict};

/// Folds a winning rule into a decision. Approval waits are capped at
/// the system-wide ceiling so a misconfigured rule cannot hang callers.
pub(crate) fn rule_decision(
    name: &str,
    verdict: Verdict,
    message: &str,
    timeout: Option<Duration>,
    ceiling: Duration,
    rationale: String,
) -> Decision {
    let outcome = match verdict {
        Verdict::Allow => Outcome::Allow,
        Verdict::Deny => Outcome::Deny,
        Verdict::SoftDelete => Outcome::SoftDelete,
        Verdict::Approve => {
            let wait = timeout.map_or(ceiling, |t| t.min(ceiling));
            let message = if message.is_empty() {
                format!("rule `{name}` requires operator approval")
            } else {
                message.to_string()
            };
            Outcome::ApprovePending {
                message,
                timeout_secs: wait.as_secs(),
            }
        }
    };
    Decision {
        outcome,
        matched_rule: Some(name.to_string()),
        rationale,
    }
}

pub(crate) fn default_decision(defaults: &Defaults, category: Category) -> Decision {
    match defaults.for_category(category) {
        DefaultVerdict::Allow => {
            Decision::allow(None, format!("no {category} rule matched; default allows"))
        }
        DefaultVerdict::Deny => {
            Decision::deny(None, format!("no {category} rule matched; default denies"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_waits_are_capped_at_the_ceiling() {
        let decision = rule_decision(
            "gate",
            Verdict::Approve,
            "",
            Some(Duration::from_secs(20 * 60)),
            Duration::from_secs(10 * 60),
            "test".to_string(),
        );
        match decision.outcome {
            Outcome::ApprovePending { timeout_secs, .. } => assert_eq!(timeout_secs, 600),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn missing_rule_timeout_falls_back_to_the_ceiling() {
        let decision = rule_decision(
            "gate",
            Verdict::Approve,
            "confirm this",
            None,
            Duration::from_secs(90),
            "test".to_string(),
        );
        match decision.outcome {
            Outcome::ApprovePending {
                message,
                timeout_secs,
            } => {
                assert_eq!(message, "confirm this");
                assert_eq!(timeout_secs, 90);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
