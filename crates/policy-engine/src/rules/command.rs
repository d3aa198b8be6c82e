//! Command rule matching.
//!
//! A rule hits when all of its present predicates hit:
//! - program name, exact or glob, checked against the invocation and its
//!   basename
//! - every args regex, run against the space-joined argument list
//! - the context gate, when the rule names one

use std::path::Path;
use std::time::Duration;

use globset::GlobSet;
use regex::Regex;

use agentwarden_core::config::Defaults;
use agentwarden_core::types::{Category, Context, Decision, Origin, Verdict};

#[derive(Debug)]
pub struct CommandMatcher {
    pub name: String,
    pub(crate) programs: GlobSet,
    pub(crate) any_program: bool,
    pub(crate) args: Vec<Regex>,
    pub(crate) context: Vec<Origin>,
    pub(crate) verdict: Verdict,
    pub(crate) message: String,
    pub(crate) timeout: Option<Duration>,
}

impl CommandMatcher {
    fn matches(&self, program: &str, joined_args: &str, context: Context) -> bool {
        // Check 1: context gate.
        if !self.context.is_empty() && !self.context.contains(&context.origin) {
            return false;
        }

        // Check 2: program name, as invoked or by basename.
        if !self.any_program {
            let basename = Path::new(program)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(program);
            if !self.programs.is_match(program) && !self.programs.is_match(basename) {
                return false;
            }
        }

        // Check 3: every argument pattern must be present.
        self.args.iter().all(|regex| regex.is_match(joined_args))
    }
}

pub fn evaluate(
    rules: &[CommandMatcher],
    defaults: &Defaults,
    program: &str,
    args: &[String],
    context: Context,
) -> Decision {
    let joined = args.join(" ");
    for rule in rules {
        if rule.matches(program, &joined, context) {
            return super::rule_decision(
                &rule.name,
                rule.verdict,
                &rule.message,
                rule.timeout,
                defaults.approval_ceiling,
                format!(
                    "command `{program}` ({} invocation) matched rule `{}`",
                    context.origin, rule.name
                ),
            );
        }
    }
    super::default_decision(defaults, Category::Command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;
    use agentwarden_core::config::PolicyFile;
    use agentwarden_core::types::Outcome;

    fn ruleset_from(toml: &str) -> crate::RuleSet {
        let policy = PolicyFile::from_toml_str(toml).unwrap();
        compile(&policy, 1).unwrap()
    }

    fn direct() -> Context {
        Context {
            depth: 1,
            origin: Origin::Direct,
        }
    }

    fn nested() -> Context {
        Context {
            depth: 3,
            origin: Origin::Nested,
        }
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let ruleset = ruleset_from(
            r#"
            [[command_rules]]
            name = "block-shell-escape"
            commands = ["sudo", "su"]
            decision = "deny"

            [[command_rules]]
            name = "allow-everything"
            commands = ["*"]
            decision = "allow"
            "#,
        );
        let args = vec!["whoami".to_string()];
        let decision = evaluate(&ruleset.command, &ruleset.defaults, "sudo", &args, direct());
        assert_eq!(decision.outcome, Outcome::Deny);
        assert_eq!(decision.matched_rule.as_deref(), Some("block-shell-escape"));

        let decision = evaluate(&ruleset.command, &ruleset.defaults, "ls", &[], direct());
        assert_eq!(decision.outcome, Outcome::Allow);
        assert_eq!(decision.matched_rule.as_deref(), Some("allow-everything"));
    }

    #[test]
    fn context_gates_split_direct_and_nested() {
        let ruleset = ruleset_from(
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
            timeout = "5m"
            "#,
        );
        let args = vec!["https://example.com".to_string()];

        let decision = evaluate(&ruleset.command, &ruleset.defaults, "curl", &args, direct());
        assert_eq!(decision.outcome, Outcome::Allow);

        let decision = evaluate(&ruleset.command, &ruleset.defaults, "curl", &args, nested());
        match decision.outcome {
            Outcome::ApprovePending { timeout_secs, .. } => assert_eq!(timeout_secs, 300),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn args_patterns_must_all_hit() {
        let ruleset = ruleset_from(
            r#"
            [[command_rules]]
            name = "deny-forced-push"
            commands = ["git"]
            args_patterns = ["^push\\b", "--force"]
            decision = "deny"
            "#,
        );
        let forced = vec!["push".to_string(), "--force".to_string(), "origin".to_string()];
        let decision = evaluate(&ruleset.command, &ruleset.defaults, "git", &forced, direct());
        assert_eq!(decision.outcome, Outcome::Deny);

        // A plain push misses the --force pattern and falls to default.
        let plain = vec!["push".to_string(), "origin".to_string()];
        let decision = evaluate(&ruleset.command, &ruleset.defaults, "git", &plain, direct());
        assert_eq!(decision.matched_rule, None);
        assert_eq!(decision.outcome, Outcome::Deny);
    }

    #[test]
    fn program_paths_match_by_basename() {
        let ruleset = ruleset_from(
            r#"
            [[command_rules]]
            name = "allow-git"
            commands = ["git"]
            decision = "allow"
            "#,
        );
        let decision = evaluate(
            &ruleset.command,
            &ruleset.defaults,
            "/usr/bin/git",
            &[],
            direct(),
        );
        assert_eq!(decision.outcome, Outcome::Allow);
    }

    #[test]
    fn unmatched_commands_take_the_category_default() {
        let ruleset = ruleset_from(
            r#"
            [defaults]
            command = "allow"

            [[command_rules]]
            name = "block-sudo"
            commands = ["sudo"]
            decision = "deny"
            "#,
        );
        let decision = evaluate(&ruleset.command, &ruleset.defaults, "make", &[], direct());
        assert_eq!(decision.outcome, Outcome::Allow);
        assert_eq!(decision.matched_rule, None);
    }
}
