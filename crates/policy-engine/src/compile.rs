//! Policy compilation. The entire file is validated and compiled before
//! anything is published; a single malformed rule rejects the load, so
//! the engine never runs on a partial set.

use std::collections::HashSet;

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;

use agentwarden_core::config::{CommandRule, FileRule, NetworkRule, PolicyFile};
use agentwarden_core::error::WardenError;
use agentwarden_core::types::{FileOp, Verdict};
use env_filter::EnvFilter;

use crate::rules::command::CommandMatcher;
use crate::rules::file::FileMatcher;
use crate::rules::network::{Cidr, NetworkMatcher};
use crate::RuleSet;

pub fn compile(policy: &PolicyFile, version: u64) -> Result<RuleSet, WardenError> {
    Ok(RuleSet {
        version,
        defaults: policy.defaults.clone(),
        command: compile_command_rules(&policy.command_rules)?,
        network: compile_network_rules(&policy.network_rules)?,
        file: compile_file_rules(&policy.file_rules)?,
        env: EnvFilter::compile(&policy.env_policy, policy.defaults.env)?,
    })
}

fn compile_command_rules(rules: &[CommandRule]) -> Result<Vec<CommandMatcher>, WardenError> {
    let mut seen = HashSet::new();
    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules {
        check_name("command", &rule.name, &mut seen)?;
        if rule.commands.is_empty() && rule.args_patterns.is_empty() {
            return Err(invalid(
                &rule.name,
                "needs at least one of commands or args_patterns",
            ));
        }
        if rule.decision == Verdict::SoftDelete {
            return Err(invalid(
                &rule.name,
                "soft_delete only applies to file delete rules",
            ));
        }
        let mut args = Vec::with_capacity(rule.args_patterns.len());
        for pattern in &rule.args_patterns {
            let regex = Regex::new(pattern)
                .map_err(|err| invalid(&rule.name, &format!("args pattern `{pattern}`: {err}")))?;
            args.push(regex);
        }
        compiled.push(CommandMatcher {
            name: rule.name.clone(),
            programs: name_globs(&rule.name, &rule.commands)?,
            any_program: rule.commands.is_empty(),
            args,
            context: rule.context.clone(),
            verdict: rule.decision,
            message: rule.message.clone(),
            timeout: rule.timeout,
        });
    }
    Ok(compiled)
}

fn compile_network_rules(rules: &[NetworkRule]) -> Result<Vec<NetworkMatcher>, WardenError> {
    let mut seen = HashSet::new();
    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules {
        check_name("network", &rule.name, &mut seen)?;
        if rule.domains.is_empty() && rule.cidrs.is_empty() && rule.ports.is_empty() {
            return Err(invalid(
                &rule.name,
                "needs at least one of domains, cidrs or ports",
            ));
        }
        if rule.decision == Verdict::SoftDelete {
            return Err(invalid(
                &rule.name,
                "soft_delete only applies to file delete rules",
            ));
        }
        let mut domains = Vec::with_capacity(rule.domains.len());
        for pattern in &rule.domains {
            domains.push(normalize_domain(&rule.name, pattern)?);
        }
        let mut cidrs = Vec::with_capacity(rule.cidrs.len());
        for raw in &rule.cidrs {
            cidrs.push(Cidr::parse(raw).map_err(|err| invalid(&rule.name, &err))?);
        }
        compiled.push(NetworkMatcher {
            name: rule.name.clone(),
            domains,
            cidrs,
            ports: rule.ports.clone(),
            verdict: rule.decision,
        });
    }
    Ok(compiled)
}

fn compile_file_rules(rules: &[FileRule]) -> Result<Vec<FileMatcher>, WardenError> {
    let mut seen = HashSet::new();
    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules {
        check_name("file", &rule.name, &mut seen)?;
        if rule.paths.is_empty() {
            return Err(invalid(&rule.name, "needs at least one path"));
        }
        if rule.decision == Verdict::SoftDelete && rule.operations != [FileOp::Delete] {
            return Err(invalid(
                &rule.name,
                "soft_delete requires operations = [\"delete\"]",
            ));
        }
        compiled.push(FileMatcher {
            name: rule.name.clone(),
            paths: path_globs(&rule.name, &rule.paths)?,
            operations: rule.operations.clone(),
            verdict: rule.decision,
            message: rule.message.clone(),
        });
    }
    Ok(compiled)
}

fn check_name(category: &str, name: &str, seen: &mut HashSet<String>) -> Result<(), WardenError> {
    if name.trim().is_empty() {
        return Err(WardenError::InvalidPolicy(format!(
            "{category} rule with empty name"
        )));
    }
    if !seen.insert(name.to_string()) {
        return Err(WardenError::InvalidPolicy(format!(
            "duplicate {category} rule name `{name}`"
        )));
    }
    Ok(())
}

fn invalid(rule: &str, problem: &str) -> WardenError {
    WardenError::InvalidPolicy(format!("rule `{rule}`: {problem}"))
}

fn normalize_domain(rule: &str, pattern: &str) -> Result<String, WardenError> {
    let normalized = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(invalid(rule, "empty domain pattern"));
    }
    let rest = normalized.strip_prefix("*.").unwrap_or(&normalized);
    if rest.is_empty() || rest.contains('*') {
        return Err(invalid(
            rule,
            &format!("domain pattern `{pattern}`: wildcard only allowed as a leading `*.`"),
        ));
    }
    Ok(normalized)
}

fn name_globs(rule: &str, patterns: &[String]) -> Result<GlobSet, WardenError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|err| invalid(rule, &format!("command pattern `{pattern}`: {err}")))?;
        builder.add(glob);
    }
    builder.build().map_err(|err| invalid(rule, &err.to_string()))
}

/// Path globs keep `/` literal so `*` stays within one directory while
/// `**` recurses.
fn path_globs(rule: &str, patterns: &[String]) -> Result<GlobSet, WardenError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| invalid(rule, &format!("path pattern `{pattern}`: {err}")))?;
        builder.add(glob);
    }
    builder.build().map_err(|err| invalid(rule, &err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_toml(toml: &str) -> Result<RuleSet, WardenError> {
        let policy = PolicyFile::from_toml_str(toml).unwrap();
        compile(&policy, 1)
    }

    #[test]
    fn the_starter_policy_compiles() {
        let ruleset = compile(&PolicyFile::default_config(), 1).unwrap();
        assert_eq!(ruleset.version, 1);
        assert_eq!(ruleset.command.len(), 4);
        assert_eq!(ruleset.network.len(), 3);
        assert_eq!(ruleset.file.len(), 3);
    }

    #[test]
    fn duplicate_rule_names_are_rejected() {
        let err = compile_toml(
            r#"
            [[command_rules]]
            name = "twice"
            commands = ["ls"]
            decision = "allow"

            [[command_rules]]
            name = "twice"
            commands = ["cat"]
            decision = "allow"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate command rule name"));
    }

    #[test]
    fn predicate_free_rules_are_rejected() {
        let err = compile_toml(
            r#"
            [[command_rules]]
            name = "matches-nothing"
            decision = "deny"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("commands or args_patterns"));
    }

    #[test]
    fn malformed_args_regex_is_rejected() {
        let err = compile_toml(
            r#"
            [[command_rules]]
            name = "bad-regex"
            commands = ["git"]
            args_patterns = ["("]
            decision = "deny"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("args pattern"));
    }

    #[test]
    fn soft_delete_is_only_legal_on_pure_delete_file_rules() {
        let err = compile_toml(
            r#"
            [[command_rules]]
            name = "bad-target"
            commands = ["rm"]
            decision = "soft_delete"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("file delete rules"));

        let err = compile_toml(
            r#"
            [[file_rules]]
            name = "too-broad"
            paths = ["/workspace/**"]
            operations = ["read", "delete"]
            decision = "soft_delete"
            "#,
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("soft_delete requires operations = [\"delete\"]"));

        compile_toml(
            r#"
            [[file_rules]]
            name = "just-right"
            paths = ["/workspace/**"]
            operations = ["delete"]
            decision = "soft_delete"
            "#,
        )
        .unwrap();
    }

    #[test]
    fn malformed_cidrs_and_domains_are_rejected() {
        let err = compile_toml(
            r#"
            [[network_rules]]
            name = "bad-cidr"
            cidrs = ["10.0.0.0/40"]
            decision = "deny"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("prefix"));

        let err = compile_toml(
            r#"
            [[network_rules]]
            name = "bad-wildcard"
            domains = ["ev*l.com"]
            decision = "deny"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("wildcard"));
    }

    #[test]
    fn env_patterns_are_validated_with_the_rest() {
        let err = compile_toml(
            r#"
            [env_policy]
            deny = ["[unclosed"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("env pattern"));
    }
}
