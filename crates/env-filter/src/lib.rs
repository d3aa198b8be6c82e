//! Environment exposure policy.
//!
//! Two distinct operations are checked: lookup of a single variable by
//! name, and enumeration of the whole environment. On top of that the
//! filter enforces aggregate caps on what may be exposed and layers in
//! operator-injected variables that bypass filtering entirely.

use std::collections::BTreeMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use once_cell::sync::Lazy;

use agentwarden_core::config::{DefaultVerdict, EnvPolicy};
use agentwarden_core::error::WardenError;
use agentwarden_core::types::{Decision, Outcome};

/// Well-known secret variable names, denied on lookup no matter what the
/// configured lists say. The inject table is the only way past this.
pub static BUILTIN_SECRET_NAMES: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "GITLAB_TOKEN",
    "NPM_TOKEN",
    "CARGO_REGISTRY_TOKEN",
    "PYPI_TOKEN",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GOOGLE_API_KEY",
    "DATABASE_URL",
    "REDIS_URL",
    "SSH_AUTH_SOCK",
    "GPG_AGENT_INFO",
    "*_PRIVATE_KEY",
    "*_SIGNING_KEY",
    "*_CLIENT_SECRET",
];

static BUILTIN_DENY: Lazy<GlobSet> = Lazy::new(|| {
    let mut builder = GlobSetBuilder::new();
    for pattern in BUILTIN_SECRET_NAMES {
        builder.add(Glob::new(pattern).expect("BUILTIN_SECRET_NAMES: invalid glob"));
    }
    builder.build().expect("BUILTIN_SECRET_NAMES: invalid glob set")
});

/// Compiled form of `[env_policy]`, shared read-only across evaluations.
#[derive(Debug)]
pub struct EnvFilter {
    allow: GlobSet,
    allow_is_empty: bool,
    deny: GlobSet,
    max_bytes: usize,
    max_keys: usize,
    block_iteration: bool,
    inject: BTreeMap<String, String>,
    default: DefaultVerdict,
}

/// Outcome of filtering a whole candidate environment.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FilteredEnv {
    pub vars: BTreeMap<String, String>,
    /// Keys removed because a deny list or the allowlist excluded them.
    pub dropped_by_policy: Vec<String>,
    /// Keys removed because max_keys or max_bytes was hit.
    pub truncated: Vec<String>,
}

impl EnvFilter {
    pub fn compile(policy: &EnvPolicy, default: DefaultVerdict) -> Result<Self, WardenError> {
        Ok(Self {
            allow: build_globset(&policy.allow)?,
            allow_is_empty: policy.allow.is_empty(),
            deny: build_globset(&policy.deny)?,
            max_bytes: policy.max_bytes,
            max_keys: policy.max_keys,
            block_iteration: policy.block_iteration,
            inject: policy.inject.clone(),
            default,
        })
    }

    /// Ruling for a lookup of one variable by name.
    pub fn check_read(&self, key: &str) -> Decision {
        // Check 1: injected variables are trusted configuration.
        if self.inject.contains_key(key) {
            return Decision::allow(
                Some("env-inject".to_string()),
                format!("{key} is operator-injected"),
            );
        }

        // Check 2: explicit deny list.
        if self.deny.is_match(key) {
            return Decision::deny(
                Some("env-deny-list".to_string()),
                format!("{key} matches a deny pattern"),
            );
        }

        // Check 3: built-in secret names.
        if BUILTIN_DENY.is_match(key) {
            return Decision::deny(
                Some("env-builtin-secrets".to_string()),
                format!("{key} is a well-known secret variable"),
            );
        }

        // Check 4: a non-empty allow list is exhaustive.
        if !self.allow_is_empty {
            if self.allow.is_match(key) {
                return Decision::allow(
                    Some("env-allow-list".to_string()),
                    format!("{key} matches an allow pattern"),
                );
            }
            return Decision::deny(
                Some("env-allow-list".to_string()),
                format!("{key} is not on the allow list"),
            );
        }

        match self.default {
            DefaultVerdict::Allow => Decision::allow(None, "env default allows reads"),
            DefaultVerdict::Deny => Decision::deny(None, "env default denies reads"),
        }
    }

    /// Ruling for listing the whole environment. Independent of per-key
    /// results: iteration can be blocked even when every name would pass.
    pub fn check_enumerate(&self) -> Decision {
        if self.block_iteration {
            return Decision::deny(
                Some("env-block-iteration".to_string()),
                "environment enumeration is blocked",
            );
        }
        match self.default {
            DefaultVerdict::Allow => Decision::allow(None, "env default allows enumeration"),
            DefaultVerdict::Deny => Decision::deny(None, "env default denies enumeration"),
        }
    }

    /// Filters a candidate environment down to what may be exposed:
    /// per-key policy first, then aggregate caps over the survivors in
    /// sorted key order, then the inject layer on top.
    pub fn filter_environment(&self, candidate: &BTreeMap<String, String>) -> FilteredEnv {
        let mut result = FilteredEnv::default();

        let mut kept_keys = 0usize;
        let mut kept_bytes = 0usize;
        let mut capped = false;
        for (key, value) in candidate {
            if self.inject.contains_key(key) {
                // Overwritten below from the inject table.
                continue;
            }
            if !matches!(self.check_read(key).outcome, Outcome::Allow) {
                result.dropped_by_policy.push(key.clone());
                continue;
            }
            let cost = key.len() + value.len();
            if capped || kept_keys + 1 > self.max_keys || kept_bytes + cost > self.max_bytes {
                // First overflow stops the walk; everything later drops
                // too, keeping truncation order-stable.
                capped = true;
                result.truncated.push(key.clone());
                continue;
            }
            kept_keys += 1;
            kept_bytes += cost;
            result.vars.insert(key.clone(), value.clone());
        }

        for (key, value) in &self.inject {
            result.vars.insert(key.clone(), value.clone());
        }

        result
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, WardenError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| {
            WardenError::InvalidPolicy(format!("env pattern `{pattern}`: {err}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| WardenError::InvalidPolicy(format!("env patterns: {err}")))
}
