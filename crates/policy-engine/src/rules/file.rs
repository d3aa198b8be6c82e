//! File rule matching: recursive path globs plus operation-set
//! membership.

use std::path::Path;

use globset::GlobSet;

use agentwarden_core::config::Defaults;
use agentwarden_core::types::{Category, Decision, FileOp, Verdict};

#[derive(Debug)]
pub struct FileMatcher {
    pub name: String,
    pub(crate) paths: GlobSet,
    /// Empty means all operations.
    pub(crate) operations: Vec<FileOp>,
    pub(crate) verdict: Verdict,
    pub(crate) message: String,
}

impl FileMatcher {
    fn matches(&self, path: &Path, operation: FileOp) -> bool {
        // Check 1: operation-set membership.
        if !self.operations.is_empty() && !self.operations.contains(&operation) {
            return false;
        }
        // Check 2: path globs.
        self.paths.is_match(path)
    }
}

pub fn evaluate(
    rules: &[FileMatcher],
    defaults: &Defaults,
    path: &Path,
    operation: FileOp,
) -> Decision {
    for rule in rules {
        if rule.matches(path, operation) {
            return super::rule_decision(
                &rule.name,
                rule.verdict,
                &rule.message,
                None,
                defaults.approval_ceiling,
                format!(
                    "{operation} of {} matched rule `{}`",
                    path.display(),
                    rule.name
                ),
            );
        }
    }
    super::default_decision(defaults, Category::File)
}
