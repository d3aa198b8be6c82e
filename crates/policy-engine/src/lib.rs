//! First-match-wins policy evaluation over immutable rule snapshots.
//!
//! A [`RuleSet`] is compiled as a whole from the declarative policy file
//! and published through the [`PolicyStore`]; evaluation is a pure
//! function over one snapshot, safe to call from any number of
//! concurrent readers.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use agentwarden_core::config::{Defaults, PolicyFile};
use agentwarden_core::error::WardenError;
use agentwarden_core::types::{Context, Decision, EnvAccess, Event, EventPayload};
use env_filter::EnvFilter;

mod compile;
pub mod rules;

pub use compile::compile;
pub use rules::command::CommandMatcher;
pub use rules::file::FileMatcher;
pub use rules::network::{Cidr, NetworkMatcher};

/// Immutable, versioned snapshot of every compiled rule, grouped by
/// category. Never mutated in place; reload builds a full replacement.
#[derive(Debug)]
pub struct RuleSet {
    pub version: u64,
    pub defaults: Defaults,
    pub command: Vec<CommandMatcher>,
    pub network: Vec<NetworkMatcher>,
    pub file: Vec<FileMatcher>,
    pub env: EnvFilter,
}

impl RuleSet {
    pub fn rule_counts(&self) -> agentwarden_core::ipc::RuleCounts {
        agentwarden_core::ipc::RuleCounts {
            command: self.command.len(),
            network: self.network.len(),
            file: self.file.len(),
        }
    }
}

/// The decision engine proper: a pure function of event, context and
/// snapshot. Category dispatch picks the matcher; the matcher picks the
/// first rule in declaration order.
pub fn evaluate(ruleset: &RuleSet, event: &Event, context: Context) -> Decision {
    match &event.payload {
        EventPayload::Command { program, args } => {
            rules::command::evaluate(&ruleset.command, &ruleset.defaults, program, args, context)
        }
        EventPayload::Network { host, ip, port } => {
            rules::network::evaluate(&ruleset.network, &ruleset.defaults, host, *ip, *port)
        }
        EventPayload::File { path, operation } => {
            rules::file::evaluate(&ruleset.file, &ruleset.defaults, path, *operation)
        }
        EventPayload::Env { access } => match access {
            EnvAccess::Read(key) => ruleset.env.check_read(key),
            EnvAccess::Enumerate => ruleset.env.check_enumerate(),
        },
    }
}

/// Atomically published policy snapshots. Readers never lock; writers
/// compile a complete new set off the hot path and swap the pointer.
pub struct PolicyStore {
    current: ArcSwap<RuleSet>,
    /// Serializes reloads: version assignment and publication happen
    /// under one guard, so every published snapshot gets a unique
    /// version and publication order matches version order. Readers
    /// never touch this lock.
    next_version: Mutex<u64>,
}

impl PolicyStore {
    pub fn from_policy(policy: &PolicyFile) -> Result<Self, WardenError> {
        let ruleset = compile::compile(policy, 1)?;
        Ok(Self {
            current: ArcSwap::from_pointee(ruleset),
            next_version: Mutex::new(2),
        })
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Compiles the whole replacement before anything is published; a
    /// failed reload leaves the active snapshot untouched and does not
    /// consume a version number.
    pub fn reload(&self, policy: &PolicyFile) -> Result<Arc<RuleSet>, WardenError> {
        let mut next = self
            .next_version
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ruleset = Arc::new(compile::compile(policy, *next)?);
        self.current.store(Arc::clone(&ruleset));
        *next += 1;
        Ok(ruleset)
    }
}
