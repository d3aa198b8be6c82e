use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::types::{Category, FileOp, Origin, Severity, Verdict};

/// Serde adapters for humantime-formatted durations ("5m", "90s").
mod duration_str {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

mod opt_duration_str {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|value| humantime::parse_duration(&value).map_err(D::Error::custom))
            .transpose()
    }
}

/// The whole declarative policy file. Every section is optional in the
/// TOML; absent sections take the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFile {
    pub defaults: Defaults,
    pub command_rules: Vec<CommandRule>,
    pub network_rules: Vec<NetworkRule>,
    pub file_rules: Vec<FileRule>,
    pub env_policy: EnvPolicy,
    pub dlp: DlpConfig,
    pub audit: AuditConfig,
    pub quarantine: QuarantineConfig,
    pub interception: InterceptionConfig,
}

/// Category-level fallbacks when no rule matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub command: DefaultVerdict,
    pub network: DefaultVerdict,
    pub file: DefaultVerdict,
    pub env: DefaultVerdict,
    /// System-wide upper bound on any approval wait.
    #[serde(with = "duration_str")]
    pub approval_ceiling: Duration,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            command: DefaultVerdict::Deny,
            network: DefaultVerdict::Deny,
            file: DefaultVerdict::Deny,
            env: DefaultVerdict::Allow,
            approval_ceiling: Duration::from_secs(10 * 60),
        }
    }
}

impl Defaults {
    pub fn for_category(&self, category: Category) -> DefaultVerdict {
        match category {
            Category::Command => self.command,
            Category::Network => self.network,
            Category::File => self.file,
            Category::Env => self.env,
        }
    }
}

/// Only allow and deny are legal as fallbacks; approval and quarantine
/// always require an explicit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultVerdict {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRule {
    pub name: String,
    /// Program names, exact or glob ("git", "python*").
    #[serde(default)]
    pub commands: Vec<String>,
    /// Regexes matched against the space-joined argument list.
    #[serde(default)]
    pub args_patterns: Vec<String>,
    /// Empty means the rule applies at any depth.
    #[serde(default)]
    pub context: Vec<Origin>,
    pub decision: Verdict,
    #[serde(default)]
    pub message: String,
    #[serde(default, with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRule {
    pub name: String,
    /// Exact hosts or wildcard subdomains ("evil.com", "*.evil.com").
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub cidrs: Vec<String>,
    /// Empty means any port.
    #[serde(default)]
    pub ports: Vec<u16>,
    pub decision: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRule {
    pub name: String,
    pub paths: Vec<String>,
    /// Empty means all operations.
    #[serde(default)]
    pub operations: Vec<FileOp>,
    pub decision: Verdict,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvPolicy {
    /// Non-empty list turns the filter into an allowlist.
    pub allow: Vec<String>,
    /// Checked before allow; glob patterns.
    pub deny: Vec<String>,
    /// Aggregate cap on key+value bytes of the exposed environment.
    pub max_bytes: usize,
    pub max_keys: usize,
    /// Forbid listing the whole environment even when every individual
    /// key would pass.
    pub block_iteration: bool,
    /// Operator-supplied variables layered in after filtering; never
    /// subject to allow/deny.
    pub inject: BTreeMap<String, String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            max_bytes: 32 * 1024,
            max_keys: 128,
            block_iteration: true,
            inject: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlpConfig {
    pub mode: DlpMode,
    pub patterns: DlpBuiltins,
    pub custom_patterns: Vec<CustomPattern>,
}

impl Default for DlpConfig {
    fn default() -> Self {
        Self {
            mode: DlpMode::Redact,
            patterns: DlpBuiltins::default(),
            custom_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlpMode {
    Disabled,
    Redact,
    Tokenize,
}

/// Which builtin detectors run, in their fixed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlpBuiltins {
    pub email: bool,
    pub phone: bool,
    pub credit_card: bool,
    pub ssn: bool,
    pub api_key: bool,
}

impl Default for DlpBuiltins {
    fn default() -> Self {
        Self {
            email: true,
            phone: true,
            credit_card: true,
            ssn: true,
            api_key: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPattern {
    pub name: String,
    /// Label embedded in the placeholder, e.g. TICKET in [REDACTED:TICKET].
    pub display: String,
    pub regex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub log_allowed: bool,
    pub log_denied: bool,
    pub include_stdout: bool,
    pub include_stderr: bool,
    pub retention_days: u32,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub otel: OtelConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_allowed: true,
            log_denied: true,
            include_stdout: false,
            include_stderr: false,
            retention_days: 30,
            queue_capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
            otel: OtelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued record and count the drop.
    DropOldest,
    /// Wait a short bounded interval for space, then drop.
    BlockBriefly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtelConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub protocol: String,
    pub filter: OtelFilter,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://127.0.0.1:4318/v1/logs".to_string(),
            protocol: "http/json".to_string(),
            filter: OtelFilter::default(),
        }
    }
}

/// Which audit records leave the sandbox. Empty categories means all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtelFilter {
    pub categories: Vec<Category>,
    pub min_severity: Severity,
}

impl Default for OtelFilter {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            min_severity: Severity::Warn,
        }
    }
}

impl OtelFilter {
    pub fn admits(&self, category: Category, severity: Severity) -> bool {
        if severity < self.min_severity {
            return false;
        }
        self.categories.is_empty() || self.categories.contains(&category)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    /// Defaults to <data dir>/quarantine when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    pub ttl_days: u32,
    #[serde(with = "duration_str")]
    pub purge_interval: Duration,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_days: 14,
            purge_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Which interception layers the daemon expects to register; missing
/// ones are reported as degraded coverage, never silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptionConfig {
    pub expected_layers: Vec<String>,
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self {
            expected_layers: vec![
                "shell".to_string(),
                "filesystem".to_string(),
                "network".to_string(),
                "env".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub policy_path: PathBuf,
    pub data_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub quarantine_dir: PathBuf,
}

impl PolicyFile {
    pub fn default_config() -> Self {
        Self {
            defaults: Defaults::default(),
            command_rules: vec![
                CommandRule {
                    name: "allow-dev-tools".to_string(),
                    commands: vec![
                        "ls", "cat", "grep", "rg", "find", "git", "cargo", "rustc", "make",
                        "python3", "node", "npm",
                    ]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                    args_patterns: Vec::new(),
                    context: Vec::new(),
                    decision: Verdict::Allow,
                    message: String::new(),
                    timeout: None,
                },
                CommandRule {
                    name: "block-privilege-escalation".to_string(),
                    commands: vec!["sudo".to_string(), "su".to_string(), "doas".to_string()],
                    args_patterns: Vec::new(),
                    context: Vec::new(),
                    decision: Verdict::Deny,
                    message: "privilege escalation is not available in this sandbox".to_string(),
                    timeout: None,
                },
                CommandRule {
                    name: "allow-direct-fetch".to_string(),
                    commands: vec!["curl".to_string(), "wget".to_string()],
                    args_patterns: Vec::new(),
                    context: vec![Origin::Direct],
                    decision: Verdict::Allow,
                    message: String::new(),
                    timeout: None,
                },
                CommandRule {
                    name: "gate-nested-fetch".to_string(),
                    commands: vec!["curl".to_string(), "wget".to_string(), "nc".to_string()],
                    args_patterns: Vec::new(),
                    context: vec![Origin::Nested],
                    decision: Verdict::Approve,
                    message: "a subprocess wants to reach the network".to_string(),
                    timeout: Some(Duration::from_secs(5 * 60)),
                },
            ],
            network_rules: vec![
                NetworkRule {
                    name: "allow-package-registries".to_string(),
                    domains: vec![
                        "crates.io",
                        "*.crates.io",
                        "pypi.org",
                        "files.pythonhosted.org",
                        "registry.npmjs.org",
                    ]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                    cidrs: Vec::new(),
                    ports: vec![443],
                    decision: Verdict::Allow,
                },
                NetworkRule {
                    name: "allow-github".to_string(),
                    domains: vec!["github.com", "*.github.com", "*.githubusercontent.com"]
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                    cidrs: Vec::new(),
                    ports: vec![22, 443],
                    decision: Verdict::Allow,
                },
                NetworkRule {
                    name: "block-private-ranges".to_string(),
                    domains: Vec::new(),
                    cidrs: vec![
                        "10.0.0.0/8",
                        "172.16.0.0/12",
                        "192.168.0.0/16",
                        "169.254.0.0/16",
                    ]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                    ports: Vec::new(),
                    decision: Verdict::Deny,
                },
            ],
            file_rules: vec![
                FileRule {
                    name: "protect-key-material".to_string(),
                    paths: vec!["**/.ssh/**", "**/.gnupg/**", "**/.aws/credentials"]
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                    operations: Vec::new(),
                    decision: Verdict::Deny,
                    message: "key material is off limits".to_string(),
                },
                FileRule {
                    name: "quarantine-workspace-deletes".to_string(),
                    paths: vec!["/workspace/**".to_string()],
                    operations: vec![FileOp::Delete],
                    decision: Verdict::SoftDelete,
                    message: String::new(),
                },
                FileRule {
                    name: "allow-workspace".to_string(),
                    paths: vec!["/workspace/**".to_string(), "/tmp/**".to_string()],
                    operations: vec![FileOp::Read, FileOp::Write],
                    decision: Verdict::Allow,
                    message: String::new(),
                },
            ],
            env_policy: EnvPolicy {
                allow: vec![
                    "PATH", "HOME", "USER", "SHELL", "LANG", "LC_*", "TERM", "PWD", "CARGO_*",
                    "RUSTUP_*",
                ]
                .into_iter()
                .map(str::to_string)
                .collect(),
                deny: vec!["*_TOKEN", "*_SECRET", "*_PASSWORD", "AWS_*"]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                ..EnvPolicy::default()
            },
            dlp: DlpConfig::default(),
            audit: AuditConfig::default(),
            quarantine: QuarantineConfig::default(),
            interception: InterceptionConfig::default(),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let policy: PolicyFile = toml::from_str(contents).context("parse policy TOML")?;
        Ok(policy)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        let output = toml::to_string_pretty(self).context("render policy TOML")?;
        Ok(output)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read policy at {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create policy dir {}", parent.display()))?;
        }
        let contents = self.to_toml_string()?;
        fs::write(path, contents).with_context(|| format!("write policy at {}", path.display()))?;
        Ok(())
    }
}

impl ConfigPaths {
    pub fn resolve() -> Result<Self> {
        let project_dirs = ProjectDirs::from("io", "agentwarden", "agentwarden")
            .ok_or_else(|| anyhow::anyhow!("unable to determine project directories"))?;
        let config_dir = project_dirs.config_dir();
        let data_dir = project_dirs.data_dir();
        Ok(Self::rooted(
            config_dir.join("policy.toml"),
            data_dir.to_path_buf(),
        ))
    }

    /// Derives the fixed layout under an explicit policy path and data
    /// root; used by tests and by the --config/--data-dir overrides.
    pub fn rooted(policy_path: PathBuf, data_dir: PathBuf) -> Self {
        let audit_dir = data_dir.join("audit");
        let quarantine_dir = data_dir.join("quarantine");
        Self {
            policy_path,
            data_dir,
            audit_dir,
            quarantine_dir,
        }
    }

    pub fn quarantine_dir_for(&self, policy: &PolicyFile) -> PathBuf {
        policy
            .quarantine
            .dir
            .clone()
            .unwrap_or_else(|| self.quarantine_dir.clone())
    }
}
