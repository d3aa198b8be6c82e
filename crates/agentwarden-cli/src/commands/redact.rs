use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};

use agentwarden_core::config::{ConfigPaths, PolicyFile};
use agentwarden_core::ids::SessionId;
use dlp::Redactor;

/// Offline stdin-to-stdout redaction with the same patterns the daemon
/// would use. Tokenize mode gets a throwaway session, so its tokens are
/// not reversible here.
pub fn execute(policy_path: Option<PathBuf>) -> Result<()> {
    let target = match policy_path {
        Some(path) => path,
        None => ConfigPaths::resolve()?.policy_path,
    };
    let policy = if target.exists() {
        PolicyFile::load(&target)?
    } else {
        PolicyFile::default_config()
    };
    let redactor = Redactor::compile(&policy.dlp)?;

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("read stdin")?;
    let redaction = redactor.process(SessionId::new(), &input);
    print!("{}", redaction.text);
    Ok(())
}
