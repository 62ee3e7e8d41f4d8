//! Driver settings: `declare.toml`, then `DECLARE_ASYNC_PROOFS`, then flags.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "declare.toml";
pub const ASYNC_PROOFS_ENV: &str = "DECLARE_ASYNC_PROOFS";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct DriverConfig {
    /// Finish `qed` proofs on worker threads; results are merged by `join`.
    pub async_proofs: bool,
    /// Register solved obligations as transparent definitions.
    pub transparent_obligations: bool,
    /// Tactic tried on obligations without one of their own, as an
    /// s-expression such as `"assumption"` or `"(exact a)"`.
    pub obligation_tactic: Option<String>,
    /// Declare universe-polymorphic constants.
    pub polymorphic: bool,
}

impl DriverConfig {
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).context("invalid driver configuration")
    }

    /// An explicit `path` must exist; otherwise `declare.toml` in the current
    /// directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None if Path::new(CONFIG_FILE).exists() => Path::new(CONFIG_FILE),
            None => return Ok(Self::default()),
        };
        let source = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&source).with_context(|| format!("in {}", path.display()))
    }

    /// Apply `DECLARE_ASYNC_PROOFS` if it is set.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(ASYNC_PROOFS_ENV) {
            self.async_proofs = parse_flag(&value).with_context(|| format!("invalid {}", ASYNC_PROOFS_ENV))?;
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got {:?}", other),
    }
}
