//! Path and environment configuration.
//!
//! Resolution order (highest priority first):
//! 1. Environment variables (`WEFT_HOME`, `WEFT_BACKEND`)
//! 2. Defaults (`~/.weft`)
//!
//! Workspaces live under `<home>/workspaces/<name>`, one directory per
//! workspace. Nothing here is cached globally; callers resolve paths once
//! and pass explicit handles around, so tests can point at temp directories
//! without leaking state between cases.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Environment variable overriding the weft home directory.
pub const HOME_ENV: &str = "WEFT_HOME";

/// Environment variable naming the generation backend command line.
pub const BACKEND_ENV: &str = "WEFT_BACKEND";

/// Resolve the weft home directory (`$WEFT_HOME` or `~/.weft`).
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }

    let user_home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(user_home.join(".weft"))
}

/// Directory containing all workspace stores.
pub fn workspaces_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join("workspaces"))
}

/// Directory backing one named workspace.
///
/// Workspace names are restricted to characters that are safe as directory
/// names, which also keeps key spaces of different workspaces disjoint.
pub fn workspace_dir(name: &str) -> Result<PathBuf> {
    validate_workspace_name(name)?;
    Ok(workspaces_dir()?.join(name))
}

/// Validate a workspace name (alphanumerics, `_`, `-`).
pub fn validate_workspace_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("Workspace name cannot be empty");
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        anyhow::bail!("Workspace name contains disallowed characters: {:?}", name);
    }

    Ok(())
}

/// The backend command line from `$WEFT_BACKEND`, split on whitespace.
///
/// Returns `(program, args)`.
pub fn backend_command() -> Result<(String, Vec<String>)> {
    let raw = std::env::var(BACKEND_ENV).with_context(|| {
        format!(
            "No generation backend configured; set {} to a command that reads a prompt \
             on stdin and writes the generation to stdout",
            BACKEND_ENV
        )
    })?;

    let mut parts = raw.split_whitespace().map(str::to_string);
    let program = parts
        .next()
        .with_context(|| format!("{} is empty", BACKEND_ENV))?;

    Ok((program, parts.collect()))
}
