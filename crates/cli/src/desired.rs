//! Desired-state files: a YAML or JSON map of consumer -> watch spec.

use std::path::Path;

use anyhow::{Context, Result};
use kdisco_core::DesiredState;

pub fn parse(text: &str, json: bool) -> Result<DesiredState> {
    if json {
        serde_json::from_str(text).context("parsing desired state as JSON")
    } else {
        serde_yaml::from_str(text).context("parsing desired state as YAML")
    }
}

/// Read and parse `path`. Returns the raw text too so callers can detect changes.
pub fn load(path: &Path) -> Result<(String, DesiredState)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let json = path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("json")).unwrap_or(false);
    let state = parse(&text, json).with_context(|| format!("in {}", path.display()))?;
    Ok((text, state))
}
