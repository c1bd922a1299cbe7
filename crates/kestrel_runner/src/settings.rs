//! Runner settings
//!
//! Defaults that rarely change per invocation, loadable from a JSON file
//! with `--settings`. Command-line flags override anything set here.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Field separator applied when `-F` is not given.
    pub field_separator: Option<String>,
    /// Globals assigned before every run, merged under `-v` flags.
    pub assigns: BTreeMap<String, String>,
    /// Print the return value and named variables after each run.
    pub show_extra_info: bool,
    /// Reading a never-assigned variable is an error.
    pub strict_vars: bool,
    /// Integer division yields floats.
    pub float_div: bool,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read settings file '{}'", path.display()))?;
        let settings = serde_json::from_str(&text)
            .with_context(|| format!("cannot parse settings file '{}'", path.display()))?;
        Ok(settings)
    }
}
