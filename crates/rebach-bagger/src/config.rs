//! Bagger workflow configuration (TOML).
//!
//! Sections: `[Defaults]` (workflow file, staging output dir, DART command,
//! delete/overwrite flags), `[Wasabi]` (staging store credentials and
//! endpoints), `[Logging]`, and `[Metadata]`, the table of descent rules
//! (tag file, then tag name) driving the metadata projection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct BaggerConfig {
    #[serde(rename = "Defaults")]
    pub defaults: Defaults,
    #[serde(rename = "Wasabi")]
    pub wasabi: WasabiConfig,
    #[serde(rename = "Logging", default)]
    pub logging: LoggingConfig,
    #[serde(rename = "Metadata", default)]
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
    pub workflow: PathBuf,
    pub archival_staging_storage: PathBuf,
    pub dart_command: String,
    #[serde(default = "default_true")]
    pub delete: bool,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WasabiConfig {
    pub access_key: String,
    pub secret_key: String,
    pub host: String,
    pub bucket: String,
    pub host_bucket: String,
    #[serde(default)]
    pub dart_workflow_hostbucket_override: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub logfile_prefix: String,
}

/// `[Metadata]` descent rules: tag file → tag name → rule.
pub type MetadataConfig = BTreeMap<String, BTreeMap<String, TagRule>>;

/// A single tag rule: either a bare dotted path, or a table with the path
/// plus post-processing options.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TagRule {
    Path(String),
    Detailed {
        tag_source: String,
        #[serde(default)]
        strip_html: bool,
        #[serde(default)]
        shorten: Option<usize>,
    },
}

impl TagRule {
    pub fn tag_source(&self) -> &str {
        match self {
            TagRule::Path(path) => path,
            TagRule::Detailed { tag_source, .. } => tag_source,
        }
    }

    pub fn strip_html(&self) -> bool {
        matches!(self, TagRule::Detailed { strip_html: true, .. })
    }

    pub fn shorten(&self) -> Option<usize> {
        match self {
            TagRule::Detailed { shorten, .. } => *shorten,
            TagRule::Path(_) => None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Load and parse the bagger TOML config.
pub fn load_bagger_config(path: &Path) -> Result<BaggerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bagger config: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse bagger config: {}", path.display()))
}
