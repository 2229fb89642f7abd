//! Configuration loading for the rebach CLI.
//!
//! The config file is INI (`.env.ini` by convention, passed with `--xfg`)
//! with three sections: `[figshare_api]`, `[system]`, and `[aptrust]`.
//! Loading is strict about required keys and lenient about optional ones.
//! Value and path checks live in [`Config::validate`], which runs in
//! startup-dependency order (logs location first, then credentials, then
//! the data roots, then the post-processor) before any network I/O.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ini::Ini;

use rebach_retry::RetryPolicy;

/// The post-process selector that runs the bagger in-process.
pub const BAGGER_COMMAND: &str = "Bagger";

/// Catalog API access.
#[derive(Debug, Clone)]
pub struct FigshareConfig {
    pub url: String,
    pub token: String,
    pub institution: u64,
    pub retries: u32,
    pub retries_wait: u64,
}

impl FigshareConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_secs(self.retries_wait))
    }
}

/// Local filesystem layout and run behavior.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub logs_location: PathBuf,
    pub preservation_storage_location: PathBuf,
    pub curation_storage_location: PathBuf,
    /// Extra percentage of space demanded on top of the computed payload.
    pub additional_percentage_required: u64,
    pub bag_name_prefix: String,
    pub post_process_script_command: String,
    pub pre_process_script_command: String,
    pub dry_run: bool,
    pub continue_on_error: bool,
}

impl SystemConfig {
    /// `1 + additional_percentage_required/100`, the preflight slack factor.
    pub fn slack_factor(&self) -> f64 {
        1.0 + self.additional_percentage_required as f64 / 100.0
    }

    pub fn uses_bagger(&self) -> bool {
        self.post_process_script_command == BAGGER_COMMAND
    }
}

/// Final preservation registry access.
#[derive(Debug, Clone)]
pub struct ApTrustConfig {
    pub url: String,
    pub user: String,
    pub token: String,
    pub items_per_page: u32,
    pub alt_identifier_starts_with: String,
    pub retries: u32,
    pub retries_wait: u64,
}

impl ApTrustConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_secs(self.retries_wait))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub figshare: FigshareConfig,
    pub system: SystemConfig,
    pub aptrust: ApTrustConfig,
}

impl Config {
    /// Load and type-check a config file. Fails fast: the first missing or
    /// malformed key aborts the load. Value-level checks (empty
    /// credentials, unreachable paths) happen later in [`Config::validate`]
    /// so they run in startup order.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.is_file() {
            bail!(
                "configuration file is missing or cannot be read: {}",
                path.display()
            );
        }
        let ini = Ini::load_from_file(path)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        let figshare = Section::new(&ini, "figshare_api")?;
        let system = Section::new(&ini, "system")?;
        let aptrust = Section::new(&ini, "aptrust")?;

        let config = Config {
            figshare: FigshareConfig {
                url: figshare.required("url")?,
                token: figshare.required("token")?,
                institution: figshare.parsed("institution", 0)?,
                retries: figshare.parsed("retries", 3)?,
                retries_wait: figshare.parsed("retries_wait", 10)?,
            },
            system: SystemConfig {
                logs_location: PathBuf::from(system.required("logs_location")?),
                preservation_storage_location: PathBuf::from(
                    system.required("preservation_storage_location")?,
                ),
                curation_storage_location: PathBuf::from(
                    system.required("curation_storage_location")?,
                ),
                additional_percentage_required: system
                    .parsed("additional_percentage_required", 10)?,
                bag_name_prefix: system.required("bag_name_prefix")?,
                post_process_script_command: system.required("post_process_script_command")?,
                pre_process_script_command: system
                    .optional("pre_process_script_command")
                    .unwrap_or_default(),
                dry_run: system.flag("dry-run", false)?,
                continue_on_error: system.flag("continue-on-error", true)?,
            },
            aptrust: ApTrustConfig {
                url: aptrust.required("url")?,
                user: aptrust.required("user")?,
                token: aptrust.required("token")?,
                items_per_page: aptrust.parsed("items_per_page", 100)?,
                alt_identifier_starts_with: aptrust.required("alt_identifier_starts_with")?,
                retries: aptrust.parsed("retries", 3)?,
                retries_wait: aptrust.parsed("retries_wait", 10)?,
            },
        };

        Ok(config)
    }

    /// Startup validation, in the order the run depends on things: the
    /// logs location must be usable before anything can be logged, then the
    /// credentials, then the data roots, then the post-processor. The logs
    /// location is created if absent; everything else must already exist.
    pub fn validate(&self) -> Result<()> {
        let logs = &self.system.logs_location;
        std::fs::create_dir_all(logs).with_context(|| {
            format!(
                "the logs location could not be reached or created: {}",
                logs.display()
            )
        })?;

        if self.figshare.url.is_empty() || self.figshare.token.is_empty() {
            bail!("figshare API URL and token are required");
        }

        ensure_writable_dir(
            &self.system.preservation_storage_location,
            "preservation storage location",
        )?;
        ensure_readable_dir(
            &self.system.curation_storage_location,
            "curation storage location",
        )?;

        if self.system.post_process_script_command.is_empty() {
            bail!("post process script command is required");
        }
        if !self.system.uses_bagger() {
            let script = Path::new(&self.system.post_process_script_command);
            if !script.exists() {
                bail!(
                    "the post process script location could not be reached: {}",
                    script.display()
                );
            }
        }

        if self.figshare.institution == 0 {
            bail!("institution id is required");
        }
        Ok(())
    }
}

fn ensure_writable_dir(path: &Path, what: &str) -> Result<()> {
    if !path.is_dir() {
        bail!("the {what} could not be reached: {}", path.display());
    }
    let probe = path.join(".rebach-write-probe");
    std::fs::write(&probe, b"")
        .with_context(|| format!("the {what} is not writable: {}", path.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

fn ensure_readable_dir(path: &Path, what: &str) -> Result<()> {
    if !path.is_dir() {
        bail!("the {what} could not be reached: {}", path.display());
    }
    std::fs::read_dir(path)
        .with_context(|| format!("the {what} is not readable: {}", path.display()))?;
    Ok(())
}

/// One INI section with typed accessors.
struct Section<'a> {
    name: &'static str,
    props: &'a ini::Properties,
}

impl<'a> Section<'a> {
    fn new(ini: &'a Ini, name: &'static str) -> Result<Self> {
        let props = ini
            .section(Some(name))
            .with_context(|| format!("config section [{name}] is missing"))?;
        Ok(Self { name, props })
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.props.get(key).map(|s| s.trim().to_string())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .with_context(|| format!("config key [{}] {key} is missing", self.name))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.optional(key) {
            None => Ok(default),
            Some(s) if s.is_empty() => Ok(default),
            Some(s) => s
                .parse()
                .map_err(|_| anyhow::anyhow!("config key [{}] {key} is not valid: {s}", self.name)),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key).as_deref() {
            None | Some("") => Ok(default),
            Some("true") | Some("True") | Some("yes") | Some("1") => Ok(true),
            Some("false") | Some("False") | Some("no") | Some("0") => Ok(false),
            Some(other) => bail!(
                "config key [{}] {key} must be a boolean, got: {other}",
                self.name
            ),
        }
    }
}
