//! Post-processor driver.
//!
//! Hands a finished package to the bagging stage. With
//! `post_process_script_command = Bagger` the bagger runs in-process, with
//! its log directory redirected into the core's logs location; any other
//! value is treated as an external executable invoked with the package path.
//! Exit code 3 means the bag already exists in the remote store; that is a
//! duplicate, not an error.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};

use rebach_bagger::{BagStatus, Bagger, BaggerConfig};
use rebach_config::SystemConfig;
use rebach_types::Reporter;

/// Where the bagger workflow config lives unless overridden.
pub const DEFAULT_BAGGER_CONFIG_PATH: &str = "bagger/config/default.toml";

/// What the post-processor said about one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessOutcome {
    Success,
    /// The package is already in the remote store (exit code 3).
    Duplicate,
    Failed(i32),
}

impl PostProcessOutcome {
    fn from_code(code: i32) -> Self {
        match code {
            0 => PostProcessOutcome::Success,
            3 => PostProcessOutcome::Duplicate,
            other => PostProcessOutcome::Failed(other),
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, PostProcessOutcome::Failed(_))
    }
}

pub struct IntegrationDriver<'a> {
    system: &'a SystemConfig,
    bagger_config: Option<BaggerConfig>,
}

impl<'a> IntegrationDriver<'a> {
    /// The bagger config, when present, gets its log directory overridden
    /// with the core's logs location so one run writes one log tree.
    pub fn new(system: &'a SystemConfig, bagger_config: Option<BaggerConfig>) -> Self {
        let bagger_config = bagger_config.map(|mut config| {
            config.logging.log_dir = system.logs_location.clone();
            config
        });
        Self {
            system,
            bagger_config,
        }
    }

    pub fn bagger_config(&self) -> Option<&BaggerConfig> {
        self.bagger_config.as_ref()
    }

    /// Run the post-processor for one package.
    pub fn post_process(
        &self,
        package_path: &Path,
        reporter: &mut dyn Reporter,
    ) -> Result<PostProcessOutcome> {
        if self.system.dry_run {
            reporter.info(&format!(
                "dry run: skipped post-processing of {}",
                package_path.display()
            ));
            return Ok(PostProcessOutcome::Success);
        }

        if self.system.uses_bagger() {
            let config = self
                .bagger_config
                .as_ref()
                .ok_or_else(|| anyhow!("post-processing requires a bagger config file"))?;
            let bagger = Bagger::new(config, self.system.dry_run);
            let status = bagger.run(package_path, reporter)?;
            reporter.info(&format!(
                "post-processor finished with status {status} (exit code {})",
                status.code()
            ));
            return Ok(match status {
                BagStatus::Success => PostProcessOutcome::Success,
                BagStatus::DuplicateBag => PostProcessOutcome::Duplicate,
                other => PostProcessOutcome::Failed(other.code()),
            });
        }

        let command = &self.system.post_process_script_command;
        reporter.info(&format!("executing post-processing command: {command}"));
        let status = Command::new(command)
            .arg(package_path)
            .status()
            .with_context(|| format!("failed to run post-processing command: {command}"))?;
        Ok(PostProcessOutcome::from_code(status.code().unwrap_or(1)))
    }

    /// Run the optional pre-process hook for one item. A missing
    /// configuration means no hook; a non-zero exit is reported by the
    /// caller.
    pub fn pre_process(
        &self,
        item_id: u64,
        version: u32,
        reporter: &mut dyn Reporter,
    ) -> Result<bool> {
        let command = &self.system.pre_process_script_command;
        if command.is_empty() {
            return Ok(true);
        }
        if self.system.dry_run {
            reporter.info(&format!(
                "dry run: skipped pre-processing of {item_id} v{version}"
            ));
            return Ok(true);
        }
        reporter.info(&format!("executing pre-processing command: {command}"));
        let status = Command::new(command)
            .arg(item_id.to_string())
            .arg(version.to_string())
            .status()
            .with_context(|| format!("failed to run pre-processing command: {command}"))?;
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rebach_types::NullReporter;

    use super::*;

    fn system_with_command(command: &str, dry_run: bool) -> SystemConfig {
        SystemConfig {
            logs_location: PathBuf::from("/tmp/logs"),
            preservation_storage_location: PathBuf::from("/tmp/preservation"),
            curation_storage_location: PathBuf::from("/tmp/curation"),
            additional_percentage_required: 10,
            bag_name_prefix: "azu".into(),
            post_process_script_command: command.into(),
            pre_process_script_command: String::new(),
            dry_run,
            continue_on_error: true,
        }
    }

    #[cfg(unix)]
    fn script_with_exit(dir: &Path, code: i32) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(format!("post-{code}.sh"));
        std::fs::write(&path, format!("#!/usr/bin/env sh\nexit {code}\n")).expect("write");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path.to_str().expect("utf8").to_string()
    }

    #[test]
    fn outcome_mapping() {
        assert_eq!(PostProcessOutcome::from_code(0), PostProcessOutcome::Success);
        assert_eq!(PostProcessOutcome::from_code(3), PostProcessOutcome::Duplicate);
        assert_eq!(PostProcessOutcome::from_code(1), PostProcessOutcome::Failed(1));
        assert!(!PostProcessOutcome::Duplicate.is_error());
        assert!(PostProcessOutcome::Failed(4).is_error());
    }

    #[cfg(unix)]
    #[test]
    fn external_code_3_is_a_duplicate_not_an_error() {
        let td = tempfile::tempdir().expect("tempdir");
        let system = system_with_command(&script_with_exit(td.path(), 3), false);
        let driver = IntegrationDriver::new(&system, None);

        let mut reporter = NullReporter;
        let outcome = driver
            .post_process(td.path(), &mut reporter)
            .expect("post-process");
        assert_eq!(outcome, PostProcessOutcome::Duplicate);
        assert!(!outcome.is_error());
    }

    #[cfg(unix)]
    #[test]
    fn external_success_and_failure_map_through() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut reporter = NullReporter;

        let ok = system_with_command(&script_with_exit(td.path(), 0), false);
        let outcome = IntegrationDriver::new(&ok, None)
            .post_process(td.path(), &mut reporter)
            .expect("post-process");
        assert_eq!(outcome, PostProcessOutcome::Success);

        let bad = system_with_command(&script_with_exit(td.path(), 4), false);
        let outcome = IntegrationDriver::new(&bad, None)
            .post_process(td.path(), &mut reporter)
            .expect("post-process");
        assert_eq!(outcome, PostProcessOutcome::Failed(4));
    }

    #[test]
    fn dry_run_suppresses_the_invocation() {
        // The command does not exist; a dry run must not try to execute it.
        let system = system_with_command("/no/such/script.sh", true);
        let driver = IntegrationDriver::new(&system, None);
        let mut reporter = NullReporter;
        let outcome = driver
            .post_process(Path::new("/tmp/pkg"), &mut reporter)
            .expect("post-process");
        assert_eq!(outcome, PostProcessOutcome::Success);
    }

    #[test]
    fn missing_pre_process_command_is_a_no_op() {
        let system = system_with_command("Bagger", false);
        let driver = IntegrationDriver::new(&system, None);
        let mut reporter = NullReporter;
        assert!(driver.pre_process(1, 1, &mut reporter).expect("pre-process"));
    }
}
