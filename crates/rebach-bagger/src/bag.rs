//! The bagging flow: checks, workflow override, and the DART invocation.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tempfile::NamedTempFile;

use rebach_types::{Reporter, decompose_bag_name};

use crate::BagStatus;
use crate::config::BaggerConfig;
use crate::job::DartJob;
use crate::metadata::project_tags;
use crate::wasabi::{Wasabi, filenames_from_listing};

/// Drives DART for one preservation package at a time.
pub struct Bagger<'a> {
    config: &'a BaggerConfig,
    workflow: PathBuf,
    output_dir: PathBuf,
    delete: bool,
    dart_command: String,
    overwrite: bool,
    dry_run: bool,
    wasabi: Wasabi,
}

impl<'a> Bagger<'a> {
    pub fn new(config: &'a BaggerConfig, dry_run: bool) -> Self {
        Self {
            config,
            workflow: config.defaults.workflow.clone(),
            output_dir: config.defaults.archival_staging_storage.clone(),
            delete: config.defaults.delete,
            dart_command: config.defaults.dart_command.clone(),
            overwrite: config.defaults.overwrite,
            dry_run,
            wasabi: Wasabi::from_config(&config.wasabi),
        }
    }

    /// Bag one package. Every early exit maps to a [`BagStatus`]; only
    /// environmental failures (the CLI missing, unreadable workflow file)
    /// surface as errors.
    pub fn run(&self, package_path: &Path, reporter: &mut dyn Reporter) -> Result<BagStatus> {
        let package_name = match package_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return Ok(BagStatus::InvalidPath),
        };
        let bag_name = format!("{package_name}.tar");

        let Some(parts) = decompose_bag_name(&package_name) else {
            reporter.error(&format!(
                "package name does not follow the bag grammar: {package_name}"
            ));
            return Ok(BagStatus::InvalidPath);
        };

        let metadata_path = package_path
            .join(parts.version_label())
            .join("METADATA")
            .join(format!("{}.json", parts.item_id));
        if !metadata_path.exists() {
            reporter.error(&format!(
                "package metadata file is missing: {}",
                metadata_path.display()
            ));
            return Ok(BagStatus::InvalidPath);
        }

        let metadata: Value = match std::fs::read_to_string(&metadata_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
        {
            Some(value) => value,
            None => {
                reporter.error(&format!(
                    "package metadata is not valid JSON: {}",
                    metadata_path.display()
                ));
                return Ok(BagStatus::InvalidPackage);
            }
        };

        let listing = self.wasabi.list_bucket(&self.wasabi.bucket_url())?;
        if listing.has_errors() {
            for line in listing.error_lines() {
                reporter.error(&format!("[staging store] {line}"));
            }
            return Ok(BagStatus::StagingStoreError);
        }
        if filenames_from_listing(&listing.stdout).contains(&bag_name) && !self.overwrite {
            return Ok(BagStatus::DuplicateBag);
        }

        let tags = match project_tags(&self.config.metadata, &metadata) {
            Ok(tags) => tags,
            Err(e) => {
                reporter.error(&format!("metadata tag projection failed: {e}"));
                return Ok(BagStatus::InvalidConfig);
            }
        };

        // The override file must outlive the job; dropping it deletes the
        // temp workflow even when the run aborts.
        let (workflow, _override_file) = if self.wasabi.hostbucket_override {
            match self.overridden_workflow()? {
                Some(file) => (file.path().to_path_buf(), Some(file)),
                None => {
                    reporter.error("storageServices key not found in DART workflow file");
                    return Ok(BagStatus::InvalidConfig);
                }
            }
        } else {
            (self.workflow.clone(), None::<NamedTempFile>)
        };

        if self.dry_run {
            reporter.info(&format!("dry run: skipped DART invocation for {bag_name}"));
            return Ok(BagStatus::Success);
        }

        let mut job = DartJob::new(
            &workflow,
            &bag_name,
            &self.output_dir,
            self.delete,
            &self.dart_command,
        );
        job.add_file(package_path);
        for tag in tags {
            job.add_tag(tag);
        }
        job.add_env("WASABI_ACCESS_KEY_ID", &self.wasabi.access_key);
        job.add_env("WASABI_SECRET_ACCESS_KEY", &self.wasabi.secret_key);

        let outcome = job.run()?;
        if !outcome.stderr.trim().is_empty() {
            reporter.error(outcome.stderr.trim_end());
        }
        if let Ok(data) = serde_json::from_str::<Value>(&outcome.stdout) {
            let mut errors = Vec::new();
            for key in ["packageResult", "validationResult"] {
                collect_result_errors(data.get(key), &mut errors);
            }
            if let Some(uploads) = data.get("uploadResults").and_then(Value::as_array) {
                collect_result_errors(uploads.first(), &mut errors);
            }
            if errors.is_empty() {
                reporter.info(&format!("job succeeded: {bag_name}"));
            } else {
                for error in errors {
                    reporter.warn(&error);
                }
            }
        }

        Ok(BagStatus::from_code(outcome.exit_code))
    }

    /// Rewrite the workflow's storage services with the configured host and
    /// bucket; `None` when the workflow has no `storageServices` key.
    fn overridden_workflow(&self) -> Result<Option<NamedTempFile>> {
        let content = std::fs::read_to_string(&self.workflow).with_context(|| {
            format!("failed to read DART workflow file: {}", self.workflow.display())
        })?;
        let mut workflow: Value = serde_json::from_str(&content).with_context(|| {
            format!("DART workflow file is not valid JSON: {}", self.workflow.display())
        })?;

        let Some(services) = workflow
            .get_mut("storageServices")
            .and_then(Value::as_array_mut)
        else {
            return Ok(None);
        };
        for service in services {
            if let Value::Object(map) = service {
                map.insert("host".to_string(), Value::String(self.wasabi.host.clone()));
                map.insert(
                    "bucket".to_string(),
                    Value::String(self.wasabi.bucket.clone()),
                );
            }
        }

        let mut file = tempfile::Builder::new()
            .prefix("rebach")
            .suffix(".json")
            .tempfile()
            .context("failed to create workflow override file")?;
        file.write_all(workflow.to_string().as_bytes())
            .context("failed to write workflow override file")?;
        file.flush().context("failed to flush workflow override file")?;
        Ok(Some(file))
    }
}

fn collect_result_errors(result: Option<&Value>, out: &mut Vec<String>) {
    let Some(errors) = result.and_then(|r| r.get("errors")) else {
        return;
    };
    match errors {
        Value::Object(map) => {
            for (key, value) in map {
                out.push(format!("{key}: {value}"));
            }
        }
        Value::Array(items) => {
            for item in items {
                out.push(item.to_string());
            }
        }
        Value::String(s) if !s.is_empty() => out.push(s.clone()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct TestReporter {
        infos: Vec<String>,
        warns: Vec<String>,
        errors: Vec<String>,
    }

    impl Reporter for TestReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }

        fn warn(&mut self, msg: &str) {
            self.warns.push(msg.to_string());
        }

        fn error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
    }

    fn sample_config(dir: &Path) -> BaggerConfig {
        let toml_str = format!(
            r#"
[Defaults]
workflow = "{workflow}"
archival_staging_storage = "{out}"
dart_command = "dart-runner"
delete = true
overwrite = false

[Wasabi]
access_key = "AK"
secret_key = "SK"
host = "s3.example"
bucket = "preservation"
host_bucket = "hb"
dart_workflow_hostbucket_override = true
"#,
            workflow = dir.join("workflow.json").display(),
            out = dir.join("out").display(),
        );
        toml::from_str(&toml_str).expect("config")
    }

    #[test]
    fn run_rejects_a_package_with_a_foreign_name() {
        let td = tempfile::tempdir().expect("tempdir");
        let config = sample_config(td.path());
        let bagger = Bagger::new(&config, false);
        let package = td.path().join("not-a-bag-name");
        std::fs::create_dir_all(&package).expect("mkdir");

        let mut reporter = TestReporter::default();
        let status = bagger.run(&package, &mut reporter).expect("run");
        assert_eq!(status, BagStatus::InvalidPath);
        assert!(reporter.errors[0].contains("bag grammar"));
    }

    #[test]
    fn run_requires_the_metadata_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let config = sample_config(td.path());
        let bagger = Bagger::new(&config, false);
        let package = td
            .path()
            .join("azu_1234567-v02-Smith-0a1b2c3d4e5f60718293a4b5c6d7e8f9_bag_20250101");
        std::fs::create_dir_all(package.join("v02/DATA")).expect("mkdir");

        let mut reporter = TestReporter::default();
        let status = bagger.run(&package, &mut reporter).expect("run");
        assert_eq!(status, BagStatus::InvalidPath);
        assert!(reporter.errors[0].contains("metadata file is missing"));
    }

    #[test]
    fn workflow_override_rewrites_storage_services() {
        let td = tempfile::tempdir().expect("tempdir");
        let config = sample_config(td.path());
        std::fs::write(
            td.path().join("workflow.json"),
            json!({
                "name": "preserve",
                "storageServices": [
                    {"name": "wasabi", "host": "old-host", "bucket": "old-bucket"}
                ]
            })
            .to_string(),
        )
        .expect("write workflow");

        let bagger = Bagger::new(&config, false);
        let file = bagger.overridden_workflow().expect("override").expect("some");
        let rewritten: Value =
            serde_json::from_str(&std::fs::read_to_string(file.path()).expect("read"))
                .expect("json");
        assert_eq!(rewritten["storageServices"][0]["host"], "s3.example");
        assert_eq!(rewritten["storageServices"][0]["bucket"], "preservation");

        let override_path = file.path().to_path_buf();
        drop(file);
        assert!(!override_path.exists(), "override file is scoped");
    }

    #[test]
    fn workflow_override_requires_storage_services() {
        let td = tempfile::tempdir().expect("tempdir");
        let config = sample_config(td.path());
        std::fs::write(td.path().join("workflow.json"), r#"{"name": "preserve"}"#)
            .expect("write workflow");

        let bagger = Bagger::new(&config, false);
        assert!(bagger.overridden_workflow().expect("ok").is_none());
    }

    #[test]
    fn dart_result_errors_are_collected() {
        let data = json!({
            "packageResult": {"errors": {"bagging": "tar failed"}},
            "validationResult": {"errors": {}},
            "uploadResults": [{"errors": {"upload": "timeout"}}],
        });
        let mut errors = Vec::new();
        for key in ["packageResult", "validationResult"] {
            collect_result_errors(data.get(key), &mut errors);
        }
        collect_result_errors(
            data.get("uploadResults").and_then(Value::as_array).unwrap().first(),
            &mut errors,
        );
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("tar failed"));
        assert!(errors[1].contains("timeout"));
    }
}
