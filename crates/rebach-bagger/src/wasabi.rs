//! Staging-store access via the S3-compatible CLI.
//!
//! Listing goes through `s3cmd` rather than an SDK so the credentials and
//! endpoint handling stay identical to the archival workflow DART runs.

use std::process::Command;

use anyhow::{Context, Result};

use crate::config::WasabiConfig;

/// Staging store connection details.
#[derive(Debug, Clone)]
pub struct Wasabi {
    pub access_key: String,
    pub secret_key: String,
    pub host: String,
    pub bucket: String,
    pub host_bucket: String,
    pub hostbucket_override: bool,
}

/// Raw output of one `s3cmd ls` invocation.
#[derive(Debug, Clone, Default)]
pub struct S3Listing {
    pub stdout: String,
    pub stderr: String,
}

impl S3Listing {
    pub fn has_errors(&self) -> bool {
        !self.stderr.trim().is_empty()
    }

    pub fn error_lines(&self) -> impl Iterator<Item = &str> {
        self.stderr
            .lines()
            .map(|line| line.trim_start_matches("ERROR: ").trim())
            .filter(|line| !line.is_empty())
    }
}

impl Wasabi {
    pub fn from_config(config: &WasabiConfig) -> Self {
        Self {
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            host: config.host.clone(),
            bucket: config.bucket.clone(),
            host_bucket: config.host_bucket.clone(),
            hostbucket_override: config.dart_workflow_hostbucket_override,
        }
    }

    /// The `s3://` URL of the preservation bucket.
    pub fn bucket_url(&self) -> String {
        if self.bucket.starts_with("s3://") {
            self.bucket.clone()
        } else {
            format!("s3://{}", self.bucket)
        }
    }

    /// List a folder in the bucket. I/O failures launching the CLI are
    /// errors; the CLI's own complaints come back in the listing's stderr.
    pub fn list_bucket(&self, folder: &str) -> Result<S3Listing> {
        let output = Command::new("s3cmd")
            .args(["--access_key", &self.access_key])
            .args(["--secret_key", &self.secret_key])
            .args(["--host", &self.host])
            .args(["--host-bucket", &self.host_bucket])
            .arg("ls")
            .arg(folder)
            .output()
            .context("failed to run s3cmd; is it installed?")?;
        Ok(S3Listing {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Parse file names out of `s3cmd ls` output.
pub fn filenames_from_listing(ls: &str) -> Vec<String> {
    ls.lines()
        .filter_map(|line| line.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `(file name, size)` pairs out of `s3cmd ls` output. Lines without a
/// numeric size column (e.g. DIR rows) are skipped.
pub fn entries_from_listing(ls: &str) -> Vec<(String, u64)> {
    ls.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // date time size s3://bucket/path
            if fields.len() < 4 {
                return None;
            }
            let size: u64 = fields[fields.len() - 2].parse().ok()?;
            let name = fields.last()?.rsplit('/').next()?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), size))
        })
        .collect()
}
