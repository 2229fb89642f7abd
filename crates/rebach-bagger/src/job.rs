//! DART runner job driver.
//!
//! A job is one invocation of the DART runner for one package: the workflow
//! file, output directory, and delete flag go on the command line, and the
//! job description (package name, files, tags) is written to the runner's
//! stdin as a single JSON document.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::metadata::Tag;

/// One DART invocation.
#[derive(Debug, Clone)]
pub struct DartJob {
    pub workflow: PathBuf,
    pub package_name: String,
    pub output_dir: PathBuf,
    pub delete: bool,
    pub dart_command: String,
    files: Vec<PathBuf>,
    tags: Vec<Tag>,
    env: Vec<(String, String)>,
}

/// What the runner said.
#[derive(Debug)]
pub struct JobOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl DartJob {
    pub fn new(
        workflow: &Path,
        package_name: &str,
        output_dir: &Path,
        delete: bool,
        dart_command: &str,
    ) -> Self {
        Self {
            workflow: workflow.to_path_buf(),
            package_name: package_name.to_string(),
            output_dir: output_dir.to_path_buf(),
            delete,
            dart_command: dart_command.to_string(),
            files: Vec::new(),
            tags: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn add_file(&mut self, path: &Path) {
        self.files.push(path.to_path_buf());
    }

    pub fn add_tag(&mut self, tag: Tag) {
        self.tags.push(tag);
    }

    /// Credentials the runner needs; set on the child process only, never on
    /// this process.
    pub fn add_env(&mut self, key: &str, value: &str) {
        self.env.push((key.to_string(), value.to_string()));
    }

    /// The JSON document written to the runner's stdin.
    pub fn payload(&self) -> Value {
        json!({
            "packageName": self.package_name,
            "files": self.files,
            "tags": self.tags.iter().map(|t| json!({
                "tagFile": t.tag_file,
                "tagName": t.tag_name,
                "value": t.value,
            })).collect::<Vec<Value>>(),
        })
    }

    pub fn run(&self) -> Result<JobOutcome> {
        let payload = self.payload().to_string();

        let mut command = Command::new(&self.dart_command);
        command
            .arg(format!("--workflow={}", self.workflow.display()))
            .arg(format!("--output-dir={}", self.output_dir.display()))
            .arg(format!("--delete={}", self.delete))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to launch DART runner: {}", self.dart_command))?;

        {
            let stdin = child.stdin.as_mut().context("DART runner stdin closed")?;
            stdin
                .write_all(payload.as_bytes())
                .context("failed to write job description to DART runner")?;
            stdin.write_all(b"\n").context("failed to finish job description")?;
        }

        let output = child
            .wait_with_output()
            .context("failed to collect DART runner output")?;

        Ok(JobOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }
}
