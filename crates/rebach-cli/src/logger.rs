//! Timestamped file logging.
//!
//! One log file per run, `log-YYYY-MM-DD_HH-MM-SS.log` under the configured
//! logs location, each line formatted `YYYY-MM-DD HH:MM:SS,mmm:LEVEL:
//! message`. Messages are echoed to the terminal, and warnings/errors are
//! counted for the end-of-run summary.

use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;

use rebach_types::Reporter;

pub struct FileLog {
    writer: LineWriter<File>,
    path: PathBuf,
    warnings: u64,
    errors: u64,
}

impl FileLog {
    /// Open a fresh log file under `logs_location`.
    pub fn create(logs_location: &Path) -> Result<Self> {
        std::fs::create_dir_all(logs_location).with_context(|| {
            format!("failed to create logs location: {}", logs_location.display())
        })?;
        let name = format!("log-{}.log", Local::now().format("%Y-%m-%d_%H-%M-%S"));
        let path = logs_location.join(name);
        let file = File::create(&path)
            .with_context(|| format!("failed to create log file: {}", path.display()))?;
        Ok(Self {
            writer: LineWriter::new(file),
            path,
            warnings: 0,
            errors: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `(warnings, errors)` seen so far.
    pub fn counts(&self) -> (u64, u64) {
        (self.warnings, self.errors)
    }

    fn write(&mut self, level: &str, msg: &str) {
        let line = format!("{}:{level}: {msg}", Local::now().format("%Y-%m-%d %H:%M:%S,%3f"));
        println!("{line}");
        // A log line that cannot be written must not take the run down.
        let _ = writeln!(self.writer, "{line}");
    }
}

impl Reporter for FileLog {
    fn info(&mut self, msg: &str) {
        self.write("INFO", msg);
    }

    fn warn(&mut self, msg: &str) {
        self.warnings += 1;
        self.write("WARNING", msg);
    }

    fn error(&mut self, msg: &str) {
        self.errors += 1;
        self.write("ERROR", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_name_and_line_format() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut log = FileLog::create(td.path()).expect("create");
        log.info("starting up");
        log.warn("one warning");
        log.error("one error");
        drop(log);

        let entries: Vec<_> = std::fs::read_dir(td.path())
            .expect("read")
            .map(|e| e.expect("entry").file_name().into_string().expect("utf8"))
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("log-"));
        assert!(entries[0].ends_with(".log"));

        let content = std::fs::read_to_string(td.path().join(&entries[0])).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains(":INFO: starting up"));
        assert!(lines[1].contains(":WARNING: one warning"));
        assert!(lines[2].contains(":ERROR: one error"));
        // Timestamp shape: date, space, time with comma-millis.
        let stamp = lines[0].split(":INFO:").next().expect("stamp");
        assert_eq!(stamp.len(), "2025-01-15 10:30:00,123".len());
        assert!(stamp.contains(','));
    }

    #[test]
    fn warning_and_error_counts_accumulate() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut log = FileLog::create(td.path()).expect("create");
        log.info("i");
        log.warn("w1");
        log.warn("w2");
        log.error("e1");
        assert_eq!(log.counts(), (2, 1));
    }
}
