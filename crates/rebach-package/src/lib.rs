//! Preservation package builder.
//!
//! Creates the on-disk package
//! `<prefix>_<id>-vNN-<LastName>-<fingerprint>_bag_<YYYYMMDD>/vNN/{DATA,METADATA,UAL_RDM}`,
//! streaming each catalog file into `DATA/` with MD5 verification, mirroring
//! the curation `UAL_RDM` tree, and writing the cleaned version JSON into
//! `METADATA/`.
//!
//! The integrity contract is all-or-nothing: any download failure or digest
//! mismatch removes the entire package directory. A package left behind by
//! an earlier run is re-verified file by file; when every on-disk digest
//! matches, nothing is downloaded again.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use md5::{Digest, Md5};
use serde_json::Value;
use thiserror::Error;

use rebach_retry::{AttemptError, RetryPolicy};
use rebach_types::{CurationMatch, ItemVersion, Reporter, naming};

/// Download chunk size.
const CHUNK_SIZE: usize = 8 * 1024;

/// Internal bookkeeping fields that must not appear in the emitted
/// `METADATA/<id>.json`.
pub const HELPER_FIELDS: &[&str] = &[
    "matched",
    "curation_info",
    "total_num_files",
    "file_size_sum",
    "version_md5",
    "redata_deposit_review_file",
    "deposit_agreement_file",
    "trello_file",
    "author_dir",
];

/// User agent for file downloads.
pub const USER_AGENT: &str = concat!("rebach/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("integrity failure for {name}: expected md5 {expected}, got {actual}")]
    Md5Mismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What the builder did for one package.
#[derive(Debug)]
pub struct BuildOutcome {
    pub package_dir: PathBuf,
    pub downloaded_files: usize,
    /// True when an existing package verified clean and was kept as-is.
    pub reused: bool,
}

/// Strip the internal helper fields from a version record.
pub fn cleaned_metadata(raw: &Value) -> Value {
    let mut cleaned = raw.clone();
    if let Value::Object(map) = &mut cleaned {
        for field in HELPER_FIELDS {
            map.remove(*field);
        }
    }
    cleaned
}

/// Compose the package directory name for an item version.
pub fn package_name(
    prefix: &str,
    item: &ItemVersion,
    fingerprint: &str,
    date: chrono::NaiveDate,
) -> Result<String> {
    let last_name = item
        .first_author_last_name()
        .ok_or_else(|| anyhow!("{} v{}: item has no authors", item.id, item.version))?;
    Ok(naming::format_bag_name(
        prefix,
        item.id,
        item.version,
        last_name,
        fingerprint,
        date,
    ))
}

/// Removes the package directory on drop unless disarmed. Keeps the
/// rollback contract honest across every early return.
struct RollbackGuard {
    path: PathBuf,
    armed: bool,
}

impl RollbackGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Streams catalog files to disk with digest verification.
#[derive(Debug, Clone)]
pub struct Downloader {
    token: String,
    policy: RetryPolicy,
    client: reqwest::blocking::Client,
}

impl Downloader {
    pub fn new(token: &str, policy: RetryPolicy) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build download HTTP client")?;
        Ok(Self {
            token: token.to_string(),
            policy,
            client,
        })
    }

    /// Download `url` to `dest` in 8 KiB chunks and verify the digest.
    /// Returns the number of bytes written.
    fn fetch_verified(
        &self,
        url: &str,
        dest: &Path,
        expected_md5: Option<&str>,
    ) -> Result<u64, BuildError> {
        let (bytes, actual) = self
            .policy
            .run(|attempt| self.fetch_once(url, dest, attempt))
            .map_err(|e| BuildError::Other(e.error))?;

        if let Some(expected) = expected_md5 {
            if actual != expected {
                return Err(BuildError::Md5Mismatch {
                    name: dest
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    fn fetch_once(
        &self,
        url: &str,
        dest: &Path,
        attempt: u32,
    ) -> Result<(u64, String), AttemptError> {
        let mut response = self
            .client
            .get(url)
            .header("Authorization", format!("token {}", self.token))
            .send()
            .map_err(|e| {
                AttemptError::transient(anyhow!("download of {url} failed: {e} (try {attempt})"))
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::from_status(
                status.as_u16(),
                anyhow!("{url} returned status {status} (try {attempt})"),
            ));
        }

        let mut file = std::fs::File::create(dest).map_err(|e| {
            AttemptError::fatal(anyhow!("failed to create {}: {e}", dest.display()))
        })?;
        let mut hasher = Md5::new();
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = response.read(&mut buffer).map_err(|e| {
                AttemptError::transient(anyhow!("download of {url} interrupted: {e}"))
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            file.write_all(&buffer[..n]).map_err(|e| {
                AttemptError::fatal(anyhow!("failed to write {}: {e}", dest.display()))
            })?;
            total += n as u64;
        }
        file.flush()
            .map_err(|e| AttemptError::fatal(anyhow!("failed to flush {}: {e}", dest.display())))?;
        Ok((total, hex::encode(hasher.finalize())))
    }
}

/// MD5 of a file already on disk, streamed in the same chunk size.
pub fn file_md5(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Builds article and collection packages on the preservation root.
pub struct PackageBuilder {
    downloader: Downloader,
}

impl PackageBuilder {
    pub fn new(token: &str, policy: RetryPolicy) -> Result<Self> {
        Ok(Self {
            downloader: Downloader::new(token, policy)?,
        })
    }

    /// Build (or re-verify) the package for one matched article version.
    pub fn build_article_package(
        &self,
        preservation_root: &Path,
        name: &str,
        item: &ItemVersion,
        curation: &CurationMatch,
        reporter: &mut dyn Reporter,
    ) -> Result<BuildOutcome, BuildError> {
        let package_dir = preservation_root.join(name);
        let version_dir = package_dir.join(naming::version_label(item.version));
        let data_dir = version_dir.join("DATA");

        if package_dir.exists() && !dir_is_empty(&package_dir)? {
            match self.verify_existing(&data_dir, item)? {
                true => {
                    reporter.info(&format!(
                        "{} v{}: existing package verified, files not re-downloaded",
                        item.id, item.version
                    ));
                    self.finish_layout(&version_dir, item, curation)?;
                    return Ok(BuildOutcome {
                        package_dir,
                        downloaded_files: 0,
                        reused: true,
                    });
                }
                false => {
                    reporter.warn(&format!(
                        "{} v{}: existing package disagrees with the catalog, rebuilding",
                        item.id, item.version
                    ));
                    std::fs::remove_dir_all(&package_dir).with_context(|| {
                        format!("failed to remove stale package {}", package_dir.display())
                    })?;
                }
            }
        }

        let mut guard = RollbackGuard::new(package_dir.clone());
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let mut downloaded = 0;
        for file in &item.files {
            if file.is_link_only {
                continue;
            }
            let dest = data_dir.join(file.data_file_name());
            self.downloader
                .fetch_verified(&file.download_url, &dest, file.expected_md5())?;
            downloaded += 1;
        }

        self.finish_layout(&version_dir, item, curation)?;

        guard.disarm();
        Ok(BuildOutcome {
            package_dir,
            downloaded_files: downloaded,
            reused: false,
        })
    }

    /// Build the metadata-only package for one collection version.
    pub fn build_collection_package(
        &self,
        preservation_root: &Path,
        name: &str,
        collection_id: u64,
        version: u32,
        record: &Value,
    ) -> Result<PathBuf> {
        let package_dir = preservation_root.join(name);
        let metadata_dir = package_dir
            .join(naming::version_label(version))
            .join("METADATA");

        let mut guard = RollbackGuard::new(package_dir.clone());
        std::fs::create_dir_all(&metadata_dir)
            .with_context(|| format!("failed to create {}", metadata_dir.display()))?;
        write_metadata_json(&metadata_dir, collection_id, record)?;
        guard.disarm();
        Ok(package_dir)
    }

    /// Every non-link file must exist under DATA with a matching digest.
    fn verify_existing(&self, data_dir: &Path, item: &ItemVersion) -> Result<bool> {
        for file in &item.files {
            if file.is_link_only {
                continue;
            }
            let path = data_dir.join(file.data_file_name());
            if !path.is_file() {
                return Ok(false);
            }
            if let Some(expected) = file.expected_md5() {
                if file_md5(&path)? != expected {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// UAL_RDM mirror and METADATA JSON, shared by fresh builds and
    /// re-verified packages.
    fn finish_layout(
        &self,
        version_dir: &Path,
        item: &ItemVersion,
        curation: &CurationMatch,
    ) -> Result<()> {
        let ual_rdm_dest = version_dir.join("UAL_RDM");
        copy_tree(&curation.ual_rdm_dir, &ual_rdm_dest)?;

        let metadata_dir = version_dir.join("METADATA");
        std::fs::create_dir_all(&metadata_dir)
            .with_context(|| format!("failed to create {}", metadata_dir.display()))?;
        write_metadata_json(&metadata_dir, item.id, &item.raw)?;
        Ok(())
    }
}

fn write_metadata_json(metadata_dir: &Path, id: u64, record: &Value) -> Result<()> {
    let path = metadata_dir.join(format!("{id}.json"));
    let pretty = serde_json::to_string_pretty(&cleaned_metadata(record))
        .context("failed to render metadata JSON")?;
    std::fs::write(&path, pretty)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn dir_is_empty(path: &Path) -> Result<bool> {
    let mut entries = std::fs::read_dir(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(entries.next().is_none())
}

/// Recursive verbatim copy, overwriting existing files.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;
    for entry in
        std::fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))?
    {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}
