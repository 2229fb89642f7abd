//! Core domain types shared across the rebach workspace.
//!
//! Everything the orchestrators, probes, and the package builder exchange
//! lives here: catalog item versions, preserved-copy probe results, curation
//! match records, run counters, and the preservation package naming scheme
//! (formatting and decomposition).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod naming;

pub use naming::{BagName, decompose_bag_name, format_bag_name, last_name_slug, version_label};

/// Sink for run-time log messages.
///
/// The CLI implements this with a timestamped log file; tests collect
/// messages in memory. Lower layers report through this trait instead of
/// writing to stdout so the orchestrators stay silent by default.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// 32-hex MD5 of the canonicalized reduced metadata of an item version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a 32-hex digest string. Returns `None` when the input is not a
    /// lowercase 32-hex string.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    /// Wrap a digest that is known to be well-formed (e.g. freshly computed).
    pub fn from_digest(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One author of an item version, as returned by the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl Author {
    /// The author's last name, falling back to the final whitespace-separated
    /// token of the full name when the catalog omits the split form.
    pub fn resolved_last_name(&self) -> Option<&str> {
        match self.last_name.as_deref() {
            Some(n) if !n.is_empty() => Some(n),
            _ => self.full_name.split_whitespace().last(),
        }
    }
}

/// One downloadable file of an item version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub is_link_only: bool,
    #[serde(default)]
    pub supplied_md5: Option<String>,
    #[serde(default)]
    pub computed_md5: Option<String>,
    #[serde(default)]
    pub size: u64,
}

impl FileRef {
    /// The digest downloads must verify against: the depositor-supplied MD5
    /// when present, otherwise the catalog-computed one.
    pub fn expected_md5(&self) -> Option<&str> {
        self.supplied_md5
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.computed_md5.as_deref().filter(|s| !s.is_empty()))
    }

    /// On-disk name inside the package DATA directory.
    pub fn data_file_name(&self) -> String {
        format!("{}_{}", self.id, self.name)
    }
}

/// A single published version of a catalog article.
///
/// `raw` carries the full (possibly private-record-substituted) JSON payload;
/// the typed fields are projections the pipeline branches on. The raw payload
/// is what ultimately lands in `METADATA/<id>.json`.
#[derive(Debug, Clone)]
pub struct ItemVersion {
    pub id: u64,
    pub version: u32,
    pub size: u64,
    pub files: Vec<FileRef>,
    pub authors: Vec<Author>,
    pub curation_status: String,
    pub has_linked_file: bool,
    pub is_metadata_record: bool,
    /// Set when the files came from the private record of an embargoed item.
    pub embargo_note: Option<String>,
    pub raw: Value,
}

impl ItemVersion {
    /// Sum of the sizes of the files a package will actually hold
    /// (link-only entries occupy no local space).
    pub fn payload_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| !f.is_link_only)
            .map(|f| f.size)
            .sum()
    }

    pub fn first_author_last_name(&self) -> Option<&str> {
        self.authors.first().and_then(Author::resolved_last_name)
    }

    pub fn item_subtype(&self) -> &'static str {
        if self.has_linked_file {
            "linked"
        } else if self.is_metadata_record {
            "metadata"
        } else {
            "regular"
        }
    }
}

/// A single published version of a collection, with its ordered article list.
#[derive(Debug, Clone)]
pub struct CollectionVersion {
    pub id: u64,
    pub version: u32,
    pub authors: Vec<Author>,
    /// Article ids in catalog pagination order.
    pub article_ids: Vec<u64>,
    pub raw: Value,
}

/// Which store a preserved copy was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOrigin {
    FinalRemote,
    StagingRemote,
    Local,
}

impl std::fmt::Display for StoreOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StoreOrigin::FinalRemote => "final remote store",
            StoreOrigin::StagingRemote => "staging remote store",
            StoreOrigin::Local => "local preservation tree",
        };
        f.write_str(s)
    }
}

/// Probe result: a preserved package observed in one of the three stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreservedCopy {
    pub fingerprint: String,
    pub size: u64,
    pub origin: StoreOrigin,
}

/// Result of matching an item version against the curation tree.
#[derive(Debug, Clone)]
pub struct CurationMatch {
    /// Name of the author directory the item id matched under.
    pub author_dir: String,
    /// The `vNN` directory inside the author directory.
    pub version_dir: std::path::PathBuf,
    /// The `UAL_RDM` child holding the review artifacts.
    pub ual_rdm_dir: std::path::PathBuf,
    pub has_deposit_agreement: bool,
    pub has_review_doc: bool,
    pub has_trello_doc: bool,
    /// Total bytes under `UAL_RDM`, for the space preflight.
    pub ual_rdm_bytes: u64,
}

impl CurationMatch {
    /// All three required review artifacts are present.
    pub fn artifacts_complete(&self) -> bool {
        self.has_deposit_agreement && self.has_review_doc && self.has_trello_doc
    }

    pub fn missing_artifacts(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.has_deposit_agreement {
            missing.push("deposit agreement");
        }
        if !self.has_review_doc {
            missing.push("deposit review");
        }
        if !self.has_trello_doc {
            missing.push("trello board export");
        }
        missing
    }
}

/// Aggregate counters for the end-of-run summary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunTotals {
    pub articles_fetched: u64,
    pub article_versions_fetched: u64,
    pub collections_fetched: u64,
    pub collection_versions_fetched: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub processed: u64,
    /// Versions skipped because the final remote store already holds them.
    pub ap_trust_preserved_versions: u64,
    /// Versions skipped because the staging remote store already holds them.
    pub wasabi_preserved_versions: u64,
    /// Versions the post-processor reported as duplicates (exit code 3).
    pub duplicates: u64,
    pub skipped: u64,
    pub errors: u64,
}
