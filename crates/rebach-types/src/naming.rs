//! Preservation package naming: formatting and decomposition.
//!
//! A package directory is named
//! `<prefix>_<id>-v<NN>-<LastName>-<fingerprint>_bag_<YYYYMMDD>`; the bagger
//! appends `.tar` for the uploaded artifact and multi-part bags carry a
//! `bag2of3`-style counter instead of the bare `bag`. Both the builder and
//! the three preservation probes go through this module so the name grammar
//! lives in exactly one place.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

static BAG_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<prefix>\w+?)_(?P<id>\d+)-v(?P<version>\d+)-(?P<last>[A-Za-z0-9_]+)-(?P<fp>[a-f0-9]{32})_bag(?P<count>\d+of\d+)?_?(?P<date>\d{8})?(?:\.tar)?$",
    )
    .expect("bag name regex")
});

static LOCAL_BAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\w*_\d+-v\d{2,}-[A-Z][A-Za-z]+-[a-f0-9]{32}_bag\d*of?\d*_?\d*$")
        .expect("local bag regex")
});

static FINGERPRINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-f0-9]{32})_bag").expect("fingerprint regex"));

/// The `vNN` label: zero-padded to two digits below 10, plain decimal above.
pub fn version_label(version: u32) -> String {
    if version < 10 {
        format!("v{version:02}")
    } else {
        format!("v{version}")
    }
}

/// Reduce an author's last name to the package-name slug: whitespace-split
/// tokens with non-alphanumerics stripped, joined with `_`, case preserved.
pub fn last_name_slug(last_name: &str) -> String {
    last_name
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Render the canonical package directory name for a run date.
pub fn format_bag_name(
    prefix: &str,
    item_id: u64,
    version: u32,
    last_name: &str,
    fingerprint: &str,
    date: NaiveDate,
) -> String {
    format!(
        "{prefix}_{item_id}-{}-{}-{fingerprint}_bag_{}",
        version_label(version),
        last_name_slug(last_name),
        date.format("%Y%m%d"),
    )
}

/// A decomposed package (or tar) name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagName {
    pub prefix: String,
    pub item_id: u64,
    pub version: u32,
    pub last_name: String,
    pub fingerprint: String,
    /// `Some("2of3")` for multi-part bags.
    pub bag_count: Option<String>,
    /// `YYYYMMDD` run date when present.
    pub date: Option<String>,
}

impl BagName {
    pub fn version_label(&self) -> String {
        version_label(self.version)
    }
}

/// Parse a package directory or tar name. Returns `None` when the name does
/// not follow the package grammar.
pub fn decompose_bag_name(name: &str) -> Option<BagName> {
    let caps = BAG_NAME_RE.captures(name)?;
    Some(BagName {
        prefix: caps["prefix"].to_string(),
        item_id: caps["id"].parse().ok()?,
        version: caps["version"].parse().ok()?,
        last_name: caps["last"].to_string(),
        fingerprint: caps["fp"].to_string(),
        bag_count: caps.name("count").map(|m| m.as_str().to_string()),
        date: caps.name("date").map(|m| m.as_str().to_string()),
    })
}

/// Whether a directory name in the local preservation tree looks like a
/// preservation package.
pub fn is_local_bag_name(name: &str) -> bool {
    LOCAL_BAG_RE.is_match(name)
}

/// Extract the fingerprint from a bag name of any shape (directory, tar,
/// multi-part); matches the 32-hex run immediately before `_bag`.
pub fn extract_fingerprint(name: &str) -> Option<&str> {
    FINGERPRINT_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// The `(id, vNN)` containment predicate shared by all three probes.
pub fn mentions_item_version(name: &str, item_id: u64, version: u32) -> bool {
    name.contains(&item_id.to_string()) && name.contains(&version_label(version))
}
