//! Curation-tree matching.
//!
//! The curation tree is maintained by humans: one folder per deposit, named
//! `<Depositor_Name>_<item_id>` (token order varies), containing one `vNN`
//! folder per reviewed version, which in turn holds a `UAL_RDM/` folder with
//! the review artifacts. A version is only packaged when its `UAL_RDM`
//! contains all three required artifacts:
//!
//! - a deposit agreement (`deposit agreement` / `deposit_agreement`),
//! - the deposit review (`redata-depositreview`),
//! - the Trello board export (ends with `trello.pdf`).
//!
//! All name checks are case-insensitive. Directory candidates are matched on
//! the item id as an underscore-delimited token; the first match (in sorted
//! order) wins.

use std::path::Path;

use anyhow::{Context, Result};

use rebach_types::{CurationMatch, naming};

/// Why an item version did not match the curation tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unmatched {
    NoAuthorDir,
    NoVersionDir { author_dir: String },
    NoUalRdmDir { author_dir: String },
}

impl std::fmt::Display for Unmatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unmatched::NoAuthorDir => write!(f, "no curation folder contains the item id"),
            Unmatched::NoVersionDir { author_dir } => {
                write!(f, "curation folder '{author_dir}' has no folder for this version")
            }
            Unmatched::NoUalRdmDir { author_dir } => {
                write!(f, "curation folder '{author_dir}' has no UAL_RDM folder for this version")
            }
        }
    }
}

/// Outcome of matching one item version against the curation tree.
#[derive(Debug)]
pub enum CurationOutcome {
    Matched(CurationMatch),
    Unmatched(Unmatched),
}

/// Match `(item_id, version)` against the curation root.
pub fn match_item(root: &Path, item_id: u64, version: u32) -> Result<CurationOutcome> {
    let Some(author_dir) = find_author_dir(root, item_id)? else {
        return Ok(CurationOutcome::Unmatched(Unmatched::NoAuthorDir));
    };

    let version_dir = root.join(&author_dir).join(naming::version_label(version));
    if !version_dir.is_dir() {
        return Ok(CurationOutcome::Unmatched(Unmatched::NoVersionDir {
            author_dir,
        }));
    }

    let ual_rdm_dir = version_dir.join("UAL_RDM");
    if !ual_rdm_dir.is_dir() {
        return Ok(CurationOutcome::Unmatched(Unmatched::NoUalRdmDir {
            author_dir,
        }));
    }

    let mut has_deposit_agreement = false;
    let mut has_review_doc = false;
    let mut has_trello_doc = false;
    for entry in std::fs::read_dir(&ual_rdm_dir)
        .with_context(|| format!("failed to read {}", ual_rdm_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name.contains("deposit agreement") || name.contains("deposit_agreement") {
            has_deposit_agreement = true;
        }
        if name.contains("redata-depositreview") {
            has_review_doc = true;
        }
        if name.ends_with("trello.pdf") {
            has_trello_doc = true;
        }
    }

    let ual_rdm_bytes = tree_bytes(&ual_rdm_dir)?;

    Ok(CurationOutcome::Matched(CurationMatch {
        author_dir,
        version_dir,
        ual_rdm_dir,
        has_deposit_agreement,
        has_review_doc,
        has_trello_doc,
        ual_rdm_bytes,
    }))
}

/// The first (sorted) curation folder whose underscore-split name contains
/// the item id as a token.
fn find_author_dir(root: &Path, item_id: u64) -> Result<Option<String>> {
    let id_token = item_id.to_string();
    let mut names: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("failed to read curation root: {}", root.display()))?
    {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.split('_').any(|token| token == id_token) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names.into_iter().next())
}

fn tree_bytes(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in
        std::fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?
    {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += tree_bytes(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}
