//! Figshare catalog client.
//!
//! Paginated readers for the institution `articles` and `collections`
//! endpoints, the public per-item `versions` listing, public and private
//! version fetches, and the per-collection article listing. Every request
//! goes through the fixed-wait retry harness; the per-attempt HTTP timeout
//! equals the configured wait so a hung connection never outlives the retry
//! budget.
//!
//! Private fetches exist for embargoed items: a public version payload that
//! reports `size > 0` but carries no `files[]` is resolved against the
//! private API, and the private record's files are adopted when its curation
//! status is approved.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;

use rebach_retry::{AttemptError, RetryPolicy};
use rebach_types::{Author, FileRef, ItemVersion, Reporter};

/// Page size used for every paginated catalog endpoint.
pub const PAGE_SIZE: u32 = 100;

/// User agent sent with every catalog request.
pub const USER_AGENT: &str = concat!("rebach/", env!("CARGO_PKG_VERSION"));

/// One row of the institution articles listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ArticleRow {
    pub id: u64,
    #[serde(default)]
    pub url_public_api: String,
}

/// One row of the institution collections listing.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionRow {
    pub id: u64,
    #[serde(default, alias = "url_public_api")]
    pub url: String,
}

/// One row of a `<public_url>/versions` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionRow {
    pub version: u32,
    pub url: String,
}

/// Outcome of resolving one catalog version to a processable record.
#[derive(Debug)]
pub enum VersionResolution {
    Resolved(Box<ItemVersion>),
    /// The private record exists but its curation status is not approved.
    NotApproved { id: u64, version: u32 },
    /// The private record returned 404.
    PrivateMissing { id: u64, version: u32 },
}

#[derive(Debug, Clone)]
pub struct CatalogClient {
    base_url: String,
    token: String,
    institution: u64,
    policy: RetryPolicy,
    client: reqwest::blocking::Client,
}

impl CatalogClient {
    pub fn new(
        base_url: &str,
        token: &str,
        institution: u64,
        policy: RetryPolicy,
    ) -> Result<Self> {
        // The configured wait doubles as the per-attempt deadline, floored
        // so a sub-second wait cannot starve the request itself.
        let timeout = policy.wait.max(Duration::from_secs(1));
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build catalog HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            institution,
            policy,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// All published articles of the institution, in pagination order.
    pub fn institution_articles(&self) -> Result<Vec<ArticleRow>> {
        let url = format!("{}/account/institution/articles", self.base_url);
        self.paginated_rows(&url, true)
    }

    /// All published collections of the institution, in pagination order.
    pub fn institution_collections(&self) -> Result<Vec<CollectionRow>> {
        let url = format!("{}/account/institution/collections", self.base_url);
        self.paginated_rows(&url, true)
    }

    /// The version listing of one item, ascending by version.
    pub fn article_versions(&self, public_url: &str) -> Result<Vec<VersionRow>> {
        let url = format!("{}/versions", public_url.trim_end_matches('/'));
        let value = self.get_json(&url, false, &[])?;
        let mut rows: Vec<VersionRow> =
            serde_json::from_value(value).context("failed to parse versions listing")?;
        rows.sort_by_key(|row| row.version);
        Ok(rows)
    }

    /// The public record of one version.
    pub fn public_version(&self, url: &str) -> Result<Value> {
        self.get_json(url, false, &[])
    }

    /// The private record of a version; `None` when the catalog returns 404.
    pub fn private_record(&self, url: &str) -> Result<Option<Value>> {
        match self.try_get_json(url, true, &[]) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_fatal() => Ok(None),
            Err(e) => Err(e.error),
        }
    }

    /// Articles of one collection, in pagination order.
    pub fn collection_articles(&self, collection_id: u64) -> Result<Vec<ArticleRow>> {
        let url = format!("{}/collections/{collection_id}/articles", self.base_url);
        self.paginated_rows(&url, false)
    }

    /// Resolve one listed version into a full record, applying the embargo
    /// fallback when the public payload hides the files.
    pub fn resolve_version(
        &self,
        article_id: u64,
        row: &VersionRow,
        reporter: &mut dyn Reporter,
    ) -> Result<VersionResolution> {
        let mut record = self.public_version(&row.url)?;
        let size = record.get("size").and_then(Value::as_u64).unwrap_or(0);
        let has_files = record
            .get("files")
            .map(|f| !f.is_null())
            .unwrap_or(false);

        let mut embargo_note = None;
        if size > 0 && !has_files {
            let private_url = record
                .get("url_private_api")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("{article_id} v{}: no private API url", row.version))?
                .to_string();
            let Some(private) = self.private_record(&private_url)? else {
                return Ok(VersionResolution::PrivateMissing {
                    id: article_id,
                    version: row.version,
                });
            };
            let status = private
                .get("curation_status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if status != "approved" {
                reporter.info(&format!(
                    "{article_id} v{}: curation_status was not approved",
                    row.version
                ));
                return Ok(VersionResolution::NotApproved {
                    id: article_id,
                    version: row.version,
                });
            }
            let private_version = private
                .get("version")
                .and_then(Value::as_u64)
                .unwrap_or(row.version as u64);
            let note = format!(
                "This item had a file embargo. The files are from version {private_version}."
            );
            reporter.info(&note);
            if let Some(files) = private.get("files") {
                if let Value::Object(map) = &mut record {
                    map.insert("files".to_string(), files.clone());
                }
            }
            embargo_note = Some(note);
        }

        let mut item = parse_item_version(article_id, row.version, record)?;
        item.embargo_note = embargo_note;
        Ok(VersionResolution::Resolved(Box::new(item)))
    }

    fn paginated_rows<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        with_token: bool,
    ) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        let mut page = 1u32;
        loop {
            let page_str = page.to_string();
            let page_size = PAGE_SIZE.to_string();
            let institution = self.institution.to_string();
            let mut query: Vec<(&str, &str)> =
                vec![("page", &page_str), ("page_size", &page_size)];
            if with_token {
                query.push(("institution", &institution));
            }
            let value = self.get_json(url, with_token, &query)?;
            let batch = value
                .as_array()
                .context("expected a JSON array from a paginated listing")?;
            if batch.is_empty() {
                break;
            }
            for row in batch {
                rows.push(
                    serde_json::from_value(row.clone())
                        .context("failed to parse a catalog listing row")?,
                );
            }
            page += 1;
        }
        Ok(rows)
    }

    fn get_json(&self, url: &str, with_token: bool, query: &[(&str, &str)]) -> Result<Value> {
        self.try_get_json(url, with_token, query)
            .map_err(|e| e.error)
    }

    /// One retried GET, surfacing the classification so callers can
    /// distinguish a 404 from an exhausted transient failure.
    fn try_get_json(
        &self,
        url: &str,
        with_token: bool,
        query: &[(&str, &str)],
    ) -> Result<Value, AttemptError> {
        self.policy.run(|attempt| {
            let mut request = self.client.get(url).query(query);
            if with_token {
                request = request.header("Authorization", format!("token {}", self.token));
            }
            let response = request.send().map_err(|e| {
                AttemptError::transient(anyhow!("request to {url} failed: {e} (try {attempt})"))
            })?;
            let status = response.status();
            if status.is_success() {
                response
                    .json()
                    .map_err(|e| AttemptError::transient(anyhow!("invalid JSON from {url}: {e}")))
            } else {
                Err(AttemptError::from_status(
                    status.as_u16(),
                    anyhow!("{url} returned status {status} (try {attempt})"),
                ))
            }
        })
    }
}

/// Build the typed item version from a catalog record.
pub fn parse_item_version(article_id: u64, version: u32, record: Value) -> Result<ItemVersion> {
    let files: Vec<FileRef> = match record.get("files") {
        Some(Value::Array(files)) => serde_json::from_value(Value::Array(files.clone()))
            .context("failed to parse files[]")?,
        _ => Vec::new(),
    };
    let authors: Vec<Author> = match record.get("authors") {
        Some(Value::Array(authors)) => serde_json::from_value(Value::Array(authors.clone()))
            .context("failed to parse authors[]")?,
        _ => Vec::new(),
    };

    Ok(ItemVersion {
        id: record
            .get("id")
            .and_then(Value::as_u64)
            .unwrap_or(article_id),
        version,
        size: record.get("size").and_then(Value::as_u64).unwrap_or(0),
        files,
        authors,
        curation_status: record
            .get("curation_status")
            .and_then(Value::as_str)
            .unwrap_or("approved")
            .to_string(),
        has_linked_file: record
            .get("has_linked_file")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        is_metadata_record: record
            .get("is_metadata_record")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        embargo_note: None,
        raw: record,
    })
}
