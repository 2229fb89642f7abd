//! Collection orchestration.
//!
//! Collections carry no files of their own; a collection package is the
//! canonical metadata record (including the ordered article list) plus the
//! post-processor run. The fingerprint covers the *full* record, and a
//! collection without a license gets the synthetic CC0 entry before the
//! metadata is written.

use anyhow::{Result, bail};
use chrono::NaiveDate;
use serde_json::{Value, json};

use rebach_canon::fingerprint_full;
use rebach_config::SystemConfig;
use rebach_figshare::CatalogClient;
use rebach_package::PackageBuilder;
use rebach_types::{Author, Reporter, RunTotals, naming};

use crate::integration::{IntegrationDriver, PostProcessOutcome};
use crate::probes::PreservationProbes;

/// The license injected when a collection record has none.
pub fn cc0_license() -> Value {
    json!({
        "value": 2,
        "name": "CC0",
        "url": "https://creativecommons.org/publicdomain/zero/1.0/",
    })
}

/// Add the synthetic CC0 license when the record has none.
pub fn ensure_license(record: &mut Value) {
    let missing = record.get("license").map(Value::is_null).unwrap_or(true);
    if missing {
        if let Value::Object(map) = record {
            map.insert("license".to_string(), cc0_license());
        }
    }
}

pub struct CollectionOrchestrator<'a> {
    pub catalog: &'a CatalogClient,
    pub probes: &'a PreservationProbes,
    pub builder: &'a PackageBuilder,
    pub driver: &'a IntegrationDriver<'a>,
    pub system: &'a SystemConfig,
    pub ids: Option<&'a [u64]>,
    pub run_date: NaiveDate,
}

impl CollectionOrchestrator<'_> {
    fn selected(&self, id: u64) -> bool {
        self.ids.map(|ids| ids.contains(&id)).unwrap_or(true)
    }

    pub fn run(&self, totals: &mut RunTotals, reporter: &mut dyn Reporter) -> Result<()> {
        reporter.info("Fetching collections...");
        let rows: Vec<_> = self
            .catalog
            .institution_collections()?
            .into_iter()
            .filter(|row| self.selected(row.id))
            .collect();
        totals.collections_fetched += rows.len() as u64;

        for row in &rows {
            let article_ids: Vec<u64> = match self.catalog.collection_articles(row.id) {
                Ok(articles) => articles.iter().map(|a| a.id).collect(),
                Err(e) => {
                    reporter.error(&format!("{}: failed to list collection articles: {e:#}", row.id));
                    totals.errors += 1;
                    continue;
                }
            };

            let versions = match self.catalog.article_versions(&row.url) {
                Ok(versions) => versions,
                Err(e) => {
                    reporter.error(&format!("{}: failed to list versions: {e:#}", row.id));
                    totals.errors += 1;
                    continue;
                }
            };
            if versions.is_empty() {
                reporter.info(&format!("{} - Entity not found", row.id));
                continue;
            }

            for vrow in &versions {
                totals.collection_versions_fetched += 1;
                let label = format!("{} {}", row.id, naming::version_label(vrow.version));
                match self.process_collection_version(row.id, vrow.version, &vrow.url, &article_ids, totals, reporter) {
                    Ok(()) => {}
                    Err(e) => {
                        reporter.error(&format!("{label}: {e:#}"));
                        totals.errors += 1;
                        if !self.system.continue_on_error {
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn process_collection_version(
        &self,
        collection_id: u64,
        version: u32,
        url: &str,
        article_ids: &[u64],
        totals: &mut RunTotals,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let mut record = self.catalog.public_version(url)?;
        if let Value::Object(map) = &mut record {
            map.insert("articles".to_string(), json!(article_ids));
        }

        let fingerprint = fingerprint_full(&record);
        let report = self.probes.gather(collection_id, version)?;
        let decision = report.decide(collection_id, version, &fingerprint, 0, reporter);
        if decision.already_preserved() {
            if decision.in_final {
                totals.ap_trust_preserved_versions += 1;
            } else {
                totals.wasabi_preserved_versions += 1;
            }
            totals.skipped += 1;
            reporter.info(&format!(
                "{collection_id} {}: already preserved, skipping",
                naming::version_label(version)
            ));
            return Ok(());
        }

        ensure_license(&mut record);

        let last_name = first_author_last_name(&record).unwrap_or_else(|| "Collection".to_string());
        let name = naming::format_bag_name(
            &self.system.bag_name_prefix,
            collection_id,
            version,
            &last_name,
            fingerprint.as_str(),
            self.run_date,
        );

        if self.system.dry_run {
            reporter.info(&format!("dry run: would create collection package {name}"));
            return Ok(());
        }

        let package_dir = self.builder.build_collection_package(
            &self.system.preservation_storage_location,
            &name,
            collection_id,
            version,
            &record,
        )?;

        match self.driver.post_process(&package_dir, reporter)? {
            PostProcessOutcome::Success => {
                totals.processed += 1;
                reporter.info(&format!("collection package '{name}' processed successfully"));
            }
            PostProcessOutcome::Duplicate => {
                totals.processed += 1;
                totals.duplicates += 1;
                reporter.info(&format!(
                    "collection package '{name}' already exists in the remote store (duplicate)"
                ));
            }
            PostProcessOutcome::Failed(code) => {
                bail!("post-processor failed with exit code {code}");
            }
        }
        Ok(())
    }
}

fn first_author_last_name(record: &Value) -> Option<String> {
    let authors: Vec<Author> = match record.get("authors") {
        Some(Value::Array(authors)) => {
            serde_json::from_value(Value::Array(authors.clone())).ok()?
        }
        _ => return None,
    };
    authors
        .first()
        .and_then(Author::resolved_last_name)
        .map(str::to_string)
}
