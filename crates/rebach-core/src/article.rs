//! Article orchestration: fetch, fingerprint, probe, match, preflight,
//! package, post-process.

use anyhow::{Result, bail};
use chrono::NaiveDate;

use rebach_canon::fingerprint_reduced;
use rebach_config::SystemConfig;
use rebach_curation::{CurationOutcome, match_item};
use rebach_figshare::{CatalogClient, VersionResolution};
use rebach_package::{PackageBuilder, package_name};
use rebach_types::{CurationMatch, Fingerprint, ItemVersion, Reporter, RunTotals, naming};

use crate::integration::{IntegrationDriver, PostProcessOutcome};
use crate::probes::PreservationProbes;
use crate::space;

/// One version that survived the skip checks, waiting for curation
/// matching and packaging.
struct VersionTask {
    item: ItemVersion,
    fingerprint: Fingerprint,
    curation: Option<CurationMatch>,
}

pub struct ArticleOrchestrator<'a> {
    pub catalog: &'a CatalogClient,
    pub probes: &'a PreservationProbes,
    pub builder: &'a PackageBuilder,
    pub driver: &'a IntegrationDriver<'a>,
    pub system: &'a SystemConfig,
    /// Restricts processing to these item ids when given.
    pub ids: Option<&'a [u64]>,
    pub run_date: NaiveDate,
}

impl ArticleOrchestrator<'_> {
    fn selected(&self, id: u64) -> bool {
        self.ids.map(|ids| ids.contains(&id)).unwrap_or(true)
    }

    /// Drive the full article pipeline, accumulating counters into
    /// `totals`. Remote failures skip the affected item and keep going;
    /// only a space shortfall (without `continue-on-error`) or a packaging
    /// failure under `continue-on-error = false` ends the run.
    pub fn run(&self, totals: &mut RunTotals, reporter: &mut dyn Reporter) -> Result<()> {
        reporter.info("Fetching articles...");
        let rows: Vec<_> = self
            .catalog
            .institution_articles()?
            .into_iter()
            .filter(|row| self.selected(row.id))
            .collect();
        totals.articles_fetched += rows.len() as u64;

        let mut tasks: Vec<VersionTask> = Vec::new();
        for row in &rows {
            let versions = match self.catalog.article_versions(&row.url_public_api) {
                Ok(versions) => versions,
                Err(e) => {
                    reporter.error(&format!("{}: failed to list versions: {e:#}", row.id));
                    totals.errors += 1;
                    continue;
                }
            };
            if versions.is_empty() {
                reporter.info(&format!("{} - Entity not found: ArticleVersion", row.id));
                continue;
            }
            for vrow in &versions {
                totals.article_versions_fetched += 1;
                let label = format!("{} {}", row.id, naming::version_label(vrow.version));
                match self.catalog.resolve_version(row.id, vrow, reporter) {
                    Ok(VersionResolution::Resolved(item)) => {
                        let fingerprint = fingerprint_reduced(&item.raw);
                        let report = match self.probes.gather(row.id, vrow.version) {
                            Ok(report) => report,
                            Err(e) => {
                                reporter.error(&format!(
                                    "{label}: preservation probes failed, skipping: {e:#}"
                                ));
                                totals.errors += 1;
                                totals.skipped += 1;
                                continue;
                            }
                        };
                        let decision = report.decide(
                            row.id,
                            vrow.version,
                            &fingerprint,
                            item.payload_bytes(),
                            reporter,
                        );
                        if decision.already_preserved() {
                            if decision.in_final {
                                totals.ap_trust_preserved_versions += 1;
                            } else {
                                totals.wasabi_preserved_versions += 1;
                            }
                            totals.skipped += 1;
                            reporter.info(&format!("{label}: already preserved, skipping"));
                            continue;
                        }
                        tasks.push(VersionTask {
                            item: *item,
                            fingerprint,
                            curation: None,
                        });
                    }
                    Ok(VersionResolution::NotApproved { .. }) => {
                        totals.skipped += 1;
                    }
                    Ok(VersionResolution::PrivateMissing { .. }) => {
                        reporter.warn(&format!("{label}: private record not found, skipping"));
                        totals.skipped += 1;
                    }
                    Err(e) => {
                        reporter.error(&format!("{label}: failed to fetch version: {e:#}"));
                        totals.errors += 1;
                    }
                }
            }
        }

        let copyable = self.match_against_curation(tasks, totals, reporter);
        self.preflight(&copyable, totals, reporter)?;

        for task in copyable {
            let label = format!("{} {}", task.item.id, naming::version_label(task.item.version));
            match self.process_version(&task, totals, reporter) {
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
        Ok(())
    }

    /// Split the surviving versions into copyable and rejected, logging the
    /// per-category report.
    fn match_against_curation(
        &self,
        tasks: Vec<VersionTask>,
        totals: &mut RunTotals,
        reporter: &mut dyn Reporter,
    ) -> Vec<VersionTask> {
        let curation_root = &self.system.curation_storage_location;
        let mut copyable = Vec::new();
        let mut matched = 0u64;
        let mut unmatched = 0u64;

        for mut task in tasks {
            let label = format!("{} {}", task.item.id, naming::version_label(task.item.version));
            match match_item(curation_root, task.item.id, task.item.version) {
                Ok(CurationOutcome::Matched(found)) => {
                    matched += 1;
                    if found.artifacts_complete() {
                        reporter.info(&format!(
                            "{label}: matched curation folder '{}'",
                            found.author_dir
                        ));
                        task.curation = Some(found);
                        copyable.push(task);
                    } else {
                        reporter.error(&format!(
                            "{label}: curation folder '{}' is missing required artifacts: {}",
                            found.author_dir,
                            found.missing_artifacts().join(", ")
                        ));
                        totals.errors += 1;
                    }
                }
                Ok(CurationOutcome::Unmatched(reason)) => {
                    unmatched += 1;
                    reporter.info(&format!("{label}: unmatched: {reason}"));
                }
                Err(e) => {
                    reporter.error(&format!("{label}: curation scan failed: {e:#}"));
                    totals.errors += 1;
                }
            }
        }

        totals.matched += matched;
        totals.unmatched += unmatched;
        reporter.info(&format!(
            "Curation matching finished: {matched} matched, {unmatched} unmatched"
        ));
        copyable
    }

    /// Space preflight over the matched set only.
    fn preflight(
        &self,
        copyable: &[VersionTask],
        totals: &mut RunTotals,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let payload: u64 = copyable
            .iter()
            .map(|task| {
                task.item.payload_bytes()
                    + task
                        .curation
                        .as_ref()
                        .map(|c| c.ual_rdm_bytes)
                        .unwrap_or(0)
            })
            .sum();
        let required = space::required_bytes(payload, self.system.slack_factor());
        match space::check_space(&self.system.preservation_storage_location, required)? {
            Ok(()) => Ok(()),
            Err(shortfall) => {
                if self.system.continue_on_error {
                    reporter.error(&shortfall.to_string());
                    totals.errors += 1;
                    Ok(())
                } else {
                    Err(shortfall.into())
                }
            }
        }
    }

    fn process_version(
        &self,
        task: &VersionTask,
        totals: &mut RunTotals,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let item = &task.item;
        let name = package_name(
            &self.system.bag_name_prefix,
            item,
            task.fingerprint.as_str(),
            self.run_date,
        )?;

        if self.system.dry_run {
            reporter.info(&format!("dry run: would create package {name}"));
            return Ok(());
        }

        if !self.driver.pre_process(item.id, item.version, reporter)? {
            bail!("pre-processing command failed");
        }

        let curation = task
            .curation
            .as_ref()
            .expect("copyable versions carry a curation match");
        let outcome = self.builder.build_article_package(
            &self.system.preservation_storage_location,
            &name,
            item,
            curation,
            reporter,
        )?;

        match self.driver.post_process(&outcome.package_dir, reporter)? {
            PostProcessOutcome::Success => {
                totals.processed += 1;
                reporter.info(&format!("package '{name}' processed successfully"));
            }
            PostProcessOutcome::Duplicate => {
                totals.processed += 1;
                totals.duplicates += 1;
                reporter.info(&format!(
                    "package '{name}' already exists in the remote store (duplicate)"
                ));
            }
            PostProcessOutcome::Failed(code) => {
                bail!("post-processor failed with exit code {code}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use md5::{Digest, Md5};
    use serde_json::{Value, json};
    use tempfile::tempdir;
    use tiny_http::{Response, Server};

    use rebach_index::FinalStoreClient;
    use rebach_retry::RetryPolicy;

    use super::*;

    const FILE_CONTENT: &[u8] = b"csv,data\n1,2\n";

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

    fn md5_hex(bytes: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn version_record(base: &str, version: u32, with_file: bool) -> Value {
        let files = if with_file {
            json!([{
                "id": 99,
                "name": "data.csv",
                "size": FILE_CONTENT.len() as u64,
                "download_url": format!("{base}/files/99"),
                "is_link_only": false,
                "supplied_md5": md5_hex(FILE_CONTENT),
            }])
        } else {
            json!([])
        };
        json!({
            "id": 1234567,
            "version": version,
            "size": if with_file { FILE_CONTENT.len() as u64 } else { 0 },
            "curation_status": "approved",
            "description": format!("widgets, version {version}"),
            "authors": [{"full_name": "Ada Smith", "last_name": "Smith"}],
            "files": files,
            "has_linked_file": false,
            "is_metadata_record": false,
        })
    }

    /// One server carrying the catalog, the final-store registry, and the
    /// file endpoint. Returns the base url, a download counter, and the
    /// handler thread.
    fn pipeline_server(
        final_store_bags: Vec<(String, u64)>,
    ) -> (String, Arc<AtomicUsize>, thread::JoinHandle<()>) {
        let server = Server::http("127.0.0.1:0").expect("server");
        let base = format!("http://{}", server.server_addr());
        let downloads = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&downloads);
        let base_for_thread = base.clone();

        let handle = thread::spawn(move || {
            let base = base_for_thread;
            loop {
                let Ok(Some(req)) = server.recv_timeout(Duration::from_millis(400)) else {
                    break;
                };
                let url = req.url().to_string();
                let path = url.split('?').next().unwrap_or("");
                let first_page = page_param(&url) == 1;

                if path == "/account/institution/articles" {
                    let body = if first_page {
                        json!([{"id": 1234567, "url_public_api": format!("{base}/articles/1234567")}])
                            .to_string()
                    } else {
                        "[]".to_string()
                    };
                    respond_json(req, body);
                } else if path == "/articles/1234567/versions" {
                    let body = json!([
                        {"version": 1, "url": format!("{base}/articles/1234567/versions/1")},
                        {"version": 2, "url": format!("{base}/articles/1234567/versions/2")},
                    ])
                    .to_string();
                    respond_json(req, body);
                } else if path == "/articles/1234567/versions/1" {
                    respond_json(req, version_record(&base, 1, false).to_string());
                } else if path == "/articles/1234567/versions/2" {
                    respond_json(req, version_record(&base, 2, true).to_string());
                } else if path == "/finalstore" {
                    let body = if first_page {
                        let results: Vec<Value> = final_store_bags
                            .iter()
                            .map(|(bag_name, size)| json!({"bag_name": bag_name, "size": size}))
                            .collect();
                        json!({"results": results}).to_string()
                    } else {
                        r#"{"results": []}"#.to_string()
                    };
                    respond_json(req, body);
                } else if path == "/files/99" {
                    seen.fetch_add(1, Ordering::SeqCst);
                    req.respond(Response::from_data(FILE_CONTENT.to_vec()))
                        .expect("respond");
                } else {
                    req.respond(Response::from_string("not found").with_status_code(404))
                        .expect("respond");
                }
            }
        });
        (base, downloads, handle)
    }

    /// The `page` query parameter; `per_page` and `page_size` must not
    /// shadow it, so match on whole `key=value` segments.
    fn page_param(url: &str) -> u32 {
        url.split(['?', '&'])
            .find_map(|kv| kv.strip_prefix("page=").and_then(|v| v.parse().ok()))
            .unwrap_or(1)
    }

    fn respond_json(req: tiny_http::Request, body: String) {
        let response = Response::from_string(body).with_header(
            tiny_http::Header::from_bytes("Content-Type", "application/json").expect("header"),
        );
        req.respond(response).expect("respond");
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(5))
    }

    struct Fixture {
        system: SystemConfig,
        catalog: CatalogClient,
        probes: PreservationProbes,
        builder: PackageBuilder,
    }

    #[cfg(unix)]
    fn post_process_script(dir: &Path, code: i32) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(format!("post-{code}.sh"));
        std::fs::write(&path, format!("#!/usr/bin/env sh\nexit {code}\n")).expect("write");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path.to_str().expect("utf8").to_string()
    }

    fn fixture(base: &str, root: &Path, post_process: &str) -> Fixture {
        let preservation = root.join("preservation");
        let curation = root.join("curation");
        std::fs::create_dir_all(&preservation).expect("mkdir");
        std::fs::create_dir_all(&curation).expect("mkdir");

        let system = SystemConfig {
            logs_location: root.join("logs"),
            preservation_storage_location: preservation.clone(),
            curation_storage_location: curation,
            additional_percentage_required: 10,
            bag_name_prefix: "azu".into(),
            post_process_script_command: post_process.into(),
            pre_process_script_command: String::new(),
            dry_run: false,
            continue_on_error: true,
        };
        let catalog = CatalogClient::new(base, "tok", 842, fast_policy()).expect("catalog");
        let final_store = FinalStoreClient::new(
            &format!("{base}/finalstore"),
            "api@example.edu",
            "secret",
            100,
            "edu.example",
            fast_policy(),
        )
        .expect("final store");
        let probes = PreservationProbes {
            final_store,
            staging: None,
            local_root: preservation,
        };
        let builder = PackageBuilder::new("tok", fast_policy()).expect("builder");
        Fixture {
            system,
            catalog,
            probes,
            builder,
        }
    }

    fn seed_curation_v02(root: &Path) {
        let ual = root
            .join("curation/Ada_Smith_1234567/v02/UAL_RDM");
        std::fs::create_dir_all(&ual).expect("mkdir");
        std::fs::write(ual.join("Deposit_Agreement.pdf"), b"agreement").expect("write");
        std::fs::write(ual.join("ReDATA-DepositReview.xlsx"), b"review").expect("write");
        std::fs::write(ual.join("board-Trello.pdf"), b"trello").expect("write");
    }

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn matched_version_is_packaged_and_unmatched_is_skipped() {
        let td = tempdir().expect("tempdir");
        let (base, downloads, handle) = pipeline_server(Vec::new());
        let post = post_process_script(td.path(), 0);
        let fx = fixture(&base, td.path(), &post);
        seed_curation_v02(td.path());

        let driver = IntegrationDriver::new(&fx.system, None);
        let orchestrator = ArticleOrchestrator {
            catalog: &fx.catalog,
            probes: &fx.probes,
            builder: &fx.builder,
            driver: &driver,
            system: &fx.system,
            ids: None,
            run_date: run_date(),
        };

        let mut totals = RunTotals::default();
        let mut reporter = TestReporter::default();
        orchestrator.run(&mut totals, &mut reporter).expect("run");

        assert_eq!(totals.articles_fetched, 1);
        assert_eq!(totals.article_versions_fetched, 2);
        assert_eq!(totals.matched, 1);
        assert_eq!(totals.unmatched, 1);
        assert_eq!(totals.processed, 1);
        assert_eq!(totals.errors, 0);
        assert_eq!(downloads.load(Ordering::SeqCst), 1);

        // The v2 package exists with the full layout; v1 left no trace.
        let fp = fingerprint_reduced(&version_record(&base, 2, true));
        let name = format!("azu_1234567-v02-Smith-{fp}_bag_20250115");
        let v02 = td.path().join("preservation").join(&name).join("v02");
        assert!(v02.join("DATA/99_data.csv").is_file());
        assert!(v02.join("METADATA/1234567.json").is_file());
        assert!(v02.join("UAL_RDM/board-Trello.pdf").is_file());
        assert!(reporter.infos.iter().any(|m| m.contains("1 matched, 1 unmatched")));
        handle.join().expect("join");
    }

    #[cfg(unix)]
    #[test]
    fn version_already_in_final_store_is_never_downloaded() {
        let td = tempdir().expect("tempdir");
        // The final store already holds v2 under its exact fingerprint. The
        // fingerprint covers the reduced fields only, so the base url baked
        // into download_url does not affect it.
        let fp = fingerprint_reduced(&version_record("http://unused.invalid", 2, true));
        let bag = format!("azu_1234567-v02-Smith-{fp}_bag_20250101.tar");
        let (base, downloads, handle) = pipeline_server(vec![(bag, 4096)]);
        let post = post_process_script(td.path(), 0);
        let fx = fixture(&base, td.path(), &post);
        seed_curation_v02(td.path());

        let driver = IntegrationDriver::new(&fx.system, None);
        let orchestrator = ArticleOrchestrator {
            catalog: &fx.catalog,
            probes: &fx.probes,
            builder: &fx.builder,
            driver: &driver,
            system: &fx.system,
            ids: None,
            run_date: run_date(),
        };

        let mut totals = RunTotals::default();
        let mut reporter = TestReporter::default();
        orchestrator.run(&mut totals, &mut reporter).expect("run");

        assert_eq!(totals.ap_trust_preserved_versions, 1);
        assert_eq!(totals.wasabi_preserved_versions, 0);
        assert_eq!(totals.processed, 0);
        assert_eq!(downloads.load(Ordering::SeqCst), 0, "no files downloaded");
        let packages: Vec<_> = std::fs::read_dir(td.path().join("preservation"))
            .expect("read")
            .collect();
        assert!(packages.is_empty(), "no package directory created");
        handle.join().expect("join");
    }

    #[cfg(unix)]
    #[test]
    fn post_processor_code_3_counts_as_duplicate_not_error() {
        let td = tempdir().expect("tempdir");
        let (base, _downloads, handle) = pipeline_server(Vec::new());
        let post = post_process_script(td.path(), 3);
        let fx = fixture(&base, td.path(), &post);
        seed_curation_v02(td.path());

        let driver = IntegrationDriver::new(&fx.system, None);
        let orchestrator = ArticleOrchestrator {
            catalog: &fx.catalog,
            probes: &fx.probes,
            builder: &fx.builder,
            driver: &driver,
            system: &fx.system,
            ids: None,
            run_date: run_date(),
        };

        let mut totals = RunTotals::default();
        let mut reporter = TestReporter::default();
        orchestrator.run(&mut totals, &mut reporter).expect("run is not an error");

        assert_eq!(totals.duplicates, 1);
        assert_eq!(totals.processed, 1);
        assert_eq!(totals.errors, 0);
        handle.join().expect("join");
    }

    #[cfg(unix)]
    #[test]
    fn ids_filter_restricts_processing() {
        let td = tempdir().expect("tempdir");
        let (base, downloads, handle) = pipeline_server(Vec::new());
        let post = post_process_script(td.path(), 0);
        let fx = fixture(&base, td.path(), &post);
        seed_curation_v02(td.path());

        let driver = IntegrationDriver::new(&fx.system, None);
        let ids = [999u64];
        let orchestrator = ArticleOrchestrator {
            catalog: &fx.catalog,
            probes: &fx.probes,
            builder: &fx.builder,
            driver: &driver,
            system: &fx.system,
            ids: Some(&ids),
            run_date: run_date(),
        };

        let mut totals = RunTotals::default();
        let mut reporter = TestReporter::default();
        orchestrator.run(&mut totals, &mut reporter).expect("run");

        assert_eq!(totals.articles_fetched, 0);
        assert_eq!(totals.article_versions_fetched, 0);
        assert_eq!(downloads.load(Ordering::SeqCst), 0);
        handle.join().expect("join");
    }

    #[cfg(unix)]
    #[test]
    fn space_shortfall_aborts_without_continue_on_error() {
        let td = tempdir().expect("tempdir");
        let (base, downloads, handle) = pipeline_server(Vec::new());
        let post = post_process_script(td.path(), 0);
        let mut fx = fixture(&base, td.path(), &post);
        seed_curation_v02(td.path());
        // Demand more slack than any filesystem can offer.
        fx.system.additional_percentage_required = u32::MAX as u64 * 1_000_000;
        fx.system.continue_on_error = false;

        let driver = IntegrationDriver::new(&fx.system, None);
        let orchestrator = ArticleOrchestrator {
            catalog: &fx.catalog,
            probes: &fx.probes,
            builder: &fx.builder,
            driver: &driver,
            system: &fx.system,
            ids: None,
            run_date: run_date(),
        };

        let mut totals = RunTotals::default();
        let mut reporter = TestReporter::default();
        let err = orchestrator
            .run(&mut totals, &mut reporter)
            .expect_err("must abort");
        assert!(err.to_string().contains("not enough space"));
        assert_eq!(downloads.load(Ordering::SeqCst), 0);
        handle.join().expect("join");
    }
}
