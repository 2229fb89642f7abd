//! Preservation index: three probes answering "is this item-version already
//! preserved somewhere?"
//!
//! - the **final remote store** (the archival registry), listed page by page
//!   filtered to the institution's alt-identifier prefix;
//! - the **staging remote store**, listed through the S3-compatible CLI;
//! - the **local preservation tree**, scanned for package directories.
//!
//! Each probe returns `(fingerprint, size)` pairs for the `(id, vNN)` under
//! consideration; the decision rule compares the current fingerprint against
//! them. A hit in either remote store means the version is already
//! preserved and must not be repackaged; a local-only hit is handed to the
//! package builder's idempotent re-verification instead.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use rebach_bagger::wasabi::{Wasabi, entries_from_listing};
use rebach_retry::{AttemptError, RetryPolicy};
use rebach_types::{
    Fingerprint, PreservedCopy, Reporter, StoreOrigin, naming,
};

/// User agent for final-store registry requests.
pub const USER_AGENT: &str = concat!("rebach/", env!("CARGO_PKG_VERSION"));

/// One row of the final store's object listing.
#[derive(Debug, Clone, Deserialize)]
struct RegistryObject {
    bag_name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryPage {
    results: Vec<RegistryObject>,
}

/// Client for the final preservation registry.
#[derive(Debug, Clone)]
pub struct FinalStoreClient {
    url: String,
    user: String,
    token: String,
    items_per_page: u32,
    alt_identifier_prefix: String,
    policy: RetryPolicy,
    client: reqwest::blocking::Client,
}

impl FinalStoreClient {
    pub fn new(
        url: &str,
        user: &str,
        token: &str,
        items_per_page: u32,
        alt_identifier_prefix: &str,
        policy: RetryPolicy,
    ) -> Result<Self> {
        // The configured wait doubles as the per-attempt deadline, floored
        // so a sub-second wait cannot starve the request itself.
        let timeout = policy.wait.max(Duration::from_secs(1));
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build final-store HTTP client")?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            token: token.to_string(),
            items_per_page: items_per_page.max(1),
            alt_identifier_prefix: alt_identifier_prefix.to_string(),
            policy,
            client,
        })
    }

    /// Preserved copies of `(item_id, version)` in the final store.
    /// Paginates until an empty page.
    pub fn preserved_copies(&self, item_id: u64, version: u32) -> Result<Vec<PreservedCopy>> {
        let mut copies = Vec::new();
        let mut page = 1u32;
        loop {
            let objects = self.fetch_page(page)?;
            if objects.is_empty() {
                break;
            }
            for object in &objects {
                if !naming::mentions_item_version(&object.bag_name, item_id, version) {
                    continue;
                }
                if let Some(fp) = naming::extract_fingerprint(&object.bag_name) {
                    copies.push(PreservedCopy {
                        fingerprint: fp.to_string(),
                        size: object.size,
                        origin: StoreOrigin::FinalRemote,
                    });
                }
            }
            page += 1;
        }
        Ok(copies)
    }

    fn fetch_page(&self, page: u32) -> Result<Vec<RegistryObject>> {
        let page_str = page.to_string();
        let per_page = self.items_per_page.to_string();
        let parsed: RegistryPage = self
            .policy
            .run(|attempt| {
                let response = self
                    .client
                    .get(&self.url)
                    .query(&[
                        ("page", page_str.as_str()),
                        ("per_page", per_page.as_str()),
                        (
                            "alt_identifier__starts_with",
                            self.alt_identifier_prefix.as_str(),
                        ),
                    ])
                    .header("X-Pharos-API-User", &self.user)
                    .header("X-Pharos-API-Key", &self.token)
                    .send()
                    .map_err(|e| {
                        AttemptError::transient(anyhow!(
                            "final store request failed: {e} (try {attempt})"
                        ))
                    })?;
                let status = response.status();
                if status.is_success() {
                    response.json::<RegistryPage>().map_err(|e| {
                        AttemptError::transient(anyhow!("invalid final store JSON: {e}"))
                    })
                } else {
                    Err(AttemptError::from_status(
                        status.as_u16(),
                        anyhow!("final store returned status {status} (try {attempt})"),
                    ))
                }
            })
            .map_err(|e| e.error)?;
        Ok(parsed.results)
    }
}

/// Preserved copies of `(item_id, version)` in the staging store, from one
/// bucket listing.
pub fn staging_copies(wasabi: &Wasabi, item_id: u64, version: u32) -> Result<Vec<PreservedCopy>> {
    let listing = wasabi.list_bucket(&wasabi.bucket_url())?;
    if listing.has_errors() {
        let detail: Vec<&str> = listing.error_lines().collect();
        anyhow::bail!("staging store listing failed: {}", detail.join("; "));
    }
    Ok(entries_from_listing(&listing.stdout)
        .into_iter()
        .filter(|(name, _)| naming::mentions_item_version(name, item_id, version))
        .filter_map(|(name, size)| {
            naming::extract_fingerprint(&name).map(|fp| PreservedCopy {
                fingerprint: fp.to_string(),
                size,
                origin: StoreOrigin::StagingRemote,
            })
        })
        .collect())
}

/// Preserved copies of `(item_id, version)` in the local preservation tree.
pub fn local_copies(root: &Path, item_id: u64, version: u32) -> Result<Vec<PreservedCopy>> {
    let mut copies = Vec::new();
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("failed to scan preservation root: {}", root.display()))?;
    for entry in entries {
        let entry = entry.context("failed to read preservation root entry")?;
        if !entry.path().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !naming::is_local_bag_name(&name)
            || !naming::mentions_item_version(&name, item_id, version)
        {
            continue;
        }
        if let Some(fp) = naming::extract_fingerprint(&name) {
            copies.push(PreservedCopy {
                fingerprint: fp.to_string(),
                size: directory_bytes(&entry.path())?,
                origin: StoreOrigin::Local,
            });
        }
    }
    Ok(copies)
}

/// Total bytes of all regular files under a directory.
pub fn directory_bytes(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("failed to read directory: {}", path.display()))?
    {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += directory_bytes(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

/// The three probe results for one item version.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub final_remote: Vec<PreservedCopy>,
    pub staging_remote: Vec<PreservedCopy>,
    pub local: Vec<PreservedCopy>,
}

/// The skip decision for one item version.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeDecision {
    pub in_final: bool,
    pub in_staging: bool,
    pub in_local: bool,
}

impl ProbeDecision {
    /// A hit in either remote store means: do not repackage.
    pub fn already_preserved(&self) -> bool {
        self.in_final || self.in_staging
    }
}

impl IndexReport {
    /// Apply the decision rule: match the fingerprint against each store,
    /// warn on multiple same-store hits and on a final-store size
    /// disagreement (which still skips).
    pub fn decide(
        &self,
        item_id: u64,
        version: u32,
        fingerprint: &Fingerprint,
        expected_size: u64,
        reporter: &mut dyn Reporter,
    ) -> ProbeDecision {
        for (copies, store) in [
            (&self.final_remote, "final remote store"),
            (&self.staging_remote, "staging remote store"),
            (&self.local, "local preservation tree"),
        ] {
            if copies.len() > 1 {
                reporter.warn(&format!(
                    "{item_id} v{version}: multiple preserved copies in the {store}"
                ));
            }
        }

        let matches =
            |copies: &[PreservedCopy]| copies.iter().any(|c| c.fingerprint == fingerprint.as_str());

        let decision = ProbeDecision {
            in_final: matches(&self.final_remote),
            in_staging: matches(&self.staging_remote),
            in_local: matches(&self.local),
        };

        if decision.in_final {
            if let Some(copy) = self
                .final_remote
                .iter()
                .find(|c| c.fingerprint == fingerprint.as_str())
            {
                if copy.size != expected_size {
                    reporter.warn(&format!(
                        "{item_id} v{version}: preserved size {} differs from computed size {expected_size}; skipping anyway",
                        copy.size
                    ));
                }
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tiny_http::{Response, Server};

    use rebach_types::NullReporter;

    use super::*;

    const FP: &str = "0a1b2c3d4e5f60718293a4b5c6d7e8f9";

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(5))
    }

    fn json_response(body: String) -> Response<std::io::Cursor<Vec<u8>>> {
        Response::from_string(body).with_header(
            tiny_http::Header::from_bytes("Content-Type", "application/json").expect("header"),
        )
    }

    #[test]
    fn final_store_paginates_and_matches() {
        let server = Server::http("127.0.0.1:0").expect("server");
        let base = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            for _ in 0..2 {
                let Ok(Some(req)) = server.recv_timeout(Duration::from_secs(5)) else {
                    break;
                };
                let url = req.url().to_string();
                assert!(url.contains("alt_identifier__starts_with=edu.example"));
                let user_header = req
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("X-Pharos-API-User"))
                    .map(|h| h.value.as_str().to_string());
                assert_eq!(user_header.as_deref(), Some("api@example.edu"));

                // Match the page parameter on a whole segment; `per_page=100`
                // contains the substring `page=1`.
                let first_page = url
                    .split(['?', '&'])
                    .any(|kv| kv == "page=1");
                let body = if first_page {
                    format!(
                        r#"{{"results": [
                            {{"bag_name": "azu_1234567-v02-Smith-{FP}_bag_20250101.tar", "size": 2048}},
                            {{"bag_name": "azu_9999999-v01-Jones-{FP}_bag_20250101.tar", "size": 4096}}
                        ]}}"#
                    )
                } else {
                    r#"{"results": []}"#.to_string()
                };
                req.respond(json_response(body)).expect("respond");
            }
        });

        let client = FinalStoreClient::new(
            &base,
            "api@example.edu",
            "secret",
            100,
            "edu.example",
            fast_policy(),
        )
        .expect("client");
        let copies = client.preserved_copies(1234567, 2).expect("copies");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].fingerprint, FP);
        assert_eq!(copies[0].size, 2048);
        assert_eq!(copies[0].origin, StoreOrigin::FinalRemote);
        handle.join().expect("join");
    }

    #[test]
    fn local_probe_matches_package_directories() {
        let td = tempfile::tempdir().expect("tempdir");
        let hit = td
            .path()
            .join(format!("azu_1234567-v02-Smith-{FP}_bag_20250101"));
        std::fs::create_dir_all(hit.join("v02/DATA")).expect("mkdir");
        std::fs::write(hit.join("v02/DATA/1_a.bin"), vec![0u8; 100]).expect("write");
        // Same item, different version: must not match.
        std::fs::create_dir_all(
            td.path()
                .join(format!("azu_1234567-v03-Smith-{FP}_bag_20250101")),
        )
        .expect("mkdir");
        // Foreign directory: ignored.
        std::fs::create_dir_all(td.path().join("lost+found")).expect("mkdir");

        let copies = local_copies(td.path(), 1234567, 2).expect("copies");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].fingerprint, FP);
        assert_eq!(copies[0].size, 100);
        assert_eq!(copies[0].origin, StoreOrigin::Local);
    }

    #[test]
    fn directory_bytes_recurses() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(td.path().join("a/b")).expect("mkdir");
        std::fs::write(td.path().join("a/x"), vec![0u8; 10]).expect("write");
        std::fs::write(td.path().join("a/b/y"), vec![0u8; 32]).expect("write");
        assert_eq!(directory_bytes(td.path()).expect("bytes"), 42);
    }

    #[test]
    fn decision_skips_on_either_remote() {
        let fp = Fingerprint::parse(FP).unwrap();
        let copy = |origin| PreservedCopy {
            fingerprint: FP.to_string(),
            size: 10,
            origin,
        };

        let mut reporter = NullReporter;
        let report = IndexReport {
            final_remote: vec![copy(StoreOrigin::FinalRemote)],
            ..Default::default()
        };
        assert!(report.decide(1, 1, &fp, 10, &mut reporter).already_preserved());

        let report = IndexReport {
            staging_remote: vec![copy(StoreOrigin::StagingRemote)],
            ..Default::default()
        };
        let decision = report.decide(1, 1, &fp, 10, &mut reporter);
        assert!(decision.already_preserved());
        assert!(decision.in_staging && !decision.in_final);

        let report = IndexReport {
            local: vec![copy(StoreOrigin::Local)],
            ..Default::default()
        };
        let decision = report.decide(1, 1, &fp, 10, &mut reporter);
        assert!(!decision.already_preserved());
        assert!(decision.in_local);
    }

    #[test]
    fn decision_warns_on_final_size_mismatch_but_still_skips() {
        struct CollectingReporter(Vec<String>);
        impl Reporter for CollectingReporter {
            fn info(&mut self, _msg: &str) {}
            fn warn(&mut self, msg: &str) {
                self.0.push(msg.to_string());
            }
            fn error(&mut self, _msg: &str) {}
        }

        let fp = Fingerprint::parse(FP).unwrap();
        let report = IndexReport {
            final_remote: vec![PreservedCopy {
                fingerprint: FP.to_string(),
                size: 999,
                origin: StoreOrigin::FinalRemote,
            }],
            ..Default::default()
        };
        let mut reporter = CollectingReporter(Vec::new());
        let decision = report.decide(1234567, 2, &fp, 2048, &mut reporter);
        assert!(decision.already_preserved());
        assert!(reporter.0.iter().any(|w| w.contains("differs")));
    }

    #[test]
    fn mismatched_fingerprint_does_not_skip() {
        let fp = Fingerprint::parse("ffffffffffffffffffffffffffffffff").unwrap();
        let report = IndexReport {
            final_remote: vec![PreservedCopy {
                fingerprint: FP.to_string(),
                size: 10,
                origin: StoreOrigin::FinalRemote,
            }],
            ..Default::default()
        };
        let mut reporter = NullReporter;
        assert!(!report.decide(1, 1, &fp, 10, &mut reporter).already_preserved());
    }
}
