//! Assembly of the three preservation probes for one item version.

use std::path::PathBuf;

use anyhow::Result;

use rebach_bagger::wasabi::Wasabi;
use rebach_index::{FinalStoreClient, IndexReport, local_copies, staging_copies};

/// The final store client, the optional staging store connection, and the
/// local preservation root, bundled for the orchestrators.
pub struct PreservationProbes {
    pub final_store: FinalStoreClient,
    /// Absent when no bagger config is available; the staging probe then
    /// reports nothing (the CLI warns about this once at startup).
    pub staging: Option<Wasabi>,
    pub local_root: PathBuf,
}

impl PreservationProbes {
    /// Run all three probes for `(item_id, version)`.
    pub fn gather(&self, item_id: u64, version: u32) -> Result<IndexReport> {
        let final_remote = self.final_store.preserved_copies(item_id, version)?;
        let staging_remote = match &self.staging {
            Some(wasabi) => staging_copies(wasabi, item_id, version)?,
            None => Vec::new(),
        };
        let local = local_copies(&self.local_root, item_id, version)?;
        Ok(IndexReport {
            final_remote,
            staging_remote,
            local,
        })
    }
}
