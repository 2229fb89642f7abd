//! Space preflight for the preservation filesystem.
//!
//! Run after curation matching so only versions that will actually be
//! packaged contribute: required bytes are the matched versions' remote file
//! sizes plus their curation `UAL_RDM` bytes, multiplied by the configured
//! slack factor.

use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

#[derive(Debug, Error)]
#[error(
    "not enough space on the preservation storage: required {required} bytes, available {available}"
)]
pub struct SpaceShortfall {
    pub required: u64,
    pub available: u64,
}

/// Apply the slack factor to the raw payload estimate.
pub fn required_bytes(payload_bytes: u64, slack_factor: f64) -> u64 {
    (payload_bytes as f64 * slack_factor).ceil() as u64
}

/// Free bytes on the filesystem holding the preservation root.
pub fn available_bytes(root: &Path) -> Result<u64> {
    fs2::available_space(root).with_context(|| {
        format!(
            "failed to query free space of the preservation storage: {}",
            root.display()
        )
    })
}

/// Fail when the preservation filesystem cannot hold `required` bytes.
pub fn check_space(root: &Path, required: u64) -> Result<Result<(), SpaceShortfall>> {
    let available = available_bytes(root)?;
    if available < required {
        Ok(Err(SpaceShortfall {
            required,
            available,
        }))
    } else {
        Ok(Ok(()))
    }
}
