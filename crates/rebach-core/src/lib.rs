//! Orchestration of the preservation pipeline.
//!
//! The article and collection orchestrators drive the whole flow for one
//! run: catalog traversal, fingerprinting, the three preservation probes,
//! curation matching, the space preflight, package building, and the
//! post-processor. Everything is serial by design (a package directory is
//! only ever touched by one logical task) and lower layers return outcome
//! values rather than aborting; only configuration and space failures may
//! end the run.

pub mod article;
pub mod collection;
pub mod integration;
pub mod probes;
pub mod space;
pub mod summary;

pub use article::ArticleOrchestrator;
pub use collection::CollectionOrchestrator;
pub use integration::{DEFAULT_BAGGER_CONFIG_PATH, IntegrationDriver, PostProcessOutcome};
pub use probes::PreservationProbes;
