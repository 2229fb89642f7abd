//! End-of-run summary.

use rebach_types::{Reporter, RunTotals};

/// Log the aggregate counters. The warning/error totals come from the
/// reporter implementation, which has been counting all along.
pub fn report(totals: &RunTotals, warnings: u64, errors: u64, reporter: &mut dyn Reporter) {
    reporter.info(&format!(
        "Total articles fetched: {}. Total articles versions fetched: {}.",
        totals.articles_fetched, totals.article_versions_fetched
    ));
    reporter.info(&format!(
        "Total collections fetched: {}. Total collections versions fetched: {}.",
        totals.collections_fetched, totals.collection_versions_fetched
    ));
    reporter.info(&format!(
        "Curation: {} matched, {} unmatched.",
        totals.matched, totals.unmatched
    ));
    reporter.info(&format!(
        "Already preserved: {} in the final store, {} in the staging store.",
        totals.ap_trust_preserved_versions, totals.wasabi_preserved_versions
    ));
    reporter.info(&format!(
        "Versions processed: {}. Duplicates reported by the post-processor: {}. Skipped: {}.",
        totals.processed, totals.duplicates, totals.skipped
    ));

    let fetched = totals.article_versions_fetched + totals.collection_versions_fetched;
    let handled = totals.processed + totals.skipped;
    if handled < fetched {
        reporter.warn(
            "The number of versions successfully processed is different than the number fetched. \
             Check the log for details.",
        );
    }

    reporter.info(&format!(
        "rebach finished with {warnings} warnings and {errors} errors"
    ));
}
