//! Periodic full rescan of the bucket.

use crate::key::parent_dir;
use crate::mirror::{within_retention, IngestOutcome, Mirror, SyncError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Counts gathered during one rescan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RescanReport {
    /// Objects matching an image type
    pub images_seen: usize,
    pub added: usize,
    pub updated: usize,
    /// Matching objects older than the retention period
    pub expired: usize,
    pub failed: usize,
    pub directories: usize,
}

/// List every image type prefix, ingest new and changed images, then scan
/// their directories for side-files and rebuild the full-product links
///
/// A listing failure aborts the rescan before the link cache is touched.
#[instrument(skip(mirror))]
pub async fn rescan_once(mirror: &Arc<Mirror>) -> Result<RescanReport, SyncError> {
    let _ingestion = mirror.lock_ingestion().await;
    let retention = mirror.settings().retention;
    let mut report = RescanReport::default();
    let mut directories = BTreeSet::new();

    for image_type in mirror.matcher().types() {
        let prefix = &image_type.product_prefix;
        let objects = mirror
            .store()
            .list_objects(prefix)
            .await
            .map_err(|source| SyncError::Listing {
                prefix: prefix.clone(),
                source,
            })?;

        for object in objects.iter().filter(|o| image_type.matches(&o.key)) {
            report.images_seen += 1;

            if !within_retention(object.last_modified, retention) {
                debug!(
                    key = %object.key,
                    modified = %object.last_modified,
                    "Skipping expired image"
                );
                report.expired += 1;
                continue;
            }

            match mirror.ingest_image(object).await {
                Ok(IngestOutcome::Added) => report.added += 1,
                Ok(IngestOutcome::Updated) => report.updated += 1,
                Ok(IngestOutcome::Unchanged) => {}
                Err(e) if e.is_not_found() => {
                    debug!(key = %object.key, "Image vanished before fetch");
                    continue;
                }
                Err(e) => {
                    warn!(key = %object.key, error = %e, "Failed to ingest image");
                    report.failed += 1;
                    continue;
                }
            }

            if let Some(dir) = parent_dir(&object.key) {
                directories.insert(dir.to_string());
            }
        }
    }

    let mut links = HashMap::new();
    for dir in &directories {
        let dir_links = mirror.scan_directory(dir).await?;
        if !dir_links.is_empty() {
            links.insert(dir.clone(), dir_links);
        }
    }
    mirror.links().replace_all(links);

    report.directories = directories.len();
    metrics::counter!("mirror.rescans").increment(1);
    info!(
        seen = report.images_seen,
        added = report.added,
        updated = report.updated,
        expired = report.expired,
        failed = report.failed,
        directories = report.directories,
        "Rescan complete"
    );

    Ok(report)
}

/// Rescan every `period` until cancelled
///
/// The first tick waits a full period: callers run the initial scan themselves.
/// With `exit_on_error` a failed rescan ends the loop with its error, otherwise
/// the next tick is the retry.
pub async fn run_rescan_loop(
    mirror: Arc<Mirror>,
    period: Duration,
    exit_on_error: bool,
    shutdown: CancellationToken,
) -> Result<(), SyncError> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(period_secs = period.as_secs_f64(), "Rescan driver started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Rescan driver stopped");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        if let Err(e) = rescan_once(&mirror).await {
            if exit_on_error {
                error!(error = %e, "Rescan failed, stopping");
                return Err(e);
            }
            if e.is_retryable() {
                warn!(error = %e, "Rescan failed, retrying next period");
            } else {
                error!(error = %e, "Rescan failed, retrying next period");
            }
        }
    }
}
