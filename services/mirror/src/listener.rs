//! Push-driven synchronization from bucket notifications.
//!
//! Three subscriptions feed the mirror: preview images (created and removed),
//! geonames side-files (created) and full-product files (created). Each record
//! is ingested on its own, under the same guard the rescan driver takes.

use crate::key::parent_dir;
use crate::mirror::{Mirror, SideFileKind};
use crate::notifications::{
    NotificationError, NotificationFilter, NotificationRecord, NotificationSource,
    NotificationStream, OBJECT_CREATED, OBJECT_REMOVED,
};
use crate::storage::ObjectInfo;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const PREVIEWS: &str = "previews";
pub const GEONAMES: &str = "geonames";
pub const FULL_PRODUCTS: &str = "full-products";

/// Event time layout used by the bucket
const EVENT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subscription {
    Previews,
    Geonames,
    FullProducts,
}

/// Filters of the subscriptions the current settings call for
pub fn notification_filters(mirror: &Mirror) -> Vec<NotificationFilter> {
    let settings = mirror.settings();
    let mut filters = vec![NotificationFilter::new(
        PREVIEWS,
        settings.preview_filename.as_str(),
        &[OBJECT_CREATED, OBJECT_REMOVED],
    )];

    if let Some(geonames) = &settings.geonames_filename {
        filters.push(NotificationFilter::new(
            GEONAMES,
            format!("/{geonames}"),
            &[OBJECT_CREATED],
        ));
    }
    if let Some(extension) = &settings.full_product_extension {
        filters.push(NotificationFilter::new(
            FULL_PRODUCTS,
            extension.as_str(),
            &[OBJECT_CREATED],
        ));
    }

    filters
}

/// Consume every subscription until cancelled or until all streams end
pub async fn run_listener(
    mirror: Arc<Mirror>,
    source: Arc<dyn NotificationSource>,
    shutdown: CancellationToken,
) -> Result<(), NotificationError> {
    let mut tasks = JoinSet::new();

    for filter in notification_filters(&mirror) {
        let subscription = match filter.name.as_str() {
            GEONAMES => Subscription::Geonames,
            FULL_PRODUCTS => Subscription::FullProducts,
            _ => Subscription::Previews,
        };
        let stream = source.subscribe(filter, shutdown.child_token())?;
        tasks.spawn(consume(Arc::clone(&mirror), subscription, stream, shutdown.clone()));
    }

    info!(subscriptions = tasks.len(), "Notification driver started");

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Notification task ended abnormally");
        }
    }

    info!("Notification driver stopped");
    Ok(())
}

async fn consume(
    mirror: Arc<Mirror>,
    subscription: Subscription,
    mut stream: NotificationStream,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = stream.recv() => item,
        };
        let Some(item) = item else { break };

        match item {
            Ok(record) => handle_record(&mirror, subscription, record).await,
            Err(e) => warn!(subscription = ?subscription, error = %e, "Notification error"),
        }
    }

    debug!(subscription = ?subscription, "Notification stream ended");
}

#[instrument(skip(mirror, record), fields(key = %record.object_key, event = %record.event_name))]
async fn handle_record(
    mirror: &Arc<Mirror>,
    subscription: Subscription,
    record: NotificationRecord,
) {
    let object = ObjectInfo {
        last_modified: parse_event_time(&record.event_time),
        key: record.object_key.clone(),
        size: record.object_size,
    };

    match subscription {
        Subscription::Previews if record.is_removed() => {
            let _ingestion = mirror.lock_ingestion().await;
            if let Err(e) = mirror.remove_image(&object.key).await {
                warn!(error = %e, "Failed to remove image");
            }
        }

        Subscription::Previews if record.is_created() => {
            if mirror.matcher().classify(&object.key).is_none() {
                debug!("Preview does not match any image type");
                return;
            }
            let _ingestion = mirror.lock_ingestion().await;
            match mirror.ingest_image(&object).await {
                Ok(outcome) => debug!(outcome = ?outcome, "Ingested notified image"),
                Err(e) if e.is_not_found() => debug!("Notified image is already gone"),
                Err(e) => warn!(error = %e, "Failed to ingest notified image"),
            }
        }

        Subscription::Previews => debug!("Ignoring preview event"),

        Subscription::Geonames => {
            let _ingestion = mirror.lock_ingestion().await;
            match mirror.ingest_side_file(&object, SideFileKind::Geonames).await {
                Ok(Some(link)) => {
                    if let Some(dir) = parent_dir(&object.key) {
                        mirror.links().append_unique(dir, link);
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_not_found() => debug!("Notified geonames file is already gone"),
                Err(e) => warn!(error = %e, "Failed to ingest notified geonames file"),
            }
        }

        Subscription::FullProducts => {
            let _ingestion = mirror.lock_ingestion().await;
            if mirror.add_full_product_link(&object.key).await {
                debug!("Added full product link");
            }
        }
    }
}

/// Event time of a record, now when it cannot be decoded
pub fn parse_event_time(raw: &str) -> DateTime<Utc> {
    match NaiveDateTime::parse_from_str(raw, EVENT_TIME_FORMAT) {
        Ok(naive) => naive.and_utc(),
        Err(e) => {
            warn!(event_time = %raw, error = %e, "Undecodable event time, using now");
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DomainEvent;
    use crate::key::FormattedKey;
    use crate::mirror::test_support::mirror;
    use crate::notifications::channel::ChannelNotificationSource;
    use crate::storage::memory::MemoryObjectStore;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Duration;

    const IMAGE: &str = "OPTICAL/a/b/preview.jpg";
    const HOUR: Duration = Duration::from_secs(3600);

    fn recent() -> DateTime<Utc> {
        DateTime::from_timestamp(Utc::now().timestamp() - 60, 0).unwrap()
    }

    fn record(event_name: &str, key: &str, at: DateTime<Utc>) -> NotificationRecord {
        NotificationRecord {
            event_name: event_name.to_string(),
            object_key: key.to_string(),
            object_size: 8,
            event_time: at.format(EVENT_TIME_FORMAT).to_string(),
        }
    }

    // Sends every record, closes the streams and runs the driver to completion
    async fn run_with(mirror: &Arc<Mirror>, items: Vec<(&'static str, NotificationRecord)>) {
        let source = Arc::new(ChannelNotificationSource::new(&[PREVIEWS, GEONAMES, FULL_PRODUCTS]));
        for (name, record) in items {
            source.sender(name).send(Ok(record)).await.unwrap();
        }
        source.close();

        tokio::time::timeout(
            Duration::from_secs(5),
            run_listener(Arc::clone(mirror), source, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[test]
    fn test_parse_event_time() {
        assert_eq!(
            parse_event_time("2024-01-15T10:30:00.250Z"),
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
                + ChronoDuration::milliseconds(250)
        );

        let before = Utc::now();
        let fallback = parse_event_time("yesterday-ish");
        assert!(fallback >= before);
    }

    #[tokio::test]
    async fn test_filters_follow_settings() {
        let dir = tempfile::tempdir().unwrap();
        let (mirror, _events) = mirror(Arc::new(MemoryObjectStore::new()), dir.path(), HOUR);

        let filters = notification_filters(&mirror);
        let names: Vec<&str> = filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![PREVIEWS, GEONAMES, FULL_PRODUCTS]);
        assert_eq!(filters[1].suffix, "/geonames.json");
        assert_eq!(filters[2].suffix, ".tif");
    }

    #[tokio::test]
    async fn test_created_preview_is_added_with_event_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let at = recent();
        store.put(IMAGE, vec![0u8; 8], at);
        let (mirror, mut events) = mirror(store, dir.path(), HOUR);

        run_with(&mirror, vec![(PREVIEWS, record("s3:ObjectCreated:Put", IMAGE, at))]).await;

        let cached = mirror.images().find_by_key(IMAGE).unwrap();
        assert_eq!(cached.last_modified, at);
        assert!(matches!(events.recv().await.unwrap(), DomainEvent::ImageAdded(_)));
    }

    #[tokio::test]
    async fn test_removed_preview_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.put(IMAGE, vec![0u8; 8], recent());
        let (mirror, mut events) = mirror(store, dir.path(), HOUR);

        run_with(
            &mirror,
            vec![
                (PREVIEWS, record("s3:ObjectCreated:Put", IMAGE, recent())),
                (PREVIEWS, record("s3:ObjectRemoved:Delete", IMAGE, recent())),
            ],
        )
        .await;

        assert!(mirror.images().is_empty());
        assert!(matches!(events.recv().await.unwrap(), DomainEvent::ImageAdded(_)));
        assert_eq!(
            events.recv().await.unwrap(),
            DomainEvent::ImageRemoved {
                img_key: FormattedKey::encode(IMAGE).unwrap()
            }
        );
    }

    #[tokio::test]
    async fn test_unclassified_preview_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.put("RADAR/x/preview.jpg", vec![0u8; 8], recent());
        let (mirror, mut events) = mirror(store.clone(), dir.path(), HOUR);

        run_with(
            &mirror,
            vec![(PREVIEWS, record("s3:ObjectCreated:Put", "RADAR/x/preview.jpg", recent()))],
        )
        .await;

        assert!(mirror.images().is_empty());
        assert_eq!(store.fetch_count(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_geonames_and_full_product_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.put(IMAGE, vec![0u8; 8], recent());
        store.put(
            "OPTICAL/a/b/geonames.json",
            br#"[{"name": "Italy", "states": [{"name": "Lazio"}]}]"#.to_vec(),
            recent(),
        );
        let (mirror, mut events) = mirror(store, dir.path(), HOUR);

        run_with(
            &mirror,
            vec![
                (PREVIEWS, record("s3:ObjectCreated:Put", IMAGE, recent())),
                (GEONAMES, record("s3:ObjectCreated:Put", "OPTICAL/a/b/geonames.json", recent())),
                (FULL_PRODUCTS, record("s3:ObjectCreated:Put", "OPTICAL/a/b/full.tif", recent())),
            ],
        )
        .await;

        // Streams are consumed concurrently, so only the final state is checked
        assert_eq!(mirror.geonames().len(), 1);
        let links = mirror.links().get("OPTICAL/a/b").unwrap();
        assert!(links.contains(&"/cache/OPTICAL@a@b/geonames.json".to_string()));

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        assert!(kinds.contains(&"ADD"));
    }

    #[tokio::test]
    async fn test_stream_errors_do_not_stop_the_driver() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.put(IMAGE, vec![0u8; 8], recent());
        let (mirror, _events) = mirror(store, dir.path(), HOUR);

        let source = Arc::new(ChannelNotificationSource::new(&[PREVIEWS, GEONAMES, FULL_PRODUCTS]));
        let previews = source.sender(PREVIEWS);
        previews.send(Err(NotificationError::EmptyPayload)).await.unwrap();
        previews
            .send(Ok(record("s3:ObjectCreated:Put", IMAGE, recent())))
            .await
            .unwrap();
        drop(previews);
        source.close();

        run_listener(Arc::clone(&mirror), source, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(mirror.images().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_subscription_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mirror, _events) = mirror(Arc::new(MemoryObjectStore::new()), dir.path(), HOUR);

        let source = Arc::new(ChannelNotificationSource::new(&[PREVIEWS]));
        let err = run_listener(mirror, source, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::NotConfigured(_)));
    }
}
