//! Shared mirror state and the per-object ingestion both sync drivers go through.

use crate::config::Config;
use crate::event::DomainEvent;
use crate::hub::EventSender;
use crate::image_cache::ImageCache;
use crate::image_type::ImageTypeMatcher;
use crate::key::{file_name, parent_dir, FormattedKey, KeyError};
use crate::metadata::{
    parse_geonames, parse_localization, read_side_file, Features, FeaturesParser, Geonames,
    Localization, ParseError,
};
use crate::metadata_cache::{LinkCache, MetadataCache, ProductFile};
use crate::storage::{ObjectInfo, ObjectStore, StorageError};
use crate::timers::EvictionTimers;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

/// Timer keys of thumbnails live in their own namespace
const THUMBNAIL_TIMER_PREFIX: &str = "thumbnails/";

/// Errors raised while synchronizing the mirror with the bucket
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to list {prefix}: {source}")]
    Listing {
        prefix: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Cache directory error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    /// Listing failures abort a whole rescan
    pub fn is_listing(&self) -> bool {
        matches!(self, SyncError::Listing { .. })
    }

    /// Whether the backend may answer on a later cycle
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Listing { source, .. } | SyncError::Storage(source) => source.is_retryable(),
            _ => false,
        }
    }

    /// Objects that vanished between listing and fetch are not failures
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::Storage(e) => e.is_not_found(),
            SyncError::Parse(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Result of ingesting one image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Added,
    Updated,
    Unchanged,
}

/// Kinds of non-image files found next to images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideFileKind {
    Geonames,
    Localization,
    Features,
    FullProduct,
    AdditionalProduct,
}

/// Runtime settings of the mirror, compiled from configuration
#[derive(Debug, Clone)]
pub struct MirrorSettings {
    pub retention: Duration,
    pub preview_filename: String,
    pub geonames_filename: Option<String>,
    pub localization_filename: Option<String>,
    pub features_pattern: Option<Regex>,
    pub features_parser: FeaturesParser,
    pub full_product_extension: Option<String>,
    pub full_product_protocol: String,
    pub full_product_root_url: String,
    pub full_product_signed_url: bool,
    pub presigned_url_expiry: Duration,
    pub additional_files_pattern: Option<Regex>,
    /// Path prefix of generated cache links
    pub base_path: String,
    pub max_display_count: usize,
}

impl MirrorSettings {
    pub fn from_config(config: &Config) -> Result<Self, regex::Error> {
        let files = &config.files;

        Ok(Self {
            retention: config.retention(),
            preview_filename: files.preview_filename.clone(),
            geonames_filename: files.geonames_filename.clone().filter(|f| !f.is_empty()),
            localization_filename: files.localization_filename.clone().filter(|f| !f.is_empty()),
            features_pattern: files.features_regexp.as_deref().map(Regex::new).transpose()?,
            features_parser: FeaturesParser::new(
                files.features_category_name.clone(),
                files.features_class_name.clone(),
            ),
            full_product_extension: files.full_product_extension.clone().filter(|f| !f.is_empty()),
            full_product_protocol: files.full_product_protocol.clone(),
            full_product_root_url: files.full_product_root_url.clone(),
            full_product_signed_url: files.full_product_signed_url,
            presigned_url_expiry: config.presigned_url_expiry(),
            additional_files_pattern: files
                .additional_product_files_regexp
                .as_deref()
                .map(Regex::new)
                .transpose()?,
            base_path: config.api.base_path.trim_end_matches('/').to_string(),
            max_display_count: config.cache.max_images_display_count,
        })
    }

    /// Which side-file, if any, a bucket key is
    pub fn classify_side_file(&self, s3_key: &str) -> Option<SideFileKind> {
        let name = file_name(s3_key);

        if self.geonames_filename.as_deref() == Some(name) {
            Some(SideFileKind::Geonames)
        } else if self.localization_filename.as_deref() == Some(name) {
            Some(SideFileKind::Localization)
        } else if self.features_pattern.as_ref().is_some_and(|p| p.is_match(s3_key)) {
            Some(SideFileKind::Features)
        } else if self
            .full_product_extension
            .as_deref()
            .is_some_and(|ext| s3_key.ends_with(ext))
        {
            Some(SideFileKind::FullProduct)
        } else if self
            .additional_files_pattern
            .as_ref()
            .is_some_and(|p| p.is_match(s3_key))
        {
            Some(SideFileKind::AdditionalProduct)
        } else {
            None
        }
    }
}

/// Everything known about one cached image
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfos {
    pub date: String,
    pub links: Vec<String>,
    /// Multi-line geonames rendering
    pub geonames: String,
    pub localization: Option<Localization>,
    pub features: Features,
    pub thumbnails: Vec<String>,
}

/// The live mirror of the bucket
pub struct Mirror {
    settings: MirrorSettings,
    store: Arc<dyn ObjectStore>,
    matcher: Arc<ImageTypeMatcher>,
    cache_root: PathBuf,
    images: ImageCache,
    thumbnails: ImageCache,
    timers: EvictionTimers,
    geonames: MetadataCache<Geonames>,
    localizations: MetadataCache<Localization>,
    features: MetadataCache<Features>,
    product_files: MetadataCache<ProductFile>,
    links: LinkCache,
    events: EventSender,
    /// Serializes per-object ingestion across drivers and reload
    ingestion: tokio::sync::Mutex<()>,
}

impl Mirror {
    pub fn new(
        settings: MirrorSettings,
        store: Arc<dyn ObjectStore>,
        matcher: Arc<ImageTypeMatcher>,
        cache_root: impl Into<PathBuf>,
        events: EventSender,
    ) -> Arc<Self> {
        let cache_root = cache_root.into();

        Arc::new(Self {
            images: ImageCache::new(cache_root.join("main"), Arc::clone(&matcher)),
            thumbnails: ImageCache::new(cache_root.join("thumbnails"), Arc::clone(&matcher)),
            settings,
            store,
            matcher,
            cache_root,
            timers: EvictionTimers::new(),
            geonames: MetadataCache::new(),
            localizations: MetadataCache::new(),
            features: MetadataCache::new(),
            product_files: MetadataCache::new(),
            links: LinkCache::new(),
            events,
            ingestion: tokio::sync::Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &MirrorSettings {
        &self.settings
    }

    pub fn matcher(&self) -> &ImageTypeMatcher {
        &self.matcher
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn thumbnails(&self) -> &ImageCache {
        &self.thumbnails
    }

    pub fn timers(&self) -> &EvictionTimers {
        &self.timers
    }

    pub fn geonames(&self) -> &MetadataCache<Geonames> {
        &self.geonames
    }

    pub fn localizations(&self) -> &MetadataCache<Localization> {
        &self.localizations
    }

    pub fn features(&self) -> &MetadataCache<Features> {
        &self.features
    }

    pub fn product_files(&self) -> &MetadataCache<ProductFile> {
        &self.product_files
    }

    pub fn links(&self) -> &LinkCache {
        &self.links
    }

    /// Hold while ingesting so drivers and reload never interleave
    pub async fn lock_ingestion(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ingestion.lock().await
    }

    /// Create the main and thumbnails directories
    pub fn prepare_dirs(&self) -> Result<(), SyncError> {
        for dir in [self.images.root(), self.thumbnails.root()] {
            std::fs::create_dir_all(dir).map_err(|source| SyncError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Rebuild the image caches from files left by a previous run
    ///
    /// Every rebuilt record gets an eviction timer for its remaining retention.
    pub fn rebuild_from_disk(self: &Arc<Self>) -> Result<usize, SyncError> {
        self.prepare_dirs()?;
        let retention = self.settings.retention;
        let mut rebuilt = 0;

        for (cache, is_thumbnail) in [(&self.images, false), (&self.thumbnails, true)] {
            let records = cache
                .load_from_disk(retention, &self.settings.preview_filename)
                .map_err(|source| SyncError::Io {
                    path: cache.root().to_path_buf(),
                    source,
                })?;

            for record in records {
                let age = (Utc::now() - record.last_modified).to_std().unwrap_or_default();
                let remaining = retention.saturating_sub(age);
                if is_thumbnail {
                    self.schedule_thumbnail_eviction(record.formatted_key, remaining);
                } else {
                    self.schedule_image_eviction(record.formatted_key, remaining);
                }
                rebuilt += 1;
            }
        }

        info!(
            images = self.images.len(),
            thumbnails = self.thumbnails.len(),
            "Rebuilt cache from disk"
        );
        Ok(rebuilt)
    }

    /// Fetch a new or changed image into the main cache
    #[instrument(skip(self, object), fields(key = %object.key))]
    pub async fn ingest_image(
        self: &Arc<Self>,
        object: &ObjectInfo,
    ) -> Result<IngestOutcome, SyncError> {
        let outcome = match self.images.find_by_key(&object.key) {
            Some(record) if object.last_modified <= record.last_modified => {
                return Ok(IngestOutcome::Unchanged)
            }
            Some(_) => IngestOutcome::Updated,
            None => IngestOutcome::Added,
        };

        let formatted = FormattedKey::encode(&object.key)?;
        debug!(size = object.size, outcome = ?outcome, "Fetching image");
        self.fetch(&object.key, &self.images.path_for(&formatted), object.last_modified)
            .await?;

        // The record may have been evicted while the fetch was in flight
        let outcome = if self.images.refresh(&object.key, object.size, object.last_modified) {
            IngestOutcome::Updated
        } else {
            self.images.add(&object.key, object.size, object.last_modified)?;
            IngestOutcome::Added
        };
        self.attach_known_metadata(&object.key, &formatted);

        if let Some(record) = self.images.find_by_formatted_key(&formatted) {
            let payload = record.to_payload();
            self.emit(match outcome {
                IngestOutcome::Added => DomainEvent::ImageAdded(payload),
                _ => DomainEvent::ImageUpdated(payload),
            })
            .await;
        }

        self.schedule_image_eviction(formatted, self.settings.retention);
        Ok(outcome)
    }

    /// Attach metadata already cached for the image's directory
    fn attach_known_metadata(&self, s3_key: &str, formatted: &FormattedKey) {
        let dir = formatted.dir_prefix();

        if let Some(geonames) = self.geonames.latest_in_dir(dir) {
            self.images.attach_geonames(s3_key, geonames);
        }
        if let Some(localization) = self.localizations.latest_in_dir(dir) {
            self.images.attach_localization(s3_key, localization);
        }
        if let Some(features) = self.features.latest_in_dir(dir) {
            self.images.attach_features(s3_key, features);
        }
    }

    /// Ingest a side-file; returns the link to list for its directory, if any
    #[instrument(skip(self, object), fields(key = %object.key))]
    pub async fn ingest_side_file(
        self: &Arc<Self>,
        object: &ObjectInfo,
        kind: SideFileKind,
    ) -> Result<Option<String>, SyncError> {
        let key = FormattedKey::encode(&object.key)?;
        let dir_prefix = parent_dir(&object.key)
            .map(|dir| format!("{dir}/"))
            .unwrap_or_default();
        let modified = object.last_modified;

        match kind {
            SideFileKind::Geonames => {
                if self.geonames.is_stale(&key, modified) {
                    let content = self.fetch_side_file(object, &key, kind).await?;
                    let geonames = Arc::new(parse_geonames(&content, modified)?);
                    self.geonames.insert(key, Arc::clone(&geonames));

                    let attached = self.images.attach_geonames(&dir_prefix, Arc::clone(&geonames));
                    if let Some(img_key) = attached {
                        self.emit(DomainEvent::GeonamesReady {
                            img_key,
                            geonames: geonames.top_level().unwrap_or_default(),
                        })
                        .await;
                    }
                }
                Ok(Some(self.cache_link(&object.key)))
            }

            SideFileKind::Localization => {
                if self.localizations.is_stale(&key, modified) {
                    let content = self.fetch_side_file(object, &key, kind).await?;
                    let localization = Arc::new(parse_localization(&content, modified)?);
                    self.localizations.insert(key, Arc::clone(&localization));
                    self.images.attach_localization(&dir_prefix, localization);
                }
                Ok(None)
            }

            SideFileKind::Features => {
                if self.features.is_stale(&key, modified) {
                    let content = self.fetch_side_file(object, &key, kind).await?;
                    let parser = &self.settings.features_parser;
                    let features = Arc::new(parser.parse(&content, modified, &object.key)?);
                    self.features.insert(key, Arc::clone(&features));

                    let attached = self.images.attach_features(&dir_prefix, Arc::clone(&features));
                    if let Some(img_key) = attached {
                        self.emit(DomainEvent::FeaturesReady {
                            img_key,
                            class: features.class.clone(),
                            count: features.count,
                            features: features.objects.clone(),
                        })
                        .await;
                    }
                }
                Ok(Some(self.cache_link(&object.key)))
            }

            SideFileKind::FullProduct => Ok(self.full_product_link(&object.key).await),

            SideFileKind::AdditionalProduct => {
                if self.product_files.is_stale(&key, modified) {
                    self.fetch_side_file(object, &key, kind).await?;
                    self.product_files
                        .insert(key, Arc::new(ProductFile { last_update: modified }));
                }
                Ok(Some(self.cache_link(&object.key)))
            }
        }
    }

    async fn fetch_side_file(
        self: &Arc<Self>,
        object: &ObjectInfo,
        key: &FormattedKey,
        kind: SideFileKind,
    ) -> Result<Vec<u8>, SyncError> {
        debug!(kind = ?kind, "Fetching side-file");
        let path = self.images.path_for(key);
        self.fetch(&object.key, &path, object.last_modified).await?;
        self.schedule_side_file_eviction(key.clone(), kind, self.settings.retention);

        if kind == SideFileKind::AdditionalProduct {
            return Ok(Vec::new());
        }
        Ok(read_side_file(&path).await?)
    }

    /// Scan one image directory for side-files and return its links
    ///
    /// Per-file failures are logged and skipped; a listing failure is returned.
    #[instrument(skip(self))]
    pub async fn scan_directory(self: &Arc<Self>, dir: &str) -> Result<Vec<String>, SyncError> {
        let prefix = format!("{dir}/");
        let objects = self
            .store
            .list_objects(&prefix)
            .await
            .map_err(|source| SyncError::Listing {
                prefix: prefix.clone(),
                source,
            })?;

        let mut links = Vec::new();
        for object in &objects {
            let Some(kind) = self.settings.classify_side_file(&object.key) else {
                continue;
            };

            match self.ingest_side_file(object, kind).await {
                Ok(Some(link)) => {
                    if !links.contains(&link) {
                        links.push(link);
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_not_found() => {
                    debug!(key = %object.key, "Side-file vanished before fetch");
                }
                Err(e) => {
                    warn!(key = %object.key, kind = ?kind, error = %e, "Skipping side-file");
                }
            }
        }

        Ok(links)
    }

    /// Drop an image removed from the bucket
    #[instrument(skip(self))]
    pub async fn remove_image(&self, s3_key: &str) -> Result<bool, SyncError> {
        let key = FormattedKey::encode(s3_key)?;
        self.timers.cancel(key.as_str());
        remove_cached_file(&self.images.path_for(&key)).await;

        if self.images.remove(&key).is_none() {
            return Ok(false);
        }
        info!("Removed image deleted from bucket");
        self.emit(DomainEvent::ImageRemoved { img_key: key }).await;
        Ok(true)
    }

    /// Record the link of a full-product file whose image directory is mirrored
    pub async fn add_full_product_link(&self, s3_key: &str) -> bool {
        let Some(dir) = parent_dir(s3_key) else {
            return false;
        };
        if self.images.find_by_prefix(&format!("{dir}/")).is_none() {
            debug!(key = %s3_key, "No mirrored image for full product");
            return false;
        }

        match self.full_product_link(s3_key).await {
            Some(link) => self.links.append_unique(dir, link),
            None => false,
        }
    }

    /// Download the other previews of an image's directory into the thumbnails cache
    #[instrument(skip(self), fields(image = %image_key))]
    pub async fn fetch_thumbnails(
        self: &Arc<Self>,
        image_key: &FormattedKey,
    ) -> Result<Vec<String>, SyncError> {
        let s3_key = image_key.decode();
        let Some(dir) = parent_dir(&s3_key) else {
            return Ok(Vec::new());
        };

        let prefix = format!("{dir}/");
        let objects = self
            .store
            .list_objects(&prefix)
            .await
            .map_err(|source| SyncError::Listing {
                prefix: prefix.clone(),
                source,
            })?;

        let mut links = Vec::new();
        for object in objects {
            if !object.key.ends_with(&self.settings.preview_filename) || object.key == s3_key {
                continue;
            }
            let formatted = match FormattedKey::encode(&object.key) {
                Ok(formatted) => formatted,
                Err(e) => {
                    warn!(error = %e, "Skipping thumbnail");
                    continue;
                }
            };

            if self.thumbnails.find_by_key(&object.key).is_none() {
                let path = self.thumbnails.path_for(&formatted);
                if let Err(e) = self.fetch(&object.key, &path, object.last_modified).await {
                    warn!(key = %object.key, error = %e, "Failed to fetch thumbnail");
                    continue;
                }
                self.thumbnails
                    .add(&object.key, object.size, object.last_modified)?;
                self.schedule_thumbnail_eviction(formatted.clone(), self.settings.retention);
            }

            links.push(format!("{}/thumbnails/{}", self.settings.base_path, formatted));
        }

        Ok(links)
    }

    /// Human readable location of an image
    pub fn location_name(&self, key: &FormattedKey) -> Option<String> {
        self.images
            .find_by_formatted_key(key)
            .map(|record| record.location_name())
    }

    /// Details of one cached image, `None` if it is not mirrored
    pub async fn image_infos(self: &Arc<Self>, key: &FormattedKey) -> Option<ImageInfos> {
        let record = self.images.find_by_formatted_key(key)?;

        let links = parent_dir(&record.s3_key)
            .and_then(|dir| self.links.get(dir))
            .unwrap_or_default();
        let geonames = self
            .geonames
            .latest_in_dir(key.dir_prefix())
            .map(|g| g.format())
            .unwrap_or_default();
        let thumbnails = match self.fetch_thumbnails(key).await {
            Ok(thumbnails) => thumbnails,
            Err(e) => {
                warn!(image = %key, error = %e, "Failed to fetch thumbnails");
                Vec::new()
            }
        };

        Some(ImageInfos {
            date: record.last_modified.format("%Y-%m-%d %H:%M:%S").to_string(),
            links,
            geonames,
            localization: record.localization.as_deref().cloned(),
            features: record.features.as_deref().cloned().unwrap_or_default(),
            thumbnails,
        })
    }

    /// Drop every cached object, on disk and in memory, and announce a reset
    ///
    /// All caches and the timer registry are locked together so readers see
    /// either the old state or the empty one.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<(), SyncError> {
        let _ingestion = self.ingestion.lock().await;

        let cleared = {
            let mut images = self.images.lock();
            let mut thumbnails = self.thumbnails.lock();
            let mut timers = self.timers.lock();
            let mut geonames = self.geonames.lock();
            let mut localizations = self.localizations.lock();
            let mut features = self.features.lock();
            let mut product_files = self.product_files.lock();
            let mut links = self.links.lock();

            let cancelled = timers.cancel_all();
            images.clear();
            thumbnails.clear();
            geonames.clear();
            localizations.clear();
            features.clear();
            product_files.clear();
            links.clear();

            let cleared = clear_dir(&self.cache_root).and_then(|_| {
                std::fs::create_dir_all(self.images.root())?;
                std::fs::create_dir_all(self.thumbnails.root())
            });
            info!(timers = cancelled, "Cache reloaded");
            cleared
        };

        self.emit(DomainEvent::CacheReset).await;

        cleared.map_err(|source| SyncError::Io {
            path: self.cache_root.clone(),
            source,
        })
    }

    /// External link of a full-product file
    pub async fn full_product_link(&self, s3_key: &str) -> Option<String> {
        let settings = &self.settings;
        if !settings.full_product_signed_url {
            return Some(format!(
                "{}{}/{}",
                settings.full_product_protocol,
                self.store.bucket(),
                s3_key
            ));
        }

        let signed = match self.store.presigned_url(s3_key, settings.presigned_url_expiry).await {
            Ok(signed) => signed,
            Err(e) => {
                warn!(key = %s3_key, error = %e, "Failed to presign full product");
                return None;
            }
        };
        let path_and_query = match url::Url::parse(&signed) {
            Ok(parsed) => match parsed.query() {
                Some(query) => format!("{}?{}", parsed.path(), query),
                None => parsed.path().to_string(),
            },
            Err(e) => {
                warn!(key = %s3_key, error = %e, "Presigned URL is not a valid URL");
                return None;
            }
        };

        let target = format!("{}{}", settings.full_product_root_url, path_and_query);
        let escaped: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        Some(format!("{}{}", settings.full_product_protocol, escaped))
    }

    /// Link to a side-file served from the main cache
    pub fn cache_link(&self, s3_key: &str) -> String {
        let name = file_name(s3_key);
        match parent_dir(s3_key) {
            Some(dir) => format!(
                "{}/cache/{}/{}",
                self.settings.base_path,
                dir.replace('/', "@"),
                name
            ),
            None => format!("{}/cache/{}", self.settings.base_path, name),
        }
    }

    async fn fetch(
        &self,
        s3_key: &str,
        path: &Path,
        last_modified: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        if let Err(e) = self.store.fetch_object(s3_key, path).await {
            metrics::counter!("mirror.fetch.errors").increment(1);
            return Err(e.into());
        }
        metrics::counter!("mirror.objects.fetched").increment(1);

        if let Err(e) = set_modified(path, last_modified) {
            warn!(
                path = %path.display(),
                error = %e,
                "Failed to set cached file modification time"
            );
        }
        Ok(())
    }

    async fn emit(&self, event: DomainEvent) {
        let kind = event.kind();
        trace!(event = kind, key = ?event.image_key(), "Emitting event");
        if self.events.send(event).await.is_err() {
            debug!(event = kind, "Event hub is gone, dropping event");
        }
    }

    fn schedule_image_eviction(self: &Arc<Self>, key: FormattedKey, after: Duration) {
        let mirror = Arc::downgrade(self);
        self.timers.schedule(key.as_str().to_owned(), after, move || async move {
            if let Some(mirror) = Weak::upgrade(&mirror) {
                mirror.evict_image(&key).await;
            }
        });
    }

    async fn evict_image(&self, key: &FormattedKey) {
        let _ingestion = self.ingestion.lock().await;
        // Re-armed by an ingestion that ran while the timer waited for the guard
        if self.timers.contains(key.as_str()) {
            return;
        }
        if self.images.remove(key).is_none() {
            return;
        }

        remove_cached_file(&self.images.path_for(key)).await;
        metrics::counter!("mirror.objects.evicted").increment(1);
        info!(key = %key, "Evicted image");
        self.emit(DomainEvent::ImageRemoved {
            img_key: key.clone(),
        })
        .await;
    }

    fn schedule_thumbnail_eviction(self: &Arc<Self>, key: FormattedKey, after: Duration) {
        let mirror = Arc::downgrade(self);
        let timer_key = format!("{THUMBNAIL_TIMER_PREFIX}{key}");
        self.timers.schedule(timer_key.clone(), after, move || async move {
            let Some(mirror) = Weak::upgrade(&mirror) else {
                return;
            };
            // Thumbnails are only fetched while no record exists, so the record goes last
            if mirror.timers.contains(&timer_key)
                || mirror.thumbnails.find_by_formatted_key(&key).is_none()
            {
                return;
            }
            remove_cached_file(&mirror.thumbnails.path_for(&key)).await;
            mirror.thumbnails.remove(&key);
            metrics::counter!("mirror.objects.evicted").increment(1);
            debug!(key = %key, "Evicted thumbnail");
        });
    }

    fn schedule_side_file_eviction(
        self: &Arc<Self>,
        key: FormattedKey,
        kind: SideFileKind,
        after: Duration,
    ) {
        let mirror = Arc::downgrade(self);
        self.timers.schedule(key.as_str().to_owned(), after, move || async move {
            let Some(mirror) = Weak::upgrade(&mirror) else {
                return;
            };
            let _ingestion = mirror.ingestion.lock().await;
            if mirror.timers.contains(key.as_str()) {
                return;
            }
            remove_cached_file(&mirror.images.path_for(&key)).await;
            match kind {
                SideFileKind::Geonames => drop(mirror.geonames.remove(&key)),
                SideFileKind::Localization => drop(mirror.localizations.remove(&key)),
                SideFileKind::Features => drop(mirror.features.remove(&key)),
                SideFileKind::AdditionalProduct => drop(mirror.product_files.remove(&key)),
                SideFileKind::FullProduct => {}
            }
            metrics::counter!("mirror.objects.evicted").increment(1);
            debug!(key = %key, kind = ?kind, "Evicted side-file");
        });
    }
}

/// Whether an object modified at `last_modified` is still within retention
pub fn within_retention(last_modified: DateTime<Utc>, retention: Duration) -> bool {
    let age = (Utc::now() - last_modified).to_std().unwrap_or_default();
    age <= retention
}

fn set_modified(path: &Path, at: DateTime<Utc>) -> std::io::Result<()> {
    std::fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::from(at))
}

async fn remove_cached_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed cached file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cached file"),
    }
}

/// Remove everything under `dir`, keeping `dir` itself
fn clear_dir(dir: &Path) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::ImageTypeConfig;
    use crate::storage::memory::MemoryObjectStore;
    use tokio::sync::mpsc;

    pub(crate) fn settings(retention: Duration) -> MirrorSettings {
        MirrorSettings {
            retention,
            preview_filename: "preview.jpg".to_string(),
            geonames_filename: Some("geonames.json".to_string()),
            localization_filename: Some("localization.json".to_string()),
            features_pattern: Some(Regex::new(r"features\.json$").unwrap()),
            features_parser: FeaturesParser::new("category", "class"),
            full_product_extension: Some(".tif".to_string()),
            full_product_protocol: "s3://".to_string(),
            full_product_root_url: String::new(),
            full_product_signed_url: false,
            presigned_url_expiry: Duration::from_secs(7 * 24 * 3600),
            additional_files_pattern: Some(Regex::new(r"\.kml$").unwrap()),
            base_path: String::new(),
            max_display_count: 100,
        }
    }

    pub(crate) fn matcher() -> Arc<ImageTypeMatcher> {
        Arc::new(
            ImageTypeMatcher::new(&[ImageTypeConfig {
                name: "optical".to_string(),
                display_name: "Optical".to_string(),
                product_prefix: "OPTICAL/".to_string(),
                product_regexp: r"preview\.jpg$".to_string(),
            }])
            .unwrap(),
        )
    }

    pub(crate) fn mirror_with(
        settings: MirrorSettings,
        store: Arc<dyn ObjectStore>,
        root: &Path,
    ) -> (Arc<Mirror>, mpsc::Receiver<DomainEvent>) {
        let (events, rx) = mpsc::channel(64);
        let mirror = Mirror::new(settings, store, matcher(), root, events);
        mirror.prepare_dirs().unwrap();
        (mirror, rx)
    }

    pub(crate) fn mirror(
        store: Arc<MemoryObjectStore>,
        root: &Path,
        retention: Duration,
    ) -> (Arc<Mirror>, mpsc::Receiver<DomainEvent>) {
        mirror_with(settings(retention), store, root)
    }

    pub(crate) fn object(key: &str, size: u64, last_modified: DateTime<Utc>) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size,
            last_modified,
        }
    }
}
