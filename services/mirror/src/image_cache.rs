//! Disk-backed collection of cached image records.

use crate::event::{format_timestamp, ImagePayload};
use crate::image_type::{ImageType, ImageTypeMatcher};
use crate::key::{FormattedKey, KeyError};
use crate::metadata::{Features, Geonames, Localization};
use crate::storage::PARTIAL_SUFFIX;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// A cached image and the metadata associated to it
#[derive(Debug, Clone, Serialize)]
pub struct ImageRecord {
    /// Bucket-relative key
    pub s3_key: String,
    /// Last-modified time reported by the bucket
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    pub formatted_key: FormattedKey,
    #[serde(skip)]
    pub image_type: Option<Arc<ImageType>>,
    #[serde(skip)]
    pub geonames: Option<Arc<Geonames>>,
    #[serde(skip)]
    pub localization: Option<Arc<Localization>>,
    #[serde(skip)]
    pub features: Option<Arc<Features>>,
}

impl ImageRecord {
    fn new(
        s3_key: &str,
        size: u64,
        last_modified: DateTime<Utc>,
        image_type: Option<Arc<ImageType>>,
    ) -> Result<Self, KeyError> {
        Ok(Self {
            s3_key: s3_key.to_string(),
            last_modified,
            size,
            formatted_key: FormattedKey::encode(s3_key)?,
            image_type,
            geonames: None,
            localization: None,
            features: None,
        })
    }

    /// Name of the image type, empty when unclassified
    pub fn type_name(&self) -> &str {
        self.image_type.as_ref().map(|t| t.name.as_str()).unwrap_or_default()
    }

    /// Human readable location, falling back to the formatted key
    pub fn location_name(&self) -> String {
        self.geonames
            .as_ref()
            .and_then(|g| g.top_level())
            .unwrap_or_else(|| self.formatted_key.to_string())
    }

    pub fn to_payload(&self) -> ImagePayload {
        ImagePayload {
            img_type: self.type_name().to_string(),
            img_key: self.formatted_key.clone(),
            img_name: self.location_name(),
            img_date: format_timestamp(self.last_modified),
            features: self.features.as_deref().cloned().unwrap_or_default(),
        }
    }
}

/// Ordered set of image records mirrored under a disk directory
#[derive(Debug)]
pub struct ImageCache {
    root: PathBuf,
    matcher: Arc<ImageTypeMatcher>,
    entries: Mutex<Vec<ImageRecord>>,
}

impl ImageCache {
    pub fn new(root: impl Into<PathBuf>, matcher: Arc<ImageTypeMatcher>) -> Self {
        Self {
            root: root.into(),
            matcher,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location on disk of a cached object
    pub fn path_for(&self, key: &FormattedKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn find_by_key(&self, s3_key: &str) -> Option<ImageRecord> {
        self.entries.lock().iter().find(|r| r.s3_key == s3_key).cloned()
    }

    pub fn find_by_formatted_key(&self, key: &FormattedKey) -> Option<ImageRecord> {
        self.entries.lock().iter().find(|r| &r.formatted_key == key).cloned()
    }

    /// First record whose bucket key starts with `prefix`
    pub fn find_by_prefix(&self, prefix: &str) -> Option<ImageRecord> {
        self.entries
            .lock()
            .iter()
            .find(|r| r.s3_key.starts_with(prefix))
            .cloned()
    }

    /// Append a new classified record
    ///
    /// Returns `Ok(false)` without touching the cache when the key is already present.
    pub fn add(
        &self,
        s3_key: &str,
        size: u64,
        last_modified: DateTime<Utc>,
    ) -> Result<bool, KeyError> {
        let record = ImageRecord::new(s3_key, size, last_modified, self.matcher.classify(s3_key))?;

        let mut entries = self.entries.lock();
        if entries.iter().any(|r| r.s3_key == s3_key) {
            return Ok(false);
        }
        entries.push(record);
        Ok(true)
    }

    /// Refresh the timestamp and size of an existing record in place
    pub fn refresh(&self, s3_key: &str, size: u64, last_modified: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|r| r.s3_key == s3_key) {
            Some(record) => {
                record.last_modified = last_modified;
                record.size = size;
                true
            }
            None => false,
        }
    }

    /// Remove the record with the given formatted key, if any
    pub fn remove(&self, key: &FormattedKey) -> Option<ImageRecord> {
        let mut entries = self.entries.lock();
        let idx = entries.iter().position(|r| &r.formatted_key == key)?;
        Some(entries.remove(idx))
    }

    pub fn attach_geonames(&self, prefix: &str, value: Arc<Geonames>) -> Option<FormattedKey> {
        self.attach(prefix, |r| r.geonames = Some(Arc::clone(&value)))
    }

    pub fn attach_localization(
        &self,
        prefix: &str,
        value: Arc<Localization>,
    ) -> Option<FormattedKey> {
        self.attach(prefix, |r| r.localization = Some(Arc::clone(&value)))
    }

    pub fn attach_features(&self, prefix: &str, value: Arc<Features>) -> Option<FormattedKey> {
        self.attach(prefix, |r| r.features = Some(Arc::clone(&value)))
    }

    /// Apply to every record under `prefix`; returns the first one's key
    fn attach(&self, prefix: &str, apply: impl Fn(&mut ImageRecord)) -> Option<FormattedKey> {
        let mut entries = self.entries.lock();
        let mut first = None;
        for record in entries.iter_mut().filter(|r| r.s3_key.starts_with(prefix)) {
            apply(record);
            first.get_or_insert_with(|| record.formatted_key.clone());
        }
        first
    }

    /// Snapshot of every record
    pub fn entries(&self) -> Vec<ImageRecord> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The `max_count` most recent records as event payloads
    ///
    /// Sorts the live collection by modification time, newest first.
    pub fn to_event_payloads(&self, max_count: usize) -> Vec<ImagePayload> {
        let mut entries = self.entries.lock();
        entries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        entries.iter().take(max_count).map(ImageRecord::to_payload).collect()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<ImageRecord>> {
        self.entries.lock()
    }

    /// Rebuild records from files left on disk by a previous run
    ///
    /// Files older than `retention` and interrupted downloads are deleted. Files
    /// ending with `preview_filename` become records stamped with their on-disk
    /// modification time. Returns the rebuilt records.
    pub fn load_from_disk(
        &self,
        retention: Duration,
        preview_filename: &str,
    ) -> std::io::Result<Vec<ImageRecord>> {
        let now = SystemTime::now();
        let mut rebuilt = Vec::new();

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }

            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let modified = meta.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > retention || file_name.ends_with(PARTIAL_SUFFIX) {
                debug!(path = %path.display(), "Removing obsolete file from cache");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove obsolete file");
                }
                continue;
            }

            if !file_name.ends_with(preview_filename) {
                continue;
            }

            let s3_key = FormattedKey::from_formatted(file_name).decode();
            let last_modified = DateTime::<Utc>::from(modified);
            match self.add(&s3_key, meta.len(), last_modified) {
                Ok(true) => {
                    if let Some(record) = self.find_by_key(&s3_key) {
                        rebuilt.push(record);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(key = %s3_key, error = %e, "Skipping unreadable cached file"),
            }
        }

        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageTypeConfig;
    use crate::metadata::parse_geonames;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn matcher() -> Arc<ImageTypeMatcher> {
        Arc::new(
            ImageTypeMatcher::new(&[ImageTypeConfig {
                name: "optical".to_string(),
                display_name: "Optical".to_string(),
                product_prefix: "a/".to_string(),
                product_regexp: r"preview\.jpg$".to_string(),
            }])
            .unwrap(),
        )
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[test]
    fn test_add_classifies_and_formats() {
        let cache = ImageCache::new("/tmp/unused", matcher());
        assert!(cache.add("a/b/preview.jpg", 1024, t(0)).unwrap());

        let record = cache.find_by_key("a/b/preview.jpg").unwrap();
        assert_eq!(record.formatted_key.as_str(), "a@b@preview.jpg");
        assert_eq!(record.size, 1024);
        assert_eq!(record.type_name(), "optical");
        assert!(cache.find_by_key("a/b/other.jpg").is_none());
    }

    #[test]
    fn test_unclassified_record_is_tolerated() {
        let cache = ImageCache::new("/tmp/unused", matcher());
        cache.add("z/preview.png", 1, t(0)).unwrap();
        let record = cache.find_by_key("z/preview.png").unwrap();
        assert!(record.image_type.is_none());
        assert_eq!(record.to_payload().img_type, "");
    }

    #[test]
    fn test_at_most_one_record_per_key() {
        let cache = ImageCache::new("/tmp/unused", matcher());
        assert!(cache.add("a/b/preview.jpg", 1, t(0)).unwrap());
        assert!(!cache.add("a/b/preview.jpg", 2, t(10)).unwrap());
        assert!(cache.refresh("a/b/preview.jpg", 3, t(20)));
        assert_eq!(cache.len(), 1);

        let record = cache.find_by_key("a/b/preview.jpg").unwrap();
        assert_eq!(record.last_modified, t(20));
        assert_eq!(record.size, 3);

        let key = record.formatted_key.clone();
        assert!(cache.remove(&key).is_some());
        assert!(cache.remove(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_find_by_prefix_and_attach() {
        let cache = ImageCache::new("/tmp/unused", matcher());
        cache.add("a/b/preview.jpg", 1, t(0)).unwrap();
        cache.add("a/c/preview.jpg", 1, t(0)).unwrap();

        assert_eq!(cache.find_by_prefix("a/c/").unwrap().s3_key, "a/c/preview.jpg");
        assert!(cache.find_by_prefix("x/").is_none());

        let json = br#"[{"name": "France", "states": [{"name": "Occitanie"}]}]"#;
        let geonames = Arc::new(parse_geonames(json, t(0)).unwrap());
        let attached = cache.attach_geonames("a/b/", geonames).unwrap();
        assert_eq!(attached.as_str(), "a@b@preview.jpg");
        assert!(cache.attach_features("nowhere/", Arc::new(Features::default())).is_none());

        let record = cache.find_by_key("a/b/preview.jpg").unwrap();
        assert_eq!(record.location_name(), "France / Occitanie");
        let other = cache.find_by_key("a/c/preview.jpg").unwrap();
        assert_eq!(other.location_name(), "a@c@preview.jpg");
    }

    #[test]
    fn test_event_payloads_are_bounded_and_sorted() {
        let cache = ImageCache::new("/tmp/unused", matcher());
        for (i, secs) in [30, 10, 50, 20, 40].iter().enumerate() {
            cache.add(&format!("a/{i}/preview.jpg"), 1, t(*secs)).unwrap();
        }

        let payloads = cache.to_event_payloads(3);
        assert_eq!(payloads.len(), 3);
        let keys: Vec<&str> = payloads.iter().map(|p| p.img_key.as_str()).collect();
        assert_eq!(keys, vec!["a@2@preview.jpg", "a@4@preview.jpg", "a@0@preview.jpg"]);

        assert_eq!(cache.to_event_payloads(10).len(), 5);
        assert!(cache.to_event_payloads(0).is_empty());
    }

    #[test]
    fn test_load_from_disk_rebuilds_previews() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a@b@preview.jpg"), vec![0u8; 16]).unwrap();
        std::fs::write(dir.path().join("a@b@geonames.json"), b"[]").unwrap();

        let cache = ImageCache::new(dir.path(), matcher());
        let rebuilt = cache
            .load_from_disk(Duration::from_secs(3600), "preview.jpg")
            .unwrap();

        assert_eq!(rebuilt.len(), 1);
        let record = cache.find_by_key("a/b/preview.jpg").unwrap();
        assert_eq!(record.size, 16);
        assert_eq!(record.type_name(), "optical");
        // Side-files stay on disk but are not image records
        assert!(dir.path().join("a@b@geonames.json").exists());
    }

    #[test]
    fn test_load_from_disk_removes_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a@old@preview.jpg");
        std::fs::write(&path, b"x").unwrap();
        let past = SystemTime::now() - Duration::from_secs(7200);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let cache = ImageCache::new(dir.path(), matcher());
        let rebuilt = cache
            .load_from_disk(Duration::from_secs(3600), "preview.jpg")
            .unwrap();

        assert!(rebuilt.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_load_from_disk_drops_partial_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("a@b@preview.jpg.part");
        std::fs::write(&partial, b"trunc").unwrap();
        // Bucket keys may start with a separator
        std::fs::write(dir.path().join("@a@c@preview.jpg"), b"jpeg").unwrap();

        let cache = ImageCache::new(dir.path(), matcher());
        let rebuilt = cache
            .load_from_disk(Duration::from_secs(3600), "preview.jpg")
            .unwrap();

        assert!(!partial.exists());
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].s3_key, "/a/c/preview.jpg");
        assert_eq!(rebuilt[0].formatted_key.as_str(), "@a@c@preview.jpg");
        assert!(cache.path_for(&rebuilt[0].formatted_key).exists());
    }
}
