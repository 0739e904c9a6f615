//! Keyed caches for directory-scoped side-file data.

use crate::key::FormattedKey;
use crate::metadata::Timestamped;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// Side-file values keyed by the side-file's formatted key
#[derive(Debug)]
pub struct MetadataCache<T> {
    entries: Mutex<HashMap<FormattedKey, Arc<T>>>,
}

impl<T> Default for MetadataCache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Timestamped> MetadataCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &FormattedKey) -> Option<Arc<T>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: FormattedKey, value: Arc<T>) {
        self.entries.lock().insert(key, value);
    }

    pub fn remove(&self, key: &FormattedKey) -> Option<Arc<T>> {
        self.entries.lock().remove(key)
    }

    /// Most recent value whose key lives in the formatted directory `dir_prefix`
    pub fn latest_in_dir(&self, dir_prefix: &str) -> Option<Arc<T>> {
        self.entries
            .lock()
            .iter()
            .filter(|(key, _)| key.dir_prefix() == dir_prefix)
            .map(|(_, value)| value)
            .max_by_key(|value| value.last_update())
            .cloned()
    }

    /// Whether the cached value is missing or older than `modified`
    pub fn is_stale(&self, key: &FormattedKey, modified: DateTime<Utc>) -> bool {
        self.entries
            .lock()
            .get(key)
            .map_or(true, |value| value.last_update() < modified)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<FormattedKey, Arc<T>>> {
        self.entries.lock()
    }
}

/// Timestamp of a cached product file that carries no parsed content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductFile {
    pub last_update: DateTime<Utc>,
}

impl Timestamped for ProductFile {
    fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }
}

/// Links to full-product files, keyed by bucket directory
#[derive(Debug, Default)]
pub struct LinkCache {
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dir: &str) -> Option<Vec<String>> {
        self.entries.lock().get(dir).cloned()
    }

    /// Replace the whole cache with a freshly built set of links
    pub fn replace_all(&self, links: HashMap<String, Vec<String>>) {
        *self.entries.lock() = links;
    }

    /// Append `link` to `dir` unless already present; returns whether it was added
    pub fn append_unique(&self, dir: &str, link: String) -> bool {
        let mut entries = self.entries.lock();
        let links = entries.entry(dir.to_string()).or_default();
        if links.contains(&link) {
            return false;
        }
        links.push(link);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.entries.lock()
    }
}
