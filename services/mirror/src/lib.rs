//! Mirror Service - live local mirror of a bucket's images and side-files
//!
//! The service keeps a disk-backed cache of the preview images found under
//! configured bucket prefixes, together with the metadata side-files stored
//! next to them:
//!
//! - geonames hierarchies, used to name an image's location
//! - localization corners
//! - feature-detection counts
//! - full-product and additional product files, exposed as links
//!
//! Every cached object is evicted once the retention period has elapsed. The
//! cache follows the bucket either by periodic rescans or by consuming bucket
//! notifications, and every change is broadcast to live subscribers.
//!
//! # Example
//!
//! ```rust,no_run
//! use mirror_service::{
//!     hub, rescan, Config, ImageTypeMatcher, Mirror, MirrorSettings, S3ObjectStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let store = Arc::new(S3ObjectStore::new(&config.s3).await);
//!     let matcher = Arc::new(ImageTypeMatcher::new(&config.image_types)?);
//!     let (events, _hub, _handle) = hub::channel(64, 256);
//!
//!     let mirror = Mirror::new(
//!         MirrorSettings::from_config(&config)?,
//!         store,
//!         matcher,
//!         &config.cache.dir,
//!         events,
//!     );
//!     rescan::rescan_once(&mirror).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod event;
pub mod hub;
pub mod image_cache;
pub mod image_type;
pub mod key;
pub mod listener;
pub mod metadata;
pub mod metadata_cache;
pub mod mirror;
pub mod notifications;
pub mod rescan;
pub mod storage;
pub mod timers;

// Re-export main types
pub use config::{Config, ConfigError};
pub use event::{DomainEvent, ImagePayload};
pub use hub::{EventHub, EventSender, HubError, HubHandle, Subscription};
pub use image_cache::{ImageCache, ImageRecord};
pub use image_type::{ImageType, ImageTypeMatcher};
pub use key::{FormattedKey, KeyError};
pub use metadata::{Features, Geonames, Localization, ParseError};
pub use metadata_cache::{LinkCache, MetadataCache};
pub use mirror::{ImageInfos, IngestOutcome, Mirror, MirrorSettings, SideFileKind, SyncError};
pub use notifications::{KafkaNotificationSource, NotificationError, NotificationSource};
pub use rescan::RescanReport;
pub use storage::{ObjectInfo, ObjectStore, S3ObjectStore, StorageError};
pub use timers::EvictionTimers;
