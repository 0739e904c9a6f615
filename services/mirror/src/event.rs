//! Domain events broadcast to subscribers.

use crate::key::FormattedKey;
use crate::metadata::Features;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// What a subscriber needs to display one image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagePayload {
    pub img_type: String,
    pub img_key: FormattedKey,
    /// Location name, or the formatted key when unknown
    pub img_name: String,
    pub img_date: String,
    pub features: Features,
}

/// A change in the mirrored cache
///
/// Serialized as `{"event_type": "...", "event_obj": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", content = "event_obj")]
pub enum DomainEvent {
    #[serde(rename = "ADD")]
    ImageAdded(ImagePayload),

    #[serde(rename = "UPDATE")]
    ImageUpdated(ImagePayload),

    #[serde(rename = "REMOVE")]
    ImageRemoved { img_key: FormattedKey },

    #[serde(rename = "GEONAMES")]
    GeonamesReady {
        img_key: FormattedKey,
        geonames: String,
    },

    #[serde(rename = "FEATURES")]
    FeaturesReady {
        img_key: FormattedKey,
        class: String,
        count: usize,
        features: BTreeMap<String, usize>,
    },

    /// Every previously received state must be discarded
    #[serde(rename = "RESET")]
    CacheReset,
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::ImageAdded(_) => "ADD",
            DomainEvent::ImageUpdated(_) => "UPDATE",
            DomainEvent::ImageRemoved { .. } => "REMOVE",
            DomainEvent::GeonamesReady { .. } => "GEONAMES",
            DomainEvent::FeaturesReady { .. } => "FEATURES",
            DomainEvent::CacheReset => "RESET",
        }
    }

    /// Image the event refers to, if any
    pub fn image_key(&self) -> Option<&FormattedKey> {
        match self {
            DomainEvent::ImageAdded(p) | DomainEvent::ImageUpdated(p) => Some(&p.img_key),
            DomainEvent::ImageRemoved { img_key }
            | DomainEvent::GeonamesReady { img_key, .. }
            | DomainEvent::FeaturesReady { img_key, .. } => Some(img_key),
            DomainEvent::CacheReset => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Local-time rendering used in payloads
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_event_json() {
        let event = DomainEvent::ImageRemoved {
            img_key: FormattedKey::from_formatted("a@b@preview.jpg"),
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event_type"], "REMOVE");
        assert_eq!(json["event_obj"]["img_key"], "a@b@preview.jpg");
    }

    #[test]
    fn test_reset_event_json() {
        let json: serde_json::Value =
            serde_json::from_str(&DomainEvent::CacheReset.to_json().unwrap()).unwrap();
        assert_eq!(json["event_type"], "RESET");
        assert!(DomainEvent::CacheReset.image_key().is_none());
    }

    #[test]
    fn test_added_event_carries_payload() {
        let event = DomainEvent::ImageAdded(ImagePayload {
            img_type: "optical".to_string(),
            img_key: FormattedKey::from_formatted("a@b@preview.jpg"),
            img_name: "France / Occitanie".to_string(),
            img_date: "2024-01-15 10:30:00 UTC".to_string(),
            features: Features::default(),
        });

        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event_type"], "ADD");
        assert_eq!(json["event_obj"]["img_type"], "optical");
        assert_eq!(json["event_obj"]["features"]["featuresCount"], 0);
        assert_eq!(event.kind(), "ADD");
        assert_eq!(event.image_key().unwrap().as_str(), "a@b@preview.jpg");
    }
}
