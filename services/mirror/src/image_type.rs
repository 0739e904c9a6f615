//! Classification of bucket keys into configured image types.

use crate::config::ImageTypeConfig;
use regex::Regex;
use std::sync::Arc;
use tracing::trace;

/// A configured image category
#[derive(Debug, Clone)]
pub struct ImageType {
    /// Short identifier used in events
    pub name: String,
    /// Human readable name
    pub display_name: String,
    /// Bucket prefix under which images of this type live
    pub product_prefix: String,
    /// Pattern applied to the key remainder after the prefix
    pub pattern: Regex,
}

impl ImageType {
    /// Whether the key belongs to this type
    pub fn matches(&self, s3_key: &str) -> bool {
        s3_key
            .strip_prefix(&self.product_prefix)
            .is_some_and(|rest| self.pattern.is_match(rest))
    }
}

/// Ordered set of image types; the first matching type wins
#[derive(Debug, Clone, Default)]
pub struct ImageTypeMatcher {
    types: Vec<Arc<ImageType>>,
}

impl ImageTypeMatcher {
    /// Compile the configured types
    pub fn new(configs: &[ImageTypeConfig]) -> Result<Self, regex::Error> {
        let types = configs
            .iter()
            .map(|c| {
                Ok(Arc::new(ImageType {
                    name: c.name.clone(),
                    display_name: c.display_name.clone(),
                    product_prefix: c.product_prefix.clone(),
                    pattern: Regex::new(&c.product_regexp)?,
                }))
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self { types })
    }

    /// Classify a bucket key, `None` when no type applies
    pub fn classify(&self, s3_key: &str) -> Option<Arc<ImageType>> {
        let found = self.types.iter().find(|t| t.matches(s3_key)).cloned();
        if found.is_none() {
            trace!(key = %s3_key, "No image type matches key");
        }
        found
    }

    pub fn types(&self) -> &[Arc<ImageType>] {
        &self.types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_config(name: &str, prefix: &str, regexp: &str) -> ImageTypeConfig {
        ImageTypeConfig {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            product_prefix: prefix.to_string(),
            product_regexp: regexp.to_string(),
        }
    }

    fn matcher() -> ImageTypeMatcher {
        ImageTypeMatcher::new(&[
            type_config("optical", "OPTICAL/", r"^[^/]+/preview\.jpg$"),
            type_config("radar", "RADAR/", r"^[^/]+/[^/]+/preview\.jpg$"),
        ])
        .unwrap()
    }

    #[test]
    fn test_prefix_and_pattern_must_both_match() {
        let m = matcher();
        assert_eq!(m.classify("OPTICAL/scene1/preview.jpg").unwrap().name, "optical");
        assert_eq!(m.classify("RADAR/2024/scene1/preview.jpg").unwrap().name, "radar");
        // Right prefix, wrong remainder
        assert!(m.classify("OPTICAL/scene1/extra/preview.jpg").is_none());
        // Pattern would match but prefix does not
        assert!(m.classify("OTHER/scene1/preview.jpg").is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let m = ImageTypeMatcher::new(&[
            type_config("first", "A/", r"preview"),
            type_config("second", "A/", r"preview"),
        ])
        .unwrap();
        assert_eq!(m.classify("A/x/preview.jpg").unwrap().name, "first");
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(ImageTypeMatcher::new(&[type_config("bad", "A/", r"(unclosed")]).is_err());
    }
}
