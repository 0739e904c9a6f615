//! Parsers for metadata side-files.
//!
//! Each side-file lives next to the images of a directory in the bucket and is
//! turned into a typed value stamped with the side-file's last-modified time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur while reading or parsing a side-file
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Side-file {0:?} not found")]
    NotFound(String),

    #[error("Failed to read side-file {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed {kind} content: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing required field {field:?} in {kind} content")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

impl ParseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ParseError::NotFound(_))
    }
}

/// Values carrying the last-modified time of their source object
pub trait Timestamped {
    fn last_update(&self) -> DateTime<Utc>;
}

/// Read a side-file previously fetched to disk
pub async fn read_side_file(path: &Path) -> Result<Vec<u8>, ParseError> {
    tokio::fs::read(path).await.map_err(|e| {
        let path = path.display().to_string();
        if e.kind() == ErrorKind::NotFound {
            ParseError::NotFound(path)
        } else {
            ParseError::Io { path, source: e }
        }
    })
}

// ---------------------------------------------------------------------------
// Geonames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct County {
    pub name: String,
    #[serde(default)]
    pub cities: Vec<Place>,
    #[serde(default)]
    pub villages: Vec<Place>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    #[serde(default)]
    pub counties: Vec<County>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Country {
    pub name: String,
    #[serde(default)]
    pub states: Vec<State>,
}

/// Geographic hierarchy covered by the images of a directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Geonames {
    pub countries: Vec<Country>,
    #[serde(skip)]
    pub last_update: DateTime<Utc>,
}

impl Geonames {
    /// `country / state / county / city` built from the first entry of each level
    pub fn top_level(&self) -> Option<String> {
        let country = self.countries.first()?;
        let mut name = country.name.clone();

        if let Some(state) = country.states.first() {
            name.push_str(" / ");
            name.push_str(&state.name);

            if let Some(county) = state.counties.first() {
                name.push_str(" / ");
                name.push_str(&county.name);

                if let Some(city) = county.cities.first() {
                    name.push_str(" / ");
                    name.push_str(&city.name);
                }
            }
        }

        Some(name)
    }

    /// Indented multi-line rendering of the whole hierarchy
    pub fn format(&self) -> String {
        let mut out = String::new();
        for country in &self.countries {
            out.push_str(&format!("{}\n", country.name));
            for state in &country.states {
                out.push_str(&format!("  {}\n", state.name));
                for county in &state.counties {
                    out.push_str(&format!("    {}\n", county.name));
                    for city in &county.cities {
                        out.push_str(&format!("      {}\n", city.name));
                    }
                    for village in &county.villages {
                        out.push_str(&format!("        {}\n", village.name));
                    }
                }
            }
        }
        out
    }

    fn sort(&mut self) {
        let by_name = |a: &str, b: &str| a.to_lowercase().cmp(&b.to_lowercase());

        self.countries.sort_by(|a, b| by_name(&a.name, &b.name));
        for country in &mut self.countries {
            country.states.sort_by(|a, b| by_name(&a.name, &b.name));
            for state in &mut country.states {
                state.counties.sort_by(|a, b| by_name(&a.name, &b.name));
            }
        }
    }
}

impl Timestamped for Geonames {
    fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }
}

/// Parse a geonames side-file (a JSON array of countries)
pub fn parse_geonames(content: &[u8], last_update: DateTime<Utc>) -> Result<Geonames, ParseError> {
    let countries: Vec<Country> =
        serde_json::from_slice(content).map_err(|source| ParseError::Malformed {
            kind: "geonames",
            source,
        })?;

    let mut geonames = Geonames {
        countries,
        last_update,
    };
    geonames.sort();

    Ok(geonames)
}

// ---------------------------------------------------------------------------
// Localization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub coordinates: Coordinates,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Corners {
    #[serde(rename = "upper-left")]
    pub upper_left: Point,
    #[serde(rename = "upper-right")]
    pub upper_right: Point,
    #[serde(rename = "lower-left")]
    pub lower_left: Point,
    #[serde(rename = "lower-right")]
    pub lower_right: Point,
}

/// Footprint of the images of a directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Localization {
    pub corner: Corners,
    #[serde(skip)]
    pub last_update: DateTime<Utc>,
}

impl Timestamped for Localization {
    fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }
}

#[derive(Deserialize)]
struct RawLocalization {
    corner: Option<Corners>,
}

/// Parse a localization side-file
pub fn parse_localization(
    content: &[u8],
    last_update: DateTime<Utc>,
) -> Result<Localization, ParseError> {
    let raw: RawLocalization =
        serde_json::from_slice(content).map_err(|source| ParseError::Malformed {
            kind: "localization",
            source,
        })?;

    let corner = raw.corner.ok_or(ParseError::MissingField {
        kind: "localization",
        field: "corner",
    })?;

    Ok(Localization {
        corner,
        last_update,
    })
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Detection counts for the images of a directory
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Features {
    pub class: String,
    #[serde(rename = "featuresCount")]
    pub count: usize,
    /// Category name to number of detections
    pub objects: BTreeMap<String, usize>,
    #[serde(skip)]
    pub last_update: DateTime<Utc>,
}

impl Timestamped for Features {
    fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }
}

#[derive(Deserialize)]
struct RawFeaturesFile {
    features: Option<Vec<RawFeature>>,
}

#[derive(Deserialize)]
struct RawFeature {
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
}

/// Parser for feature-detection side-files (GeoJSON feature collections)
#[derive(Debug, Clone)]
pub struct FeaturesParser {
    /// Property holding the detected category
    pub category_property: String,
    /// Property holding the detection class
    pub class_property: String,
}

impl FeaturesParser {
    pub fn new(category_property: impl Into<String>, class_property: impl Into<String>) -> Self {
        Self {
            category_property: category_property.into(),
            class_property: class_property.into(),
        }
    }

    /// Parse a features file; malformed entries are logged and skipped
    pub fn parse(
        &self,
        content: &[u8],
        last_update: DateTime<Utc>,
        source: &str,
    ) -> Result<Features, ParseError> {
        let raw: RawFeaturesFile =
            serde_json::from_slice(content).map_err(|source| ParseError::Malformed {
                kind: "features",
                source,
            })?;

        let entries = raw.features.ok_or(ParseError::MissingField {
            kind: "features",
            field: "features",
        })?;

        let mut features = Features {
            last_update,
            ..Features::default()
        };

        for (idx, entry) in entries.iter().enumerate() {
            let Some(category) =
                string_property(&entry.properties, &self.category_property, idx, source)
            else {
                continue;
            };
            let Some(class) = string_property(&entry.properties, &self.class_property, idx, source)
            else {
                continue;
            };

            features.class = class;
            features.count += 1;
            *features.objects.entry(category).or_insert(0) += 1;
        }

        Ok(features)
    }
}

fn string_property(
    props: &serde_json::Map<String, serde_json::Value>,
    name: &str,
    idx: usize,
    source: &str,
) -> Option<String> {
    match props.get(name) {
        None => {
            warn!(
                file = %source,
                feature = idx + 1,
                property = %name,
                "Feature has no such property"
            );
            None
        }
        Some(serde_json::Value::String(value)) => Some(normalize_label(value)),
        Some(other) => {
            warn!(
                file = %source,
                feature = idx + 1,
                property = %name,
                value = %other,
                "Feature property is not a string"
            );
            None
        }
    }
}

/// `"safety_vest"` -> `"Safety Vest"`
pub fn normalize_label(raw: &str) -> String {
    raw.split(|c: char| c == '_' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
