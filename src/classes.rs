//! Classification code labels.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::LookupError;
use crate::parser::header::FormatRevision;

const STANDARD_CLASSES: &[(u8, &str)] = &[
    (0, "Never Classified"),
    (1, "Unclassified"),
    (2, "Ground"),
    (3, "Low Vegetation"),
    (4, "Medium Vegetation"),
    (5, "High Vegetation"),
    (6, "Building"),
    (7, "Low Point (noise)"),
    (8, "Reserved"),
    (9, "Water"),
    (10, "Rail"),
    (11, "Road Surface"),
    (12, "Reserved"),
    (13, "Wire - Guard (Shield)"),
    (14, "Wire - Conductor (Phase)"),
    (15, "Transmission Tower"),
    (16, "Wire-structure Connector (Insulator)"),
    (17, "Bridge Deck"),
    (18, "High Noise"),
];

/// NOAA RSD supplemental classes used with pre-1.4 bathymetric data.
const LEGACY_BATHY_CLASSES: &[(u8, &str)] = &[
    (23, "Unrefracted Sensor Noise"),
    (24, "Refracted Sensor Noise"),
    (25, "Water Column"),
    (26, "Bathymetric Point"),
    (27, "Water Surface"),
    (28, "Derived Water Surface"),
    (29, "Submerged Object"),
    (30, "IHO S-57 Object"),
];

/// Topo-bathy lidar domain profile classes for 1.4.
const MODERN_BATHY_CLASSES: &[(u8, &str)] = &[
    (40, "Bathymetric Point"),
    (41, "Water Surface"),
    (42, "Derived Water Surface"),
    (43, "Submerged Object"),
    (44, "IHO S-57 Object"),
    (45, "No-Bottom-Found-At"),
];

/// Labels for classification codes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassCatalog {
    labels: BTreeMap<u8, String>,
}

impl ClassCatalog {
    /// Standard ASPRS classes plus the bathymetric codes of the revision.
    pub fn builtin(revision: FormatRevision) -> Self {
        let bathy = match revision {
            FormatRevision::Legacy => LEGACY_BATHY_CLASSES,
            FormatRevision::Modern => MODERN_BATHY_CLASSES,
        };
        Self {
            labels: STANDARD_CLASSES
                .iter()
                .chain(bathy)
                .map(|&(code, label)| (code, label.to_string()))
                .collect(),
        }
    }

    /// Built-in catalog for a configured version string such as `"1.4"`.
    /// Anything that does not name a legacy version gets the 1.4 codes.
    pub fn for_version(version: Option<&str>) -> Self {
        let revision = version
            .and_then(|v| v.trim().split_once('.'))
            .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)))
            .and_then(|(major, minor)| FormatRevision::from_version(major, minor).ok())
            .unwrap_or(FormatRevision::Modern);
        Self::builtin(revision)
    }

    /// Reads a classification-scheme XML:
    /// `<Class><Label>..</Label><Values><Value>..</Value></Values></Class>`.
    pub fn from_xml_file(path: &Path) -> Result<Self, LookupError> {
        let text = fs::read_to_string(path).map_err(|source| LookupError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_xml_str(&text).map_err(|reason| LookupError::Xml {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn from_xml_str(xml: &str) -> Result<Self, String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut labels = BTreeMap::new();
        let mut buf = Vec::new();
        let mut path: Vec<Vec<u8>> = Vec::new();
        let mut label: Option<String> = None;
        let mut values: Vec<String> = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    let name = e.local_name().as_ref().to_vec();
                    if name == b"Class" {
                        label = None;
                        values.clear();
                    }
                    path.push(name);
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(|e| e.to_string())?;
                    match path.last().map(Vec::as_slice) {
                        Some(b"Label") => label = Some(text.trim().to_string()),
                        Some(b"Value") => values.push(text.trim().to_string()),
                        _ => {}
                    }
                }
                Ok(Event::End(e)) => {
                    if e.local_name().as_ref() == b"Class" {
                        match label.take() {
                            Some(l) => {
                                for value in values.drain(..) {
                                    match value.parse::<u8>() {
                                        Ok(code) => {
                                            labels.insert(code, l.clone());
                                        }
                                        Err(_) => warn!("ignoring class value {:?} for {}", value, l),
                                    }
                                }
                            }
                            None => warn!("class entry without a label ignored"),
                        }
                    }
                    path.pop();
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(format!(
                        "XML error at position {}: {}",
                        reader.error_position(),
                        e
                    ))
                }
                _ => {}
            }
            buf.clear();
        }

        debug!("read {} class labels", labels.len());
        Ok(Self { labels })
    }

    /// Labels from `other` replace or extend this catalog's labels.
    pub fn merge(&mut self, other: ClassCatalog) {
        self.labels.extend(other.labels);
    }

    pub fn label(&self, code: u8) -> Option<&str> {
        self.labels.get(&code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_bathy_codes() {
        let legacy = ClassCatalog::builtin(FormatRevision::Legacy);
        assert_eq!(legacy.label(26), Some("Bathymetric Point"));
        assert_eq!(legacy.label(40), None);

        let modern = ClassCatalog::builtin(FormatRevision::Modern);
        assert_eq!(modern.label(40), Some("Bathymetric Point"));
        assert_eq!(modern.label(2), Some("Ground"));
        assert_eq!(modern.label(26), None);

        assert_eq!(ClassCatalog::for_version(Some("1.2")), legacy);
        assert_eq!(ClassCatalog::for_version(Some("1.4")), modern);
        assert_eq!(ClassCatalog::for_version(None), modern);
    }

    #[test]
    fn test_scheme_xml() {
        let xml = r#"<?xml version="1.0"?>
            <ClassificationScheme>
              <Name>noaa_topobathy</Name>
              <Class>
                <Label>Ground</Label>
                <Values><Value>2</Value></Values>
              </Class>
              <Class>
                <Label>Bathy &amp; Submerged</Label>
                <Values><Value>40</Value><Value>43</Value></Values>
              </Class>
              <Class>
                <Label>Bad</Label>
                <Values><Value>x</Value></Values>
              </Class>
            </ClassificationScheme>"#;
        let catalog = ClassCatalog::from_xml_str(xml).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.label(43), Some("Bathy & Submerged"));

        let mut merged = ClassCatalog::builtin(FormatRevision::Modern);
        merged.merge(catalog);
        assert_eq!(merged.label(40), Some("Bathy & Submerged"));
        assert_eq!(merged.label(9), Some("Water"));
    }

    #[test]
    fn test_malformed_xml() {
        assert!(ClassCatalog::from_xml_str("<Class><Label>a</Class>").is_err());
    }
}
