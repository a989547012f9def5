//! Spatial reference lookup.
//!
//! A tile stores its coordinate system in one of two places depending on
//! the container revision: GeoTIFF keys (with citations in the GeoAscii
//! params record) for 1.0–1.3, an OGC WKT record for 1.4.
//! [`SpatialReferenceSource`] captures whichever one the tile has and
//! [`SpatialReferenceResolver`] turns it into names.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::LookupError;
use crate::parser::geokeys::{
    GeoKeyDirectory, PCS_CITATION, PROJECTED_CS_TYPE, USER_DEFINED, VERTICAL_CITATION,
    VERTICAL_CS_TYPE,
};
use crate::parser::header::{FormatRevision, LasHeader};
use crate::parser::vlr::{find_record, Vlr, GEO_ASCII_PARAMS, OGC_WKT};

/// Vertical datum as stored in GeoTIFF keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerticalReference {
    Citation(String),
    Code(u16),
}

/// Where a tile keeps its coordinate system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpatialReferenceSource {
    GeoKeys {
        horizontal_code: Option<u16>,
        horizontal_citation: Option<String>,
        vertical: Option<VerticalReference>,
    },
    Wkt {
        wkt: Option<String>,
        /// Global encoding WKT bit.
        authoritative: bool,
    },
}

impl SpatialReferenceSource {
    pub fn from_records(
        header: &LasHeader,
        vlrs: &[Vlr],
        geo_keys: Option<&GeoKeyDirectory>,
    ) -> Self {
        match header.revision() {
            FormatRevision::Modern => SpatialReferenceSource::Wkt {
                wkt: find_record(vlrs, OGC_WKT)
                    .map(|v| v.payload_text())
                    .filter(|s| !s.is_empty()),
                authoritative: header.wkt_flag(),
            },
            FormatRevision::Legacy => {
                let Some(keys) = geo_keys else {
                    return SpatialReferenceSource::GeoKeys {
                        horizontal_code: None,
                        horizontal_citation: None,
                        vertical: None,
                    };
                };
                let ascii = find_record(vlrs, GEO_ASCII_PARAMS)
                    .map(|v| v.payload.as_slice())
                    .unwrap_or_default();

                let vertical = keys
                    .ascii_value(VERTICAL_CITATION, ascii)
                    .map(VerticalReference::Citation)
                    .or_else(|| {
                        keys.short_value(VERTICAL_CS_TYPE)
                            .filter(|&c| c != USER_DEFINED)
                            .map(VerticalReference::Code)
                    });

                SpatialReferenceSource::GeoKeys {
                    horizontal_code: keys.short_value(PROJECTED_CS_TYPE),
                    horizontal_citation: keys.ascii_value(PCS_CITATION, ascii),
                    vertical,
                }
            }
        }
    }

    /// Whether the tile's coordinate system is declared authoritatively.
    /// GeoKey sources have no such flag and always qualify.
    pub fn is_authoritative(&self) -> bool {
        match self {
            SpatialReferenceSource::GeoKeys { .. } => true,
            SpatialReferenceSource::Wkt { authoritative, .. } => *authoritative,
        }
    }
}

/// Resolved names; `None` means undetermined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSrs {
    pub horizontal: Option<String>,
    pub vertical: Option<String>,
}

/// Code to name lookup, loaded once and shared read-only by every worker.
#[derive(Debug, Clone, Default)]
pub struct SpatialReferenceResolver {
    names: HashMap<u32, String>,
}

impl SpatialReferenceResolver {
    /// Loads a `{"<code>": "<name>"}` JSON table.
    pub fn from_json_file(path: &Path) -> Result<Self, LookupError> {
        let text = fs::read_to_string(path).map_err(|source| LookupError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table: HashMap<String, String> =
            serde_json::from_str(&text).map_err(|source| LookupError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        let mut names = HashMap::with_capacity(table.len());
        for (code, name) in table {
            match code.trim().parse::<u32>() {
                Ok(code) => {
                    names.insert(code, name);
                }
                Err(_) => warn!("skipping non-numeric code {:?} in {}", code, path.display()),
            }
        }
        debug!("loaded {} coordinate system codes", names.len());
        Ok(Self { names })
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        Self {
            names: entries.into_iter().map(|(c, n)| (c, n.into())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn resolve_horizontal(&self, code: u32) -> Option<String> {
        let name = self.names.get(&code).cloned();
        if name.is_none() {
            debug!("horizontal code {} not in lookup table", code);
        }
        name
    }

    pub fn resolve_vertical(&self, vertical: &VerticalReference) -> Option<String> {
        match vertical {
            VerticalReference::Citation(text) => Some(text.clone()),
            VerticalReference::Code(code) => {
                let name = self.names.get(&(*code as u32)).cloned();
                if name.is_none() {
                    debug!("vertical code {} not in lookup table", code);
                }
                name
            }
        }
    }

    pub fn resolve(&self, source: &SpatialReferenceSource) -> ResolvedSrs {
        match source {
            SpatialReferenceSource::GeoKeys {
                horizontal_code,
                horizontal_citation,
                vertical,
            } => {
                let horizontal = horizontal_code
                    .filter(|&c| c != USER_DEFINED)
                    .and_then(|c| self.resolve_horizontal(c as u32))
                    .or_else(|| horizontal_citation.clone());
                ResolvedSrs {
                    horizontal,
                    vertical: vertical.as_ref().and_then(|v| self.resolve_vertical(v)),
                }
            }
            SpatialReferenceSource::Wkt { wkt: None, .. } => ResolvedSrs::default(),
            SpatialReferenceSource::Wkt { wkt: Some(wkt), .. } => {
                let horizontal = horizontal_name(wkt).or_else(|| {
                    authority_code(wkt).and_then(|c| self.resolve_horizontal(c))
                });
                ResolvedSrs {
                    horizontal,
                    vertical: vertical_name(wkt),
                }
            }
        }
    }
}

const PROJECTED_KEYWORDS: &[&str] = &["PROJCS", "PROJCRS", "PROJECTEDCRS"];
const GEOGRAPHIC_KEYWORDS: &[&str] = &["GEOGCS", "GEOGCRS", "GEOGRAPHICCRS"];
const VERTICAL_KEYWORDS: &[&str] = &["VERT_CS", "VERTCRS", "VERTICALCRS"];
const AUTHORITY_KEYWORDS: &[&str] = &["AUTHORITY", "ID"];

/// Byte offsets just past `KEYWORD[` for every standalone occurrence of a
/// keyword, in document order.
fn keyword_openings<'a>(wkt: &'a str, keywords: &'a [&'a str]) -> impl Iterator<Item = usize> + 'a {
    let bytes = wkt.as_bytes();
    keywords
        .iter()
        .flat_map(move |kw| {
            wkt.match_indices(kw).filter_map(move |(at, _)| {
                let standalone = at == 0 || {
                    let prev = bytes[at - 1];
                    !(prev.is_ascii_alphanumeric() || prev == b'_')
                };
                let rest = wkt[at + kw.len()..].trim_start();
                if standalone && rest.starts_with('[') {
                    Some(wkt.len() - rest.len() + 1)
                } else {
                    None
                }
            })
        })
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
}

/// The quoted string at the start of `s`, ignoring leading whitespace.
fn quoted(s: &str) -> Option<&str> {
    let s = s.trim_start().strip_prefix('"')?;
    let end = s.find('"')?;
    Some(&s[..end])
}

fn first_named(wkt: &str, keywords: &[&str]) -> Option<String> {
    keyword_openings(wkt, keywords)
        .next()
        .and_then(|at| quoted(&wkt[at..]))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Projected CRS name, falling back to the geographic CRS name.
pub fn horizontal_name(wkt: &str) -> Option<String> {
    first_named(wkt, PROJECTED_KEYWORDS).or_else(|| first_named(wkt, GEOGRAPHIC_KEYWORDS))
}

pub fn vertical_name(wkt: &str) -> Option<String> {
    first_named(wkt, VERTICAL_KEYWORDS)
}

/// The EPSG code of the outermost object. WKT1 places it last.
pub fn authority_code(wkt: &str) -> Option<u32> {
    keyword_openings(wkt, AUTHORITY_KEYWORDS)
        .filter_map(|at| {
            let body = &wkt[at..];
            let inner = &body[..body.find(']')?];
            let mut parts = inner.split(',').map(|p| p.trim().trim_matches('"'));
            if parts.next()? != "EPSG" {
                return None;
            }
            parts.next()?.parse().ok()
        })
        .last()
}
