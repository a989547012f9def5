//! The persisted per-tile result record.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AggregationError;
use crate::model::{Extents, TileDescriptor};
use crate::surface::SurfaceKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderSummary {
    pub format_version: String,
    pub point_data_format: u8,
    pub global_encoding: u16,
    pub gps_time_type: String,
    pub wkt_flag: bool,
    pub creation_day: u16,
    pub creation_year: u16,
    /// ISO date derived from the creation day and year.
    pub creation_date: Option<String>,
    pub point_count: u64,
    pub system_identifier: String,
    pub generating_software: String,
    pub file_source_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub x: f64,
    pub y: f64,
}

/// One tile's results, written as `<tile_name>.json`. Field names are unique
/// across nested maps so the record flattens into a single row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileResultRecord {
    pub tile_name: String,
    pub header_summary: HeaderSummary,
    pub extents: Extents,
    pub centroid: Centroid,
    /// `class<N>` to point count.
    pub class_counts: BTreeMap<String, u64>,
    /// `<check>` to the observed value and `<check>_passed` to the verdict.
    pub check_results: BTreeMap<String, Value>,
    /// Surface type (`DZ`, `DEM`) to the raster written for this tile.
    #[serde(default)]
    pub surfaces: BTreeMap<String, String>,
    pub tile_polygon: String,
    pub tile_centroid: String,
}

impl TileResultRecord {
    pub fn from_tile(tile: &TileDescriptor, surfaces: &BTreeMap<SurfaceKind, PathBuf>) -> Self {
        let header = &tile.header;
        let (x, y) = tile.cell.centroid();

        let mut check_results = BTreeMap::new();
        for (name, result) in &tile.checks_result {
            check_results.insert(name.clone(), result.observed.clone());
            check_results.insert(format!("{name}_passed"), json!(result.verdict));
        }

        TileResultRecord {
            tile_name: tile.name.clone(),
            header_summary: HeaderSummary {
                format_version: header.version(),
                point_data_format: header.point_format,
                global_encoding: header.global_encoding,
                gps_time_type: header.gps_time_type().label().to_string(),
                wkt_flag: header.wkt_flag(),
                creation_day: header.creation_day,
                creation_year: header.creation_year,
                creation_date: header.creation_date().map(|d| d.to_string()),
                point_count: header.point_count,
                system_identifier: header.system_identifier.clone(),
                generating_software: header.generating_software.clone(),
                file_source_id: header.file_source_id,
            },
            extents: tile.extents(),
            centroid: Centroid { x, y },
            class_counts: tile
                .points
                .class_counts
                .iter()
                .map(|(class, n)| (format!("class{class}"), *n))
                .collect(),
            check_results,
            surfaces: surfaces
                .iter()
                .map(|(kind, path)| (kind.suffix().to_string(), path.display().to_string()))
                .collect(),
            tile_polygon: tile.cell.polygon_wkt(),
            tile_centroid: tile.cell.centroid_wkt(),
        }
    }

    pub fn file_name(tile_name: &str) -> String {
        format!("{tile_name}.json")
    }

    /// Writes the record into `dir`, replacing any earlier record for the
    /// tile. The file is renamed into place so readers never see a partial
    /// record.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf, AggregationError> {
        let path = dir.join(Self::file_name(&self.tile_name));
        let staging = dir.join(format!(".{}.tmp", Self::file_name(&self.tile_name)));
        let text = serde_json::to_string_pretty(self)?;

        fs::write(&staging, text).map_err(|source| AggregationError::Write {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &path).map_err(|source| AggregationError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, AggregationError> {
        let text = fs::read_to_string(path).map_err(|e| AggregationError::Record {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| AggregationError::Record {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}
