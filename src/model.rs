use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::parser::geokeys::GeoKeyDirectory;
use crate::parser::header::{Bounds, FormatRevision, LasHeader};
use crate::parser::points::PointSummary;
use crate::parser::vlr::Vlr;
use crate::srs::{SpatialReferenceResolver, SpatialReferenceSource};

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "PASSED")]
    Passed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl Verdict {
    pub fn from_bool(passed: bool) -> Self {
        if passed {
            Verdict::Passed
        } else {
            Verdict::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Passed => "PASSED",
            Verdict::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A check's verdict plus the value it observed on the tile.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub name: String,
    pub verdict: Verdict,
    pub observed: Value,
}

/// Tile extents in the result record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extents {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl From<&Bounds> for Extents {
    fn from(b: &Bounds) -> Self {
        Extents {
            min_x: b.min_x,
            max_x: b.max_x,
            min_y: b.min_y,
            max_y: b.max_y,
        }
    }
}

/// Nominal tile cell: the tile-size grid cell the data belongs to.
///
/// Derived only from the header bounding box and the tile size, so
/// neighbouring tiles share exact edge coordinates even when their point
/// extents are ragged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileCell {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

impl TileCell {
    /// Snaps to the grid using the north-west data corner: the west edge is
    /// `floor(min_x / size) * size`, the north edge is the grid line above
    /// `max_y`.
    pub fn snap(bounds: &Bounds, tile_size: f64) -> Self {
        let left = (bounds.min_x / tile_size).floor() * tile_size;
        let top = (bounds.max_y / tile_size).floor() * tile_size + tile_size;
        TileCell {
            left,
            right: left + tile_size,
            top,
            bottom: top - tile_size,
        }
    }

    pub fn size(&self) -> f64 {
        self.right - self.left
    }

    pub fn centroid(&self) -> (f64, f64) {
        let half = self.size() / 2.0;
        (self.left + half, self.top - half)
    }

    pub fn centroid_wkt(&self) -> String {
        let (x, y) = self.centroid();
        format!("POINT ({} {})", x, y)
    }

    /// Closed ring, clockwise from the north-west corner.
    pub fn polygon_wkt(&self) -> String {
        format!(
            "POLYGON (({l} {t}, {r} {t}, {r} {b}, {l} {b}, {l} {t}))",
            l = self.left,
            r = self.right,
            t = self.top,
            b = self.bottom
        )
    }
}

/// Everything known about one tile while it moves through the pipeline.
#[derive(Debug, Clone)]
pub struct TileDescriptor {
    pub path: PathBuf,
    pub name: String,
    pub header: LasHeader,
    pub vlrs: Vec<Vlr>,
    pub geo_keys: Option<GeoKeyDirectory>,
    pub srs_source: SpatialReferenceSource,
    pub points: PointSummary,
    pub cell: TileCell,
    pub horizontal_srs: Option<String>,
    pub vertical_srs: Option<String>,
    pub checks_result: BTreeMap<String, CheckResult>,
}

impl TileDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: PathBuf,
        name: String,
        header: LasHeader,
        vlrs: Vec<Vlr>,
        geo_keys: Option<GeoKeyDirectory>,
        srs_source: SpatialReferenceSource,
        points: PointSummary,
        cell: TileCell,
    ) -> Self {
        Self {
            path,
            name,
            header,
            vlrs,
            geo_keys,
            srs_source,
            points,
            cell,
            horizontal_srs: None,
            vertical_srs: None,
            checks_result: BTreeMap::new(),
        }
    }

    pub fn revision(&self) -> FormatRevision {
        self.header.revision()
    }

    pub fn version(&self) -> String {
        self.header.version()
    }

    pub fn extents(&self) -> Extents {
        Extents::from(&self.header.bounds)
    }

    /// Fills in the horizontal and vertical names. Unresolvable codes stay
    /// `None`.
    pub fn resolve_srs(&mut self, resolver: &SpatialReferenceResolver) {
        let resolved = resolver.resolve(&self.srs_source);
        self.horizontal_srs = resolved.horizontal;
        self.vertical_srs = resolved.vertical;
    }

    pub fn record_check(&mut self, result: CheckResult) {
        self.checks_result.insert(result.name.clone(), result);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Bounds {
        Bounds {
            min_x,
            max_x,
            min_y,
            max_y,
            min_z: 0.0,
            max_z: 0.0,
        }
    }

    #[test]
    fn test_snap_centroid() {
        let cell = TileCell::snap(&bounds(374000.3, 374499.9, 4594000.1, 4594499.2), 500.0);
        assert_eq!(cell.centroid(), (374250.0, 4594250.0));
        assert_eq!(cell.left, 374000.0);
        assert_eq!(cell.top, 4594500.0);
    }

    #[test]
    fn test_noisy_extents_share_centroid() {
        let a = TileCell::snap(&bounds(374000.01, 374499.99, 4594000.02, 4594499.98), 500.0);
        let b = TileCell::snap(&bounds(374012.77, 374488.10, 4594033.40, 4594470.00), 500.0);
        assert_eq!(a.centroid().0.to_bits(), b.centroid().0.to_bits());
        assert_eq!(a.centroid().1.to_bits(), b.centroid().1.to_bits());
        assert_eq!(a.polygon_wkt(), b.polygon_wkt());
    }

    #[test]
    fn test_adjacent_cells_share_edges() {
        let west = TileCell::snap(&bounds(374000.2, 374499.1, 4594000.2, 4594499.1), 500.0);
        let east = TileCell::snap(&bounds(374500.4, 374999.6, 4594000.3, 4594499.7), 500.0);
        assert_eq!(west.right, east.left);
    }

    #[test]
    fn test_wkt_strings() {
        let cell = TileCell::snap(&bounds(0.5, 9.5, 0.5, 9.5), 10.0);
        assert_eq!(cell.centroid_wkt(), "POINT (5 5)");
        assert_eq!(
            cell.polygon_wkt(),
            "POLYGON ((0 10, 10 10, 10 0, 0 0, 0 10))"
        );
    }

    #[test]
    fn test_verdict_serializes_as_text() {
        assert_eq!(
            serde_json::to_string(&Verdict::Passed).unwrap(),
            "\"PASSED\""
        );
        assert_eq!(Verdict::from_bool(false).to_string(), "FAILED");
    }
}
