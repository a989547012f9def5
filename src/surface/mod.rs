//! Per-tile surfaces: DZ (flight-line disagreement) and mean-elevation DEM.

pub mod rasterizer;

use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SurfaceClassCodes;
use crate::error::SurfaceError;
use crate::model::TileDescriptor;
use crate::writer::GeoTiffWriter;
use rasterizer::{RasterizationService, RenderRequest};

pub const NODATA_VALUE: f64 = -9999.0;

/// Resolution of every rasterization call, in map units.
pub const SURFACE_RESOLUTION: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SurfaceKind {
    Dz,
    Dem,
}

impl SurfaceKind {
    /// Accepts the keys used in `surfaces_to_make`.
    pub fn from_config_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "dz" => Some(SurfaceKind::Dz),
            "dem" => Some(SurfaceKind::Dem),
            _ => None,
        }
    }

    /// File name suffix, e.g. `DZ` in `<tile>_DZ.tif`.
    pub fn suffix(&self) -> &'static str {
        match self {
            SurfaceKind::Dz => "DZ",
            SurfaceKind::Dem => "DEM",
        }
    }

    pub fn tile_file_name(&self, tile_name: &str) -> String {
        format!("{}_{}.tif", tile_name, self.suffix())
    }

    pub fn mosaic_file_name(&self, project_name: &str) -> String {
        format!("{}_{}_mosaic.tif", project_name, self.suffix())
    }
}

impl fmt::Display for SurfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// North-up raster grid. `origin_x`/`origin_y` are the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterGrid {
    pub origin_x: f64,
    pub origin_y: f64,
    pub resolution: f64,
    pub width: usize,
    pub height: usize,
}

impl RasterGrid {
    pub fn geo_transform(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.resolution,
            0.0,
            self.origin_y,
            0.0,
            -self.resolution,
        ]
    }

    pub fn from_geo_transform(gt: &[f64; 6], width: usize, height: usize) -> Self {
        Self {
            origin_x: gt[0],
            origin_y: gt[3],
            resolution: gt[1],
            width,
            height,
        }
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_x(&self) -> f64 {
        self.origin_x + self.width as f64 * self.resolution
    }

    pub fn min_y(&self) -> f64 {
        self.origin_y - self.height as f64 * self.resolution
    }

    /// Same pixel lattice, to a hundredth of a pixel.
    pub fn aligned_with(&self, other: &RasterGrid) -> bool {
        let tol = self.resolution * 0.01;
        self.width == other.width
            && self.height == other.height
            && (self.resolution - other.resolution).abs() < tol
            && (self.origin_x - other.origin_x).abs() < tol
            && (self.origin_y - other.origin_y).abs() < tol
    }
}

/// Single-band raster with a nodata sentinel. Pixels are row-major from the
/// top-left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceRaster {
    pub grid: RasterGrid,
    pub nodata: f64,
    pub values: Vec<f64>,
    /// WKT of the raster's coordinate system, when known.
    pub projection: Option<String>,
}

/// A raster whose pixels hold flight-line disagreement.
pub type DzRaster = SurfaceRaster;

impl SurfaceRaster {
    pub fn filled(grid: RasterGrid, nodata: f64) -> Self {
        Self {
            values: vec![nodata; grid.len()],
            grid,
            nodata,
            projection: None,
        }
    }

    pub fn is_valid(&self, value: f64) -> bool {
        !value.is_nan() && value != self.nodata
    }

    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|&&v| self.is_valid(v)).count()
    }
}

/// Reduces per-flight-line rasters to a disagreement raster.
///
/// Each output pixel is `max - min` over the rasters with a valid value
/// there. Fewer than two valid values, or a difference of exactly zero,
/// gives nodata. Rasters whose grid differs from the first one are dropped.
/// Returns `None` when there is no raster at all.
pub fn difference(rasters: &[SurfaceRaster]) -> Option<DzRaster> {
    let reference = rasters.first()?;
    let stack: Vec<&SurfaceRaster> = rasters
        .iter()
        .filter(|r| {
            let aligned = r.grid.aligned_with(&reference.grid) && r.values.len() == reference.grid.len();
            if !aligned {
                warn!(
                    "{}",
                    SurfaceError::GridMismatch(format!(
                        "{:?} does not match {:?}; raster dropped",
                        r.grid, reference.grid
                    ))
                );
            }
            aligned
        })
        .collect();

    let mut dz = SurfaceRaster::filled(reference.grid, NODATA_VALUE);
    dz.projection = reference.projection.clone();

    for (i, out) in dz.values.iter_mut().enumerate() {
        let mut valid = 0usize;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for raster in &stack {
            let v = raster.values[i];
            if raster.is_valid(v) {
                valid += 1;
                min = min.min(v);
                max = max.max(v);
            }
        }
        if valid >= 2 {
            let diff = max - min;
            if diff != 0.0 {
                *out = diff;
            }
        }
    }
    Some(dz)
}

/// Builds DZ and DEM surfaces for tiles through a [`RasterizationService`].
pub struct SurfaceGenerator {
    rasterizer: Arc<dyn RasterizationService>,
    classes: SurfaceClassCodes,
    writer: GeoTiffWriter,
}

impl SurfaceGenerator {
    pub fn new(rasterizer: Arc<dyn RasterizationService>, classes: SurfaceClassCodes) -> Self {
        Self {
            rasterizer,
            classes,
            writer: GeoTiffWriter::new(),
        }
    }

    fn surface_classes(&self, tile: &TileDescriptor) -> Vec<u8> {
        self.classes.for_revision(tile.revision()).to_vec()
    }

    fn has_surface_points(&self, tile: &TileDescriptor, classes: &[u8]) -> bool {
        classes.iter().any(|&c| tile.points.has_class(c))
    }

    fn request(&self, tile: &TileDescriptor, classes: Vec<u8>, point_source_id: Option<u16>) -> RenderRequest {
        RenderRequest {
            source: tile.path.clone(),
            classes,
            point_source_id,
            bounds: tile.extents(),
            resolution: SURFACE_RESOLUTION,
        }
    }

    /// One mean-elevation raster per flight line with ground or bathymetry
    /// last returns, reduced with [`difference`]. A failed flight line is
    /// logged and left out.
    pub fn generate_dz(&self, tile: &TileDescriptor) -> Option<DzRaster> {
        let classes = self.surface_classes(tile);
        if !self.has_surface_points(tile, &classes) {
            debug!(tile = %tile.name, "no ground or bathymetry points; no DZ surface");
            return None;
        }

        let mut rasters = Vec::new();
        for (&id, line) in &tile.points.flight_lines {
            if !line.has_last_returns_in(&classes) {
                continue;
            }
            let request = self.request(tile, classes.clone(), Some(id));
            match self.rasterizer.render(&request) {
                Ok(raster) => rasters.push(raster),
                Err(e) => warn!(tile = %tile.name, flight_line = id, "flight line dropped: {}", e),
            }
        }

        debug!(tile = %tile.name, flight_lines = rasters.len(), "differencing flight-line rasters");
        difference(&rasters)
    }

    /// Single mean-elevation surface over ground and bathymetry last returns.
    pub fn generate_dem(&self, tile: &TileDescriptor) -> Result<Option<SurfaceRaster>, SurfaceError> {
        let classes = self.surface_classes(tile);
        if !self.has_surface_points(tile, &classes) {
            debug!(tile = %tile.name, "no ground or bathymetry points; no DEM surface");
            return Ok(None);
        }
        let request = self.request(tile, classes, None);
        self.rasterizer.render(&request).map(Some)
    }

    /// Generates one surface and writes it as `<output_dir>/<tile>_<KIND>.tif`.
    /// Returns the written path, or `None` when the tile has nothing to show.
    pub fn generate(
        &self,
        kind: SurfaceKind,
        tile: &TileDescriptor,
        output_dir: &Path,
    ) -> Result<Option<PathBuf>, SurfaceError> {
        let raster = match kind {
            SurfaceKind::Dz => self.generate_dz(tile),
            SurfaceKind::Dem => self.generate_dem(tile)?,
        };
        let Some(raster) = raster else {
            return Ok(None);
        };

        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(kind.tile_file_name(&tile.name));
        self.writer.write(&raster, &path)?;
        info!(tile = %tile.name, surface = %kind, path = %path.display(), "surface written");
        Ok(Some(path))
    }
}
