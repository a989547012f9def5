//! The external rasterization collaborator.

use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

use super::SurfaceRaster;
use crate::error::SurfaceError;
use crate::model::Extents;
use crate::writer::GeoTiffWriter;

/// What to rasterize: last returns of the given classes, optionally from one
/// flight line, gridded as mean elevation over `bounds`.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub source: PathBuf,
    pub classes: Vec<u8>,
    pub point_source_id: Option<u16>,
    pub bounds: Extents,
    pub resolution: f64,
}

impl RenderRequest {
    /// Human readable name used in logs and errors.
    pub fn target(&self) -> String {
        match self.point_source_id {
            Some(id) => format!("{} flight line {}", self.source.display(), id),
            None => self.source.display().to_string(),
        }
    }

    /// `filters.range` limits: the classes, ANDed with the flight line.
    fn range_limits(&self) -> String {
        let classes: Vec<String> = self
            .classes
            .iter()
            .map(|c| format!("Classification[{c}:{c}]"))
            .collect();
        let mut limits = classes.join(",");
        if let Some(id) = self.point_source_id {
            limits.push_str(&format!(",PointSourceId[{id}:{id}]"));
        }
        limits
    }

    /// PDAL pipeline writing a mean-elevation GeoTIFF to `output`.
    pub fn pdal_pipeline(&self, output: &std::path::Path) -> Value {
        let b = &self.bounds;
        json!({
            "pipeline": [
                {
                    "type": "readers.las",
                    "filename": self.source.to_string_lossy(),
                },
                {
                    "type": "filters.range",
                    "limits": self.range_limits(),
                },
                {
                    "type": "filters.returns",
                    "groups": "last,only",
                },
                {
                    "type": "writers.gdal",
                    "filename": output.to_string_lossy(),
                    "gdaldriver": "GTiff",
                    "data_type": "float32",
                    "output_type": "mean",
                    "nodata": super::NODATA_VALUE,
                    "resolution": self.resolution,
                    "bounds": format!("([{},{}],[{},{}])", b.min_x, b.max_x, b.min_y, b.max_y),
                }
            ]
        })
    }
}

/// Produces one raster per request. Implementations must be safe to share
/// across worker threads.
pub trait RasterizationService: Send + Sync {
    fn render(&self, request: &RenderRequest) -> Result<SurfaceRaster, SurfaceError>;
}

/// Runs `pdal pipeline` on a generated pipeline file and reads the result back.
pub struct PdalRasterizer {
    executable: PathBuf,
    writer: GeoTiffWriter,
}

impl PdalRasterizer {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            writer: GeoTiffWriter::new(),
        }
    }
}

impl RasterizationService for PdalRasterizer {
    fn render(&self, request: &RenderRequest) -> Result<SurfaceRaster, SurfaceError> {
        let workdir = tempfile::tempdir()?;
        let output = workdir.path().join("surface.tif");
        let pipeline_path = workdir.path().join("pipeline.json");
        fs::write(&pipeline_path, request.pdal_pipeline(&output).to_string())?;

        debug!(request = %request.target(), "running pdal pipeline");
        let result = Command::new(&self.executable)
            .arg("pipeline")
            .arg(&pipeline_path)
            .output()
            .map_err(|e| {
                SurfaceError::rasterizer(
                    request.target(),
                    format!("failed to start {}: {}", self.executable.display(), e),
                )
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(SurfaceError::rasterizer(
                request.target(),
                format!("{}: {}", result.status, stderr.trim()),
            ));
        }
        if !output.exists() {
            return Err(SurfaceError::rasterizer(
                request.target(),
                "pipeline finished without writing a raster",
            ));
        }

        Ok(self.writer.read(&output)?)
    }
}
