use anyhow::{bail, Context, Result};
use gdal::raster::{Buffer, RasterBand};
use gdal::{Dataset, DriverManager, Metadata};
use std::path::{Path, PathBuf};

use crate::surface::{RasterGrid, SurfaceRaster, NODATA_VALUE};

/// Overview levels built on mosaics.
const OVERVIEW_LEVELS: &[i32] = &[2, 4, 8, 16];

/// Reads and writes single-band float32 GeoTIFF surfaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeoTiffWriter {}

impl GeoTiffWriter {
    pub fn new() -> Self {
        Self {}
    }

    pub fn write(&self, raster: &SurfaceRaster, output_path: &Path) -> Result<()> {
        let grid = &raster.grid;
        let mut dataset = self.create(grid, raster.projection.as_deref(), output_path)?;
        dataset
            .set_metadata_item("VALID_PIXELS", &raster.valid_count().to_string(), "")
            .context("Failed to set valid pixel metadata")?;

        let mut band = dataset.rasterband(1).context("Failed to get raster band")?;

        // Row-major from the top-left corner, as GDAL expects.
        let values: Vec<f32> = raster
            .values
            .iter()
            .map(|&v| {
                if raster.is_valid(v) {
                    v as f32
                } else {
                    NODATA_VALUE as f32
                }
            })
            .collect();
        let mut buffer = Buffer::new((grid.width, grid.height), values);
        band.write((0, 0), (grid.width, grid.height), &mut buffer)
            .context("Failed to write raster data")?;

        Ok(())
    }

    /// Creates an empty float32 GeoTIFF with the grid's transform and a
    /// nodata-filled band.
    fn create(&self, grid: &RasterGrid, projection: Option<&str>, output_path: &Path) -> Result<Dataset> {
        let driver =
            DriverManager::get_driver_by_name("GTiff").context("Failed to get GTiff driver")?;

        let mut dataset = driver
            .create_with_band_type::<f32, _>(output_path, grid.width, grid.height, 1)
            .with_context(|| format!("Failed to create {}", output_path.display()))?;

        dataset
            .set_geo_transform(&grid.geo_transform())
            .context("Failed to set geo transform")?;

        if let Some(wkt) = projection.filter(|w| !w.is_empty()) {
            dataset
                .set_projection(wkt)
                .context("Failed to set projection")?;
        }

        {
            let mut band = dataset.rasterband(1).context("Failed to get raster band")?;
            band.set_no_data_value(Some(NODATA_VALUE))
                .context("Failed to set no data value")?;
            band.fill(NODATA_VALUE, None)
                .context("Failed to initialise raster band")?;
        }

        Ok(dataset)
    }

    /// Reads band 1 of a raster. Pixels equal to the band's nodata value (or
    /// NaN) come back as [`NODATA_VALUE`].
    pub fn read(&self, path: &Path) -> Result<SurfaceRaster> {
        let dataset =
            Dataset::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let grid = north_up_grid(&dataset, path)?;

        let band = dataset.rasterband(1).context("Failed to get raster band")?;
        let band_nodata = band.no_data_value();
        let buffer = band
            .read_as::<f64>((0, 0), (grid.width, grid.height), (grid.width, grid.height), None)
            .context("Failed to read raster data")?;
        let (_, data) = buffer.into_shape_and_vec();

        let values = data
            .into_iter()
            .map(|v| {
                if v.is_nan() || band_nodata == Some(v) {
                    NODATA_VALUE
                } else {
                    v
                }
            })
            .collect();

        let projection = dataset.projection();
        Ok(SurfaceRaster {
            grid,
            nodata: NODATA_VALUE,
            values,
            projection: (!projection.is_empty()).then_some(projection),
        })
    }

    /// Merges tile rasters into one GeoTIFF covering their union extent.
    /// Inputs are taken in order and the first valid value wins where tiles
    /// overlap. All inputs must share one resolution.
    ///
    /// The extent is computed from the input headers first. Each tile is then
    /// read and merged into its window of the output, one at a time.
    pub fn mosaic(&self, inputs: &[PathBuf], output_path: &Path) -> Result<MosaicSummary> {
        let Some(first_path) = inputs.first() else {
            bail!("No rasters to mosaic into {}", output_path.display());
        };

        let mut projection = None;
        let mut union: Option<RasterGrid> = None;
        for path in inputs {
            let dataset = Dataset::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let tile = north_up_grid(&dataset, path)?;
            if path == first_path {
                projection = Some(dataset.projection()).filter(|p| !p.is_empty());
            }
            union = Some(match union {
                None => tile,
                Some(extent) => {
                    if (tile.resolution - extent.resolution).abs() > extent.resolution * 1e-6 {
                        bail!(
                            "{} has resolution {} but the mosaic uses {}",
                            path.display(),
                            tile.resolution,
                            extent.resolution
                        );
                    }
                    union_of(&extent, &tile)
                }
            });
        }
        let Some(grid) = union else {
            bail!("No rasters to mosaic into {}", output_path.display());
        };

        let mut dataset = self.create(&grid, projection.as_deref(), output_path)?;
        let mut valid_pixels = 0;
        {
            let mut band = dataset.rasterband(1).context("Failed to get raster band")?;
            for path in inputs {
                let tile = self.read(path)?;
                valid_pixels += merge_into(&mut band, &grid, &tile)
                    .with_context(|| format!("Failed to merge {}", path.display()))?;
            }
        }
        dataset
            .set_metadata_item("VALID_PIXELS", &valid_pixels.to_string(), "")
            .context("Failed to set valid pixel metadata")?;

        Ok(MosaicSummary {
            grid,
            inputs: inputs.len(),
            valid_pixels,
        })
    }

    /// Builds nearest-neighbour overviews inside an existing GeoTIFF.
    pub fn build_overviews(&self, path: &Path) -> Result<()> {
        let mut dataset = Dataset::open_ex(
            path,
            gdal::DatasetOptions {
                open_flags: gdal::GdalOpenFlags::GDAL_OF_UPDATE
                    | gdal::GdalOpenFlags::GDAL_OF_RASTER,
                ..Default::default()
            },
        )
        .with_context(|| format!("Failed to open {} for update", path.display()))?;
        dataset
            .build_overviews("NEAREST", OVERVIEW_LEVELS, &[])
            .with_context(|| format!("Failed to build overviews for {}", path.display()))?;
        Ok(())
    }
}

/// Extent and pixel count of a written mosaic.
#[derive(Debug, Clone, PartialEq)]
pub struct MosaicSummary {
    pub grid: RasterGrid,
    pub inputs: usize,
    pub valid_pixels: usize,
}

/// Grid of an opened raster, which must be north-up with square pixels.
fn north_up_grid(dataset: &Dataset, path: &Path) -> Result<RasterGrid> {
    let (width, height) = dataset.raster_size();
    let gt = dataset
        .geo_transform()
        .with_context(|| format!("{} has no geo transform", path.display()))?;
    if gt[2] != 0.0 || gt[4] != 0.0 || gt[5] >= 0.0 {
        bail!("{} is not a north-up raster", path.display());
    }
    if (gt[1] + gt[5]).abs() > gt[1].abs() * 1e-6 {
        bail!("{} has non-square pixels", path.display());
    }
    Ok(RasterGrid::from_geo_transform(&gt, width, height))
}

fn union_of(a: &RasterGrid, b: &RasterGrid) -> RasterGrid {
    let resolution = a.resolution;
    let min_x = a.origin_x.min(b.origin_x);
    let max_x = a.max_x().max(b.max_x());
    let min_y = a.min_y().min(b.min_y());
    let max_y = a.origin_y.max(b.origin_y);
    RasterGrid {
        origin_x: min_x,
        origin_y: max_y,
        resolution,
        width: ((max_x - min_x) / resolution).round() as usize,
        height: ((max_y - min_y) / resolution).round() as usize,
    }
}

/// Writes a tile's valid pixels into the empty cells of its window in the
/// mosaic band. Returns the number of cells filled.
fn merge_into(band: &mut RasterBand, grid: &RasterGrid, tile: &SurfaceRaster) -> Result<usize> {
    let col0 = ((tile.grid.origin_x - grid.origin_x) / grid.resolution).round() as usize;
    let row0 = ((grid.origin_y - tile.grid.origin_y) / grid.resolution).round() as usize;
    let width = tile.grid.width.min(grid.width.saturating_sub(col0));
    let height = tile.grid.height.min(grid.height.saturating_sub(row0));
    if width == 0 || height == 0 {
        return Ok(0);
    }

    let window = (col0 as isize, row0 as isize);
    let existing = band
        .read_as::<f32>(window, (width, height), (width, height), None)
        .context("Failed to read mosaic window")?;
    let (_, mut cells) = existing.into_shape_and_vec();

    let mut filled = 0;
    for row in 0..height {
        for col in 0..width {
            let v = tile.values[row * tile.grid.width + col];
            let dst = &mut cells[row * width + col];
            if *dst == NODATA_VALUE as f32 && tile.is_valid(v) {
                *dst = v as f32;
                filled += 1;
            }
        }
    }

    let mut buffer = Buffer::new((width, height), cells);
    band.write(window, (width, height), &mut buffer)
        .context("Failed to write mosaic window")?;
    Ok(filled)
}
