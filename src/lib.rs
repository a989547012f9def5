pub mod aggregate;
pub mod checks;
pub mod classes;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod record;
pub mod srs;
pub mod surface;
pub mod writer;

pub use aggregate::{ProjectResultTable, ProjectSummary, ResultAggregator};
pub use checks::{Check, CheckRegistry};
pub use classes::ClassCatalog;
pub use config::Configuration;
pub use model::{CheckResult, TileDescriptor, Verdict};
pub use orchestrator::{discover_tiles, BatchReport, RunOptions, TileOrchestrator, TileOutcome, TileState};
pub use parser::TileMetadataReader;
pub use record::TileResultRecord;
pub use srs::SpatialReferenceResolver;
pub use surface::rasterizer::{PdalRasterizer, RasterizationService, RenderRequest};
pub use surface::{SurfaceGenerator, SurfaceKind, SurfaceRaster};
pub use writer::{GeoTiffWriter, MosaicSummary};
