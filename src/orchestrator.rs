//! Tile-parallel batch execution.
//!
//! Each tile runs the whole pipeline on a worker thread and reports a
//! [`TileOutcome`] over a channel. The calling thread is the only owner of
//! the outcome map, keyed by tile name.

use rayon::ThreadPoolBuilder;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::checks::{panic_message, CheckRegistry};
use crate::config::Configuration;
use crate::error::ConfigError;
use crate::parser::TileMetadataReader;
use crate::record::TileResultRecord;
use crate::srs::SpatialReferenceResolver;
use crate::surface::rasterizer::RasterizationService;
use crate::surface::{SurfaceGenerator, SurfaceKind};

/// Where a tile is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TileState {
    Pending,
    MetadataRead,
    ChecksRun,
    SurfacesRun,
    Persisted,
    /// Terminal: the tile failed and was set aside.
    FailedIsolated,
}

impl fmt::Display for TileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TileState::Pending => "PENDING",
            TileState::MetadataRead => "METADATA_READ",
            TileState::ChecksRun => "CHECKS_RUN",
            TileState::SurfacesRun => "SURFACES_RUN",
            TileState::Persisted => "PERSISTED",
            TileState::FailedIsolated => "FAILED_ISOLATED",
        };
        f.write_str(s)
    }
}

/// Final report for one tile.
#[derive(Debug, Clone)]
pub struct TileOutcome {
    pub tile_name: String,
    pub path: PathBuf,
    pub state: TileState,
    /// Last state reached before the tile finished or failed.
    pub last_completed: TileState,
    pub error: Option<String>,
    pub record_path: Option<PathBuf>,
    pub surfaces: BTreeMap<SurfaceKind, PathBuf>,
}

impl TileOutcome {
    fn pending(path: &Path) -> Self {
        Self {
            tile_name: tile_name(path),
            path: path.to_path_buf(),
            state: TileState::Pending,
            last_completed: TileState::Pending,
            error: None,
            record_path: None,
            surfaces: BTreeMap::new(),
        }
    }

    fn advance(&mut self, state: TileState) {
        self.state = state;
        self.last_completed = state;
    }

    fn fail(mut self, error: impl Into<String>) -> Self {
        self.state = TileState::FailedIsolated;
        self.error = Some(error.into());
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.state == TileState::Persisted
    }
}

/// All outcomes of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: BTreeMap<String, TileOutcome>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn persisted(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_persisted()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &TileOutcome> {
        self.outcomes
            .values()
            .filter(|o| o.state == TileState::FailedIsolated)
    }

    /// Surface rasters written in this batch, per type, ordered by tile name.
    pub fn surface_paths(&self, kind: SurfaceKind) -> Vec<PathBuf> {
        self.outcomes
            .values()
            .filter_map(|o| o.surfaces.get(&kind).cloned())
            .collect()
    }
}

/// Which stages a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub run_checks: bool,
    pub run_surfaces: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_checks: true,
            run_surfaces: true,
        }
    }
}

pub struct TileOrchestrator {
    config: Arc<Configuration>,
    reader: TileMetadataReader,
    resolver: Arc<SpatialReferenceResolver>,
    registry: CheckRegistry,
    surfaces: SurfaceGenerator,
    options: RunOptions,
    workers: usize,
}

impl TileOrchestrator {
    pub fn new(
        config: Arc<Configuration>,
        resolver: Arc<SpatialReferenceResolver>,
        rasterizer: Arc<dyn RasterizationService>,
    ) -> Self {
        Self {
            reader: TileMetadataReader::new(config.tile_size),
            registry: CheckRegistry::standard(),
            surfaces: SurfaceGenerator::new(rasterizer, config.surface_classes.clone()),
            options: RunOptions::default(),
            workers: config.worker_count(),
            resolver,
            config,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_registry(mut self, registry: CheckRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn run(&self, tile_paths: &[PathBuf]) -> BatchReport {
        self.run_with_progress(tile_paths, |_| {})
    }

    /// Processes every tile on the worker pool, calling `on_outcome` on the
    /// calling thread as each tile finishes.
    pub fn run_with_progress<F>(&self, tile_paths: &[PathBuf], mut on_outcome: F) -> BatchReport
    where
        F: FnMut(&TileOutcome),
    {
        let start = Instant::now();
        let results_dir = self.config.results_dir();
        if let Err(e) = fs::create_dir_all(&results_dir) {
            error!("failed to create {}: {}", results_dir.display(), e);
        }

        info!(
            tiles = tile_paths.len(),
            workers = self.workers,
            "starting tile batch"
        );

        let (tx, rx) = mpsc::channel::<TileOutcome>();
        let mut outcomes = BTreeMap::new();

        thread::scope(|ts| {
            ts.spawn(move || match ThreadPoolBuilder::new().num_threads(self.workers).build() {
                Ok(pool) => pool.scope(|s| {
                    for path in tile_paths {
                        let tx = tx.clone();
                        s.spawn(move |_| {
                            // The receiver outlives every worker.
                            let _ = tx.send(self.process_isolated(path));
                        });
                    }
                }),
                Err(e) => {
                    warn!("failed to build worker pool ({}); processing tiles sequentially", e);
                    for path in tile_paths {
                        let _ = tx.send(self.process_isolated(path));
                    }
                }
            });

            for outcome in rx {
                on_outcome(&outcome);
                if let Some(previous) = outcomes.insert(outcome.tile_name.clone(), outcome) {
                    warn!(tile = %previous.tile_name, "duplicate tile name; earlier outcome replaced");
                }
            }
        });

        let report = BatchReport {
            outcomes,
            elapsed: start.elapsed(),
        };
        info!(
            persisted = report.persisted(),
            failed = report.failed().count(),
            elapsed = ?report.elapsed,
            "tile batch finished"
        );
        report
    }

    /// [`Self::process_tile`] with panics turned into a failed outcome.
    fn process_isolated(&self, path: &Path) -> TileOutcome {
        panic::catch_unwind(AssertUnwindSafe(|| self.process_tile(path))).unwrap_or_else(
            |payload| {
                let message = panic_message(payload.as_ref());
                error!(tile = %tile_name(path), "tile processing panicked: {}", message);
                TileOutcome::pending(path).fail(format!("panic: {message}"))
            },
        )
    }

    /// Runs the full pipeline for one tile:
    /// metadata, spatial reference, checks, surfaces, record.
    pub fn process_tile(&self, path: &Path) -> TileOutcome {
        let mut outcome = TileOutcome::pending(path);

        let mut tile = match self.reader.read(path) {
            Ok(tile) => tile,
            Err(e) => {
                warn!(tile = %outcome.tile_name, "failed to read tile: {}", e);
                return outcome.fail(e.to_string());
            }
        };
        tile.resolve_srs(&self.resolver);
        outcome.advance(TileState::MetadataRead);

        if self.options.run_checks {
            self.registry.run(&mut tile, &self.config);
        }
        outcome.advance(TileState::ChecksRun);

        if self.options.run_surfaces {
            for target in &self.config.surfaces {
                match self.surfaces.generate(target.kind, &tile, &target.output_dir) {
                    Ok(Some(written)) => {
                        outcome.surfaces.insert(target.kind, written);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(tile = %tile.name, surface = %target.kind, "surface omitted: {}", e),
                }
            }
        }
        outcome.advance(TileState::SurfacesRun);

        let record = TileResultRecord::from_tile(&tile, &outcome.surfaces);
        match record.persist(&self.config.results_dir()) {
            Ok(written) => {
                debug!(tile = %tile.name, path = %written.display(), "record persisted");
                outcome.record_path = Some(written);
                outcome.advance(TileState::Persisted);
                outcome
            }
            Err(e) => {
                error!(tile = %tile.name, "failed to persist record: {}", e);
                outcome.fail(e.to_string())
            }
        }
    }
}

fn tile_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Recursively collects `.las` files under `dir`, sorted by path. When two
/// files share a tile name only the first is kept.
pub fn discover_tiles(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    if !dir.is_dir() {
        return Err(ConfigError::MissingInputDirectory(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    collect_las_files(dir, &mut files).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    files.sort();

    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    files.retain(|path| {
        let name = tile_name(path);
        match seen.get(&name) {
            Some(first) => {
                warn!(
                    "skipping {}: tile name {} already used by {}",
                    path.display(),
                    name,
                    first.display()
                );
                false
            }
            None => {
                seen.insert(name, path.clone());
                true
            }
        }
    });

    debug!("found {} tiles under {}", files.len(), dir.display());
    Ok(files)
}

fn collect_las_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_las_files(&path, files)?;
        } else if path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("las"))
        {
            files.push(path);
        }
    }
    Ok(())
}
