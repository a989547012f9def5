use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use qchecker::aggregate::ResultAggregator;
use qchecker::config::Configuration;
use qchecker::orchestrator::{discover_tiles, BatchReport, RunOptions, TileOrchestrator};
use qchecker::srs::SpatialReferenceResolver;
use qchecker::surface::rasterizer::PdalRasterizer;
use qchecker::writer::GeoTiffWriter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration document (JSON)
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Worker threads (overrides the configuration)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Run the checks only
    #[arg(long)]
    skip_surfaces: bool,

    /// Build surfaces only
    #[arg(long)]
    skip_checks: bool,

    /// Do not aggregate tile records into project files
    #[arg(long)]
    no_aggregate: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match (args.quiet, args.verbose) {
        (true, _) => Level::WARN,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let start_time = std::time::Instant::now();

    let config = Configuration::load(&args.config)?;
    config.ensure_inputs()?;
    let config = Arc::new(config);
    info!("Project: {}", config.project_name);

    let resolver = match &config.epsg_json {
        Some(path) => SpatialReferenceResolver::from_json_file(path).unwrap_or_else(|e| {
            warn!("{}; coordinate system codes will not resolve", e);
            SpatialReferenceResolver::default()
        }),
        None => {
            warn!("No epsg_json lookup table configured; only WKT names will resolve");
            SpatialReferenceResolver::default()
        }
    };

    let tiles = discover_tiles(&config.las_tile_dir)?;
    info!("Found {} LAS tiles in {:?}", tiles.len(), config.las_tile_dir);

    let rasterizer = Arc::new(PdalRasterizer::new(config.pdal_exe.clone()));
    let mut orchestrator = TileOrchestrator::new(config.clone(), Arc::new(resolver), rasterizer)
        .with_options(RunOptions {
            run_checks: !args.skip_checks,
            run_surfaces: !args.skip_surfaces,
        });
    if let Some(threads) = args.threads {
        orchestrator = orchestrator.with_workers(threads);
    }

    let pb = if args.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(tiles.len() as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} tiles {msg}")?
            .progress_chars("##-"),
    );
    let report = orchestrator.run_with_progress(&tiles, |outcome| {
        pb.set_message(outcome.tile_name.clone());
        pb.inc(1);
    });
    pb.finish_and_clear();

    for outcome in report.failed() {
        error!(
            "{} failed after {}: {}",
            outcome.tile_name,
            outcome.last_completed,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    info!(
        "Processed {} tiles: {} persisted, {} failed",
        report.outcomes.len(),
        report.persisted(),
        report.failed().count()
    );

    if !args.skip_surfaces {
        build_mosaics(&config, &report);
    }

    if !args.no_aggregate {
        if let Err(e) = aggregate(&config) {
            error!("Aggregation failed: {:#}", e);
        }
    }

    let elapsed = start_time.elapsed();
    info!("Total processing time: {:?}", elapsed);

    Ok(())
}

fn aggregate(config: &Configuration) -> Result<()> {
    let aggregator = ResultAggregator::from_config(config)?;
    let table = aggregator.aggregate(&config.results_dir())?;
    let files = aggregator.export(&table, &config.qaqc_dir)?;
    info!("Written project table: {:?}", files.csv);
    Ok(())
}

/// Merges this run's tile rasters into one mosaic per enabled surface.
/// A failed mosaic is logged and the next surface type is tried.
fn build_mosaics(config: &Configuration, report: &BatchReport) {
    let writer = GeoTiffWriter::new();

    for target in &config.surfaces {
        let inputs = report.surface_paths(target.kind);
        if inputs.is_empty() {
            warn!("No {} rasters were produced; mosaic skipped", target.kind);
            continue;
        }

        let output_path = target
            .output_dir
            .join(target.kind.mosaic_file_name(&config.project_name));
        let result = writer
            .mosaic(&inputs, &output_path)
            .with_context(|| format!("Failed to mosaic {} rasters", target.kind))
            .and_then(|summary| {
                info!(
                    "Written {} mosaic of {} tiles ({} valid pixels): {:?}",
                    target.kind, summary.inputs, summary.valid_pixels, output_path
                );
                if config.to_pyramid {
                    writer.build_overviews(&output_path)?;
                    info!("Built overviews for {:?}", output_path);
                }
                Ok(())
            });
        if let Err(e) = result {
            error!("{:#}", e);
        }
    }
}
