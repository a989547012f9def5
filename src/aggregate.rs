//! Project-level aggregation of persisted tile records.
//!
//! Every `<tile>.json` in the result directory is flattened into one row of a
//! [`ProjectResultTable`]. The table is exported as CSV, as two GeoJSON layers
//! (tile centroids and tile footprints) and as a per-check/per-class summary.

use anyhow::{Context, Result};
use gdal::vector::Geometry;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::classes::ClassCatalog;
use crate::config::Configuration;
use crate::error::{AggregationError, LookupError};
use crate::model::Verdict;
use crate::record::TileResultRecord;

pub const CSV_FILE: &str = "qaqc.csv";
pub const CENTROIDS_FILE: &str = "qaqc_centroids.geojson";
pub const POLYGONS_FILE: &str = "qaqc_polygons.geojson";
pub const SUMMARY_FILE: &str = "qaqc_summary.json";

const TILE_NAME_COLUMN: &str = "tile_name";
const CENTROID_COLUMN: &str = "tile_centroid";
const POLYGON_COLUMN: &str = "tile_polygon";
const PASSED_SUFFIX: &str = "_passed";
const CLASS_PREFIX: &str = "class";

/// Flattens a record into one row. Nested object keys are merged into the
/// parent; arrays are kept as their JSON text.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut row = BTreeMap::new();
    if let Value::Object(map) = value {
        flatten_into(map, &mut row);
    }
    row
}

fn flatten_into(map: &Map<String, Value>, row: &mut BTreeMap<String, Value>) {
    for (key, value) in map {
        match value {
            Value::Object(nested) => flatten_into(nested, row),
            Value::Array(_) => {
                row.insert(key.clone(), Value::String(value.to_string()));
            }
            other => {
                row.insert(key.clone(), other.clone());
            }
        }
    }
}

/// One row per tile, sorted by tile name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectResultTable {
    /// Union of all row keys, `tile_name` first.
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, Value>>,
}

impl ProjectResultTable {
    pub fn from_rows(mut rows: Vec<BTreeMap<String, Value>>) -> Self {
        rows.sort_by(|a, b| row_name(a).cmp(row_name(b)));

        let keys: BTreeSet<&String> = rows.iter().flat_map(|r| r.keys()).collect();
        let mut columns = vec![TILE_NAME_COLUMN.to_string()];
        columns.extend(
            keys.into_iter()
                .filter(|k| k.as_str() != TILE_NAME_COLUMN)
                .cloned(),
        );

        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn tile_names(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(row_name)
    }

    pub fn value(&self, tile_name: &str, column: &str) -> Option<&Value> {
        self.rows
            .iter()
            .find(|r| row_name(r) == tile_name)
            .and_then(|r| r.get(column))
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), AggregationError> {
        let mut out = String::new();
        let header: Vec<String> = self.columns.iter().map(|c| csv_field(c)).collect();
        out.push_str(&header.join(","));
        out.push('\n');

        for row in &self.rows {
            let fields: Vec<String> = self
                .columns
                .iter()
                .map(|c| csv_field(&cell_text(row.get(c))))
                .collect();
            out.push_str(&fields.join(","));
            out.push('\n');
        }

        write_file(path, out)
    }

    /// Writes a GeoJSON feature collection with geometries parsed from the
    /// WKT in `geometry_column`. The other columns become properties, except
    /// the WKT columns themselves. Rows with missing or unparsable geometry
    /// are skipped.
    pub fn write_geojson(&self, path: &Path, geometry_column: &str) -> Result<usize, AggregationError> {
        let mut features = Vec::with_capacity(self.rows.len());

        for row in &self.rows {
            let name = row_name(row);
            let Some(wkt) = row.get(geometry_column).and_then(Value::as_str) else {
                warn!(tile = %name, "no {} value; feature skipped", geometry_column);
                continue;
            };
            let geometry = match wkt_to_geojson(wkt) {
                Ok(g) => g,
                Err(e) => {
                    warn!(tile = %name, "feature skipped: {:#}", e);
                    continue;
                }
            };

            let properties: Map<String, Value> = row
                .iter()
                .filter(|(k, _)| k.as_str() != CENTROID_COLUMN && k.as_str() != POLYGON_COLUMN)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            features.push(json!({
                "type": "Feature",
                "geometry": geometry,
                "properties": properties,
            }));
        }

        let count = features.len();
        let collection = json!({
            "type": "FeatureCollection",
            "features": features,
        });
        write_file(path, serde_json::to_string_pretty(&collection)?)?;
        Ok(count)
    }
}

fn row_name(row: &BTreeMap<String, Value>) -> &str {
    row.get(TILE_NAME_COLUMN)
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn wkt_to_geojson(wkt: &str) -> Result<Value> {
    let geometry =
        Geometry::from_wkt(wkt).with_context(|| format!("Invalid WKT geometry {wkt:?}"))?;
    let text = geometry
        .json()
        .context("Failed to encode geometry as GeoJSON")?;
    serde_json::from_str(&text).context("GDAL produced invalid GeoJSON")
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

fn write_file(path: &Path, contents: String) -> Result<(), AggregationError> {
    fs::write(path, contents).map_err(|source| AggregationError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckTally {
    pub passed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassSummary {
    pub label: Option<String>,
    pub points: u64,
    pub tiles: usize,
    pub expected: bool,
}

/// Project totals written to `qaqc_summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    pub tiles: usize,
    pub checks: BTreeMap<String, CheckTally>,
    pub classes: BTreeMap<u8, ClassSummary>,
}

/// Paths of the project-level files written by [`ResultAggregator::export`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFiles {
    pub csv: PathBuf,
    pub centroids: PathBuf,
    pub polygons: PathBuf,
    pub summary: PathBuf,
}

pub struct ResultAggregator {
    catalog: ClassCatalog,
    expected_classes: BTreeSet<u8>,
}

impl ResultAggregator {
    pub fn new(catalog: ClassCatalog, expected_classes: BTreeSet<u8>) -> Self {
        Self {
            catalog,
            expected_classes,
        }
    }

    /// Class labels for the configured version, overridden by the
    /// configured classification scheme when one is given.
    pub fn from_config(config: &Configuration) -> Result<Self, LookupError> {
        let mut catalog = ClassCatalog::for_version(config.check_keys.version.as_deref());
        if let Some(xml) = &config.las_classes_xml {
            catalog.merge(ClassCatalog::from_xml_file(xml)?);
        }
        Ok(Self::new(catalog, config.check_keys.exp_cls.clone()))
    }

    pub fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    /// Reads every `*.json` record in `result_dir`. Records that cannot be
    /// read or parsed are skipped.
    pub fn aggregate(&self, result_dir: &Path) -> Result<ProjectResultTable, AggregationError> {
        let read_dir_err = |source: std::io::Error| AggregationError::ReadDir {
            path: result_dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in fs::read_dir(result_dir).map_err(read_dir_err)? {
            let path = entry.map_err(read_dir_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut rows = Vec::with_capacity(paths.len());
        for path in &paths {
            match TileResultRecord::load(path).and_then(|record| Ok(serde_json::to_value(record)?)) {
                Ok(value) => rows.push(flatten(&value)),
                Err(e) => warn!("skipping record: {}", e),
            }
        }

        debug!(
            "aggregated {} of {} records from {}",
            rows.len(),
            paths.len(),
            result_dir.display()
        );
        Ok(ProjectResultTable::from_rows(rows))
    }

    pub fn summarize(&self, table: &ProjectResultTable) -> ProjectSummary {
        let mut checks: BTreeMap<String, CheckTally> = BTreeMap::new();
        let mut classes: BTreeMap<u8, ClassSummary> = BTreeMap::new();

        for row in &table.rows {
            for (key, value) in row {
                if let Some(check) = key.strip_suffix(PASSED_SUFFIX) {
                    let tally = checks.entry(check.to_string()).or_default();
                    match value.as_str() {
                        Some(v) if v == Verdict::Passed.as_str() => tally.passed += 1,
                        Some(v) if v == Verdict::Failed.as_str() => tally.failed += 1,
                        _ => {}
                    }
                } else if let Some(code) = key
                    .strip_prefix(CLASS_PREFIX)
                    .and_then(|c| c.parse::<u8>().ok())
                {
                    let points = value.as_u64().unwrap_or(0);
                    let entry = classes.entry(code).or_insert_with(|| ClassSummary {
                        label: self.catalog.label(code).map(str::to_string),
                        points: 0,
                        tiles: 0,
                        expected: self.expected_classes.contains(&code),
                    });
                    entry.points += points;
                    entry.tiles += 1;
                }
            }
        }

        ProjectSummary {
            tiles: table.len(),
            checks,
            classes,
        }
    }

    /// Writes the CSV, both GeoJSON layers and the summary into `out_dir`.
    pub fn export(
        &self,
        table: &ProjectResultTable,
        out_dir: &Path,
    ) -> Result<ExportedFiles, AggregationError> {
        fs::create_dir_all(out_dir).map_err(|source| AggregationError::Write {
            path: out_dir.to_path_buf(),
            source,
        })?;

        let files = ExportedFiles {
            csv: out_dir.join(CSV_FILE),
            centroids: out_dir.join(CENTROIDS_FILE),
            polygons: out_dir.join(POLYGONS_FILE),
            summary: out_dir.join(SUMMARY_FILE),
        };

        table.write_csv(&files.csv)?;
        let centroids = table.write_geojson(&files.centroids, CENTROID_COLUMN)?;
        let polygons = table.write_geojson(&files.polygons, POLYGON_COLUMN)?;
        let summary = self.summarize(table);
        write_file(&files.summary, serde_json::to_string_pretty(&summary)?)?;

        info!(
            tiles = table.len(),
            centroids, polygons, "exported project results to {}", out_dir.display()
        );
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::CheckRegistry;
    use crate::config::test_support::sample_config;
    use crate::model::test_support::sample_tile;
    use crate::parser::header::FormatRevision;

    fn persisted_table(dir: &Path) -> ProjectResultTable {
        let config = sample_config(dir);
        for name in ["t2", "t1"] {
            let mut tile = sample_tile(name);
            CheckRegistry::standard().run(&mut tile, &config);
            TileResultRecord::from_tile(&tile, &BTreeMap::new())
                .persist(dir)
                .unwrap();
        }
        aggregator().aggregate(dir).unwrap()
    }

    fn aggregator() -> ResultAggregator {
        ResultAggregator::new(
            ClassCatalog::builtin(FormatRevision::Modern),
            BTreeSet::from([2, 40]),
        )
    }

    #[test]
    fn test_flatten() {
        let value = json!({
            "tile_name": "a",
            "extents": {"min_x": 1.0, "nested": {"deep": true}},
            "ids": [101, 102],
            "hdatum": null
        });
        let row = flatten(&value);
        assert_eq!(row["min_x"], json!(1.0));
        assert_eq!(row["deep"], json!(true));
        assert_eq!(row["ids"], json!("[101,102]"));
        assert_eq!(row["hdatum"], Value::Null);
        assert!(!row.contains_key("extents"));
    }

    #[test]
    fn test_aggregate_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());
        let results = config.results_dir();
        fs::create_dir_all(&results).unwrap();
        let table = persisted_table(&results);
        assert_eq!(table.len(), 2);

        fs::write(results.join("broken.json"), "not json").unwrap();
        fs::write(results.join("notes.txt"), "ignored").unwrap();
        let table = aggregator().aggregate(&results).unwrap();

        assert_eq!(table.tile_names().collect::<Vec<_>>(), vec!["t1", "t2"]);
        assert_eq!(table.columns[0], "tile_name");
        assert!(table.columns.contains(&"pdrf_passed".to_string()));
        assert_eq!(table.value("t1", "min_x"), Some(&json!(374000.25)));
        assert_eq!(table.value("t2", "class40"), Some(&json!(4)));
    }

    #[test]
    fn test_aggregate_missing_dir() {
        assert!(matches!(
            aggregator().aggregate(Path::new("/nonexistent/results")),
            Err(AggregationError::ReadDir { .. })
        ));
    }

    #[test]
    fn test_summary_counts() {
        let dir = tempfile::tempdir().unwrap();
        let table = persisted_table(dir.path());
        let summary = aggregator().summarize(&table);

        assert_eq!(summary.tiles, 2);
        assert_eq!(summary.checks["pdrf"], CheckTally { passed: 2, failed: 0 });
        let bathy = &summary.classes[&40];
        assert_eq!(bathy.points, 8);
        assert_eq!(bathy.tiles, 2);
        assert_eq!(bathy.label.as_deref(), Some("Bathymetric Point"));
        assert!(bathy.expected);
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("[101, 102]"), "\"[101, 102]\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");

        let dir = tempfile::tempdir().unwrap();
        let table = ProjectResultTable::from_rows(vec![BTreeMap::from([
            ("tile_name".to_string(), json!("t1")),
            ("pt_src_ids".to_string(), json!("[101, 102]")),
            ("hdatum".to_string(), Value::Null),
        ])]);
        let path = dir.path().join("qaqc.csv");
        table.write_csv(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "tile_name,hdatum,pt_src_ids\nt1,,\"[101, 102]\"\n"
        );
    }

    #[test]
    fn test_export_writes_all_files() {
        if gdal::DriverManager::get_driver_by_name("GeoJSON").is_err() {
            eprintln!("Skipping test: GeoJSON driver not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("results");
        fs::create_dir_all(&results).unwrap();
        let mut table = persisted_table(&results);
        table.rows[1].insert(POLYGON_COLUMN.to_string(), json!("POLYGON ((broken"));

        let files = aggregator().export(&table, dir.path()).unwrap();
        let polygons: Value =
            serde_json::from_str(&fs::read_to_string(&files.polygons).unwrap()).unwrap();
        assert_eq!(polygons["features"].as_array().unwrap().len(), 1);

        let centroids: Value =
            serde_json::from_str(&fs::read_to_string(&files.centroids).unwrap()).unwrap();
        let feature = &centroids["features"][0];
        assert_eq!(feature["geometry"]["type"], "Point");
        assert_eq!(feature["properties"]["tile_name"], "t1");
        assert!(feature["properties"].get("tile_polygon").is_none());

        assert!(files.csv.exists());
        assert!(files.summary.exists());
    }
}
