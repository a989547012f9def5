//! Run configuration ("answer key").
//!
//! Loaded once from a JSON document, validated, and then shared read-only
//! with every worker.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::checks::CHECK_NAMES;
use crate::error::ConfigError;
use crate::parser::header::{FormatRevision, GpsTimeType};
use crate::surface::SurfaceKind;

/// Directory, relative to `qaqc_dir`, holding the per-tile records.
pub const RESULTS_SUBDIR: &str = "tile_results/json";

const DEFAULT_PDAL_EXE: &str = "pdal";

/// A number that may also be written as a numeric string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    fn as_f64(&self, key: &str) -> Result<f64, ConfigError> {
        match self {
            Scalar::Number(n) => Ok(*n),
            Scalar::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(format!("{key}: {s:?} is not a number"))),
        }
    }

    fn as_text(&self) -> String {
        match self {
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.trim().to_string(),
        }
    }
}

/// `"02,40"` or `[2, 40]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ClassList {
    Codes(Vec<u8>),
    Text(String),
}

impl ClassList {
    fn parse(&self) -> Result<BTreeSet<u8>, ConfigError> {
        match self {
            ClassList::Codes(codes) => Ok(codes.iter().copied().collect()),
            ClassList::Text(text) => text
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<u8>().map_err(|_| {
                        ConfigError::invalid(format!("exp_cls: {s:?} is not a class code"))
                    })
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawCheckKeys {
    naming: Option<String>,
    version: Option<Scalar>,
    pdrf: Option<Scalar>,
    gps_time: Option<String>,
    hdatum: Option<String>,
    vdatum: Option<String>,
    pt_src_ids: Option<Scalar>,
    exp_cls: Option<ClassList>,
}

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    project_name: String,
    las_tile_dir: PathBuf,
    qaqc_dir: PathBuf,
    tile_size: Scalar,
    #[serde(default)]
    checks_to_do: BTreeMap<String, bool>,
    #[serde(default)]
    check_keys: RawCheckKeys,
    #[serde(default)]
    surfaces_to_make: BTreeMap<String, (bool, PathBuf)>,
    #[serde(default)]
    to_pyramid: bool,
    #[serde(default)]
    multiprocess: bool,
    #[serde(default)]
    epsg_json: Option<PathBuf>,
    #[serde(default)]
    las_classes_xml: Option<PathBuf>,
    #[serde(default)]
    pdal_exe: Option<PathBuf>,
    #[serde(default)]
    surface_classes: Option<SurfaceClassCodes>,
    #[serde(default)]
    workers: Option<usize>,
}

/// Expected values, one per check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckKeys {
    /// Descriptive only; the naming check uses a fixed pattern.
    pub naming: Option<String>,
    pub version: Option<String>,
    pub pdrf: Option<u8>,
    pub gps_time: Option<GpsTimeType>,
    pub hdatum: Option<String>,
    pub vdatum: Option<String>,
    pub pt_src_ids: Option<String>,
    pub exp_cls: BTreeSet<u8>,
}

/// Ground and bathymetry classification codes used to select surface
/// points, per format revision.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SurfaceClassCodes {
    pub legacy: Vec<u8>,
    pub modern: Vec<u8>,
}

impl Default for SurfaceClassCodes {
    fn default() -> Self {
        // Ground is 2 in both; bathymetry moved from 26 to 40 in 1.4.
        Self {
            legacy: vec![2, 26],
            modern: vec![2, 40],
        }
    }
}

impl SurfaceClassCodes {
    pub fn for_revision(&self, revision: FormatRevision) -> &[u8] {
        match revision {
            FormatRevision::Legacy => &self.legacy,
            FormatRevision::Modern => &self.modern,
        }
    }
}

/// An enabled surface type and where its rasters go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceTarget {
    pub kind: SurfaceKind,
    pub output_dir: PathBuf,
}

/// Validated, immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub project_name: String,
    pub las_tile_dir: PathBuf,
    pub qaqc_dir: PathBuf,
    pub tile_size: f64,
    /// Enabled check names.
    pub checks: BTreeSet<String>,
    pub check_keys: CheckKeys,
    pub surfaces: Vec<SurfaceTarget>,
    pub to_pyramid: bool,
    pub multiprocess: bool,
    pub epsg_json: Option<PathBuf>,
    pub las_classes_xml: Option<PathBuf>,
    pub pdal_exe: PathBuf,
    pub surface_classes: SurfaceClassCodes,
    pub workers: Option<usize>,
}

impl Configuration {
    /// Reads and validates a configuration document. Relative paths in the
    /// document are taken relative to the document's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let config = Self::from_json_str(&text, base)?;
        debug!("loaded configuration for project {}", config.project_name);
        Ok(config)
    }

    pub fn from_json_str(text: &str, base: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfiguration = serde_json::from_str(text)?;
        Self::from_raw(raw, base)
    }

    fn from_raw(raw: RawConfiguration, base: &Path) -> Result<Self, ConfigError> {
        let resolve = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };

        let tile_size = raw.tile_size.as_f64("tile_size")?;
        if !(tile_size.is_finite() && tile_size > 0.0) {
            return Err(ConfigError::invalid(format!(
                "tile_size must be a positive number, got {tile_size}"
            )));
        }

        let mut checks = BTreeSet::new();
        for (name, enabled) in raw.checks_to_do {
            if !CHECK_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "unknown check {name:?} in checks_to_do (known: {})",
                    CHECK_NAMES.join(", ")
                )));
            }
            if enabled {
                checks.insert(name);
            }
        }

        let check_keys = Self::check_keys(raw.check_keys)?;
        Self::require_keys(&checks, &check_keys)?;

        let mut surfaces = Vec::new();
        for (name, (enabled, dir)) in raw.surfaces_to_make {
            match SurfaceKind::from_config_key(&name) {
                Some(kind) if enabled => surfaces.push(SurfaceTarget {
                    kind,
                    output_dir: resolve(dir),
                }),
                Some(_) => {}
                None => warn!("surface type {:?} is not supported; skipped", name),
            }
        }

        if raw.workers == Some(0) {
            return Err(ConfigError::invalid("workers must be at least 1"));
        }

        Ok(Configuration {
            project_name: raw.project_name,
            las_tile_dir: resolve(raw.las_tile_dir),
            qaqc_dir: resolve(raw.qaqc_dir),
            tile_size,
            checks,
            check_keys,
            surfaces,
            to_pyramid: raw.to_pyramid,
            multiprocess: raw.multiprocess,
            epsg_json: raw.epsg_json.map(resolve),
            las_classes_xml: raw.las_classes_xml.map(resolve),
            pdal_exe: raw
                .pdal_exe
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PDAL_EXE)),
            surface_classes: raw.surface_classes.unwrap_or_default(),
            workers: raw.workers,
        })
    }

    fn check_keys(raw: RawCheckKeys) -> Result<CheckKeys, ConfigError> {
        let pdrf = match raw.pdrf {
            Some(value) => {
                let n = value.as_f64("check_keys.pdrf")?;
                if n.fract() != 0.0 || !(0.0..=10.0).contains(&n) {
                    return Err(ConfigError::invalid(format!(
                        "check_keys.pdrf must be a point format between 0 and 10, got {n}"
                    )));
                }
                Some(n as u8)
            }
            None => None,
        };

        let gps_time = match raw.gps_time.as_deref().map(str::trim) {
            Some(label) if label.eq_ignore_ascii_case(GpsTimeType::GpsWeekTime.label()) => {
                Some(GpsTimeType::GpsWeekTime)
            }
            Some(label) if label.eq_ignore_ascii_case(GpsTimeType::SatelliteGpsTime.label()) => {
                Some(GpsTimeType::SatelliteGpsTime)
            }
            Some(other) => {
                return Err(ConfigError::invalid(format!(
                    "check_keys.gps_time: expected {:?} or {:?}, got {other:?}",
                    GpsTimeType::GpsWeekTime.label(),
                    GpsTimeType::SatelliteGpsTime.label()
                )))
            }
            None => None,
        };

        Ok(CheckKeys {
            naming: raw.naming,
            version: raw.version.map(|v| v.as_text()),
            pdrf,
            gps_time,
            hdatum: raw.hdatum,
            vdatum: raw.vdatum,
            pt_src_ids: raw.pt_src_ids.map(|v| v.as_text()),
            exp_cls: raw.exp_cls.map(|c| c.parse()).transpose()?.unwrap_or_default(),
        })
    }

    /// Every enabled comparison check needs its expected value.
    fn require_keys(checks: &BTreeSet<String>, keys: &CheckKeys) -> Result<(), ConfigError> {
        for name in checks {
            let present = match name.as_str() {
                "version" => keys.version.is_some(),
                "pdrf" => keys.pdrf.is_some(),
                "gps_time" => keys.gps_time.is_some(),
                "hdatum" => keys.hdatum.is_some(),
                "vdatum" => keys.vdatum.is_some(),
                _ => true,
            };
            if !present {
                return Err(ConfigError::invalid(format!(
                    "check {name:?} is enabled but check_keys.{name} is missing"
                )));
            }
        }
        Ok(())
    }

    /// Fails when the tile directory is absent. Checked before any tile runs.
    pub fn ensure_inputs(&self) -> Result<(), ConfigError> {
        if !self.las_tile_dir.is_dir() {
            return Err(ConfigError::MissingInputDirectory(
                self.las_tile_dir.clone(),
            ));
        }
        Ok(())
    }

    pub fn results_dir(&self) -> PathBuf {
        self.qaqc_dir.join(RESULTS_SUBDIR)
    }

    pub fn is_check_enabled(&self, name: &str) -> bool {
        self.checks.contains(name)
    }

    pub fn surface(&self, kind: SurfaceKind) -> Option<&SurfaceTarget> {
        self.surfaces.iter().find(|s| s.kind == kind)
    }

    /// Pool size: one worker unless multiprocessing is on, then the
    /// configured count or half the logical CPUs.
    pub fn worker_count(&self) -> usize {
        if !self.multiprocess {
            return 1;
        }
        self.workers.unwrap_or_else(|| (num_cpus::get() / 2).max(1))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Configuration with every check enabled, expecting 1.4 / PDRF 6 tiles.
    pub fn sample_config(root: &Path) -> Configuration {
        let doc = serde_json::json!({
            "project_name": "test_project",
            "las_tile_dir": root.join("tiles"),
            "qaqc_dir": root.join("qaqc"),
            "tile_size": 500,
            "checks_to_do": {
                "naming": true, "version": true, "pdrf": true, "gps_time": true,
                "hdatum": true, "vdatum": true, "pt_src_ids": true, "exp_cls": true
            },
            "check_keys": {
                "naming": "####_######e_#[#######]n_las",
                "version": "1.4",
                "pdrf": 6,
                "gps_time": "Satellite GPS Time",
                "hdatum": "NAD83(2011) / UTM zone 19N",
                "vdatum": "NAVD88 height",
                "pt_src_ids": "Yes",
                "exp_cls": "02,40"
            },
            "surfaces_to_make": {
                "Dz": [true, root.join("dz")],
                "DEM": [false, root.join("dem")]
            },
            "to_pyramid": false,
            "multiprocess": false
        });
        Configuration::from_json_str(&doc.to_string(), root).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(extra: &str) -> String {
        format!(
            r#"{{"project_name": "p", "las_tile_dir": "tiles", "qaqc_dir": "qaqc", "tile_size": "500"{extra}}}"#
        )
    }

    #[test]
    fn test_tolerant_scalars() {
        let text = minimal(
            r#", "check_keys": {"pdrf": "6", "version": "1.4", "exp_cls": "02, 40,"},
                 "checks_to_do": {"pdrf": true, "version": false}"#,
        );
        let config = Configuration::from_json_str(&text, Path::new("/data")).unwrap();
        assert_eq!(config.tile_size, 500.0);
        assert_eq!(config.check_keys.pdrf, Some(6));
        assert_eq!(config.check_keys.version.as_deref(), Some("1.4"));
        assert_eq!(config.check_keys.exp_cls, BTreeSet::from([2, 40]));
        assert!(config.is_check_enabled("pdrf"));
        assert!(!config.is_check_enabled("version"));
        assert_eq!(config.las_tile_dir, Path::new("/data/tiles"));
        assert_eq!(config.results_dir(), Path::new("/data/qaqc/tile_results/json"));
    }

    #[test]
    fn test_class_list_array() {
        let text = minimal(r#", "check_keys": {"exp_cls": [2, 40, 45]}"#);
        let config = Configuration::from_json_str(&text, Path::new("")).unwrap();
        assert_eq!(config.check_keys.exp_cls, BTreeSet::from([2, 40, 45]));
    }

    #[test]
    fn test_rejects_unknown_check() {
        let text = minimal(r#", "checks_to_do": {"refraction": true}"#);
        let err = Configuration::from_json_str(&text, Path::new("")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_tile_size() {
        let text = r#"{"project_name": "p", "las_tile_dir": "t", "qaqc_dir": "q", "tile_size": -5}"#;
        assert!(Configuration::from_json_str(text, Path::new("")).is_err());
        let text = r#"{"project_name": "p", "las_tile_dir": "t", "qaqc_dir": "q", "tile_size": "big"}"#;
        assert!(Configuration::from_json_str(text, Path::new("")).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_pdrf() {
        let text = minimal(r#", "check_keys": {"pdrf": 11}"#);
        assert!(Configuration::from_json_str(&text, Path::new("")).is_err());
    }

    #[test]
    fn test_enabled_check_needs_key() {
        let text = minimal(r#", "checks_to_do": {"hdatum": true}"#);
        let err = Configuration::from_json_str(&text, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("check_keys.hdatum"));
    }

    #[test]
    fn test_unknown_surface_is_skipped() {
        let text = minimal(
            r#", "surfaces_to_make": {"Hillshade": [true, "hs"], "Dz": [true, "dz"], "DEM": [false, "dem"]}"#,
        );
        let config = Configuration::from_json_str(&text, Path::new("/q")).unwrap();
        assert_eq!(config.surfaces.len(), 1);
        assert_eq!(config.surfaces[0].kind, SurfaceKind::Dz);
        assert_eq!(config.surfaces[0].output_dir, Path::new("/q/dz"));
        assert!(config.surface(SurfaceKind::Dem).is_none());
    }

    #[test]
    fn test_worker_count() {
        let text = minimal(r#", "multiprocess": false, "workers": 8"#);
        let config = Configuration::from_json_str(&text, Path::new("")).unwrap();
        assert_eq!(config.worker_count(), 1);

        let text = minimal(r#", "multiprocess": true, "workers": 3"#);
        let config = Configuration::from_json_str(&text, Path::new("")).unwrap();
        assert_eq!(config.worker_count(), 3);

        let text = minimal(r#", "multiprocess": true"#);
        let config = Configuration::from_json_str(&text, Path::new("")).unwrap();
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_surface_class_defaults() {
        let codes = SurfaceClassCodes::default();
        assert_eq!(codes.for_revision(FormatRevision::Legacy), &[2, 26]);
        assert_eq!(codes.for_revision(FormatRevision::Modern), &[2, 40]);
    }

    #[test]
    fn test_missing_input_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_support::sample_config(dir.path());
        assert!(matches!(
            config.ensure_inputs(),
            Err(ConfigError::MissingInputDirectory(_))
        ));
        fs::create_dir(dir.path().join("tiles")).unwrap();
        config.ensure_inputs().unwrap();
    }
}
