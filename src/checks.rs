//! Per-tile validation rules.
//!
//! Each rule is a [`Check`] registered by name in a [`CheckRegistry`]. Rules
//! never look at each other's results, so they can run in any order.

use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::error::CheckError;
use crate::model::{CheckResult, TileDescriptor, Verdict};
use crate::parser::header::FormatRevision;

/// Names accepted in `checks_to_do`.
pub const CHECK_NAMES: &[&str] = &[
    "naming",
    "version",
    "pdrf",
    "gps_time",
    "hdatum",
    "vdatum",
    "pt_src_ids",
    "exp_cls",
];

/// `<block>_<easting>e_<northing>n_las`
const TILE_NAME_PATTERN: &str = r"^(\d{4})_(\d{6})e_(\d{1,8})n_las$";

// Northern hemisphere UTM ranges.
const MIN_EASTING: u64 = 167_000;
const MAX_EASTING: u64 = 833_000;
const MIN_NORTHING: u64 = 0;
const MAX_NORTHING: u64 = 9_400_000;

pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(
        &self,
        tile: &TileDescriptor,
        config: &Configuration,
    ) -> Result<CheckResult, CheckError>;
}

fn result(name: &str, passed: bool, observed: Value) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        verdict: Verdict::from_bool(passed),
        observed,
    }
}

fn missing_key(check: &str) -> CheckError {
    CheckError::new(check, format!("no expected value configured for {check}"))
}

/// Formats codes the way the record stores lists: `[1, 2]`.
fn list_text<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    let items: Vec<String> = items.into_iter().map(|i| i.to_string()).collect();
    format!("[{}]", items.join(", "))
}

pub struct NamingCheck;

impl Check for NamingCheck {
    fn name(&self) -> &'static str {
        "naming"
    }

    fn evaluate(&self, tile: &TileDescriptor, _: &Configuration) -> Result<CheckResult, CheckError> {
        let pattern =
            Regex::new(TILE_NAME_PATTERN).map_err(|e| CheckError::new(self.name(), e.to_string()))?;

        let passed = match pattern.captures(&tile.name) {
            Some(caps) => {
                let easting: u64 = caps[2].parse().unwrap_or(u64::MAX);
                let northing: u64 = caps[3].parse().unwrap_or(u64::MAX);
                (MIN_EASTING..=MAX_EASTING).contains(&easting)
                    && (MIN_NORTHING..=MAX_NORTHING).contains(&northing)
            }
            None => false,
        };
        Ok(result(self.name(), passed, json!(tile.name)))
    }
}

pub struct VersionCheck;

impl Check for VersionCheck {
    fn name(&self) -> &'static str {
        "version"
    }

    fn evaluate(&self, tile: &TileDescriptor, config: &Configuration) -> Result<CheckResult, CheckError> {
        let expected = config
            .check_keys
            .version
            .as_deref()
            .ok_or_else(|| missing_key(self.name()))?;
        let version = tile.version();
        Ok(result(self.name(), version == expected, json!(version)))
    }
}

pub struct PdrfCheck;

impl Check for PdrfCheck {
    fn name(&self) -> &'static str {
        "pdrf"
    }

    fn evaluate(&self, tile: &TileDescriptor, config: &Configuration) -> Result<CheckResult, CheckError> {
        let expected = config.check_keys.pdrf.ok_or_else(|| missing_key(self.name()))?;
        let pdrf = tile.header.point_format;
        Ok(result(self.name(), pdrf == expected, json!(pdrf)))
    }
}

pub struct GpsTimeCheck;

impl Check for GpsTimeCheck {
    fn name(&self) -> &'static str {
        "gps_time"
    }

    fn evaluate(&self, tile: &TileDescriptor, config: &Configuration) -> Result<CheckResult, CheckError> {
        let expected = config
            .check_keys
            .gps_time
            .ok_or_else(|| missing_key(self.name()))?;
        let observed = tile.header.gps_time_type();
        Ok(result(self.name(), observed == expected, json!(observed.label())))
    }
}

/// Horizontal datum. A 1.4 tile also needs the WKT bit set.
pub struct HorizontalDatumCheck;

impl Check for HorizontalDatumCheck {
    fn name(&self) -> &'static str {
        "hdatum"
    }

    fn evaluate(&self, tile: &TileDescriptor, config: &Configuration) -> Result<CheckResult, CheckError> {
        let expected = config
            .check_keys
            .hdatum
            .as_deref()
            .ok_or_else(|| missing_key(self.name()))?;
        let matches = tile.horizontal_srs.as_deref() == Some(expected);
        let passed = match tile.revision() {
            FormatRevision::Modern => matches && tile.srs_source.is_authoritative(),
            FormatRevision::Legacy => matches,
        };
        Ok(result(self.name(), passed, json!(tile.horizontal_srs)))
    }
}

pub struct VerticalDatumCheck;

impl Check for VerticalDatumCheck {
    fn name(&self) -> &'static str {
        "vdatum"
    }

    fn evaluate(&self, tile: &TileDescriptor, config: &Configuration) -> Result<CheckResult, CheckError> {
        let expected = config
            .check_keys
            .vdatum
            .as_deref()
            .ok_or_else(|| missing_key(self.name()))?;
        let passed = tile.vertical_srs.as_deref() == Some(expected);
        Ok(result(self.name(), passed, json!(tile.vertical_srs)))
    }
}

/// More than one flight line must contribute to the tile.
pub struct PointSourceIdsCheck;

impl Check for PointSourceIdsCheck {
    fn name(&self) -> &'static str {
        "pt_src_ids"
    }

    fn evaluate(&self, tile: &TileDescriptor, _: &Configuration) -> Result<CheckResult, CheckError> {
        let ids = tile.points.point_source_ids();
        Ok(result(self.name(), ids.len() > 1, json!(list_text(&ids))))
    }
}

/// No classification codes outside the expected set.
pub struct ExpectedClassesCheck;

impl Check for ExpectedClassesCheck {
    fn name(&self) -> &'static str {
        "exp_cls"
    }

    fn evaluate(&self, tile: &TileDescriptor, config: &Configuration) -> Result<CheckResult, CheckError> {
        let present = tile.points.classes_present();
        let unexpected: Vec<u8> = present
            .difference(&config.check_keys.exp_cls)
            .copied()
            .collect();
        Ok(result(
            self.name(),
            unexpected.is_empty(),
            json!(list_text(&unexpected)),
        ))
    }
}

/// Checks keyed by name.
pub struct CheckRegistry {
    checks: BTreeMap<&'static str, Box<dyn Check>>,
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl CheckRegistry {
    pub fn empty() -> Self {
        Self {
            checks: BTreeMap::new(),
        }
    }

    /// All built-in checks.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(NamingCheck));
        registry.register(Box::new(VersionCheck));
        registry.register(Box::new(PdrfCheck));
        registry.register(Box::new(GpsTimeCheck));
        registry.register(Box::new(HorizontalDatumCheck));
        registry.register(Box::new(VerticalDatumCheck));
        registry.register(Box::new(PointSourceIdsCheck));
        registry.register(Box::new(ExpectedClassesCheck));
        registry
    }

    pub fn register(&mut self, check: Box<dyn Check>) {
        self.checks.insert(check.name(), check);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Check> {
        self.checks.get(name).map(|c| c.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.checks.keys().copied()
    }

    /// Evaluates one check, turning an error or a panic into a FAILED result
    /// whose observed value is the error text.
    pub fn evaluate_isolated(
        &self,
        name: &str,
        tile: &TileDescriptor,
        config: &Configuration,
    ) -> CheckResult {
        let outcome = match self.get(name) {
            Some(check) => panic::catch_unwind(AssertUnwindSafe(|| check.evaluate(tile, config)))
                .unwrap_or_else(|payload| {
                    Err(CheckError::new(name, panic_message(payload.as_ref())))
                }),
            None => Err(CheckError::new(name, "no such check is registered")),
        };

        match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(tile = %tile.name, check = name, "{}", err);
                result(name, false, json!(err.to_string()))
            }
        }
    }

    /// Runs every check enabled in the configuration and records exactly one
    /// verdict per check on the tile.
    pub fn run(&self, tile: &mut TileDescriptor, config: &Configuration) {
        for name in &config.checks {
            let outcome = self.evaluate_isolated(name, tile, config);
            debug!(
                tile = %tile.name,
                check = %name,
                verdict = %outcome.verdict,
                observed = %outcome.observed,
                "check evaluated"
            );
            tile.record_check(outcome);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-text payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::sample_config;
    use crate::model::test_support::sample_tile;
    use std::collections::BTreeSet;

    const GOOD_NAME: &str = "2016_374000e_4594000n_las";

    fn config() -> Configuration {
        sample_config(std::path::Path::new("/tmp/qchecker-checks"))
    }

    fn verdict(check: &dyn Check, tile: &TileDescriptor, config: &Configuration) -> Verdict {
        check.evaluate(tile, config).unwrap().verdict
    }

    #[test]
    fn test_naming() {
        let config = config();
        assert_eq!(verdict(&NamingCheck, &sample_tile(GOOD_NAME), &config), Verdict::Passed);
        assert_eq!(verdict(&NamingCheck, &sample_tile("random_file"), &config), Verdict::Failed);
        // Easting outside the UTM range.
        assert_eq!(
            verdict(&NamingCheck, &sample_tile("2016_900000e_4594000n_las"), &config),
            Verdict::Failed
        );
        // Trailing text is not allowed.
        assert_eq!(
            verdict(&NamingCheck, &sample_tile("2016_374000e_4594000n_las_v2"), &config),
            Verdict::Failed
        );
    }

    #[test]
    fn test_version() {
        let config = config();
        let mut tile = sample_tile(GOOD_NAME);
        assert_eq!(verdict(&VersionCheck, &tile, &config), Verdict::Passed);
        tile.header.version_minor = 2;
        let result = VersionCheck.evaluate(&tile, &config).unwrap();
        assert_eq!(result.verdict, Verdict::Failed);
        assert_eq!(result.observed, json!("1.2"));
    }

    #[test]
    fn test_pdrf_independent_of_version() {
        let config = config();
        let mut tile = sample_tile(GOOD_NAME);
        tile.header.version_minor = 2;
        assert_eq!(verdict(&PdrfCheck, &tile, &config), Verdict::Passed);
        tile.header.point_format = 3;
        assert_eq!(verdict(&PdrfCheck, &tile, &config), Verdict::Failed);
    }

    #[test]
    fn test_gps_time() {
        let config = config();
        let mut tile = sample_tile(GOOD_NAME);
        assert_eq!(verdict(&GpsTimeCheck, &tile, &config), Verdict::Passed);
        tile.header.global_encoding = 0b10000;
        let result = GpsTimeCheck.evaluate(&tile, &config).unwrap();
        assert_eq!(result.verdict, Verdict::Failed);
        assert_eq!(result.observed, json!("GPS Week Time"));
    }

    #[test]
    fn test_hdatum_requires_wkt_flag_for_modern() {
        let config = config();
        let mut tile = sample_tile(GOOD_NAME);
        assert_eq!(verdict(&HorizontalDatumCheck, &tile, &config), Verdict::Passed);

        tile.srs_source = crate::srs::SpatialReferenceSource::Wkt {
            wkt: None,
            authoritative: false,
        };
        assert_eq!(verdict(&HorizontalDatumCheck, &tile, &config), Verdict::Failed);

        tile.horizontal_srs = None;
        let result = HorizontalDatumCheck.evaluate(&tile, &config).unwrap();
        assert_eq!(result.verdict, Verdict::Failed);
        assert_eq!(result.observed, Value::Null);
    }

    #[test]
    fn test_vdatum() {
        let config = config();
        let mut tile = sample_tile(GOOD_NAME);
        assert_eq!(verdict(&VerticalDatumCheck, &tile, &config), Verdict::Passed);
        tile.vertical_srs = Some("MLLW".into());
        assert_eq!(verdict(&VerticalDatumCheck, &tile, &config), Verdict::Failed);
    }

    #[test]
    fn test_point_source_ids() {
        let config = config();
        let mut tile = sample_tile(GOOD_NAME);
        let result = PointSourceIdsCheck.evaluate(&tile, &config).unwrap();
        assert_eq!(result.verdict, Verdict::Passed);
        assert_eq!(result.observed, json!("[101, 102]"));

        tile.points.flight_lines.remove(&102);
        assert_eq!(verdict(&PointSourceIdsCheck, &tile, &config), Verdict::Failed);
    }

    #[test]
    fn test_expected_classes() {
        let config = config();
        let mut tile = sample_tile(GOOD_NAME);
        assert_eq!(verdict(&ExpectedClassesCheck, &tile, &config), Verdict::Passed);

        tile.points.class_counts.insert(7, 12);
        let result = ExpectedClassesCheck.evaluate(&tile, &config).unwrap();
        assert_eq!(result.verdict, Verdict::Failed);
        assert_eq!(result.observed, json!("[7]"));
    }

    struct PanickingCheck;

    impl Check for PanickingCheck {
        fn name(&self) -> &'static str {
            "naming"
        }

        fn evaluate(&self, _: &TileDescriptor, _: &Configuration) -> Result<CheckResult, CheckError> {
            panic!("boom")
        }
    }

    #[test]
    fn test_panicking_check_recorded_as_failed() {
        let config = config();
        let mut registry = CheckRegistry::standard();
        registry.register(Box::new(PanickingCheck));

        let mut tile = sample_tile(GOOD_NAME);
        registry.run(&mut tile, &config);

        let naming = &tile.checks_result["naming"];
        assert_eq!(naming.verdict, Verdict::Failed);
        assert!(naming.observed.as_str().unwrap().contains("boom"));
    }

    #[test]
    fn test_every_enabled_check_has_a_verdict() {
        let config = config();
        let mut tile = sample_tile(GOOD_NAME);
        CheckRegistry::standard().run(&mut tile, &config);

        let recorded: BTreeSet<&str> = tile.checks_result.keys().map(String::as_str).collect();
        let enabled: BTreeSet<&str> = config.checks.iter().map(String::as_str).collect();
        assert_eq!(recorded, enabled);
        assert!(tile
            .checks_result
            .values()
            .all(|r| r.verdict == Verdict::Passed));
    }

    #[test]
    fn test_registry_names() {
        let names: Vec<&str> = CheckRegistry::standard().names().collect();
        let mut expected = CHECK_NAMES.to_vec();
        expected.sort_unstable();
        assert_eq!(names, expected);
    }
}
