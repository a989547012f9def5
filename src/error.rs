//! Error types for every stage of a tile's QA/QC pipeline.
//!
//! Failures are contained at the smallest unit they affect: a check, a flight
//! line, a tile or a persisted record. Only [`ConfigError`] is fatal to a run.

use std::path::PathBuf;
use thiserror::Error;

/// The point-cloud container could not be decoded.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read error: {0}")]
    Read(#[from] std::io::Error),

    #[error("not a LAS file: expected signature \"LASF\", found {found:?}")]
    NotLas { found: [u8; 4] },

    #[error("truncated {section}: needed {needed} bytes, found {available}")]
    Truncated {
        section: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("unsupported LAS version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("unsupported point data record format {0}")]
    UnsupportedPointFormat(u8),

    #[error("compressed point data (format byte {0:#04x}) is not supported")]
    Compressed(u8),

    #[error("point record length {length} is too short for format {format} (minimum {minimum})")]
    RecordTooShort {
        format: u8,
        length: u16,
        minimum: u16,
    },

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// The coordinate-system lookup table could not be loaded.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("failed to read lookup table {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lookup table {} is not a JSON object of code/name pairs: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("classification scheme {} is malformed: {reason}", .path.display())]
    Xml { path: PathBuf, reason: String },
}

/// A single check could not be evaluated. Recorded as FAILED, never propagated.
#[derive(Error, Debug)]
#[error("check '{check}' failed to run: {reason}")]
pub struct CheckError {
    pub check: String,
    pub reason: String,
}

impl CheckError {
    pub fn new(check: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            reason: reason.into(),
        }
    }
}

/// A surface could not be produced for a flight line or a tile.
#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("rasterizer failed for {target}: {reason}")]
    Rasterizer { target: String, reason: String },

    #[error("raster grids differ: {0}")]
    GridMismatch(String),

    #[error("raster I/O failed: {0:#}")]
    Raster(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SurfaceError {
    pub fn rasterizer(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rasterizer {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// Collecting or exporting persisted per-tile records failed.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("failed to read result directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record {} is unreadable: {reason}", .path.display())]
    Record { path: PathBuf, reason: String },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fatal run-level errors, reported before any tile is processed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("input tile directory does not exist: {}", .0.display())]
    MissingInputDirectory(PathBuf),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}
