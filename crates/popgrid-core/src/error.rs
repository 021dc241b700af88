//! Error taxonomy for the processing core.
//!
//! Fatal problems surface as [`Error`]. Per-window task failures are contained
//! as [`TaskFailure`] records and only become an [`Error::PartialFailure`] when
//! the configured failure policy says so.
use std::path::PathBuf;

use thiserror::Error;

use crate::raster::RasterWindow;
use crate::zonal::ZoneId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("input validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to acquire {what}: {source}")]
    Resource {
        what: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{pass}: {failed} of {total} windows failed, above the configured failure threshold")]
    PartialFailure { pass: String, failed: usize, total: usize },

    #[error("mapping cancelled before stage {stage}")]
    Cancelled { stage: String },

    #[error("malformed raster file {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("window {window:?} lies outside a {width}x{height} raster")]
    WindowOutOfBounds {
        window: RasterWindow,
        width: usize,
        height: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Tiff(#[from] tiff::TiffError),
}

impl Error {
    pub fn resource<E>(what: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Resource { what: what.into(), source: Box::new(source) }
    }

    pub fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Format { path: path.into(), reason: reason.into() }
    }
}

/// Fatal, pre-processing input problems.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{kind} file not found at: {path}")]
    MissingFile { kind: String, path: PathBuf },

    #[error("CRS mismatch between {left} and {right}")]
    CrsMismatch { left: String, right: String },

    #[error("dimension mismatch between {left} ({left_dims:?}) and {right} ({right_dims:?})")]
    DimensionMismatch {
        left: String,
        right: String,
        left_dims: (usize, usize),
        right_dims: (usize, usize),
    },

    #[error("transform mismatch between {left} and {right}")]
    TransformMismatch { left: String, right: String },

    #[error("{0} raster contains no valid data")]
    NoValidData(String),

    #[error("mastergrid contains no valid zones")]
    EmptyZoneSet,

    #[error("{0} raster declares no nodata value, so pixels cannot be masked out")]
    NoNodata(String),

    #[error("missing required columns in census data: {0}")]
    MissingColumns(String),

    #[error("census row {row}: cannot parse {column} value {value:?}")]
    BadCensusValue { row: usize, column: String, value: String },

    #[error("found {0} negative population values in census data")]
    NegativePopulation(usize),

    #[error("total population must be greater than 0 (got {0})")]
    NonPositiveTotal(f64),

    #[error("unsupported census file format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A contained failure of one window's task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub window_index: usize,
    pub window: RasterWindow,
    pub message: String,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "window {} {:?}: {}", self.window_index, self.window, self.message)
    }
}

/// Non-fatal data problems. Logged when detected and returned with the
/// mapping outputs; processing always continues.
#[derive(Debug, Clone, PartialEq)]
pub enum DataQualityWarning {
    /// Recomputed population differs from the census total by more than the
    /// configured tolerance.
    ConservationDrift {
        variant: String,
        expected: f64,
        recomputed: f64,
        relative: f64,
    },
    /// Census zones absent from the zone raster statistics.
    UnmatchedCensusZones { variant: String, zones: Vec<ZoneId> },
    /// Zone raster zones absent from the census.
    UnmatchedStatisticsZones { variant: String, zones: Vec<ZoneId> },
    /// Zones present on the grid whose factor is undefined; their pixels
    /// are written as nodata.
    UndefinedFactors { variant: String, zones: Vec<ZoneId> },
    FailedWindows { pass: String, failed: usize, total: usize },
    DuplicateCensusIds { zones: Vec<ZoneId> },
}

fn preview(zones: &[ZoneId]) -> String {
    const SHOWN: usize = 10;
    let head: Vec<String> = zones.iter().take(SHOWN).map(i64::to_string).collect();
    if zones.len() > SHOWN {
        format!("{}, ... ({} total)", head.join(", "), zones.len())
    } else {
        head.join(", ")
    }
}

impl std::fmt::Display for DataQualityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataQualityWarning::ConservationDrift { variant, expected, recomputed, relative } => {
                write!(
                    f,
                    "{variant}: population drift {:.2}% (census {expected:.1}, recomputed {recomputed:.1})",
                    relative * 100.0
                )
            }
            DataQualityWarning::UnmatchedCensusZones { variant, zones } => {
                write!(f, "{variant}: {} census zones missing from statistics: {}", zones.len(), preview(zones))
            }
            DataQualityWarning::UnmatchedStatisticsZones { variant, zones } => {
                write!(f, "{variant}: {} grid zones missing from census: {}", zones.len(), preview(zones))
            }
            DataQualityWarning::UndefinedFactors { variant, zones } => {
                write!(f, "{variant}: {} zones without a valid normalization factor: {}", zones.len(), preview(zones))
            }
            DataQualityWarning::FailedWindows { pass, failed, total } => {
                write!(f, "{pass}: {failed} of {total} windows failed and were left as nodata")
            }
            DataQualityWarning::DuplicateCensusIds { zones } => {
                write!(f, "{} census ids appear more than once and were summed: {}", zones.len(), preview(zones))
            }
        }
    }
}
