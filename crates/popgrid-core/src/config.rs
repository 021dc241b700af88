//! Validated run configuration handed to the core by its caller.
//!
//! The core never reads configuration files; binaries deserialize these types
//! (serde) from whatever source they own and call [`MapperConfig::validate`].
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::raster::{plan_windows, RasterWindow};

/// What to do when some windows of a pass fail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum FailurePolicy {
    /// Log each failure, leave nodata in the failed region, and carry on.
    #[default]
    BestEffort,
    /// Fail the pass when more than this fraction (0–1) of its windows fail.
    MaxFailedFraction(f64),
}

impl FailurePolicy {
    pub fn allows(&self, failed: usize, total: usize) -> bool {
        match *self {
            FailurePolicy::BestEffort => true,
            FailurePolicy::MaxFailedFraction(limit) => {
                total == 0 || (failed as f64 / total as f64) <= limit
            }
        }
    }
}

/// Tiling and concurrency settings shared by every windowed pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Process by tiles on the worker pool. When false each pass runs once,
    /// on the calling thread, over a single whole-raster window.
    pub by_block: bool,
    /// Tile size (width, height) in pixels.
    pub block_size: (usize, usize),
    pub max_workers: usize,
    /// Zones with a valid-pixel count at or below this are dropped from
    /// zonal statistics.
    pub min_count: u64,
    /// Relative population drift tolerated before a conservation warning.
    pub conservation_tolerance: f64,
    pub failure_policy: FailurePolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            by_block: true,
            block_size: (512, 512),
            max_workers: 4,
            min_count: 0,
            conservation_tolerance: 0.01,
            failure_policy: FailurePolicy::BestEffort,
        }
    }
}

impl ProcessingConfig {
    /// Windows for one pass over a `width` × `height` raster.
    pub fn windows(&self, width: usize, height: usize) -> Vec<RasterWindow> {
        if self.by_block {
            plan_windows(width, height, self.block_size.0, self.block_size.1)
        } else if width == 0 || height == 0 {
            Vec::new()
        } else {
            vec![RasterWindow::full(width, height)]
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.block_size.0 == 0 || self.block_size.1 == 0 {
            return Err(ValidationError::Config(format!(
                "block_size must be positive, got {:?}",
                self.block_size
            )));
        }
        if self.max_workers == 0 {
            return Err(ValidationError::Config("max_workers must be at least 1".into()));
        }
        if !(self.conservation_tolerance >= 0.0) {
            return Err(ValidationError::Config(format!(
                "conservation_tolerance must be non-negative, got {}",
                self.conservation_tolerance
            )));
        }
        if let FailurePolicy::MaxFailedFraction(f) = self.failure_policy {
            if !(0.0..=1.0).contains(&f) {
                return Err(ValidationError::Config(format!(
                    "failure fraction must lie in [0, 1], got {f}"
                )));
            }
        }
        Ok(())
    }
}

/// Where census counts come from and which columns hold them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CensusConfig {
    pub path: PathBuf,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_pop_column")]
    pub pop_column: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_pop_column() -> String {
    "pop".to_string()
}

impl CensusConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), id_column: default_id_column(), pop_column: default_pop_column() }
    }
}

/// Everything the dasymetric mapper needs for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapperConfig {
    /// Continuous weighting surface produced by an external model.
    pub prediction: PathBuf,
    /// Zone raster of census unit ids.
    pub mastergrid: PathBuf,
    pub census: CensusConfig,
    /// Optional age-sex table keyed by the census id column.
    #[serde(default)]
    pub agesex: Option<PathBuf>,
    /// Optional water mask; pixels equal to `mask_value` leave the mastergrid.
    #[serde(default)]
    pub mask: Option<PathBuf>,
    #[serde(default = "default_mask_value")]
    pub mask_value: f64,
    /// Optional constraining raster; pixels equal to `constrain_value` are
    /// excluded from the constrained variant.
    #[serde(default)]
    pub constrain: Option<PathBuf>,
    #[serde(default)]
    pub constrain_value: f64,
    pub output_dir: PathBuf,
    /// Also write a GeoTIFF next to every output raster.
    #[serde(default = "default_true")]
    pub export_geotiff: bool,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

fn default_mask_value() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl MapperConfig {
    pub fn new(
        prediction: impl Into<PathBuf>,
        mastergrid: impl Into<PathBuf>,
        census: CensusConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prediction: prediction.into(),
            mastergrid: mastergrid.into(),
            census,
            agesex: None,
            mask: None,
            mask_value: default_mask_value(),
            constrain: None,
            constrain_value: 0.0,
            output_dir: output_dir.into(),
            export_geotiff: true,
            processing: ProcessingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.processing.validate()?;
        if self.census.id_column.trim().is_empty() {
            return Err(ValidationError::Config("census id_column is empty".into()));
        }
        if self.census.pop_column.trim().is_empty() {
            return Err(ValidationError::Config("census pop_column is empty".into()));
        }
        Ok(())
    }
}
