//! Pre-processing input checks.
//!
//! Existence and grid compatibility come first; then windowed scans of the
//! prediction, mastergrid and constraining rasters confirm each holds usable
//! data. Every failure here is fatal.
use std::collections::BTreeSet;
use std::path::Path;

use log::info;

use crate::config::{MapperConfig, ProcessingConfig};
use crate::error::{Result, TaskFailure, ValidationError};
use crate::pool::WorkerPool;
use crate::raster::{RasterProfile, RasterReader};
use crate::zonal::{zone_key, ZoneId};

/// Valid-pixel count and value range of one raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueScan {
    pub valid_pixels: u64,
    pub min: f64,
    pub max: f64,
}

impl Default for ValueScan {
    fn default() -> Self {
        Self { valid_pixels: 0, min: f64::INFINITY, max: f64::NEG_INFINITY }
    }
}

impl ValueScan {
    fn merge(mut self, other: ValueScan) -> Self {
        self.valid_pixels += other.valid_pixels;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self
    }
}

/// Distinct zone ids present on a mastergrid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneScan {
    pub zones: BTreeSet<ZoneId>,
    pub valid_pixels: u64,
}

impl ZoneScan {
    pub fn range(&self) -> Option<(ZoneId, ZoneId)> {
        Some((*self.zones.first()?, *self.zones.last()?))
    }
}

#[derive(Debug, Clone)]
pub struct InputReport {
    pub prediction: ValueScan,
    pub mastergrid: ZoneScan,
    pub constrain: Option<ValueScan>,
    pub failures: Vec<TaskFailure>,
    /// Windows scanned across all passes.
    pub windows: usize,
}

fn require_file(kind: &str, path: &Path) -> std::result::Result<(), ValidationError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ValidationError::MissingFile { kind: kind.to_string(), path: path.to_path_buf() })
    }
}

fn profile_of(path: &Path) -> Result<RasterProfile> {
    Ok(RasterReader::open(path)?.profile().clone())
}

/// Count finite non-nodata pixels of `path` and their range.
pub fn scan_values(
    label: &str,
    path: &Path,
    config: &ProcessingConfig,
) -> Result<(ValueScan, Vec<TaskFailure>)> {
    let profile = profile_of(path)?;
    let windows = config.windows(profile.width, profile.height);
    let output = WorkerPool::new(config).run(&format!("scan {label}"), &windows, |window| {
        let block = RasterReader::open(path)?.read_window(window)?;
        let mut scan = ValueScan::default();
        for &v in &block.data {
            if v.is_finite() && !profile.is_nodata(v) {
                scan.valid_pixels += 1;
                scan.min = scan.min.min(v);
                scan.max = scan.max.max(v);
            }
        }
        Ok(scan)
    })?;
    let failures = output.failures.clone();
    let scan = output.completed().fold(ValueScan::default(), |acc, (_, s)| acc.merge(s));
    Ok((scan, failures))
}

/// Collect the distinct zone ids of a mastergrid.
pub fn scan_zones(path: &Path, config: &ProcessingConfig) -> Result<(ZoneScan, Vec<TaskFailure>)> {
    let profile = profile_of(path)?;
    let windows = config.windows(profile.width, profile.height);
    let output = WorkerPool::new(config).run("scan mastergrid", &windows, |window| {
        let block = RasterReader::open(path)?.read_window(window)?;
        let mut scan = ZoneScan::default();
        for &v in &block.data {
            if profile.is_nodata(v) {
                continue;
            }
            if let Some(zone) = zone_key(v) {
                scan.zones.insert(zone);
                scan.valid_pixels += 1;
            }
        }
        Ok(scan)
    })?;
    let failures = output.failures.clone();
    let scan = output.completed().fold(ZoneScan::default(), |mut acc, (_, s)| {
        acc.zones.extend(s.zones);
        acc.valid_pixels += s.valid_pixels;
        acc
    });
    Ok((scan, failures))
}

/// Check every configured raster exists, shares the mastergrid's grid, and
/// holds usable data.
pub fn validate_inputs(config: &MapperConfig) -> Result<InputReport> {
    info!("Starting input validation");
    let processing = &config.processing;

    require_file("prediction", &config.prediction)?;
    require_file("mastergrid", &config.mastergrid)?;
    if let Some(mask) = &config.mask {
        require_file("mask", mask)?;
    }
    if let Some(constrain) = &config.constrain {
        require_file("constraining", constrain)?;
    }

    let mastergrid = profile_of(&config.mastergrid)?;
    let prediction = profile_of(&config.prediction)?;
    mastergrid.check_compatible(&prediction, ("mastergrid", "prediction"))?;
    if let Some(mask) = &config.mask {
        mastergrid.check_compatible(&profile_of(mask)?, ("mastergrid", "mask"))?;
    }
    if let Some(constrain) = &config.constrain {
        prediction.check_compatible(&profile_of(constrain)?, ("prediction", "constraining"))?;
    }

    let mut failures = Vec::new();
    let (pred_scan, failed) = scan_values("prediction", &config.prediction, processing)?;
    failures.extend(failed);
    if pred_scan.valid_pixels == 0 {
        return Err(ValidationError::NoValidData("prediction".into()).into());
    }
    info!(
        "Prediction raster: {}x{}, {} valid pixels, range [{:.2}, {:.2}], nodata {:?}",
        prediction.width,
        prediction.height,
        pred_scan.valid_pixels,
        pred_scan.min,
        pred_scan.max,
        prediction.nodata
    );

    let (zone_scan, failed) = scan_zones(&config.mastergrid, processing)?;
    failures.extend(failed);
    let Some((lo, hi)) = zone_scan.range() else {
        return Err(ValidationError::EmptyZoneSet.into());
    };
    info!(
        "Mastergrid: {} zones, id range [{lo}, {hi}], nodata {:?}",
        zone_scan.zones.len(),
        mastergrid.nodata
    );

    let constrain = match &config.constrain {
        Some(path) => {
            let (scan, failed) = scan_values("constraining", path, processing)?;
            failures.extend(failed);
            if scan.valid_pixels == 0 {
                return Err(ValidationError::NoValidData("constraining".into()).into());
            }
            info!("Constraining raster: {} valid pixels", scan.valid_pixels);
            Some(scan)
        }
        None => None,
    };

    let passes = if constrain.is_some() { 3 } else { 2 };
    let windows = processing.windows(mastergrid.width, mastergrid.height).len() * passes;
    info!("Input validation completed");
    Ok(InputReport { prediction: pred_scan, mastergrid: zone_scan, constrain, failures, windows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CensusConfig;
    use crate::raster::{write_raster, Block, DType, RasterWindow};
    use crate::Error;
    use std::path::PathBuf;

    fn raster(dir: &Path, name: &str, profile: &RasterProfile, data: Vec<f64>) -> PathBuf {
        let path = dir.join(name);
        let window = RasterWindow::full(profile.width, profile.height);
        write_raster(&path, profile, &Block::from_vec(window, data).unwrap()).unwrap();
        path
    }

    fn setup(dir: &Path, prediction: Vec<f64>, zones: Vec<f64>) -> MapperConfig {
        let zp = RasterProfile::new(3, 2, DType::I32).derive(DType::I32, Some(0.0));
        let pp = zp.derive(DType::F32, Some(-1.0));
        let pred = raster(dir, "pred.pgr", &pp, prediction);
        let zones = raster(dir, "zones.pgr", &zp, zones);
        let mut config = MapperConfig::new(pred, zones, CensusConfig::new(dir.join("c.csv")), dir);
        config.processing.block_size = (2, 1);
        config
    }

    fn validation(result: Result<InputReport>) -> ValidationError {
        match result {
            Err(Error::Validation(v)) => v,
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("validation unexpectedly passed"),
        }
    }

    #[test]
    fn reports_zones_and_prediction_range() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(
            dir.path(),
            vec![1.0, -1.0, 3.5, 0.5, 2.0, f64::NAN],
            vec![4.0, 4.0, 0.0, 9.0, 2.0, 2.0],
        );
        let report = validate_inputs(&config).unwrap();
        assert_eq!(report.prediction.valid_pixels, 4);
        assert_eq!((report.prediction.min, report.prediction.max), (0.5, 3.5));
        assert_eq!(report.mastergrid.zones.iter().copied().collect::<Vec<_>>(), vec![2, 4, 9]);
        assert_eq!(report.mastergrid.range(), Some((2, 9)));
        assert!(report.constrain.is_none());
    }

    #[test]
    fn empty_inputs_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let no_data = setup(dir.path(), vec![-1.0; 6], vec![1.0; 6]);
        assert_eq!(validation(validate_inputs(&no_data)), ValidationError::NoValidData("prediction".into()));

        let no_zones = setup(dir.path(), vec![1.0; 6], vec![0.0; 6]);
        assert_eq!(validation(validate_inputs(&no_zones)), ValidationError::EmptyZoneSet);
    }

    #[test]
    fn missing_and_misaligned_rasters_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = setup(dir.path(), vec![1.0; 6], vec![1.0; 6]);
        config.constrain = Some(dir.path().join("missing.pgr"));
        assert!(matches!(
            validation(validate_inputs(&config)),
            ValidationError::MissingFile { .. }
        ));

        let shifted = RasterProfile {
            crs: Some("EPSG:3857".into()),
            ..RasterProfile::new(3, 2, DType::U8)
        };
        config.constrain = Some(raster(dir.path(), "con.pgr", &shifted, vec![1.0; 6]));
        assert!(matches!(
            validation(validate_inputs(&config)),
            ValidationError::CrsMismatch { .. }
        ));
    }
}
