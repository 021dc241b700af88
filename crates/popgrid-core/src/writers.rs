//! Window-by-window raster materializers.
//!
//! Every writer creates its output up front (pre-filled with nodata), then
//! runs one pool task per window. Each task reads its inputs through its own
//! handles, computes the output block and writes it under the output lock.
//! Windows are disjoint, so every pixel is written at most once and pixels
//! of failed windows keep the nodata fill.
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::info;

use crate::config::ProcessingConfig;
use crate::error::{Result, TaskFailure, ValidationError};
use crate::normalize::FactorLookup;
use crate::pool::WorkerPool;
use crate::raster::{Block, DType, RasterProfile, RasterReader, RasterWindow, RasterWriter};
use crate::sum::ExactSum;
use crate::zonal::zone_key;

/// Nodata sentinel of the normalization and population rasters.
pub const OUTPUT_NODATA: f64 = -99.0;

/// What one materializer pass produced.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteSummary {
    pub path: PathBuf,
    /// Pixels that received a computed value.
    pub valid_pixels: usize,
    /// Sum of the computed values.
    pub total: f64,
    pub failures: Vec<TaskFailure>,
    pub windows: usize,
}

#[derive(Debug, Default)]
struct BlockStats {
    valid: usize,
    total: ExactSum,
}

fn materialize<F>(
    pass: &str,
    out: &Path,
    profile: &RasterProfile,
    config: &ProcessingConfig,
    compute: F,
) -> Result<WriteSummary>
where
    F: Fn(&RasterWindow) -> Result<(Block, BlockStats)> + Sync,
{
    let windows = config.windows(profile.width, profile.height);
    let writer = Mutex::new(RasterWriter::create(out, profile)?);

    let output = WorkerPool::new(config).run(pass, &windows, |window| {
        let (block, stats) = compute(window)?;
        writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_window(&block)?;
        Ok(stats)
    })?;

    let writer = writer.into_inner().unwrap_or_else(PoisonError::into_inner);
    let path = writer.finish()?;

    let failures = output.failures.clone();
    let (valid_pixels, total) = output.completed().fold(
        (0, ExactSum::new()),
        |(n, mut t), (_, s)| {
            t.merge(&s.total);
            (n + s.valid, t)
        },
    );
    let total = total.value();
    info!("{pass}: wrote {} ({valid_pixels} valid pixels)", path.display());
    Ok(WriteSummary { path, valid_pixels, total, failures, windows: windows.len() })
}

fn open_profile(path: &Path) -> Result<RasterProfile> {
    Ok(RasterReader::open(path)?.profile().clone())
}

/// Map each zone pixel through `factors` into a 32-bit float raster.
///
/// Zone nodata and zones without a factor become [`OUTPUT_NODATA`].
pub fn write_normalized_raster(
    zones: &Path,
    factors: &FactorLookup,
    out: &Path,
    config: &ProcessingConfig,
) -> Result<WriteSummary> {
    let zone_profile = open_profile(zones)?;
    let profile = zone_profile.derive(DType::F32, Some(OUTPUT_NODATA));

    materialize("normalized raster", out, &profile, config, |window| {
        let mut block = RasterReader::open(zones)?.read_window(window)?;
        let mut stats = BlockStats::default();
        for v in block.data.iter_mut() {
            let factor = if zone_profile.is_nodata(*v) {
                None
            } else {
                zone_key(*v).and_then(|zone| factors.get(zone))
            };
            *v = match factor {
                Some(f) => {
                    stats.valid += 1;
                    stats.total.add(f);
                    f
                }
                None => OUTPUT_NODATA,
            };
        }
        Ok((block, stats))
    })
}

/// Population = round(prediction × factor), half to even, as 32-bit ints.
///
/// A pixel that is nodata or non-finite in either input is written as
/// [`OUTPUT_NODATA`].
pub fn write_population_raster(
    prediction: &Path,
    factors: &Path,
    out: &Path,
    config: &ProcessingConfig,
) -> Result<WriteSummary> {
    let prediction_profile = open_profile(prediction)?;
    let factor_profile = open_profile(factors)?;
    prediction_profile.check_compatible(&factor_profile, ("prediction", "normalized raster"))?;
    let profile = prediction_profile.derive(DType::I32, Some(OUTPUT_NODATA));

    materialize("population raster", out, &profile, config, |window| {
        let pred = RasterReader::open(prediction)?.read_window(window)?;
        let mut block = RasterReader::open(factors)?.read_window(window)?;
        let mut stats = BlockStats::default();
        for (f, &p) in block.data.iter_mut().zip(&pred.data) {
            let valid = !prediction_profile.is_nodata(p)
                && p.is_finite()
                && !factor_profile.is_nodata(*f)
                && f.is_finite();
            let value = (p * *f).round_ties_even();
            *f = if valid && value.is_finite() {
                stats.valid += 1;
                stats.total.add(value);
                value
            } else {
                OUTPUT_NODATA
            };
        }
        Ok((block, stats))
    })
}

/// Copy `zones`, setting pixels to the zone nodata value wherever the
/// co-located `mask` pixel equals `exclude_value`.
pub fn write_masked_zones(
    zones: &Path,
    mask: &Path,
    exclude_value: f64,
    out: &Path,
    config: &ProcessingConfig,
) -> Result<WriteSummary> {
    let zone_profile = open_profile(zones)?;
    let mask_profile = open_profile(mask)?;
    zone_profile.check_compatible(&mask_profile, ("mastergrid", "mask"))?;
    let nodata = zone_profile
        .nodata
        .ok_or_else(|| ValidationError::NoNodata("mastergrid".into()))?;

    materialize("mask", out, &zone_profile, config, |window| {
        let mut block = RasterReader::open(zones)?.read_window(window)?;
        let mask_block = RasterReader::open(mask)?.read_window(window)?;
        let mut stats = BlockStats::default();
        for (z, &m) in block.data.iter_mut().zip(&mask_block.data) {
            if m == exclude_value {
                *z = nodata;
            } else if !zone_profile.is_nodata(*z) {
                stats.valid += 1;
            }
        }
        Ok((block, stats))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::write_raster;

    fn raster(dir: &Path, name: &str, profile: &RasterProfile, data: Vec<f64>) -> PathBuf {
        let path = dir.join(name);
        let window = RasterWindow::full(profile.width, profile.height);
        write_raster(&path, profile, &Block::from_vec(window, data).unwrap()).unwrap();
        path
    }

    fn read(path: &Path) -> Vec<f64> {
        RasterReader::open(path).unwrap().read_all().unwrap().data
    }

    fn zone_profile() -> RasterProfile {
        RasterProfile::new(4, 2, DType::I32).derive(DType::I32, Some(0.0))
    }

    fn tiled() -> ProcessingConfig {
        ProcessingConfig { block_size: (3, 1), max_workers: 3, ..Default::default() }
    }

    #[test]
    fn normalized_raster_maps_zones_through_factors() {
        let dir = tempfile::tempdir().unwrap();
        let zones = raster(dir.path(), "z.pgr", &zone_profile(), vec![
            1.0, 1.0, 2.0, 0.0, //
            3.0, 2.0, 2.0, 1.0,
        ]);
        let lookup = FactorLookup::from_pairs([(1, 1.0), (2, 0.5)]);
        let out = dir.path().join("norm.pgr");
        let summary = write_normalized_raster(&zones, &lookup, &out, &tiled()).unwrap();

        assert_eq!(summary.valid_pixels, 6);
        assert_eq!(summary.windows, 4);
        assert_eq!(read(&out), vec![1.0, 1.0, 0.5, -99.0, -99.0, 0.5, 0.5, 1.0]);
        let profile = RasterReader::open(&out).unwrap().profile().clone();
        assert_eq!((profile.dtype, profile.nodata), (DType::F32, Some(-99.0)));
    }

    #[test]
    fn population_rounds_and_propagates_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let pred_profile = zone_profile().derive(DType::F32, Some(-1.0));
        let norm_profile = zone_profile().derive(DType::F32, Some(-99.0));
        let pred = raster(dir.path(), "p.pgr", &pred_profile, vec![
            10.0, 7.0, 5.0, 5.0, //
            -1.0, 3.0, 7.0, 1.0,
        ]);
        let norm = raster(dir.path(), "n.pgr", &norm_profile, vec![
            0.25, 0.5, 0.5, -99.0, //
            1.0, 0.5, 0.5, 2.0,
        ]);
        let out = dir.path().join("pop.pgr");
        let summary = write_population_raster(&pred, &norm, &out, &tiled()).unwrap();

        // 2.5 → 2, 3.5 → 4 (half to even)
        assert_eq!(read(&out), vec![2.0, 4.0, 2.0, -99.0, -99.0, 2.0, 4.0, 2.0]);
        assert_eq!(summary.valid_pixels, 6);
        assert_eq!(summary.total, 16.0);
    }

    #[test]
    fn masked_zones_drop_excluded_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let zones = raster(dir.path(), "z.pgr", &zone_profile(), vec![
            1.0, 1.0, 2.0, 0.0, //
            3.0, 2.0, 2.0, 1.0,
        ]);
        let mask_profile = zone_profile().derive(DType::U8, None);
        let mask = raster(dir.path(), "m.pgr", &mask_profile, vec![
            1.0, 0.0, 1.0, 1.0, //
            0.0, 0.0, 1.0, 1.0,
        ]);
        let out = dir.path().join("constrained.pgr");
        let summary = write_masked_zones(&zones, &mask, 0.0, &out, &tiled()).unwrap();
        assert_eq!(read(&out), vec![1.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0, 1.0]);
        assert_eq!(summary.valid_pixels, 4);
    }

    #[test]
    fn masking_requires_zone_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let profile = zone_profile().derive(DType::I32, None);
        let zones = raster(dir.path(), "z.pgr", &profile, vec![1.0; 8]);
        let mask = raster(dir.path(), "m.pgr", &profile, vec![0.0; 8]);
        let err = write_masked_zones(&zones, &mask, 0.0, &dir.path().join("o.pgr"), &tiled())
            .unwrap_err();
        assert!(matches!(err, crate::Error::Validation(ValidationError::NoNodata(_))));
    }

    #[test]
    fn outputs_have_no_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let (w, h) = (13, 9);
        let zp = RasterProfile::new(w, h, DType::I32).derive(DType::I32, Some(0.0));
        let zones: Vec<f64> = (0..w * h).map(|i| f64::from((i % 5) as u8)).collect();
        let pred: Vec<f64> = (0..w * h).map(|i| if i % 7 == 0 { f64::NAN } else { i as f64 * 0.3 }).collect();
        let zones = raster(dir.path(), "z.pgr", &zp, zones);
        let pred = raster(dir.path(), "p.pgr", &zp.derive(DType::F32, None), pred);

        let config = ProcessingConfig { block_size: (4, 3), ..Default::default() };
        let lookup = FactorLookup::from_pairs([(1, 0.5), (2, 1.5), (4, 3.0)]);
        let norm = dir.path().join("n.pgr");
        let pop = dir.path().join("pop.pgr");
        write_normalized_raster(&zones, &lookup, &norm, &config).unwrap();
        write_population_raster(&pred, &norm, &pop, &config).unwrap();

        for path in [&norm, &pop] {
            assert!(read(path).iter().all(|v| v.is_finite() && (*v >= 0.0 || *v == OUTPUT_NODATA)));
        }
    }
}
