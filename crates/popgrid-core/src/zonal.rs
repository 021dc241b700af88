//! Zonal statistics over a zone raster ("mastergrid").
//!
//! Each window produces a partial table of per-zone accumulators; partial
//! tables are merged once, in window-index order, after the pass completes.
//! Sums are carried exactly and rounded only when summarised, so the merge is
//! associative and commutative and the result does not depend on tiling or
//! on task completion order.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;

use crate::config::ProcessingConfig;
use crate::error::{Result, TaskFailure, ValidationError};
use crate::pool::WorkerPool;
use crate::raster::{Block, RasterProfile, RasterReader};
use crate::sum::ExactSum;

/// Integer id of a census reporting unit.
pub type ZoneId = i64;

/// Map a zone-raster pixel or census id onto a [`ZoneId`].
///
/// Non-finite values are never zones. Finite values round to the nearest
/// integer, ties away from zero, so `2.9999` and `3.0` both address zone 3.
pub fn zone_key(value: f64) -> Option<ZoneId> {
    if !value.is_finite() {
        return None;
    }
    let rounded = value.round();
    if rounded < i64::MIN as f64 || rounded >= i64::MAX as f64 {
        return None;
    }
    Some(rounded as ZoneId)
}

// ── Accumulation ──────────────────────────────────────────────────────────────

/// Running (count, sum, sum², min, max) of one zone's valid target pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneAccumulator {
    pub count: u64,
    pub sum: ExactSum,
    pub sum_sq: ExactSum,
    pub min: f64,
    pub max: f64,
}

impl Default for ZoneAccumulator {
    fn default() -> Self {
        Self {
            count: 0,
            sum: ExactSum::new(),
            sum_sq: ExactSum::new(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl ZoneAccumulator {
    #[inline]
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum.add(value);
        self.sum_sq.add(value * value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &ZoneAccumulator) {
        self.count += other.count;
        self.sum.merge(&other.sum);
        self.sum_sq.merge(&other.sum_sq);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

pub type ZoneTable = BTreeMap<ZoneId, ZoneAccumulator>;

/// Accumulate one window. `zones` and `target` must cover the same window.
///
/// Pixels whose zone is nodata or not a valid id, or whose target value is
/// non-finite or equal to `target_nodata`, are skipped. Zones without a
/// single valid pixel in the window do not appear in the result.
pub fn accumulate_block(
    zones: &Block,
    zone_profile: &RasterProfile,
    target: &Block,
    target_nodata: Option<f64>,
) -> ZoneTable {
    let mut table = ZoneTable::new();
    for (&z, &v) in zones.data.iter().zip(target.data.iter()) {
        if zone_profile.is_nodata(z) || !v.is_finite() || target_nodata == Some(v) {
            continue;
        }
        if let Some(zone) = zone_key(z) {
            table.entry(zone).or_default().push(v);
        }
    }
    table
}

/// Fold partial tables together. Callers pass them in window-index order.
pub fn merge_tables<I>(partials: I) -> ZoneTable
where
    I: IntoIterator<Item = ZoneTable>,
{
    let mut merged = ZoneTable::new();
    for partial in partials {
        for (zone, acc) in partial {
            merged.entry(zone).or_default().merge(&acc);
        }
    }
    merged
}

// ── Summaries ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub variance: f64,
    pub std: f64,
}

impl From<&ZoneAccumulator> for ZoneSummary {
    fn from(acc: &ZoneAccumulator) -> Self {
        let n = acc.count as f64;
        let sum = acc.sum.value();
        let mean = if acc.count > 0 { sum / n } else { 0.0 };
        let variance = if acc.count > 0 {
            (acc.sum_sq.value() / n - mean * mean).max(0.0)
        } else {
            0.0
        };
        Self {
            count: acc.count,
            sum,
            min: acc.min,
            max: acc.max,
            mean,
            variance,
            std: variance.sqrt(),
        }
    }
}

/// Derive summaries, dropping zones with `count <= min_count`.
pub fn summarize(table: &ZoneTable, min_count: u64) -> BTreeMap<ZoneId, ZoneSummary> {
    let kept: BTreeMap<_, _> = table
        .iter()
        .filter(|(_, acc)| acc.count > min_count)
        .map(|(&zone, acc)| (zone, ZoneSummary::from(acc)))
        .collect();
    let dropped = table.len() - kept.len();
    if dropped > 0 {
        debug!("Dropped {dropped} zones with {min_count} or fewer valid pixels");
    }
    kept
}

/// Per-zone statistics of one target raster.
#[derive(Debug, Clone, Default)]
pub struct ZonalStats {
    pub zones: BTreeMap<ZoneId, ZoneSummary>,
    pub failures: Vec<TaskFailure>,
    /// Windows the pass was split into.
    pub windows: usize,
}

impl ZonalStats {
    pub fn get(&self, zone: ZoneId) -> Option<&ZoneSummary> {
        self.zones.get(&zone)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

// ── Raster passes ─────────────────────────────────────────────────────────────

/// Merged accumulators of one raster pass.
#[derive(Debug, Clone, Default)]
pub struct Accumulated {
    pub table: ZoneTable,
    pub failures: Vec<TaskFailure>,
    pub windows: usize,
}

/// Accumulate `target` over `zones` on the worker pool and merge the
/// partial tables. Windows whose task failed contribute nothing.
pub fn accumulate_rasters(
    pass: &str,
    target: &Path,
    zones: &Path,
    config: &ProcessingConfig,
    skip_value: Option<f64>,
) -> Result<Accumulated> {
    let zone_profile = RasterReader::open(zones)?.profile().clone();
    let target_profile = RasterReader::open(target)?.profile().clone();
    zone_profile.check_compatible(&target_profile, ("mastergrid", "target"))?;
    let target_nodata = skip_value.or(target_profile.nodata);

    let windows = config.windows(zone_profile.width, zone_profile.height);
    let pool = WorkerPool::new(config);
    let output = pool.run(pass, &windows, |window| {
        let zone_block = RasterReader::open(zones)?.read_window(window)?;
        let target_block = RasterReader::open(target)?.read_window(window)?;
        Ok(accumulate_block(&zone_block, &zone_profile, &target_block, target_nodata))
    })?;

    let failures = output.failures.clone();
    let table = merge_tables(output.completed().map(|(_, table)| table));
    Ok(Accumulated { table, failures, windows: windows.len() })
}

/// Zonal statistics of `target` within each zone of `zones`.
pub fn zonal_statistics(target: &Path, zones: &Path, config: &ProcessingConfig) -> Result<ZonalStats> {
    let pass = accumulate_rasters("zonal statistics", target, zones, config, None)?;
    let summaries = summarize(&pass.table, config.min_count);
    info!("Zonal statistics: {} zones from {}", summaries.len(), target.display());
    Ok(ZonalStats { zones: summaries, failures: pass.failures, windows: pass.windows })
}

/// Statistics of several named rasters against one zone raster, outer-joined
/// on zone id.
#[derive(Debug, Clone, Default)]
pub struct ZonalStack {
    pub names: Vec<String>,
    pub rows: BTreeMap<ZoneId, Vec<Option<ZoneSummary>>>,
    pub failures: Vec<TaskFailure>,
}

const STAT_SUFFIXES: [&str; 7] = ["count", "sum", "min", "max", "avg", "var", "std"];

impl ZonalStack {
    pub fn headers(&self, zone_column: &str) -> Vec<String> {
        let mut headers = vec![zone_column.to_string()];
        for name in &self.names {
            headers.extend(STAT_SUFFIXES.iter().map(|s| format!("{name}_{s}")));
        }
        headers
    }

    /// Write the joined table; missing statistics become empty cells.
    pub fn write_csv(&self, path: &Path, zone_column: &str) -> Result<()> {
        let mut out = csv::Writer::from_path(path)?;
        out.write_record(self.headers(zone_column))?;
        for (zone, cells) in &self.rows {
            let mut record = vec![zone.to_string()];
            for cell in cells {
                match cell {
                    Some(s) => record.extend([
                        s.count.to_string(),
                        s.sum.to_string(),
                        s.min.to_string(),
                        s.max.to_string(),
                        s.mean.to_string(),
                        s.variance.to_string(),
                        s.std.to_string(),
                    ]),
                    None => record.extend(std::iter::repeat(String::new()).take(STAT_SUFFIXES.len())),
                }
            }
            out.write_record(&record)?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Run one statistics pass per named raster and outer-join the results.
///
/// `skip_value`, when given, replaces every target's own nodata value.
pub fn zonal_statistics_stack(
    targets: &[(String, PathBuf)],
    zones: &Path,
    config: &ProcessingConfig,
    skip_value: Option<f64>,
) -> Result<ZonalStack> {
    let mut names: Vec<String> = Vec::with_capacity(targets.len());
    for (name, _) in targets {
        if names.contains(name) {
            return Err(ValidationError::Config(format!("duplicate raster name {name:?}")).into());
        }
        names.push(name.clone());
    }

    let mut rows: BTreeMap<ZoneId, Vec<Option<ZoneSummary>>> = BTreeMap::new();
    let mut failures = Vec::new();
    for (slot, (name, path)) in targets.iter().enumerate() {
        let pass = format!("zonal statistics [{name}]");
        let accumulated = accumulate_rasters(&pass, path, zones, config, skip_value)?;
        failures.extend(accumulated.failures);
        for (zone, summary) in summarize(&accumulated.table, config.min_count) {
            let cells = rows.entry(zone).or_insert_with(|| vec![None; targets.len()]);
            cells[slot] = Some(summary);
        }
    }
    info!("Zonal statistics stack: {} rasters, {} zones", names.len(), rows.len());
    Ok(ZonalStack { names, rows, failures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{write_raster, DType, RasterWindow};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn zone_key_rounds_and_rejects_non_finite() {
        assert_eq!(zone_key(3.0), Some(3));
        assert_eq!(zone_key(2.9999), Some(3));
        assert_eq!(zone_key(2.5), Some(3));
        assert_eq!(zone_key(-2.5), Some(-3));
        assert_eq!(zone_key(f64::NAN), None);
        assert_eq!(zone_key(f64::INFINITY), None);
    }

    #[test]
    fn block_accumulation_skips_nodata_on_both_sides() {
        let w = RasterWindow::full(3, 2);
        let zone_profile = RasterProfile::new(3, 2, DType::I32).derive(DType::I32, Some(0.0));
        let zones = Block::from_vec(w, vec![1.0, 1.0, 2.0, 0.0, 2.0, 2.0]).unwrap();
        let target = Block::from_vec(w, vec![1.0, 3.0, -9.0, 5.0, f64::NAN, 4.0]).unwrap();

        let table = accumulate_block(&zones, &zone_profile, &target, Some(-9.0));
        assert_eq!(table.len(), 2);
        let one = &table[&1];
        assert_eq!(
            (one.count, one.sum.value(), one.sum_sq.value(), one.min, one.max),
            (2, 4.0, 10.0, 1.0, 3.0)
        );
        let two = &table[&2];
        assert_eq!((two.count, two.sum.value()), (1, 4.0));
    }

    #[test]
    fn zones_without_valid_pixels_are_absent() {
        let w = RasterWindow::full(2, 1);
        let zone_profile = RasterProfile::new(2, 1, DType::I32);
        let zones = Block::from_vec(w, vec![7.0, 7.0]).unwrap();
        let target = Block::from_vec(w, vec![f64::NAN, f64::NAN]).unwrap();
        assert!(accumulate_block(&zones, &zone_profile, &target, None).is_empty());
    }

    #[test]
    fn summary_floors_variance_and_guards_empty_zones() {
        let mut acc = ZoneAccumulator::default();
        for _ in 0..3 {
            acc.push(0.1);
        }
        let s = ZoneSummary::from(&acc);
        assert!(s.variance >= 0.0);
        assert!(s.std.is_finite());
        assert_relative_eq!(s.mean, 0.1, epsilon = 1e-12);

        let empty = ZoneSummary::from(&ZoneAccumulator::default());
        assert_eq!((empty.mean, empty.variance), (0.0, 0.0));

        let mut spread = ZoneAccumulator::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            spread.push(v);
        }
        let s = ZoneSummary::from(&spread);
        assert_relative_eq!(s.mean, 5.0);
        assert_relative_eq!(s.variance, 4.0);
        assert_relative_eq!(s.std, 2.0);
    }

    #[test]
    fn min_count_filters_small_zones() {
        let mut table = ZoneTable::new();
        let mut small = ZoneAccumulator::default();
        small.push(1.0);
        let mut big = ZoneAccumulator::default();
        big.push(1.0);
        big.push(2.0);
        table.insert(1, small);
        table.insert(2, big);
        assert_eq!(summarize(&table, 0).len(), 2);
        assert_eq!(summarize(&table, 1).keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    fn random_pair(dir: &Path, seed: u64, width: usize, height: usize) -> (PathBuf, PathBuf) {
        let mut rng = StdRng::seed_from_u64(seed);
        let window = RasterWindow::full(width, height);
        let zones: Vec<f64> = (0..width * height).map(|_| f64::from(rng.gen_range(0..6))).collect();
        let target: Vec<f64> = (0..width * height)
            .map(|_| if rng.gen_bool(0.1) { -1.0 } else { f64::from(rng.gen_range(0..50)) })
            .collect();

        let zone_path = dir.join(format!("zones_{seed}.pgr"));
        let target_path = dir.join(format!("target_{seed}.pgr"));
        let zone_profile = RasterProfile::new(width, height, DType::I32).derive(DType::I32, Some(0.0));
        let target_profile = zone_profile.derive(DType::F32, Some(-1.0));
        write_raster(&zone_path, &zone_profile, &Block::from_vec(window, zones).unwrap()).unwrap();
        write_raster(&target_path, &target_profile, &Block::from_vec(window, target).unwrap())
            .unwrap();
        (zone_path, target_path)
    }

    #[test]
    fn tiled_statistics_equal_whole_raster_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        for seed in 0..4 {
            let (width, height) = (rng.gen_range(5..40), rng.gen_range(5..40));
            let (zones, target) = random_pair(dir.path(), seed, width, height);

            let whole = ProcessingConfig { by_block: false, ..Default::default() };
            let expected = zonal_statistics(&target, &zones, &whole).unwrap();
            assert!(!expected.is_empty());

            for _ in 0..3 {
                let tiled = ProcessingConfig {
                    block_size: (rng.gen_range(1..12), rng.gen_range(1..12)),
                    max_workers: rng.gen_range(1..6),
                    ..Default::default()
                };
                let got = zonal_statistics(&target, &zones, &tiled).unwrap();
                assert_eq!(got.zones, expected.zones, "block size {:?}", tiled.block_size);
                assert!(got.failures.is_empty());
            }
        }
    }

    #[test]
    fn fractional_targets_sum_identically_under_any_tiling() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let (width, height) = (37, 29);
        let window = RasterWindow::full(width, height);
        let zones: Vec<f64> = (0..width * height).map(|_| f64::from(rng.gen_range(1..4))).collect();
        let target: Vec<f64> = (0..width * height).map(|_| rng.gen_range(0.0..1.0)).collect();

        let zone_path = dir.path().join("zones.pgr");
        let target_path = dir.path().join("density.pgr");
        let zone_profile = RasterProfile::new(width, height, DType::I32).derive(DType::I32, Some(0.0));
        write_raster(&zone_path, &zone_profile, &Block::from_vec(window, zones).unwrap()).unwrap();
        write_raster(
            &target_path,
            &zone_profile.derive(DType::F64, None),
            &Block::from_vec(window, target).unwrap(),
        )
        .unwrap();

        let whole = ProcessingConfig { by_block: false, ..Default::default() };
        let expected = zonal_statistics(&target_path, &zone_path, &whole).unwrap();
        assert_eq!(expected.len(), 3);
        for (block_size, max_workers) in [((5, 3), 4), ((1, 1), 2), ((36, 28), 3), ((7, 29), 1)] {
            let tiled = ProcessingConfig { block_size, max_workers, ..Default::default() };
            let got = zonal_statistics(&target_path, &zone_path, &tiled).unwrap();
            for (zone, summary) in &expected.zones {
                let other = &got.zones[zone];
                assert_eq!(other.sum.to_bits(), summary.sum.to_bits(), "zone {zone}, block {block_size:?}");
                assert_eq!(other.variance.to_bits(), summary.variance.to_bits());
            }
            assert_eq!(got.zones, expected.zones);
        }
    }

    #[test]
    fn mismatched_rasters_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (zones, _) = random_pair(dir.path(), 1, 6, 6);
        let (_, target) = random_pair(dir.path(), 2, 7, 6);
        let err = zonal_statistics(&target, &zones, &ProcessingConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Validation(ValidationError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn stack_outer_joins_prefixed_columns() {
        let dir = tempfile::tempdir().unwrap();
        let window = RasterWindow::full(2, 2);
        let zone_profile = RasterProfile::new(2, 2, DType::I32).derive(DType::I32, Some(0.0));
        let value_profile = zone_profile.derive(DType::F32, Some(-1.0));

        let zones = dir.path().join("zones.pgr");
        let a = dir.path().join("a.pgr");
        let b = dir.path().join("b.pgr");
        let z = Block::from_vec(window, vec![1.0, 1.0, 2.0, 2.0]).unwrap();
        write_raster(&zones, &zone_profile, &z).unwrap();
        let va = Block::from_vec(window, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        write_raster(&a, &value_profile, &va).unwrap();
        // zone 2 has no valid pixels in b
        let vb = Block::from_vec(window, vec![5.0, 5.0, -1.0, -1.0]).unwrap();
        write_raster(&b, &value_profile, &vb).unwrap();

        let targets = vec![("a".to_string(), a), ("b".to_string(), b)];
        let stack =
            zonal_statistics_stack(&targets, &zones, &ProcessingConfig::default(), None).unwrap();
        assert_eq!(stack.rows.len(), 2);
        assert_eq!(stack.rows[&1][1].map(|s| s.sum), Some(10.0));
        assert!(stack.rows[&2][1].is_none());
        assert_eq!(stack.rows[&2][0].map(|s| s.mean), Some(3.5));

        let headers = stack.headers("zone");
        assert_eq!(headers.len(), 15);
        assert_eq!(headers[1], "a_count");
        assert_eq!(headers[14], "b_std");

        let csv_path = dir.path().join("stats.csv");
        stack.write_csv(&csv_path, "zone").unwrap();
        let text = std::fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("2,2,7,3,4,3.5,"));
        assert!(lines[2].ends_with(",,,,,,"));
    }

    #[test]
    fn stack_rejects_duplicate_names() {
        let targets = vec![("x".to_string(), PathBuf::from("a")), ("x".to_string(), PathBuf::from("b"))];
        let err = zonal_statistics_stack(&targets, Path::new("z"), &ProcessingConfig::default(), None)
            .unwrap_err();
        assert!(matches!(err, crate::Error::Validation(ValidationError::Config(_))));
    }
}
