//! Census ⋈ zonal-statistics join producing per-zone normalization factors.
//!
//! `factor = population / prediction_sum` wherever the zone appears on both
//! sides with a positive sum. Unmatched zones stay in the table with the
//! missing side empty and are reported as [`DataQualityWarning`]s.
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{DataQualityWarning, Result};
use crate::zonal::ZoneId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NormalizationRow {
    pub zone: ZoneId,
    pub population: Option<f64>,
    pub prediction_sum: Option<f64>,
    pub factor: Option<f64>,
}

/// Summary of one join, used for logging and warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationDiagnostics {
    pub variant: String,
    /// Census total before the join, unmatched zones included.
    pub input_total: f64,
    /// Σ prediction_sum × factor over zones with a valid factor.
    pub recomputed_total: f64,
    pub tolerance: f64,
    pub unmatched_census: Vec<ZoneId>,
    pub unmatched_stats: Vec<ZoneId>,
    pub zero_sums: usize,
    /// Zones present in the statistics whose factor is undefined.
    pub undefined_factors: Vec<ZoneId>,
}

impl NormalizationDiagnostics {
    pub fn relative_drift(&self) -> f64 {
        if self.input_total > 0.0 {
            (self.recomputed_total - self.input_total).abs() / self.input_total
        } else {
            0.0
        }
    }

    pub fn warnings(&self) -> Vec<DataQualityWarning> {
        let variant = || self.variant.clone();
        let mut out = Vec::new();
        if !self.unmatched_census.is_empty() {
            out.push(DataQualityWarning::UnmatchedCensusZones {
                variant: variant(),
                zones: self.unmatched_census.clone(),
            });
        }
        if !self.unmatched_stats.is_empty() {
            out.push(DataQualityWarning::UnmatchedStatisticsZones {
                variant: variant(),
                zones: self.unmatched_stats.clone(),
            });
        }
        if !self.undefined_factors.is_empty() {
            out.push(DataQualityWarning::UndefinedFactors {
                variant: variant(),
                zones: self.undefined_factors.clone(),
            });
        }
        let relative = self.relative_drift();
        if relative > self.tolerance {
            out.push(DataQualityWarning::ConservationDrift {
                variant: variant(),
                expected: self.input_total,
                recomputed: self.recomputed_total,
                relative,
            });
        }
        out
    }
}

/// Joined table, sorted by zone id.
#[derive(Debug, Clone)]
pub struct NormalizationTable {
    pub rows: Vec<NormalizationRow>,
    pub diagnostics: NormalizationDiagnostics,
}

impl NormalizationTable {
    pub fn lookup(&self) -> FactorLookup {
        FactorLookup::from_pairs(self.rows.iter().filter_map(|r| r.factor.map(|f| (r.zone, f))))
    }

    pub fn factor(&self, zone: ZoneId) -> Option<f64> {
        self.rows
            .binary_search_by_key(&zone, |r| r.zone)
            .ok()
            .and_then(|i| self.rows[i].factor)
    }

    pub fn valid_count(&self) -> usize {
        self.rows.iter().filter(|r| r.factor.is_some()).count()
    }

    pub fn warnings(&self) -> Vec<DataQualityWarning> {
        self.diagnostics.warnings()
    }

    /// Write the table as CSV; missing values become empty cells.
    pub fn write_csv(&self, path: &Path, zone_column: &str) -> Result<()> {
        let cell = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
        let mut out = csv::Writer::from_path(path)?;
        out.write_record([zone_column, "population", "prediction_sum", "factor"])?;
        for row in &self.rows {
            out.write_record([
                row.zone.to_string(),
                cell(row.population),
                cell(row.prediction_sum),
                cell(row.factor),
            ])?;
        }
        out.flush()?;
        Ok(())
    }

    fn build(variant: &str, rows: Vec<NormalizationRow>, input_total: f64, tolerance: f64) -> Self {
        let mut diagnostics = NormalizationDiagnostics {
            variant: variant.to_string(),
            input_total,
            recomputed_total: 0.0,
            tolerance,
            unmatched_census: Vec::new(),
            unmatched_stats: Vec::new(),
            zero_sums: 0,
            undefined_factors: Vec::new(),
        };
        for row in &rows {
            match (row.population, row.prediction_sum) {
                (Some(_), None) => diagnostics.unmatched_census.push(row.zone),
                (None, Some(_)) => diagnostics.unmatched_stats.push(row.zone),
                _ => {}
            }
            if let Some(sum) = row.prediction_sum {
                if sum == 0.0 {
                    diagnostics.zero_sums += 1;
                }
                match row.factor {
                    Some(factor) => diagnostics.recomputed_total += sum * factor,
                    None => diagnostics.undefined_factors.push(row.zone),
                }
            }
        }

        let table = Self { rows, diagnostics };
        table.log_summary();
        table
    }

    fn log_summary(&self) {
        let d = &self.diagnostics;
        info!(
            "{}: {} of {} zones normalized; census total {:.1}, recomputed {:.1}",
            d.variant,
            self.valid_count(),
            self.rows.len(),
            d.input_total,
            d.recomputed_total
        );
        debug!(
            "{}: {} unmatched census zones, {} unmatched grid zones, {} zero sums",
            d.variant,
            d.unmatched_census.len(),
            d.unmatched_stats.len(),
            d.zero_sums
        );
        for warning in d.warnings() {
            warn!("{warning}");
        }
    }
}

fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d > 0.0 => Some(n / d).filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Outer-join census populations with zonal prediction sums.
pub fn normalize(
    variant: &str,
    populations: &BTreeMap<ZoneId, f64>,
    prediction_sums: &BTreeMap<ZoneId, f64>,
    tolerance: f64,
) -> NormalizationTable {
    let zones: BTreeSet<ZoneId> = populations.keys().chain(prediction_sums.keys()).copied().collect();
    let rows = zones
        .into_iter()
        .map(|zone| {
            let population = populations.get(&zone).copied();
            let prediction_sum = prediction_sums.get(&zone).copied();
            NormalizationRow { zone, population, prediction_sum, factor: ratio(population, prediction_sum) }
        })
        .collect();
    let input_total = populations.values().sum();
    NormalizationTable::build(variant, rows, input_total, tolerance)
}

/// Unit-weight normalization: every zone in the statistics gets a
/// population of 1, so its factor is `1 / prediction_sum`.
pub fn unit_normalize(variant: &str, prediction_sums: &BTreeMap<ZoneId, f64>) -> NormalizationTable {
    let ones: BTreeMap<ZoneId, f64> = prediction_sums.keys().map(|&z| (z, 1.0)).collect();
    normalize(variant, &ones, prediction_sums, f64::INFINITY)
}

/// Stratum factors from a unit-weight table: `unit_factor × stratum count`.
pub fn stratum_normalize(
    variant: &str,
    unit: &NormalizationTable,
    stratum: &BTreeMap<ZoneId, f64>,
    tolerance: f64,
) -> NormalizationTable {
    let sums: BTreeMap<ZoneId, (Option<f64>, Option<f64>)> = unit
        .rows
        .iter()
        .filter(|r| r.prediction_sum.is_some())
        .map(|r| (r.zone, (r.prediction_sum, r.factor)))
        .collect();
    let zones: BTreeSet<ZoneId> = sums.keys().chain(stratum.keys()).copied().collect();
    let rows = zones
        .into_iter()
        .map(|zone| {
            let population = stratum.get(&zone).copied();
            let (prediction_sum, unit_factor) = sums.get(&zone).copied().unwrap_or((None, None));
            let factor = unit_factor.zip(population).map(|(u, p)| u * p).filter(|f| f.is_finite());
            NormalizationRow { zone, population, prediction_sum, factor }
        })
        .collect();
    let input_total = stratum.values().sum();
    NormalizationTable::build(variant, rows, input_total, tolerance)
}

/// Zone → factor map held as a sorted array for binary search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactorLookup {
    entries: Vec<(ZoneId, f64)>,
}

impl FactorLookup {
    /// Later duplicates of a zone are ignored.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (ZoneId, f64)>,
    {
        let mut entries: Vec<_> = pairs.into_iter().collect();
        entries.sort_by_key(|&(zone, _)| zone);
        entries.dedup_by_key(|&mut (zone, _)| zone);
        Self { entries }
    }

    #[inline]
    pub fn get(&self, zone: ZoneId) -> Option<f64> {
        self.entries
            .binary_search_by_key(&zone, |&(z, _)| z)
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn map(pairs: &[(ZoneId, f64)]) -> BTreeMap<ZoneId, f64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn factors_for_the_quadrant_scenario() {
        let census = map(&[(1, 40.0), (2, 20.0), (3, 10.0)]);
        let sums = map(&[(1, 40.0), (2, 40.0), (3, 40.0)]);
        let table = normalize("unconstrained", &census, &sums, 0.01);
        assert_eq!(table.factor(1), Some(1.0));
        assert_eq!(table.factor(2), Some(0.5));
        assert_eq!(table.factor(3), Some(0.25));
        assert_eq!(table.diagnostics.recomputed_total, 70.0);
        assert!(table.warnings().is_empty());
    }

    #[test]
    fn matched_factors_conserve_population() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let n = rng.gen_range(1..200);
            let census: BTreeMap<_, _> = (0..n).map(|z| (z, rng.gen_range(0.0..1e5))).collect();
            let sums: BTreeMap<_, _> = (0..n).map(|z| (z, rng.gen_range(1e-3..1e4))).collect();
            let table = normalize("random", &census, &sums, 0.01);
            let total: f64 = census.values().sum();
            assert_relative_eq!(table.diagnostics.recomputed_total, total, max_relative = 1e-12);
            assert!(table.diagnostics.relative_drift() < 1e-12);
        }
    }

    #[test]
    fn unmatched_zones_are_kept_and_reported() {
        let census = map(&[(1, 40.0), (9, 5.0)]);
        let sums = map(&[(1, 40.0), (4, 12.0)]);
        let table = normalize("unconstrained", &census, &sums, 0.01);

        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.diagnostics.unmatched_census, vec![9]);
        assert_eq!(table.diagnostics.unmatched_stats, vec![4]);
        assert_eq!(table.diagnostics.undefined_factors, vec![4]);
        assert_eq!(table.lookup().get(4), None);
        assert_eq!(table.lookup().get(1), Some(1.0));

        let warnings = table.warnings();
        assert!(warnings.contains(&DataQualityWarning::UnmatchedCensusZones {
            variant: "unconstrained".into(),
            zones: vec![9]
        }));
        // zone 9's population cannot be placed: 40 of 45 recovered
        assert!(warnings
            .iter()
            .any(|w| matches!(w, DataQualityWarning::ConservationDrift { .. })));
    }

    #[test]
    fn zero_sums_leave_factors_undefined() {
        let census = map(&[(1, 10.0), (2, 10.0)]);
        let sums = map(&[(1, 0.0), (2, 5.0)]);
        let table = normalize("v", &census, &sums, 0.5);
        assert_eq!(table.factor(1), None);
        assert_eq!(table.factor(2), Some(2.0));
        assert_eq!(table.diagnostics.zero_sums, 1);
        assert_eq!(table.valid_count(), 1);
        assert_relative_eq!(table.diagnostics.relative_drift(), 0.5);
        assert!(!table
            .warnings()
            .iter()
            .any(|w| matches!(w, DataQualityWarning::ConservationDrift { .. })));
    }

    #[test]
    fn stratum_factors_scale_the_unit_factor() {
        let sums = map(&[(1, 40.0), (2, 8.0)]);
        let unit = unit_normalize("unit", &sums);
        assert_eq!(unit.factor(1), Some(0.025));
        assert_eq!(unit.factor(2), Some(0.125));

        let stratum = map(&[(1, 12.0), (2, 4.0), (5, 1.0)]);
        let table = stratum_normalize("f_0_4", &unit, &stratum, 0.01);
        assert_relative_eq!(table.factor(1).unwrap(), 0.3, max_relative = 1e-12);
        assert_relative_eq!(table.factor(2).unwrap(), 0.5, max_relative = 1e-12);
        assert_eq!(table.diagnostics.unmatched_census, vec![5]);
        assert_relative_eq!(table.diagnostics.recomputed_total, 16.0, max_relative = 1e-12);
    }

    #[test]
    fn lookup_is_sorted_and_first_wins() {
        let lookup = FactorLookup::from_pairs([(5, 0.5), (-2, 2.0), (5, 9.0), (3, 1.0)]);
        assert_eq!(lookup.len(), 3);
        assert_eq!(lookup.get(-2), Some(2.0));
        assert_eq!(lookup.get(5), Some(0.5));
        assert_eq!(lookup.get(4), None);
    }

    #[test]
    fn table_exports_as_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("norm.csv");
        let table = normalize("v", &map(&[(1, 10.0), (2, 3.0)]), &map(&[(1, 4.0)]), 0.01);
        table.write_csv(&path, "id").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines, vec!["id,population,prediction_sum,factor", "1,10,4,2.5", "2,3,,"]);
    }
}
