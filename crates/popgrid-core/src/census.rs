//! Census tables: per-zone population counts with optional strata.
//!
//! Census ids go through the same [`zone_key`] rule as zone-raster pixels.
//! Stratum columns are the headers starting with `f`, `F`, `m` or `M`
//! (females/males by age group), other than the id and population columns.
use std::collections::BTreeMap;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use log::{debug, info, warn};

use crate::config::CensusConfig;
use crate::error::{Result, ValidationError};
use crate::zonal::{zone_key, ZoneId};

/// One parsed census row.
#[derive(Debug, Clone, PartialEq)]
pub struct CensusRecord {
    pub zone: ZoneId,
    pub population: f64,
    /// Values of the stratum columns, in header order.
    pub strata: Vec<f64>,
}

/// Named per-zone stratum counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrataTable {
    pub names: Vec<String>,
    pub rows: BTreeMap<ZoneId, Vec<f64>>,
}

impl StrataTable {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// One stratum's counts by zone.
    pub fn column(&self, index: usize) -> BTreeMap<ZoneId, f64> {
        self.rows
            .iter()
            .filter_map(|(&zone, values)| values.get(index).map(|&v| (zone, v)))
            .collect()
    }
}

/// Validated census: zone → population, plus any strata it carried.
#[derive(Debug, Clone, Default)]
pub struct Census {
    pub populations: BTreeMap<ZoneId, f64>,
    pub strata: StrataTable,
    /// Ids that appeared on more than one row; their rows were summed.
    pub duplicate_ids: Vec<ZoneId>,
}

impl Census {
    /// Build and validate a census from parsed rows.
    ///
    /// Fails on any negative count or a non-positive total population.
    /// Rows sharing an id are summed.
    pub fn from_records(
        strata_names: Vec<String>,
        records: Vec<CensusRecord>,
    ) -> std::result::Result<Self, ValidationError> {
        let negatives = records
            .iter()
            .filter(|r| r.population < 0.0 || r.strata.iter().any(|&v| v < 0.0))
            .count();
        if negatives > 0 {
            return Err(ValidationError::NegativePopulation(negatives));
        }

        let mut populations = BTreeMap::new();
        let mut rows: BTreeMap<ZoneId, Vec<f64>> = BTreeMap::new();
        let mut duplicate_ids = Vec::new();
        for record in records {
            if rows.contains_key(&record.zone) {
                duplicate_ids.push(record.zone);
            }
            *populations.entry(record.zone).or_insert(0.0) += record.population;

            let strata = rows.entry(record.zone).or_insert_with(|| vec![0.0; strata_names.len()]);
            for (slot, value) in strata.iter_mut().zip(&record.strata) {
                *slot += value;
            }
        }
        duplicate_ids.sort_unstable();
        duplicate_ids.dedup();

        let total: f64 = populations.values().sum();
        if !(total > 0.0) {
            return Err(ValidationError::NonPositiveTotal(total));
        }

        let strata = if strata_names.is_empty() {
            StrataTable::default()
        } else {
            StrataTable { names: strata_names, rows }
        };
        Ok(Self { populations, strata, duplicate_ids })
    }

    pub fn total(&self) -> f64 {
        self.populations.values().sum()
    }

    pub fn len(&self) -> usize {
        self.populations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.populations.is_empty()
    }

    pub fn get(&self, zone: ZoneId) -> Option<f64> {
        self.populations.get(&zone).copied()
    }
}

fn is_stratum_header(name: &str) -> bool {
    matches!(name.chars().next(), Some('f' | 'F' | 'm' | 'M'))
}

fn check_csv(path: &Path, kind: &str) -> std::result::Result<(), ValidationError> {
    if !path.is_file() {
        return Err(ValidationError::MissingFile { kind: kind.to_string(), path: path.to_path_buf() });
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if ext != "csv" {
        return Err(ValidationError::UnsupportedFormat(format!(".{ext}")));
    }
    Ok(())
}

fn parse_cell(record: &StringRecord, index: usize, column: &str, row: usize) -> Result<f64> {
    let raw = record.get(index).unwrap_or("");
    raw.parse::<f64>().ok().filter(|v| v.is_finite()).ok_or_else(|| {
        ValidationError::BadCensusValue { row, column: column.to_string(), value: raw.to_string() }
            .into()
    })
}

fn parse_zone(record: &StringRecord, index: usize, column: &str, row: usize) -> Result<ZoneId> {
    let raw = record.get(index).unwrap_or("");
    raw.parse::<f64>().ok().and_then(zone_key).ok_or_else(|| {
        ValidationError::BadCensusValue { row, column: column.to_string(), value: raw.to_string() }
            .into()
    })
}

/// Load and validate the census CSV named by `config`.
pub fn load_census(config: &CensusConfig) -> Result<Census> {
    let path = config.path.as_path();
    check_csv(path, "census")?;
    info!("Loading census data from {}", path.display());

    let mut reader = ReaderBuilder::new().trim(Trim::All).from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h == name);

    let (id_idx, pop_idx) = match (column(&config.id_column), column(&config.pop_column)) {
        (Some(i), Some(p)) => (i, p),
        (id, pop) => {
            let mut missing = Vec::new();
            if id.is_none() {
                missing.push(format!("ID column \"{}\"", config.id_column));
            }
            if pop.is_none() {
                missing.push(format!("Population column \"{}\"", config.pop_column));
            }
            return Err(ValidationError::MissingColumns(missing.join(", ")).into());
        }
    };

    let strata: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|&(i, h)| i != id_idx && i != pop_idx && is_stratum_header(h))
        .map(|(i, h)| (i, h.to_string()))
        .collect();
    debug!("Census columns: {:?}; strata: {}", headers, strata.len());

    let mut records = Vec::new();
    for (n, row) in reader.records().enumerate() {
        let row = row?;
        let line = n + 2;
        let zone = parse_zone(&row, id_idx, &config.id_column, line)?;
        let population = parse_cell(&row, pop_idx, &config.pop_column, line)?;
        let values = strata
            .iter()
            .map(|(i, name)| parse_cell(&row, *i, name, line))
            .collect::<Result<Vec<_>>>()?;
        records.push(CensusRecord { zone, population, strata: values });
    }

    let census = Census::from_records(strata.into_iter().map(|(_, n)| n).collect(), records)?;
    if !census.duplicate_ids.is_empty() {
        warn!(
            "Census lists {} zone ids more than once; their rows were summed",
            census.duplicate_ids.len()
        );
    }
    info!(
        "Census data: {} zones, total population {:.0}, columns id={} population={}",
        census.len(),
        census.total(),
        config.id_column,
        config.pop_column
    );
    Ok(census)
}

/// Load an age-sex table keyed by `id_column`. Every header starting with
/// `f`, `F`, `m` or `M` is a stratum.
pub fn load_strata(path: &Path, id_column: &str) -> Result<StrataTable> {
    check_csv(path, "age-sex")?;
    info!("Loading age-sex data from {}", path.display());

    let mut reader = ReaderBuilder::new().trim(Trim::All).from_path(path)?;
    let headers = reader.headers()?.clone();
    let id_idx = headers.iter().position(|h| h == id_column).ok_or_else(|| {
        ValidationError::MissingColumns(format!("ID column \"{id_column}\""))
    })?;
    let columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|&(i, h)| i != id_idx && is_stratum_header(h))
        .map(|(i, h)| (i, h.to_string()))
        .collect();
    if columns.is_empty() {
        return Err(ValidationError::MissingColumns(
            "age-sex stratum columns (headers starting with f, F, m or M)".into(),
        )
        .into());
    }

    let mut table = StrataTable {
        names: columns.iter().map(|(_, n)| n.clone()).collect(),
        rows: BTreeMap::new(),
    };
    let mut duplicates = 0usize;
    let mut negatives = 0usize;
    for (n, row) in reader.records().enumerate() {
        let row = row?;
        let line = n + 2;
        let zone = parse_zone(&row, id_idx, id_column, line)?;
        let values = columns
            .iter()
            .map(|(i, name)| parse_cell(&row, *i, name, line))
            .collect::<Result<Vec<_>>>()?;
        negatives += values.iter().filter(|&&v| v < 0.0).count();

        match table.rows.get_mut(&zone) {
            Some(existing) => {
                duplicates += 1;
                for (slot, v) in existing.iter_mut().zip(&values) {
                    *slot += v;
                }
            }
            None => {
                table.rows.insert(zone, values);
            }
        }
    }
    if negatives > 0 {
        return Err(ValidationError::NegativePopulation(negatives).into());
    }
    if duplicates > 0 {
        warn!("Age-sex table repeats {duplicates} zone rows; their counts were summed");
    }
    info!("Age-sex data: {} strata over {} zones", table.names.len(), table.rows.len());
    Ok(table)
}
