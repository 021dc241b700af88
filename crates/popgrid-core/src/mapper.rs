//! Dasymetric mapping state machine.
//!
//! Stages run strictly in order, once each, with no retries:
//!
//! ```text
//! VALIDATE_INPUTS → LOAD_CENSUS → [APPLY_WATER_MASK]
//!   → COMPUTE_STATS → NORMALIZE → WRITE_NORMALIZED_RASTER → WRITE_POPULATION_RASTER   (unconstrained)
//!   → [APPLY_CONSTRAINT_MASK, then the same four stages for the constrained variant]
//!   → [STRATA: one normalize + write per age-sex stratum]
//!   → DONE
//! ```
//!
//! Only the per-zone factor tables stay resident between stages; every
//! raster is streamed window by window. A cancel flag is checked at each
//! stage boundary.
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::census::{load_census, load_strata, Census, StrataTable};
use crate::config::MapperConfig;
use crate::error::{DataQualityWarning, Error, Result, TaskFailure};
use crate::normalize::{normalize, stratum_normalize, unit_normalize};
use crate::raster::export_geotiff;
use crate::validate::validate_inputs;
use crate::writers::{write_masked_zones, write_normalized_raster, write_population_raster, WriteSummary};
use crate::zonal::{zonal_statistics, ZoneId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Unconstrained,
    Constrained,
}

impl Variant {
    fn name(self) -> &'static str {
        match self {
            Variant::Unconstrained => "unconstrained",
            Variant::Constrained => "constrained",
        }
    }

    fn normalized_file(self) -> &'static str {
        match self {
            Variant::Unconstrained => "normalized_census.pgr",
            Variant::Constrained => "normalized_census_constrained.pgr",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ready,
    ValidateInputs,
    LoadCensus,
    ApplyWaterMask,
    ApplyConstraintMask,
    ComputeStats(Variant),
    Normalize(Variant),
    WriteNormalizedRaster(Variant),
    WritePopulationRaster(Variant),
    Strata,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Ready => f.write_str("READY"),
            Stage::ValidateInputs => f.write_str("VALIDATE_INPUTS"),
            Stage::LoadCensus => f.write_str("LOAD_CENSUS"),
            Stage::ApplyWaterMask => f.write_str("APPLY_WATER_MASK"),
            Stage::ApplyConstraintMask => f.write_str("APPLY_CONSTRAINT_MASK"),
            Stage::ComputeStats(v) => write!(f, "COMPUTE_STATS({v})"),
            Stage::Normalize(v) => write!(f, "NORMALIZE({v})"),
            Stage::WriteNormalizedRaster(v) => write!(f, "WRITE_NORMALIZED_RASTER({v})"),
            Stage::WritePopulationRaster(v) => write!(f, "WRITE_POPULATION_RASTER({v})"),
            Stage::Strata => f.write_str("STRATA"),
            Stage::Done => f.write_str("DONE"),
        }
    }
}

/// Files written for one variant.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantOutputs {
    pub variant: Variant,
    /// Zone raster the statistics were computed on.
    pub zones: PathBuf,
    pub normalized: PathBuf,
    pub population: PathBuf,
    pub table: PathBuf,
    pub geotiffs: Vec<PathBuf>,
    /// Sum of the written population pixels.
    pub population_total: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StratumOutput {
    pub name: String,
    pub population: PathBuf,
    pub geotiff: Option<PathBuf>,
    pub population_total: f64,
}

/// Everything a completed run produced.
#[derive(Debug, Clone, Default)]
pub struct MappingOutputs {
    pub unconstrained: Option<VariantOutputs>,
    pub constrained: Option<VariantOutputs>,
    pub strata: Vec<StratumOutput>,
    pub warnings: Vec<DataQualityWarning>,
    pub failed_windows: Vec<TaskFailure>,
}

impl MappingOutputs {
    /// Primary population raster: constrained when available.
    pub fn population(&self) -> Option<&Path> {
        self.constrained
            .as_ref()
            .or(self.unconstrained.as_ref())
            .map(|v| v.population.as_path())
    }

    fn record_failures(&mut self, pass: &str, windows: usize, failures: Vec<TaskFailure>) {
        if failures.is_empty() {
            return;
        }
        let warning = DataQualityWarning::FailedWindows {
            pass: pass.to_string(),
            failed: failures.len(),
            total: windows,
        };
        warn!("{warning}");
        self.warnings.push(warning);
        self.failed_windows.extend(failures);
    }

    fn record_write(&mut self, pass: &str, summary: &WriteSummary) {
        self.record_failures(pass, summary.windows, summary.failures.clone());
    }
}

type StageObserver = Box<dyn FnMut(Stage) + Send>;

pub struct DasymetricMapper {
    config: MapperConfig,
    cancel: Arc<AtomicBool>,
    stage: Stage,
    observer: Option<StageObserver>,
}

impl DasymetricMapper {
    pub fn new(config: MapperConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            stage: Stage::Ready,
            observer: None,
        })
    }

    /// Flag that stops the run at the next stage boundary when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Call `observer` each time a stage starts.
    pub fn on_stage(&mut self, observer: impl FnMut(Stage) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    fn enter(&mut self, stage: Stage) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            warn!("Cancelled before {stage}");
            return Err(Error::Cancelled { stage: stage.to_string() });
        }
        info!("── {stage} ──");
        self.stage = stage;
        if let Some(observer) = self.observer.as_mut() {
            observer(stage);
        }
        Ok(())
    }

    fn output(&self, name: &str) -> PathBuf {
        self.config.output_dir.join(name)
    }

    fn export(&self, path: &Path) -> Result<Option<PathBuf>> {
        if !self.config.export_geotiff {
            return Ok(None);
        }
        let tif = path.with_extension("tif");
        export_geotiff(path, &tif)?;
        Ok(Some(tif))
    }

    /// Run every configured stage and return the written outputs.
    pub fn run(&mut self) -> Result<MappingOutputs> {
        let mut outputs = MappingOutputs::default();

        self.enter(Stage::ValidateInputs)?;
        let report = validate_inputs(&self.config)?;
        outputs.record_failures("input scans", report.windows, report.failures);
        fs::create_dir_all(&self.config.output_dir).map_err(|e| {
            Error::resource(format!("output directory {}", self.config.output_dir.display()), e)
        })?;

        self.enter(Stage::LoadCensus)?;
        let census = load_census(&self.config.census)?;
        if !census.duplicate_ids.is_empty() {
            outputs
                .warnings
                .push(DataQualityWarning::DuplicateCensusIds { zones: census.duplicate_ids.clone() });
        }
        let strata = self.load_strata(&census)?;

        let mut reference = self.config.mastergrid.clone();
        if let Some(mask) = self.config.mask.clone() {
            self.enter(Stage::ApplyWaterMask)?;
            let out = self.output("mastergrid_masked.pgr");
            let summary = write_masked_zones(
                &reference,
                &mask,
                self.config.mask_value,
                &out,
                &self.config.processing,
            )?;
            outputs.record_write("water mask", &summary);
            reference = summary.path;
        }

        let (unconstrained, mut baseline) =
            self.run_variant(Variant::Unconstrained, &reference, &census, &mut outputs)?;
        let mut baseline_zones = unconstrained.zones.clone();
        outputs.unconstrained = Some(unconstrained);

        if let Some(constrain) = self.config.constrain.clone() {
            self.enter(Stage::ApplyConstraintMask)?;
            let zones = self.output("mastergrid_constrained.pgr");
            let summary = write_masked_zones(
                &reference,
                &constrain,
                self.config.constrain_value,
                &zones,
                &self.config.processing,
            )?;
            outputs.record_write("constrain mask", &summary);

            let (constrained, sums) =
                self.run_variant(Variant::Constrained, &summary.path, &census, &mut outputs)?;
            baseline = sums;
            baseline_zones = constrained.zones.clone();
            outputs.constrained = Some(constrained);
        }

        if let Some(strata) = strata {
            self.enter(Stage::Strata)?;
            outputs.strata = self.run_strata(&strata, &baseline, &baseline_zones, &mut outputs)?;
        }

        self.enter(Stage::Done)?;
        info!(
            "Mapping complete: {} warnings, {} failed windows",
            outputs.warnings.len(),
            outputs.failed_windows.len()
        );
        Ok(outputs)
    }

    fn load_strata(&self, census: &Census) -> Result<Option<StrataTable>> {
        if let Some(path) = &self.config.agesex {
            if !path.is_file() {
                warn!(
                    "Age-sex file not found: {}, proceeding without age-sex structure",
                    path.display()
                );
                return Ok(None);
            }
            return load_strata(path, &self.config.census.id_column).map(Some);
        }
        if census.strata.is_empty() {
            Ok(None)
        } else {
            Ok(Some(census.strata.clone()))
        }
    }

    fn run_variant(
        &mut self,
        variant: Variant,
        zones: &Path,
        census: &Census,
        outputs: &mut MappingOutputs,
    ) -> Result<(VariantOutputs, BTreeMap<ZoneId, f64>)> {
        let processing = self.config.processing.clone();

        self.enter(Stage::ComputeStats(variant))?;
        let stats = zonal_statistics(&self.config.prediction, zones, &processing)?;
        outputs.record_failures(&format!("statistics ({variant})"), stats.windows, stats.failures);
        let sums: BTreeMap<ZoneId, f64> = stats.zones.iter().map(|(&z, s)| (z, s.sum)).collect();

        self.enter(Stage::Normalize(variant))?;
        let table = normalize(
            variant.name(),
            &census.populations,
            &sums,
            processing.conservation_tolerance,
        );
        outputs.warnings.extend(table.warnings());
        let table_path = self.output(&format!("normalization_{variant}.csv"));
        table.write_csv(&table_path, &self.config.census.id_column)?;

        self.enter(Stage::WriteNormalizedRaster(variant))?;
        let normalized = write_normalized_raster(
            zones,
            &table.lookup(),
            &self.output(variant.normalized_file()),
            &processing,
        )?;
        outputs.record_write(&format!("normalized raster ({variant})"), &normalized);

        self.enter(Stage::WritePopulationRaster(variant))?;
        let population = write_population_raster(
            &self.config.prediction,
            &normalized.path,
            &self.output(&format!("population_{variant}.pgr")),
            &processing,
        )?;
        outputs.record_write(&format!("population raster ({variant})"), &population);
        info!(
            "{variant}: population raster total {:.0} (census {:.0})",
            population.total,
            census.total()
        );

        let geotiffs = [self.export(&normalized.path)?, self.export(&population.path)?]
            .into_iter()
            .flatten()
            .collect();

        let result = VariantOutputs {
            variant,
            zones: zones.to_path_buf(),
            normalized: normalized.path,
            population: population.path,
            table: table_path,
            geotiffs,
            population_total: population.total,
        };
        Ok((result, sums))
    }

    fn run_strata(
        &mut self,
        strata: &StrataTable,
        sums: &BTreeMap<ZoneId, f64>,
        zones: &Path,
        outputs: &mut MappingOutputs,
    ) -> Result<Vec<StratumOutput>> {
        let processing = self.config.processing.clone();
        let dir = self.output("agesex");
        fs::create_dir_all(&dir)
            .map_err(|e| Error::resource(format!("age-sex directory {}", dir.display()), e))?;

        let unit = unit_normalize("unit weight", sums);
        info!("Strata: {} columns against {} weighted zones", strata.names.len(), unit.valid_count());

        let mut written = Vec::with_capacity(strata.names.len());
        for (index, name) in strata.names.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled { stage: format!("{} [{name}]", Stage::Strata) });
            }
            let table = stratum_normalize(
                name,
                &unit,
                &strata.column(index),
                processing.conservation_tolerance,
            );
            outputs.warnings.extend(table.warnings());

            let factors = dir.join(format!("{name}_normalized.pgr"));
            let normalized = write_normalized_raster(zones, &table.lookup(), &factors, &processing)?;
            outputs.record_write(&format!("normalized raster [{name}]"), &normalized);

            let population = write_population_raster(
                &self.config.prediction,
                &normalized.path,
                &dir.join(format!("{name}.pgr")),
                &processing,
            )?;
            outputs.record_write(&format!("population raster [{name}]"), &population);

            if let Err(e) = fs::remove_file(&normalized.path) {
                warn!("Failed to remove {}: {e}", normalized.path.display());
            }

            let geotiff = self.export(&population.path)?;
            written.push(StratumOutput {
                name: name.clone(),
                population: population.path,
                geotiff,
                population_total: population.total,
            });
        }
        Ok(written)
    }
}

/// Build a mapper for `config` and run it to completion.
pub fn run_mapping(config: MapperConfig) -> Result<MappingOutputs> {
    DasymetricMapper::new(config)?.run()
}
