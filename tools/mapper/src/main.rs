/// Dasymetric mapping runner: reads a JSON run file, converts GeoTIFF inputs
/// to block rasters, and writes normalized and population rasters.
///
/// Relative paths in the run file resolve against the run file's directory.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use serde::Deserialize;

use popgrid_core::raster::import_geotiff;
use popgrid_core::{DasymetricMapper, MapperConfig, MappingOutputs};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "mapper", about = "Redistribute census counts onto a prediction surface")]
struct Args {
    /// JSON run file describing inputs, outputs and processing settings
    run_file: PathBuf,

    /// Override the output directory from the run file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Override the worker count
    #[arg(long)]
    workers: Option<usize>,

    /// Process each pass as a single whole-raster window on one thread
    #[arg(long)]
    no_blocks: bool,

    /// Skip GeoTIFF copies of the outputs
    #[arg(long)]
    no_geotiff: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Run file layout: a mapper configuration plus runner-only switches.
#[derive(Deserialize, Debug)]
struct RunFile {
    #[serde(flatten)]
    config: MapperConfig,
    /// Keep `<output_dir>/temp` after the run
    #[serde(default)]
    keep_temp: bool,
}

// ── Path handling ────────────────────────────────────────────────────────────

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn resolve_paths(config: &mut MapperConfig, base: &Path) {
    config.prediction = resolve(base, &config.prediction);
    config.mastergrid = resolve(base, &config.mastergrid);
    config.census.path = resolve(base, &config.census.path);
    config.output_dir = resolve(base, &config.output_dir);
    for path in [&mut config.agesex, &mut config.mask, &mut config.constrain].into_iter().flatten() {
        *path = resolve(base, path);
    }
}

fn is_geotiff(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("tif" | "tiff")
    )
}

/// Staged file name; the role prefix keeps inputs with equal stems apart.
fn staged_name(role: &str, path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("input");
    format!("{role}_{stem}.pgr")
}

/// Replace a GeoTIFF input with a block raster imported into `temp`.
fn stage_input(role: &str, path: &mut PathBuf, temp: &Path, block_size: (usize, usize)) -> Result<()> {
    if !is_geotiff(path) {
        return Ok(());
    }
    let dst = temp.join(staged_name(role, path));
    info!("Importing {} -> {}", path.display(), dst.display());
    import_geotiff(path, &dst, block_size)
        .with_context(|| format!("failed to import {}", path.display()))?;
    *path = dst;
    Ok(())
}

fn stage_inputs(config: &mut MapperConfig, temp: &Path) -> Result<()> {
    let block = config.processing.block_size;
    stage_input("prediction", &mut config.prediction, temp, block)?;
    stage_input("mastergrid", &mut config.mastergrid, temp, block)?;
    if let Some(mask) = &mut config.mask {
        stage_input("mask", mask, temp, block)?;
    }
    if let Some(constrain) = &mut config.constrain {
        stage_input("constrain", constrain, temp, block)?;
    }
    Ok(())
}

/// Apply command-line overrides on top of a resolved run file.
///
/// `--output` is taken as given, so a relative path stays relative to the
/// working directory.
fn apply_overrides(config: &mut MapperConfig, args: &Args) {
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(workers) = args.workers {
        config.processing.max_workers = workers;
    }
    if args.no_blocks {
        config.processing.by_block = false;
    }
    if args.no_geotiff {
        config.export_geotiff = false;
    }
}

fn report(outputs: &MappingOutputs) {
    for variant in [&outputs.unconstrained, &outputs.constrained].into_iter().flatten() {
        info!(
            "{}: population {} (total {:.0}), factors {}",
            variant.variant,
            variant.population.display(),
            variant.population_total,
            variant.normalized.display()
        );
    }
    for stratum in &outputs.strata {
        info!("stratum {}: {} (total {:.0})", stratum.name, stratum.population.display(), stratum.population_total);
    }
    for warning in &outputs.warnings {
        warn!("{warning}");
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let text = fs::read_to_string(&args.run_file)
        .with_context(|| format!("cannot read run file {}", args.run_file.display()))?;
    let run: RunFile = serde_json::from_str(&text)
        .with_context(|| format!("cannot parse run file {}", args.run_file.display()))?;

    let base = args
        .run_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut config = run.config;
    resolve_paths(&mut config, &base);
    apply_overrides(&mut config, &args);

    let temp = config.output_dir.join("temp");
    fs::create_dir_all(&temp).with_context(|| format!("cannot create {}", temp.display()))?;

    let result = stage_inputs(&mut config, &temp).and_then(|()| {
        let mut mapper = DasymetricMapper::new(config).context("invalid configuration")?;
        mapper.run().context("mapping failed")
    });

    if !run.keep_temp {
        if let Err(e) = fs::remove_dir_all(&temp) {
            warn!("Failed to remove {}: {e}", temp.display());
        }
    }

    let outputs = result?;
    report(&outputs);
    info!("Done.");
    Ok(())
}
