/// Multi-raster zonal statistics: one zone raster, any number of named value
/// rasters, one CSV row per zone with `<name>_count … <name>_std` columns.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use popgrid_core::raster::import_geotiff;
use popgrid_core::zonal::zonal_statistics_stack;
use popgrid_core::ProcessingConfig;

#[derive(Parser, Debug)]
#[command(name = "zonal", about = "Per-zone statistics of several rasters against one zone raster")]
struct Args {
    /// Zone raster (.pgr or GeoTIFF)
    #[arg(long)]
    zones: PathBuf,

    /// Value raster as NAME=PATH; repeat for more rasters
    #[arg(long = "raster", value_parser = parse_named, required = true)]
    rasters: Vec<(String, PathBuf)>,

    /// Output CSV path
    #[arg(short, long, default_value = "zonal_stats.csv")]
    output: PathBuf,

    /// Value skipped in every raster instead of each raster's own nodata
    #[arg(long)]
    nodata: Option<f64>,

    /// Drop zones with this many valid pixels or fewer
    #[arg(long, default_value = "0")]
    min_count: u64,

    /// Tile width and height in pixels
    #[arg(long, default_value = "512")]
    block: usize,

    #[arg(long, default_value = "4")]
    workers: usize,

    /// Process each raster as one window on one thread
    #[arg(long)]
    no_blocks: bool,

    /// Header of the zone id column
    #[arg(long, default_value = "zone")]
    zone_column: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_named(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got {s:?}")),
    }
}

fn is_geotiff(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("tif" | "tiff")
    )
}

fn staged(path: &Path, name: &str, temp: &Path, block: (usize, usize)) -> Result<PathBuf> {
    if !is_geotiff(path) {
        return Ok(path.to_path_buf());
    }
    fs::create_dir_all(temp).with_context(|| format!("cannot create {}", temp.display()))?;
    let dst = temp.join(format!("{name}.pgr"));
    import_geotiff(path, &dst, block).with_context(|| format!("failed to import {}", path.display()))?;
    Ok(dst)
}

fn run(args: &Args, temp: &Path) -> Result<()> {
    let config = ProcessingConfig {
        by_block: !args.no_blocks,
        block_size: (args.block, args.block),
        max_workers: args.workers,
        min_count: args.min_count,
        ..Default::default()
    };
    config.validate().context("invalid processing settings")?;

    let zones = staged(&args.zones, "__zones", temp, config.block_size)?;
    let mut targets = Vec::with_capacity(args.rasters.len());
    for (name, path) in &args.rasters {
        if name.contains(',') {
            bail!("raster name {name:?} must not contain a comma");
        }
        targets.push((name.clone(), staged(path, name, temp, config.block_size)?));
    }

    let stack = zonal_statistics_stack(&targets, &zones, &config, args.nodata)
        .context("zonal statistics failed")?;
    if !stack.failures.is_empty() {
        warn!("{} windows failed; their pixels are missing from the statistics", stack.failures.len());
    }
    stack
        .write_csv(&args.output, &args.zone_column)
        .with_context(|| format!("cannot write {}", args.output.display()))?;
    info!("Wrote {} zones to {}", stack.rows.len(), args.output.display());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let temp = args
        .output
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
        .join("zonal_temp");
    let result = run(&args, &temp);
    if temp.exists() {
        if let Err(e) = fs::remove_dir_all(&temp) {
            warn!("Failed to remove {}: {e}", temp.display());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_raster_arguments() {
        assert_eq!(
            parse_named("ntl=data/viirs.tif").unwrap(),
            ("ntl".to_string(), PathBuf::from("data/viirs.tif"))
        );
        assert!(parse_named("novalue").is_err());
        assert!(parse_named("=x.pgr").is_err());
    }
}
