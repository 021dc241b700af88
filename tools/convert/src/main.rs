/// GeoTIFF ⇄ block raster conversion.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use popgrid_core::raster::{export_geotiff, import_geotiff, read_profile};

#[derive(Parser, Debug)]
#[command(name = "convert", about = "Convert between GeoTIFF and popgrid block rasters")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Single-band GeoTIFF → block raster
    Import {
        input: PathBuf,
        output: PathBuf,
        /// Preferred tile size recorded in the output profile
        #[arg(long, default_value = "512")]
        block: usize,
    },
    /// Block raster → strip GeoTIFF
    Export { input: PathBuf, output: PathBuf },
    /// Print a block raster's profile as JSON
    Info { input: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    match args.command {
        Command::Import { input, output, block } => {
            let profile = import_geotiff(&input, &output, (block, block))
                .with_context(|| format!("failed to import {}", input.display()))?;
            info!(
                "{} -> {} ({}x{} {:?}, nodata {:?})",
                input.display(),
                output.display(),
                profile.width,
                profile.height,
                profile.dtype,
                profile.nodata
            );
        }
        Command::Export { input, output } => {
            export_geotiff(&input, &output)
                .with_context(|| format!("failed to export {}", input.display()))?;
            info!("{} -> {}", input.display(), output.display());
        }
        Command::Info { input } => {
            let profile = read_profile(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
    }
    Ok(())
}
