//! Block-parallel dasymetric population mapping.
//!
//! Census counts per reporting unit are redistributed onto a pixel grid in
//! proportion to a continuous prediction surface. Every raster pass is split
//! into windows and run on a bounded worker pool, so inputs never need to fit
//! in memory.
//!
//! The usual entry point is [`mapper::DasymetricMapper`]; the building blocks
//! ([`zonal`], [`normalize`], [`writers`]) are public for standalone use.
pub mod census;
pub mod config;
pub mod error;
pub mod mapper;
pub mod normalize;
pub mod pool;
pub mod progress;
pub mod raster;
pub mod sum;
pub mod validate;
pub mod writers;
pub mod zonal;

pub use config::{CensusConfig, FailurePolicy, MapperConfig, ProcessingConfig};
pub use error::{DataQualityWarning, Error, Result, TaskFailure, ValidationError};
pub use mapper::{run_mapping, DasymetricMapper, MappingOutputs};
pub use zonal::{zone_key, ZoneId};
