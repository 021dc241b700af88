//! Raster storage: grid profiles, windows, pixel blocks, and the on-disk
//! block raster format with GeoTIFF interchange.
pub mod block;
pub mod dataset;
pub mod geotiff;
pub mod profile;
pub mod window;

pub use block::Block;
pub use dataset::{read_profile, write_raster, RasterReader, RasterWriter};
pub use geotiff::{export_geotiff, import_geotiff};
pub use profile::{CrsModel, DType, GeoTransform, RasterProfile};
pub use window::{plan_windows, RasterWindow};
