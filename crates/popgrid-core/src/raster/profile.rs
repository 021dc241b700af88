//! Raster grid geometry and storage metadata.
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Affine pixel → map transform in GDAL coefficient order:
/// `x = origin_x + col·pixel_width + row·row_rotation`,
/// `y = origin_y + col·col_rotation + row·pixel_height`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub origin_y: f64,
    pub col_rotation: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square-ish pixels and no rotation.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            pixel_width,
            row_rotation: 0.0,
            origin_y,
            col_rotation: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::north_up(0.0, 0.0, 1.0, 1.0)
    }
}

/// On-disk pixel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Decode one little-endian sample. `bytes` must be exactly `size()` long.
    pub fn decode(self, bytes: &[u8]) -> f64 {
        match self {
            DType::U8 => f64::from(bytes[0]),
            DType::U16 => f64::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            DType::I16 => f64::from(i16::from_le_bytes([bytes[0], bytes[1]])),
            DType::U32 => f64::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            DType::I32 => f64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            DType::F32 => f64::from(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            DType::F64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(b)
            }
        }
    }

    /// Append one sample to `out` in little-endian order.
    ///
    /// Integer types round half-to-even and saturate at the type bounds; NaN
    /// becomes 0 for integer types.
    pub fn encode(self, value: f64, out: &mut Vec<u8>) {
        let int = || value.round_ties_even();
        match self {
            DType::U8 => out.push(int() as u8),
            DType::U16 => out.extend_from_slice(&(int() as u16).to_le_bytes()),
            DType::I16 => out.extend_from_slice(&(int() as i16).to_le_bytes()),
            DType::U32 => out.extend_from_slice(&(int() as u32).to_le_bytes()),
            DType::I32 => out.extend_from_slice(&(int() as i32).to_le_bytes()),
            DType::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            DType::F64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

/// How a CRS code is written into GeoTIFF keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrsModel {
    Projected,
    Geographic,
}

/// Everything needed to interpret and co-register a single-band raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterProfile {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    /// Free-form CRS identifier, e.g. `EPSG:4326`.
    pub crs: Option<String>,
    /// Model of `crs` as read from a GeoTIFF; unset for unknown origins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs_model: Option<CrsModel>,
    pub dtype: DType,
    pub nodata: Option<f64>,
    /// Preferred tile size (width, height) for windowed processing.
    pub block_size: (usize, usize),
}

impl RasterProfile {
    pub fn new(width: usize, height: usize, dtype: DType) -> Self {
        Self {
            width,
            height,
            transform: GeoTransform::default(),
            crs: None,
            crs_model: None,
            dtype,
            nodata: None,
            block_size: (256, 256),
        }
    }

    /// Same grid, different storage.
    pub fn derive(&self, dtype: DType, nodata: Option<f64>) -> Self {
        Self { dtype, nodata, ..self.clone() }
    }

    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// True when `value` is this raster's nodata sentinel or NaN.
    #[inline]
    pub fn is_nodata(&self, value: f64) -> bool {
        value.is_nan() || self.nodata.is_some_and(|nd| value == nd)
    }

    /// Require identical CRS, dimensions and transform.
    ///
    /// `labels` name (self, other) in the error message.
    pub fn check_compatible(
        &self,
        other: &RasterProfile,
        labels: (&str, &str),
    ) -> Result<(), ValidationError> {
        let (left, right) = (labels.0.to_string(), labels.1.to_string());
        if self.crs != other.crs {
            return Err(ValidationError::CrsMismatch { left, right });
        }
        if self.width != other.width || self.height != other.height {
            return Err(ValidationError::DimensionMismatch {
                left,
                right,
                left_dims: (self.width, self.height),
                right_dims: (other.width, other.height),
            });
        }
        if self.transform != other.transform {
            return Err(ValidationError::TransformMismatch { left, right });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_encoding_rounds_and_saturates() {
        let mut out = Vec::new();
        DType::I32.encode(2.5, &mut out);
        DType::I32.encode(3.5, &mut out);
        DType::U8.encode(300.0, &mut out);
        DType::U8.encode(-4.0, &mut out);
        assert_eq!(DType::I32.decode(&out[0..4]), 2.0);
        assert_eq!(DType::I32.decode(&out[4..8]), 4.0);
        assert_eq!(out[8], 255);
        assert_eq!(out[9], 0);
    }

    #[test]
    fn float_samples_survive_encoding() {
        for dtype in [DType::F32, DType::F64] {
            let mut out = Vec::new();
            dtype.encode(-99.0, &mut out);
            assert_eq!(out.len(), dtype.size());
            assert_eq!(dtype.decode(&out), -99.0);
        }
    }

    #[test]
    fn compatibility_reports_first_mismatch() {
        let a = RasterProfile::new(4, 4, DType::F32);
        let mut b = a.derive(DType::I32, Some(-99.0));
        assert!(a.check_compatible(&b, ("a", "b")).is_ok());

        b.transform.origin_x = 10.0;
        assert!(matches!(
            a.check_compatible(&b, ("a", "b")),
            Err(ValidationError::TransformMismatch { .. })
        ));

        b.width = 5;
        assert!(matches!(
            a.check_compatible(&b, ("a", "b")),
            Err(ValidationError::DimensionMismatch { .. })
        ));

        b.crs = Some("EPSG:4326".into());
        assert!(matches!(
            a.check_compatible(&b, ("a", "b")),
            Err(ValidationError::CrsMismatch { .. })
        ));
    }

    #[test]
    fn nan_is_always_nodata() {
        let p = RasterProfile::new(1, 1, DType::F32);
        assert!(p.is_nodata(f64::NAN));
        assert!(!p.is_nodata(-99.0));
        assert!(p.derive(DType::F32, Some(-99.0)).is_nodata(-99.0));
    }
}
