//! GeoTIFF interchange for block rasters.
//!
//! Only single-band images are supported. Georeferencing is carried through
//! ModelPixelScale + ModelTiepoint (or ModelTransformation for rotated grids),
//! the EPSG code from the GeoKey directory, and GDAL's nodata tag.
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::Path;

use log::{debug, info, warn};
use tiff::decoder::{ChunkType, Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder, TiffValue};
use tiff::tags::Tag;

use super::block::Block;
use super::dataset::{RasterReader, RasterWriter};
use super::profile::{CrsModel, DType, GeoTransform, RasterProfile};
use super::window::RasterWindow;
use crate::error::{Error, Result};

const GEO_KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const GEO_KEY_PROJECTED_TYPE: u16 = 3072;
const GEO_KEY_MODEL_TYPE: u16 = 1024;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
/// EPSG's block of geographic 2D systems.
const GEOGRAPHIC_EPSG_RANGE: std::ops::RangeInclusive<u16> = 4000..=4999;
/// Projected systems inside the geographic block.
const PROJECTED_IN_GEOGRAPHIC_RANGE: [u16; 2] = [4087, 4088];
/// Common geographic systems outside the geographic block.
const GEOGRAPHIC_OUTSIDE_RANGE: [u16; 8] = [3824, 3889, 3906, 6318, 6322, 6325, 6783, 7844];

// ── Import ────────────────────────────────────────────────────────────────────

/// Decode a single-band GeoTIFF into a new block raster at `dst`.
///
/// The image is copied one strip or tile at a time, so memory use is bounded
/// by the file's chunk size rather than the image size.
pub fn import_geotiff(src: &Path, dst: &Path, block_size: (usize, usize)) -> Result<RasterProfile> {
    info!("Importing GeoTIFF {}", src.display());
    let file = File::open(src)?;
    let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());

    match decoder.colortype()? {
        tiff::ColorType::Gray(_) => {}
        other => {
            return Err(Error::format(src, format!("expected a single-band image, found {other:?}")))
        }
    }
    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);

    let transform = read_transform(&mut decoder);
    let (crs, crs_model) = match read_epsg(&mut decoder) {
        Some((code, model)) => (Some(format!("EPSG:{code}")), Some(model)),
        None => (None, None),
    };
    let nodata = decoder
        .get_tag_ascii_string(Tag::GdalNodata)
        .ok()
        .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok());

    let layout = chunk_windows(&decoder, width, height);
    let Some(&first) = layout.first() else {
        return Err(Error::format(src, "image has no pixels"));
    };
    let (dtype, first_samples) = decode_chunk(src, decoder.read_chunk(0)?)?;

    let profile = RasterProfile {
        width,
        height,
        transform: transform.unwrap_or_default(),
        crs,
        crs_model,
        dtype,
        nodata,
        block_size,
    };
    debug!("Imported profile: {profile:?}, {} chunks", layout.len());

    let mut writer = RasterWriter::create(dst, &profile)?;
    write_chunk(src, &mut writer, first, first_samples)?;
    for (index, &window) in layout.iter().enumerate().skip(1) {
        let (chunk_dtype, samples) = decode_chunk(src, decoder.read_chunk(index as u32)?)?;
        if chunk_dtype != dtype {
            return Err(Error::format(src, format!("chunk {index} decodes as {chunk_dtype:?}")));
        }
        write_chunk(src, &mut writer, window, samples)?;
    }
    writer.finish()?;
    Ok(profile)
}

/// Pixel windows of the image's strips or tiles, in chunk-index order.
fn chunk_windows<R: std::io::Read + Seek>(
    decoder: &Decoder<R>,
    width: usize,
    height: usize,
) -> Vec<RasterWindow> {
    let (chunk_width, chunk_height) = match decoder.get_chunk_type() {
        ChunkType::Strip => (width, decoder.chunk_dimensions().1 as usize),
        ChunkType::Tile => {
            let (w, h) = decoder.chunk_dimensions();
            (w as usize, h as usize)
        }
    };
    chunk_layout(width, height, chunk_width, chunk_height)
}

/// Row-major chunk grid clipped to the image, matching TIFF chunk indexing.
fn chunk_layout(width: usize, height: usize, chunk_width: usize, chunk_height: usize) -> Vec<RasterWindow> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let (cw, ch) = (chunk_width.clamp(1, width), chunk_height.clamp(1, height));
    let mut windows = Vec::with_capacity(width.div_ceil(cw) * height.div_ceil(ch));
    for row_off in (0..height).step_by(ch) {
        for col_off in (0..width).step_by(cw) {
            windows.push(RasterWindow::new(
                col_off,
                row_off,
                cw.min(width - col_off),
                ch.min(height - row_off),
            ));
        }
    }
    windows
}

fn decode_chunk(src: &Path, chunk: DecodingResult) -> Result<(DType, Vec<f64>)> {
    Ok(match chunk {
        DecodingResult::U8(v) => (DType::U8, v.into_iter().map(f64::from).collect()),
        DecodingResult::U16(v) => (DType::U16, v.into_iter().map(f64::from).collect()),
        DecodingResult::U32(v) => (DType::U32, v.into_iter().map(f64::from).collect()),
        DecodingResult::I8(v) => (DType::I16, v.into_iter().map(f64::from).collect()),
        DecodingResult::I16(v) => (DType::I16, v.into_iter().map(f64::from).collect()),
        DecodingResult::I32(v) => (DType::I32, v.into_iter().map(f64::from).collect()),
        DecodingResult::F32(v) => (DType::F32, v.into_iter().map(f64::from).collect()),
        DecodingResult::F64(v) => (DType::F64, v),
        _ => return Err(Error::format(src, "unsupported sample format")),
    })
}

fn write_chunk(src: &Path, writer: &mut RasterWriter, window: RasterWindow, samples: Vec<f64>) -> Result<()> {
    let count = samples.len();
    let block = Block::from_vec(window, samples).ok_or_else(|| {
        Error::format(src, format!("decoded {count} samples for chunk {window:?}"))
    })?;
    writer.write_window(&block)
}

fn read_transform<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    if let Ok(m) = decoder.get_tag_f64_vec(Tag::ModelTransformationTag) {
        if m.len() >= 8 {
            return Some(GeoTransform {
                origin_x: m[3],
                pixel_width: m[0],
                row_rotation: m[1],
                origin_y: m[7],
                col_rotation: m[4],
                pixel_height: m[5],
            });
        }
    }
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok()?;
    let tie = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok()?;
    if scale.len() < 2 || tie.len() < 6 {
        return None;
    }
    let (sx, sy) = (scale[0], scale[1]);
    Some(GeoTransform::north_up(tie[3] - tie[0] * sx, tie[4] + tie[1] * sy, sx, sy))
}

fn read_epsg<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Option<(u16, CrsModel)> {
    let keys = decoder.get_tag_u16_vec(Tag::GeoKeyDirectoryTag).ok()?;
    let entries = keys.get(4..)?;
    let mut geographic = None;
    for key in entries.chunks_exact(4) {
        // Location 0 means the value is stored inline.
        if key[1] != 0 {
            continue;
        }
        match key[0] {
            GEO_KEY_PROJECTED_TYPE => return Some((key[3], CrsModel::Projected)),
            GEO_KEY_GEOGRAPHIC_TYPE => geographic = Some((key[3], CrsModel::Geographic)),
            _ => {}
        }
    }
    geographic
}

/// Model of an EPSG code when the profile does not carry one.
fn epsg_model(code: u16) -> CrsModel {
    let geographic = (GEOGRAPHIC_EPSG_RANGE.contains(&code)
        && !PROJECTED_IN_GEOGRAPHIC_RANGE.contains(&code))
        || GEOGRAPHIC_OUTSIDE_RANGE.contains(&code);
    if geographic {
        CrsModel::Geographic
    } else {
        CrsModel::Projected
    }
}

// ── Export ────────────────────────────────────────────────────────────────────

/// Stream a block raster into a strip-organised GeoTIFF at `dst`.
pub fn export_geotiff(src: &Path, dst: &Path) -> Result<()> {
    let mut reader = RasterReader::open(src)?;
    let file = File::create(dst)
        .map_err(|e| Error::resource(format!("GeoTIFF output {}", dst.display()), e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;

    match reader.profile().dtype {
        DType::U8 => write_strips::<colortype::Gray8, _, _>(&mut encoder, &mut reader, |v| v as u8)?,
        DType::U16 => {
            write_strips::<colortype::Gray16, _, _>(&mut encoder, &mut reader, |v| v as u16)?
        }
        DType::I16 => {
            write_strips::<colortype::GrayI16, _, _>(&mut encoder, &mut reader, |v| v as i16)?
        }
        DType::U32 => {
            write_strips::<colortype::Gray32, _, _>(&mut encoder, &mut reader, |v| v as u32)?
        }
        DType::I32 => {
            write_strips::<colortype::GrayI32, _, _>(&mut encoder, &mut reader, |v| v as i32)?
        }
        DType::F32 => {
            write_strips::<colortype::Gray32Float, _, _>(&mut encoder, &mut reader, |v| v as f32)?
        }
        DType::F64 => write_strips::<colortype::Gray64Float, _, _>(&mut encoder, &mut reader, |v| v)?,
    }
    info!("Exported {} -> {}", src.display(), dst.display());
    Ok(())
}

fn write_strips<C, W, F>(
    encoder: &mut TiffEncoder<W>,
    reader: &mut RasterReader,
    convert: F,
) -> Result<()>
where
    C: colortype::ColorType,
    W: Write + Seek,
    [C::Inner]: TiffValue,
    F: Fn(f64) -> C::Inner,
{
    let profile = reader.profile().clone();
    let tags = GeoTags::from_profile(&profile);
    let mut image = encoder.new_image::<C>(profile.width as u32, profile.height as u32)?;

    let dir = image.encoder();
    if let Some(scale) = &tags.pixel_scale {
        dir.write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    }
    if let Some(tiepoint) = &tags.tiepoint {
        dir.write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    }
    if let Some(matrix) = &tags.transformation {
        dir.write_tag(Tag::ModelTransformationTag, &matrix[..])?;
    }
    if let Some(keys) = &tags.geo_keys {
        dir.write_tag(Tag::GeoKeyDirectoryTag, &keys[..])?;
    }
    if let Some(nodata) = &tags.nodata {
        dir.write_tag(Tag::GdalNodata, nodata.as_str())?;
    }

    let rows_per_strip = profile.block_size.1.clamp(1, profile.height.max(1));
    image.rows_per_strip(rows_per_strip as u32)?;

    for row_off in (0..profile.height).step_by(rows_per_strip) {
        let rows = rows_per_strip.min(profile.height - row_off);
        let block = reader.read_window(&RasterWindow::new(0, row_off, profile.width, rows))?;
        let samples: Vec<C::Inner> = block.data.iter().map(|&v| convert(v)).collect();
        image.write_strip(&samples)?;
    }
    image.finish()?;
    Ok(())
}

/// Georeferencing tag values for one profile.
#[derive(Debug, Default, PartialEq)]
struct GeoTags {
    pixel_scale: Option<[f64; 3]>,
    tiepoint: Option<[f64; 6]>,
    transformation: Option<[f64; 16]>,
    geo_keys: Option<[u16; 12]>,
    nodata: Option<String>,
}

impl GeoTags {
    fn from_profile(profile: &RasterProfile) -> Self {
        let t = profile.transform;
        let mut tags = GeoTags::default();

        if t.row_rotation == 0.0 && t.col_rotation == 0.0 {
            tags.pixel_scale = Some([t.pixel_width, -t.pixel_height, 0.0]);
            tags.tiepoint = Some([0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0]);
        } else {
            tags.transformation = Some([
                t.pixel_width, t.row_rotation, 0.0, t.origin_x,
                t.col_rotation, t.pixel_height, 0.0, t.origin_y,
                0.0, 0.0, 0.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            ]);
        }

        tags.geo_keys = profile.crs.as_deref().and_then(|crs| {
            let code = crs.strip_prefix("EPSG:").and_then(|code| code.parse::<u16>().ok());
            let Some(code) = code else {
                warn!("CRS {crs:?} has no GeoTIFF EPSG encoding; writing without GeoKeys");
                return None;
            };
            let (model, key) = match profile.crs_model.unwrap_or_else(|| epsg_model(code)) {
                CrsModel::Geographic => (MODEL_TYPE_GEOGRAPHIC, GEO_KEY_GEOGRAPHIC_TYPE),
                CrsModel::Projected => (MODEL_TYPE_PROJECTED, GEO_KEY_PROJECTED_TYPE),
            };
            Some([1, 1, 0, 2, GEO_KEY_MODEL_TYPE, 0, 1, model, key, 0, 1, code])
        });

        tags.nodata = profile.nodata.map(|nd| format!("{nd}"));
        tags
    }
}
