//! Disk-backed block raster files.
//!
//! Layout: `PGRD` magic, little-endian u32 header length, JSON-encoded
//! [`RasterProfile`], then row-major little-endian samples of the profile's
//! dtype. A window touches `height` contiguous row segments, so reads and
//! writes never need more than one window in memory.
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;

use super::block::Block;
use super::profile::RasterProfile;
use super::window::RasterWindow;
use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"PGRD";
/// Upper bound on header size; anything larger is a corrupt file.
const MAX_HEADER_LEN: u32 = 1 << 20;

/// Read the profile stored in a block raster's header.
pub fn read_profile(path: &Path) -> Result<RasterProfile> {
    let mut file = BufReader::new(File::open(path)?);
    let (profile, _) = read_header(&mut file, path)?;
    Ok(profile)
}

fn read_header<R: Read>(src: &mut R, path: &Path) -> Result<(RasterProfile, u64)> {
    let mut magic = [0u8; 4];
    src.read_exact(&mut magic)
        .map_err(|_| Error::format(path, "file too short for a header"))?;
    if &magic != MAGIC {
        return Err(Error::format(path, "missing PGRD magic"));
    }
    let mut len = [0u8; 4];
    src.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len);
    if len > MAX_HEADER_LEN {
        return Err(Error::format(path, format!("header length {len} is implausible")));
    }
    let mut json = vec![0u8; len as usize];
    src.read_exact(&mut json)?;
    let profile: RasterProfile = serde_json::from_slice(&json)?;
    Ok((profile, 8 + u64::from(len)))
}

fn check_window(window: &RasterWindow, profile: &RasterProfile) -> Result<()> {
    if window.fits_within(profile.width, profile.height) {
        Ok(())
    } else {
        Err(Error::WindowOutOfBounds {
            window: *window,
            width: profile.width,
            height: profile.height,
        })
    }
}

fn row_offset(profile: &RasterProfile, data_offset: u64, row: usize, col: usize) -> u64 {
    data_offset + ((row * profile.width + col) * profile.dtype.size()) as u64
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Read-only handle on a block raster. Each task opens its own.
pub struct RasterReader {
    file: BufReader<File>,
    profile: RasterProfile,
    data_offset: u64,
    path: PathBuf,
}

impl RasterReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let (profile, data_offset) = read_header(&mut file, path)?;

        let expected = data_offset + (profile.pixel_count() * profile.dtype.size()) as u64;
        let actual = file.get_ref().metadata()?.len();
        if actual < expected {
            return Err(Error::format(
                path,
                format!("truncated: {actual} bytes, expected {expected}"),
            ));
        }

        Ok(Self { file, profile, data_offset, path: path.to_path_buf() })
    }

    pub fn profile(&self) -> &RasterProfile {
        &self.profile
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the pixels under `window`.
    pub fn read_window(&mut self, window: &RasterWindow) -> Result<Block> {
        check_window(window, &self.profile)?;
        let dtype = self.profile.dtype;
        let size = dtype.size();
        let mut row_bytes = vec![0u8; window.width * size];
        let mut data = Vec::with_capacity(window.len());

        for row in window.row_off..window.row_off + window.height {
            let offset = row_offset(&self.profile, self.data_offset, row, window.col_off);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut row_bytes)?;
            data.extend(row_bytes.chunks_exact(size).map(|b| dtype.decode(b)));
        }

        Ok(Block { data, window: *window })
    }

    /// Read the whole raster as one block.
    pub fn read_all(&mut self) -> Result<Block> {
        let window = RasterWindow::full(self.profile.width, self.profile.height);
        self.read_window(&window)
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Exclusive write handle on a new block raster.
pub struct RasterWriter {
    file: File,
    profile: RasterProfile,
    data_offset: u64,
    path: PathBuf,
}

impl RasterWriter {
    /// Create `path` (truncating any existing file) and pre-fill every pixel
    /// with the profile's nodata value, or 0 when it has none.
    pub fn create(path: &Path, profile: &RasterProfile) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::resource(format!("output raster {}", path.display()), e))?;

        let header = serde_json::to_vec(profile)?;
        let mut out = BufWriter::new(file);
        out.write_all(MAGIC)?;
        out.write_all(&(header.len() as u32).to_le_bytes())?;
        out.write_all(&header)?;

        let mut fill_row = Vec::with_capacity(profile.width * profile.dtype.size());
        let fill = profile.nodata.unwrap_or(0.0);
        for _ in 0..profile.width {
            profile.dtype.encode(fill, &mut fill_row);
        }
        for _ in 0..profile.height {
            out.write_all(&fill_row)?;
        }
        let file = out.into_inner().map_err(|e| Error::Io(e.into_error()))?;

        Ok(Self {
            file,
            profile: profile.clone(),
            data_offset: 8 + header.len() as u64,
            path: path.to_path_buf(),
        })
    }

    pub fn profile(&self) -> &RasterProfile {
        &self.profile
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_window(&mut self, block: &Block) -> Result<()> {
        let window = block.window;
        check_window(&window, &self.profile)?;
        let mut row_bytes = Vec::with_capacity(window.width * self.profile.dtype.size());

        for r in 0..window.height {
            row_bytes.clear();
            for &v in block.row(r) {
                self.profile.dtype.encode(v, &mut row_bytes);
            }
            let offset =
                row_offset(&self.profile, self.data_offset, window.row_off + r, window.col_off);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&row_bytes)?;
        }
        Ok(())
    }

    /// Flush and sync. A failed sync is logged, not returned.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.file.flush()?;
        if let Err(e) = self.file.sync_all() {
            warn!("Failed to sync {}: {e}", self.path.display());
        }
        Ok(self.path)
    }
}

/// Write a whole in-memory block as a new raster.
pub fn write_raster(path: &Path, profile: &RasterProfile, block: &Block) -> Result<PathBuf> {
    let mut writer = RasterWriter::create(path, profile)?;
    writer.write_window(block)?;
    writer.finish()
}
