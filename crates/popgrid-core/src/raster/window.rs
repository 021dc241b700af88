//! Window planning: split a raster extent into disjoint rectangular tiles.
use serde::{Deserialize, Serialize};

/// A rectangular region on a raster's pixel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RasterWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl RasterWindow {
    pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
        Self { col_off, row_off, width, height }
    }

    /// The window spanning a whole `width` × `height` raster.
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fits_within(&self, width: usize, height: usize) -> bool {
        self.col_off + self.width <= width && self.row_off + self.height <= height
    }

    pub fn intersects(&self, other: &RasterWindow) -> bool {
        self.col_off < other.col_off + other.width
            && other.col_off < self.col_off + self.width
            && self.row_off < other.row_off + other.height
            && other.row_off < self.row_off + self.height
    }
}

/// Partition a `width` × `height` extent into row-major tiles of at most
/// `block_width` × `block_height` pixels.
///
/// Edge tiles are clipped to the extent, never padded. A tile size at least as
/// large as the extent yields one whole-raster window. An empty extent yields
/// no windows.
pub fn plan_windows(
    width: usize,
    height: usize,
    block_width: usize,
    block_height: usize,
) -> Vec<RasterWindow> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let bw = block_width.max(1);
    let bh = block_height.max(1);

    let mut windows = Vec::with_capacity(width.div_ceil(bw) * height.div_ceil(bh));
    for row_off in (0..height).step_by(bh) {
        for col_off in (0..width).step_by(bw) {
            windows.push(RasterWindow {
                col_off,
                row_off,
                width: bw.min(width - col_off),
                height: bh.min(height - row_off),
            });
        }
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn assert_partition(width: usize, height: usize, windows: &[RasterWindow]) {
        let mut hits = vec![0u8; width * height];
        for w in windows {
            assert!(w.fits_within(width, height), "{w:?} escapes {width}x{height}");
            assert!(!w.is_empty());
            for r in w.row_off..w.row_off + w.height {
                for c in w.col_off..w.col_off + w.width {
                    hits[r * width + c] += 1;
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1), "every pixel must be covered exactly once");
    }

    #[test]
    fn clips_edge_windows() {
        let windows = plan_windows(5, 3, 2, 2);
        assert_eq!(windows.len(), 6);
        assert_eq!(windows[2], RasterWindow::new(4, 0, 1, 2));
        assert_eq!(windows[5], RasterWindow::new(4, 2, 1, 1));
        assert_partition(5, 3, &windows);
    }

    #[test]
    fn oversized_tile_collapses_to_single_window() {
        let windows = plan_windows(7, 4, 512, 512);
        assert_eq!(windows, vec![RasterWindow::full(7, 4)]);
    }

    #[test]
    fn order_is_row_major() {
        let windows = plan_windows(4, 4, 2, 2);
        let offsets: Vec<_> = windows.iter().map(|w| (w.row_off, w.col_off)).collect();
        assert_eq!(offsets, vec![(0, 0), (0, 2), (2, 0), (2, 2)]);
    }

    #[test]
    fn random_extents_partition_exactly() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let width = rng.gen_range(1..60);
            let height = rng.gen_range(1..60);
            let bw = rng.gen_range(1..70);
            let bh = rng.gen_range(1..70);
            let windows = plan_windows(width, height, bw, bh);
            assert_partition(width, height, &windows);
            for (i, a) in windows.iter().enumerate() {
                for b in &windows[i + 1..] {
                    assert!(!a.intersects(b));
                }
            }
        }
    }

    #[test]
    fn empty_extent_has_no_windows() {
        assert!(plan_windows(0, 10, 4, 4).is_empty());
    }
}
