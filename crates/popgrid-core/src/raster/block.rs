use super::window::RasterWindow;

/// Pixel values of one raster window, row-major, widened to f64.
/// Coordinates passed to `get`/`set` are relative to the window origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub data: Vec<f64>,
    pub window: RasterWindow,
}

impl Block {
    /// Create a block covering `window`, filled with the given value.
    pub fn new(window: RasterWindow, fill: f64) -> Self {
        Self { data: vec![fill; window.len()], window }
    }

    /// Wrap an existing row-major buffer. Returns None if the length disagrees
    /// with the window size.
    pub fn from_vec(window: RasterWindow, data: Vec<f64>) -> Option<Self> {
        (data.len() == window.len()).then_some(Self { data, window })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.window.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.window.height
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.window.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f64) {
        self.data[row * self.window.width + col] = val;
    }

    /// One row of the block.
    pub fn row(&self, row: usize) -> &[f64] {
        let start = row * self.window.width;
        &self.data[start..start + self.window.width]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_are_window_relative() {
        let mut block = Block::new(RasterWindow::new(10, 20, 3, 2), 0.0);
        block.set(1, 2, 7.5);
        assert_eq!(block.get(1, 2), 7.5);
        assert_eq!(block.data[5], 7.5);
        assert_eq!(block.row(1), &[0.0, 0.0, 7.5]);
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        let w = RasterWindow::full(2, 2);
        assert!(Block::from_vec(w, vec![0.0; 3]).is_none());
        assert!(Block::from_vec(w, vec![0.0; 4]).is_some());
    }
}
