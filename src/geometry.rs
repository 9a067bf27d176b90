use std::fmt;

/// A size in layout points.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const ZERO: Size = Size {
        width: 0.0,
        height: 0.0,
    };

    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_zero(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Convert to device pixels, rounding to whole pixels.
    pub fn scaled(&self, scale: f64) -> PixelSize {
        PixelSize {
            width: (self.width * scale).round().max(0.0) as u32,
            height: (self.height * scale).round().max(0.0) as u32,
        }
    }
}

/// A size in device pixels. Requested image sizes are always compared in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for PixelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Address of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionKey {
    pub section: usize,
    pub item: usize,
}

impl PositionKey {
    pub fn new(section: usize, item: usize) -> Self {
        Self { section, item }
    }

    /// Key in the single section used by the asset grid.
    pub fn item(item: usize) -> Self {
        Self { section: 0, item }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.section, self.item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_rounds_to_pixels() {
        let size = Size::new(123.4, 50.0);
        assert_eq!(size.scaled(2.0), PixelSize::new(247, 100));
        assert_eq!(Size::new(75.0, 75.0).scaled(2.0), PixelSize::new(150, 150));
    }

    #[test]
    fn test_zero_sizes() {
        assert!(Size::ZERO.is_zero());
        assert!(Size::new(10.0, 0.0).is_zero());
        assert!(!Size::new(1.0, 1.0).is_zero());
        assert!(PixelSize::new(0, 4).is_zero());
    }

    #[test]
    fn test_position_key_ordering() {
        let mut keys = vec![PositionKey::new(1, 0), PositionKey::item(5), PositionKey::item(2)];
        keys.sort();
        assert_eq!(
            keys,
            vec![PositionKey::item(2), PositionKey::item(5), PositionKey::new(1, 0)]
        );
    }
}
