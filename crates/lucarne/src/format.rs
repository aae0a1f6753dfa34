//! Pixel formats the shared buffer can be exposed as.

use crate::IntSize;

/// The fixed set of buffer formats, keyed by the target window's color depth.
///
/// Component names are memory order on a little-endian host, which is what
/// the server expects for ZPixmap transfers on the platforms this runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceFormat {
    /// Depth 32: blue, green, red, alpha.
    B8G8R8A8,
    /// Depth 24: blue, green, red, one unused byte.
    B8G8R8X8,
    /// Depth 16: packed 5-6-5 RGB.
    R5G6B5,
    /// Depth 8: a single alpha channel.
    A8,
}

impl SurfaceFormat {
    /// Map a color depth onto a buffer format. Depths outside the fixed set
    /// have none, and callers refuse the fast path for them.
    pub fn from_depth(depth: u8) -> Option<Self> {
        match depth {
            32 => Some(SurfaceFormat::B8G8R8A8),
            24 => Some(SurfaceFormat::B8G8R8X8),
            16 => Some(SurfaceFormat::R5G6B5),
            8 => Some(SurfaceFormat::A8),
            _ => None,
        }
    }

    pub fn depth(self) -> u8 {
        match self {
            SurfaceFormat::B8G8R8A8 => 32,
            SurfaceFormat::B8G8R8X8 => 24,
            SurfaceFormat::R5G6B5 => 16,
            SurfaceFormat::A8 => 8,
        }
    }

    /// Bytes each pixel occupies in the buffer. Depth 24 still packs into
    /// 32 bits, matching the server's pixmap format for that depth.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            SurfaceFormat::B8G8R8A8 | SurfaceFormat::B8G8R8X8 => 4,
            SurfaceFormat::R5G6B5 => 2,
            SurfaceFormat::A8 => 1,
        }
    }

    /// Bytes per buffer row, padded to the 32-bit scanline boundary ZPixmap
    /// data uses.
    pub fn stride(self, width: i32) -> usize {
        let row = width.max(0) as usize * self.bytes_per_pixel();
        (row + 3) & !3
    }

    /// Total buffer size for an image of `size`.
    pub fn buffer_len(self, size: IntSize) -> usize {
        self.stride(size.width) * size.height.max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_maps_onto_the_fixed_format_set() {
        assert_eq!(SurfaceFormat::from_depth(32), Some(SurfaceFormat::B8G8R8A8));
        assert_eq!(SurfaceFormat::from_depth(24), Some(SurfaceFormat::B8G8R8X8));
        assert_eq!(SurfaceFormat::from_depth(16), Some(SurfaceFormat::R5G6B5));
        assert_eq!(SurfaceFormat::from_depth(8), Some(SurfaceFormat::A8));
        assert_eq!(SurfaceFormat::from_depth(30), None);
        assert_eq!(SurfaceFormat::from_depth(0), None);
    }

    #[test]
    fn stride_is_scanline_padded() {
        assert_eq!(SurfaceFormat::B8G8R8A8.stride(800), 3200);
        assert_eq!(SurfaceFormat::R5G6B5.stride(33), 68);
        assert_eq!(SurfaceFormat::A8.stride(5), 8);
        assert_eq!(SurfaceFormat::A8.stride(-1), 0);
    }

    #[test]
    fn buffer_len_covers_every_row() {
        let size = IntSize::new(33, 17);
        assert_eq!(
            SurfaceFormat::R5G6B5.buffer_len(size),
            SurfaceFormat::R5G6B5.stride(33) * 17
        );
        assert_eq!(SurfaceFormat::B8G8R8A8.buffer_len(IntSize::new(0, 10)), 0);
    }
}
