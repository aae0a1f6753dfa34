//! Transient drawable views over a shared image's buffer.

use std::marker::PhantomData;
use std::slice;

use crate::{IntSize, ShmImage, SurfaceFormat};

/// A borrow-limited view of a [`ShmImage`] buffer for one render pass.
///
/// Holding a `DrawTarget` does not extend the image's ownership, and the
/// caller's render-then-present cycle keeps at most one view live per image
/// at a time.
pub struct DrawTarget<'a> {
    data: *mut u8,
    len: usize,
    size: IntSize,
    stride: usize,
    format: SurfaceFormat,
    _image: PhantomData<&'a ShmImage>,
}

impl<'a> DrawTarget<'a> {
    pub(crate) fn new(image: &'a ShmImage) -> Self {
        Self {
            data: image.buffer_ptr(),
            len: image.buffer_len(),
            size: image.size(),
            stride: image.stride(),
            format: image.format(),
            _image: PhantomData,
        }
    }

    pub fn size(&self) -> IntSize {
        self.size
    }

    /// Bytes per row, including scanline padding.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn format(&self) -> SurfaceFormat {
        self.format
    }

    /// The whole buffer as bytes.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the borrow of the image pins its segment, so the mapping
        // stays valid for 'a.
        unsafe { slice::from_raw_parts(self.data, self.len) }
    }

    /// The whole buffer as writable bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`; `&mut self` keeps this the only slice
        // handed out through this view.
        unsafe { slice::from_raw_parts_mut(self.data, self.len) }
    }

    /// The buffer as 32-bit pixels, for the 4-byte formats. `None` for the
    /// 16- and 8-bit formats.
    pub fn pixels_mut(&mut self) -> Option<&mut [u32]> {
        if self.format.bytes_per_pixel() != 4 {
            return None;
        }
        // The mapping is page-aligned and the length a multiple of four, so
        // the cast cannot fail.
        Some(bytemuck::cast_slice_mut(self.bytes_mut()))
    }

    /// Writable bytes of row `y`, without its scanline padding.
    pub fn row_mut(&mut self, y: i32) -> Option<&mut [u8]> {
        if y < 0 || y >= self.size.height {
            return None;
        }
        let start = y as usize * self.stride;
        let end = start + self.size.width.max(0) as usize * self.format.bytes_per_pixel();
        self.bytes_mut().get_mut(start..end)
    }
}

#[cfg(all(test, feature = "mem"))]
mod tests {
    use crate::{IntSize, Link, ShmImage, SurfaceFormat, VisualInfo};

    fn image(depth: u8, size: IntSize) -> std::sync::Arc<ShmImage> {
        let (link, _server) = Link::in_proc();
        ShmImage::create(
            &link,
            size,
            &VisualInfo { visual: 0, depth },
        )
        .unwrap()
    }

    #[test]
    fn pixel_view_matches_the_byte_view() {
        let image = image(32, IntSize::new(8, 2));
        let mut target = image.draw_target();

        let pixels = target.pixels_mut().unwrap();
        assert_eq!(pixels.len(), 8 * 2);
        pixels[9] = 0x11223344;

        let bytes = target.bytes();
        assert_eq!(&bytes[36..40], &0x11223344u32.to_ne_bytes());
    }

    #[test]
    fn sixteen_bit_formats_have_no_u32_view() {
        let image = image(16, IntSize::new(8, 2));
        let mut target = image.draw_target();
        assert_eq!(target.format(), SurfaceFormat::R5G6B5);
        assert!(target.pixels_mut().is_none());
    }

    #[test]
    fn rows_exclude_scanline_padding() {
        let image = image(16, IntSize::new(33, 4));
        let mut target = image.draw_target();
        assert_eq!(target.stride(), 68);
        assert_eq!(target.row_mut(0).unwrap().len(), 66);
        assert!(target.row_mut(4).is_none());
        assert!(target.row_mut(-1).is_none());
    }
}
