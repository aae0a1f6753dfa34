//! The shared image: one attached segment, its server-side binding, and the
//! operations of the render-then-present cycle.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::link::{Link, LinkBackend, PutTarget, Seg, VisualInfo};
use crate::{DrawTarget, IntRect, IntSize, ShmError, ShmSegment, SurfaceFormat};

/// A pixel buffer shared between this process and the display server.
///
/// Size and format are fixed at construction; a resize retires the instance
/// and builds a new one. Handles are shared as `Arc<ShmImage>` so the final
/// release may happen on any thread: a render thread may create images that
/// a control thread destroys at shutdown. The last drop, wherever it runs,
/// detaches the server binding and then frees the segment, exactly once; the
/// atomic reference count is the only synchronization involved.
///
/// The image is not internally synchronized beyond that: callers must not
/// render into and present from the same instance concurrently.
pub struct ShmImage {
    link: Link,
    size: IntSize,
    format: SurfaceFormat,
    stride: usize,
    segment: ShmSegment,
    binding: Option<Seg>,
}

impl fmt::Debug for ShmImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmImage")
            .field("size", &self.size)
            .field("format", &self.format)
            .field("stride", &self.stride)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl ShmImage {
    /// Allocate a segment for `size`, attach it to the server, and wrap the
    /// pair as an image.
    ///
    /// Unwinds on partial failure: a segment whose attach is rejected is
    /// released before this returns, and nothing is held on error.
    pub(crate) fn create(
        link: &Link,
        size: IntSize,
        visual: &VisualInfo,
    ) -> Result<Arc<Self>, ShmError> {
        if !LinkBackend::use_shm(link) {
            return Err(ShmError::Unavailable);
        }
        let format = SurfaceFormat::from_depth(visual.depth).ok_or_else(|| {
            ShmError::Binding(format!("no buffer format for depth {}", visual.depth))
        })?;
        if !LinkBackend::supports_visual(link, visual) {
            return Err(ShmError::Binding(format!(
                "visual {:#x} at depth {} is not displayable here",
                visual.visual, visual.depth
            )));
        }
        if size.is_empty() || size.width > u16::MAX as i32 || size.height > u16::MAX as i32 {
            return Err(ShmError::Allocation(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("image size {}x{} out of range", size.width, size.height),
            )));
        }

        let stride = format.stride(size.width);
        let mut segment = ShmSegment::create(format.buffer_len(size))?;
        let binding = LinkBackend::attach(link, &segment, true)?;
        // The server holds its own attach now; let the kernel reclaim the
        // segment once both sides are gone, even if this process crashes.
        segment.mark_removed();

        Ok(Arc::new(Self {
            link: link.clone(),
            size,
            format,
            stride,
            segment,
            binding: Some(binding),
        }))
    }

    pub fn size(&self) -> IntSize {
        self.size
    }

    pub fn format(&self) -> SurfaceFormat {
        self.format
    }

    /// Bytes per buffer row.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub(crate) fn buffer_ptr(&self) -> *mut u8 {
        self.segment.as_ptr()
    }

    pub(crate) fn buffer_len(&self) -> usize {
        self.format.buffer_len(self.size)
    }

    /// A transient drawable view over the buffer.
    ///
    /// The view must not outlive the render pass that produced it, and at
    /// most one view may be live per instance at a time. That is the
    /// render-then-present cycle's convention, not something this type
    /// enforces.
    pub fn draw_target(&self) -> DrawTarget<'_> {
        DrawTarget::new(self)
    }

    /// Transfer the dirty `region` of the buffer to `target`.
    ///
    /// Blocks until the server has consumed the transferred bytes, so the
    /// caller may render the next frame into the buffer as soon as this
    /// returns. Rectangles are clamped to the image bounds and fully
    /// outside rectangles are skipped. A reported failure means the frame
    /// should be redrawn through the fallback path; there is no partial
    /// retry here.
    pub fn put(&self, target: PutTarget, region: &[IntRect]) -> Result<(), ShmError> {
        let Some(seg) = self.binding else {
            return Err(ShmError::Transfer("image has no server binding".into()));
        };
        let bounds = self.size.bounds();
        let rects: Vec<IntRect> = region
            .iter()
            .filter_map(|r| r.intersection(&bounds))
            .collect();
        if rects.is_empty() {
            return Ok(());
        }
        LinkBackend::put_image(&self.link, &target, seg, self.size, self.format, &rects)?;
        LinkBackend::sync(&self.link)
    }
}

impl Drop for ShmImage {
    fn drop(&mut self) {
        // Detach before the segment itself goes away; the segment's own
        // drop then unmaps and releases it.
        if let Some(seg) = self.binding.take() {
            LinkBackend::detach(&self.link, seg);
        }
    }
}

#[cfg(all(test, feature = "mem"))]
mod tests {
    use super::*;

    #[test]
    fn unsupported_depth_is_refused_before_any_allocation() {
        let (link, server) = Link::in_proc();
        let visual = VisualInfo {
            visual: 0,
            depth: 30,
        };
        let err = ShmImage::create(&link, IntSize::new(64, 64), &visual).unwrap_err();
        assert!(matches!(err, ShmError::Binding(_)));
        assert_eq!(server.ledger().attaches, 0);
    }

    #[test]
    fn oversized_and_empty_images_are_refused() {
        let (link, _server) = Link::in_proc();
        let visual = VisualInfo {
            visual: 0,
            depth: 32,
        };
        for size in [
            IntSize::new(0, 10),
            IntSize::new(10, -1),
            IntSize::new(1 << 17, 10),
        ] {
            let err = ShmImage::create(&link, size, &visual).unwrap_err();
            assert!(matches!(err, ShmError::Allocation(_)));
        }
    }

    #[test]
    fn put_before_clamping_skips_empty_regions() {
        let (link, server) = Link::in_proc();
        let visual = VisualInfo {
            visual: 0,
            depth: 32,
        };
        let image = ShmImage::create(&link, IntSize::new(32, 32), &visual).unwrap();

        image
            .put(
                PutTarget::Drawable(crate::Drawable(1)),
                &[IntRect::new(100, 100, 10, 10)],
            )
            .unwrap();
        assert_eq!(server.ledger().puts, 0);

        image.put(PutTarget::Drawable(crate::Drawable(1)), &[]).unwrap();
        assert_eq!(server.ledger().puts, 0);
    }

    #[test]
    fn drop_detaches_exactly_once() {
        let (link, server) = Link::in_proc();
        let visual = VisualInfo {
            visual: 0,
            depth: 32,
        };
        let image = ShmImage::create(&link, IntSize::new(16, 16), &visual).unwrap();
        let second = Arc::clone(&image);

        drop(image);
        assert_eq!(server.ledger().detaches, 0);

        drop(second);
        let ledger = server.ledger();
        assert_eq!(ledger.detaches, 1);
        assert!(ledger.balanced());
    }
}
