//! Per-frame entry point: reuse or rebuild the shared image for a size.

use std::sync::Arc;

use crate::{DrawTarget, IntSize, Link, ShmImage, VisualInfo};

/// Ensure `slot` holds a shared image of exactly `size` and return a surface
/// over its buffer.
///
/// A held instance of the same size is reused untouched: no allocation, no
/// server traffic. Any other size releases the held instance first (tearing
/// it down if this was the last owner; an instance's size never changes in
/// place) and builds a replacement.
///
/// `None` means the fast path is off for this frame (probe negative,
/// allocation refused, or the server rejected the binding) and the caller
/// must render through its fallback. The slot is left empty in that case so
/// the next frame re-attempts from scratch.
pub fn ensure_shm_image<'a>(
    link: &Link,
    size: IntSize,
    visual: &VisualInfo,
    slot: &'a mut Option<Arc<ShmImage>>,
) -> Option<DrawTarget<'a>> {
    if !link.use_shm() {
        return None;
    }

    let reusable = slot.as_ref().is_some_and(|image| image.size() == size);
    if !reusable {
        // Retire the old instance before its replacement allocates.
        *slot = None;
        match ShmImage::create(link, size, visual) {
            Ok(image) => {
                tracing::trace!(
                    width = size.width,
                    height = size.height,
                    "built shared image"
                );
                *slot = Some(image);
            }
            Err(err) => {
                tracing::warn!("shared image unavailable, using fallback path: {}", err);
                return None;
            }
        }
    }

    slot.as_ref().map(|image| image.draw_target())
}

#[cfg(all(test, feature = "mem"))]
mod tests {
    use super::*;

    fn argb() -> VisualInfo {
        VisualInfo {
            visual: 0,
            depth: 32,
        }
    }

    #[test]
    fn same_size_reuses_the_instance() {
        let (link, server) = Link::in_proc();
        let mut slot = None;
        let size = IntSize::new(64, 48);

        let first = ensure_shm_image(&link, size, &argb(), &mut slot).unwrap();
        let first_ptr = first.bytes().as_ptr();
        drop(first);
        let held = slot.clone().unwrap();

        let second = ensure_shm_image(&link, size, &argb(), &mut slot).unwrap();
        assert_eq!(second.bytes().as_ptr(), first_ptr);
        drop(second);

        assert!(Arc::ptr_eq(&held, slot.as_ref().unwrap()));
        assert_eq!(server.ledger().attaches, 1);
    }

    #[test]
    fn resize_retires_the_old_instance() {
        let (link, server) = Link::in_proc();
        let mut slot = None;

        ensure_shm_image(&link, IntSize::new(64, 48), &argb(), &mut slot).unwrap();
        let old = slot.clone().unwrap();

        ensure_shm_image(&link, IntSize::new(128, 96), &argb(), &mut slot).unwrap();
        assert!(!Arc::ptr_eq(&old, slot.as_ref().unwrap()));
        drop(old);

        let ledger = server.ledger();
        assert_eq!(ledger.attaches, 2);
        assert_eq!(ledger.detaches, 1);
        assert_eq!(server.live_attachments(), 1);
    }

    #[test]
    fn negative_probe_means_no_allocation_for_any_size() {
        let (link, server) = Link::in_proc();
        server.set_shm_enabled(false);
        let mut slot = None;

        for size in [IntSize::new(1, 1), IntSize::new(800, 600), IntSize::new(0, 0)] {
            assert!(ensure_shm_image(&link, size, &argb(), &mut slot).is_none());
        }
        assert!(slot.is_none());

        let ledger = server.ledger();
        assert_eq!(ledger.attaches, 0);
        assert_eq!(ledger.rejected_attaches, 0);

        // The probe is cached; re-enabling cannot resurrect this link.
        server.set_shm_enabled(true);
        assert!(!link.use_shm());
    }

    #[test]
    fn rejected_binding_fails_closed_and_recovers_next_frame() {
        let (link, server) = Link::in_proc();
        server.deny_attach(true);
        let mut slot = None;
        let size = IntSize::new(64, 48);

        assert!(ensure_shm_image(&link, size, &argb(), &mut slot).is_none());
        assert!(slot.is_none());
        let ledger = server.ledger();
        assert_eq!(ledger.rejected_attaches, 1);
        assert_eq!(server.live_attachments(), 0);

        // The next frame naturally re-attempts from scratch.
        server.deny_attach(false);
        assert!(ensure_shm_image(&link, size, &argb(), &mut slot).is_some());
        assert_eq!(server.ledger().attaches, 1);
    }
}
