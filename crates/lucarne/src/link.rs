//! The display-server seam.
//!
//! The public API is the [`Link`] enum. Each backend lives in its own module
//! under `link/` and implements the internal [`LinkBackend`] trait; we use
//! `enum_dispatch` to forward calls without handwritten `match` boilerplate.

use enum_dispatch::enum_dispatch;

use crate::{IntRect, IntSize, ShmError, ShmSegment, SurfaceFormat};

/// Server-side descriptor for an attached segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Seg(pub u32);

/// The target window's pixel layout, as reported by the toolkit.
///
/// Both fields are foreign values passed through untouched; this library
/// never allocates or frees them. A `visual` of 0 means "any visual at this
/// depth".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisualInfo {
    pub visual: u32,
    pub depth: u8,
}

/// A raw server-side drawable handle (window or pixmap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Drawable(pub u32);

/// A toolkit window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window(pub u32);

/// Where a transfer lands: one operation, two call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutTarget {
    /// Raw drawable plus a caller-supplied dirty region.
    Drawable(Drawable),
    /// Toolkit window; callers pass the exposed rectangle as the region.
    Window(Window),
}

impl PutTarget {
    pub(crate) fn xid(&self) -> u32 {
        match self {
            PutTarget::Drawable(d) => d.0,
            PutTarget::Window(w) => w.0,
        }
    }
}

#[enum_dispatch]
pub(crate) trait LinkBackend: Send + Sync + Clone + 'static {
    /// Uncached structural-availability check.
    fn probe_shm(&self) -> bool;

    /// Cached probe result; stable for the life of the connection.
    fn use_shm(&self) -> bool;

    /// Whether the server can source images of this visual/depth.
    fn supports_visual(&self, visual: &VisualInfo) -> bool;

    /// Attach handshake. Returns the descriptor only once the server has
    /// acknowledged the attach.
    fn attach(&self, segment: &ShmSegment, read_only: bool) -> Result<Seg, ShmError>;

    /// Detach a previously attached segment. Teardown must complete, so
    /// errors are logged and swallowed.
    fn detach(&self, seg: Seg);

    /// Transfer `rects` (already clamped to `size`) from the segment to
    /// `target`.
    fn put_image(
        &self,
        target: &PutTarget,
        seg: Seg,
        size: IntSize,
        format: SurfaceFormat,
        rects: &[IntRect],
    ) -> Result<(), ShmError>;

    /// Round trip that returns once the server has consumed every transfer
    /// issued so far.
    fn sync(&self) -> Result<(), ShmError>;
}

#[enum_dispatch(LinkBackend)]
#[derive(Clone)]
pub enum Link {
    #[cfg(feature = "mem")]
    Mem(mem::MemLink),
    #[cfg(feature = "x11")]
    X11(x11::X11Link),
}

impl Link {
    /// Whether the shared-memory fast path is usable on this connection.
    ///
    /// Checked once and cached; never fails loudly. `false` means "always
    /// take the fallback path"; every other operation in this crate is dead
    /// code in that mode.
    pub fn use_shm(&self) -> bool {
        LinkBackend::use_shm(self)
    }

    /// An in-process link pair: the `Link` to hand to the factory plus the
    /// server handle tests and headless callers inspect.
    #[cfg(feature = "mem")]
    pub fn in_proc() -> (Self, mem::MemLink) {
        let server = mem::MemLink::new();
        (Link::Mem(server.clone()), server)
    }

    /// Connect to an X display (`None` means `$DISPLAY`).
    #[cfg(feature = "x11")]
    pub fn x11_connect(display: Option<&str>) -> Result<Self, ShmError> {
        Ok(Link::X11(x11::X11Link::connect(display)?))
    }
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "x11")]
pub mod x11;
