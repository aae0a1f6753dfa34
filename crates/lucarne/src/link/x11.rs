//! X11 link backend over x11rb and the MIT-SHM extension.
//!
//! Attach goes through a checked request so the server's acknowledgment (or
//! rejection) is observed before construction proceeds. Transfers are
//! checked as a batch and followed by a reply-carrying round trip, so a
//! returned `put` guarantees the server is done reading the segment.

use std::sync::{Arc, OnceLock};

use x11rb::connection::Connection;
use x11rb::protocol::shm::ConnectionExt as _;
use x11rb::protocol::xproto::{self, ConnectionExt as _};
use x11rb::rust_connection::RustConnection;

use crate::link::{LinkBackend, PutTarget, Seg, VisualInfo};
use crate::{IntRect, IntSize, ShmError, ShmSegment, SurfaceFormat};

/// A shared X display connection.
///
/// Clones share the underlying connection; the display itself is a foreign
/// resource this type never closes on the server's behalf.
#[derive(Clone)]
pub struct X11Link {
    inner: Arc<X11Inner>,
}

struct X11Inner {
    conn: RustConnection,
    screen: usize,
    shm_usable: OnceLock<bool>,
}

impl X11Link {
    /// Connect to the display named by `display` (`None` means `$DISPLAY`).
    pub fn connect(display: Option<&str>) -> Result<Self, ShmError> {
        let (conn, screen) = RustConnection::connect(display)
            .map_err(|e| ShmError::Binding(format!("display connection failed: {}", e)))?;
        Ok(Self {
            inner: Arc::new(X11Inner {
                conn,
                screen,
                shm_usable: OnceLock::new(),
            }),
        })
    }

    /// The underlying protocol connection.
    pub fn connection(&self) -> &RustConnection {
        &self.inner.conn
    }

    /// Index of the default screen.
    pub fn screen(&self) -> usize {
        self.inner.screen
    }
}

impl LinkBackend for X11Link {
    fn probe_shm(&self) -> bool {
        let conn = &self.inner.conn;

        // Extension handshake first; a server without MIT-SHM would
        // otherwise kill the connection over the unknown request.
        match conn.shm_query_version() {
            Ok(cookie) => {
                if cookie.reply().is_err() {
                    return false;
                }
            }
            Err(_) => return false,
        }

        // A real attach/detach round trip on a throwaway segment. This is
        // what distinguishes a local display from a remote one and catches
        // permission failures: the server cannot map a segment it cannot
        // reach, and replies with an error.
        let Ok(seg) = ShmSegment::create(1) else {
            return false;
        };
        let Ok(seg_id) = conn.generate_id() else {
            return false;
        };
        let attached = match conn.shm_attach(seg_id, seg.id() as u32, false) {
            Ok(cookie) => cookie.check().is_ok(),
            Err(_) => false,
        };
        if attached {
            if let Ok(cookie) = conn.shm_detach(seg_id) {
                cookie.ignore_error();
            }
        }
        attached
    }

    fn use_shm(&self) -> bool {
        *self.inner.shm_usable.get_or_init(|| {
            let usable = self.probe_shm();
            if !usable {
                tracing::warn!(
                    "MIT-SHM is unavailable on this display; falling back to protocol transfers"
                );
            }
            usable
        })
    }

    fn supports_visual(&self, visual: &VisualInfo) -> bool {
        let Some(format) = SurfaceFormat::from_depth(visual.depth) else {
            return false;
        };
        let setup = self.inner.conn.setup();

        // The server must pack this depth the way the buffer does.
        let packs_match = setup
            .pixmap_formats
            .iter()
            .any(|f| f.depth == visual.depth && f.bits_per_pixel as usize == format.bytes_per_pixel() * 8);
        if !packs_match {
            return false;
        }

        if visual.visual == 0 {
            return true;
        }
        setup
            .roots
            .iter()
            .flat_map(|screen| screen.allowed_depths.iter())
            .filter(|d| d.depth == visual.depth)
            .flat_map(|d| d.visuals.iter())
            .any(|v| v.visual_id == visual.visual)
    }

    fn attach(&self, segment: &ShmSegment, read_only: bool) -> Result<Seg, ShmError> {
        let conn = &self.inner.conn;
        let seg_id = conn
            .generate_id()
            .map_err(|e| ShmError::Binding(format!("XID allocation failed: {}", e)))?;
        conn.shm_attach(seg_id, segment.id() as u32, read_only)
            .map_err(|e| ShmError::Binding(format!("attach request failed: {}", e)))?
            .check()
            .map_err(|e| ShmError::Binding(format!("server rejected the attach: {}", e)))?;
        Ok(Seg(seg_id))
    }

    fn detach(&self, seg: Seg) {
        match self.inner.conn.shm_detach(seg.0) {
            Ok(cookie) => cookie.ignore_error(),
            Err(err) => tracing::warn!("segment detach failed: {}", err),
        }
    }

    fn put_image(
        &self,
        target: &PutTarget,
        seg: Seg,
        size: IntSize,
        format: SurfaceFormat,
        rects: &[IntRect],
    ) -> Result<(), ShmError> {
        let conn = &self.inner.conn;
        let xid = target.xid();

        // A GC lives only for this transfer, as presentation targets come
        // and go underneath us.
        let gc = conn
            .generate_id()
            .map_err(|e| ShmError::Transfer(format!("XID allocation failed: {}", e)))?;
        conn.create_gc(gc, xid, &xproto::CreateGCAux::new().graphics_exposures(0))
            .map_err(|e| ShmError::Transfer(format!("GC creation failed: {}", e)))?
            .check()
            .map_err(|e| ShmError::Transfer(format!("GC creation rejected: {}", e)))?;

        let result = (|| {
            let mut cookies = Vec::with_capacity(rects.len());
            for rect in rects {
                // Coordinates were clamped to the image bounds, which fit u16.
                let cookie = conn
                    .shm_put_image(
                        xid,
                        gc,
                        size.width as u16,
                        size.height as u16,
                        rect.x as u16,
                        rect.y as u16,
                        rect.width as u16,
                        rect.height as u16,
                        rect.x as i16,
                        rect.y as i16,
                        format.depth(),
                        xproto::ImageFormat::Z_PIXMAP.into(),
                        false,
                        seg.0,
                        0,
                    )
                    .map_err(|e| ShmError::Transfer(format!("transfer request failed: {}", e)))?;
                cookies.push(cookie);
            }
            for cookie in cookies {
                cookie
                    .check()
                    .map_err(|e| ShmError::Transfer(format!("server rejected the transfer: {}", e)))?;
            }
            Ok(())
        })();

        if let Ok(cookie) = conn.free_gc(gc) {
            cookie.ignore_error();
        }
        result
    }

    fn sync(&self) -> Result<(), ShmError> {
        // Requests are processed in order, so by the time this reply comes
        // back the server has finished reading every transferred region.
        self.inner
            .conn
            .get_input_focus()
            .map_err(|e| ShmError::Transfer(format!("sync request failed: {}", e)))?
            .reply()
            .map_err(|e| ShmError::Transfer(format!("sync reply failed: {}", e)))?;
        Ok(())
    }
}
