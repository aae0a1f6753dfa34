//! In-process link backend: a fake display server that maps the same kernel
//! segments a real one would, so attach, detach and transfer are exercised
//! end to end without a display.
//!
//! Tests use the [`MemLink`] handle directly to inject failures and to
//! inspect the traffic [`Ledger`] and per-target framebuffers.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::link::{LinkBackend, PutTarget, Seg, VisualInfo};
use crate::{IntRect, IntSize, ShmError, ShmSegment, SurfaceFormat};

/// Counters and balance checks for server-side traffic.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    /// Acknowledged attaches.
    pub attaches: u64,
    /// Attaches refused by injection or a disabled extension.
    pub rejected_attaches: u64,
    /// Acknowledged detaches.
    pub detaches: u64,
    /// Detaches naming a descriptor the server does not hold. Always a bug.
    pub bad_detaches: u64,
    /// Put requests (one per `put_image` call).
    pub puts: u64,
    /// Individual rectangle transfers.
    pub put_rects: u64,
    /// Consumption round trips.
    pub syncs: u64,
}

impl Ledger {
    /// True when every attach was balanced by exactly one detach and no
    /// detach ever named an unknown descriptor.
    pub fn balanced(&self) -> bool {
        self.attaches == self.detaches && self.bad_detaches == 0
    }
}

/// The server's own mapping of a client segment.
struct ServerMapping {
    addr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is only touched while the server state mutex is held.
unsafe impl Send for ServerMapping {}

impl ServerMapping {
    fn attach(shmid: libc::c_int, read_only: bool) -> Result<Self, ShmError> {
        let flags = if read_only { libc::SHM_RDONLY } else { 0 };
        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), flags) };
        if addr as isize == -1 {
            return Err(ShmError::Binding(format!(
                "server could not map segment {}: {}",
                shmid,
                io::Error::last_os_error()
            )));
        }
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) };
        let len = if rc == 0 { ds.shm_segsz as usize } else { 0 };
        Ok(Self {
            addr: addr as *mut u8,
            len,
        })
    }

    /// The segment bytes as the server sees them.
    ///
    /// # Safety
    ///
    /// The client must not be writing the range concurrently; the blocking
    /// put contract upholds this.
    unsafe fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr, self.len) }
    }
}

impl Drop for ServerMapping {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr as *const libc::c_void);
        }
    }
}

/// A target drawable the fake server composites into.
#[derive(Debug, Clone)]
pub struct Framebuffer {
    pub size: IntSize,
    pub stride: usize,
    pub data: Vec<u8>,
}

impl Framebuffer {
    fn new(size: IntSize, format: SurfaceFormat) -> Self {
        let stride = format.stride(size.width);
        Self {
            size,
            stride,
            data: vec![0; stride * size.height.max(0) as usize],
        }
    }
}

struct ServerState {
    shm_enabled: bool,
    deny_attach: bool,
    deny_put: bool,
    next_seg: u32,
    attached: HashMap<u32, ServerMapping>,
    targets: HashMap<u32, Framebuffer>,
    ledger: Ledger,
}

struct MemInner {
    state: Mutex<ServerState>,
    shm_usable: OnceLock<bool>,
}

/// Handle to the in-process fake display server.
///
/// Clones share the server: the same value serves as the link backend and as
/// the test's inspection handle.
#[derive(Clone)]
pub struct MemLink {
    inner: Arc<MemInner>,
}

impl MemLink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemInner {
                state: Mutex::new(ServerState {
                    shm_enabled: true,
                    deny_attach: false,
                    deny_put: false,
                    next_seg: 1,
                    attached: HashMap::new(),
                    targets: HashMap::new(),
                    ledger: Ledger::default(),
                }),
                shm_usable: OnceLock::new(),
            }),
        }
    }

    /// Structurally disable the extension. The probe result is cached on
    /// first use, so call this before anything probes the link.
    pub fn set_shm_enabled(&self, enabled: bool) {
        self.inner.state.lock().shm_enabled = enabled;
    }

    /// Refuse attaches, the way a server without segment access would.
    pub fn deny_attach(&self, deny: bool) {
        self.inner.state.lock().deny_attach = deny;
    }

    /// Fail transfers without touching any framebuffer.
    pub fn deny_put(&self, deny: bool) {
        self.inner.state.lock().deny_put = deny;
    }

    /// Register a target drawable of the given size and format.
    pub fn create_target(&self, xid: u32, size: IntSize, format: SurfaceFormat) {
        self.inner
            .state
            .lock()
            .targets
            .insert(xid, Framebuffer::new(size, format));
    }

    /// Snapshot of a target's framebuffer.
    pub fn target(&self, xid: u32) -> Option<Framebuffer> {
        self.inner.state.lock().targets.get(&xid).cloned()
    }

    /// Snapshot of the traffic ledger.
    pub fn ledger(&self) -> Ledger {
        self.inner.state.lock().ledger.clone()
    }

    /// Number of segments the server currently holds mapped.
    pub fn live_attachments(&self) -> usize {
        self.inner.state.lock().attached.len()
    }
}

impl Default for MemLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkBackend for MemLink {
    fn probe_shm(&self) -> bool {
        self.inner.state.lock().shm_enabled
    }

    fn use_shm(&self) -> bool {
        *self.inner.shm_usable.get_or_init(|| self.probe_shm())
    }

    fn supports_visual(&self, visual: &VisualInfo) -> bool {
        SurfaceFormat::from_depth(visual.depth).is_some()
    }

    fn attach(&self, segment: &ShmSegment, read_only: bool) -> Result<Seg, ShmError> {
        let mut state = self.inner.state.lock();
        if !state.shm_enabled || state.deny_attach {
            state.ledger.rejected_attaches += 1;
            return Err(ShmError::Binding("server refused the attach".into()));
        }
        let mapping = match ServerMapping::attach(segment.id(), read_only) {
            Ok(mapping) => mapping,
            Err(err) => {
                state.ledger.rejected_attaches += 1;
                return Err(err);
            }
        };
        let seg = Seg(state.next_seg);
        state.next_seg += 1;
        state.attached.insert(seg.0, mapping);
        state.ledger.attaches += 1;
        Ok(seg)
    }

    fn detach(&self, seg: Seg) {
        let mut state = self.inner.state.lock();
        if state.attached.remove(&seg.0).is_some() {
            state.ledger.detaches += 1;
        } else {
            state.ledger.bad_detaches += 1;
            tracing::warn!("detach names unknown segment descriptor {}", seg.0);
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
        let mut state = self.inner.state.lock();
        if state.deny_put {
            return Err(ShmError::Transfer("server refused the transfer".into()));
        }
        if !state.attached.contains_key(&seg.0) {
            return Err(ShmError::Transfer(format!(
                "transfer names unknown segment descriptor {}",
                seg.0
            )));
        }

        // Materialize the target lazily so callers that only check the
        // ledger need no setup.
        let xid = target.xid();
        state
            .targets
            .entry(xid)
            .or_insert_with(|| Framebuffer::new(size, format));

        let src_stride = format.stride(size.width);
        let bpp = format.bytes_per_pixel();

        let state = &mut *state;
        let Some(mapping) = state.attached.get(&seg.0) else {
            return Err(ShmError::Transfer("segment vanished mid-transfer".into()));
        };
        let Some(fb) = state.targets.get_mut(&xid) else {
            return Err(ShmError::Transfer("target vanished mid-transfer".into()));
        };

        // SAFETY: transfers only run between sync points; the client does
        // not write the region while the server reads it.
        let src = unsafe { mapping.bytes() };

        for rect in rects {
            let Some(rect) = rect.intersection(&size.bounds()) else {
                continue;
            };
            let Some(rect) = rect.intersection(&fb.size.bounds()) else {
                continue;
            };
            for row in 0..rect.height {
                let y = (rect.y + row) as usize;
                let src_off = y * src_stride + rect.x as usize * bpp;
                let dst_off = y * fb.stride + rect.x as usize * bpp;
                let n = rect.width as usize * bpp;
                if src_off + n <= src.len() && dst_off + n <= fb.data.len() {
                    fb.data[dst_off..dst_off + n].copy_from_slice(&src[src_off..src_off + n]);
                }
            }
            state.ledger.put_rects += 1;
        }
        state.ledger.puts += 1;
        Ok(())
    }

    fn sync(&self) -> Result<(), ShmError> {
        self.inner.state.lock().ledger.syncs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_detach_balances_the_ledger() {
        let link = MemLink::new();
        let segment = ShmSegment::create(4096).unwrap();

        let seg = link.attach(&segment, true).unwrap();
        assert_eq!(link.live_attachments(), 1);

        link.detach(seg);
        let ledger = link.ledger();
        assert_eq!(ledger.attaches, 1);
        assert_eq!(ledger.detaches, 1);
        assert!(ledger.balanced());
    }

    #[test]
    fn unknown_detach_is_recorded_as_a_bug() {
        let link = MemLink::new();
        link.detach(Seg(99));
        let ledger = link.ledger();
        assert_eq!(ledger.bad_detaches, 1);
        assert!(!ledger.balanced());
    }

    #[test]
    fn probe_result_is_cached() {
        let link = MemLink::new();
        assert!(link.use_shm());
        link.set_shm_enabled(false);
        // Cached from the first probe; stability is part of the contract.
        assert!(link.use_shm());
    }

    #[test]
    fn server_reads_through_its_own_mapping() {
        let link = MemLink::new();
        let segment = ShmSegment::create(4096).unwrap();
        unsafe {
            segment.as_ptr().write(0xc3);
        }

        let seg = link.attach(&segment, true).unwrap();
        let state = link.inner.state.lock();
        let mapping = state.attached.get(&seg.0).unwrap();
        assert_eq!(unsafe { mapping.bytes() }[0], 0xc3);
    }
}
