//! Kernel shared-memory segments: allocation, local mapping, guaranteed
//! release.

use std::io;
use std::ptr::{self, NonNull};

use crate::ShmError;

/// A SysV shared-memory segment mapped into this process.
///
/// The segment is owned exclusively. Dropping it detaches the local mapping
/// and releases the kernel object; if [`mark_removed`](Self::mark_removed)
/// already ran, the kernel reclaims the segment as soon as the last attach
/// (ours or the display server's) disappears.
pub struct ShmSegment {
    shmid: libc::c_int,
    addr: NonNull<u8>,
    len: usize,
    removed: bool,
}

// SAFETY: the mapping stays valid for the lifetime of the value and is only
// dereferenced through callers that uphold the image's synchronization
// contract.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Allocate and map a segment of at least `byte_size` bytes, rounded up
    /// to the page size.
    ///
    /// On failure nothing is left allocated. Failure here is a recoverable
    /// condition telling the caller to fall back, not to abort.
    pub fn create(byte_size: usize) -> Result<Self, ShmError> {
        if byte_size == 0 {
            return Err(ShmError::Allocation(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-sized segment",
            )));
        }
        let page = page_size();
        let Some(len) = byte_size.div_ceil(page).checked_mul(page) else {
            return Err(ShmError::Allocation(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment size overflows",
            )));
        };

        let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600) };
        if shmid == -1 {
            return Err(ShmError::Allocation(io::Error::last_os_error()));
        }

        let addr = unsafe { libc::shmat(shmid, ptr::null(), 0) };
        if addr as isize == -1 {
            let err = io::Error::last_os_error();
            // The id must not outlive a failed mapping.
            unsafe {
                libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut());
            }
            return Err(ShmError::Allocation(err));
        }
        let Some(addr) = NonNull::new(addr as *mut u8) else {
            unsafe {
                libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut());
            }
            return Err(ShmError::Allocation(io::Error::other("shmat returned a null mapping")));
        };

        Ok(Self {
            shmid,
            addr,
            len,
            removed: false,
        })
    }

    /// Kernel identifier the display server attaches by.
    pub fn id(&self) -> libc::c_int {
        self.shmid
    }

    /// Mapped length in bytes (page-rounded).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base of the local mapping. Valid until the segment is dropped.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Mark the segment for kernel reclamation once every attach is gone.
    ///
    /// Called after the server acknowledges its attach, so the segment
    /// cannot outlive a crashed client.
    pub fn mark_removed(&mut self) {
        if !self.removed {
            unsafe {
                libc::shmctl(self.shmid, libc::IPC_RMID, ptr::null_mut());
            }
            self.removed = true;
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // Detach the local mapping, then release the id. Runs at most once.
        unsafe {
            libc::shmdt(self.addr.as_ptr() as *const libc::c_void);
        }
        self.mark_removed();
    }
}

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 { page as usize } else { 4096 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_maps_writable_memory() {
        let seg = ShmSegment::create(10).unwrap();
        assert!(seg.len() >= 10);
        assert_eq!(seg.len() % page_size(), 0);
        unsafe {
            seg.as_ptr().write(0xab);
            assert_eq!(seg.as_ptr().read(), 0xab);
        }
    }

    #[test]
    fn failed_allocation_holds_nothing() {
        assert!(ShmSegment::create(0).is_err());
        assert!(ShmSegment::create(usize::MAX / 2).is_err());
    }

    #[test]
    fn drop_releases_the_id() {
        let seg = ShmSegment::create(4096).unwrap();
        let id = seg.id();
        drop(seg);

        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) };
        assert_eq!(rc, -1);
    }

    #[test]
    fn mark_removed_keeps_the_mapping_usable() {
        let mut seg = ShmSegment::create(4096).unwrap();
        seg.mark_removed();
        unsafe {
            seg.as_ptr().write(0x5a);
            assert_eq!(seg.as_ptr().read(), 0x5a);
        }
    }
}
