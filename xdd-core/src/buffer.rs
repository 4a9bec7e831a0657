//! Page-aligned, optionally shared/locked I/O buffer pool (spec.md §4.3,
//! C3). A `Buffer` owns a contiguous byte range sized per the rules in
//! §4.3 and is freed (munlock/shmdt/free) on drop.

use crate::error::{Result, XddError};

/// The platform page size, consulted for buffer alignment and for the
/// worker's direct-I/O misalignment check (spec.md §4.6 step 4).
pub fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions and always
    // returns a positive value on the platforms this crate targets.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    debug_assert!(multiple > 0 && multiple.is_power_of_two());
    (value + multiple - 1) & !(multiple - 1)
}

/// Allocated size for a transfer of `xfer_size` bytes: rounded up to a
/// whole page (spec.md §4.3, §3 "Buffer").
pub fn allocation_size(xfer_size: usize) -> usize {
    round_up(xfer_size, page_size())
}

enum Backing {
    /// `posix_memalign`-allocated memory, freed with `libc::free`.
    Aligned { ptr: *mut u8, len: usize },
    /// System-V shared memory, attached with `shmat`, detached with
    /// `shmdt` (the segment itself is marked for removal immediately
    /// after attach so it does not leak across process crashes).
    #[cfg(target_os = "linux")]
    SysV { ptr: *mut u8, len: usize, shmid: i32 },
}

// SAFETY: the raw pointers here are exclusively owned by the `Buffer`
// that wraps this `Backing`; they are never aliased across threads
// without that `Buffer` being moved (not copied) between them.
unsafe impl Send for Backing {}

/// A page-aligned byte range owned by exactly one worker (or, while
/// registered with a transport, shared with it until `release`d back).
pub struct Buffer {
    backing: Backing,
    len: usize,
    locked: bool,
}

impl Buffer {
    pub fn as_ptr(&self) -> *const u8 {
        match &self.backing {
            Backing::Aligned { ptr, .. } => *ptr,
            #[cfg(target_os = "linux")]
            Backing::SysV { ptr, .. } => *ptr,
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match &mut self.backing {
            Backing::Aligned { ptr, .. } => *ptr,
            #[cfg(target_os = "linux")]
            Backing::SysV { ptr, .. } => *ptr,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` points to `len` initialized bytes for the
        // lifetime of `self` (zero-filled at allocation time).
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        // SAFETY: see `as_slice`; `self` is borrowed mutably so no other
        // reference to this range can exist concurrently.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Aligned { ptr, len } => {
                if self.locked {
                    // SAFETY: `ptr`/`len` describe the exact region we
                    // previously `mlock`ed.
                    unsafe {
                        libc::munlock(*ptr as *const libc::c_void, *len);
                    }
                }
                // SAFETY: `ptr` was allocated by `posix_memalign` and is
                // not used after this point.
                unsafe { libc::free(*ptr as *mut libc::c_void) };
            }
            #[cfg(target_os = "linux")]
            Backing::SysV { ptr, len, .. } => {
                if self.locked {
                    unsafe {
                        libc::munlock(*ptr as *const libc::c_void, *len);
                    }
                }
                // SAFETY: `ptr` was returned by a prior `shmat` and is
                // not used after this point.
                unsafe { libc::shmdt(*ptr as *const libc::c_void) };
            }
        }
    }
}

/// Allocates buffers for a target, selecting backing memory per the
/// priority order in spec.md §4.3: shared memory first (if requested and
/// supported), else a page-aligned allocation.
pub struct BufferPool {
    use_shared_memory: bool,
}

impl BufferPool {
    pub fn new(use_shared_memory: bool) -> Self {
        Self { use_shared_memory }
    }

    /// Allocate one buffer of `allocation_size(xfer_size)` bytes. Locks
    /// the memory in RAM when the platform allows it (best-effort:
    /// failure to lock is logged and does not fail the allocation, per
    /// spec.md §7 item 6).
    pub fn allocate(&self, xfer_size: usize) -> Result<Buffer> {
        let len = allocation_size(xfer_size);

        #[cfg(target_os = "linux")]
        if self.use_shared_memory {
            if let Some(buf) = self.try_allocate_shared(len) {
                return Ok(buf);
            }
            tracing::warn!("shared memory allocation failed, falling back to page-aligned alloc");
        }
        #[cfg(not(target_os = "linux"))]
        if self.use_shared_memory {
            tracing::warn!("shared memory requested but unsupported on this platform, falling back");
        }

        self.allocate_aligned(len)
    }

    fn allocate_aligned(&self, len: usize) -> Result<Buffer> {
        let page = page_size();
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: `ptr` is an out-param; `page` is a valid power-of-two
        // alignment and `len` is nonzero.
        let status = unsafe { libc::posix_memalign(&mut ptr, page, len) };
        if status != 0 || ptr.is_null() {
            return Err(XddError::ResourceExhausted(format!(
                "posix_memalign({page}, {len}) failed with status {status}"
            )));
        }
        // SAFETY: `ptr` is valid for `len` bytes, just allocated.
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, len) };
        let locked = unsafe { libc::mlock(ptr as *const libc::c_void, len) } == 0;
        if !locked {
            tracing::warn!(len, "mlock failed, buffer is not locked in RAM");
        }
        Ok(Buffer { backing: Backing::Aligned { ptr: ptr as *mut u8, len }, len, locked })
    }

    #[cfg(target_os = "linux")]
    fn try_allocate_shared(&self, len: usize) -> Option<Buffer> {
        // SAFETY: IPC_PRIVATE + IPC_CREAT asks the kernel for a fresh
        // segment; no preconditions beyond a valid size.
        let shmid = unsafe {
            libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600)
        };
        if shmid < 0 {
            return None;
        }
        // SAFETY: `shmid` was just created above.
        let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            // SAFETY: remove the segment we failed to attach to.
            unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
            return None;
        }
        // Mark the segment for removal now; it stays mapped in our
        // address space until `shmdt`, and the kernel reclaims it once
        // the last attachment (ours) is gone even if we crash.
        // SAFETY: `shmid` is valid.
        unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
        // SAFETY: `ptr` is valid for `len` bytes per `shmget`'s contract.
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, len) };
        let locked = unsafe { libc::mlock(ptr as *const libc::c_void, len) } == 0;
        if !locked {
            tracing::warn!(len, "mlock failed on shared buffer, buffer is not locked in RAM");
        }
        Some(Buffer { backing: Backing::SysV { ptr: ptr as *mut u8, len, shmid }, len, locked })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_page() {
        let page = page_size();
        assert_eq!(allocation_size(1), page);
        assert_eq!(allocation_size(page), page);
        assert_eq!(allocation_size(page + 1), 2 * page);
    }

    #[test]
    fn allocate_returns_zeroed_page_aligned_buffer() {
        let pool = BufferPool::new(false);
        let buf = pool.allocate(4096).expect("allocation should succeed");
        assert_eq!(buf.len(), allocation_size(4096));
        assert_eq!(buf.as_ptr() as usize % page_size(), 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn allocate_is_writable() {
        let pool = BufferPool::new(false);
        let mut buf = pool.allocate(512).expect("allocation should succeed");
        buf.as_mut_slice()[0] = 0xAB;
        assert_eq!(buf.as_slice()[0], 0xAB);
    }
}
