use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::{io, ptr};

use libc::*;

use super::likely::*;

const HUGE_PAGE_SIZE: usize = 1 << 21;
const PAGE_SIZE: usize = 1 << 12;

/// Round `len` up to a multiple of `align`, which must be a power of two.
#[inline(always)]
pub(crate) const fn round_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

/// A page-aligned memory mapping that is unmapped on drop.
///
/// Private mappings back the buffer arena and test regions; shared mappings
/// back regions that another process maps as well.
pub struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is plain memory; synchronization is up to the users of
// the structures placed inside it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: FFI; `ptr` and `len` came from a successful `mmap`.
        let ret = unsafe { munmap(self.ptr as *mut c_void, self.len) };
        if ret != 0 {
            log::warn!(
                "munmap of {} bytes failed: {}",
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}

#[inline]
fn map(len: usize, flags: c_int, fd: c_int) -> *mut u8 {
    // SAFETY: FFI.
    let ret = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if ret != MAP_FAILED {
        ret as *mut u8
    } else {
        ptr::null_mut()
    }
}

impl Mapping {
    /// Map `len` bytes of zeroed private memory, preferring huge pages.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let huge_len = round_up(len.max(1), HUGE_PAGE_SIZE);
        let ptr = map(huge_len, MAP_PRIVATE | MAP_ANONYMOUS | MAP_HUGETLB, -1);
        if !ptr.is_null() {
            return Ok(Self { ptr, len: huge_len });
        }

        log::debug!(
            "failed to mmap {}KB hugepages, falling back to normal pages",
            huge_len >> 10
        );

        let len = round_up(len.max(1), PAGE_SIZE);
        let ptr = map(len, MAP_PRIVATE | MAP_ANONYMOUS, -1);
        if likely(!ptr.is_null()) {
            Ok(Self { ptr, len })
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Create (or open) a named POSIX shared-memory object of at least `len`
    /// bytes and map it shared.
    ///
    /// Newly created objects are zero-filled by the kernel.
    pub fn shared(name: &str, len: usize) -> io::Result<Self> {
        let cname =
            CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let len = round_up(len.max(1), PAGE_SIZE);

        // SAFETY: FFI with a valid C string.
        let raw = unsafe { shm_open(cname.as_ptr(), O_RDWR | O_CREAT, 0o600) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a fresh, owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: FFI on an owned descriptor.
        if unsafe { ftruncate(fd.as_raw_fd(), len as off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let ptr = map(len, MAP_SHARED, fd.as_raw_fd());
        if ptr.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    /// Remove a named shared-memory object. Existing mappings stay valid.
    pub fn unlink_shared(name: &str) -> io::Result<()> {
        let cname =
            CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: FFI with a valid C string.
        if unsafe { shm_unlink(cname.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Start address of the mapping.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Length of the mapping in bytes. Always page-aligned.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }
}
