//! Guest-side buffer arena.
//!
//! Ring entries never carry pointers. The guest names a buffer by its
//! [`BufHandle`] (an index into the arena) and tells the host where the bytes
//! are by offset into guest memory. The host only ever sees [`GuestMemory`],
//! which translates offsets into addresses it can register with the fabric.

use std::sync::Arc;
use std::{io, ptr};

use bitvec::prelude::*;

use crate::ring::Desc;
use crate::util::mmap::Mapping;

/// Index of a buffer inside a [`BufArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufHandle(u32);

impl BufHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The value stored in a ring entry's `handle` field.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0 as u64
    }
}

/// A view of guest memory as the host sees it.
#[derive(Clone)]
pub struct GuestMemory {
    mem: Arc<Mapping>,
}

impl GuestMemory {
    /// Host address of guest memory's first byte.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.mem.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    /// Host address of `[data_ptr, data_ptr + size)`, if it lies entirely
    /// inside guest memory.
    #[inline]
    pub fn addr_of(&self, data_ptr: u64, size: u32) -> Option<u64> {
        let end = data_ptr.checked_add(size as u64)?;
        if end > self.len() as u64 {
            return None;
        }
        Some(self.base() as u64 + data_ptr)
    }

    /// Copy `buf.len()` bytes starting at `data_ptr` out of guest memory.
    /// Returns `false`, copying nothing, if the range is out of bounds.
    pub fn read(&self, data_ptr: u64, buf: &mut [u8]) -> bool {
        let Some(addr) = self.addr_of(data_ptr, buf.len() as u32) else {
            return false;
        };
        // SAFETY: the range was checked to lie inside the mapping.
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        true
    }
}

/// Fixed pool of equally sized, page-backed buffers.
pub struct BufArena {
    mem: Arc<Mapping>,
    buf_size: usize,
    free: Vec<u32>,
    allocated: BitVec,
}

impl BufArena {
    /// Allocate `count` buffers of `buf_size` bytes each.
    pub fn new(count: usize, buf_size: usize) -> io::Result<Self> {
        assert!(count > 0 && count <= u32::MAX as usize, "bad buffer count");
        assert!(buf_size > 0, "buffer size must be positive");
        let mem = Mapping::anonymous(count * buf_size)?;
        Ok(Self {
            mem: Arc::new(mem),
            buf_size,
            free: (0..count as u32).rev().collect(),
            allocated: bitvec![0; count],
        })
    }

    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.allocated.len()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// The host's view of this arena.
    pub fn guest_memory(&self) -> GuestMemory {
        GuestMemory {
            mem: self.mem.clone(),
        }
    }

    pub fn alloc(&mut self) -> Option<BufHandle> {
        let idx = self.free.pop()?;
        self.allocated.set(idx as usize, true);
        Some(BufHandle(idx))
    }

    /// Return a buffer to the pool. Returns `false` (and does nothing) for
    /// handles that are out of range or not currently allocated.
    pub fn free(&mut self, handle: BufHandle) -> bool {
        let idx = handle.index();
        if idx >= self.capacity() || !self.allocated[idx] {
            log::warn!("arena: ignoring free of unallocated buffer {}", idx);
            return false;
        }
        self.allocated.set(idx, false);
        self.free.push(handle.0);
        true
    }

    /// Recover the handle named by a ring entry.
    pub fn handle_of(&self, desc: &Desc) -> Option<BufHandle> {
        let idx = usize::try_from(desc.handle).ok()?;
        (idx < self.capacity() && self.allocated[idx]).then_some(BufHandle(idx as u32))
    }

    #[inline]
    pub fn offset(&self, handle: BufHandle) -> u64 {
        (handle.index() * self.buf_size) as u64
    }

    /// A descriptor naming `handle` with `size` bytes of payload.
    #[inline]
    pub fn desc(&self, handle: BufHandle, size: u32) -> Desc {
        Desc::new(handle.to_raw(), self.offset(handle), size)
    }

    /// Copy `data` to the start of the buffer. Returns the copied length,
    /// truncated to the buffer size.
    pub fn write(&mut self, handle: BufHandle, data: &[u8]) -> usize {
        let len = data.len().min(self.buf_size);
        // SAFETY: the buffer lies inside the mapping and `len` fits in it.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mem.as_ptr().add(self.offset(handle) as usize),
                len,
            )
        };
        len
    }

    /// Copy the first `len` bytes of the buffer out.
    pub fn read(&self, handle: BufHandle, len: usize) -> Vec<u8> {
        let len = len.min(self.buf_size);
        let mut out = vec![0u8; len];
        // SAFETY: the buffer lies inside the mapping and `len` fits in it.
        unsafe {
            ptr::copy_nonoverlapping(
                self.mem.as_ptr().add(self.offset(handle) as usize),
                out.as_mut_ptr(),
                len,
            )
        };
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_until_exhausted() {
        let mut arena = BufArena::new(4, 2048).unwrap();
        let hs: Vec<_> = (0..4).map(|_| arena.alloc().unwrap()).collect();
        assert_eq!(arena.alloc(), None);
        assert_eq!(hs[0].index(), 0);
        assert_eq!(arena.offset(hs[3]), 3 * 2048);

        assert!(arena.free(hs[2]));
        assert_eq!(arena.alloc(), Some(hs[2]));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut arena = BufArena::new(2, 64).unwrap();
        let h = arena.alloc().unwrap();
        assert!(arena.free(h));
        assert!(!arena.free(h));
        assert_eq!(arena.available(), 2);
    }

    #[test]
    fn handle_round_trips_through_desc() {
        let mut arena = BufArena::new(8, 256).unwrap();
        let _ = arena.alloc().unwrap();
        let h = arena.alloc().unwrap();
        let d = arena.desc(h, 100);
        assert_eq!(d.data_ptr, 256);
        assert_eq!(arena.handle_of(&d), Some(h));
        assert_eq!(arena.handle_of(&Desc::new(7, 0, 0)), None);
    }

    #[test]
    fn guest_memory_bounds() {
        let mut arena = BufArena::new(2, 4096).unwrap();
        let h = arena.alloc().unwrap();
        assert_eq!(arena.write(h, b"hello"), 5);
        assert_eq!(arena.read(h, 5), b"hello");

        let gm = arena.guest_memory();
        assert_eq!(gm.addr_of(0, 5), Some(gm.base() as u64));
        assert_eq!(gm.addr_of(gm.len() as u64, 1), None);
        assert_eq!(gm.addr_of(u64::MAX, 2), None);

        let mut out = [0u8; 5];
        assert!(gm.read(arena.offset(h), &mut out));
        assert_eq!(&out, b"hello");
        assert!(!gm.read(gm.len() as u64 - 2, &mut out));
    }
}
