//! Lock-free buffer-ownership rings shared between a guest and the host.
//!
//! A ring is a fixed array of 24-byte slots followed by one notify word. The
//! two parties never share a lock; ownership of a slot moves purely through
//! its state flag, stored with release ordering after the payload and loaded
//! with acquire ordering before the payload is read.
//!
//! Two slot protocols run over the same layout:
//!
//! - [`flag`]: two-state slots (`Empty`/`Full`), used by the four-ring
//!   [`SharedRegion`](crate::region::SharedRegion).
//! - [`tristate`]: three-state slots (`Available`/`InFlight`/`Complete`),
//!   used by the two-ring [`DuplexRegion`](crate::region::DuplexRegion),
//!   where availability is folded into the ring itself.
//!
//! Cursors are not part of the shared layout. Each side keeps its own index
//! in the handle it owns, so several rings can be driven independently.

pub mod flag;
pub mod tristate;

use std::alloc::{self, Layout};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

/// Capacity of the four-ring variant's rings.
pub const RING_SIZE: usize = 1024;

/// Capacity of the two-ring variant's rings.
pub const DUPLEX_RING_SIZE: usize = 12800;

/// States of a two-state slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FlagState {
    /// The producer may fill the slot.
    Empty = 0,

    /// The consumer may take the slot.
    Full = 1,
}

/// States of a three-state slot.
///
/// `Complete` is zero so a zeroed ring is entirely free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    /// Free, or done and waiting to be reclaimed by the guest.
    Complete = 0,

    /// Taken by the host, operation outstanding.
    InFlight = 1,

    /// Filled by the guest, waiting for the host.
    Available = 2,
}

/// A buffer descriptor: the payload of one ring slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Desc {
    /// Opaque owner-side handle, an arena index. Never dereferenced by the peer.
    pub handle: u64,

    /// Offset of the buffer inside guest memory.
    pub data_ptr: u64,

    /// Payload length in bytes.
    pub size: u32,
}

impl Desc {
    #[inline]
    pub const fn new(handle: u64, data_ptr: u64, size: u32) -> Self {
        Self {
            handle,
            data_ptr,
            size,
        }
    }
}

/// One ring slot.
///
/// # Layout
///
/// | Offset | Size |   Name    |
/// | -----: | ---: | --------- |
/// |      0 |    8 | handle    |
/// |      8 |    8 | data_ptr  |
/// |     16 |    4 | size      |
/// |     20 |    4 | flag      |
#[repr(C)]
pub struct RingEntry {
    handle: AtomicU64,
    data_ptr: AtomicU64,
    size: AtomicU32,
    flag: AtomicU32,
}

impl RingEntry {
    /// Read the payload. Must follow an acquire load of the flag.
    #[inline(always)]
    fn load_desc(&self) -> Desc {
        Desc {
            handle: self.handle.load(Ordering::Relaxed),
            data_ptr: self.data_ptr.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
        }
    }

    /// Write the payload. Must precede a release store of the flag.
    #[inline(always)]
    fn store_desc(&self, desc: &Desc) {
        self.handle.store(desc.handle, Ordering::Relaxed);
        self.data_ptr.store(desc.data_ptr, Ordering::Relaxed);
        self.size.store(desc.size, Ordering::Relaxed);
    }

    #[inline(always)]
    fn clear_desc(&self) {
        self.store_desc(&Desc::default());
    }

    #[inline(always)]
    fn state(&self) -> u32 {
        self.flag.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn publish(&self, state: u32) {
        self.flag.store(state, Ordering::Release);
    }
}

/// The shared part of one ring: `N` slots and a trailing notify word.
///
/// The notify word is `1` while the consumer wants a doorbell on the next
/// publish. A producer that observes it clears it and rings exactly once.
#[repr(C)]
pub struct RingBuffer<const N: usize> {
    entries: [RingEntry; N],
    notify: AtomicU32,
}

impl<const N: usize> RingBuffer<N> {
    pub const CAPACITY: usize = N;

    /// Allocate a zeroed, reset ring on the heap.
    pub fn boxed() -> Box<Self> {
        let layout = Layout::new::<Self>();
        // SAFETY: `Self` only holds atomics, for which all-zero bytes are a
        // valid value; the allocation has `Self`'s layout.
        let ring = unsafe {
            let ptr = alloc::alloc_zeroed(layout) as *mut Self;
            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        };
        ring.reset();
        ring
    }

    /// Empty every slot and arm the notify word.
    ///
    /// Only valid while neither party is using the ring.
    pub fn reset(&self) {
        for e in &self.entries {
            e.clear_desc();
            e.flag.store(0, Ordering::Relaxed);
        }
        self.notify.store(1, Ordering::Release);
    }

    #[inline(always)]
    fn entry(&self, idx: usize) -> &RingEntry {
        &self.entries[idx]
    }

    /// Ask the producer for a doorbell on its next publish.
    #[inline]
    pub fn arm_notify(&self) {
        self.notify.store(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Stop doorbells; the consumer will poll.
    #[inline]
    pub fn disarm_notify(&self) {
        self.notify.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_notify_armed(&self) -> bool {
        self.notify.load(Ordering::Relaxed) == 1
    }

    /// Called by the producer after publishing. Returns `true` exactly once
    /// per arming.
    #[inline]
    fn take_notify(&self) -> bool {
        fence(Ordering::SeqCst);
        self.notify.load(Ordering::Relaxed) == 1 && self.notify.swap(0, Ordering::AcqRel) == 1
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn entry_layout() {
        assert_eq!(mem::size_of::<RingEntry>(), 24);
        assert_eq!(mem::align_of::<RingEntry>(), 8);
    }

    #[test]
    fn ring_layout() {
        assert_eq!(mem::size_of::<RingBuffer<8>>(), 24 * 8 + 8);
        assert_eq!(mem::size_of::<RingBuffer<RING_SIZE>>(), 24 * RING_SIZE + 8);
    }

    #[test]
    fn boxed_ring_is_reset() {
        let ring = RingBuffer::<4>::boxed();
        assert!(ring.is_notify_armed());
        for i in 0..4 {
            assert_eq!(ring.entry(i).state(), 0);
            assert_eq!(ring.entry(i).load_desc(), Desc::default());
        }
    }

    #[test]
    fn notify_fires_once_per_arming() {
        let ring = RingBuffer::<4>::boxed();
        assert!(ring.take_notify());
        assert!(!ring.take_notify());
        ring.arm_notify();
        assert!(ring.take_notify());
        ring.disarm_notify();
        assert!(!ring.take_notify());
    }
}
