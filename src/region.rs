//! The memory region both parties map: a fixed set of rings laid out back to
//! back.

use std::marker::PhantomData;
use std::ops::Deref;
use std::{io, mem};

use crate::ring::{RingBuffer, DUPLEX_RING_SIZE, RING_SIZE};
use crate::util::mmap::Mapping;

/// A `#[repr(C)]` aggregate of rings that can live in a [`RegionMap`].
///
/// # Safety
///
/// Implementors must consist only of [`RingBuffer`]s (or other types for
/// which all-zero bytes are valid) and have an alignment of at most a page.
pub unsafe trait RingSet: Sized {
    /// Reset every ring to its initial, empty and armed state.
    fn init(&self);
}

/// The four-ring region.
///
/// - `rx_avail`: guest → host, empty receive buffers.
/// - `rx`: host → guest, filled receive buffers.
/// - `tx`: guest → host, frames to send.
/// - `tx_used`: host → guest, sent buffers to recycle.
#[repr(C)]
pub struct SharedRegion<const N: usize = RING_SIZE> {
    pub rx_avail: RingBuffer<N>,
    pub rx: RingBuffer<N>,
    pub tx: RingBuffer<N>,
    pub tx_used: RingBuffer<N>,
}

// SAFETY: four rings, nothing else.
unsafe impl<const N: usize> RingSet for SharedRegion<N> {
    fn init(&self) {
        self.rx_avail.reset();
        self.rx.reset();
        self.tx.reset();
        self.tx_used.reset();
    }
}

/// The two-ring region of the tri-state variant.
#[repr(C)]
pub struct DuplexRegion<const N: usize = DUPLEX_RING_SIZE> {
    pub tx: RingBuffer<N>,
    pub rx: RingBuffer<N>,
}

// SAFETY: two rings, nothing else.
unsafe impl<const N: usize> RingSet for DuplexRegion<N> {
    fn init(&self) {
        self.tx.reset();
        self.rx.reset();
    }
}

/// Owner of the memory a [`RingSet`] lives in.
pub struct RegionMap<R: RingSet> {
    map: Mapping,
    _marker: PhantomData<R>,
}

// SAFETY: the region only contains atomics.
unsafe impl<R: RingSet> Send for RegionMap<R> {}
unsafe impl<R: RingSet> Sync for RegionMap<R> {}

impl<R: RingSet> RegionMap<R> {
    fn from_mapping(map: Mapping) -> Self {
        debug_assert!(map.len() >= mem::size_of::<R>());
        debug_assert_eq!(map.as_ptr() as usize % mem::align_of::<R>(), 0);
        Self {
            map,
            _marker: PhantomData,
        }
    }

    /// A private, freshly initialized region, for parties in one process.
    pub fn anonymous() -> io::Result<Self> {
        let this = Self::from_mapping(Mapping::anonymous(mem::size_of::<R>())?);
        this.init();
        Ok(this)
    }

    /// Create a named shared region and initialize it.
    pub fn create_shared(name: &str) -> io::Result<Self> {
        let this = Self::from_mapping(Mapping::shared(name, mem::size_of::<R>())?);
        this.init();
        log::debug!(
            "region {}: created, {} bytes",
            name,
            mem::size_of::<R>()
        );
        Ok(this)
    }

    /// Attach to a named shared region created by the other party.
    pub fn open_shared(name: &str) -> io::Result<Self> {
        Ok(Self::from_mapping(Mapping::shared(
            name,
            mem::size_of::<R>(),
        )?))
    }
}

impl<R: RingSet> Deref for RegionMap<R> {
    type Target = R;

    fn deref(&self) -> &R {
        // SAFETY: the mapping is large enough, suitably aligned, and was
        // zero-filled or initialized before first use; `R` is valid for any
        // zeroed or previously initialized bytes.
        unsafe { &*(self.map.as_ptr() as *const R) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::flag::{Consumer, Producer};
    use crate::ring::Desc;

    #[test]
    fn region_layout() {
        assert_eq!(mem::size_of::<SharedRegion<8>>(), 4 * (24 * 8 + 8));
        assert_eq!(mem::size_of::<DuplexRegion<8>>(), 2 * (24 * 8 + 8));
        assert_eq!(
            mem::size_of::<SharedRegion>(),
            4 * mem::size_of::<RingBuffer<RING_SIZE>>()
        );
    }

    #[test]
    fn rings_are_independent() {
        let region = RegionMap::<SharedRegion<8>>::anonymous().unwrap();
        let mut p = Producer::new();
        let mut c = Consumer::new();
        p.produce(&region.tx, Desc::new(1, 2, 3)).unwrap();
        assert_eq!(c.consume(&region.rx), None);
        let mut c = Consumer::new();
        assert_eq!(c.consume(&region.tx), Some(Desc::new(1, 2, 3)));
    }

    #[test]
    fn shared_region_is_visible_through_second_mapping() {
        let name = format!("/shmnic-test-{}", std::process::id());
        let a = RegionMap::<SharedRegion<8>>::create_shared(&name).unwrap();
        let b = RegionMap::<SharedRegion<8>>::open_shared(&name).unwrap();
        Mapping::unlink_shared(&name).unwrap();

        let mut p = Producer::new();
        let mut c = Consumer::new();
        p.produce(&a.rx, Desc::new(5, 6, 7)).unwrap();
        assert_eq!(c.consume(&b.rx), Some(Desc::new(5, 6, 7)));
    }
}
