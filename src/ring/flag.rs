//! Two-state (`Empty`/`Full`) slot protocol.

use thiserror::Error;

use super::{Desc, FlagState, RingBuffer};
use crate::util::likely::*;

/// The target slot still holds an unconsumed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ring full")]
pub struct RingFull;

/// Producer-side cursor of a two-state ring.
#[derive(Debug, Default)]
pub struct Producer {
    next: usize,
}

impl Producer {
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Index of the slot the next [`produce`](Self::produce) will fill.
    #[inline]
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Publish `desc` in the next slot.
    ///
    /// Returns `Ok(true)` if the consumer had parked and must now be
    /// notified, `Ok(false)` if no notification is needed. Fails without
    /// touching the ring if the slot is still full.
    #[inline]
    pub fn produce<const N: usize>(
        &mut self,
        ring: &RingBuffer<N>,
        desc: Desc,
    ) -> Result<bool, RingFull> {
        let e = ring.entry(self.next);
        if unlikely(e.state() != FlagState::Empty as u32) {
            return Err(RingFull);
        }
        e.store_desc(&desc);
        e.publish(FlagState::Full as u32);
        self.next = (self.next + 1) % N;
        Ok(ring.take_notify())
    }
}

/// Consumer-side cursor of a two-state ring.
#[derive(Debug, Default)]
pub struct Consumer {
    next: usize,
}

impl Consumer {
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    #[inline]
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Whether the next slot holds an entry.
    #[inline]
    pub fn is_ready<const N: usize>(&self, ring: &RingBuffer<N>) -> bool {
        ring.entry(self.next).state() == FlagState::Full as u32
    }

    /// Take the next entry, handing its slot back to the producer.
    #[inline]
    pub fn consume<const N: usize>(&mut self, ring: &RingBuffer<N>) -> Option<Desc> {
        let e = ring.entry(self.next);
        if e.state() != FlagState::Full as u32 {
            return None;
        }
        let desc = e.load_desc();
        e.clear_desc();
        e.publish(FlagState::Empty as u32);
        self.next = (self.next + 1) % N;
        Some(desc)
    }

    /// Request a notification for the next publish.
    ///
    /// Returns `false` if an entry raced in while parking; the notify word is
    /// then disarmed again and the caller should keep draining.
    pub fn park<const N: usize>(&self, ring: &RingBuffer<N>) -> bool {
        ring.arm_notify();
        if self.is_ready(ring) {
            ring.disarm_notify();
            false
        } else {
            true
        }
    }

    /// Consume up to `budget` entries, then park if the ring ran dry.
    /// Returns the number of entries handed to `f`.
    pub fn drain<const N: usize>(
        &mut self,
        ring: &RingBuffer<N>,
        budget: usize,
        mut f: impl FnMut(Desc),
    ) -> usize {
        let mut n = 0;
        loop {
            while n < budget {
                match self.consume(ring) {
                    Some(desc) => {
                        f(desc);
                        n += 1;
                    }
                    None => break,
                }
            }
            if n >= budget || self.park(ring) {
                return n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(i: u64) -> Desc {
        Desc::new(i, 1000 + i * 64, 64)
    }

    #[test]
    fn full_ring_rejects_without_corruption() {
        let ring = RingBuffer::<8>::boxed();
        let mut p = Producer::new();
        let mut c = Consumer::new();

        for i in 0..8 {
            assert!(p.produce(&ring, desc(i)).is_ok());
        }
        assert_eq!(p.produce(&ring, desc(99)), Err(RingFull));
        assert_eq!(p.next_index(), 0);

        for i in 0..8 {
            assert_eq!(c.consume(&ring), Some(desc(i)));
        }
        assert_eq!(c.consume(&ring), None);
        assert_eq!(c.next_index(), 0);
    }

    #[test]
    fn empty_ring_does_not_advance() {
        let ring = RingBuffer::<4>::boxed();
        let mut c = Consumer::new();
        assert_eq!(c.consume(&ring), None);
        assert_eq!(c.consume(&ring), None);
        assert_eq!(c.next_index(), 0);
    }

    #[test]
    fn notifies_only_on_empty_to_nonempty() {
        let ring = RingBuffer::<8>::boxed();
        let mut p = Producer::new();
        let mut c = Consumer::new();

        // Fresh rings start parked.
        assert_eq!(p.produce(&ring, desc(0)), Ok(true));
        assert_eq!(p.produce(&ring, desc(1)), Ok(false));
        assert_eq!(p.produce(&ring, desc(2)), Ok(false));

        let mut got = Vec::new();
        assert_eq!(c.drain(&ring, usize::MAX, |d| got.push(d.handle)), 3);
        assert_eq!(got, vec![0, 1, 2]);

        // Drained and parked: the next publish rings once.
        assert_eq!(p.produce(&ring, desc(3)), Ok(true));
        assert_eq!(p.produce(&ring, desc(4)), Ok(false));
    }

    #[test]
    fn park_fails_when_entry_pending() {
        let ring = RingBuffer::<4>::boxed();
        let mut p = Producer::new();
        let c = Consumer::new();
        ring.disarm_notify();
        assert_eq!(p.produce(&ring, desc(0)), Ok(false));
        assert!(!c.park(&ring));
        assert!(!ring.is_notify_armed());
    }

    #[test]
    fn drain_respects_budget() {
        let ring = RingBuffer::<8>::boxed();
        let mut p = Producer::new();
        let mut c = Consumer::new();
        for i in 0..6 {
            p.produce(&ring, desc(i)).unwrap();
        }
        assert_eq!(c.drain(&ring, 4, |_| ()), 4);
        assert!(c.is_ready(&ring));
        assert_eq!(c.drain(&ring, 4, |_| ()), 2);
        assert!(ring.is_notify_armed());
    }
}
