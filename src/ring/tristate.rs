//! Three-state (`Available`/`InFlight`/`Complete`) slot protocol.
//!
//! The guest [`Submitter`] fills free slots and marks them `Available`. The
//! host [`Processor`] takes them (`InFlight`), runs the fabric operation, and
//! completes them in order (`Complete`). The guest then reclaims completed
//! slots, reading back the size the host may have updated.
//!
//! The notify word points the other way on each ring. On the TX ring the host
//! arms it to ask for a doorbell ([`Processor::park`] /
//! [`Submitter::doorbell_due`]). On the RX ring the guest arms it to say it is
//! interruptible ([`Submitter::park`] / [`Processor::interrupt_due`]).

use super::flag::RingFull;
use super::{Desc, RingBuffer, SlotState};
use crate::error::{Error, Result};
use crate::util::likely::*;

/// Guest-side cursors of a three-state ring.
#[derive(Debug, Default)]
pub struct Submitter {
    next_submit: usize,
    next_reclaim: usize,
    outstanding: usize,
}

impl Submitter {
    pub const fn new() -> Self {
        Self {
            next_submit: 0,
            next_reclaim: 0,
            outstanding: 0,
        }
    }

    /// Number of submitted slots not yet reclaimed.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Hand `desc` to the host.
    pub fn submit<const N: usize>(
        &mut self,
        ring: &RingBuffer<N>,
        desc: Desc,
    ) -> std::result::Result<(), RingFull> {
        if unlikely(self.outstanding == N) {
            return Err(RingFull);
        }
        let e = ring.entry(self.next_submit);
        if unlikely(e.state() != SlotState::Complete as u32) {
            return Err(RingFull);
        }
        e.store_desc(&desc);
        e.publish(SlotState::Available as u32);
        self.next_submit = (self.next_submit + 1) % N;
        self.outstanding += 1;
        Ok(())
    }

    /// After submitting, whether the host asked for a doorbell. `true` at
    /// most once per arming.
    #[inline]
    pub fn doorbell_due<const N: usize>(&self, ring: &RingBuffer<N>) -> bool {
        ring.take_notify()
    }

    /// Whether the oldest outstanding slot has been completed.
    #[inline]
    pub fn is_reclaimable<const N: usize>(&self, ring: &RingBuffer<N>) -> bool {
        self.outstanding > 0 && ring.entry(self.next_reclaim).state() == SlotState::Complete as u32
    }

    /// Become interruptible. Returns `false` if a completion raced in; the
    /// word is then cleared again and the guest should keep reclaiming.
    pub fn park<const N: usize>(&self, ring: &RingBuffer<N>) -> bool {
        ring.arm_notify();
        if self.is_reclaimable(ring) {
            ring.disarm_notify();
            false
        } else {
            true
        }
    }

    /// Take back the oldest submitted slot once the host completed it.
    pub fn reclaim<const N: usize>(&mut self, ring: &RingBuffer<N>) -> Option<Desc> {
        if self.outstanding == 0 {
            return None;
        }
        let e = ring.entry(self.next_reclaim);
        if e.state() != SlotState::Complete as u32 {
            return None;
        }
        let desc = e.load_desc();
        self.next_reclaim = (self.next_reclaim + 1) % N;
        self.outstanding -= 1;
        Some(desc)
    }
}

/// Host-side cursors of a three-state ring.
#[derive(Debug, Default)]
pub struct Processor {
    next_take: usize,
    next_complete: usize,
    inflight: usize,
}

impl Processor {
    pub const fn new() -> Self {
        Self {
            next_take: 0,
            next_complete: 0,
            inflight: 0,
        }
    }

    #[inline]
    pub fn inflight(&self) -> usize {
        self.inflight
    }

    /// Whether the next slot is `Available`.
    #[inline]
    pub fn is_ready<const N: usize>(&self, ring: &RingBuffer<N>) -> bool {
        ring.entry(self.next_take).state() == SlotState::Available as u32
    }

    /// Ask for a doorbell on the next submission. Returns `false` if a slot
    /// raced in; the word is then cleared again and the host should keep
    /// taking.
    pub fn park<const N: usize>(&self, ring: &RingBuffer<N>) -> bool {
        ring.arm_notify();
        if self.is_ready(ring) {
            ring.disarm_notify();
            false
        } else {
            true
        }
    }

    /// After completing, whether the guest is interruptible and must be
    /// interrupted. `true` at most once per arming.
    #[inline]
    pub fn interrupt_due<const N: usize>(&self, ring: &RingBuffer<N>) -> bool {
        ring.take_notify()
    }

    /// Take the next `Available` slot, marking it `InFlight`.
    #[inline]
    pub fn take<const N: usize>(&mut self, ring: &RingBuffer<N>) -> Option<Desc> {
        let e = ring.entry(self.next_take);
        if e.state() != SlotState::Available as u32 {
            return None;
        }
        let desc = e.load_desc();
        e.publish(SlotState::InFlight as u32);
        self.next_take = (self.next_take + 1) % N;
        self.inflight += 1;
        Some(desc)
    }

    /// Complete the oldest in-flight slot, optionally overwriting its size.
    ///
    /// Fails if the slot is not `InFlight`; the ring is then corrupt and the
    /// caller should quarantine the connection that owns it.
    pub fn complete<const N: usize>(
        &mut self,
        ring: &RingBuffer<N>,
        size: Option<u32>,
    ) -> Result<Desc> {
        let e = ring.entry(self.next_complete);
        let found = e.state();
        if unlikely(self.inflight == 0 || found != SlotState::InFlight as u32) {
            return Err(Error::Protocol {
                index: self.next_complete,
                expected: SlotState::InFlight,
                found,
            });
        }
        if let Some(size) = size {
            e.size.store(size, std::sync::atomic::Ordering::Relaxed);
        }
        let desc = e.load_desc();
        e.publish(SlotState::Complete as u32);
        self.next_complete = (self.next_complete + 1) % N;
        self.inflight -= 1;
        Ok(desc)
    }

    /// Complete every in-flight slot with zero size, e.g. when the fabric
    /// side went away. Returns how many were released.
    pub fn release_all<const N: usize>(&mut self, ring: &RingBuffer<N>) -> usize {
        let mut n = 0;
        while self.inflight > 0 {
            if self.complete(ring, Some(0)).is_err() {
                break;
            }
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let ring = RingBuffer::<4>::boxed();
        let mut guest = Submitter::new();
        let mut host = Processor::new();

        assert_eq!(guest.submit(&ring, Desc::new(7, 0x1000, 1500)), Ok(()));
        assert!(guest.doorbell_due(&ring));
        assert!(!guest.doorbell_due(&ring));
        assert_eq!(guest.reclaim(&ring), None);

        let d = host.take(&ring).unwrap();
        assert_eq!(d.handle, 7);
        assert_eq!(host.take(&ring), None);
        assert_eq!(guest.reclaim(&ring), None);

        let done = host.complete(&ring, Some(60)).unwrap();
        assert_eq!(done.size, 60);
        assert_eq!(guest.reclaim(&ring), Some(Desc::new(7, 0x1000, 60)));
        assert_eq!(guest.outstanding(), 0);
    }

    #[test]
    fn full_until_reclaimed() {
        let ring = RingBuffer::<2>::boxed();
        let mut guest = Submitter::new();
        let mut host = Processor::new();

        guest.submit(&ring, Desc::new(0, 0, 1)).unwrap();
        guest.submit(&ring, Desc::new(1, 0, 1)).unwrap();
        assert_eq!(guest.submit(&ring, Desc::new(2, 0, 1)), Err(RingFull));

        host.take(&ring).unwrap();
        host.complete(&ring, None).unwrap();
        // Completed but not reclaimed: still no room.
        assert_eq!(guest.submit(&ring, Desc::new(2, 0, 1)), Err(RingFull));
        assert_eq!(guest.reclaim(&ring).map(|d| d.handle), Some(0));
        assert!(guest.submit(&ring, Desc::new(2, 0, 1)).is_ok());
    }

    #[test]
    fn complete_without_take_is_violation() {
        let ring = RingBuffer::<4>::boxed();
        let mut host = Processor::new();
        let err = host.complete(&ring, None).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                index: 0,
                expected: SlotState::InFlight,
                found: 0
            }
        ));
    }

    #[test]
    fn interruptible_handshake() {
        let ring = RingBuffer::<4>::boxed();
        let mut guest = Submitter::new();
        let mut host = Processor::new();
        // Freshly reset rings start armed; the guest consumes that arming.
        guest.submit(&ring, Desc::new(0, 0, 64)).unwrap();
        assert!(guest.doorbell_due(&ring));

        host.take(&ring).unwrap();
        host.complete(&ring, Some(10)).unwrap();
        assert!(!host.interrupt_due(&ring));

        // A completion is pending, so parking fails.
        assert!(!guest.park(&ring));
        assert_eq!(guest.reclaim(&ring).map(|d| d.size), Some(10));
        assert!(guest.park(&ring));

        guest.submit(&ring, Desc::new(1, 0, 64)).unwrap();
        host.take(&ring).unwrap();
        host.complete(&ring, None).unwrap();
        assert!(host.interrupt_due(&ring));
        assert!(!host.interrupt_due(&ring));
    }

    #[test]
    fn host_parks_only_when_dry() {
        let ring = RingBuffer::<4>::boxed();
        let mut guest = Submitter::new();
        let mut host = Processor::new();
        ring.disarm_notify();

        guest.submit(&ring, Desc::new(0, 0, 64)).unwrap();
        assert!(!host.park(&ring));
        assert!(!guest.doorbell_due(&ring));

        host.take(&ring).unwrap();
        assert!(host.park(&ring));
        guest.submit(&ring, Desc::new(1, 0, 64)).unwrap();
        assert!(guest.doorbell_due(&ring));
    }

    #[test]
    fn release_all_completes_inflight() {
        let ring = RingBuffer::<4>::boxed();
        let mut guest = Submitter::new();
        let mut host = Processor::new();
        for i in 0..3 {
            guest.submit(&ring, Desc::new(i, 0, 100)).unwrap();
            host.take(&ring).unwrap();
        }
        assert_eq!(host.release_all(&ring), 3);
        for i in 0..3 {
            assert_eq!(guest.reclaim(&ring), Some(Desc::new(i, 0, 0)));
        }
    }
}
