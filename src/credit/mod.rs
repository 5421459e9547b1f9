//! Slot credits: the bounded set of remote buffers a sender may write into.
//!
//! The receiver pre-registers its guest memory and grants the sender slots,
//! each naming one receive buffer by offset. Every RDMA write consumes one
//! slot on both sides. The receiver tops the sender up with `Assign` messages
//! whenever its own count of outstanding grants falls to half capacity, so
//! writes and replenishment overlap instead of stalling at zero.

mod msg;

use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;

pub use self::msg::{ControlMessage, MsgKind};
use crate::error::{Error, Result};
use crate::fabric::RemoteTarget;
use crate::ring::Desc;

/// Number of slots a connection can hold at once.
pub const SLOT_CAPACITY: usize = 8;

/// Decides when a receiver should grant more slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditPolicy {
    capacity: usize,
    threshold: usize,
}

impl CreditPolicy {
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            threshold: capacity / 2,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether going from `before` to `after` remaining slots crosses the
    /// low-water mark from above.
    #[inline]
    pub fn crossed(&self, before: usize, after: usize) -> bool {
        before > self.threshold && after <= self.threshold
    }

    /// Slots to grant once the mark is crossed.
    #[inline]
    pub fn grant_size(&self) -> usize {
        self.capacity - self.threshold
    }
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self::new(SLOT_CAPACITY)
    }
}

/// Why [`SlotCreditPool::try_reserve`] could not hand out a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NoCredit {
    #[error("no slot credits left")]
    Exhausted,

    #[error("peer has not published its memory region yet")]
    PeerNotReady,
}

struct PoolInner {
    slots: [u64; SLOT_CAPACITY],
    next: usize,
    next_fill: usize,
    remain: usize,
    peer: Option<RemoteTarget>,
}

/// Sender-side credits.
///
/// Shared between the thread issuing writes and the thread applying control
/// messages; all state sits behind one short-held lock.
pub struct SlotCreditPool {
    inner: Mutex<PoolInner>,
}

impl SlotCreditPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                slots: [0; SLOT_CAPACITY],
                next: 0,
                next_fill: 0,
                remain: 0,
                peer: None,
            }),
        }
    }

    /// Take one slot, returning where the next write must land.
    pub fn try_reserve(&self) -> std::result::Result<RemoteTarget, NoCredit> {
        let mut inner = self.inner.lock();
        let Some(peer) = inner.peer else {
            return Err(NoCredit::PeerNotReady);
        };
        if inner.remain == 0 {
            return Err(NoCredit::Exhausted);
        }
        let offset = inner.slots[inner.next];
        inner.next = (inner.next + 1) % SLOT_CAPACITY;
        inner.remain -= 1;
        Ok(RemoteTarget {
            addr: peer.addr + offset,
            rkey: peer.rkey,
        })
    }

    /// Add granted slots. Returns the new number of remaining slots.
    ///
    /// Fails, adding nothing, if the grant would exceed capacity: the peer
    /// then believes in more credits than this side can track.
    pub fn replenish(&self, slots: &[u64]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.remain + slots.len() > SLOT_CAPACITY {
            return Err(Error::ControlMsg("slot grant exceeds capacity"));
        }
        for &slot in slots {
            let i = inner.next_fill;
            inner.slots[i] = slot;
            inner.next_fill = (i + 1) % SLOT_CAPACITY;
        }
        inner.remain += slots.len();
        Ok(inner.remain)
    }

    /// Apply a control message received from the peer.
    pub fn apply(&self, msg: &ControlMessage) -> Result<usize> {
        if msg.kind == MsgKind::Mr {
            let mut inner = self.inner.lock();
            if inner.peer.is_some() {
                return Err(Error::ControlMsg("memory region published twice"));
            }
            inner.peer = Some(RemoteTarget {
                addr: msg.remote_addr,
                rkey: msg.remote_key,
            });
        }
        self.replenish(msg.slots())
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.inner.lock().remain
    }

    #[inline]
    pub fn is_peer_ready(&self) -> bool {
        self.inner.lock().peer.is_some()
    }
}

impl Default for SlotCreditPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A request to grant the peer `count` more slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignRequest {
    pub count: usize,
}

struct LedgerInner {
    slots: [Desc; SLOT_CAPACITY],
    next: usize,
    next_fill: usize,
    remain: usize,
    published: bool,
    closed: bool,
}

/// Receiver-side record of granted slots and the local buffers behind them.
///
/// Writes arrive in the order the sender reserved slots, which is the order
/// they were granted, so slots are consumed FIFO.
pub struct SlotLedger {
    inner: Mutex<LedgerInner>,
    policy: CreditPolicy,
}

impl SlotLedger {
    pub fn new(policy: CreditPolicy) -> Self {
        assert!(policy.capacity() <= SLOT_CAPACITY);
        Self {
            inner: Mutex::new(LedgerInner {
                slots: [Desc::default(); SLOT_CAPACITY],
                next: 0,
                next_fill: 0,
                remain: 0,
                published: false,
                closed: false,
            }),
            policy,
        }
    }

    #[inline]
    pub fn policy(&self) -> &CreditPolicy {
        &self.policy
    }

    /// Room for more grants.
    #[inline]
    pub fn vacancy(&self) -> usize {
        self.policy.capacity() - self.inner.lock().remain
    }

    /// Record `bufs` as granted and build the message announcing them.
    ///
    /// The first grant is an `Mr` message carrying `region` (base address and
    /// rkey of the registered guest memory); later grants are `Assign`s.
    /// Fails once the ledger is closed; `bufs` then stay with the caller.
    pub fn grant(&self, bufs: &[Desc], region: RemoteTarget) -> Result<ControlMessage> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::ControlMsg("slot grant to a closed connection"));
        }
        if inner.remain + bufs.len() > self.policy.capacity() {
            return Err(Error::ControlMsg("slot grant exceeds capacity"));
        }

        let mut offsets = [0u64; SLOT_CAPACITY];
        for (i, buf) in bufs.iter().enumerate() {
            let at = inner.next_fill;
            inner.slots[at] = *buf;
            inner.next_fill = (at + 1) % SLOT_CAPACITY;
            offsets[i] = buf.data_ptr;
        }
        inner.remain += bufs.len();

        let offsets = &offsets[..bufs.len()];
        Ok(if inner.published {
            ControlMessage::assign(offsets)
        } else {
            inner.published = true;
            ControlMessage::mr(region.addr, region.rkey, offsets)
        })
    }

    /// Consume the slot the peer's next write landed in.
    ///
    /// Also returns an [`AssignRequest`] if this consumption crossed the
    /// low-water mark. A write with no slot outstanding is a protocol error.
    pub fn consume(&self) -> Result<(Desc, Option<AssignRequest>)> {
        let mut inner = self.inner.lock();
        if inner.remain == 0 {
            return Err(Error::ControlMsg("write arrived without a granted slot"));
        }
        let slot = inner.slots[inner.next];
        inner.next = (inner.next + 1) % SLOT_CAPACITY;
        let before = inner.remain;
        inner.remain -= 1;

        let assign = self
            .policy
            .crossed(before, inner.remain)
            .then(|| AssignRequest {
                count: self.policy.grant_size(),
            });
        Ok((slot, assign))
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.inner.lock().remain
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Withdraw every outstanding grant, oldest first, and close the ledger
    /// to further grants. Done once, at teardown.
    pub fn revoke_all(&self) -> Vec<Desc> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let mut out = Vec::with_capacity(inner.remain);
        while inner.remain > 0 {
            out.push(inner.slots[inner.next]);
            inner.next = (inner.next + 1) % SLOT_CAPACITY;
            inner.remain -= 1;
        }
        out
    }
}

impl fmt::Debug for SlotLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SlotLedger")
            .field("remain", &inner.remain)
            .field("closed", &inner.closed)
            .finish_non_exhaustive()
    }
}

impl Default for SlotLedger {
    fn default() -> Self {
        Self::new(CreditPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: RemoteTarget = RemoteTarget {
        addr: 0x7f00_0000_0000,
        rkey: 0x1234,
    };

    #[test]
    fn reserve_before_mr_is_not_ready() {
        let pool = SlotCreditPool::new();
        assert_eq!(pool.try_reserve(), Err(NoCredit::PeerNotReady));
        // Grants without a region are still counted.
        assert_eq!(pool.replenish(&[0, 64]).unwrap(), 2);
        assert_eq!(pool.try_reserve(), Err(NoCredit::PeerNotReady));
    }

    #[test]
    fn mr_makes_exactly_k_slots_reservable() {
        let pool = SlotCreditPool::new();
        let slots = [0x000, 0x800, 0x1000];
        pool.apply(&ControlMessage::mr(REGION.addr, REGION.rkey, &slots))
            .unwrap();
        assert_eq!(pool.remaining(), 3);
        for s in slots {
            assert_eq!(
                pool.try_reserve(),
                Ok(RemoteTarget {
                    addr: REGION.addr + s,
                    rkey: REGION.rkey
                })
            );
        }
        assert_eq!(pool.try_reserve(), Err(NoCredit::Exhausted));
    }

    #[test]
    fn replenish_adds_exactly_granted() {
        let pool = SlotCreditPool::new();
        pool.apply(&ControlMessage::mr(REGION.addr, REGION.rkey, &[]))
            .unwrap();
        assert_eq!(pool.remaining(), 0);
        assert_eq!(pool.try_reserve(), Err(NoCredit::Exhausted));
        assert_eq!(pool.replenish(&[8, 16, 24]).unwrap(), 3);
        assert_eq!(pool.try_reserve().unwrap().addr, REGION.addr + 8);
        assert_eq!(pool.replenish(&[32]).unwrap(), 3);
    }

    #[test]
    fn overflow_and_double_mr_rejected() {
        let pool = SlotCreditPool::new();
        let full = [0u64; SLOT_CAPACITY];
        pool.apply(&ControlMessage::mr(REGION.addr, REGION.rkey, &full))
            .unwrap();
        assert!(pool.replenish(&[1]).is_err());
        assert_eq!(pool.remaining(), SLOT_CAPACITY);
        assert!(pool
            .apply(&ControlMessage::mr(REGION.addr, REGION.rkey, &[]))
            .is_err());
    }

    #[test]
    fn slots_wrap_around() {
        let pool = SlotCreditPool::new();
        let first: Vec<u64> = (0..SLOT_CAPACITY as u64).collect();
        pool.apply(&ControlMessage::mr(0, 1, &first)).unwrap();
        for _ in 0..6 {
            pool.try_reserve().unwrap();
        }
        pool.replenish(&[100, 101, 102, 103]).unwrap();
        let got: Vec<u64> = (0..6).map(|_| pool.try_reserve().unwrap().addr).collect();
        assert_eq!(got, vec![6, 7, 100, 101, 102, 103]);
    }

    #[test]
    fn policy_crossing() {
        let p = CreditPolicy::new(8);
        assert!(!p.crossed(8, 7));
        assert!(!p.crossed(6, 5));
        assert!(p.crossed(5, 4));
        assert!(!p.crossed(4, 3));
        assert!(!p.crossed(0, 0));
        assert_eq!(p.grant_size(), 4);
    }

    #[test]
    fn first_grant_is_mr_then_assign() {
        let ledger = SlotLedger::default();
        let bufs: Vec<Desc> = (0..4).map(|i| Desc::new(i, i * 2048, 2048)).collect();
        let mr = ledger.grant(&bufs, REGION).unwrap();
        assert_eq!(mr.kind, MsgKind::Mr);
        assert_eq!(mr.remote_addr, REGION.addr);
        assert_eq!(mr.slots(), &[0, 2048, 4096, 6144]);

        let more = ledger.grant(&bufs[..1], REGION).unwrap();
        assert_eq!(more.kind, MsgKind::Assign);
        assert_eq!(ledger.remaining(), 5);
        assert_eq!(ledger.vacancy(), 3);
    }

    #[test]
    fn ledger_assigns_once_per_crossing() {
        let ledger = SlotLedger::default();
        let bufs: Vec<Desc> = (0..8).map(|i| Desc::new(i, i * 64, 64)).collect();
        ledger.grant(&bufs, REGION).unwrap();

        let mut requests = Vec::new();
        for i in 0..8 {
            let (slot, assign) = ledger.consume().unwrap();
            assert_eq!(slot.handle, i);
            if let Some(req) = assign {
                requests.push((i, req));
            }
        }
        // Remaining went 8 -> 0; only the step 5 -> 4 crosses half.
        assert_eq!(requests, vec![(3, AssignRequest { count: 4 })]);
        assert!(ledger.consume().is_err());
    }

    #[test]
    fn revoke_returns_outstanding_in_order() {
        let ledger = SlotLedger::default();
        let bufs: Vec<Desc> = (0..3).map(|i| Desc::new(i, 0, 0)).collect();
        ledger.grant(&bufs, REGION).unwrap();
        ledger.consume().unwrap();
        let back: Vec<u64> = ledger.revoke_all().iter().map(|d| d.handle).collect();
        assert_eq!(back, vec![1, 2]);
        assert_eq!(ledger.remaining(), 0);
    }

    #[test]
    fn revoked_ledger_refuses_grants() {
        let ledger = SlotLedger::default();
        let bufs: Vec<Desc> = (0..2).map(|i| Desc::new(i, i * 64, 64)).collect();
        ledger.grant(&bufs, REGION).unwrap();
        assert_eq!(ledger.revoke_all().len(), 2);
        assert!(ledger.is_closed());

        assert!(ledger.grant(&bufs, REGION).is_err());
        assert_eq!(ledger.remaining(), 0);
        assert!(ledger.revoke_all().is_empty());
    }
}
