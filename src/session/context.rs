use crate::arena::GuestMemory;
use crate::credit::{ControlMessage, SLOT_CAPACITY};
use crate::error::{Error, Result};
use crate::fabric::*;
use crate::ring::Desc;
use crate::type_alias::*;

/// Work request kinds, stored in the top byte of a [`WrId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WrKind {
    /// RDMA write carrying one TX buffer.
    Write = 0,
    /// Receive for a control message.
    CtrlRecv = 1,
    /// Send of a control message.
    CtrlSend = 2,
    /// Zero-length receive absorbing one write-with-immediate.
    DataRecv = 3,
}

impl WrKind {
    const SHIFT: u32 = 56;

    #[inline]
    pub(crate) fn wr_id(self, index: usize) -> WrId {
        ((self as u64) << Self::SHIFT) | index as u64
    }

    /// Split a work request ID into its kind and index.
    #[inline]
    pub(crate) fn parse(wr_id: WrId) -> Option<(Self, usize)> {
        let index = (wr_id & ((1 << Self::SHIFT) - 1)) as usize;
        let kind = match wr_id >> Self::SHIFT {
            0 => Self::Write,
            1 => Self::CtrlRecv,
            2 => Self::CtrlSend,
            3 => Self::DataRecv,
            _ => return None,
        };
        Some((kind, index))
    }
}

/// Writes that may be outstanding on one connection.
pub const MAX_INFLIGHT: usize = SLOT_CAPACITY;

/// Per-connection fabric resources.
///
/// Owns the QP (and its PD/CQ) plus every registration made on it. Field
/// order matters: the fabric is dropped, and its registrations released,
/// before the memory behind them.
pub struct RdmaContext<F: Fabric> {
    pub(crate) fabric: F,
    guest_keys: MemKeys,
    ctrl_keys: MemKeys,

    /// Writes in flight, indexed by their work request ID.
    inflight: [Option<Desc>; MAX_INFLIGHT],
    ctrl_send_busy: bool,

    ctrl: Box<[u8]>,
    guest: GuestMemory,
}

impl<F: Fabric> RdmaContext<F> {
    /// Control buffer: one receive half, one send half.
    const CTRL_HALF: usize = 128;

    fn new(dev: &F::Device, guest: &GuestMemory, access: Access) -> Result<Self> {
        const _: () = assert!(ControlMessage::WIRE_SIZE <= 128);

        let mut fabric = F::open(dev)?;
        let mut ctrl = vec![0u8; Self::CTRL_HALF * 2].into_boxed_slice();

        // SAFETY: both regions are owned by the returned context and outlive
        // `fabric` due to field order.
        let (guest_keys, ctrl_keys) = unsafe {
            (
                fabric.reg_mem(guest.base(), guest.len(), access)?,
                fabric.reg_mem(ctrl.as_mut_ptr(), ctrl.len(), Access::Local)?,
            )
        };

        Ok(Self {
            fabric,
            guest_keys,
            ctrl_keys,
            inflight: [None; MAX_INFLIGHT],
            ctrl_send_busy: false,
            ctrl,
            guest: guest.clone(),
        })
    }

    /// Resources of a sending connection: guest memory is only read locally,
    /// and one receive waits for the peer's control messages.
    pub(crate) fn initiator(dev: &F::Device, guest: &GuestMemory) -> Result<Self> {
        let mut this = Self::new(dev, guest, Access::Local)?;
        this.post_ctrl_recv()?;
        Ok(this)
    }

    /// Resources of a receiving connection: the peer writes straight into
    /// guest memory.
    pub(crate) fn acceptor(dev: &F::Device, guest: &GuestMemory) -> Result<Self> {
        Self::new(dev, guest, Access::RemoteWrite)
    }

    /// Registered guest memory as a write target for the peer.
    #[inline]
    pub fn guest_region(&self) -> RemoteTarget {
        self.guest_keys.remote()
    }

    #[inline]
    fn ctrl_addr(&self, half: usize) -> u64 {
        self.ctrl_keys.addr + (half * Self::CTRL_HALF) as u64
    }

    pub(crate) fn post_ctrl_recv(&mut self) -> Result<()> {
        let sge = self
            .ctrl_keys
            .sge(self.ctrl_addr(0), ControlMessage::WIRE_SIZE as u32);
        self.fabric
            .post_recv(WrKind::CtrlRecv.wr_id(0), Some(sge))
    }

    /// Pre-post receives for incoming writes.
    pub(crate) fn post_data_recvs(&mut self, count: usize) -> Result<()> {
        for i in 0..count {
            self.fabric.post_recv(WrKind::DataRecv.wr_id(i), None)?;
        }
        Ok(())
    }

    pub(crate) fn repost_data_recv(&mut self, index: usize) -> Result<()> {
        self.fabric.post_recv(WrKind::DataRecv.wr_id(index), None)
    }

    /// Decode the control message sitting in the receive half.
    pub(crate) fn received_ctrl(&self) -> Result<ControlMessage> {
        ControlMessage::decode(&self.ctrl[..Self::CTRL_HALF])
    }

    #[inline]
    pub(crate) fn is_ctrl_send_busy(&self) -> bool {
        self.ctrl_send_busy
    }

    /// Send a control message. Only one may be outstanding.
    pub(crate) fn post_ctrl_send(&mut self, msg: &ControlMessage) -> Result<()> {
        debug_assert!(!self.ctrl_send_busy);
        msg.encode(&mut self.ctrl[Self::CTRL_HALF..]);
        let sge = self
            .ctrl_keys
            .sge(self.ctrl_addr(1), ControlMessage::WIRE_SIZE as u32);
        self.fabric.post_send(WrKind::CtrlSend.wr_id(0), sge)?;
        self.ctrl_send_busy = true;
        Ok(())
    }

    pub(crate) fn ctrl_send_done(&mut self) {
        self.ctrl_send_busy = false;
    }

    /// Free in-flight table entry, if any.
    #[inline]
    pub(crate) fn free_inflight(&self) -> Option<usize> {
        self.inflight.iter().position(Option::is_none)
    }

    /// Write `desc`'s payload to `target`, with its size as the immediate.
    pub(crate) fn post_write(&mut self, index: usize, desc: Desc, target: RemoteTarget) -> Result<()> {
        let addr = self
            .guest
            .addr_of(desc.data_ptr, desc.size)
            .ok_or(Error::ControlMsg("descriptor outside guest memory"))?;
        let sge = self.guest_keys.sge(addr, desc.size);
        self.inflight[index] = Some(desc);
        self.fabric
            .post_write_imm(WrKind::Write.wr_id(index), sge, target, desc.size)
            .inspect_err(|_| self.inflight[index] = None)
    }

    /// Retire the write recorded at `index`.
    pub(crate) fn complete_write(&mut self, index: usize) -> Option<Desc> {
        self.inflight.get_mut(index)?.take()
    }

    /// Every write still in flight, oldest table slot first.
    pub(crate) fn take_inflight(&mut self) -> Vec<Desc> {
        self.inflight.iter_mut().filter_map(Option::take).collect()
    }

    pub(crate) fn inflight_count(&self) -> usize {
        self.inflight.iter().filter(|d| d.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wr_id_round_trip() {
        for kind in [
            WrKind::Write,
            WrKind::CtrlRecv,
            WrKind::CtrlSend,
            WrKind::DataRecv,
        ] {
            let id = kind.wr_id(7);
            assert_eq!(WrKind::parse(id), Some((kind, 7)));
        }
        assert_eq!(WrKind::parse(0xff << 56), None);
    }
}
