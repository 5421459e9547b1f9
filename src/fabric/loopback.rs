//! In-process software fabric.
//!
//! Queue pairs, memory regions and multicast groups live in a shared
//! [`LoopbackHub`]. Posting a send or write copies bytes directly between
//! registered regions and pushes completions to both sides' CQs, whose
//! completion channels are eventfds.
//!
//! The reliable flavor models infinite RNR retry: an inbound message with no
//! receive posted is parked until one is. The datagram flavor drops it, as
//! UD does.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::*;
use crate::error::{Error, Result};
use crate::util::fd::EventFd;

/// QPN that addresses a whole multicast group.
pub const MULTICAST_QPN: Qpn = 0xFF_FFFF;

struct MrEntry {
    addr: u64,
    len: usize,
    access: Access,
}

impl MrEntry {
    #[inline]
    fn covers(&self, addr: u64, len: u32) -> bool {
        addr >= self.addr
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.addr + self.len as u64)
    }
}

/// A completion queue with an eventfd completion channel.
struct Cq {
    queue: SegQueue<Completion>,
    armed: AtomicBool,
    channel: EventFd,
}

impl Cq {
    fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            queue: SegQueue::new(),
            armed: AtomicBool::new(false),
            channel: EventFd::new().map_err(Error::fabric("create completion channel"))?,
        }))
    }

    fn push(&self, wc: Completion) {
        self.queue.push(wc);
        if self.armed.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.channel.signal() {
                log::warn!("loopback: failed to signal completion channel: {}", e);
            }
        }
    }

    fn poll(&self, out: &mut Vec<Completion>) -> usize {
        let mut n = 0;
        while let Some(wc) = self.queue.pop() {
            out.push(wc);
            n += 1;
        }
        n
    }

    fn rearm(&self) -> Result<()> {
        self.channel
            .drain()
            .map_err(Error::fabric("get completion event"))?;
        self.armed.store(true, Ordering::Release);
        Ok(())
    }
}

/// The sender's half of an in-flight operation, completed on delivery.
struct SenderRef {
    cq: Arc<Cq>,
    wr_id: WrId,
    opcode: WcOpcode,
    len: u32,
}

impl SenderRef {
    fn complete(self, status: WcStatus) {
        self.cq.push(Completion {
            wr_id: self.wr_id,
            status,
            opcode: self.opcode,
            byte_len: self.len,
            imm: None,
            src: None,
        });
    }
}

enum Inbound {
    Send {
        data: Vec<u8>,
        src: Option<DatagramSource>,
        sender: Option<SenderRef>,
    },
    WriteImm {
        imm: u32,
        len: u32,
        sender: SenderRef,
    },
}

impl Inbound {
    fn fail(self, status: WcStatus) {
        match self {
            Self::Send {
                sender: Some(sender),
                ..
            } => sender.complete(status),
            Self::Send { sender: None, .. } => {}
            Self::WriteImm { sender, .. } => sender.complete(status),
        }
    }
}

#[derive(Default)]
struct RecvQueue {
    posted: VecDeque<(WrId, Option<Sge>)>,
    parked: VecDeque<Inbound>,
}

struct QpShared {
    qpn: Qpn,
    tenant: Option<u32>,
    reliable: bool,
    alive: AtomicBool,
    rq: Mutex<RecvQueue>,
    recv_cq: Arc<Cq>,
}

impl QpShared {
    fn new(qpn: Qpn, tenant: Option<u32>, recv_cq: Arc<Cq>) -> Arc<Self> {
        Arc::new(Self {
            qpn,
            tenant,
            reliable: tenant.is_none(),
            alive: AtomicBool::new(true),
            rq: Mutex::new(RecvQueue::default()),
            recv_cq,
        })
    }

    /// Hand an inbound message to the next posted receive.
    fn deliver(&self, inbound: Inbound) {
        if !self.alive.load(Ordering::Acquire) {
            inbound.fail(WcStatus::RetryExceeded);
            return;
        }
        // Completion happens under the lock so receives complete in the
        // order they were posted.
        let mut rq = self.rq.lock();
        match rq.posted.pop_front() {
            Some((wr_id, sge)) => self.complete_inbound(wr_id, sge, inbound),
            None if self.reliable => rq.parked.push_back(inbound),
            None => log::trace!("loopback: QP {} dropping datagram, no receive posted", self.qpn),
        }
    }

    fn complete_inbound(&self, wr_id: WrId, sge: Option<Sge>, inbound: Inbound) {
        match inbound {
            Inbound::Send { data, src, sender } => {
                let fits = sge.is_some_and(|s| s.len as usize >= data.len());
                let status = match sge {
                    Some(s) if fits => {
                        // SAFETY: the receiver registered `s` as valid memory.
                        unsafe {
                            ptr::copy_nonoverlapping(data.as_ptr(), s.addr as *mut u8, data.len())
                        };
                        WcStatus::Success
                    }
                    _ => WcStatus::LocalLength,
                };
                self.recv_cq.push(Completion {
                    wr_id,
                    status,
                    opcode: WcOpcode::Recv,
                    byte_len: if fits { data.len() as u32 } else { 0 },
                    imm: None,
                    src,
                });
                if let Some(sender) = sender {
                    sender.complete(if fits {
                        WcStatus::Success
                    } else {
                        WcStatus::RemoteInvalidRequest
                    });
                }
            }
            Inbound::WriteImm { imm, len, sender } => {
                self.recv_cq.push(Completion {
                    wr_id,
                    status: WcStatus::Success,
                    opcode: WcOpcode::RecvRdmaWithImm,
                    byte_len: len,
                    imm: Some(imm),
                    src: None,
                });
                sender.complete(WcStatus::Success);
            }
        }
    }

    fn post_recv(&self, wr_id: WrId, sge: Option<Sge>) {
        let mut rq = self.rq.lock();
        match rq.parked.pop_front() {
            Some(inbound) => self.complete_inbound(wr_id, sge, inbound),
            None => rq.posted.push_back((wr_id, sge)),
        }
    }

    fn kill(&self) {
        self.alive.store(false, Ordering::Release);
        let parked: Vec<_> = self.rq.lock().parked.drain(..).collect();
        for inbound in parked {
            inbound.fail(WcStatus::RetryExceeded);
        }
    }
}

struct HubInner {
    next_id: AtomicU32,
    qps: DashMap<Qpn, Arc<QpShared>, RandomState>,
    mrs: DashMap<u32, MrEntry, RandomState>,
    groups: DashMap<u32, Vec<Qpn>, RandomState>,
}

/// The shared state of one software fabric. Clones refer to the same fabric.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                next_id: AtomicU32::new(1),
                qps: DashMap::with_hasher(RandomState::new()),
                mrs: DashMap::with_hasher(RandomState::new()),
                groups: DashMap::with_hasher(RandomState::new()),
            }),
        }
    }

    #[inline]
    fn next_id(&self) -> u32 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn qp(&self, qpn: Qpn) -> Option<Arc<QpShared>> {
        self.inner.qps.get(&qpn).map(|qp| qp.value().clone())
    }

    fn reg_mr(&self, addr: *mut u8, len: usize, access: Access) -> MemKeys {
        let key = self.next_id();
        let addr = addr as u64;
        self.inner.mrs.insert(key, MrEntry { addr, len, access });
        MemKeys {
            addr,
            len,
            lkey: key,
            rkey: key,
        }
    }

    fn dereg_mrs(&self, keys: &[u32]) {
        for key in keys {
            self.inner.mrs.remove(key);
        }
    }

    fn local_ok(&self, sge: &Sge) -> bool {
        self.inner
            .mrs
            .get(&sge.lkey)
            .is_some_and(|mr| mr.covers(sge.addr, sge.len))
    }

    fn gather(&self, sge: &Sge) -> Vec<u8> {
        let mut data = vec![0u8; sge.len as usize];
        // SAFETY: `sge` was checked against a live registration.
        unsafe { ptr::copy_nonoverlapping(sge.addr as *const u8, data.as_mut_ptr(), data.len()) };
        data
    }

    fn remote_write(&self, sge: &Sge, remote: RemoteTarget) -> WcStatus {
        let allowed = self.inner.mrs.get(&remote.rkey).is_some_and(|mr| {
            mr.access == Access::RemoteWrite && mr.covers(remote.addr, sge.len)
        });
        if !allowed {
            return WcStatus::RemoteAccess;
        }
        // SAFETY: both ranges were checked against live registrations.
        unsafe {
            ptr::copy(
                sge.addr as *const u8,
                remote.addr as *mut u8,
                sge.len as usize,
            )
        };
        WcStatus::Success
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Endpoint of a loopback RC QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackEndpoint {
    pub qpn: Qpn,
}

/// A reliable connection on a [`LoopbackHub`].
pub struct LoopbackFabric {
    hub: LoopbackHub,
    qp: Arc<QpShared>,
    cq: Arc<Cq>,
    peer: Option<Arc<QpShared>>,
    mrs: Vec<u32>,
}

impl LoopbackFabric {
    fn peer(&self) -> Result<&Arc<QpShared>> {
        self.peer.as_ref().ok_or_else(|| Error::Fabric {
            op: "post send",
            source: io::Error::new(io::ErrorKind::NotConnected, "QP is not connected"),
        })
    }

    fn fail_local(&self, wr_id: WrId, opcode: WcOpcode) {
        self.cq.push(Completion {
            wr_id,
            status: WcStatus::LocalProtection,
            opcode,
            byte_len: 0,
            imm: None,
            src: None,
        });
    }
}

impl CompletionSource for LoopbackFabric {
    fn poll(&mut self, out: &mut Vec<Completion>) -> Result<usize> {
        Ok(self.cq.poll(out))
    }

    fn comp_fd(&self) -> Option<RawFd> {
        Some(self.cq.channel.as_raw_fd())
    }

    fn rearm(&mut self) -> Result<()> {
        self.cq.rearm()
    }
}

impl Fabric for LoopbackFabric {
    type Device = LoopbackHub;
    type Endpoint = LoopbackEndpoint;

    fn open(hub: &LoopbackHub) -> Result<Self> {
        let cq = Cq::new()?;
        let qpn = hub.next_id();
        let qp = QpShared::new(qpn, None, cq.clone());
        hub.inner.qps.insert(qpn, qp.clone());
        Ok(Self {
            hub: hub.clone(),
            qp,
            cq,
            peer: None,
            mrs: Vec::new(),
        })
    }

    fn endpoint(&self) -> LoopbackEndpoint {
        LoopbackEndpoint { qpn: self.qp.qpn }
    }

    fn connect(&mut self, peer: &LoopbackEndpoint, _params: &ConnParams) -> Result<()> {
        let qp = self.hub.qp(peer.qpn).ok_or_else(|| Error::Fabric {
            op: "modify QP to RTR",
            source: io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such QP {}", peer.qpn),
            ),
        })?;
        self.peer = Some(qp);
        Ok(())
    }

    unsafe fn reg_mem(&mut self, addr: *mut u8, len: usize, access: Access) -> Result<MemKeys> {
        let keys = self.hub.reg_mr(addr, len, access);
        self.mrs.push(keys.lkey);
        Ok(keys)
    }

    fn post_recv(&mut self, wr_id: WrId, sge: Option<Sge>) -> Result<()> {
        self.qp.post_recv(wr_id, sge);
        Ok(())
    }

    fn post_send(&mut self, wr_id: WrId, sge: Sge) -> Result<()> {
        let peer = self.peer()?.clone();
        if !self.hub.local_ok(&sge) {
            self.fail_local(wr_id, WcOpcode::Send);
            return Ok(());
        }
        let data = self.hub.gather(&sge);
        peer.deliver(Inbound::Send {
            data,
            src: None,
            sender: Some(SenderRef {
                cq: self.cq.clone(),
                wr_id,
                opcode: WcOpcode::Send,
                len: sge.len,
            }),
        });
        Ok(())
    }

    fn post_write_imm(
        &mut self,
        wr_id: WrId,
        sge: Sge,
        remote: RemoteTarget,
        imm: u32,
    ) -> Result<()> {
        let peer = self.peer()?.clone();
        if !self.hub.local_ok(&sge) {
            self.fail_local(wr_id, WcOpcode::RdmaWrite);
            return Ok(());
        }
        let sender = SenderRef {
            cq: self.cq.clone(),
            wr_id,
            opcode: WcOpcode::RdmaWrite,
            len: sge.len,
        };
        match self.hub.remote_write(&sge, remote) {
            WcStatus::Success => peer.deliver(Inbound::WriteImm {
                imm,
                len: sge.len,
                sender,
            }),
            status => sender.complete(status),
        }
        Ok(())
    }
}

impl Drop for LoopbackFabric {
    fn drop(&mut self) {
        self.qp.kill();
        self.hub.inner.qps.remove(&self.qp.qpn);
        self.hub.dereg_mrs(&self.mrs);
    }
}

/// Address handle of the datagram flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackAh {
    Unicast(Qpn),
    Multicast(u32),
}

/// Synthetic GID of a loopback QP.
fn gid_of(qpn: Qpn) -> [u8; 16] {
    let mut gid = [0u8; 16];
    gid[0] = 0xfe;
    gid[1] = 0x80;
    gid[12..].copy_from_slice(&qpn.to_be_bytes());
    gid
}

/// Datagram QPs on a [`LoopbackHub`].
pub struct LoopbackDatagram;

impl DatagramFabric for LoopbackDatagram {
    type Device = LoopbackHub;
    type AddressHandle = LoopbackAh;
    type RecvHalf = LoopbackUdRecv;
    type SendHalf = LoopbackUdSend;

    fn open(hub: &LoopbackHub, tenant: u32) -> Result<(LoopbackUdRecv, LoopbackUdSend)> {
        let recv_cq = Cq::new()?;
        let send_cq = Cq::new()?;
        let qpn = hub.next_id();
        let qp = QpShared::new(qpn, Some(tenant), recv_cq.clone());
        hub.inner.qps.insert(qpn, qp.clone());
        hub.inner.groups.entry(tenant).or_default().push(qpn);

        Ok((
            LoopbackUdRecv {
                hub: hub.clone(),
                qp,
                cq: recv_cq,
                mrs: Vec::new(),
            },
            LoopbackUdSend {
                hub: hub.clone(),
                qpn,
                tenant,
                cq: send_cq,
                mrs: Vec::new(),
            },
        ))
    }
}

/// Receive half of a loopback datagram QP.
pub struct LoopbackUdRecv {
    hub: LoopbackHub,
    qp: Arc<QpShared>,
    cq: Arc<Cq>,
    mrs: Vec<u32>,
}

impl LoopbackUdRecv {
    pub fn qpn(&self) -> Qpn {
        self.qp.qpn
    }
}

impl CompletionSource for LoopbackUdRecv {
    fn poll(&mut self, out: &mut Vec<Completion>) -> Result<usize> {
        Ok(self.cq.poll(out))
    }

    fn comp_fd(&self) -> Option<RawFd> {
        Some(self.cq.channel.as_raw_fd())
    }

    fn rearm(&mut self) -> Result<()> {
        self.cq.rearm()
    }
}

impl DatagramRecv for LoopbackUdRecv {
    type AddressHandle = LoopbackAh;

    unsafe fn reg_mem(&mut self, addr: *mut u8, len: usize) -> Result<MemKeys> {
        let keys = self.hub.reg_mr(addr, len, Access::Local);
        self.mrs.push(keys.lkey);
        Ok(keys)
    }

    fn post_recv(&mut self, wr_id: WrId, sge: Sge) -> Result<()> {
        self.qp.post_recv(wr_id, Some(sge));
        Ok(())
    }

    fn make_ah(&mut self, src: &DatagramSource) -> Result<LoopbackAh> {
        Ok(LoopbackAh::Unicast(src.qpn))
    }
}

impl Drop for LoopbackUdRecv {
    fn drop(&mut self) {
        self.qp.kill();
        self.hub.inner.qps.remove(&self.qp.qpn);
        if let Some(tenant) = self.qp.tenant {
            if let Some(mut members) = self.hub.inner.groups.get_mut(&tenant) {
                members.retain(|&q| q != self.qp.qpn);
            }
        }
        self.hub.dereg_mrs(&self.mrs);
    }
}

/// Send half of a loopback datagram QP.
pub struct LoopbackUdSend {
    hub: LoopbackHub,
    qpn: Qpn,
    tenant: u32,
    cq: Arc<Cq>,
    mrs: Vec<u32>,
}

impl LoopbackUdSend {
    pub fn qpn(&self) -> Qpn {
        self.qpn
    }

    fn unicast(&self, dst: Qpn, data: Vec<u8>) {
        let Some(qp) = self.hub.qp(dst) else {
            log::trace!("loopback: datagram to unknown QP {} lost", dst);
            return;
        };
        if qp.tenant != Some(self.tenant) {
            log::trace!("loopback: Q_Key mismatch, datagram to QP {} lost", dst);
            return;
        }
        qp.deliver(Inbound::Send {
            data,
            src: Some(DatagramSource {
                qpn: self.qpn,
                lid: self.qpn as u16,
                gid: None,
            }),
            sender: None,
        });
    }

    fn multicast(&self, group: u32, data: Vec<u8>) {
        let members = self
            .hub
            .inner
            .groups
            .get(&group)
            .map(|m| m.value().clone())
            .unwrap_or_default();
        for dst in members.into_iter().filter(|&q| q != self.qpn) {
            if let Some(qp) = self.hub.qp(dst) {
                qp.deliver(Inbound::Send {
                    data: data.clone(),
                    src: Some(DatagramSource {
                        qpn: self.qpn,
                        lid: self.qpn as u16,
                        gid: Some(gid_of(self.qpn)),
                    }),
                    sender: None,
                });
            }
        }
    }
}

impl CompletionSource for LoopbackUdSend {
    fn poll(&mut self, out: &mut Vec<Completion>) -> Result<usize> {
        Ok(self.cq.poll(out))
    }

    fn comp_fd(&self) -> Option<RawFd> {
        Some(self.cq.channel.as_raw_fd())
    }

    fn rearm(&mut self) -> Result<()> {
        self.cq.rearm()
    }
}

impl DatagramSend for LoopbackUdSend {
    type AddressHandle = LoopbackAh;

    unsafe fn reg_mem(&mut self, addr: *mut u8, len: usize) -> Result<MemKeys> {
        let keys = self.hub.reg_mr(addr, len, Access::Local);
        self.mrs.push(keys.lkey);
        Ok(keys)
    }

    fn flood(&self) -> (LoopbackAh, Qpn) {
        (LoopbackAh::Multicast(self.tenant), MULTICAST_QPN)
    }

    fn post_send(&mut self, wr_id: WrId, sge: Sge, ah: &LoopbackAh, _qpn: Qpn) -> Result<()> {
        let status = if self.hub.local_ok(&sge) {
            let data = self.hub.gather(&sge);
            match *ah {
                LoopbackAh::Unicast(dst) => self.unicast(dst, data),
                LoopbackAh::Multicast(group) => self.multicast(group, data),
            }
            WcStatus::Success
        } else {
            WcStatus::LocalProtection
        };
        self.cq.push(Completion {
            wr_id,
            status,
            opcode: WcOpcode::Send,
            byte_len: sge.len,
            imm: None,
            src: None,
        });
        Ok(())
    }
}

impl Drop for LoopbackUdSend {
    fn drop(&mut self) {
        self.hub.dereg_mrs(&self.mrs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    #[test]
    fn write_imm_parks_until_recv_posted() {
        let hub = LoopbackHub::new();
        let mut a = LoopbackFabric::open(&hub).unwrap();
        let mut b = LoopbackFabric::open(&hub).unwrap();
        a.connect(&b.endpoint(), &ConnParams::default()).unwrap();
        b.connect(&a.endpoint(), &ConnParams::default()).unwrap();

        let mut src = b"payload".to_vec();
        let mut dst = buf(64);
        let src_mr = unsafe { a.reg_mem(src.as_mut_ptr(), src.len(), Access::Local) }.unwrap();
        let dst_mr =
            unsafe { b.reg_mem(dst.as_mut_ptr(), dst.len(), Access::RemoteWrite) }.unwrap();

        let target = RemoteTarget {
            addr: dst_mr.addr + 8,
            rkey: dst_mr.rkey,
        };
        a.post_write_imm(7, src_mr.sge(src_mr.addr, 7), target, 7)
            .unwrap();

        let mut wcs = Vec::new();
        assert_eq!(a.poll(&mut wcs).unwrap(), 0);
        assert_eq!(b.poll(&mut wcs).unwrap(), 0);

        b.post_recv(1, None).unwrap();
        b.poll(&mut wcs).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].opcode, WcOpcode::RecvRdmaWithImm);
        assert_eq!(wcs[0].imm, Some(7));
        assert_eq!(&dst[8..15], b"payload");

        wcs.clear();
        a.poll(&mut wcs).unwrap();
        assert_eq!(wcs[0].wr_id, 7);
        assert_eq!(wcs[0].opcode, WcOpcode::RdmaWrite);
        assert!(wcs[0].is_ok());
    }

    #[test]
    fn write_without_remote_access_fails() {
        let hub = LoopbackHub::new();
        let mut a = LoopbackFabric::open(&hub).unwrap();
        let mut b = LoopbackFabric::open(&hub).unwrap();
        a.connect(&b.endpoint(), &ConnParams::default()).unwrap();

        let mut src = buf(8);
        let mut dst = buf(8);
        let src_mr = unsafe { a.reg_mem(src.as_mut_ptr(), 8, Access::Local) }.unwrap();
        let dst_mr = unsafe { b.reg_mem(dst.as_mut_ptr(), 8, Access::Local) }.unwrap();
        a.post_write_imm(1, src_mr.sge(src_mr.addr, 8), dst_mr.remote(), 8)
            .unwrap();

        let mut wcs = Vec::new();
        a.poll(&mut wcs).unwrap();
        assert_eq!(wcs[0].status, WcStatus::RemoteAccess);
    }

    #[test]
    fn completion_channel_signals_after_rearm() {
        let hub = LoopbackHub::new();
        let mut a = LoopbackFabric::open(&hub).unwrap();
        let mut b = LoopbackFabric::open(&hub).unwrap();
        a.connect(&b.endpoint(), &ConnParams::default()).unwrap();
        b.rearm().unwrap();

        let mut src = buf(4);
        let mut dst = buf(4);
        let src_mr = unsafe { a.reg_mem(src.as_mut_ptr(), 4, Access::Local) }.unwrap();
        let dst_mr = unsafe { b.reg_mem(dst.as_mut_ptr(), 4, Access::Local) }.unwrap();
        b.post_recv(9, Some(dst_mr.sge(dst_mr.addr, 4))).unwrap();
        a.post_send(3, src_mr.sge(src_mr.addr, 4)).unwrap();

        let fd = b.comp_fd().unwrap();
        let mut val = 0u64;
        let n = unsafe { libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, 8) };
        assert_eq!(n, 8);
        assert_eq!(val, 1);
    }

    #[test]
    fn dead_peer_fails_sends() {
        let hub = LoopbackHub::new();
        let mut a = LoopbackFabric::open(&hub).unwrap();
        let b = LoopbackFabric::open(&hub).unwrap();
        a.connect(&b.endpoint(), &ConnParams::default()).unwrap();
        drop(b);

        let mut src = buf(4);
        let mr = unsafe { a.reg_mem(src.as_mut_ptr(), 4, Access::Local) }.unwrap();
        a.post_send(1, mr.sge(mr.addr, 4)).unwrap();
        let mut wcs = Vec::new();
        a.poll(&mut wcs).unwrap();
        assert_eq!(wcs[0].status, WcStatus::RetryExceeded);
    }

    #[test]
    fn multicast_carries_grh_and_unicast_does_not() {
        let hub = LoopbackHub::new();
        let (mut ra, mut sa) = LoopbackDatagram::open(&hub, 5).unwrap();
        let (mut rb, _sb) = LoopbackDatagram::open(&hub, 5).unwrap();

        let mut tx = b"frame".to_vec();
        let mut rx = buf(64);
        let tx_mr = unsafe { DatagramSend::reg_mem(&mut sa, tx.as_mut_ptr(), 5) }.unwrap();
        let rx_mr = unsafe { DatagramRecv::reg_mem(&mut rb, rx.as_mut_ptr(), 64) }.unwrap();
        rb.post_recv(1, rx_mr.sge(rx_mr.addr, 64)).unwrap();
        rb.post_recv(2, rx_mr.sge(rx_mr.addr, 64)).unwrap();

        let (flood, qpn) = sa.flood();
        sa.post_send(10, tx_mr.sge(tx_mr.addr, 5), &flood, qpn).unwrap();

        let mut wcs = Vec::new();
        rb.poll(&mut wcs).unwrap();
        assert_eq!(wcs.len(), 1);
        let src = wcs[0].src.unwrap();
        assert_eq!(src.qpn, sa.qpn());
        assert!(src.gid.is_some());
        assert_eq!(&rx[..5], b"frame");

        // The sender is a group member but does not hear itself.
        let mut own = Vec::new();
        ra.poll(&mut own).unwrap();
        assert!(own.is_empty());

        let ah = rb.make_ah(&src).unwrap();
        assert_eq!(ah, LoopbackAh::Unicast(sa.qpn()));
        sa.post_send(11, tx_mr.sge(tx_mr.addr, 5), &LoopbackAh::Unicast(rb.qpn()), rb.qpn())
            .unwrap();
        wcs.clear();
        rb.poll(&mut wcs).unwrap();
        assert_eq!(wcs[0].src.unwrap().gid, None);
    }
}
