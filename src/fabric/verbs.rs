//! Hardware backend over `rrddmma`.
//!
//! Completion channels are not exposed by `rrddmma`, so every queue here is
//! poll-only: [`CompletionSource::comp_fd`] returns `None` and the engines
//! fall back to their poll timer.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::{io, mem, ptr};

use libc::c_int;
use rrddmma::{
    bindings::*,
    rdma::{
        cq::{Cq, Wc},
        mr::{Mr, Permission},
        nic::{Nic, Port},
        pd::Pd,
        qp::{Qp, QpCaps, QpEndpoint, QpType},
    },
};

use super::*;
use crate::error::Error;
use crate::util::mmap::Mapping;

const CQ_DEPTH: usize = 1 << 10;
const CQ_POLL_BATCH: usize = 16;
const GRH_SIZE: usize = 40;

/// UD destination QPN that addresses a multicast group.
const MULTICAST_QPN: Qpn = 0xFF_FFFF;

/// libibverbs items `rrddmma::bindings` keeps private.
mod ffi {
    use super::*;

    pub const IBV_WC_GRH: u32 = 1 << 0;
    pub const IBV_QP_QKEY: c_int = 1 << 6;

    pub const IBV_WC_RDMA_WRITE: u32 = 1;
    pub const IBV_WC_RECV: u32 = 128;
    pub const IBV_WC_RECV_RDMA_WITH_IMM: u32 = 129;

    /// `struct ibv_global_route`.
    #[repr(C)]
    pub struct GlobalRoute {
        pub dgid: ibv_gid,
        pub flow_label: u32,
        pub sgid_index: u8,
        pub hop_limit: u8,
        pub traffic_class: u8,
    }

    /// `struct ibv_ah_attr`.
    #[repr(C)]
    pub struct AhAttr {
        pub grh: GlobalRoute,
        pub dlid: u16,
        pub sl: u8,
        pub src_path_bits: u8,
        pub static_rate: u8,
        pub is_global: u8,
        pub port_num: u8,
    }

    extern "C" {
        pub fn ibv_attach_mcast(qp: *mut ibv_qp, gid: *const ibv_gid, lid: u16) -> c_int;
    }
}

/// An opened NIC port. Cheap to clone; every clone shares the PD.
#[derive(Clone)]
pub struct VerbsDevice {
    pd: Pd,
    port: Port,
}

impl VerbsDevice {
    /// Probe `nic` and allocate a protection domain on physical port `phy_port`.
    pub fn open(nic: &str, phy_port: u8) -> Result<Self> {
        let Nic { context, ports } = Nic::finder()
            .dev_name(nic)
            .port_num(phy_port)
            .probe_nth_port(0)
            .map_err(Error::fabric("probe NIC"))?;
        let port = ports.into_iter().next().ok_or_else(|| Error::Fabric {
            op: "probe NIC",
            source: io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} has no port {}", nic, phy_port),
            ),
        })?;
        let pd = Pd::new(&context).map_err(Error::fabric("allocate PD"))?;
        Ok(Self { pd, port })
    }
}

fn wc_status(raw: u32) -> WcStatus {
    match raw {
        0 => WcStatus::Success,
        1 => WcStatus::LocalLength,
        4 => WcStatus::LocalProtection,
        5 => WcStatus::Flushed,
        9 => WcStatus::RemoteInvalidRequest,
        10 => WcStatus::RemoteAccess,
        12 => WcStatus::RetryExceeded,
        other => WcStatus::Other(other),
    }
}

fn wc_opcode(raw: u32) -> WcOpcode {
    match raw {
        ffi::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
        ffi::IBV_WC_RECV => WcOpcode::Recv,
        ffi::IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
        _ => WcOpcode::Send,
    }
}

/// Drain `cq` into `out`, converting as we go.
fn poll_cq(cq: &Cq, wc: &mut [Wc], out: &mut Vec<Completion>) -> Result<usize> {
    let mut total = 0;
    loop {
        let n = cq.poll_into(wc).map_err(Error::fabric("poll CQ"))? as usize;
        for wc in &wc[..n] {
            // The opcode of a failed completion is undefined; read it raw.
            out.push(Completion {
                wr_id: wc.wr_id(),
                status: wc_status(wc.0.status as u32),
                opcode: wc_opcode(wc.0.opcode as u32),
                byte_len: wc.0.byte_len,
                imm: wc.imm().map(u32::from_be),
                src: None,
            });
        }
        total += n;
        if n < wc.len() {
            return Ok(total);
        }
    }
}

#[inline]
fn raw_sge(sge: &Sge) -> ibv_sge {
    ibv_sge {
        addr: sge.addr,
        length: sge.len,
        lkey: sge.lkey,
    }
}

fn perm(access: Access) -> Permission {
    match access {
        Access::Local => Permission::LOCAL_WRITE,
        Access::RemoteWrite => Permission::LOCAL_WRITE | Permission::REMOTE_WRITE,
    }
}

/// One RC QP with a CQ shared by both directions.
pub struct VerbsFabric {
    /// Place before `mrs` so the QP goes away before its memory.
    qp: Qp,
    cq: Cq,
    ep: QpEndpoint,
    mrs: Vec<Mr>,
    wc: Vec<Wc>,
}

// SAFETY: the verbs objects are only touched by the engine thread owning them.
unsafe impl Send for VerbsFabric {}

impl CompletionSource for VerbsFabric {
    fn poll(&mut self, out: &mut Vec<Completion>) -> Result<usize> {
        poll_cq(&self.cq, &mut self.wc, out)
    }

    fn comp_fd(&self) -> Option<RawFd> {
        None
    }

    fn rearm(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Fabric for VerbsFabric {
    type Device = VerbsDevice;
    type Endpoint = QpEndpoint;

    fn open(dev: &VerbsDevice) -> Result<Self> {
        let cq = Cq::new(dev.pd.context(), CQ_DEPTH as _).map_err(Error::fabric("create CQ"))?;
        let mut qp = Qp::builder()
            .qp_type(QpType::Rc)
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps {
                max_send_wr: (CQ_DEPTH / 2) as _,
                max_recv_wr: (CQ_DEPTH / 2) as _,
                max_send_sge: 1,
                max_recv_sge: 1,
                ..Default::default()
            })
            .sq_sig_all(true)
            .build(&dev.pd)
            .map_err(Error::fabric("create RC QP"))?;
        qp.bind_local_port(&dev.port, None)
            .map_err(Error::fabric("bind RC QP"))?;
        let ep = qp
            .endpoint()
            .ok_or_else(|| Error::Endpoint("RC QP has no endpoint".into()))?;
        Ok(Self {
            qp,
            cq,
            ep,
            mrs: Vec::new(),
            wc: vec![Wc::default(); CQ_POLL_BATCH],
        })
    }

    fn endpoint(&self) -> QpEndpoint {
        self.ep.clone()
    }

    fn connect(&mut self, peer: &QpEndpoint, _params: &ConnParams) -> Result<()> {
        self.qp
            .bind_peer(peer.clone())
            .map_err(Error::fabric("modify QP to RTS"))
    }

    unsafe fn reg_mem(&mut self, addr: *mut u8, len: usize, access: Access) -> Result<MemKeys> {
        let mr = Mr::reg(self.qp.pd(), addr, len, perm(access))
            .map_err(Error::fabric("register memory"))?;
        let keys = MemKeys {
            addr: addr as u64,
            len,
            lkey: mr.lkey(),
            rkey: mr.rkey(),
        };
        self.mrs.push(mr);
        Ok(keys)
    }

    fn post_recv(&mut self, wr_id: WrId, sge: Option<Sge>) -> Result<()> {
        let mut sgl = sge.as_ref().map(raw_sge);
        let wr = ibv_recv_wr {
            wr_id,
            sg_list: sgl.as_mut().map_or(ptr::null_mut(), |s| s as *mut _),
            num_sge: sgl.is_some() as _,
            // SAFETY: all-zero is a valid `ibv_recv_wr`.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: the work request is correctly constructed.
        unsafe { self.qp.post_raw_recv(&wr) }.map_err(Error::fabric("post recv"))
    }

    fn post_send(&mut self, wr_id: WrId, sge: Sge) -> Result<()> {
        let mut sgl = raw_sge(&sge);
        let wr = ibv_send_wr {
            wr_id,
            sg_list: &mut sgl,
            num_sge: 1,
            opcode: ibv_wr_opcode::IBV_WR_SEND,
            send_flags: ibv_send_flags::IBV_SEND_SIGNALED.0,
            // SAFETY: all-zero is a valid `ibv_send_wr`.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: the work request is correctly constructed.
        unsafe { self.qp.post_raw_send(&wr) }.map_err(Error::fabric("post send"))
    }

    fn post_write_imm(
        &mut self,
        wr_id: WrId,
        sge: Sge,
        remote: RemoteTarget,
        imm: u32,
    ) -> Result<()> {
        let mut sgl = raw_sge(&sge);
        let mut wr = ibv_send_wr {
            wr_id,
            sg_list: &mut sgl,
            num_sge: 1,
            opcode: ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
            send_flags: ibv_send_flags::IBV_SEND_SIGNALED.0,
            // SAFETY: all-zero is a valid `ibv_send_wr`.
            ..unsafe { mem::zeroed() }
        };
        wr.set_imm(imm.to_be());
        // SAFETY: `rdma` is the member an RDMA write reads.
        unsafe {
            wr.wr.rdma.remote_addr = remote.addr;
            wr.wr.rdma.rkey = remote.rkey;
        }

        // SAFETY: the work request is correctly constructed.
        unsafe { self.qp.post_raw_send(&wr) }.map_err(Error::fabric("post write"))
    }
}

/// A verbs address handle, destroyed when the last clone drops.
#[derive(Debug)]
struct RawAh(*mut ibv_ah);

// SAFETY: address handles are immutable after creation.
unsafe impl Send for RawAh {}
unsafe impl Sync for RawAh {}

impl Drop for RawAh {
    fn drop(&mut self) {
        // SAFETY: FFI; the handle came from `ibv_create_ah`.
        unsafe { ibv_destroy_ah(self.0) };
    }
}

#[derive(Debug, Clone)]
pub struct VerbsAh(Arc<RawAh>);

impl VerbsAh {
    fn create(pd: &Pd, port_num: u8, dlid: u16, dgid: Option<[u8; 16]>) -> Result<Self> {
        // SAFETY: all-zero is a valid `ibv_ah_attr`.
        let mut attr: ffi::AhAttr = unsafe { mem::zeroed() };
        attr.dlid = dlid;
        attr.port_num = port_num;
        if let Some(gid) = dgid {
            attr.is_global = 1;
            attr.grh.dgid.raw = gid;
            attr.grh.hop_limit = 1;
        }
        // SAFETY: FFI; `AhAttr` has the layout of `struct ibv_ah_attr`.
        let ah = unsafe { ibv_create_ah(pd.as_raw(), (&mut attr as *mut ffi::AhAttr).cast()) };
        if ah.is_null() {
            return Err(Error::fabric("create AH")(io::Error::last_os_error()));
        }
        Ok(Self(Arc::new(RawAh(ah))))
    }
}

/// Multicast GID and LID of a tenant's group.
fn tenant_group(tenant: u32) -> ([u8; 16], u16) {
    let mut mgid = [0u8; 16];
    mgid[..4].copy_from_slice(&[0xff, 0x12, 0x60, 0x1b]);
    mgid[12..].copy_from_slice(&tenant.to_be_bytes());
    (mgid, 0xC000 | (tenant & 0x3FFF) as u16)
}

/// Datagram QPs joined to a tenant's multicast group.
pub struct VerbsDatagram;

impl DatagramFabric for VerbsDatagram {
    type Device = VerbsDevice;
    type AddressHandle = VerbsAh;
    type RecvHalf = VerbsUdRecv;
    type SendHalf = VerbsUdSend;

    fn open(dev: &VerbsDevice, tenant: u32) -> Result<(VerbsUdRecv, VerbsUdSend)> {
        let ctx = dev.pd.context();
        let send_cq = Cq::new(ctx, CQ_DEPTH as _).map_err(Error::fabric("create UD send CQ"))?;
        let recv_cq = Cq::new(ctx, CQ_DEPTH as _).map_err(Error::fabric("create UD recv CQ"))?;
        let mut qp = Qp::builder()
            .qp_type(QpType::Ud)
            .send_cq(&send_cq)
            .recv_cq(&recv_cq)
            .caps(QpCaps {
                max_send_wr: CQ_DEPTH as _,
                max_recv_wr: CQ_DEPTH as _,
                max_send_sge: 1,
                max_recv_sge: 2,
                ..Default::default()
            })
            .sq_sig_all(true)
            .build(&dev.pd)
            .map_err(Error::fabric("create UD QP"))?;
        qp.bind_local_port(&dev.port, None)
            .map_err(Error::fabric("bind UD QP"))?;
        // Datagrams from other tenants fail the Q_Key check in hardware.
        // SAFETY: all-zero is a valid `ibv_qp_attr`.
        let mut attr: ibv_qp_attr = unsafe { mem::zeroed() };
        attr.qkey = tenant;
        // SAFETY: FFI.
        if unsafe { ibv_modify_qp(qp.as_raw(), &mut attr, ffi::IBV_QP_QKEY) } != 0 {
            return Err(Error::fabric("set Q_Key")(io::Error::last_os_error()));
        }

        let (mgid, mlid) = tenant_group(tenant);
        let gid = ibv_gid { raw: mgid };
        // SAFETY: FFI.
        if unsafe { ffi::ibv_attach_mcast(qp.as_raw(), &gid, mlid) } != 0 {
            return Err(Error::fabric("attach multicast")(io::Error::last_os_error()));
        }
        let flood = VerbsAh::create(&dev.pd, dev.port.num(), mlid, Some(mgid))?;

        // One GRH landing spot per receive the queue can hold.
        let grh = Mapping::anonymous(CQ_DEPTH * GRH_SIZE)?;
        // SAFETY: `grh` is owned by the receive half and outlives its MR.
        let grh_mr = unsafe { Mr::reg(&dev.pd, grh.as_ptr(), grh.len(), Permission::LOCAL_WRITE) }
            .map_err(Error::fabric("register GRH buffer"))?;

        let qp = Arc::new(UdShared {
            qp,
            dev: dev.clone(),
        });
        Ok((
            VerbsUdRecv {
                qp: qp.clone(),
                cq: recv_cq,
                mrs: vec![grh_mr],
                grh,
                grh_next: 0,
                grh_posted: VecDeque::with_capacity(CQ_DEPTH),
                wc: vec![Wc::default(); CQ_POLL_BATCH],
                mgid,
            },
            VerbsUdSend {
                qp,
                cq: send_cq,
                mrs: Vec::new(),
                wc: vec![Wc::default(); CQ_POLL_BATCH],
                tenant,
                flood,
            },
        ))
    }
}

struct UdShared {
    qp: Qp,
    dev: VerbsDevice,
}

/// Receive half of a verbs datagram QP.
///
/// Every receive scatters the 40-byte GRH into a private slot ahead of the
/// guest buffer, so guest buffers only ever see the frame.
pub struct VerbsUdRecv {
    qp: Arc<UdShared>,
    cq: Cq,
    mrs: Vec<Mr>,
    grh: Mapping,
    grh_next: usize,
    /// GRH slots of posted receives, in posting order.
    grh_posted: VecDeque<usize>,
    wc: Vec<Wc>,
    mgid: [u8; 16],
}

// SAFETY: see `VerbsFabric`.
unsafe impl Send for VerbsUdRecv {}

impl CompletionSource for VerbsUdRecv {
    fn poll(&mut self, out: &mut Vec<Completion>) -> Result<usize> {
        let n = self.cq.poll_into(&mut self.wc).map_err(Error::fabric("poll UD recv CQ"))? as usize;
        for wc in &self.wc[..n] {
            // Receive queues complete in posting order.
            let slot = self.grh_posted.pop_front().unwrap_or_default();
            let has_grh = wc.0.wc_flags & ffi::IBV_WC_GRH != 0;
            let gid = has_grh.then(|| {
                let mut gid = [0u8; 16];
                // SAFETY: the slot lies inside the GRH mapping.
                unsafe {
                    ptr::copy_nonoverlapping(
                        self.grh.as_ptr().add(slot * GRH_SIZE + 8),
                        gid.as_mut_ptr(),
                        16,
                    )
                };
                gid
            });
            out.push(Completion {
                wr_id: wc.wr_id(),
                status: wc_status(wc.0.status as u32),
                opcode: WcOpcode::Recv,
                byte_len: wc.0.byte_len.saturating_sub(GRH_SIZE as u32),
                imm: None,
                src: Some(DatagramSource {
                    qpn: wc.0.src_qp,
                    lid: wc.0.slid,
                    gid: gid.filter(|g| *g != self.mgid),
                }),
            });
        }
        Ok(n)
    }

    fn comp_fd(&self) -> Option<RawFd> {
        None
    }

    fn rearm(&mut self) -> Result<()> {
        Ok(())
    }
}

impl DatagramRecv for VerbsUdRecv {
    type AddressHandle = VerbsAh;

    unsafe fn reg_mem(&mut self, addr: *mut u8, len: usize) -> Result<MemKeys> {
        let mr = Mr::reg(&self.qp.dev.pd, addr, len, Permission::LOCAL_WRITE)
            .map_err(Error::fabric("register memory"))?;
        let keys = MemKeys {
            addr: addr as u64,
            len,
            lkey: mr.lkey(),
            rkey: mr.rkey(),
        };
        self.mrs.push(mr);
        Ok(keys)
    }

    fn post_recv(&mut self, wr_id: WrId, sge: Sge) -> Result<()> {
        let slot = self.grh_next;
        self.grh_next = (self.grh_next + 1) % CQ_DEPTH;

        let mut sgl = [
            ibv_sge {
                addr: self.grh.as_ptr() as u64 + (slot * GRH_SIZE) as u64,
                length: GRH_SIZE as _,
                lkey: self.mrs[0].lkey(),
            },
            raw_sge(&sge),
        ];
        let wr = ibv_recv_wr {
            wr_id,
            sg_list: sgl.as_mut_ptr(),
            num_sge: 2,
            // SAFETY: all-zero is a valid `ibv_recv_wr`.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: the work request is correctly constructed.
        unsafe { self.qp.qp.post_raw_recv(&wr) }.map_err(Error::fabric("post UD recv"))?;
        self.grh_posted.push_back(slot);
        Ok(())
    }

    fn make_ah(&mut self, src: &DatagramSource) -> Result<VerbsAh> {
        let dev = &self.qp.dev;
        VerbsAh::create(&dev.pd, dev.port.num(), src.lid, src.gid)
    }
}

/// Send half of a verbs datagram QP.
pub struct VerbsUdSend {
    qp: Arc<UdShared>,
    cq: Cq,
    mrs: Vec<Mr>,
    wc: Vec<Wc>,
    tenant: u32,
    flood: VerbsAh,
}

// SAFETY: see `VerbsFabric`.
unsafe impl Send for VerbsUdSend {}

impl CompletionSource for VerbsUdSend {
    fn poll(&mut self, out: &mut Vec<Completion>) -> Result<usize> {
        poll_cq(&self.cq, &mut self.wc, out)
    }

    fn comp_fd(&self) -> Option<RawFd> {
        None
    }

    fn rearm(&mut self) -> Result<()> {
        Ok(())
    }
}

impl DatagramSend for VerbsUdSend {
    type AddressHandle = VerbsAh;

    unsafe fn reg_mem(&mut self, addr: *mut u8, len: usize) -> Result<MemKeys> {
        let mr = Mr::reg(&self.qp.dev.pd, addr, len, Permission::LOCAL_WRITE)
            .map_err(Error::fabric("register memory"))?;
        let keys = MemKeys {
            addr: addr as u64,
            len,
            lkey: mr.lkey(),
            rkey: mr.rkey(),
        };
        self.mrs.push(mr);
        Ok(keys)
    }

    fn flood(&self) -> (VerbsAh, Qpn) {
        (self.flood.clone(), MULTICAST_QPN)
    }

    fn post_send(&mut self, wr_id: WrId, sge: Sge, ah: &VerbsAh, qpn: Qpn) -> Result<()> {
        let mut sgl = raw_sge(&sge);
        let mut wr = ibv_send_wr {
            wr_id,
            sg_list: &mut sgl,
            num_sge: 1,
            opcode: ibv_wr_opcode::IBV_WR_SEND,
            send_flags: ibv_send_flags::IBV_SEND_SIGNALED.0,
            // SAFETY: all-zero is a valid `ibv_send_wr`.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: `ud` is the member a UD send reads.
        unsafe {
            wr.wr.ud.ah = (ah.0).0;
            wr.wr.ud.remote_qpn = qpn;
            wr.wr.ud.remote_qkey = self.tenant;
        }

        // SAFETY: the work request is correctly constructed and `ah` is alive.
        unsafe { self.qp.qp.post_raw_send(&wr) }.map_err(Error::fabric("post UD send"))
    }
}
