//! The RDMA seam.
//!
//! [`Fabric`] is one reliable connection's worth of verbs resources (PD, CQ,
//! completion channel, RC QP). [`DatagramFabric`] is the unreliable-datagram
//! flavor used by the multicast variant, split into a receive and a send half
//! so RX and TX threads each own the CQ they poll.
//!
//! Two backends exist: [`loopback`], an in-process software fabric, and,
//! with the `verbs` feature, [`verbs`], which drives real hardware through
//! `rrddmma`.

pub mod loopback;
#[cfg(feature = "verbs")]
pub mod verbs;

use std::fmt;
use std::os::fd::RawFd;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::type_alias::*;

/// Where a remote write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTarget {
    pub addr: u64,
    pub rkey: RKey,
}

/// A registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemKeys {
    pub addr: u64,
    pub len: usize,
    pub lkey: LKey,
    pub rkey: RKey,
}

impl MemKeys {
    /// The region as a write target for the peer.
    #[inline]
    pub fn remote(&self) -> RemoteTarget {
        RemoteTarget {
            addr: self.addr,
            rkey: self.rkey,
        }
    }

    /// A scatter-gather element covering `[addr, addr + len)` of this region.
    #[inline]
    pub fn sge(&self, addr: u64, len: u32) -> Sge {
        Sge {
            addr,
            len,
            lkey: self.lkey,
        }
    }
}

/// A local scatter-gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub lkey: LKey,
}

/// Access rights of a memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Local,
    RemoteWrite,
}

/// Connection parameters exchanged at connect/accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParams {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    /// 7 means retry forever.
    pub rnr_retry_count: u8,
    /// Largest frame the initiator writes. The acceptor only grants
    /// receive buffers at least this large.
    pub max_frame: u32,
}

impl ConnParams {
    pub const DEFAULT_MAX_FRAME: u32 = 2048;
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            initiator_depth: 1,
            responder_resources: 1,
            rnr_retry_count: 7,
            max_frame: Self::DEFAULT_MAX_FRAME,
        }
    }
}

/// Work completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    Recv,
    RecvRdmaWithImm,
}

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    #[error("success")]
    Success,

    #[error("local length error")]
    LocalLength,

    #[error("local protection error")]
    LocalProtection,

    #[error("remote access error")]
    RemoteAccess,

    #[error("remote invalid request")]
    RemoteInvalidRequest,

    #[error("transport retry counter exceeded")]
    RetryExceeded,

    #[error("work request flushed")]
    Flushed,

    #[error("status {0}")]
    Other(u32),
}

/// Sender information of an inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramSource {
    pub qpn: Qpn,
    pub lid: u16,

    /// Source GID from the global routing header, present only for
    /// datagrams delivered through a multicast group.
    pub gid: Option<[u8; 16]>,
}

/// A polled work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: WrId,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,

    /// Immediate data in host byte order.
    pub imm: Option<u32>,
    pub src: Option<DatagramSource>,
}

impl Completion {
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Completion-side operations shared by every queue flavor.
pub trait CompletionSource {
    /// Append ready completions to `out`. Returns how many were appended.
    fn poll(&mut self, out: &mut Vec<Completion>) -> Result<usize>;

    /// Descriptor that becomes readable when a completion arrives after
    /// [`rearm`](Self::rearm). `None` if the backend can only be polled.
    fn comp_fd(&self) -> Option<RawFd>;

    /// Consume the pending channel event and request the next one.
    fn rearm(&mut self) -> Result<()>;
}

/// One reliable connection's verbs resources.
///
/// Unlike a classic verbs wrapper, every fallible call returns a `Result`;
/// the engines decide whether a failure aborts or tears down one session.
pub trait Fabric: CompletionSource + Sized + Send + 'static {
    /// The device the resources are created on.
    type Device: Clone + Send + 'static;

    /// Connection information sent to the peer.
    /// Must not contain any data dependent on local resources.
    type Endpoint: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + 'static;

    /// Allocate a PD, a CQ with a completion channel, and an RC QP.
    fn open(dev: &Self::Device) -> Result<Self>;

    fn endpoint(&self) -> Self::Endpoint;

    /// Bring the QP to ready-to-send against `peer`.
    fn connect(&mut self, peer: &Self::Endpoint, params: &ConnParams) -> Result<()>;

    /// Register memory for local access, and for remote writes if asked.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must stay valid until `self` is dropped.
    unsafe fn reg_mem(&mut self, addr: *mut u8, len: usize, access: Access) -> Result<MemKeys>;

    /// Post a receive; `None` posts a zero-length receive that can only
    /// absorb a write-with-immediate.
    fn post_recv(&mut self, wr_id: WrId, sge: Option<Sge>) -> Result<()>;

    fn post_send(&mut self, wr_id: WrId, sge: Sge) -> Result<()>;

    /// RDMA write with immediate. `imm` is in host byte order.
    fn post_write_imm(
        &mut self,
        wr_id: WrId,
        sge: Sge,
        remote: RemoteTarget,
        imm: u32,
    ) -> Result<()>;
}

/// Receive half of a datagram queue pair.
pub trait DatagramRecv: CompletionSource + Send + 'static {
    type AddressHandle: Clone + fmt::Debug + Send + 'static;

    /// # Safety
    ///
    /// Same contract as [`Fabric::reg_mem`].
    unsafe fn reg_mem(&mut self, addr: *mut u8, len: usize) -> Result<MemKeys>;

    fn post_recv(&mut self, wr_id: WrId, sge: Sge) -> Result<()>;

    /// Build an address handle that reaches the sender of a datagram.
    fn make_ah(&mut self, src: &DatagramSource) -> Result<Self::AddressHandle>;
}

/// Send half of a datagram queue pair.
pub trait DatagramSend: CompletionSource + Send + 'static {
    type AddressHandle: Clone + fmt::Debug + Send + 'static;

    /// # Safety
    ///
    /// Same contract as [`Fabric::reg_mem`].
    unsafe fn reg_mem(&mut self, addr: *mut u8, len: usize) -> Result<MemKeys>;

    /// Address handle and QPN that reach every member of the tenant's group.
    fn flood(&self) -> (Self::AddressHandle, Qpn);

    fn post_send(&mut self, wr_id: WrId, sge: Sge, ah: &Self::AddressHandle, qpn: Qpn)
        -> Result<()>;
}

/// A datagram queue pair that joins a tenant's multicast group.
pub trait DatagramFabric: 'static {
    type Device: Clone + Send + 'static;
    type AddressHandle: Clone + fmt::Debug + Send + 'static;
    type RecvHalf: DatagramRecv<AddressHandle = Self::AddressHandle>;
    type SendHalf: DatagramSend<AddressHandle = Self::AddressHandle>;

    /// Create the QP, attach it to `tenant`'s group and use `tenant` as the
    /// Q_Key.
    fn open(dev: &Self::Device, tenant: u32) -> Result<(Self::RecvHalf, Self::SendHalf)>;
}
