//! Ethernet over shared memory, carried between hosts by RDMA.
//!
//! A guest and its host share a region of descriptor rings. The guest posts
//! frames on `tx` and free receive buffers on `rx_avail`; the host writes
//! each frame straight into a peer guest's receive buffer with an RDMA write,
//! paced by per-connection slot credits, and hands arrived frames back on
//! `rx`. A two-ring variant sends frames as unreliable datagrams through a
//! per-tenant multicast group, learning unicast routes from ARP traffic.

mod arena;
mod config;
mod credit;
mod engine;
mod error;
pub mod fabric;
mod fdb;
mod nexus;
mod region;
pub mod ring;
mod session;
pub mod type_alias;
mod util;

pub use self::arena::{BufArena, BufHandle, GuestMemory};
pub use self::config::Config;
pub use self::credit::{
    AssignRequest, ControlMessage, CreditPolicy, MsgKind, NoCredit, SlotCreditPool, SlotLedger,
    SLOT_CAPACITY,
};
pub use self::engine::moderation::{IrqCoalescer, Moderator, Tick};
pub use self::engine::{
    DatagramHost, EngineStats, Host, Notifiers, PeerTarget, StatsSnapshot, RX_ENGINE, TX_ENGINE,
};
pub use self::error::{Error, FailurePolicy, Result};
pub use self::fdb::{
    dst_mac, ethertype, fdb_hint_channel, hash_mac, src_mac, FdbHint, FdbHintReceiver,
    FdbHintSender, ForwardEntry, ForwardingTable, ETHERTYPE_ARP, HINT_CAPACITY,
};
pub use self::nexus::{CmEvent, CmEventRx, Nexus, PeerRef, RejectReason};
pub use self::region::{DuplexRegion, RegionMap, RingSet, SharedRegion};
pub use self::session::{
    CmEnv, Completed, ConnState, RdmaContext, RdmaSession, Released, Role, SendOutcome,
    MAX_INFLIGHT,
};
pub use self::util::fd::EventFd;

#[cfg(test)]
mod tests;
