use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fabric::ConnParams;
use crate::type_alias::*;
use crate::util::fd::EventFd;

/// Why a connection did not come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("no such engine at the peer")]
    NoSuchEngine,

    #[error("refused by the peer")]
    Refused,

    #[error("address could not be resolved")]
    Unreachable,

    #[error("timed out")]
    Timeout,
}

/// Where a remote connection lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub addr: SocketAddr,
    pub engine: EngineId,
    pub conn: ConnId,
}

/// Details of a [`CmMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum CmDetails {
    /// A remote initiator wants to connect to a local engine.
    ConnectRequest {
        endpoint: Vec<u8>,
        params: ConnParams,
    },

    /// Positive response to a `ConnectRequest`.
    ConnectAccept { endpoint: Vec<u8> },

    /// Negative response to a `ConnectRequest`.
    ConnectReject { reason: RejectReason },

    /// The initiator's QP is up; the acceptor may start.
    Ready,

    /// The peer is going away.
    Disconnect,
}

/// A connection-manager datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CmMessage {
    pub(crate) src_engine: EngineId,
    pub(crate) dst_engine: EngineId,
    pub(crate) src_conn: ConnId,
    pub(crate) dst_conn: ConnId,
    pub(crate) details: CmDetails,
}

/// Connection-manager events, as seen by a session.
#[derive(Debug, Clone)]
pub enum CmEvent {
    /// The initiator's target address is known.
    AddrResolved { conn: ConnId, addr: SocketAddr },

    /// The initiator may now connect.
    RouteResolved { conn: ConnId },

    /// A remote initiator asks to connect. No local connection exists yet.
    ConnectRequest {
        peer: PeerRef,
        endpoint: Vec<u8>,
        params: ConnParams,
    },

    /// The connection is up. Initiators receive the acceptor's endpoint.
    Established {
        conn: ConnId,
        peer: PeerRef,
        endpoint: Option<Vec<u8>>,
    },

    Rejected {
        conn: ConnId,
        reason: RejectReason,
    },

    Disconnected { conn: ConnId },
}

impl CmEvent {
    /// Short name for logs and transition errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddrResolved { .. } => "ADDR_RESOLVED",
            Self::RouteResolved { .. } => "ROUTE_RESOLVED",
            Self::ConnectRequest { .. } => "CONNECT_REQUEST",
            Self::Established { .. } => "ESTABLISHED",
            Self::Rejected { .. } => "REJECTED",
            Self::Disconnected { .. } => "DISCONNECTED",
        }
    }

    /// The local connection the event is for, if one exists.
    pub fn conn(&self) -> Option<ConnId> {
        match *self {
            Self::AddrResolved { conn, .. }
            | Self::RouteResolved { conn }
            | Self::Established { conn, .. }
            | Self::Rejected { conn, .. }
            | Self::Disconnected { conn } => Some(conn),
            Self::ConnectRequest { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Channel {
    queue: SegQueue<CmEvent>,
    wake: EventFd,
}

/// Event sender.
#[derive(Clone)]
pub(crate) struct CmEventTx(Arc<Channel>);

impl CmEventTx {
    /// Send an event and wake the receiving engine.
    pub(crate) fn send(&self, event: CmEvent) {
        self.0.queue.push(event);
        if let Err(e) = self.0.wake.signal() {
            log::warn!("Nexus: failed to wake engine: {}", e);
        }
    }
}

/// Event receiver, readable through [`AsRawFd`] whenever events are queued.
#[derive(Debug)]
pub struct CmEventRx(Arc<Channel>);

impl CmEventRx {
    /// Receive an event.
    pub fn recv(&self) -> Option<CmEvent> {
        self.0.queue.pop()
    }

    /// Clear the wake descriptor. Call before draining with [`recv`](Self::recv).
    pub fn clear_wake(&self) -> io::Result<()> {
        self.0.wake.drain().map(|_| ())
    }

    /// Returns `true` if there is no event in the queue.
    pub fn is_empty(&self) -> bool {
        self.0.queue.is_empty()
    }
}

impl AsRawFd for CmEventRx {
    fn as_raw_fd(&self) -> RawFd {
        self.0.wake.as_raw_fd()
    }
}

/// Create a pair of event sender and receiver.
pub(crate) fn cm_event_channel() -> io::Result<(CmEventTx, CmEventRx)> {
    let chan = Arc::new(Channel {
        queue: SegQueue::new(),
        wake: EventFd::new()?,
    });
    Ok((CmEventTx(chan.clone()), CmEventRx(chan)))
}
