use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fabric::WcStatus;
use crate::nexus::RejectReason;
use crate::ring::SlotState;
use crate::session::ConnState;
use crate::type_alias::*;

/// Errors raised by the transport.
///
/// Running out of ring slots or slot credits is flow control, not an error:
/// those paths drop the frame and bump a counter instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A fabric verb (QP creation, memory registration, post, poll) failed.
    #[error("{op} failed: {source}")]
    Fabric {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A work completion reported a non-success status.
    #[error("work request {wr_id:#x} completed with {status}")]
    Completion { wr_id: WrId, status: WcStatus },

    /// A ring slot was found in a state its owner never put it in.
    #[error("ring slot {index} expected {expected:?}, found raw state {found}")]
    Protocol {
        index: usize,
        expected: SlotState,
        found: u32,
    },

    /// A control message failed to decode or arrived out of order.
    #[error("malformed control message: {0}")]
    ControlMsg(&'static str),

    /// The peer wrote more than the receive buffer behind its slot holds.
    #[error("connection {conn}: {size}-byte write into a {capacity}-byte slot")]
    Overrun {
        conn: ConnId,
        size: u32,
        capacity: u32,
    },

    /// A connection-manager event does not apply to the session's state.
    #[error("connection {conn}: {event} is invalid in state {state:?}")]
    BadTransition {
        conn: ConnId,
        state: ConnState,
        event: &'static str,
    },

    /// The peer refused the connection, or it never answered.
    #[error("connection {conn} rejected: {reason}")]
    Rejected { conn: ConnId, reason: RejectReason },

    /// A peer endpoint could not be encoded or decoded.
    #[error("bad endpoint: {0}")]
    Endpoint(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wrap an I/O error coming from the fabric backend.
    #[inline]
    pub(crate) fn fabric(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Fabric { op, source }
    }
}

/// Shorthand result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// What an engine does when a session reports an [`Error`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Log and abort the whole process.
    Abort,

    /// Log, tear down the failing session, and keep serving the others.
    #[default]
    TearDownSession,
}

impl FailurePolicy {
    /// Report `err` raised by connection `conn` of engine `who`.
    ///
    /// Returns only if the session should be torn down.
    pub fn handle(self, who: &str, conn: ConnId, err: &Error) {
        match self {
            Self::Abort => {
                log::error!("{}: connection {} failed: {}; aborting", who, conn, err);
                std::process::abort();
            }
            Self::TearDownSession => {
                log::error!(
                    "{}: connection {} failed: {}; tearing it down",
                    who,
                    conn,
                    err
                );
            }
        }
    }
}
