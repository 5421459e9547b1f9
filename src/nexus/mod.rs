//! Connection management over UDP.
//!
//! Every host runs one [`Nexus`]. Engines register an event channel under
//! their [`EngineId`] and drive connection setup through it; the nexus turns
//! those calls into datagrams to the peer's nexus and turns datagrams from
//! peers into [`CmEvent`]s on the addressed engine's channel.
//!
//! ```text
//!   initiator                              acceptor
//!   resolve_addr   -> AddrResolved
//!   resolve_route  -> RouteResolved
//!   connect        ------ ConnectRequest ----->  ConnectRequest
//!   Established    <----- ConnectAccept -------  accept
//!   ready          ------ Ready -------------->  Established
//! ```

mod event;

use std::io::{self, ErrorKind as IoErrorKind};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{atomic::*, Arc};
use std::thread;
use std::time::Duration;

use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quanta::Upkeep;
use rmp_serde as rmps;

pub use self::event::{CmEvent, CmEventRx, PeerRef, RejectReason};
pub(crate) use self::event::{cm_event_channel, CmDetails, CmEventTx, CmMessage};
use crate::error::{Error, Result};
use crate::fabric::ConnParams;
use crate::type_alias::*;

/// Connection-manager part of [`Nexus`].
struct NexusCm {
    uri: SocketAddr,
    socket: UdpSocket,
    cm_evt_tx: DashMap<EngineId, CmEventTx, RandomState>,

    /// Handshakes waiting on the peer and when they expire: connect requests
    /// awaiting an accept, and accepts awaiting `Ready`.
    pending: DashMap<(EngineId, ConnId), quanta::Instant, RandomState>,
    cm_should_stop: AtomicBool,
}

impl NexusCm {
    fn send_to(&self, addr: SocketAddr, msg: &CmMessage) -> Result<()> {
        let buf = rmps::to_vec(msg).map_err(|e| Error::Endpoint(e.to_string()))?;
        self.socket.send_to(&buf, addr)?;
        Ok(())
    }

    fn deliver(&self, engine: EngineId, event: CmEvent) {
        match self.cm_evt_tx.get(&engine) {
            Some(tx) => tx.send(event),
            None => log::debug!(
                "Nexus CM: dropping {} to non-existent engine {}",
                event.name(),
                engine
            ),
        }
    }

    /// Reject handshakes the peer did not finish in time.
    fn expire(&self) {
        let now = quanta::Instant::recent();
        let expired = self
            .pending
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| *e.key())
            .collect::<Vec<_>>();

        for (engine, conn) in expired {
            if self.pending.remove(&(engine, conn)).is_some() {
                log::info!("Nexus CM: connection {}.{} timed out", engine, conn);
                self.deliver(
                    engine,
                    CmEvent::Rejected {
                        conn,
                        reason: RejectReason::Timeout,
                    },
                );
            }
        }
    }

    fn handle(&self, msg: CmMessage, src: SocketAddr) {
        let peer = PeerRef {
            addr: src,
            engine: msg.src_engine,
            conn: msg.src_conn,
        };
        let (engine, conn) = (msg.dst_engine, msg.dst_conn);

        let event = match msg.details {
            CmDetails::ConnectRequest { endpoint, params } => {
                if !self.cm_evt_tx.contains_key(&engine) {
                    log::debug!("Nexus CM: refusing connection to non-existent engine {}", engine);
                    let reply = CmMessage {
                        src_engine: engine,
                        dst_engine: peer.engine,
                        src_conn: ConnId::MAX,
                        dst_conn: peer.conn,
                        details: CmDetails::ConnectReject {
                            reason: RejectReason::NoSuchEngine,
                        },
                    };
                    if let Err(e) = self.send_to(src, &reply) {
                        log::warn!("Nexus CM: failed to refuse {}: {}", src, e);
                    }
                    return;
                }
                CmEvent::ConnectRequest {
                    peer,
                    endpoint,
                    params,
                }
            }
            CmDetails::ConnectAccept { endpoint } => {
                if self.pending.remove(&(engine, conn)).is_none() {
                    // The acceptor already built its side; make it tear down.
                    log::debug!("Nexus CM: closing late accept for {}.{}", engine, conn);
                    self.close_late(engine, conn, &peer);
                    return;
                }
                CmEvent::Established {
                    conn,
                    peer,
                    endpoint: Some(endpoint),
                }
            }
            CmDetails::ConnectReject { reason } => {
                if self.pending.remove(&(engine, conn)).is_none() {
                    log::debug!("Nexus CM: ignoring late reject for {}.{}", engine, conn);
                    return;
                }
                CmEvent::Rejected { conn, reason }
            }
            CmDetails::Ready => {
                if self.pending.remove(&(engine, conn)).is_none() {
                    log::debug!("Nexus CM: closing late ready for {}.{}", engine, conn);
                    self.close_late(engine, conn, &peer);
                    return;
                }
                CmEvent::Established {
                    conn,
                    peer,
                    endpoint: None,
                }
            }
            CmDetails::Disconnect => {
                self.pending.remove(&(engine, conn));
                CmEvent::Disconnected { conn }
            }
        };
        self.deliver(engine, event);
    }

    /// Tell `peer` that local connection `conn` is gone.
    fn close_late(&self, engine: EngineId, conn: ConnId, peer: &PeerRef) {
        let msg = CmMessage {
            src_engine: engine,
            dst_engine: peer.engine,
            src_conn: conn,
            dst_conn: peer.conn,
            details: CmDetails::Disconnect,
        };
        if let Err(e) = self.send_to(peer.addr, &msg) {
            log::warn!(
                "Nexus CM: failed to close {}.{} at {}: {}",
                peer.engine,
                peer.conn,
                peer.addr,
                e
            );
        }
    }

    /// Listen on the given socket for CM messages.
    fn listen(self: Arc<Self>, socket: UdpSocket) {
        const MSG_SIZE_LIMIT: usize = 4 << 10; // 4 KiB
        let mut buf = [0u8; MSG_SIZE_LIMIT];
        while !self.cm_should_stop.load(Ordering::Relaxed) {
            self.expire();
            let (amt, src) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(ref e)
                    if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) =>
                {
                    continue
                }
                Err(e) => {
                    log::error!("Nexus CM: failed to receive UDP packet: {}", e);
                    break;
                }
            };
            let Ok(msg) = rmps::from_slice::<CmMessage>(&buf[..amt]) else {
                // UDP is unreliable, so we just ignore the packet if it is malformed.
                log::debug!("Nexus CM: ignoring malformed message from {}", src);
                continue;
            };
            self.handle(msg, src);
        }
    }
}

/// A per-host connection manager.
///
/// # Background threads
///
/// On creation, the `Nexus` launches a connection-management thread and a
/// [`quanta::Upkeep`] thread. The former exchanges CM messages with peers,
/// and the latter provides the coarse clock used for connect timeouts.
///
/// If the `Upkeep` thread fails to start due to an existing one, the `Nexus`
/// will still be created and shares that clock.
pub struct Nexus {
    cm: Arc<NexusCm>,
    cm_thread: Option<thread::JoinHandle<()>>,
    _upkeeper: Option<quanta::Handle>,
}

impl Nexus {
    /// Create a new Nexus listening on the port of `uri`.
    pub fn new(uri: impl ToSocketAddrs) -> io::Result<Arc<Self>> {
        let uri = uri.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(IoErrorKind::AddrNotAvailable, "no such local URI")
        })?;

        // Bind to 0.0.0.0 or ::0, depending on the type of `uri`.
        let unspecified = match uri {
            SocketAddr::V4(_) => "0.0.0.0",
            SocketAddr::V6(_) => "::0",
        };
        let socket = UdpSocket::bind((unspecified, uri.port()))?;

        const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(100);
        socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;

        let cm = Arc::new(NexusCm {
            uri,
            socket: socket.try_clone()?,
            cm_evt_tx: DashMap::with_capacity_and_hasher(16, RandomState::new()),
            pending: DashMap::with_capacity_and_hasher(256, RandomState::new()),
            cm_should_stop: AtomicBool::new(false),
        });
        let cm_listener = {
            let cm = cm.clone();
            thread::Builder::new()
                .name("nexus-cm".into())
                .spawn(move || cm.listen(socket))?
        };

        const UPKEEP_INTERVAL: Duration = Duration::from_millis(1);
        let upkeeper = match Upkeep::new(UPKEEP_INTERVAL).start() {
            Ok(handle) => Some(handle),
            Err(quanta::Error::FailedToSpawnUpkeepThread(e)) => return Err(e),
            Err(_) => None,
        };

        Ok(Arc::new(Self {
            cm,
            cm_thread: Some(cm_listener),
            _upkeeper: upkeeper,
        }))
    }

    /// Get the URI that this Nexus is listening on.
    #[inline]
    pub fn uri(&self) -> SocketAddr {
        self.cm.uri
    }

    /// Create an event channel for the given engine.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if the engine ID is taken.
    pub(crate) fn register_event_channel(&self, engine: EngineId) -> io::Result<CmEventRx> {
        match self.cm.cm_evt_tx.entry(engine) {
            Entry::Occupied(_) => Err(io::Error::new(
                IoErrorKind::AlreadyExists,
                format!("engine {} registered twice", engine),
            )),
            Entry::Vacant(slot) => {
                let (tx, rx) = cm_event_channel()?;
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Destroy the event channel for the given engine.
    pub(crate) fn destroy_event_channel(&self, engine: EngineId) {
        self.cm.cm_evt_tx.remove(&engine);
    }
}

impl Nexus {
    /// Resolve the address of a remote nexus. Completes with
    /// [`CmEvent::AddrResolved`], or [`CmEvent::Rejected`] if nothing resolves.
    pub fn resolve_addr(&self, engine: EngineId, conn: ConnId, uri: impl ToSocketAddrs) {
        let event = match uri.to_socket_addrs().map(|mut it| it.next()) {
            Ok(Some(addr)) => CmEvent::AddrResolved { conn, addr },
            Ok(None) | Err(_) => CmEvent::Rejected {
                conn,
                reason: RejectReason::Unreachable,
            },
        };
        self.cm.deliver(engine, event);
    }

    /// Resolve the route to a resolved address. Completes with
    /// [`CmEvent::RouteResolved`].
    pub fn resolve_route(&self, engine: EngineId, conn: ConnId) {
        self.cm.deliver(engine, CmEvent::RouteResolved { conn });
    }

    /// Ask engine `dst_engine` at `dst` to accept a connection.
    ///
    /// Completes with [`CmEvent::Established`], or with [`CmEvent::Rejected`]
    /// if the peer refuses or does not answer within `timeout`.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &self,
        engine: EngineId,
        conn: ConnId,
        dst: SocketAddr,
        dst_engine: EngineId,
        endpoint: Vec<u8>,
        params: ConnParams,
        timeout: Duration,
    ) -> Result<()> {
        self.cm
            .pending
            .insert((engine, conn), quanta::Instant::recent() + timeout);
        let msg = CmMessage {
            src_engine: engine,
            dst_engine,
            src_conn: conn,
            dst_conn: ConnId::MAX,
            details: CmDetails::ConnectRequest { endpoint, params },
        };
        self.cm.send_to(dst, &msg).inspect_err(|_| {
            self.cm.pending.remove(&(engine, conn));
        })
    }

    /// Accept a connection request from `peer` as local connection `conn`.
    ///
    /// Completes with [`CmEvent::Established`] once the initiator is ready,
    /// or with [`CmEvent::Rejected`] if it is not within `timeout`.
    pub fn accept(
        &self,
        engine: EngineId,
        conn: ConnId,
        peer: &PeerRef,
        endpoint: Vec<u8>,
        timeout: Duration,
    ) -> Result<()> {
        self.cm
            .pending
            .insert((engine, conn), quanta::Instant::recent() + timeout);
        self.reply(engine, conn, peer, CmDetails::ConnectAccept { endpoint })
            .inspect_err(|_| {
                self.cm.pending.remove(&(engine, conn));
            })
    }

    /// Refuse a connection request from `peer`.
    pub fn reject(&self, engine: EngineId, peer: &PeerRef, reason: RejectReason) -> Result<()> {
        self.reply(
            engine,
            ConnId::MAX,
            peer,
            CmDetails::ConnectReject { reason },
        )
    }

    /// Tell the acceptor that the initiator's side is up.
    pub fn ready(&self, engine: EngineId, conn: ConnId, peer: &PeerRef) -> Result<()> {
        self.reply(engine, conn, peer, CmDetails::Ready)
    }

    /// Forget local connection `conn` and tell the peer, if any.
    pub fn disconnect(&self, engine: EngineId, conn: ConnId, peer: Option<&PeerRef>) -> Result<()> {
        self.cm.pending.remove(&(engine, conn));
        match peer {
            Some(peer) => self.reply(engine, conn, peer, CmDetails::Disconnect),
            None => Ok(()),
        }
    }

    fn reply(
        &self,
        engine: EngineId,
        conn: ConnId,
        peer: &PeerRef,
        details: CmDetails,
    ) -> Result<()> {
        let msg = CmMessage {
            src_engine: engine,
            dst_engine: peer.engine,
            src_conn: conn,
            dst_conn: peer.conn,
            details,
        };
        self.cm.send_to(peer.addr, &msg)
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        self.cm.cm_should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.cm_thread.take() {
            if handle.join().is_err() {
                log::error!("Nexus CM: listener thread panicked");
            }
        }
    }
}
