//! One RDMA connection: its state machine, resources and credits.
//!
//! Sessions never talk to the network on their own. Engines feed them
//! connection-manager events and work completions; sessions answer through
//! the [`Nexus`] and return what the engine has to do with guest buffers.

mod context;

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rmp_serde as rmps;

pub use self::context::{RdmaContext, MAX_INFLIGHT};
use self::context::WrKind;
use crate::arena::GuestMemory;
use crate::credit::*;
use crate::error::{Error, Result};
use crate::fabric::*;
use crate::nexus::{CmEvent, Nexus, PeerRef};
use crate::ring::{Desc, RING_SIZE};
use crate::type_alias::*;

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects out and writes TX buffers to the peer.
    Initiator,

    /// Accepts connections and receives writes into guest memory.
    Acceptor,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    AddrResolving,
    RouteResolving,
    Connecting,
    Accepting,
    Established,
    Disconnected,
}

/// What the engine passes into CM event handling.
pub struct CmEnv<'a, F: Fabric> {
    pub nexus: &'a Nexus,
    pub dev: &'a F::Device,
    pub connect_timeout: Duration,
}

/// Result of handing a TX buffer to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A write is in flight.
    Posted,

    /// Kept on the deferred list until the connection can write.
    Deferred,

    /// No credit: the buffer goes back to the guest unsent.
    Dropped(Desc),
}

/// What a work completion meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completed {
    /// A TX buffer was written to the peer and can go back to the guest.
    Sent(Desc),

    /// The peer granted credits; deferred sends may proceed.
    Credited,

    /// The peer wrote a frame into a granted buffer. `assign` is set if the
    /// peer should be granted more slots.
    Received {
        desc: Desc,
        assign: Option<AssignRequest>,
    },

    /// A control message left; the next one may be sent.
    CtrlSent,
}

/// Guest buffers a torn-down session hands back, each with zero size.
#[derive(Debug, Default)]
pub struct Released {
    /// For `tx_used`: deferred and in-flight TX buffers.
    pub tx: Vec<Desc>,

    /// For `rx`: receive buffers granted to the peer but never written, or
    /// written past their end.
    pub rx: Vec<Desc>,
}

/// An RDMA session to one peer.
pub struct RdmaSession<F: Fabric> {
    engine: EngineId,
    conn: ConnId,
    role: Role,
    state: ConnState,
    params: ConnParams,
    guest: GuestMemory,

    /// Remote engine this initiator connects to, and its resolved address.
    remote_engine: EngineId,
    remote_addr: Option<SocketAddr>,

    /// Connection-manager address of the peer once known.
    peer: Option<PeerRef>,

    ctx: Option<RdmaContext<F>>,

    /// Sender credits.
    credits: SlotCreditPool,

    /// Receiver grants, shared with the slot assigner.
    ledger: Arc<SlotLedger>,

    /// TX buffers waiting for the connection to become writable.
    deferred: VecDeque<Desc>,

    /// Control messages waiting for the previous one to be sent.
    ctrl_backlog: VecDeque<ControlMessage>,

    /// Consumed slots whose write overran them; never delivered.
    spoiled: Vec<Desc>,
}

impl<F: Fabric> RdmaSession<F> {
    /// Deferred buffers kept at most; beyond this TX buffers are dropped.
    pub const DEFERRED_LIMIT: usize = RING_SIZE;

    fn new(
        engine: EngineId,
        conn: ConnId,
        role: Role,
        params: ConnParams,
        guest: &GuestMemory,
    ) -> Self {
        Self {
            engine,
            conn,
            role,
            state: ConnState::Idle,
            params,
            guest: guest.clone(),
            remote_engine: 0,
            remote_addr: None,
            peer: None,
            ctx: None,
            credits: SlotCreditPool::new(),
            ledger: Arc::new(SlotLedger::default()),
            deferred: VecDeque::new(),
            ctrl_backlog: VecDeque::new(),
            spoiled: Vec::new(),
        }
    }

    /// Create an idle initiator session targeting engine `remote_engine`.
    pub fn initiator(
        engine: EngineId,
        conn: ConnId,
        remote_engine: EngineId,
        params: ConnParams,
        guest: &GuestMemory,
    ) -> Self {
        let mut this = Self::new(engine, conn, Role::Initiator, params, guest);
        this.remote_engine = remote_engine;
        this
    }

    /// Create an acceptor session answering a connect request.
    ///
    /// Builds the context, connects the QP to the initiator, pre-posts
    /// receives for incoming writes and accepts. The caller should refuse
    /// the request if this fails.
    pub fn accept(
        engine: EngineId,
        conn: ConnId,
        peer: PeerRef,
        endpoint: &[u8],
        params: ConnParams,
        guest: &GuestMemory,
        env: &CmEnv<'_, F>,
    ) -> Result<Self> {
        let mut this = Self::new(engine, conn, Role::Acceptor, params, guest);
        let remote_ep: F::Endpoint =
            rmps::from_slice(endpoint).map_err(|e| Error::Endpoint(e.to_string()))?;

        let mut ctx = RdmaContext::<F>::acceptor(env.dev, guest)?;
        ctx.fabric.connect(&remote_ep, &params)?;
        ctx.post_data_recvs(MAX_INFLIGHT)?;
        let local_ep = encode_endpoint(&ctx.fabric.endpoint())?;
        this.ctx = Some(ctx);

        env.nexus
            .accept(engine, conn, &peer, local_ep, env.connect_timeout)?;
        this.peer = Some(peer);
        this.state = ConnState::Accepting;
        Ok(this)
    }

    #[inline]
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        self.state == ConnState::Established
    }

    #[inline]
    pub fn peer(&self) -> Option<&PeerRef> {
        self.peer.as_ref()
    }

    #[inline]
    pub fn context(&self) -> Option<&RdmaContext<F>> {
        self.ctx.as_ref()
    }

    #[inline]
    pub(crate) fn context_mut(&mut self) -> Option<&mut RdmaContext<F>> {
        self.ctx.as_mut()
    }

    /// Receiver grants, to be filled by the slot assigner.
    #[inline]
    pub fn ledger(&self) -> &Arc<SlotLedger> {
        &self.ledger
    }

    #[inline]
    pub fn credits(&self) -> &SlotCreditPool {
        &self.credits
    }

    #[inline]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    fn bad_transition(&self, event: &'static str) -> Error {
        Error::BadTransition {
            conn: self.conn,
            state: self.state,
            event,
        }
    }

    fn ctx_mut(&mut self) -> Result<&mut RdmaContext<F>> {
        let (conn, state) = (self.conn, self.state);
        self.ctx.as_mut().ok_or(Error::BadTransition {
            conn,
            state,
            event: "fabric access",
        })
    }
}

/// Connection management.
impl<F: Fabric> RdmaSession<F> {
    /// Start connecting to the nexus at `uri`.
    pub fn connect(&mut self, nexus: &Nexus, uri: impl ToSocketAddrs) -> Result<()> {
        if self.role != Role::Initiator || self.state != ConnState::Idle {
            return Err(self.bad_transition("connect"));
        }
        self.state = ConnState::AddrResolving;
        nexus.resolve_addr(self.engine, self.conn, uri);
        Ok(())
    }

    /// Advance the state machine on a CM event addressed to this session.
    pub fn on_cm_event(&mut self, event: CmEvent, env: &CmEnv<'_, F>) -> Result<()> {
        log::trace!(
            "session {}.{}: {} in state {:?}",
            self.engine,
            self.conn,
            event.name(),
            self.state
        );

        match (self.state, event) {
            (ConnState::AddrResolving, CmEvent::AddrResolved { addr, .. }) => {
                self.ctx = Some(RdmaContext::initiator(env.dev, &self.guest)?);
                self.remote_addr = Some(addr);
                self.state = ConnState::RouteResolving;
                env.nexus.resolve_route(self.engine, self.conn);
            }
            (ConnState::RouteResolving, CmEvent::RouteResolved { .. }) => {
                let Some(addr) = self.remote_addr else {
                    return Err(self.bad_transition("ROUTE_RESOLVED"));
                };
                let local_ep = encode_endpoint(&self.ctx_mut()?.fabric.endpoint())?;
                env.nexus.connect(
                    self.engine,
                    self.conn,
                    addr,
                    self.remote_engine,
                    local_ep,
                    self.params,
                    env.connect_timeout,
                )?;
                self.state = ConnState::Connecting;
            }
            (
                ConnState::Connecting,
                CmEvent::Established {
                    peer,
                    endpoint: Some(endpoint),
                    ..
                },
            ) => {
                let remote_ep: F::Endpoint =
                    rmps::from_slice(&endpoint).map_err(|e| Error::Endpoint(e.to_string()))?;
                let params = self.params;
                self.ctx_mut()?.fabric.connect(&remote_ep, &params)?;
                env.nexus.ready(self.engine, self.conn, &peer)?;
                self.peer = Some(peer);
                self.state = ConnState::Established;
                log::info!(
                    "session {}.{}: connected to {}.{} at {}",
                    self.engine,
                    self.conn,
                    peer.engine,
                    peer.conn,
                    peer.addr
                );
            }
            (ConnState::Accepting, CmEvent::Established { endpoint: None, .. }) => {
                self.state = ConnState::Established;
                log::info!("session {}.{}: accepted", self.engine, self.conn);
            }
            (_, CmEvent::Rejected { reason, .. }) => {
                // An acceptor that timed out may face an initiator that
                // thinks the connection is up.
                if self.role == Role::Acceptor {
                    let peer = self.peer.as_ref();
                    if let Err(e) = env.nexus.disconnect(self.engine, self.conn, peer) {
                        log::warn!(
                            "session {}.{}: failed to notify peer of timeout: {}",
                            self.engine,
                            self.conn,
                            e
                        );
                    }
                }
                self.state = ConnState::Disconnected;
                return Err(Error::Rejected {
                    conn: self.conn,
                    reason,
                });
            }
            (_, CmEvent::Disconnected { .. }) => {
                log::info!("session {}.{}: peer disconnected", self.engine, self.conn);
                self.state = ConnState::Disconnected;
            }
            (_, event) => return Err(self.bad_transition(event.name())),
        }
        Ok(())
    }

    /// Release every resource and hand back the guest buffers the session
    /// still holds. Tells the peer unless it already went away.
    pub fn teardown(&mut self, nexus: &Nexus) -> Released {
        let notify = self.state != ConnState::Disconnected;
        self.state = ConnState::Disconnected;
        if let Err(e) = nexus.disconnect(
            self.engine,
            self.conn,
            self.peer.as_ref().filter(|_| notify),
        ) {
            log::warn!(
                "session {}.{}: failed to notify peer of disconnect: {}",
                self.engine,
                self.conn,
                e
            );
        }

        let mut released = Released::default();
        if let Some(mut ctx) = self.ctx.take() {
            released.tx.extend(ctx.take_inflight());
        }
        released.tx.extend(self.deferred.drain(..));
        released.rx.append(&mut self.spoiled);
        released.rx.extend(self.ledger.revoke_all());
        self.ctrl_backlog.clear();

        for desc in released.tx.iter_mut().chain(released.rx.iter_mut()) {
            desc.size = 0;
        }
        released
    }
}

/// Data path.
impl<F: Fabric> RdmaSession<F> {
    /// Whether writes can be posted right now.
    #[inline]
    fn is_writable(&self) -> bool {
        self.is_established()
            && self
                .ctx
                .as_ref()
                .is_some_and(|ctx| ctx.free_inflight().is_some())
    }

    /// Try writing one buffer. Gives it back if it cannot be written now.
    fn try_write(&mut self, desc: Desc) -> Result<std::result::Result<(), (Desc, NoCredit)>> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Ok(Err((desc, NoCredit::PeerNotReady)));
        };
        let Some(index) = ctx.free_inflight() else {
            return Ok(Err((desc, NoCredit::PeerNotReady)));
        };
        match self.credits.try_reserve() {
            Ok(target) => {
                ctx.post_write(index, desc, target)?;
                Ok(Ok(()))
            }
            Err(why) => Ok(Err((desc, why))),
        }
    }

    fn defer(&mut self, desc: Desc) -> SendOutcome {
        if self.deferred.len() >= Self::DEFERRED_LIMIT {
            return SendOutcome::Dropped(desc);
        }
        self.deferred.push_back(desc);
        SendOutcome::Deferred
    }

    /// Write a TX buffer to the peer.
    ///
    /// Buffers that arrive before the connection can write are deferred and
    /// go out in submission order. Once credits flow, running out of them
    /// drops the buffer.
    pub fn send(&mut self, desc: Desc) -> Result<SendOutcome> {
        if self.role != Role::Initiator {
            return Err(self.bad_transition("send"));
        }
        if self.guest.addr_of(desc.data_ptr, desc.size).is_none() {
            log::warn!(
                "session {}.{}: dropping descriptor outside guest memory: {:?}",
                self.engine,
                self.conn,
                desc
            );
            return Ok(SendOutcome::Dropped(desc));
        }
        if desc.size > self.params.max_frame {
            log::warn!(
                "session {}.{}: dropping {}-byte frame, larger than {}",
                self.engine,
                self.conn,
                desc.size,
                self.params.max_frame
            );
            return Ok(SendOutcome::Dropped(desc));
        }
        if !self.deferred.is_empty() || !self.is_writable() {
            return Ok(self.defer(desc));
        }

        match self.try_write(desc)? {
            Ok(()) => Ok(SendOutcome::Posted),
            Err((desc, NoCredit::PeerNotReady)) => Ok(self.defer(desc)),
            Err((desc, NoCredit::Exhausted)) => Ok(SendOutcome::Dropped(desc)),
        }
    }

    /// Post deferred buffers in order, as far as credits allow.
    /// Returns how many were posted.
    pub fn flush_deferred(&mut self) -> Result<usize> {
        let mut n = 0;
        while self.is_writable() {
            let Some(desc) = self.deferred.pop_front() else {
                break;
            };
            if let Err((desc, _)) = self.try_write(desc)? {
                self.deferred.push_front(desc);
                break;
            }
            n += 1;
        }
        Ok(n)
    }

    /// Queue a control message for the peer, sending it right away if no
    /// other one is outstanding.
    pub fn send_control(&mut self, msg: ControlMessage) -> Result<()> {
        let ctx = self.ctx_mut()?;
        if ctx.is_ctrl_send_busy() {
            self.ctrl_backlog.push_back(msg);
            return Ok(());
        }
        ctx.post_ctrl_send(&msg)
    }

    /// Handle one work completion of this session's CQ.
    pub fn on_completion(&mut self, wc: &Completion) -> Result<Option<Completed>> {
        if !wc.is_ok() {
            return Err(Error::Completion {
                wr_id: wc.wr_id,
                status: wc.status,
            });
        }
        let Some((kind, index)) = WrKind::parse(wc.wr_id) else {
            log::warn!(
                "session {}.{}: ignoring completion with unknown wr_id {:#x}",
                self.engine,
                self.conn,
                wc.wr_id
            );
            return Ok(None);
        };

        let completed = match kind {
            WrKind::Write => match self.ctx_mut()?.complete_write(index) {
                Some(desc) => Completed::Sent(desc),
                None => {
                    log::warn!(
                        "session {}.{}: ignoring completion of unknown write {}",
                        self.engine,
                        self.conn,
                        index
                    );
                    return Ok(None);
                }
            },
            WrKind::CtrlRecv => {
                let ctx = self.ctx_mut()?;
                let msg = ctx.received_ctrl()?;
                ctx.post_ctrl_recv()?;
                let remain = self.credits.apply(&msg)?;
                log::debug!(
                    "session {}.{}: received {:?}, {} slots remain",
                    self.engine,
                    self.conn,
                    msg.kind,
                    remain
                );
                Completed::Credited
            }
            WrKind::DataRecv => {
                let size = wc.imm.unwrap_or(wc.byte_len);
                let (slot, assign) = self.ledger.consume()?;
                self.ctx_mut()?.repost_data_recv(index)?;
                if size > slot.size {
                    self.spoiled.push(slot);
                    return Err(Error::Overrun {
                        conn: self.conn,
                        size,
                        capacity: slot.size,
                    });
                }
                Completed::Received {
                    desc: Desc { size, ..slot },
                    assign,
                }
            }
            WrKind::CtrlSend => {
                let next = self.ctrl_backlog.pop_front();
                let ctx = self.ctx_mut()?;
                ctx.ctrl_send_done();
                if let Some(msg) = next {
                    ctx.post_ctrl_send(&msg)?;
                }
                Completed::CtrlSent
            }
        };
        Ok(Some(completed))
    }
}

fn encode_endpoint<E: serde::Serialize>(ep: &E) -> Result<Vec<u8>> {
    rmps::to_vec(ep).map_err(|e| Error::Endpoint(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    type F = crate::fabric::loopback::LoopbackFabric;

    fn guest() -> GuestMemory {
        crate::arena::BufArena::new(4, 64).unwrap().guest_memory()
    }

    #[test]
    fn send_before_connect_is_deferred_in_order() {
        let mut sess = RdmaSession::<F>::initiator(1, 0, 0, ConnParams::default(), &guest());
        for i in 0..3 {
            assert_eq!(
                sess.send(Desc::new(i, i * 64, 64)).unwrap(),
                SendOutcome::Deferred
            );
        }
        assert_eq!(sess.deferred_len(), 3);
        assert_eq!(sess.flush_deferred().unwrap(), 0);
    }

    #[test]
    fn descriptor_outside_guest_memory_is_dropped() {
        let gm = guest();
        let mut sess = RdmaSession::<F>::initiator(1, 0, 0, ConnParams::default(), &gm);
        let bad = Desc::new(9, gm.len() as u64 - 8, 64);
        assert_eq!(sess.send(bad).unwrap(), SendOutcome::Dropped(bad));
        assert_eq!(sess.deferred_len(), 0);
    }

    #[test]
    fn frame_above_max_is_dropped() {
        let params = ConnParams {
            max_frame: 32,
            ..ConnParams::default()
        };
        let mut sess = RdmaSession::<F>::initiator(1, 0, 0, params, &guest());
        let big = Desc::new(0, 0, 64);
        assert_eq!(sess.send(big).unwrap(), SendOutcome::Dropped(big));
        assert_eq!(sess.send(Desc::new(1, 64, 32)).unwrap(), SendOutcome::Deferred);
    }

    #[test]
    fn acceptor_cannot_send() {
        let mut sess = RdmaSession::<F>::new(1, 0, Role::Acceptor, ConnParams::default(), &guest());
        assert!(matches!(
            sess.send(Desc::default()),
            Err(Error::BadTransition { .. })
        ));
    }
}
