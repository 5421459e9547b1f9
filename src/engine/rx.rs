//! The RX engine: accepts connections, delivers written frames to `rx`, and
//! sends the slot grants the assigner prepares.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::assign::{AssignCmd, AssignReply};
use super::*;
use crate::error::Error;
use crate::fabric::{Completion, ConnParams};
use crate::nexus::{CmEvent, CmEventRx, PeerRef, RejectReason};
use crate::ring::flag::Producer;
use crate::ring::Desc;
use crate::session::{CmEnv, Completed, ConnState};
use crate::util::affinity;

pub(crate) struct RxEngine<F: Fabric> {
    nexus: Arc<Nexus>,
    cm_rx: CmEventRx,
    dev: F::Device,
    region: Arc<RegionMap<SharedRegion>>,
    guest: GuestMemory,
    notifiers: Notifiers,
    assign_tx: MailboxTx<AssignCmd>,
    replies: MailboxRx<AssignReply>,
    config: Config,
    stats: Arc<EngineStats>,
    stop: Arc<AtomicBool>,

    rx: Producer,
    sessions: SessionTable<F>,
    reactor: Reactor,
    wcs: Vec<Completion>,
}

impl<F: Fabric> RxEngine<F> {
    const NAME: &'static str = "RX engine";

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nexus: Arc<Nexus>,
        dev: F::Device,
        region: Arc<RegionMap<SharedRegion>>,
        guest: GuestMemory,
        notifiers: Notifiers,
        assign_tx: MailboxTx<AssignCmd>,
        replies: MailboxRx<AssignReply>,
        config: Config,
        stats: Arc<EngineStats>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let cm_rx = nexus.register_event_channel(RX_ENGINE)?;
        let reactor = Reactor::new()?;
        reactor.watch(cm_rx.as_raw_fd(), token::CM)?;
        reactor.watch(replies.as_raw_fd(), token::WAKE)?;

        Ok(Self {
            nexus,
            cm_rx,
            dev,
            region,
            guest,
            notifiers,
            assign_tx,
            replies,
            config,
            stats,
            stop,
            rx: Producer::new(),
            sessions: SessionTable::new(),
            reactor,
            wcs: Vec::new(),
        })
    }

    /// Hand a buffer to the guest.
    fn deliver(&mut self, desc: Desc) {
        match self.rx.produce(&self.region.rx, desc) {
            Ok(true) => Notifiers::raise(Self::NAME, &self.notifiers.rx_irq),
            Ok(false) => (),
            Err(_) => {
                EngineStats::bump(&self.stats.rx_dropped_ring_full, 1);
                log::warn!("{}: rx full, dropping frame in buffer {}", Self::NAME, desc.handle);
            }
        }
    }

    fn accept(&mut self, peer: PeerRef, endpoint: Vec<u8>, params: ConnParams) {
        if params.max_frame > self.config.max_frame {
            log::warn!(
                "{}: refusing {}: frames up to {} bytes exceed the local {}",
                Self::NAME,
                peer.addr,
                params.max_frame,
                self.config.max_frame
            );
            if let Err(e) = self.nexus.reject(RX_ENGINE, &peer, RejectReason::Refused) {
                log::warn!("{}: failed to refuse {}: {}", Self::NAME, peer.addr, e);
            }
            return;
        }
        let conn = self.sessions.vacant();
        let env = CmEnv {
            nexus: &self.nexus,
            dev: &self.dev,
            connect_timeout: self.config.connect_timeout,
        };
        let sess = RdmaSession::<F>::accept(
            RX_ENGINE,
            conn,
            peer,
            &endpoint,
            params,
            &self.guest,
            &env,
        );
        match sess {
            Ok(sess) => {
                log::debug!("{}: accepting {} as connection {}", Self::NAME, peer.addr, conn);
                self.sessions.insert(sess);
                let watched = match self.sessions.get_mut(conn) {
                    Some(slot) => watch_completions(&self.reactor, slot),
                    None => Ok(()),
                };
                match watched {
                    Ok(()) => self.process_completions(conn),
                    Err(e) => self.fail(conn, e.into()),
                }
            }
            Err(e) => {
                log::warn!("{}: refusing {}: {}", Self::NAME, peer.addr, e);
                if let Err(e) = self.nexus.reject(RX_ENGINE, &peer, RejectReason::Refused) {
                    log::warn!("{}: failed to refuse {}: {}", Self::NAME, peer.addr, e);
                }
            }
        }
    }

    fn process_cm_events(&mut self) {
        if let Err(e) = self.cm_rx.clear_wake() {
            log::warn!("{}: failed to clear CM wake: {}", Self::NAME, e);
        }
        while let Some(event) = self.cm_rx.recv() {
            if let CmEvent::ConnectRequest {
                peer,
                endpoint,
                params,
            } = event
            {
                self.accept(peer, endpoint, params);
                continue;
            }
            let Some(conn) = event.conn() else {
                continue;
            };
            let Some(slot) = self.sessions.get_mut(conn) else {
                log::debug!(
                    "{}: ignoring {} for non-existent connection {}",
                    Self::NAME,
                    event.name(),
                    conn
                );
                continue;
            };

            let env = CmEnv {
                nexus: &self.nexus,
                dev: &self.dev,
                connect_timeout: self.config.connect_timeout,
            };
            let was_established = slot.sess.is_established();
            let res = slot.sess.on_cm_event(event, &env);
            let state = slot.sess.state();
            let attach = slot.sess.context().map(|ctx| ctx.guest_region());
            let ledger = slot.sess.ledger().clone();

            match res {
                Err(Error::Rejected { reason, .. }) => {
                    log::warn!("{}: connection {} abandoned: {}", Self::NAME, conn, reason);
                    self.teardown(conn);
                }
                Err(e) => self.fail(conn, e),
                Ok(()) if state == ConnState::Disconnected => self.teardown(conn),
                Ok(()) if state == ConnState::Established && !was_established => {
                    if let Some(region) = attach {
                        self.assign_tx.send(AssignCmd::Attach {
                            conn,
                            ledger,
                            region,
                        });
                    }
                }
                Ok(()) => (),
            }
        }
    }

    fn process_replies(&mut self) {
        self.replies.clear_wake();
        while let Some(reply) = self.replies.try_recv() {
            match reply {
                AssignReply::Granted {
                    conn,
                    ledger,
                    msg,
                    bufs,
                } => {
                    // The id may have been reused by a newer connection.
                    let sent = match self.sessions.get_mut(conn) {
                        Some(slot)
                            if Arc::ptr_eq(slot.sess.ledger(), &ledger)
                                && slot.sess.is_established() =>
                        {
                            Some(slot.sess.send_control(msg))
                        }
                        _ => None,
                    };
                    match sent {
                        Some(Ok(())) => EngineStats::bump(&self.stats.assign_sent, 1),
                        Some(Err(e)) => self.fail(conn, e),
                        None => {
                            // Teardown already returned these through `revoke_all`.
                            log::debug!(
                                "{}: dropping {} slots granted to closed connection {}",
                                Self::NAME,
                                bufs.len(),
                                conn
                            );
                        }
                    }
                }
                AssignReply::Returned { bufs } => {
                    for desc in bufs {
                        self.deliver(Desc { size: 0, ..desc });
                    }
                }
            }
        }
    }

    fn process_completions(&mut self, conn: ConnId) {
        let Some(slot) = self.sessions.get_mut(conn) else {
            return;
        };
        let Some(ctx) = slot.sess.context_mut() else {
            return;
        };

        self.wcs.clear();
        let polled = ctx
            .fabric
            .rearm()
            .and_then(|_| ctx.fabric.poll(&mut self.wcs));
        if let Err(e) = polled {
            return self.fail(conn, e);
        }

        let wcs = std::mem::take(&mut self.wcs);
        for wc in &wcs {
            let Some(slot) = self.sessions.get_mut(conn) else {
                break;
            };
            match slot.sess.on_completion(wc) {
                Ok(Some(Completed::Received { desc, assign })) => {
                    EngineStats::bump(&self.stats.rx_delivered, 1);
                    self.deliver(desc);
                    if let Some(req) = assign {
                        self.assign_tx.send(AssignCmd::Assign {
                            conn,
                            count: req.count,
                        });
                    }
                }
                Ok(Some(Completed::CtrlSent)) | Ok(None) => (),
                Ok(Some(other)) => {
                    log::debug!("{}: ignoring unexpected completion {:?}", Self::NAME, other)
                }
                Err(e) => {
                    self.fail(conn, e);
                    break;
                }
            }
        }
        self.wcs = wcs;
    }

    fn fail(&mut self, conn: ConnId, err: Error) {
        EngineStats::bump(&self.stats.sessions_failed, 1);
        self.config.failure_policy.handle(Self::NAME, conn, &err);
        self.teardown(conn);
    }

    fn teardown(&mut self, conn: ConnId) {
        let Some(mut slot) = self.sessions.remove(conn) else {
            return;
        };
        self.assign_tx.send(AssignCmd::Detach { conn });
        if let Some(fd) = slot.watched.take() {
            if let Err(e) = self.reactor.unwatch(fd) {
                log::warn!("{}: failed to unwatch connection {}: {}", Self::NAME, conn, e);
            }
        }
        let released = slot.sess.teardown(&self.nexus);
        for desc in released.rx {
            self.deliver(desc);
        }
        log::debug!("{}: connection {} closed", Self::NAME, conn);
    }

    pub fn run(mut self, cpu: Option<usize>) {
        affinity::pin_if_configured(Self::NAME, cpu);

        let mut ready = Vec::new();
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.reactor.wait(&mut ready) {
                log::error!("{}: epoll_wait failed: {}", Self::NAME, e);
                break;
            }
            for &t in &ready {
                match t {
                    token::CM => self.process_cm_events(),
                    token::WAKE => self.process_replies(),
                    token::TIMER => {
                        if let Err(e) = self.reactor.drain_timer() {
                            log::warn!("{}: failed to clear timer: {}", Self::NAME, e);
                        }
                        for conn in self.sessions.conns() {
                            let polled = self
                                .sessions
                                .get_mut(conn)
                                .is_some_and(|s| s.watched.is_none());
                            if polled {
                                self.process_completions(conn);
                            }
                        }
                    }
                    t if t >= token::COMP_BASE => {
                        self.process_completions((t - token::COMP_BASE) as ConnId)
                    }
                    t => log::debug!("{}: ignoring unknown token {}", Self::NAME, t),
                }
            }

            let res = if self.sessions.needs_polling() {
                self.reactor.arm_timer(self.config.poll_interval)
            } else {
                self.reactor.disarm_timer()
            };
            if let Err(e) = res {
                log::error!("{}: failed to set timer: {}", Self::NAME, e);
            }
        }

        for conn in self.sessions.conns() {
            self.teardown(conn);
        }
        self.nexus.destroy_event_channel(RX_ENGINE);
        log::debug!("{}: stopped", Self::NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::BufArena;
    use crate::credit::SlotLedger;
    use crate::fabric::loopback::{LoopbackFabric, LoopbackHub};
    use crate::fabric::RemoteTarget;
    use crate::ring::flag::Consumer;

    /// Test that a grant arriving after teardown does not hand its buffers
    /// back a second time.
    #[test]
    fn late_grant_is_dropped_after_teardown() {
        let nexus = Nexus::new("127.0.0.1:0").unwrap();
        let region = Arc::new(RegionMap::<SharedRegion>::anonymous().unwrap());
        let arena = BufArena::new(8, 2048).unwrap();
        let (assign_tx, _assign_rx) = mailbox().unwrap();
        let (reply_tx, reply_rx) = mailbox().unwrap();
        let mut engine = RxEngine::<LoopbackFabric>::new(
            nexus,
            LoopbackHub::new(),
            region.clone(),
            arena.guest_memory(),
            Notifiers::new().unwrap(),
            assign_tx,
            reply_rx,
            Config::default(),
            Arc::new(EngineStats::default()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let ledger = Arc::new(SlotLedger::default());
        let bufs: Vec<_> = (0..4).map(|i| Desc::new(i, i * 2048, 2048)).collect();
        let msg = ledger
            .grant(
                &bufs,
                RemoteTarget {
                    addr: 0x10_0000,
                    rkey: 5,
                },
            )
            .unwrap();

        // Teardown of connection 0 returns what its ledger holds.
        for desc in ledger.revoke_all() {
            engine.deliver(desc);
        }
        reply_tx.send(AssignReply::Granted {
            conn: 0,
            ledger,
            msg,
            bufs,
        });
        engine.process_replies();

        let mut guest = Consumer::new();
        let mut handles = Vec::new();
        while let Some(d) = guest.consume(&region.rx) {
            assert_eq!(d.size, 0);
            handles.push(d.handle);
        }
        assert_eq!(handles, [0, 1, 2, 3]);
    }
}
