//! The TX engine: drains `tx` into RDMA writes and recycles sent buffers
//! through `tx_used`.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::moderation::{Moderator, Tick};
use super::*;
use crate::error::Error;
use crate::fabric::{Completion, ConnParams};
use crate::nexus::{CmEvent, CmEventRx, RejectReason};
use crate::ring::flag::{Consumer, Producer};
use crate::ring::Desc;
use crate::session::{CmEnv, Completed, ConnState, SendOutcome};
use crate::util::affinity;

pub(crate) struct TxEngine<F: Fabric> {
    nexus: Arc<Nexus>,
    cm_rx: CmEventRx,
    dev: F::Device,
    region: Arc<RegionMap<SharedRegion>>,
    guest: GuestMemory,
    notifiers: Notifiers,
    peer: Option<PeerTarget>,
    config: Config,
    stats: Arc<EngineStats>,
    stop: Arc<AtomicBool>,

    tx: Consumer,
    tx_used: Producer,
    sessions: SessionTable<F>,

    /// The session frames currently go to.
    active: Option<ConnId>,
    moderator: Moderator,
    reactor: Reactor,
    wcs: Vec<Completion>,
}

impl<F: Fabric> TxEngine<F> {
    const NAME: &'static str = "TX engine";

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nexus: Arc<Nexus>,
        dev: F::Device,
        region: Arc<RegionMap<SharedRegion>>,
        guest: GuestMemory,
        notifiers: Notifiers,
        peer: Option<PeerTarget>,
        config: Config,
        stats: Arc<EngineStats>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let cm_rx = nexus.register_event_channel(TX_ENGINE)?;
        let reactor = Reactor::new()?;
        reactor.watch(cm_rx.as_raw_fd(), token::CM)?;
        reactor.watch(notifiers.tx_doorbell.as_raw_fd(), token::DOORBELL)?;

        Ok(Self {
            nexus,
            cm_rx,
            dev,
            region,
            guest,
            notifiers,
            peer,
            moderator: Moderator::new(config.poll_retry),
            config,
            stats,
            stop,
            tx: Consumer::new(),
            tx_used: Producer::new(),
            sessions: SessionTable::new(),
            active: None,
            reactor,
            wcs: Vec::new(),
        })
    }

    /// Give a buffer back to the guest.
    fn release(&mut self, desc: Desc) {
        match self.tx_used.produce(&self.region.tx_used, desc) {
            Ok(true) => Notifiers::raise(Self::NAME, &self.notifiers.tx_used_irq),
            Ok(false) => (),
            Err(_) => {
                EngineStats::bump(&self.stats.tx_dropped_ring_full, 1);
                log::warn!("{}: tx_used full, leaking buffer {}", Self::NAME, desc.handle);
            }
        }
    }

    /// Start a session to the configured peer.
    fn start_session(&mut self) -> Option<ConnId> {
        let peer = self.peer?;
        let conn = self.sessions.vacant();
        let mut sess = RdmaSession::<F>::initiator(
            TX_ENGINE,
            conn,
            peer.engine,
            ConnParams {
                max_frame: self.config.max_frame,
                ..ConnParams::default()
            },
            &self.guest,
        );
        if let Err(e) = sess.connect(&self.nexus, peer.uri) {
            log::error!("{}: failed to start connecting to {}: {}", Self::NAME, peer.uri, e);
            return None;
        }
        log::debug!("{}: connecting to engine {} at {}", Self::NAME, peer.engine, peer.uri);
        self.sessions.insert(sess);
        self.active = Some(conn);
        Some(conn)
    }

    /// Route one TX buffer.
    fn dispatch(&mut self, desc: Desc) {
        let active = match self.active {
            Some(conn) => Some(conn),
            None => self.start_session(),
        };
        let Some(conn) = active else {
            EngineStats::bump(&self.stats.tx_dropped_no_credit, 1);
            self.release(Desc { size: 0, ..desc });
            return;
        };
        let outcome = match self.sessions.get_mut(conn) {
            Some(slot) => slot.sess.send(desc),
            None => return self.release(Desc { size: 0, ..desc }),
        };
        match outcome {
            Ok(SendOutcome::Posted) | Ok(SendOutcome::Deferred) => (),
            Ok(SendOutcome::Dropped(desc)) => {
                EngineStats::bump(&self.stats.tx_dropped_no_credit, 1);
                self.release(Desc { size: 0, ..desc });
            }
            Err(e) => {
                self.release(Desc { size: 0, ..desc });
                self.fail(conn, e);
            }
        }
    }

    /// Take up to one budget of frames from `tx`. Returns how many.
    fn poll_ring(&mut self) -> usize {
        let mut n = 0;
        while n < self.config.tx_budget {
            let Some(desc) = self.tx.consume(&self.region.tx) else {
                break;
            };
            self.dispatch(desc);
            n += 1;
        }
        n
    }

    fn on_doorbell(&mut self) -> io::Result<()> {
        self.notifiers.tx_doorbell.drain()?;
        if self.moderator.on_doorbell() {
            self.reactor.arm_timer(self.config.poll_interval)?;
        }
        self.poll_ring();
        Ok(())
    }

    fn on_tick(&mut self) -> io::Result<()> {
        self.reactor.drain_timer()?;
        for conn in self.polled_conns() {
            self.process_completions(conn);
        }
        if !self.moderator.is_polling() {
            return Ok(());
        }

        let found = self.poll_ring() > 0;
        if self.moderator.on_tick(found) == Tick::Stop {
            if self.tx.park(&self.region.tx) {
                log::trace!("{}: ring idle, back to doorbells", Self::NAME);
                if !self.sessions.needs_polling() {
                    self.reactor.disarm_timer()?;
                }
            } else {
                self.moderator.resume();
            }
        }
        Ok(())
    }

    /// Connections whose completions are only seen by polling.
    fn polled_conns(&mut self) -> Vec<ConnId> {
        let mut out = Vec::new();
        for conn in self.sessions.conns() {
            if let Some(slot) = self.sessions.get_mut(conn) {
                if slot.watched.is_none() && slot.sess.context().is_some() {
                    out.push(conn);
                }
            }
        }
        out
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

        let mut credited = false;
        let wcs = std::mem::take(&mut self.wcs);
        for wc in &wcs {
            let Some(slot) = self.sessions.get_mut(conn) else {
                break;
            };
            match slot.sess.on_completion(wc) {
                Ok(Some(Completed::Sent(desc))) => {
                    EngineStats::bump(&self.stats.tx_sent, 1);
                    self.release(desc);
                    credited = true;
                }
                Ok(Some(Completed::Credited)) => credited = true,
                Ok(Some(other)) => {
                    log::debug!("{}: ignoring unexpected completion {:?}", Self::NAME, other)
                }
                Ok(None) => (),
                Err(e) => {
                    self.fail(conn, e);
                    break;
                }
            }
        }
        self.wcs = wcs;

        if credited {
            self.flush(conn);
        }
    }

    fn flush(&mut self, conn: ConnId) {
        let Some(slot) = self.sessions.get_mut(conn) else {
            return;
        };
        match slot.sess.flush_deferred() {
            Ok(0) => (),
            Ok(n) => log::trace!("{}: flushed {} deferred frames", Self::NAME, n),
            Err(e) => self.fail(conn, e),
        }
    }

    fn process_cm_events(&mut self) {
        if let Err(e) = self.cm_rx.clear_wake() {
            log::warn!("{}: failed to clear CM wake: {}", Self::NAME, e);
        }
        while let Some(event) = self.cm_rx.recv() {
            if let CmEvent::ConnectRequest { peer, .. } = event {
                log::debug!("{}: refusing connect request from {}", Self::NAME, peer.addr);
                if let Err(e) = self.nexus.reject(TX_ENGINE, &peer, RejectReason::Refused) {
                    log::warn!("{}: failed to refuse {}: {}", Self::NAME, peer.addr, e);
                }
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
            let res = slot.sess.on_cm_event(event, &env);
            let res = res.and_then(|_| {
                watch_completions(&self.reactor, slot).map_err(Error::from)
            });
            let (established, disconnected) = (
                slot.sess.is_established(),
                slot.sess.state() == ConnState::Disconnected,
            );

            match res {
                Err(e) => self.fail(conn, e),
                Ok(()) if disconnected => self.teardown(conn),
                Ok(()) => {
                    // Arms the completion channel of a fresh context.
                    self.process_completions(conn);
                    if established {
                        self.flush(conn);
                    }
                }
            }
        }
    }

    /// Route a session error through the failure policy. A refused connect
    /// is not a failure; the next frame tries again.
    fn fail(&mut self, conn: ConnId, err: Error) {
        if let Error::Rejected { reason, .. } = err {
            log::warn!("{}: connection {} rejected: {}", Self::NAME, conn, reason);
            return self.teardown(conn);
        }
        EngineStats::bump(&self.stats.sessions_failed, 1);
        self.config.failure_policy.handle(Self::NAME, conn, &err);
        self.teardown(conn);
    }

    fn teardown(&mut self, conn: ConnId) {
        let Some(mut slot) = self.sessions.remove(conn) else {
            return;
        };
        if let Some(fd) = slot.watched.take() {
            if let Err(e) = self.reactor.unwatch(fd) {
                log::warn!("{}: failed to unwatch connection {}: {}", Self::NAME, conn, e);
            }
        }
        let released = slot.sess.teardown(&self.nexus);
        if !released.tx.is_empty() {
            log::debug!(
                "{}: returning {} unsent buffers of connection {}",
                Self::NAME,
                released.tx.len(),
                conn
            );
        }
        for desc in released.tx {
            self.release(desc);
        }
        if self.active == Some(conn) {
            self.active = None;
        }
    }

    pub fn run(mut self, cpu: Option<usize>) {
        affinity::pin_if_configured(Self::NAME, cpu);

        // Frames may have been queued before the engine started.
        self.poll_ring();

        let mut ready = Vec::new();
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.reactor.wait(&mut ready) {
                log::error!("{}: epoll_wait failed: {}", Self::NAME, e);
                break;
            }
            for &t in &ready {
                let res = match t {
                    token::CM => {
                        self.process_cm_events();
                        Ok(())
                    }
                    token::DOORBELL => self.on_doorbell(),
                    token::TIMER => self.on_tick(),
                    t if t >= token::COMP_BASE => {
                        self.process_completions((t - token::COMP_BASE) as ConnId);
                        Ok(())
                    }
                    t => {
                        log::debug!("{}: ignoring unknown token {}", Self::NAME, t);
                        Ok(())
                    }
                };
                if let Err(e) = res {
                    log::error!("{}: {}", Self::NAME, e);
                }
            }

            if self.sessions.needs_polling() {
                if let Err(e) = self.reactor.arm_timer(self.config.poll_interval) {
                    log::error!("{}: failed to arm timer: {}", Self::NAME, e);
                }
            }
        }

        for conn in self.sessions.conns() {
            self.teardown(conn);
        }
        self.nexus.destroy_event_channel(TX_ENGINE);
        log::debug!("{}: stopped", Self::NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::BufArena;
    use crate::fabric::loopback::{LoopbackFabric, LoopbackHub};

    /// Test that the engine polls without doorbells during a burst and hands
    /// back to doorbells after `poll_retry` idle ticks.
    #[test]
    fn idle_ticks_hand_back_to_doorbells() {
        let nexus = Nexus::new("127.0.0.1:0").unwrap();
        let region = Arc::new(RegionMap::<SharedRegion>::anonymous().unwrap());
        let arena = BufArena::new(8, 2048).unwrap();
        let notifiers = Notifiers::new().unwrap();
        let mut engine = TxEngine::<LoopbackFabric>::new(
            nexus,
            LoopbackHub::new(),
            region.clone(),
            arena.guest_memory(),
            notifiers.clone(),
            None,
            Config {
                poll_retry: 3,
                ..Config::default()
            },
            Arc::new(EngineStats::default()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        let mut guest = Producer::new();
        let mut used = Consumer::new();

        assert_eq!(guest.produce(&region.tx, Desc::new(0, 0, 64)), Ok(true));
        notifiers.tx_doorbell.signal().unwrap();
        engine.on_doorbell().unwrap();
        assert!(engine.reactor.timer_armed());
        assert!(!region.tx.is_notify_armed());
        assert_eq!(used.consume(&region.tx_used).map(|d| d.handle), Some(0));

        // Mid-burst frames ring no doorbell and are picked up by the timer.
        assert_eq!(guest.produce(&region.tx, Desc::new(1, 2048, 64)), Ok(false));
        engine.on_tick().unwrap();
        assert_eq!(used.consume(&region.tx_used).map(|d| d.handle), Some(1));

        for _ in 0..3 {
            assert!(engine.reactor.timer_armed());
            engine.on_tick().unwrap();
        }
        assert!(!engine.reactor.timer_armed());
        assert!(region.tx.is_notify_armed());

        // Exactly one doorbell for the next burst.
        assert_eq!(guest.produce(&region.tx, Desc::new(2, 4096, 64)), Ok(true));
        assert_eq!(guest.produce(&region.tx, Desc::new(3, 6144, 64)), Ok(false));
    }
}
