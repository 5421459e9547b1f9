//! Host-side engines.
//!
//! A host runs three threads over one [`SharedRegion`]: the TX engine drives
//! initiator sessions from the `tx` ring, the RX engine serves acceptor
//! sessions into the `rx` ring, and the slot assigner turns `rx_avail`
//! buffers into credit grants. The two-ring variant runs a pair of datagram
//! threads instead. Every thread blocks only in `epoll_wait`.

mod assign;
mod datagram;
pub mod moderation;
mod rx;
mod tx;

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

pub use self::datagram::DatagramHost;
use self::assign::SlotAssigner;
use self::rx::RxEngine;
use self::tx::TxEngine;
use crate::arena::GuestMemory;
use crate::config::Config;
use crate::fabric::Fabric;
use crate::nexus::Nexus;
use crate::region::{RegionMap, SharedRegion};
use crate::session::RdmaSession;
use crate::type_alias::*;
use crate::util::fd::{Epoll, EventFd, TimerFd};

/// Engine ID of the RX engine on every host.
pub const RX_ENGINE: EngineId = 0;

/// Engine ID of the TX engine on every host.
pub const TX_ENGINE: EngineId = 1;

/// Epoll tokens shared by all engine loops.
pub(crate) mod token {
    pub const CM: u64 = 0;
    pub const DOORBELL: u64 = 1;
    pub const TIMER: u64 = 2;
    pub const WAKE: u64 = 3;

    /// Completion channel of connection `conn` is `COMP_BASE + conn`.
    pub const COMP_BASE: u64 = 16;
}

/// How long a loop blocks before it checks its stop flag.
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Counters kept by the engines of one host.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub tx_sent: AtomicU64,
    pub tx_dropped_no_credit: AtomicU64,
    pub tx_dropped_ring_full: AtomicU64,
    pub rx_delivered: AtomicU64,
    pub rx_dropped_ring_full: AtomicU64,
    pub assign_sent: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub fdb_hints: AtomicU64,
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_sent: u64,
    pub tx_dropped_no_credit: u64,
    pub tx_dropped_ring_full: u64,
    pub rx_delivered: u64,
    pub rx_dropped_ring_full: u64,
    pub assign_sent: u64,
    pub sessions_failed: u64,
    pub fdb_hints: u64,
}

impl EngineStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            tx_sent: get(&self.tx_sent),
            tx_dropped_no_credit: get(&self.tx_dropped_no_credit),
            tx_dropped_ring_full: get(&self.tx_dropped_ring_full),
            rx_delivered: get(&self.rx_delivered),
            rx_dropped_ring_full: get(&self.rx_dropped_ring_full),
            assign_sent: get(&self.assign_sent),
            sessions_failed: get(&self.sessions_failed),
            fdb_hints: get(&self.fdb_hints),
        }
    }
}

/// Notifications crossing the guest/host boundary.
///
/// The guest signals the doorbells when a produce or submit says the host
/// asked for one; the host signals the interrupts the same way. Clones share
/// the descriptors.
#[derive(Debug, Clone)]
pub struct Notifiers {
    /// Guest → host: `tx` has new frames.
    pub tx_doorbell: Arc<EventFd>,

    /// Guest → host: empty receive buffers were made available, on
    /// `rx_avail` or, in the two-ring variant, on `rx`.
    pub rx_avail_doorbell: Arc<EventFd>,

    /// Host → guest: received frames are ready.
    pub rx_irq: Arc<EventFd>,

    /// Host → guest: sent buffers can be recycled.
    pub tx_used_irq: Arc<EventFd>,
}

impl Notifiers {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            tx_doorbell: Arc::new(EventFd::new()?),
            rx_avail_doorbell: Arc::new(EventFd::new()?),
            rx_irq: Arc::new(EventFd::new()?),
            tx_used_irq: Arc::new(EventFd::new()?),
        })
    }

    /// Raise an interrupt, logging instead of failing.
    pub(crate) fn raise(who: &str, irq: &EventFd) {
        if let Err(e) = irq.signal() {
            log::warn!("{}: failed to raise interrupt: {}", who, e);
        }
    }
}

/// The remote RX engine the TX engine connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTarget {
    /// Connection-manager address of the peer host.
    pub uri: SocketAddr,
    pub engine: EngineId,
}

/// Unbounded channel of owned messages with a wake descriptor, so the
/// receiving thread can sleep in `epoll_wait`.
pub(crate) struct MailboxTx<T> {
    tx: Sender<T>,
    wake: Arc<EventFd>,
}

impl<T> Clone for MailboxTx<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<T> MailboxTx<T> {
    /// Returns `false` if the receiving thread is gone.
    pub fn send(&self, msg: T) -> bool {
        if self.tx.send(msg).is_err() {
            return false;
        }
        if let Err(e) = self.wake.signal() {
            log::warn!("mailbox: failed to wake receiver: {}", e);
        }
        true
    }
}

pub(crate) struct MailboxRx<T> {
    rx: Receiver<T>,
    wake: Arc<EventFd>,
}

impl<T> MailboxRx<T> {
    /// Clear the wake descriptor. Call before draining.
    pub fn clear_wake(&self) {
        if let Err(e) = self.wake.drain() {
            log::warn!("mailbox: failed to clear wake descriptor: {}", e);
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> AsRawFd for MailboxRx<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }
}

pub(crate) fn mailbox<T>() -> io::Result<(MailboxTx<T>, MailboxRx<T>)> {
    let (tx, rx) = channel::unbounded();
    let wake = Arc::new(EventFd::new()?);
    Ok((
        MailboxTx {
            tx,
            wake: wake.clone(),
        },
        MailboxRx { rx, wake },
    ))
}

/// The descriptors an engine loop blocks on, plus its moderation timer.
pub(crate) struct Reactor {
    epoll: Epoll,
    timer: TimerFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll = Epoll::new()?;
        let timer = TimerFd::new()?;
        epoll.add(timer.as_raw_fd(), token::TIMER)?;
        Ok(Self { epoll, timer })
    }

    #[inline]
    pub fn watch(&self, fd: RawFd, token: u64) -> io::Result<()> {
        self.epoll.add(fd, token)
    }

    #[inline]
    pub fn unwatch(&self, fd: RawFd) -> io::Result<()> {
        self.epoll.delete(fd)
    }

    /// Block until something is ready or the stop-flag timeout passes.
    pub fn wait(&mut self, ready: &mut Vec<u64>) -> io::Result<usize> {
        ready.clear();
        self.epoll.wait(WAIT_TIMEOUT, ready)
    }

    #[inline]
    pub fn timer_armed(&self) -> bool {
        self.timer.is_armed()
    }

    pub fn arm_timer(&mut self, interval: Duration) -> io::Result<()> {
        if self.timer.is_armed() {
            return Ok(());
        }
        self.timer.arm(interval)
    }

    pub fn disarm_timer(&mut self) -> io::Result<()> {
        if !self.timer.is_armed() {
            return Ok(());
        }
        self.timer.disarm()
    }

    #[inline]
    pub fn drain_timer(&self) -> io::Result<u64> {
        self.timer.drain()
    }
}

/// A session and the completion descriptor watched for it.
pub(crate) struct SessionSlot<F: Fabric> {
    pub sess: RdmaSession<F>,
    pub watched: Option<RawFd>,
}

/// Sessions of one engine, addressed by arena index.
pub(crate) struct SessionTable<F: Fabric> {
    slots: Vec<Option<SessionSlot<F>>>,
    free: Vec<ConnId>,
}

impl<F: Fabric> SessionTable<F> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// The ID the next [`insert`](Self::insert) will use.
    pub fn vacant(&mut self) -> ConnId {
        match self.free.last() {
            Some(&conn) => conn,
            None => self.slots.len() as ConnId,
        }
    }

    /// Insert a session created with ID [`vacant`](Self::vacant).
    pub fn insert(&mut self, sess: RdmaSession<F>) {
        let conn = sess.conn();
        if self.free.last() == Some(&conn) {
            self.free.pop();
        } else {
            debug_assert_eq!(conn as usize, self.slots.len());
            self.slots.push(None);
        }
        self.slots[conn as usize] = Some(SessionSlot {
            sess,
            watched: None,
        });
    }

    pub fn get_mut(&mut self, conn: ConnId) -> Option<&mut SessionSlot<F>> {
        self.slots.get_mut(conn as usize)?.as_mut()
    }

    pub fn remove(&mut self, conn: ConnId) -> Option<SessionSlot<F>> {
        let slot = self.slots.get_mut(conn as usize)?.take()?;
        self.free.push(conn);
        Some(slot)
    }

    pub fn conns(&self) -> Vec<ConnId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as ConnId)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether some session has a context that can only be polled.
    pub fn needs_polling(&self) -> bool {
        self.slots.iter().flatten().any(|s| {
            s.watched.is_none()
                && s.sess
                    .context()
                    .is_some_and(|ctx| ctx.fabric.comp_fd().is_none())
        })
    }
}

/// Watch the completion channel of `slot` if it has one and is not watched yet.
pub(crate) fn watch_completions<F: Fabric>(
    reactor: &Reactor,
    slot: &mut SessionSlot<F>,
) -> io::Result<()> {
    if slot.watched.is_some() {
        return Ok(());
    }
    let Some(fd) = slot.sess.context().and_then(|ctx| ctx.fabric.comp_fd()) else {
        return Ok(());
    };
    reactor.watch(fd, token::COMP_BASE + slot.sess.conn() as u64)?;
    slot.watched = Some(fd);
    Ok(())
}

/// Engines of one four-ring host.
///
/// Dropping the host stops and joins every thread; sessions are torn down
/// and the buffers they held go back to the guest with zero size.
pub struct Host {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    stats: Arc<EngineStats>,
}

impl Host {
    /// Start the RX engine, the slot assigner and the TX engine.
    ///
    /// `peer` is the RX engine the TX engine connects to on its first frame;
    /// without one, TX frames are returned unsent.
    pub fn spawn<F: Fabric>(
        nexus: Arc<Nexus>,
        dev: F::Device,
        region: Arc<RegionMap<SharedRegion>>,
        guest: GuestMemory,
        notifiers: Notifiers,
        peer: Option<PeerTarget>,
        config: Config,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(EngineStats::default());
        let (assign_tx, assign_rx) = mailbox()?;
        let (granted_tx, granted_rx) = mailbox()?;

        let assigner = SlotAssigner::new(
            region.clone(),
            notifiers.rx_avail_doorbell.clone(),
            assign_rx,
            granted_tx,
            config.max_frame,
            stop.clone(),
        );
        let rx = RxEngine::<F>::new(
            nexus.clone(),
            dev.clone(),
            region.clone(),
            guest.clone(),
            notifiers.clone(),
            assign_tx,
            granted_rx,
            config.clone(),
            stats.clone(),
            stop.clone(),
        )?;
        let tx = TxEngine::<F>::new(
            nexus, dev, region, guest, notifiers, peer, config.clone(), stats.clone(), stop.clone(),
        )?;

        let mut this = Self {
            stop,
            threads: Vec::with_capacity(3),
            stats,
        };
        let (assign_cpu, rx_cpu, tx_cpu) = (config.assign_cpu, config.rx_cpu, config.tx_cpu);
        this.threads.push(
            thread::Builder::new()
                .name("slot-assigner".into())
                .spawn(move || assigner.run(assign_cpu))?,
        );
        this.threads.push(
            thread::Builder::new()
                .name("rx-engine".into())
                .spawn(move || rx.run(rx_cpu))?,
        );
        this.threads.push(
            thread::Builder::new()
                .name("tx-engine".into())
                .spawn(move || tx.run(tx_cpu))?,
        );
        Ok(this)
    }

    #[inline]
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        stop_and_join(&self.stop, &mut self.threads);
    }
}

pub(crate) fn stop_and_join(stop: &AtomicBool, threads: &mut Vec<JoinHandle<()>>) {
    stop.store(true, Ordering::SeqCst);
    for handle in threads.drain(..) {
        let name = handle.thread().name().unwrap_or("engine").to_owned();
        if handle.join().is_err() {
            log::error!("{}: thread panicked", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type F = crate::fabric::loopback::LoopbackFabric;

    fn sess(conn: ConnId) -> RdmaSession<F> {
        let gm = crate::arena::BufArena::new(1, 64).unwrap().guest_memory();
        RdmaSession::initiator(TX_ENGINE, conn, RX_ENGINE, Default::default(), &gm)
    }

    #[test]
    fn session_ids_are_reused() {
        let mut table = SessionTable::<F>::new();
        assert_eq!(table.vacant(), 0);
        table.insert(sess(0));
        assert_eq!(table.vacant(), 1);
        table.insert(sess(1));

        assert!(table.remove(0).is_some());
        assert!(table.remove(0).is_none());
        assert_eq!(table.vacant(), 0);
        table.insert(sess(0));
        assert_eq!(table.conns(), vec![0, 1]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn mailbox_wakes_receiver() {
        let (tx, rx) = mailbox::<u32>().unwrap();
        let mut epoll = Epoll::new().unwrap();
        epoll.add(rx.as_raw_fd(), 9).unwrap();

        assert!(tx.send(5));
        let mut ready = Vec::new();
        epoll.wait(Duration::from_millis(100), &mut ready).unwrap();
        assert_eq!(ready, vec![9]);

        rx.clear_wake();
        assert_eq!(rx.try_recv(), Some(5));
        assert_eq!(rx.try_recv(), None);
    }
}
