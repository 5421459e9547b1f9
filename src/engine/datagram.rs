//! The two-ring variant: frames travel as unreliable datagrams within a
//! tenant's multicast group, addressed through the forwarding table.
//!
//! The guest submits frames on `tx` and empty buffers on `rx`; the host
//! completes both in ring order. The RX thread learns MAC bindings from
//! inbound ARP and passes them to the TX thread, which owns the table.

use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::moderation::{IrqCoalescer, Moderator, Tick};
use super::*;
use crate::error::{Error, Result};
use crate::fabric::*;
use crate::fdb::*;
use crate::region::DuplexRegion;
use crate::ring::tristate::Processor;
use crate::ring::{Desc, RingBuffer};
use crate::util::affinity;

/// A ring slot taken by the host, in ring order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Taken {
    /// A fabric operation is outstanding for the buffer.
    Posted(Desc),

    /// Unusable descriptor; completes with zero size once it reaches the
    /// front.
    Rejected,
}

/// Taken slots of one ring, completed strictly in order.
#[derive(Debug, Default)]
struct TakenQueue {
    queue: VecDeque<Taken>,
}

impl TakenQueue {
    #[inline]
    fn push(&mut self, t: Taken) {
        self.queue.push_back(t);
    }

    /// Pop the slot a fabric completion belongs to.
    fn pop_posted(&mut self) -> Result<Desc> {
        match self.queue.pop_front() {
            Some(Taken::Posted(desc)) => Ok(desc),
            _ => Err(Error::ControlMsg("completion without an outstanding slot")),
        }
    }

    /// Complete rejected slots sitting at the front.
    fn retire<const N: usize>(
        &mut self,
        proc: &mut Processor,
        ring: &RingBuffer<N>,
    ) -> Result<usize> {
        let mut n = 0;
        while self.queue.front() == Some(&Taken::Rejected) {
            self.queue.pop_front();
            proc.complete(ring, Some(0))?;
            n += 1;
        }
        Ok(n)
    }
}

/// The receive thread of the datagram variant.
struct DatagramRx<D: DatagramFabric> {
    recv: D::RecvHalf,
    keys: MemKeys,
    guest: GuestMemory,
    region: Arc<RegionMap<DuplexRegion>>,
    notifiers: Notifiers,
    hints: FdbHintSender<D::AddressHandle>,
    config: Config,
    stats: Arc<EngineStats>,
    stop: Arc<AtomicBool>,

    rx: Processor,
    taken: TakenQueue,
    coalescer: IrqCoalescer,
    moderator: Moderator,
    reactor: Reactor,
    wcs: Vec<Completion>,

    /// Completions seen since the last timer tick.
    recent: usize,
}

impl<D: DatagramFabric> DatagramRx<D> {
    const NAME: &'static str = "datagram RX";

    /// Post a receive for every empty buffer the guest submitted.
    fn refill(&mut self) -> Result<usize> {
        let mut n = 0;
        while let Some(desc) = self.rx.take(&self.region.rx) {
            match self.guest.addr_of(desc.data_ptr, desc.size) {
                Some(addr) => {
                    self.recv.post_recv(desc.handle, self.keys.sge(addr, desc.size))?;
                    self.taken.push(Taken::Posted(desc));
                }
                None => {
                    log::warn!(
                        "{}: rejecting buffer outside guest memory: {:?}",
                        Self::NAME,
                        desc
                    );
                    self.taken.push(Taken::Rejected);
                }
            }
            n += 1;
        }
        self.taken.retire(&mut self.rx, &self.region.rx)?;
        Ok(n)
    }

    /// Learn the sender of an inbound ARP frame.
    fn learn(&mut self, desc: &Desc, src: &DatagramSource) {
        if src.gid.is_none() {
            return;
        }
        let mut hdr = [0u8; 14];
        if desc.size < hdr.len() as u32 || !self.guest.read(desc.data_ptr, &mut hdr) {
            return;
        }
        if ethertype(&hdr) != Some(ETHERTYPE_ARP) {
            return;
        }
        let Some(mac) = src_mac(&hdr) else {
            return;
        };
        match self.recv.make_ah(src) {
            Ok(ah) => {
                let hint = FdbHint {
                    key: hash_mac(&mac),
                    entry: ForwardEntry { ah, qpn: src.qpn },
                };
                if self.hints.send(hint) {
                    EngineStats::bump(&self.stats.fdb_hints, 1);
                }
            }
            Err(e) => log::warn!("{}: cannot reach QP {}: {}", Self::NAME, src.qpn, e),
        }
    }

    fn process_completions(&mut self) -> Result<()> {
        self.wcs.clear();
        self.recv.rearm()?;
        self.recv.poll(&mut self.wcs)?;

        let wcs = std::mem::take(&mut self.wcs);
        for wc in &wcs {
            let posted = self.taken.pop_posted()?;
            let size = if wc.is_ok() { wc.byte_len } else { 0 };
            if wc.is_ok() {
                EngineStats::bump(&self.stats.rx_delivered, 1);
                // Learn before the guest sees the frame, so a reply finds
                // the binding.
                if let Some(src) = wc.src {
                    self.learn(&Desc { size, ..posted }, &src);
                }
            } else {
                log::debug!("{}: receive failed: {}", Self::NAME, wc.status);
            }
            self.rx.complete(&self.region.rx, Some(size))?;
            self.taken.retire(&mut self.rx, &self.region.rx)?;
        }
        let n = wcs.len();
        self.wcs = wcs;

        if n > 0 {
            self.recent += n;
            if self.moderator.on_doorbell() {
                self.reactor.arm_timer(self.config.poll_interval)?;
            }
            if self.coalescer.add(n) {
                self.notify();
            }
        }
        Ok(())
    }

    /// Interrupt the guest if it is waiting.
    fn notify(&mut self) {
        if self.rx.interrupt_due(&self.region.rx) {
            Notifiers::raise(Self::NAME, &self.notifiers.rx_irq);
        }
        self.coalescer.flush();
    }

    fn on_tick(&mut self) -> Result<()> {
        self.reactor.drain_timer()?;
        let polled_only = self.recv.comp_fd().is_none();
        if polled_only {
            self.refill()?;
            self.process_completions()?;
        }
        if self.coalescer.pending() > 0 {
            self.notify();
        }
        let found = std::mem::take(&mut self.recent) > 0;
        if self.moderator.on_tick(found) == Tick::Stop && !polled_only {
            self.reactor.disarm_timer()?;
        }
        Ok(())
    }

    fn run(mut self, cpu: Option<usize>) {
        affinity::pin_if_configured(Self::NAME, cpu);

        let mut ready = Vec::new();
        let mut res = self.refill().and_then(|_| self.process_completions());
        while res.is_ok() && !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.reactor.wait(&mut ready) {
                res = Err(e.into());
                break;
            }
            for &t in &ready {
                res = match t {
                    token::DOORBELL => self
                        .notifiers
                        .rx_avail_doorbell
                        .drain()
                        .map_err(Error::from)
                        .and_then(|_| self.refill())
                        .map(|_| ()),
                    token::TIMER => self.on_tick(),
                    token::COMP_BASE => self.process_completions(),
                    _ => Ok(()),
                };
                if res.is_err() {
                    break;
                }
            }
        }

        if let Err(e) = res {
            EngineStats::bump(&self.stats.sessions_failed, 1);
            self.config.failure_policy.handle(Self::NAME, 0, &e);
        }
        let released = self.rx.release_all(&self.region.rx);
        if released > 0 {
            log::debug!("{}: returned {} receive buffers", Self::NAME, released);
            Notifiers::raise(Self::NAME, &self.notifiers.rx_irq);
        }
        log::debug!("{}: stopped", Self::NAME);
    }
}

/// The send thread of the datagram variant. Sole owner of the forwarding
/// table.
struct DatagramTx<D: DatagramFabric> {
    send: D::SendHalf,
    keys: MemKeys,
    guest: GuestMemory,
    region: Arc<RegionMap<DuplexRegion>>,
    notifiers: Notifiers,
    fdb: ForwardingTable<D::AddressHandle>,
    hints: FdbHintReceiver<D::AddressHandle>,
    config: Config,
    stats: Arc<EngineStats>,
    stop: Arc<AtomicBool>,

    tx: Processor,
    taken: TakenQueue,
    moderator: Moderator,
    reactor: Reactor,
    wcs: Vec<Completion>,
}

impl<D: DatagramFabric> DatagramTx<D> {
    const NAME: &'static str = "datagram TX";
    const ETH_HEADER_LEN: u32 = 14;

    fn apply_hints(&mut self) {
        while let Some(hint) = self.hints.try_recv() {
            log::trace!("{}: learned key {:#06x}", Self::NAME, hint.key);
            self.fdb.apply(hint);
        }
    }

    /// Send up to one budget of frames. Returns how many were taken.
    fn poll_ring(&mut self) -> Result<usize> {
        // Frames answering a just-learned sender must see its binding.
        self.apply_hints();
        let mut n = 0;
        while n < self.config.tx_budget {
            let Some(desc) = self.tx.take(&self.region.tx) else {
                break;
            };
            n += 1;

            let mut dst = [0u8; 6];
            let addr = self.guest.addr_of(desc.data_ptr, desc.size);
            let (Some(addr), true) = (
                addr,
                desc.size >= Self::ETH_HEADER_LEN && self.guest.read(desc.data_ptr, &mut dst),
            ) else {
                log::warn!("{}: rejecting malformed frame: {:?}", Self::NAME, desc);
                EngineStats::bump(&self.stats.tx_dropped_no_credit, 1);
                self.taken.push(Taken::Rejected);
                continue;
            };

            let entry = self.fdb.lookup(&dst);
            self.send
                .post_send(desc.handle, self.keys.sge(addr, desc.size), &entry.ah, entry.qpn)?;
            self.taken.push(Taken::Posted(desc));
        }
        self.taken.retire(&mut self.tx, &self.region.tx)?;
        Ok(n)
    }

    fn process_completions(&mut self) -> Result<()> {
        self.wcs.clear();
        self.send.rearm()?;
        self.send.poll(&mut self.wcs)?;

        let wcs = std::mem::take(&mut self.wcs);
        for wc in &wcs {
            self.taken.pop_posted()?;
            self.tx.complete(&self.region.tx, None)?;
            if wc.is_ok() {
                EngineStats::bump(&self.stats.tx_sent, 1);
            } else {
                log::debug!("{}: send failed: {}", Self::NAME, wc.status);
            }
            self.taken.retire(&mut self.tx, &self.region.tx)?;
        }
        if !wcs.is_empty() {
            Notifiers::raise(Self::NAME, &self.notifiers.tx_used_irq);
        }
        self.wcs = wcs;
        Ok(())
    }

    fn on_doorbell(&mut self) -> Result<()> {
        self.notifiers.tx_doorbell.drain()?;
        if self.moderator.on_doorbell() {
            self.reactor.arm_timer(self.config.poll_interval)?;
        }
        self.poll_ring()?;
        Ok(())
    }

    fn on_tick(&mut self) -> Result<()> {
        self.reactor.drain_timer()?;
        let polled_only = self.send.comp_fd().is_none();
        if polled_only {
            self.process_completions()?;
        }
        if !self.moderator.is_polling() {
            return Ok(());
        }
        let found = self.poll_ring()? > 0;
        if self.moderator.on_tick(found) == Tick::Stop {
            if !self.tx.park(&self.region.tx) {
                self.moderator.resume();
            } else if !polled_only {
                self.reactor.disarm_timer()?;
            }
        }
        Ok(())
    }

    fn run(mut self, cpu: Option<usize>) {
        affinity::pin_if_configured(Self::NAME, cpu);

        let mut ready = Vec::new();
        let mut res = self
            .process_completions()
            .and_then(|_| self.poll_ring().map(|_| ()));
        while res.is_ok() && !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.reactor.wait(&mut ready) {
                res = Err(e.into());
                break;
            }
            for &t in &ready {
                res = match t {
                    token::DOORBELL => self.on_doorbell(),
                    token::WAKE => {
                        if let Err(e) = self.hints.clear_wake() {
                            log::warn!("{}: failed to clear hint wake: {}", Self::NAME, e);
                        }
                        self.apply_hints();
                        Ok(())
                    }
                    token::TIMER => self.on_tick(),
                    token::COMP_BASE => self.process_completions(),
                    _ => Ok(()),
                };
                if res.is_err() {
                    break;
                }
            }
        }

        if let Err(e) = res {
            EngineStats::bump(&self.stats.sessions_failed, 1);
            self.config.failure_policy.handle(Self::NAME, 0, &e);
        }
        self.tx.release_all(&self.region.tx);
        log::debug!("{}: stopped", Self::NAME);
    }
}

/// Engines of one two-ring host.
pub struct DatagramHost {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    stats: Arc<EngineStats>,
}

impl DatagramHost {
    /// Join `config.tenant_id`'s group and start the RX and TX threads.
    ///
    /// The guest signals `notifiers.tx_doorbell` when a submit asks for it,
    /// and `notifiers.rx_avail_doorbell` after submitting empty buffers.
    pub fn spawn<D: DatagramFabric>(
        dev: &D::Device,
        region: Arc<RegionMap<DuplexRegion>>,
        guest: GuestMemory,
        notifiers: Notifiers,
        config: Config,
    ) -> Result<Self> {
        let (mut recv, mut send) = D::open(dev, config.tenant_id)?;

        // SAFETY: each engine keeps a clone of `guest` declared after its
        // fabric half, so the memory outlives the registration.
        let (recv_keys, send_keys) = unsafe {
            (
                recv.reg_mem(guest.base(), guest.len())?,
                send.reg_mem(guest.base(), guest.len())?,
            )
        };

        let (hint_tx, hint_rx) = fdb_hint_channel()?;
        let (flood_ah, flood_qpn) = send.flood();
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(EngineStats::default());

        let mut rx_reactor = Reactor::new()?;
        rx_reactor.watch(notifiers.rx_avail_doorbell.as_raw_fd(), token::DOORBELL)?;
        if let Some(fd) = recv.comp_fd() {
            rx_reactor.watch(fd, token::COMP_BASE)?;
        } else {
            rx_reactor.arm_timer(config.poll_interval)?;
        }
        let mut tx_reactor = Reactor::new()?;
        tx_reactor.watch(notifiers.tx_doorbell.as_raw_fd(), token::DOORBELL)?;
        tx_reactor.watch(hint_rx.as_raw_fd(), token::WAKE)?;
        if let Some(fd) = send.comp_fd() {
            tx_reactor.watch(fd, token::COMP_BASE)?;
        } else {
            // Only polling sees send completions; keep the timer running.
            tx_reactor.arm_timer(config.poll_interval)?;
        }

        let rx = DatagramRx::<D> {
            recv,
            keys: recv_keys,
            guest: guest.clone(),
            region: region.clone(),
            notifiers: notifiers.clone(),
            hints: hint_tx,
            moderator: Moderator::new(config.poll_retry),
            coalescer: IrqCoalescer::new(config.rx_budget),
            config: config.clone(),
            stats: stats.clone(),
            stop: stop.clone(),
            rx: Processor::new(),
            taken: TakenQueue::default(),
            reactor: rx_reactor,
            wcs: Vec::new(),
            recent: 0,
        };
        let tx = DatagramTx::<D> {
            send,
            keys: send_keys,
            guest,
            region,
            notifiers,
            fdb: ForwardingTable::new(ForwardEntry {
                ah: flood_ah,
                qpn: flood_qpn,
            }),
            hints: hint_rx,
            moderator: Moderator::new(config.poll_retry),
            config: config.clone(),
            stats: stats.clone(),
            stop: stop.clone(),
            tx: Processor::new(),
            taken: TakenQueue::default(),
            reactor: tx_reactor,
            wcs: Vec::new(),
        };

        let mut this = Self {
            stop,
            threads: Vec::with_capacity(2),
            stats,
        };
        let (rx_cpu, tx_cpu) = (config.rx_cpu, config.tx_cpu);
        this.threads.push(
            thread::Builder::new()
                .name("datagram-rx".into())
                .spawn(move || rx.run(rx_cpu))?,
        );
        this.threads.push(
            thread::Builder::new()
                .name("datagram-tx".into())
                .spawn(move || tx.run(tx_cpu))?,
        );
        Ok(this)
    }

    #[inline]
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }
}

impl Drop for DatagramHost {
    fn drop(&mut self) {
        stop_and_join(&self.stop, &mut self.threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_slots_complete_in_order() {
        let ring = RingBuffer::<8>::boxed();
        let mut guest = crate::ring::tristate::Submitter::new();
        let mut host = Processor::new();
        let mut taken = TakenQueue::default();

        for i in 0..3 {
            guest.submit(&ring, Desc::new(i, 0, 64)).unwrap();
            host.take(&ring).unwrap();
        }
        taken.push(Taken::Posted(Desc::new(0, 0, 64)));
        taken.push(Taken::Rejected);
        taken.push(Taken::Posted(Desc::new(2, 0, 64)));

        // The rejected slot waits behind the outstanding one.
        assert_eq!(taken.retire(&mut host, &ring).unwrap(), 0);
        assert_eq!(taken.pop_posted().unwrap().handle, 0);
        host.complete(&ring, None).unwrap();
        assert_eq!(taken.retire(&mut host, &ring).unwrap(), 1);

        assert_eq!(guest.reclaim(&ring).map(|d| d.size), Some(64));
        assert_eq!(guest.reclaim(&ring).map(|d| d.size), Some(0));
        assert_eq!(guest.reclaim(&ring), None);

        assert_eq!(taken.pop_posted().unwrap().handle, 2);
        assert!(taken.pop_posted().is_err());
    }
}
