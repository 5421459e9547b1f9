//! Four-ring hosts moving frames end to end.

use super::*;

/// The guest side of a [`SharedRegion`].
struct Guest {
    arena: BufArena,
    region: Arc<RegionMap<SharedRegion>>,
    notifiers: Notifiers,
    tx: Producer,
    tx_used: Consumer,
    rx_avail: Producer,
    rx: Consumer,
}

impl Guest {
    fn new(bufs: usize) -> Self {
        Self {
            arena: BufArena::new(bufs, 2048).unwrap(),
            region: Arc::new(RegionMap::anonymous().unwrap()),
            notifiers: Notifiers::new().unwrap(),
            tx: Producer::new(),
            tx_used: Consumer::new(),
            rx_avail: Producer::new(),
            rx: Consumer::new(),
        }
    }

    fn post_rx_buffers(&mut self, n: usize) {
        for _ in 0..n {
            let h = self.arena.alloc().unwrap();
            let desc = self.arena.desc(h, self.arena.buf_size() as u32);
            self.repost(desc);
        }
    }

    fn repost(&mut self, desc: Desc) {
        let desc = Desc {
            size: self.arena.buf_size() as u32,
            ..desc
        };
        if self.rx_avail.produce(&self.region.rx_avail, desc).unwrap() {
            self.notifiers.rx_avail_doorbell.signal().unwrap();
        }
    }

    fn send(&mut self, data: &[u8]) -> Desc {
        let h = self.arena.alloc().unwrap();
        self.arena.write(h, data);
        let desc = self.arena.desc(h, data.len() as u32);
        if self.tx.produce(&self.region.tx, desc).unwrap() {
            self.notifiers.tx_doorbell.signal().unwrap();
        }
        desc
    }

    /// Wait for the host to give back a sent buffer and free it.
    fn reclaim_tx(&mut self) -> Desc {
        let desc = wait_for(|| self.tx_used.consume(&self.region.tx_used));
        let h = self.arena.handle_of(&desc).unwrap();
        assert!(self.arena.free(h));
        desc
    }

    fn recv(&mut self) -> (Desc, Vec<u8>) {
        let desc = wait_for(|| self.rx.consume(&self.region.rx));
        let h = self.arena.handle_of(&desc).unwrap();
        let data = self.arena.read(h, desc.size as usize);
        (desc, data)
    }

    fn spawn_host(&self, nexus: &Arc<Nexus>, hub: &LoopbackHub, peer: Option<PeerTarget>) -> Host {
        Host::spawn::<LoopbackFabric>(
            nexus.clone(),
            hub.clone(),
            self.region.clone(),
            self.arena.guest_memory(),
            self.notifiers.clone(),
            peer,
            Config {
                poll_interval: Duration::from_micros(200),
                poll_retry: 8,
                ..Config::default()
            },
        )
        .unwrap()
    }
}

/// Test frames from one guest arriving at another host's guest.
#[test]
fn two_hosts() {
    init_logger();
    let hub = LoopbackHub::new();
    let na = Nexus::new(("127.0.0.1", next_port())).unwrap();
    let nb = Nexus::new(("127.0.0.1", next_port())).unwrap();

    let mut a = Guest::new(64);
    let mut b = Guest::new(64);
    b.post_rx_buffers(16);

    let peer = PeerTarget {
        uri: nb.uri(),
        engine: RX_ENGINE,
    };
    let host_b = b.spawn_host(&nb, &hub, None);
    let host_a = a.spawn_host(&na, &hub, Some(peer));

    // Lockstep: each frame is received and its buffer recycled before the
    // next one goes out, so credits never run dry.
    const FRAMES: usize = 40;
    let mut i = 0;
    while i < FRAMES {
        let frame = payload(i as u8, 60 + i * 17);
        a.send(&frame);
        let used = a.reclaim_tx();
        if used.size == 0 {
            // Dropped for lack of credit; the grant is on its way.
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        assert_eq!(used.size as usize, frame.len());

        let (desc, data) = b.recv();
        assert_eq!(desc.size as usize, frame.len());
        assert_eq!(data, frame);
        b.repost(desc);
        i += 1;
    }

    let sa = host_a.stats().snapshot();
    let sb = host_b.stats().snapshot();
    assert_eq!(sa.tx_sent, FRAMES as u64);
    assert_eq!(sb.rx_delivered, FRAMES as u64);
    // The MR message, then one ASSIGN per crossing.
    assert!(sb.assign_sent >= 1 + (FRAMES / SLOT_CAPACITY) as u64);
    assert_eq!(sa.sessions_failed + sb.sessions_failed, 0);
}

/// Test a host whose TX engine connects to its own RX engine.
#[test]
fn loop_to_self() {
    init_logger();
    let hub = LoopbackHub::new();
    let nx = Nexus::new(("127.0.0.1", next_port())).unwrap();

    let mut g = Guest::new(32);
    g.post_rx_buffers(8);
    let peer = PeerTarget {
        uri: nx.uri(),
        engine: RX_ENGINE,
    };
    let host = g.spawn_host(&nx, &hub, Some(peer));

    // Queued before the session is up: deferred, then flushed in order.
    let frames: Vec<_> = (0..4).map(|i| payload(0x10 * i, 100 + i as usize)).collect();
    for f in &frames {
        g.send(f);
    }
    for f in &frames {
        let (_, data) = g.recv();
        assert_eq!(&data, f);
    }
    for _ in &frames {
        assert_ne!(g.reclaim_tx().size, 0);
    }
    assert_eq!(host.stats().snapshot().rx_delivered, frames.len() as u64);
}

/// Test that without a peer, frames come back unsent.
#[test]
fn no_peer_returns_frames() {
    init_logger();
    let hub = LoopbackHub::new();
    let nx = Nexus::new(("127.0.0.1", next_port())).unwrap();

    let mut g = Guest::new(8);
    let host = g.spawn_host(&nx, &hub, None);

    let sent = g.send(&payload(1, 64));
    let used = g.reclaim_tx();
    assert_eq!(used.handle, sent.handle);
    assert_eq!(used.size, 0);
    assert_eq!(host.stats().snapshot().tx_dropped_no_credit, 1);
}

/// Test that stopping the hosts hands granted-but-unused buffers back.
#[test]
fn shutdown_returns_granted_buffers() {
    init_logger();
    let hub = LoopbackHub::new();
    let na = Nexus::new(("127.0.0.1", next_port())).unwrap();
    let nb = Nexus::new(("127.0.0.1", next_port())).unwrap();

    let mut a = Guest::new(16);
    let mut b = Guest::new(16);
    b.post_rx_buffers(SLOT_CAPACITY);

    let host_b = b.spawn_host(&nb, &hub, None);
    let host_a = a.spawn_host(
        &na,
        &hub,
        Some(PeerTarget {
            uri: nb.uri(),
            engine: RX_ENGINE,
        }),
    );

    let frame = payload(9, 128);
    a.send(&frame);
    let (desc, data) = b.recv();
    assert_eq!(data, frame);
    assert_ne!(desc.size, 0);
    wait_for(|| (host_b.stats().snapshot().assign_sent > 0).then_some(()));

    drop(host_a);
    drop(host_b);

    // Seven slots were still granted to the peer.
    let mut returned = 0;
    while let Some(d) = b.rx.consume(&b.region.rx) {
        assert_eq!(d.size, 0);
        returned += 1;
    }
    assert_eq!(returned, SLOT_CAPACITY - 1);
}
