//! Two-ring hosts in one tenant group.

use super::*;

const BROADCAST: MacAddr = [0xff; 6];

fn mac(n: u8) -> MacAddr {
    [0x52, 0x54, 0x00, 0x12, 0x34, n]
}

fn frame(dst: MacAddr, src: MacAddr, ethertype: u16, body: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(14 + body.len());
    f.extend_from_slice(&dst);
    f.extend_from_slice(&src);
    f.extend_from_slice(&ethertype.to_be_bytes());
    f.extend_from_slice(body);
    f
}

/// The guest side of a [`DuplexRegion`].
struct Guest {
    arena: BufArena,
    region: Arc<RegionMap<DuplexRegion>>,
    notifiers: Notifiers,
    tx: Submitter,
    rx: Submitter,
}

impl Guest {
    fn new() -> Self {
        Self {
            arena: BufArena::new(64, 2048).unwrap(),
            region: Arc::new(RegionMap::anonymous().unwrap()),
            notifiers: Notifiers::new().unwrap(),
            tx: Submitter::new(),
            rx: Submitter::new(),
        }
    }

    fn post_rx_buffers(&mut self, n: usize) {
        for _ in 0..n {
            let h = self.arena.alloc().unwrap();
            let desc = self.arena.desc(h, self.arena.buf_size() as u32);
            self.rx.submit(&self.region.rx, desc).unwrap();
        }
        self.notifiers.rx_avail_doorbell.signal().unwrap();
    }

    fn send(&mut self, data: &[u8]) {
        let h = self.arena.alloc().unwrap();
        self.arena.write(h, data);
        let desc = self.arena.desc(h, data.len() as u32);
        self.tx.submit(&self.region.tx, desc).unwrap();
        if self.tx.doorbell_due(&self.region.tx) {
            self.notifiers.tx_doorbell.signal().unwrap();
        }
    }

    fn reclaim_tx(&mut self) -> Desc {
        let desc = wait_for(|| self.tx.reclaim(&self.region.tx));
        let h = self.arena.handle_of(&desc).unwrap();
        assert!(self.arena.free(h));
        desc
    }

    fn recv(&mut self) -> Vec<u8> {
        let desc = wait_for(|| self.rx.reclaim(&self.region.rx));
        let h = self.arena.handle_of(&desc).unwrap();
        self.arena.read(h, desc.size as usize)
    }

    /// Whether anything arrives within `d`.
    fn quiet_for(&mut self, d: Duration) -> bool {
        thread::sleep(d);
        !self.rx.is_reclaimable(&self.region.rx)
    }

    fn spawn_host(&self, hub: &LoopbackHub, tenant_id: u32) -> DatagramHost {
        DatagramHost::spawn::<LoopbackDatagram>(
            hub,
            self.region.clone(),
            self.arena.guest_memory(),
            self.notifiers.clone(),
            Config {
                tenant_id,
                poll_interval: Duration::from_micros(200),
                poll_retry: 8,
                ..Config::default()
            },
        )
        .unwrap()
    }
}

/// Test flooding, learning from ARP, and unicast to the learned sender.
#[test]
fn arp_teaches_unicast() {
    init_logger();
    let hub = LoopbackHub::new();
    let mut guests: Vec<_> = (0..3).map(|_| Guest::new()).collect();
    for g in &mut guests {
        g.post_rx_buffers(8);
    }
    let hosts: Vec<_> = guests.iter().map(|g| g.spawn_host(&hub, 7)).collect();

    // A broadcasts an ARP request; both others get it.
    let arp = frame(BROADCAST, mac(0), ETHERTYPE_ARP, &[1; 28]);
    guests[0].send(&arp);
    assert_ne!(guests[0].reclaim_tx().size, 0);
    assert_eq!(guests[1].recv(), arp);
    assert_eq!(guests[2].recv(), arp);
    assert_eq!(hosts[1].stats().snapshot().fdb_hints, 1);

    // B answers A directly; only A sees it.
    let reply = frame(mac(0), mac(1), 0x0800, &[2; 46]);
    guests[1].send(&reply);
    guests[1].reclaim_tx();
    assert_eq!(guests[0].recv(), reply);
    assert!(guests[2].quiet_for(Duration::from_millis(50)));

    // Unknown unicast floods.
    let unknown = frame(mac(9), mac(2), 0x0800, &[3; 46]);
    guests[2].send(&unknown);
    guests[2].reclaim_tx();
    assert_eq!(guests[0].recv(), unknown);
    assert_eq!(guests[1].recv(), unknown);
}

/// Test that other tenants never see a group's traffic.
#[test]
fn tenants_are_isolated() {
    init_logger();
    let hub = LoopbackHub::new();
    let mut a = Guest::new();
    let mut b = Guest::new();
    a.post_rx_buffers(4);
    b.post_rx_buffers(4);
    let _ha = a.spawn_host(&hub, 1);
    let _hb = b.spawn_host(&hub, 2);

    a.send(&frame(BROADCAST, mac(0), ETHERTYPE_ARP, &[0; 28]));
    a.reclaim_tx();
    assert!(b.quiet_for(Duration::from_millis(50)));
}

/// Test that runt frames complete in order with zero size and do not stall
/// the ring.
#[test]
fn runt_frames_are_returned() {
    init_logger();
    let hub = LoopbackHub::new();
    let mut a = Guest::new();
    let mut b = Guest::new();
    b.post_rx_buffers(4);
    let ha = a.spawn_host(&hub, 3);
    let _hb = b.spawn_host(&hub, 3);

    let good = frame(BROADCAST, mac(0), 0x0800, &[5; 50]);
    a.send(&[0u8; 6]);
    a.send(&good);
    assert_eq!(a.reclaim_tx().size, 0);
    assert_eq!(a.reclaim_tx().size, good.len() as u32);
    assert_eq!(b.recv(), good);
    assert_eq!(ha.stats().snapshot().tx_dropped_no_credit, 1);
}

/// Test that stopping the host hands every posted receive buffer back.
#[test]
fn shutdown_returns_receive_buffers() {
    init_logger();
    let hub = LoopbackHub::new();
    let mut g = Guest::new();
    g.post_rx_buffers(5);
    let host = g.spawn_host(&hub, 4);
    // Let the RX thread take the buffers.
    thread::sleep(Duration::from_millis(20));
    drop(host);

    let mut n = 0;
    while let Some(d) = g.rx.reclaim(&g.region.rx) {
        assert_eq!(d.size, 0);
        n += 1;
    }
    assert_eq!(n, 5);
}
