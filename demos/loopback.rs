use shmnic::{
    fabric::loopback::{LoopbackFabric, LoopbackHub},
    ring::{
        flag::{Consumer, Producer},
        Desc,
    },
    *,
};
use simple_logger::SimpleLogger;
use std::{sync::Arc, thread, time::Duration};

fn main() {
    const SENDER_URI: &'static str = "127.0.0.1:31850";
    const RECEIVER_URI: &'static str = "127.0.0.1:31851";
    const HELLO_WORLD: &str = "Hello, world!";
    const ROUNDS: usize = 16;

    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();
    let hub = LoopbackHub::new();

    // Receiving guest: its buffers sit on `rx_avail` until a peer is granted them.
    let mut rx_arena = BufArena::new(64, 2048).unwrap();
    let rx_region = Arc::new(RegionMap::<SharedRegion>::anonymous().unwrap());
    let rx_notifiers = Notifiers::new().unwrap();
    let mut rx_avail = Producer::new();
    for _ in 0..32 {
        let h = rx_arena.alloc().unwrap();
        let desc = rx_arena.desc(h, rx_arena.buf_size() as u32);
        rx_avail.produce(&rx_region.rx_avail, desc).unwrap();
    }
    let nx_b = Nexus::new(RECEIVER_URI).unwrap();
    let host_b = Host::spawn::<LoopbackFabric>(
        nx_b.clone(),
        hub.clone(),
        rx_region.clone(),
        rx_arena.guest_memory(),
        rx_notifiers.clone(),
        None,
        Config::default(),
    )
    .unwrap();

    // Sending guest.
    let mut tx_arena = BufArena::new(64, 2048).unwrap();
    let tx_region = Arc::new(RegionMap::<SharedRegion>::anonymous().unwrap());
    let tx_notifiers = Notifiers::new().unwrap();
    let nx_a = Nexus::new(SENDER_URI).unwrap();
    let host_a = Host::spawn::<LoopbackFabric>(
        nx_a,
        hub,
        tx_region.clone(),
        tx_arena.guest_memory(),
        tx_notifiers.clone(),
        Some(PeerTarget {
            uri: nx_b.uri(),
            engine: RX_ENGINE,
        }),
        Config::default(),
    )
    .unwrap();

    let mut tx = Producer::new();
    let mut tx_used = Consumer::new();
    let mut rx = Consumer::new();
    let mut delivered = 0;
    while delivered < ROUNDS {
        let h = tx_arena.alloc().unwrap();
        let msg = format!("{} #{}", HELLO_WORLD, delivered);
        tx_arena.write(h, msg.as_bytes());
        if tx
            .produce(&tx_region.tx, tx_arena.desc(h, msg.len() as u32))
            .unwrap()
        {
            tx_notifiers.tx_doorbell.signal().unwrap();
        }

        let used = loop {
            if let Some(d) = tx_used.consume(&tx_region.tx_used) {
                break d;
            }
            thread::sleep(Duration::from_micros(50));
        };
        tx_arena.free(tx_arena.handle_of(&used).unwrap());
        if used.size == 0 {
            // Not sent yet: no credit. Try again shortly.
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        let got = loop {
            if let Some(d) = rx.consume(&rx_region.rx) {
                break d;
            }
            thread::sleep(Duration::from_micros(50));
        };
        let h = rx_arena.handle_of(&got).unwrap();
        let data = rx_arena.read(h, got.size as usize);
        println!("received: {}", String::from_utf8_lossy(&data));
        let recycled = Desc {
            size: rx_arena.buf_size() as u32,
            ..got
        };
        if rx_avail.produce(&rx_region.rx_avail, recycled).unwrap() {
            rx_notifiers.rx_avail_doorbell.signal().unwrap();
        }
        delivered += 1;
    }

    let sa = host_a.stats().snapshot();
    let sb = host_b.stats().snapshot();
    println!("sender: {:?}", sa);
    println!("receiver: {:?}", sb);
}
