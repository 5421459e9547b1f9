#![allow(unused_imports)]

mod datagram;
mod datapath;

use super::{type_alias::*, *};
use std::{
    sync::{atomic::*, *},
    thread,
    time::{Duration, Instant},
};

use simple_logger::SimpleLogger;

use crate::fabric::loopback::{LoopbackDatagram, LoopbackFabric, LoopbackHub};
use crate::ring::flag::{Consumer, Producer};
use crate::ring::tristate::Submitter;
use crate::ring::Desc;

static NEXT_PORT: AtomicU16 = AtomicU16::new(31850);

/// Get a fresh UDP port for a nexus.
fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Turn on logging once for whichever test runs first.
fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
    });
}

const DEADLINE: Duration = Duration::from_secs(10);

/// Spin (politely) until `f` yields something or the deadline passes.
fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
    let start = Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        assert!(start.elapsed() < DEADLINE, "timed out waiting");
        thread::sleep(Duration::from_micros(100));
    }
}

/// Write `tag` repeated into a frame of `len` bytes.
fn payload(tag: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| tag.wrapping_add(i as u8)).collect()
}
