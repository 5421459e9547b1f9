//! Forwarding database of the datagram variant.
//!
//! The TX thread owns the [`ForwardingTable`]. The RX thread learns where
//! MAC addresses live from inbound ARP datagrams and ships each binding to
//! the TX thread as an [`FdbHint`] over a bounded channel.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::type_alias::*;
use crate::util::fd::EventFd;

/// Ethertype of ARP frames, the only ones learned from.
pub const ETHERTYPE_ARP: u16 = 0x0806;

const ETH_HEADER_LEN: usize = 14;

/// Destination MAC of an Ethernet frame.
#[inline]
pub fn dst_mac(frame: &[u8]) -> Option<MacAddr> {
    frame.get(0..6)?.try_into().ok()
}

/// Source MAC of an Ethernet frame.
#[inline]
pub fn src_mac(frame: &[u8]) -> Option<MacAddr> {
    frame.get(6..12)?.try_into().ok()
}

/// Ethertype of an Ethernet frame.
#[inline]
pub fn ethertype(frame: &[u8]) -> Option<u16> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([frame[12], frame[13]]))
}

/// Table key of a MAC address: its last two bytes, big-endian.
#[inline]
pub fn hash_mac(mac: &MacAddr) -> HashKey {
    u16::from_be_bytes([mac[4], mac[5]])
}

/// Where to send frames for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEntry<AH> {
    pub ah: AH,
    pub qpn: Qpn,
}

/// MAC-hash keyed forwarding table. Key 0 is the flood entry and is never
/// learned over.
pub struct ForwardingTable<AH> {
    entries: Box<[Option<ForwardEntry<AH>>]>,
    flood: ForwardEntry<AH>,
    learned: usize,
}

impl<AH: Clone> ForwardingTable<AH> {
    pub const SIZE: usize = 1 << 16;
    pub const FLOOD_KEY: HashKey = 0;

    /// Create a table whose misses go to `flood`.
    pub fn new(flood: ForwardEntry<AH>) -> Self {
        Self {
            entries: vec![None; Self::SIZE].into_boxed_slice(),
            flood,
            learned: 0,
        }
    }

    /// The entry frames to `dst` go to. Group addresses and unknown unicast
    /// addresses are flooded.
    pub fn lookup(&self, dst: &MacAddr) -> &ForwardEntry<AH> {
        if dst[0] & 1 != 0 {
            return &self.flood;
        }
        self.get(hash_mac(dst))
    }

    /// The entry stored under `key`, or the flood entry.
    pub fn get(&self, key: HashKey) -> &ForwardEntry<AH> {
        self.entries[key as usize].as_ref().unwrap_or(&self.flood)
    }

    #[inline]
    pub fn flood(&self) -> &ForwardEntry<AH> {
        &self.flood
    }

    /// Create or replace the entry under `key`. Returns `false` for the
    /// flood key, which stays untouched.
    pub fn insert(&mut self, key: HashKey, entry: ForwardEntry<AH>) -> bool {
        if key == Self::FLOOD_KEY {
            log::debug!("FDB: not learning over the flood entry");
            return false;
        }
        if self.entries[key as usize].replace(entry).is_none() {
            self.learned += 1;
        }
        true
    }

    /// Bind `src` to the sender of a datagram.
    #[inline]
    pub fn learn(&mut self, src: &MacAddr, ah: AH, qpn: Qpn) -> bool {
        self.insert(hash_mac(src), ForwardEntry { ah, qpn })
    }

    /// Apply a hint from the RX thread.
    #[inline]
    pub fn apply(&mut self, hint: FdbHint<AH>) -> bool {
        self.insert(hint.key, hint.entry)
    }

    /// Number of learned entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.learned
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.learned == 0
    }
}

/// A learned binding on its way to the TX thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdbHint<AH> {
    pub key: HashKey,
    pub entry: ForwardEntry<AH>,
}

/// Capacity of the hint channel.
pub const HINT_CAPACITY: usize = 1024;

/// RX side of the hint channel.
pub struct FdbHintSender<AH> {
    tx: Sender<FdbHint<AH>>,
    wake: Arc<EventFd>,
}

impl<AH> FdbHintSender<AH> {
    /// Send a hint without blocking. A full channel drops it; the next ARP
    /// from the same host learns it again.
    pub fn send(&self, hint: FdbHint<AH>) -> bool {
        match self.tx.try_send(hint) {
            Ok(()) => {
                if let Err(e) = self.wake.signal() {
                    log::warn!("FDB: failed to wake TX thread: {}", e);
                }
                true
            }
            Err(TrySendError::Full(hint)) => {
                log::debug!("FDB: hint channel full, dropping hint for key {:#06x}", hint.key);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// TX side of the hint channel. Readable through [`AsRawFd`] while hints
/// are queued.
pub struct FdbHintReceiver<AH> {
    rx: Receiver<FdbHint<AH>>,
    wake: Arc<EventFd>,
}

impl<AH> FdbHintReceiver<AH> {
    /// Clear the wake descriptor. Call before draining.
    pub fn clear_wake(&self) -> io::Result<()> {
        self.wake.drain().map(|_| ())
    }

    pub fn try_recv(&self) -> Option<FdbHint<AH>> {
        self.rx.try_recv().ok()
    }
}

impl<AH> AsRawFd for FdbHintReceiver<AH> {
    fn as_raw_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }
}

/// Create a bounded hint channel.
pub fn fdb_hint_channel<AH>() -> io::Result<(FdbHintSender<AH>, FdbHintReceiver<AH>)> {
    let (tx, rx) = channel::bounded(HINT_CAPACITY);
    let wake = Arc::new(EventFd::new()?);
    Ok((
        FdbHintSender {
            tx,
            wake: wake.clone(),
        },
        FdbHintReceiver { rx, wake },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ForwardingTable<u32> {
        ForwardingTable::new(ForwardEntry {
            ah: 0,
            qpn: 0xFF_FFFF,
        })
    }

    #[test]
    fn miss_floods() {
        let t = table();
        let e = t.lookup(&[0x02, 0, 0, 0, 0x12, 0x34]);
        assert_eq!(e.qpn, 0xFF_FFFF);
        assert!(t.is_empty());
    }

    #[test]
    fn learn_then_lookup() {
        let mut t = table();
        let mac = [0x02, 0, 0, 0, 0x12, 0x34];
        assert!(t.learn(&mac, 7, 42));
        assert_eq!(t.lookup(&mac), &ForwardEntry { ah: 7, qpn: 42 });
        assert_eq!(t.get(0x1234).qpn, 42);

        // Replacing keeps the count.
        assert!(t.learn(&mac, 8, 43));
        assert_eq!(t.lookup(&mac).qpn, 43);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn broadcast_always_floods() {
        let mut t = table();
        t.learn(&[0x02, 0, 0, 0, 0xff, 0xff], 1, 1);
        assert_eq!(t.lookup(&[0xff; 6]).qpn, 0xFF_FFFF);
    }

    #[test]
    fn flood_key_is_not_learned() {
        let mut t = table();
        assert!(!t.learn(&[0x02, 1, 2, 3, 0, 0], 9, 9));
        assert_eq!(t.flood().qpn, 0xFF_FFFF);
        assert_eq!(t.get(0).qpn, 0xFF_FFFF);
    }

    #[test]
    fn frame_fields() {
        let mut frame = vec![0u8; 60];
        frame[0..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        frame[6..12].copy_from_slice(&[7, 8, 9, 10, 11, 12]);
        frame[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        assert_eq!(dst_mac(&frame), Some([1, 2, 3, 4, 5, 6]));
        assert_eq!(src_mac(&frame), Some([7, 8, 9, 10, 11, 12]));
        assert_eq!(ethertype(&frame), Some(ETHERTYPE_ARP));
        assert_eq!(ethertype(&frame[..10]), None);
        assert_eq!(hash_mac(&[0, 0, 0, 0, 0xab, 0xcd]), 0xabcd);
    }

    #[test]
    fn hint_channel_is_bounded() {
        let (tx, rx) = fdb_hint_channel::<u32>().unwrap();
        let hint = |key| FdbHint {
            key,
            entry: ForwardEntry { ah: 0, qpn: 1 },
        };
        for k in 0..HINT_CAPACITY as u16 {
            assert!(tx.send(hint(k + 1)));
        }
        assert!(!tx.send(hint(0xffff)));

        rx.clear_wake().unwrap();
        assert_eq!(rx.try_recv().map(|h| h.key), Some(1));
        assert!(tx.send(hint(0xffff)));
    }
}
