//! The slot assigner: sole consumer of `rx_avail`.
//!
//! The RX engine asks for grants; the assigner pulls free guest receive
//! buffers, records them in the connection's [`SlotLedger`] and hands back a
//! ready `MR`/`ASSIGN` message. Requests that cannot be filled yet stay
//! pending until the guest makes more buffers available.

use std::collections::{HashMap, VecDeque};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::RandomState;

use super::*;
use crate::credit::{ControlMessage, SlotLedger};
use crate::fabric::RemoteTarget;
use crate::ring::flag::Consumer;
use crate::ring::Desc;
use crate::util::affinity;

/// Requests from the RX engine.
pub(crate) enum AssignCmd {
    /// A connection was established; grant it a full set of slots.
    Attach {
        conn: ConnId,
        ledger: Arc<SlotLedger>,
        region: RemoteTarget,
    },

    /// The connection crossed its low-water mark.
    Assign { conn: ConnId, count: usize },

    /// The connection is gone; drop its pending requests.
    Detach { conn: ConnId },
}

/// Replies to the RX engine.
#[derive(Debug)]
pub(crate) enum AssignReply {
    /// Send `msg` to the peer of `conn`. `bufs` are the buffers it grants,
    /// already recorded in `ledger`.
    Granted {
        conn: ConnId,
        ledger: Arc<SlotLedger>,
        msg: ControlMessage,
        bufs: Vec<Desc>,
    },

    /// Buffers taken from `rx_avail` that could not be granted; they go
    /// back to the guest unused.
    Returned { bufs: Vec<Desc> },
}

struct Attached {
    ledger: Arc<SlotLedger>,
    region: RemoteTarget,
}

pub(crate) struct SlotAssigner {
    region: Arc<RegionMap<SharedRegion>>,
    rx_avail: Consumer,
    doorbell: Arc<EventFd>,
    cmds: MailboxRx<AssignCmd>,
    replies: MailboxTx<AssignReply>,
    /// Receive buffers smaller than this are never granted.
    min_buf: u32,
    stop: Arc<AtomicBool>,

    attached: HashMap<ConnId, Attached, RandomState>,
    pending: VecDeque<(ConnId, usize)>,
}

impl SlotAssigner {
    const NAME: &'static str = "slot assigner";

    pub fn new(
        region: Arc<RegionMap<SharedRegion>>,
        doorbell: Arc<EventFd>,
        cmds: MailboxRx<AssignCmd>,
        replies: MailboxTx<AssignReply>,
        min_buf: u32,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            region,
            rx_avail: Consumer::new(),
            doorbell,
            cmds,
            replies,
            min_buf,
            stop,
            attached: HashMap::with_hasher(RandomState::new()),
            pending: VecDeque::new(),
        }
    }

    fn handle(&mut self, cmd: AssignCmd) {
        match cmd {
            AssignCmd::Attach {
                conn,
                ledger,
                region,
            } => {
                let count = ledger.vacancy();
                self.attached.insert(conn, Attached { ledger, region });
                self.pending.push_back((conn, count));
            }
            AssignCmd::Assign { conn, count } => {
                if !self.attached.contains_key(&conn) {
                    log::debug!(
                        "{}: ignoring request for detached connection {}",
                        Self::NAME,
                        conn
                    );
                    return;
                }
                self.pending.push_back((conn, count));
            }
            AssignCmd::Detach { conn } => {
                self.attached.remove(&conn);
                self.pending.retain(|&(c, _)| c != conn);
            }
        }
    }

    /// Fill pending requests in order as far as available buffers allow.
    fn serve(&mut self) {
        while let Some(&(conn, count)) = self.pending.front() {
            let Some(att) = self.attached.get(&conn) else {
                self.pending.pop_front();
                continue;
            };
            let want = count.min(att.ledger.vacancy());
            if want == 0 {
                self.pending.pop_front();
                continue;
            }

            let mut bufs = Vec::with_capacity(want);
            let mut small = Vec::new();
            while bufs.len() < want {
                match self.rx_avail.consume(&self.region.rx_avail) {
                    Some(desc) if desc.size < self.min_buf => small.push(desc),
                    Some(desc) => bufs.push(desc),
                    None => break,
                }
            }
            if !small.is_empty() {
                log::warn!(
                    "{}: returning {} receive buffers smaller than {} bytes",
                    Self::NAME,
                    small.len(),
                    self.min_buf
                );
                self.replies.send(AssignReply::Returned { bufs: small });
            }
            if bufs.is_empty() {
                // Wait for the guest unless a buffer raced in while parking.
                if self.rx_avail.park(&self.region.rx_avail) {
                    return;
                }
                continue;
            }

            let granted = bufs.len();
            match att.ledger.grant(&bufs, att.region) {
                Ok(msg) => {
                    log::trace!(
                        "{}: granting {} slots to connection {}",
                        Self::NAME,
                        granted,
                        conn
                    );
                    let ledger = att.ledger.clone();
                    self.replies.send(AssignReply::Granted {
                        conn,
                        ledger,
                        msg,
                        bufs,
                    });
                }
                Err(e) => {
                    if att.ledger.is_closed() {
                        log::debug!("{}: connection {} closed, not granting", Self::NAME, conn);
                        self.attached.remove(&conn);
                    } else {
                        log::error!(
                            "{}: failed to grant {} slots to connection {}: {}",
                            Self::NAME,
                            granted,
                            conn,
                            e
                        );
                    }
                    self.replies.send(AssignReply::Returned { bufs });
                    self.pending.pop_front();
                    continue;
                }
            }

            if granted < count {
                if let Some(front) = self.pending.front_mut() {
                    front.1 = count - granted;
                }
            } else {
                self.pending.pop_front();
            }
        }
    }

    pub fn run(mut self, cpu: Option<usize>) {
        affinity::pin_if_configured(Self::NAME, cpu);

        let mut epoll = match Epoll::new().and_then(|ep| {
            ep.add(self.cmds.as_raw_fd(), token::WAKE)?;
            ep.add(self.doorbell.as_raw_fd(), token::DOORBELL)?;
            Ok(ep)
        }) {
            Ok(ep) => ep,
            Err(e) => {
                log::error!("{}: failed to set up epoll: {}", Self::NAME, e);
                return;
            }
        };

        let mut ready = Vec::new();
        while !self.stop.load(Ordering::Relaxed) {
            ready.clear();
            if let Err(e) = epoll.wait(WAIT_TIMEOUT, &mut ready) {
                log::error!("{}: epoll_wait failed: {}", Self::NAME, e);
                break;
            }
            for &t in &ready {
                match t {
                    token::WAKE => self.cmds.clear_wake(),
                    token::DOORBELL => {
                        if let Err(e) = self.doorbell.drain() {
                            log::warn!("{}: failed to clear doorbell: {}", Self::NAME, e);
                        }
                    }
                    _ => log::debug!("{}: ignoring unknown token {}", Self::NAME, t),
                }
            }

            while let Some(cmd) = self.cmds.try_recv() {
                self.handle(cmd);
            }
            if !self.pending.is_empty() {
                self.serve();
            }
        }
        log::debug!("{}: stopped", Self::NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::MsgKind;
    use crate::ring::flag::Producer;

    fn setup() -> (
        SlotAssigner,
        MailboxTx<AssignCmd>,
        MailboxRx<AssignReply>,
        Producer,
    ) {
        let region = Arc::new(RegionMap::<SharedRegion>::anonymous().unwrap());
        let (cmd_tx, cmd_rx) = mailbox().unwrap();
        let (reply_tx, reply_rx) = mailbox().unwrap();
        let assigner = SlotAssigner::new(
            region,
            Arc::new(EventFd::new().unwrap()),
            cmd_rx,
            reply_tx,
            1024,
            Arc::new(AtomicBool::new(false)),
        );
        (assigner, cmd_tx, reply_rx, Producer::new())
    }

    fn target() -> RemoteTarget {
        RemoteTarget {
            addr: 0x10_0000,
            rkey: 5,
        }
    }

    #[test]
    fn attach_grants_mr_then_partial_assign_waits() {
        let (mut a, _cmd, replies, mut guest) = setup();
        let ledger = Arc::new(SlotLedger::default());

        for i in 0..3 {
            guest
                .produce(&a.region.rx_avail, Desc::new(i, i * 2048, 2048))
                .unwrap();
        }
        a.handle(AssignCmd::Attach {
            conn: 0,
            ledger: ledger.clone(),
            region: target(),
        });
        a.serve();

        let Some(AssignReply::Granted {
            conn, msg, bufs, ..
        }) = replies.try_recv()
        else {
            panic!("expected a grant");
        };
        assert_eq!(conn, 0);
        assert_eq!(msg.kind, MsgKind::Mr);
        assert_eq!(msg.slots(), &[0, 2048, 4096]);
        assert_eq!(bufs.len(), 3);
        assert_eq!(ledger.remaining(), 3);

        // The remaining five wait for the guest.
        assert_eq!(a.pending.front(), Some(&(0, 5)));
        assert!(a.region.rx_avail.is_notify_armed());

        for i in 3..8 {
            guest
                .produce(&a.region.rx_avail, Desc::new(i, i * 2048, 2048))
                .unwrap();
        }
        a.serve();
        let Some(AssignReply::Granted { msg, .. }) = replies.try_recv() else {
            panic!("expected a second grant");
        };
        assert_eq!(msg.kind, MsgKind::Assign);
        assert_eq!(msg.slots().len(), 5);
        assert_eq!(ledger.remaining(), 8);
        assert!(a.pending.is_empty());
    }

    #[test]
    fn detach_drops_pending_requests() {
        let (mut a, _cmd, replies, _guest) = setup();
        a.handle(AssignCmd::Attach {
            conn: 3,
            ledger: Arc::new(SlotLedger::default()),
            region: target(),
        });
        a.serve();
        assert_eq!(a.pending.len(), 1);

        a.handle(AssignCmd::Detach { conn: 3 });
        assert!(a.pending.is_empty());
        a.handle(AssignCmd::Assign { conn: 3, count: 4 });
        assert!(a.pending.is_empty());
        assert!(replies.try_recv().is_none());
    }

    #[test]
    fn closed_ledger_gets_buffers_back() {
        let (mut a, _cmd, replies, mut guest) = setup();
        let ledger = Arc::new(SlotLedger::default());
        a.handle(AssignCmd::Attach {
            conn: 1,
            ledger: ledger.clone(),
            region: target(),
        });
        // Torn down before the assigner got to it.
        ledger.revoke_all();

        for i in 0..2 {
            guest
                .produce(&a.region.rx_avail, Desc::new(i, i * 2048, 2048))
                .unwrap();
        }
        a.serve();
        let Some(AssignReply::Returned { bufs }) = replies.try_recv() else {
            panic!("expected the buffers back");
        };
        assert_eq!(bufs.len(), 2);
        assert!(replies.try_recv().is_none());
        assert!(a.pending.is_empty());
        assert!(!a.attached.contains_key(&1));
    }

    #[test]
    fn small_buffers_are_not_granted() {
        let (mut a, _cmd, replies, mut guest) = setup();
        let ledger = Arc::new(SlotLedger::default());
        guest
            .produce(&a.region.rx_avail, Desc::new(0, 0, 512))
            .unwrap();
        guest
            .produce(&a.region.rx_avail, Desc::new(1, 2048, 2048))
            .unwrap();
        a.handle(AssignCmd::Attach {
            conn: 0,
            ledger: ledger.clone(),
            region: target(),
        });
        a.serve();

        let Some(AssignReply::Returned { bufs }) = replies.try_recv() else {
            panic!("expected the small buffer back");
        };
        assert_eq!(bufs, vec![Desc::new(0, 0, 512)]);
        let Some(AssignReply::Granted { bufs, .. }) = replies.try_recv() else {
            panic!("expected a grant");
        };
        assert_eq!(bufs, vec![Desc::new(1, 2048, 2048)]);
        assert_eq!(ledger.remaining(), 1);
    }
}
