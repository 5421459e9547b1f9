//! Adaptive interrupt moderation.
//!
//! Under load, doorbells are turned off and a periodic timer drives polling;
//! once the ring stays idle for long enough, the timer stops and doorbells
//! come back. This trades a little latency on the first packet of a burst for
//! far fewer wake-ups during it.

/// Decision after a polling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Keep the timer running.
    Continue,

    /// Idle for `retry` ticks: disarm the timer, re-arm doorbells and
    /// re-check the ring.
    Stop,
}

/// Doorbell/timer mode switch for one ring.
#[derive(Debug, Clone)]
pub struct Moderator {
    retry: u32,
    misses: u32,
    polling: bool,
}

impl Moderator {
    pub fn new(retry: u32) -> Self {
        Self {
            retry: retry.max(1),
            misses: 0,
            polling: false,
        }
    }

    #[inline]
    pub fn is_polling(&self) -> bool {
        self.polling
    }

    /// A doorbell arrived. Returns `true` if polling starts now and the
    /// timer must be armed.
    pub fn on_doorbell(&mut self) -> bool {
        self.misses = 0;
        !std::mem::replace(&mut self.polling, true)
    }

    /// A timer tick polled the ring; `found` tells whether it had work.
    pub fn on_tick(&mut self, found: bool) -> Tick {
        if !self.polling {
            return Tick::Stop;
        }
        if found {
            self.misses = 0;
            return Tick::Continue;
        }
        self.misses += 1;
        if self.misses >= self.retry {
            self.polling = false;
            self.misses = 0;
            Tick::Stop
        } else {
            Tick::Continue
        }
    }

    /// Work raced in while re-arming doorbells: keep polling.
    pub fn resume(&mut self) {
        self.polling = true;
        self.misses = 0;
    }
}

/// Batches receive notifications to the guest.
#[derive(Debug, Clone)]
pub struct IrqCoalescer {
    budget: usize,
    pending: usize,
}

impl IrqCoalescer {
    pub fn new(budget: usize) -> Self {
        Self { budget, pending: 0 }
    }

    /// Record `n` completed receives. Returns `true` once more than
    /// `budget` are pending.
    #[inline]
    pub fn add(&mut self, n: usize) -> bool {
        self.pending += n;
        self.pending > self.budget
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Forget pending completions after notifying. Returns how many there were.
    #[inline]
    pub fn flush(&mut self) -> usize {
        std::mem::take(&mut self.pending)
    }
}
