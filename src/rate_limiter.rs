//! Token-bucket rate limiter.
//!
//! Two instances live on each `Connection`, one per direction. `rate
//! == 0` means "unlimited": `avail()` returns `usize::MAX` and
//! `drain()` is a no-op. The limiter never fails outright; it clips
//! requested I/O sizes down to `avail()` instead.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use crate::clock::Clock;
use crate::event_loop::{Reactor, WatcherId};

pub struct RateLimiter<R: Reactor> {
    rate: u64,
    burst: u64,
    tokens: Cell<u64>,
    last_refill: Cell<Instant>,
    clock: Rc<dyn Clock>,
    reactor: Rc<R>,
    watcher: WatcherId,
    /// Set on the read limiter only: lets the TLS engine tell us it
    /// already has decrypted bytes queued, so a synthetic readable
    /// event can be scheduled without waiting on the kernel.
    pending_tls_read: Cell<bool>,
}

impl<R: Reactor> RateLimiter<R> {
    pub fn new(rate: u64, burst: u64, clock: Rc<dyn Clock>, reactor: Rc<R>, watcher: WatcherId) -> Self {
        Self {
            rate,
            burst,
            tokens: Cell::new(burst),
            last_refill: Cell::new(clock.now()),
            clock,
            reactor,
            watcher,
            pending_tls_read: Cell::new(false),
        }
    }

    fn refill(&self) {
        if self.rate == 0 {
            return;
        }
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(self.last_refill.get());
        if elapsed.is_zero() {
            return;
        }
        let gained = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if gained == 0 {
            // Don't advance `last_refill` on a sub-tick elapsed, or
            // fractional tokens accumulated so far would be lost.
            return;
        }
        self.tokens.set((self.tokens.get() + gained).min(self.burst));
        self.last_refill.set(now);
    }

    /// Current token count; `usize::MAX` when unlimited.
    pub fn avail(&self) -> usize {
        if self.rate == 0 {
            return usize::MAX;
        }
        self.refill();
        self.tokens.get().min(usize::MAX as u64) as usize
    }

    /// Subtract `n` tokens. Precondition: `n <= avail()`.
    pub fn drain(&self, n: usize) {
        if self.rate == 0 {
            return;
        }
        let n = n as u64;
        self.tokens.set(self.tokens.get().saturating_sub(n));
    }

    pub fn startw(&self) {
        self.reactor.io_start(self.watcher);
    }

    pub fn stopw(&self) {
        self.reactor.io_stop(self.watcher);
    }

    /// Read-side only: the TLS engine already holds plaintext it
    /// could deliver without a further kernel read. Record that so
    /// the reactor can be told to re-check this connection promptly.
    pub fn handle_tls_pending_read(&self) {
        self.pending_tls_read.set(true);
        self.startw();
    }

    pub fn take_pending_tls_read(&self) -> bool {
        self.pending_tls_read.replace(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event_loop::{Interest, TestReactor};
    use std::time::Duration;

    fn limiter(rate: u64, burst: u64) -> (RateLimiter<TestReactor>, ManualClock) {
        let clock = ManualClock::new();
        let reactor = Rc::new(TestReactor::new());
        let w = reactor.io_init(0, Interest::Write);
        let rl = RateLimiter::new(rate, burst, Rc::new(clock.clone()), reactor, w);
        (rl, clock)
    }

    #[test]
    fn unlimited_when_rate_zero() {
        let (rl, _clock) = limiter(0, 0);
        assert_eq!(rl.avail(), usize::MAX);
        rl.drain(1_000_000);
        assert_eq!(rl.avail(), usize::MAX);
    }

    #[test]
    fn drain_reduces_tokens() {
        let (rl, _clock) = limiter(100, 1000);
        assert_eq!(rl.avail(), 1000);
        rl.drain(400);
        assert_eq!(rl.avail(), 600);
    }

    #[test]
    fn refill_caps_at_burst() {
        let (rl, clock) = limiter(100, 1000);
        rl.drain(1000);
        assert_eq!(rl.avail(), 0);
        clock.advance(Duration::from_secs(100));
        assert_eq!(rl.avail(), 1000);
    }

    #[test]
    fn refill_matches_rate() {
        let (rl, clock) = limiter(100, 1000);
        rl.drain(1000);
        clock.advance(Duration::from_secs(1));
        assert_eq!(rl.avail(), 100);
    }

    #[test]
    fn startw_stopw_idempotent_via_reactor() {
        let clock = ManualClock::new();
        let reactor = Rc::new(TestReactor::new());
        let w = reactor.io_init(0, Interest::Write);
        let rl = RateLimiter::new(10, 10, Rc::new(clock), reactor.clone(), w);
        rl.startw();
        rl.startw();
        assert!(reactor.io_is_active(w));
        rl.stopw();
        assert!(!reactor.io_is_active(w));
    }
}
