//! Single-threaded reactor: readiness watchers and one-shot "again"
//! timers.
//!
//! `Connection` only needs to arm/disarm a read watcher, a write
//! watcher, and two repeat timers on its own descriptor; it never
//! needs to know how the surrounding accept loop dispatches events
//! back to it, so that dispatch (mapping a fired [`WatcherId`] back to
//! a `Connection`) is left to the listener/acceptor, which is out of
//! scope here.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest as MioInterest, Poll, Token};

pub type WatcherId = usize;
pub type TimerId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl From<Interest> for MioInterest {
    fn from(i: Interest) -> Self {
        match i {
            Interest::Read => MioInterest::READABLE,
            Interest::Write => MioInterest::WRITABLE,
        }
    }
}

/// An event delivered by [`Reactor::turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Readable(WatcherId),
    Writable(WatcherId),
    TimerExpired(TimerId),
}

/// The EventLoop interface consumed by `Connection`.
/// Arming (`io_start`/`timer_again`) and disarming (`io_stop`/
/// `timer_stop`) are both idempotent.
pub trait Reactor {
    fn io_init(&self, fd: RawFd, interest: Interest) -> WatcherId;
    fn io_start(&self, id: WatcherId);
    fn io_stop(&self, id: WatcherId);
    fn io_is_active(&self, id: WatcherId) -> bool;
    /// Disarm and forget the watcher entirely (used by `disconnect`).
    fn io_free(&self, id: WatcherId);

    /// Create a repeat timer, initially unarmed.
    fn timer_init(&self, repeat: Duration) -> TimerId;
    /// Re-arm with a new repeat value, snapshotting `now + repeat` as
    /// the next deadline.
    fn timer_again_with(&self, id: TimerId, repeat: Duration);
    /// Re-arm using the timer's currently stored repeat value.
    fn timer_again(&self, id: TimerId);
    fn timer_stop(&self, id: TimerId);
    fn timer_is_active(&self, id: TimerId) -> bool;
    /// Remaining time until `id` expires, or `None` if inactive.
    fn timer_remaining(&self, id: TimerId) -> Option<Duration>;
}

struct Watcher {
    fd: RawFd,
    interest: Interest,
    active: bool,
}

#[derive(Clone, Copy)]
struct TimerState {
    repeat: Duration,
    deadline: Option<Instant>,
}

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    // Generation at the time this entry was pushed; stale entries
    // (superseded by a later `timer_again`) are dropped when popped.
    generation: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so `BinaryHeap` (a max-heap) pops the earliest deadline.
        other.deadline.cmp(&self.deadline)
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `mio`-backed reactor: one `Poll` instance shared by every
/// connection's watchers, plus a min-heap of timer deadlines checked
/// on every [`MioReactor::turn`].
pub struct MioReactor {
    poll: RefCell<Poll>,
    watchers: RefCell<Vec<Option<Watcher>>>,
    /// Combined interest currently registered with `Poll` for each fd.
    /// A read watcher and a write watcher on the same fd (the normal
    /// case: `Connection` creates one of each) share a single
    /// registration, since registering the same fd twice is an error.
    registered: RefCell<HashMap<RawFd, MioInterest>>,
    timers: RefCell<Vec<Option<TimerState>>>,
    timer_gen: RefCell<Vec<u64>>,
    heap: RefCell<BinaryHeap<TimerEntry>>,
    clock: Box<dyn Fn() -> Instant>,
}

impl MioReactor {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            poll: RefCell::new(Poll::new()?),
            watchers: RefCell::new(Vec::new()),
            registered: RefCell::new(HashMap::new()),
            timers: RefCell::new(Vec::new()),
            timer_gen: RefCell::new(Vec::new()),
            heap: RefCell::new(BinaryHeap::new()),
            clock: Box::new(Instant::now),
        })
    }

    /// Union of the interests of every *active* watcher on `fd`,
    /// optionally overriding one watcher's active state (used to
    /// compute the desired interest before actually flipping it).
    fn active_interest(&self, fd: RawFd, overlay: Option<(WatcherId, bool)>) -> Option<MioInterest> {
        let watchers = self.watchers.borrow();
        let mut acc: Option<MioInterest> = None;
        for (wid, slot) in watchers.iter().enumerate() {
            let Some(w) = slot else { continue };
            if w.fd != fd {
                continue;
            }
            let active = match overlay {
                Some((oid, state)) if oid == wid => state,
                _ => w.active,
            };
            if !active {
                continue;
            }
            acc = Some(match acc {
                Some(i) => i | MioInterest::from(w.interest),
                None => MioInterest::from(w.interest),
            });
        }
        acc
    }

    /// The id of the active watcher on `fd` matching `interest`, used
    /// to turn a per-fd mio token back into the `WatcherId` a
    /// readable/writable event should be reported against.
    fn watcher_for(&self, fd: RawFd, interest: Interest) -> Option<WatcherId> {
        self.watchers
            .borrow()
            .iter()
            .position(|slot| matches!(slot, Some(w) if w.fd == fd && w.interest == interest && w.active))
    }

    fn now(&self) -> Instant {
        (self.clock)()
    }

    /// Block for up to `budget` (or until a watcher/timer fires) and
    /// return the events observed. Should be called in a loop by the
    /// owning accept loop / test harness.
    pub fn turn(&self, budget: Duration) -> Vec<Event> {
        let deadline = self.next_timer_deadline();
        let wait = match deadline {
            Some(d) => {
                let now = self.now();
                if d <= now {
                    Duration::ZERO
                } else {
                    budget.min(d - now)
                }
            }
            None => budget,
        };

        let mut events = Events::with_capacity(128);
        let _ = self.poll.borrow_mut().poll(&mut events, Some(wait));

        let mut out = Vec::new();
        for ev in events.iter() {
            let fd = ev.token().0 as RawFd;
            if ev.is_readable() {
                if let Some(id) = self.watcher_for(fd, Interest::Read) {
                    out.push(Event::Readable(id));
                }
            }
            if ev.is_writable() {
                if let Some(id) = self.watcher_for(fd, Interest::Write) {
                    out.push(Event::Writable(id));
                }
            }
        }
        out.extend(self.pop_expired_timers());
        out
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        self.heap.borrow().peek().map(|e| e.deadline)
    }

    fn pop_expired_timers(&self) -> Vec<Event> {
        let now = self.now();
        let mut out = Vec::new();
        let mut heap = self.heap.borrow_mut();
        let gens = self.timer_gen.borrow();
        let timers = self.timers.borrow();
        while let Some(top) = heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = heap.pop().unwrap();
            if gens[entry.id] != entry.generation {
                continue; // superseded by a later re-arm
            }
            if let Some(Some(state)) = timers.get(entry.id) {
                if state.deadline == Some(entry.deadline) {
                    out.push(Event::TimerExpired(entry.id));
                }
            }
        }
        out
    }
}

impl Reactor for MioReactor {
    fn io_init(&self, fd: RawFd, interest: Interest) -> WatcherId {
        let mut watchers = self.watchers.borrow_mut();
        watchers.push(Some(Watcher {
            fd,
            interest,
            active: false,
        }));
        watchers.len() - 1
    }

    fn io_start(&self, id: WatcherId) {
        let fd = match self.watchers.borrow().get(id) {
            Some(Some(w)) if !w.active => w.fd,
            _ => return,
        };
        let wanted = self
            .active_interest(fd, Some((id, true)))
            .expect("starting a watcher always yields a non-empty interest");
        let token = Token(fd as usize);
        let mut registered = self.registered.borrow_mut();
        let poll = self.poll.borrow();
        match registered.get(&fd) {
            Some(_) => {
                let _ = poll.registry().reregister(&mut SourceFd(&fd), token, wanted);
            }
            None => {
                let _ = poll.registry().register(&mut SourceFd(&fd), token, wanted);
            }
        }
        registered.insert(fd, wanted);
        drop(poll);
        drop(registered);
        if let Some(Some(w)) = self.watchers.borrow_mut().get_mut(id) {
            w.active = true;
        }
    }

    fn io_stop(&self, id: WatcherId) {
        let fd = match self.watchers.borrow().get(id) {
            Some(Some(w)) if w.active => w.fd,
            _ => return,
        };
        let remaining = self.active_interest(fd, Some((id, false)));
        let mut registered = self.registered.borrow_mut();
        let poll = self.poll.borrow();
        match remaining {
            Some(wanted) => {
                let token = Token(fd as usize);
                let _ = poll.registry().reregister(&mut SourceFd(&fd), token, wanted);
                registered.insert(fd, wanted);
            }
            None => {
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
                registered.remove(&fd);
            }
        }
        drop(poll);
        drop(registered);
        if let Some(Some(w)) = self.watchers.borrow_mut().get_mut(id) {
            w.active = false;
        }
    }

    fn io_is_active(&self, id: WatcherId) -> bool {
        matches!(self.watchers.borrow().get(id), Some(Some(w)) if w.active)
    }

    fn io_free(&self, id: WatcherId) {
        self.io_stop(id);
        if let Some(slot) = self.watchers.borrow_mut().get_mut(id) {
            *slot = None;
        }
    }

    fn timer_init(&self, repeat: Duration) -> TimerId {
        let mut timers = self.timers.borrow_mut();
        let mut gens = self.timer_gen.borrow_mut();
        timers.push(Some(TimerState {
            repeat,
            deadline: None,
        }));
        gens.push(0);
        timers.len() - 1
    }

    fn timer_again_with(&self, id: TimerId, repeat: Duration) {
        let mut timers = self.timers.borrow_mut();
        let Some(Some(state)) = timers.get_mut(id) else {
            return;
        };
        state.repeat = repeat;
        let deadline = self.now() + repeat;
        state.deadline = Some(deadline);
        drop(timers);
        let mut gens = self.timer_gen.borrow_mut();
        gens[id] += 1;
        self.heap.borrow_mut().push(TimerEntry {
            deadline,
            id,
            generation: gens[id],
        });
    }

    fn timer_again(&self, id: TimerId) {
        let repeat = match self.timers.borrow().get(id) {
            Some(Some(state)) => state.repeat,
            _ => return,
        };
        self.timer_again_with(id, repeat);
    }

    fn timer_stop(&self, id: TimerId) {
        if let Some(Some(state)) = self.timers.borrow_mut().get_mut(id) {
            state.deadline = None;
        }
    }

    fn timer_is_active(&self, id: TimerId) -> bool {
        matches!(self.timers.borrow().get(id), Some(Some(s)) if s.deadline.is_some())
    }

    fn timer_remaining(&self, id: TimerId) -> Option<Duration> {
        let timers = self.timers.borrow();
        let state = timers.get(id)?.as_ref()?;
        let deadline = state.deadline?;
        let now = self.now();
        Some(deadline.saturating_duration_since(now))
    }
}

/// Bookkeeping-only reactor for unit tests: records arm/disarm calls
/// without touching real file descriptors, so invariants like
/// "`wt` disarmed after a no-budget write" can be asserted directly.
pub struct TestReactor {
    watchers: RefCell<Vec<bool>>,
    timers: RefCell<Vec<(Duration, bool)>>,
    now: Cell<Instant>,
}

impl Default for TestReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl TestReactor {
    pub fn new() -> Self {
        Self {
            watchers: RefCell::new(Vec::new()),
            timers: RefCell::new(Vec::new()),
            now: Cell::new(Instant::now()),
        }
    }

    pub fn set_now(&self, t: Instant) {
        self.now.set(t);
    }

    pub fn advance(&self, d: Duration) {
        self.now.set(self.now.get() + d);
    }
}

impl Reactor for TestReactor {
    fn io_init(&self, _fd: RawFd, _interest: Interest) -> WatcherId {
        let mut w = self.watchers.borrow_mut();
        w.push(false);
        w.len() - 1
    }
    fn io_start(&self, id: WatcherId) {
        if let Some(slot) = self.watchers.borrow_mut().get_mut(id) {
            *slot = true;
        }
    }
    fn io_stop(&self, id: WatcherId) {
        if let Some(slot) = self.watchers.borrow_mut().get_mut(id) {
            *slot = false;
        }
    }
    fn io_is_active(&self, id: WatcherId) -> bool {
        self.watchers.borrow().get(id).copied().unwrap_or(false)
    }
    fn io_free(&self, id: WatcherId) {
        self.io_stop(id);
    }

    fn timer_init(&self, repeat: Duration) -> TimerId {
        let mut t = self.timers.borrow_mut();
        t.push((repeat, false));
        t.len() - 1
    }
    fn timer_again_with(&self, id: TimerId, repeat: Duration) {
        if let Some(slot) = self.timers.borrow_mut().get_mut(id) {
            *slot = (repeat, true);
        }
    }
    fn timer_again(&self, id: TimerId) {
        if let Some(slot) = self.timers.borrow_mut().get_mut(id) {
            slot.1 = true;
        }
    }
    fn timer_stop(&self, id: TimerId) {
        if let Some(slot) = self.timers.borrow_mut().get_mut(id) {
            slot.1 = false;
        }
    }
    fn timer_is_active(&self, id: TimerId) -> bool {
        self.timers.borrow().get(id).map(|(_, a)| *a).unwrap_or(false)
    }
    fn timer_remaining(&self, id: TimerId) -> Option<Duration> {
        let timers = self.timers.borrow();
        let (repeat, active) = *timers.get(id)?;
        active.then_some(repeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_start_stop_idempotent() {
        let r = TestReactor::new();
        let w = r.io_init(0, Interest::Write);
        assert!(!r.io_is_active(w));
        r.io_start(w);
        r.io_start(w);
        assert!(r.io_is_active(w));
        r.io_stop(w);
        r.io_stop(w);
        assert!(!r.io_is_active(w));
    }

    #[test]
    fn timer_again_arms() {
        let r = TestReactor::new();
        let t = r.timer_init(Duration::from_secs(5));
        assert!(!r.timer_is_active(t));
        r.timer_again(t);
        assert!(r.timer_is_active(t));
        r.timer_stop(t);
        assert!(!r.timer_is_active(t));
    }

    /// A read watcher and a write watcher on the same fd must both
    /// deliver events: registering the fd twice (once per watcher)
    /// would make the second registration fail silently and leave
    /// whichever watcher lost the race deaf.
    #[test]
    fn read_and_write_watcher_share_one_fd_registration() {
        use std::io::Write;
        use std::os::unix::io::IntoRawFd;
        use std::os::unix::net::UnixStream;

        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.into_raw_fd();

        let r = MioReactor::new().unwrap();
        let rw = r.io_init(fd, Interest::Read);
        let ww = r.io_init(fd, Interest::Write);
        r.io_start(rw);
        r.io_start(ww);

        // `a` is writable immediately (empty send buffer); `b` writing
        // into the pair makes `a` also readable.
        let mut b = b;
        b.write_all(b"hi").unwrap();

        let mut seen_read = false;
        let mut seen_write = false;
        for _ in 0..20 {
            for ev in r.turn(Duration::from_millis(50)) {
                match ev {
                    Event::Readable(id) if id == rw => seen_read = true,
                    Event::Writable(id) if id == ww => seen_write = true,
                    _ => {}
                }
            }
            if seen_read && seen_write {
                break;
            }
        }
        assert!(seen_read, "read watcher never fired");
        assert!(seen_write, "write watcher never fired");

        r.io_stop(rw);
        r.io_stop(ww);
        unsafe { libc::close(fd) };
    }
}
