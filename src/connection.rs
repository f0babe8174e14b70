//! The connection core itself.
//!
//! `Connection` is the composite owning the socket descriptor, the
//! two watchers, the two timers, the two rate limiters, the TLS
//! engine (or none), the early buffer, and the dynamic-record-size
//! state. It is the entry point for all protocol code above it.

use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::early_buffer::EarlyBuffer;
use crate::error::IoResult;
use crate::event_loop::{Event, Interest, Reactor, TimerId, WatcherId};
use crate::rate_limiter::RateLimiter;
use crate::sock::{self, TcpHint};
use crate::tls_engine::{EarlyIo, TlsEngine, TlsIo};

/// The three protocols this core can sit underneath.
/// HTTP/3 owns its socket through the QUIC engine: the core neither
/// polls it for readability nor closes it on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Http1,
    Http2,
    Http3,
}

/// Configuration for one direction's token bucket.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub rate: u64,
    pub burst: u64,
}

impl RateLimiterConfig {
    pub const fn unlimited() -> Self {
        Self { rate: 0, burst: 0 }
    }
}

/// User-settable callbacks invoked when the surrounding event loop
/// delivers a watcher or timer event for this connection.
pub trait ConnectionCallbacks {
    fn on_write(&mut self);
    fn on_read(&mut self);
    fn on_timeout(&mut self);
}

/// Outcome of [`Connection::tls_handshake`]: the typed
/// equivalent of the `0`/`INPROGRESS`/`NETWORK`/`EOF`/`-1` sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Complete,
    InProgress,
    Network,
    Eof,
    Http2PolicyViolation,
}

const SMALL_RECORD: usize = 1300;

/// The `tls` sub-record of the data model.
struct TlsState<T: TlsEngine> {
    engine: T,
    fd_bound: bool,
    is_server: bool,
    handshake_done: bool,
    early_data_finish: bool,
    earlybuf: EarlyBuffer,
    /// Zero means "no stored call".
    last_writelen: usize,
    last_readlen: usize,
    warmup_writelen: u64,
    /// `None` means "currently active"; `Some(t)` records when the
    /// write path went idle. An `Option` avoids needing an arbitrary
    /// magic `Instant` to mean "not idle".
    last_write_idle: Option<Instant>,
    no_postpone_early_data: bool,
    no_http2_cipher_block_list: bool,
}

impl<T: TlsEngine> TlsState<T> {
    fn new(engine: T, is_server: bool) -> Self {
        Self {
            is_server,
            engine,
            fd_bound: false,
            handshake_done: false,
            early_data_finish: false,
            earlybuf: EarlyBuffer::new(),
            last_writelen: 0,
            last_readlen: 0,
            warmup_writelen: 0,
            last_write_idle: None,
            no_postpone_early_data: false,
            no_http2_cipher_block_list: false,
        }
    }
}

/// Result classification of one engine call through the early-data
/// or handshake driver, before HTTP/2 validation. "Provisionally
/// complete" (0-RTT accepted before the full handshake finishes) is
/// its own variant rather than a magic `TlsIo::Progress`.
enum HandshakeRv {
    Io(TlsIo),
    ProvisionallyComplete,
}

/// The composite per-socket object.
pub struct Connection<R: Reactor, T: TlsEngine> {
    fd: RawFd,
    proto: Proto,
    tls: Option<TlsState<T>>,
    rlimit: RateLimiter<R>,
    wlimit: RateLimiter<R>,
    read_watcher: WatcherId,
    write_watcher: WatcherId,
    rt: TimerId,
    wt: TimerId,
    read_timeout: Duration,
    last_read: Instant,
    rec_warmup_threshold: u64,
    rec_idle_timeout: Duration,
    reactor: Rc<R>,
    clock: Rc<dyn Clock>,
    callbacks: Box<dyn ConnectionCallbacks>,
}

impl<R: Reactor, T: TlsEngine> Connection<R, T> {
    /// Constructs a connection with watchers and timers initialized
    /// but not armed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fd: RawFd,
        reactor: Rc<R>,
        clock: Rc<dyn Clock>,
        tls_engine: Option<T>,
        write_timeout: Duration,
        read_timeout: Duration,
        read_limit: RateLimiterConfig,
        write_limit: RateLimiterConfig,
        callbacks: Box<dyn ConnectionCallbacks>,
        rec_warmup_threshold: u64,
        rec_idle_timeout: Duration,
        proto: Proto,
    ) -> Self {
        let read_watcher = reactor.io_init(fd, Interest::Read);
        let write_watcher = reactor.io_init(fd, Interest::Write);
        let rt = reactor.timer_init(read_timeout);
        let wt = reactor.timer_init(write_timeout);
        let rlimit = RateLimiter::new(
            read_limit.rate,
            read_limit.burst,
            clock.clone(),
            reactor.clone(),
            read_watcher,
        );
        let wlimit = RateLimiter::new(
            write_limit.rate,
            write_limit.burst,
            clock.clone(),
            reactor.clone(),
            write_watcher,
        );
        let is_server = tls_engine.as_ref().map(|e| e.is_server()).unwrap_or(false);
        let tls = tls_engine.map(|engine| TlsState::new(engine, is_server));
        let last_read = clock.now();
        Self {
            fd,
            proto,
            tls,
            rlimit,
            wlimit,
            read_watcher,
            write_watcher,
            rt,
            wt,
            read_timeout,
            last_read,
            rec_warmup_threshold,
            rec_idle_timeout,
            reactor,
            clock,
            callbacks,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }

    pub fn is_handshake_done(&self) -> bool {
        self.tls.as_ref().map(|t| t.handshake_done).unwrap_or(true)
    }

    pub fn set_no_postpone_early_data(&mut self, v: bool) {
        if let Some(tls) = self.tls.as_mut() {
            tls.no_postpone_early_data = v;
        }
    }

    pub fn set_no_http2_cipher_block_list(&mut self, v: bool) {
        if let Some(tls) = self.tls.as_mut() {
            tls.no_http2_cipher_block_list = v;
        }
    }

    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.tls.as_ref().and_then(|t| t.engine.alpn_protocol())
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.tls.as_ref().and_then(|t| t.engine.protocol_version())
    }

    pub fn cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        self.tls.as_ref().and_then(|t| t.engine.cipher_suite())
    }

    /// Puts the engine in connect-side bookkeeping and forces
    /// `early_data_finish`: clients in this role never consume early
    /// data.
    pub fn prepare_client_handshake(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.is_server = false;
            tls.early_data_finish = true;
        }
    }

    /// Marks accept-side bookkeeping.
    pub fn prepare_server_handshake(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.is_server = true;
        }
    }

    /// Dispatches one event from [`Reactor::turn`] to the stored
    /// callbacks. Dispatch of *which* connection an event belongs to
    /// is the accept loop's job; this only recognizes events on this
    /// connection's own watchers/timers.
    pub fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Readable(id) if id == self.read_watcher => self.callbacks.on_read(),
            Event::Writable(id) if id == self.write_watcher => self.callbacks.on_write(),
            Event::TimerExpired(id) if id == self.rt || id == self.wt => {
                self.callbacks.on_timeout()
            }
            _ => {}
        }
    }

    // ---- handshake state machine -----------------------------

    /// Drives the handshake.
    /// Invoked by the reactor on either readability or writability
    /// while handshaking.
    pub fn tls_handshake(&mut self) -> HandshakeOutcome {
        // "On every entry it disarms the write watcher and write
        // timer" - re-armed selectively below.
        self.wlimit.stopw();
        self.reactor.timer_stop(self.wt);

        if self.tls.is_none() {
            return HandshakeOutcome::Complete;
        }

        if self.tls.as_ref().unwrap().handshake_done {
            return self.write_pending_post_handshake();
        }

        if !self.tls.as_ref().unwrap().fd_bound {
            let fd = self.fd;
            let tls = self.tls.as_mut().unwrap();
            tls.engine.set_fd(fd);
            tls.fd_bound = true;
        }

        let is_server = self.tls.as_ref().unwrap().is_server;
        let early_data_finish = self.tls.as_ref().unwrap().early_data_finish;

        let rv = if is_server && !early_data_finish {
            self.drive_early_data()
        } else {
            HandshakeRv::Io(self.tls.as_mut().unwrap().engine.do_handshake())
        };

        match rv {
            HandshakeRv::ProvisionallyComplete => {
                // rv = 1: skip steps 5/6 entirely and go straight to
                // HTTP/2 validation; the engine handshake itself is
                // still running underneath and will finish on a later
                // entry.
            }
            HandshakeRv::Io(TlsIo::WantRead) => return HandshakeOutcome::InProgress,
            HandshakeRv::Io(TlsIo::WantWrite) => {
                self.wlimit.startw();
                self.reactor.timer_again(self.wt);
                return HandshakeOutcome::InProgress;
            }
            HandshakeRv::Io(TlsIo::ProtocolError(e)) => {
                log::warn!("tls handshake failed: {e}");
                return HandshakeOutcome::Network;
            }
            HandshakeRv::Io(TlsIo::CleanClose) => return HandshakeOutcome::Eof,
            HandshakeRv::Io(TlsIo::Progress(_)) => {
                // Step 6: apply the post-handshake flush-read
                // unconditionally rather
                // than gating it on a specific backend.
                if self.tls.as_ref().unwrap().engine.is_handshaking() {
                    let mut scratch = [0u8; 16 * 1024];
                    let tls = self.tls.as_mut().unwrap();
                    match tls.engine.read(&mut scratch) {
                        TlsIo::Progress(n) => {
                            // Bytes read here still belong to the
                            // 0-RTT stream; fall through to the HTTP/2
                            // check rather than returning early.
                            tls.earlybuf.append(&scratch[..n]);
                        }
                        TlsIo::WantRead | TlsIo::WantWrite => {
                            return HandshakeOutcome::InProgress
                        }
                        TlsIo::CleanClose => return HandshakeOutcome::Eof,
                        TlsIo::ProtocolError(e) => {
                            log::warn!("post-handshake flush read failed: {e}");
                            return HandshakeOutcome::Network;
                        }
                    }
                }
            }
        }

        if !self.check_http2_requirements() {
            return HandshakeOutcome::Http2PolicyViolation;
        }

        self.tls.as_mut().unwrap().handshake_done = true;
        self.write_pending_post_handshake()
    }

    fn drive_early_data(&mut self) -> HandshakeRv {
        let mut scratch = [0u8; 16 * 1024];
        loop {
            let tls = self.tls.as_mut().unwrap();
            match tls.engine.read_early_data(&mut scratch) {
                EarlyIo::WantRead => {
                    return if tls.no_postpone_early_data && !tls.earlybuf.is_empty() {
                        HandshakeRv::ProvisionallyComplete
                    } else {
                        HandshakeRv::Io(TlsIo::WantRead)
                    };
                }
                EarlyIo::NoEarlyData => {
                    tls.early_data_finish = true;
                    return HandshakeRv::Io(tls.engine.do_handshake());
                }
                EarlyIo::Data(n) => {
                    tls.earlybuf.append(&scratch[..n]);
                    continue;
                }
                EarlyIo::EndOfEarlyData => {
                    tls.early_data_finish = true;
                    return if tls.no_postpone_early_data && !tls.earlybuf.is_empty() {
                        HandshakeRv::ProvisionallyComplete
                    } else {
                        HandshakeRv::Io(tls.engine.do_handshake())
                    };
                }
                EarlyIo::ProtocolError(e) => {
                    log::warn!("early data read failed: {e}");
                    return HandshakeRv::Io(TlsIo::ProtocolError(e));
                }
            }
        }
    }

    /// Flushes any ciphertext the engine still wants to write after a
    /// completed (or already-complete) handshake, e.g. session
    /// tickets. A zero-length application write through the normal
    /// `write` primitive does exactly this: drain the backlog first,
    /// touch nothing new.
    fn write_pending_post_handshake(&mut self) -> HandshakeOutcome {
        let Some(tls) = self.tls.as_mut() else {
            return HandshakeOutcome::Complete;
        };
        match tls.engine.write(&[]) {
            TlsIo::Progress(_) | TlsIo::WantRead => HandshakeOutcome::Complete,
            TlsIo::WantWrite => {
                self.wlimit.startw();
                self.reactor.timer_again(self.wt);
                HandshakeOutcome::Complete
            }
            TlsIo::CleanClose => HandshakeOutcome::Eof,
            TlsIo::ProtocolError(e) => {
                log::warn!("post-handshake flush write failed: {e}");
                HandshakeOutcome::Network
            }
        }
    }

    // ---- HTTP/2 requirement check ----------------------------

    fn check_http2_requirements(&self) -> bool {
        let Some(tls) = self.tls.as_ref() else {
            return true;
        };
        let Some(alpn) = tls.engine.alpn_protocol() else {
            return true;
        };
        if alpn != b"h2" {
            return true;
        }
        let Some(version) = tls.engine.protocol_version() else {
            return false;
        };
        if u16::from(version) < u16::from(rustls::ProtocolVersion::TLSv1_2) {
            return false;
        }
        if !tls.no_http2_cipher_block_list {
            if let Some(suite) = tls.engine.cipher_suite() {
                if is_http2_cipher_blocked(suite.suite()) {
                    return false;
                }
            }
        }
        true
    }

    // ---- dynamic TLS record sizing ---------------------------

    fn get_tls_write_limit(&mut self) -> usize {
        if self.rec_warmup_threshold == 0 {
            return usize::MAX;
        }
        let now = self.clock.now();
        let threshold = self.rec_warmup_threshold;
        let idle_timeout = self.rec_idle_timeout;
        let Some(tls) = self.tls.as_mut() else {
            return usize::MAX;
        };
        if let Some(idle_since) = tls.last_write_idle {
            if now.saturating_duration_since(idle_since) > idle_timeout {
                tls.warmup_writelen = 0;
                return SMALL_RECORD;
            }
        }
        if tls.warmup_writelen >= threshold {
            usize::MAX
        } else {
            SMALL_RECORD
        }
    }

    /// Called by the protocol layer when its send queue has drained.
    /// Only samples the clock if the write path is currently active,
    /// so repeated calls while already idle don't slide the timestamp
    /// forward.
    pub fn start_tls_write_idle(&mut self) {
        let now = self.clock.now();
        if let Some(tls) = self.tls.as_mut() {
            if tls.last_write_idle.is_none() {
                tls.last_write_idle = Some(now);
            }
        }
    }

    // ---- byte-level I/O operations ----------------------------

    pub fn write_tls(&mut self, data: &[u8]) -> IoResult {
        if self.tls.is_none() {
            return IoResult::Network;
        }

        let resumed = self.tls.as_ref().unwrap().last_writelen;
        let len = if resumed != 0 {
            self.tls.as_mut().unwrap().last_writelen = 0;
            resumed
        } else {
            let limit = self.get_tls_write_limit();
            let avail = self.wlimit.avail();
            let len = data.len().min(avail).min(limit);
            if len == 0 {
                return IoResult::N(0);
            }
            len
        };

        self.tls.as_mut().unwrap().last_write_idle = None;

        let is_handshaking = self.tls.as_ref().unwrap().engine.is_handshaking();
        let buf = &data[..len];
        let outcome = {
            let tls = self.tls.as_mut().unwrap();
            if is_handshaking {
                tls.engine.write_early_data(buf)
            } else {
                tls.engine.write(buf)
            }
        };

        match outcome {
            TlsIo::WantRead => {
                log::warn!("renegotiation attempted on write path; treating as fatal");
                IoResult::Network
            }
            TlsIo::WantWrite => {
                self.tls.as_mut().unwrap().last_writelen = len;
                self.wlimit.startw();
                self.reactor.timer_again(self.wt);
                IoResult::N(0)
            }
            TlsIo::CleanClose => IoResult::Network,
            TlsIo::ProtocolError(e) => {
                log::warn!("tls write failed: {e}");
                IoResult::Network
            }
            TlsIo::Progress(n) => {
                self.wlimit.drain(n);
                if self.reactor.timer_is_active(self.wt) {
                    self.reactor.timer_again(self.wt);
                }
                let threshold = self.rec_warmup_threshold;
                let tls = self.tls.as_mut().unwrap();
                if threshold > 0 {
                    tls.warmup_writelen = (tls.warmup_writelen + n as u64).min(threshold);
                }
                IoResult::N(n)
            }
        }
    }

    pub fn read_tls(&mut self, buf: &mut [u8]) -> IoResult {
        if self.tls.is_none() {
            return IoResult::Network;
        }

        // earlybuf is always emptied before any call to the engine's
        // `read`.
        {
            let tls = self.tls.as_mut().unwrap();
            if !tls.earlybuf.is_empty() {
                let n = tls.earlybuf.take(buf);
                return IoResult::N(n);
            }
        }

        let resumed = self.tls.as_ref().unwrap().last_readlen;
        let len = if resumed != 0 {
            self.tls.as_mut().unwrap().last_readlen = 0;
            resumed
        } else {
            let avail = self.rlimit.avail();
            let len = buf.len().min(avail);
            if len == 0 {
                return IoResult::N(0);
            }
            len
        };

        let early_data_finish = self.tls.as_ref().unwrap().early_data_finish;
        if !early_data_finish {
            let tls = self.tls.as_mut().unwrap();
            return match tls.engine.read_early_data(&mut buf[..len]) {
                EarlyIo::WantRead => {
                    tls.last_readlen = len;
                    IoResult::N(0)
                }
                EarlyIo::NoEarlyData | EarlyIo::EndOfEarlyData => {
                    tls.early_data_finish = true;
                    self.wlimit.startw();
                    IoResult::N(0)
                }
                EarlyIo::Data(n) => {
                    self.rlimit.drain(n);
                    IoResult::N(n)
                }
                EarlyIo::ProtocolError(e) => {
                    log::warn!("early data read failed: {e}");
                    IoResult::Network
                }
            };
        }

        let tls = self.tls.as_mut().unwrap();
        match tls.engine.read(&mut buf[..len]) {
            TlsIo::WantRead => {
                tls.last_readlen = len;
                IoResult::N(0)
            }
            TlsIo::WantWrite => IoResult::Network,
            TlsIo::CleanClose => IoResult::Eof,
            TlsIo::ProtocolError(e) => {
                log::warn!("tls read failed: {e}");
                IoResult::Network
            }
            TlsIo::Progress(n) => {
                self.rlimit.drain(n);
                IoResult::N(n)
            }
        }
    }

    pub fn write_clear(&mut self, data: &[u8]) -> IoResult {
        let len = data.len().min(self.wlimit.avail());
        if len == 0 {
            return IoResult::N(0);
        }
        let fd = self.fd;
        match retry_eintr(|| sock::write_clear(fd, &data[..len])) {
            Ok(n) => {
                self.wlimit.drain(n);
                if self.reactor.timer_is_active(self.wt) {
                    self.reactor.timer_again(self.wt);
                }
                IoResult::N(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.wlimit.startw();
                self.reactor.timer_again(self.wt);
                IoResult::N(0)
            }
            Err(e) => {
                log::warn!("clear write failed: {e}");
                IoResult::Network
            }
        }
    }

    /// `bufs` are clipped so their combined length fits the current
    /// write budget; trailing entries beyond the budget are dropped or
    /// truncated.
    pub fn writev_clear(&mut self, bufs: &[&[u8]]) -> IoResult {
        let mut remaining = self.wlimit.avail();
        let mut clipped: Vec<io::IoSlice<'_>> = Vec::with_capacity(bufs.len());
        for b in bufs {
            if remaining == 0 {
                break;
            }
            let take = b.len().min(remaining);
            clipped.push(io::IoSlice::new(&b[..take]));
            remaining -= take;
        }
        if clipped.is_empty() {
            return IoResult::N(0);
        }
        let fd = self.fd;
        match retry_eintr(|| sock::writev_clear(fd, &clipped)) {
            Ok(n) => {
                self.wlimit.drain(n);
                if self.reactor.timer_is_active(self.wt) {
                    self.reactor.timer_again(self.wt);
                }
                IoResult::N(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.wlimit.startw();
                self.reactor.timer_again(self.wt);
                IoResult::N(0)
            }
            Err(e) => {
                log::warn!("clear writev failed: {e}");
                IoResult::Network
            }
        }
    }

    pub fn read_clear(&mut self, buf: &mut [u8]) -> IoResult {
        let len = buf.len().min(self.rlimit.avail());
        if len == 0 {
            return IoResult::N(0);
        }
        let fd = self.fd;
        match retry_eintr(|| sock::read_clear(fd, &mut buf[..len])) {
            Ok(0) => IoResult::Eof,
            Ok(n) => {
                self.rlimit.drain(n);
                IoResult::N(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoResult::N(0),
            Err(e) => {
                log::warn!("clear read failed: {e}");
                IoResult::Network
            }
        }
    }

    /// Bypasses the rate limiter entirely.
    pub fn read_nolim_clear(&mut self, buf: &mut [u8]) -> IoResult {
        let fd = self.fd;
        match retry_eintr(|| sock::read_clear(fd, buf)) {
            Ok(0) => IoResult::Eof,
            Ok(n) => IoResult::N(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoResult::N(0),
            Err(e) => {
                log::warn!("clear nolim read failed: {e}");
                IoResult::Network
            }
        }
    }

    /// Bypasses the rate limiter and leaves the bytes in the kernel's
    /// receive queue (`MSG_PEEK`).
    pub fn peek_clear(&mut self, buf: &mut [u8]) -> IoResult {
        let fd = self.fd;
        match retry_eintr(|| sock::peek_clear(fd, buf)) {
            Ok(0) => IoResult::Eof,
            Ok(n) => IoResult::N(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoResult::N(0),
            Err(e) => {
                log::warn!("clear peek failed: {e}");
                IoResult::Network
            }
        }
    }

    // ---- timer management --------------------------------------

    /// Overwrites `read_timeout`, re-arms `rt`, and snapshots
    /// `last_read`.
    pub fn again_rt(&mut self, read_timeout: Duration) {
        self.read_timeout = read_timeout;
        self.reactor.timer_again_with(self.rt, read_timeout);
        self.last_read = self.clock.now();
    }

    /// Re-arms `rt` with the currently stored `read_timeout`.
    pub fn again_rt_current(&mut self) {
        self.reactor.timer_again(self.rt);
        self.last_read = self.clock.now();
    }

    /// Returns true if the read timeout has actually elapsed;
    /// otherwise re-arms `rt` with the remaining delta.
    pub fn expired_rt(&mut self) -> bool {
        let elapsed = self.clock.now().saturating_duration_since(self.last_read);
        match self.read_timeout.checked_sub(elapsed) {
            Some(delta) if delta >= Duration::from_nanos(1) => {
                self.reactor.timer_again_with(self.rt, delta);
                false
            }
            _ => true,
        }
    }

    // ---- rate-limiter pass-through ------------------------------

    pub fn handle_tls_pending_read(&self) {
        self.rlimit.handle_tls_pending_read();
    }

    // ---- TCP hint ------------------------------------------------

    pub fn get_tcp_hint(&self) -> Option<TcpHint> {
        let tls13 = self
            .tls
            .as_ref()
            .and_then(|t| t.engine.protocol_version())
            .map(|v| v == rustls::ProtocolVersion::TLSv1_3)
            .unwrap_or(false);
        sock::get_tcp_hint(self.fd, tls13)
    }

    // ---- disconnect ------------------------------------------------

    /// Idempotent; safe to call from destructors. Stops both timers and both watchers *before*
    /// releasing `fd`, because some TLS shutdowns re-enter watcher
    /// callbacks synchronously.
    pub fn disconnect(&mut self) {
        if self.fd < 0 {
            return;
        }
        self.reactor.timer_stop(self.rt);
        self.reactor.timer_stop(self.wt);
        self.reactor.io_free(self.read_watcher);
        self.reactor.io_free(self.write_watcher);

        if self.proto != Proto::Http3 {
            if let Some(tls) = self.tls.as_mut() {
                tls.engine.shutdown();
            }
            sock::shutdown_wr(self.fd);
            sock::close(self.fd);
        }

        self.fd = -1;
        self.tls = None;
    }
}

impl<R: Reactor, T: TlsEngine> Drop for Connection<R, T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn retry_eintr<F: FnMut() -> io::Result<usize>>(mut f: F) -> io::Result<usize> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// RFC 7540 Appendix A forbids every TLS 1.2 cipher suite except a
/// short allowlist of ECDHE + AEAD suites with >=128 bit keys. TLS 1.3
/// suites postdate the RFC and are all AEAD by construction, so none
/// of them are blocked.
fn is_http2_cipher_blocked(suite: rustls::CipherSuite) -> bool {
    use rustls::CipherSuite::*;
    !matches!(
        suite,
        TLS13_AES_128_GCM_SHA256
            | TLS13_AES_256_GCM_SHA384
            | TLS13_CHACHA20_POLY1305_SHA256
            | TLS13_AES_128_CCM_SHA256
            | TLS13_AES_128_CCM_8_SHA256
            | TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
            | TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
            | TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
            | TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
            | TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
            | TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event_loop::TestReactor;
    use crate::tls_engine::{EarlyIo, TlsEngine, TlsIo};
    use std::cell::RefCell;

    struct NullCallbacks;
    impl ConnectionCallbacks for NullCallbacks {
        fn on_write(&mut self) {}
        fn on_read(&mut self) {}
        fn on_timeout(&mut self) {}
    }

    /// A scripted fake engine driven purely from a queue of canned
    /// responses, used to exercise `Connection`'s record-size and
    /// timer bookkeeping without a real TLS handshake.
    #[derive(Default)]
    struct FakeEngine {
        is_server: bool,
        handshaking: RefCell<bool>,
        writes: RefCell<Vec<usize>>,
    }

    impl TlsEngine for FakeEngine {
        fn set_fd(&mut self, _fd: RawFd) {}
        fn is_server(&self) -> bool {
            self.is_server
        }
        fn is_handshaking(&self) -> bool {
            *self.handshaking.borrow()
        }
        fn do_handshake(&mut self) -> TlsIo {
            *self.handshaking.borrow_mut() = false;
            TlsIo::Progress(0)
        }
        fn read(&mut self, _buf: &mut [u8]) -> TlsIo {
            TlsIo::WantRead
        }
        fn write(&mut self, buf: &[u8]) -> TlsIo {
            self.writes.borrow_mut().push(buf.len());
            TlsIo::Progress(buf.len())
        }
        fn read_early_data(&mut self, _buf: &mut [u8]) -> EarlyIo {
            EarlyIo::NoEarlyData
        }
        fn write_early_data(&mut self, buf: &[u8]) -> TlsIo {
            TlsIo::Progress(buf.len())
        }
        fn shutdown(&mut self) {}
        fn alpn_protocol(&self) -> Option<Vec<u8>> {
            None
        }
        fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
            None
        }
        fn cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
            None
        }
    }

    fn new_connection(
        warmup_threshold: u64,
        idle_timeout: Duration,
    ) -> (Connection<TestReactor, FakeEngine>, ManualClock) {
        let clock = ManualClock::new();
        let reactor = Rc::new(TestReactor::new());
        let conn = Connection::new(
            -1,
            reactor,
            Rc::new(clock.clone()),
            Some(FakeEngine::default()),
            Duration::from_secs(30),
            Duration::from_secs(30),
            RateLimiterConfig::unlimited(),
            RateLimiterConfig::unlimited(),
            Box::new(NullCallbacks),
            warmup_threshold,
            idle_timeout,
            Proto::Http1,
        );
        (conn, clock)
    }

    #[test]
    fn record_size_unlimited_when_threshold_zero() {
        let (mut conn, _clock) = new_connection(0, Duration::from_secs(1));
        assert_eq!(conn.get_tls_write_limit(), usize::MAX);
    }

    #[test]
    fn record_size_stays_small_until_warmup_threshold() {
        let (mut conn, _clock) = new_connection(4096, Duration::from_secs(1));
        conn.tls.as_mut().unwrap().warmup_writelen = 4095;
        assert_eq!(conn.get_tls_write_limit(), SMALL_RECORD);
        conn.tls.as_mut().unwrap().warmup_writelen = 4096;
        assert_eq!(conn.get_tls_write_limit(), usize::MAX);
    }

    #[test]
    fn record_size_resets_after_idle_timeout() {
        let (mut conn, clock) = new_connection(4096, Duration::from_secs(1));
        conn.tls.as_mut().unwrap().warmup_writelen = 4096;
        assert_eq!(conn.get_tls_write_limit(), usize::MAX);
        conn.start_tls_write_idle();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(conn.get_tls_write_limit(), SMALL_RECORD);
        assert_eq!(conn.tls.as_ref().unwrap().warmup_writelen, 0);
    }

    #[test]
    fn start_tls_write_idle_does_not_slide_forward() {
        let (mut conn, clock) = new_connection(0, Duration::from_secs(1));
        conn.start_tls_write_idle();
        let first = conn.tls.as_ref().unwrap().last_write_idle;
        clock.advance(Duration::from_millis(500));
        conn.start_tls_write_idle();
        assert_eq!(conn.tls.as_ref().unwrap().last_write_idle, first);
    }

    #[test]
    fn again_rt_then_expired_rt_timing() {
        let (mut conn, clock) = new_connection(0, Duration::from_secs(1));
        conn.again_rt(Duration::from_secs(5));
        clock.advance(Duration::from_secs(4));
        assert!(!conn.expired_rt());
        clock.advance(Duration::from_millis(1001));
        assert!(conn.expired_rt());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (mut conn, _clock) = new_connection(0, Duration::from_secs(1));
        conn.fd = -1; // avoid closing a bogus real fd in the test
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.fd(), -1);
    }

    #[test]
    fn http2_blocklist_allows_modern_aead_suites() {
        assert!(!is_http2_cipher_blocked(
            rustls::CipherSuite::TLS13_AES_128_GCM_SHA256
        ));
        assert!(!is_http2_cipher_blocked(
            rustls::CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
        ));
    }

    #[test]
    fn http2_blocklist_rejects_classic_cbc_suite() {
        assert!(is_http2_cipher_blocked(
            rustls::CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA
        ));
    }

    /// A scripted engine whose `read` first stashes a want-read, then
    /// completes with exactly the resumed length, so a test can check
    /// whether a later fresh call still carries the stale length.
    #[derive(Default)]
    struct ReadOnceThenProgressEngine {
        calls: RefCell<usize>,
    }

    impl TlsEngine for ReadOnceThenProgressEngine {
        fn set_fd(&mut self, _fd: RawFd) {}
        fn is_server(&self) -> bool {
            true
        }
        fn is_handshaking(&self) -> bool {
            false
        }
        fn do_handshake(&mut self) -> TlsIo {
            TlsIo::Progress(0)
        }
        fn read(&mut self, buf: &mut [u8]) -> TlsIo {
            let mut calls = self.calls.borrow_mut();
            *calls += 1;
            if *calls == 1 {
                TlsIo::WantRead
            } else {
                TlsIo::Progress(buf.len())
            }
        }
        fn write(&mut self, buf: &[u8]) -> TlsIo {
            TlsIo::Progress(buf.len())
        }
        fn read_early_data(&mut self, _buf: &mut [u8]) -> EarlyIo {
            EarlyIo::NoEarlyData
        }
        fn write_early_data(&mut self, buf: &[u8]) -> TlsIo {
            TlsIo::Progress(buf.len())
        }
        fn shutdown(&mut self) {}
        fn alpn_protocol(&self) -> Option<Vec<u8>> {
            None
        }
        fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
            None
        }
        fn cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
            None
        }
    }

    #[test]
    fn read_tls_resets_last_readlen_after_resuming_read() {
        let clock = Rc::new(ManualClock::new());
        let reactor = Rc::new(TestReactor::new());
        let mut conn = Connection::new(
            -1,
            reactor,
            clock,
            Some(ReadOnceThenProgressEngine::default()),
            Duration::from_secs(30),
            Duration::from_secs(30),
            RateLimiterConfig { rate: 100, burst: 10 },
            RateLimiterConfig::unlimited(),
            Box::new(NullCallbacks),
            0,
            Duration::from_secs(1),
            Proto::Http1,
        );
        conn.tls.as_mut().unwrap().early_data_finish = true;

        let mut buf = [0u8; 20];
        // First call: avail() clips to the 10-token burst, engine
        // reports want-read, stashing `last_readlen = 10`.
        assert_eq!(conn.read_tls(&mut buf), IoResult::N(0));
        assert_eq!(conn.tls.as_ref().unwrap().last_readlen, 10);

        // Resuming call: must reuse the stashed length and then clear
        // it, regardless of rate-limit state.
        assert_eq!(conn.read_tls(&mut buf), IoResult::N(10));
        assert_eq!(conn.tls.as_ref().unwrap().last_readlen, 0);

        // Fresh call: the limiter is now fully drained (burst 10, no
        // refill tick), so this must clip to 0 and return immediately
        // without a third engine call -- not silently resume at the
        // stale length 10.
        assert_eq!(conn.read_tls(&mut buf), IoResult::N(0));
        assert_eq!(
            *conn.tls.as_ref().unwrap().engine.calls.borrow(),
            2,
            "fresh call after a resumed read must not reuse the old length"
        );
    }
}
