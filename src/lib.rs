//! Connection core for an HTTP reverse-proxy.
//!
//! This crate implements the per-socket object that sits directly
//! above the OS socket and directly below any protocol parser
//! (HTTP/1, HTTP/2, HTTP/3): a non-blocking byte transport fused with
//! an optional TLS engine, a pair of token-bucket rate limiters, and a
//! pair of read/write timers.
//!
//! The four byte-level operations exposed upward —
//! [`connection::Connection::read_clear`]/`write_clear`/`writev_clear`/
//! `peek_clear`, and their `_tls` counterparts — work in both
//! cleartext and encrypted modes, respecting rate limits, the dynamic
//! TLS record-size heuristic, handshake state (including 0-RTT early
//! data), and event-loop re-arming.
//!
//! Out of scope: the proxy configuration loader, the HTTP state
//! machines above this layer, the listener/acceptor, certificate
//! selection, the HTTP/3 QUIC engine, and the memory-chunk pool — this
//! crate assumes those exist and calls into narrow interfaces for them
//! (see [`downstream`]).

pub mod clock;
pub mod connection;
pub mod downstream;
pub mod early_buffer;
pub mod error;
pub mod event_loop;
pub mod health_monitor;
pub mod rate_limiter;
pub mod sock;
pub mod tls_engine;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{Connection, ConnectionCallbacks, HandshakeOutcome, Proto, RateLimiterConfig};
pub use error::{CoreError, IoResult};
pub use event_loop::{Event, Interest, MioReactor, Reactor, TestReactor};
pub use rate_limiter::RateLimiter;
pub use tls_engine::{EarlyIo, RustlsEngine, TlsEngine, TlsIo};
