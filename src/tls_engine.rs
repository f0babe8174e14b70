//! The `TlsEngine` contract and its concrete implementation on top of
//! `rustls`.
//!
//! *How* to drive a rustls connection — check
//! `wants_write`/`wants_read`, loop `write_tls`/`read_tls` against a
//! transport, call `process_new_packets`, treat `reader()`/`writer()`
//! as the plaintext edge — follows rustls's own buffered-I/O
//! conventions, generalized here to a raw non-blocking socket instead
//! of an in-memory byte pipe.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use rustls::{ClientConnection, ServerConnection};

use crate::error::CoreError;
use crate::sock::FdIo;

/// Result of a handshake/read/write primitive.
pub enum TlsIo {
    Progress(usize),
    WantRead,
    WantWrite,
    CleanClose,
    ProtocolError(CoreError),
}

/// Result of `read_early_data`, which has two extra terminal states
/// beyond the ones in [`TlsIo`].
pub enum EarlyIo {
    Data(usize),
    WantRead,
    /// No early data is possible on this connection at all.
    NoEarlyData,
    /// Early data was possible and is now exhausted.
    EndOfEarlyData,
    ProtocolError(CoreError),
}

/// The cryptographic session driven by the handshake/read/write
/// primitives. `Connection` is generic over this trait so tests can
/// substitute a scripted fake.
pub trait TlsEngine {
    fn set_fd(&mut self, fd: RawFd);
    fn is_server(&self) -> bool;
    fn is_handshaking(&self) -> bool;

    fn do_handshake(&mut self) -> TlsIo;
    fn read(&mut self, buf: &mut [u8]) -> TlsIo;
    fn write(&mut self, buf: &[u8]) -> TlsIo;
    fn read_early_data(&mut self, buf: &mut [u8]) -> EarlyIo;
    fn write_early_data(&mut self, buf: &[u8]) -> TlsIo;

    fn shutdown(&mut self);

    fn alpn_protocol(&self) -> Option<Vec<u8>>;
    fn protocol_version(&self) -> Option<rustls::ProtocolVersion>;
    fn cipher_suite(&self) -> Option<rustls::SupportedCipherSuite>;
}

enum Side {
    Server(Box<ServerConnection>),
    Client(Box<ClientConnection>),
}

pub struct RustlsEngine {
    side: Side,
    fd: RawFd,
}

impl RustlsEngine {
    pub fn server(conn: ServerConnection) -> Self {
        Self {
            side: Side::Server(Box::new(conn)),
            fd: -1,
        }
    }

    pub fn client(conn: ClientConnection) -> Self {
        Self {
            side: Side::Client(Box::new(conn)),
            fd: -1,
        }
    }

    fn io(&self) -> FdIo {
        FdIo(self.fd)
    }
}

fn is_would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// Shared driving loop for both sides, expressed against the
/// `ConnectionCommon` methods that `ServerConnection`/`ClientConnection`
/// both expose through `Deref`. A macro because rustls's unbuffered and
/// buffered APIs aren't behind a shared trait object.
macro_rules! drive_handshake {
    ($conn:expr, $io:expr) => {{
        let conn = $conn;
        let mut io = $io;
        // Bounded by `is_handshaking()` rather than `wants_read()`:
        // rustls's `wants_read()` stays true long after the handshake
        // itself completes (it just means "no buffered plaintext yet"),
        // so driving on it alone would try to read post-handshake
        // records (session tickets) and report `WantRead` even though
        // the handshake already finished.
        while conn.is_handshaking() {
            if conn.wants_write() {
                match conn.write_tls(&mut io) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if is_would_block(&e) => return TlsIo::WantWrite,
                    Err(e) => return TlsIo::ProtocolError(CoreError::Io(e)),
                }
            }
            if conn.wants_read() {
                match conn.read_tls(&mut io) {
                    Ok(0) => return TlsIo::CleanClose,
                    Ok(_) => match conn.process_new_packets() {
                        Ok(_) => continue,
                        Err(e) => {
                            // Best-effort alert before giving up.
                            let _ = conn.write_tls(&mut io);
                            return TlsIo::ProtocolError(CoreError::Tls(e));
                        }
                    },
                    Err(e) if is_would_block(&e) => return TlsIo::WantRead,
                    Err(e) => return TlsIo::ProtocolError(CoreError::Io(e)),
                }
            }
            break;
        }
        if conn.is_handshaking() {
            TlsIo::WantRead
        } else {
            TlsIo::Progress(0)
        }
    }};
}

macro_rules! drive_write {
    ($conn:expr, $io:expr, $buf:expr) => {{
        let conn = $conn;
        let mut io = $io;
        // Flush any backlog from a previous call first: the
        // stored-length invariant requires that if this
        // returns want-write, nothing new was accepted.
        loop {
            if !conn.wants_write() {
                break;
            }
            match conn.write_tls(&mut io) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if is_would_block(&e) => return TlsIo::WantWrite,
                Err(e) => return TlsIo::ProtocolError(CoreError::Io(e)),
            }
        }
        // NB: rustls's `wants_read()` stays true purely as read-side
        // backpressure (no buffered plaintext yet) and is not a signal
        // that the peer is attempting renegotiation; TLS 1.3 (the only
        // version this engine negotiates) has no renegotiation to
        // detect here at all, so there is nothing to gate on.
        let n = match conn.writer().write($buf) {
            Ok(n) => n,
            Err(e) => return TlsIo::ProtocolError(CoreError::Io(e)),
        };
        loop {
            if !conn.wants_write() {
                break;
            }
            match conn.write_tls(&mut io) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if is_would_block(&e) => break, // flush opportunistically later
                Err(e) => return TlsIo::ProtocolError(CoreError::Io(e)),
            }
        }
        TlsIo::Progress(n)
    }};
}

macro_rules! drive_read {
    ($conn:expr, $io:expr, $buf:expr) => {{
        let conn = $conn;
        let mut io = $io;
        loop {
            match conn.reader().read($buf) {
                Ok(n) if n > 0 => return TlsIo::Progress(n),
                Ok(_) => { /* no plaintext queued yet; pump more records */ }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return TlsIo::CleanClose,
                Err(e) if is_would_block(&e) => { /* fall through to pump */ }
                Err(e) => return TlsIo::ProtocolError(CoreError::Io(e)),
            }
            if !conn.wants_read() {
                return TlsIo::WantRead;
            }
            match conn.read_tls(&mut io) {
                Ok(0) => return TlsIo::CleanClose,
                Ok(_) => match conn.process_new_packets() {
                    Ok(_) => continue,
                    Err(e) => return TlsIo::ProtocolError(CoreError::Tls(e)),
                },
                Err(e) if is_would_block(&e) => return TlsIo::WantRead,
                Err(e) => return TlsIo::ProtocolError(CoreError::Io(e)),
            }
        }
    }};
}

impl TlsEngine for RustlsEngine {
    fn set_fd(&mut self, fd: RawFd) {
        self.fd = fd;
    }

    fn is_server(&self) -> bool {
        matches!(self.side, Side::Server(_))
    }

    fn is_handshaking(&self) -> bool {
        match &self.side {
            Side::Server(c) => c.is_handshaking(),
            Side::Client(c) => c.is_handshaking(),
        }
    }

    fn do_handshake(&mut self) -> TlsIo {
        let io = self.io();
        match &mut self.side {
            Side::Server(c) => drive_handshake!(c.as_mut(), io),
            Side::Client(c) => drive_handshake!(c.as_mut(), io),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> TlsIo {
        let io = self.io();
        match &mut self.side {
            Side::Server(c) => drive_read!(c.as_mut(), io, buf),
            Side::Client(c) => drive_read!(c.as_mut(), io, buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> TlsIo {
        let io = self.io();
        match &mut self.side {
            Side::Server(c) => drive_write!(c.as_mut(), io, buf),
            Side::Client(c) => drive_write!(c.as_mut(), io, buf),
        }
    }

    fn read_early_data(&mut self, buf: &mut [u8]) -> EarlyIo {
        let fd = self.fd;
        let Side::Server(conn) = &mut self.side else {
            return EarlyIo::NoEarlyData;
        };
        loop {
            // `early_data()` only yields `Some` once rustls has parsed
            // the full ClientHello and decided whether 0-RTT was
            // accepted; until then it's `None` even though more of the
            // ClientHello may still be on the wire. Waiting for the
            // handshake to fully finish (`!is_handshaking()`) would
            // deadlock whenever no early data was offered, since
            // nothing ever drives the handshake past this point in
            // that case. `wants_write()` is the right signal instead:
            // rustls queues the ServerHello flight synchronously while
            // processing the ClientHello, so by the time there is
            // something to write, early-data acceptance is already
            // final.
            if let Some(mut ed) = conn.early_data() {
                match ed.read(buf) {
                    Ok(0) => {
                        if !conn.is_handshaking() || conn.wants_write() {
                            return EarlyIo::EndOfEarlyData;
                        }
                        // else fall through and pump more records
                    }
                    Ok(n) => return EarlyIo::Data(n),
                    Err(e) if is_would_block(&e) => { /* pump more records */ }
                    Err(_) => return EarlyIo::EndOfEarlyData,
                }
            } else if !conn.is_handshaking() || conn.wants_write() {
                return EarlyIo::NoEarlyData;
            }
            let mut io = FdIo(fd);
            match conn.read_tls(&mut io) {
                Ok(0) => return EarlyIo::EndOfEarlyData,
                Ok(_) => {
                    if let Err(e) = conn.process_new_packets() {
                        return EarlyIo::ProtocolError(CoreError::Tls(e));
                    }
                }
                Err(e) if is_would_block(&e) => return EarlyIo::WantRead,
                Err(e) => return EarlyIo::ProtocolError(CoreError::Io(e)),
            }
        }
    }

    fn write_early_data(&mut self, buf: &[u8]) -> TlsIo {
        let fd = self.fd;
        let Side::Client(conn) = &mut self.side else {
            return TlsIo::ProtocolError(CoreError::Tls(rustls::Error::General(
                "early data write only valid on the client side".into(),
            )));
        };
        let Some(mut ed) = conn.early_data() else {
            // Server rejected 0-RTT or it's otherwise unavailable:
            // caller should fall back to a normal post-handshake write.
            return TlsIo::WantWrite;
        };
        let n = match ed.write(buf) {
            Ok(n) => n,
            Err(e) => return TlsIo::ProtocolError(CoreError::Io(e)),
        };
        let mut io = FdIo(fd);
        loop {
            if !conn.wants_write() {
                break;
            }
            match conn.write_tls(&mut io) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if is_would_block(&e) => break,
                Err(e) => return TlsIo::ProtocolError(CoreError::Io(e)),
            }
        }
        TlsIo::Progress(n)
    }

    fn shutdown(&mut self) {
        match &mut self.side {
            Side::Server(c) => c.send_close_notify(),
            Side::Client(c) => c.send_close_notify(),
        }
        let mut io = self.io();
        loop {
            let wants_write = match &self.side {
                Side::Server(c) => c.wants_write(),
                Side::Client(c) => c.wants_write(),
            };
            if !wants_write {
                break;
            }
            let rv = match &mut self.side {
                Side::Server(c) => c.write_tls(&mut io),
                Side::Client(c) => c.write_tls(&mut io),
            };
            match rv {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match &self.side {
            Side::Server(c) => c.alpn_protocol().map(|s| s.to_vec()),
            Side::Client(c) => c.alpn_protocol().map(|s| s.to_vec()),
        }
    }

    fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match &self.side {
            Side::Server(c) => c.protocol_version(),
            Side::Client(c) => c.protocol_version(),
        }
    }

    fn cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        match &self.side {
            Side::Server(c) => c.negotiated_cipher_suite(),
            Side::Client(c) => c.negotiated_cipher_suite(),
        }
    }
}
