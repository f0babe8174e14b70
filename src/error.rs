//! Error sentinels for the connection core.
//!
//! Every byte-level operation returns an [`IoResult`]: a non-negative
//! byte count, a "would block, watcher armed" zero, or one of three
//! fixed sentinels, typed so a caller can `match` instead of comparing
//! magic numbers.

use thiserror::Error;

/// Fatal transport or TLS error; the caller should close the connection.
/// HTTP/2 negotiation-policy failures are reported separately, as
/// `HandshakeOutcome::Http2PolicyViolation` — they are a handshake
/// outcome, not a transport/TLS fault.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Public return convention for the byte-level entry points: a
/// non-negative byte count, or one of the three sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoResult {
    /// Bytes moved (may be zero only for `read`/`peek` meaning
    /// "no budget right now, try again once the watcher fires").
    N(usize),
    /// Unrecoverable transport or TLS error.
    Network,
    /// Clean peer close.
    Eof,
    /// Handshake not yet complete.
    InProgress,
}

impl IoResult {
    pub fn is_network(&self) -> bool {
        matches!(self, IoResult::Network)
    }

    pub fn n(&self) -> Option<usize> {
        match self {
            IoResult::N(n) => Some(*n),
            _ => None,
        }
    }
}
