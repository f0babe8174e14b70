//! Stub downstream collaborator: synthesizes a trivial 200 reply with
//! no body, used for proxy-level liveness checks. It never pools a
//! connection and has no real backing address.

use crate::downstream::DownstreamConnection;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

/// Submits a synthesized 200 response on `end_upload_data`; every
/// other handler is a no-op.
pub struct HealthMonitorDownstreamConnection {
    response_submitted: bool,
}

impl HealthMonitorDownstreamConnection {
    pub fn new() -> Self {
        Self {
            response_submitted: false,
        }
    }

    /// The canned response body this stub submits upstream.
    pub fn response(&self) -> &'static [u8] {
        RESPONSE
    }
}

impl Default for HealthMonitorDownstreamConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl DownstreamConnection for HealthMonitorDownstreamConnection {
    fn attach(&mut self) {}
    fn detach(&mut self) {}
    fn push_request_headers(&mut self, _headers: &[u8]) {}
    fn push_upload_data_chunk(&mut self, _chunk: &[u8]) {}

    fn end_upload_data(&mut self) {
        // Synthesize the 200 reply; the real submission to the
        // upstream interface is the caller's job (out of scope here).
        self.response_submitted = true;
    }

    fn pause_read(&mut self) {}
    fn resume_read(&mut self) {}
    fn on_read(&mut self, _data: &[u8]) {}
    fn on_write(&mut self) {}
    fn on_upstream_change(&mut self) {}

    fn poolable(&self) -> bool {
        false
    }

    fn get_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }

    fn get_downstream_addr_group(&self) -> Option<&str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesizes_200_with_no_body() {
        let mut h = HealthMonitorDownstreamConnection::new();
        assert!(!h.response_submitted);
        h.end_upload_data();
        assert!(h.response_submitted);
        assert!(h.response().starts_with(b"HTTP/1.1 200 OK"));
        assert!(h.response().ends_with(b"Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn never_poolable_and_no_address() {
        let h = HealthMonitorDownstreamConnection::new();
        assert!(!h.poolable());
        assert!(h.get_addr().is_none());
        assert!(h.get_downstream_addr_group().is_none());
    }
}
