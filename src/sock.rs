//! Raw, non-owning socket operations.
//!
//! `Connection` owns the lifetime of `fd`; everything here just
//! operates on it through `libc` without ever claiming ownership, so
//! both the cleartext byte-level ops and the TLS engine's "give me
//! the transport" read/write calls can share one descriptor.

use std::io::{self, IoSlice};
use std::mem;
use std::os::unix::io::RawFd;

/// A non-owning `Read`/`Write` handle on a raw fd, used to hand the
/// TLS engine something to call `read_tls`/`write_tls` against.
pub struct FdIo(pub RawFd);

fn map_errno(rv: isize) -> io::Result<usize> {
    if rv >= 0 {
        Ok(rv as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rv = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        map_errno(rv as isize)
    }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let rv = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        map_errno(rv as isize)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `recv(2)` without `MSG_PEEK` — equivalent to `read`, used by the
/// rate-limited and unlimited cleartext read paths.
pub fn read_clear(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rv = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    map_errno(rv as isize)
}

/// Non-consuming read: leaves the bytes in the kernel's receive queue.
pub fn peek_clear(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rv = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_PEEK,
        )
    };
    map_errno(rv as isize)
}

pub fn write_clear(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let rv = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
    map_errno(rv as isize)
}

pub fn writev_clear(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let rv = unsafe { libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as i32) };
    map_errno(rv as isize)
}

pub fn shutdown_wr(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Best-effort `TCP_INFO`-derived batching hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHint {
    pub write_buffer_size: usize,
    pub rwin: usize,
}

/// Returns `None` on any failure, including platforms without
/// `TCP_INFO`.
pub fn get_tcp_hint(fd: RawFd, tls13: bool) -> Option<TcpHint> {
    let mut info: libc::tcp_info = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rv = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rv != 0 {
        return None;
    }

    let tls_overhead: u32 = if tls13 { 22 } else { 29 };
    let mss = info.tcpi_snd_mss.saturating_sub(tls_overhead);
    let cwnd = info.tcpi_snd_cwnd;
    let unacked = info.tcpi_unacked;
    let raw = (cwnd.saturating_sub(unacked) + 2).saturating_mul(mss.max(1)) as usize;

    const CHUNK: usize = 16 * 1024;
    let write_buffer_size = if raw >= CHUNK {
        (raw / CHUNK) * CHUNK
    } else {
        raw.max(2 * 536)
    };

    Some(TcpHint {
        write_buffer_size,
        rwin: info.tcpi_rcv_space as usize,
    })
}
