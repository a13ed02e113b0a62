use super::DataIo;
use crate::status::{IoResult, Status, StatusResult};
use std::os::unix::io::RawFd;

/// Handshake progress of a [`TlsDataIo`]. No cryptography is implemented;
/// this models only the state-machine shape described in §1/§4.5 so an
/// embedding application can wire in a real TLS library behind the same
/// interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsHandshakeState {
    /// Handshake has not started.
    NotStarted,
    /// Handshake wants to read more bytes before it can proceed.
    WantRead,
    /// Handshake wants to write bytes before it can proceed.
    WantWrite,
    /// Handshake completed; traffic passes through unmodified.
    Established,
    /// Handshake failed; the session should be disconnected.
    Failed,
}

/// A wrapping data-I/O that exposes a TLS-shaped handshake state machine
/// over an inner data-I/O, without performing any cryptography (§4.5).
///
/// Once [`TlsDataIo::state`] reports [`TlsHandshakeState::Established`],
/// `read`/`write` delegate straight through to the inner data-I/O. Before
/// that, reads and writes are refused with `Status::OK` zero-byte results
/// so the reactor's I/O pass treats the handshake as still in progress.
pub struct TlsDataIo<T: DataIo> {
    inner: T,
    state: TlsHandshakeState,
    /// A dummy always-readable descriptor an embedding TLS implementation
    /// can register when the handshake needs the event loop to re-enter
    /// even though no raw bytes are available on the real socket (§4.5).
    force_readable_fd: Option<RawFd>,
}

impl<T: DataIo> TlsDataIo<T> {
    pub fn new(inner: T) -> Self {
        TlsDataIo {
            inner,
            state: TlsHandshakeState::NotStarted,
            force_readable_fd: None,
        }
    }

    pub fn state(&self) -> TlsHandshakeState {
        self.state
    }

    /// Advances the handshake state machine. A real implementation would
    /// drive an embedded TLS library here; this core only tracks the
    /// shape so callers can be tested against it.
    pub fn advance_handshake(&mut self, next: TlsHandshakeState) {
        self.state = next;
    }

    pub fn set_force_readable_fd(&mut self, fd: Option<RawFd>) {
        self.force_readable_fd = fd;
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: DataIo> DataIo for TlsDataIo<T> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult {
        match self.state {
            TlsHandshakeState::Established => self.inner.read(buf),
            TlsHandshakeState::Failed => IoResult::err(Status::new(crate::status::ErrorKind::SslError)),
            _ => IoResult::ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoResult {
        match self.state {
            TlsHandshakeState::Established => self.inner.write(buf),
            TlsHandshakeState::Failed => IoResult::err(Status::new(crate::status::ErrorKind::SslError)),
            _ => IoResult::ok(0),
        }
    }

    fn flush(&mut self) -> StatusResult<()> {
        self.inner.flush()
    }

    fn seek(&mut self, offset: u64) -> StatusResult<()> {
        self.inner.seek(offset)
    }

    fn shutdown(&mut self) -> StatusResult<()> {
        self.inner.shutdown()
    }

    fn read_select_fd(&self) -> Option<RawFd> {
        if self.state == TlsHandshakeState::WantRead {
            self.force_readable_fd.or_else(|| self.inner.read_select_fd())
        } else {
            self.inner.read_select_fd()
        }
    }

    fn write_select_fd(&self) -> Option<RawFd> {
        self.inner.write_select_fd()
    }

    fn has_buffered_output(&self) -> bool {
        self.inner.has_buffered_output()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataio::UnixDataIo;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reads_and_writes_are_suppressed_until_established() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut tls = TlsDataIo::new(UnixDataIo::new(a).unwrap());
        assert_eq!(tls.state(), TlsHandshakeState::NotStarted);
        let mut buf = [0u8; 4];
        assert_eq!(tls.read(&mut buf).byte_count(), 0);
        assert_eq!(tls.write(b"x").byte_count(), 0);
    }

    #[test]
    fn established_state_passes_traffic_through() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tls = TlsDataIo::new(UnixDataIo::new(a).unwrap());
        tls.advance_handshake(TlsHandshakeState::Established);
        let mut plain = UnixDataIo::new(b).unwrap();

        let wr = tls.write(b"secure");
        assert_eq!(wr.byte_count(), 6);

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = [0u8; 6];
        let rr = plain.read(&mut buf);
        assert_eq!(rr.byte_count(), 6);
        assert_eq!(&buf, b"secure");
    }

    #[test]
    fn failed_handshake_surfaces_ssl_error() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut tls = TlsDataIo::new(UnixDataIo::new(a).unwrap());
        tls.advance_handshake(TlsHandshakeState::Failed);
        let mut buf = [0u8; 4];
        assert_eq!(
            tls.read(&mut buf).status().kind(),
            crate::status::ErrorKind::SslError
        );
    }
}
