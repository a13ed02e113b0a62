//! Socket multiplexer: one unified API over select/poll/epoll/kqueue
//! (§4.4). Exactly one multiplexer instance is used per reactor thread
//! (§5: "not thread-safe; one multiplexer per owning thread").

mod poll;
mod select;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

use crate::status::{ErrorKind, Status, StatusResult};
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Which concrete syscall family backs a [`SocketMultiplexer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplexerBackendKind {
    Select,
    Poll,
    #[cfg(target_os = "linux")]
    Epoll,
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue,
}

impl MultiplexerBackendKind {
    /// The most capable backend available on this platform.
    pub fn most_capable() -> Self {
        #[cfg(target_os = "linux")]
        {
            MultiplexerBackendKind::Epoll
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            MultiplexerBackendKind::Kqueue
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )))]
        {
            MultiplexerBackendKind::Poll
        }
    }
}

/// Internal trait implemented by each concrete backend. Not exposed
/// outside this module; callers interact with [`SocketMultiplexer`].
trait Backend {
    fn register_for_read(&mut self, fd: RawFd);
    fn register_for_write(&mut self, fd: RawFd);
    fn register_for_exception(&mut self, fd: RawFd);
    fn wait(&mut self, timeout: Option<Duration>) -> StatusResult<usize>;
    fn is_ready_for_read(&self, fd: RawFd) -> bool;
    fn is_ready_for_write(&self, fd: RawFd) -> bool;
    fn is_exception(&self, fd: RawFd) -> bool;
    fn forget_socket(&mut self, fd: RawFd);
}

/// A unified socket multiplexer. Registrations are transient per-cycle:
/// call the `register_for_*` methods, then `wait_for_events`, then inspect
/// readiness, then register again for the next cycle.
pub struct SocketMultiplexer {
    backend: Box<dyn Backend>,
    notify_reader: os_pipe::PipeReader,
    notify_writer: os_pipe::PipeWriter,
}

impl SocketMultiplexer {
    pub fn new(kind: MultiplexerBackendKind) -> StatusResult<Self> {
        let backend: Box<dyn Backend> = match kind {
            MultiplexerBackendKind::Select => Box::new(select::SelectBackend::new()),
            MultiplexerBackendKind::Poll => Box::new(poll::PollBackend::new()),
            #[cfg(target_os = "linux")]
            MultiplexerBackendKind::Epoll => Box::new(epoll::EpollBackend::new()?),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            MultiplexerBackendKind::Kqueue => Box::new(kqueue::KqueueBackend::new()?),
        };
        let (notify_reader, notify_writer) =
            os_pipe::pipe().map_err(|_| Status::new(ErrorKind::IoError))?;
        Ok(SocketMultiplexer {
            backend,
            notify_reader,
            notify_writer,
        })
    }

    pub fn with_most_capable_backend() -> StatusResult<Self> {
        Self::new(MultiplexerBackendKind::most_capable())
    }

    /// A raw fd other threads can write a byte to, in order to wake a
    /// blocked `wait_for_events` call (§4.4 "Cancellation").
    pub fn notify_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.notify_reader.as_raw_fd()
    }

    /// Wakes a blocked (or about-to-block) `wait_for_events` call.
    pub fn wake(&mut self) -> StatusResult<()> {
        self.notify_writer
            .write_all(&[0u8])
            .map_err(|_| Status::new(ErrorKind::IoError))
    }

    fn drain_notify_pipe(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.notify_reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    pub fn register_for_read(&mut self, fd: RawFd) {
        self.backend.register_for_read(fd);
    }

    pub fn register_for_write(&mut self, fd: RawFd) {
        self.backend.register_for_write(fd);
    }

    pub fn register_for_exception(&mut self, fd: RawFd) {
        self.backend.register_for_exception(fd);
    }

    /// Blocks until any registered event fires, `deadline` passes, or the
    /// notify pipe is written to. Returns the number of ready descriptors.
    pub fn wait_for_events(&mut self, deadline: Option<Instant>) -> StatusResult<usize> {
        self.backend.register_for_read(self.notify_fd());
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let n = self.backend.wait(timeout)?;
        if self.backend.is_ready_for_read(self.notify_fd()) {
            self.drain_notify_pipe();
        }
        Ok(n)
    }

    pub fn is_ready_for_read(&self, fd: RawFd) -> bool {
        self.backend.is_ready_for_read(fd)
    }

    pub fn is_ready_for_write(&self, fd: RawFd) -> bool {
        self.backend.is_ready_for_write(fd)
    }

    pub fn is_exception(&self, fd: RawFd) -> bool {
        self.backend.is_exception(fd)
    }

    /// Notifies the multiplexer that `fd` has been closed, so stale kernel
    /// registrations (epoll/kqueue) are dropped instead of erroring on the
    /// next wait (§4.4).
    pub fn forget_socket(&mut self, fd: RawFd) {
        self.backend.forget_socket(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn run_basic_read_write_test(kind: MultiplexerBackendKind) {
        let mut mux = SocketMultiplexer::new(kind).unwrap();
        let (mut reader, mut writer) = os_pipe::pipe().unwrap();
        mux.register_for_read(reader.as_raw_fd());
        writer.write_all(b"x").unwrap();
        let n = mux
            .wait_for_events(Some(Instant::now() + Duration::from_secs(2)))
            .unwrap();
        assert!(n >= 1);
        assert!(mux.is_ready_for_read(reader.as_raw_fd()));
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).unwrap();
    }

    #[test]
    fn select_backend_detects_read_ready() {
        run_basic_read_write_test(MultiplexerBackendKind::Select);
    }

    #[test]
    fn poll_backend_detects_read_ready() {
        run_basic_read_write_test(MultiplexerBackendKind::Poll);
    }

    #[test]
    fn never_reports_ready_for_an_unregistered_fd() {
        let mut mux = SocketMultiplexer::new(MultiplexerBackendKind::Poll).unwrap();
        let (reader, _writer) = os_pipe::pipe().unwrap();
        // Deliberately not registered.
        let _ = mux.wait_for_events(Some(Instant::now() + Duration::from_millis(50)));
        assert!(!mux.is_ready_for_read(reader.as_raw_fd()));
    }

    #[test]
    fn wake_unblocks_wait_for_events() {
        let mut mux = SocketMultiplexer::new(MultiplexerBackendKind::Poll).unwrap();
        mux.wake().unwrap();
        let start = Instant::now();
        let n = mux
            .wait_for_events(Some(Instant::now() + Duration::from_secs(5)))
            .unwrap();
        assert!(n >= 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
