//! Data-I/O abstraction: a polymorphic byte source/sink over the capability
//! set {read, write, seek, flush, shutdown, buffered-output, select
//! descriptors, output-stall-limit} (§4.5).
//!
//! Every concrete variant is driven by the reactor's single thread through
//! non-blocking file descriptors; blocking variants do not exist except
//! inside [`async_io`]'s dedicated worker.

mod async_io;
mod file;
mod proxy;
mod tcp;
mod tls;
mod udp;
mod unix;

pub use async_io::{AsyncDataIo, AsyncDataIoCommand};
pub use file::FileDataIo;
pub use proxy::ProxyDataIo;
pub use tcp::TcpDataIo;
pub use tls::TlsDataIo;
pub use udp::UdpDataIo;
pub use unix::UnixDataIo;

use crate::status::{IoResult, StatusResult};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// A polymorphic byte source/sink. Implementors are not required to
/// support every operation; unsupported operations return
/// `ErrorKind::Unimplemented`.
pub trait DataIo {
    /// Reads up to `buf.len()` bytes. A `0`-byte, `Status::OK` result means
    /// end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> IoResult;

    /// Writes up to `buf.len()` bytes, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> IoResult;

    /// Flushes any internally buffered output toward the underlying
    /// transport. A no-op for transports with no write buffering of their
    /// own.
    fn flush(&mut self) -> StatusResult<()>;

    /// Seeks to `offset` from the start, if this variant is seekable.
    fn seek(&mut self, offset: u64) -> StatusResult<()>;

    /// Half- or fully closes the underlying transport.
    fn shutdown(&mut self) -> StatusResult<()>;

    /// The descriptor the reactor should register for read-readiness, if
    /// any (some variants, e.g. a pure sink, have none).
    fn read_select_fd(&self) -> Option<RawFd>;

    /// The descriptor the reactor should register for write-readiness.
    /// Frequently identical to [`DataIo::read_select_fd`] for stream
    /// sockets.
    fn write_select_fd(&self) -> Option<RawFd>;

    /// Whether this variant buffers output internally such that
    /// `has_bytes_to_output` on the owning gateway should also consult
    /// this buffer (distinct from the gateway's own outgoing-message
    /// queue).
    fn has_buffered_output(&self) -> bool {
        false
    }

    /// The duration after which a session using this data-I/O should be
    /// considered stalled if output is pending but no bytes have moved.
    /// `None` means "use the session's/reactor's default".
    fn output_stall_limit(&self) -> Option<Duration> {
        None
    }

    /// The maximum size of one datagram/packet this variant can move in a
    /// single `write`, for packet-oriented transports. `None` for stream
    /// transports (no inherent cap beyond the buffer passed in).
    fn max_transfer_unit(&self) -> Option<usize> {
        None
    }
}
