use super::DataIo;
use crate::status::{IoResult, StatusResult};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// A wrapper that delegates every operation to an inner data-I/O (§4.5
/// "proxying wrapper"). Useful as a base for decorators that want to
/// override only a handful of methods without hand-writing the rest of
/// the delegation.
pub struct ProxyDataIo<T: DataIo> {
    inner: T,
}

impl<T: DataIo> ProxyDataIo<T> {
    pub fn new(inner: T) -> Self {
        ProxyDataIo { inner }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: DataIo> DataIo for ProxyDataIo<T> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult {
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> IoResult {
        self.inner.write(buf)
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
        self.inner.read_select_fd()
    }

    fn write_select_fd(&self) -> Option<RawFd> {
        self.inner.write_select_fd()
    }

    fn has_buffered_output(&self) -> bool {
        self.inner.has_buffered_output()
    }

    fn output_stall_limit(&self) -> Option<Duration> {
        self.inner.output_stall_limit()
    }

    fn max_transfer_unit(&self) -> Option<usize> {
        self.inner.max_transfer_unit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataio::UnixDataIo;
    use std::os::unix::net::UnixStream;

    #[test]
    fn proxy_forwards_read_and_write_to_inner() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut proxy = ProxyDataIo::new(UnixDataIo::new(a).unwrap());
        let mut raw_b = UnixDataIo::new(b).unwrap();

        let wr = proxy.write(b"proxied");
        assert_eq!(wr.byte_count(), 7);

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = [0u8; 7];
        let rr = raw_b.read(&mut buf);
        assert_eq!(rr.byte_count(), 7);
        assert_eq!(&buf, b"proxied");
    }
}
