use super::DataIo;
use crate::status::{ErrorKind, IoResult, Status, StatusResult};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// A non-blocking Unix-domain stream data-I/O (§4.5 "Unix-domain stream").
pub struct UnixDataIo {
    stream: UnixStream,
}

impl UnixDataIo {
    pub fn new(stream: UnixStream) -> StatusResult<Self> {
        stream.set_nonblocking(true).map_err(Status::from)?;
        Ok(UnixDataIo { stream })
    }
}

fn would_block(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}

impl DataIo for UnixDataIo {
    fn read(&mut self, buf: &mut [u8]) -> IoResult {
        match self.stream.read(buf) {
            Ok(0) => IoResult::err(Status::new(ErrorKind::EndOfStream)),
            Ok(n) => IoResult::ok(n as u64),
            Err(e) if would_block(&e) => IoResult::ok(0),
            Err(e) => IoResult::err(Status::from(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoResult {
        match self.stream.write(buf) {
            Ok(n) => IoResult::ok(n as u64),
            Err(e) if would_block(&e) => IoResult::ok(0),
            Err(e) => IoResult::err(Status::from(e)),
        }
    }

    fn flush(&mut self) -> StatusResult<()> {
        self.stream.flush().map_err(Status::from)
    }

    fn seek(&mut self, _offset: u64) -> StatusResult<()> {
        Err(Status::new(ErrorKind::Unimplemented))
    }

    fn shutdown(&mut self) -> StatusResult<()> {
        self.stream
            .shutdown(std::net::Shutdown::Both)
            .map_err(Status::from)
    }

    fn read_select_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }

    fn write_select_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}
