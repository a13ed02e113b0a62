use super::DataIo;
use crate::status::{ErrorKind, IoResult, Status, StatusResult};
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

/// A single-packet-per-read/write UDP data-I/O (§4.5 "UDP packet").
///
/// One `write` call is one datagram; `read` returns the contents of the
/// next queued datagram. `remote_addr`, when set, restricts `write` to a
/// connected peer and is used by the gateway for packet-remote-tagging
/// (§4.6).
pub struct UdpDataIo {
    socket: UdpSocket,
    remote_addr: Option<SocketAddr>,
    last_sender: Option<SocketAddr>,
}

/// Conservative default: common path MTU minus IPv4/UDP headers.
const DEFAULT_MTU: usize = 1472;

impl UdpDataIo {
    pub fn new(socket: UdpSocket) -> StatusResult<Self> {
        socket.set_nonblocking(true).map_err(Status::from)?;
        Ok(UdpDataIo {
            socket,
            remote_addr: None,
            last_sender: None,
        })
    }

    pub fn with_remote(socket: UdpSocket, remote: SocketAddr) -> StatusResult<Self> {
        let mut io = Self::new(socket)?;
        io.remote_addr = Some(remote);
        Ok(io)
    }

    /// The address the most recently read datagram arrived from, for
    /// gateways that tag incoming messages with their source (§4.6).
    pub fn last_sender(&self) -> Option<SocketAddr> {
        self.last_sender
    }
}

impl DataIo for UdpDataIo {
    fn read(&mut self, buf: &mut [u8]) -> IoResult {
        match self.socket.recv_from(buf) {
            Ok((n, from)) => {
                self.last_sender = Some(from);
                IoResult::ok(n as u64)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => IoResult::ok(0),
            Err(e) => IoResult::err(Status::from(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoResult {
        let result = match self.remote_addr {
            Some(addr) => self.socket.send_to(buf, addr),
            None => return IoResult::err(Status::new(ErrorKind::BadArgument)),
        };
        match result {
            Ok(n) => IoResult::ok(n as u64),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => IoResult::ok(0),
            Err(e) => IoResult::err(Status::from(e)),
        }
    }

    fn flush(&mut self) -> StatusResult<()> {
        Ok(())
    }

    fn seek(&mut self, _offset: u64) -> StatusResult<()> {
        Err(Status::new(ErrorKind::Unimplemented))
    }

    fn shutdown(&mut self) -> StatusResult<()> {
        Ok(())
    }

    fn read_select_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn write_select_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn max_transfer_unit(&self) -> Option<usize> {
        Some(DEFAULT_MTU)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_without_remote_is_bad_argument() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut io = UdpDataIo::new(socket).unwrap();
        let result = io.write(b"x");
        assert_eq!(result.status().kind(), ErrorKind::BadArgument);
    }

    #[test]
    fn packet_round_trips_and_records_sender() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client_addr = client.local_addr().unwrap();

        let mut server_io = UdpDataIo::new(server).unwrap();
        let mut client_io = UdpDataIo::with_remote(client, server_addr).unwrap();

        let wr = client_io.write(b"ping");
        assert_eq!(wr.byte_count(), 4);

        std::thread::sleep(std::time::Duration::from_millis(30));
        let mut buf = [0u8; 16];
        let rr = server_io.read(&mut buf);
        assert_eq!(rr.byte_count(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(server_io.last_sender(), Some(client_addr));
    }
}
