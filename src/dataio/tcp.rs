use super::DataIo;
use crate::status::{ErrorKind, IoResult, Status, StatusResult};
use socket2::{SockRef, TcpKeepalive};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// A non-blocking TCP stream data-I/O (§4.5 "TCP stream").
pub struct TcpDataIo {
    stream: TcpStream,
}

impl TcpDataIo {
    pub fn new(stream: TcpStream) -> StatusResult<Self> {
        stream.set_nonblocking(true).map_err(Status::from)?;
        let sock_ref = SockRef::from(&stream);
        let _ = sock_ref.set_tcp_nodelay(true);
        let _ = sock_ref.set_keepalive(true);
        let _ = sock_ref.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(60)));
        Ok(TcpDataIo { stream })
    }

    pub fn connect_nonblocking(addr: std::net::SocketAddr) -> StatusResult<Self> {
        let domain = if addr.is_ipv6() {
            socket2::Domain::IPV6
        } else {
            socket2::Domain::IPV4
        };
        let sock = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
            .map_err(Status::from)?;
        sock.set_nonblocking(true).map_err(Status::from)?;
        match sock.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(Status::from(e)),
        }
        Ok(TcpDataIo { stream: sock.into() })
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

fn would_block(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}

impl DataIo for TcpDataIo {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn read_on_empty_nonblocking_socket_returns_zero_bytes_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_thread = std::thread::spawn(move || listener.accept().unwrap());
        let client = TcpStream::connect(addr).unwrap();
        let (server_stream, _) = server_thread.join().unwrap();
        let mut server_io = TcpDataIo::new(server_stream).unwrap();

        let mut buf = [0u8; 16];
        let result = server_io.read(&mut buf);
        assert!(!result.is_error());
        assert_eq!(result.byte_count(), 0);
        drop(client);
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_thread = std::thread::spawn(move || listener.accept().unwrap());
        let client = TcpStream::connect(addr).unwrap();
        let (server_stream, _) = server_thread.join().unwrap();
        let mut server_io = TcpDataIo::new(server_stream).unwrap();
        let mut client_io = TcpDataIo::new(client).unwrap();

        let wr = client_io.write(b"hello");
        assert_eq!(wr.byte_count(), 5);

        std::thread::sleep(Duration::from_millis(50));
        let mut buf = [0u8; 5];
        let rr = server_io.read(&mut buf);
        assert_eq!(rr.byte_count(), 5);
        assert_eq!(&buf, b"hello");
    }
}
