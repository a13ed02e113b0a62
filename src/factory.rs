//! Session factory: an accept-site identified by (IP, port), owning a
//! listening socket and a polymorphic session constructor (§3 "Session
//! factory", §4.7).

use crate::session::{Session, SessionCallbacks};
use crate::status::{Status, StatusResult};
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};

/// Constructs a [`Session`]'s callbacks for a newly accepted peer. Kept
/// as a trait rather than a concrete type so embedding applications
/// supply arbitrary per-connection behavior (§9 "Polymorphism").
pub trait SessionConstructor: Send {
    fn create_session(&mut self, peer_addr: SocketAddr) -> Box<dyn SessionCallbacks>;
}

impl<F: FnMut(SocketAddr) -> Box<dyn SessionCallbacks> + Send> SessionConstructor for F {
    fn create_session(&mut self, peer_addr: SocketAddr) -> Box<dyn SessionCallbacks> {
        self(peer_addr)
    }
}

/// An accept-site bound to one (IP, port) pair (§3 "Session factory").
pub struct SessionFactory {
    listener: TcpListener,
    constructor: Box<dyn SessionConstructor>,
    attached_to_server: bool,
}

impl SessionFactory {
    /// Binds a new listening socket at `addr` (port 0 requests an
    /// OS-assigned port, §6 "Listening sockets") and returns the factory
    /// plus the port actually bound.
    pub fn bind(addr: SocketAddr, constructor: Box<dyn SessionConstructor>) -> StatusResult<(Self, u16)> {
        let listener = TcpListener::bind(addr).map_err(Status::from)?;
        listener.set_nonblocking(true).map_err(Status::from)?;
        let bound_port = listener.local_addr().map_err(Status::from)?.port();
        Ok((
            SessionFactory {
                listener,
                constructor,
                attached_to_server: false,
            },
            bound_port,
        ))
    }

    pub fn mark_attached(&mut self) {
        self.attached_to_server = true;
    }

    pub fn is_attached(&self) -> bool {
        self.attached_to_server
    }

    pub fn listen_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn local_addr(&self) -> StatusResult<SocketAddr> {
        self.listener.local_addr().map_err(Status::from)
    }

    /// Accepts one pending connection, if any, constructing a new
    /// [`Session`] with no gateway yet attached (the caller assigns the
    /// gateway, per §4.7 "accept"). A would-block result is not an
    /// error; `accept()` failures are logged by the caller and the
    /// factory remains live (§7).
    pub fn try_accept(&mut self) -> StatusResult<Option<(Session, std::net::TcpStream)>> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let callbacks = self.constructor.create_session(peer_addr);
                let session = Session::new(peer_addr.to_string(), callbacks);
                Ok(Some((session, stream)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Status::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_with_port_zero_returns_an_assigned_port() {
        let (factory, port) =
            SessionFactory::bind("127.0.0.1:0".parse().unwrap(), Box::new(|_| {
                struct Cb;
                impl SessionCallbacks for Cb {
                    fn message_received(
                        &mut self,
                        _msg: crate::message::Message,
                        _outgoing: &mut crate::session::OutgoingMessages,
                    ) {
                    }
                }
                Box::new(Cb) as Box<dyn SessionCallbacks>
            }))
            .unwrap();
        assert_ne!(port, 0);
        assert_eq!(factory.local_addr().unwrap().port(), port);
    }

    #[test]
    fn try_accept_is_non_blocking_with_no_pending_connections() {
        let (mut factory, _port) =
            SessionFactory::bind("127.0.0.1:0".parse().unwrap(), Box::new(|_| {
                struct Cb;
                impl SessionCallbacks for Cb {
                    fn message_received(
                        &mut self,
                        _msg: crate::message::Message,
                        _outgoing: &mut crate::session::OutgoingMessages,
                    ) {
                    }
                }
                Box::new(Cb) as Box<dyn SessionCallbacks>
            }))
            .unwrap();
        let result = factory.try_accept().unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn accept_constructs_a_session_for_the_connecting_peer() {
        let (mut factory, port) =
            SessionFactory::bind("127.0.0.1:0".parse().unwrap(), Box::new(|_| {
                struct Cb;
                impl SessionCallbacks for Cb {
                    fn message_received(
                        &mut self,
                        _msg: crate::message::Message,
                        _outgoing: &mut crate::session::OutgoingMessages,
                    ) {
                    }
                }
                Box::new(Cb) as Box<dyn SessionCallbacks>
            }))
            .unwrap();
        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        let result = factory.try_accept().unwrap();
        assert!(result.is_some());
    }
}
