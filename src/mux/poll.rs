//! `poll`-based multiplexer backend.
//!
//! Maintains a vector of `pollfd` entries plus a fd→index map; unlike
//! `select`, `poll` mutates its input array in place, so this backend is
//! single-buffered (§4.4).

use super::Backend;
use crate::status::{ErrorKind, Status, StatusResult};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

struct Interest {
    read: bool,
    write: bool,
    except: bool,
}

#[derive(Default)]
pub(super) struct PollBackend {
    interest: HashMap<RawFd, Interest>,
    ready: HashMap<RawFd, PollFlags>,
}

impl PollBackend {
    pub(super) fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, fd: RawFd) -> &mut Interest {
        self.interest.entry(fd).or_insert(Interest {
            read: false,
            write: false,
            except: false,
        })
    }
}

impl Backend for PollBackend {
    fn register_for_read(&mut self, fd: RawFd) {
        self.entry(fd).read = true;
    }

    fn register_for_write(&mut self, fd: RawFd) {
        self.entry(fd).write = true;
    }

    fn register_for_exception(&mut self, fd: RawFd) {
        self.entry(fd).except = true;
    }

    fn wait(&mut self, timeout: Option<Duration>) -> StatusResult<usize> {
        let fds: Vec<RawFd> = self.interest.keys().copied().collect();
        let mut pollfds: Vec<PollFd> = fds
            .iter()
            .map(|&fd| {
                let interest = &self.interest[&fd];
                let mut flags = PollFlags::empty();
                if interest.read {
                    flags |= PollFlags::POLLIN;
                }
                if interest.write {
                    flags |= PollFlags::POLLOUT;
                }
                if interest.except {
                    flags |= PollFlags::POLLPRI;
                }
                // SAFETY: fd stays valid for the duration of this wait call;
                // the caller owns the underlying socket/pipe.
                let borrowed: BorrowedFd = unsafe { BorrowedFd::borrow_raw(fd) };
                PollFd::new(borrowed, flags)
            })
            .collect();

        let poll_timeout: PollTimeout = match timeout {
            Some(d) => PollTimeout::try_from(d.as_millis() as u32).unwrap_or(PollTimeout::MAX),
            None => PollTimeout::NONE,
        };

        let result = poll(&mut pollfds, poll_timeout);
        self.interest.clear();
        self.ready.clear();

        match result {
            Ok(n) => {
                for (fd, pfd) in fds.iter().zip(pollfds.iter()) {
                    if let Some(revents) = pfd.revents() {
                        if !revents.is_empty() {
                            self.ready.insert(*fd, revents);
                        }
                    }
                }
                Ok(n as usize)
            }
            Err(nix::errno::Errno::EINTR) => Ok(0),
            Err(_) => Err(Status::new(ErrorKind::IoError)),
        }
    }

    fn is_ready_for_read(&self, fd: RawFd) -> bool {
        self.ready
            .get(&fd)
            .is_some_and(|f| f.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
    }

    fn is_ready_for_write(&self, fd: RawFd) -> bool {
        self.ready.get(&fd).is_some_and(|f| f.intersects(PollFlags::POLLOUT))
    }

    fn is_exception(&self, fd: RawFd) -> bool {
        self.ready.get(&fd).is_some_and(|f| f.intersects(PollFlags::POLLPRI | PollFlags::POLLERR))
    }

    fn forget_socket(&mut self, fd: RawFd) {
        self.interest.remove(&fd);
        self.ready.remove(&fd);
    }
}
