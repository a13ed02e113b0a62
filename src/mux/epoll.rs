//! `epoll`-based multiplexer backend (Linux only).
//!
//! Keeps a userland table of the interest bits currently registered with
//! the kernel per fd, and on each registration call diffs against it,
//! issuing `EPOLL_CTL_ADD`/`MOD`/`DEL` only when the kernel's view must
//! change (§4.4).

use super::Backend;
use crate::status::{ErrorKind, Status, StatusResult};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Default, Clone, Copy, PartialEq, Eq)]
struct Interest {
    read: bool,
    write: bool,
    except: bool,
}

impl Interest {
    fn to_epoll_flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        if self.except {
            flags |= EpollFlags::EPOLLPRI;
        }
        flags
    }

    fn is_empty(self) -> bool {
        !self.read && !self.write && !self.except
    }
}

pub(super) struct EpollBackend {
    epoll: Epoll,
    registered: HashMap<RawFd, Interest>,
    pending: HashMap<RawFd, Interest>,
    ready: HashMap<RawFd, EpollFlags>,
}

impl EpollBackend {
    pub(super) fn new() -> StatusResult<Self> {
        let epoll =
            Epoll::new(EpollCreateFlags::empty()).map_err(|_| Status::new(ErrorKind::IoError))?;
        Ok(EpollBackend {
            epoll,
            registered: HashMap::new(),
            pending: HashMap::new(),
            ready: HashMap::new(),
        })
    }

    fn want(&mut self, fd: RawFd) -> &mut Interest {
        self.pending.entry(fd).or_insert(Interest::default())
    }

    fn sync_kernel_state(&mut self) -> StatusResult<()> {
        let fds: Vec<RawFd> = self
            .registered
            .keys()
            .chain(self.pending.keys())
            .copied()
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();

        for fd in fds {
            let old = self.registered.get(&fd).copied().unwrap_or_default();
            let new = self.pending.get(&fd).copied().unwrap_or_default();
            if old == new {
                continue;
            }
            // SAFETY: fd is owned by the caller for the lifetime of this call.
            let borrowed: BorrowedFd = unsafe { BorrowedFd::borrow_raw(fd) };
            if new.is_empty() {
                let _ = self.epoll.delete(borrowed);
                self.registered.remove(&fd);
                continue;
            }
            let mut event = EpollEvent::new(new.to_epoll_flags(), fd as u64);
            if old.is_empty() {
                self.epoll
                    .add(borrowed, event)
                    .map_err(|_| Status::new(ErrorKind::IoError))?;
            } else {
                self.epoll
                    .modify(borrowed, &mut event)
                    .map_err(|_| Status::new(ErrorKind::IoError))?;
            }
            self.registered.insert(fd, new);
        }
        Ok(())
    }
}

impl Backend for EpollBackend {
    fn register_for_read(&mut self, fd: RawFd) {
        self.want(fd).read = true;
    }

    fn register_for_write(&mut self, fd: RawFd) {
        self.want(fd).write = true;
    }

    fn register_for_exception(&mut self, fd: RawFd) {
        self.want(fd).except = true;
    }

    fn wait(&mut self, timeout: Option<Duration>) -> StatusResult<usize> {
        self.sync_kernel_state()?;
        self.pending.clear();
        self.ready.clear();

        let epoll_timeout: EpollTimeout = match timeout {
            Some(d) => EpollTimeout::try_from(d.as_millis() as isize)
                .unwrap_or(EpollTimeout::NONE),
            None => EpollTimeout::NONE,
        };

        let mut events = vec![EpollEvent::empty(); self.registered.len().max(1)];
        match self.epoll.wait(&mut events, epoll_timeout) {
            Ok(n) => {
                for ev in events.iter().take(n) {
                    let fd = ev.data() as RawFd;
                    self.ready.insert(fd, ev.events());
                }
                Ok(n)
            }
            Err(nix::errno::Errno::EINTR) => Ok(0),
            Err(_) => Err(Status::new(ErrorKind::IoError)),
        }
    }

    fn is_ready_for_read(&self, fd: RawFd) -> bool {
        self.ready.get(&fd).is_some_and(|f| {
            f.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
        })
    }

    fn is_ready_for_write(&self, fd: RawFd) -> bool {
        self.ready
            .get(&fd)
            .is_some_and(|f| f.intersects(EpollFlags::EPOLLOUT))
    }

    fn is_exception(&self, fd: RawFd) -> bool {
        self.ready
            .get(&fd)
            .is_some_and(|f| f.intersects(EpollFlags::EPOLLPRI | EpollFlags::EPOLLERR))
    }

    fn forget_socket(&mut self, fd: RawFd) {
        if self.registered.remove(&fd).is_some() {
            // SAFETY: fd is still valid; caller is telling us it's about to close.
            let borrowed: BorrowedFd = unsafe { BorrowedFd::borrow_raw(fd) };
            let _ = self.epoll.delete(borrowed);
        }
        self.pending.remove(&fd);
        self.ready.remove(&fd);
    }
}
