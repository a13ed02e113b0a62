//! `kqueue`-based multiplexer backend (macOS/BSD family).
//!
//! Like the epoll backend, diffs the desired interest set against what the
//! kernel currently holds and submits only the `EV_ADD`/`EV_DELETE` changes
//! needed, via a single `kevent` changelist per wait cycle (§4.4).

use super::Backend;
use crate::status::{ErrorKind, Status, StatusResult};
use nix::sys::event::{kevent_ts, EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use nix::sys::time::TimeSpec;
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Default, Clone, Copy, PartialEq, Eq)]
struct Interest {
    read: bool,
    write: bool,
}

pub(super) struct KqueueBackend {
    kq: Kqueue,
    registered: HashMap<RawFd, Interest>,
    pending: HashMap<RawFd, Interest>,
    ready_read: HashSet<RawFd>,
    ready_write: HashSet<RawFd>,
    except: HashSet<RawFd>,
}

impl KqueueBackend {
    pub(super) fn new() -> StatusResult<Self> {
        let kq = Kqueue::new().map_err(|_| Status::new(ErrorKind::IoError))?;
        Ok(KqueueBackend {
            kq,
            registered: HashMap::new(),
            pending: HashMap::new(),
            ready_read: HashSet::new(),
            ready_write: HashSet::new(),
            except: HashSet::new(),
        })
    }

    fn want(&mut self, fd: RawFd) -> &mut Interest {
        self.pending.entry(fd).or_insert(Interest::default())
    }

    fn build_changelist(&mut self) -> Vec<KEvent> {
        let mut changes = Vec::new();
        let fds: Vec<RawFd> = self
            .registered
            .keys()
            .chain(self.pending.keys())
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        for fd in fds {
            let old = self.registered.get(&fd).copied().unwrap_or_default();
            let new = self.pending.get(&fd).copied().unwrap_or_default();
            if old.read != new.read {
                let flag = if new.read {
                    EventFlag::EV_ADD
                } else {
                    EventFlag::EV_DELETE
                };
                changes.push(KEvent::new(
                    fd as usize,
                    EventFilter::EVFILT_READ,
                    flag,
                    FilterFlag::empty(),
                    0,
                    0,
                ));
            }
            if old.write != new.write {
                let flag = if new.write {
                    EventFlag::EV_ADD
                } else {
                    EventFlag::EV_DELETE
                };
                changes.push(KEvent::new(
                    fd as usize,
                    EventFilter::EVFILT_WRITE,
                    flag,
                    FilterFlag::empty(),
                    0,
                    0,
                ));
            }
            if new.read || new.write {
                self.registered.insert(fd, new);
            } else {
                self.registered.remove(&fd);
            }
        }
        changes
    }
}

impl Backend for KqueueBackend {
    fn register_for_read(&mut self, fd: RawFd) {
        self.want(fd).read = true;
    }

    fn register_for_write(&mut self, fd: RawFd) {
        self.want(fd).write = true;
    }

    fn register_for_exception(&mut self, _fd: RawFd) {
        // kqueue reports errors/EOF inline on the read/write filters via
        // EV_EOF/EV_ERROR rather than a distinct exceptfds concept.
    }

    fn wait(&mut self, timeout: Option<Duration>) -> StatusResult<usize> {
        let changes = self.build_changelist();
        self.pending.clear();
        self.ready_read.clear();
        self.ready_write.clear();
        self.except.clear();

        let timeout_spec = timeout.map(|d| TimeSpec::from_duration(d));
        let mut out_events = vec![
            KEvent::new(
                0,
                EventFilter::EVFILT_READ,
                EventFlag::empty(),
                FilterFlag::empty(),
                0,
                0
            );
            self.registered.len().max(1) * 2
        ];

        let result = kevent_ts(&self.kq, &changes, &mut out_events, timeout_spec);
        match result {
            Ok(n) => {
                for ev in out_events.iter().take(n) {
                    let fd = ev.ident() as RawFd;
                    let flags = ev.flags();
                    match ev.filter() {
                        Ok(EventFilter::EVFILT_READ) => {
                            self.ready_read.insert(fd);
                            if flags.contains(EventFlag::EV_EOF) || flags.contains(EventFlag::EV_ERROR) {
                                self.except.insert(fd);
                            }
                        }
                        Ok(EventFilter::EVFILT_WRITE) => {
                            self.ready_write.insert(fd);
                            if flags.contains(EventFlag::EV_EOF) || flags.contains(EventFlag::EV_ERROR) {
                                self.except.insert(fd);
                            }
                        }
                        _ => {}
                    }
                }
                Ok(n)
            }
            Err(nix::errno::Errno::EINTR) => Ok(0),
            Err(_) => Err(Status::new(ErrorKind::IoError)),
        }
    }

    fn is_ready_for_read(&self, fd: RawFd) -> bool {
        self.ready_read.contains(&fd)
    }

    fn is_ready_for_write(&self, fd: RawFd) -> bool {
        self.ready_write.contains(&fd)
    }

    fn is_exception(&self, fd: RawFd) -> bool {
        self.except.contains(&fd)
    }

    fn forget_socket(&mut self, fd: RawFd) {
        self.registered.remove(&fd);
        self.pending.remove(&fd);
        self.ready_read.remove(&fd);
        self.ready_write.remove(&fd);
        self.except.remove(&fd);
    }
}
