//! `select`-based multiplexer backend.
//!
//! Maintains three fd sets and a max-fd; registrations accumulate in one
//! set while the previous cycle's results are read from a separate
//! "ready" set, giving the double-buffering behavior described in §4.4.

use super::Backend;
use crate::status::{ErrorKind, Status, StatusResult};
use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};
use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Default)]
pub(super) struct SelectBackend {
    read_interest: HashSet<RawFd>,
    write_interest: HashSet<RawFd>,
    except_interest: HashSet<RawFd>,
    ready_read: HashSet<RawFd>,
    ready_write: HashSet<RawFd>,
    ready_except: HashSet<RawFd>,
}

impl SelectBackend {
    pub(super) fn new() -> Self {
        Self::default()
    }
}

impl Backend for SelectBackend {
    fn register_for_read(&mut self, fd: RawFd) {
        self.read_interest.insert(fd);
    }

    fn register_for_write(&mut self, fd: RawFd) {
        self.write_interest.insert(fd);
    }

    fn register_for_exception(&mut self, fd: RawFd) {
        self.except_interest.insert(fd);
    }

    fn wait(&mut self, timeout: Option<Duration>) -> StatusResult<usize> {
        let mut read_fds = FdSet::new();
        let mut write_fds = FdSet::new();
        let mut except_fds = FdSet::new();
        let mut max_fd: Option<RawFd> = None;

        for &fd in &self.read_interest {
            read_fds.insert(fd);
            max_fd = Some(max_fd.map_or(fd, |m| m.max(fd)));
        }
        for &fd in &self.write_interest {
            write_fds.insert(fd);
            max_fd = Some(max_fd.map_or(fd, |m| m.max(fd)));
        }
        for &fd in &self.except_interest {
            except_fds.insert(fd);
            max_fd = Some(max_fd.map_or(fd, |m| m.max(fd)));
        }

        let mut timeval = timeout.map(|d| TimeVal::milliseconds(d.as_millis() as i64));

        let result = select(
            max_fd.map(|m| m + 1),
            Some(&mut read_fds),
            Some(&mut write_fds),
            Some(&mut except_fds),
            timeval.as_mut(),
        );

        self.read_interest.clear();
        self.write_interest.clear();
        self.except_interest.clear();

        match result {
            Ok(n) => {
                self.ready_read = fds_to_set(&read_fds);
                self.ready_write = fds_to_set(&write_fds);
                self.ready_except = fds_to_set(&except_fds);
                Ok(n as usize)
            }
            Err(nix::errno::Errno::EINTR) => {
                self.ready_read.clear();
                self.ready_write.clear();
                self.ready_except.clear();
                Ok(0)
            }
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
        self.ready_except.contains(&fd)
    }

    fn forget_socket(&mut self, fd: RawFd) {
        self.read_interest.remove(&fd);
        self.write_interest.remove(&fd);
        self.except_interest.remove(&fd);
        self.ready_read.remove(&fd);
        self.ready_write.remove(&fd);
        self.ready_except.remove(&fd);
    }
}

fn fds_to_set(fds: &FdSet) -> HashSet<RawFd> {
    fds.fds(None).collect()
}
