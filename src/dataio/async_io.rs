use super::DataIo;
use crate::status::{ErrorKind, IoResult, Status, StatusResult};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::{debug, warn};

/// A command sent to the async-I/O worker thread, carrying the byte
/// offset (in the main thread's output stream) at which it must take
/// effect, so ordering with respect to written bytes survives the
/// out-of-band channel (§4.5, §5).
#[derive(Debug)]
pub enum AsyncDataIoCommand {
    Seek(u64),
    Flush,
    Shutdown,
}

struct PendingCommand {
    command: AsyncDataIoCommand,
    at_output_offset: u64,
}

/// Moves blocking operations against a real `DataIo` backend onto a
/// dedicated worker thread, mirroring bytes to/from the main thread
/// through a connected Unix socket pair (§4.5 "async-I/O wrapper", §5).
pub struct AsyncDataIo {
    main_end: UnixStream,
    command_tx: crossbeam_channel::Sender<PendingCommand>,
    bytes_written: u64,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl AsyncDataIo {
    pub fn spawn<T: DataIo + Send + 'static>(inner: T) -> StatusResult<Self> {
        let (main_end, worker_end) = UnixStream::pair().map_err(Status::from)?;
        main_end.set_nonblocking(true).map_err(Status::from)?;
        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        let worker = std::thread::Builder::new()
            .name("muscle-async-dataio".into())
            .spawn(move || worker_loop(inner, worker_end, command_rx))
            .map_err(|_| Status::new(ErrorKind::IoError))?;

        Ok(AsyncDataIo {
            main_end,
            command_tx,
            bytes_written: 0,
            worker: Some(worker),
        })
    }

    fn send(&self, command: AsyncDataIoCommand) -> StatusResult<()> {
        self.command_tx
            .send(PendingCommand {
                command,
                at_output_offset: self.bytes_written,
            })
            .map_err(|_| Status::new(ErrorKind::ShuttingDown))
    }
}

impl Drop for AsyncDataIo {
    fn drop(&mut self) {
        let _ = self.send(AsyncDataIoCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl DataIo for AsyncDataIo {
    fn read(&mut self, buf: &mut [u8]) -> IoResult {
        match self.main_end.read(buf) {
            Ok(0) => IoResult::err(Status::new(ErrorKind::EndOfStream)),
            Ok(n) => IoResult::ok(n as u64),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => IoResult::ok(0),
            Err(e) => IoResult::err(Status::from(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoResult {
        match self.main_end.write(buf) {
            Ok(n) => {
                self.bytes_written += n as u64;
                IoResult::ok(n as u64)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => IoResult::ok(0),
            Err(e) => IoResult::err(Status::from(e)),
        }
    }

    fn flush(&mut self) -> StatusResult<()> {
        self.send(AsyncDataIoCommand::Flush)
    }

    fn seek(&mut self, offset: u64) -> StatusResult<()> {
        self.send(AsyncDataIoCommand::Seek(offset))
    }

    fn shutdown(&mut self) -> StatusResult<()> {
        self.send(AsyncDataIoCommand::Shutdown)
    }

    fn read_select_fd(&self) -> Option<RawFd> {
        Some(self.main_end.as_raw_fd())
    }

    fn write_select_fd(&self) -> Option<RawFd> {
        Some(self.main_end.as_raw_fd())
    }
}

/// Body of the dedicated worker thread. Pumps bytes in both directions
/// and executes queued commands only once the real backend has forwarded
/// at least as many bytes as the command's recorded offset, preserving
/// ordering (§5 "A `seek` or `flush` issued by the main thread ... takes
/// effect exactly at the byte offset").
fn worker_loop<T: DataIo>(
    mut inner: T,
    worker_end: UnixStream,
    command_rx: crossbeam_channel::Receiver<PendingCommand>,
) {
    worker_end
        .set_read_timeout(Some(Duration::from_millis(5)))
        .ok();

    let mut pending: Vec<PendingCommand> = Vec::new();
    let mut bytes_forwarded: u64 = 0;
    let mut shutting_down = false;
    let mut chunk = [0u8; 8192];

    loop {
        while let Ok(cmd) = command_rx.try_recv() {
            pending.push(cmd);
        }

        pending.retain(|p| {
            if p.at_output_offset > bytes_forwarded {
                return true;
            }
            match &p.command {
                AsyncDataIoCommand::Seek(offset) => {
                    if let Err(e) = inner.seek(*offset) {
                        warn!(?e, "async data-io worker: seek failed");
                    }
                }
                AsyncDataIoCommand::Flush => {
                    if let Err(e) = inner.flush() {
                        warn!(?e, "async data-io worker: flush failed");
                    }
                }
                AsyncDataIoCommand::Shutdown => {
                    if let Err(e) = inner.shutdown() {
                        warn!(?e, "async data-io worker: shutdown failed");
                    }
                    shutting_down = true;
                }
            }
            false
        });

        if shutting_down {
            debug!("async data-io worker exiting");
            break;
        }

        let mut worker_end = &worker_end;
        match worker_end.read(&mut chunk) {
            Ok(0) => {
                shutting_down = true;
                continue;
            }
            Ok(n) => {
                let mut offset = 0;
                while offset < n {
                    let result = inner.write(&chunk[offset..n]);
                    if result.is_error() {
                        shutting_down = true;
                        break;
                    }
                    let advanced = result.byte_count() as usize;
                    if advanced == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    offset += advanced;
                    bytes_forwarded += advanced as u64;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => {
                shutting_down = true;
                continue;
            }
        }

        let read_result = inner.read(&mut chunk);
        if read_result.byte_count() > 0 {
            let mut worker_end = &worker_end;
            if worker_end.write_all(&chunk[..read_result.byte_count() as usize]).is_err() {
                shutting_down = true;
            }
        } else if read_result.is_error() {
            shutting_down = true;
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataio::UnixDataIo;

    #[test]
    fn mirrors_bytes_through_the_worker_thread() {
        let (inner_a, inner_b) = UnixStream::pair().unwrap();
        let inner_dataio = UnixDataIo::new(inner_b).unwrap();
        let mut async_io = AsyncDataIo::spawn(inner_dataio).unwrap();

        let mut peer = inner_a;
        peer.write_all(b"async-hello").unwrap();

        let mut buf = [0u8; 32];
        let mut total = 0;
        for _ in 0..50 {
            let r = async_io.read(&mut buf[total..]);
            total += r.byte_count() as usize;
            if total >= 11 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(&buf[..11], b"async-hello");
    }

    #[test]
    fn flush_command_runs_without_blocking_the_main_thread() {
        let (inner_a, inner_b) = UnixStream::pair().unwrap();
        let inner_dataio = UnixDataIo::new(inner_b).unwrap();
        let mut async_io = AsyncDataIo::spawn(inner_dataio).unwrap();
        async_io.write(b"x");
        assert!(async_io.flush().is_ok());
        drop(inner_a);
    }
}
