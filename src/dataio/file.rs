use super::DataIo;
use crate::status::{ErrorKind, IoResult, Status, StatusResult};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};

/// A seekable file data-I/O (§4.5 "file"). Files have no natural
/// select-readiness concept; `read_select_fd`/`write_select_fd` return the
/// file's own fd, which a `poll`/`select` backend will report as always
/// ready, matching regular-file semantics under those syscalls.
pub struct FileDataIo {
    file: File,
}

impl FileDataIo {
    pub fn new(file: File) -> Self {
        FileDataIo { file }
    }
}

impl DataIo for FileDataIo {
    fn read(&mut self, buf: &mut [u8]) -> IoResult {
        match self.file.read(buf) {
            Ok(0) => IoResult::err(Status::new(ErrorKind::EndOfStream)),
            Ok(n) => IoResult::ok(n as u64),
            Err(e) => IoResult::err(Status::from(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoResult {
        match self.file.write(buf) {
            Ok(n) => IoResult::ok(n as u64),
            Err(e) => IoResult::err(Status::from(e)),
        }
    }

    fn flush(&mut self) -> StatusResult<()> {
        self.file.flush().map_err(Status::from)
    }

    fn seek(&mut self, offset: u64) -> StatusResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(Status::from)
    }

    fn shutdown(&mut self) -> StatusResult<()> {
        self.file.flush().map_err(Status::from)
    }

    fn read_select_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }

    fn write_select_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn writes_then_seeks_and_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.bin");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(b"0123456789").unwrap();
        }
        let f = std::fs::OpenOptions::new().read(true).open(&path).unwrap();
        let mut io = FileDataIo::new(f);
        io.seek(3).unwrap();
        let mut buf = [0u8; 4];
        let r = io.read(&mut buf);
        assert_eq!(r.byte_count(), 4);
        assert_eq!(&buf, b"3456");
    }

    #[test]
    fn read_past_end_of_file_is_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        File::create(&path).unwrap();
        let f = std::fs::OpenOptions::new().read(true).open(&path).unwrap();
        let mut io = FileDataIo::new(f);
        let mut buf = [0u8; 4];
        let r = io.read(&mut buf);
        assert_eq!(r.status().kind(), ErrorKind::EndOfStream);
    }
}
