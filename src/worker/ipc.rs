//! Pipe primitives for result channels.
//!
//! The read end is switched to non-blocking mode so polling never stalls the
//! waiter; the write end stays blocking so a worker simply waits for the
//! reader when the pipe buffer is full.

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Read chunk size for draining a pipe (64KB).
const READ_CHUNK: usize = 64 * 1024;

/// How long to wait for the rest of a line that has started arriving.
const PARTIAL_LINE_WAIT_MS: u16 = 10;

/// A pipe end that retries on EINTR.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Put the descriptor into `O_NONBLOCK` mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        fcntl(&self.fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map(|_| ())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}

/// Create a pipe, returning `(read_end, write_end)` with a non-blocking read end.
pub fn pipe() -> io::Result<(PipeFd, PipeFd)> {
    let (read_fd, write_fd) =
        nix::unistd::pipe().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    let reader = PipeFd::new(read_fd);
    reader.set_nonblocking()?;
    Ok((reader, PipeFd::new(write_fd)))
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Outcome of polling a non-blocking line reader.
#[derive(Debug, PartialEq, Eq)]
pub enum LinePoll {
    /// A complete line (without the trailing newline).
    Line(String),
    /// No complete line yet.
    Pending,
    /// Writer closed with no further complete line.
    Eof,
}

/// Accumulates bytes from a non-blocking pipe and splits them into lines.
pub struct LineReader {
    fd: PipeFd,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to contain no newline.
    scanned: usize,
    eof: bool,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            fd,
            buffer: Vec::new(),
            scanned: 0,
            eof: false,
        }
    }

    /// Read whatever is available without blocking.
    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        while !self.eof {
            match self.fd.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Wait briefly for more bytes. Returns false if none arrived in time.
    fn wait_readable(&self) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(PARTIAL_LINE_WAIT_MS)) {
            Ok(ready) => Ok(ready > 0),
            Err(Errno::EINTR) => Ok(true),
            Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
        }
    }

    fn find_newline(&mut self) -> Option<usize> {
        let found = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|offset| self.scanned + offset);
        self.scanned = found.unwrap_or(self.buffer.len());
        found
    }

    /// Return the next complete line, if any.
    ///
    /// Never blocks on an idle pipe. Once part of a line has arrived, keeps
    /// reading while the writer keeps producing, so a large message is
    /// drained in one call instead of one pipe buffer per call.
    pub fn poll_line(&mut self) -> io::Result<LinePoll> {
        self.fill()?;
        loop {
            if let Some(end) = self.find_newline() {
                let rest = self.buffer.split_off(end + 1);
                let mut line = std::mem::replace(&mut self.buffer, rest);
                self.scanned = 0;
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line)
                    .map(LinePoll::Line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            }
            if self.eof {
                return Ok(LinePoll::Eof);
            }
            if self.buffer.is_empty() || !self.wait_readable()? {
                return Ok(LinePoll::Pending);
            }
            self.fill()?;
        }
    }

    /// True if bytes beyond the lines already returned have arrived.
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// Buffered line writer over a blocking pipe end.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(READ_CHUNK, fd),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}
