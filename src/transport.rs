//! Pipe transport (C2): one-request-per-open discipline over a pair of
//! named pipes, per spec.md §4.2.

use crate::protocol::Request;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("codec error: {0}")]
    Codec(#[from] crate::wire::CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

#[derive(Debug, Clone)]
pub struct PipePaths {
    pub request: PathBuf,
    pub reply: PathBuf,
}

impl PipePaths {
    pub fn under(dir: &Path) -> PipePaths {
        PipePaths {
            request: dir.join("saturnd-request-pipe"),
            reply: dir.join("saturnd-reply-pipe"),
        }
    }
}

/// Anything the dispatcher can read one request frame from and write
/// one reply frame to. Abstracted so the dispatch loop in `dispatcher`
/// can be exercised against an in-memory double in tests, without
/// touching real FIFOs.
pub trait Transport {
    /// Blocks until a client connects and sends a full request frame.
    /// Returns `Ok(Err(opcode))` for an unrecognized opcode (still a
    /// successfully-read frame, just an unknown one — spec.md §4.5
    /// replies `ERROR(UNKNOWN)` for these rather than treating them as
    /// a transport failure).
    fn recv_request(&self) -> Result<Result<Request, u16>, TransportError>;

    /// Blocks until a client connects to read, then writes the whole
    /// reply frame in one call.
    fn send_reply(&self, frame: &[u8]) -> Result<(), TransportError>;
}

/// The real transport: opens the request FIFO for reading (blocking
/// until a writer connects), decodes, closes; then opens the reply
/// FIFO for writing (blocking until a reader connects), writes,
/// closes. Exactly the "one request per open" discipline of spec.md
/// §4.2.
///
/// FIFOs are opened via `nix::fcntl::open` (the same crate call
/// `bootstrap::ensure_pipes` uses to create them with `mkfifo`) rather
/// than `std::fs::OpenOptions`, so the blocking-mode flags are explicit
/// at the syscall level; the returned fd is immediately handed to
/// `std::fs::File` for buffered, close-on-drop `Read`/`Write`.
pub struct PipeTransport {
    paths: PipePaths,
}

impl PipeTransport {
    pub fn new(paths: PipePaths) -> Self {
        Self { paths }
    }
}

/// Opens `path` with `flags`, returning the fd as an owning `File`.
fn open_fifo(path: &Path, flags: OFlag) -> Result<File, nix::Error> {
    let fd = open(path, flags, Mode::empty())?;
    // SAFETY: `open` just returned this fd; nothing else holds it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

impl Transport for PipeTransport {
    fn recv_request(&self) -> Result<Result<Request, u16>, TransportError> {
        let file = open_fifo(&self.paths.request, OFlag::O_RDONLY)?;
        Ok(Request::decode(file)?)
    }

    fn send_reply(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut file = open_fifo(&self.paths.reply, OFlag::O_WRONLY)?;
        file.write_all(frame)?;
        Ok(())
    }
}

/// Non-blocking probe used by the startup self-test (spec.md §4.2):
/// if the request FIFO can be opened for non-blocking write, another
/// process is already reading it.
pub fn try_open_request_pipe_nonblocking_write(
    request_pipe: &Path,
) -> std::io::Result<Option<File>> {
    match open_fifo(request_pipe, OFlag::O_WRONLY | OFlag::O_NONBLOCK) {
        Ok(file) => Ok(Some(file)),
        Err(Errno::ENOENT) => Ok(None),
        Err(Errno::ENXIO) => Ok(None),
        Err(e) => Err(std::io::Error::from_raw_os_error(e as i32)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;
    use std::io::Write as _;
    use tempfile::TempDir;

    #[test]
    fn recv_request_decodes_what_send_reply_counterpart_wrote() {
        let dir = TempDir::new().unwrap();
        let paths = PipePaths::under(dir.path());
        nix::sys::stat::mkfifo(&paths.request, Mode::from_bits_truncate(0o600)).unwrap();
        nix::sys::stat::mkfifo(&paths.reply, Mode::from_bits_truncate(0o600)).unwrap();
        let transport = PipeTransport::new(paths.clone());

        let writer = std::thread::spawn(move || {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(&paths.request)
                .unwrap();
            f.write_all(&Request::Terminate.encode()).unwrap();
        });

        let decoded = transport.recv_request().unwrap().unwrap();
        assert_eq!(decoded.opcode(), Opcode::Terminate);
        writer.join().unwrap();
    }
}
