//! Byte-level wire codec (C1): big-endian primitives and the composite
//! values of the protocol, encoded into/decoded out of plain `Vec<u8>`
//! buffers with explicit length prefixes.
//!
//! Nothing here touches a file descriptor; see `transport` for that.

use std::io::{self, Read, Write};
use thiserror::Error;

/// Maximum accepted length of a `String` payload, in bytes.
pub const MAX_STRING: u32 = 1 << 20;

/// Maximum accepted argument count of a `Commandline`.
pub const MAX_ARGS: u32 = 4096;

/// Maximum accepted element count of a `Task`/`Run` array.
pub const MAX_ARRAY: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame")]
    Malformed,
    #[error("string length {len} exceeds maximum {max}")]
    StringTooLong { len: u32, max: u32 },
    #[error("argument count {argc} exceeds maximum {max}")]
    TooManyArgs { argc: u32, max: u32 },
    #[error("array count {count} exceeds maximum {max}")]
    ArrayTooLong { count: u32, max: u32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Reads fixed-width big-endian primitives and length-prefixed
/// composites from any `Read`, translating short reads and EOF into
/// `CodecError::Malformed` per spec.
pub struct Decoder<R> {
    inner: R,
}

impl<R: Read> Decoder<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn read_exact_or_malformed(&mut self, buf: &mut [u8]) -> CodecResult<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(CodecError::Malformed),
            Err(e) => Err(CodecError::Io(e)),
        }
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        let mut buf = [0u8; 1];
        self.read_exact_or_malformed(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> CodecResult<u16> {
        let mut buf = [0u8; 2];
        self.read_exact_or_malformed(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn read_u32(&mut self) -> CodecResult<u32> {
        let mut buf = [0u8; 4];
        self.read_exact_or_malformed(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_u64(&mut self) -> CodecResult<u64> {
        let mut buf = [0u8; 8];
        self.read_exact_or_malformed(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Reads the wire `String` primitive: a `u32` length prefix
    /// followed by that many raw bytes, per spec.md §3 ("a
    /// length-prefixed byte sequence; no implicit terminator"). The
    /// protocol places no encoding constraint on those bytes — an
    /// argv entry or captured stdout/stderr may legally be non-UTF-8
    /// on Linux — so this returns the raw bytes rather than rejecting
    /// anything that isn't valid UTF-8. Conversion to a Rust `String`
    /// for display happens only at the CLI print boundary.
    pub fn read_byte_string(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.read_u32()?;
        if len > MAX_STRING {
            return Err(CodecError::StringTooLong {
                len,
                max: MAX_STRING,
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact_or_malformed(&mut buf)?;
        Ok(buf)
    }

    pub fn read_commandline(&mut self) -> CodecResult<Commandline> {
        let argc = self.read_u32()?;
        if argc > MAX_ARGS {
            return Err(CodecError::TooManyArgs {
                argc,
                max: MAX_ARGS,
            });
        }
        if argc == 0 {
            return Err(CodecError::Malformed);
        }
        let mut argv = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            argv.push(self.read_byte_string()?);
        }
        Ok(Commandline { argv })
    }

    pub fn read_timing(&mut self) -> CodecResult<Timing> {
        let minutes = self.read_u64()?;
        let hours = self.read_u32()?;
        let days_of_week = self.read_u8()?;
        Ok(Timing {
            minutes,
            hours,
            days_of_week,
        })
    }

    /// Reads a `Task` without a leading `task_id` (the wire form used on
    /// `CREATE_TASK` requests, where the id is server-assigned).
    pub fn read_task_without_id(&mut self) -> CodecResult<(Timing, Commandline)> {
        let timing = self.read_timing()?;
        let commandline = self.read_commandline()?;
        Ok((timing, commandline))
    }

    /// Reads a `Task` including its `task_id` (the wire form used in
    /// `LIST_TASKS` replies).
    pub fn read_task_with_id(&mut self) -> CodecResult<Task> {
        let task_id = self.read_u64()?;
        let timing = self.read_timing()?;
        let commandline = self.read_commandline()?;
        Ok(Task {
            task_id,
            timing,
            commandline,
        })
    }

    pub fn read_task_array(&mut self) -> CodecResult<Vec<Task>> {
        let count = self.read_u32()?;
        if count > MAX_ARRAY {
            return Err(CodecError::ArrayTooLong {
                count,
                max: MAX_ARRAY,
            });
        }
        let mut tasks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            tasks.push(self.read_task_with_id()?);
        }
        Ok(tasks)
    }

    pub fn read_run_array(&mut self) -> CodecResult<Vec<Run>> {
        let count = self.read_u32()?;
        if count > MAX_ARRAY {
            return Err(CodecError::ArrayTooLong {
                count,
                max: MAX_ARRAY,
            });
        }
        let mut runs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let time = self.read_u64()?;
            let exitcode = self.read_u16()?;
            runs.push(Run { time, exitcode });
        }
        Ok(runs)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Appends fixed-width big-endian primitives and length-prefixed
/// composites to an in-memory buffer. Encoding never fails for
/// already-validated in-memory values; `Write` errors only occur for
/// the in-memory `Vec<u8>` sink used here, which cannot fail.
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_byte_string(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_commandline(&mut self, cmd: &Commandline) {
        self.write_u32(cmd.argv.len() as u32);
        for arg in &cmd.argv {
            self.write_byte_string(arg);
        }
    }

    pub fn write_timing(&mut self, timing: &Timing) {
        self.write_u64(timing.minutes);
        self.write_u32(timing.hours);
        self.write_u8(timing.days_of_week);
    }

    pub fn write_task_with_id(&mut self, task: &Task) {
        self.write_u64(task.task_id);
        self.write_timing(&task.timing);
        self.write_commandline(&task.commandline);
    }

    pub fn write_task_array(&mut self, tasks: &[Task]) {
        self.write_u32(tasks.len() as u32);
        for t in tasks {
            self.write_task_with_id(t);
        }
    }

    pub fn write_run_array(&mut self, runs: &[Run]) {
        self.write_u32(runs.len() as u32);
        for r in runs {
            self.write_u64(r.time);
            self.write_u16(r.exitcode);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the whole buffer to `w` in a single call, matching the
/// "atomic write" contract of spec.md §4.1: the frame is composed
/// fully in memory first, then handed to the transport in one shot.
pub fn write_frame<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_all(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commandline {
    pub argv: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timing {
    pub minutes: u64,
    pub hours: u32,
    pub days_of_week: u8,
}

impl Timing {
    /// The conjunction of the three bitmap tests described in spec.md
    /// §3: minute, hour and day-of-week must all have their bit set.
    pub fn matches(&self, minute: u32, hour: u32, day_of_week: u8) -> bool {
        debug_assert!(minute < 60);
        debug_assert!(hour < 24);
        debug_assert!(day_of_week < 7);
        (self.minutes & (1u64 << minute)) != 0
            && (self.hours & (1u32 << hour)) != 0
            && (self.days_of_week & (1u8 << day_of_week)) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_id: u64,
    pub timing: Timing,
    pub commandline: Commandline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub time: u64,
    pub exitcode: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_task(task: &Task) -> Task {
        let mut enc = Encoder::new();
        enc.write_task_with_id(task);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes[..]);
        dec.read_task_with_id().unwrap()
    }

    #[test]
    fn task_roundtrips() {
        let task = Task {
            task_id: 42,
            timing: Timing {
                minutes: 0b101,
                hours: 0b1,
                days_of_week: 0b1111111,
            },
            commandline: Commandline {
                argv: vec![b"/bin/true".to_vec(), b"--flag".to_vec()],
            },
        };
        assert_eq!(roundtrip_task(&task), task);
    }

    #[test]
    fn byte_string_roundtrips() {
        let mut enc = Encoder::new();
        enc.write_byte_string(b"hello saturnd");
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes[..]);
        assert_eq!(dec.read_byte_string().unwrap(), b"hello saturnd");
    }

    #[test]
    fn non_utf8_byte_string_roundtrips() {
        // spec.md §3's `String` carries no encoding constraint; a
        // well-formed frame with invalid-UTF-8 bytes must still
        // round-trip rather than being rejected as malformed.
        let invalid_utf8 = vec![0x66, 0x6f, 0xff, 0xfe, 0x6f];
        let mut enc = Encoder::new();
        enc.write_byte_string(&invalid_utf8);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes[..]);
        assert_eq!(dec.read_byte_string().unwrap(), invalid_utf8);
    }

    #[test]
    fn string_too_long_is_rejected() {
        let mut enc = Encoder::new();
        enc.write_u32(MAX_STRING + 1);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes[..]);
        match dec.read_byte_string() {
            Err(CodecError::StringTooLong { .. }) => {}
            other => panic!("expected StringTooLong, got {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let mut enc = Encoder::new();
        enc.write_u32(10); // claims 10 bytes follow
        enc.write_byte_string(b"short"); // only 5 bytes-worth follow it, plus its own prefix
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes[..]);
        match dec.read_byte_string() {
            Err(CodecError::Malformed) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn zero_argc_commandline_is_malformed() {
        let mut enc = Encoder::new();
        enc.write_u32(0);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes[..]);
        match dec.read_commandline() {
            Err(CodecError::Malformed) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn timing_matches_conjunction() {
        let timing = Timing {
            minutes: 1 << 4,
            hours: 1,
            days_of_week: 0b1111111,
        };
        assert!(timing.matches(4, 0, 2));
        assert!(!timing.matches(5, 0, 2));
        assert!(!timing.matches(4, 1, 2));
    }

    #[test]
    fn run_array_roundtrips() {
        let runs = vec![Run { time: 100, exitcode: 0 }, Run { time: 160, exitcode: 7 }];
        let mut enc = Encoder::new();
        enc.write_run_array(&runs);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes[..]);
        assert_eq!(dec.read_run_array().unwrap(), runs);
    }
}
