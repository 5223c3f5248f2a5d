//! Request/reply envelope (the non-byte-level half of C1) and the
//! opcode table from spec.md §4.5.

use crate::wire::{Commandline, Decoder, Encoder, Run, Task, Timing};
use crate::CodecResult;
use std::io::Read;

/// Client request opcodes, exactly spec.md §4.5's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Noop = 0,
    ListTasks = 1,
    CreateTask = 2,
    RemoveTask = 3,
    GetTimesAndExitcodes = 4,
    GetStdout = 5,
    GetStderr = 6,
    Terminate = 7,
}

impl Opcode {
    pub fn from_u16(v: u16) -> Option<Opcode> {
        Some(match v {
            0 => Opcode::Noop,
            1 => Opcode::ListTasks,
            2 => Opcode::CreateTask,
            3 => Opcode::RemoveTask,
            4 => Opcode::GetTimesAndExitcodes,
            5 => Opcode::GetStdout,
            6 => Opcode::GetStderr,
            7 => Opcode::Terminate,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Noop,
    ListTasks,
    CreateTask { timing: Timing, commandline: Commandline },
    RemoveTask { task_id: u64 },
    GetTimesAndExitcodes { task_id: u64 },
    GetStdout { task_id: u64 },
    GetStderr { task_id: u64 },
    Terminate,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Noop => Opcode::Noop,
            Request::ListTasks => Opcode::ListTasks,
            Request::CreateTask { .. } => Opcode::CreateTask,
            Request::RemoveTask { .. } => Opcode::RemoveTask,
            Request::GetTimesAndExitcodes { .. } => Opcode::GetTimesAndExitcodes,
            Request::GetStdout { .. } => Opcode::GetStdout,
            Request::GetStderr { .. } => Opcode::GetStderr,
            Request::Terminate => Opcode::Terminate,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u16(self.opcode() as u16);
        match self {
            Request::CreateTask { timing, commandline } => {
                enc.write_timing(timing);
                enc.write_commandline(commandline);
            }
            Request::RemoveTask { task_id }
            | Request::GetTimesAndExitcodes { task_id }
            | Request::GetStdout { task_id }
            | Request::GetStderr { task_id } => {
                enc.write_u64(*task_id);
            }
            Request::Noop | Request::ListTasks | Request::Terminate => {}
        }
        enc.into_bytes()
    }

    /// Decodes a request from a freshly opened request pipe. Unknown
    /// opcodes are preserved as `None` so the dispatcher can still
    /// reply with `ERROR(UNKNOWN)` per spec.md §4.5.
    pub fn decode<R: Read>(r: R) -> CodecResult<Result<Request, u16>> {
        let mut dec = Decoder::new(r);
        let opcode_raw = dec.read_u16()?;
        let req = match Opcode::from_u16(opcode_raw) {
            Some(Opcode::Noop) => Request::Noop,
            Some(Opcode::ListTasks) => Request::ListTasks,
            Some(Opcode::CreateTask) => {
                let (timing, commandline) = dec.read_task_without_id()?;
                Request::CreateTask { timing, commandline }
            }
            Some(Opcode::RemoveTask) => Request::RemoveTask {
                task_id: dec.read_u64()?,
            },
            Some(Opcode::GetTimesAndExitcodes) => Request::GetTimesAndExitcodes {
                task_id: dec.read_u64()?,
            },
            Some(Opcode::GetStdout) => Request::GetStdout {
                task_id: dec.read_u64()?,
            },
            Some(Opcode::GetStderr) => Request::GetStderr {
                task_id: dec.read_u64()?,
            },
            Some(Opcode::Terminate) => Request::Terminate,
            None => return Ok(Err(opcode_raw)),
        };
        Ok(Ok(req))
    }
}

/// Error subcodes, extensible per spec.md §4.5 ("implementations may
/// extend; client treats unknown subcodes as UNKNOWN").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSubcode {
    Unknown,
    NotFound,
    NeverRun,
}

impl ErrorSubcode {
    pub fn to_u16(self) -> u16 {
        match self {
            ErrorSubcode::Unknown => 0,
            ErrorSubcode::NotFound => 1,
            ErrorSubcode::NeverRun => 2,
        }
    }

    pub fn from_u16(v: u16) -> ErrorSubcode {
        match v {
            1 => ErrorSubcode::NotFound,
            2 => ErrorSubcode::NeverRun,
            _ => ErrorSubcode::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(OkPayload),
    Error(ErrorSubcode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OkPayload {
    Empty,
    Tasks(Vec<Task>),
    TaskId(u64),
    Runs(Vec<Run>),
    Output(Vec<u8>),
}

const REPLY_TYPE_OK: u16 = 0;
const REPLY_TYPE_ERROR: u16 = 1;

impl Reply {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Reply::Ok(payload) => {
                enc.write_u16(REPLY_TYPE_OK);
                match payload {
                    OkPayload::Empty => {}
                    OkPayload::Tasks(tasks) => enc.write_task_array(tasks),
                    OkPayload::TaskId(id) => enc.write_u64(*id),
                    OkPayload::Runs(runs) => enc.write_run_array(runs),
                    OkPayload::Output(s) => enc.write_byte_string(s),
                }
            }
            Reply::Error(subcode) => {
                enc.write_u16(REPLY_TYPE_ERROR);
                enc.write_u16(subcode.to_u16());
            }
        }
        enc.into_bytes()
    }

    /// Decodes a reply for the opcode the client just sent: the OK
    /// payload shape is opcode-dependent (spec.md §4.5's table), so the
    /// decoder needs to know which request produced this reply.
    pub fn decode<R: Read>(r: R, for_opcode: Opcode) -> CodecResult<Reply> {
        let mut dec = Decoder::new(r);
        let reply_type = dec.read_u16()?;
        if reply_type == REPLY_TYPE_ERROR {
            let subcode = dec.read_u16()?;
            return Ok(Reply::Error(ErrorSubcode::from_u16(subcode)));
        }
        let payload = match for_opcode {
            Opcode::ListTasks => OkPayload::Tasks(dec.read_task_array()?),
            Opcode::CreateTask => OkPayload::TaskId(dec.read_u64()?),
            Opcode::RemoveTask | Opcode::Terminate => OkPayload::Empty,
            Opcode::GetTimesAndExitcodes => OkPayload::Runs(dec.read_run_array()?),
            Opcode::GetStdout | Opcode::GetStderr => OkPayload::Output(dec.read_byte_string()?),
            Opcode::Noop => OkPayload::Empty,
        };
        Ok(Reply::Ok(payload))
    }
}

/// The 16-bit exit-code encoding fixed by SPEC_FULL §4.1 (resolving
/// spec.md §9's open question): low byte carries the exit status or
/// signal number, high bit of the high byte is set iff the process was
/// signaled. A third sentinel, `SpawnFailed`, covers spec.md §7's
/// "record a run with a distinguished exitcode encoding spawn
/// failure" without the worker itself being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitEncoding {
    Exited(u8),
    Signaled(u8),
    SpawnFailed,
}

const SIGNALED_FLAG: u16 = 0x8000;
const SPAWN_FAILED_FLAG: u16 = 0x4000;

impl ExitEncoding {
    pub fn to_u16(self) -> u16 {
        match self {
            ExitEncoding::Exited(status) => status as u16,
            ExitEncoding::Signaled(signal) => SIGNALED_FLAG | (signal as u16),
            ExitEncoding::SpawnFailed => SPAWN_FAILED_FLAG,
        }
    }

    pub fn from_u16(v: u16) -> ExitEncoding {
        if v & SIGNALED_FLAG != 0 {
            ExitEncoding::Signaled((v & 0xff) as u8)
        } else if v & SPAWN_FAILED_FLAG != 0 {
            ExitEncoding::SpawnFailed
        } else {
            ExitEncoding::Exited((v & 0xff) as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips_through_decode() {
        let req = Request::CreateTask {
            timing: Timing {
                minutes: 1,
                hours: 1,
                days_of_week: 1,
            },
            commandline: Commandline {
                argv: vec![b"/bin/true".to_vec()],
            },
        };
        let bytes = req.encode();
        let decoded = Request::decode(&bytes[..]).unwrap().unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn unknown_opcode_is_surfaced_not_erred() {
        let mut enc = Encoder::new();
        enc.write_u16(99);
        let bytes = enc.into_bytes();
        match Request::decode(&bytes[..]).unwrap() {
            Err(99) => {}
            other => panic!("expected Err(99), got {other:?}"),
        }
    }

    #[test]
    fn reply_roundtrips_for_each_opcode_shape() {
        let cases = vec![
            (Opcode::ListTasks, Reply::Ok(OkPayload::Tasks(vec![]))),
            (Opcode::CreateTask, Reply::Ok(OkPayload::TaskId(7))),
            (Opcode::RemoveTask, Reply::Ok(OkPayload::Empty)),
            (
                Opcode::GetTimesAndExitcodes,
                Reply::Ok(OkPayload::Runs(vec![Run { time: 1, exitcode: 0 }])),
            ),
            (
                Opcode::GetStdout,
                Reply::Ok(OkPayload::Output(b"hi".to_vec())),
            ),
            (
                Opcode::GetStdout,
                Reply::Error(ErrorSubcode::NeverRun),
            ),
        ];
        for (opcode, reply) in cases {
            let bytes = reply.encode();
            let decoded = Reply::decode(&bytes[..], opcode).unwrap();
            assert_eq!(decoded, reply);
        }
    }

    #[test]
    fn unknown_error_subcode_decodes_as_unknown() {
        assert_eq!(ErrorSubcode::from_u16(250), ErrorSubcode::Unknown);
    }

    #[test]
    fn exit_encoding_roundtrips() {
        assert_eq!(ExitEncoding::from_u16(ExitEncoding::Exited(7).to_u16()), ExitEncoding::Exited(7));
        assert_eq!(ExitEncoding::from_u16(ExitEncoding::Exited(255).to_u16()), ExitEncoding::Exited(255));
        assert_eq!(
            ExitEncoding::from_u16(ExitEncoding::Signaled(9).to_u16()),
            ExitEncoding::Signaled(9)
        );
        assert_eq!(
            ExitEncoding::from_u16(ExitEncoding::SpawnFailed.to_u16()),
            ExitEncoding::SpawnFailed
        );
    }
}
