//! CLI front door (C7): `structopt`-derived option parsing for both
//! binaries, and the `cassini` subcommand-to-request/reply-to-exit-code
//! translation from SPEC_FULL §4.7/§6.

use crate::protocol::{ErrorSubcode, OkPayload, Opcode, Reply, Request};
use crate::wire::{Commandline, Timing};
use std::io::Write as _;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "saturnd", about = "a user-level cron-like daemon")]
pub struct SaturndOptions {
    /// Look for the pipes (or create them if absent) in PIPES_DIR.
    #[structopt(short = "p", long = "pipes-dir")]
    pub pipes_dir: Option<PathBuf>,

    /// Double-fork to detach from the controlling terminal.
    #[structopt(short = "d", long = "daemonize")]
    pub daemonize: bool,
}

#[derive(Debug, StructOpt)]
#[structopt(name = "cassini", about = "client for the saturnd daemon")]
pub struct CassiniOptions {
    /// Look for the pipes in PIPES_DIR.
    #[structopt(short = "p", long = "pipes-dir")]
    pub pipes_dir: Option<PathBuf>,

    /// Print replies as JSON instead of human-readable text.
    #[structopt(long = "json")]
    pub json: bool,

    #[structopt(subcommand)]
    pub cmd: CassiniCommand,
}

#[derive(Debug, StructOpt)]
pub enum CassiniCommand {
    /// List every scheduled task.
    List,
    /// Schedule a new task.
    Create {
        /// Minute(s)-of-hour the task runs at, e.g. `-m 0 -m 30` or
        /// `-m 0-29`. Omit entirely to match every minute.
        #[structopt(short = "m", long = "minute")]
        minutes: Vec<String>,
        /// Hour(s)-of-day the task runs at. Omit to match every hour.
        #[structopt(short = "H", long = "hour")]
        hours: Vec<String>,
        /// Day(s)-of-week the task runs at, 0 = Sunday .. 6 = Saturday.
        /// Omit to match every day.
        #[structopt(short = "w", long = "dow")]
        days_of_week: Vec<String>,
        /// Command line to run, e.g. `-- /bin/sh -c "echo hi"`.
        #[structopt(last = true, required = true)]
        argv: Vec<String>,
    },
    /// Remove a scheduled task.
    Remove { task_id: u64 },
    /// Show the recorded runs (time + exit code) of a task.
    Runs { task_id: u64 },
    /// Show the captured stdout of a task's last completed run.
    Stdout { task_id: u64 },
    /// Show the captured stderr of a task's last completed run.
    Stderr { task_id: u64 },
    /// Ask the daemon to shut down.
    Terminate,
}

impl CassiniCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            CassiniCommand::List => Opcode::ListTasks,
            CassiniCommand::Create { .. } => Opcode::CreateTask,
            CassiniCommand::Remove { .. } => Opcode::RemoveTask,
            CassiniCommand::Runs { .. } => Opcode::GetTimesAndExitcodes,
            CassiniCommand::Stdout { .. } => Opcode::GetStdout,
            CassiniCommand::Stderr { .. } => Opcode::GetStderr,
            CassiniCommand::Terminate => Opcode::Terminate,
        }
    }

    pub fn to_request(&self) -> Result<Request, TimingParseError> {
        Ok(match self {
            CassiniCommand::List => Request::ListTasks,
            CassiniCommand::Create {
                minutes,
                hours,
                days_of_week,
                argv,
            } => Request::CreateTask {
                timing: Timing {
                    minutes: parse_bitmap(minutes, 60)?,
                    hours: parse_bitmap(hours, 24)? as u32,
                    days_of_week: parse_bitmap(days_of_week, 7)? as u8,
                },
                commandline: Commandline {
                    argv: argv.iter().map(|s| s.clone().into_bytes()).collect(),
                },
            },
            CassiniCommand::Remove { task_id } => Request::RemoveTask { task_id: *task_id },
            CassiniCommand::Runs { task_id } => Request::GetTimesAndExitcodes { task_id: *task_id },
            CassiniCommand::Stdout { task_id } => Request::GetStdout { task_id: *task_id },
            CassiniCommand::Stderr { task_id } => Request::GetStderr { task_id: *task_id },
            CassiniCommand::Terminate => Request::Terminate,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimingParseError {
    #[error("invalid range `{0}`")]
    InvalidRange(String),
    #[error("value {value} out of range 0..{max}")]
    OutOfRange { value: u32, max: u32 },
}

/// Folds a list of `N` or `N-M` range specifications into a bitmap.
/// An empty list means "every position set" (SPEC_FULL §4.7's
/// "omitting a dimension's flags entirely means unrestricted").
fn parse_bitmap(ranges: &[String], width: u32) -> Result<u64, TimingParseError> {
    if ranges.is_empty() {
        return Ok(if width == 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        });
    }
    let mut bits: u64 = 0;
    for range in ranges {
        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (
                lo.parse::<u32>()
                    .map_err(|_| TimingParseError::InvalidRange(range.clone()))?,
                hi.parse::<u32>()
                    .map_err(|_| TimingParseError::InvalidRange(range.clone()))?,
            ),
            None => {
                let v = range
                    .parse::<u32>()
                    .map_err(|_| TimingParseError::InvalidRange(range.clone()))?;
                (v, v)
            }
        };
        if lo > hi || hi >= width {
            return Err(TimingParseError::OutOfRange { value: hi, max: width });
        }
        for bit in lo..=hi {
            bits |= 1u64 << bit;
        }
    }
    Ok(bits)
}

/// Subcommand exit codes, per SPEC_FULL §6.
pub const EXIT_OK: i32 = 0;
pub const EXIT_NOT_FOUND: i32 = 1;
pub const EXIT_NEVER_RUN: i32 = 2;
pub const EXIT_UNKNOWN: i32 = 3;
pub const EXIT_TRANSPORT: i32 = 4;

/// Renders a decoded reply to stdout and returns the process exit
/// code it maps to.
pub fn print_reply(reply: &Reply, json: bool) -> i32 {
    match reply {
        Reply::Ok(payload) => {
            if json {
                print_payload_json(payload);
            } else {
                print_payload_text(payload);
            }
            EXIT_OK
        }
        Reply::Error(subcode) => {
            eprintln!("error: {}", describe_subcode(*subcode));
            match subcode {
                ErrorSubcode::NotFound => EXIT_NOT_FOUND,
                ErrorSubcode::NeverRun => EXIT_NEVER_RUN,
                ErrorSubcode::Unknown => EXIT_UNKNOWN,
            }
        }
    }
}

fn describe_subcode(subcode: ErrorSubcode) -> &'static str {
    match subcode {
        ErrorSubcode::NotFound => "task not found",
        ErrorSubcode::NeverRun => "task has never completed a run",
        ErrorSubcode::Unknown => "unknown error",
    }
}

fn print_payload_text(payload: &OkPayload) {
    match payload {
        OkPayload::Empty => println!("ok"),
        OkPayload::TaskId(id) => println!("{id}"),
        OkPayload::Tasks(tasks) => {
            for task in tasks {
                println!(
                    "{}\tminutes={:#018x} hours={:#010x} dow={:#04x}\t{}",
                    task.task_id,
                    task.timing.minutes,
                    task.timing.hours,
                    task.timing.days_of_week,
                    task.commandline
                        .argv
                        .iter()
                        .map(|a| String::from_utf8_lossy(a))
                        .collect::<Vec<_>>()
                        .join(" ")
                );
            }
        }
        OkPayload::Runs(runs) => {
            for run in runs {
                println!("{}\t{}", run.time, run.exitcode);
            }
        }
        OkPayload::Output(bytes) => {
            // Raw bytes, not necessarily UTF-8 (spec.md §3): write
            // them through untouched rather than lossily converting.
            let _ = std::io::stdout().write_all(bytes);
        }
    }
}

fn print_payload_json(payload: &OkPayload) {
    #[derive(serde::Serialize)]
    struct TaskJson {
        task_id: u64,
        minutes: u64,
        hours: u32,
        days_of_week: u8,
        argv: Vec<String>,
    }
    #[derive(serde::Serialize)]
    struct RunJson {
        time: u64,
        exitcode: u16,
    }
    let value = match payload {
        OkPayload::Empty => serde_json::json!({}),
        OkPayload::TaskId(id) => serde_json::json!({ "task_id": id }),
        OkPayload::Tasks(tasks) => serde_json::json!(tasks
            .iter()
            .map(|t| TaskJson {
                task_id: t.task_id,
                minutes: t.timing.minutes,
                hours: t.timing.hours,
                days_of_week: t.timing.days_of_week,
                argv: t
                    .commandline
                    .argv
                    .iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect(),
            })
            .collect::<Vec<_>>()),
        OkPayload::Runs(runs) => serde_json::json!(runs
            .iter()
            .map(|r| RunJson {
                time: r.time,
                exitcode: r.exitcode,
            })
            .collect::<Vec<_>>()),
        OkPayload::Output(bytes) => {
            serde_json::json!({ "output": String::from_utf8_lossy(bytes) })
        }
    };
    println!("{}", serde_json::to_string_pretty(&value).unwrap());
}
