//! Per-task worker (C4): the scheduling loop, process execution and
//! output capture described in spec.md §4.4.

use crate::clock::{StopSignal, TimeSource};
use crate::protocol::ExitEncoding;
use crate::wire::{Commandline, Run, Timing};
use std::os::unix::ffi::OsStrExt;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// The mutable state only the worker itself writes to; the dispatcher
/// only ever takes a short-lived lock to copy a snapshot out (spec.md
/// §5's "acquisition must be short: copy out, release, then encode").
#[derive(Default)]
struct WorkerShared {
    runs: Vec<Run>,
    last_stdout: Option<Vec<u8>>,
    last_stderr: Option<Vec<u8>>,
}

/// One live task's scheduler, process runner and output cache.
pub struct Worker {
    pub task_id: u64,
    pub timing: Timing,
    pub commandline: Commandline,
    shared: Mutex<WorkerShared>,
    stop: StopSignal,
    clock: Arc<dyn TimeSource>,
}

impl Worker {
    /// Spawns the worker's scheduling loop on its own thread and
    /// returns the shared handle plus the join handle the registry
    /// keeps alongside it (per the Design Notes: one owning map entry
    /// holding both, instead of parallel arrays).
    pub fn spawn(
        task_id: u64,
        timing: Timing,
        commandline: Commandline,
        clock: Arc<dyn TimeSource>,
    ) -> (Arc<Worker>, JoinHandle<()>) {
        let worker = Arc::new(Worker {
            task_id,
            timing,
            commandline,
            shared: Mutex::new(WorkerShared::default()),
            stop: StopSignal::new(),
            clock,
        });
        let worker_for_thread = worker.clone();
        let handle = std::thread::Builder::new()
            .name(format!("saturnd-worker-{task_id}"))
            .spawn(move || worker_for_thread.run())
            .expect("failed to spawn worker thread");
        (worker, handle)
    }

    /// Cooperative stop: flips the flag and wakes the sleep primitive,
    /// per spec.md §4.4/§5. Does not wait for an in-flight child; the
    /// registry joins the worker thread separately, which itself waits
    /// out any in-flight child before returning.
    pub fn stop(&self) {
        self.stop.signal();
    }

    pub fn runs_snapshot(&self) -> Vec<Run> {
        self.shared.lock().unwrap().runs.clone()
    }

    pub fn last_stdout_snapshot(&self) -> Option<Vec<u8>> {
        self.shared.lock().unwrap().last_stdout.clone()
    }

    pub fn last_stderr_snapshot(&self) -> Option<Vec<u8>> {
        self.shared.lock().unwrap().last_stderr.clone()
    }

    pub fn has_run(&self) -> bool {
        !self.shared.lock().unwrap().runs.is_empty()
    }

    fn run(self: Arc<Self>) {
        let mut search_from = self.clock.now_seconds();
        loop {
            if self.stop.is_signaled() {
                return;
            }
            let next = match next_match(&self.timing, search_from) {
                Some(t) => t,
                None => {
                    // No bit set in some dimension: this task never
                    // matches. Park until stopped (spec.md §4.4's "the
                    // worker remains alive but idle").
                    debug!(task_id = self.task_id, "timing matches nothing; idling");
                    self.clock.sleep_until(u64::MAX, &self.stop);
                    return;
                }
            };
            let woke_on_time = self.clock.sleep_until(next, &self.stop);
            if !woke_on_time {
                return;
            }

            // Re-evaluate on wake: resilient to spurious wakeups and
            // clock jumps (spec.md §4.4).
            let now = self.clock.now_seconds();
            let minute_start = (now / 60) * 60;
            let (minute, hour, dow) = decompose_minute_start(minute_start);
            if self.timing.matches(minute, hour, dow) {
                self.execute_run(minute_start);
            }
            search_from = minute_start;
        }
    }

    fn execute_run(&self, start_time: u64) {
        let argv = &self.commandline.argv;
        let mut cmd = Command::new(std::ffi::OsStr::from_bytes(&argv[0]));
        cmd.args(argv[1..].iter().map(|a| std::ffi::OsStr::from_bytes(a)));
        match cmd.output() {
            Ok(output) => {
                let encoding = exit_encoding_from_status(&output.status);
                debug!(
                    task_id = self.task_id,
                    time = start_time,
                    exitcode = encoding.to_u16(),
                    "run completed"
                );
                self.publish_run(start_time, encoding, output.stdout, output.stderr);
            }
            Err(e) => {
                warn!(task_id = self.task_id, error = %e, "spawn failed");
                self.publish_run(start_time, ExitEncoding::SpawnFailed, Vec::new(), Vec::new());
            }
        }
    }

    fn publish_run(&self, time: u64, encoding: ExitEncoding, stdout: Vec<u8>, stderr: Vec<u8>) {
        let mut guard = self.shared.lock().unwrap();
        guard.runs.push(Run {
            time,
            exitcode: encoding.to_u16(),
        });
        guard.last_stdout = Some(stdout);
        guard.last_stderr = Some(stderr);
    }
}

fn exit_encoding_from_status(status: &std::process::ExitStatus) -> ExitEncoding {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        ExitEncoding::Exited(code as u8)
    } else if let Some(signal) = status.signal() {
        ExitEncoding::Signaled(signal as u8)
    } else {
        ExitEncoding::Exited(0)
    }
}

/// Decomposes a minute-aligned Unix timestamp into
/// (minute-of-hour, hour-of-day, day-of-week) with Sunday = 0, matching
/// spec.md §3's bit numbering.
fn decompose_minute_start(minute_start: u64) -> (u32, u32, u8) {
    let minute = ((minute_start / 60) % 60) as u32;
    let hour = ((minute_start / 3600) % 24) as u32;
    let days_since_epoch = minute_start / 86400;
    // 1970-01-01 was a Thursday (index 4 with Sunday = 0).
    let dow = ((days_since_epoch + 4) % 7) as u8;
    (minute, hour, dow)
}

/// Finds the next minute-aligned timestamp strictly after `after` at
/// which `timing` matches, searching at most one full week ahead (the
/// bitmaps repeat with a 7-day period, so a week with no match means
/// no match ever). Returns `None` if the timing matches nothing.
fn next_match(timing: &Timing, after: u64) -> Option<u64> {
    const MINUTES_PER_WEEK: u64 = 7 * 24 * 60;
    let start_minute_index = after / 60 + 1;
    for i in 0..MINUTES_PER_WEEK {
        let minute_index = start_minute_index + i;
        let candidate = minute_index * 60;
        let (minute, hour, dow) = decompose_minute_start(candidate);
        if timing.matches(minute, hour, dow) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Timing;

    #[test]
    fn next_match_finds_immediate_next_minute() {
        let timing = Timing {
            minutes: u64::MAX,
            hours: u32::MAX,
            days_of_week: 0b1111111,
        };
        // after = 0 -> next minute boundary is 60.
        assert_eq!(next_match(&timing, 0), Some(60));
    }

    #[test]
    fn next_match_respects_specific_bits() {
        // minute 4, hour 0, any day.
        let timing = Timing {
            minutes: 1 << 4,
            hours: 1,
            days_of_week: 0b1111111,
        };
        assert_eq!(next_match(&timing, 0), Some(4 * 60));
        // Searching after minute 4 of hour 0 should roll to the next day.
        assert_eq!(next_match(&timing, 4 * 60), Some(4 * 60 + 86400));
    }

    #[test]
    fn next_match_returns_none_when_timing_is_empty() {
        let timing = Timing {
            minutes: 0,
            hours: u32::MAX,
            days_of_week: 0b1111111,
        };
        assert_eq!(next_match(&timing, 0), None);
    }

    #[test]
    fn decompose_matches_known_epoch_day() {
        // 1970-01-01 00:00:00 UTC was a Thursday (index 4).
        assert_eq!(decompose_minute_start(0), (0, 0, 4));
        // 1970-01-04 00:00:00 UTC was a Sunday (index 0).
        assert_eq!(decompose_minute_start(3 * 86400), (0, 0, 0));
    }
}
