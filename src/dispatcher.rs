//! Dispatcher (C5): the single-threaded request/reply loop of
//! spec.md §4.5. `handle_request` is the pure state-machine step (easy
//! to unit test); `run` wires it to a real `Transport`.

use crate::clock::TimeSource;
use crate::protocol::{ErrorSubcode, OkPayload, Reply, Request};
use crate::registry::Registry;
use crate::transport::{Transport, TransportError};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Applies one request to the registry and produces the reply to
/// send back, plus whether the dispatch loop should stop after this
/// iteration (only `TERMINATE` does, and only after the reply is
/// fully written — see `run`).
pub fn handle_request(
    registry: &mut Registry,
    clock: &Arc<dyn TimeSource>,
    request: Request,
) -> (Reply, bool) {
    match request {
        Request::Noop => (Reply::Ok(OkPayload::Empty), false),
        Request::ListTasks => {
            let tasks = registry.snapshot_running();
            (Reply::Ok(OkPayload::Tasks(tasks)), false)
        }
        Request::CreateTask { timing, commandline } => {
            let task_id = registry.insert(timing, commandline, clock.clone());
            (Reply::Ok(OkPayload::TaskId(task_id)), false)
        }
        Request::RemoveTask { task_id } => {
            if registry.remove(task_id) {
                (Reply::Ok(OkPayload::Empty), false)
            } else {
                (Reply::Error(ErrorSubcode::NotFound), false)
            }
        }
        Request::GetTimesAndExitcodes { task_id } => match registry.runs(task_id) {
            Some(runs) => (Reply::Ok(OkPayload::Runs(runs)), false),
            None => (Reply::Error(ErrorSubcode::NotFound), false),
        },
        Request::GetStdout { task_id } => {
            reply_for_output(registry.has_run(task_id), || registry.last_stdout(task_id))
        }
        Request::GetStderr { task_id } => {
            reply_for_output(registry.has_run(task_id), || registry.last_stderr(task_id))
        }
        Request::Terminate => (Reply::Ok(OkPayload::Empty), true),
    }
}

fn reply_for_output(has_run: Option<bool>, output: impl FnOnce() -> Option<Vec<u8>>) -> (Reply, bool) {
    match has_run {
        None => (Reply::Error(ErrorSubcode::NotFound), false),
        Some(false) => (Reply::Error(ErrorSubcode::NeverRun), false),
        Some(true) => {
            let output = output().unwrap_or_default();
            (Reply::Ok(OkPayload::Output(output)), false)
        }
    }
}

/// Runs the dispatch loop until a `TERMINATE` request is fully
/// answered. Malformed frames and reply-write failures are logged and
/// the loop continues (spec.md §7's propagation policy); only
/// transport setup failures and `TERMINATE` end the loop.
pub fn run(transport: &dyn Transport, registry: &mut Registry, clock: &Arc<dyn TimeSource>) {
    info!("dispatcher started");
    loop {
        let request = match transport.recv_request() {
            Ok(Ok(request)) => request,
            Ok(Err(unknown_opcode)) => {
                warn!(opcode = unknown_opcode, "unknown opcode");
                if let Err(e) = transport.send_reply(&Reply::Error(ErrorSubcode::Unknown).encode())
                {
                    error!(error = %e, "failed to send reply for unknown opcode");
                }
                continue;
            }
            Err(TransportError::Codec(e)) => {
                warn!(error = %e, "malformed request frame, dropping");
                continue;
            }
            Err(e) => {
                error!(error = %e, "transport error receiving request");
                continue;
            }
        };

        if matches!(request, Request::Noop) {
            debug!("NOOP received, no reply required");
            continue;
        }

        debug!(opcode = ?request.opcode(), "request received");
        let (reply, should_terminate) = handle_request(registry, clock, request);

        match transport.send_reply(&reply.encode()) {
            Ok(()) => debug!("reply sent"),
            Err(e) => {
                error!(error = %e, "failed to send reply");
                // spec.md §7: a failed reply aborts this iteration, not the loop,
                // except that TERMINATE must still shut the loop down since the
                // client may simply be gone rather than the daemon being unhealthy.
                if !should_terminate {
                    continue;
                }
            }
        }

        if should_terminate {
            info!("TERMINATE received, shutting down workers");
            registry.shutdown();
            break;
        }
    }
    info!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::wire::{Commandline, Timing};

    fn clock() -> Arc<dyn TimeSource> {
        VirtualClock::new(0)
    }

    fn idle_timing() -> Timing {
        Timing {
            minutes: 0,
            hours: 0,
            days_of_week: 0,
        }
    }

    fn commandline() -> Commandline {
        Commandline {
            argv: vec![b"/bin/true".to_vec()],
        }
    }

    #[test]
    fn create_then_list_shows_the_task() {
        let mut registry = Registry::new();
        let clock = clock();
        let (reply, stop) = handle_request(
            &mut registry,
            &clock,
            Request::CreateTask {
                timing: idle_timing(),
                commandline: commandline(),
            },
        );
        assert!(!stop);
        let task_id = match reply {
            Reply::Ok(OkPayload::TaskId(id)) => id,
            other => panic!("expected TaskId, got {other:?}"),
        };
        assert_eq!(task_id, 0);

        let (reply, _) = handle_request(&mut registry, &clock, Request::ListTasks);
        match reply {
            Reply::Ok(OkPayload::Tasks(tasks)) => {
                assert_eq!(tasks.len(), 1);
                assert_eq!(tasks[0].task_id, 0);
            }
            other => panic!("expected Tasks, got {other:?}"),
        }
        registry.shutdown();
    }

    #[test]
    fn remove_unknown_task_is_not_found() {
        let mut registry = Registry::new();
        let clock = clock();
        let (reply, _) = handle_request(&mut registry, &clock, Request::RemoveTask { task_id: 99 });
        assert_eq!(reply, Reply::Error(ErrorSubcode::NotFound));
    }

    #[test]
    fn never_run_task_reports_never_run_not_not_found() {
        let mut registry = Registry::new();
        let clock = clock();
        let (reply, _) = handle_request(
            &mut registry,
            &clock,
            Request::CreateTask {
                timing: idle_timing(),
                commandline: commandline(),
            },
        );
        let task_id = match reply {
            Reply::Ok(OkPayload::TaskId(id)) => id,
            other => panic!("expected TaskId, got {other:?}"),
        };
        let (reply, _) = handle_request(&mut registry, &clock, Request::GetStdout { task_id });
        assert_eq!(reply, Reply::Error(ErrorSubcode::NeverRun));
        registry.shutdown();
    }

    #[test]
    fn terminate_signals_loop_stop_with_ok_reply() {
        let mut registry = Registry::new();
        let clock = clock();
        let (reply, stop) = handle_request(&mut registry, &clock, Request::Terminate);
        assert_eq!(reply, Reply::Ok(OkPayload::Empty));
        assert!(stop);
    }
}
