//! saturnd: a user-level cron-like daemon, and cassini, its client.
//!
//! The core is three interlocking pieces (spec.md §1): the wire
//! protocol and framing (`wire`, `protocol`), the single-threaded
//! request-dispatch loop that owns the task registry (`dispatcher`,
//! `registry`), and the per-task worker that schedules, spawns and
//! captures output (`worker`, `clock`). `transport` and `bootstrap`
//! are the pipe I/O and startup glue around that core; `cli` is the
//! argv-to-request front door for both binaries.

pub mod bootstrap;
pub mod clock;
pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod wire;

pub use wire::CodecError;
pub type CodecResult<T> = Result<T, wire::CodecError>;

mod worker;
pub use worker::Worker;

pub mod cli;

/// Default pipes directory, per SPEC_FULL §6: `$XDG_RUNTIME_DIR/saturnd`
/// when set, else `/tmp/saturnd-$UID`.
pub fn default_pipes_dir() -> std::path::PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return std::path::PathBuf::from(runtime_dir).join("saturnd");
    }
    let uid = nix::unistd::Uid::current();
    std::path::PathBuf::from(format!("/tmp/saturnd-{uid}"))
}
