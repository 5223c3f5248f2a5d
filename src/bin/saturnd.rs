//! The `saturnd` daemon binary: wires up bootstrap, the registry, the
//! real clock and the pipe transport, then runs the dispatcher.

use anyhow::Context;
use saturnd::bootstrap::{daemonize, ensure_pipes, fail_if_already_running, spawn_signal_watcher};
use saturnd::clock::{SystemClock, TimeSource};
use saturnd::cli::SaturndOptions;
use saturnd::dispatcher;
use saturnd::registry::Registry;
use saturnd::transport::PipeTransport;
use std::sync::Arc;
use structopt::StructOpt;
use tracing::error;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = SaturndOptions::from_args();
    let pipes_dir = opts
        .pipes_dir
        .unwrap_or_else(saturnd::default_pipes_dir);

    let paths = ensure_pipes(&pipes_dir).map_err(|e| {
        error!(error = %e, "failed to set up pipes");
        e
    })
    .context("failed to set up pipes")?;

    fail_if_already_running(&paths)
        .map_err(|e| {
            error!(error = %e, "refusing to start");
            e
        })
        .context("refusing to start")?;

    if opts.daemonize {
        daemonize()
            .map_err(|e| {
                error!(error = %e, "failed to daemonize");
                e
            })
            .context("failed to daemonize")?;
    }

    spawn_signal_watcher(paths.clone()).context("failed to install signal handling")?;

    let clock: Arc<dyn TimeSource> = Arc::new(SystemClock);
    let transport = PipeTransport::new(paths);
    let mut registry = Registry::new();

    dispatcher::run(&transport, &mut registry, &clock);
    Ok(())
}
