//! The `cassini` client binary: turns one subcommand into one request,
//! sends it over the request pipe, reads the matching reply off the
//! reply pipe, and exits with the code the reply maps to.

use saturnd::cli::{print_reply, CassiniOptions, EXIT_TRANSPORT};
use saturnd::protocol::Reply;
use saturnd::transport::PipePaths;
use std::fs::OpenOptions;
use std::io::Write;
use structopt::StructOpt;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = CassiniOptions::from_args();
    let pipes_dir = opts
        .pipes_dir
        .unwrap_or_else(saturnd::default_pipes_dir);
    let paths = PipePaths::under(&pipes_dir);

    let request = match opts.cmd.to_request() {
        Ok(request) => request,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(EXIT_TRANSPORT);
        }
    };
    let code = match send_and_receive(&paths, &request) {
        Ok(reply) => print_reply(&reply, opts.json),
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_TRANSPORT
        }
    };
    std::process::exit(code);
}

/// Opens the request pipe for write, sends the frame, closes it; then
/// opens the reply pipe for read and decodes exactly one reply. Mirrors
/// the daemon's own one-open-per-frame discipline, from the client side.
fn send_and_receive(
    paths: &PipePaths,
    request: &saturnd::protocol::Request,
) -> Result<Reply, SendError> {
    let mut req_pipe = OpenOptions::new()
        .write(true)
        .open(&paths.request)
        .map_err(SendError::OpenRequest)?;
    req_pipe.write_all(&request.encode()).map_err(SendError::WriteRequest)?;
    drop(req_pipe);

    let reply_pipe = OpenOptions::new()
        .read(true)
        .open(&paths.reply)
        .map_err(SendError::OpenReply)?;
    Reply::decode(reply_pipe, request.opcode()).map_err(SendError::Decode)
}

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error("cannot open request pipe (is saturnd running?): {0}")]
    OpenRequest(#[source] std::io::Error),
    #[error("cannot write request: {0}")]
    WriteRequest(#[source] std::io::Error),
    #[error("cannot open reply pipe: {0}")]
    OpenReply(#[source] std::io::Error),
    #[error("malformed reply: {0}")]
    Decode(#[source] saturnd::wire::CodecError),
}
