//! Entry point for the `warden` binary.
//!
//! Everything after the configuration flags is forwarded to the `ngrok`
//! executable, which runs in the foreground with the inherited terminal.

use std::io::{self, StderrLock};
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stderr: StderrLock<'_> = io::stderr().lock();
    warden_cli::run(std::env::args_os(), &mut stderr)
}
