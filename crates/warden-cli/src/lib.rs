//! Runtime for the `warden` binary.
//!
//! `warden` loads its own settings from the leading configuration flags,
//! sets up structured logging, installs `ngrok` at the managed location when
//! it is missing, and then runs `ngrok` in the foreground with every
//! remaining argument. The exit code of `ngrok` becomes the exit code of
//! `warden`.

use std::ffi::OsString;
use std::io::Write;
use std::process::{ExitCode, ExitStatus};

use tracing::{debug, info};
use warden_agent::TunnelSession;

mod config;
mod error;
mod telemetry;

pub use config::CliConfig;
use config::{ConfigLoader, OrthoConfigLoader, split_config_arguments};
use error::CliError;

const CLI_TARGET: &str = "warden_cli";

/// Runs the CLI with `args`, reporting failures on `stderr`.
#[must_use]
pub fn run<I, E>(args: I, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    E: Write,
{
    run_with_loader(args, stderr, &OrthoConfigLoader)
}

fn run_with_loader<I, E, L>(args: I, stderr: &mut E, loader: &L) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    E: Write,
    L: ConfigLoader,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let split = split_config_arguments(&args);
    let result = loader
        .load(&split.config_arguments)
        .and_then(|config| forward(&config, split.forwarded(&args)));

    match result {
        Ok(status) => exit_code(status),
        Err(error) => {
            drop(writeln!(stderr, "warden: {error}"));
            ExitCode::FAILURE
        }
    }
}

fn forward(config: &CliConfig, arguments: &[OsString]) -> Result<ExitStatus, CliError> {
    telemetry::initialise(config.log_filter(), config.log_format()?)?;

    let session = TunnelSession::new()?;
    let agent_config = config.agent_config();
    if config.manages_install() {
        debug!(
            target: CLI_TARGET,
            path = %agent_config.executable_path().display(),
            "ensuring managed ngrok install"
        );
        session.install(Some(&agent_config))?;
    }

    info!(
        target: CLI_TARGET,
        path = %agent_config.executable_path().display(),
        arguments = arguments.len(),
        "handing over to ngrok"
    );
    let status = session
        .supervisor()
        .run_blocking(agent_config.executable_path(), arguments)?;
    debug!(target: CLI_TARGET, %status, "ngrok exited");
    Ok(status)
}

/// Maps the child's status onto ours; signals and out-of-range codes fail.
fn exit_code(status: ExitStatus) -> ExitCode {
    status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .map_or(ExitCode::FAILURE, ExitCode::from)
}
