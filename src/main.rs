mod cli;
mod config;
mod database;
mod discovery;
mod error;
mod ledger;
mod migrator;
mod sink;
mod watcher;

use cli::Cli;
use error::{ExitCode, SqlUpError};
use flexi_logger::{AdaptiveFormat, Logger, LoggerHandle};
use log::{debug, error};

fn start_logger() -> Option<LoggerHandle> {
    // RUST_LOG overrides the default here and the configured level later:
    // ERROR → WARN → INFO → DEBUG → TRACE
    let started = Logger::try_with_env_or_str("info")
        .and_then(|logger| logger.adaptive_format_for_stderr(AdaptiveFormat::Default).start());

    match started {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to start logger: {}", e);
            None
        }
    }
}

fn main() {
    let logger = start_logger();
    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    // Every database handle is released when handle_command_line returns,
    // before the process exits.
    let code = match Cli::handle_command_line(logger.as_ref()) {
        Ok(()) => ExitCode::Success,
        Err(err) => report_failure(&err, logger.is_some()),
    };

    if let Some(logger) = logger {
        logger.flush();
    }
    std::process::exit(code.code());
}

fn report_failure(err: &SqlUpError, logging: bool) -> ExitCode {
    if logging {
        error!("{}", err);
    } else {
        eprintln!("{}", err);
    }
    err.exit_code()
}
