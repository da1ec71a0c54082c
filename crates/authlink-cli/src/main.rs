//! authlink - log in to the backend through the browser and use the session
//! from the command line.

mod app;

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;

// ============================================================================
// Constants
// ============================================================================

/// Directory for an additional rolling log file, if set.
const LOG_DIR_ENV: &str = "AUTHLINK_LOG_DIR";

const LOG_FILE_NAME: &str = "authlink.log";

const USAGE: &str = "\
Usage: authlink <command>

Commands:
  login [--loopback] [--port <port>]   Log in through the browser
  status                               Show the session state
  logout                               Clear the stored session
  validate                             Check the session locally and with the backend
  get <path>                           Authorized GET against the API, prints JSON
  help                                 Show this message

Set RUST_LOG to control log output (default: warn).";

// Tokens kept in keyring's mock store vanish when the process exits.
const _: () = assert!(
    authlink_core::store::keyring::NATIVE_BACKEND,
    "authlink-cli must be built with authlink-core's native-keyring feature"
);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Login { loopback: bool, port: u16 },
    Status,
    Logout,
    Validate,
    Get { path: String },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(command) = args.first() else {
        return Ok(Command::Help);
    };

    match command.as_str() {
        "login" => {
            let mut loopback = false;
            let mut port = 0;
            let mut rest = args[1..].iter();
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "--loopback" => loopback = true,
                    "--port" => {
                        let value = rest
                            .next()
                            .ok_or_else(|| anyhow::anyhow!("--port needs a value"))?;
                        port = value
                            .parse()
                            .map_err(|_| anyhow::anyhow!("Invalid port: {}", value))?;
                        loopback = true;
                    }
                    other => bail!("Unknown login option: {}", other),
                }
            }
            Ok(Command::Login { loopback, port })
        }
        "status" => Ok(Command::Status),
        "logout" => Ok(Command::Logout),
        "validate" => Ok(Command::Validate),
        "get" => match args.get(1) {
            Some(path) => Ok(Command::Get { path: path.clone() }),
            None => bail!("get needs a path"),
        },
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr. When `AUTHLINK_LOG_DIR` is set they are also written
/// to a daily rolling file there; the returned guard flushes it on drop.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os(LOG_DIR_ENV).map(PathBuf::from) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let _log_guard = init_tracing();
    info!(?command, "authlink starting");

    match command {
        Command::Help => {
            println!("{}", USAGE);
            Ok(())
        }
        Command::Login { loopback, port } => {
            let app = App::load(loopback)?;
            app.login(loopback, port).await
        }
        Command::Status => App::load(false)?.status().await,
        Command::Logout => App::load(false)?.logout().await,
        Command::Validate => App::load(false)?.validate().await,
        Command::Get { path } => App::load(false)?.get(&path).await,
    }
}
