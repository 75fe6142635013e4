//! Relay Term - line-editing front-end for remote shells
//!
//! Usage:
//!   relayterm                       Local shell (or the configured transport)
//!   relayterm [USER@]HOST           Remote shell over ssh
//!   relayterm -c PATH               Use another config file
//!   relayterm -f alpine HOST        Override the prompt flavor

use std::env;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use crossterm::event::{DisableBracketedPaste, EnableBracketedPaste};
use crossterm::execute;
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use relay_term::shell::history::HistoryFile;
use relay_term::shell::prompt::{PromptRenderer, SystemFlavor};
use relay_term::transfer::TransferManager;
use relay_term::transport::{CommandTransport, LoggingRefresher};
use relay_term::{Config, Driver, Session, SessionSettings};

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    flavor: Option<SystemFlavor>,
    target: Option<String>,
}

enum Mode {
    Run(Args),
    Help,
    Version,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Mode, String> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Mode::Help),
            "-v" | "--version" => return Ok(Mode::Version),
            "-c" | "--config" => {
                let path = args.next().ok_or("-c requires a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "-f" | "--flavor" => {
                let name = args.next().ok_or("-f requires a flavor name")?;
                parsed.flavor = Some(name.parse().map_err(|e| format!("{e}"))?);
            }
            other if other.starts_with('-') => return Err(format!("unknown option: {other}")),
            target => {
                if parsed.target.is_some() {
                    return Err(format!("unexpected argument: {target}"));
                }
                parsed.target = Some(target.to_string());
            }
        }
    }
    Ok(Mode::Run(parsed))
}

fn print_help() {
    println!("{}", "Relay Term - line-editing front-end for remote shells".bold());
    println!();
    println!("Usage:");
    println!("  relayterm [OPTIONS] [[USER@]HOST]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH     Config file (default: {})", default_config_display());
    println!("  -f, --flavor NAME     Prompt flavor: ubuntu, centos, kali, alpine");
    println!("  -h, --help            Show this help");
    println!("  -v, --version         Show version");
    println!();
    println!("In the session:");
    println!("  upload LOCAL [REMOTE]     Copy a local file to the remote host");
    println!("  download REMOTE [LOCAL]   Copy a remote file here");
    println!("  ^C                        Typed as a command, interrupts the remote shell");
    println!();
    println!("Logs go to {} (level from RELAYTERM_LOG).", log_dir().join("relayterm.log").display());
}

fn default_config_display() -> String {
    Config::default_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn log_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("relayterm")
}

/// File logging; the terminal belongs to the session.
fn init_logging() -> Option<WorkerGuard> {
    let dir = log_dir();
    std::fs::create_dir_all(&dir).ok()?;
    let file_appender = tracing_appender::rolling::never(&dir, "relayterm.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_env("RELAYTERM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}

fn restore_terminal() {
    let _ = execute!(io::stdout(), DisableBracketedPaste);
    let _ = disable_raw_mode();
}

/// Raw mode with bracketed paste for as long as it lives.
struct RawTerminal;

impl RawTerminal {
    fn enable() -> Result<Self> {
        enable_raw_mode().context("failed to enable raw mode")?;
        if let Err(err) = execute!(io::stdout(), EnableBracketedPaste) {
            warn!(error = %err, "bracketed paste unavailable");
        }
        Ok(Self)
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        restore_terminal();
    }
}

fn install_panic_hook() {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        restore_terminal();
        tracing::error!(target: "panic", %info, "panic");
        default_panic(info);
    }));
}

fn terminal_columns() -> Option<usize> {
    terminal::size().ok().map(|(columns, _)| usize::from(columns))
}

/// Blocking stdin reads on their own thread, handed over in chunks.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "terminal read failed");
                    break;
                }
            }
        }
    });
    rx
}

async fn run_session(config: Config) -> Result<()> {
    let transport = Arc::new(CommandTransport::from_config(&config.transport)?);
    let local_dir = env::current_dir().context("cannot read the current directory")?;

    let prompt = PromptRenderer::new(config.flavor, config.user.clone(), config.host.clone());
    let mut session = Session::new(SessionSettings::from_config(&config, local_dir), prompt);

    let history_file = match &config.history.file {
        Some(path) => match HistoryFile::open(path) {
            Ok((file, entries)) => {
                info!(path = %path.display(), entries = entries.len(), "history loaded");
                session.load_history(entries);
                Some(file)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "history file unavailable");
                None
            }
        },
        None => None,
    };

    let transfers = TransferManager::new(
        config.transfer.chunk_size,
        Duration::from_millis(config.transfer.progress_interval_ms),
    );
    let mut driver = Driver::new(session, transport, Arc::new(LoggingRefresher), transfers)
        .with_terminal_width(terminal_columns);
    if let Some(file) = history_file {
        driver = driver.with_history_file(file);
    }

    let _raw = RawTerminal::enable()?;
    let input = spawn_stdin_reader();
    let mut stdout = tokio::io::stdout();
    driver.run(input, &mut stdout).await
}

fn main() -> Result<()> {
    let args = match parse_args(env::args().skip(1)) {
        Ok(Mode::Run(args)) => args,
        Ok(Mode::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Mode::Version) => {
            println!("Relay Term v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Err(msg) => {
            eprintln!("relayterm: {msg}");
            std::process::exit(2);
        }
    };

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(target) = &args.target {
        config.connect_to(target);
    }
    if let Some(flavor) = args.flavor {
        config.flavor = flavor;
    }

    let _log_guard = init_logging();
    install_panic_hook();
    info!(
        host = %config.host,
        flavor = %config.flavor,
        shell = ?config.transport.shell,
        "starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;
    let result = runtime.block_on(run_session(config));
    // the stdin thread is still blocked in read()
    runtime.shutdown_timeout(Duration::from_millis(100));

    if let Err(err) = &result {
        eprintln!("{}: {:#}", "error".red(), err);
        std::process::exit(1);
    }
    Ok(())
}
