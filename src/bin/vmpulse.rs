use std::{
    env,
    fs::{self, File},
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use clap::Parser;
use color_eyre::Result;
use dialoguer::Confirm;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use vmpulse::{
    SessionStore, Supervisor, SupervisorOptions, WatchOptions,
    config::{self, Config},
    lifecycle::{self, LifecycleError},
    transport::GuestAgentClient,
    tui,
    utils::{format_last_active, relative_to_home},
};

const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_SHA"), ")");

#[derive(Debug, Parser)]
#[command(name = "vmpulse", version, long_version = LONG_VERSION, about = "VM lifecycle supervisor")]
struct Cli {
    /// Path to vmpulse.toml (defaults to the session root)
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Start a session and wait until it is ready
    Start {
        session: String,
        /// Treat a degraded start as success
        #[arg(long)]
        allow_degraded: bool,
    },
    /// List all sessions
    List,
    /// Remove a stale pidfile left by a dead session
    Unlock {
        session: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show listening ports and local sockets of a guest
    Info {
        #[arg(long, value_name = "PATH")]
        socket: PathBuf,
    },
    /// Stream guest port and socket changes as JSON lines
    Events {
        #[arg(long, value_name = "PATH")]
        socket: PathBuf,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let store = SessionStore::new().map_err(|err| color_eyre::eyre::eyre!(err.to_string()))?;
    init_tracing(cli_log(&store, &cli.command));
    tracing::info!(root = %store.root().display(), "starting vmpulse cli");

    handle_command(cli.command, &store, cli.config.as_deref())
        .map_err(|err| color_eyre::eyre::eyre!(format!("{err:#}")))
}

fn handle_command(
    command: Command,
    store: &SessionStore,
    config_override: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Command::Start {
            session,
            allow_degraded,
        } => {
            let config = load_config(store, config_override)?;
            let supervisor = Supervisor::new(
                store.clone(),
                SupervisorOptions::from(&config.supervisor),
            );
            let watch = WatchOptions::from(&config.supervisor);
            let resolution = lifecycle::launch(&supervisor, &session, &watch)?;
            match resolution.outcome.into_result() {
                Ok(port) => {
                    println!("Session {session} is ready (SSH local port {port})");
                    Ok(())
                }
                Err(LifecycleError::Degraded {
                    reason,
                    ssh_local_port,
                }) if allow_degraded => {
                    tracing::warn!(reason = %reason, "session started degraded");
                    println!("Session {session} is degraded (SSH local port {ssh_local_port})");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        }
        Command::List => {
            let sessions = store.list_sessions()?;
            if sessions.is_empty() {
                println!("No sessions were found.");
                return Ok(());
            }
            let now = OffsetDateTime::now_utc();
            let rows: Vec<tui::SessionListRow> = sessions
                .into_iter()
                .map(|session| tui::SessionListRow {
                    name: session.name,
                    directory: relative_to_home(&session.directory),
                    marker: if session.marker_present {
                        "present".to_string()
                    } else {
                        "-".to_string()
                    },
                    pid: session
                        .pid
                        .map(|pid| pid.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    last_active: format_last_active(session.last_active, now),
                })
                .collect();
            tui::render_sessions_table(&rows).map_err(|err| anyhow::anyhow!(err.to_string()))
        }
        Command::Unlock { session, yes } => {
            let paths = store.paths(&session)?;
            if !paths.pidfile.exists() {
                println!("No pidfile found at {}", paths.pidfile.display());
                return Ok(());
            }
            if !yes {
                let confirmed = Confirm::new()
                    .with_prompt(format!(
                        "Remove {}? Only do this if the session is no longer running.",
                        paths.pidfile.display()
                    ))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("Cancelled.");
                    return Ok(());
                }
            }
            store.remove_marker(&session)?;
            println!("Removed {}", paths.pidfile.display());
            Ok(())
        }
        Command::Info { socket } => {
            let info = GuestAgentClient::new(&socket)
                .info()
                .with_context(|| format!("failed to query {}", socket.display()))?;
            if info.local_ports.is_empty() && info.local_sockets.is_empty() {
                println!("No listening ports or local sockets.");
                return Ok(());
            }
            tui::render_info_tables(&info).map_err(|err| anyhow::anyhow!(err.to_string()))
        }
        Command::Events { socket } => {
            let events = GuestAgentClient::new(&socket)
                .events()
                .with_context(|| format!("failed to subscribe to {}", socket.display()))?;
            let mut stdout = io::stdout().lock();
            for event in events {
                let event = event?;
                if !event.errors.is_empty() {
                    tracing::warn!(errors = ?event.errors, "guest reported sampling errors");
                }
                writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
                stdout.flush()?;
            }
            Ok(())
        }
    }
}

fn load_config(store: &SessionStore, config_override: Option<&Path>) -> anyhow::Result<Config> {
    let path = match config_override {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => env::current_dir()?.join(path),
        None => config::config_path(store.root()),
    };
    config::load_config(&path).with_context(|| format!("failed to load {}", path.display()))
}

/// Per-run log file for commands that belong to a session.
fn cli_log(store: &SessionStore, command: &Command) -> Option<File> {
    let Command::Start { session, .. } = command else {
        return None;
    };
    let paths = store.paths(session).ok()?;
    fs::create_dir_all(&paths.dir).ok()?;
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&paths.cli_log)
        .ok()
}

fn init_tracing(file: Option<File>) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = io::stderr().is_terminal() && env::var("VMPULSE_LOG_NO_COLOR").is_err();

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_ansi(ansi)
        .without_time()
        .with_writer(io::stderr)
        .with_filter(filter());
    let subscriber = tracing_subscriber::registry().with(stderr_layer);
    if let Some(file) = file {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(filter());
        let _ = subscriber.with(file_layer).try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
