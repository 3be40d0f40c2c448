use std::{
    env,
    io::{self, IsTerminal},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use color_eyre::{Result, eyre::eyre};
use tracing_subscriber::EnvFilter;

use vmpulse::{GuestAgent, IntervalTicker, config, procnet::ProcNet, transport::AgentServer};

const DEFAULT_SOCKET: &str = "/run/vmpulse-guestagent.sock";
const DEFAULT_CONFIG: &str = "/etc/vmpulse/vmpulse.toml";

#[derive(Debug, Parser)]
#[command(name = "vmpulse-guestagent", version, about = "In-guest port and socket monitor")]
struct Args {
    /// Socket to serve `GET /v1/info` and `GET /v1/events` on
    #[arg(long, value_name = "PATH", default_value = DEFAULT_SOCKET)]
    socket: PathBuf,
    /// Sampling period, overrides [agent].tick_ms
    #[arg(long, value_name = "MS")]
    tick_ms: Option<u64>,
    /// Packet filter idle timeout, overrides [agent].iptables_idle_ms
    #[arg(long, value_name = "MS")]
    iptables_idle_ms: Option<u64>,
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

fn main() -> Result<()> {
    init_tracing();
    color_eyre::install()?;

    let args = Args::parse();
    let config = config::load_config(&args.config).map_err(|err| eyre!(err.to_string()))?;
    let tick = Duration::from_millis(args.tick_ms.unwrap_or(config.agent.tick_ms).max(1));
    let idle = Duration::from_millis(
        args.iptables_idle_ms
            .unwrap_or(config.agent.iptables_idle_ms)
            .max(1),
    );
    tracing::info!(
        socket = %args.socket.display(),
        tick_ms = tick.as_millis() as u64,
        iptables_idle_ms = idle.as_millis() as u64,
        proc_net = %config.agent.proc_net_dir.display(),
        "starting guest agent"
    );

    let agent = build_agent(ProcNet::new(&config.agent.proc_net_dir), idle)?;
    let server = AgentServer::bind(&args.socket, Arc::new(agent), IntervalTicker(tick))
        .map_err(|err| eyre!(err.to_string()))?;
    if let Err(err) = server.serve() {
        tracing::error!(error = %err, "guest agent exited");
        return Err(eyre!(err.to_string()));
    }
    tracing::info!("guest agent exited");
    Ok(())
}

#[cfg(target_os = "linux")]
fn build_agent(proc_net: ProcNet, idle: Duration) -> Result<GuestAgent> {
    use vmpulse::{AgentError, audit::NetlinkAudit, iptables::Iptables};

    let channel = NetlinkAudit::subscribe()
        .map_err(AgentError::Subscription)
        .map_err(|err| eyre!(err.to_string()))?;
    GuestAgent::new(channel, proc_net, Iptables::default(), idle)
        .map_err(|err| eyre!(err.to_string()))
}

#[cfg(not(target_os = "linux"))]
fn build_agent(_proc_net: ProcNet, _idle: Duration) -> Result<GuestAgent> {
    Err(eyre!("the guest agent needs Linux audit netlink support"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = io::stderr().is_terminal() && env::var("VMPULSE_LOG_NO_COLOR").is_err();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(io::stderr)
        .try_init();
}
