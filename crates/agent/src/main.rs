//! b9agent - worker-side agent binary
//!
//! Enrolls this machine into the remote control plane, keeps its presence
//! alive, and exposes the local control API and dashboard.

use anyhow::Result;
use b9agent_lib::config_file::{self, ConfigFile, GatewaySection, K3sSection, MachineSection};
use b9agent_lib::{generate_machine_id, Agent, AgentConfig};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Worker agent for the serverless control plane
#[derive(Parser)]
#[command(name = "b9agent", version, about = "Worker agent for the serverless control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct RunArgs {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Enable the terminal dashboard
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    tui: bool,

    /// Don't actually register or send keepalives
    #[arg(long)]
    dry_run: bool,

    /// Register, send one keepalive, then exit
    #[arg(long)]
    once: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the agent config file
    Init(InitArgs),

    /// Show the current config
    Config,

    /// Print the agent version
    Version,
}

#[derive(Args)]
struct InitArgs {
    /// Gateway host (mesh-VPN IP)
    #[arg(long)]
    gateway: Option<String>,

    /// Gateway port
    #[arg(long, default_value_t = 1994)]
    port: u16,

    /// Registration token from 'machine create'
    #[arg(long)]
    token: Option<String>,

    /// Machine ID (8 hex chars, generated if not provided)
    #[arg(long)]
    machine_id: Option<String>,

    /// Pool name
    #[arg(long, default_value = "external")]
    pool: String,

    /// Hostname/IP for the gateway to reach the cluster API
    #[arg(long)]
    hostname: Option<String>,

    /// Cluster bearer token
    #[arg(long)]
    k3s_token: Option<String>,

    /// Non-interactive mode (use defaults)
    #[arg(short = 'y', long = "yes")]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init(args)) => run_init(args),
        Some(Commands::Config) => run_config_show(),
        Some(Commands::Version) => {
            println!("b9agent version {AGENT_VERSION}");
            Ok(())
        }
        None => run_agent(cli.run).await,
    }
}

fn run_init(args: InitArgs) -> Result<()> {
    let token = match args.token {
        Some(token) if !token.is_empty() => token,
        _ => anyhow::bail!("token is required (use --token)"),
    };

    let gateway = args
        .gateway
        .or_else(|| std::env::var("TAILSCALE_CONTROLPLANE_IP").ok())
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    let machine_id = args.machine_id.unwrap_or_else(generate_machine_id);

    let cfg = ConfigFile {
        gateway: GatewaySection {
            host: gateway,
            port: args.port,
        },
        machine: MachineSection {
            id: machine_id,
            token,
            hostname: args.hostname.filter(|h| !h.is_empty()),
        },
        pool: args.pool,
        provider: None,
        k3s: args
            .k3s_token
            .filter(|t| !t.is_empty())
            .map(|token| K3sSection { token }),
        debug: false,
    };

    cfg.save()?;
    println!("Config saved to: {}", config_file::config_path().display());
    println!();
    println!("To start the agent, run:");
    println!("  b9agent");

    Ok(())
}

fn run_config_show() -> Result<()> {
    if !config_file::config_exists() {
        anyhow::bail!("No config file found. Run 'b9agent init' first.");
    }

    let cfg = ConfigFile::load()?;

    println!("Config file: {}\n", config_file::config_path().display());
    println!("Gateway:");
    println!("  Host: {}", cfg.gateway.host);
    println!("  Port: {}", cfg.gateway.port);
    println!("\nMachine:");
    println!("  ID: {}", cfg.machine.id);
    let shown = cfg.machine.token.chars().take(20).collect::<String>();
    println!("  Token: {shown}...");
    if let Some(hostname) = &cfg.machine.hostname {
        println!("  Hostname: {hostname}");
    }
    println!("\nPool: {}", cfg.pool);
    if cfg.k3s.as_ref().is_some_and(|k| !k.token.is_empty()) {
        println!("k3s Token: (set)");
    }

    Ok(())
}

async fn run_agent(args: RunArgs) -> Result<()> {
    let mut config = if config_file::config_exists() {
        ConfigFile::load()?.to_agent_config()
    } else {
        AgentConfig::from_env()
    };

    let debug = args.debug || config.debug;
    init_logging(debug);

    if config.machine_id.is_empty() {
        config.machine_id = generate_machine_id();
        info!(machine_id = %config.machine_id, "Generated machine ID");
    }

    config.debug = debug;
    config.dry_run = args.dry_run;
    config.once = args.once;

    let agent = Agent::new(config, args.tui).await;
    agent.run().await
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr so dashboard frames on stdout stay intact
    if debug {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    }
}
