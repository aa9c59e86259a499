//! LanShare
//!
//! Share a directory over HTTP on the local network.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use lanshare::config::{default_config_path, Config};
use lanshare::gateway::{GatewayPortMapper, IgdDiscovery};
use lanshare::network::{is_port_free, local_address, PortScanner};
use lanshare::ipc::{apply_access_request, IpcRequest, IpcResponse};
use lanshare::orchestrator::{ShareEvent, ShareOrchestrator};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// LanShare - share a directory over HTTP on the local network.
#[derive(Parser, Debug)]
#[command(name = "lanshare")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute. Without one, `serve` runs if
    /// `server.auto_start` is set in the configuration.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Share the root directory until interrupted
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(long, short)]
        port: Option<u16>,

        /// Directory to share (overrides the config file)
        #[arg(long, short, value_name = "DIR")]
        root: Option<PathBuf>,

        /// Forward the port on the gateway via UPnP
        #[arg(long)]
        upnp: bool,
    },

    /// Check whether a local port is free
    CheckPort {
        /// Port to check
        port: u16,
    },

    /// List the open TCP ports of a host
    Scan {
        /// Host name or IP address
        host: String,

        /// First port of the range
        start: u16,

        /// Last port of the range (inclusive)
        end: u16,
    },

    /// Print the local address used for outbound traffic
    LocalIp,

    /// Manage allowed and blocked client addresses
    #[command(subcommand)]
    Access(AccessCommands),

    /// Query and change gateway port mappings
    #[command(subcommand)]
    Gateway(GatewayCommands),

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

/// Access list subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum AccessCommands {
    /// Show both lists
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Always permit an address, even if blocked
    Allow { ip: String },
    /// Remove an address from the allowed list
    Unallow { ip: String },
    /// Deny an address unless it is allowed
    Block { ip: String },
    /// Remove an address from the blocked list
    Unblock { ip: String },
}

/// Gateway subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum GatewayCommands {
    /// Print the gateway's public address
    ExternalIp,
    /// List the gateway's port mappings
    Mappings {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Forward a TCP port to this host
    Add { port: u16 },
    /// Remove a TCP port mapping
    Remove { port: u16 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Some(Commands::InitConfig { force }) = &cli.command {
        return init_config(&config_path, *force);
    }

    // Load configuration
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    if let Some(Commands::Serve { port, root, upnp }) = &cli.command {
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(root) = root {
            config.server.root_dir = Some(root.clone());
        }
        if *upnp {
            config.gateway.upnp_enabled = true;
        }
    }

    config.validate()?;

    let _log_guard = init_logging(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    let command = match cli.command {
        Some(command) => command,
        None if config.server.auto_start => Commands::Serve {
            port: None,
            root: None,
            upnp: false,
        },
        None => anyhow::bail!(
            "No command given. Run `lanshare serve` or set server.auto_start in {:?}",
            config_path
        ),
    };

    match command {
        Commands::Serve { .. } => run_share(config).await?,
        Commands::CheckPort { port } => {
            if is_port_free(port) {
                println!("Port {} is free", port);
            } else {
                println!("Port {} is in use", port);
                std::process::exit(1);
            }
        }
        Commands::Scan { host, start, end } => {
            let scanner =
                PortScanner::new(config.scan_timeout()).with_concurrency(config.scan.concurrency);
            let open = scanner.scan(&host, start, end).await;
            if open.is_empty() {
                println!("No open ports found on {} in {}-{}", host, start, end);
            } else {
                for port in open {
                    println!("{}", port);
                }
            }
        }
        Commands::LocalIp => println!("{}", local_address()),
        Commands::Access(command) => run_access(&config, command).await?,
        Commands::Gateway(command) => run_gateway(&config, command).await?,
        Commands::InitConfig { force } => init_config(&config_path, force)?,
    }

    Ok(())
}

/// Installs the global subscriber. Logs go to stderr and, when `log_dir` is
/// set, to a daily rolling file whose writer lives as long as the guard.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match &config.daemon.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
            let appender = tracing_appender::rolling::daily(log_dir, "lanshare.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file {:?} already exists (use --force to overwrite)",
            path
        );
    }

    Config::default().save(path)?;
    println!("Wrote default configuration to {:?}", path);
    Ok(())
}

/// Runs the share until SIGINT or SIGTERM.
async fn run_share(config: Config) -> anyhow::Result<()> {
    let orchestrator = ShareOrchestrator::new(config);

    // Subscribe before starting so no lifecycle event is missed
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ShareEvent::StateChanged(state) => {
                    tracing::info!("Share state: {:?}", state);
                }
                ShareEvent::ForwardingChanged(state) => {
                    tracing::info!("Port forwarding: {:?}", state);
                }
                ShareEvent::Error { message } => {
                    tracing::error!("Share error: {}", message);
                }
            }
        }
    });

    orchestrator.start().await?;

    let info = orchestrator.connection_info().await;
    println!("Sharing {:?}", orchestrator.config().root_dir());
    println!("  Local:  {}", info.local_url);
    if let Some(public_url) = &info.public_url {
        println!("  Public: {}", public_url);
    }

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Applies an access command to the running share, or to the list files
/// when no share is running.
async fn run_access(config: &Config, command: AccessCommands) -> anyhow::Result<()> {
    let (request, json) = match command {
        AccessCommands::List { json } => (IpcRequest::ListAccess, json),
        AccessCommands::Allow { ip } => (IpcRequest::Allow { ip }, false),
        AccessCommands::Unallow { ip } => (IpcRequest::Unallow { ip }, false),
        AccessCommands::Block { ip } => (IpcRequest::Block { ip }, false),
        AccessCommands::Unblock { ip } => (IpcRequest::Unblock { ip }, false),
    };
    let summary = describe_change(&request);

    let response = apply_access_request(config, request)
        .await
        .context("Failed to update access lists")?;

    match response {
        IpcResponse::AccessLists { allowed, blocked } => {
            if json {
                let lists = serde_json::json!({ "allowed": allowed, "blocked": blocked });
                println!("{}", serde_json::to_string_pretty(&lists)?);
            } else {
                print_list("Allowed", &allowed);
                print_list("Blocked", &blocked);
            }
        }
        IpcResponse::AccessUpdated { changed } => {
            if let Some((ip, action, list)) = summary {
                report(changed, &ip, action, list);
            }
        }
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        IpcResponse::Pong => anyhow::bail!("Unexpected response from the running share"),
    }

    Ok(())
}

fn describe_change(request: &IpcRequest) -> Option<(String, &'static str, &'static str)> {
    match request {
        IpcRequest::Allow { ip } => Some((ip.clone(), "added to", "allowed")),
        IpcRequest::Unallow { ip } => Some((ip.clone(), "removed from", "allowed")),
        IpcRequest::Block { ip } => Some((ip.clone(), "added to", "blocked")),
        IpcRequest::Unblock { ip } => Some((ip.clone(), "removed from", "blocked")),
        IpcRequest::Ping | IpcRequest::ListAccess => None,
    }
}

fn print_list(title: &str, addresses: &[String]) {
    println!("{} ({}):", title, addresses.len());
    for address in addresses {
        println!("  {}", address);
    }
}

fn report(changed: bool, ip: &str, action: &str, list: &str) {
    if changed {
        println!("{} {} the {} list", ip, action, list);
    } else {
        println!("{} unchanged in the {} list", ip, list);
    }
}

async fn run_gateway(config: &Config, command: GatewayCommands) -> anyhow::Result<()> {
    let mapper = GatewayPortMapper::discover(
        &IgdDiscovery::new(),
        config.discovery_timeout(),
        &config.gateway.description,
    )
    .await;

    if !mapper.is_available() {
        anyhow::bail!("No UPnP gateway found on the local network");
    }

    match command {
        GatewayCommands::ExternalIp => match mapper.external_address().await {
            Some(ip) => println!("{}", ip),
            None => anyhow::bail!("Gateway did not report a public address"),
        },
        GatewayCommands::Mappings { json } => {
            let mappings = mapper.list_mappings().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&mappings)?);
            } else if mappings.is_empty() {
                println!("No port mappings");
            } else {
                println!(
                    "{:<8} {:<6} {:<22} {}",
                    "EXTERNAL", "PROTO", "INTERNAL", "DESCRIPTION"
                );
                for mapping in &mappings {
                    let internal = format!("{}:{}", mapping.internal_address, mapping.internal_port);
                    println!(
                        "{:<8} {:<6} {:<22} {}",
                        mapping.external_port, mapping.protocol, internal, mapping.description
                    );
                }
            }
        }
        GatewayCommands::Add { port } => {
            if !mapper.add_mapping(port).await {
                anyhow::bail!("Failed to add port mapping for port {}", port);
            }
            println!("Port {} forwarded to this host", port);
        }
        GatewayCommands::Remove { port } => {
            if !mapper.remove_mapping(port).await {
                anyhow::bail!("Failed to remove port mapping for port {}", port);
            }
            println!("Port mapping for port {} removed", port);
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
