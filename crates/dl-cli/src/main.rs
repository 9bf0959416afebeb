//! devlink CLI
//!
//! Terminal access and port forwarding to fleet devices over the
//! management server's device-connect tunnel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dl_core::config::{self, TunnelConfig};
use dl_core::error::ConfigError;
use dl_tunnel::{
    Backoff, ForwardManager, ForwardSpec, ShellExit, ShellSession, TunnelController,
};

mod output;

use output::{print_error, print_info, print_success, print_warning};

#[derive(Parser)]
#[command(name = "devlink")]
#[command(author, version, about = "Remote terminal and port forwarding for fleet devices")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Management server URL (overrides config)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Bearer token for authentication
    #[arg(short, long, global = true, env = "DEVLINK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Skip TLS certificate verification (self-signed test servers)
    #[arg(short = 'k', long, global = true)]
    insecure: bool,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an interactive shell on a device
    /// Alias: shell
    #[command(alias = "shell")]
    Terminal {
        /// Device identifier
        device_id: String,
    },

    /// Forward local ports to addresses reachable from a device
    /// Alias: pf
    #[command(alias = "pf")]
    PortForward {
        /// Device identifier
        device_id: String,

        /// Forward rules: LOCAL:PORT or LOCAL:HOST:PORT
        #[arg(required = true)]
        forwards: Vec<String>,
    },

    /// Show the configuration file path
    ConfigPath,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_tunnel_config(&cli)?;

    match cli.command {
        Commands::Terminal { ref device_id } => {
            let token = resolve_token(&cli, &config)?;
            run_terminal(config, device_id, &token).await
        }
        Commands::PortForward {
            ref device_id,
            ref forwards,
        } => {
            let token = resolve_token(&cli, &config)?;
            let specs = forwards
                .iter()
                .map(|s| s.parse::<ForwardSpec>().map_err(anyhow::Error::msg))
                .collect::<Result<Vec<_>>>()?;
            run_port_forward(config, device_id, &token, specs).await
        }
        Commands::ConfigPath => {
            println!("{}", config::default_config_path().display());
            Ok(())
        }
    }
}

/// Load the config file and fold in command-line overrides
fn load_tunnel_config(cli: &Cli) -> Result<TunnelConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let mut config: TunnelConfig = match config::load_config(&path) {
        Ok(config) => config,
        // Missing config is fine unless the user pointed at one explicitly
        Err(ConfigError::NotFound(_)) if cli.config.is_none() => TunnelConfig::default(),
        Err(e) => return Err(e).with_context(|| format!("Failed to load {}", path.display())),
    };

    if let Some(server) = &cli.server {
        config.server.url = server.clone();
    }
    if cli.insecure {
        config.server.insecure = true;
    }

    Ok(config)
}

fn resolve_token(cli: &Cli, config: &TunnelConfig) -> Result<String> {
    cli.token
        .clone()
        .or_else(|| config.server.token.clone())
        .context("No token: pass --token, set DEVLINK_TOKEN, or add one to the config file")
}

async fn run_terminal(config: TunnelConfig, device_id: &str, token: &str) -> Result<()> {
    if config.server.insecure {
        print_warning("TLS certificate verification is disabled");
    }

    let controller = TunnelController::connect(config, device_id, token)
        .await
        .with_context(|| format!("Failed to connect to device {}", device_id))?;

    // crossterm reports (cols, rows)
    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let handle = controller
        .open_shell(rows, cols)
        .await
        .context("Failed to open shell session")?;

    print_info(&format!(
        "Connected to {}. Detach with Ctrl+]",
        device_id
    ));

    let exit = ShellSession::new(handle).run().await?;
    controller.shutdown().await;

    match exit {
        ShellExit::Detached => print_success("Detached"),
        ShellExit::Closed => print_info("Session closed by device"),
        ShellExit::TransportLost => {
            print_error("Connection to the server was lost");
            anyhow::bail!("transport lost");
        }
    }

    Ok(())
}

async fn run_port_forward(
    config: TunnelConfig,
    device_id: &str,
    token: &str,
    specs: Vec<ForwardSpec>,
) -> Result<()> {
    if config.server.insecure {
        print_warning("TLS certificate verification is disabled");
    }

    let cancel = CancellationToken::new();
    let mut backoff = Backoff::new(config.backoff.clone());

    loop {
        let controller = match TunnelController::connect(config.clone(), device_id, token).await {
            Ok(controller) => Arc::new(controller),
            Err(e) => {
                let delay = backoff.advance();
                print_warning(&format!("Connection failed: {}. Retrying in {:?}", e, delay));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        };

        backoff.restart();

        let manager = match ForwardManager::bind(Arc::clone(&controller), specs.clone()).await {
            Ok(manager) => manager,
            Err(e) => {
                print_error(&format!("Port forwarding failed: {}", e));
                controller.shutdown().await;
                return Err(e.into());
            }
        };
        print_success(&format!("Forwarding to {}. Stop with Ctrl+C", device_id));

        let run = manager.run(cancel.clone());
        tokio::pin!(run);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                print_info("Stopping");
                cancel.cancel();
                controller.shutdown().await;
                controller.closed().await;
                break;
            }
            _ = &mut run => {
                if cancel.is_cancelled() {
                    break;
                }
                // Tunnel dropped underneath the listeners; reconnect
                let delay = backoff.advance();
                print_warning(&format!("Tunnel lost. Reconnecting in {:?}", delay));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    Ok(())
}
