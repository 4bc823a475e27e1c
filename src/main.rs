/*!
 * Switchyard CLI
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use switchyard::{
    logging,
    registry::ServerFilter,
    store::{JsonFileStore, RegistryStore},
    Gateway, GatewayConfig, GatewayOptions,
};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(version, about = "Capability-aware MCP gateway dispatch engine", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until Ctrl-C
    Serve {
        /// Configuration file (defaults apply when omitted)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Override the frontend listen address
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Do not watch the configuration file for changes
        #[arg(long)]
        no_watch: bool,
    },

    /// Validate a configuration file and print a summary
    Check {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// List persisted server registrations
    Servers {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Only servers declaring this capability
        #[arg(long)]
        capability: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            listen,
            no_watch,
        } => serve(config.as_deref(), listen, !no_watch, cli.verbose),
        Commands::Check { config } => check(&config),
        Commands::Servers {
            config,
            capability,
            json,
        } => servers(&config, capability, json),
    }
}

fn load_config(path: &Path) -> Result<GatewayConfig> {
    GatewayConfig::load(path).with_context(|| format!("Invalid configuration {}", path.display()))
}

fn serve(config_path: Option<&Path>, listen: Option<SocketAddr>, watch: bool, verbose: bool) -> Result<()> {
    let mut config = match config_path {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if verbose {
        config.logging.verbose = true;
    }
    if let Some(listen) = listen {
        config.frontend.listen = listen.to_string();
    }
    logging::init_logging(&config.logging)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async move {
        let listen = config.frontend.listen.clone();
        let mut gateway =
            Gateway::start(config, GatewayOptions::default()).context("Failed to start gateway")?;

        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("Failed to bind {}", listen))?;
        let addr = gateway.spawn_frontend(listener)?;
        if let (Some(path), true) = (config_path, watch) {
            gateway.watch_config(path)?;
        }
        info!(%addr, "Switchyard ready");

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        gateway.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}

fn check(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let policy = config.router.policy;

    println!("Configuration OK: {}", path.display());
    println!("  frontend        {}", config.frontend.listen);
    println!(
        "  breaker         open after {} failures, close after {} successes, recover in {}s",
        config.breaker.failure_threshold,
        config.breaker.success_threshold,
        config.breaker.recovery_timeout_secs
    );
    println!(
        "  pool            {}..{} connections, acquire timeout {}ms",
        config.pool.min_size, config.pool.max_size, config.pool.acquire_timeout_ms
    );
    println!(
        "  rate limit      {} per {}s, burst x{}, {} weighted tenants",
        config.rate_limit.capacity,
        config.rate_limit.window_secs,
        config.rate_limit.burst_factor,
        config.rate_limit.weights.len()
    );
    println!(
        "  router          {} policy, {} failover, {}ms invoke timeout",
        policy.as_str(),
        config.router.max_failover,
        config.router.invoke_timeout_ms
    );
    if config.health.enabled {
        println!(
            "  health          every {}s, unhealthy after {} failures",
            config.health.interval_secs, config.health.unhealthy_threshold
        );
    } else {
        println!("  health          disabled");
    }
    match &config.store.path {
        Some(store) => println!("  store           {}", store.display()),
        None => println!("  store           none (registrations are not persisted)"),
    }
    println!("  bootstrap       {} servers", config.servers.len());
    Ok(())
}

fn servers(path: &Path, capability: Option<String>, json: bool) -> Result<()> {
    let config = load_config(path)?;
    let Some(store_path) = &config.store.path else {
        bail!("{} has no [store] path; nothing is persisted", path.display());
    };
    let store = JsonFileStore::open(store_path.clone())
        .with_context(|| format!("Failed to open registry {}", store_path.display()))?;

    let filter = ServerFilter {
        capability,
        ..ServerFilter::default()
    };
    let mut records: Vec<_> = store
        .load()?
        .into_iter()
        .filter(|r| filter.matches(r))
        .collect();
    records.sort_by(|a, b| a.id.cmp(&b.id));

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No servers registered");
        return Ok(());
    }
    println!(
        "{:<38} {:<20} {:<32} {:<10} CAPABILITIES",
        "ID", "NAME", "ENDPOINT", "TENANT"
    );
    for record in records {
        let capabilities: Vec<&str> = record.capabilities.iter().map(String::as_str).collect();
        println!(
            "{:<38} {:<20} {:<32} {:<10} {}",
            record.id,
            record.name,
            record.endpoint.to_string(),
            record.tenant_id.as_deref().unwrap_or("-"),
            capabilities.join(",")
        );
    }
    Ok(())
}
