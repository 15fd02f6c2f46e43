use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tired_proxy::config::Config;
use tired_proxy::supervisor::Supervisor;
use tired_proxy::{signal, PKG_NAME, VERSION};
use tracing::{error, info};

/// Reverse proxy that shuts itself and its upstream server down after a
/// period without requests
#[derive(Debug, Parser)]
#[command(name = "tired-proxy", version, about)]
struct Args {
    /// Origin URL requests are forwarded to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Idle time in seconds before shutting down
    #[arg(long)]
    time: Option<u64>,

    /// Maximum time in seconds to wait for the upstream server to come online
    #[arg(long)]
    upstream_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,

    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the listener to
    #[arg(long)]
    bind: Option<String>,

    /// Seconds to wait for the server command after a relayed signal before killing it
    #[arg(long)]
    shutdown_grace_period: Option<u64>,

    /// Server command to start and supervise
    #[arg(last = true)]
    command: Vec<String>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(host) = &self.host {
            config.origin = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(time) = self.time {
            config.idle_timeout_secs = time;
        }
        if let Some(upstream_timeout) = self.upstream_timeout {
            config.upstream_timeout_secs = upstream_timeout;
        }
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(grace_period) = self.shutdown_grace_period {
            config.shutdown_grace_period_secs = Some(grace_period);
        }
        if let Some(command) = self.command_line() {
            config.command = Some(command);
        }
        config.verbose |= self.verbose;

        config.validate()?;
        Ok(config)
    }

    /// A single argument is taken as a complete command string, several are
    /// quoted so each survives tokenization as one word
    fn command_line(&self) -> Option<String> {
        match self.command.as_slice() {
            [] => None,
            [command] => Some(command.clone()),
            args => Some(shell_words::join(args)),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = args.load_config();

    let verbose = args.verbose || config.as_ref().map(|c| c.verbose).unwrap_or(false);
    init_logging(verbose);

    let exit_code = match config {
        Ok(config) => match run(config).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %format!("{:#}", e), "tired-proxy failed");
                1
            }
        },
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to load configuration");
            1
        }
    };

    std::process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    let directive = if verbose { "tired_proxy=debug" } else { "tired_proxy=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .init();
}

async fn run(config: Config) -> anyhow::Result<i32> {
    print_startup_banner(&config);

    let signals = signal::listen().context("failed to subscribe to termination signals")?;
    let exit_code = Supervisor::new(config).run(signals).await?;

    Ok(exit_code)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tired-proxy");
    info!(
        origin = %config.origin,
        listen = %config.listen_addr(),
        idle_timeout_secs = config.idle_timeout_secs,
        upstream_timeout_secs = config.upstream_timeout_secs,
        "Proxy configuration"
    );
    if let Some(command) = &config.command {
        info!(
            command = %command,
            shutdown_grace_period_secs = ?config.shutdown_grace_period_secs,
            "Server command"
        );
    }
    info!(
        pool_max_idle = config.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.pool_idle_timeout_secs,
        "Connection pool settings"
    );
}
