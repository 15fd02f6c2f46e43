use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Settings for a single proxy run
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Upstream origin URL requests are forwarded to
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Port the proxy listens on (0 picks an ephemeral port)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Seconds without a request before the proxy shuts itself down
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds to wait for the origin port to come online (0 disables the wait)
    #[serde(default)]
    pub upstream_timeout_secs: u64,

    /// Command line of the server to supervise, tokenized like a POSIX shell
    ///
    /// **Security:** This command is executed directly. Ensure config files
    /// are protected and commands come from trusted sources only.
    pub command: Option<String>,

    /// Upper bound on waiting for the command to exit after a relayed signal.
    /// Unset means wait until it exits.
    pub shutdown_grace_period_secs: Option<u64>,

    /// Maximum idle connections kept open to the origin (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle origin connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Enable debug logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            port: default_listen_port(),
            bind: default_bind_address(),
            idle_timeout_secs: default_idle_timeout(),
            upstream_timeout_secs: 0,
            command: None,
            shutdown_grace_period_secs: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            verbose: false,
        }
    }
}

impl Config {
    /// Read a TOML file.
    ///
    /// Not validated here: command-line overrides are applied on top first,
    /// then [`validate`](Config::validate) runs once on the merged result.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.origin.trim().is_empty() {
            errors.push("'origin' must not be empty".to_string());
        }

        if self.idle_timeout_secs == 0 {
            errors.push("'idle_timeout_secs' must be greater than 0".to_string());
        }

        if self.bind.trim().is_empty() {
            errors.push("'bind' must not be empty".to_string());
        }

        if let Some(command) = &self.command {
            if command.trim().is_empty() {
                errors.push("'command' must not be empty when set".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Readiness wait bound, `None` when the wait is disabled
    pub fn upstream_timeout(&self) -> Option<Duration> {
        (self.upstream_timeout_secs > 0).then(|| Duration::from_secs(self.upstream_timeout_secs))
    }

    pub fn shutdown_grace_period(&self) -> Option<Duration> {
        self.shutdown_grace_period_secs.map(Duration::from_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    /// Address string the proxy listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

// Default value functions
fn default_origin() -> String {
    "http://localhost".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections to the origin
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}
