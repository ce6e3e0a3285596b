use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level configuration for the serve manager
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Control API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Settings used when launching serve processes
    #[serde(default)]
    pub serve: ServeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port for the control API, bound on 127.0.0.1
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the control API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_port: default_admin_port(),
            admin_token: None,
        }
    }
}

/// Inclusive range of ports handed out to instances
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
        }
    }
}

/// What to do when a supervised process exits on its own
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Probe the health endpoint once and deregister only if it stopped responding.
    /// Covers launchers that hand the server off to a child and exit.
    #[default]
    Verify,
    /// Deregister as soon as the process exits
    Always,
}

/// Settings for launching and supervising serve processes
///
/// # Security Warning
///
/// `executable` and `args` are executed directly with the manager's
/// environment. Configuration files must be protected with appropriate file
/// permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct ServeConfig {
    /// Executable to launch
    #[serde(default = "default_executable")]
    pub executable: String,

    /// Leading arguments placed before the subcommand (e.g. `npx opencode`)
    #[serde(default)]
    pub args: Vec<String>,

    /// Subcommand that starts the server
    #[serde(default = "default_subcommand")]
    pub subcommand: String,

    /// Address passed to the child via `--hostname`, also used for the port bind check
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Ports handed out to instances
    #[serde(default)]
    pub port_range: PortRange,

    /// Readiness endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Exit handling policy
    #[serde(default)]
    pub exit_policy: ExitPolicy,

    /// Timeout for a single readiness probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Interval between readiness probes in milliseconds
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Default deadline for readiness in milliseconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            args: Vec::new(),
            subcommand: default_subcommand(),
            hostname: default_hostname(),
            port_range: PortRange::default(),
            health_path: default_health_path(),
            exit_policy: ExitPolicy::default(),
            probe_timeout_ms: default_probe_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            ready_timeout_ms: default_ready_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl ServeConfig {
    /// Create a config launching `executable` with every other setting at its default
    pub fn with_executable(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
            ..Self::default()
        }
    }

    /// Set leading arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the port range (builder pattern)
    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = PortRange::new(min, max);
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Validate launch settings, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.executable.trim().is_empty() {
            errors.push("serve: 'executable' must not be empty".to_string());
        }
        if self.port_range.min == 0 {
            errors.push("serve.port_range: 'min' must be greater than 0".to_string());
        }
        if self.port_range.min > self.port_range.max {
            errors.push(format!(
                "serve.port_range: 'min' ({}) must not exceed 'max' ({})",
                self.port_range.min, self.port_range.max
            ));
        }
        if !self.health_path.starts_with('/') {
            errors.push(format!(
                "serve: 'health_path' must start with '/' (got '{}')",
                self.health_path
            ));
        }
        if self.ready_poll_interval_ms == 0 {
            errors.push("serve: 'ready_poll_interval_ms' must be greater than 0".to_string());
        }
        if self.hostname.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!(
                "serve: 'hostname' must be an IP address (got '{}')",
                self.hostname
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_admin_port() -> u16 {
    14096
}

fn default_executable() -> String {
    "opencode".to_string()
}

fn default_subcommand() -> String {
    "serve".to_string()
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_port_min() -> u16 {
    14097
}

fn default_port_max() -> u16 {
    14200
}

fn default_health_path() -> String {
    "/session".to_string()
}

fn default_probe_timeout() -> u64 {
    2000 // 2 seconds per probe
}

fn default_ready_poll_interval() -> u64 {
    500 // 500ms between probes
}

fn default_ready_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_shutdown_grace_period() -> u64 {
    5 // 5 seconds between SIGTERM and SIGKILL
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No configuration file found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Err(errors) = self.serve.validate() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }
}
