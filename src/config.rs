//! Configuration management for guardshift.
//!
//! Configuration is assembled from three sources, later ones overriding
//! earlier ones: built-in defaults, a TOML configuration file, and
//! command-line arguments (with `GUARDSHIFT_STATE` / `GUARDSHIFT_CONFIG`
//! environment fallbacks handled by clap).
//!
//! The guard rotation tunables live in [`RotationConfig`], an immutable
//! value handed to the [`Reconciler`](crate::Reconciler) at construction.
//! Nothing in the engine reads ambient global state, so tests can vary the
//! tunables per case.
//!
//! # Example configuration file
//!
//! ```toml
//! control_ip = "127.0.0.1"
//! control_port = 9051
//! # control_socket = "/run/tor/control"
//! state_file = "guardshift.state"
//! loglevel = "notice"
//! # logfile = "/var/log/guardshift.log"
//! halt_on_config_errors = false
//!
//! [rotation]
//! num_layer1_guards = 2   # 0 = leave Tor's default alone
//! num_layer2_guards = 4
//! num_layer3_guards = 8
//! layer1_lifetime_days = 0
//! min_layer2_lifetime_hours = 24
//! max_layer2_lifetime_hours = 1080  # 45 days
//! min_layer3_lifetime_hours = 1
//! max_layer3_lifetime_hours = 48
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Log level for guardshift output.
///
/// From most to least verbose: `Debug` > `Info` > `Notice` > `Warn` >
/// `Error`. `Notice` is the default and maps onto tracing's `info` level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events that may be of interest.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Guard rotation tunables.
///
/// Controls how many guards are held at each layer and how long they live.
/// Layer2 guards rotate slowly (days to weeks), layer3 guards rotate fast
/// (hours to days); the asymmetry is what makes guard discovery expensive
/// for an observer.
///
/// | Field | Default | Meaning |
/// |-------|---------|---------|
/// | `num_layer1_guards` | 2 | entry guards pushed to Tor (0 = Tor default) |
/// | `num_layer2_guards` | 4 | layer2 vanguard count |
/// | `num_layer3_guards` | 8 | layer3 vanguard count (0 disables layer3) |
/// | `layer1_lifetime_days` | 0 | entry guard lifetime (0 = Tor default) |
/// | `min_layer2_lifetime_hours` | 24 | lower bound of layer2 rotation |
/// | `max_layer2_lifetime_hours` | 1080 | upper bound of layer2 rotation |
/// | `min_layer3_lifetime_hours` | 1 | lower bound of layer3 rotation |
/// | `max_layer3_lifetime_hours` | 48 | upper bound of layer3 rotation |
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RotationConfig {
    /// Number of layer1 (entry) guards. 0 means use Tor's default.
    #[serde(default = "default_num_layer1_guards")]
    pub num_layer1_guards: u8,
    /// Number of layer2 guards.
    #[serde(default = "default_num_layer2_guards")]
    pub num_layer2_guards: u8,
    /// Number of layer3 guards. 0 disables the layer3 restriction.
    #[serde(default = "default_num_layer3_guards")]
    pub num_layer3_guards: u8,
    /// Layer1 guard lifetime in days. 0 means use Tor's default.
    #[serde(default)]
    pub layer1_lifetime_days: u16,
    /// Minimum layer2 guard lifetime in hours.
    #[serde(default = "default_min_layer2_lifetime_hours")]
    pub min_layer2_lifetime_hours: u32,
    /// Maximum layer2 guard lifetime in hours.
    #[serde(default = "default_max_layer2_lifetime_hours")]
    pub max_layer2_lifetime_hours: u32,
    /// Minimum layer3 guard lifetime in hours.
    #[serde(default = "default_min_layer3_lifetime_hours")]
    pub min_layer3_lifetime_hours: u32,
    /// Maximum layer3 guard lifetime in hours.
    #[serde(default = "default_max_layer3_lifetime_hours")]
    pub max_layer3_lifetime_hours: u32,
}

fn default_num_layer1_guards() -> u8 {
    2
}
fn default_num_layer2_guards() -> u8 {
    4
}
fn default_num_layer3_guards() -> u8 {
    8
}
fn default_min_layer2_lifetime_hours() -> u32 {
    24
}
fn default_max_layer2_lifetime_hours() -> u32 {
    1080
}
fn default_min_layer3_lifetime_hours() -> u32 {
    1
}
fn default_max_layer3_lifetime_hours() -> u32 {
    48
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            num_layer1_guards: default_num_layer1_guards(),
            num_layer2_guards: default_num_layer2_guards(),
            num_layer3_guards: default_num_layer3_guards(),
            layer1_lifetime_days: 0,
            min_layer2_lifetime_hours: default_min_layer2_lifetime_hours(),
            max_layer2_lifetime_hours: default_max_layer2_lifetime_hours(),
            min_layer3_lifetime_hours: default_min_layer3_lifetime_hours(),
            max_layer3_lifetime_hours: default_max_layer3_lifetime_hours(),
        }
    }
}

/// Main configuration for the guardshift daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// IP address of the Tor control port.
    #[serde(default = "default_control_ip")]
    pub control_ip: String,
    /// Port number of the Tor control port.
    #[serde(default)]
    pub control_port: Option<u16>,
    /// Path to the Tor control socket. Takes precedence over TCP.
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
    /// Password for Tor control authentication.
    #[serde(default)]
    pub control_pass: Option<String>,
    /// Path to the guard-set state file.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None logs to stdout.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Maximum reconnection attempts. None retries forever.
    #[serde(default)]
    pub retry_limit: Option<u32>,
    /// Reconcile and apply the guard configuration once, then exit.
    #[serde(default)]
    pub one_shot: bool,
    /// Escalate unsupported control parameters to hard failures.
    ///
    /// When false (the default), a Tor daemon that rejects a parameter name
    /// gets that parameter skipped with a warning and the rest of the
    /// configuration is still applied.
    #[serde(default)]
    pub halt_on_config_errors: bool,
    /// Guard rotation tunables.
    #[serde(default)]
    pub rotation: RotationConfig,
}

fn default_control_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_state_file() -> PathBuf {
    PathBuf::from("guardshift.state")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_ip: default_control_ip(),
            control_port: None,
            control_socket: None,
            control_pass: None,
            state_file: default_state_file(),
            loglevel: LogLevel::default(),
            logfile: None,
            retry_limit: None,
            one_shot: false,
            halt_on_config_errors: false,
            rotation: RotationConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and
    /// [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serializes the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validates configuration values.
    ///
    /// Lifetime minimums must be at least one hour so a freshly chosen
    /// guard always expires strictly after it was chosen, and minimums must
    /// not exceed maximums. Layer2 must hold at least one guard.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        let r = &self.rotation;
        if r.num_layer2_guards == 0 {
            return Err(Error::Config(
                "num_layer2_guards must be at least 1".to_string(),
            ));
        }
        if r.min_layer2_lifetime_hours == 0 || r.min_layer3_lifetime_hours == 0 {
            return Err(Error::Config(
                "guard lifetime minimums must be at least 1 hour".to_string(),
            ));
        }
        if r.min_layer2_lifetime_hours > r.max_layer2_lifetime_hours {
            return Err(Error::Config(
                "min_layer2_lifetime_hours must be <= max_layer2_lifetime_hours".to_string(),
            ));
        }
        if r.min_layer3_lifetime_hours > r.max_layer3_lifetime_hours {
            return Err(Error::Config(
                "min_layer3_lifetime_hours must be <= max_layer3_lifetime_hours".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves `control_ip` to an IP address if it is a hostname.
    pub fn resolve_control_ip(&mut self) -> Result<()> {
        if self.control_ip.parse::<IpAddr>().is_err() {
            let addr = format!("{}:0", self.control_ip)
                .to_socket_addrs()
                .map_err(|e| {
                    Error::Config(format!(
                        "failed to resolve hostname {}: {}",
                        self.control_ip, e
                    ))
                })?
                .next()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no addresses found for hostname {}",
                        self.control_ip
                    ))
                })?;
            self.control_ip = addr.ip().to_string();
        }
        Ok(())
    }
}

/// Command-line arguments for guardshift.
///
/// Arguments override configuration-file values. `--state` and `--config`
/// also read the `GUARDSHIFT_STATE` / `GUARDSHIFT_CONFIG` environment
/// variables.
#[derive(Parser, Debug)]
#[command(name = "guardshift")]
#[command(about = "Vanguard guard rotation for Tor onion services")]
#[command(version)]
pub struct CliArgs {
    /// Path to the guard-set state file.
    #[arg(long = "state", env = "GUARDSHIFT_STATE")]
    pub state_file: Option<PathBuf>,

    /// Write default config to file and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to a file instead of stdout.
    #[arg(long)]
    pub logfile: Option<String>,

    /// Path to the configuration file.
    #[arg(
        long = "config",
        env = "GUARDSHIFT_CONFIG",
        default_value = "guardshift.conf"
    )]
    pub config_file: PathBuf,

    /// IP address of the Tor control port.
    #[arg(long)]
    pub control_ip: Option<String>,

    /// Tor control port number.
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Path to the Tor control socket.
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Tor control port password.
    #[arg(long)]
    pub control_pass: Option<String>,

    /// Reconnection attempt limit (default: retry forever).
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Set guard configuration once and exit.
    #[arg(long)]
    pub one_shot: bool,

    /// Treat unsupported control parameters as hard failures.
    #[arg(long)]
    pub halt_on_config_errors: bool,
}

impl CliArgs {
    /// Applies CLI arguments on top of a configuration.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref state_file) = self.state_file {
            config.state_file = state_file.clone();
        }
        if let Some(ref loglevel) = self.loglevel {
            if let Ok(level) = loglevel.parse() {
                config.loglevel = level;
            }
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(ref control_ip) = self.control_ip {
            config.control_ip = control_ip.clone();
        }
        if let Some(control_port) = self.control_port {
            config.control_port = Some(control_port);
        }
        if let Some(ref control_socket) = self.control_socket {
            config.control_socket = Some(control_socket.clone());
        }
        if let Some(ref control_pass) = self.control_pass {
            config.control_pass = Some(control_pass.clone());
        }
        if let Some(retry_limit) = self.retry_limit {
            config.retry_limit = Some(retry_limit);
        }
        if self.one_shot {
            config.one_shot = true;
        }
        if self.halt_on_config_errors {
            config.halt_on_config_errors = true;
        }
    }
}

/// Loads configuration from the file named by `args`, then applies CLI
/// overrides, resolves the control host and validates the result.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config);
    config.resolve_control_ip()?;
    config.validate()?;

    Ok(config)
}
