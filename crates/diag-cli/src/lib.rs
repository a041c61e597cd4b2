//! OBD-II Diagnostics Command Line
//!
//! Configuration loading, logging setup and the text front end for the
//! diagnostics controller.

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use obd_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub mod menu;
pub mod render;

/// Prefix of environment overrides, e.g. `OBD_DIAG__SESSION__TIMEOUT_SECS`
pub const ENV_PREFIX: &str = "OBD_DIAG";

/// Default configuration file, read when present
pub const DEFAULT_CONFIG_FILE: &str = "obd-diag.toml";

/// Command line flags
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "obd-diag", version, about = "Read and clear OBD-II trouble codes")]
pub struct Args {
    /// Serial port of the adapter; auto-selected when omitted
    #[arg(short, long)]
    pub port: Option<String>,

    /// Baud rates to try, in order (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pub baud: Vec<u32>,

    /// Per-attempt timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Use a simulated adapter
    #[arg(long)]
    pub demo: bool,

    /// Do not connect on start-up
    #[arg(long)]
    pub no_auto_connect: bool,

    /// Print the detected ports and exit
    #[arg(long)]
    pub list_ports: bool,
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log filter used when `RUST_LOG` is unset (default: warn)
    pub log_level: String,
    /// Serial port to connect to; auto-selected when unset
    pub port: Option<String>,
    /// Connect on start-up
    pub auto_connect: bool,
    /// Discovery and negotiation settings
    pub session: SessionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            port: None,
            auto_connect: true,
            session: SessionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load defaults, then the file at `path` if it exists, then
    /// `OBD_DIAG__*` environment variables
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("session.baud_rates")
                    .with_list_parse_key("session.adapter_keywords"),
            )
            .build()?
            .try_deserialize()
    }

    /// Let command line flags override loaded values
    pub fn apply_args(&mut self, args: &Args) {
        if args.port.is_some() {
            self.port = args.port.clone();
        }
        if !args.baud.is_empty() {
            self.session.baud_rates = args.baud.clone();
        }
        if let Some(timeout) = args.timeout {
            self.session.timeout_secs = timeout;
        }
        if args.no_auto_connect {
            self.auto_connect = false;
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
/// Logs go to stderr so the menu on stdout stays readable.
pub fn init_logging(default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
