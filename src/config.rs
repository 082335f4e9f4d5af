use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use bankfeed_core::Error;

/// Environment variable consulted before `[security] secret_key`.
pub const SECRET_ENV: &str = "BANKFEED_SECRET";

const INSECURE_DEV_SECRET: &str = "bankfeed-insecure-dev-secret";

#[derive(Parser, Debug)]
#[command(name = "bankfeed", about = "Bankfeed - cached bank account balances and transactions")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "bankfeed.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Exchange a one-time setup token and store the provider credential
    Setup {
        /// Provider to configure
        #[arg(default_value = "simplefin")]
        provider: String,

        /// One-time setup token issued by the provider
        #[arg(short, long)]
        token: String,
    },
    /// List linked accounts with current balances
    Accounts {
        /// Emit machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List recent transactions, newest first
    Transactions {
        /// How many days back to include
        #[arg(short, long, default_value_t = 30)]
        days: i64,

        /// Emit machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Run the dashboard API server
    Serve,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default = "default_vault")]
    pub vault: VaultConfig,

    #[serde(default = "default_provider")]
    pub provider: ProviderConfig,

    #[serde(default = "default_sync")]
    pub sync: SyncConfig,

    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// When true, all API endpoints (except /health) require authentication.
    #[serde(default)]
    pub enabled: bool,

    /// Static API keys. Each key has a name for audit logs.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyEntry {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// SQLite database path; ":memory:" for an ephemeral store.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    /// Encrypted credential file path.
    #[serde(default = "default_vault_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String,

    /// Largest history range the provider accepts in one request.
    #[serde(default = "default_max_window_days")]
    pub max_window_days: i64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retry budget for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Floor between provider refreshes; views inside it are served from
    /// the local store without a network round trip.
    #[serde(default = "default_min_refresh_secs")]
    pub min_refresh_secs: u64,

    /// Overall deadline for one sync cycle.
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,

    #[serde(default = "default_lookback_days")]
    pub default_lookback_days: i64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SecurityConfig {
    /// Operator secret driving the vault encryption key. Prefer the
    /// BANKFEED_SECRET environment variable over this field.
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Development escape hatch: run with a fixed, well-known secret.
    /// Production deployments must leave this off.
    #[serde(default)]
    pub allow_insecure_default: bool,
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_storage() -> StorageConfig {
    StorageConfig {
        path: default_storage_path(),
    }
}

fn default_vault() -> VaultConfig {
    VaultConfig {
        path: default_vault_path(),
    }
}

fn default_provider() -> ProviderConfig {
    ProviderConfig {
        kind: default_provider_kind(),
        max_window_days: default_max_window_days(),
        request_timeout_secs: default_request_timeout_secs(),
        max_retries: default_max_retries(),
        retry_base_ms: default_retry_base_ms(),
    }
}

fn default_sync() -> SyncConfig {
    SyncConfig {
        min_refresh_secs: default_min_refresh_secs(),
        cycle_timeout_secs: default_cycle_timeout_secs(),
        default_lookback_days: default_lookback_days(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_storage_path() -> String {
    "bankfeed.db".to_string()
}

fn default_vault_path() -> String {
    "bankfeed.credential".to_string()
}

fn default_provider_kind() -> String {
    "simplefin".to_string()
}

fn default_max_window_days() -> i64 {
    90
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_min_refresh_secs() -> u64 {
    300
}

fn default_cycle_timeout_secs() -> u64 {
    60
}

fn default_lookback_days() -> i64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: default_server(),
            logging: default_logging(),
            auth: AuthConfig::default(),
            storage: default_storage(),
            vault: default_vault(),
            provider: default_provider(),
            sync: default_sync(),
            security: SecurityConfig::default(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        config
    }

    pub fn listen_addr(&self) -> SocketAddr {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .expect("Invalid listen address")
    }

    /// Resolve the operator secret: environment first, then the config file.
    /// Absence fails closed unless the insecure development default was
    /// explicitly opted into.
    pub fn operator_secret(&self) -> Result<String, Error> {
        if let Ok(value) = std::env::var(SECRET_ENV) {
            if !value.trim().is_empty() {
                return Ok(value);
            }
        }
        if let Some(value) = &self.security.secret_key {
            if !value.trim().is_empty() {
                return Ok(value.clone());
            }
        }
        if self.security.allow_insecure_default {
            tracing::warn!("no operator secret configured; using the UNSAFE development default");
            return Ok(INSECURE_DEV_SECRET.to_string());
        }
        Err(Error::Config(format!(
            "no operator secret configured; set {} or [security] secret_key \
             (or allow_insecure_default = true for development)",
            SECRET_ENV
        )))
    }
}
