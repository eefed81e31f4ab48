use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{ManagerConfig, RenewalResilience, DEFAULT_RENEW_PATH};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Session Keeper - credential lifecycle manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the remote service
    #[arg(short = 'u', long, env = "AUTH_BASE_URL")]
    pub base_url: Option<String>,

    /// Path to the credential SQLite database
    #[arg(short = 'd', long, env = "CREDENTIALS_DB_FILE")]
    pub db_file: Option<String>,

    /// Path of the token renewal endpoint
    #[arg(long, env = "RENEW_PATH", default_value = DEFAULT_RENEW_PATH)]
    pub renew_path: String,

    /// Minimum time between renewal attempts in milliseconds
    #[arg(long, env = "MIN_RENEW_INTERVAL_MS", default_value = "5000")]
    pub min_renew_interval_ms: u64,

    /// Retry policy for renewal and API calls
    #[arg(long, env = "RETRY_PRESET", value_enum, default_value = "none")]
    pub retry_preset: RetryPreset,

    /// Consecutive failures before the renewal circuit breaker opens
    #[arg(long, env = "BREAKER_FAILURE_THRESHOLD", default_value = "5")]
    pub breaker_threshold: u32,

    /// Seconds the circuit breaker stays open before a trial call
    #[arg(long, env = "BREAKER_RESET_TIMEOUT", default_value = "60")]
    pub breaker_reset_secs: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show stored credentials and decoded claims
    Status,
    /// Print a valid access token, renewing it if needed
    Token,
    /// Force a token renewal
    Renew,
    /// Clear all stored credentials
    Logout,
    /// Perform an authenticated GET request and print the JSON response
    Get {
        /// Request path, e.g. /api/servers
        path: String,
    },
}

/// Named retry policies
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPreset {
    None,
    Quick,
    Standard,
    Aggressive,
    Conservative,
}

impl RetryPreset {
    pub fn retry_config(&self) -> RetryConfig {
        match self {
            RetryPreset::None => RetryConfig::none(),
            RetryPreset::Quick => RetryConfig::quick(),
            RetryPreset::Standard => RetryConfig::standard(),
            RetryPreset::Aggressive => RetryConfig::aggressive(),
            RetryPreset::Conservative => RetryConfig::conservative(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // Remote service
    pub base_url: String,
    pub renew_path: String,

    // Storage
    pub db_file: PathBuf,

    // Renewal policy
    pub min_renew_interval: Duration,
    pub retry_preset: RetryPreset,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Duration,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,

    pub command: Command,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            base_url: args
                .base_url
                .context("AUTH_BASE_URL is required (use -u or set AUTH_BASE_URL env var)")?,

            renew_path: args.renew_path,

            db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .or_else(default_db_path)
                .context("CREDENTIALS_DB_FILE is required (use -d or set CREDENTIALS_DB_FILE env var)")?,

            min_renew_interval: Duration::from_millis(args.min_renew_interval_ms),
            retry_preset: args.retry_preset,
            breaker_failure_threshold: args.breaker_threshold,
            breaker_reset_timeout: Duration::from_secs(args.breaker_reset_secs),

            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,

            log_level: args.log_level,

            command: args.command,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            anyhow::bail!("AUTH_BASE_URL must not be empty");
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            anyhow::bail!("AUTH_BASE_URL must start with http:// or https://: {}", self.base_url);
        }

        if !self.renew_path.starts_with('/') {
            anyhow::bail!("RENEW_PATH must start with '/': {}", self.renew_path);
        }

        if self.breaker_failure_threshold == 0 {
            anyhow::bail!("BREAKER_FAILURE_THRESHOLD must be at least 1");
        }

        Ok(())
    }

    /// Renewal settings for the credential manager
    pub fn manager_config(&self) -> ManagerConfig {
        let resilience = match self.retry_preset {
            RetryPreset::None => None,
            preset => Some(RenewalResilience {
                retry: preset.retry_config(),
                breaker: CircuitBreakerConfig {
                    failure_threshold: self.breaker_failure_threshold,
                    reset_timeout: self.breaker_reset_timeout,
                },
            }),
        };

        ManagerConfig {
            renew_path: self.renew_path.clone(),
            min_renew_interval: self.min_renew_interval,
            resilience,
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default database location under the platform data directory
fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("session-keeper").join("credentials.sqlite3"))
}
