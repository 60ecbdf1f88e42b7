use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::ManagerSettings;
use crate::store::DEFAULT_SERVICE_NAME;

/// File name of the legacy session database under the data directory
const LEGACY_DB_FILE_NAME: &str = "legacy.sqlite3";

/// Session Keeper - token lifecycle manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Keychain service name
    #[arg(short, long, env = "KEEPER_SERVICE", default_value = DEFAULT_SERVICE_NAME)]
    pub service: String,

    /// Secure store backend (keyring, memory)
    #[arg(long, env = "KEEPER_STORE", default_value = "keyring")]
    pub store: String,

    /// Auth server base URL
    #[arg(short = 'u', long, env = "AUTH_BASE_URL", default_value = "http://127.0.0.1:8080")]
    pub auth_url: String,

    /// Path to the legacy SQLite session database
    #[arg(short = 'd', long, env = "LEGACY_DB_FILE")]
    pub legacy_db: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the current session
    Status,

    /// Log in and store the session
    Login {
        /// Account name (prompted when omitted)
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Print the access token
    Token {
        /// Refresh first if the token is close to expiry
        #[arg(long)]
        fresh: bool,
    },

    /// Print an Authorization header value
    Header,

    /// Refresh the session now
    Refresh,

    /// Clear the stored session
    Logout,

    /// Import a session from the legacy database
    Migrate,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Secure storage
    pub service_name: String,
    pub store_kind: StoreKind,
    pub legacy_db_file: Option<PathBuf>,

    // Auth server
    pub auth_base_url: String,

    // Timeouts
    pub token_refresh_threshold: u64,
    pub token_refresh_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,

    pub command: Command,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreKind {
    Keyring,
    Memory,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Build configuration from parsed arguments plus env-only settings
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            service_name: args.service,
            store_kind: parse_store_kind(&args.store)?,

            legacy_db_file: args
                .legacy_db
                .map(|s| expand_tilde(&s))
                .or_else(detect_legacy_db_path),

            auth_base_url: args.auth_url,

            token_refresh_threshold: env_or("TOKEN_REFRESH_THRESHOLD", 300)?,
            token_refresh_timeout: env_or("TOKEN_REFRESH_TIMEOUT", 30)?,
            http_request_timeout: env_or("HTTP_REQUEST_TIMEOUT", 30)?,

            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),

            command: args.command.unwrap_or(Command::Status),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            anyhow::bail!("KEEPER_SERVICE cannot be empty");
        }

        if !self.auth_base_url.starts_with("http://") && !self.auth_base_url.starts_with("https://")
        {
            anyhow::bail!(
                "AUTH_BASE_URL must be an http(s) URL: {}",
                self.auth_base_url
            );
        }

        if self.token_refresh_timeout == 0 {
            anyhow::bail!("TOKEN_REFRESH_TIMEOUT must be greater than zero");
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }

    /// Manager tunables derived from this configuration
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            refresh_buffer: chrono::Duration::seconds(self.token_refresh_threshold as i64),
            refresh_timeout: Duration::from_secs(self.token_refresh_timeout),
            ..ManagerSettings::default()
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_request_timeout)
    }
}

/// Read a numeric env-only setting, falling back to `default` when unset
fn env_or(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a whole number of seconds, got '{}'", key, raw)),
        Err(_) => Ok(default),
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

/// Parse secure store backend from string
fn parse_store_kind(s: &str) -> Result<StoreKind> {
    match s.to_lowercase().as_str() {
        "keyring" | "keychain" => Ok(StoreKind::Keyring),
        "memory" => Ok(StoreKind::Memory),
        other => anyhow::bail!("Unknown KEEPER_STORE '{}' (expected keyring or memory)", other),
    }
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// Try to detect the legacy session database under the user data directory
fn detect_legacy_db_path() -> Option<PathBuf> {
    let path = dirs::data_dir()?
        .join(DEFAULT_SERVICE_NAME)
        .join(LEGACY_DB_FILE_NAME);
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["session-keeper"];
        argv.extend_from_slice(args);
        Config::from_args(CliArgs::parse_from(argv)).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_relative_path() {
        let path = expand_tilde("relative/path");
        assert_eq!(path, PathBuf::from("relative/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_parse_store_kind() {
        assert_eq!(parse_store_kind("keyring").unwrap(), StoreKind::Keyring);
        assert_eq!(parse_store_kind("KEYCHAIN").unwrap(), StoreKind::Keyring);
        assert_eq!(parse_store_kind("Memory").unwrap(), StoreKind::Memory);
        assert!(parse_store_kind("plaintext").is_err());
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("json"), LogFormat::Json);
        assert_eq!(parse_log_format("JSON"), LogFormat::Json);
        assert_eq!(parse_log_format("text"), LogFormat::Text);
        assert_eq!(parse_log_format(""), LogFormat::Text);
    }

    #[test]
    fn test_subcommands() {
        assert_eq!(parse(&["--store", "memory"]).command, Command::Status);
        assert_eq!(
            parse(&["token", "--fresh"]).command,
            Command::Token { fresh: true }
        );
        assert_eq!(
            parse(&["login", "--username", "scout"]).command,
            Command::Login {
                username: Some("scout".to_string())
            }
        );
        assert_eq!(parse(&["logout"]).command, Command::Logout);
    }

    #[test]
    fn test_legacy_db_flag_is_expanded() {
        let config = parse(&["--legacy-db", "~/old/session.sqlite3", "migrate"]);
        let path = config.legacy_db_file.unwrap();
        assert!(path.ends_with("old/session.sqlite3"));
        assert_eq!(config.command, Command::Migrate);
    }

    #[test]
    fn test_validate() {
        let config = parse(&["--auth-url", "https://auth.example.com"]);
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.service_name = "  ".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.auth_base_url = "ftp://auth.example.com".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.token_refresh_timeout = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_manager_settings_from_config() {
        let mut config = parse(&[]);
        config.token_refresh_threshold = 120;
        config.token_refresh_timeout = 10;

        let settings = config.manager_settings();
        assert_eq!(settings.refresh_buffer, chrono::Duration::seconds(120));
        assert_eq!(settings.refresh_timeout, Duration::from_secs(10));
        assert_eq!(settings.event_capacity, ManagerSettings::default().event_capacity);
    }
}
