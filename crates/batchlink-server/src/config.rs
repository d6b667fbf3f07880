// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which durable store backs the correlation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// SQLite database under the data directory.
    Sqlite,
    /// Plain files under the data directory.
    File,
}

impl FromStr for StorageBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "file" | "files" => Ok(Self::File),
            _ => Err(()),
        }
    }
}

/// Enrichment provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API base URL, without trailing slash.
    pub base_url: String,
    /// API path prefix, e.g. `/api/v1`.
    pub prefix: String,
    /// API key. Without one every submission fails.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpTls {
    /// TLS from the first byte (usually port 465).
    Implicit,
    /// Plain connection upgraded with STARTTLS (usually port 587).
    StartTls,
    /// No encryption. Local relays only.
    None,
}

impl SmtpTls {
    /// Conventional port for this mode.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Implicit => 465,
            Self::StartTls => 587,
            Self::None => 25,
        }
    }
}

impl FromStr for SmtpTls {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "implicit" | "tls" | "ssl" => Ok(Self::Implicit),
            "starttls" => Ok(Self::StartTls),
            "none" | "plain" => Ok(Self::None),
            _ => Err(()),
        }
    }
}

/// SMTP settings for email notifications.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Relay host.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Connection security.
    pub tls: SmtpTls,
    /// Login user; no authentication when unset.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Sender address, e.g. `Batchlink <noreply@example.com>`.
    pub from: String,
}

impl SmtpConfig {
    /// Read the `BATCHLINK_SMTP_*` variables. `None` when no host is set.
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(host) = optional("BATCHLINK_SMTP_HOST") else {
            return Ok(None);
        };
        let from =
            optional("BATCHLINK_SMTP_FROM").ok_or(ConfigError::Missing("BATCHLINK_SMTP_FROM"))?;

        let tls: SmtpTls = optional("BATCHLINK_SMTP_TLS")
            .unwrap_or_else(|| "implicit".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("BATCHLINK_SMTP_TLS", "must be 'implicit', 'starttls' or 'none'")
            })?;
        let port = parse_or(
            "BATCHLINK_SMTP_PORT",
            tls.default_port(),
            "must be a valid port number",
        )?;

        let username = optional("BATCHLINK_SMTP_USERNAME");
        let password = optional("BATCHLINK_SMTP_PASSWORD");
        if username.is_some() != password.is_some() {
            return Err(ConfigError::Invalid(
                "BATCHLINK_SMTP_PASSWORD",
                "BATCHLINK_SMTP_USERNAME and BATCHLINK_SMTP_PASSWORD must be set together",
            ));
        }

        Ok(Some(Self {
            host,
            port,
            tls,
            username,
            password,
            from,
        }))
    }
}

/// Batchlink server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage backend
    pub storage: StorageBackend,
    /// Root of durable state
    pub data_dir: PathBuf,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Public base URL the provider sends callbacks to
    pub callback_base_url: String,
    /// Provider settings
    pub provider: ProviderConfig,
    /// Maximum concurrent submissions per batch
    pub submit_concurrency: usize,
    /// SMTP relay for email notifications; takes precedence over the webhook
    pub smtp: Option<SmtpConfig>,
    /// Webhook for notifications; notifications are only logged when neither
    /// this nor SMTP is set
    pub notify_webhook_url: Option<String>,
    /// Inactivity after which a batch is force-completed
    pub stale_after: Option<Duration>,
    /// Sweeper poll interval
    pub sweep_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `BATCHLINK_CALLBACK_BASE_URL`: public base URL for provider callbacks
    ///
    /// Optional (with defaults):
    /// - `BATCHLINK_STORAGE`: `sqlite` or `file` (default: sqlite)
    /// - `BATCHLINK_DATA_DIR`: data directory (default: .data)
    /// - `BATCHLINK_HTTP_PORT`: HTTP port (default: 8080)
    /// - `BATCHLINK_PROVIDER_BASE_URL`: (default: https://www.signalhire.com)
    /// - `BATCHLINK_PROVIDER_PREFIX`: (default: /api/v1)
    /// - `BATCHLINK_PROVIDER_API_KEY`: (default: none)
    /// - `BATCHLINK_PROVIDER_TIMEOUT_SECS`: (default: 30)
    /// - `BATCHLINK_SUBMIT_CONCURRENCY`: (default: 8)
    /// - `BATCHLINK_SMTP_HOST`: enables email notifications (default: none)
    /// - `BATCHLINK_SMTP_FROM`: sender address, required with a host
    /// - `BATCHLINK_SMTP_TLS`: `implicit`, `starttls` or `none` (default: implicit)
    /// - `BATCHLINK_SMTP_PORT`: (default: 465, 587 or 25 by TLS mode)
    /// - `BATCHLINK_SMTP_USERNAME` / `BATCHLINK_SMTP_PASSWORD`: (default: no auth)
    /// - `BATCHLINK_NOTIFY_WEBHOOK_URL`: (default: none)
    /// - `BATCHLINK_STALE_AFTER_SECS`: (default: none, expiry disabled)
    /// - `BATCHLINK_SWEEP_INTERVAL_SECS`: (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let callback_base_url = optional("BATCHLINK_CALLBACK_BASE_URL")
            .ok_or(ConfigError::Missing("BATCHLINK_CALLBACK_BASE_URL"))?;
        if !callback_base_url.starts_with("http://") && !callback_base_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(
                "BATCHLINK_CALLBACK_BASE_URL",
                "must be an http(s) URL",
            ));
        }

        let storage: StorageBackend = optional("BATCHLINK_STORAGE")
            .unwrap_or_else(|| "sqlite".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("BATCHLINK_STORAGE", "must be 'sqlite' or 'file'"))?;

        let http_port: u16 = parse_or("BATCHLINK_HTTP_PORT", 8080, "must be a valid port number")?;

        let timeout_secs: u64 = parse_or(
            "BATCHLINK_PROVIDER_TIMEOUT_SECS",
            30,
            "must be a positive integer",
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "BATCHLINK_PROVIDER_TIMEOUT_SECS",
                "must be a positive integer",
            ));
        }

        let submit_concurrency: usize = parse_or(
            "BATCHLINK_SUBMIT_CONCURRENCY",
            8,
            "must be a positive integer",
        )?;
        if submit_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "BATCHLINK_SUBMIT_CONCURRENCY",
                "must be a positive integer",
            ));
        }

        let stale_after = match optional("BATCHLINK_STALE_AFTER_SECS") {
            Some(raw) => Some(Duration::from_secs(raw.parse().map_err(|_| {
                ConfigError::Invalid("BATCHLINK_STALE_AFTER_SECS", "must be a number of seconds")
            })?)),
            None => None,
        };

        let sweep_secs: u64 = parse_or(
            "BATCHLINK_SWEEP_INTERVAL_SECS",
            60,
            "must be a positive integer",
        )?;
        if sweep_secs == 0 {
            return Err(ConfigError::Invalid(
                "BATCHLINK_SWEEP_INTERVAL_SECS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            storage,
            data_dir: PathBuf::from(
                optional("BATCHLINK_DATA_DIR").unwrap_or_else(|| ".data".to_string()),
            ),
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            callback_base_url: callback_base_url.trim_end_matches('/').to_string(),
            provider: ProviderConfig {
                base_url: optional("BATCHLINK_PROVIDER_BASE_URL")
                    .unwrap_or_else(|| "https://www.signalhire.com".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                prefix: optional("BATCHLINK_PROVIDER_PREFIX")
                    .unwrap_or_else(|| "/api/v1".to_string()),
                api_key: optional("BATCHLINK_PROVIDER_API_KEY"),
                timeout: Duration::from_secs(timeout_secs),
            },
            submit_concurrency,
            smtp: SmtpConfig::from_env()?,
            notify_webhook_url: optional("BATCHLINK_NOTIFY_WEBHOOK_URL"),
            stale_after,
            sweep_interval: Duration::from_secs(sweep_secs),
        })
    }

    /// URL the provider posts resolution reports to.
    pub fn callback_url(&self) -> String {
        format!("{}/callback", self.callback_base_url)
    }
}

/// A set, non-blank environment variable.
fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match optional(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key, reason)),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
