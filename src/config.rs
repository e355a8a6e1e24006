use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

use crate::log_error;

/// Value `TEST_ONLY_SKIP_TLS_VERIFY` must carry to disable certificate checks
pub const SKIP_TLS_VERIFY_TOKEN: &str = "dummy string just in case";

/// Environment variable pointing at the configuration file
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG_PATH";

/// Error type for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Remote relay connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Relay hostname, also used for TLS identity verification
    #[serde(default)]
    pub server_domain: String,
    /// Relay port (submission with STARTTLS)
    #[serde(default = "default_smtp_port")]
    pub server_port: u16,
    /// Local domain announced in EHLO
    #[serde(default = "default_client_domain")]
    pub client_domain: String,
    /// Seconds to wait for any single SMTP reply
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Disable certificate verification (tests against self-signed relays only)
    #[serde(default)]
    pub skip_tls_verify: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server_domain: String::new(),
            server_port: default_smtp_port(),
            client_domain: default_client_domain(),
            command_timeout_secs: default_command_timeout(),
            skip_tls_verify: false,
        }
    }
}

fn default_smtp_port() -> u16 {
    587
}

fn default_client_domain() -> String {
    "localhost".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

/// Mailbox settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MailConfig {
    /// Account used for AUTH and as the envelope sender
    #[serde(default)]
    pub source_address: String,
    /// Credential for the source account
    #[serde(default)]
    pub source_password: String,
    /// Fixed destination mailbox for every relayed message
    #[serde(default)]
    pub target_address: String,
}

/// HTTP front end settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Origins allowed to POST from a browser
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    /// Per-request processing budget in milliseconds
    pub request_timeout_ms: Option<u64>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            cors_allowed_origins: Vec::new(),
            request_timeout_ms: None,
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

impl SmtpConfig {
    /// `host:port` of the relay
    pub fn address(&self) -> String {
        format!("{}:{}", self.server_domain, self.server_port)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl RelayConfig {
    /// Load configuration from file, falling back to environment variables
    pub async fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let default_path = PathBuf::from("config.toml");
        let (path, required) = match config_path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_path, false),
        };

        let mut config = if required || path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
            toml::from_str(&content)?
        } else {
            RelayConfig::default()
        };

        // Environment variables override config file values
        config.apply_overrides(|key| std::env::var(key).ok());

        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process environment)
    pub fn apply_overrides<F>(&mut self, get_env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Relay settings
        if let Some(domain) = get_env("SMTP_SERVER_DOMAIN") {
            self.smtp.server_domain = domain;
        }
        if let Some(port) = get_env("SMTP_SERVER_PORT") {
            match port.parse() {
                Ok(port) => self.smtp.server_port = port,
                Err(e) => log_error!("Invalid SMTP_SERVER_PORT {:?}: {}", port, e),
            }
        }
        if let Some(domain) = get_env("SMTP_CLIENT_DOMAIN") {
            self.smtp.client_domain = domain;
        }
        if let Some(token) = get_env("TEST_ONLY_SKIP_TLS_VERIFY") {
            self.smtp.skip_tls_verify = token == SKIP_TLS_VERIFY_TOKEN;
        }

        // Mailbox settings
        if let Some(address) = get_env("SOURCE_EMAIL_ADDRESS") {
            self.mail.source_address = address;
        }
        if let Some(password) = get_env("SOURCE_EMAIL_PASSWORD") {
            self.mail.source_password = password;
        }
        if let Some(address) = get_env("TARGET_EMAIL_ADDRESS") {
            self.mail.target_address = address;
        }

        // HTTP settings
        if let Some(port) = get_env("HTTP_SERVER_PORT") {
            match port.parse() {
                Ok(port) => self.http.port = port,
                Err(e) => log_error!("Invalid HTTP_SERVER_PORT {:?}: {}", port, e),
            }
        }
        if let Some(origins) = get_env("CORS_ALLOWED_ORIGINS") {
            self.http.cors_allowed_origins = origins
                .split(' ')
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(timeout) = get_env("TIMEOUT_REQUEST_PROCESSING") {
            // An unparsable timeout leaves requests without a deadline
            match timeout.parse() {
                Ok(ms) => self.http.request_timeout_ms = Some(ms),
                Err(e) => {
                    log_error!("Invalid request processing timeout: {}", e);
                    self.http.request_timeout_ms = None;
                }
            }
        }
    }

    /// Check that everything the relay session needs is present
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smtp.server_domain.is_empty() {
            return Err(ConfigError::Missing("smtp.server_domain"));
        }
        if self.mail.source_address.is_empty() {
            return Err(ConfigError::Missing("mail.source_address"));
        }
        if self.mail.target_address.is_empty() {
            return Err(ConfigError::Missing("mail.target_address"));
        }
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn sample() -> String {
        let sample = RelayConfig {
            smtp: SmtpConfig {
                server_domain: "smtp.example.com".to_string(),
                server_port: 587,
                client_domain: "contact.example.com".to_string(),
                command_timeout_secs: 30,
                skip_tls_verify: false,
            },
            mail: MailConfig {
                source_address: "contact-form@example.com".to_string(),
                source_password: "your-app-password".to_string(),
                target_address: "me@example.com".to_string(),
            },
            http: HttpConfig {
                port: 8080,
                cors_allowed_origins: vec!["https://example.com".to_string()],
                request_timeout_ms: Some(10_000),
            },
        };
        toml::to_string_pretty(&sample).unwrap_or_default()
    }
}

/// Configuration path named by the environment, if any
pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
}
