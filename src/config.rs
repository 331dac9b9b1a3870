//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub collections: CollectionsConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    8
}

/// Federation behavior
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Reject inbox POSTs without a valid HTTP signature
    pub require_signatures: bool,
    /// Allow fetching from and delivering to loopback/private hosts
    pub allow_private_addresses: bool,
    /// Timeout for remote dereferencing
    pub fetch_timeout_seconds: u64,
    /// Non-owned entities older than this are refetched
    pub remote_cache_ttl_days: i64,
    /// RSA modulus size for newly created actors
    pub key_bits: usize,
}

/// Collection paging
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionsConfig {
    /// Items per synthesized collection page
    pub page_size: usize,
}

/// Background task queue
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Run the polling loop in this process
    pub enabled: bool,
    /// Upper bound on one idle wait; jobs enqueued by other processes are
    /// noticed at most this late
    pub max_idle_seconds: u64,
    /// Lifetime of a job claim
    pub claim_ttl_seconds: i64,
    /// Retry delay is `attempt^2 * backoff_base_minutes`
    pub backoff_base_minutes: i64,
    /// Timeout for one outbound delivery
    pub delivery_timeout_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (APCORE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.max_connections", 8)?
            .set_default("federation.require_signatures", true)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("federation.fetch_timeout_seconds", 20)?
            .set_default("federation.remote_cache_ttl_days", 7)?
            .set_default("federation.key_bits", 2048)?
            .set_default("collections.page_size", 10)?
            .set_default("queue.enabled", true)?
            .set_default("queue.max_idle_seconds", 60)?
            .set_default("queue.claim_ttl_seconds", 300)?
            .set_default("queue.backoff_base_minutes", 3)?
            .set_default("queue.delivery_timeout_seconds", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("APCORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.collections.page_size == 0 {
            return Err(crate::error::AppError::Config(
                "collections.page_size must be greater than 0".to_string(),
            ));
        }

        if self.federation.key_bits < 1024 {
            return Err(crate::error::AppError::Config(
                "federation.key_bits must be at least 1024".to_string(),
            ));
        }

        if self.queue.claim_ttl_seconds <= 0 || self.queue.backoff_base_minutes <= 0 {
            return Err(crate::error::AppError::Config(
                "queue.claim_ttl_seconds and queue.backoff_base_minutes must be positive"
                    .to_string(),
            ));
        }

        if !self.server.protocol.eq_ignore_ascii_case("https")
            && !is_local_server_domain(&self.server.domain)
        {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
pub(crate) fn test_config(db_path: PathBuf) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "local.example".to_string(),
            protocol: "https".to_string(),
        },
        database: DatabaseConfig {
            path: db_path,
            max_connections: 4,
        },
        federation: FederationConfig {
            require_signatures: false,
            allow_private_addresses: true,
            fetch_timeout_seconds: 5,
            remote_cache_ttl_days: 7,
            key_bits: 1024,
        },
        collections: CollectionsConfig { page_size: 10 },
        queue: QueueConfig {
            enabled: false,
            max_idle_seconds: 1,
            claim_ttl_seconds: 300,
            backoff_base_minutes: 3,
            delivery_timeout_seconds: 5,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}
