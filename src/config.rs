//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;

use crate::services::denominations::DenominationSet;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` when running with `SKIP_EXTERNALS=true`
    pub database: Option<DatabaseConfig>,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub vouchers: VoucherConfig,
    pub admin: AdminConfig,
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
    /// Minimum spacing between two provider status checks for one reference
    pub poll_throttle_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Voucher issuance configuration
#[derive(Debug, Clone)]
pub struct VoucherConfig {
    pub denominations: DenominationSet,
    pub currency: String,
    /// Refuse a second voucher of the same denomination to one subscriber
    pub single_issue_per_subscriber: bool,
    /// How many candidate vouchers to try when concurrent completions race
    pub assignment_attempts: u32,
}

/// Operator-facing routes
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub api_token: Option<String>,
    pub enable_test_endpoints: bool,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let skip_externals = env_flag("SKIP_EXTERNALS", false)?;
        let database = if skip_externals {
            None
        } else {
            Some(DatabaseConfig::from_env()?)
        };

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database,
            cache: CacheConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            vouchers: VoucherConfig::from_env()?,
            admin: AdminConfig::from_env()?,
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        if !self.skip_externals {
            self.cache.validate()?;
        }
        self.logging.validate()?;
        self.vouchers.validate()?;
        self.admin.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheConfig {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            max_connections: env::var("CACHE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CACHE_MAX_CONNECTIONS".to_string()))?,
            poll_throttle_secs: env::var("PAYMENT_POLL_THROTTLE_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| {
                    ConfigError::InvalidValue("PAYMENT_POLL_THROTTLE_SECS".to_string())
                })?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::InvalidValue("REDIS_URL".to_string()));
        }

        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "plain".to_string())),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

impl VoucherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let denominations = env::var("VOUCHER_DENOMINATIONS")
            .unwrap_or_else(|_| DenominationSet::DEFAULT.to_string())
            .parse::<DenominationSet>()
            .map_err(|e| ConfigError::InvalidValue(format!("VOUCHER_DENOMINATIONS: {}", e)))?;

        Ok(VoucherConfig {
            denominations,
            currency: env::var("VOUCHER_CURRENCY").unwrap_or_else(|_| "UGX".to_string()),
            single_issue_per_subscriber: env_flag("VOUCHER_SINGLE_ISSUE_PER_SUBSCRIBER", false)?,
            assignment_attempts: env::var("VOUCHER_ASSIGNMENT_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| {
                    ConfigError::InvalidValue("VOUCHER_ASSIGNMENT_ATTEMPTS".to_string())
                })?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.currency.trim().is_empty() {
            return Err(ConfigError::InvalidValue("VOUCHER_CURRENCY".to_string()));
        }

        if self.assignment_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "VOUCHER_ASSIGNMENT_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for VoucherConfig {
    fn default() -> Self {
        Self {
            denominations: DenominationSet::default(),
            currency: "UGX".to_string(),
            single_issue_per_subscriber: false,
            assignment_attempts: 5,
        }
    }
}

impl AdminConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(AdminConfig {
            api_token: env::var("ADMIN_API_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            enable_test_endpoints: env_flag("ENABLE_TEST_ENDPOINTS", false)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(token) = &self.api_token {
            if token.len() < 16 {
                return Err(ConfigError::ValidationFailed(
                    "ADMIN_API_TOKEN must be at least 16 characters".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn env_flag(name: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(ConfigError::InvalidValue(name.to_string())),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("plain"), LogFormat::Plain);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Plain);
    }

    #[test]
    fn test_voucher_config_requires_attempts() {
        let config = VoucherConfig {
            assignment_attempts: 0,
            ..VoucherConfig::default()
        };

        assert!(config.validate().is_err());
        assert!(VoucherConfig::default().validate().is_ok());
    }

    #[test]
    fn test_short_admin_token_rejected() {
        let config = AdminConfig {
            api_token: Some("short".to_string()),
            enable_test_endpoints: false,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_url_scheme_validation() {
        let config = CacheConfig {
            redis_url: "http://localhost:6379".to_string(),
            max_connections: 10,
            poll_throttle_secs: 5,
        };

        assert!(config.validate().is_err());
    }
}
