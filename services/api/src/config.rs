//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. For local
//! development, `.env.<APP_ENV>` and then `.env` are read first.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Missing required environment variables for {environment}: {missing}")]
    MissingForEnvironment { environment: String, missing: String },
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// The deployment environment, from `APP_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl Environment {
    pub const fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Test => "test",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(ConfigError::InvalidValue(
                "APP_ENV".to_string(),
                format!("'{other}' is not one of development, production, test"),
            )),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_DEV_SCHEMA_QUALIFIER: &str = "";
const DEFAULT_PROD_SCHEMA_QUALIFIER: &str = "prod.";
const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_APP_BASENAME: &str = "/diya-ed";

/// Stripe publishable keys handed to the browser for embedded Checkout.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishableKeys {
    /// `STRIPE_PUBLISHABLE_KEY`, used for either mode when set.
    pub any_mode: Option<String>,
    pub test: Option<String>,
    pub live: Option<String>,
}

impl PublishableKeys {
    pub fn for_mode(&self, livemode: bool) -> Option<&str> {
        let by_mode = if livemode { &self.live } else { &self.test };
        self.any_mode.as_deref().or(by_mode.as_deref())
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub environment: Environment,
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub database_url: Option<String>,
    pub enable_mock_database: bool,
    pub schema_qualifier: String,
    /// Allowed CORS origins; empty allows any origin.
    pub allowed_origins: Vec<String>,
    pub firebase_project_id: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_publishable_keys: PublishableKeys,
    /// Public origin of the web app (`DOMAIN`), scheme included.
    pub app_domain: Option<String>,
    /// Client-side router basename, e.g. `/diya-ed`.
    pub app_basename: String,
    pub max_request_size: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// The dotenv files are skipped in test builds to keep tests hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
            dotenvy::from_filename(format!(".env.{}", app_env.trim())).ok();
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let environment = non_empty("APP_ENV")
            .map(|v| v.parse::<Environment>())
            .transpose()?
            .unwrap_or_default();

        // --- Load Server Settings ---
        let bind_address_str = non_empty("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3001".to_string());
        let mut bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;
        if let Some(port) = non_empty("PORT") {
            let port = port.parse::<u16>().map_err(|_| {
                ConfigError::InvalidValue("PORT".to_string(), format!("'{port}' must be a valid number"))
            })?;
            bind_address.set_port(port);
        }

        let log_level_str = non_empty("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let max_request_size = match non_empty("MAX_REQUEST_SIZE") {
            Some(raw) => parse_size(&raw).ok_or_else(|| {
                ConfigError::InvalidValue("MAX_REQUEST_SIZE".to_string(), format!("'{raw}' is not a size"))
            })?,
            None => DEFAULT_MAX_REQUEST_SIZE,
        };

        let allowed_origins = non_empty("SERVER_ALLOW_ORIGIN")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        // --- Load Database Settings ---
        let database_url = non_empty("DATABASE_URL");
        let enable_mock_database = non_empty("ENABLE_MOCK_DATABASE")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let schema_qualifier = match var("DATABASE_SCHEMA_QUALIFIER").map(|v| v.trim().to_string()) {
            Some(q) if q == "undefined" => {
                return Err(ConfigError::InvalidValue(
                    "DATABASE_SCHEMA_QUALIFIER".to_string(),
                    "currently set to \"undefined\"".to_string(),
                ))
            }
            Some(q) if !q.is_empty() => q,
            _ if environment == Environment::Production => DEFAULT_PROD_SCHEMA_QUALIFIER.to_string(),
            _ => DEFAULT_DEV_SCHEMA_QUALIFIER.to_string(),
        };

        // --- Load Provider Credentials (as optional) ---
        let firebase_project_id = non_empty("FIREBASE_PROJECT_ID");
        let stripe_secret_key = non_empty("STRIPE_SECRET_KEY");
        let stripe_webhook_secret = non_empty("STRIPE_WEBHOOK_SECRET");
        let stripe_publishable_keys = PublishableKeys {
            any_mode: non_empty("STRIPE_PUBLISHABLE_KEY"),
            test: non_empty("STRIPE_PUBLISHABLE_KEY_TEST"),
            live: non_empty("STRIPE_PUBLISHABLE_KEY_LIVE"),
        };

        // --- Load Web App Location ---
        let app_domain = non_empty("DOMAIN");
        let app_basename = normalize_basename(non_empty("APP_BASENAME").as_deref().unwrap_or(DEFAULT_APP_BASENAME));

        let config = Self {
            environment,
            bind_address,
            log_level,
            database_url,
            enable_mock_database,
            schema_qualifier,
            allowed_origins,
            firebase_project_id,
            stripe_secret_key,
            stripe_webhook_secret,
            stripe_publishable_keys,
            app_domain,
            app_basename,
            max_request_size,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.environment != Environment::Production {
            return Ok(());
        }

        let mut missing = Vec::new();
        if self.stripe_secret_key.is_none() {
            missing.push("STRIPE_SECRET_KEY");
        }
        if self.firebase_project_id.is_none() && !self.uses_mock_database() {
            missing.push("FIREBASE_PROJECT_ID");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingForEnvironment {
                environment: self.environment.to_string(),
                missing: missing.join(", "),
            })
        }
    }

    /// Non-fatal configuration problems worth logging at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.stripe_secret_key.is_none() {
            warnings.push("STRIPE_SECRET_KEY is not set. Payment features will not work.".to_string());
        }
        if self.stripe_secret_key.is_some() && self.stripe_webhook_secret.is_none() {
            warnings.push("STRIPE_WEBHOOK_SECRET is not set. Webhook events will be rejected.".to_string());
        }
        if self.firebase_project_id.is_none() && !self.uses_mock_database() {
            warnings.push("FIREBASE_PROJECT_ID is not set. Bearer tokens cannot be verified.".to_string());
        }
        warnings
    }

    /// Whether the in-memory store (and the fixed mock tokens) should be used.
    pub fn uses_mock_database(&self) -> bool {
        self.enable_mock_database || self.environment == Environment::Test || self.database_url.is_none()
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// The web app root under `domain`, with the router basename appended once.
    pub fn app_base_url(&self, domain: &str) -> String {
        let domain = domain.trim().trim_end_matches('/');
        if domain.ends_with(&self.app_basename) {
            domain.to_string()
        } else {
            format!("{domain}{}", self.app_basename)
        }
    }
}

/// `diya-ed/` and `/diya-ed` both become `/diya-ed`; an empty value means no basename.
fn normalize_basename(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Parses `10485760`, `512kb` or `10mb`.
fn parse_size(raw: &str) -> Option<usize> {
    let lower = raw.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(n) = lower.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix('b') {
        (n, 1)
    } else {
        (lower.as_str(), 1)
    };
    digits.trim().parse::<usize>().ok().map(|n| n * multiplier)
}
