/// Service configuration module
/// Loads every runtime setting from the environment once at boot

use std::env;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

/// Managed backend (object storage + auth)
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_role_key: String,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_key: String,
    pub api_url: String,
    pub from: String,
    /// Pause between the mails of one batch, for the provider's rate limit.
    pub pacing_ms: u64,
}

/// Template rendering, PDF stamping and conversion
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    pub service_url: String,
    pub converter_bin: String,
    pub conversion_timeout_secs: u64,
    pub temp_dir: PathBuf,
    pub template_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EnedisConfig {
    pub token_url: String,
    pub api_base: String,
}

/// Retry policy of best-effort work run after a commit
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

/// Full service configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub port: u16,
    pub supabase: SupabaseConfig,
    pub mail: MailConfig,
    pub documents: DocumentConfig,
    pub enedis: EnedisConfig,
    pub post_commit: RetryConfig,
    pub backend_base_url: String,
    pub http_timeout_secs: u64,
    pub signed_url_ttl_secs: u64,
}

impl AppConfig {
    /// Load full service configuration
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup: &lookup };

        let database = DatabaseConfig {
            connection_string: vars.required("DATABASE_URL")?,
            max_connections: vars.ranged("DB_MAX_CONNECTIONS", 5, 1, 100)? as u32,
        };
        debug!(
            "Database configuration loaded: max_connections={}",
            database.max_connections
        );

        let port = vars.ranged("PORT", 10000, 1, u16::MAX as u64)? as u16;

        let supabase = SupabaseConfig {
            url: trim_slash(vars.required("SUPABASE_URL")?),
            service_role_key: vars.required("SUPABASE_SERVICE_ROLE_KEY")?,
        };

        let mail = MailConfig {
            api_key: vars.required("RESEND_API_KEY")?,
            api_url: trim_slash(vars.or("RESEND_API_URL", "https://api.resend.com")),
            from: vars.or("MAIL_FROM", "Kinjo <no-reply@notifications.kinjoenergies.com>"),
            pacing_ms: vars.ranged("MAIL_PACING_MS", 800, 0, 10_000)?,
        };

        let documents = DocumentConfig {
            service_url: trim_slash(vars.or("DOCUMENT_SERVICE_URL", "http://localhost:8090")),
            converter_bin: vars.or("CONVERTER_BIN", "libreoffice"),
            conversion_timeout_secs: vars.ranged("CONVERSION_TIMEOUT_SECS", 30, 1, 600)?,
            temp_dir: PathBuf::from(vars.or("TEMP_DIR", "/tmp/kinjo")),
            template_dir: PathBuf::from(vars.or("TEMPLATE_DIR", "docx-templates")),
        };

        let enedis = EnedisConfig {
            token_url: vars.or(
                "ENEDIS_TOKEN_URL",
                "https://ext.prod.api.enedis.fr/oauth2/v3/token",
            ),
            api_base: trim_slash(vars.or("ENEDIS_API_BASE", "https://gw.ext.prod.api.enedis.fr")),
        };

        let post_commit = RetryConfig {
            max_attempts: vars.ranged("POST_COMMIT_MAX_ATTEMPTS", 3, 1, 20)? as u32,
            backoff_base_secs: vars.ranged("POST_COMMIT_BACKOFF_BASE_SECS", 1, 1, 600)?,
            backoff_max_secs: vars.ranged("POST_COMMIT_BACKOFF_MAX_SECS", 30, 1, 600)?,
        };
        if post_commit.backoff_base_secs > post_commit.backoff_max_secs {
            return Err(ConfigError::InvalidConfig(
                "POST_COMMIT_BACKOFF_BASE_SECS must not exceed POST_COMMIT_BACKOFF_MAX_SECS"
                    .to_string(),
            ));
        }

        let config = AppConfig {
            database,
            port,
            supabase,
            mail,
            documents,
            enedis,
            post_commit,
            backend_base_url: trim_slash(vars.or("BACKEND_BASE_URL", "http://localhost:10000")),
            http_timeout_secs: vars.ranged("HTTP_TIMEOUT_SECS", 30, 1, 600)?,
            signed_url_ttl_secs: vars.ranged("SIGNED_URL_TTL", 300, 1, 86_400)?,
        };

        info!(
            "Service configuration loaded: port={}, conversion_timeout={}s, http_timeout={}s, post_commit_attempts={}",
            config.port,
            config.documents.conversion_timeout_secs,
            config.http_timeout_secs,
            config.post_commit.max_attempts
        );

        Ok(config)
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn ranged(&self, key: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
        let value = match self.get(key) {
            None => default,
            Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
                ConfigError::InvalidConfig(format!("Invalid {}: {} ({})", key, raw, e))
            })?,
        };
        if value < min || value > max {
            return Err(ConfigError::InvalidConfig(format!(
                "{} must be between {} and {}",
                key, min, max
            )));
        }
        Ok(value)
    }
}

fn trim_slash(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
