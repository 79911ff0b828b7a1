use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

const PLACEHOLDER_JWT_SECRET: &str = "change-this-in-production-immediately";

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub webauthn: WebAuthnConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Production posture: startup aborts on a missing or placeholder JWT secret.
    #[serde(default)]
    pub production: bool,
    /// Comma-separated allowed CORS origins; empty means allow-any (dev only).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub secret: String,
    /// Per-deployment salt for deriving the at-rest encryption key.
    #[serde(default = "default_encryption_salt")]
    pub encryption_salt: String,
    #[serde(default = "default_access_token_expire")]
    pub access_token_expire_minutes: u64,
    #[serde(default = "default_refresh_token_expire")]
    pub refresh_token_expire_days: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebAuthnConfig {
    #[serde(default = "default_rp_id")]
    pub rp_id: String,
    #[serde(default = "default_rp_name")]
    pub rp_name: String,
    #[serde(default = "default_rp_origin")]
    pub rp_origin: String,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8021
}

fn default_db_path() -> String {
    "data/foliogate.db".to_string()
}

// Legacy static salt kept so pre-existing encrypted rows stay readable.
fn default_encryption_salt() -> String {
    "foliogate_security_salt_v1".to_string()
}

fn default_access_token_expire() -> u64 {
    60 * 4 // 4 hours
}

fn default_refresh_token_expire() -> u64 {
    7 // 7 days
}

fn default_rp_id() -> String {
    "localhost".to_string()
}

fn default_rp_name() -> String {
    "Portfolio Admin".to_string()
}

fn default_rp_origin() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            production: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            encryption_salt: default_encryption_salt(),
            access_token_expire_minutes: default_access_token_expire(),
            refresh_token_expire_days: default_refresh_token_expire(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            jwt: JwtConfig::default(),
            webauthn: WebAuthnConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        config.ensure_jwt_secret()?;
        config.ensure_webauthn_defaults();
        tracing::info!(
            "WebAuthn config: rp_id={}, rp_origin={}, rp_name={}",
            config.webauthn.rp_id,
            config.webauthn.rp_origin,
            config.webauthn.rp_name
        );
        Ok(config)
    }

    /// Enforce the token-signing key policy.
    ///
    /// Production aborts startup on a missing or placeholder secret. Development
    /// falls back to an ephemeral random key, invalidating tokens on restart.
    fn ensure_jwt_secret(&mut self) -> anyhow::Result<()> {
        if self.jwt.secret.is_empty() || self.jwt.secret == PLACEHOLDER_JWT_SECRET {
            if self.server.production {
                anyhow::bail!(
                    "FATAL: jwt.secret must be set to a secure random value in production \
                     (set FG_CONF_JWT_SECRET or jwt.secret in the config file)"
                );
            }
            let mut raw = [0u8; 48];
            OsRng.fill_bytes(&mut raw);
            self.jwt.secret = general_purpose::URL_SAFE_NO_PAD.encode(raw);
            tracing::warn!(
                "WARNING: Using auto-generated JWT secret for development. \
                 All tokens become invalid on restart. Set jwt.secret in production!"
            );
        }
        Ok(())
    }

    /// Load configuration from config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["config.toml", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: FG_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(val) = env::var("FG_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = env::var("FG_CONF_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var("FG_CONF_SERVER_PRODUCTION") {
            if let Ok(v) = val.parse() {
                self.server.production = v;
            }
        }
        if let Ok(val) = env::var("FG_CONF_SERVER_CORS_ORIGINS") {
            self.server.cors_origins = val
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
        }

        // Database overrides
        if let Ok(val) = env::var("FG_CONF_DATABASE_PATH") {
            self.database.path = val;
        }

        // JWT overrides
        if let Ok(val) = env::var("FG_CONF_JWT_SECRET") {
            self.jwt.secret = val;
        }
        if let Ok(val) = env::var("FG_CONF_JWT_ENCRYPTION_SALT") {
            if !val.trim().is_empty() {
                self.jwt.encryption_salt = val;
            }
        }
        if let Ok(val) = env::var("FG_CONF_JWT_ACCESS_EXPIRE") {
            if let Ok(minutes) = val.parse() {
                self.jwt.access_token_expire_minutes = minutes;
            }
        }
        if let Ok(val) = env::var("FG_CONF_JWT_REFRESH_EXPIRE") {
            if let Ok(days) = val.parse() {
                self.jwt.refresh_token_expire_days = days;
            }
        }

        // WebAuthn overrides
        if let Ok(val) = env::var("FG_CONF_WEBAUTHN_RP_ID") {
            if !val.trim().is_empty() {
                self.webauthn.rp_id = val;
            }
        }
        if let Ok(val) = env::var("FG_CONF_WEBAUTHN_RP_NAME") {
            if !val.trim().is_empty() {
                self.webauthn.rp_name = val;
            }
        }
        if let Ok(val) = env::var("FG_CONF_WEBAUTHN_RP_ORIGIN") {
            if !val.trim().is_empty() {
                self.webauthn.rp_origin = val;
            }
        }
    }

    fn ensure_webauthn_defaults(&mut self) {
        if self.webauthn.rp_id.trim().is_empty() {
            self.webauthn.rp_id = default_rp_id();
        }
        if self.webauthn.rp_name.trim().is_empty() {
            self.webauthn.rp_name = default_rp_name();
        }
        if self.webauthn.rp_origin.trim().is_empty() {
            self.webauthn.rp_origin = default_rp_origin();
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Config for tests: random secret, default everything else.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        let mut config = Config::default();
        config.jwt.secret = "test-signing-secret-0123456789abcdef".to_string();
        config
    }
}
