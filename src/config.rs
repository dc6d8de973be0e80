use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Server configuration, read from an optional TOML file.
/// Secrets are never part of the file, see [`Secrets`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub otp: OtpConfig,
    pub auth: AuthConfig,
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtpConfig {
    /// Seconds an issued OTP stays valid
    pub ttl_secs: i64,
    /// Wrong submissions allowed before the challenge is burned
    pub max_attempts: i64,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_attempts: 3,
        }
    }
}

impl OtpConfig {
    pub fn ttl(&self) -> time::Duration {
        time::Duration::seconds(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_ttl_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { token_ttl_hours: 24 }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> time::Duration {
        time::Duration::hours(self.token_ttl_hours)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// SMTP relay host. Without one, mail is only written to the log.
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub from: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_port: 25,
            smtp_username: None,
            from: "LMS <no-reply@lms.local>".to_string(),
        }
    }
}

impl Config {
    /// Load the config file if given, falling back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            info!("no config file given, using defaults");
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }
}

/// Values read from the environment (a `.env` file is honoured).
#[derive(Clone)]
pub struct Secrets {
    pub jwt_secret: String,
    pub smtp_password: Option<String>,
    pub admin: Option<(String, String)>,
}

impl Secrets {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let jwt_secret = dotenvy::var("JWT_SECRET").context("JWT_SECRET is not set")?;
        let smtp_password = dotenvy::var("SMTP_PASSWORD").ok();
        let admin = match (dotenvy::var("ADMIN_EMAIL"), dotenvy::var("ADMIN_PASSWORD")) {
            (Ok(email), Ok(password)) => Some((email, password)),
            _ => None,
        };
        Ok(Self {
            jwt_secret,
            smtp_password,
            admin,
        })
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secrets([REDACTED])")
    }
}
