//! Process configuration, loaded once at startup from the environment.
//!
//! Every field here is named in spec §6's "Environment" table. A missing
//! required variable is a fatal startup error — there is no silent default
//! for a secret or a routing decision, only for genuinely optional knobs
//! like the broker password.

use std::collections::{HashMap, HashSet};

use crate::domain::Language;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("environment variable {0} has an invalid value: {1}")]
    Invalid(&'static str, String),
}

/// Everything the `serve`, `worker`, and `autoscale` roles need, read from
/// `.env` (via `dotenvy`) plus the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Accepted API keys (`API_KEY`, comma-separated for more than one
    /// tenant credential). Checked in constant time against whatever a
    /// client presents.
    pub api_keys: HashSet<String>,
    /// Symmetric secret the Token Service signs/verifies stream tokens with.
    pub jwt_key: Vec<u8>,
    /// HMAC key the rate limiter uses to key its per-API-key counters,
    /// distinct from `jwt_key` so rotating one never rotates the other.
    pub ratelimit_hmac_key: Vec<u8>,
    /// Origins the HTTP surface's CORS layer allows; `*` is permissive.
    pub allowed_origins: Vec<String>,
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_password: Option<String>,
    pub control_plane_url: String,
    pub control_plane_token: String,
    /// Control-plane app name hosting each language's worker machines.
    pub app_names: HashMap<Language, String>,
    pub bind_addr: std::net::SocketAddr,
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Loads and validates configuration from the environment. Call
    /// `dotenvy::dotenv()` before this if a `.env` file should be honored;
    /// `Config::from_env` itself only reads `std::env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_keys = require("API_KEY")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<HashSet<_>>();
        if api_keys.is_empty() {
            return Err(ConfigError::Invalid("API_KEY", "empty".to_string()));
        }

        let jwt_key = require("JWT_KEY")?.into_bytes();
        let ratelimit_hmac_key = optional("RATELIMIT_HMAC_KEY")
            .map(String::into_bytes)
            .unwrap_or_else(|| jwt_key.clone());

        let allowed_origins = require("ORIGINS")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        let broker_host = require("BROKER_HOST")?;
        let broker_port = require("BROKER_PORT")?
            .parse::<u16>()
            .map_err(|e| ConfigError::Invalid("BROKER_PORT", e.to_string()))?;
        let broker_password = optional("BROKER_PASSWORD");

        let control_plane_url = require("CONTROL_PLANE_URL")?;
        let control_plane_token = require("CONTROL_PLANE_TOKEN")?;

        let mut app_names = HashMap::new();
        for language in Language::ALL {
            let var = format!("APP_NAME_{}", language.tag().to_uppercase());
            let value = std::env::var(&var)
                .map_err(|_| ConfigError::Missing(Box::leak(var.into_boxed_str())))?;
            app_names.insert(language, value);
        }

        let bind_host = optional("BIND_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let bind_port = optional("PORT")
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| ConfigError::Invalid("PORT", e.to_string()))?
            .unwrap_or(8080);
        let bind_addr = format!("{bind_host}:{bind_port}")
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid("BIND_HOST", e.to_string()))?;

        Ok(Self {
            api_keys,
            jwt_key,
            ratelimit_hmac_key,
            allowed_origins,
            broker_host,
            broker_port,
            broker_password,
            control_plane_url,
            control_plane_token,
            app_names,
            bind_addr,
        })
    }

    /// `redis://[:password@]host:port` connection string for [`crate::broker::RedisBroker`].
    pub fn broker_url(&self) -> String {
        match &self.broker_password {
            Some(password) => format!(
                "redis://:{password}@{}:{}",
                self.broker_host, self.broker_port
            ),
            None => format!("redis://{}:{}", self.broker_host, self.broker_port),
        }
    }
}
