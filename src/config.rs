use anyhow::{bail, Context, Result};
use std::env;

use crate::models::Frequency;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub channel_layer: ChannelLayerConfig,
    pub email: EmailConfig,
    pub digest: DigestConfig,
    pub retry: RetryConfig,
    pub websocket: WebsocketConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerBackend {
    InProcess,
    Redis,
}

#[derive(Debug, Clone)]
pub struct ChannelLayerConfig {
    pub backend: LayerBackend,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: i64,
}

impl ChannelLayerConfig {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db)
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub primary_endpoint: String,
    pub primary_api_key: String,
    pub primary_timeout_s: u64,
    pub from_address: String,
    pub from_name: String,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub tls: bool,
}

#[derive(Debug, Clone)]
pub struct DigestConfig {
    pub enabled_frequencies: Vec<Frequency>,
    pub hourly_tick_secs: u64,
    pub daily_tick_secs: u64,
    pub weekly_tick_secs: u64,
}

impl DigestConfig {
    pub fn tick_secs(&self, frequency: Frequency) -> u64 {
        match frequency {
            Frequency::Hourly => self.hourly_tick_secs,
            Frequency::Daily => self.daily_tick_secs,
            Frequency::Weekly => self.weekly_tick_secs,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_seconds: i64,
    pub max_attempts: i32,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    pub heartbeat_timeout_s: u64,
    pub auth_secret: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let backend = match env::var("CHANNEL_LAYER_BACKEND")
            .unwrap_or_else(|_| "inprocess".to_string())
            .as_str()
        {
            "inprocess" => LayerBackend::InProcess,
            "redis" => LayerBackend::Redis,
            other => bail!("unsupported CHANNEL_LAYER_BACKEND: {}", other),
        };

        let enabled_frequencies = env::var("DIGEST_FREQUENCIES")
            .unwrap_or_else(|_| "hourly,daily,weekly".to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim()
                    .parse::<Frequency>()
                    .map_err(anyhow::Error::msg)
                    .and_then(|f| match f {
                        Frequency::Hourly | Frequency::Daily | Frequency::Weekly => Ok(f),
                        other => bail!("{:?} is not a digest frequency", other),
                    })
            })
            .collect::<Result<Vec<_>>>()
            .context("invalid DIGEST_FREQUENCIES")?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            channel_layer: ChannelLayerConfig {
                backend,
                redis_host: env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                redis_port: env_or("REDIS_PORT", 6379),
                redis_db: env_or("REDIS_DB", 0),
            },
            email: EmailConfig {
                primary_endpoint: env::var("EMAIL_PRIMARY_ENDPOINT")
                    .unwrap_or_else(|_| "https://api.zeptomail.com/v1.1/email".to_string()),
                primary_api_key: env::var("EMAIL_PRIMARY_API_KEY")
                    .context("EMAIL_PRIMARY_API_KEY must be set")?,
                primary_timeout_s: env_or("EMAIL_PRIMARY_TIMEOUT_S", 30),
                from_address: env::var("EMAIL_FROM_ADDRESS")
                    .unwrap_or_else(|_| "no-reply@tunedrop.io".to_string()),
                from_name: env::var("EMAIL_FROM_NAME")
                    .unwrap_or_else(|_| "TuneDrop".to_string()),
                smtp: SmtpConfig {
                    host: env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
                    port: env_or("SMTP_PORT", 587),
                    user: env::var("SMTP_USER").unwrap_or_default(),
                    password: env::var("SMTP_PASSWORD").unwrap_or_default(),
                    tls: env::var("SMTP_TLS").map(|v| v == "true").unwrap_or(true),
                },
            },
            digest: DigestConfig {
                enabled_frequencies,
                hourly_tick_secs: env_or("DIGEST_HOURLY_TICK_SECS", 3600),
                daily_tick_secs: env_or("DIGEST_DAILY_TICK_SECS", 86400),
                weekly_tick_secs: env_or("DIGEST_WEEKLY_TICK_SECS", 7 * 86400),
            },
            retry: RetryConfig {
                base_seconds: env_or("RETRY_BASE_SECONDS", 60),
                max_attempts: env_or("RETRY_MAX_ATTEMPTS", 3),
                sweep_interval_secs: env_or("RETRY_SWEEP_INTERVAL_SECS", 60),
            },
            websocket: WebsocketConfig {
                heartbeat_timeout_s: env_or("WS_HEARTBEAT_TIMEOUT_S", 60),
                auth_secret: env::var("WS_AUTH_SECRET").context("WS_AUTH_SECRET must be set")?,
            },
        })
    }
}
