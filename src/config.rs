//! Startup configuration
//!
//! Everything is read from the environment once, in `main`. Missing
//! transport credentials abort startup; missing backend credentials only
//! disable the corresponding feature.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Credentials for the generation and speech backends
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub text_backend_url: String,
    pub replicate_api_token: Option<String>,
    pub wavespeed_api_token: Option<String>,
    pub elevenlabs_api_key: Option<String>,
}

/// Unit prices in gems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pricing {
    pub image: u64,
    pub video: u64,
    pub voice_note: u64,
    pub voice_call_per_minute: u64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            image: 10,
            video: 80,
            voice_note: 30,
            voice_call_per_minute: 50,
        }
    }
}

/// Knobs for the per-turn pipeline
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub daily_turn_quota: u32,
    pub max_message_len: usize,
    pub history_cap: usize,
    pub prompt_history_window: usize,
    pub reply_max_len: u32,
    pub included_artifact_limit: u32,
    pub first_artifact_threshold: u32,
    pub artifact_interval: u32,
    pub first_artifact_attempts: u32,
    pub fallback_offer_after_turns: u32,
    /// Probability that an eligible turn produces a fallback offer
    pub fallback_offer_chance: f64,
    pub pricing: Pricing,
    pub admin_user_id: Option<String>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            daily_turn_quota: 50,
            max_message_len: 1024,
            history_cap: 50,
            prompt_history_window: 5,
            reply_max_len: 100,
            included_artifact_limit: 12,
            first_artifact_threshold: 3,
            artifact_interval: 4,
            first_artifact_attempts: 3,
            fallback_offer_after_turns: 10,
            fallback_offer_chance: 0.25,
            pricing: Pricing::default(),
            admin_user_id: None,
        }
    }
}

/// Knobs for out-of-band job tracking
#[derive(Debug, Clone)]
pub struct FulfillmentConfig {
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub call_monitor_interval: Duration,
    pub call_failsafe_minutes: u64,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            poll_max_attempts: 60,
            call_monitor_interval: Duration::from_secs(30),
            call_failsafe_minutes: 60,
        }
    }
}

/// Session cache and durable retention
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub idle_eviction: Duration,
    pub durable_retention: chrono::Duration,
    pub sweep_interval: Duration,
    pub welcome_bonus: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            idle_eviction: Duration::from_secs(3600),
            durable_retention: chrono::Duration::days(7),
            sweep_interval: Duration::from_secs(600),
            welcome_bonus: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_url: String,
    pub gateway_token: String,
    pub db_path: String,
    pub port: u16,
    pub persona_catalog: Option<String>,
    pub backends: BackendConfig,
    pub turn: TurnConfig,
    pub fulfillment: FulfillmentConfig,
    pub retention: RetentionConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let gateway_url = required("CHAT_GATEWAY_URL")?;
        let gateway_token = required("CHAT_GATEWAY_TOKEN")?;

        let db_path = std::env::var("RELAY_DB_PATH").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.persona-relay/relay.db")
        });

        let port = match std::env::var("RELAY_PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "RELAY_PORT",
                value: raw,
            })?,
            Err(_) => 8081,
        };

        let backends = BackendConfig {
            text_backend_url: std::env::var("TEXT_BACKEND_URL")
                .unwrap_or_else(|_| "http://localhost:5001/api/v1/generate".to_string()),
            replicate_api_token: optional("REPLICATE_API_TOKEN"),
            wavespeed_api_token: optional("WAVESPEED_API_TOKEN"),
            elevenlabs_api_key: optional("ELEVENLABS_API_KEY"),
        };

        let turn = TurnConfig {
            admin_user_id: optional("RELAY_ADMIN_USER_ID"),
            daily_turn_quota: parse_or("RELAY_DAILY_TURN_QUOTA", 50)?,
            ..TurnConfig::default()
        };

        Ok(Self {
            gateway_url,
            gateway_token,
            db_path,
            port,
            persona_catalog: optional("RELAY_PERSONA_CATALOG"),
            backends,
            turn,
            fulfillment: FulfillmentConfig::default(),
            retention: RetentionConfig::default(),
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        Err(_) => Ok(default),
    }
}
