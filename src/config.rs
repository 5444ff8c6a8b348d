//! Environment-driven configuration.
//!
//! All options come from the process environment. The lookup is injectable
//! so tests never touch real environment variables.

use crate::transport::{parse_mqtt_url, MqttUrl};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;

const DEFAULT_TOPIC_PREFIX: &str = "eviqo";
const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
const DEFAULT_LOG_LEVEL: &str = "info";
/// Planned session recycle cadence; one day. `0` disables recycling.
const DEFAULT_WS_RECONNECT_INTERVAL_MS: u64 = 86_400_000;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub email: String,
    pub password: String,
    pub mqtt_url: MqttUrl,
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub poll_interval: Duration,
    pub log_level: String,
    /// `None` when planned session recycling is disabled.
    pub ws_reconnect_interval: Option<Duration>,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let email = required(lookup, "EVIQO_EMAIL")?;
        let password = required(lookup, "EVIQO_PASSWORD")?;
        let mqtt_url_raw = required(lookup, "EVIQO_MQTT_URL")?;
        let mqtt_url = parse_mqtt_url(&mqtt_url_raw, lookup)
            .with_context(|| format!("EVIQO_MQTT_URL {:?}", mqtt_url_raw))?;

        let topic_prefix = lookup("EVIQO_TOPIC_PREFIX")
            .filter(|prefix| !prefix.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string());
        let discovery_prefix = lookup("HASS_DISCOVERY_PREFIX")
            .filter(|prefix| !prefix.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string());

        let poll_interval_ms =
            millis_option(lookup, "EVIQO_POLL_INTERVAL", DEFAULT_POLL_INTERVAL_MS)?;
        if poll_interval_ms == 0 {
            return Err(anyhow!("EVIQO_POLL_INTERVAL must be > 0"));
        }
        let recycle_ms = millis_option(
            lookup,
            "EVIQO_WS_RECONNECT_INTERVAL",
            DEFAULT_WS_RECONNECT_INTERVAL_MS,
        )?;

        let log_level = lookup("EVIQO_LOG_LEVEL")
            .filter(|level| !level.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Ok(Self {
            email,
            password,
            mqtt_url,
            topic_prefix,
            discovery_prefix,
            poll_interval: Duration::from_millis(poll_interval_ms),
            log_level,
            ws_reconnect_interval: match recycle_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        })
    }
}

fn required(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("{} is required", key))
}

fn millis_option(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{} must be an integer of milliseconds, got {:?}", key, raw)),
    }
}
