use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Deadline for a subscribe/unsubscribe acknowledgement.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Buffer of the broadcast channel carrying book, trade and error events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub lbank: LbankConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LbankConfig {
    #[serde(default = "default_lbank_url")]
    pub base_url: String,
    #[serde(default = "default_wait_after_connect_ms")]
    pub wait_after_connect_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiConfig {
    #[serde(default = "default_gemini_url")]
    pub base_url: String,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_lbank_url() -> String {
    "wss://api.lbank.info/ws".to_string()
}

fn default_wait_after_connect_ms() -> u64 {
    1000
}

fn default_gemini_url() -> String {
    "wss://api.gemini.com/v1/marketdata/".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            event_capacity: default_event_capacity(),
            lbank: LbankConfig::default(),
            gemini: GeminiConfig::default(),
        }
    }
}

impl Default for LbankConfig {
    fn default() -> Self {
        Self {
            base_url: default_lbank_url(),
            wait_after_connect_ms: default_wait_after_connect_ms(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: default_gemini_url(),
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        let mut cfg = Self::parse(&data)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses TOML with either a nested `[book_sync]` table or top-level keys.
    pub fn parse(data: &str) -> Result<Self> {
        let raw: toml::Value = toml::from_str(data).with_context(|| "Failed to parse TOML config")?;
        let value = match raw.get("book_sync") {
            Some(nested) if nested.is_table() => nested.clone(),
            _ => raw,
        };
        let cfg: SyncConfig = value
            .try_into()
            .map_err(|err| anyhow::anyhow!("Invalid book_sync config structure: {err}"))?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        // Each field can be overridden by `BOOK_SYNC_*` env vars.
        override_u64("BOOK_SYNC_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        override_usize("BOOK_SYNC_EVENT_CAPACITY", &mut self.event_capacity);
        override_string("BOOK_SYNC_LBANK_URL", &mut self.lbank.base_url);
        override_u64(
            "BOOK_SYNC_LBANK_WAIT_AFTER_CONNECT_MS",
            &mut self.lbank.wait_after_connect_ms,
        );
        override_string("BOOK_SYNC_GEMINI_URL", &mut self.gemini.base_url);
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.request_timeout_ms > 0,
            "request_timeout_ms must be greater than zero"
        );
        anyhow::ensure!(
            self.event_capacity > 0,
            "event_capacity must be greater than zero"
        );
        ensure_ws_url("lbank.base_url", &self.lbank.base_url)?;
        ensure_ws_url("gemini.base_url", &self.gemini.base_url)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn ensure_ws_url(field: &str, value: &str) -> Result<()> {
    let url = Url::parse(value).with_context(|| format!("{field} is not a valid URL"))?;
    anyhow::ensure!(
        matches!(url.scheme(), "ws" | "wss"),
        "{field} must use a ws or wss scheme"
    );
    Ok(())
}

fn override_u64(key: &str, field: &mut u64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u64>() {
            *field = parsed;
        }
    }
}

fn override_usize(key: &str, field: &mut usize) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<usize>() {
            *field = parsed;
        }
    }
}

fn override_string(key: &str, field: &mut String) {
    if let Ok(value) = env::var(key) {
        if !value.trim().is_empty() {
            *field = value;
        }
    }
}
