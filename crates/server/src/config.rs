// Server configuration from environment variables.
//
//   QUILLSTREAM_HOST                bind host        (default 0.0.0.0)
//   QUILLSTREAM_PORT                bind port        (default 8080)
//   QUILLSTREAM_ADAPTER             axum | tungstenite | actix (default axum)
//   QUILLSTREAM_LOG_FILTER          tracing filter   (default info)
//   QUILLSTREAM_EVICT_IDLE          evict idle docs  (default false)
//   QUILLSTREAM_PERSIST_DEBOUNCE_MS persist debounce (default 2000)

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Axum,
    Tungstenite,
    Actix,
}

impl FromStr for AdapterKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "axum" => Ok(Self::Axum),
            "tungstenite" => Ok(Self::Tungstenite),
            "actix" => Ok(Self::Actix),
            other => bail!("unknown adapter '{other}' (expected axum, tungstenite, or actix)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub adapter: AdapterKind,
    pub log_filter: String,
    pub evict_idle: bool,
    pub persist_debounce: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_env_fn(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but with an injectable variable source, so
    /// tests never touch the process environment.
    pub fn from_env_fn(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = get("QUILLSTREAM_HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = match get("QUILLSTREAM_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid QUILLSTREAM_PORT '{raw}'"))?,
            None => 8080,
        };

        let adapter = match get("QUILLSTREAM_ADAPTER") {
            Some(raw) => raw.parse().context("invalid QUILLSTREAM_ADAPTER")?,
            None => AdapterKind::Axum,
        };

        let log_filter = get("QUILLSTREAM_LOG_FILTER").unwrap_or_else(|| "info".to_string());

        let evict_idle = match get("QUILLSTREAM_EVICT_IDLE") {
            Some(raw) => parse_bool(&raw)
                .with_context(|| format!("invalid QUILLSTREAM_EVICT_IDLE '{raw}'"))?,
            None => false,
        };

        let persist_debounce = match get("QUILLSTREAM_PERSIST_DEBOUNCE_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse::<u64>()
                    .with_context(|| format!("invalid QUILLSTREAM_PERSIST_DEBOUNCE_MS '{raw}'"))?,
            ),
            None => Duration::from_millis(2000),
        };

        Ok(Self { host, port, adapter, log_filter, evict_idle, persist_debounce })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}
