use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use url::Url;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    /// Overrides `host`/`port` when set.
    pub api_base_url: Option<String>,
    pub session_file: Option<PathBuf>,
    pub request_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            api_base_url: None,
            session_file: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn resolved_api_base_url(&self) -> Result<String> {
        match self.api_base_url.as_deref() {
            Some(raw) => normalize_base_url(raw),
            None => api_base_url_from_parts(&self.host, self.port),
        }
    }
}

/// Reads `client.toml` from the working directory, then applies environment
/// overrides.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        apply_file_overrides(&mut settings, &raw);
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("host").and_then(toml::Value::as_str) {
        settings.host = v.to_string();
    }
    if let Some(v) = file_cfg.get("port").and_then(toml::Value::as_integer) {
        if let Ok(port) = u16::try_from(v) {
            settings.port = port;
        }
    }
    if let Some(v) = file_cfg.get("api_base_url").and_then(toml::Value::as_str) {
        settings.api_base_url = Some(v.to_string());
    }
    if let Some(v) = file_cfg.get("session_file").and_then(toml::Value::as_str) {
        settings.session_file = Some(PathBuf::from(v));
    }
    if let Some(v) = file_cfg
        .get("request_timeout_secs")
        .and_then(toml::Value::as_integer)
    {
        if let Ok(secs) = u64::try_from(v) {
            settings.request_timeout_secs = secs;
        }
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("QOLER_HOST") {
        settings.host = v;
    }
    if let Some(v) = var("APP__HOST") {
        settings.host = v;
    }

    for key in ["QOLER_PORT", "APP__PORT"] {
        if let Some(port) = var(key).and_then(|v| v.parse::<u16>().ok()) {
            settings.port = port;
        }
    }

    if let Some(v) = var("QOLER_API_BASE_URL") {
        settings.api_base_url = Some(v);
    }
    if let Some(v) = var("APP__API_BASE_URL") {
        settings.api_base_url = Some(v);
    }

    if let Some(v) = var("QOLER_SESSION_FILE") {
        settings.session_file = Some(PathBuf::from(v));
    }

    if let Some(secs) = var("APP__REQUEST_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
        settings.request_timeout_secs = secs;
    }
}

/// Builds the REST base URL for a server host and port. `host` may already
/// carry a scheme (`https://chat.example`); plain hosts default to `http`.
pub fn api_base_url_from_parts(host: &str, port: u16) -> Result<String> {
    let host = host.trim().trim_end_matches('/');
    if host.is_empty() {
        return Err(anyhow!("server host must not be empty"));
    }
    let with_scheme = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    };
    let mut url = Url::parse(&with_scheme)
        .with_context(|| format!("invalid server host '{host}'"))?;
    url.set_port(Some(port))
        .map_err(|_| anyhow!("server host '{host}' cannot carry a port"))?;
    normalize_base_url(url.as_str())
}

/// Canonical form used everywhere a base URL is stored: scheme present,
/// default ports elided, no trailing slash.
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow!("api base url must not be empty"));
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let url = Url::parse(&with_scheme).with_context(|| format!("invalid api base url '{raw}'"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("unsupported api base url scheme '{other}'")),
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
