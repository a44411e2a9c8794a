use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

use crate::{
    connection::{ConnectionSettings, ReconnectConfig},
    query::{QueryOptions, RetryPolicy},
    transport::TransportKind,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";
const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub base_url: String,
    pub socket_url: Option<String>,
    pub auth_token: Option<String>,
    pub transports: Vec<TransportKind>,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub reconnect_delay_max_ms: u64,
    pub query_stale_time_ms: u64,
    pub query_gc_time_ms: u64,
    pub query_retry: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            socket_url: None,
            auth_token: None,
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            reconnect_delay_max_ms: 5000,
            query_stale_time_ms: 0,
            query_gc_time_ms: 5 * 60 * 1000,
            query_retry: 3,
        }
    }
}

impl Settings {
    /// REST root; every backend route lives under `/api`.
    pub fn api_url(&self) -> String {
        format!("{}/api", self.base_url.trim_end_matches('/'))
    }

    /// Socket endpoint base; falls back to the REST host.
    pub fn socket_base_url(&self) -> &str {
        self.socket_url.as_deref().unwrap_or(&self.base_url)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            base_url: self.socket_base_url().to_string(),
            transports: self.transports.clone(),
            reconnect: ReconnectConfig {
                max_attempts: self.max_reconnect_attempts,
                initial_delay: Duration::from_millis(self.reconnect_delay_ms),
                max_delay: Duration::from_millis(self.reconnect_delay_max_ms),
                ..ReconnectConfig::default()
            },
        }
    }

    pub fn query_defaults(&self) -> QueryOptions {
        QueryOptions {
            stale_time: Duration::from_millis(self.query_stale_time_ms),
            gc_time: Duration::from_millis(self.query_gc_time_ms),
            retry: RetryPolicy {
                max_retries: self.query_retry,
                ..RetryPolicy::default()
            },
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Some(file_cfg) = read_settings_file(Path::new(SETTINGS_FILE)) {
        apply_overrides(&mut settings, |key| file_cfg.get(key).cloned());
    }
    apply_overrides(&mut settings, env_lookup);
    settings
}

fn read_settings_file(path: &Path) -> Option<HashMap<String, String>> {
    let raw = fs::read_to_string(path).ok()?;
    match toml::from_str::<HashMap<String, String>>(&raw) {
        Ok(cfg) => Some(cfg),
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring malformed settings file");
            None
        }
    }
}

/// Looks a key up as `UPPER_CASE`, then as `APP__UPPER_CASE`; the prefixed
/// form wins when both are set.
fn env_lookup(key: &str) -> Option<String> {
    let upper = key.to_ascii_uppercase();
    std::env::var(format!("APP__{upper}"))
        .ok()
        .or_else(|| std::env::var(&upper).ok())
}

pub(crate) fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("api_base_url").or_else(|| lookup("base_url")) {
        if !v.trim().is_empty() {
            settings.base_url = v.trim().trim_end_matches('/').to_string();
        }
    }
    if let Some(v) = lookup("socket_url") {
        if !v.trim().is_empty() {
            settings.socket_url = Some(v.trim().trim_end_matches('/').to_string());
        }
    }
    if let Some(v) = lookup("auth_token") {
        settings.auth_token = Some(v);
    }
    if let Some(v) = lookup("transports") {
        let parsed: Vec<TransportKind> = v
            .split(',')
            .filter_map(|raw| {
                let kind = TransportKind::parse(raw);
                if kind.is_none() {
                    warn!(transport = raw.trim(), "ignoring unknown transport");
                }
                kind
            })
            .collect();
        if !parsed.is_empty() {
            settings.transports = parsed;
        }
    }
    parse_into(&lookup, "max_reconnect_attempts", &mut settings.max_reconnect_attempts);
    parse_into(&lookup, "reconnect_delay_ms", &mut settings.reconnect_delay_ms);
    parse_into(&lookup, "reconnect_delay_max_ms", &mut settings.reconnect_delay_max_ms);
    parse_into(&lookup, "query_stale_time_ms", &mut settings.query_stale_time_ms);
    parse_into(&lookup, "query_gc_time_ms", &mut settings.query_gc_time_ms);
    parse_into(&lookup, "query_retry", &mut settings.query_retry);
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = raw.as_str(), "ignoring unparsable setting"),
    }
}
