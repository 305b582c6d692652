use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::core::{BackoffPolicy, DEFAULT_TOMBSTONE_CAPACITY, WebSocketBufferConfig};

/// Tunables for one `SyncContext`.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Primary push-channel URL; `None` leaves the caller to pass one to `connect`.
    pub url: Option<String>,
    /// Tried in order after the primary fails.
    pub fallback_urls: Vec<String>,
    pub heartbeat_timeout: Duration,
    pub handshake_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub buffers: WebSocketBufferConfig,
    pub coalesce_window: Duration,
    pub change_capacity: usize,
    /// Per-key cap on inbound events held behind a pending mutation.
    pub mutation_buffer: usize,
    /// Deleted keys remembered for version gating; the oldest are forgotten past this.
    pub tombstone_capacity: usize,
    pub fallback_after: Duration,
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: None,
            fallback_urls: Vec::new(),
            heartbeat_timeout: Duration::from_secs(45),
            handshake_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default().with_jitter(true),
            buffers: WebSocketBufferConfig::default(),
            coalesce_window: Duration::from_millis(100),
            change_capacity: 1024,
            mutation_buffer: 64,
            tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
            fallback_after: Duration::from_secs(10),
            poll_interval: Duration::from_secs(15),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source; absent or unparseable values keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("CLINIC_SYNC_URL").filter(|url| !url.trim().is_empty()) {
            config.url = Some(url.trim().to_string());
        }
        if let Some(raw) = lookup("CLINIC_SYNC_FALLBACK_URLS") {
            config.fallback_urls = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CLINIC_SYNC_HEARTBEAT_TIMEOUT_MS") {
            config.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CLINIC_SYNC_FALLBACK_AFTER_MS") {
            config.fallback_after = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CLINIC_SYNC_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CLINIC_SYNC_COALESCE_MS") {
            config.coalesce_window = Duration::from_millis(ms);
        }
        config
    }

    /// Primary URL followed by the fallbacks, duplicates removed.
    pub fn endpoints(&self, primary: Option<&str>) -> Vec<String> {
        let mut endpoints: Vec<String> = Vec::with_capacity(1 + self.fallback_urls.len());
        for url in primary
            .or(self.url.as_deref())
            .into_iter()
            .chain(self.fallback_urls.iter().map(String::as_str))
        {
            if !endpoints.iter().any(|known| known == url) {
                endpoints.push(url.to_string());
            }
        }
        endpoints
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn overrides_apply_and_garbage_keeps_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("CLINIC_SYNC_URL", "wss://sync.clinic.test/ws"),
            ("CLINIC_SYNC_FALLBACK_URLS", " wss://a.test/ws, ,wss://b.test/ws"),
            ("CLINIC_SYNC_POLL_INTERVAL_MS", "5000"),
            ("CLINIC_SYNC_HEARTBEAT_TIMEOUT_MS", "soon"),
        ]));
        assert_eq!(config.url.as_deref(), Some("wss://sync.clinic.test/ws"));
        assert_eq!(config.fallback_urls, vec!["wss://a.test/ws", "wss://b.test/ws"]);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(45));
        assert_eq!(config.coalesce_window, Duration::from_millis(100));
    }

    #[test]
    fn endpoints_put_primary_first_without_duplicates() {
        let config = SyncConfig {
            url: Some("wss://primary/ws".to_string()),
            fallback_urls: vec!["wss://backup/ws".to_string(), "wss://primary/ws".to_string()],
            ..SyncConfig::default()
        };
        assert_eq!(
            config.endpoints(None),
            vec!["wss://primary/ws".to_string(), "wss://backup/ws".to_string()]
        );
        assert_eq!(
            config.endpoints(Some("wss://override/ws")),
            vec![
                "wss://override/ws".to_string(),
                "wss://backup/ws".to_string(),
                "wss://primary/ws".to_string()
            ]
        );
    }
}
