use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Login,
    Edge,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Login => "login",
            NodeRole::Edge => "edge",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_role")]
    pub node_role: NodeRole,
    #[serde(default = "default_machine_id")]
    pub machine_id: String,
    /// Base URL of the login node; required when running as an edge.
    #[serde(default)]
    pub login_url: Option<String>,
    /// Base URL other nodes use to reach this one.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub node_secret: Option<String>,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub jwt_issuer: Option<String>,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_wing_sync_interval_secs")]
    pub wing_sync_interval_secs: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
    #[serde(default = "default_bandwidth_limit_bytes")]
    pub bandwidth_limit_bytes: u64,
    #[serde(default = "default_bandwidth_window_secs")]
    pub bandwidth_window_secs: u64,
    #[serde(default)]
    pub log_filter: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
            .unwrap_or_else(|_| AppConfig::default().normalize())
    }

    fn normalize(mut self) -> Self {
        self.database_url = Self::normalize_opt(self.database_url.take());
        self.login_url = Self::normalize_opt(self.login_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.public_url = Self::normalize_opt(self.public_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.node_secret = Self::normalize_opt(self.node_secret.take());
        self.jwt_secret = Self::normalize_opt(self.jwt_secret.take());
        self.jwt_issuer = Self::normalize_opt(self.jwt_issuer.take());
        self.log_filter = Self::normalize_opt(self.log_filter.take());
        if self.machine_id.trim().is_empty() {
            self.machine_id = default_machine_id();
        }
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn wing_sync_interval(&self) -> Duration {
        Duration::from_secs(self.wing_sync_interval_secs.max(1))
    }

    pub fn bandwidth_window(&self) -> Duration {
        Duration::from_secs(self.bandwidth_window_secs.max(1))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: None,
            node_role: default_role(),
            machine_id: default_machine_id(),
            login_url: None,
            public_url: None,
            node_secret: None,
            jwt_secret: None,
            jwt_issuer: None,
            write_timeout_ms: default_write_timeout_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            sync_interval_secs: default_sync_interval_secs(),
            wing_sync_interval_secs: default_wing_sync_interval_secs(),
            subscriber_buffer: default_subscriber_buffer(),
            event_log_capacity: default_event_log_capacity(),
            bandwidth_limit_bytes: default_bandwidth_limit_bytes(),
            bandwidth_window_secs: default_bandwidth_window_secs(),
            log_filter: None,
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_role() -> NodeRole {
    NodeRole::Login
}

fn default_machine_id() -> String {
    format!("relay-{:08x}", rand::random::<u32>())
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_dispatch_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_sync_interval_secs() -> u64 {
    10
}

fn default_wing_sync_interval_secs() -> u64 {
    60
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_event_log_capacity() -> usize {
    4_096
}

fn default_bandwidth_limit_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_bandwidth_window_secs() -> u64 {
    24 * 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn normalize_drops_blank_values() {
        let cfg = AppConfig {
            database_url: Some("   ".into()),
            login_url: Some("http://login.internal:8080/".into()),
            node_secret: Some("".into()),
            machine_id: " ".into(),
            ..AppConfig::default()
        }
        .normalize();
        assert!(cfg.database_url.is_none());
        assert!(cfg.node_secret.is_none());
        assert_eq!(cfg.login_url.as_deref(), Some("http://login.internal:8080"));
        assert!(cfg.machine_id.starts_with("relay-"));
    }

    #[test_timeout::timeout]
    fn defaults_are_login_with_bounded_deadlines() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.node_role, NodeRole::Login);
        assert_eq!(cfg.write_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
    }
}
