//! Configuration for the cluster service.
//!
//! Every section has defaults matching what a single replica running under
//! Kubernetes needs, so a TOML file only has to name the values that differ.

use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::error::{ClusterError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub kubernetes: KubernetesConfig,
    pub feed: FeedConfig,
    pub lease: LeaseConfig,
}

impl ClusterConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ClusterError::config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClusterError::config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kubernetes.my_pod_name.is_empty() {
            return Err(ClusterError::config("kubernetes.my_pod_name must be set"));
        }
        if self.lease.session_ttl_ms < 1000 {
            return Err(ClusterError::config(
                "lease.session_ttl_ms must be at least one second",
            ));
        }
        if self.lease.app_name.is_empty() {
            return Err(ClusterError::config("lease.app_name must be set"));
        }
        if self.feed.min_backoff_ms == 0 || self.feed.min_backoff_ms > self.feed.max_backoff_ms {
            return Err(ClusterError::config(
                "feed.min_backoff_ms must be non-zero and not exceed feed.max_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Where this replica runs and which pods count as its peers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub my_pod_name: String,
    pub my_pod_ip: String,
    pub namespace: String,
    pub label_selector: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            my_pod_name: String::new(),
            my_pod_ip: String::new(),
            namespace: "default".to_string(),
            label_selector: String::new(),
            connect_timeout_ms: 10_000,
            read_timeout_ms: 290_000,
        }
    }
}

impl KubernetesConfig {
    /// Fills in pod identity from the downward API environment variables.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(name) = std::env::var("MY_POD_NAME") {
            self.my_pod_name = name;
        }
        if let Ok(ip) = std::env::var("MY_POD_IP") {
            self.my_pod_ip = ip;
        }
        if let Ok(namespace) = std::env::var("MY_POD_NAMESPACE") {
            self.namespace = namespace;
        }
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Reconnect behaviour of the membership feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long the watch may keep failing before the outage is logged as an error.
    pub escalation_threshold_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 100,
            max_backoff_ms: 5_000,
            escalation_threshold_ms: 60_000,
        }
    }
}

impl FeedConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn escalation_threshold(&self) -> Duration {
        Duration::from_millis(self.escalation_threshold_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Namespaces lease keys as `/leases/{app_name}/{lease_name}`.
    pub app_name: String,
    pub endpoints: Vec<String>,
    pub session_ttl_ms: u64,
    /// Zero means a third of the session TTL.
    pub keep_alive_interval_ms: u64,
    pub grant_attempts: usize,
    pub grant_retry_delay_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            app_name: "app".to_string(),
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            session_ttl_ms: 15_000,
            keep_alive_interval_ms: 0,
            grant_attempts: 5,
            grant_retry_delay_ms: 500,
        }
    }
}

impl LeaseConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        if self.keep_alive_interval_ms == 0 {
            self.session_ttl() / 3
        } else {
            Duration::from_millis(self.keep_alive_interval_ms)
        }
    }

    pub fn grant_retry_delay(&self) -> Duration {
        Duration::from_millis(self.grant_retry_delay_ms)
    }

    pub fn lease_key(&self, lease_name: &str) -> String {
        format!("/leases/{}/{}", self.app_name, lease_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config = ClusterConfig::from_toml_str(
            r#"
            [kubernetes]
            my_pod_name = "newswriter-6c4d9d49-mvm75"
            label_selector = "app=newswriter"

            [lease]
            app_name = "newswriter"
            session_ttl_ms = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.kubernetes.namespace, "default");
        assert_eq!(config.kubernetes.label_selector, "app=newswriter");
        assert_eq!(config.feed.min_backoff(), Duration::from_millis(100));
        assert_eq!(config.feed.max_backoff(), Duration::from_secs(5));
        assert_eq!(config.feed.escalation_threshold(), Duration::from_secs(60));
        assert_eq!(config.lease.keep_alive_interval(), Duration::from_secs(3));
        assert_eq!(config.lease.lease_key("r1"), "/leases/newswriter/r1");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_missing_pod_name() {
        let config = ClusterConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ClusterError::Config { .. })
        ));
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let mut config = ClusterConfig::default();
        config.kubernetes.my_pod_name = "a".to_string();
        config.feed.min_backoff_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(ClusterConfig::from_toml_str("[lease\napp_name = 1").is_err());
    }
}
