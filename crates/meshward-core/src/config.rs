//! meshward.toml configuration for the server daemon and the client.
//!
//! Every field carries a serde default, so a partial file (or no file at
//! all) yields a usable configuration. `validate()` reports every problem
//! it finds rather than stopping at the first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Reachability probe backend used by the server scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// One ICMP echo via the system `ping` binary.
    #[default]
    Icmp,
    /// A TCP connect to `probe_port`.
    Tcp,
}

// ── Server ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Full probe cycle; every client is probed once per interval.
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub max_concurrent_probes: usize,
    pub probe: ProbeKind,
    /// Port used when `probe = "tcp"`.
    pub probe_port: u16,
    /// A client not seen for longer than this counts as stale.
    pub stale_after_secs: u64,
    /// How often deferred registry updates are flushed to disk.
    pub save_interval_secs: u64,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5418,
            ping_interval_secs: 30,
            ping_timeout_secs: 2,
            max_concurrent_probes: 5,
            probe: ProbeKind::Icmp,
            probe_port: 9993,
            stale_after_secs: 300,
            save_interval_secs: 30,
            data_dir: PathBuf::from("/var/lib/meshward"),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        load_toml(path)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.port == 0 {
            errors.push("port must be between 1 and 65535".to_string());
        }
        if self.host.trim().is_empty() {
            errors.push("host must not be empty".to_string());
        }
        if self.ping_interval_secs < 5 {
            errors.push(format!(
                "ping_interval_secs must be at least 5, got {}",
                self.ping_interval_secs
            ));
        }
        if !(1..=30).contains(&self.ping_timeout_secs) {
            errors.push(format!(
                "ping_timeout_secs must be between 1 and 30, got {}",
                self.ping_timeout_secs
            ));
        }
        if !(1..=100).contains(&self.max_concurrent_probes) {
            errors.push(format!(
                "max_concurrent_probes must be between 1 and 100, got {}",
                self.max_concurrent_probes
            ));
        }
        if self.probe == ProbeKind::Tcp && self.probe_port == 0 {
            errors.push("probe_port is required for tcp probes".to_string());
        }
        if self.stale_after_secs < 60 {
            errors.push(format!(
                "stale_after_secs must be at least 60, got {}",
                self.stale_after_secs
            ));
        }
        if self.save_interval_secs < 5 {
            errors.push(format!(
                "save_interval_secs must be at least 5, got {}",
                self.save_interval_secs
            ));
        }
        errors
    }
}

// ── Client ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the meshward server, e.g. `http://10.147.17.1:5418`.
    pub server_base: String,
    /// Identity reported to the server. Empty means "derive one".
    pub identity: String,
    /// This node's overlay address. Discovered from the route to the
    /// target when unset.
    pub overlay_address: Option<String>,
    /// Peer whose reachability drives auto-heal.
    pub target_address: String,
    pub auto_heal_enabled: bool,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    /// Consecutive failed probes before a remediation fires.
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    /// Upper bound for the backed-off cooldown.
    pub max_cooldown_secs: u64,
    /// Failed remediations in a row after which auto-heal stands down
    /// until the target answers again.
    pub max_failed_remediations: u32,
    pub step_timeout_secs: u64,
    /// Settle time inserted between remediation steps.
    pub step_pause_millis: u64,
    /// Candidate system service names for the overlay daemon.
    pub service_names: Vec<String>,
    /// Candidate paths for the overlay desktop application.
    pub app_paths: Vec<PathBuf>,
    /// Loopback port of the running heal loop's control endpoint.
    pub control_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_base: "http://127.0.0.1:5418".to_string(),
            identity: String::new(),
            overlay_address: None,
            target_address: String::new(),
            auto_heal_enabled: true,
            ping_interval_secs: 20,
            ping_timeout_secs: 3,
            failure_threshold: 3,
            cooldown_secs: 30,
            max_cooldown_secs: 300,
            max_failed_remediations: 5,
            step_timeout_secs: 30,
            step_pause_millis: 1000,
            service_names: vec![
                "zerotier-one".to_string(),
                "ZeroTierOneService".to_string(),
            ],
            app_paths: Vec::new(),
            control_port: 5419,
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        load_toml(path)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs.max(self.cooldown_secs))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn step_pause(&self) -> Duration {
        Duration::from_millis(self.step_pause_millis)
    }

    /// The identity to report: the configured one, else the host name,
    /// else the given fallback (usually the overlay address).
    pub fn resolved_identity(&self, fallback: &str) -> String {
        if !self.identity.trim().is_empty() {
            return self.identity.trim().to_string();
        }
        ["HOSTNAME", "COMPUTERNAME"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|name| !name.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.server_base.starts_with("http://") {
            errors.push(format!(
                "server_base must start with http://, got {:?}",
                self.server_base
            ));
        }
        if self.ping_interval_secs < 5 {
            errors.push(format!(
                "ping_interval_secs must be at least 5, got {}",
                self.ping_interval_secs
            ));
        }
        if !(1..=30).contains(&self.ping_timeout_secs) {
            errors.push(format!(
                "ping_timeout_secs must be between 1 and 30, got {}",
                self.ping_timeout_secs
            ));
        }
        if self.failure_threshold == 0 {
            errors.push("failure_threshold must be at least 1".to_string());
        }
        if self.max_failed_remediations == 0 {
            errors.push("max_failed_remediations must be at least 1".to_string());
        }
        if self.step_timeout_secs == 0 {
            errors.push("step_timeout_secs must be at least 1".to_string());
        }
        if self.control_port == 0 {
            errors.push("control_port must be between 1 and 65535".to_string());
        }
        errors
    }
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> ConfigResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Validate and reject with a single joined error.
pub fn ensure_valid(errors: Vec<String>) -> ConfigResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.port, 5418);
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
    }

    #[test]
    fn client_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.ping_interval(), Duration::from_secs(20));
        assert_eq!(config.failure_threshold, 3);
    }

    #[test]
    fn parse_partial_server_file() {
        let config: ServerConfig = toml::from_str(
            r#"
port = 8080
probe = "tcp"
max_concurrent_probes = 2
"#,
        )
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.probe, ProbeKind::Tcp);
        assert_eq!(config.max_concurrent_probes, 2);
        assert_eq!(config.ping_interval_secs, 30);
    }

    #[test]
    fn server_validation_collects_all_errors() {
        let config = ServerConfig {
            port: 0,
            ping_interval_secs: 1,
            ping_timeout_secs: 0,
            max_concurrent_probes: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate().len(), 4);
    }

    #[test]
    fn client_threshold_zero_rejected() {
        let config = ClientConfig {
            failure_threshold: 0,
            ..ClientConfig::default()
        };
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("failure_threshold"));
    }

    #[test]
    fn client_remediation_limit_and_control_port() {
        let config: ClientConfig = toml::from_str("max_failed_remediations = 2\n").unwrap();
        assert_eq!(config.max_failed_remediations, 2);
        assert_eq!(config.control_port, 5419);

        let config = ClientConfig {
            max_failed_remediations: 0,
            control_port: 0,
            ..ClientConfig::default()
        };
        assert_eq!(config.validate().len(), 2);
    }

    #[test]
    fn client_bad_server_base_rejected() {
        let config = ClientConfig {
            server_base: "10.0.0.1:5418".to_string(),
            ..ClientConfig::default()
        };
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn max_cooldown_never_below_cooldown() {
        let config = ClientConfig {
            cooldown_secs: 600,
            max_cooldown_secs: 60,
            ..ClientConfig::default()
        };
        assert_eq!(config.max_cooldown(), Duration::from_secs(600));
    }

    #[test]
    fn configured_identity_wins() {
        let config = ClientConfig {
            identity: " laptop ".to_string(),
            ..ClientConfig::default()
        };
        assert_eq!(config.resolved_identity("10.0.0.1"), "laptop");
    }

    #[test]
    fn from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshward.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        let err = ServerConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn ensure_valid_joins_errors() {
        let err = ensure_valid(vec!["a".to_string(), "b".to_string()]).unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: a; b");
    }
}
