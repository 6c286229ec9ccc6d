//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use intairact_core::DeviceId;
use serde::Deserialize;

/// Node configuration. File: ~/.config/intairact/config.toml or /etc/intairact/config.toml.
/// Env overrides: INTAIRACT_NAME, INTAIRACT_PORT, INTAIRACT_DISCOVERY_PORT.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Own identity announced to peers (default: random UUID).
    #[serde(default = "default_name")]
    pub name: String,
    /// Transport bind address (default 0.0.0.0).
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Transport TCP port; 0 lets the OS choose.
    #[serde(default)]
    pub port: u16,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
    /// A peer silent for this long is reported lost.
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
    /// Bound on outbound action/object calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_name() -> String {
    DeviceId::generate().as_str().to_string()
}
fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_announce_interval() -> u64 {
    4
}
fn default_peer_timeout() -> u64 {
    16
}
fn default_request_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: 0,
            discovery_port: default_discovery_port(),
            multicast_group: default_multicast_group(),
            announce_interval_secs: default_announce_interval(),
            peer_timeout_secs: default_peer_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Config {
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.name.clone())
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Loopback-only settings for tests and embedding: OS-assigned port on 127.0.0.1.
    pub fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("INTAIRACT_NAME") {
        if !s.trim().is_empty() {
            c.name = s.trim().to_string();
        }
    }
    if let Some(p) = var("INTAIRACT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.port = p;
    }
    if let Some(p) = var("INTAIRACT_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/intairact/config.toml"));
    }
    out.push(PathBuf::from("/etc/intairact/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    read_file(&path)
}

/// Parse a config file. Unreadable or invalid files are logged and ignored.
pub fn read_file(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.port, 0);
        assert_eq!(c.discovery_port, 45680);
        assert_eq!(c.multicast_group, Ipv4Addr::new(239, 255, 60, 61));
        assert_eq!(c.peer_timeout(), Duration::from_secs(16));
        assert!(!c.name.is_empty());
        assert_ne!(c.name, Config::default().name);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("name = \"kitchen\"\nport = 8080\n").unwrap();
        assert_eq!(c.name, "kitchen");
        assert_eq!(c.port, 8080);
        assert_eq!(c.announce_interval_secs, 4);
        assert_eq!(c.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides() {
        let c = apply_env(Config::local("a"), |key| match key {
            "INTAIRACT_NAME" => Some("b".into()),
            "INTAIRACT_PORT" => Some("9000".into()),
            "INTAIRACT_DISCOVERY_PORT" => Some("not a port".into()),
            _ => None,
        });
        assert_eq!(c.name, "b");
        assert_eq!(c.port, 9000);
        assert_eq!(c.discovery_port, 45680);
    }

    #[test]
    fn zero_durations_clamped() {
        let c = Config {
            request_timeout_secs: 0,
            ..Config::local("a")
        };
        assert_eq!(c.request_timeout(), Duration::from_secs(1));
    }
}
