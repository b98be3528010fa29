//! Configuration for network setup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::dns::{PROXY_LOOKUP_TIMEOUT, RESOLV_CONF_PATH};

/// Guest DNS settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DnsConfig {
    /// Leave the existing resolv.conf untouched; other fields are ignored.
    #[serde(default)]
    pub preserve: bool,

    /// Value of the `options` line.
    #[serde(default)]
    pub options: String,

    /// Value of the `search` line.
    #[serde(default)]
    pub search: String,

    /// Nameservers, IP literals or DNS proxy hostnames.
    #[serde(default)]
    pub server: Vec<String>,
}

impl DnsConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read DNS config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse DNS config {}", path.display()))
    }
}

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// JSON file with the guest's [`DnsConfig`].
    pub dns_config_path: Option<PathBuf>,

    /// Resolver config to generate.
    pub resolv_conf: PathBuf,

    /// Where the descriptor set is written for the VM subsystem.
    pub descriptors_out: PathBuf,

    /// Log file.
    pub log_path: PathBuf,

    /// sysfs mount point.
    pub sysfs_root: PathBuf,

    /// Directory tap nodes are created in.
    pub dev_root: PathBuf,

    /// Budget for resolving nameserver hostnames.
    pub dns_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = |key: &str, default: &str| {
            var(key).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default))
        };

        let dns_timeout = match var("VMLINK_DNS_TIMEOUT_MS") {
            Some(ms) => ms
                .trim()
                .parse()
                .map(Duration::from_millis)
                .with_context(|| format!("invalid VMLINK_DNS_TIMEOUT_MS {ms:?}"))?,
            None => PROXY_LOOKUP_TIMEOUT,
        };

        Ok(Self {
            dns_config_path: var("VMLINK_DNS_CONFIG").map(PathBuf::from),
            resolv_conf: path("VMLINK_RESOLV_CONF", RESOLV_CONF_PATH),
            descriptors_out: path("VMLINK_DESCRIPTORS_OUT", "/run/vmlink/networks.json"),
            log_path: path("VMLINK_LOG_PATH", "/run/vmlink/net-setup.log"),
            sysfs_root: path("VMLINK_SYSFS_ROOT", "/sys"),
            dev_root: path("VMLINK_DEV_ROOT", "/dev"),
            dns_timeout,
        })
    }

    /// The guest DNS settings, defaulting when no file is configured.
    pub fn load_dns(&self) -> Result<DnsConfig> {
        match &self.dns_config_path {
            Some(path) => DnsConfig::load(path),
            None => Ok(DnsConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.resolv_conf, PathBuf::from("/etc/resolv.conf"));
        assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
        assert_eq!(config.dev_root, PathBuf::from("/dev"));
        assert_eq!(config.dns_timeout, Duration::from_secs(1));
        assert!(config.dns_config_path.is_none());
        assert_eq!(config.load_dns().unwrap(), DnsConfig::default());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VMLINK_RESOLV_CONF", "/tmp/resolv.conf"),
            ("VMLINK_DNS_TIMEOUT_MS", "250"),
            ("VMLINK_DEV_ROOT", "/tmp/dev"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.resolv_conf, PathBuf::from("/tmp/resolv.conf"));
        assert_eq!(config.dev_root, PathBuf::from("/tmp/dev"));
        assert_eq!(config.dns_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_bad_timeout_is_rejected() {
        let err = Config::from_lookup(|k| {
            (k == "VMLINK_DNS_TIMEOUT_MS").then(|| "1s".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("VMLINK_DNS_TIMEOUT_MS"));
    }

    #[test]
    fn test_dns_config_deserialization() {
        let json = r#"{
            "options": "ndots:2",
            "search": "example.com",
            "server": ["10.0.0.1", "dns-proxy"]
        }"#;

        let dns: DnsConfig = serde_json::from_str(json).unwrap();
        assert!(!dns.preserve);
        assert_eq!(dns.options, "ndots:2");
        assert_eq!(dns.server, vec!["10.0.0.1", "dns-proxy"]);

        let dns: DnsConfig = serde_json::from_str(r#"{"preserve": true}"#).unwrap();
        assert!(dns.preserve);
        assert!(dns.server.is_empty());
    }

    #[test]
    fn test_load_dns_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("dns.json");
        fs::write(&file, r#"{"server": ["1.1.1.1"]}"#).unwrap();

        let config = Config {
            dns_config_path: Some(file),
            ..Config::from_lookup(|_| None).unwrap()
        };
        assert_eq!(config.load_dns().unwrap().server, vec!["1.1.1.1"]);
    }

    #[test]
    fn test_load_dns_bad_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("dns.json");
        fs::write(&file, "{").unwrap();

        let err = DnsConfig::load(&file).unwrap_err();
        assert!(err.to_string().contains("failed to parse DNS config"));
    }
}
