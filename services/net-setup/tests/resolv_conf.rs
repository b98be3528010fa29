//! Integration tests for resolv.conf generation through the public API.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use tempfile::tempdir;
use vmlink_net_setup::dns::{LocalNetworks, Mounts, NameResolver, ProxyResolver, ResolvConfWriter};
use vmlink_net_setup::DnsConfig;
use vmlink_networking::IpCidr;

struct NeverMounted;

impl Mounts for NeverMounted {
    fn detach(&self, _path: &Path) -> io::Result<()> {
        Err(Errno::EINVAL.into())
    }
}

struct ProxyContainer;

#[async_trait]
impl NameResolver for ProxyContainer {
    async fn lookup_ip(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        match host {
            "dns-proxy" => Ok(vec!["10.88.0.53".parse().unwrap()]),
            "remote" => Ok(vec!["203.0.113.53".parse().unwrap()]),
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "unknown host")),
        }
    }
}

struct PodNetwork;

impl LocalNetworks for PodNetwork {
    fn interface_addrs(&self) -> io::Result<Vec<IpCidr>> {
        Ok(vec![
            "127.0.0.1/8".parse().unwrap(),
            "10.88.0.4/16".parse().unwrap(),
        ])
    }
}

fn writer(path: &Path) -> ResolvConfWriter {
    let proxy = ProxyResolver::new(Arc::new(ProxyContainer), Arc::new(PodNetwork));
    ResolvConfWriter::new(path, Arc::new(NeverMounted), proxy)
}

#[tokio::test]
async fn test_fresh_rootfs() {
    let root = tempdir().unwrap();
    let path = root.path().join("etc/resolv.conf");

    let dns = DnsConfig {
        preserve: false,
        options: "ndots:2".to_string(),
        search: "example.com".to_string(),
        server: vec!["dns-proxy".to_string(), "1.1.1.1".to_string()],
    };
    writer(&path).write(&dns).await.unwrap();

    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "# Generated by vmlink\n\
         options ndots:2\n\
         search example.com\n\
         nameserver 10.88.0.53\n\
         nameserver 1.1.1.1\n"
    );
    let mode = fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o444);

    let etc_mode = fs::metadata(root.path().join("etc")).unwrap().permissions().mode();
    assert!(etc_mode & 0o700 == 0o700);
}

#[tokio::test]
async fn test_remote_proxy_rejected() {
    let root = tempdir().unwrap();
    let path = root.path().join("etc/resolv.conf");

    let dns = DnsConfig {
        server: vec!["remote".to_string()],
        ..DnsConfig::default()
    };
    let err = writer(&path).write(&dns).await.unwrap_err();

    assert_eq!(err.reason_code(), "invalid_nameserver");
    assert!(!path.exists());
}
