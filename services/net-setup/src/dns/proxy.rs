//! Nameserver hostname resolution.
//!
//! A nameserver given by name is assumed to be a DNS proxy container on the
//! same host or subnet. The name is only trusted when it resolves into a
//! locally attached, non-loopback IPv4 subnet, so a spoofed answer cannot
//! point the guest at an off-host resolver.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use tokio::time::timeout;
use tracing::{debug, warn};
use vmlink_networking::{netmask_to_prefix_len, IpCidr};

use crate::error::{OpContext, Operation, SetupError};

/// Budget for resolving a proxy hostname.
pub const PROXY_LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Hostname resolution.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Resolve `host`, in resolver order.
    async fn lookup_ip(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Addresses configured on local interfaces.
pub trait LocalNetworks: Send + Sync {
    fn interface_addrs(&self) -> io::Result<Vec<IpCidr>>;
}

/// The system resolver (getaddrinfo).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn lookup_ip(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

/// getifaddrs(3).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNetworks;

impl LocalNetworks for SystemNetworks {
    fn interface_addrs(&self) -> io::Result<Vec<IpCidr>> {
        let mut out = Vec::new();
        for ifa in getifaddrs().map_err(io::Error::from)? {
            let (Some(addr), Some(mask)) = (ifa.address, ifa.netmask) else {
                continue;
            };
            let cidr = if let (Some(a), Some(m)) = (addr.as_sockaddr_in(), mask.as_sockaddr_in()) {
                IpCidr::new(IpAddr::V4(a.ip()), netmask_to_prefix_len(m.ip()))
            } else if let (Some(a), Some(m)) = (addr.as_sockaddr_in6(), mask.as_sockaddr_in6()) {
                IpCidr::new(IpAddr::V6(a.ip()), u128::from(m.ip()).count_ones() as u8)
            } else {
                continue;
            };
            out.push(cidr.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?);
        }
        Ok(out)
    }
}

/// Resolves and validates nameserver hostnames.
#[derive(Clone)]
pub struct ProxyResolver {
    resolver: Arc<dyn NameResolver>,
    networks: Arc<dyn LocalNetworks>,
    timeout: Duration,
}

impl ProxyResolver {
    pub fn new(resolver: Arc<dyn NameResolver>, networks: Arc<dyn LocalNetworks>) -> Self {
        Self {
            resolver,
            networks,
            timeout: PROXY_LOOKUP_TIMEOUT,
        }
    }

    /// System resolver and interfaces.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemResolver), Arc::new(SystemNetworks))
    }

    /// Set the lookup budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve `host` and return the first address inside a local subnet.
    pub async fn proxy_ip(&self, host: &str) -> Result<Ipv4Addr, SetupError> {
        let candidates = timeout(self.timeout, self.resolver.lookup_ip(host))
            .await
            .map_err(|_| SetupError::ResolveTimeout {
                host: host.to_string(),
                timeout: self.timeout,
            })?
            .op_context(Operation::ResolveHost, host)?;

        for candidate in candidates {
            let Some(v4) = as_ipv4(candidate) else {
                debug!(host = %host, candidate = %candidate, "skipping non-IPv4 candidate");
                continue;
            };
            if self.is_local(v4)? {
                debug!(host = %host, ip = %v4, "nameserver proxy accepted");
                return Ok(v4);
            }
            warn!(host = %host, candidate = %v4, "candidate outside local subnets");
        }

        Err(SetupError::InvalidNameserver {
            host: host.to_string(),
        })
    }

    /// Whether `ip` lies in the subnet of a local non-loopback IPv4 address.
    fn is_local(&self, ip: Ipv4Addr) -> Result<bool, SetupError> {
        let local = self
            .networks
            .interface_addrs()
            .op_context(Operation::ListLocalAddrs, "local interfaces")?;

        Ok(local
            .iter()
            .filter(|cidr| !cidr.addr().is_loopback())
            .filter_map(IpCidr::ipv4_subnet)
            .any(|subnet| subnet.contains(ip)))
    }
}

/// IPv4 view of an address; IPv4-mapped IPv6 counts.
fn as_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}
