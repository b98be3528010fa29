//! `Netlink` backed by the iproute2 `ip` binary.
//!
//! Listings use `-j` JSON output; mutations are plain `ip` invocations.

use std::io;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;
use vmlink_networking::IpCidr;

use super::{HostLink, LinkState, MacvtapRequest, Netlink, Route};

/// `ip` command runner.
#[derive(Debug, Clone)]
pub struct IpCommand {
    program: String,
}

impl IpCommand {
    pub fn new() -> Self {
        Self {
            program: "ip".to_string(),
        }
    }

    /// Use a specific `ip` binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run `ip` and return its stdout.
    async fn run(&self, args: &[&str]) -> io::Result<Vec<u8>> {
        debug!(args = %args.join(" "), "running ip");

        let output = Command::new(&self.program).args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::other(format!(
                "ip {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }

    async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> io::Result<T> {
        let stdout = self.run(args).await?;
        parse_json(&stdout)
    }
}

impl Default for IpCommand {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Netlink for IpCommand {
    async fn list_links(&self) -> io::Result<Vec<HostLink>> {
        let links: Vec<IpLink> = self.run_json(&["-d", "-j", "link", "show"]).await?;
        Ok(links.into_iter().map(HostLink::from).collect())
    }

    async fn list_addrs(&self, link: &HostLink) -> io::Result<Vec<IpCidr>> {
        let entries: Vec<IpAddrEntry> = self
            .run_json(&["-j", "addr", "show", "dev", &link.name])
            .await?;
        entries
            .into_iter()
            .flat_map(|entry| entry.addr_info)
            .map(|info| info.to_cidr())
            .collect()
    }

    async fn list_routes_v4(&self, link: &HostLink) -> io::Result<Vec<Route>> {
        let routes: Vec<IpRoute> = self
            .run_json(&["-4", "-j", "route", "show", "dev", &link.name])
            .await?;
        Ok(routes.into_iter().map(Route::from).collect())
    }

    async fn delete_addr(&self, link: &HostLink, addr: &IpCidr) -> io::Result<()> {
        let cidr = addr.to_string();
        self.run(&["addr", "del", &cidr, "dev", &link.name]).await?;
        Ok(())
    }

    async fn set_link_state(&self, link: &HostLink, state: LinkState) -> io::Result<()> {
        self.run(&["link", "set", "dev", &link.name, state.as_str()])
            .await?;
        Ok(())
    }

    async fn add_macvtap(&self, request: &MacvtapRequest) -> io::Result<()> {
        self.run(&[
            "link",
            "add",
            "link",
            &request.parent_name,
            "name",
            &request.name,
            "type",
            "macvtap",
            "mode",
            request.mode.as_str(),
        ])
        .await?;
        Ok(())
    }

    async fn link_by_name(&self, name: &str) -> io::Result<HostLink> {
        let links: Vec<IpLink> = self
            .run_json(&["-d", "-j", "link", "show", "dev", name])
            .await?;
        links
            .into_iter()
            .next()
            .map(HostLink::from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no link {}", name)))
    }
}

fn parse_json<T: DeserializeOwned>(bytes: &[u8]) -> io::Result<T> {
    serde_json::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// =============================================================================
// `ip -j` output
// =============================================================================

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

impl From<IpLink> for HostLink {
    fn from(link: IpLink) -> Self {
        HostLink {
            index: link.ifindex,
            name: link.ifname,
            mtu: link.mtu,
            kind: link.linkinfo.and_then(|info| info.info_kind),
            // Tunnels report IPv4 "addresses" here; those are not MACs.
            mac: link.address.and_then(|a| a.parse().ok()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: String,
    prefixlen: u8,
}

impl IpAddrInfo {
    fn to_cidr(&self) -> io::Result<IpCidr> {
        let addr = self
            .local
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        IpCidr::new(addr, self.prefixlen).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    #[serde(default)]
    dst: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
}

impl From<IpRoute> for Route {
    fn from(route: IpRoute) -> Self {
        Route {
            destination: route.dst,
            gateway: route.gateway.and_then(|gw| gw.parse::<Ipv4Addr>().ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_links() {
        let json = br#"[
            {"ifindex":1,"ifname":"lo","flags":["LOOPBACK","UP"],"mtu":65536,
             "link_type":"loopback","address":"00:00:00:00:00:00"},
            {"ifindex":7,"ifname":"eth0","link_index":8,"mtu":1450,
             "address":"02:42:ac:11:00:02","linkinfo":{"info_kind":"veth"}},
            {"ifindex":9,"ifname":"tunl0","mtu":1480,"address":"0.0.0.0",
             "linkinfo":{"info_kind":"ipip","info_data":{}}}
        ]"#;

        let links: Vec<IpLink> = parse_json(json).unwrap();
        let links: Vec<HostLink> = links.into_iter().map(HostLink::from).collect();

        assert_eq!(links.len(), 3);
        assert_eq!(links[0].kind, None);
        assert_eq!(links[1].name, "eth0");
        assert_eq!(links[1].index, 7);
        assert_eq!(links[1].mtu, 1450);
        assert_eq!(links[1].kind.as_deref(), Some("veth"));
        assert_eq!(links[1].mac.unwrap().to_string(), "02:42:ac:11:00:02");
        assert!(links[2].mac.is_none());
    }

    #[test]
    fn test_parse_addrs() {
        let json = br#"[{"ifindex":7,"ifname":"eth0","addr_info":[
            {"family":"inet","local":"172.17.0.2","prefixlen":16,"scope":"global"},
            {"family":"inet6","local":"fe80::42:acff:fe11:2","prefixlen":64,"scope":"link"}
        ]}]"#;

        let entries: Vec<IpAddrEntry> = parse_json(json).unwrap();
        let addrs: Vec<IpCidr> = entries
            .into_iter()
            .flat_map(|e| e.addr_info)
            .map(|i| i.to_cidr().unwrap())
            .collect();

        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].to_string(), "172.17.0.2/16");
        assert_eq!(addrs[1].to_string(), "fe80::42:acff:fe11:2/64");
    }

    #[test]
    fn test_parse_routes() {
        let json = br#"[
            {"dst":"default","gateway":"172.17.0.1","flags":[]},
            {"dst":"172.17.0.0/16","protocol":"kernel","scope":"link","prefsrc":"172.17.0.2","flags":[]}
        ]"#;

        let routes: Vec<IpRoute> = parse_json(json).unwrap();
        let routes: Vec<Route> = routes.into_iter().map(Route::from).collect();

        assert_eq!(routes[0].gateway, Some(Ipv4Addr::new(172, 17, 0, 1)));
        assert_eq!(routes[1].gateway, None);
        assert_eq!(routes[1].destination.as_deref(), Some("172.17.0.0/16"));
    }

    #[test]
    fn test_parse_garbage() {
        let err = parse_json::<Vec<IpLink>>(b"not json").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
