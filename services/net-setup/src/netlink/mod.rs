//! Link, address and route capability.
//!
//! The pipeline only talks to the kernel through the [`Netlink`] trait:
//! - `IpCommand` drives the iproute2 `ip` binary with JSON output
//! - `MockNetlink` keeps an in-memory namespace for tests

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use vmlink_networking::{IpCidr, MacAddr};

mod ip;
mod mock;

pub use ip::IpCommand;
pub use mock::{MockNetlink, NetlinkCall};

/// Link kinds whose ownership can be handed to a guest.
pub const PASSTHROUGH_KINDS: &[&str] = &["veth", "macvlan"];

/// A link in the host namespace, as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLink {
    /// Interface index.
    pub index: u32,

    /// Interface name.
    pub name: String,

    /// MTU.
    pub mtu: u32,

    /// Link kind from IFLA_INFO_KIND (`veth`, `macvlan`, ...). `None` for
    /// physical devices and loopback.
    pub kind: Option<String>,

    /// Hardware address.
    pub mac: Option<MacAddr>,
}

impl HostLink {
    /// Whether this link can be converted into a macvtap for the guest.
    pub fn is_passthrough_candidate(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|kind| PASSTHROUGH_KINDS.contains(&kind))
    }
}

/// An IPv4 route attached to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination (`default` or a CIDR), as reported.
    pub destination: Option<String>,

    /// Next hop.
    pub gateway: Option<Ipv4Addr>,
}

/// Administrative link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Down => "down",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// macvlan/macvtap forwarding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacvlanMode {
    Private,
    Vepa,
    Bridge,
    Passthru,
}

impl MacvlanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MacvlanMode::Private => "private",
            MacvlanMode::Vepa => "vepa",
            MacvlanMode::Bridge => "bridge",
            MacvlanMode::Passthru => "passthru",
        }
    }
}

/// Request to create a macvtap on top of a parent link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacvtapRequest {
    /// Requested name (`tap<N>`).
    pub name: String,

    /// Parent interface index.
    pub parent_index: u32,

    /// Parent interface name, for backends that address links by name.
    pub parent_name: String,

    /// Forwarding mode.
    pub mode: MacvlanMode,
}

impl MacvtapRequest {
    /// Bridge-mode macvtap on `parent`.
    pub fn bridge(name: impl Into<String>, parent: &HostLink) -> Self {
        Self {
            name: name.into(),
            parent_index: parent.index,
            parent_name: parent.name.clone(),
            mode: MacvlanMode::Bridge,
        }
    }
}

/// Kernel network object operations used by the pipeline.
#[async_trait]
pub trait Netlink: Send + Sync {
    /// List every link in the namespace, in kernel order.
    async fn list_links(&self) -> io::Result<Vec<HostLink>>;

    /// List addresses of any family assigned to `link`.
    async fn list_addrs(&self, link: &HostLink) -> io::Result<Vec<IpCidr>>;

    /// List IPv4 routes going through `link`.
    async fn list_routes_v4(&self, link: &HostLink) -> io::Result<Vec<Route>>;

    /// Remove one address from `link`.
    async fn delete_addr(&self, link: &HostLink, addr: &IpCidr) -> io::Result<()>;

    /// Set `link` administratively up or down.
    async fn set_link_state(&self, link: &HostLink, state: LinkState) -> io::Result<()>;

    /// Create a macvtap link.
    async fn add_macvtap(&self, request: &MacvtapRequest) -> io::Result<()>;

    /// Fetch a link by name.
    async fn link_by_name(&self, name: &str) -> io::Result<HostLink>;
}
