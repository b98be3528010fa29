//! Per-link description handed to the VM subsystem.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vmlink_networking::{IpCidr, MacAddr};

use crate::links::LinkSnapshot;
use crate::netlink::HostLink;

/// Everything the VMM needs to attach one guest NIC.
///
/// Name and MTU are the original host link's, the MAC is the macvtap's, and
/// the addresses are those captured before they were stripped from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    name: String,
    mac_address: Option<MacAddr>,
    mtu: u32,
    addrs: Vec<IpCidr>,
    gateway: Option<Ipv4Addr>,
    tap_device: PathBuf,
}

impl NetworkDescriptor {
    pub fn new(
        link: &HostLink,
        macvtap: &HostLink,
        snapshot: LinkSnapshot,
        tap_device: PathBuf,
    ) -> Self {
        Self {
            name: link.name.clone(),
            mac_address: macvtap.mac,
            mtu: link.mtu,
            addrs: snapshot.addrs,
            gateway: snapshot.gateway,
            tap_device,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac_address(&self) -> Option<MacAddr> {
        self.mac_address
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn addrs(&self) -> &[IpCidr] {
        &self.addrs
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    pub fn tap_device(&self) -> &Path {
        &self.tap_device
    }
}
