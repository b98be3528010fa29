//! Host link to guest NIC conversion.
//!
//! For every `veth`/`macvlan` link, in listing order:
//! 1. snapshot its addresses and first IPv4 gateway
//! 2. strip the addresses and take the link down
//! 3. create a bridge-mode macvtap `tap<N>` on top of it
//! 4. bring the macvtap up, then the link
//! 5. create the macvtap's character device node
//!
//! Any failure aborts the whole run; no descriptors are returned for a
//! partially converted namespace. Host state already mutated is left as is.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info};
use vmlink_networking::IpCidr;

use crate::descriptor::NetworkDescriptor;
use crate::device::{materialize_tap, DeviceNodes, TapPaths};
use crate::error::{OpContext, Operation, SetupError};
use crate::netlink::{HostLink, LinkState, MacvtapRequest, Netlink};

/// Hands out `tap0`, `tap1`, ... in the order links are accepted.
///
/// Names are only as stable as the kernel's link order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TapCounter {
    next: u32,
}

impl TapCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering at `next`.
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    /// Index the next name will use.
    pub fn peek(&self) -> u32 {
        self.next
    }

    /// Take the next device name.
    pub fn next_name(&mut self) -> String {
        let name = format!("tap{}", self.next);
        self.next += 1;
        name
    }
}

/// Link state captured before any mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    /// All addresses, any family, in kernel order.
    pub addrs: Vec<IpCidr>,

    /// Gateway of the first IPv4 route that has one.
    pub gateway: Option<Ipv4Addr>,
}

/// List links and keep the pass-through candidates, in kernel order.
pub async fn enumerate<N: Netlink + ?Sized>(netlink: &N) -> Result<Vec<HostLink>, SetupError> {
    let links = netlink
        .list_links()
        .await
        .op_context(Operation::ListLinks, "namespace")?;

    Ok(links
        .into_iter()
        .filter(|link| {
            let keep = link.is_passthrough_candidate();
            if !keep {
                debug!(link = %link.name, kind = ?link.kind, "skipping link");
            }
            keep
        })
        .collect())
}

/// Capture addresses and gateway of `link`.
///
/// A link without addresses is an error: there is nothing to hand over.
pub async fn snapshot<N: Netlink + ?Sized>(
    netlink: &N,
    link: &HostLink,
) -> Result<LinkSnapshot, SetupError> {
    let addrs = netlink
        .list_addrs(link)
        .await
        .op_context(Operation::ListAddrs, &link.name)?;
    if addrs.is_empty() {
        return Err(SetupError::NoAddresses {
            link: link.name.clone(),
        });
    }

    // First match, not lowest metric.
    let gateway = netlink
        .list_routes_v4(link)
        .await
        .op_context(Operation::ListRoutes, &link.name)?
        .into_iter()
        .find_map(|route| route.gateway);

    Ok(LinkSnapshot { addrs, gateway })
}

/// Strip `link` and attach a fresh macvtap to it. Returns the macvtap as
/// re-read from the kernel.
///
/// Order matters: the addresses must be gone before the macvtap exists, or
/// the guest would see host-routable state; the parent comes up last.
pub async fn transform<N: Netlink + ?Sized>(
    netlink: &N,
    link: &HostLink,
    snapshot: &LinkSnapshot,
    counter: &mut TapCounter,
) -> Result<HostLink, SetupError> {
    for addr in &snapshot.addrs {
        netlink
            .delete_addr(link, addr)
            .await
            .op_context(Operation::DeleteAddr, &link.name)?;
        debug!(link = %link.name, addr = %addr, "address deleted");
    }

    netlink
        .set_link_state(link, LinkState::Down)
        .await
        .op_context(Operation::SetLinkDown, &link.name)?;

    // Precondition: link is down with no addresses.
    let request = MacvtapRequest::bridge(counter.next_name(), link);
    netlink
        .add_macvtap(&request)
        .await
        .op_context(Operation::AddMacvtap, &request.name)?;

    // The kernel assigns the index and MAC.
    let macvtap = netlink
        .link_by_name(&request.name)
        .await
        .op_context(Operation::GetLink, &request.name)?;

    netlink
        .set_link_state(&macvtap, LinkState::Up)
        .await
        .op_context(Operation::SetLinkUp, &macvtap.name)?;
    netlink
        .set_link_state(link, LinkState::Up)
        .await
        .op_context(Operation::SetLinkUp, &link.name)?;

    Ok(macvtap)
}

/// Runs the conversion against a set of capabilities.
pub struct LinkSetup {
    netlink: Arc<dyn Netlink>,
    devices: Arc<dyn DeviceNodes>,
    paths: TapPaths,
}

impl LinkSetup {
    pub fn new(netlink: Arc<dyn Netlink>, devices: Arc<dyn DeviceNodes>, paths: TapPaths) -> Self {
        Self {
            netlink,
            devices,
            paths,
        }
    }

    /// Convert every pass-through candidate. All or nothing.
    pub async fn run(
        &self,
        counter: &mut TapCounter,
    ) -> Result<Vec<NetworkDescriptor>, SetupError> {
        let links = enumerate(self.netlink.as_ref()).await?;
        let mut networks = Vec::with_capacity(links.len());

        for link in &links {
            let snapshot = snapshot(self.netlink.as_ref(), link).await?;
            let macvtap = transform(self.netlink.as_ref(), link, &snapshot, counter).await?;
            let tap_device =
                materialize_tap(self.devices.as_ref(), &self.paths, &macvtap.name, macvtap.index)?;

            info!(
                link = %link.name,
                tap = %macvtap.name,
                addrs = snapshot.addrs.len(),
                gateway = ?snapshot.gateway,
                device = %tap_device.display(),
                "link handed to guest"
            );

            networks.push(NetworkDescriptor::new(link, &macvtap, snapshot, tap_device));
        }

        Ok(networks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::{MockNetlink, NetlinkCall, Route};

    fn veth(index: u32, name: &str) -> HostLink {
        HostLink {
            index,
            name: name.to_string(),
            mtu: 1500,
            kind: Some("veth".to_string()),
            mac: None,
        }
    }

    fn route(dst: &str, gateway: Option<[u8; 4]>) -> Route {
        Route {
            destination: Some(dst.to_string()),
            gateway: gateway.map(Ipv4Addr::from),
        }
    }

    #[test]
    fn test_tap_counter() {
        let mut counter = TapCounter::new();
        assert_eq!(counter.next_name(), "tap0");
        assert_eq!(counter.next_name(), "tap1");
        assert_eq!(counter.peek(), 2);

        let mut counter = TapCounter::starting_at(5);
        assert_eq!(counter.next_name(), "tap5");
    }

    #[tokio::test]
    async fn test_snapshot_first_gateway_wins() {
        let netlink = MockNetlink::new().with_link(
            veth(2, "eth0"),
            vec!["10.0.0.2/24".parse().unwrap()],
            vec![
                route("10.0.0.0/24", None),
                route("10.1.0.0/16", Some([10, 0, 0, 254])),
                route("default", Some([10, 0, 0, 1])),
            ],
        );

        let snap = snapshot(&netlink, &veth(2, "eth0")).await.unwrap();
        assert_eq!(snap.gateway, Some(Ipv4Addr::new(10, 0, 0, 254)));
    }

    #[tokio::test]
    async fn test_snapshot_without_gateway() {
        let netlink = MockNetlink::new().with_link(
            veth(2, "eth0"),
            vec!["10.0.0.2/24".parse().unwrap()],
            vec![route("10.0.0.0/24", None)],
        );

        let snap = snapshot(&netlink, &veth(2, "eth0")).await.unwrap();
        assert_eq!(snap.gateway, None);
    }

    #[tokio::test]
    async fn test_snapshot_no_addresses() {
        let netlink = MockNetlink::new().with_link(veth(2, "eth0"), vec![], vec![]);

        let err = snapshot(&netlink, &veth(2, "eth0")).await.unwrap_err();
        assert!(matches!(err, SetupError::NoAddresses { ref link } if link == "eth0"));
        // Routes are never consulted
        assert_eq!(
            netlink.calls(),
            vec![NetlinkCall::ListAddrs("eth0".to_string())]
        );
    }

    #[tokio::test]
    async fn test_transform_step_order() {
        let link = veth(2, "eth0");
        let a1: IpCidr = "10.0.0.2/24".parse().unwrap();
        let a2: IpCidr = "fd00::2/64".parse().unwrap();
        let netlink = MockNetlink::new().with_link(link.clone(), vec![a1, a2], vec![]);
        let snap = LinkSnapshot {
            addrs: vec![a1, a2],
            gateway: None,
        };
        let mut counter = TapCounter::new();

        let macvtap = transform(&netlink, &link, &snap, &mut counter).await.unwrap();

        assert_eq!(macvtap.name, "tap0");
        assert_eq!(
            netlink.calls(),
            vec![
                NetlinkCall::DeleteAddr("eth0".to_string(), a1),
                NetlinkCall::DeleteAddr("eth0".to_string(), a2),
                NetlinkCall::SetLinkState("eth0".to_string(), LinkState::Down),
                NetlinkCall::AddMacvtap(MacvtapRequest::bridge("tap0", &link)),
                NetlinkCall::LinkByName("tap0".to_string()),
                NetlinkCall::SetLinkState("tap0".to_string(), LinkState::Up),
                NetlinkCall::SetLinkState("eth0".to_string(), LinkState::Up),
            ]
        );
        assert_eq!(netlink.addrs_of("eth0"), Some(vec![]));
        assert_eq!(netlink.parent_of("tap0"), Some(2));
        assert_eq!(netlink.state_of("tap0"), Some(LinkState::Up));
        assert_eq!(counter.peek(), 1);
    }

    #[tokio::test]
    async fn test_transform_stops_on_failure() {
        let link = veth(2, "eth0");
        let addr: IpCidr = "10.0.0.2/24".parse().unwrap();
        let netlink = MockNetlink::new()
            .with_link(link.clone(), vec![addr], vec![])
            .failing_when(|call| matches!(call, NetlinkCall::SetLinkState(_, LinkState::Down)));
        let snap = LinkSnapshot {
            addrs: vec![addr],
            gateway: None,
        };

        let err = transform(&netlink, &link, &snap, &mut TapCounter::new())
            .await
            .unwrap_err();

        assert_eq!(err.operation(), Some(Operation::SetLinkDown));
        assert!(!netlink
            .calls()
            .iter()
            .any(|c| matches!(c, NetlinkCall::AddMacvtap(_))));
    }
}
