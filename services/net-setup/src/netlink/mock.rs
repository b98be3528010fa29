//! In-memory `Netlink` for tests and development.

use std::io;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use vmlink_networking::{IpCidr, MacAddr};

use super::{HostLink, LinkState, MacvtapRequest, Netlink, Route};

/// A call made against the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetlinkCall {
    ListLinks,
    ListAddrs(String),
    ListRoutes(String),
    DeleteAddr(String, IpCidr),
    SetLinkState(String, LinkState),
    AddMacvtap(MacvtapRequest),
    LinkByName(String),
}

type FailPredicate = Box<dyn Fn(&NetlinkCall) -> bool + Send + Sync>;

struct MockLink {
    link: HostLink,
    addrs: Vec<IpCidr>,
    routes: Vec<Route>,
    state: LinkState,
    parent: Option<u32>,
}

#[derive(Default)]
struct State {
    links: Vec<MockLink>,
    calls: Vec<NetlinkCall>,
}

/// Mock namespace. Links are listed in insertion order.
pub struct MockNetlink {
    state: Mutex<State>,
    fail_when: Option<FailPredicate>,
}

impl MockNetlink {
    /// Create an empty namespace.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            fail_when: None,
        }
    }

    /// Add a link with its addresses and routes. The link starts up.
    pub fn with_link(self, link: HostLink, addrs: Vec<IpCidr>, routes: Vec<Route>) -> Self {
        self.lock().links.push(MockLink {
            link,
            addrs,
            routes,
            state: LinkState::Up,
            parent: None,
        });
        self
    }

    /// Fail every call matching `predicate` with an I/O error.
    pub fn failing_when(
        mut self,
        predicate: impl Fn(&NetlinkCall) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    /// Calls made so far.
    pub fn calls(&self) -> Vec<NetlinkCall> {
        self.lock().calls.clone()
    }

    /// Current addresses of a link.
    pub fn addrs_of(&self, name: &str) -> Option<Vec<IpCidr>> {
        self.lock()
            .links
            .iter()
            .find(|l| l.link.name == name)
            .map(|l| l.addrs.clone())
    }

    /// Current administrative state of a link.
    pub fn state_of(&self, name: &str) -> Option<LinkState> {
        self.lock()
            .links
            .iter()
            .find(|l| l.link.name == name)
            .map(|l| l.state)
    }

    /// Parent index of a created macvtap.
    pub fn parent_of(&self, name: &str) -> Option<u32> {
        self.lock()
            .links
            .iter()
            .find(|l| l.link.name == name)
            .and_then(|l| l.parent)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a call, failing it if requested.
    fn record(&self, call: NetlinkCall) -> io::Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        let fail = self.fail_when.as_ref().is_some_and(|f| f(&call));
        state.calls.push(call.clone());
        if fail {
            return Err(io::Error::other(format!("injected failure: {:?}", call)));
        }
        Ok(state)
    }
}

impl Default for MockNetlink {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn find_mut(&mut self, name: &str) -> io::Result<&mut MockLink> {
        self.links
            .iter_mut()
            .find(|l| l.link.name == name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no link {}", name)))
    }
}

#[async_trait]
impl Netlink for MockNetlink {
    async fn list_links(&self) -> io::Result<Vec<HostLink>> {
        let state = self.record(NetlinkCall::ListLinks)?;
        Ok(state.links.iter().map(|l| l.link.clone()).collect())
    }

    async fn list_addrs(&self, link: &HostLink) -> io::Result<Vec<IpCidr>> {
        let mut state = self.record(NetlinkCall::ListAddrs(link.name.clone()))?;
        Ok(state.find_mut(&link.name)?.addrs.clone())
    }

    async fn list_routes_v4(&self, link: &HostLink) -> io::Result<Vec<Route>> {
        let mut state = self.record(NetlinkCall::ListRoutes(link.name.clone()))?;
        Ok(state.find_mut(&link.name)?.routes.clone())
    }

    async fn delete_addr(&self, link: &HostLink, addr: &IpCidr) -> io::Result<()> {
        let mut state = self.record(NetlinkCall::DeleteAddr(link.name.clone(), *addr))?;
        let entry = state.find_mut(&link.name)?;
        let pos = entry
            .addrs
            .iter()
            .position(|a| a == addr)
            .ok_or_else(|| io::Error::from_raw_os_error(99))?; // EADDRNOTAVAIL
        entry.addrs.remove(pos);
        // The kernel drops routes through an address-less link.
        if entry.addrs.is_empty() {
            entry.routes.clear();
        }
        Ok(())
    }

    async fn set_link_state(&self, link: &HostLink, state: LinkState) -> io::Result<()> {
        let mut guard = self.record(NetlinkCall::SetLinkState(link.name.clone(), state))?;
        guard.find_mut(&link.name)?.state = state;
        Ok(())
    }

    async fn add_macvtap(&self, request: &MacvtapRequest) -> io::Result<()> {
        let mut state = self.record(NetlinkCall::AddMacvtap(request.clone()))?;

        if state.links.iter().any(|l| l.link.name == request.name) {
            return Err(io::Error::from_raw_os_error(17)); // EEXIST
        }
        let parent_mtu = state
            .links
            .iter()
            .find(|l| l.link.index == request.parent_index)
            .map(|l| l.link.mtu)
            .ok_or_else(|| io::Error::from_raw_os_error(19))?; // ENODEV

        let index = state.links.iter().map(|l| l.link.index).max().unwrap_or(0) + 1;
        let low = index.to_be_bytes();
        let mac = MacAddr::new([0x02, 0x00, low[0], low[1], low[2], low[3]]);

        state.links.push(MockLink {
            link: HostLink {
                index,
                name: request.name.clone(),
                mtu: parent_mtu,
                kind: Some("macvtap".to_string()),
                mac: Some(mac),
            },
            addrs: Vec::new(),
            routes: Vec::new(),
            state: LinkState::Down,
            parent: Some(request.parent_index),
        });
        Ok(())
    }

    async fn link_by_name(&self, name: &str) -> io::Result<HostLink> {
        let mut state = self.record(NetlinkCall::LinkByName(name.to_string()))?;
        Ok(state.find_mut(name)?.link.clone())
    }
}
