//! vmlink network setup.
//!
//! Runs once in the container's network namespace before the guest VM
//! starts, and hands the namespace's links to the guest:
//!
//! ```text
//! veth/macvlan link ──strip addrs, down──▶ macvtap tapN (bridge) ──▶ /dev/tapN
//!                                                │
//!                                                └──▶ NetworkDescriptor
//! ```
//!
//! It also writes the guest's resolv.conf, accepting DNS proxy hostnames
//! only when they resolve into a local subnet.
//!
//! ## Modules
//!
//! - `links`: enumeration, snapshot and conversion pipeline
//! - `netlink`: link/address/route capability (`ip` backend and mock)
//! - `device`: macvtap character device nodes
//! - `descriptor`: per-link output for the VM subsystem
//! - `dns`: resolv.conf rendering and proxy hostname validation

pub mod config;
pub mod descriptor;
pub mod device;
pub mod dns;
pub mod error;
pub mod links;
pub mod logging;
pub mod netlink;

pub use config::{Config, DnsConfig};
pub use descriptor::NetworkDescriptor;
pub use error::{Operation, SetupError};
pub use links::{LinkSetup, TapCounter};
