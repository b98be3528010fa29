//! Guest resolver configuration.
//!
//! Renders resolv.conf from a [`DnsConfig`] and replaces whatever is at the
//! target path, including a bind mount left by the container runtime.

pub mod proxy;

use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{self, Write};
use std::net::IpAddr;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use tracing::{debug, info};

use crate::config::DnsConfig;
use crate::error::{OpContext, Operation, SetupError};

pub use proxy::{
    LocalNetworks, NameResolver, ProxyResolver, SystemNetworks, SystemResolver,
    PROXY_LOOKUP_TIMEOUT,
};

/// Default resolver config path.
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// First line of every generated file.
pub const RESOLV_CONF_HEADER: &str = "# Generated by vmlink";

/// Final mode of the generated file.
pub const RESOLV_CONF_MODE: u32 = 0o444;

/// Mount table operations.
pub trait Mounts: Send + Sync {
    /// Lazily detach whatever is mounted at `path`.
    fn detach(&self, path: &Path) -> io::Result<()>;
}

/// umount2(2) with MNT_DETACH.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounts;

impl Mounts for SystemMounts {
    fn detach(&self, path: &Path) -> io::Result<()> {
        umount2(path, MntFlags::MNT_DETACH).map_err(io::Error::from)
    }
}

/// Whether a failed unmount just means nothing was mounted at the path.
fn is_not_mounted(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::EINVAL) | Some(Errno::ENOENT)
    )
}

/// Render resolv.conf. Hostname servers go through `proxy`.
pub async fn render(dns: &DnsConfig, proxy: &ProxyResolver) -> Result<String, SetupError> {
    let mut content = format!("{}\n", RESOLV_CONF_HEADER);
    if !dns.options.is_empty() {
        content.push_str(&format!("options {}\n", dns.options));
    }
    if !dns.search.is_empty() {
        content.push_str(&format!("search {}\n", dns.search));
    }

    for server in &dns.server {
        let ip = match server.parse::<IpAddr>() {
            Ok(ip) => ip.to_canonical(),
            Err(_) => IpAddr::V4(proxy.proxy_ip(server).await?),
        };
        content.push_str(&format!("nameserver {}\n", ip));
    }

    Ok(content)
}

/// Writes the guest's resolv.conf.
pub struct ResolvConfWriter {
    path: PathBuf,
    mounts: Arc<dyn Mounts>,
    proxy: ProxyResolver,
}

impl ResolvConfWriter {
    pub fn new(path: impl Into<PathBuf>, mounts: Arc<dyn Mounts>, proxy: ProxyResolver) -> Self {
        Self {
            path: path.into(),
            mounts,
            proxy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write resolv.conf for `dns`. Does nothing when `dns.preserve` is set.
    pub async fn write(&self, dns: &DnsConfig) -> Result<(), SetupError> {
        if dns.preserve {
            debug!(path = %self.path.display(), "preserving existing resolv.conf");
            return Ok(());
        }

        let content = render(dns, &self.proxy).await?;
        self.replace(&content)?;

        info!(
            path = %self.path.display(),
            servers = dns.server.len(),
            "resolv.conf written"
        );
        Ok(())
    }

    fn replace(&self, content: &str) -> Result<(), SetupError> {
        let subject = self.path.display().to_string();

        match self.mounts.detach(&self.path) {
            Ok(()) => debug!(path = %subject, "detached mount"),
            Err(e) if is_not_mounted(&e) => {
                if let Some(parent) = self.path.parent() {
                    DirBuilder::new()
                        .recursive(true)
                        .mode(0o755)
                        .create(parent)
                        .op_context(Operation::CreateDir, &parent.display().to_string())?;
                }
            }
            Err(e) => return Err(SetupError::op(Operation::Unmount, subject, e)),
        }

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(RESOLV_CONF_MODE)
            .open(&self.path)
            .and_then(|mut file| file.write_all(content.as_bytes()))
            .op_context(Operation::WriteFile, &subject)?;

        // The open mode only applies when the file is created.
        fs::set_permissions(&self.path, Permissions::from_mode(RESOLV_CONF_MODE))
            .op_context(Operation::SetPermissions, &subject)?;

        Ok(())
    }
}
