//! net-setup: prepares a container network namespace for a guest VM.
//!
//! Runs once, before the VM starts:
//! - Guest resolv.conf generation
//! - veth/macvlan to macvtap conversion
//! - Descriptor handoff to the VM subsystem
//!
//! Configuration comes from `VMLINK_*` environment variables.

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use vmlink_net_setup::device::{SysfsDevices, TapPaths};
use vmlink_net_setup::dns::{ProxyResolver, ResolvConfWriter, SystemMounts};
use vmlink_net_setup::netlink::IpCommand;
use vmlink_net_setup::{logging, Config, LinkSetup, NetworkDescriptor, TapCounter};

/// Version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = logging::init(&config.log_path) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(1);
    }

    info!(version = VERSION, "net-setup starting");

    match run(&config).await {
        Ok(count) => {
            info!(networks = count, "net-setup finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "net-setup failed");
            for cause in e.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            ExitCode::from(1)
        }
    }
}

async fn run(config: &Config) -> Result<usize> {
    let dns = config.load_dns()?;

    // Resolve DNS proxies first: converting the links strips the very
    // addresses the local subnet check relies on.
    let proxy = ProxyResolver::system().with_timeout(config.dns_timeout);
    ResolvConfWriter::new(&config.resolv_conf, Arc::new(SystemMounts), proxy)
        .write(&dns)
        .await
        .context("failed to write resolv.conf")?;

    let setup = LinkSetup::new(
        Arc::new(IpCommand::new()),
        Arc::new(SysfsDevices),
        TapPaths::new(&config.sysfs_root, &config.dev_root),
    );
    let mut counter = TapCounter::new();
    let networks = setup
        .run(&mut counter)
        .await
        .context("failed to set up guest networks")?;

    write_descriptors(&config.descriptors_out, &networks)?;
    info!(
        path = %config.descriptors_out.display(),
        count = networks.len(),
        "network descriptors written"
    );

    Ok(networks.len())
}

fn write_descriptors(path: &Path, networks: &[NetworkDescriptor]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(networks)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
