//! Character device nodes for macvtap links.
//!
//! The kernel exports each macvtap's character device number under
//! `/sys/devices/virtual/net/<name>/tap<index>/dev` but does not create the
//! node in `/dev` for us. The VMM opens `/dev/<name>` to reach the queue.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use tracing::debug;

use crate::error::{OpContext, Operation, SetupError};

/// Permissions of created tap nodes (owner read/write).
pub const TAP_NODE_MODE: u32 = 0o600;

/// A `major:minor` device number pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNumber {
    pub major: u32,
    pub minor: u32,
}

impl FromStr for DeviceNumber {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid device number {:?}", s),
            )
        };
        let (major, minor) = s.trim().split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Device node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Char,
    Block,
}

/// Device number lookup and node creation.
pub trait DeviceNodes: Send + Sync {
    /// Read the `major:minor` pair exported at `export`.
    fn device_number(&self, export: &Path) -> io::Result<DeviceNumber>;

    /// Create a device node at `path`.
    fn make_node(&self, path: &Path, kind: NodeKind, mode: u32, dev: DeviceNumber)
        -> io::Result<()>;
}

/// Real sysfs + mknod(2).
#[derive(Debug, Clone, Copy, Default)]
pub struct SysfsDevices;

impl DeviceNodes for SysfsDevices {
    fn device_number(&self, export: &Path) -> io::Result<DeviceNumber> {
        fs::read_to_string(export)?.parse()
    }

    fn make_node(
        &self,
        path: &Path,
        kind: NodeKind,
        mode: u32,
        dev: DeviceNumber,
    ) -> io::Result<()> {
        let flag = match kind {
            NodeKind::Char => SFlag::S_IFCHR,
            NodeKind::Block => SFlag::S_IFBLK,
        };
        mknod(
            path,
            flag,
            Mode::from_bits_truncate(mode),
            makedev(u64::from(dev.major), u64::from(dev.minor)),
        )
        .map_err(io::Error::from)
    }
}

/// Roots for the sysfs export and the created nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapPaths {
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
}

impl TapPaths {
    pub fn new(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Sysfs file holding the macvtap's `major:minor`.
    pub fn export_path(&self, name: &str, index: u32) -> PathBuf {
        self.sysfs_root
            .join("devices/virtual/net")
            .join(name)
            .join(format!("tap{}", index))
            .join("dev")
    }

    /// Node path the VMM opens.
    pub fn node_path(&self, name: &str) -> PathBuf {
        self.dev_root.join(name)
    }
}

impl Default for TapPaths {
    fn default() -> Self {
        Self::new("/sys", "/dev")
    }
}

/// Create the character device for macvtap `name` (interface `index`).
///
/// Returns the node path. A missing export means the kernel did not create
/// the companion character device, which is not recoverable here.
pub fn materialize_tap<D: DeviceNodes + ?Sized>(
    devices: &D,
    paths: &TapPaths,
    name: &str,
    index: u32,
) -> Result<PathBuf, SetupError> {
    let export = paths.export_path(name, index);
    let dev = devices
        .device_number(&export)
        .op_context(Operation::ReadDeviceNumber, &export.display().to_string())?;

    let node = paths.node_path(name);
    devices
        .make_node(&node, NodeKind::Char, TAP_NODE_MODE, dev)
        .op_context(Operation::MakeDeviceNode, &node.display().to_string())?;

    debug!(tap = %name, node = %node.display(), dev = %dev, "tap device node created");

    Ok(node)
}

/// A node created through [`MockDeviceNodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedNode {
    pub path: PathBuf,
    pub kind: NodeKind,
    pub mode: u32,
    pub dev: DeviceNumber,
}

/// Mock device layer: hands out sequential minors on major 240.
#[derive(Debug, Default)]
pub struct MockDeviceNodes {
    missing_exports: bool,
    refuse_nodes: bool,
    reads: Mutex<Vec<PathBuf>>,
    created: Mutex<Vec<CreatedNode>>,
}

impl MockDeviceNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behave as if the kernel never exported the device numbers.
    pub fn without_exports() -> Self {
        Self {
            missing_exports: true,
            ..Self::default()
        }
    }

    /// Behave as if `mknod` were not permitted.
    pub fn refusing_nodes() -> Self {
        Self {
            refuse_nodes: true,
            ..Self::default()
        }
    }

    /// Export paths read so far.
    pub fn reads(&self) -> Vec<PathBuf> {
        self.reads.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Nodes created so far.
    pub fn created(&self) -> Vec<CreatedNode> {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DeviceNodes for MockDeviceNodes {
    fn device_number(&self, export: &Path) -> io::Result<DeviceNumber> {
        let mut reads = self.reads.lock().unwrap_or_else(|e| e.into_inner());
        reads.push(export.to_path_buf());
        if self.missing_exports {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", export.display()),
            ));
        }
        Ok(DeviceNumber {
            major: 240,
            minor: reads.len() as u32,
        })
    }

    fn make_node(
        &self,
        path: &Path,
        kind: NodeKind,
        mode: u32,
        dev: DeviceNumber,
    ) -> io::Result<()> {
        if self.refuse_nodes {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(CreatedNode {
                path: path.to_path_buf(),
                kind,
                mode,
                dev,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    #[case("240:1\n", 240, 1)]
    #[case("511:65535", 511, 65535)]
    #[case("  10:200  ", 10, 200)]
    fn test_device_number_parse(#[case] input: &str, #[case] major: u32, #[case] minor: u32) {
        let dev: DeviceNumber = input.parse().unwrap();
        assert_eq!(dev, DeviceNumber { major, minor });
    }

    #[rstest]
    #[case("")]
    #[case("240")]
    #[case("240:")]
    #[case("a:b")]
    #[case("240:1:2")]
    fn test_device_number_rejects(#[case] input: &str) {
        let err = input.parse::<DeviceNumber>().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_tap_paths() {
        let paths = TapPaths::default();
        assert_eq!(
            paths.export_path("tap0", 12),
            PathBuf::from("/sys/devices/virtual/net/tap0/tap12/dev")
        );
        assert_eq!(paths.node_path("tap0"), PathBuf::from("/dev/tap0"));
    }

    #[test]
    fn test_sysfs_device_number() {
        let dir = tempdir().unwrap();
        let paths = TapPaths::new(dir.path(), dir.path().join("dev"));
        let export = paths.export_path("tap1", 4);
        fs::create_dir_all(export.parent().unwrap()).unwrap();
        fs::write(&export, "237:3\n").unwrap();

        let dev = SysfsDevices.device_number(&export).unwrap();
        assert_eq!(dev.to_string(), "237:3");
    }

    #[test]
    fn test_materialize_tap() {
        let devices = MockDeviceNodes::new();
        let paths = TapPaths::new("/sys", "/dev");

        let node = materialize_tap(&devices, &paths, "tap0", 9).unwrap();

        assert_eq!(node, PathBuf::from("/dev/tap0"));
        assert_eq!(
            devices.reads(),
            vec![PathBuf::from("/sys/devices/virtual/net/tap0/tap9/dev")]
        );
        let created = devices.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].kind, NodeKind::Char);
        assert_eq!(created[0].mode, 0o600);
        assert_eq!(created[0].dev, DeviceNumber { major: 240, minor: 1 });
    }

    #[test]
    fn test_materialize_tap_missing_export() {
        let dir = tempdir().unwrap();
        let paths = TapPaths::new(dir.path(), dir.path());

        let err = materialize_tap(&SysfsDevices, &paths, "tap0", 3).unwrap_err();
        assert_eq!(err.operation(), Some(Operation::ReadDeviceNumber));
        assert!(!paths.node_path("tap0").exists());
    }
}
