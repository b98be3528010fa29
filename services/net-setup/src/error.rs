//! Error types for network setup.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Host operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ListLinks,
    ListAddrs,
    ListRoutes,
    DeleteAddr,
    SetLinkDown,
    AddMacvtap,
    GetLink,
    SetLinkUp,
    ReadDeviceNumber,
    MakeDeviceNode,
    ResolveHost,
    ListLocalAddrs,
    Unmount,
    CreateDir,
    WriteFile,
    SetPermissions,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ListLinks => "list_links",
            Operation::ListAddrs => "list_addrs",
            Operation::ListRoutes => "list_routes",
            Operation::DeleteAddr => "delete_addr",
            Operation::SetLinkDown => "set_link_down",
            Operation::AddMacvtap => "add_macvtap",
            Operation::GetLink => "get_link",
            Operation::SetLinkUp => "set_link_up",
            Operation::ReadDeviceNumber => "read_device_number",
            Operation::MakeDeviceNode => "make_device_node",
            Operation::ResolveHost => "resolve_host",
            Operation::ListLocalAddrs => "list_local_addrs",
            Operation::Unmount => "unmount",
            Operation::CreateDir => "create_dir",
            Operation::WriteFile => "write_file",
            Operation::SetPermissions => "set_permissions",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network setup errors. Every variant is fatal to the pipeline.
#[derive(Debug, Error)]
pub enum SetupError {
    /// A host operation failed on the given subject (link, path, hostname).
    #[error("{op} failed on {subject}: {source}")]
    Op {
        op: Operation,
        subject: String,
        #[source]
        source: io::Error,
    },

    /// A pass-through candidate carries no address to hand to the guest.
    #[error("no ip found on {link}")]
    NoAddresses { link: String },

    /// Hostname resolution exceeded its budget.
    #[error("resolving {host} timed out after {timeout:?}")]
    ResolveTimeout { host: String, timeout: Duration },

    /// No resolved address lies in a local subnet.
    #[error("invalid nameserver {host:?}")]
    InvalidNameserver { host: String },
}

impl SetupError {
    pub(crate) fn op(op: Operation, subject: impl Into<String>, source: io::Error) -> Self {
        SetupError::Op {
            op,
            subject: subject.into(),
            source,
        }
    }

    /// The failed operation, for `Op` errors.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            SetupError::Op { op, .. } => Some(*op),
            _ => None,
        }
    }

    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SetupError::Op { op, .. } => op.as_str(),
            SetupError::NoAddresses { .. } => "no_addresses",
            SetupError::ResolveTimeout { .. } => "resolve_timeout",
            SetupError::InvalidNameserver { .. } => "invalid_nameserver",
        }
    }
}

/// Shorthand for tagging capability failures with an operation and subject.
pub(crate) trait OpContext<T> {
    fn op_context(self, op: Operation, subject: &str) -> Result<T, SetupError>;
}

impl<T> OpContext<T> for io::Result<T> {
    fn op_context(self, op: Operation, subject: &str) -> Result<T, SetupError> {
        self.map_err(|e| SetupError::op(op, subject, e))
    }
}
