//! Error types for the network engine.

use thiserror::Error;

/// Result type alias for network operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors that can occur during network operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interface not found.
    #[error("link not found: {0}")]
    NotFound(String),

    /// Interface already exists.
    #[error("link already exists: {0}")]
    AlreadyExists(String),

    /// Interface is already enslaved to another master.
    #[error("{0}")]
    AlreadyEnslaved(String),

    /// VLAN set operation invalid for the set's current mode.
    #[error("vid set mode error: {0}")]
    Mode(String),

    /// VLAN tag outside [0, 4094].
    #[error("vlan id {0} out of range [0, 4094]")]
    OutOfRange(i64),

    /// Operation requires an uplink that has not been set up.
    #[error("network {0} has no uplink")]
    NoUplink(String),

    /// Address transfer found no IPv4 address on the source link.
    #[error("link {0} has no IPv4 address")]
    NoAddress(String),

    /// DHCP handshake or lease wait exceeded its budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Netlink error (Linux only).
    #[error("netlink error: {0}")]
    Netlink(String),

    /// DHCP error.
    #[error("DHCP error: {0}")]
    Dhcp(String),

    /// Link monitor error.
    #[error("monitor error: {0}")]
    Monitor(String),

    /// OS call failure, wrapped with the attempted operation and link name.
    #[error("{op} {link}: {msg}")]
    Op {
        /// Attempted operation.
        op: &'static str,
        /// Interface the operation targeted.
        link: String,
        /// Underlying failure.
        msg: String,
    },
}

impl NetError {
    /// Wraps an OS-call failure with the operation and interface name.
    pub fn op(op: &'static str, link: impl Into<String>, msg: impl ToString) -> Self {
        Self::Op {
            op,
            link: link.into(),
            msg: msg.to_string(),
        }
    }

    /// Returns true for "not found" failures.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true for "already exists" failures.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}
