//! Linux-specific network infrastructure.
//!
//! This module provides the real [`crate::backend::LinkBackend`] over the
//! kernel's rtnetlink interface, plus the monitor's subscription to the
//! link/address/route multicast groups.
//!
//! All types in this module require `target_os = "linux"` and, for
//! mutating calls, CAP_NET_ADMIN.

pub mod netlink;

pub use netlink::{Netlink, NetlinkEventSource};
