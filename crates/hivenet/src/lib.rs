//! # hivenet
//!
//! Host-level Layer-2 network engine for hyperconverged nodes.
//!
//! This crate builds and maintains the per-tenant bridge/bond topology on a
//! Linux host:
//!
//! - **VLAN networks**: a VLAN-filtering bridge backed by a bonded uplink,
//!   with derived `<name>-br` / `<name>-bo` interface names
//! - **VLAN ID sets**: dense bitmap algebra over tags 1-4094 with
//!   access/trunk port modes
//! - **Idempotent ensure**: bridges and bonds converge to the desired state
//!   without touching attributes that already match
//! - **Address transfer**: moves IPv4 addresses and their routes from an
//!   uplink onto its bridge
//! - **Link monitor**: kernel change notifications dispatched to per-index
//!   callbacks, plus a pattern registry for interface discovery
//! - **DHCPv4 client**: RFC 2131 lease acquisition with T1/T2 renewal
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                    hivenet                       │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │              VlanNetwork                 │   │
//! │  │  - bridge + bonded uplink lifecycle      │   │
//! │  │  - local-area (VLAN) membership          │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────────┐    │
//! │  │  Bridge  │ │   Bond   │ │ LinkMonitor  │    │
//! │  └──────────┘ └──────────┘ └──────────────┘    │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │       LinkBackend (rtnetlink)            │   │
//! │  └──────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod bond;
pub mod bridge;
pub mod dhcp;
pub mod error;
pub mod link;
pub mod monitor;
pub mod network;
pub mod vlan;

#[cfg(target_os = "linux")]
pub mod linux;

pub use backend::{Address, BondAttrs, BondMode, LinkAttrs, LinkBackend, LinkKind, Route};
pub use bond::{Bond, BondSpec};
pub use bridge::Bridge;
pub use dhcp::{DhcpClient, DhcpLease};
pub use error::{NetError, Result};
pub use link::Link;
pub use monitor::{LinkMonitor, MonitorEvent, MonitorPattern, PatternRegistry};
pub use network::{UplinkConf, VlanNetwork};
pub use vlan::{VidMode, VidSet};
