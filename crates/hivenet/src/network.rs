//! VLAN network orchestrator.
//!
//! One `VlanNetwork` owns the lifecycle of a logical VLAN-capable network:
//! a bridge named `<name>-br`, an uplink bond named `<name>-bo`, and the
//! VLAN filter entries on the uplink. All durable state lives in the OS
//! interface table; [`VlanNetwork::get`] rebuilds a handle from it after a
//! process restart.

use std::sync::Arc;

use crate::backend::{BondMode, LinkBackend};
use crate::bond::{Bond, BondSpec};
use crate::bridge::Bridge;
use crate::error::{NetError, Result};
use crate::link::Link;
use crate::vlan::VidSet;

/// Maximum interface name length (IFNAMSIZ minus the trailing NUL).
const IFNAME_MAX: usize = 15;

const BRIDGE_SUFFIX: &str = "-br";
const UPLINK_SUFFIX: &str = "-bo";

/// Derives an interface name from a network name, truncating the base so
/// the result fits IFNAMSIZ.
fn derive_name(base: &str, suffix: &str) -> String {
    let budget = IFNAME_MAX - suffix.len();
    let head: String = base.chars().take(budget).collect();
    format!("{head}{suffix}")
}

/// Returns the bridge name for a network name.
#[must_use]
pub fn bridge_name(network: &str) -> String {
    derive_name(network, BRIDGE_SUFFIX)
}

/// Returns the uplink bond name for a network name.
#[must_use]
pub fn uplink_name(network: &str) -> String {
    derive_name(network, UPLINK_SUFFIX)
}

/// Desired uplink configuration for [`VlanNetwork::setup`].
#[derive(Debug, Clone)]
pub struct UplinkConf {
    /// Physical interfaces to aggregate under the uplink bond.
    pub slaves: Vec<String>,
    /// Bonding mode.
    pub mode: BondMode,
    /// Link monitoring interval in milliseconds.
    pub miimon: u32,
    /// MTU, when pinned.
    pub mtu: Option<u32>,
}

impl UplinkConf {
    /// Active-backup uplink over the given interfaces.
    #[must_use]
    pub fn new(slaves: Vec<String>) -> Self {
        Self {
            slaves,
            mode: BondMode::ActiveBackup,
            miimon: 100,
            mtu: None,
        }
    }
}

/// A named logical VLAN network: bridge + uplink + VLAN filter entries.
pub struct VlanNetwork {
    name: String,
    backend: Arc<dyn LinkBackend>,
    bridge: Bridge,
    uplink: Option<Link>,
}

impl VlanNetwork {
    /// Creates a handle for a named network; nothing is touched until
    /// [`setup`](Self::setup).
    #[must_use]
    pub fn new(name: impl Into<String>, backend: Arc<dyn LinkBackend>) -> Self {
        let name = name.into();
        let bridge = Bridge::new(bridge_name(&name), Arc::clone(&backend));
        Self {
            name,
            backend,
            bridge,
            uplink: None,
        }
    }

    /// Rebuilds a handle purely from OS state: the derived bridge and
    /// uplink names are fetched; a missing uplink leaves a "pure" VLAN
    /// network that cannot attach local areas until `setup`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bridge does not exist.
    pub fn get(name: &str, backend: Arc<dyn LinkBackend>) -> Result<Self> {
        // Probing the bridge proves the network exists at all.
        Link::get(&bridge_name(name), Arc::clone(&backend))?;
        let mut net = Self::new(name, Arc::clone(&backend));
        net.uplink = match Link::get(&uplink_name(name), backend) {
            Ok(link) => Some(link),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        Ok(net)
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The network's bridge.
    #[must_use]
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// The uplink link, once set up or discovered.
    #[must_use]
    pub fn uplink(&self) -> Option<&Link> {
        self.uplink.as_ref()
    }

    /// Ensures the bridge, ensures the uplink bond over `conf.slaves`, and
    /// enslaves the bond under the bridge. On success the network is
    /// configured and local areas can be attached.
    ///
    /// # Errors
    ///
    /// Returns the first failing step; a retried call resumes safely since
    /// every step is idempotent.
    pub fn setup(&mut self, conf: &UplinkConf) -> Result<()> {
        self.bridge.ensure()?;

        let mut spec = BondSpec::new(uplink_name(&self.name), conf.slaves.clone());
        spec.mode = conf.mode;
        spec.miimon = conf.miimon;
        spec.mtu = conf.mtu;
        let mut bond = Bond::new(spec, Arc::clone(&self.backend));
        bond.ensure()?;

        let mut uplink = Link::get(&uplink_name(&self.name), Arc::clone(&self.backend))?;
        let bridge_link = self
            .bridge
            .link()
            .ok_or_else(|| NetError::NotFound(self.bridge.name().to_string()))?;
        uplink.set_master(bridge_link)?;
        uplink.refresh()?;

        tracing::info!("network {} configured", self.name);
        self.uplink = Some(uplink);
        Ok(())
    }

    /// Adds one VLAN filter entry on the uplink.
    ///
    /// # Errors
    ///
    /// Returns `NoUplink` before `setup`, or the failing OS call.
    pub fn add_local_area(&self, vid: u16) -> Result<()> {
        let uplink = self
            .uplink
            .as_ref()
            .ok_or_else(|| NetError::NoUplink(self.name.clone()))?;
        uplink.add_bridge_vlan(vid)
    }

    /// Removes one VLAN filter entry from the uplink.
    ///
    /// # Errors
    ///
    /// Returns `NoUplink` before `setup`, or the failing OS call.
    pub fn remove_local_area(&self, vid: u16) -> Result<()> {
        let uplink = self
            .uplink
            .as_ref()
            .ok_or_else(|| NetError::NoUplink(self.name.clone()))?;
        uplink.del_bridge_vlan(vid)
    }

    /// Converges the uplink's filter table onto `desired` in one pass:
    /// reads the current entries, diffs, then adds and removes only the
    /// difference. Tags already present are not re-written.
    ///
    /// # Errors
    ///
    /// Returns `NoUplink` before `setup`, a `Mode` error if `desired` is
    /// not a trunk set, or the first failing OS call.
    pub fn sync_local_areas(&self, desired: &VidSet) -> Result<()> {
        let uplink = self
            .uplink
            .as_ref()
            .ok_or_else(|| NetError::NoUplink(self.name.clone()))?;

        let mut current = VidSet::new();
        for vid in self.backend.bridge_vlan_list(uplink.index())? {
            current.set_vid(vid)?;
        }

        let (added, removed) = desired.diff(&current)?;
        added.walk(|vid| uplink.add_bridge_vlan(vid))?;
        removed.walk(|vid| uplink.del_bridge_vlan(vid))?;
        tracing::debug!(
            "network {}: local areas now {}",
            self.name,
            desired.to_vid_string()
        );
        Ok(())
    }

    /// Tears the network down: release the uplink from the bridge, delete
    /// the uplink, delete the bridge. Filter entries disappear with the
    /// release. Each step is independently idempotent, so a failed
    /// teardown can simply be re-run.
    ///
    /// # Errors
    ///
    /// Returns `NoUplink` when no uplink is cached or discoverable, or the
    /// first failing OS call.
    pub fn teardown(&mut self) -> Result<()> {
        let mut uplink = match self.uplink.take() {
            Some(link) => link,
            None => Link::get(&uplink_name(&self.name), Arc::clone(&self.backend))
                .map_err(|_| NetError::NoUplink(self.name.clone()))?,
        };
        uplink.set_nomaster()?;
        uplink.delete()?;
        self.bridge.delete()?;
        tracing::info!("network {} torn down", self.name);
        Ok(())
    }
}
