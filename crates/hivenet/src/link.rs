//! Link handles and address transfer.
//!
//! A [`Link`] is a live view of one OS interface: a snapshot of its
//! attributes plus the backend needed to refresh or mutate it. The OS is
//! authoritative; callers refresh before acting on anything OS-visible.

use std::sync::Arc;

use crate::backend::{Address, LinkAttrs, LinkBackend, LinkKind, Route};
use crate::error::{NetError, Result};

/// The default PVID applied to untagged frames.
pub const DEFAULT_PVID: u16 = 1;

/// A handle to one OS network interface.
#[derive(Clone)]
pub struct Link {
    attrs: LinkAttrs,
    backend: Arc<dyn LinkBackend>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("attrs", &self.attrs).finish()
    }
}

impl Link {
    /// Fetches an interface by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the interface does not exist.
    pub fn get(name: &str, backend: Arc<dyn LinkBackend>) -> Result<Self> {
        let attrs = backend.link_get(name)?;
        Ok(Self { attrs, backend })
    }

    /// Fetches an interface by kernel index.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the interface does not exist.
    pub fn by_index(index: u32, backend: Arc<dyn LinkBackend>) -> Result<Self> {
        let attrs = backend.link_get_by_index(index)?;
        Ok(Self { attrs, backend })
    }

    /// Wraps already-fetched attributes.
    #[must_use]
    pub fn from_attrs(attrs: LinkAttrs, backend: Arc<dyn LinkBackend>) -> Self {
        Self { attrs, backend }
    }

    /// Observed attributes from the last fetch.
    #[must_use]
    pub fn attrs(&self) -> &LinkAttrs {
        &self.attrs
    }

    /// Interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.attrs.name
    }

    /// Kernel interface index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.attrs.index
    }

    /// Backend this handle mutates through.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn LinkBackend> {
        Arc::clone(&self.backend)
    }

    /// Re-fetches attributes from the OS.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the interface disappeared.
    pub fn refresh(&mut self) -> Result<()> {
        self.attrs = self.backend.link_get_by_index(self.attrs.index)?;
        Ok(())
    }

    /// Brings the interface up if it is not already up.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS call fails.
    pub fn ensure_up(&mut self) -> Result<()> {
        if !self.attrs.up {
            self.backend.link_set_up(self.attrs.index)?;
            self.refresh()?;
        }
        Ok(())
    }

    /// Brings the interface down.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS call fails.
    pub fn set_down(&mut self) -> Result<()> {
        self.backend.link_set_down(self.attrs.index)?;
        self.refresh()
    }

    /// Enslaves this interface to `master`, a no-op when already enslaved
    /// to it.
    ///
    /// MAC-VLAN sub-interfaces parented on this link are removed first;
    /// left in place they silently break bridging.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS call fails.
    pub fn set_master(&mut self, master: &Link) -> Result<()> {
        if self.attrs.master == Some(master.index()) {
            return Ok(());
        }
        self.remove_macvlans()?;
        self.backend
            .link_set_master(self.attrs.index, master.index())?;
        tracing::info!("enslaved {} to {}", self.attrs.name, master.name());
        self.refresh()
    }

    /// Releases this interface from its master, a no-op when it has none.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS call fails.
    pub fn set_nomaster(&mut self) -> Result<()> {
        if self.attrs.master.is_none() {
            return Ok(());
        }
        self.backend.link_set_nomaster(self.attrs.index)?;
        tracing::info!("released {} from its master", self.attrs.name);
        self.refresh()
    }

    /// Adds a VLAN filter entry on this bridge port.
    ///
    /// VLAN 0 and the default PVID are implicit and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS call fails.
    pub fn add_bridge_vlan(&self, vid: u16) -> Result<()> {
        if vid == 0 || vid == DEFAULT_PVID {
            return Ok(());
        }
        self.backend
            .bridge_vlan_add(self.attrs.index, vid)
            .map_err(|e| NetError::op("bridge vlan add", self.attrs.name.clone(), e))?;
        tracing::debug!("added vlan {} on {}", vid, self.attrs.name);
        Ok(())
    }

    /// Removes a VLAN filter entry from this bridge port.
    ///
    /// VLAN 0 and the default PVID are implicit and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS call fails.
    pub fn del_bridge_vlan(&self, vid: u16) -> Result<()> {
        if vid == 0 || vid == DEFAULT_PVID {
            return Ok(());
        }
        self.backend
            .bridge_vlan_del(self.attrs.index, vid)
            .map_err(|e| NetError::op("bridge vlan del", self.attrs.name.clone(), e))?;
        tracing::debug!("removed vlan {} on {}", vid, self.attrs.name);
        Ok(())
    }

    /// IPv4 addresses currently bound to this interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the enumeration fails.
    pub fn addresses(&self) -> Result<Vec<Address>> {
        self.backend.addr_list(self.attrs.index)
    }

    /// IPv4 routes whose output interface is this link.
    ///
    /// # Errors
    ///
    /// Returns an error if the enumeration fails.
    pub fn routes(&self) -> Result<Vec<Route>> {
        self.backend.route_list(self.attrs.index)
    }

    /// Deletes the interface; "not found" normalizes to success.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS call fails for any other reason.
    pub fn delete(self) -> Result<()> {
        match self.backend.link_del(self.attrs.index) {
            Ok(()) => {
                tracing::info!("deleted link {}", self.attrs.name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(NetError::op("delete", self.attrs.name, e)),
        }
    }

    fn remove_macvlans(&self) -> Result<()> {
        for attrs in self.backend.link_list()? {
            if attrs.kind == LinkKind::Macvlan && attrs.parent == Some(self.attrs.index) {
                tracing::warn!(
                    "removing macvlan {} parented on {}",
                    attrs.name,
                    self.attrs.name
                );
                self.backend.link_del(attrs.index)?;
            }
        }
        Ok(())
    }
}

/// Moves every IPv4 address and route from `src` to `dst`.
///
/// Routes are captured before any address is deleted, because deleting the
/// last address on an interface silently drops its routes. The same
/// primitive serves both directions: borrowing a management NIC's address
/// onto a new bridge, and returning it on teardown.
///
/// # Errors
///
/// Returns `NoAddress` if `src` holds no IPv4 address; otherwise the first
/// failing OS call aborts the transfer.
pub fn transfer_addresses(src: &Link, dst: &Link) -> Result<()> {
    let backend = src.backend();
    let addrs = src.addresses()?;
    if addrs.is_empty() {
        return Err(NetError::NoAddress(src.name().to_string()));
    }
    // Capture routes first; address deletion below would lose them.
    let routes = src.routes()?;

    for addr in &addrs {
        backend
            .addr_del(src.index(), addr)
            .map_err(|e| NetError::op("addr del", src.name().to_string(), e))?;
        let moved = Address {
            ip: addr.ip,
            label: Some(dst.name().to_string()),
        };
        backend
            .addr_add(dst.index(), &moved)
            .map_err(|e| NetError::op("addr add", dst.name().to_string(), e))?;
        tracing::info!("moved {} from {} to {}", addr.ip, src.name(), dst.name());
    }

    for route in routes {
        let rewritten = Route {
            ifindex: dst.index(),
            ..route
        };
        backend
            .route_replace(&rewritten)
            .map_err(|e| NetError::op("route replace", dst.name().to_string(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FakeBackend, LinkConf};
    use ipnetwork::Ipv4Network;

    fn backend() -> Arc<FakeBackend> {
        Arc::new(FakeBackend::new())
    }

    #[test]
    fn test_set_master_idempotent() {
        let fake = backend();
        fake.add_device("eth0", [0, 0, 0, 0, 0, 1]);
        fake.link_add(&LinkConf::new("br0", LinkKind::Bridge)).unwrap();

        let arc: Arc<dyn LinkBackend> = fake.clone();
        let br = Link::get("br0", Arc::clone(&arc)).unwrap();
        let mut eth = Link::get("eth0", Arc::clone(&arc)).unwrap();

        eth.set_master(&br).unwrap();
        let after_first = fake.mutation_count();
        eth.set_master(&br).unwrap();
        assert_eq!(fake.mutation_count(), after_first);
    }

    #[test]
    fn test_set_master_removes_macvlans() {
        let fake = backend();
        let eth0 = fake.add_device("eth0", [0, 0, 0, 0, 0, 1]);
        fake.link_add(&LinkConf::new("br0", LinkKind::Bridge)).unwrap();
        fake.add_macvlan("mv0", eth0);

        let arc: Arc<dyn LinkBackend> = fake.clone();
        let br = Link::get("br0", Arc::clone(&arc)).unwrap();
        let mut eth = Link::get("eth0", Arc::clone(&arc)).unwrap();
        eth.set_master(&br).unwrap();

        assert_eq!(eth.attrs().master, Some(br.index()));
        assert!(fake.link_get("mv0").unwrap_err().is_not_found());
    }

    #[test]
    fn test_bridge_vlan_skips_implicit_tags() {
        let fake = backend();
        let eth0 = fake.add_device("eth0", [0, 0, 0, 0, 0, 1]);
        let br = fake
            .link_add(&LinkConf::new("br0", LinkKind::Bridge))
            .unwrap();
        fake.link_set_master(eth0, br.index).unwrap();

        let arc: Arc<dyn LinkBackend> = fake.clone();
        let eth = Link::get("eth0", arc).unwrap();
        let before = fake.mutation_count();
        eth.add_bridge_vlan(0).unwrap();
        eth.add_bridge_vlan(DEFAULT_PVID).unwrap();
        eth.del_bridge_vlan(0).unwrap();
        eth.del_bridge_vlan(DEFAULT_PVID).unwrap();
        assert_eq!(fake.mutation_count(), before);

        eth.add_bridge_vlan(100).unwrap();
        assert_eq!(fake.bridge_vlan_list(eth0).unwrap(), vec![100]);
    }

    #[test]
    fn test_transfer_requires_address() {
        let fake = backend();
        fake.add_device("eth0", [0, 0, 0, 0, 0, 1]);
        fake.link_add(&LinkConf::new("br0", LinkKind::Bridge)).unwrap();

        let arc: Arc<dyn LinkBackend> = fake.clone();
        let eth = Link::get("eth0", Arc::clone(&arc)).unwrap();
        let br = Link::get("br0", arc).unwrap();
        assert!(matches!(
            transfer_addresses(&eth, &br),
            Err(NetError::NoAddress(_))
        ));
    }

    #[test]
    fn test_transfer_moves_addresses_and_routes() {
        let fake = backend();
        let eth0 = fake.add_device("eth0", [0, 0, 0, 0, 0, 1]);
        let br = fake
            .link_add(&LinkConf::new("br0", LinkKind::Bridge))
            .unwrap();
        let ip: Ipv4Network = "192.168.1.10/24".parse().unwrap();
        fake.add_address(eth0, ip);
        fake.add_route(Route {
            destination: None,
            gateway: Some("192.168.1.1".parse().unwrap()),
            ifindex: eth0,
            metric: None,
        });

        let arc: Arc<dyn LinkBackend> = fake.clone();
        let eth = Link::get("eth0", Arc::clone(&arc)).unwrap();
        let bridge = Link::get("br0", arc).unwrap();
        transfer_addresses(&eth, &bridge).unwrap();

        assert!(fake.addr_list(eth0).unwrap().is_empty());
        let moved = fake.addr_list(br.index).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].ip, ip);
        assert_eq!(moved[0].label.as_deref(), Some("br0"));

        let routes = fake.route_list(br.index).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].ifindex, br.index);
        assert!(fake.route_list(eth0).unwrap().is_empty());
    }
}
