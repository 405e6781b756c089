//! Link backend trait and wire-neutral interface types.
//!
//! The engine never treats its own objects as ground truth: every mutation
//! goes through a narrow capability interface over the OS interface table,
//! and every decision re-fetches current state first. Wrapping the OS calls
//! behind [`LinkBackend`] keeps the bridge/bond/orchestrator logic testable
//! against [`FakeBackend`] without root privileges or a network namespace.
//!
//! The real implementation is [`crate::linux::Netlink`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use ipnetwork::Ipv4Network;

use crate::error::{NetError, Result};

/// Interface kind, as reported by the OS link table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Physical or otherwise unclassified device.
    Device,
    /// Linux bridge.
    Bridge,
    /// Bonding (link aggregation) device.
    Bond,
    /// Loopback.
    Loopback,
    /// VXLAN tunnel endpoint.
    Vxlan,
    /// Virtual ethernet pair half.
    Veth,
    /// MAC-VLAN sub-interface.
    Macvlan,
}

impl LinkKind {
    /// Kernel IFLA_INFO_KIND string for this kind.
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Bridge => "bridge",
            Self::Bond => "bond",
            Self::Loopback => "loopback",
            Self::Vxlan => "vxlan",
            Self::Veth => "veth",
            Self::Macvlan => "macvlan",
        }
    }

    /// Maps a kernel kind string back to a `LinkKind`.
    #[must_use]
    pub fn from_kind_str(s: &str) -> Self {
        match s {
            "bridge" => Self::Bridge,
            "bond" => Self::Bond,
            "vxlan" => Self::Vxlan,
            "veth" => Self::Veth,
            "macvlan" => Self::Macvlan,
            _ => Self::Device,
        }
    }
}

/// Operational state of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperState {
    /// IF_OPER_UP.
    Up,
    /// IF_OPER_DOWN.
    Down,
    /// Anything else the kernel reports.
    Unknown,
}

/// Bonding mode, kernel numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BondMode {
    /// balance-rr.
    BalanceRr = 0,
    /// active-backup.
    #[default]
    ActiveBackup = 1,
    /// balance-xor.
    BalanceXor = 2,
    /// broadcast.
    Broadcast = 3,
    /// 802.3ad LACP.
    Lacp = 4,
    /// balance-tlb.
    BalanceTlb = 5,
    /// balance-alb.
    BalanceAlb = 6,
}

impl BondMode {
    /// Maps the kernel mode byte back to a `BondMode`.
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::BalanceRr,
            2 => Self::BalanceXor,
            3 => Self::Broadcast,
            4 => Self::Lacp,
            5 => Self::BalanceTlb,
            6 => Self::BalanceAlb,
            _ => Self::ActiveBackup,
        }
    }
}

/// Bond-specific attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BondAttrs {
    /// Bonding mode.
    pub mode: BondMode,
    /// Link monitoring interval in milliseconds.
    pub miimon: u32,
}

impl Default for BondAttrs {
    fn default() -> Self {
        Self {
            mode: BondMode::ActiveBackup,
            miimon: 100,
        }
    }
}

/// Observed attributes of one interface.
///
/// This is a snapshot of the OS link table, refreshed on demand; it is never
/// authoritative across mutations.
#[derive(Debug, Clone)]
pub struct LinkAttrs {
    /// Kernel interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// Interface kind.
    pub kind: LinkKind,
    /// Hardware address, when the interface has one.
    pub mac: Option<[u8; 6]>,
    /// MTU.
    pub mtu: u32,
    /// Transmit queue length.
    pub txqlen: u32,
    /// Administrative up flag (IFF_UP).
    pub up: bool,
    /// Promiscuous mode flag.
    pub promisc: bool,
    /// Bridge VLAN filtering flag (bridges only).
    pub vlan_filtering: bool,
    /// Operational state.
    pub oper_state: OperState,
    /// Master interface index, when enslaved.
    pub master: Option<u32>,
    /// Parent link index (macvlan/vlan sub-interfaces).
    pub parent: Option<u32>,
    /// Bond attributes (bonds only).
    pub bond: Option<BondAttrs>,
}

impl LinkAttrs {
    /// Minimal attrs for a named interface of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: LinkKind) -> Self {
        Self {
            index: 0,
            name: name.into(),
            kind,
            mac: None,
            mtu: 1500,
            txqlen: 1000,
            up: false,
            promisc: false,
            vlan_filtering: false,
            oper_state: OperState::Down,
            master: None,
            parent: None,
            bond: None,
        }
    }
}

/// Specification for creating an interface.
#[derive(Debug, Clone)]
pub struct LinkConf {
    /// Interface name.
    pub name: String,
    /// Interface kind.
    pub kind: LinkKind,
    /// MTU, when not the OS default.
    pub mtu: Option<u32>,
    /// Hardware address, when pinned.
    pub mac: Option<[u8; 6]>,
    /// Transmit queue length, when not the OS default.
    pub txqlen: Option<u32>,
    /// Bond attributes (bonds only).
    pub bond: Option<BondAttrs>,
}

impl LinkConf {
    /// Creates a spec for a named interface of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: LinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            mtu: None,
            mac: None,
            txqlen: None,
            bond: None,
        }
    }
}

/// An IPv4 address bound to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Address with prefix length.
    pub ip: Ipv4Network,
    /// Address label (defaults to the interface name on Linux).
    pub label: Option<String>,
}

/// An IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network; `None` is the default route.
    pub destination: Option<Ipv4Network>,
    /// Gateway, absent for directly connected routes.
    pub gateway: Option<std::net::Ipv4Addr>,
    /// Output interface index.
    pub ifindex: u32,
    /// Route metric, when set.
    pub metric: Option<u32>,
}

/// Narrow capability interface over the OS interface table.
///
/// Failure contract: lookups return `NotFound` for absent interfaces,
/// `link_add` returns `AlreadyExists` for name collisions, and every other
/// failure is an opaque OS error. Normalizing those to no-ops is the
/// caller's decision, not the backend's.
pub trait LinkBackend: Send + Sync {
    /// Fetches an interface by name.
    fn link_get(&self, name: &str) -> Result<LinkAttrs>;

    /// Fetches an interface by kernel index.
    fn link_get_by_index(&self, index: u32) -> Result<LinkAttrs>;

    /// Lists every interface in the OS table.
    fn link_list(&self) -> Result<Vec<LinkAttrs>>;

    /// Creates an interface.
    fn link_add(&self, conf: &LinkConf) -> Result<LinkAttrs>;

    /// Deletes an interface.
    fn link_del(&self, index: u32) -> Result<()>;

    /// Sets the administrative up flag.
    fn link_set_up(&self, index: u32) -> Result<()>;

    /// Clears the administrative up flag.
    fn link_set_down(&self, index: u32) -> Result<()>;

    /// Enslaves an interface to a master.
    fn link_set_master(&self, index: u32, master: u32) -> Result<()>;

    /// Releases an interface from its master.
    fn link_set_nomaster(&self, index: u32) -> Result<()>;

    /// Toggles promiscuous mode.
    fn link_set_promisc(&self, index: u32, on: bool) -> Result<()>;

    /// Toggles bridge VLAN filtering (bridges only).
    fn link_set_vlan_filtering(&self, index: u32, on: bool) -> Result<()>;

    /// Adds a VLAN filter entry on a bridge port (master entry).
    fn bridge_vlan_add(&self, index: u32, vid: u16) -> Result<()>;

    /// Removes a VLAN filter entry from a bridge port.
    fn bridge_vlan_del(&self, index: u32, vid: u16) -> Result<()>;

    /// Lists VLAN filter entries on a bridge port.
    fn bridge_vlan_list(&self, index: u32) -> Result<Vec<u16>>;

    /// Lists IPv4 addresses on an interface.
    fn addr_list(&self, index: u32) -> Result<Vec<Address>>;

    /// Adds an IPv4 address to an interface.
    fn addr_add(&self, index: u32, addr: &Address) -> Result<()>;

    /// Deletes an IPv4 address from an interface.
    fn addr_del(&self, index: u32, addr: &Address) -> Result<()>;

    /// Lists IPv4 routes whose output interface is `index`.
    fn route_list(&self, index: u32) -> Result<Vec<Route>>;

    /// Adds or replaces an IPv4 route.
    fn route_replace(&self, route: &Route) -> Result<()>;
}

/// One interface in the fake OS table.
#[derive(Debug, Clone)]
struct FakeLink {
    attrs: LinkAttrs,
    addrs: Vec<Address>,
    vlans: Vec<u16>,
}

/// In-memory [`LinkBackend`] that mimics the kernel's interface table.
///
/// Counts mutating calls and keeps an operation log so tests can assert
/// that an idempotent path issued zero mutations, or that reconciliation
/// left unchanged members untouched.
#[derive(Default)]
pub struct FakeBackend {
    links: Mutex<HashMap<u32, FakeLink>>,
    routes: Mutex<Vec<Route>>,
    next_index: AtomicU32,
    mutations: AtomicUsize,
    ops: Mutex<Vec<String>>,
}

impl FakeBackend {
    /// Creates an empty fake interface table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_index: AtomicU32::new(1),
            ..Self::default()
        }
    }

    /// Seeds a physical device into the table, returning its index.
    pub fn add_device(&self, name: &str, mac: [u8; 6]) -> u32 {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let mut attrs = LinkAttrs::new(name, LinkKind::Device);
        attrs.index = index;
        attrs.mac = Some(mac);
        attrs.up = true;
        attrs.oper_state = OperState::Up;
        self.links.lock().unwrap().insert(
            index,
            FakeLink {
                attrs,
                addrs: Vec::new(),
                vlans: Vec::new(),
            },
        );
        index
    }

    /// Seeds a MAC-VLAN sub-interface parented on an existing device.
    pub fn add_macvlan(&self, name: &str, parent: u32) -> u32 {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let mut attrs = LinkAttrs::new(name, LinkKind::Macvlan);
        attrs.index = index;
        attrs.parent = Some(parent);
        self.links.lock().unwrap().insert(
            index,
            FakeLink {
                attrs,
                addrs: Vec::new(),
                vlans: Vec::new(),
            },
        );
        index
    }

    /// Seeds an IPv4 address onto a device.
    pub fn add_address(&self, index: u32, ip: Ipv4Network) {
        let mut links = self.links.lock().unwrap();
        let link = links.get_mut(&index).expect("unknown index");
        let label = Some(link.attrs.name.clone());
        link.addrs.push(Address { ip, label });
    }

    /// Seeds a route.
    pub fn add_route(&self, route: Route) {
        self.routes.lock().unwrap().push(route);
    }

    /// Number of mutating calls issued so far.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Snapshot of the mutating-call log, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: String) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().unwrap().push(op);
    }

    fn name_of(&self, index: u32) -> String {
        self.links
            .lock()
            .unwrap()
            .get(&index)
            .map_or_else(|| format!("ifindex {index}"), |l| l.attrs.name.clone())
    }
}

impl LinkBackend for FakeBackend {
    fn link_get(&self, name: &str) -> Result<LinkAttrs> {
        self.links
            .lock()
            .unwrap()
            .values()
            .find(|l| l.attrs.name == name)
            .map(|l| l.attrs.clone())
            .ok_or_else(|| NetError::NotFound(name.to_string()))
    }

    fn link_get_by_index(&self, index: u32) -> Result<LinkAttrs> {
        self.links
            .lock()
            .unwrap()
            .get(&index)
            .map(|l| l.attrs.clone())
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))
    }

    fn link_list(&self) -> Result<Vec<LinkAttrs>> {
        let mut all: Vec<LinkAttrs> = self
            .links
            .lock()
            .unwrap()
            .values()
            .map(|l| l.attrs.clone())
            .collect();
        all.sort_by_key(|a| a.index);
        Ok(all)
    }

    fn link_add(&self, conf: &LinkConf) -> Result<LinkAttrs> {
        {
            let links = self.links.lock().unwrap();
            if links.values().any(|l| l.attrs.name == conf.name) {
                return Err(NetError::AlreadyExists(conf.name.clone()));
            }
        }
        self.record(format!("link_add {}", conf.name));
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let mut attrs = LinkAttrs::new(conf.name.clone(), conf.kind);
        attrs.index = index;
        attrs.mac = conf.mac;
        if let Some(mtu) = conf.mtu {
            attrs.mtu = mtu;
        }
        if let Some(txqlen) = conf.txqlen {
            attrs.txqlen = txqlen;
        }
        attrs.bond = conf.bond;
        self.links.lock().unwrap().insert(
            index,
            FakeLink {
                attrs: attrs.clone(),
                addrs: Vec::new(),
                vlans: Vec::new(),
            },
        );
        Ok(attrs)
    }

    fn link_del(&self, index: u32) -> Result<()> {
        let mut links = self.links.lock().unwrap();
        let removed = links
            .remove(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        // The kernel releases slaves of a deleted master.
        for link in links.values_mut() {
            if link.attrs.master == Some(index) {
                link.attrs.master = None;
                link.vlans.clear();
            }
        }
        drop(links);
        self.routes.lock().unwrap().retain(|r| r.ifindex != index);
        self.record(format!("link_del {}", removed.attrs.name));
        Ok(())
    }

    fn link_set_up(&self, index: u32) -> Result<()> {
        self.record(format!("link_set_up {}", self.name_of(index)));
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        link.attrs.up = true;
        link.attrs.oper_state = OperState::Up;
        Ok(())
    }

    fn link_set_down(&self, index: u32) -> Result<()> {
        self.record(format!("link_set_down {}", self.name_of(index)));
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        link.attrs.up = false;
        link.attrs.oper_state = OperState::Down;
        Ok(())
    }

    fn link_set_master(&self, index: u32, master: u32) -> Result<()> {
        self.record(format!(
            "link_set_master {} -> {}",
            self.name_of(index),
            self.name_of(master)
        ));
        let mut links = self.links.lock().unwrap();
        if !links.contains_key(&master) {
            return Err(NetError::NotFound(format!("ifindex {master}")));
        }
        let link = links
            .get_mut(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        link.attrs.master = Some(master);
        Ok(())
    }

    fn link_set_nomaster(&self, index: u32) -> Result<()> {
        self.record(format!("link_set_nomaster {}", self.name_of(index)));
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        link.attrs.master = None;
        link.vlans.clear();
        Ok(())
    }

    fn link_set_promisc(&self, index: u32, on: bool) -> Result<()> {
        self.record(format!("link_set_promisc {} {on}", self.name_of(index)));
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        link.attrs.promisc = on;
        Ok(())
    }

    fn link_set_vlan_filtering(&self, index: u32, on: bool) -> Result<()> {
        self.record(format!(
            "link_set_vlan_filtering {} {on}",
            self.name_of(index)
        ));
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        link.attrs.vlan_filtering = on;
        Ok(())
    }

    fn bridge_vlan_add(&self, index: u32, vid: u16) -> Result<()> {
        self.record(format!("bridge_vlan_add {} {vid}", self.name_of(index)));
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        if link.attrs.master.is_none() {
            return Err(NetError::op(
                "bridge_vlan_add",
                link.attrs.name.clone(),
                "link has no master",
            ));
        }
        if !link.vlans.contains(&vid) {
            link.vlans.push(vid);
            link.vlans.sort_unstable();
        }
        Ok(())
    }

    fn bridge_vlan_del(&self, index: u32, vid: u16) -> Result<()> {
        self.record(format!("bridge_vlan_del {} {vid}", self.name_of(index)));
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        link.vlans.retain(|&v| v != vid);
        Ok(())
    }

    fn bridge_vlan_list(&self, index: u32) -> Result<Vec<u16>> {
        self.links
            .lock()
            .unwrap()
            .get(&index)
            .map(|l| l.vlans.clone())
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))
    }

    fn addr_list(&self, index: u32) -> Result<Vec<Address>> {
        self.links
            .lock()
            .unwrap()
            .get(&index)
            .map(|l| l.addrs.clone())
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))
    }

    fn addr_add(&self, index: u32, addr: &Address) -> Result<()> {
        self.record(format!("addr_add {} {}", self.name_of(index), addr.ip));
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        if link.addrs.iter().any(|a| a.ip == addr.ip) {
            return Err(NetError::AlreadyExists(addr.ip.to_string()));
        }
        link.addrs.push(addr.clone());
        Ok(())
    }

    fn addr_del(&self, index: u32, addr: &Address) -> Result<()> {
        self.record(format!("addr_del {} {}", self.name_of(index), addr.ip));
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(&index)
            .ok_or_else(|| NetError::NotFound(format!("ifindex {index}")))?;
        let before = link.addrs.len();
        link.addrs.retain(|a| a.ip != addr.ip);
        if link.addrs.len() == before {
            return Err(NetError::NotFound(addr.ip.to_string()));
        }
        // Deleting the last address silently drops the interface's routes,
        // same as the kernel does.
        if link.addrs.is_empty() {
            drop(links);
            self.routes.lock().unwrap().retain(|r| r.ifindex != index);
        }
        Ok(())
    }

    fn route_list(&self, index: u32) -> Result<Vec<Route>> {
        Ok(self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.ifindex == index)
            .cloned()
            .collect())
    }

    fn route_replace(&self, route: &Route) -> Result<()> {
        self.record(format!(
            "route_replace {:?} via ifindex {}",
            route.destination, route.ifindex
        ));
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|r| r.destination != route.destination || r.gateway != route.gateway);
        routes.push(route.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_backend_link_table() {
        let backend = FakeBackend::new();
        let eth0 = backend.add_device("eth0", [0x52, 0x54, 0, 0, 0, 1]);

        let attrs = backend.link_get("eth0").unwrap();
        assert_eq!(attrs.index, eth0);
        assert_eq!(attrs.kind, LinkKind::Device);
        assert!(backend.link_get("eth1").unwrap_err().is_not_found());

        let br = backend
            .link_add(&LinkConf::new("br0", LinkKind::Bridge))
            .unwrap();
        assert!(backend
            .link_add(&LinkConf::new("br0", LinkKind::Bridge))
            .unwrap_err()
            .is_already_exists());

        backend.link_set_master(eth0, br.index).unwrap();
        assert_eq!(backend.link_get("eth0").unwrap().master, Some(br.index));

        // Deleting the master releases its slaves.
        backend.link_del(br.index).unwrap();
        assert_eq!(backend.link_get("eth0").unwrap().master, None);
    }

    #[test]
    fn test_fake_backend_drops_routes_with_last_addr() {
        let backend = FakeBackend::new();
        let eth0 = backend.add_device("eth0", [0, 0, 0, 0, 0, 1]);
        let ip: Ipv4Network = "192.168.1.10/24".parse().unwrap();
        backend.add_address(eth0, ip);
        backend.add_route(Route {
            destination: None,
            gateway: Some("192.168.1.1".parse().unwrap()),
            ifindex: eth0,
            metric: None,
        });

        backend
            .addr_del(
                eth0,
                &Address {
                    ip,
                    label: Some("eth0".into()),
                },
            )
            .unwrap();
        assert!(backend.route_list(eth0).unwrap().is_empty());
    }
}
