//! Bond lifecycle and slave reconciliation.
//!
//! Bonding mode cannot be changed on a live device, so attribute drift is
//! resolved by deleting and recreating the bond rather than patching in
//! place. Concurrent reconciliation of the same bond name is a caller
//! invariant (single writer per name); this module does not lock.

use std::sync::Arc;

use crate::backend::{BondAttrs, BondMode, LinkBackend, LinkConf, LinkKind};
use crate::error::{NetError, Result};
use crate::link::Link;

/// Desired state of one bond.
#[derive(Debug, Clone)]
pub struct BondSpec {
    /// Bond interface name.
    pub name: String,
    /// Desired slave interface names.
    pub slaves: Vec<String>,
    /// Bonding mode.
    pub mode: BondMode,
    /// Link monitoring interval in milliseconds.
    pub miimon: u32,
    /// MTU, when pinned.
    pub mtu: Option<u32>,
    /// Hardware address, when pinned.
    pub mac: Option<[u8; 6]>,
    /// Transmit queue length, when pinned.
    pub txqlen: Option<u32>,
}

impl BondSpec {
    /// Creates a spec with default mode (active-backup) and miimon 100.
    #[must_use]
    pub fn new(name: impl Into<String>, slaves: Vec<String>) -> Self {
        Self {
            name: name.into(),
            slaves,
            mode: BondMode::ActiveBackup,
            miimon: 100,
            mtu: None,
            mac: None,
            txqlen: None,
        }
    }

    fn conf(&self) -> LinkConf {
        let mut conf = LinkConf::new(self.name.clone(), LinkKind::Bond);
        conf.mtu = self.mtu;
        conf.mac = self.mac;
        conf.txqlen = self.txqlen;
        conf.bond = Some(BondAttrs {
            mode: self.mode,
            miimon: self.miimon,
        });
        conf
    }
}

/// A Link specialized as a link aggregation device.
pub struct Bond {
    spec: BondSpec,
    backend: Arc<dyn LinkBackend>,
    link: Option<Link>,
}

impl Bond {
    /// Creates a handle for a bond spec; nothing is touched until
    /// [`ensure`](Self::ensure).
    #[must_use]
    pub fn new(spec: BondSpec, backend: Arc<dyn LinkBackend>) -> Self {
        Self {
            spec,
            backend,
            link: None,
        }
    }

    /// Bond name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The underlying link, once ensured.
    #[must_use]
    pub fn link(&self) -> Option<&Link> {
        self.link.as_ref()
    }

    /// Creates or adopts the bond and reconciles it against the spec.
    ///
    /// An existing bond whose comparable attributes differ is deleted and
    /// recreated. Slave membership is then reconciled: current slaves not
    /// in the desired list are released and brought up standalone; desired
    /// slaves not yet enslaved are brought down, enslaved, and brought
    /// back up. Unchanged members see no calls at all.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyEnslaved` if a desired slave belongs to another
    /// master, or the first failing OS call.
    pub fn ensure(&mut self) -> Result<&Link> {
        match self.backend.link_get(&self.spec.name) {
            Ok(attrs) => {
                if self.differs(&attrs) {
                    tracing::info!(
                        "bond {} attributes drifted, recreating",
                        self.spec.name
                    );
                    self.backend
                        .link_del(attrs.index)
                        .map_err(|e| NetError::op("delete", self.spec.name.clone(), e))?;
                    self.create()?;
                }
            }
            Err(e) if e.is_not_found() => self.create()?,
            Err(e) => return Err(NetError::op("get", self.spec.name.clone(), e)),
        }

        let mut link = Link::get(&self.spec.name, Arc::clone(&self.backend))?;
        link.ensure_up()?;
        self.reconcile_slaves(&link)?;

        Ok(self.link.insert(link))
    }

    /// Deletes the bond; absence is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS call fails.
    pub fn delete(&mut self) -> Result<()> {
        let link = match self.link.take() {
            Some(link) => link,
            None => match Link::get(&self.spec.name, Arc::clone(&self.backend)) {
                Ok(link) => link,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        link.delete()
    }

    fn create(&self) -> Result<()> {
        match self.backend.link_add(&self.spec.conf()) {
            Ok(_) => {
                tracing::info!("created bond {}", self.spec.name);
                Ok(())
            }
            // Lost the race to another ensure; adopt what exists.
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(NetError::op("add", self.spec.name.clone(), e)),
        }
    }

    /// Compares the attributes that cannot be patched on a live bond.
    fn differs(&self, attrs: &crate::backend::LinkAttrs) -> bool {
        if attrs.kind != LinkKind::Bond {
            return true;
        }
        let bond = match attrs.bond {
            Some(bond) => bond,
            None => return true,
        };
        if bond.mode != self.spec.mode || bond.miimon != self.spec.miimon {
            return true;
        }
        if self.spec.mtu.is_some_and(|mtu| mtu != attrs.mtu) {
            return true;
        }
        if self.spec.mac.is_some() && self.spec.mac != attrs.mac {
            return true;
        }
        self.spec.txqlen.is_some_and(|t| t != attrs.txqlen)
    }

    /// Reconciles slave membership against the desired list.
    ///
    /// Never touches interfaces outside the union of current and desired
    /// slaves, and never cycles unchanged members.
    fn reconcile_slaves(&self, bond: &Link) -> Result<()> {
        let current: Vec<_> = self
            .backend
            .link_list()?
            .into_iter()
            .filter(|a| a.master == Some(bond.index()))
            .collect();

        for slave in &current {
            if !self.spec.slaves.iter().any(|s| s == &slave.name) {
                let mut link = Link::by_index(slave.index, Arc::clone(&self.backend))?;
                link.set_nomaster()?;
                link.ensure_up()?;
                tracing::info!("released slave {} from {}", slave.name, self.spec.name);
            }
        }

        for name in &self.spec.slaves {
            if current.iter().any(|a| &a.name == name) {
                continue;
            }
            let mut link = Link::get(name, Arc::clone(&self.backend))?;
            if let Some(master) = link.attrs().master {
                if master != bond.index() {
                    return Err(NetError::AlreadyEnslaved(format!(
                        "{} is already enslaved to ifindex {}",
                        name, master
                    )));
                }
            }
            // Enslaving requires the slave to be down.
            link.set_down()?;
            link.set_master(bond)?;
            link.ensure_up()?;
            tracing::info!("enslaved {} to {}", name, self.spec.name);
        }
        Ok(())
    }
}
