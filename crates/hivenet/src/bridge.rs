//! VLAN-aware bridge lifecycle.

use std::sync::Arc;

use crate::backend::{LinkBackend, LinkConf, LinkKind};
use crate::error::{NetError, Result};
use crate::link::Link;

/// A Link specialized as a VLAN-aware, promiscuous bridge.
pub struct Bridge {
    name: String,
    backend: Arc<dyn LinkBackend>,
    link: Option<Link>,
}

impl Bridge {
    /// Creates a handle for a named bridge; nothing is touched until
    /// [`ensure`](Self::ensure).
    #[must_use]
    pub fn new(name: impl Into<String>, backend: Arc<dyn LinkBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            link: None,
        }
    }

    /// Bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying link, once ensured or fetched.
    #[must_use]
    pub fn link(&self) -> Option<&Link> {
        self.link.as_ref()
    }

    /// Creates or adopts the bridge and drives it to the desired state:
    /// promiscuous, VLAN filtering on, administratively up.
    ///
    /// Every step is conditioned on current OS state, so a second call
    /// against an already-correct bridge issues zero mutating calls.
    ///
    /// # Errors
    ///
    /// Returns an error if any OS call fails.
    pub fn ensure(&mut self) -> Result<&Link> {
        match self.backend.link_get(&self.name) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                let conf = LinkConf::new(self.name.clone(), LinkKind::Bridge);
                match self.backend.link_add(&conf) {
                    Ok(_) => tracing::info!("created bridge {}", self.name),
                    // Lost the race to another ensure; adopt what exists.
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(NetError::op("add", self.name.clone(), e)),
                }
            }
            Err(e) => return Err(NetError::op("get", self.name.clone(), e)),
        }

        // Re-fetch for authoritative attributes before conditioning anything.
        let mut link = Link::get(&self.name, Arc::clone(&self.backend))?;
        if !link.attrs().promisc {
            self.backend
                .link_set_promisc(link.index(), true)
                .map_err(|e| NetError::op("set promisc", self.name.clone(), e))?;
            link.refresh()?;
        }
        if !link.attrs().vlan_filtering {
            self.backend
                .link_set_vlan_filtering(link.index(), true)
                .map_err(|e| NetError::op("set vlan_filtering", self.name.clone(), e))?;
            link.refresh()?;
        }
        link.ensure_up()?;

        Ok(self.link.insert(link))
    }

    /// Deletes the bridge; absence is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS call fails.
    pub fn delete(&mut self) -> Result<()> {
        let link = match self.link.take() {
            Some(link) => link,
            None => match Link::get(&self.name, Arc::clone(&self.backend)) {
                Ok(link) => link,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        link.delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeBackend;

    #[test]
    fn test_ensure_creates_and_configures() {
        let fake = Arc::new(FakeBackend::new());
        let mut bridge = Bridge::new("tenant1-br", fake.clone());
        let link = bridge.ensure().unwrap();

        let attrs = link.attrs().clone();
        assert_eq!(attrs.kind, LinkKind::Bridge);
        assert!(attrs.promisc);
        assert!(attrs.vlan_filtering);
        assert!(attrs.up);
    }

    #[test]
    fn test_ensure_twice_is_free() {
        let fake = Arc::new(FakeBackend::new());
        let mut bridge = Bridge::new("tenant1-br", fake.clone());
        bridge.ensure().unwrap();
        let after_first = fake.mutation_count();

        let mut again = Bridge::new("tenant1-br", fake.clone());
        again.ensure().unwrap();
        assert_eq!(fake.mutation_count(), after_first);
    }

    #[test]
    fn test_delete_absent_is_noop() {
        let fake = Arc::new(FakeBackend::new());
        let mut bridge = Bridge::new("gone-br", fake);
        bridge.delete().unwrap();
    }
}
