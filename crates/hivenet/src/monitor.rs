//! Link event monitoring.
//!
//! One [`LinkMonitor`] per process holds the single kernel subscription to
//! link/address/route change notifications and fans events out to callback
//! bundles registered by interface index. The monitor is an explicitly
//! constructed component, injected where needed; nothing here is a global.
//!
//! Because the index of a not-yet-created interface is unknown in advance,
//! a [`PatternRegistry`] layers name/type rules on top: reconcilers register
//! a pattern under their own key and re-scan the link table on demand.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{LinkAttrs, LinkBackend, LinkKind, Route};
use crate::error::Result;

/// One kernel change notification, already parsed.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Link created or changed.
    NewLink(LinkAttrs),
    /// Link removed.
    DelLink(LinkAttrs),
    /// Address added.
    NewAddr {
        /// Interface index.
        index: u32,
        /// The address.
        addr: IpAddr,
    },
    /// Address removed.
    DelAddr {
        /// Interface index.
        index: u32,
        /// The address.
        addr: IpAddr,
    },
    /// Route added.
    NewRoute(Route),
    /// Route removed.
    DelRoute(Route),
}

impl MonitorEvent {
    /// Interface index the event concerns.
    #[must_use]
    pub fn index(&self) -> u32 {
        match self {
            Self::NewLink(attrs) | Self::DelLink(attrs) => attrs.index,
            Self::NewAddr { index, .. } | Self::DelAddr { index, .. } => *index,
            Self::NewRoute(route) | Self::DelRoute(route) => route.ifindex,
        }
    }
}

/// Source of kernel change notifications.
///
/// The real implementation is a netlink socket joined to the link, IPv4
/// address, and IPv4 route multicast groups; tests inject a channel.
#[async_trait]
pub trait EventSource: Send {
    /// Waits for the next notification.
    async fn recv(&mut self) -> Result<MonitorEvent>;
}

/// Link event callback.
pub type LinkCallback = Arc<dyn Fn(&LinkAttrs) + Send + Sync>;
/// Address event callback.
pub type AddrCallback = Arc<dyn Fn(u32, IpAddr) + Send + Sync>;
/// Route event callback.
pub type RouteCallback = Arc<dyn Fn(&Route) + Send + Sync>;

/// Callback bundle for one registered interface index.
///
/// Callbacks run on the single dispatch path; a blocking callback stalls
/// delivery to every other registered index.
#[derive(Clone, Default)]
pub struct LinkHandlers {
    /// Invoked on link create/change.
    pub new_link: Option<LinkCallback>,
    /// Invoked on link removal.
    pub del_link: Option<LinkCallback>,
    /// Invoked on IPv4 address addition.
    pub new_addr: Option<AddrCallback>,
    /// Invoked on IPv4 address removal.
    pub del_addr: Option<AddrCallback>,
    /// Invoked on route addition.
    pub new_route: Option<RouteCallback>,
    /// Invoked on route removal.
    pub del_route: Option<RouteCallback>,
}

/// Single-subscription link event dispatcher.
pub struct LinkMonitor {
    handlers: Arc<RwLock<HashMap<u32, LinkHandlers>>>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMonitor {
    /// Creates a monitor with no registrations.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            started: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Starts the dispatch loop over `source`.
    ///
    /// Returns false without consuming anything if the monitor is already
    /// running; one subscription per process is the expectation.
    pub fn start(&self, mut source: Box<dyn EventSource>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let handlers = Arc::clone(&self.handlers);
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            tracing::info!("link monitor started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = source.recv() => match event {
                        Ok(event) => Self::dispatch(&handlers, &event),
                        Err(e) => {
                            tracing::warn!("link monitor source failed: {e}");
                            break;
                        }
                    }
                }
            }
            tracing::info!("link monitor stopped");
        });
        *self.task.lock().unwrap() = Some(task);
        true
    }

    /// Signals the dispatch loop to exit.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Registers a callback bundle for an interface index.
    pub fn add_link(&self, index: u32, handlers: LinkHandlers) {
        self.handlers.write().unwrap().insert(index, handlers);
    }

    /// Removes the registration for an interface index.
    pub fn del_link(&self, index: u32) {
        self.handlers.write().unwrap().remove(&index);
    }

    /// Removes every registration.
    pub fn empty_link(&self) {
        self.handlers.write().unwrap().clear();
    }

    fn dispatch(handlers: &RwLock<HashMap<u32, LinkHandlers>>, event: &MonitorEvent) {
        // Only IPv4 address events reach callbacks.
        if let MonitorEvent::NewAddr { addr, .. } | MonitorEvent::DelAddr { addr, .. } = event {
            if !addr.is_ipv4() {
                return;
            }
        }
        // Clone the bundle out so no lock is held while callbacks run;
        // a callback may re-enter add_link/del_link.
        let bundle = {
            let map = handlers.read().unwrap();
            let Some(bundle) = map.get(&event.index()) else {
                // Unregistered index, silently dropped.
                return;
            };
            bundle.clone()
        };
        match event {
            MonitorEvent::NewLink(attrs) => {
                if let Some(cb) = &bundle.new_link {
                    cb(attrs);
                }
            }
            MonitorEvent::DelLink(attrs) => {
                if let Some(cb) = &bundle.del_link {
                    cb(attrs);
                }
            }
            MonitorEvent::NewAddr { index, addr } => {
                if let Some(cb) = &bundle.new_addr {
                    cb(*index, *addr);
                }
            }
            MonitorEvent::DelAddr { index, addr } => {
                if let Some(cb) = &bundle.del_addr {
                    cb(*index, *addr);
                }
            }
            MonitorEvent::NewRoute(route) => {
                if let Some(cb) = &bundle.new_route {
                    cb(route);
                }
            }
            MonitorEvent::DelRoute(route) => {
                if let Some(cb) = &bundle.del_route {
                    cb(route);
                }
            }
        }
    }
}

/// Matching rule for interfaces a subscriber cares about.
#[derive(Debug, Clone)]
pub struct MonitorPattern {
    /// Interface kind to match; `None` matches any kind.
    pub type_rule: Option<LinkKind>,
    /// Name to match: exact, or a prefix when ending in `*`. Empty matches
    /// any name.
    pub name_rule: String,
}

impl MonitorPattern {
    /// Returns true if the rule matches the observed attributes.
    #[must_use]
    pub fn matches(&self, attrs: &LinkAttrs) -> bool {
        if let Some(kind) = self.type_rule {
            if attrs.kind != kind {
                return false;
            }
        }
        if self.name_rule.is_empty() {
            return true;
        }
        match self.name_rule.strip_suffix('*') {
            Some(prefix) => attrs.name.starts_with(prefix),
            None => attrs.name == self.name_rule,
        }
    }
}

/// Name/type pattern registry layered over [`LinkMonitor`].
pub struct PatternRegistry {
    backend: Arc<dyn LinkBackend>,
    patterns: RwLock<HashMap<String, MonitorPattern>>,
}

impl PatternRegistry {
    /// Creates an empty registry scanning through `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn LinkBackend>) -> Self {
        Self {
            backend,
            patterns: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a pattern under a caller-chosen key, replacing any
    /// previous pattern for that key.
    pub fn add_pattern(&self, key: impl Into<String>, pattern: MonitorPattern) {
        self.patterns.write().unwrap().insert(key.into(), pattern);
    }

    /// Removes the pattern for a key.
    pub fn delete_pattern(&self, key: &str) {
        self.patterns.write().unwrap().remove(key);
    }

    /// Returns the pattern for a key.
    #[must_use]
    pub fn get_pattern(&self, key: &str) -> Option<MonitorPattern> {
        self.patterns.read().unwrap().get(key).cloned()
    }

    /// Re-scans the OS link table, invoking `f` with the key and observed
    /// attributes for every (pattern, link) match.
    ///
    /// # Errors
    ///
    /// Returns an error if the link table cannot be listed.
    pub fn scan_links<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &LinkAttrs),
    {
        let links = self.backend.link_list()?;
        let patterns = self.patterns.read().unwrap();
        for (key, pattern) in patterns.iter() {
            for attrs in &links {
                if pattern.matches(attrs) {
                    f(key, attrs);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeBackend;
    use crate::error::NetError;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelSource(mpsc::Receiver<MonitorEvent>);

    #[async_trait]
    impl EventSource for ChannelSource {
        async fn recv(&mut self) -> Result<MonitorEvent> {
            self.0
                .recv()
                .await
                .ok_or_else(|| NetError::Monitor("event source closed".into()))
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (_tx, rx) = mpsc::channel(8);
        let (_tx2, rx2) = mpsc::channel(8);
        let monitor = LinkMonitor::new();
        assert!(monitor.start(Box::new(ChannelSource(rx))));
        assert!(!monitor.start(Box::new(ChannelSource(rx2))));
        monitor.stop();
    }

    #[tokio::test]
    async fn test_dispatch_by_index() {
        let (tx, rx) = mpsc::channel(8);
        let monitor = LinkMonitor::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_links = Arc::clone(&seen);
        let seen_addrs = Arc::new(Mutex::new(Vec::new()));
        let seen_addrs2 = Arc::clone(&seen_addrs);
        monitor.add_link(
            3,
            LinkHandlers {
                new_link: Some(Arc::new(move |attrs| {
                    seen_links.lock().unwrap().push(attrs.name.clone());
                })),
                new_addr: Some(Arc::new(move |index, addr| {
                    seen_addrs2.lock().unwrap().push((index, addr));
                })),
                ..LinkHandlers::default()
            },
        );
        monitor.start(Box::new(ChannelSource(rx)));

        let mut attrs = LinkAttrs::new("eth3", LinkKind::Device);
        attrs.index = 3;
        tx.send(MonitorEvent::NewLink(attrs)).await.unwrap();

        // Unregistered index: silently dropped.
        let mut other = LinkAttrs::new("eth4", LinkKind::Device);
        other.index = 4;
        tx.send(MonitorEvent::NewLink(other)).await.unwrap();

        // Non-IPv4 addresses are filtered before dispatch.
        tx.send(MonitorEvent::NewAddr {
            index: 3,
            addr: "fe80::1".parse().unwrap(),
        })
        .await
        .unwrap();
        tx.send(MonitorEvent::NewAddr {
            index: 3,
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        })
        .await
        .unwrap();

        wait_until(|| !seen_addrs.lock().unwrap().is_empty()).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["eth3"]);
        assert_eq!(
            seen_addrs.lock().unwrap().as_slice(),
            [(3, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))]
        );
        monitor.stop();
    }

    #[tokio::test]
    async fn test_registration_lifecycle() {
        let (tx, rx) = mpsc::channel(8);
        let monitor = LinkMonitor::new();
        let hits = Arc::new(Mutex::new(0u32));
        let hits2 = Arc::clone(&hits);
        monitor.add_link(
            7,
            LinkHandlers {
                del_link: Some(Arc::new(move |_| *hits2.lock().unwrap() += 1)),
                ..LinkHandlers::default()
            },
        );
        monitor.start(Box::new(ChannelSource(rx)));

        let mut attrs = LinkAttrs::new("bond7", LinkKind::Bond);
        attrs.index = 7;
        tx.send(MonitorEvent::DelLink(attrs.clone())).await.unwrap();
        wait_until(|| *hits.lock().unwrap() == 1).await;

        monitor.del_link(7);
        tx.send(MonitorEvent::DelLink(attrs.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*hits.lock().unwrap(), 1);

        monitor.empty_link();
        monitor.stop();
    }

    #[tokio::test]
    async fn test_callback_may_mutate_registrations() {
        let (tx, rx) = mpsc::channel(8);
        let monitor = Arc::new(LinkMonitor::new());
        let hits = Arc::new(Mutex::new(0u32));
        let hits2 = Arc::clone(&hits);
        let inner = Arc::clone(&monitor);
        monitor.add_link(
            5,
            LinkHandlers {
                del_link: Some(Arc::new(move |_| {
                    // One-shot handler: deregisters itself from inside the
                    // dispatch path.
                    inner.del_link(5);
                    *hits2.lock().unwrap() += 1;
                })),
                ..LinkHandlers::default()
            },
        );
        monitor.start(Box::new(ChannelSource(rx)));

        let mut attrs = LinkAttrs::new("eth5", LinkKind::Device);
        attrs.index = 5;
        tx.send(MonitorEvent::DelLink(attrs.clone())).await.unwrap();
        tx.send(MonitorEvent::DelLink(attrs)).await.unwrap();

        wait_until(|| *hits.lock().unwrap() == 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*hits.lock().unwrap(), 1);
        monitor.stop();
    }

    #[test]
    fn test_pattern_matching() {
        let exact = MonitorPattern {
            type_rule: Some(LinkKind::Bridge),
            name_rule: "tenant1-br".into(),
        };
        let prefix = MonitorPattern {
            type_rule: None,
            name_rule: "tenant*".into(),
        };

        let mut bridge = LinkAttrs::new("tenant1-br", LinkKind::Bridge);
        bridge.index = 1;
        let mut bond = LinkAttrs::new("tenant1-bo", LinkKind::Bond);
        bond.index = 2;

        assert!(exact.matches(&bridge));
        assert!(!exact.matches(&bond));
        assert!(prefix.matches(&bridge));
        assert!(prefix.matches(&bond));
    }

    #[test]
    fn test_scan_links() {
        let fake = Arc::new(FakeBackend::new());
        fake.add_device("eth0", [0, 0, 0, 0, 0, 1]);
        fake.add_device("eth1", [0, 0, 0, 0, 0, 2]);

        let registry = PatternRegistry::new(fake);
        registry.add_pattern(
            "nics",
            MonitorPattern {
                type_rule: Some(LinkKind::Device),
                name_rule: "eth*".into(),
            },
        );
        assert!(registry.get_pattern("nics").is_some());

        let mut matched = Vec::new();
        registry
            .scan_links(|key, attrs| matched.push((key.to_string(), attrs.name.clone())))
            .unwrap();
        matched.sort();
        assert_eq!(
            matched,
            vec![
                ("nics".to_string(), "eth0".to_string()),
                ("nics".to_string(), "eth1".to_string())
            ]
        );

        registry.delete_pattern("nics");
        assert!(registry.get_pattern("nics").is_none());
    }
}
