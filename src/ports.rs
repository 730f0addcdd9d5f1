//! Host port pool
//!
//! Every live instance holds one primary host port. The allocator records
//! which instance owns which port and probes the host before handing a port
//! out, so that neither another instance nor a foreign process collides
//! with it.
//!
//! Hostname-routed instances also register the port the shared proxy listens
//! on for them. Listen ports are never handed out as host ports, not even to
//! the instance that registered them.

use crate::config::PortsConfig;
use crate::error::{OrchestratorError, Result};
use crate::instance::{Protocol, Transport};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener, UdpSocket};
use std::sync::Arc;
use tracing::{debug, info};

/// Checks whether a port can be bound on this host
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16, transport: Transport) -> bool;
}

/// Probes by binding the port on all interfaces
pub struct SystemProbe;

impl PortProbe for SystemProbe {
    fn is_free(&self, port: u16, transport: Transport) -> bool {
        match transport {
            Transport::Tcp => TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok(),
            Transport::Udp => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub port: u16,
    pub owner: String,
    pub protocol: Protocol,
}

/// Port pool with a live-allocation set
pub struct PortAllocator {
    start: u16,
    end: u16,
    reserved: HashSet<u16>,
    allocations: Mutex<Vec<Allocation>>,
    /// Proxy listen ports, keyed by the routed instance
    listeners: Mutex<Vec<Allocation>>,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(config: &PortsConfig, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            start: config.start,
            end: config.end,
            reserved: config.reserved.iter().copied().collect(),
            allocations: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            probe,
        }
    }

    /// Whether `port` is bindable on the host for every transport of
    /// `protocol`; `both` requires tcp and udp to be free
    pub fn is_port_available(&self, port: u16, protocol: Protocol) -> bool {
        port != 0
            && protocol
                .transports()
                .iter()
                .all(|transport| self.probe.is_free(port, *transport))
    }

    /// Allocate a port for `owner`, trying `preferred` first and then the
    /// lowest free port of the pool
    ///
    /// Ports in `exclude` are skipped even if they look free. Any port the
    /// owner held before is replaced by the new one.
    pub fn allocate_port(
        &self,
        owner: &str,
        preferred: Option<u16>,
        protocol: Protocol,
        exclude: &[u16],
    ) -> Result<u16> {
        let mut allocations = self.allocations.lock();
        let listeners = self.listeners.lock();

        let usable = |port: u16, allocations: &[Allocation]| {
            !exclude.contains(&port)
                && !self.reserved.contains(&port)
                && !Self::taken_by_other(allocations, port, protocol, owner)
                && !Self::overlaps_any(&listeners, port, protocol)
                && self.is_port_available(port, protocol)
        };

        let chosen = preferred
            .filter(|port| usable(*port, allocations.as_slice()))
            .or_else(|| (self.start..=self.end).find(|port| usable(*port, allocations.as_slice())));

        let Some(port) = chosen else {
            return Err(OrchestratorError::PoolExhausted {
                start: self.start,
                end: self.end,
            });
        };

        allocations.retain(|a| a.owner != owner);
        allocations.push(Allocation {
            port,
            owner: owner.to_string(),
            protocol,
        });

        if preferred.is_some_and(|p| p != port) {
            info!(instance = owner, port, preferred = ?preferred, "Preferred port unavailable, allocated from pool");
        } else {
            debug!(instance = owner, port, %protocol, "Allocated port");
        }
        Ok(port)
    }

    /// Record an existing assignment without probing the host
    ///
    /// Used when restoring persisted instances whose containers may already
    /// hold their ports.
    pub fn reserve(&self, owner: &str, port: u16, protocol: Protocol) {
        let mut allocations = self.allocations.lock();
        allocations.retain(|a| a.owner != owner);
        allocations.push(Allocation {
            port,
            owner: owner.to_string(),
            protocol,
        });
    }

    /// Whether `owner` may keep using `port`: nobody else holds it and the
    /// host can bind it
    pub fn revalidate(&self, owner: &str, port: u16, protocol: Protocol) -> bool {
        let allocations = self.allocations.lock();
        let listeners = self.listeners.lock();
        !Self::taken_by_other(&allocations, port, protocol, owner)
            && !Self::overlaps_any(&listeners, port, protocol)
            && !self.reserved.contains(&port)
            && self.is_port_available(port, protocol)
    }

    /// Register the proxy listen port of a hostname-routed instance
    ///
    /// Fails when another instance holds `port` as its host port. The
    /// owner's own host port may collide; it moves on its next start.
    pub fn claim_listener(&self, owner: &str, port: u16, protocol: Protocol) -> Result<()> {
        let allocations = self.allocations.lock();
        let mut listeners = self.listeners.lock();
        if Self::taken_by_other(&allocations, port, protocol, owner) {
            return Err(OrchestratorError::ResourceConflict { port, protocol });
        }
        listeners.retain(|l| l.owner != owner);
        listeners.push(Allocation {
            port,
            owner: owner.to_string(),
            protocol,
        });
        debug!(instance = owner, port, %protocol, "Proxy listen port claimed");
        Ok(())
    }

    pub fn release_listener(&self, owner: &str) {
        self.listeners.lock().retain(|l| l.owner != owner);
    }

    /// Replace all host and listen port assignments
    pub fn reset(&self, allocations: Vec<Allocation>, listeners: Vec<Allocation>) {
        let mut current = self.allocations.lock();
        let mut current_listeners = self.listeners.lock();
        *current = allocations;
        *current_listeners = listeners;
    }

    /// Drop every allocation and listen port held by `owner`
    pub fn release(&self, owner: &str) -> Option<u16> {
        self.release_listener(owner);
        let mut allocations = self.allocations.lock();
        let index = allocations.iter().position(|a| a.owner == owner)?;
        let released = allocations.swap_remove(index);
        debug!(instance = owner, port = released.port, "Released port");
        Some(released.port)
    }

    /// Owners holding `port` under any protocol
    pub fn owners_of(&self, port: u16) -> Vec<String> {
        self.allocations
            .lock()
            .iter()
            .filter(|a| a.port == port)
            .map(|a| a.owner.clone())
            .collect()
    }

    pub fn allocations(&self) -> Vec<Allocation> {
        let mut all = self.allocations.lock().clone();
        all.sort_by_key(|a| a.port);
        all
    }

    pub fn listeners(&self) -> Vec<Allocation> {
        let mut all = self.listeners.lock().clone();
        all.sort_by_key(|l| l.port);
        all
    }

    fn overlaps_any(entries: &[Allocation], port: u16, protocol: Protocol) -> bool {
        entries.iter().any(|a| a.port == port && a.protocol.overlaps(protocol))
    }

    fn taken_by_other(allocations: &[Allocation], port: u16, protocol: Protocol, owner: &str) -> bool {
        allocations
            .iter()
            .any(|a| a.port == port && a.owner != owner && a.protocol.overlaps(protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Probe with a fixed set of busy (port, transport) pairs
    #[derive(Default)]
    struct FakeProbe {
        busy: Mutex<HashSet<(u16, Transport)>>,
    }

    impl FakeProbe {
        fn occupy(&self, port: u16, transport: Transport) {
            self.busy.lock().insert((port, transport));
        }
    }

    impl PortProbe for FakeProbe {
        fn is_free(&self, port: u16, transport: Transport) -> bool {
            !self.busy.lock().contains(&(port, transport))
        }
    }

    fn allocator(start: u16, end: u16) -> (PortAllocator, Arc<FakeProbe>) {
        let probe = Arc::new(FakeProbe::default());
        let config = PortsConfig {
            start,
            end,
            reserved: Vec::new(),
        };
        (PortAllocator::new(&config, probe.clone()), probe)
    }

    #[test]
    fn test_preferred_port_is_used_when_free() {
        let (ports, _) = allocator(20000, 20010);
        assert!(ports.is_port_available(25565, Protocol::Tcp));
        assert_eq!(ports.allocate_port("a", Some(25565), Protocol::Tcp, &[]).unwrap(), 25565);
    }

    #[test]
    fn test_second_instance_falls_back_to_lowest_pool_port() {
        let (ports, _) = allocator(20000, 20010);
        assert_eq!(ports.allocate_port("a", Some(25565), Protocol::Tcp, &[]).unwrap(), 25565);
        assert_eq!(ports.allocate_port("b", Some(25565), Protocol::Tcp, &[]).unwrap(), 20000);
        assert_eq!(ports.owners_of(20000), vec!["b".to_string()]);
    }

    #[test]
    fn test_pool_exhaustion() {
        let (ports, _) = allocator(20000, 20002);
        let mut seen = HashSet::new();
        for owner in ["a", "b", "c"] {
            let port = ports.allocate_port(owner, None, Protocol::Tcp, &[]).unwrap();
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        let err = ports.allocate_port("d", None, Protocol::Tcp, &[]).unwrap_err();
        assert!(matches!(err, OrchestratorError::PoolExhausted { start: 20000, end: 20002 }));
    }

    #[test]
    fn test_busy_host_ports_are_skipped() {
        let (ports, probe) = allocator(20000, 20010);
        probe.occupy(20000, Transport::Tcp);
        assert_eq!(ports.allocate_port("a", None, Protocol::Tcp, &[]).unwrap(), 20001);
    }

    #[test]
    fn test_both_needs_tcp_and_udp_free() {
        let (ports, probe) = allocator(20000, 20010);
        probe.occupy(20000, Transport::Udp);
        assert!(ports.is_port_available(20000, Protocol::Tcp));
        assert!(!ports.is_port_available(20000, Protocol::Both));
        assert_eq!(ports.allocate_port("a", None, Protocol::Both, &[]).unwrap(), 20001);
    }

    #[test]
    fn test_non_overlapping_protocols_share_a_port() {
        let (ports, _) = allocator(20000, 20010);
        assert_eq!(ports.allocate_port("a", None, Protocol::Tcp, &[]).unwrap(), 20000);
        assert_eq!(ports.allocate_port("b", None, Protocol::Udp, &[]).unwrap(), 20000);
        assert_eq!(ports.allocate_port("c", None, Protocol::Both, &[]).unwrap(), 20001);
    }

    #[test]
    fn test_release_makes_port_reusable() {
        let (ports, _) = allocator(20000, 20001);
        ports.allocate_port("a", None, Protocol::Tcp, &[]).unwrap();
        ports.allocate_port("b", None, Protocol::Tcp, &[]).unwrap();
        assert_eq!(ports.release("a"), Some(20000));
        assert_eq!(ports.allocate_port("c", None, Protocol::Tcp, &[]).unwrap(), 20000);
    }

    #[test]
    fn test_reallocation_replaces_owner_port_and_honours_exclusions() {
        let (ports, _) = allocator(20000, 20010);
        ports.allocate_port("a", None, Protocol::Tcp, &[]).unwrap();
        let port = ports.allocate_port("a", None, Protocol::Tcp, &[20000]).unwrap();
        assert_eq!(port, 20001);
        assert_eq!(ports.allocations().len(), 1);
        assert!(ports.owners_of(20000).is_empty());
    }

    #[test]
    fn test_reserved_ports_are_never_allocated() {
        let probe = Arc::new(FakeProbe::default());
        let config = PortsConfig {
            start: 20000,
            end: 20002,
            reserved: vec![20000, 20001],
        };
        let ports = PortAllocator::new(&config, probe);
        assert_eq!(ports.allocate_port("a", Some(20000), Protocol::Tcp, &[]).unwrap(), 20002);
    }

    #[test]
    fn test_listen_ports_are_never_host_ports() {
        let (ports, _) = allocator(20000, 20010);
        ports.claim_listener("a", 25565, Protocol::Tcp).unwrap();

        // Not even the routed instance itself gets its listen port
        assert_eq!(ports.allocate_port("a", Some(25565), Protocol::Tcp, &[]).unwrap(), 20000);
        assert_eq!(ports.allocate_port("b", Some(25565), Protocol::Tcp, &[]).unwrap(), 20001);
        // Other protocols on the same number are unaffected
        assert_eq!(ports.allocate_port("c", Some(25565), Protocol::Udp, &[]).unwrap(), 25565);

        ports.release("a");
        assert_eq!(ports.allocate_port("d", Some(25565), Protocol::Tcp, &[]).unwrap(), 25565);
    }

    #[test]
    fn test_listener_conflicts_with_other_host_port() {
        let (ports, _) = allocator(20000, 20010);
        ports.reserve("plain", 25565, Protocol::Tcp);
        let err = ports.claim_listener("routed", 25565, Protocol::Tcp).unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceConflict { port: 25565, .. }));

        // The owner's own host port does not block its claim but fails revalidation
        ports.reserve("routed", 34197, Protocol::Udp);
        ports.claim_listener("routed", 34197, Protocol::Udp).unwrap();
        assert!(!ports.revalidate("routed", 34197, Protocol::Udp));
    }

    #[test]
    fn test_reset_replaces_assignments() {
        let (ports, _) = allocator(20000, 20010);
        ports.allocate_port("gone", None, Protocol::Tcp, &[]).unwrap();
        ports.reset(
            vec![Allocation {
                port: 20001,
                owner: "a".to_string(),
                protocol: Protocol::Tcp,
            }],
            Vec::new(),
        );
        assert!(ports.owners_of(20000).is_empty());
        assert_eq!(ports.allocate_port("b", None, Protocol::Tcp, &[]).unwrap(), 20000);
        assert_eq!(ports.allocate_port("c", None, Protocol::Tcp, &[]).unwrap(), 20002);
    }

    #[test]
    fn test_revalidate() {
        let (ports, probe) = allocator(20000, 20010);
        ports.reserve("a", 20005, Protocol::Tcp);
        assert!(ports.revalidate("a", 20005, Protocol::Tcp));
        assert!(!ports.revalidate("b", 20005, Protocol::Tcp));
        probe.occupy(20005, Transport::Tcp);
        assert!(!ports.revalidate("a", 20005, Protocol::Tcp));
    }

    #[test]
    fn test_system_probe_detects_bound_listener() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!SystemProbe.is_free(port, Transport::Tcp));
    }
}
