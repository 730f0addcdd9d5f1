//! External network exposure
//!
//! Opens instance ports on the local firewall and, when router automation is
//! switched on, forwards them on the edge router. Everything here is
//! best-effort: callers turn failures into a warning on the instance rather
//! than failing the lifecycle operation.

use crate::config::{FirewallBackend, NetworkConfig};
use crate::db::SettingsStore;
use crate::error::{OrchestratorError, Result};
use crate::instance::{Protocol, Transport};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Local host firewall
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Allow inbound traffic; opening an open port succeeds
    async fn open(&self, port: u16, transport: Transport) -> Result<()>;

    /// Remove the allow rule; closing a closed port succeeds
    async fn close(&self, port: u16, transport: Transport) -> Result<()>;
}

/// Firewall driven through the `ufw` command
pub struct UfwFirewall {
    use_sudo: bool,
}

impl UfwFirewall {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    fn command(&self) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("ufw");
            cmd
        } else {
            Command::new("ufw")
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| OrchestratorError::NetworkExposureFailure(format!("failed to run ufw: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() && !is_ufw_noop(&stdout, &stderr) {
            return Err(OrchestratorError::NetworkExposureFailure(format!(
                "ufw {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

/// ufw reports already-present and already-absent rules as text
fn is_ufw_noop(stdout: &str, stderr: &str) -> bool {
    let text = format!("{}{}", stdout, stderr);
    text.contains("Skipping") || text.contains("non-existent rule")
}

#[async_trait]
impl Firewall for UfwFirewall {
    async fn open(&self, port: u16, transport: Transport) -> Result<()> {
        let rule = format!("{}/{}", port, transport);
        let output = self.run(&["allow".to_string(), rule.clone()]).await?;
        debug!(rule, output = output.trim(), "ufw allow");
        Ok(())
    }

    async fn close(&self, port: u16, transport: Transport) -> Result<()> {
        let rule = format!("{}/{}", port, transport);
        let output = self
            .run(&["delete".to_string(), "allow".to_string(), rule.clone()])
            .await?;
        debug!(rule, output = output.trim(), "ufw delete allow");
        Ok(())
    }
}

/// Firewall for hosts where the operator manages rules by hand
pub struct NoopFirewall;

#[async_trait]
impl Firewall for NoopFirewall {
    async fn open(&self, _port: u16, _transport: Transport) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _port: u16, _transport: Transport) -> Result<()> {
        Ok(())
    }
}

/// One forwarding entry on the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterMapping {
    pub external_port: u16,
    pub transport: Transport,
    pub internal_client: String,
    pub internal_port: u16,
    pub description: String,
}

/// Router port forwarding
#[async_trait]
pub trait Router: Send + Sync {
    async fn list_mappings(&self) -> Result<Vec<RouterMapping>>;

    /// Forward `port` to the same port on this host
    async fn add_mapping(&self, port: u16, transport: Transport, description: &str) -> Result<()>;

    async fn remove_mapping(&self, port: u16, transport: Transport) -> Result<()>;
}

/// Router driven through the miniupnpc `upnpc` client
pub struct UpnpcRouter {
    binary: String,
}

impl UpnpcRouter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                OrchestratorError::NetworkExposureFailure(format!("failed to run {}: {}", self.binary, e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::NetworkExposureFailure(format!(
                "{} {} failed: {}",
                self.binary,
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl Router for UpnpcRouter {
    async fn list_mappings(&self) -> Result<Vec<RouterMapping>> {
        let output = self.run(&["-l".to_string()]).await?;
        Ok(parse_upnpc_listing(&output))
    }

    async fn add_mapping(&self, port: u16, transport: Transport, description: &str) -> Result<()> {
        let output = self
            .run(&[
                "-e".to_string(),
                description.to_string(),
                "-r".to_string(),
                port.to_string(),
                transport.as_upper().to_string(),
            ])
            .await?;
        // upnpc exits 0 even when the gateway rejects the request
        if output.contains("failed with code") {
            return Err(OrchestratorError::NetworkExposureFailure(format!(
                "router rejected mapping {}/{}: {}",
                port,
                transport,
                output.trim()
            )));
        }
        Ok(())
    }

    async fn remove_mapping(&self, port: u16, transport: Transport) -> Result<()> {
        self.run(&["-d".to_string(), port.to_string(), transport.as_upper().to_string()])
            .await?;
        Ok(())
    }
}

/// Parse the mapping table printed by `upnpc -l`
///
/// Entries look like ` 0 TCP 25565->192.168.1.10:25565 'desc' '' 0`;
/// everything else in the output is ignored.
pub fn parse_upnpc_listing(output: &str) -> Vec<RouterMapping> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            fields.next()?.parse::<usize>().ok()?;
            let transport = match fields.next()? {
                "TCP" => Transport::Tcp,
                "UDP" => Transport::Udp,
                _ => return None,
            };
            let (external, internal) = fields.next()?.split_once("->")?;
            let (client, internal_port) = internal.rsplit_once(':')?;
            let description = line
                .split_once('\'')
                .and_then(|(_, rest)| rest.split_once('\''))
                .map(|(desc, _)| desc.to_string())
                .unwrap_or_default();

            Some(RouterMapping {
                external_port: external.parse().ok()?,
                transport,
                internal_client: client.to_string(),
                internal_port: internal_port.parse().ok()?,
                description,
            })
        })
        .collect()
}

fn combine_failures(failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::NetworkExposureFailure(failures.join("; ")))
    }
}

/// Whether any mapping forwards `port`
pub fn is_port_mapped(mappings: &[RouterMapping], port: u16) -> bool {
    mappings.iter().any(|m| m.external_port == port)
}

/// Warnings collected while exposing or unexposing one port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExposureReport {
    pub warnings: Vec<String>,
}

impl ExposureReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Single-line summary suitable for the instance's warning flag
    pub fn summary(&self) -> Option<String> {
        if self.warnings.is_empty() {
            None
        } else {
            Some(self.warnings.join("; "))
        }
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.warnings.push(e.to_string());
        }
    }
}

/// Read-only view of a port's external reachability
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExposureStatus {
    pub port: u16,
    pub router_automation: bool,
    /// `None` when the router could not be queried
    pub router_mapped: Option<bool>,
}

/// Coordinates firewall rules and router forwarding for instance ports
pub struct NetworkExposureManager {
    firewall: Arc<dyn Firewall>,
    router: Arc<dyn Router>,
    settings: Arc<dyn SettingsStore>,
}

impl NetworkExposureManager {
    pub fn new(firewall: Arc<dyn Firewall>, router: Arc<dyn Router>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            firewall,
            router,
            settings,
        }
    }

    /// Build the manager with the backends named in configuration
    pub fn from_config(config: &NetworkConfig, settings: Arc<dyn SettingsStore>) -> Self {
        let firewall: Arc<dyn Firewall> = match config.firewall {
            FirewallBackend::Ufw => Arc::new(UfwFirewall::new(config.use_sudo)),
            FirewallBackend::None => Arc::new(NoopFirewall),
        };
        Self::new(firewall, Arc::new(UpnpcRouter::new(config.upnpc_path.clone())), settings)
    }

    pub fn router_automation_enabled(&self) -> bool {
        match self.settings.router_automation_enabled() {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(error = %e, "Failed to read router automation flag, treating as disabled");
                false
            }
        }
    }

    pub fn set_router_automation(&self, enabled: bool) -> Result<()> {
        self.settings.set_router_automation(enabled)?;
        info!(enabled, "Router automation updated");
        Ok(())
    }

    /// Open every transport of `protocol`; one failing transport does not
    /// keep the other from being opened
    pub async fn open_firewall_port(&self, port: u16, protocol: Protocol) -> Result<()> {
        let mut failures = Vec::new();
        for transport in protocol.transports() {
            if let Err(e) = self.firewall.open(port, *transport).await {
                failures.push(format!("{}: {}", transport, e));
            }
        }
        combine_failures(failures)?;
        debug!(port, %protocol, "Firewall port opened");
        Ok(())
    }

    pub async fn close_firewall_port(&self, port: u16, protocol: Protocol) -> Result<()> {
        let mut failures = Vec::new();
        for transport in protocol.transports() {
            if let Err(e) = self.firewall.close(port, *transport).await {
                failures.push(format!("{}: {}", transport, e));
            }
        }
        combine_failures(failures)?;
        debug!(port, %protocol, "Firewall port closed");
        Ok(())
    }

    /// Forward `port` on the router; no-op unless router automation is on
    ///
    /// Transports that are already forwarded are skipped.
    pub async fn open_router_port(&self, port: u16, protocol: Protocol, description: &str) -> Result<()> {
        if !self.router_automation_enabled() {
            return Ok(());
        }

        let existing = self.router.list_mappings().await.unwrap_or_else(|e| {
            warn!(port, error = %e, "Could not list router mappings, forwarding anyway");
            Vec::new()
        });

        for transport in protocol.transports() {
            if is_transport_mapped(&existing, port, *transport) {
                debug!(port, %transport, "Router mapping already present");
                continue;
            }
            self.router.add_mapping(port, *transport, description).await?;
            info!(port, %transport, "Router port forwarded");
        }
        Ok(())
    }

    /// Remove forwarding for `port`; no-op unless router automation is on
    pub async fn close_router_port(&self, port: u16, protocol: Protocol) -> Result<()> {
        if !self.router_automation_enabled() {
            return Ok(());
        }

        let existing = match self.router.list_mappings().await {
            Ok(mappings) => Some(mappings),
            Err(e) => {
                warn!(port, error = %e, "Could not list router mappings, removing anyway");
                None
            }
        };

        for transport in protocol.transports() {
            if let Some(mappings) = &existing {
                if !is_transport_mapped(mappings, port, *transport) {
                    continue;
                }
            }
            self.router.remove_mapping(port, *transport).await?;
            info!(port, %transport, "Router port forwarding removed");
        }
        Ok(())
    }

    pub async fn list_router_mappings(&self) -> Result<Vec<RouterMapping>> {
        self.router.list_mappings().await
    }

    /// Open firewall then router, collecting failures as warnings
    pub async fn expose(&self, port: u16, protocol: Protocol, description: &str) -> ExposureReport {
        let mut report = ExposureReport::default();
        report.record(self.open_firewall_port(port, protocol).await);
        report.record(self.open_router_port(port, protocol, description).await);
        for warning in &report.warnings {
            warn!(port, %protocol, warning, "Network exposure incomplete");
        }
        report
    }

    /// Close firewall then router, collecting failures as warnings
    pub async fn unexpose(&self, port: u16, protocol: Protocol) -> ExposureReport {
        let mut report = ExposureReport::default();
        report.record(self.close_firewall_port(port, protocol).await);
        report.record(self.close_router_port(port, protocol).await);
        for warning in &report.warnings {
            warn!(port, %protocol, warning, "Network unexposure incomplete");
        }
        report
    }

    pub async fn exposure_status(&self, port: u16) -> ExposureStatus {
        let router_automation = self.router_automation_enabled();
        let router_mapped = match self.router.list_mappings().await {
            Ok(mappings) => Some(is_port_mapped(&mappings, port)),
            Err(e) => {
                debug!(port, error = %e, "Router query failed");
                None
            }
        };
        ExposureStatus {
            port,
            router_automation,
            router_mapped,
        }
    }
}

fn is_transport_mapped(mappings: &[RouterMapping], port: u16, transport: Transport) -> bool {
    mappings
        .iter()
        .any(|m| m.external_port == port && m.transport == transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    const LISTING: &str = "\
upnpc : miniupnpc library test client, version 2.2.4.
List of UPNP devices found on the network :
 desc: http://192.168.1.1:5000/rootDesc.xml
 st: urn:schemas-upnp-org:device:InternetGatewayDevice:1

Found valid IGD : http://192.168.1.1:5000/ctl/IPConn
Local LAN ip address : 192.168.1.10
 i protocol exPort->inAddr:inPort description remoteHost leaseTime
 0 TCP 25565->192.168.1.10:25565 'serverdock-alpha' '' 0
 1 UDP 34197->192.168.1.10:34197 'serverdock-factory' '' 0
GetGenericPortMappingEntry() returned 713 (SpecifiedArrayIndexInvalid)
";

    #[test]
    fn test_parse_upnpc_listing() {
        let mappings = parse_upnpc_listing(LISTING);
        assert_eq!(mappings.len(), 2);
        assert_eq!(
            mappings[0],
            RouterMapping {
                external_port: 25565,
                transport: Transport::Tcp,
                internal_client: "192.168.1.10".to_string(),
                internal_port: 25565,
                description: "serverdock-alpha".to_string(),
            }
        );
        assert_eq!(mappings[1].transport, Transport::Udp);
        assert!(is_port_mapped(&mappings, 34197));
        assert!(!is_port_mapped(&mappings, 20000));
    }

    #[test]
    fn test_parse_empty_listing() {
        assert!(parse_upnpc_listing("No IGD UPnP Device found on the network !\n").is_empty());
    }

    #[test]
    fn test_ufw_noop_detection() {
        assert!(is_ufw_noop("Skipping adding existing rule\n", ""));
        assert!(is_ufw_noop("", "Could not delete non-existent rule\n"));
        assert!(!is_ufw_noop("", "ERROR: You need to be root to run this script"));
    }

    #[derive(Default)]
    struct RecordingFirewall {
        calls: Mutex<Vec<String>>,
        broken: Mutex<Option<Transport>>,
    }

    impl RecordingFirewall {
        fn check(&self, transport: Transport) -> Result<()> {
            if *self.broken.lock() == Some(transport) {
                return Err(OrchestratorError::NetworkExposureFailure(format!("{} rules unavailable", transport)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Firewall for RecordingFirewall {
        async fn open(&self, port: u16, transport: Transport) -> Result<()> {
            self.check(transport)?;
            self.calls.lock().push(format!("open {}/{}", port, transport));
            Ok(())
        }

        async fn close(&self, port: u16, transport: Transport) -> Result<()> {
            self.check(transport)?;
            self.calls.lock().push(format!("close {}/{}", port, transport));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryRouter {
        mappings: Mutex<Vec<RouterMapping>>,
        adds: Mutex<usize>,
    }

    #[async_trait]
    impl Router for MemoryRouter {
        async fn list_mappings(&self) -> Result<Vec<RouterMapping>> {
            Ok(self.mappings.lock().clone())
        }

        async fn add_mapping(&self, port: u16, transport: Transport, description: &str) -> Result<()> {
            *self.adds.lock() += 1;
            self.mappings.lock().push(RouterMapping {
                external_port: port,
                transport,
                internal_client: "10.0.0.2".to_string(),
                internal_port: port,
                description: description.to_string(),
            });
            Ok(())
        }

        async fn remove_mapping(&self, port: u16, transport: Transport) -> Result<()> {
            self.mappings
                .lock()
                .retain(|m| !(m.external_port == port && m.transport == transport));
            Ok(())
        }
    }

    struct FlagStore(AtomicBool);

    impl SettingsStore for FlagStore {
        fn router_automation_enabled(&self) -> Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }

        fn set_router_automation(&self, enabled: bool) -> Result<()> {
            self.0.store(enabled, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(router_on: bool) -> (NetworkExposureManager, Arc<RecordingFirewall>, Arc<MemoryRouter>) {
        let firewall = Arc::new(RecordingFirewall::default());
        let router = Arc::new(MemoryRouter::default());
        let manager = NetworkExposureManager::new(
            firewall.clone(),
            router.clone(),
            Arc::new(FlagStore(AtomicBool::new(router_on))),
        );
        (manager, firewall, router)
    }

    #[tokio::test]
    async fn test_both_expands_into_two_rules() {
        let (manager, firewall, router) = manager(true);
        let report = manager.expose(7777, Protocol::Both, "serverdock-x").await;
        assert!(report.is_clean());
        assert_eq!(*firewall.calls.lock(), vec!["open 7777/tcp", "open 7777/udp"]);
        assert_eq!(router.mappings.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_transport_does_not_skip_the_other() {
        let (manager, firewall, _) = manager(false);
        *firewall.broken.lock() = Some(Transport::Tcp);

        let report = manager.expose(7777, Protocol::Both, "serverdock-x").await;
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("tcp rules unavailable"));
        assert_eq!(*firewall.calls.lock(), vec!["open 7777/udp"]);

        let report = manager.unexpose(7777, Protocol::Both).await;
        assert!(!report.is_clean());
        assert_eq!(*firewall.calls.lock(), vec!["open 7777/udp", "close 7777/udp"]);
    }

    #[tokio::test]
    async fn test_router_is_skipped_when_automation_off() {
        let (manager, _, router) = manager(false);
        manager.expose(25565, Protocol::Tcp, "serverdock-alpha").await;
        assert!(router.mappings.lock().is_empty());
        assert_eq!(manager.exposure_status(25565).await.router_mapped, Some(false));
    }

    #[tokio::test]
    async fn test_open_router_port_is_idempotent() {
        let (manager, _, router) = manager(true);
        manager.open_router_port(25565, Protocol::Tcp, "a").await.unwrap();
        manager.open_router_port(25565, Protocol::Tcp, "a").await.unwrap();
        assert_eq!(*router.adds.lock(), 1);
    }

    #[tokio::test]
    async fn test_unexpose_removes_mapping() {
        let (manager, firewall, _) = manager(true);
        manager.expose(25565, Protocol::Tcp, "a").await;
        manager.unexpose(25565, Protocol::Tcp).await;
        let calls = firewall.calls.lock().clone();
        assert_eq!(calls.iter().filter(|c| *c == "close 25565/tcp").count(), 1);
        let status = manager.exposure_status(25565).await;
        assert_eq!(status.router_mapped, Some(false));
    }

    #[tokio::test]
    async fn test_toggle_router_automation() {
        let (manager, _, _) = manager(false);
        assert!(!manager.router_automation_enabled());
        manager.set_router_automation(true).unwrap();
        assert!(manager.exposure_status(1).await.router_automation);
    }
}
