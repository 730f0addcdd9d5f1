//! Shared stream proxy
//!
//! One nginx container multiplexes hostname-routed instances. Its
//! configuration is derived from the set of running instances on every sync
//! and written whole, so instances that stopped drop out of routing.
//!
//! All syncs go through a single actor task; callers hold a cheap
//! [`ProxyHandle`]. Other processes are kept out by the proxy lease.

use crate::config::ProxyConfig;
use crate::db::InstanceStore;
use crate::docker::{ContainerRuntime, ContainerSpec, ContainerStatus, PortMapping, VolumeBinding, MANAGED_LABEL};
use crate::error::{OrchestratorError, Result};
use crate::instance::{InstanceRecord, Protocol, Transport};
use crate::lease::{LeaseDir, PROXY_LEASE};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const CONFIG_FILE: &str = "nginx.conf";

/// One listener in the generated configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub listen_port: u16,
    pub protocol: Protocol,
    pub instance: String,
    pub hostname: String,
    /// `container-name:internal-port`
    pub upstream: String,
}

impl ProxyRoute {
    pub fn upstream_name(&self) -> String {
        format!("route_{}_{}", self.listen_port, self.protocol)
    }
}

/// Routes for the given records plus the ids shadowed by a lower id
///
/// Only `running` records with a hostname take part. A listener carries at
/// most one backend per port and transport.
pub fn collect_routes(records: &[InstanceRecord]) -> (Vec<ProxyRoute>, Vec<String>) {
    let mut candidates: Vec<&InstanceRecord> = records
        .iter()
        .filter(|r| r.status == crate::instance::Status::Running)
        .filter(|r| r.hostname.as_deref().is_some_and(|h| !h.is_empty()))
        .collect();
    candidates.sort_by(|a, b| a.id.cmp(&b.id));

    let mut claimed: HashSet<(u16, Transport)> = HashSet::new();
    let mut routes: BTreeMap<(u16, &'static str), ProxyRoute> = BTreeMap::new();
    let mut shadowed = Vec::new();

    for record in candidates {
        let port = record.internal_port();
        let transports = record.protocol.transports();
        if transports.iter().any(|t| claimed.contains(&(port, *t))) {
            warn!(instance = %record.id, port, protocol = %record.protocol, "Proxy listener already taken, route shadowed");
            shadowed.push(record.id.clone());
            continue;
        }
        claimed.extend(transports.iter().map(|t| (port, *t)));

        routes.insert(
            (port, record.protocol.as_str()),
            ProxyRoute {
                listen_port: port,
                protocol: record.protocol,
                instance: record.id.clone(),
                hostname: record.hostname.clone().unwrap_or_default(),
                upstream: format!("{}:{}", record.container_name(), port),
            },
        );
    }

    (routes.into_values().collect(), shadowed)
}

/// Render a complete nginx configuration for `routes`
pub fn render_config(routes: &[ProxyRoute]) -> String {
    let mut out = String::new();
    out.push_str("worker_processes auto;\n\n");
    out.push_str("events {\n    worker_connections 1024;\n}\n\n");
    out.push_str("stream {\n");
    out.push_str("    resolver 127.0.0.11 valid=10s;\n");

    for route in routes {
        let name = route.upstream_name();
        let _ = write!(
            out,
            "\n    # {} -> {}\n    upstream {} {{\n        server {};\n    }}\n",
            route.hostname, route.instance, name, route.upstream
        );
        for transport in route.protocol.transports() {
            let suffix = match transport {
                Transport::Tcp => "",
                Transport::Udp => " udp",
            };
            let _ = write!(
                out,
                "\n    server {{\n        listen {}{};\n        proxy_pass {};\n    }}\n",
                route.listen_port, suffix, name
            );
        }
    }

    out.push_str("}\n");
    out
}

/// Configuration for the running, hostname-bearing subset of `records`
pub fn build_config(records: &[InstanceRecord]) -> String {
    let (routes, _) = collect_routes(records);
    render_config(&routes)
}

/// Outcome of one sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySyncReport {
    pub routes: Vec<ProxyRoute>,
    pub shadowed: Vec<String>,
    /// Whether the proxy container is running after the sync
    pub proxy_running: bool,
}

/// Owns the proxy container and its configuration volume
pub struct ProxyCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn InstanceStore>,
    config: ProxyConfig,
    network: String,
    leases: Option<LeaseDir>,
}

impl ProxyCoordinator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn InstanceStore>,
        config: ProxyConfig,
        network: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            store,
            config,
            network: network.into(),
            leases: None,
        }
    }

    pub fn with_leases(mut self, leases: LeaseDir) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Regenerate the configuration from current state and apply it
    pub async fn sync(&self) -> Result<ProxySyncReport> {
        let _lease = match &self.leases {
            Some(leases) => Some(leases.acquire(PROXY_LEASE).await?),
            None => None,
        };
        self.remove_legacy_containers().await;

        let records = self.store.list_running_with_hostname()?;
        let (routes, shadowed) = collect_routes(&records);

        if routes.is_empty() {
            self.remove_proxy().await?;
            info!("No hostname routes, proxy removed");
            return Ok(ProxySyncReport {
                routes,
                shadowed,
                proxy_running: false,
            });
        }

        let rendered = render_config(&routes);
        self.runtime
            .write_volume_file(&self.config.config_volume, CONFIG_FILE, &rendered, None)
            .await
            .map_err(|e| OrchestratorError::ProxyWriteFailure(e.to_string()))?;

        self.runtime
            .ensure_network(&self.network)
            .await
            .map_err(|e| OrchestratorError::ProxyWriteFailure(e.to_string()))?;

        let container_id = self
            .runtime
            .create_and_start(&self.container_spec(&routes))
            .await
            .map_err(|e| OrchestratorError::ProxyWriteFailure(e.to_string()))?;

        info!(container_id, routes = routes.len(), "Proxy synced");
        Ok(ProxySyncReport {
            routes,
            shadowed,
            proxy_running: true,
        })
    }

    /// Start the single-writer actor and return a handle to it
    pub fn spawn(self) -> ProxyHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx));
        ProxyHandle { tx }
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<SyncReply>) {
        while let Some(first) = rx.recv().await {
            // Requests queued while the previous sync ran are all satisfied
            // by one fresh regeneration
            let mut waiters = vec![first];
            while let Ok(next) = rx.try_recv() {
                waiters.push(next);
            }

            let result = self.sync().await.map_err(|e| e.to_string());
            if let Err(e) = &result {
                error!(error = %e, waiters = waiters.len(), "Proxy sync failed");
            } else {
                debug!(waiters = waiters.len(), "Proxy sync complete");
            }

            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
        debug!("Proxy coordinator stopped");
    }

    fn container_spec(&self, routes: &[ProxyRoute]) -> ContainerSpec {
        let config_path = format!("{}/{}", self.config.config_dir.trim_end_matches('/'), CONFIG_FILE);
        ContainerSpec {
            name: self.config.container_name.clone(),
            image: self.config.image.clone(),
            memory_mb: 0,
            cpu_cores: 0.0,
            env: HashMap::new(),
            volume: Some(VolumeBinding {
                name: self.config.config_volume.clone(),
                mount_path: self.config.config_dir.clone(),
            }),
            ports: routes
                .iter()
                .map(|r| PortMapping {
                    host_port: r.listen_port,
                    container_port: r.listen_port,
                    protocol: r.protocol,
                })
                .collect(),
            tty: false,
            network: Some(self.network.clone()),
            labels: HashMap::from([(MANAGED_LABEL.to_string(), "proxy".to_string())]),
            cmd: Some(vec![
                "nginx".to_string(),
                "-c".to_string(),
                config_path,
                "-g".to_string(),
                "daemon off;".to_string(),
            ]),
        }
    }

    async fn remove_legacy_containers(&self) {
        for name in &self.config.legacy_container_names {
            match self.runtime.inspect_status(name).await {
                Ok(ContainerStatus::NotFound) => {}
                Ok(status) => match self.runtime.remove(name, true, false).await {
                    Ok(()) => info!(container = %name, %status, "Removed legacy proxy container"),
                    Err(e) => warn!(container = %name, error = %e, "Failed to remove legacy proxy container"),
                },
                Err(e) => warn!(container = %name, error = %e, "Failed to inspect legacy proxy container"),
            }
        }
    }

    async fn remove_proxy(&self) -> Result<()> {
        let name = &self.config.container_name;
        match self.runtime.inspect_status(name).await {
            Ok(ContainerStatus::NotFound) => Ok(()),
            Ok(_) => match self.runtime.remove(name, true, false).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(OrchestratorError::ProxyWriteFailure(e.to_string())),
            },
            Err(e) => Err(OrchestratorError::ProxyWriteFailure(e.to_string())),
        }
    }
}

type SyncReply = oneshot::Sender<std::result::Result<ProxySyncReport, String>>;

/// Cloneable handle to the proxy actor
#[derive(Clone)]
pub struct ProxyHandle {
    tx: mpsc::UnboundedSender<SyncReply>,
}

impl ProxyHandle {
    /// Request a sync and wait until one that started after this call
    /// has finished
    pub async fn sync(&self) -> Result<ProxySyncReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(reply_tx)
            .map_err(|_| OrchestratorError::ProxyWriteFailure("proxy coordinator is not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| OrchestratorError::ProxyWriteFailure("proxy coordinator dropped the request".to_string()))?
            .map_err(OrchestratorError::ProxyWriteFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{CustomFamily, Family};
    use crate::instance::{Settings, Status};
    use chrono::Utc;

    fn record(id: &str, family: Family, protocol: Protocol, status: Status, hostname: Option<&str>) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            id: id.to_string(),
            family,
            settings: Settings::new(),
            memory_mb: 1024,
            cpu_cores: 1.0,
            port: 20000,
            protocol,
            container_id: Some(format!("cid-{}", id)),
            status,
            status_message: None,
            network_warning: None,
            hostname: hostname.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }

    fn custom(port: u16, protocol: Protocol) -> Family {
        Family::Custom(CustomFamily {
            image: "example/server:1".to_string(),
            internal_port: port,
            default_port: port,
            protocol,
            tty: false,
        })
    }

    #[test]
    fn test_build_config_single_route() {
        let records = vec![record("alpha", Family::Minecraft, Protocol::Tcp, Status::Running, Some("mc.example.com"))];
        let config = build_config(&records);

        assert!(config.starts_with("worker_processes auto;"));
        assert!(config.contains("upstream route_25565_tcp {\n        server serverdock-alpha:25565;\n    }"));
        assert!(config.contains("listen 25565;\n        proxy_pass route_25565_tcp;"));
        assert_eq!(config.matches("upstream ").count(), 1);
        assert_eq!(config.matches("server {").count(), 1);
    }

    #[test]
    fn test_stopped_and_unnamed_instances_are_excluded() {
        let records = vec![
            record("alpha", Family::Minecraft, Protocol::Tcp, Status::Stopped, Some("a.example.com")),
            record("beta", Family::Factorio, Protocol::Udp, Status::Running, None),
            record("gamma", Family::Factorio, Protocol::Udp, Status::Error, Some("g.example.com")),
        ];
        let config = build_config(&records);
        assert_eq!(config.matches("upstream ").count(), 0);
        assert!(!config.contains("serverdock-alpha"));
        assert!(config.contains("stream {"));
    }

    #[test]
    fn test_both_protocol_emits_two_listeners_with_one_upstream() {
        let records = vec![record("x", custom(7777, Protocol::Both), Protocol::Both, Status::Running, Some("x.example.com"))];
        let config = build_config(&records);

        assert_eq!(config.matches("upstream route_7777_both").count(), 1);
        assert!(config.contains("listen 7777;"));
        assert!(config.contains("listen 7777 udp;"));
        assert_eq!(config.matches("proxy_pass route_7777_both;").count(), 2);
    }

    #[test]
    fn test_one_route_per_port_and_protocol() {
        let records = vec![
            record("zeta", Family::Minecraft, Protocol::Tcp, Status::Running, Some("z.example.com")),
            record("alpha", Family::Minecraft, Protocol::Tcp, Status::Running, Some("a.example.com")),
            record("factory", Family::Factorio, Protocol::Udp, Status::Running, Some("f.example.com")),
        ];
        let (routes, shadowed) = collect_routes(&records);

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].listen_port, 25565);
        assert_eq!(routes[0].instance, "alpha");
        assert_eq!(routes[1].listen_port, 34197);
        assert_eq!(routes[1].protocol, Protocol::Udp);
        assert_eq!(shadowed, vec!["zeta".to_string()]);
    }

    #[test]
    fn test_both_shadows_overlapping_tcp() {
        let records = vec![
            record("a", custom(9000, Protocol::Both), Protocol::Both, Status::Running, Some("a.example.com")),
            record("b", custom(9000, Protocol::Tcp), Protocol::Tcp, Status::Running, Some("b.example.com")),
        ];
        let (routes, shadowed) = collect_routes(&records);
        assert_eq!(routes.len(), 1);
        assert_eq!(shadowed, vec!["b".to_string()]);
    }
}
