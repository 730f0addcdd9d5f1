//! Instance lifecycle orchestration
//!
//! The orchestrator is the only writer of instance records. Every
//! start/stop/restart/delete of one instance runs under that instance's
//! mutex, so engine calls and port changes for the same id never interleave.
//! Read paths (status, stats, logs) never wait on that mutex: they only
//! reconcile drift when no operation is in flight.
//!
//! When several processes share one database, the same sections also hold
//! file leases, and port assignments are re-read from the store under the
//! ports lease before they change.

use crate::config::{Config, LifecycleConfig, RuntimeConfig};
use crate::db::InstanceStore;
use crate::docker::{
    ContainerRuntime, ContainerSpec, ContainerStats, ContainerStatus, PortMapping, VolumeBinding, INSTANCE_LABEL,
    MANAGED_LABEL,
};
use crate::error::{OrchestratorError, Result};
use crate::family::{parse_extra_ports, Family};
use crate::instance::{validate_id, InstanceRecord, Settings, Status};
use crate::lease::{instance_lease, Lease, LeaseDir, PORTS_LEASE};
use crate::network::{ExposureStatus, NetworkExposureManager};
use crate::ports::{Allocation, PortAllocator};
use crate::proxy::{ProxyHandle, ProxySyncReport};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Declaration of a new instance
#[derive(Debug, Clone, Default)]
pub struct NewInstance {
    pub id: String,
    /// Family kind: `minecraft`, `factorio` or `custom`
    pub family: String,
    pub settings: Settings,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    /// Host port to try before the family default
    pub port: Option<u16>,
    pub hostname: Option<String>,
}

/// Result of a lifecycle operation, as shown to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationOutcome {
    pub id: String,
    pub status: Status,
    pub port: u16,
    pub container_id: Option<String>,
    /// Non-fatal problem, e.g. the port could not be opened externally
    pub warning: Option<String>,
    pub message: String,
}

impl OperationOutcome {
    fn from_record(record: &InstanceRecord, message: impl Into<String>) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status,
            port: record.port,
            container_id: record.container_id.clone(),
            warning: record.network_warning.clone(),
            message: message.into(),
        }
    }
}

/// Drives instances through their lifecycle
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn InstanceStore>,
    ports: Arc<PortAllocator>,
    network: Arc<NetworkExposureManager>,
    proxy: ProxyHandle,
    runtime_config: RuntimeConfig,
    lifecycle: LifecycleConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    leases: Option<LeaseDir>,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn InstanceStore>,
        ports: Arc<PortAllocator>,
        network: Arc<NetworkExposureManager>,
        proxy: ProxyHandle,
        config: &Config,
    ) -> Self {
        Self {
            runtime,
            store,
            ports,
            network,
            proxy,
            runtime_config: config.runtime.clone(),
            lifecycle: config.lifecycle.clone(),
            locks: DashMap::new(),
            leases: None,
        }
    }

    /// Serialize with other processes that use the same lease directory
    pub fn with_leases(mut self, leases: LeaseDir) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn network(&self) -> &NetworkExposureManager {
        &self.network
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Number of per-instance mutexes currently held in memory
    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(id.to_string()).or_default().clone()
    }

    /// Run `op` holding the instance's mutex and its lease
    ///
    /// Once the instance does not exist, its mutex is forgotten unless
    /// another caller still holds a handle to it.
    async fn with_instance<T, F, Fut>(&self, id: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            match self.instance_lease(id).await {
                Ok(_lease) => op().await,
                Err(e) => Err(e),
            }
        };
        drop(lock);

        if matches!(self.store.load(id), Ok(None)) {
            self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        }
        result
    }

    async fn instance_lease(&self, id: &str) -> Result<Option<Lease>> {
        match &self.leases {
            Some(leases) => Ok(Some(leases.acquire(&instance_lease(id)).await?)),
            None => Ok(None),
        }
    }

    /// Hold the ports lease and pick up assignments made by other processes
    async fn ports_lease(&self) -> Result<Option<Lease>> {
        let Some(leases) = &self.leases else {
            return Ok(None);
        };
        let lease = leases.acquire(PORTS_LEASE).await?;
        self.seed_ports()?;
        Ok(Some(lease))
    }

    fn load(&self, id: &str) -> Result<InstanceRecord> {
        self.store
            .load(id)?
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<InstanceRecord>> {
        self.store.list()
    }

    // ==================== Declaration ====================

    /// Declare a new instance in `stopped` state with an allocated port
    pub async fn create(&self, new: NewInstance) -> Result<InstanceRecord> {
        validate_id(&new.id).map_err(OrchestratorError::InvalidInstance)?;
        let id = new.id.clone();
        self.with_instance(&id, move || self.create_locked(new)).await
    }

    async fn create_locked(&self, new: NewInstance) -> Result<InstanceRecord> {
        if self.store.load(&new.id)?.is_some() {
            return Err(OrchestratorError::InvalidInstance(format!(
                "instance '{}' already exists",
                new.id
            )));
        }
        if !new.cpu_cores.is_finite() || new.cpu_cores < 0.0 {
            return Err(OrchestratorError::InvalidInstance(format!(
                "cpu_cores must be a non-negative number, got {}",
                new.cpu_cores
            )));
        }

        // Family is resolved once and stored with the record
        let family = Family::resolve(&new.family, &new.settings).map_err(OrchestratorError::InvalidInstance)?;
        parse_extra_ports(&new.settings).map_err(OrchestratorError::InvalidInstance)?;

        let adapter = family.adapter();
        let protocol = adapter.protocol();
        let preferred = new.port.unwrap_or_else(|| adapter.default_port());
        let hostname = new.hostname.filter(|h| !h.trim().is_empty());

        let _lease = self.ports_lease().await?;
        // The proxy listens on the in-container port, so that port stays out
        // of the pool while the instance is routed
        if hostname.is_some() {
            self.ports.claim_listener(&new.id, adapter.internal_port(), protocol)?;
        }
        let port = match self.ports.allocate_port(&new.id, Some(preferred), protocol, &[]) {
            Ok(port) => port,
            Err(e) => {
                self.ports.release(&new.id);
                return Err(e);
            }
        };

        let now = Utc::now();
        let record = InstanceRecord {
            id: new.id.clone(),
            family,
            settings: new.settings,
            memory_mb: new.memory_mb,
            cpu_cores: new.cpu_cores,
            port,
            protocol,
            container_id: None,
            status: Status::Stopped,
            status_message: None,
            network_warning: None,
            hostname,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.save(&record) {
            self.ports.release(&record.id);
            return Err(e);
        }

        info!(instance = %record.id, family = record.family.adapter().kind(), port, "Instance declared");
        Ok(record)
    }

    // ==================== Start ====================

    /// Start an instance, replacing any container it already has
    ///
    /// Starting an instance in `error` acts as a retry.
    pub async fn start(&self, id: &str) -> Result<OperationOutcome> {
        self.with_instance(id, move || self.start_locked(id)).await
    }

    /// Start in the background; the handle resolves once the instance is
    /// running or has failed
    pub fn spawn_start(self: &Arc<Self>, id: &str) -> JoinHandle<Result<OperationOutcome>> {
        let this = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            let result = this.start(&id).await;
            if let Err(e) = &result {
                error!(instance = %id, error = %e, "Background start failed");
            }
            result
        })
    }

    async fn start_locked(&self, id: &str) -> Result<OperationOutcome> {
        let mut record = self.load(id)?;
        if record.status == Status::Starting {
            warn!(instance = %id, "Instance already marked starting, proceeding");
        }
        info!(instance = %id, port = record.port, "Starting instance");

        // Release the port binding of a container we still track
        if let Some(container_id) = record.container_id.clone() {
            match self.runtime.stop(&container_id, self.runtime_config.stop_grace()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return self.fail_start(record, e),
            }
        }

        // Re-validate the assigned port before every start
        let lease = match self.ports_lease().await {
            Ok(lease) => lease,
            Err(e) => return self.fail_start(record, e),
        };
        if self.ports.revalidate(id, record.port, record.protocol) {
            self.ports.reserve(id, record.port, record.protocol);
        } else {
            let previous = record.port;
            let preferred = record.family.adapter().default_port();
            match self.ports.allocate_port(id, Some(preferred), record.protocol, &[previous]) {
                Ok(port) => {
                    info!(instance = %id, previous, port, "Assigned port unavailable, reallocated");
                    record.port = port;
                }
                Err(e) => return self.fail_start(record, e),
            }
        }

        record.set_status(Status::Starting);
        record.status_message = None;
        self.store.save(&record)?;
        drop(lease);

        let adapter = record.family.adapter();
        let env = adapter.build_environment(&record);
        let extra_ports = match parse_extra_ports(&record.settings) {
            Ok(ports) => ports,
            Err(e) => return self.fail_start(record, OrchestratorError::InvalidInstance(e)),
        };

        if let Err(e) = self.runtime.ensure_network(&self.runtime_config.network).await {
            return self.fail_start(record, e);
        }

        // Volume preparation is best-effort
        let volume = record.volume_name();
        let owner = adapter.volume_owner();
        if let Some((uid, gid)) = owner {
            if let Err(e) = self.runtime.fix_volume_permissions(&volume, uid, gid).await {
                if e.is_fatal_for_start() {
                    return self.fail_start(record, e);
                }
                warn!(instance = %id, volume, error = %e, "Volume permission fix failed, continuing");
            }
        }
        for file in adapter.volume_files(&record.settings) {
            if let Err(e) = self.runtime.write_volume_file(&volume, &file.path, &file.contents, owner).await {
                if e.is_fatal_for_start() {
                    return self.fail_start(record, e);
                }
                warn!(instance = %id, path = %file.path, error = %e, "Config file write failed, continuing");
            }
        }

        // Create the container, moving to a fresh port on late bind conflicts
        let mut tried = vec![record.port];
        let mut attempt = 1;
        let container_id = loop {
            let spec = self.container_spec(&record, env.clone(), &extra_ports);
            match self.runtime.create_and_start(&spec).await {
                Ok(container_id) => break container_id,
                Err(OrchestratorError::ResourceConflict { port, .. })
                    if attempt < self.lifecycle.max_bind_attempts && (port == 0 || port == record.port) =>
                {
                    let _lease = match self.ports_lease().await {
                        Ok(lease) => lease,
                        Err(e) => return self.fail_start(record, e),
                    };
                    let preferred = record.family.adapter().default_port();
                    match self.ports.allocate_port(id, Some(preferred), record.protocol, &tried) {
                        Ok(next) => {
                            warn!(instance = %id, conflicted = record.port, port = next, attempt, "Port bind conflict, retrying on new port");
                            record.port = next;
                            tried.push(next);
                            self.store.save(&record)?;
                            attempt += 1;
                        }
                        Err(e) => return self.fail_start(record, e),
                    }
                }
                Err(e) => return self.fail_start(record, e),
            }
        };

        record.container_id = Some(container_id.clone());

        // Exposure failures only raise a warning flag
        let report = self
            .network
            .expose(record.port, record.protocol, &record.container_name())
            .await;
        record.network_warning = report.summary();

        record.set_status(Status::Running);
        self.store.save(&record)?;
        info!(instance = %id, container_id, port = record.port, "Instance running");

        if record.hostname.is_some() {
            self.sync_proxy().await;
        }

        Ok(OperationOutcome::from_record(&record, "started"))
    }

    /// Persist `error` with the failure text and hand the error back
    fn fail_start(&self, mut record: InstanceRecord, err: OrchestratorError) -> Result<OperationOutcome> {
        error!(instance = %record.id, error = %err, "Start failed");
        record.set_status(Status::Error);
        record.status_message = Some(err.to_string());
        record.container_id = None;
        if let Err(save_err) = self.store.save(&record) {
            error!(instance = %record.id, error = %save_err, "Failed to persist error status");
        }
        Err(err)
    }

    fn container_spec(
        &self,
        record: &InstanceRecord,
        env: HashMap<String, String>,
        extra_ports: &[PortMapping],
    ) -> ContainerSpec {
        let adapter = record.family.adapter();

        let mut ports = vec![PortMapping {
            host_port: record.port,
            container_port: adapter.internal_port(),
            protocol: record.protocol,
        }];
        ports.extend_from_slice(extra_ports);

        ContainerSpec {
            name: record.container_name(),
            image: adapter.image(&record.settings),
            memory_mb: record.memory_mb,
            cpu_cores: record.cpu_cores,
            env,
            volume: Some(VolumeBinding {
                name: record.volume_name(),
                mount_path: self.runtime_config.volume_mount_path.clone(),
            }),
            ports,
            tty: adapter.tty(),
            network: Some(self.runtime_config.network.clone()),
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (INSTANCE_LABEL.to_string(), record.id.clone()),
            ]),
            cmd: None,
        }
    }

    // ==================== Stop ====================

    pub async fn stop(&self, id: &str) -> Result<OperationOutcome> {
        self.with_instance(id, move || self.stop_locked(id)).await
    }

    async fn stop_locked(&self, id: &str) -> Result<OperationOutcome> {
        let mut record = self.load(id)?;

        let Some(container_id) = record.container_id.clone() else {
            if record.status != Status::Stopped {
                debug!(instance = %id, status = %record.status, "No container tracked, normalizing to stopped");
                record.set_status(Status::Stopped);
                self.store.save(&record)?;
            }
            return Ok(OperationOutcome::from_record(&record, "already stopped"));
        };

        info!(instance = %id, container_id, "Stopping instance");
        let was_routed = record.status == Status::Running && record.hostname.is_some();
        record.set_status(Status::Stopping);
        self.store.save(&record)?;

        match self.runtime.stop(&container_id, self.runtime_config.stop_grace()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(instance = %id, container_id, "Container already gone");
            }
            Err(e) => {
                error!(instance = %id, error = %e, "Stop failed");
                record.set_status(Status::Error);
                record.status_message = Some(e.to_string());
                self.store.save(&record)?;
                return Err(e);
            }
        }

        let report = self.network.unexpose(record.port, record.protocol).await;
        record.network_warning = report.summary();

        record.container_id = None;
        record.status_message = None;
        record.set_status(Status::Stopped);
        self.store.save(&record)?;
        info!(instance = %id, "Instance stopped");

        if was_routed {
            self.sync_proxy().await;
        }

        Ok(OperationOutcome::from_record(&record, "stopped"))
    }

    // ==================== Restart ====================

    /// Stop, wait for the engine to release the port, then start
    pub async fn restart(&self, id: &str) -> Result<OperationOutcome> {
        self.with_instance(id, move || async move {
            self.stop_locked(id).await?;
            tokio::time::sleep(self.lifecycle.restart_settle()).await;
            let mut outcome = self.start_locked(id).await?;
            outcome.message = "restarted".to_string();
            Ok(outcome)
        })
        .await
    }

    // ==================== Delete ====================

    /// Tear down the container, volume and exposure, then forget the record
    ///
    /// Teardown steps are best-effort; only storage errors abort.
    pub async fn delete(&self, id: &str) -> Result<OperationOutcome> {
        self.with_instance(id, move || self.delete_locked(id)).await
    }

    async fn delete_locked(&self, id: &str) -> Result<OperationOutcome> {
        let mut record = self.load(id)?;
        let was_routed = record.status == Status::Running && record.hostname.is_some();
        info!(instance = %id, "Deleting instance");

        // The name is deterministic, so this also catches containers whose
        // reference was already cleared
        let name = record.container_name();
        match self.runtime.remove(&name, true, true).await {
            Ok(()) => debug!(instance = %id, container = name, "Container removed"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(instance = %id, error = %e, "Container removal failed"),
        }
        if let Err(e) = self.runtime.remove_volume(&record.volume_name()).await {
            if !e.is_not_found() {
                warn!(instance = %id, error = %e, "Volume removal failed");
            }
        }

        let report = self.network.unexpose(record.port, record.protocol).await;

        self.store.delete(id)?;
        self.ports.release(id);

        if was_routed {
            self.sync_proxy().await;
        }

        record.container_id = None;
        record.network_warning = report.summary();
        record.set_status(Status::Stopped);
        info!(instance = %id, "Instance deleted");
        Ok(OperationOutcome::from_record(&record, "deleted"))
    }

    // ==================== Observation ====================

    /// Current record, reconciled against the engine
    pub async fn status(&self, id: &str) -> Result<InstanceRecord> {
        let record = self.load(id)?;
        let Some(container_id) = record.container_id.clone() else {
            return Ok(record);
        };
        if record.status != Status::Running {
            return Ok(record);
        }

        let observed = self.runtime.inspect_status(&container_id).await?;
        match observed {
            ContainerStatus::Running | ContainerStatus::Restarting => Ok(record),
            other => Ok(self.reconcile(id, &container_id, other).await?.unwrap_or(record)),
        }
    }

    /// Resource usage; `None` when the tracked container has vanished
    pub async fn stats(&self, id: &str) -> Result<Option<ContainerStats>> {
        let record = self.load(id)?;
        let container_id = Self::tracked_container(&record)?;

        match self.runtime.stats(&container_id).await {
            Ok(stats) => Ok(Some(stats)),
            Err(e) if e.is_not_found() => {
                self.reconcile(id, &container_id, ContainerStatus::NotFound).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Last `tail_lines` of output; `None` when the tracked container has
    /// vanished
    pub async fn logs(&self, id: &str, tail_lines: usize) -> Result<Option<String>> {
        let record = self.load(id)?;
        let container_id = Self::tracked_container(&record)?;

        match self.runtime.logs(&container_id, tail_lines).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.is_not_found() => {
                self.reconcile(id, &container_id, ContainerStatus::NotFound).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run an admin command through the family's console program
    pub async fn send_command(&self, id: &str, command_line: &str) -> Result<String> {
        let record = self.load(id)?;
        if record.status != Status::Running {
            return Err(OrchestratorError::InvalidInstance(format!(
                "instance '{}' is {}, not running",
                id, record.status
            )));
        }
        let container_id = Self::tracked_container(&record)?;

        let words = shell_words::split(command_line)
            .map_err(|e| OrchestratorError::InvalidInstance(format!("cannot parse command: {}", e)))?;
        if words.is_empty() {
            return Err(OrchestratorError::InvalidInstance("empty command".to_string()));
        }

        let mut argv: Vec<String> = record
            .family
            .adapter()
            .console_command()
            .iter()
            .map(|s| s.to_string())
            .collect();
        argv.extend(words);

        debug!(instance = %id, ?argv, "Sending command");
        match self.runtime.exec(&container_id, &argv).await {
            Err(e) if e.is_not_found() => {
                self.reconcile(id, &container_id, ContainerStatus::NotFound).await?;
                Err(e)
            }
            other => other,
        }
    }

    fn tracked_container(record: &InstanceRecord) -> Result<String> {
        record.container_id.clone().ok_or_else(|| {
            OrchestratorError::InvalidInstance(format!("instance '{}' has no container", record.id))
        })
    }

    /// Bring a `running` record in line with what the engine reported
    ///
    /// Skipped while an operation holds the instance, and when the record
    /// has moved on to another container since `container_id` was read.
    async fn reconcile(
        &self,
        id: &str,
        container_id: &str,
        observed: ContainerStatus,
    ) -> Result<Option<InstanceRecord>> {
        let lock = self.lock_for(id);
        let Ok(_guard) = lock.try_lock() else {
            debug!(instance = %id, "Operation in flight, skipping reconciliation");
            return Ok(None);
        };
        let _lease = match &self.leases {
            Some(leases) => match leases.try_acquire(&instance_lease(id))? {
                Some(lease) => Some(lease),
                None => {
                    debug!(instance = %id, "Operation in flight in another process, skipping reconciliation");
                    return Ok(None);
                }
            },
            None => None,
        };

        let mut record = self.load(id)?;
        if record.status != Status::Running || record.container_id.as_deref() != Some(container_id) {
            return Ok(Some(record));
        }

        match observed {
            ContainerStatus::NotFound => {
                warn!(instance = %id, container_id, "Tracked container vanished, marking stopped");
                record.container_id = None;
                record.status_message = None;
                record.set_status(Status::Stopped);
            }
            ContainerStatus::Running | ContainerStatus::Restarting => return Ok(Some(record)),
            other => {
                warn!(instance = %id, container_id, state = %other, "Tracked container is no longer running");
                record.status_message = Some(format!("container {} unexpectedly", other));
                record.set_status(Status::Error);
            }
        }

        let report = self.network.unexpose(record.port, record.protocol).await;
        record.network_warning = report.summary();
        self.store.save(&record)?;

        if record.hostname.is_some() {
            self.sync_proxy().await;
        }
        Ok(Some(record))
    }

    // ==================== Settings ====================

    /// Persist new settings and rewrite config files of a running instance
    ///
    /// Environment changes take effect on the next start; files are
    /// rewritten in place without recreating the container.
    pub async fn update_settings(&self, id: &str, settings: Settings) -> Result<OperationOutcome> {
        self.with_instance(id, move || self.update_settings_locked(id, settings)).await
    }

    async fn update_settings_locked(&self, id: &str, settings: Settings) -> Result<OperationOutcome> {
        let mut record = self.load(id)?;
        let previous = record.clone();
        if let Family::Custom(_) = record.family {
            record.family = Family::resolve("custom", &settings).map_err(OrchestratorError::InvalidInstance)?;
        }
        parse_extra_ports(&settings).map_err(OrchestratorError::InvalidInstance)?;

        let protocol = record.family.adapter().protocol();
        let protocol_changed = protocol != record.protocol;
        let listen_changed = record.hostname.is_some() && record.internal_port() != previous.internal_port();
        let ports_changed = protocol_changed || listen_changed;
        if ports_changed && record.container_id.is_some() {
            return Err(OrchestratorError::InvalidInstance(format!(
                "instance '{}' has a container; stop it before changing its port or protocol",
                id
            )));
        }

        let _lease = if ports_changed { self.ports_lease().await? } else { None };
        if ports_changed {
            if protocol_changed {
                info!(instance = %id, from = %record.protocol, to = %protocol, "Protocol changed");
                record.protocol = protocol;
            }
            if let Err(e) = self.reassign_ports(&mut record) {
                self.restore_port_claims(&previous);
                return Err(e);
            }
        }

        record.settings = settings;
        record.updated_at = Utc::now();
        if let Err(e) = self.store.save(&record) {
            if ports_changed {
                self.restore_port_claims(&previous);
            }
            return Err(e);
        }

        let mut warning = None;
        if record.status == Status::Running {
            let adapter = record.family.adapter();
            let volume = record.volume_name();
            let owner = adapter.volume_owner();
            for file in adapter.volume_files(&record.settings) {
                if let Err(e) = self.runtime.write_volume_file(&volume, &file.path, &file.contents, owner).await {
                    warn!(instance = %id, path = %file.path, error = %e, "Live config rewrite failed");
                    warning = Some(e.to_string());
                }
            }
        }

        let mut outcome = OperationOutcome::from_record(&record, "settings saved");
        if warning.is_some() {
            outcome.warning = warning;
        }
        Ok(outcome)
    }

    /// Claim the listen port and re-check the host port of a stopped
    /// record after its protocol or in-container port changed
    fn reassign_ports(&self, record: &mut InstanceRecord) -> Result<()> {
        if record.hostname.is_some() {
            self.ports
                .claim_listener(&record.id, record.internal_port(), record.protocol)?;
        }
        if self.ports.revalidate(&record.id, record.port, record.protocol) {
            self.ports.reserve(&record.id, record.port, record.protocol);
        } else {
            let previous = record.port;
            let preferred = record.family.adapter().default_port();
            record.port = self
                .ports
                .allocate_port(&record.id, Some(preferred), record.protocol, &[])?;
            info!(instance = %record.id, previous, port = record.port, "Port reassigned");
        }
        Ok(())
    }

    /// Put back the allocator entries of a record whose change failed
    fn restore_port_claims(&self, record: &InstanceRecord) {
        self.ports.reserve(&record.id, record.port, record.protocol);
        if record.hostname.is_none() {
            self.ports.release_listener(&record.id);
        } else if let Err(e) = self
            .ports
            .claim_listener(&record.id, record.internal_port(), record.protocol)
        {
            warn!(instance = %record.id, error = %e, "Could not restore proxy listen port");
        }
    }

    /// Change or clear the routed hostname
    ///
    /// Adding a hostname reserves the proxy listen port. An instance whose
    /// container publishes that port must be stopped first.
    pub async fn set_hostname(&self, id: &str, hostname: Option<String>) -> Result<OperationOutcome> {
        self.with_instance(id, move || self.set_hostname_locked(id, hostname)).await
    }

    async fn set_hostname_locked(&self, id: &str, hostname: Option<String>) -> Result<OperationOutcome> {
        let mut record = self.load(id)?;
        let previous = record.clone();
        let hostname = hostname.filter(|h| !h.trim().is_empty());

        let _lease = self.ports_lease().await?;
        if hostname.is_some() {
            let listen = record.internal_port();
            if record.container_id.is_some() && record.port == listen {
                return Err(OrchestratorError::InvalidInstance(format!(
                    "instance '{}' publishes port {} the proxy would listen on; stop it first",
                    id, listen
                )));
            }
            self.ports.claim_listener(id, listen, record.protocol)?;
        } else {
            self.ports.release_listener(id);
        }

        record.hostname = hostname;
        record.updated_at = Utc::now();
        if let Err(e) = self.store.save(&record) {
            self.restore_port_claims(&previous);
            return Err(e);
        }

        if record.status == Status::Running {
            self.sync_proxy().await;
        }
        Ok(OperationOutcome::from_record(&record, "hostname updated"))
    }

    // ==================== Exposure and proxy ====================

    pub fn set_router_automation(&self, enabled: bool) -> Result<()> {
        self.network.set_router_automation(enabled)
    }

    pub async fn exposure_status(&self, id: &str) -> Result<ExposureStatus> {
        let record = self.load(id)?;
        Ok(self.network.exposure_status(record.port).await)
    }

    /// Force a proxy regeneration
    pub async fn proxy_sync(&self) -> Result<ProxySyncReport> {
        self.proxy.sync().await
    }

    async fn sync_proxy(&self) {
        if let Err(e) = self.proxy.sync().await {
            warn!(error = %e, "Proxy sync failed, hostname routing may be stale");
        }
    }

    // ==================== Boot ====================

    /// Replace the allocator's host and listen ports with the persisted
    /// assignments
    pub fn seed_ports(&self) -> Result<Vec<InstanceRecord>> {
        let records = self.store.list()?;
        let allocations = records
            .iter()
            .map(|r| Allocation {
                port: r.port,
                owner: r.id.clone(),
                protocol: r.protocol,
            })
            .collect();
        let listeners = records
            .iter()
            .filter(|r| r.hostname.is_some())
            .map(|r| Allocation {
                port: r.internal_port(),
                owner: r.id.clone(),
                protocol: r.protocol,
            })
            .collect();
        self.ports.reset(allocations, listeners);
        Ok(records)
    }

    /// Seed the allocator from persisted records and reconcile records that
    /// expected a container against the engine
    ///
    /// Returns the records whose status changed.
    pub async fn restore(&self) -> Result<Vec<OperationOutcome>> {
        let records = self.seed_ports()?;
        info!(instances = records.len(), "Restoring instance state");
        let known: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();

        let mut changed = Vec::new();
        for record in records.iter().filter(|r| r.status.expects_container()) {
            let id = record.id.as_str();
            if let Some(outcome) = self.with_instance(id, move || self.restore_one(id)).await? {
                changed.push(outcome);
            }
        }

        self.report_orphans(&known).await;
        self.sync_proxy().await;
        Ok(changed)
    }

    async fn restore_one(&self, id: &str) -> Result<Option<OperationOutcome>> {
        // Re-read under the lock; another process may have moved on
        let Some(mut record) = self.store.load(id)? else {
            return Ok(None);
        };
        if !record.status.expects_container() {
            return Ok(None);
        }

        let before = record.status;
        let observed = match record.container_id.as_deref() {
            Some(container_id) => self.runtime.inspect_status(container_id).await?,
            None => ContainerStatus::NotFound,
        };

        match observed {
            ContainerStatus::Running | ContainerStatus::Restarting => {
                if before != Status::Running {
                    record.set_status(Status::Running);
                }
            }
            ContainerStatus::NotFound => {
                record.container_id = None;
                record.set_status(Status::Stopped);
            }
            other if before == Status::Stopping => {
                debug!(instance = %id, state = %other, "Interrupted stop completed");
                record.container_id = None;
                record.set_status(Status::Stopped);
            }
            other => {
                record.status_message = Some(format!("container {} while control plane was down", other));
                record.set_status(Status::Error);
            }
        }

        if record.status == before {
            return Ok(None);
        }
        info!(instance = %id, from = %before, to = %record.status, "Reconciled instance");
        self.store.save(&record)?;
        Ok(Some(OperationOutcome::from_record(&record, format!("reconciled from {}", before))))
    }

    /// Log managed containers whose instance record no longer exists
    async fn report_orphans(&self, known: &HashSet<String>) {
        match self.runtime.list_containers(true).await {
            Ok(containers) => {
                for container in containers {
                    if let Some(instance) = container.instance.filter(|i| !known.contains(i)) {
                        warn!(instance = %instance, container = %container.name, state = %container.state, "Managed container has no instance record");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not list managed containers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_record() {
        let now = Utc::now();
        let record = InstanceRecord {
            id: "alpha".to_string(),
            family: Family::Minecraft,
            settings: Settings::new(),
            memory_mb: 1024,
            cpu_cores: 1.0,
            port: 20001,
            protocol: crate::instance::Protocol::Tcp,
            container_id: Some("abc".to_string()),
            status: Status::Running,
            status_message: None,
            network_warning: Some("ufw allow failed".to_string()),
            hostname: None,
            created_at: now,
            updated_at: now,
        };
        let outcome = OperationOutcome::from_record(&record, "started");
        assert_eq!(outcome.port, 20001);
        assert_eq!(outcome.status, Status::Running);
        assert_eq!(outcome.warning.as_deref(), Some("ufw allow failed"));
        assert_eq!(outcome.container_id.as_deref(), Some("abc"));
    }
}
