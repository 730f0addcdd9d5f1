//! Container engine access
//!
//! [`ContainerRuntime`] is the thin seam between orchestration and the
//! engine. [`DockerManager`] implements it over the Docker API; tests use
//! in-memory fakes.

use crate::config::RuntimeConfig;
use crate::error::{classify_engine_error, OrchestratorError, Result};
use crate::instance::{Protocol, NAME_PREFIX};
use async_trait::async_trait;
use base64::Engine as _;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::RemoveVolumeOptions;
use bollard::Docker;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label marking containers owned by this control plane
pub const MANAGED_LABEL: &str = "serverdock.managed";
/// Label carrying the owning instance id
pub const INSTANCE_LABEL: &str = "serverdock.instance";

/// Where helper containers mount the volume they maintain
const HELPER_MOUNT: &str = "/volume";

/// Host port to container port, per protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

/// Named volume bind-mounted into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub name: String,
    pub mount_path: String,
}

/// Everything needed to (re)create one container
///
/// Built fresh on every start and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Hard memory cap, 0 for unlimited
    pub memory_mb: u64,
    /// Fractional core count, 0 for unlimited
    pub cpu_cores: f64,
    pub env: HashMap<String, String>,
    pub volume: Option<VolumeBinding>,
    /// First entry is the primary mapping, the rest are extras
    pub ports: Vec<PortMapping>,
    pub tty: bool,
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
    pub cmd: Option<Vec<String>>,
}

/// Container state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
    /// Sentinel for a container the engine does not know
    NotFound,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Restarting)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
            ContainerStatus::NotFound => "not_found",
        };
        f.write_str(s)
    }
}

/// Resource usage snapshot of one container
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub mem_used_mb: f64,
    pub mem_limit_mb: f64,
    pub mem_percent: f64,
}

impl ContainerStats {
    /// Compute usage from two consecutive cumulative CPU samples
    ///
    /// CPU percent is `(Δcontainer / Δsystem) × online_cpus × 100`.
    pub fn from_samples(
        cpu_total: u64,
        precpu_total: u64,
        system_total: u64,
        presystem_total: u64,
        online_cpus: u64,
        mem_usage: u64,
        mem_limit: u64,
    ) -> Self {
        let cpu_delta = cpu_total.saturating_sub(precpu_total) as f64;
        let system_delta = system_total.saturating_sub(presystem_total) as f64;

        let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
            (cpu_delta / system_delta) * online_cpus.max(1) as f64 * 100.0
        } else {
            0.0
        };

        let mem_percent = if mem_limit == 0 {
            0.0
        } else {
            mem_usage as f64 / mem_limit as f64 * 100.0
        };

        Self {
            cpu_percent,
            mem_used_mb: bytes_to_mb(mem_usage),
            mem_limit_mb: bytes_to_mb(mem_limit),
            mem_percent,
        }
    }

    fn from_engine(stats: &Stats) -> Self {
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u64)
                .unwrap_or(1)
        });
        Self::from_samples(
            stats.cpu_stats.cpu_usage.total_usage,
            stats.precpu_stats.cpu_usage.total_usage,
            stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus,
            stats.memory_stats.usage.unwrap_or(0),
            stats.memory_stats.limit.unwrap_or(0),
        )
    }
}

/// Memory cap in bytes for the engine, clamped to its signed range
/// Drain a log or exec output stream; a failure mid-stream fails the whole
/// read instead of returning truncated output
async fn collect_output<S>(id: &str, stream: S) -> Result<String>
where
    S: Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut output = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(line) => output.push_str(&line.to_string()),
            Err(e) => {
                warn!(container = id, error = %e, "Output stream failed");
                return Err(classify_engine_error(id, e));
            }
        }
    }
    Ok(output)
}

pub fn memory_limit_bytes(memory_mb: u64) -> i64 {
    i64::try_from(memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// A container carrying the managed label
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub instance: Option<String>,
    pub state: String,
}

/// Operations the orchestrator needs from a container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a bridge network unless it already exists
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Replace any container named `spec.name`, then create and start one
    ///
    /// Returns the engine-assigned container id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    async fn remove(&self, id: &str, force: bool, remove_volumes: bool) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Never fails with not-found; returns [`ContainerStatus::NotFound`] instead
    async fn inspect_status(&self, id: &str) -> Result<ContainerStatus>;

    /// Fails with [`OrchestratorError::DriftNotFound`] for unknown containers
    async fn stats(&self, id: &str) -> Result<ContainerStats>;

    async fn logs(&self, id: &str, tail_lines: usize) -> Result<String>;

    /// Run a command in a running container, returning stdout and stderr
    async fn exec(&self, id: &str, argv: &[String]) -> Result<String>;

    /// Run `sh -c script` in a disposable container with `volume` mounted
    /// at `/volume`
    async fn run_in_volume(&self, volume: &str, script: &str) -> Result<String>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ManagedContainer>>;

    /// Hand a freshly created volume to the uid/gid the server runs as
    async fn fix_volume_permissions(&self, volume: &str, uid: u32, gid: u32) -> Result<()> {
        let script = format!(
            "chown -R {uid}:{gid} {mount} && chmod -R u+rwX {mount}",
            uid = uid,
            gid = gid,
            mount = HELPER_MOUNT
        );
        self.run_in_volume(volume, &script)
            .await
            .map(|_| ())
            .map_err(|e| OrchestratorError::PermissionFixFailure(e.to_string()))
    }

    /// Write one file into a volume, creating parent directories
    async fn write_volume_file(
        &self,
        volume: &str,
        path: &str,
        contents: &str,
        owner: Option<(u32, u32)>,
    ) -> Result<()> {
        let script = write_file_script(path, contents, owner)
            .map_err(OrchestratorError::ConfigWriteFailure)?;
        self.run_in_volume(volume, &script)
            .await
            .map(|_| ())
            .map_err(|e| OrchestratorError::ConfigWriteFailure(format!("{}: {}", path, e)))
    }
}

/// Build the helper script that writes `contents` to `path` in the volume
///
/// Contents travel base64-encoded so no shell quoting is involved.
fn write_file_script(path: &str, contents: &str, owner: Option<(u32, u32)>) -> std::result::Result<String, String> {
    let path = path.trim_start_matches('/');
    let safe = !path.is_empty()
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'));
    if !safe {
        return Err(format!("refusing to write unsafe volume path '{}'", path));
    }

    let target = format!("{}/{}", HELPER_MOUNT, path);
    let encoded = base64::engine::general_purpose::STANDARD.encode(contents);
    let mut script = format!(
        "mkdir -p \"$(dirname {target})\" && echo {encoded} | base64 -d > {target}",
        target = target,
        encoded = encoded
    );
    if let Some((uid, gid)) = owner {
        script.push_str(&format!(" && chown {}:{} {}", uid, gid, target));
    }
    Ok(script)
}

/// Exposed-port set and port-binding map for the Docker API
type PortMaps = (
    HashMap<String, HashMap<(), ()>>,
    HashMap<String, Option<Vec<PortBinding>>>,
);

/// Build exposed ports and host bindings; `both` expands into tcp and udp
/// bindings to the same host port
pub fn build_port_maps(ports: &[PortMapping]) -> PortMaps {
    let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();

    for mapping in ports {
        for transport in mapping.protocol.transports() {
            let key = format!("{}/{}", mapping.container_port, transport);
            exposed.insert(key.clone(), HashMap::new());
            bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(mapping.host_port.to_string()),
                });
        }
    }

    (exposed, bindings)
}

/// Container engine backed by the Docker API
pub struct DockerManager {
    client: Docker,
    config: RuntimeConfig,
}

impl DockerManager {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. `runtime.docker_host` from configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        let timeout = config.engine_timeout_secs;
        let client = if let Some(host) = config.docker_host.as_deref() {
            Self::connect_to_host(host, timeout)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host, timeout)?
        } else {
            Self::connect_with_defaults(timeout).await?
        };

        client.ping().await.map_err(|e| {
            OrchestratorError::RuntimeUnavailable(format!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            ))
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client, config })
    }

    fn connect_to_host(host: &str, timeout: u64) -> Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, timeout, bollard::API_DEFAULT_VERSION).map_err(|e| {
                OrchestratorError::RuntimeUnavailable(format!(
                    "Cannot connect to Unix socket '{}': {}",
                    socket_path, e
                ))
            })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, timeout, bollard::API_DEFAULT_VERSION).map_err(|e| {
                OrchestratorError::RuntimeUnavailable(format!(
                    "Cannot connect to TCP endpoint '{}': {}",
                    host, e
                ))
            })
        } else {
            Err(OrchestratorError::RuntimeUnavailable(format!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )))
        }
    }

    async fn connect_with_defaults(timeout: u64) -> Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop", format!("{}/.docker/run/docker.sock", home)),
            ("Podman (rootless)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with('/') && !path.starts_with("//") && std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) = Docker::connect_with_socket(path, timeout, bollard::API_DEFAULT_VERSION) {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            OrchestratorError::RuntimeUnavailable(format!(
                "Cannot connect to Docker daemon: {}. Start dockerd or set DOCKER_HOST.",
                e
            ))
        })
    }

    /// Pull an image, retrying transient failures
    ///
    /// Falls back to a local copy of the image when every attempt fails.
    async fn pull_image(&self, image: &str) -> Result<()> {
        let attempts = self.config.pull_retries.max(1);
        let timeout = Duration::from_secs(self.config.pull_timeout_secs);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, self.pull_once(image)).await {
                Ok(Ok(())) => {
                    info!(image, "Image pulled");
                    return Ok(());
                }
                Ok(Err(PullError::Permanent(reason))) => {
                    last_error = reason;
                    break;
                }
                Ok(Err(PullError::Transient(reason))) => {
                    warn!(image, attempt, error = %reason, "Image pull failed, retrying");
                    last_error = reason;
                }
                Err(_) => {
                    warn!(image, attempt, timeout_secs = timeout.as_secs(), "Image pull timed out");
                    last_error = format!("timed out after {}s", timeout.as_secs());
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt.min(5)))).await;
            }
        }

        if self.client.inspect_image(image).await.is_ok() {
            warn!(image, error = %last_error, "Pull failed, using local image");
            return Ok(());
        }

        Err(OrchestratorError::ImagePullFailure {
            image: image.to_string(),
            reason: last_error,
        })
    }

    async fn pull_once(&self, image: &str) -> std::result::Result<(), PullError> {
        debug!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(PullError::classify(&error));
                    }
                    if let Some(status) = info.status {
                        debug!(image, status, "Pull progress");
                    }
                }
                Err(e) => return Err(PullError::classify(&e.to_string())),
            }
        }
        Ok(())
    }

    /// Stop and remove a container by name if it exists
    async fn remove_existing(&self, name: &str) -> Result<()> {
        match self.inspect_status(name).await? {
            ContainerStatus::NotFound => Ok(()),
            status => {
                info!(container = name, %status, "Replacing existing container");
                if status.is_running() {
                    self.stop(name, Duration::from_secs(self.config.stop_grace_secs)).await?;
                }
                self.remove(name, true, true).await
            }
        }
    }

    fn container_config(&self, spec: &ContainerSpec) -> Config<String> {
        let (exposed_ports, port_bindings) = build_port_maps(&spec.ports);

        let mut host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: spec.network.clone(),
            binds: spec
                .volume
                .as_ref()
                .map(|v| vec![format!("{}:{}", v.name, v.mount_path)]),
            ..Default::default()
        };

        if spec.memory_mb > 0 {
            let bytes = memory_limit_bytes(spec.memory_mb);
            host_config.memory = Some(bytes);
            // Same value disables swap beyond the cap
            host_config.memory_swap = Some(bytes);
        }
        if spec.cpu_cores > 0.0 {
            host_config.nano_cpus = Some((spec.cpu_cores * 1_000_000_000.0) as i64);
        }

        let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        env.sort();

        Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            tty: Some(spec.tty),
            open_stdin: Some(spec.tty),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        }
    }
}

/// Outcome of a single pull attempt
enum PullError {
    Transient(String),
    Permanent(String),
}

impl PullError {
    fn classify(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        if lower.contains("manifest unknown")
            || lower.contains("not found")
            || lower.contains("unauthorized")
            || lower.contains("denied")
        {
            PullError::Permanent(reason.to_string())
        } else {
            PullError::Transient(reason.to_string())
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn ensure_network(&self, name: &str) -> Result<()> {
        match self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                let options = CreateNetworkOptions {
                    name: name.to_string(),
                    driver: "bridge".to_string(),
                    check_duplicate: true,
                    ..Default::default()
                };
                match self.client.create_network(options).await {
                    Ok(_) => {
                        info!(network = name, "Created bridge network");
                        Ok(())
                    }
                    // Lost a race with a concurrent creator
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 409, ..
                    }) => Ok(()),
                    Err(e) => Err(classify_engine_error(name, e)),
                }
            }
            Err(e) => Err(classify_engine_error(name, e)),
        }
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        self.remove_existing(&spec.name).await?;
        self.pull_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .client
            .create_container(Some(options), self.container_config(spec))
            .await
            .map_err(|e| classify_engine_error(&spec.name, e))?;
        let container_id = response.id;

        debug!(container = %spec.name, container_id, image = %spec.image, "Created container");

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            let err = classify_engine_error(&spec.name, e);
            // A created-but-unstartable container would block the name
            if let Err(cleanup) = self.remove(&container_id, true, true).await {
                warn!(container_id, error = %cleanup, "Failed to clean up container after start failure");
            }
            return Err(err);
        }

        info!(container = %spec.name, container_id, "Started container");
        Ok(container_id)
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container_id = id, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(classify_engine_error(id, e)),
        }
    }

    async fn remove(&self, id: &str, force: bool, remove_volumes: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: remove_volumes,
            ..Default::default()
        };

        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| classify_engine_error(id, e))?;
        debug!(container_id = id, "Removed container");
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.client
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(|e| classify_engine_error(name, e))?;
        debug!(volume = name, "Removed volume");
        Ok(())
    }

    async fn inspect_status(&self, id: &str) -> Result<ContainerStatus> {
        match self.client.inspect_container(id, None).await {
            Ok(info) => {
                let status = info.state.and_then(|s| s.status).map(|s| match s {
                    ContainerStateStatusEnum::CREATED => ContainerStatus::Created,
                    ContainerStateStatusEnum::RUNNING => ContainerStatus::Running,
                    ContainerStateStatusEnum::PAUSED => ContainerStatus::Paused,
                    ContainerStateStatusEnum::RESTARTING => ContainerStatus::Restarting,
                    ContainerStateStatusEnum::REMOVING => ContainerStatus::Removing,
                    ContainerStateStatusEnum::EXITED => ContainerStatus::Exited,
                    ContainerStateStatusEnum::DEAD => ContainerStatus::Dead,
                    _ => ContainerStatus::Unknown,
                });
                Ok(status.unwrap_or(ContainerStatus::Unknown))
            }
            Err(e) => match classify_engine_error(id, e) {
                OrchestratorError::DriftNotFound(_) => Ok(ContainerStatus::NotFound),
                other => Err(other),
            },
        }
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.client.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(ContainerStats::from_engine(&stats)),
            Some(Err(e)) => Err(classify_engine_error(id, e)),
            None => Err(OrchestratorError::Container(format!(
                "engine returned no stats for {}",
                id
            ))),
        }
    }

    async fn logs(&self, id: &str, tail_lines: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            tail: tail_lines.to_string(),
            ..Default::default()
        };

        collect_output(id, self.client.logs(id, Some(options))).await
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<String> {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(argv.to_vec()),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(id, options)
            .await
            .map_err(|e| classify_engine_error(id, e))?;

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify_engine_error(id, e))?
        {
            StartExecResults::Attached { output, .. } => collect_output(id, output).await,
            StartExecResults::Detached => Err(OrchestratorError::Container(
                "exec did not attach to output".to_string(),
            )),
        }
    }

    async fn run_in_volume(&self, volume: &str, script: &str) -> Result<String> {
        let image = self.config.helper_image.clone();
        self.pull_image(&image).await?;

        let config = Config {
            image: Some(image),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
            labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "helper".to_string())])),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", volume, HELPER_MOUNT)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| classify_engine_error(volume, e))?;
        let helper_id = created.id;

        let result = self.run_helper_to_completion(&helper_id).await;

        if let Err(e) = self.remove(&helper_id, true, true).await {
            warn!(helper_id, error = %e, "Failed to remove helper container");
        }
        result
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ManagedContainer>> {
        let options = ListContainersOptions::<String> {
            all,
            filters: HashMap::from([("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)])]),
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| classify_engine_error(NAME_PREFIX, e))?;

        Ok(containers
            .into_iter()
            .map(|c| ManagedContainer {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                instance: c.labels.and_then(|mut labels| labels.remove(INSTANCE_LABEL)),
                state: c.state.unwrap_or_default(),
            })
            .collect())
    }
}

impl DockerManager {
    async fn run_helper_to_completion(&self, helper_id: &str) -> Result<String> {
        self.client
            .start_container(helper_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify_engine_error(helper_id, e))?;

        let timeout = Duration::from_secs(self.config.engine_timeout_secs);
        let mut wait = self
            .client
            .wait_container(helper_id, None::<WaitContainerOptions<String>>);
        let exit_code = match tokio::time::timeout(timeout, wait.next()).await {
            Ok(Some(Ok(response))) => response.status_code,
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => return Err(classify_engine_error(helper_id, e)),
            Ok(None) => 0,
            Err(_) => {
                return Err(OrchestratorError::Timeout {
                    action: "waiting for helper container".to_string(),
                    secs: timeout.as_secs(),
                })
            }
        };

        let output = self.logs(helper_id, 200).await.unwrap_or_default();
        if exit_code != 0 {
            return Err(OrchestratorError::Container(format!(
                "helper exited with code {}: {}",
                exit_code,
                output.trim()
            )));
        }
        Ok(output)
    }
}
