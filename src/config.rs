use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Control plane configuration, loaded from `serverdock.toml`
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Container engine access
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Host port pool
    #[serde(default)]
    pub ports: PortsConfig,

    /// Firewall and router exposure
    #[serde(default)]
    pub network: NetworkConfig,

    /// Shared stream proxy
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Lifecycle timing
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Docker endpoint, `unix:///path` or `tcp://host:port`
    /// Falls back to DOCKER_HOST, then well-known socket paths
    pub docker_host: Option<String>,

    /// Bridge network shared by instances and the proxy
    #[serde(default = "default_network")]
    pub network: String,

    /// Client I/O timeout for engine calls (default: 120)
    #[serde(default = "default_engine_timeout")]
    pub engine_timeout_secs: u64,

    /// Timeout for a single image pull attempt (default: 600)
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,

    /// Attempts for transient pull failures (default: 3)
    #[serde(default = "default_pull_retries")]
    pub pull_retries: u32,

    /// Seconds a container gets to exit before it is killed (default: 30)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Image used for disposable volume maintenance containers
    #[serde(default = "default_helper_image")]
    pub helper_image: String,

    /// Where each instance's data volume is mounted
    #[serde(default = "default_volume_mount_path")]
    pub volume_mount_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            network: default_network(),
            engine_timeout_secs: default_engine_timeout(),
            pull_timeout_secs: default_pull_timeout(),
            pull_retries: default_pull_retries(),
            stop_grace_secs: default_stop_grace(),
            helper_image: default_helper_image(),
            volume_mount_path: default_volume_mount_path(),
        }
    }
}

impl RuntimeConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    /// First port of the pool (default: 20000)
    #[serde(default = "default_port_start")]
    pub start: u16,

    /// Last port of the pool, inclusive (default: 20100)
    #[serde(default = "default_port_end")]
    pub end: u16,

    /// Ports never handed to instances, e.g. proxy listen ports
    #[serde(default)]
    pub reserved: Vec<u16>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            reserved: Vec::new(),
        }
    }
}

/// Local firewall backend
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    #[default]
    Ufw,
    /// Rules are managed outside the control plane
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default)]
    pub firewall: FirewallBackend,

    /// Prefix firewall commands with sudo
    #[serde(default)]
    pub use_sudo: bool,

    /// Initial value of the persisted router automation flag
    #[serde(default)]
    pub router_automation: bool,

    /// Path to the miniupnpc client
    #[serde(default = "default_upnpc_path")]
    pub upnpc_path: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            firewall: FirewallBackend::default(),
            use_sudo: false,
            router_automation: false,
            upnpc_path: default_upnpc_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_container")]
    pub container_name: String,

    #[serde(default = "default_proxy_image")]
    pub image: String,

    /// Named volume holding the generated configuration
    #[serde(default = "default_proxy_volume")]
    pub config_volume: String,

    /// Where the proxy container mounts `config_volume`
    #[serde(default = "default_proxy_config_dir")]
    pub config_dir: String,

    /// Earlier proxy containers removed on every sync
    #[serde(default = "default_legacy_containers")]
    pub legacy_container_names: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            container_name: default_proxy_container(),
            image: default_proxy_image(),
            config_volume: default_proxy_volume(),
            config_dir: default_proxy_config_dir(),
            legacy_container_names: default_legacy_containers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Pause between stop and start of a restart (default: 2000)
    #[serde(default = "default_restart_settle")]
    pub restart_settle_ms: u64,

    /// Start attempts when the engine reports a port bind conflict (default: 3)
    #[serde(default = "default_max_bind_attempts")]
    pub max_bind_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            restart_settle_ms: default_restart_settle(),
            max_bind_attempts: default_max_bind_attempts(),
        }
    }
}

impl LifecycleConfig {
    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Directory of lock files shared by every process using this database
    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            lock_dir: default_lock_dir(),
        }
    }
}

fn default_network() -> String {
    "serverdock".to_string()
}

fn default_engine_timeout() -> u64 {
    120
}

fn default_pull_timeout() -> u64 {
    600
}

fn default_pull_retries() -> u32 {
    3
}

fn default_stop_grace() -> u64 {
    30
}

fn default_helper_image() -> String {
    "alpine:3.20".to_string()
}

fn default_volume_mount_path() -> String {
    "/data".to_string()
}

fn default_port_start() -> u16 {
    20000
}

fn default_port_end() -> u16 {
    20100
}

fn default_upnpc_path() -> String {
    "upnpc".to_string()
}

fn default_proxy_container() -> String {
    "serverdock-proxy".to_string()
}

fn default_proxy_image() -> String {
    "nginx:1.27-alpine".to_string()
}

fn default_proxy_volume() -> String {
    "serverdock-proxy-config".to_string()
}

fn default_proxy_config_dir() -> String {
    "/etc/serverdock".to_string()
}

fn default_legacy_containers() -> Vec<String> {
    vec!["mc-router".to_string()]
}

fn default_restart_settle() -> u64 {
    2000
}

fn default_max_bind_attempts() -> u32 {
    3
}

fn default_database_path() -> String {
    "serverdock.db".to_string()
}

fn default_lock_dir() -> String {
    "serverdock.locks".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ports.start == 0 {
            errors.push("ports.start must be greater than 0".to_string());
        }
        if self.ports.start > self.ports.end {
            errors.push(format!(
                "ports.start ({}) must not exceed ports.end ({})",
                self.ports.start, self.ports.end
            ));
        }
        if self.runtime.network.trim().is_empty() {
            errors.push("runtime.network must not be empty".to_string());
        }
        if self.runtime.pull_timeout_secs == 0 {
            errors.push("runtime.pull_timeout_secs must be greater than 0".to_string());
        }
        if !self.runtime.volume_mount_path.starts_with('/') {
            errors.push(format!(
                "runtime.volume_mount_path '{}' must be an absolute path",
                self.runtime.volume_mount_path
            ));
        }
        if !self.proxy.config_dir.starts_with('/') {
            errors.push(format!(
                "proxy.config_dir '{}' must be an absolute path",
                self.proxy.config_dir
            ));
        }
        if self
            .proxy
            .legacy_container_names
            .iter()
            .any(|name| name == &self.proxy.container_name)
        {
            errors.push(format!(
                "proxy.container_name '{}' must not be listed in proxy.legacy_container_names",
                self.proxy.container_name
            ));
        }
        if self.lifecycle.max_bind_attempts == 0 {
            errors.push("lifecycle.max_bind_attempts must be at least 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
