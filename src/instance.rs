//! Instance records and lifecycle status
//!
//! An instance is one declared server: its desired resources, its assigned
//! host port, and what the orchestrator last observed about its container.

use crate::family::Family;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Prefix for every engine object owned by this control plane
pub const NAME_PREFIX: &str = "serverdock";

/// Generic key/value settings handed to a family adapter
pub type Settings = BTreeMap<String, String>;

/// Transport protocol of a published port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    /// Simultaneous tcp and udp on the same port
    Both,
}

/// A single concrete transport (`both` expands into two of these)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Both => "both",
        }
    }

    /// Concrete transports this protocol needs
    pub fn transports(&self) -> &'static [Transport] {
        match self {
            Protocol::Tcp => &[Transport::Tcp],
            Protocol::Udp => &[Transport::Udp],
            Protocol::Both => &[Transport::Tcp, Transport::Udp],
        }
    }

    /// Whether two protocols compete for the same socket on one port
    pub fn overlaps(&self, other: Protocol) -> bool {
        self.transports()
            .iter()
            .any(|t| other.transports().contains(t))
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "both" | "tcp/udp" => Ok(Protocol::Both),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }

    /// Upper-case name used by router protocols
    pub fn as_upper(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an instance
///
/// `stopped -> starting -> running -> stopping -> stopped`, with
/// `starting -> error`, `running -> error` and `error -> starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Stopped => "stopped",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Error => "error",
        }
    }

    /// Whether a container is expected to exist for this status
    pub fn expects_container(&self) -> bool {
        matches!(self, Status::Starting | Status::Running | Status::Stopping)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Status::Stopped),
            "starting" => Ok(Status::Starting),
            "running" => Ok(Status::Running),
            "stopping" => Ok(Status::Stopping),
            "error" => Ok(Status::Error),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Persisted state of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    /// Application family, resolved once when the instance is declared
    pub family: Family,
    pub settings: Settings,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    /// Assigned external host port
    pub port: u16,
    pub protocol: Protocol,
    /// Engine-assigned id of the tracked container
    pub container_id: Option<String>,
    pub status: Status,
    /// Failure text shown for `error`
    pub status_message: Option<String>,
    /// Non-fatal exposure failure from the last start or stop
    pub network_warning: Option<String>,
    pub hostname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Deterministic container name, 1:1 with the instance id
    pub fn container_name(&self) -> String {
        container_name(&self.id)
    }

    /// Deterministic data volume name
    pub fn volume_name(&self) -> String {
        volume_name(&self.id)
    }

    /// In-container port the family listens on
    pub fn internal_port(&self) -> u16 {
        self.family.adapter().internal_port()
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

pub fn container_name(id: &str) -> String {
    format!("{}-{}", NAME_PREFIX, id)
}

pub fn volume_name(id: &str) -> String {
    format!("{}-{}-data", NAME_PREFIX, id)
}

/// Validate an instance id: lowercase alphanumerics and dashes, 1-48 chars
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > 48 {
        return Err(format!("instance id must be 1-48 characters, got {}", id.len()));
    }
    if id.starts_with('-') || id.ends_with('-') {
        return Err(format!("instance id '{}' must not start or end with '-'", id));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "instance id '{}' may only contain lowercase letters, digits and '-'",
            id
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_overlap() {
        assert!(Protocol::Tcp.overlaps(Protocol::Tcp));
        assert!(Protocol::Both.overlaps(Protocol::Udp));
        assert!(Protocol::Tcp.overlaps(Protocol::Both));
        assert!(!Protocol::Tcp.overlaps(Protocol::Udp));
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("both".parse::<Protocol>().unwrap(), Protocol::Both);
        assert!("sctp".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Both.transports().len(), 2);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            Status::Stopped,
            Status::Starting,
            Status::Running,
            Status::Stopping,
            Status::Error,
        ] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!(Status::Running.expects_container());
        assert!(!Status::Error.expects_container());
    }

    #[test]
    fn test_deterministic_names() {
        assert_eq!(container_name("alpha"), "serverdock-alpha");
        assert_eq!(volume_name("alpha"), "serverdock-alpha-data");
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("survival-1").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("Upper").is_err());
        assert!(validate_id("-lead").is_err());
        assert!(validate_id("has space").is_err());
        assert!(validate_id(&"a".repeat(49)).is_err());
    }
}
