//! Application families
//!
//! Each supported server family knows its image, its conventional port and
//! how to turn a generic settings map into environment variables and config
//! files. The family is resolved once when an instance is declared and is
//! stored with the record.

use crate::docker::PortMapping;
use crate::instance::{InstanceRecord, Protocol, Settings};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A file written into the instance data volume before start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeFile {
    /// Path relative to the volume root
    pub path: String,
    pub contents: String,
}

/// Per-family configuration builder
pub trait FamilyAdapter: Send + Sync {
    /// Short identifier stored with the record
    fn kind(&self) -> &'static str;

    fn image(&self, settings: &Settings) -> String;

    /// Port the server listens on inside the container
    fn internal_port(&self) -> u16;

    /// Conventional host port, tried first by the allocator
    fn default_port(&self) -> u16 {
        self.internal_port()
    }

    fn protocol(&self) -> Protocol;

    /// Allocate a TTY for the server console
    fn tty(&self) -> bool {
        false
    }

    fn build_environment(&self, record: &InstanceRecord) -> HashMap<String, String>;

    /// Files to place in the data volume; also used for live rewrites
    fn volume_files(&self, _settings: &Settings) -> Vec<VolumeFile> {
        Vec::new()
    }

    /// uid/gid the server process runs as, if the volume must be chowned
    fn volume_owner(&self) -> Option<(u32, u32)> {
        None
    }

    /// Program that forwards an admin command to the server console
    fn console_command(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Supported families
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Family {
    Minecraft,
    Factorio,
    Custom(CustomFamily),
}

impl Family {
    pub fn adapter(&self) -> &dyn FamilyAdapter {
        match self {
            Family::Minecraft => &MinecraftFamily,
            Family::Factorio => &FactorioFamily,
            Family::Custom(custom) => custom,
        }
    }

    /// Resolve a family from its kind name
    ///
    /// `custom` reads `image`, `internal_port`, `protocol` and optionally
    /// `default_port` from the settings map.
    pub fn resolve(kind: &str, settings: &Settings) -> Result<Self, String> {
        match kind {
            "minecraft" => Ok(Family::Minecraft),
            "factorio" => Ok(Family::Factorio),
            "custom" => CustomFamily::from_settings(settings).map(Family::Custom),
            other => Err(format!(
                "unknown family '{}'; expected minecraft, factorio or custom",
                other
            )),
        }
    }
}

/// Minecraft Java edition via itzg/minecraft-server
#[derive(Debug, Clone, Copy)]
pub struct MinecraftFamily;

impl FamilyAdapter for MinecraftFamily {
    fn kind(&self) -> &'static str {
        "minecraft"
    }

    fn image(&self, settings: &Settings) -> String {
        let tag = settings
            .get("image_tag")
            .map(String::as_str)
            .unwrap_or("latest");
        format!("itzg/minecraft-server:{}", tag)
    }

    fn internal_port(&self) -> u16 {
        25565
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn tty(&self) -> bool {
        true
    }

    fn build_environment(&self, record: &InstanceRecord) -> HashMap<String, String> {
        let mut env = HashMap::from([
            ("EULA".to_string(), "TRUE".to_string()),
            // Leave headroom below the container limit for the JVM itself
            ("MEMORY".to_string(), format!("{}M", jvm_heap_mb(record.memory_mb))),
        ]);

        const MAPPED: &[(&str, &str)] = &[
            ("type", "TYPE"),
            ("version", "VERSION"),
            ("motd", "MOTD"),
            ("difficulty", "DIFFICULTY"),
            ("max_players", "MAX_PLAYERS"),
            ("online_mode", "ONLINE_MODE"),
            ("gamemode", "MODE"),
            ("seed", "SEED"),
        ];
        for (key, var) in MAPPED {
            if let Some(value) = record.settings.get(*key) {
                env.insert(var.to_string(), value.clone());
            }
        }

        env
    }

    fn volume_files(&self, _settings: &Settings) -> Vec<VolumeFile> {
        vec![VolumeFile {
            path: "eula.txt".to_string(),
            contents: "eula=true\n".to_string(),
        }]
    }

    fn volume_owner(&self) -> Option<(u32, u32)> {
        Some((1000, 1000))
    }

    fn console_command(&self) -> &'static [&'static str] {
        &["rcon-cli"]
    }
}

fn jvm_heap_mb(memory_mb: u64) -> u64 {
    (memory_mb / 4).saturating_mul(3).max(512)
}

/// Factorio headless server via factoriotools/factorio
#[derive(Debug, Clone, Copy)]
pub struct FactorioFamily;

impl FamilyAdapter for FactorioFamily {
    fn kind(&self) -> &'static str {
        "factorio"
    }

    fn image(&self, settings: &Settings) -> String {
        let tag = settings
            .get("image_tag")
            .map(String::as_str)
            .unwrap_or("stable");
        format!("factoriotools/factorio:{}", tag)
    }

    fn internal_port(&self) -> u16 {
        34197
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn build_environment(&self, record: &InstanceRecord) -> HashMap<String, String> {
        let save = record
            .settings
            .get("save_name")
            .cloned()
            .unwrap_or_else(|| record.id.clone());
        HashMap::from([
            ("SAVE_NAME".to_string(), save),
            ("GENERATE_NEW_SAVE".to_string(), "true".to_string()),
            ("LOAD_LATEST_SAVE".to_string(), "false".to_string()),
        ])
    }

    fn volume_files(&self, settings: &Settings) -> Vec<VolumeFile> {
        let max_players: u32 = settings
            .get("max_players")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let server_settings = serde_json::json!({
            "name": settings.get("name").map(String::as_str).unwrap_or("Factorio server"),
            "description": settings.get("description").map(String::as_str).unwrap_or(""),
            "max_players": max_players,
            "visibility": { "public": false, "lan": true },
            "game_password": settings.get("password").map(String::as_str).unwrap_or(""),
            "require_user_verification": false,
            "autosave_interval": 10,
            "auto_pause": true,
        });
        vec![VolumeFile {
            path: "config/server-settings.json".to_string(),
            contents: format!("{:#}\n", server_settings),
        }]
    }

    fn volume_owner(&self) -> Option<(u32, u32)> {
        Some((845, 845))
    }
}

/// Operator-defined family: image and port come from the settings map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFamily {
    pub image: String,
    pub internal_port: u16,
    pub default_port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub tty: bool,
}

/// Settings keys consumed by `CustomFamily` itself, not passed as env
const CUSTOM_RESERVED_KEYS: &[&str] = &["image", "internal_port", "default_port", "protocol", "tty"];

impl CustomFamily {
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let image = settings
            .get("image")
            .filter(|v| !v.trim().is_empty())
            .ok_or("custom family requires an 'image' setting")?
            .clone();
        let internal_port: u16 = settings
            .get("internal_port")
            .ok_or("custom family requires an 'internal_port' setting")?
            .parse()
            .map_err(|_| "custom family 'internal_port' must be a port number".to_string())?;
        if internal_port == 0 {
            return Err("custom family 'internal_port' must not be 0".to_string());
        }
        let default_port = match settings.get("default_port") {
            Some(v) => v
                .parse()
                .map_err(|_| "custom family 'default_port' must be a port number".to_string())?,
            None => internal_port,
        };
        let protocol = match settings.get("protocol") {
            Some(v) => v.parse()?,
            None => Protocol::Tcp,
        };
        let tty = settings.get("tty").map(|v| v == "true").unwrap_or(false);

        Ok(Self {
            image,
            internal_port,
            default_port,
            protocol,
            tty,
        })
    }
}

impl FamilyAdapter for CustomFamily {
    fn kind(&self) -> &'static str {
        "custom"
    }

    fn image(&self, _settings: &Settings) -> String {
        self.image.clone()
    }

    fn internal_port(&self) -> u16 {
        self.internal_port
    }

    fn default_port(&self) -> u16 {
        self.default_port
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn tty(&self) -> bool {
        self.tty
    }

    fn build_environment(&self, record: &InstanceRecord) -> HashMap<String, String> {
        record
            .settings
            .iter()
            .filter(|(k, _)| !CUSTOM_RESERVED_KEYS.contains(&k.as_str()) && k.as_str() != "extra_ports")
            .map(|(k, v)| (k.to_ascii_uppercase(), v.clone()))
            .collect()
    }
}

/// Parse the optional `extra_ports` setting
///
/// Format: comma-separated `host:container/protocol` entries, e.g.
/// `25575:25575/tcp,19132:19132/udp`. These ports are published as-is and
/// are not taken from the port pool.
pub fn parse_extra_ports(settings: &Settings) -> Result<Vec<PortMapping>, String> {
    let Some(raw) = settings.get("extra_ports") else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (ports, protocol) = entry.split_once('/').unwrap_or((entry, "tcp"));
            let (host, container) = ports
                .split_once(':')
                .ok_or_else(|| format!("extra port '{}' must look like host:container/proto", entry))?;
            let host_port: u16 = host
                .parse()
                .map_err(|_| format!("invalid host port in '{}'", entry))?;
            let container_port: u16 = container
                .parse()
                .map_err(|_| format!("invalid container port in '{}'", entry))?;
            Ok(PortMapping {
                host_port,
                container_port,
                protocol: protocol.parse()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Status;
    use chrono::Utc;

    fn record(family: Family, settings: Settings) -> InstanceRecord {
        InstanceRecord {
            id: "alpha".to_string(),
            family,
            settings,
            memory_mb: 4096,
            cpu_cores: 2.0,
            port: 25565,
            protocol: Protocol::Tcp,
            container_id: None,
            status: Status::Stopped,
            status_message: None,
            network_warning: None,
            hostname: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_minecraft_environment() {
        let settings = Settings::from([
            ("version".to_string(), "1.21.1".to_string()),
            ("motd".to_string(), "hello".to_string()),
            ("unrelated".to_string(), "x".to_string()),
        ]);
        let env = MinecraftFamily.build_environment(&record(Family::Minecraft, settings));

        assert_eq!(env.get("EULA").unwrap(), "TRUE");
        assert_eq!(env.get("MEMORY").unwrap(), "3072M");
        assert_eq!(env.get("VERSION").unwrap(), "1.21.1");
        assert_eq!(env.get("MOTD").unwrap(), "hello");
        assert!(!env.contains_key("UNRELATED"));
    }

    #[test]
    fn test_jvm_heap_floor() {
        assert_eq!(jvm_heap_mb(256), 512);
        assert_eq!(jvm_heap_mb(2048), 1536);
        assert_eq!(jvm_heap_mb(u64::MAX), u64::MAX / 4 * 3);
    }

    #[test]
    fn test_factorio_server_settings_file() {
        let settings = Settings::from([
            ("name".to_string(), "Factory".to_string()),
            ("max_players".to_string(), "8".to_string()),
        ]);
        let files = FactorioFamily.volume_files(&settings);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "config/server-settings.json");

        let parsed: serde_json::Value = serde_json::from_str(&files[0].contents).unwrap();
        assert_eq!(parsed["name"], "Factory");
        assert_eq!(parsed["max_players"], 8);
        assert_eq!(FactorioFamily.protocol(), Protocol::Udp);
    }

    #[test]
    fn test_custom_family_from_settings() {
        let settings = Settings::from([
            ("image".to_string(), "ghcr.io/example/server:1".to_string()),
            ("internal_port".to_string(), "7777".to_string()),
            ("protocol".to_string(), "both".to_string()),
            ("world".to_string(), "earth".to_string()),
        ]);
        let family = Family::resolve("custom", &settings).unwrap();
        let adapter = family.adapter();

        assert_eq!(adapter.internal_port(), 7777);
        assert_eq!(adapter.default_port(), 7777);
        assert_eq!(adapter.protocol(), Protocol::Both);

        let env = adapter.build_environment(&record(family.clone(), settings));
        assert_eq!(env.get("WORLD").unwrap(), "earth");
        assert!(!env.contains_key("IMAGE"));
        assert!(!env.contains_key("INTERNAL_PORT"));
    }

    #[test]
    fn test_custom_family_requires_image() {
        let settings = Settings::from([("internal_port".to_string(), "7777".to_string())]);
        assert!(Family::resolve("custom", &settings).is_err());
        assert!(Family::resolve("quake", &Settings::new()).is_err());
    }

    #[test]
    fn test_family_serde_tag() {
        let json = serde_json::to_string(&Family::Minecraft).unwrap();
        assert_eq!(json, r#"{"kind":"minecraft"}"#);
        let parsed: Family = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Family::Minecraft);
    }

    #[test]
    fn test_parse_extra_ports() {
        let settings = Settings::from([(
            "extra_ports".to_string(),
            "25575:25575/tcp, 19132:19132/udp".to_string(),
        )]);
        let ports = parse_extra_ports(&settings).unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].protocol, Protocol::Udp);

        let bad = Settings::from([("extra_ports".to_string(), "25575".to_string())]);
        assert!(parse_extra_ports(&bad).is_err());
        assert!(parse_extra_ports(&Settings::new()).unwrap().is_empty());
    }
}
