//! SQLite database for persistent instance state
//!
//! Instance records and control-plane settings live here so they survive
//! restarts of the control plane.

use crate::error::{OrchestratorError, Result};
use crate::family::Family;
use crate::instance::{InstanceRecord, Settings, Status};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const ROUTER_AUTOMATION_KEY: &str = "router_automation";

const INSTANCE_COLUMNS: &str = "id, family, settings, memory_mb, cpu_cores, port, protocol, container_id,
     status, status_message, network_warning, hostname, created_at, updated_at";

/// Read/write access to persisted instance records
pub trait InstanceStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<InstanceRecord>>;

    /// Insert or replace the record with the same id
    fn save(&self, record: &InstanceRecord) -> Result<()>;

    fn delete(&self, id: &str) -> Result<bool>;

    fn list(&self) -> Result<Vec<InstanceRecord>>;

    /// Running instances that requested hostname routing
    fn list_running_with_hostname(&self) -> Result<Vec<InstanceRecord>>;
}

/// Persisted control-plane switches
pub trait SettingsStore: Send + Sync {
    fn router_automation_enabled(&self) -> Result<bool>;

    fn set_router_automation(&self, enabled: bool) -> Result<()>;
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Seed the router automation flag unless it was ever set
    pub fn init_router_automation(&self, default: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![ROUTER_AUTOMATION_KEY, default.to_string()],
        )?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: instances table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: instances");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                family TEXT NOT NULL,
                settings TEXT NOT NULL DEFAULT '{}',
                memory_mb INTEGER NOT NULL,
                cpu_cores REAL NOT NULL,
                port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                container_id TEXT,
                status TEXT NOT NULL DEFAULT 'stopped',
                status_message TEXT,
                network_warning TEXT,
                hostname TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Migration v2: key/value settings
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: settings");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (2);
            "#,
        )?;

        Ok(())
    }

    fn query_instances(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM instances {} ORDER BY id", INSTANCE_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt
            .query_map(args, InstanceRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(InstanceRow::into_record).collect()
    }
}

// ==================== Instance Operations ====================

impl InstanceStore for Database {
    fn load(&self, id: &str) -> Result<Option<InstanceRecord>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {} FROM instances WHERE id = ?1", INSTANCE_COLUMNS),
                params![id],
                InstanceRow::from_row,
            )
            .optional()?
        };
        row.map(InstanceRow::into_record).transpose()
    }

    fn save(&self, record: &InstanceRecord) -> Result<()> {
        let family = serde_json::to_string(&record.family)?;
        let settings = serde_json::to_string(&record.settings)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instances (id, family, settings, memory_mb, cpu_cores, port, protocol, container_id,
                                    status, status_message, network_warning, hostname, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                family = excluded.family,
                settings = excluded.settings,
                memory_mb = excluded.memory_mb,
                cpu_cores = excluded.cpu_cores,
                port = excluded.port,
                protocol = excluded.protocol,
                container_id = excluded.container_id,
                status = excluded.status,
                status_message = excluded.status_message,
                network_warning = excluded.network_warning,
                hostname = excluded.hostname,
                updated_at = excluded.updated_at",
            params![
                record.id,
                family,
                settings,
                record.memory_mb as i64,
                record.cpu_cores,
                record.port,
                record.protocol.as_str(),
                record.container_id,
                record.status.as_str(),
                record.status_message,
                record.network_warning,
                record.hostname,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM instances WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn list(&self) -> Result<Vec<InstanceRecord>> {
        self.query_instances("", &[])
    }

    fn list_running_with_hostname(&self) -> Result<Vec<InstanceRecord>> {
        self.query_instances(
            "WHERE status = ?1 AND hostname IS NOT NULL AND hostname != ''",
            &[&Status::Running.as_str()],
        )
    }
}

// ==================== Settings Operations ====================

impl SettingsStore for Database {
    fn router_automation_enabled(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![ROUTER_AUTOMATION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.as_deref() == Some("true"))
    }

    fn set_router_automation(&self, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![ROUTER_AUTOMATION_KEY, enabled.to_string()],
        )?;
        Ok(())
    }
}

/// Raw column values of one `instances` row
struct InstanceRow {
    id: String,
    family: String,
    settings: String,
    memory_mb: i64,
    cpu_cores: f64,
    port: u16,
    protocol: String,
    container_id: Option<String>,
    status: String,
    status_message: Option<String>,
    network_warning: Option<String>,
    hostname: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            family: row.get(1)?,
            settings: row.get(2)?,
            memory_mb: row.get(3)?,
            cpu_cores: row.get(4)?,
            port: row.get(5)?,
            protocol: row.get(6)?,
            container_id: row.get(7)?,
            status: row.get(8)?,
            status_message: row.get(9)?,
            network_warning: row.get(10)?,
            hostname: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<InstanceRecord> {
        let id = self.id;
        let corrupt = |what: &str, detail: String| {
            OrchestratorError::InvalidInstance(format!("stored record '{}' has bad {}: {}", id, what, detail))
        };

        let family: Family = serde_json::from_str(&self.family)?;
        let settings: Settings = serde_json::from_str(&self.settings)?;
        let protocol = self.protocol.parse().map_err(|e| corrupt("protocol", e))?;
        let status = self.status.parse().map_err(|e| corrupt("status", e))?;
        let created_at = parse_timestamp(&self.created_at).map_err(|e| corrupt("created_at", e))?;
        let updated_at = parse_timestamp(&self.updated_at).map_err(|e| corrupt("updated_at", e))?;

        Ok(InstanceRecord {
            id,
            family,
            settings,
            memory_mb: self.memory_mb.max(0) as u64,
            cpu_cores: self.cpu_cores,
            port: self.port,
            protocol,
            container_id: self.container_id,
            status,
            status_message: self.status_message,
            network_warning: self.network_warning,
            hostname: self.hostname,
            created_at,
            updated_at,
        })
    }
}

fn parse_timestamp(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Protocol;
    use tempfile::TempDir;

    fn record(id: &str, status: Status, hostname: Option<&str>) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            id: id.to_string(),
            family: Family::Minecraft,
            settings: Settings::from([("motd".to_string(), "hi".to_string())]),
            memory_mb: 2048,
            cpu_cores: 1.5,
            port: 25565,
            protocol: Protocol::Tcp,
            container_id: None,
            status,
            status_message: None,
            network_warning: None,
            hostname: hostname.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_save_and_load_instance() {
        let db = Database::open_in_memory().unwrap();
        let original = record("alpha", Status::Stopped, Some("alpha.example.com"));
        db.save(&original).unwrap();

        let loaded = db.load("alpha").unwrap().unwrap();
        assert_eq!(loaded.id, "alpha");
        assert_eq!(loaded.family, Family::Minecraft);
        assert_eq!(loaded.settings.get("motd").map(String::as_str), Some("hi"));
        assert_eq!(loaded.port, 25565);
        assert_eq!(loaded.cpu_cores, 1.5);
        assert_eq!(loaded.created_at.timestamp(), original.created_at.timestamp());
        assert!(db.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_save_is_upsert() {
        let db = Database::open_in_memory().unwrap();
        let mut rec = record("alpha", Status::Stopped, None);
        db.save(&rec).unwrap();

        rec.set_status(Status::Running);
        rec.container_id = Some("abc123".to_string());
        db.save(&rec).unwrap();

        let loaded = db.load("alpha").unwrap().unwrap();
        assert_eq!(loaded.status, Status::Running);
        assert_eq!(loaded.container_id.as_deref(), Some("abc123"));
        assert_eq!(db.list().unwrap().len(), 1);
    }

    #[test]
    fn test_list_running_with_hostname() {
        let db = Database::open_in_memory().unwrap();
        db.save(&record("a", Status::Running, Some("a.example.com"))).unwrap();
        db.save(&record("b", Status::Running, None)).unwrap();
        db.save(&record("c", Status::Stopped, Some("c.example.com"))).unwrap();
        db.save(&record("d", Status::Running, Some(""))).unwrap();

        let routed = db.list_running_with_hostname().unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].id, "a");
    }

    #[test]
    fn test_delete_instance() {
        let db = Database::open_in_memory().unwrap();
        db.save(&record("alpha", Status::Stopped, None)).unwrap();
        assert!(db.delete("alpha").unwrap());
        assert!(!db.delete("alpha").unwrap());
        assert!(db.load("alpha").unwrap().is_none());
    }

    #[test]
    fn test_router_automation_flag() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.router_automation_enabled().unwrap());

        db.init_router_automation(true).unwrap();
        assert!(db.router_automation_enabled().unwrap());

        db.set_router_automation(false).unwrap();
        db.init_router_automation(true).unwrap();
        assert!(!db.router_automation_enabled().unwrap());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("serverdock.db");

        {
            let db = Database::open(&path).unwrap();
            db.save(&record("alpha", Status::Running, None)).unwrap();
            db.set_router_automation(true).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.load("alpha").unwrap().unwrap().status, Status::Running);
        assert!(db.router_automation_enabled().unwrap());
    }
}
