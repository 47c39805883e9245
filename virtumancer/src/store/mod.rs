//! SQLite-backed inventory: hosts, canonical VMs, discovered VMs, device
//! attachments and settings.
//!
//! The store is the only component that writes persisted rows. Multi-row
//! writes (import, hardware replacement, bulk updates) run in one transaction.

mod devices;
mod discovered;
mod error;
mod hosts;
mod settings;
mod vms;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};

pub use discovered::UpsertOutcome;
pub use error::{Result, StoreError};
pub use vms::NewVm;

/// File name of the inventory database inside the data directory.
pub const DB_FILE: &str = "virtumancer.db";

/// How long a statement waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the inventory database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) `<data_dir>/virtumancer.db` and apply the schema.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join(DB_FILE);
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Transaction that takes the write lock on `BEGIN`, so a read followed by
    /// a write cannot fail to upgrade when another writer got there first.
    pub(crate) async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                id TEXT PRIMARY KEY,
                uri TEXT NOT NULL,
                auto_reconnect_disabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS virtual_machines (
                uuid TEXT PRIMARY KEY,
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                domain_uuid TEXT NOT NULL UNIQUE,
                state TEXT NOT NULL,
                task_state TEXT,
                vcpu_count INTEGER NOT NULL,
                memory_bytes INTEGER NOT NULL,
                cpu_model TEXT,
                cpu_topology TEXT,
                os_type TEXT NOT NULL,
                sync_status TEXT NOT NULL DEFAULT 'UNKNOWN',
                drift_details TEXT NOT NULL DEFAULT '[]',
                needs_rebuild INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (host_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS discovered_vms (
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                domain_uuid TEXT NOT NULL,
                name TEXT NOT NULL,
                info TEXT NOT NULL DEFAULT '{}',
                last_seen_at TEXT NOT NULL,
                imported INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (host_id, domain_uuid)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_type TEXT NOT NULL,
                identity TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (device_type, identity)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vm_uuid TEXT NOT NULL REFERENCES virtual_machines(uuid) ON DELETE CASCADE,
                device_id INTEGER NOT NULL REFERENCES devices(id),
                kind TEXT NOT NULL,
                device_key TEXT NOT NULL,
                attrs TEXT NOT NULL,
                UNIQUE (vm_uuid, kind, device_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attachment_indices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vm_uuid TEXT NOT NULL,
                device_type TEXT NOT NULL,
                attachment_id INTEGER NOT NULL REFERENCES attachments(id) ON DELETE CASCADE,
                device_id INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_attachment_indices_attachment
            ON attachment_indices (device_type, attachment_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Volumes may back several VMs; every other device belongs to one.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_attachment_indices_device
            ON attachment_indices (device_type, device_id)
            WHERE device_type <> 'volume'
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_attachment_indices_vm
            ON attachment_indices (vm_uuid)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {:?}: {}", s, e)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Store;
    use tempfile::TempDir;

    /// Store in a fresh temp dir; keep the dir alive for the test's duration.
    pub async fn temp_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (store, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_store;
    use super::*;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (store, dir) = temp_store().await;
        store.create_host("h1", "test:///default").await.unwrap();
        drop(store);

        let reopened = Store::open(dir.path()).await.unwrap();
        let hosts = reopened.list_hosts().await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert!(dir.path().join(DB_FILE).exists());
    }
}
