use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{Result, Store, parse_ts, ts};
use crate::model::DiscoveredVm;

/// Observations younger than this are not rewritten.
pub const STALE_AFTER_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Refreshed,
    /// Seen less than 30 s ago; nothing written.
    Unchanged,
}

impl Store {
    pub async fn upsert_discovered(
        &self,
        host_id: &str,
        domain_uuid: &str,
        name: &str,
        info: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut tx = self.begin_write().await?;

        let existing = sqlx::query(
            "SELECT last_seen_at FROM discovered_vms WHERE host_id = ? AND domain_uuid = ?",
        )
        .bind(host_id)
        .bind(domain_uuid)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO discovered_vms (host_id, domain_uuid, name, info, last_seen_at, imported)
                    VALUES (?, ?, ?, ?, ?, 0)
                    "#,
                )
                .bind(host_id)
                .bind(domain_uuid)
                .bind(name)
                .bind(serde_json::to_string(info)?)
                .bind(ts(now))
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted
            }
            Some(row) => {
                let last_seen: String = row.get("last_seen_at");
                if now - parse_ts(&last_seen)? < Duration::seconds(STALE_AFTER_SECS) {
                    UpsertOutcome::Unchanged
                } else {
                    sqlx::query(
                        r#"
                        UPDATE discovered_vms SET name = ?, info = ?, last_seen_at = ?
                        WHERE host_id = ? AND domain_uuid = ?
                        "#,
                    )
                    .bind(name)
                    .bind(serde_json::to_string(info)?)
                    .bind(ts(now))
                    .bind(host_id)
                    .bind(domain_uuid)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Refreshed
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn list_discovered(&self, host_id: &str) -> Result<Vec<DiscoveredVm>> {
        let rows = sqlx::query(
            r#"
            SELECT host_id, domain_uuid, name, info, last_seen_at, imported
            FROM discovered_vms WHERE host_id = ? ORDER BY name
            "#,
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_discovered).collect()
    }

    pub async fn get_discovered(
        &self,
        host_id: &str,
        domain_uuid: &str,
    ) -> Result<Option<DiscoveredVm>> {
        let row = sqlx::query(
            r#"
            SELECT host_id, domain_uuid, name, info, last_seen_at, imported
            FROM discovered_vms WHERE host_id = ? AND domain_uuid = ?
            "#,
        )
        .bind(host_id)
        .bind(domain_uuid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_discovered).transpose()
    }

    /// Find a discovered domain on any host.
    pub async fn find_discovered(&self, domain_uuid: &str) -> Result<Option<DiscoveredVm>> {
        let row = sqlx::query(
            r#"
            SELECT host_id, domain_uuid, name, info, last_seen_at, imported
            FROM discovered_vms WHERE domain_uuid = ? LIMIT 1
            "#,
        )
        .bind(domain_uuid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_discovered).transpose()
    }

    /// Returns true when the flag flipped. Already-imported rows are left alone.
    pub async fn mark_imported(&self, host_id: &str, domain_uuid: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE discovered_vms SET imported = 1
            WHERE host_id = ? AND domain_uuid = ? AND imported = 0
            "#,
        )
        .bind(host_id)
        .bind(domain_uuid)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn bulk_mark_imported(&self, host_id: &str, domain_uuids: &[String]) -> Result<u64> {
        let mut tx = self.begin_write().await?;
        let mut flipped = 0;
        for domain_uuid in domain_uuids {
            flipped += sqlx::query(
                r#"
                UPDATE discovered_vms SET imported = 1
                WHERE host_id = ? AND domain_uuid = ? AND imported = 0
                "#,
            )
            .bind(host_id)
            .bind(domain_uuid)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(flipped)
    }

    pub async fn bulk_delete_discovered(
        &self,
        host_id: &str,
        domain_uuids: &[String],
    ) -> Result<u64> {
        let mut tx = self.begin_write().await?;
        let mut deleted = 0;
        for domain_uuid in domain_uuids {
            deleted += sqlx::query(
                "DELETE FROM discovered_vms WHERE host_id = ? AND domain_uuid = ?",
            )
            .bind(host_id)
            .bind(domain_uuid)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    /// Remove un-imported rows of `host_id` whose domain is not in `live`.
    pub async fn delete_discovered_not_in(&self, host_id: &str, live: &[String]) -> Result<u64> {
        let live: HashSet<&str> = live.iter().map(String::as_str).collect();
        let mut tx = self.begin_write().await?;

        let rows = sqlx::query(
            "SELECT domain_uuid FROM discovered_vms WHERE host_id = ? AND imported = 0",
        )
        .bind(host_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut deleted = 0;
        for row in rows {
            let domain_uuid: String = row.get("domain_uuid");
            if live.contains(domain_uuid.as_str()) {
                continue;
            }
            deleted += sqlx::query(
                "DELETE FROM discovered_vms WHERE host_id = ? AND domain_uuid = ?",
            )
            .bind(host_id)
            .bind(&domain_uuid)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(deleted)
    }
}

fn row_to_discovered(row: SqliteRow) -> Result<DiscoveredVm> {
    let info: String = row.get("info");
    let last_seen_at: String = row.get("last_seen_at");
    Ok(DiscoveredVm {
        host_id: row.get("host_id"),
        domain_uuid: row.get("domain_uuid"),
        name: row.get("name"),
        info: serde_json::from_str(&info)?,
        last_seen_at: parse_ts(&last_seen_at)?,
        imported: row.get::<i64, _>("imported") != 0,
    })
}
