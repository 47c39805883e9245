use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{Result, Store, StoreError, parse_ts, ts};
use crate::model::HostRecord;

impl Store {
    pub async fn create_host(&self, id: &str, uri: &str) -> Result<HostRecord> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO hosts (id, uri, auto_reconnect_disabled, created_at, updated_at)
            VALUES (?, ?, 0, ?, ?)
            "#,
        )
        .bind(id)
        .bind(uri)
        .bind(ts(now))
        .bind(ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!("host {} already exists", id)),
            other => other,
        })?;

        Ok(HostRecord {
            id: id.to_string(),
            uri: uri.to_string(),
            auto_reconnect_disabled: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_host(&self, id: &str) -> Result<Option<HostRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, uri, auto_reconnect_disabled, created_at, updated_at
            FROM hosts WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_host).transpose()
    }

    pub async fn list_hosts(&self) -> Result<Vec<HostRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, uri, auto_reconnect_disabled, created_at, updated_at
            FROM hosts ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_host).collect()
    }

    pub async fn update_host_uri(&self, id: &str, uri: &str) -> Result<()> {
        let result = sqlx::query("UPDATE hosts SET uri = ?, updated_at = ? WHERE id = ?")
            .bind(uri)
            .bind(ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("host {}", id)));
        }
        Ok(())
    }

    pub async fn set_auto_reconnect_disabled(&self, id: &str, disabled: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE hosts SET auto_reconnect_disabled = ?, updated_at = ? WHERE id = ?",
        )
        .bind(disabled)
        .bind(ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("host {}", id)));
        }
        Ok(())
    }

    /// Delete a host with its VMs, discovered rows and now-unused devices.
    pub async fn delete_host(&self, id: &str) -> Result<bool> {
        let mut tx = self.begin_write().await?;

        let result = sqlx::query("DELETE FROM hosts WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        super::devices::delete_orphan_devices(&mut *tx).await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_host(row: SqliteRow) -> Result<HostRecord> {
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(HostRecord {
        id: row.get("id"),
        uri: row.get("uri"),
        auto_reconnect_disabled: row.get::<i64, _>("auto_reconnect_disabled") != 0,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::store::StoreError;
    use crate::store::test_support::temp_store;

    #[tokio::test]
    async fn test_host_crud() {
        let (store, _dir) = temp_store().await;

        let host = store.create_host("h1", "test:///default").await.unwrap();
        assert!(!host.auto_reconnect_disabled);

        let err = store.create_host("h1", "test:///empty").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.update_host_uri("h1", "test:///empty").await.unwrap();
        store.set_auto_reconnect_disabled("h1", true).await.unwrap();
        let host = store.get_host("h1").await.unwrap().unwrap();
        assert_eq!(host.uri, "test:///empty");
        assert!(host.auto_reconnect_disabled);

        assert!(matches!(
            store.update_host_uri("nope", "test:///x").await,
            Err(StoreError::NotFound(_))
        ));

        assert!(store.delete_host("h1").await.unwrap());
        assert!(!store.delete_host("h1").await.unwrap());
        assert!(store.list_hosts().await.unwrap().is_empty());
    }
}
