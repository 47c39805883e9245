//! Device records and their attachments to VMs.
//!
//! Every attachment points at a device record; `attachment_indices` mirrors
//! `(vm_uuid, device_type, attachment_id, device_id)` and enforces that only
//! volumes are shared between VMs.

use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use virtumancer_hv::domain_xml::{Device, DeviceKind};

use super::{Result, Store, StoreError, ts};
use crate::model::Attachment;

/// Identity of the device record behind `device` on VM `vm_uuid`.
pub fn device_identity(vm_uuid: &str, device: &Device) -> String {
    let shared = match device.kind {
        DeviceKind::Disk => device.volume_source().map(str::to_string),
        DeviceKind::Interface => device.attrs.get("mac@address").cloned(),
        _ => None,
    };
    shared.unwrap_or_else(|| format!("{}/{}", vm_uuid, device.key))
}

/// Insert device records, attachments and index rows for one VM.
pub(super) async fn insert_hardware(
    conn: &mut SqliteConnection,
    vm_uuid: &str,
    devices: &[Device],
) -> Result<()> {
    let now = ts(Utc::now());
    for device in devices {
        let device_type = device.kind.device_type();
        let identity = device_identity(vm_uuid, device);

        sqlx::query(
            r#"
            INSERT INTO devices (device_type, identity, created_at) VALUES (?, ?, ?)
            ON CONFLICT (device_type, identity) DO NOTHING
            "#,
        )
        .bind(device_type)
        .bind(&identity)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        let device_id: i64 =
            sqlx::query("SELECT id FROM devices WHERE device_type = ? AND identity = ?")
                .bind(device_type)
                .bind(&identity)
                .fetch_one(&mut *conn)
                .await?
                .get("id");

        let attachment_id = sqlx::query(
            r#"
            INSERT INTO attachments (vm_uuid, device_id, kind, device_key, attrs)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(vm_uuid)
        .bind(device_id)
        .bind(device.kind.tag())
        .bind(&device.key)
        .bind(serde_json::to_string(&device.attrs)?)
        .execute(&mut *conn)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!(
                "duplicate {} device {:?}",
                device.kind, device.key
            )),
            other => other,
        })?
        .last_insert_rowid();

        sqlx::query(
            r#"
            INSERT INTO attachment_indices (vm_uuid, device_type, attachment_id, device_id)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(vm_uuid)
        .bind(device_type)
        .bind(attachment_id)
        .bind(device_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!(
                "{} {} is already attached to another VM",
                device_type, identity
            )),
            other => other,
        })?;
    }
    Ok(())
}

/// Drop every attachment of a VM (index rows cascade).
pub(super) async fn delete_hardware(conn: &mut SqliteConnection, vm_uuid: &str) -> Result<()> {
    sqlx::query("DELETE FROM attachments WHERE vm_uuid = ?")
        .bind(vm_uuid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(super) async fn delete_orphan_devices(conn: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM devices WHERE id NOT IN (SELECT device_id FROM attachments)",
    )
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

impl Store {
    pub async fn list_attachments(&self, vm_uuid: &str) -> Result<Vec<Attachment>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.vm_uuid, a.device_id, a.kind, a.device_key, a.attrs,
                   d.device_type, d.identity
            FROM attachments a JOIN devices d ON d.id = a.device_id
            WHERE a.vm_uuid = ?
            ORDER BY a.id
            "#,
        )
        .bind(vm_uuid)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_attachment).collect()
    }

    /// Stored devices of a VM in definition order.
    pub async fn canonical_devices(&self, vm_uuid: &str) -> Result<Vec<Device>> {
        Ok(self
            .list_attachments(vm_uuid)
            .await?
            .iter()
            .map(Attachment::to_device)
            .collect())
    }

    /// Index rows for a VM: `(device_type, attachment_id, device_id)`.
    pub async fn attachment_index(&self, vm_uuid: &str) -> Result<Vec<(String, i64, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT device_type, attachment_id, device_id FROM attachment_indices
            WHERE vm_uuid = ? ORDER BY attachment_id
            "#,
        )
        .bind(vm_uuid)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("device_type"), r.get("attachment_id"), r.get("device_id")))
            .collect())
    }
}

fn row_to_attachment(row: SqliteRow) -> Result<Attachment> {
    let kind: String = row.get("kind");
    let attrs: String = row.get("attrs");
    let attrs: BTreeMap<String, String> = serde_json::from_str(&attrs)?;
    Ok(Attachment {
        id: row.get("id"),
        vm_uuid: row.get("vm_uuid"),
        kind: DeviceKind::from_tag(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("device kind {:?}", kind)))?,
        device_type: row.get("device_type"),
        device_id: row.get("device_id"),
        device_identity: row.get("identity"),
        key: row.get("device_key"),
        attrs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(kind: DeviceKind, key: &str, attrs: &[(&str, &str)]) -> Device {
        Device {
            kind,
            key: key.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_device_identity() {
        let disk = device(DeviceKind::Disk, "vda", &[("source@file", "/img/a.qcow2")]);
        assert_eq!(device_identity("vm1", &disk), "/img/a.qcow2");

        let cdrom = device(DeviceKind::Disk, "sda", &[("@device", "cdrom")]);
        assert_eq!(device_identity("vm1", &cdrom), "vm1/sda");

        let nic = device(DeviceKind::Interface, "52:54:00:00:00:01", &[(
            "mac@address",
            "52:54:00:00:00:01",
        )]);
        assert_eq!(device_identity("vm1", &nic), "52:54:00:00:00:01");

        let ctrl = device(DeviceKind::Controller, "usb:0", &[("@type", "usb")]);
        assert_eq!(device_identity("vm1", &ctrl), "vm1/usb:0");
    }
}
