use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;
use virtumancer_hv::domain_xml::DomainSpec;

use super::devices::{delete_hardware, delete_orphan_devices, insert_hardware};
use super::{Result, Store, StoreError, parse_ts, ts};
use crate::model::{DriftDetail, SyncStatus, TaskState, VirtualMachine, VmState};

const VM_COLUMNS: &str = r#"
    uuid, host_id, name, domain_uuid, state, task_state, vcpu_count, memory_bytes,
    cpu_model, cpu_topology, os_type, sync_status, drift_details, needs_rebuild,
    created_at, updated_at
"#;

/// Input for [`Store::create_canonical_vm`].
pub struct NewVm<'a> {
    pub host_id: &'a str,
    pub name: &'a str,
    pub state: VmState,
    pub spec: &'a DomainSpec,
}

impl Store {
    /// Create a canonical VM with its hardware and mark the discovered row
    /// imported, all in one transaction.
    pub async fn create_canonical_vm(&self, new: NewVm<'_>) -> Result<VirtualMachine> {
        let domain_uuid = new.spec.uuid.to_lowercase();
        let mut tx = self.begin_write().await?;

        let already = sqlx::query("SELECT uuid FROM virtual_machines WHERE domain_uuid = ?")
            .bind(&domain_uuid)
            .fetch_optional(&mut *tx)
            .await?;
        if already.is_some() {
            return Err(StoreError::Conflict(format!(
                "domain {} is already imported",
                domain_uuid
            )));
        }

        let uuid = Uuid::new_v4().to_string();
        let now = Utc::now();
        let topology = new.spec.cpu_topology.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO virtual_machines (
                uuid, host_id, name, domain_uuid, state, task_state, vcpu_count, memory_bytes,
                cpu_model, cpu_topology, os_type, sync_status, drift_details, needs_rebuild,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, 'SYNCED', '[]', 0, ?, ?)
            "#,
        )
        .bind(&uuid)
        .bind(new.host_id)
        .bind(new.name)
        .bind(&domain_uuid)
        .bind(new.state.as_str())
        .bind(new.spec.vcpu_count as i64)
        .bind(new.spec.memory_bytes as i64)
        .bind(&new.spec.cpu_model)
        .bind(&topology)
        .bind(&new.spec.os_type)
        .bind(ts(now))
        .bind(ts(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!(
                "a VM named {} already exists on host {}",
                new.name, new.host_id
            )),
            other => other,
        })?;

        insert_hardware(&mut *tx, &uuid, &new.spec.devices).await?;

        sqlx::query(
            "UPDATE discovered_vms SET imported = 1 WHERE host_id = ? AND lower(domain_uuid) = ?",
        )
        .bind(new.host_id)
        .bind(&domain_uuid)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(VirtualMachine {
            uuid,
            host_id: new.host_id.to_string(),
            name: new.name.to_string(),
            domain_uuid,
            state: new.state,
            task_state: None,
            vcpu_count: new.spec.vcpu_count,
            memory_bytes: new.spec.memory_bytes,
            cpu_model: new.spec.cpu_model.clone(),
            cpu_topology: new.spec.cpu_topology,
            os_type: new.spec.os_type.clone(),
            sync_status: SyncStatus::Synced,
            drift_details: Vec::new(),
            needs_rebuild: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_vm(&self, uuid: &str) -> Result<Option<VirtualMachine>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM virtual_machines WHERE uuid = ?",
            VM_COLUMNS
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_vm).transpose()
    }

    /// Canonical VM by `(host_id, name)`.
    pub async fn get_vm_by_name(&self, host_id: &str, name: &str) -> Result<Option<VirtualMachine>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM virtual_machines WHERE host_id = ? AND name = ?",
            VM_COLUMNS
        ))
        .bind(host_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_vm).transpose()
    }

    pub async fn get_vm_by_domain_uuid(&self, domain_uuid: &str) -> Result<Option<VirtualMachine>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM virtual_machines WHERE domain_uuid = ?",
            VM_COLUMNS
        ))
        .bind(domain_uuid.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_vm).transpose()
    }

    pub async fn list_vms(&self) -> Result<Vec<VirtualMachine>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM virtual_machines ORDER BY host_id, name",
            VM_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_vm).collect()
    }

    pub async fn list_vms_by_host(&self, host_id: &str) -> Result<Vec<VirtualMachine>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM virtual_machines WHERE host_id = ? ORDER BY name",
            VM_COLUMNS
        ))
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_vm).collect()
    }

    /// Set or clear the task label.
    ///
    /// Setting a task only succeeds when no task is running or the same task is
    /// being retried; otherwise the VM is busy. Clearing always succeeds.
    pub async fn update_task_state(&self, uuid: &str, task: Option<TaskState>) -> Result<()> {
        let now = ts(Utc::now());
        let result = match task {
            Some(task) => {
                sqlx::query(
                    r#"
                    UPDATE virtual_machines SET task_state = ?, updated_at = ?
                    WHERE uuid = ? AND (task_state IS NULL OR task_state = ?)
                    "#,
                )
                .bind(task.as_str())
                .bind(&now)
                .bind(uuid)
                .bind(task.as_str())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE virtual_machines SET task_state = NULL, updated_at = ? WHERE uuid = ?",
                )
                .bind(&now)
                .bind(uuid)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_vm(uuid).await? {
            None => Err(StoreError::NotFound(format!("vm {}", uuid))),
            Some(vm) => Err(StoreError::Busy(format!(
                "vm {} is {}",
                vm.name,
                vm.task_state.map(TaskState::as_str).unwrap_or("busy")
            ))),
        }
    }

    pub async fn update_stable_state(&self, uuid: &str, state: VmState) -> Result<()> {
        self.update_vm_column(uuid, "state", state.as_str()).await
    }

    /// Persist a drift check result: status, details and the rebuild flag.
    pub async fn record_drift(
        &self,
        uuid: &str,
        status: SyncStatus,
        details: &[DriftDetail],
        needs_rebuild: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE virtual_machines
            SET sync_status = ?, drift_details = ?, needs_rebuild = ?, updated_at = ?
            WHERE uuid = ?
            "#,
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(details)?)
        .bind(needs_rebuild)
        .bind(ts(Utc::now()))
        .bind(uuid)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("vm {}", uuid)));
        }
        Ok(())
    }

    /// Accept `spec` as the VM's canonical hardware: core fields and every
    /// attachment are replaced and drift is cleared.
    pub async fn replace_hardware(&self, uuid: &str, spec: &DomainSpec) -> Result<()> {
        let mut tx = self.begin_write().await?;
        let topology = spec.cpu_topology.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE virtual_machines SET
                vcpu_count = ?, memory_bytes = ?, cpu_model = ?, cpu_topology = ?, os_type = ?,
                sync_status = 'SYNCED', drift_details = '[]', needs_rebuild = 0, updated_at = ?
            WHERE uuid = ?
            "#,
        )
        .bind(spec.vcpu_count as i64)
        .bind(spec.memory_bytes as i64)
        .bind(&spec.cpu_model)
        .bind(&topology)
        .bind(&spec.os_type)
        .bind(ts(Utc::now()))
        .bind(uuid)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("vm {}", uuid)));
        }

        delete_hardware(&mut *tx, uuid).await?;
        insert_hardware(&mut *tx, uuid, &spec.devices).await?;
        delete_orphan_devices(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_vm_column(&self, uuid: &str, column: &'static str, value: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE virtual_machines SET {} = ?, updated_at = ? WHERE uuid = ?",
            column
        ))
        .bind(value)
        .bind(ts(Utc::now()))
        .bind(uuid)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("vm {}", uuid)));
        }
        Ok(())
    }
}

fn row_to_vm(row: SqliteRow) -> Result<VirtualMachine> {
    let state: String = row.get("state");
    let task_state: Option<String> = row.get("task_state");
    let sync_status: String = row.get("sync_status");
    let topology: Option<String> = row.get("cpu_topology");
    let drift_details: String = row.get("drift_details");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(VirtualMachine {
        uuid: row.get("uuid"),
        host_id: row.get("host_id"),
        name: row.get("name"),
        domain_uuid: row.get("domain_uuid"),
        state: VmState::parse(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("vm state {:?}", state)))?,
        task_state: task_state
            .map(|t| {
                TaskState::parse(&t).ok_or_else(|| StoreError::Corrupt(format!("task {:?}", t)))
            })
            .transpose()?,
        vcpu_count: row.get::<i64, _>("vcpu_count") as u32,
        memory_bytes: row.get::<i64, _>("memory_bytes") as u64,
        cpu_model: row.get("cpu_model"),
        cpu_topology: topology.map(|t| serde_json::from_str(&t)).transpose()?,
        os_type: row.get("os_type"),
        sync_status: SyncStatus::parse(&sync_status)
            .ok_or_else(|| StoreError::Corrupt(format!("sync status {:?}", sync_status)))?,
        drift_details: serde_json::from_str(&drift_details)?,
        needs_rebuild: row.get::<i64, _>("needs_rebuild") != 0,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}
