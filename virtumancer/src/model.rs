//! Inventory entities shared by the store, the reconciler and the API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use virtumancer_hv::domain_xml::{CpuTopology, Device, DeviceKind, DomainSpec};
use virtumancer_hv::DomainState;

/// Stable VM state, as last observed on the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    Initialized,
    Active,
    Paused,
    Suspended,
    Stopped,
    Error,
}

impl VmState {
    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Initialized => "INITIALIZED",
            VmState::Active => "ACTIVE",
            VmState::Paused => "PAUSED",
            VmState::Suspended => "SUSPENDED",
            VmState::Stopped => "STOPPED",
            VmState::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "INITIALIZED" => VmState::Initialized,
            "ACTIVE" => VmState::Active,
            "PAUSED" => VmState::Paused,
            "SUSPENDED" => VmState::Suspended,
            "STOPPED" => VmState::Stopped,
            "ERROR" => VmState::Error,
            _ => return None,
        })
    }

    /// Map a hypervisor state onto a stable state. Transitional hypervisor
    /// states keep the previous value, except that a VM we believed active
    /// becomes ERROR.
    pub fn from_live(live: DomainState, previous: VmState) -> VmState {
        match live {
            DomainState::Running => VmState::Active,
            DomainState::Paused => VmState::Paused,
            DomainState::PmSuspended => VmState::Suspended,
            DomainState::Shutdown | DomainState::Shutoff => VmState::Stopped,
            DomainState::Crashed => VmState::Error,
            DomainState::NoState | DomainState::Blocked => match previous {
                VmState::Active => VmState::Error,
                other => other,
            },
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient task label. `None` on the VM means no task is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Building,
    Starting,
    Stopping,
    Rebooting,
    Pausing,
    Unpausing,
    Suspending,
    Resuming,
    Rebuilding,
    PoweringOn,
    PoweringOff,
    Scheduling,
    Deleting,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Building => "BUILDING",
            TaskState::Starting => "STARTING",
            TaskState::Stopping => "STOPPING",
            TaskState::Rebooting => "REBOOTING",
            TaskState::Pausing => "PAUSING",
            TaskState::Unpausing => "UNPAUSING",
            TaskState::Suspending => "SUSPENDING",
            TaskState::Resuming => "RESUMING",
            TaskState::Rebuilding => "REBUILDING",
            TaskState::PoweringOn => "POWERING_ON",
            TaskState::PoweringOff => "POWERING_OFF",
            TaskState::Scheduling => "SCHEDULING",
            TaskState::Deleting => "DELETING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "BUILDING" => TaskState::Building,
            "STARTING" => TaskState::Starting,
            "STOPPING" => TaskState::Stopping,
            "REBOOTING" => TaskState::Rebooting,
            "PAUSING" => TaskState::Pausing,
            "UNPAUSING" => TaskState::Unpausing,
            "SUSPENDING" => TaskState::Suspending,
            "RESUMING" => TaskState::Resuming,
            "REBUILDING" => TaskState::Rebuilding,
            "POWERING_ON" => TaskState::PoweringOn,
            "POWERING_OFF" => TaskState::PoweringOff,
            "SCHEDULING" => TaskState::Scheduling,
            "DELETING" => TaskState::Deleting,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Unknown,
    Synced,
    Drifted,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Unknown => "UNKNOWN",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Drifted => "DRIFTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "UNKNOWN" => SyncStatus::Unknown,
            "SYNCED" => SyncStatus::Synced,
            "DRIFTED" => SyncStatus::Drifted,
            _ => return None,
        })
    }
}

/// One differing field between the stored definition and the live one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftDetail {
    pub field: String,
    pub canonical: Option<String>,
    pub live: Option<String>,
}

/// Canonical VM record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub uuid: String,
    pub host_id: String,
    pub name: String,
    pub domain_uuid: String,
    pub state: VmState,
    pub task_state: Option<TaskState>,
    pub vcpu_count: u32,
    pub memory_bytes: u64,
    pub cpu_model: Option<String>,
    pub cpu_topology: Option<CpuTopology>,
    pub os_type: String,
    pub sync_status: SyncStatus,
    pub drift_details: Vec<DriftDetail>,
    pub needs_rebuild: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VirtualMachine {
    /// The stored hardware definition as a domain spec.
    pub fn spec(&self, devices: Vec<Device>) -> DomainSpec {
        DomainSpec {
            name: self.name.clone(),
            uuid: self.domain_uuid.clone(),
            vcpu_count: self.vcpu_count,
            memory_bytes: self.memory_bytes,
            cpu_model: self.cpu_model.clone(),
            cpu_topology: self.cpu_topology,
            os_type: self.os_type.clone(),
            devices,
        }
    }
}

/// A domain seen on a host, whether or not it has been imported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredVm {
    pub host_id: String,
    pub domain_uuid: String,
    pub name: String,
    pub info: serde_json::Value,
    pub last_seen_at: DateTime<Utc>,
    pub imported: bool,
}

/// Persisted host registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub uri: String,
    pub auto_reconnect_disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A device attached to a canonical VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub vm_uuid: String,
    pub kind: DeviceKind,
    pub device_type: String,
    pub device_id: i64,
    pub device_identity: String,
    pub key: String,
    pub attrs: BTreeMap<String, String>,
}

impl Attachment {
    pub fn to_device(&self) -> Device {
        Device {
            kind: self.kind,
            key: self.key.clone(),
            attrs: self.attrs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            VmState::from_live(DomainState::Running, VmState::Stopped),
            VmState::Active
        );
        assert_eq!(
            VmState::from_live(DomainState::Shutdown, VmState::Active),
            VmState::Stopped
        );
        assert_eq!(
            VmState::from_live(DomainState::PmSuspended, VmState::Active),
            VmState::Suspended
        );
        assert_eq!(
            VmState::from_live(DomainState::Crashed, VmState::Active),
            VmState::Error
        );
        assert_eq!(
            VmState::from_live(DomainState::Blocked, VmState::Active),
            VmState::Error
        );
        assert_eq!(
            VmState::from_live(DomainState::NoState, VmState::Stopped),
            VmState::Stopped
        );
    }

    #[test]
    fn test_enum_strings_round_trip() {
        for state in [
            VmState::Initialized,
            VmState::Active,
            VmState::Paused,
            VmState::Suspended,
            VmState::Stopped,
            VmState::Error,
        ] {
            assert_eq!(VmState::parse(state.as_str()), Some(state));
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.as_str().to_string())
            );
        }
        assert_eq!(TaskState::parse("POWERING_OFF"), Some(TaskState::PoweringOff));
        assert_eq!(
            serde_json::to_value(TaskState::PoweringOff).unwrap(),
            serde_json::json!("POWERING_OFF")
        );
        assert_eq!(SyncStatus::parse("bogus"), None);
    }
}
