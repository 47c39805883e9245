//! Typed records exchanged across the capability interface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lightweight reference to a domain on one connection.
///
/// Holding a `DomainRef` keeps no hypervisor resources alive; drivers resolve it
/// on every call and release the underlying handle before returning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainRef {
    pub uuid: String,
    pub name: String,
}

/// Hypervisor-reported domain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DomainState::Running | DomainState::Blocked | DomainState::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DomainState::NoState => "no-state",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::PmSuspended => "pm-suspended",
        }
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of `get_info`. Memory values are KiB, as libvirt reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub state: DomainState,
    pub max_mem_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub cpu_time_ns: u64,
}

/// Which vCPU count `get_vcpus_flags` should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuFlags {
    /// Currently active vCPUs.
    Live,
    /// vCPUs in the persistent definition.
    Config,
    /// Upper bound the domain may hotplug to.
    Maximum,
}

/// Runtime statistics for a single vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuInfo {
    pub number: u32,
    pub state: i32,
    pub cpu_time_ns: u64,
    /// Physical CPU the vCPU last ran on, -1 when offline.
    pub cpu: i32,
}

/// Memory tuning parameters. Unknown parameters land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryParams {
    pub hard_limit_kib: Option<u64>,
    pub soft_limit_kib: Option<u64>,
    pub min_guarantee_kib: Option<u64>,
    pub swap_hard_limit_kib: Option<u64>,
    #[serde(default)]
    pub extra: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub rd_bytes: u64,
    pub wr_bytes: u64,
    pub rd_reqs: u64,
    pub wr_reqs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_pkts: u64,
    pub tx_pkts: u64,
}

/// Host hardware summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub cpu_model: String,
    pub memory_kib: u64,
    pub cpus: u32,
    pub mhz: u32,
    pub numa_nodes: u32,
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

/// Cumulative host CPU times in nanoseconds, summed over all CPUs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCpuStats {
    pub kernel_ns: u64,
    pub user_ns: u64,
    pub idle_ns: u64,
    pub iowait_ns: u64,
    #[serde(default)]
    pub extra: BTreeMap<String, u64>,
}

impl NodeCpuStats {
    pub fn total_ns(&self) -> u64 {
        self.kernel_ns + self.user_ns + self.idle_ns + self.iowait_ns
    }

    pub fn busy_ns(&self) -> u64 {
        self.kernel_ns + self.user_ns
    }
}

/// Host memory in KiB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMemoryStats {
    pub total_kib: u64,
    pub free_kib: u64,
    pub buffers_kib: u64,
    pub cached_kib: u64,
    #[serde(default)]
    pub extra: BTreeMap<String, u64>,
}

impl NodeMemoryStats {
    pub fn used_kib(&self) -> u64 {
        self.total_kib
            .saturating_sub(self.free_kib)
            .saturating_sub(self.buffers_kib)
            .saturating_sub(self.cached_kib)
    }
}

/// Lifecycle notification pushed by drivers that support events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    pub domain_uuid: String,
    pub kind: DomainEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEventKind {
    Defined,
    Undefined,
    Started,
    Suspended,
    Resumed,
    Stopped,
    Crashed,
}
