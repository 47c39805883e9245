//! Live telemetry: one sampler per subscribed subject, publishing derived
//! rates to the hub.

mod rates;
mod sampler;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use virtumancer_hv::domain_xml;
use virtumancer_hv::{
    BlockStats, DomainState, HvError, HvErrorKind, IfaceStats, NodeCpuStats, NodeInfo,
    NodeMemoryStats,
};

use crate::error::Result;
use crate::hub::{HubHandle, Subject, SubjectListener};
use crate::pool::ConnectionPool;
use crate::settings::{DiskUnit, DisplayMode, NetUnit, SettingsService};
use crate::store::Store;

pub use rates::{Ema, display_percent, guest_percent, host_percent, raw_cpu_percent};

/// Raw cumulative counters of one domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmCounters {
    pub host_id: String,
    pub domain_uuid: String,
    pub name: String,
    pub state: DomainState,
    pub vcpus: u32,
    pub host_cpus: u32,
    pub memory_kib: u64,
    pub max_mem_kib: u64,
    pub cpu_time_ns: u64,
    pub disks: BTreeMap<String, BlockStats>,
    pub interfaces: BTreeMap<String, IfaceStats>,
}

/// Raw node readings of one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostCounters {
    pub host_id: String,
    pub node: NodeInfo,
    pub cpu: NodeCpuStats,
    pub memory: NodeMemoryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRate {
    pub device: String,
    pub read: f64,
    pub write: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetRate {
    pub device: String,
    pub rx: f64,
    pub tx: f64,
}

/// `vm_stats` payload. Disk rates are in `disk_unit` per second, network
/// rates in `net_unit` (bits) per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmStats {
    pub vm_uuid: String,
    pub host_id: String,
    pub domain_uuid: String,
    pub name: String,
    pub state: DomainState,
    pub vcpus: u32,
    pub host_cpus: u32,
    pub cpu_percent: f64,
    pub cpu_display_percent: f64,
    pub cpu_raw_percent: f64,
    pub display_mode: DisplayMode,
    pub memory_kib: u64,
    pub max_mem_kib: u64,
    pub disk_read: f64,
    pub disk_write: f64,
    pub disk_unit: DiskUnit,
    pub net_rx: f64,
    pub net_tx: f64,
    pub net_unit: NetUnit,
    pub disks: Vec<DiskRate>,
    pub interfaces: Vec<NetRate>,
    pub timestamp: DateTime<Utc>,
}

/// `host_stats` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStats {
    pub host_id: String,
    pub cpu_model: String,
    pub cpus: u32,
    pub cpu_percent: f64,
    pub memory_total_kib: u64,
    pub memory_used_kib: u64,
    pub memory_percent: f64,
    pub timestamp: DateTime<Utc>,
}

/// Read a domain's counters. Block and interface stats are only read while
/// the domain is active; devices the hypervisor refuses are skipped.
pub async fn read_vm(pool: &ConnectionPool, host_id: &str, identifier: &str) -> Result<VmCounters> {
    let identifier = identifier.to_string();
    let host = host_id.to_string();
    let counters = pool
        .with_connection(host_id, move |conn| {
            let dom = conn.get_domain(&identifier)?;
            let info = conn.get_info(&dom)?;
            let host_cpus = conn.node_info()?.cpus;

            let mut disks = BTreeMap::new();
            let mut interfaces = BTreeMap::new();
            if info.state.is_active() {
                let xml = conn.get_xml(&dom)?;
                let targets = domain_xml::stat_targets(&xml)
                    .map_err(|e| HvError::new(HvErrorKind::Internal, e.to_string()))?;
                for device in targets.disks {
                    match conn.get_block_stats(&dom, &device) {
                        Ok(stats) => {
                            disks.insert(device, stats);
                        }
                        Err(e) if e.is_connection_failure() => return Err(e),
                        Err(e) => debug!(device = %device, error = %e, "block stats unavailable"),
                    }
                }
                for device in targets.interfaces {
                    match conn.get_iface_stats(&dom, &device) {
                        Ok(stats) => {
                            interfaces.insert(device, stats);
                        }
                        Err(e) if e.is_connection_failure() => return Err(e),
                        Err(e) => {
                            debug!(device = %device, error = %e, "interface stats unavailable")
                        }
                    }
                }
            }

            Ok(VmCounters {
                host_id: host,
                domain_uuid: dom.uuid,
                name: dom.name,
                state: info.state,
                vcpus: info.vcpus,
                host_cpus,
                memory_kib: info.memory_kib,
                max_mem_kib: info.max_mem_kib,
                cpu_time_ns: info.cpu_time_ns,
                disks,
                interfaces,
            })
        })
        .await?;
    Ok(counters)
}

pub async fn read_host(pool: &ConnectionPool, host_id: &str) -> Result<HostCounters> {
    let host = host_id.to_string();
    let counters = pool
        .with_connection(host_id, move |conn| {
            Ok(HostCounters {
                host_id: host,
                node: conn.node_info()?,
                cpu: conn.node_cpu_stats()?,
                memory: conn.node_memory_stats()?,
            })
        })
        .await?;
    Ok(counters)
}

pub(crate) struct SamplerContext {
    pool: Arc<ConnectionPool>,
    store: Store,
    settings: Arc<SettingsService>,
    hub: HubHandle,
    failure_limit: u32,
}

struct Slot {
    generation: u64,
    token: CancellationToken,
}

/// Owns the running samplers, keyed by subject.
pub struct Telemetry {
    ctx: Arc<SamplerContext>,
    samplers: Mutex<HashMap<Subject, Slot>>,
    generation: AtomicU64,
    token: CancellationToken,
    me: Weak<Telemetry>,
}

impl Telemetry {
    pub fn new(
        pool: Arc<ConnectionPool>,
        store: Store,
        settings: Arc<SettingsService>,
        hub: HubHandle,
        failure_limit: u32,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            ctx: Arc::new(SamplerContext {
                pool,
                store,
                settings,
                hub,
                failure_limit: failure_limit.max(1),
            }),
            samplers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            token,
            me: me.clone(),
        })
    }

    /// Start a sampler for `subject` unless one is running.
    pub fn ensure(&self, subject: &Subject) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let mut samplers = self.samplers.lock().unwrap_or_else(PoisonError::into_inner);
        if samplers.contains_key(subject) || self.token.is_cancelled() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.token.child_token();
        samplers.insert(
            subject.clone(),
            Slot {
                generation,
                token: token.clone(),
            },
        );
        info!(subject = %subject, "sampler starting");

        let subject = subject.clone();
        tokio::spawn(async move {
            let gave_up = sampler::run(&me.ctx, &subject, token).await;
            if gave_up {
                me.finished(&subject, generation);
            }
        });
    }

    pub fn stop(&self, subject: &Subject) {
        let slot = self
            .samplers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject);
        if let Some(slot) = slot {
            slot.token.cancel();
            info!(subject = %subject, "sampler stopping");
        }
    }

    /// Subjects with a running sampler.
    pub fn active(&self) -> Vec<Subject> {
        let mut subjects: Vec<_> = self
            .samplers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        subjects.sort();
        subjects
    }

    fn finished(&self, subject: &Subject, generation: u64) {
        let mut samplers = self.samplers.lock().unwrap_or_else(PoisonError::into_inner);
        if samplers
            .get(subject)
            .is_some_and(|slot| slot.generation == generation)
        {
            samplers.remove(subject);
        }
    }
}

impl SubjectListener for Telemetry {
    fn subscribed(&self, subject: &Subject) {
        self.ensure(subject);
    }

    fn last_unsubscribed(&self, subject: &Subject) {
        self.stop(subject);
    }
}
