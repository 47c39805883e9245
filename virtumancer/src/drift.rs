//! Drift detection between the stored hardware definition of a VM and the
//! definition currently live on its hypervisor.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};
use virtumancer_hv::domain_xml::{self, Device, DeviceKind, DomainSpec};
use virtumancer_hv::{DomainRef, DomainState};

use crate::error::{AppError, Result};
use crate::events::{Event, EventBus};
use crate::model::{DriftDetail, SyncStatus, VirtualMachine};
use crate::pool::ConnectionPool;
use crate::store::Store;

/// Outcome of comparing two definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub status: SyncStatus,
    /// Sorted by field name.
    pub details: Vec<DriftDetail>,
    pub needs_rebuild: bool,
}

/// Compare the canonical definition with the live one.
///
/// Core field changes, device removals and device attribute changes need a
/// rebuild. Devices added to a running domain are hot-applied and do not. A
/// stopped domain with any drift needs a rebuild.
pub fn compare(canonical: &DomainSpec, live: &DomainSpec, running: bool) -> DriftReport {
    let mut details = Vec::new();
    let mut needs_rebuild = false;

    let mut core = |field: &str, a: Option<String>, b: Option<String>| {
        if a != b {
            details.push(DriftDetail {
                field: field.to_string(),
                canonical: a,
                live: b,
            });
            needs_rebuild = true;
        }
    };
    core(
        "vcpu_count",
        Some(canonical.vcpu_count.to_string()),
        Some(live.vcpu_count.to_string()),
    );
    core(
        "memory_bytes",
        Some(canonical.memory_bytes.to_string()),
        Some(live.memory_bytes.to_string()),
    );
    core("cpu_model", canonical.cpu_model.clone(), live.cpu_model.clone());
    core(
        "cpu_topology",
        canonical
            .cpu_topology
            .map(|t| format!("{}s/{}c/{}t", t.sockets, t.cores, t.threads)),
        live.cpu_topology
            .map(|t| format!("{}s/{}c/{}t", t.sockets, t.cores, t.threads)),
    );
    core(
        "os_type",
        Some(canonical.os_type.clone()),
        Some(live.os_type.clone()),
    );

    let stored = index_devices(&canonical.devices);
    let current = index_devices(&live.devices);

    for (&(kind, key), device) in &stored {
        let field = format!("devices.{}[{}]", kind, key);
        match current.get(&(kind, key)) {
            None => {
                details.push(DriftDetail {
                    field,
                    canonical: Some(summarize(device)),
                    live: None,
                });
                needs_rebuild = true;
            }
            Some(live_device) if live_device.attrs != device.attrs => {
                let names: std::collections::BTreeSet<&String> = device
                    .attrs
                    .keys()
                    .chain(live_device.attrs.keys())
                    .collect();
                for name in names {
                    let a = device.attrs.get(name);
                    let b = live_device.attrs.get(name);
                    if a != b {
                        details.push(DriftDetail {
                            field: format!("{}.{}", field, name),
                            canonical: a.cloned(),
                            live: b.cloned(),
                        });
                    }
                }
                needs_rebuild = true;
            }
            Some(_) => {}
        }
    }

    for (&(kind, key), device) in &current {
        if !stored.contains_key(&(kind, key)) {
            details.push(DriftDetail {
                field: format!("devices.{}[{}]", kind, key),
                canonical: None,
                live: Some(summarize(device)),
            });
            if !running {
                needs_rebuild = true;
            }
        }
    }

    details.sort_by(|a, b| a.field.cmp(&b.field));
    let status = if details.is_empty() {
        SyncStatus::Synced
    } else {
        SyncStatus::Drifted
    };

    DriftReport {
        status,
        details,
        needs_rebuild: needs_rebuild && status == SyncStatus::Drifted,
    }
}

fn index_devices(devices: &[Device]) -> BTreeMap<(DeviceKind, &str), &Device> {
    devices.iter().map(|d| ((d.kind, d.key.as_str()), d)).collect()
}

fn summarize(device: &Device) -> String {
    device
        .attrs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A domain as read from its hypervisor.
#[derive(Debug, Clone)]
pub struct LiveDomain {
    pub dom: DomainRef,
    pub state: DomainState,
    pub xml: String,
}

impl LiveDomain {
    pub fn spec(&self) -> Result<DomainSpec> {
        Ok(domain_xml::parse(&self.xml)?)
    }
}

/// Read state and XML of a domain by UUID or name.
pub async fn fetch_live(pool: &ConnectionPool, host_id: &str, identifier: &str) -> Result<LiveDomain> {
    let identifier = identifier.to_string();
    let live = pool
        .with_connection(host_id, move |conn| {
            let dom = conn.get_domain(&identifier)?;
            let state = conn.get_state(&dom)?;
            let xml = conn.get_xml(&dom)?;
            Ok(LiveDomain { dom, state, xml })
        })
        .await?;
    Ok(live)
}

pub struct DriftDetector {
    pool: Arc<ConnectionPool>,
    store: Store,
    events: EventBus,
}

impl DriftDetector {
    pub fn new(pool: Arc<ConnectionPool>, store: Store, events: EventBus) -> Self {
        Self {
            pool,
            store,
            events,
        }
    }

    /// Compare `vm` with its live domain and persist the result. Emits
    /// `VmChanged` when the outcome differs from what was stored.
    pub async fn check(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let live = fetch_live(&self.pool, &vm.host_id, &vm.domain_uuid).await?;
        self.check_against(vm, &live).await
    }

    pub async fn check_against(
        &self,
        vm: &VirtualMachine,
        live: &LiveDomain,
    ) -> Result<VirtualMachine> {
        let live_spec = live.spec()?;
        let canonical = vm.spec(self.store.canonical_devices(&vm.uuid).await?);
        let report = compare(&canonical, &live_spec, live.state.is_active());

        let unchanged = vm.sync_status == report.status
            && vm.drift_details == report.details
            && vm.needs_rebuild == report.needs_rebuild;
        if unchanged {
            return Ok(vm.clone());
        }

        self.store
            .record_drift(&vm.uuid, report.status, &report.details, report.needs_rebuild)
            .await?;

        if report.status == SyncStatus::Drifted {
            info!(
                vm = %vm.name,
                host_id = %vm.host_id,
                fields = report.details.len(),
                needs_rebuild = report.needs_rebuild,
                "drift detected"
            );
        } else {
            debug!(vm = %vm.name, host_id = %vm.host_id, "vm in sync");
        }

        let updated = self.reload(&vm.uuid).await?;
        let _ = self.events.send(Event::VmChanged(updated.clone()));
        Ok(updated)
    }

    /// Accept the live definition as canonical.
    pub async fn sync_from_live(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let live = fetch_live(&self.pool, &vm.host_id, &vm.domain_uuid).await?;
        let spec = live.spec()?;
        self.store.replace_hardware(&vm.uuid, &spec).await?;
        info!(vm = %vm.name, host_id = %vm.host_id, "canonical definition replaced from live");

        let updated = self.reload(&vm.uuid).await?;
        let _ = self.events.send(Event::VmChanged(updated.clone()));
        Ok(updated)
    }

    async fn reload(&self, uuid: &str) -> Result<VirtualMachine> {
        self.store
            .get_vm(uuid)
            .await?
            .ok_or_else(|| AppError::VmNotFound(uuid.to_string()))
    }
}
