//! Discovery of live domains and their import into the canonical inventory.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use virtumancer_hv::{DomainInfo, DomainRef, DomainState, HvErrorKind};

use crate::drift::{DriftDetector, fetch_live};
use crate::error::{AppError, ErrorCode, Result};
use crate::events::{Event, EventBus};
use crate::locks::KeyedLocks;
use crate::model::{VirtualMachine, VmState};
use crate::pool::{ConnectionPool, HostState};
use crate::store::{NewVm, Store, StoreError, UpsertOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub live: usize,
    pub inserted: usize,
    pub refreshed: usize,
    pub removed: u64,
    /// Discovered rows whose `imported` flag was flipped on.
    pub flipped: usize,
}

impl DiscoveryReport {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.removed > 0 || self.flipped > 0
    }
}

/// Per-domain result of a bulk import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub domain_uuid: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<VirtualMachine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A domain as the hypervisor reports it now, with its inventory link.
#[derive(Debug, Clone, Serialize)]
pub struct LiveDomain {
    pub domain_uuid: String,
    pub name: String,
    pub state: DomainState,
    pub vcpus: u32,
    pub memory_kib: u64,
    pub max_mem_kib: u64,
    pub imported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_uuid: Option<String>,
}

pub struct Reconciler {
    pool: Arc<ConnectionPool>,
    store: Store,
    events: EventBus,
    drift: Arc<DriftDetector>,
    locks: Arc<KeyedLocks>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        pool: Arc<ConnectionPool>,
        store: Store,
        events: EventBus,
        drift: Arc<DriftDetector>,
        locks: Arc<KeyedLocks>,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            store,
            events,
            drift,
            locks,
            interval,
        }
    }

    async fn read_domains(&self, host_id: &str) -> Result<Vec<(DomainRef, DomainInfo)>> {
        Ok(self
            .pool
            .with_connection(host_id, |conn| {
                let mut out = Vec::new();
                for dom in conn.list_domains()? {
                    match conn.get_info(&dom) {
                        Ok(info) => out.push((dom, info)),
                        // Undefined between list and lookup.
                        Err(e) if e.kind == HvErrorKind::NotFound => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(out)
            })
            .await?)
    }

    /// Every live domain on `host_id`, imported or not.
    pub async fn live_domains(&self, host_id: &str) -> Result<Vec<LiveDomain>> {
        let mut out = Vec::new();
        for (dom, info) in self.read_domains(host_id).await? {
            let vm_uuid = self.canonical_for(host_id, &dom).await?.map(|vm| vm.uuid);
            out.push(LiveDomain {
                domain_uuid: dom.uuid,
                name: dom.name,
                state: info.state,
                vcpus: info.vcpus,
                memory_kib: info.memory_kib,
                max_mem_kib: info.max_mem_kib,
                imported: vm_uuid.is_some(),
                vm_uuid,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// One discovery pass over the live domains of `host_id`.
    pub async fn discover(&self, host_id: &str) -> Result<DiscoveryReport> {
        let domains = self.read_domains(host_id).await?;

        let now = Utc::now();
        let mut report = DiscoveryReport {
            live: domains.len(),
            ..DiscoveryReport::default()
        };
        let mut live_uuids = Vec::with_capacity(domains.len());

        for (dom, info) in domains {
            live_uuids.push(dom.uuid.clone());

            if let Some(vm) = self.canonical_for(host_id, &dom).await? {
                if self.store.mark_imported(host_id, &dom.uuid).await? {
                    report.flipped += 1;
                }
                if let Err(e) = self.refresh_imported(vm, info.state).await {
                    debug!(host_id = %host_id, domain = %dom.name, error = %e, "refresh of imported vm failed");
                }
                continue;
            }

            match self
                .store
                .upsert_discovered(host_id, &dom.uuid, &dom.name, &info_blob(&info), now)
                .await?
            {
                UpsertOutcome::Inserted => report.inserted += 1,
                UpsertOutcome::Refreshed => report.refreshed += 1,
                UpsertOutcome::Unchanged => {}
            }
        }

        report.removed = self
            .store
            .delete_discovered_not_in(host_id, &live_uuids)
            .await?;

        if report.changed() {
            info!(
                host_id = %host_id,
                live = report.live,
                inserted = report.inserted,
                removed = report.removed,
                flipped = report.flipped,
                "discovery changed"
            );
            let _ = self.events.send(Event::DiscoveryChanged {
                host_id: host_id.to_string(),
            });
        } else {
            debug!(host_id = %host_id, live = report.live, "discovery unchanged");
        }
        Ok(report)
    }

    async fn canonical_for(&self, host_id: &str, dom: &DomainRef) -> Result<Option<VirtualMachine>> {
        if let Some(vm) = self.store.get_vm_by_domain_uuid(&dom.uuid).await? {
            return Ok(Some(vm));
        }
        Ok(self.store.get_vm_by_name(host_id, &dom.name).await?)
    }

    /// Follow the live state of an imported VM while no task owns it, then
    /// check it for drift.
    async fn refresh_imported(&self, vm: VirtualMachine, live: DomainState) -> Result<()> {
        let vm = {
            let _guard = self.locks.lock(&vm.uuid).await;
            let Some(mut vm) = self.store.get_vm(&vm.uuid).await? else {
                return Ok(());
            };
            if vm.task_state.is_some() {
                return Ok(());
            }

            let state = VmState::from_live(live, vm.state);
            if state != vm.state {
                self.store.update_stable_state(&vm.uuid, state).await?;
                info!(vm = %vm.name, host_id = %vm.host_id, from = %vm.state, to = %state, "vm state changed outside of a task");
                vm = self
                    .store
                    .get_vm(&vm.uuid)
                    .await?
                    .ok_or_else(|| AppError::VmNotFound(vm.name.clone()))?;
                let _ = self.events.send(Event::VmChanged(vm.clone()));
            }
            vm
        };

        self.drift.check(&vm).await?;
        Ok(())
    }

    /// Import one live domain, looked up by UUID or name.
    pub async fn import_vm(&self, host_id: &str, identifier: &str) -> Result<VirtualMachine> {
        let live = fetch_live(&self.pool, host_id, identifier).await?;
        let spec = live.spec()?;

        if self.store.get_vm_by_domain_uuid(&spec.uuid).await?.is_some() {
            return Err(StoreError::Conflict(format!(
                "domain {} is already imported",
                live.dom.name
            ))
            .into());
        }

        let vm = self
            .store
            .create_canonical_vm(NewVm {
                host_id,
                name: &live.dom.name,
                state: VmState::from_live(live.state, VmState::Stopped),
                spec: &spec,
            })
            .await?;

        info!(vm = %vm.name, host_id = %host_id, uuid = %vm.uuid, "vm imported");
        let _ = self.events.send(Event::VmChanged(vm.clone()));
        let _ = self.events.send(Event::DiscoveryChanged {
            host_id: host_id.to_string(),
        });
        Ok(vm)
    }

    /// Import every discovered, not yet imported domain of a host.
    pub async fn import_all(&self, host_id: &str) -> Result<Vec<ImportOutcome>> {
        self.discover(host_id).await?;
        let pending: Vec<String> = self
            .store
            .list_discovered(host_id)
            .await?
            .into_iter()
            .filter(|d| !d.imported)
            .map(|d| d.domain_uuid)
            .collect();
        Ok(self.import_selected(host_id, &pending).await)
    }

    /// Import each domain on its own; earlier successes survive later failures.
    pub async fn import_selected(&self, host_id: &str, domain_uuids: &[String]) -> Vec<ImportOutcome> {
        let mut outcomes = Vec::with_capacity(domain_uuids.len());
        for domain_uuid in domain_uuids {
            let outcome = match self.import_vm(host_id, domain_uuid).await {
                Ok(vm) => ImportOutcome {
                    domain_uuid: domain_uuid.clone(),
                    ok: true,
                    vm: Some(vm),
                    code: None,
                    error: None,
                },
                Err(e) => {
                    let (code, _, message) = e.classify();
                    warn!(host_id = %host_id, domain = %domain_uuid, code = %code, "import failed");
                    ImportOutcome {
                        domain_uuid: domain_uuid.clone(),
                        ok: false,
                        vm: None,
                        code: Some(code),
                        error: Some(message),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn discover_logged(&self, host_id: &str) {
        if let Err(e) = self.discover(host_id).await {
            debug!(host_id = %host_id, error = %e, "discovery pass failed");
        }
    }

    /// Periodic discovery over connected hosts, plus an immediate pass when a
    /// host connects or reports domain events.
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) {
        let this = Arc::clone(self);
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for host_id in this.pool.connected_hosts() {
                            this.discover_logged(&host_id).await;
                        }
                    }
                    event = rx.recv() => match event {
                        Ok(Event::HostChanged { host_id, state: HostState::Connected, .. })
                        | Ok(Event::DomainsChanged { host_id }) => {
                            this.discover_logged(&host_id).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "reconciler lagged behind events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("reconciler stopped");
        });
    }
}

fn info_blob(info: &DomainInfo) -> serde_json::Value {
    json!({
        "state": info.state,
        "vcpus": info.vcpus,
        "max_mem_kib": info.max_mem_kib,
        "memory_kib": info.memory_kib,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BackoffPolicy;
    use crate::store::test_support::temp_store;
    use virtumancer_hv::TestDriver;
    use virtumancer_hv::test_driver::{DEFAULT_DOMAIN_UUID, DEFAULT_URI, default_domain_spec};

    struct Fixture {
        reconciler: Reconciler,
        store: Store,
        driver: Arc<TestDriver>,
        events: EventBus,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let (store, dir) = temp_store().await;
        let driver = Arc::new(TestDriver::new());
        let events = crate::events::bus();
        let pool = ConnectionPool::new(
            driver.clone(),
            store.clone(),
            events.clone(),
            BackoffPolicy::default(),
            CancellationToken::new(),
        );
        pool.add_host("h1", DEFAULT_URI).await.unwrap();
        let drift = Arc::new(DriftDetector::new(
            Arc::clone(&pool),
            store.clone(),
            events.clone(),
        ));
        Fixture {
            reconciler: Reconciler::new(
                pool,
                store.clone(),
                events.clone(),
                drift,
                Arc::new(KeyedLocks::new()),
                Duration::from_secs(15),
            ),
            store,
            driver,
            events,
            _dir: dir,
        }
    }

    fn second_domain() -> virtumancer_hv::DomainSpec {
        let mut spec = default_domain_spec();
        spec.name = "db".to_string();
        spec.uuid = "11111111-2222-3333-4444-555555555555".to_string();
        spec.devices.retain(|d| d.kind != virtumancer_hv::DeviceKind::Interface);
        spec.devices[0]
            .attrs
            .insert("source@file".to_string(), "/guest/db.img".to_string());
        spec
    }

    #[tokio::test]
    async fn test_discover_upserts_and_emits_once() {
        let f = fixture().await;
        let mut rx = f.events.subscribe();

        let report = f.reconciler.discover("h1").await.unwrap();
        assert_eq!(report.live, 1);
        assert_eq!(report.inserted, 1);
        assert!(matches!(rx.try_recv(), Ok(Event::DiscoveryChanged { .. })));

        let rows = f.store.list_discovered("h1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "test");
        assert_eq!(rows[0].info["state"], "running");
        assert!(!rows[0].imported);

        let report = f.reconciler.discover("h1").await.unwrap();
        assert!(!report.changed());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_vanished_domains_are_pruned() {
        let f = fixture().await;
        let host = f.driver.host(DEFAULT_URI).unwrap();
        host.add_domain(second_domain(), DomainState::Shutoff);

        let report = f.reconciler.discover("h1").await.unwrap();
        assert_eq!(report.inserted, 2);

        host.remove_domain("db");
        let report = f.reconciler.discover("h1").await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(f.store.list_discovered("h1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_import_then_conflict() {
        let f = fixture().await;
        f.reconciler.discover("h1").await.unwrap();

        let vm = f.reconciler.import_vm("h1", "test").await.unwrap();
        assert_eq!(vm.domain_uuid, DEFAULT_DOMAIN_UUID);
        assert_eq!(vm.state, VmState::Active);
        assert_eq!(vm.vcpu_count, 2);
        assert!(f.store.get_discovered("h1", DEFAULT_DOMAIN_UUID).await.unwrap().unwrap().imported);
        assert_eq!(f.store.list_attachments(&vm.uuid).await.unwrap().len(), 3);

        let err = f.reconciler.import_vm("h1", "test").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let err = f.reconciler.import_vm("h1", "missing").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::VmNotFound);

        // Imported rows are neither re-inserted nor pruned.
        let report = f.reconciler.discover("h1").await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.removed, 0);
    }

    #[tokio::test]
    async fn test_discovery_follows_state_of_imported_vm() {
        let f = fixture().await;
        let vm = f.reconciler.import_vm("h1", "test").await.unwrap();
        let host = f.driver.host(DEFAULT_URI).unwrap();

        host.set_domain_state("test", DomainState::Shutoff);
        f.reconciler.discover("h1").await.unwrap();
        let vm = f.store.get_vm(&vm.uuid).await.unwrap().unwrap();
        assert_eq!(vm.state, VmState::Stopped);

        host.modify_domain("test", |s| s.memory_bytes *= 2);
        f.reconciler.discover("h1").await.unwrap();
        let vm = f.store.get_vm(&vm.uuid).await.unwrap().unwrap();
        assert_eq!(vm.sync_status, crate::model::SyncStatus::Drifted);
        assert!(vm.needs_rebuild);
    }

    #[tokio::test]
    async fn test_state_refresh_respects_vm_lock_and_task() {
        let f = fixture().await;
        let vm = f.reconciler.import_vm("h1", "test").await.unwrap();
        let host = f.driver.host(DEFAULT_URI).unwrap();
        host.set_domain_state("test", DomainState::Shutoff);

        // A lifecycle task holds the lock: discovery waits for it.
        let guard = f.reconciler.locks.lock(&vm.uuid).await;
        let pass = tokio::time::timeout(Duration::from_millis(100), f.reconciler.discover("h1")).await;
        assert!(pass.is_err());
        drop(guard);

        // A recorded task owns the state; discovery leaves it alone.
        f.store
            .update_task_state(&vm.uuid, Some(crate::model::TaskState::Starting))
            .await
            .unwrap();
        f.reconciler.discover("h1").await.unwrap();
        let stored = f.store.get_vm(&vm.uuid).await.unwrap().unwrap();
        assert_eq!(stored.state, VmState::Active);

        f.store.update_task_state(&vm.uuid, None).await.unwrap();
        f.reconciler.discover("h1").await.unwrap();
        let stored = f.store.get_vm(&vm.uuid).await.unwrap().unwrap();
        assert_eq!(stored.state, VmState::Stopped);
    }

    #[tokio::test]
    async fn test_bulk_import_keeps_partial_success() {
        let f = fixture().await;
        let host = f.driver.host(DEFAULT_URI).unwrap();
        host.add_domain(second_domain(), DomainState::Shutoff);

        let outcomes = f
            .reconciler
            .import_selected(
                "h1",
                &[
                    "11111111-2222-3333-4444-555555555555".to_string(),
                    "99999999-0000-0000-0000-000000000000".to_string(),
                ],
            )
            .await;
        assert!(outcomes[0].ok);
        assert_eq!(outcomes[0].vm.as_ref().unwrap().state, VmState::Stopped);
        assert!(!outcomes[1].ok);
        assert_eq!(outcomes[1].code, Some(ErrorCode::VmNotFound));

        let outcomes = f.reconciler.import_all("h1").await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].ok);
        assert_eq!(f.store.list_vms_by_host("h1").await.unwrap().len(), 2);
    }
}
