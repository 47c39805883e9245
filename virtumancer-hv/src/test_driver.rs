//! In-process `test://` driver.
//!
//! Modelled on libvirt's test driver: `test:///default` comes up with a single
//! running domain called `test`, `test:///empty` with none. Unlike libvirt, state
//! survives reconnects because hosts live in the driver, which lets the pool's
//! reconnect logic be exercised end to end. Counters advance with wall time while
//! a domain runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::debug;

use crate::domain_xml::{self, Device, DeviceKind, DomainSpec};
use crate::driver::{Connection, Driver};
use crate::error::{HvError, HvErrorKind, Result};
use crate::types::{
    BlockStats, DomainEvent, DomainEventKind, DomainInfo, DomainRef, DomainState, IfaceStats,
    MemoryParams, NodeCpuStats, NodeInfo, NodeMemoryStats, VcpuFlags, VcpuInfo,
};

pub const DEFAULT_URI: &str = "test:///default";
pub const EMPTY_URI: &str = "test:///empty";
pub const DEFAULT_DOMAIN_UUID: &str = "6695eb01-f6a4-8304-79aa-97f2502e193f";

/// Share of each vCPU a running simulated domain burns.
const CPU_LOAD: f64 = 0.25;
const DISK_READ_BPS: f64 = 1_048_576.0;
const DISK_WRITE_BPS: f64 = 524_288.0;
const NET_RX_BPS: f64 = 131_072.0;
const NET_TX_BPS: f64 = 65_536.0;

/// Driver for the `test` scheme.
#[derive(Default)]
pub struct TestDriver {
    hosts: Mutex<HashMap<String, Arc<TestHost>>>,
}

impl TestDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The simulated host behind `uri`, created on first use.
    pub fn host(&self, uri: &str) -> Result<Arc<TestHost>> {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(host) = hosts.get(uri) {
            return Ok(Arc::clone(host));
        }

        let domains = match uri {
            DEFAULT_URI => vec![SimDomain::new(default_domain_spec(), DomainState::Running)],
            EMPTY_URI => Vec::new(),
            _ => {
                return Err(HvError::new(
                    HvErrorKind::Unreachable,
                    format!("unable to connect to '{}': no such test host", uri),
                ));
            }
        };

        let host = Arc::new(TestHost::new(uri, domains));
        hosts.insert(uri.to_string(), Arc::clone(&host));
        Ok(host)
    }
}

impl Driver for TestDriver {
    fn open(&self, uri: &str) -> Result<Box<dyn Connection>> {
        let host = self.host(uri)?;
        let generation = {
            let mut sim = host.sim();
            if !sim.reachable {
                return Err(HvError::new(
                    HvErrorKind::Unreachable,
                    format!("unable to connect to '{}'", uri),
                ));
            }
            if sim.fail_next_opens > 0 {
                sim.fail_next_opens -= 1;
                return Err(HvError::new(
                    HvErrorKind::Unreachable,
                    format!("unable to connect to '{}': connection refused", uri),
                ));
            }
            sim.generation
        };

        debug!(uri = %uri, "test driver connection opened");
        Ok(Box::new(TestConnection {
            host,
            generation,
            closed: false,
        }))
    }
}

/// One simulated hypervisor.
pub struct TestHost {
    uri: String,
    state: Mutex<HostSim>,
    events: broadcast::Sender<DomainEvent>,
}

struct HostSim {
    domains: Vec<SimDomain>,
    node: NodeInfo,
    booted: Instant,
    reachable: bool,
    fail_next_opens: u32,
    /// Bumped to invalidate every open connection.
    generation: u64,
}

struct SimDomain {
    spec: DomainSpec,
    state: DomainState,
    ignore_shutdown: bool,
    cpu_time_ns: f64,
    block: [f64; 4],
    iface: [f64; 4],
    last_advance: Instant,
}

impl SimDomain {
    fn new(spec: DomainSpec, state: DomainState) -> Self {
        Self {
            spec,
            state,
            ignore_shutdown: false,
            cpu_time_ns: 0.0,
            block: [0.0; 4],
            iface: [0.0; 4],
            last_advance: Instant::now(),
        }
    }

    fn dom_ref(&self) -> DomainRef {
        DomainRef {
            uuid: self.spec.uuid.clone(),
            name: self.spec.name.clone(),
        }
    }

    fn matches(&self, identifier: &str) -> bool {
        self.spec.uuid.eq_ignore_ascii_case(identifier) || self.spec.name == identifier
    }

    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_advance).as_secs_f64();
        self.last_advance = now;
        if self.state != DomainState::Running {
            return;
        }
        self.cpu_time_ns += dt * 1e9 * self.spec.vcpu_count as f64 * CPU_LOAD;
        self.block[0] += dt * DISK_READ_BPS;
        self.block[1] += dt * DISK_WRITE_BPS;
        self.block[2] += dt * DISK_READ_BPS / 4096.0;
        self.block[3] += dt * DISK_WRITE_BPS / 4096.0;
        self.iface[0] += dt * NET_RX_BPS;
        self.iface[1] += dt * NET_TX_BPS;
        self.iface[2] += dt * NET_RX_BPS / 1024.0;
        self.iface[3] += dt * NET_TX_BPS / 1024.0;
    }

    fn require_active(&self) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(HvError::invalid(format!(
                "domain '{}' is not running",
                self.spec.name
            )))
        }
    }
}

impl TestHost {
    fn new(uri: &str, domains: Vec<SimDomain>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            uri: uri.to_string(),
            state: Mutex::new(HostSim {
                domains,
                node: NodeInfo {
                    cpu_model: "i686".to_string(),
                    memory_kib: 3_145_728,
                    cpus: 16,
                    mhz: 1400,
                    numa_nodes: 2,
                    sockets: 2,
                    cores: 2,
                    threads: 2,
                },
                booted: Instant::now(),
                reachable: true,
                fail_next_opens: 0,
                generation: 0,
            }),
            events,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn sim(&self) -> MutexGuard<'_, HostSim> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, domain_uuid: &str, kind: DomainEventKind) {
        let _ = self.events.send(DomainEvent {
            domain_uuid: domain_uuid.to_string(),
            kind,
        });
    }

    /// Add a domain in the given state.
    pub fn add_domain(&self, spec: DomainSpec, state: DomainState) {
        let uuid = spec.uuid.clone();
        self.sim().domains.push(SimDomain::new(spec, state));
        self.emit(&uuid, DomainEventKind::Defined);
    }

    pub fn remove_domain(&self, identifier: &str) -> bool {
        let removed = {
            let mut sim = self.sim();
            let before = sim.domains.len();
            sim.domains.retain(|d| !d.matches(identifier));
            before != sim.domains.len()
        };
        if removed {
            self.emit(identifier, DomainEventKind::Undefined);
        }
        removed
    }

    pub fn domain_state(&self, identifier: &str) -> Option<DomainState> {
        self.sim()
            .domains
            .iter()
            .find(|d| d.matches(identifier))
            .map(|d| d.state)
    }

    /// Force a domain into `state` behind the manager's back.
    pub fn set_domain_state(&self, identifier: &str, state: DomainState) {
        let mut sim = self.sim();
        if let Some(d) = sim.domains.iter_mut().find(|d| d.matches(identifier)) {
            d.advance();
            d.state = state;
        }
    }

    /// Make graceful shutdown requests no-ops, like a guest without ACPI support.
    pub fn set_ignore_shutdown(&self, identifier: &str, ignore: bool) {
        let mut sim = self.sim();
        if let Some(d) = sim.domains.iter_mut().find(|d| d.matches(identifier)) {
            d.ignore_shutdown = ignore;
        }
    }

    pub fn domain_spec(&self, identifier: &str) -> Option<DomainSpec> {
        self.sim()
            .domains
            .iter()
            .find(|d| d.matches(identifier))
            .map(|d| d.spec.clone())
    }

    /// Edit a domain definition in place.
    pub fn modify_domain(&self, identifier: &str, edit: impl FnOnce(&mut DomainSpec)) {
        let mut sim = self.sim();
        if let Some(d) = sim.domains.iter_mut().find(|d| d.matches(identifier)) {
            edit(&mut d.spec);
        }
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_opens(&self, n: u32) {
        self.sim().fail_next_opens = n;
    }

    /// While unreachable, opens fail and open connections report loss.
    pub fn set_reachable(&self, reachable: bool) {
        let mut sim = self.sim();
        sim.reachable = reachable;
        if !reachable {
            sim.generation += 1;
        }
    }

    /// Break every open connection.
    pub fn drop_connections(&self) {
        self.sim().generation += 1;
    }
}

/// Default domain of `test:///default`.
pub fn default_domain_spec() -> DomainSpec {
    let disk = Device {
        kind: DeviceKind::Disk,
        key: "vda".to_string(),
        attrs: BTreeMap::from([
            ("source@file".to_string(), "/guest/diskimage1".to_string()),
            ("target@bus".to_string(), "virtio".to_string()),
            ("target@dev".to_string(), "vda".to_string()),
        ]),
    };
    let nic = Device {
        kind: DeviceKind::Interface,
        key: "aa:bb:cc:dd:ee:ff".to_string(),
        attrs: BTreeMap::from([
            ("@type".to_string(), "network".to_string()),
            ("mac@address".to_string(), "aa:bb:cc:dd:ee:ff".to_string()),
            ("source@network".to_string(), "default".to_string()),
        ]),
    };
    let balloon = Device {
        kind: DeviceKind::Memballoon,
        key: "0".to_string(),
        attrs: BTreeMap::from([("@model".to_string(), "virtio".to_string())]),
    };

    DomainSpec {
        name: "test".to_string(),
        uuid: DEFAULT_DOMAIN_UUID.to_string(),
        vcpu_count: 2,
        memory_bytes: 8_388_608 * 1024,
        cpu_model: None,
        cpu_topology: None,
        os_type: "hvm".to_string(),
        devices: vec![disk, nic, balloon],
    }
}

pub struct TestConnection {
    host: Arc<TestHost>,
    generation: u64,
    closed: bool,
}

impl TestConnection {
    fn live(&self) -> Result<MutexGuard<'_, HostSim>> {
        if self.closed {
            return Err(HvError::new(
                HvErrorKind::ConnectionLost,
                "connection is closed",
            ));
        }
        let sim = self.host.sim();
        if sim.generation != self.generation {
            return Err(HvError::new(
                HvErrorKind::ConnectionLost,
                format!("connection to '{}' was lost", self.host.uri),
            ));
        }
        Ok(sim)
    }

    fn with_domain<T>(
        &self,
        dom: &DomainRef,
        f: impl FnOnce(&mut SimDomain) -> Result<T>,
    ) -> Result<T> {
        let mut sim = self.live()?;
        let domain = sim
            .domains
            .iter_mut()
            .find(|d| d.matches(&dom.uuid))
            .ok_or_else(|| HvError::not_found(format!("domain '{}' not found", dom.name)))?;
        domain.advance();
        f(domain)
    }

    fn transition(
        &self,
        dom: &DomainRef,
        event: Option<DomainEventKind>,
        f: impl FnOnce(&mut SimDomain) -> Result<bool>,
    ) -> Result<()> {
        let changed = self.with_domain(dom, f)?;
        if changed && let Some(kind) = event {
            self.host.emit(&dom.uuid, kind);
        }
        Ok(())
    }
}

impl Connection for TestConnection {
    fn uri(&self) -> &str {
        &self.host.uri
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn list_domains(&self) -> Result<Vec<DomainRef>> {
        Ok(self.live()?.domains.iter().map(SimDomain::dom_ref).collect())
    }

    fn get_domain(&self, identifier: &str) -> Result<DomainRef> {
        self.live()?
            .domains
            .iter()
            .find(|d| d.matches(identifier))
            .map(SimDomain::dom_ref)
            .ok_or_else(|| HvError::not_found(format!("domain '{}' not found", identifier)))
    }

    fn get_state(&self, dom: &DomainRef) -> Result<DomainState> {
        self.with_domain(dom, |d| Ok(d.state))
    }

    fn get_xml(&self, dom: &DomainRef) -> Result<String> {
        self.with_domain(dom, |d| Ok(domain_xml::render(&d.spec, "test")))
    }

    fn get_info(&self, dom: &DomainRef) -> Result<DomainInfo> {
        self.with_domain(dom, |d| {
            let max_mem_kib = d.spec.memory_bytes / 1024;
            Ok(DomainInfo {
                state: d.state,
                max_mem_kib,
                memory_kib: max_mem_kib,
                vcpus: d.spec.vcpu_count,
                cpu_time_ns: d.cpu_time_ns as u64,
            })
        })
    }

    fn get_max_vcpus(&self, dom: &DomainRef) -> Result<u32> {
        self.with_domain(dom, |d| Ok(d.spec.vcpu_count))
    }

    fn get_vcpus_flags(&self, dom: &DomainRef, flags: VcpuFlags) -> Result<u32> {
        self.with_domain(dom, |d| match flags {
            VcpuFlags::Live => {
                d.require_active()?;
                Ok(d.spec.vcpu_count)
            }
            VcpuFlags::Config | VcpuFlags::Maximum => Ok(d.spec.vcpu_count),
        })
    }

    fn get_vcpus(&self, dom: &DomainRef) -> Result<Vec<VcpuInfo>> {
        self.with_domain(dom, |d| {
            d.require_active()?;
            let n = d.spec.vcpu_count.max(1);
            Ok((0..n)
                .map(|i| VcpuInfo {
                    number: i,
                    state: 1,
                    cpu_time_ns: (d.cpu_time_ns / n as f64) as u64,
                    cpu: i as i32,
                })
                .collect())
        })
    }

    fn get_memory_params(&self, dom: &DomainRef) -> Result<MemoryParams> {
        self.with_domain(dom, |d| {
            Ok(MemoryParams {
                hard_limit_kib: None,
                soft_limit_kib: None,
                min_guarantee_kib: None,
                swap_hard_limit_kib: None,
                extra: BTreeMap::from([("actual_kib".to_string(), d.spec.memory_bytes / 1024)]),
            })
        })
    }

    fn get_block_stats(&self, dom: &DomainRef, device: &str) -> Result<BlockStats> {
        self.with_domain(dom, |d| {
            d.require_active()?;
            let disks = d.spec.devices_of(DeviceKind::Disk).count().max(1) as f64;
            if !d.spec.devices_of(DeviceKind::Disk).any(|disk| disk.key == device) {
                return Err(HvError::invalid(format!("invalid path: {}", device)));
            }
            Ok(BlockStats {
                rd_bytes: (d.block[0] / disks) as u64,
                wr_bytes: (d.block[1] / disks) as u64,
                rd_reqs: (d.block[2] / disks) as u64,
                wr_reqs: (d.block[3] / disks) as u64,
            })
        })
    }

    fn get_iface_stats(&self, dom: &DomainRef, device: &str) -> Result<IfaceStats> {
        self.with_domain(dom, |d| {
            d.require_active()?;
            let nics = d.spec.devices_of(DeviceKind::Interface).count().max(1) as f64;
            let known = device.starts_with("vnet")
                || d.spec
                    .devices_of(DeviceKind::Interface)
                    .any(|nic| nic.key.eq_ignore_ascii_case(device));
            if !known {
                return Err(HvError::invalid(format!("invalid interface: {}", device)));
            }
            Ok(IfaceStats {
                rx_bytes: (d.iface[0] / nics) as u64,
                tx_bytes: (d.iface[1] / nics) as u64,
                rx_pkts: (d.iface[2] / nics) as u64,
                tx_pkts: (d.iface[3] / nics) as u64,
            })
        })
    }

    fn start(&self, dom: &DomainRef) -> Result<()> {
        self.transition(dom, Some(DomainEventKind::Started), |d| {
            if d.state.is_active() {
                return Err(HvError::invalid("domain is already running"));
            }
            d.state = DomainState::Running;
            Ok(true)
        })
    }

    fn shutdown(&self, dom: &DomainRef) -> Result<()> {
        self.transition(dom, Some(DomainEventKind::Stopped), |d| {
            d.require_active()?;
            if d.ignore_shutdown {
                return Ok(false);
            }
            d.state = DomainState::Shutoff;
            Ok(true)
        })
    }

    fn reboot(&self, dom: &DomainRef) -> Result<()> {
        self.transition(dom, None, |d| {
            if d.state != DomainState::Running {
                return Err(HvError::invalid("domain is not running"));
            }
            Ok(false)
        })
    }

    fn destroy(&self, dom: &DomainRef) -> Result<()> {
        self.transition(dom, Some(DomainEventKind::Stopped), |d| {
            d.require_active()?;
            d.state = DomainState::Shutoff;
            Ok(true)
        })
    }

    fn reset(&self, dom: &DomainRef) -> Result<()> {
        self.transition(dom, Some(DomainEventKind::Resumed), |d| {
            d.require_active()?;
            let was_paused = d.state == DomainState::Paused;
            d.state = DomainState::Running;
            Ok(was_paused)
        })
    }

    fn suspend(&self, dom: &DomainRef) -> Result<()> {
        self.transition(dom, Some(DomainEventKind::Suspended), |d| {
            if d.state != DomainState::Running {
                return Err(HvError::invalid("domain is not running"));
            }
            d.state = DomainState::Paused;
            Ok(true)
        })
    }

    fn resume(&self, dom: &DomainRef) -> Result<()> {
        self.transition(dom, Some(DomainEventKind::Resumed), |d| {
            if d.state != DomainState::Paused {
                return Err(HvError::invalid("domain is not paused"));
            }
            d.state = DomainState::Running;
            Ok(true)
        })
    }

    fn define_xml(&self, xml: &str) -> Result<DomainRef> {
        let spec = domain_xml::parse(xml)
            .map_err(|e| HvError::new(HvErrorKind::Internal, e.to_string()))?;
        let dom = DomainRef {
            uuid: spec.uuid.clone(),
            name: spec.name.clone(),
        };

        {
            let mut sim = self.live()?;
            if sim
                .domains
                .iter()
                .any(|d| d.spec.name == spec.name && !d.spec.uuid.eq_ignore_ascii_case(&spec.uuid))
            {
                return Err(HvError::invalid(format!(
                    "domain '{}' already exists with a different uuid",
                    spec.name
                )));
            }
            match sim
                .domains
                .iter_mut()
                .find(|d| d.spec.uuid.eq_ignore_ascii_case(&spec.uuid))
            {
                Some(existing) => existing.spec = spec,
                None => sim.domains.push(SimDomain::new(spec, DomainState::Shutoff)),
            }
        }

        self.host.emit(&dom.uuid, DomainEventKind::Defined);
        Ok(dom)
    }

    fn node_info(&self) -> Result<NodeInfo> {
        Ok(self.live()?.node.clone())
    }

    fn node_cpu_stats(&self) -> Result<NodeCpuStats> {
        let mut sim = self.live()?;
        let cpus = sim.node.cpus as f64;
        let total = sim.booted.elapsed().as_secs_f64() * 1e9 * cpus;
        let busy: f64 = sim
            .domains
            .iter_mut()
            .map(|d| {
                d.advance();
                d.cpu_time_ns
            })
            .sum::<f64>()
            .min(total);
        Ok(NodeCpuStats {
            kernel_ns: (busy / 4.0) as u64,
            user_ns: (busy * 3.0 / 4.0) as u64,
            idle_ns: (total - busy) as u64,
            iowait_ns: 0,
            extra: BTreeMap::new(),
        })
    }

    fn node_memory_stats(&self) -> Result<NodeMemoryStats> {
        let sim = self.live()?;
        let used: u64 = sim
            .domains
            .iter()
            .filter(|d| d.state.is_active())
            .map(|d| d.spec.memory_bytes / 1024)
            .sum();
        Ok(NodeMemoryStats {
            total_kib: sim.node.memory_kib,
            free_kib: sim.node.memory_kib.saturating_sub(used),
            buffers_kib: 0,
            cached_kib: 0,
            extra: BTreeMap::new(),
        })
    }

    fn capabilities_xml(&self) -> Result<String> {
        let sim = self.live()?;
        Ok(format!(
            "<capabilities>\n  <host>\n    <cpu>\n      <arch>{}</arch>\n      \
             <topology sockets='{}' cores='{}' threads='{}'/>\n    </cpu>\n  </host>\n  \
             <guest>\n    <os_type>hvm</os_type>\n    <arch name='{}'>\n      \
             <domain type='test'/>\n    </arch>\n  </guest>\n</capabilities>\n",
            sim.node.cpu_model,
            sim.node.sockets,
            sim.node.cores,
            sim.node.threads,
            sim.node.cpu_model
        ))
    }

    fn subscribe_events(&self) -> Result<broadcast::Receiver<DomainEvent>> {
        drop(self.live()?);
        Ok(self.host.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_default(driver: &TestDriver) -> Box<dyn Connection> {
        driver.open(DEFAULT_URI).unwrap()
    }

    #[test]
    fn test_default_host_has_running_domain() {
        let driver = TestDriver::new();
        let conn = open_default(&driver);
        let domains = conn.list_domains().unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].name, "test");
        assert_eq!(conn.get_state(&domains[0]).unwrap(), DomainState::Running);

        let by_uuid = conn.get_domain(DEFAULT_DOMAIN_UUID).unwrap();
        assert_eq!(by_uuid, domains[0]);
        let err = conn.get_domain("nope").unwrap_err();
        assert_eq!(err.kind, HvErrorKind::NotFound);
    }

    #[test]
    fn test_empty_and_unknown_hosts() {
        let driver = TestDriver::new();
        let conn = driver.open(EMPTY_URI).unwrap();
        assert!(conn.list_domains().unwrap().is_empty());

        let err = driver.open("test:///nowhere").err().unwrap();
        assert_eq!(err.kind, HvErrorKind::Unreachable);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let driver = TestDriver::new();
        let conn = open_default(&driver);
        let dom = conn.get_domain("test").unwrap();

        assert_eq!(
            conn.start(&dom).unwrap_err().kind,
            HvErrorKind::InvalidOperation
        );
        conn.suspend(&dom).unwrap();
        assert_eq!(conn.get_state(&dom).unwrap(), DomainState::Paused);
        conn.resume(&dom).unwrap();
        conn.shutdown(&dom).unwrap();
        assert_eq!(conn.get_state(&dom).unwrap(), DomainState::Shutoff);
        assert_eq!(
            conn.shutdown(&dom).unwrap_err().kind,
            HvErrorKind::InvalidOperation
        );
        conn.start(&dom).unwrap();
        conn.destroy(&dom).unwrap();
        assert_eq!(conn.get_state(&dom).unwrap(), DomainState::Shutoff);
    }

    #[test]
    fn test_ignore_shutdown_keeps_running() {
        let driver = TestDriver::new();
        let conn = open_default(&driver);
        let host = driver.host(DEFAULT_URI).unwrap();
        host.set_ignore_shutdown("test", true);

        let dom = conn.get_domain("test").unwrap();
        conn.shutdown(&dom).unwrap();
        assert_eq!(conn.get_state(&dom).unwrap(), DomainState::Running);
    }

    #[test]
    fn test_state_survives_reconnect() {
        let driver = TestDriver::new();
        let mut conn = open_default(&driver);
        let dom = conn.get_domain("test").unwrap();
        conn.destroy(&dom).unwrap();
        conn.close().unwrap();
        conn.close().unwrap();
        assert_eq!(
            conn.list_domains().unwrap_err().kind,
            HvErrorKind::ConnectionLost
        );

        let conn = open_default(&driver);
        assert_eq!(conn.get_state(&dom).unwrap(), DomainState::Shutoff);
    }

    #[test]
    fn test_fault_hooks() {
        let driver = TestDriver::new();
        let conn = open_default(&driver);
        let host = driver.host(DEFAULT_URI).unwrap();

        host.drop_connections();
        assert!(conn.list_domains().unwrap_err().is_connection_failure());

        host.fail_next_opens(1);
        assert!(driver.open(DEFAULT_URI).is_err());
        assert!(driver.open(DEFAULT_URI).is_ok());

        host.set_reachable(false);
        assert_eq!(
            driver.open(DEFAULT_URI).err().unwrap().kind,
            HvErrorKind::Unreachable
        );
    }

    #[test]
    fn test_xml_matches_spec() {
        let driver = TestDriver::new();
        let conn = open_default(&driver);
        let dom = conn.get_domain("test").unwrap();
        let spec = domain_xml::parse(&conn.get_xml(&dom).unwrap()).unwrap();
        assert_eq!(spec, default_domain_spec());
    }

    #[test]
    fn test_counters_advance_while_running() {
        let driver = TestDriver::new();
        let conn = open_default(&driver);
        let dom = conn.get_domain("test").unwrap();
        let before = conn.get_info(&dom).unwrap().cpu_time_ns;
        std::thread::sleep(std::time::Duration::from_millis(20));
        let after = conn.get_info(&dom).unwrap().cpu_time_ns;
        assert!(after > before);

        let stats = conn.get_block_stats(&dom, "vda").unwrap();
        assert!(stats.rd_bytes > 0);
        assert!(conn.get_block_stats(&dom, "vdz").is_err());
        assert!(conn.get_iface_stats(&dom, "aa:bb:cc:dd:ee:ff").is_ok());
    }

    #[test]
    fn test_define_xml_redefines_by_uuid() {
        let driver = TestDriver::new();
        let conn = open_default(&driver);
        let mut spec = default_domain_spec();
        spec.vcpu_count = 4;
        conn.define_xml(&domain_xml::render(&spec, "test")).unwrap();
        let host = driver.host(DEFAULT_URI).unwrap();
        assert_eq!(host.domain_spec("test").unwrap().vcpu_count, 4);
        assert_eq!(host.domain_state("test"), Some(DomainState::Running));

        spec.uuid = "11111111-2222-3333-4444-555555555555".to_string();
        assert_eq!(
            conn.define_xml(&domain_xml::render(&spec, "test"))
                .unwrap_err()
                .kind,
            HvErrorKind::InvalidOperation
        );
    }

    #[tokio::test]
    async fn test_events_delivered() {
        let driver = TestDriver::new();
        let conn = open_default(&driver);
        let mut events = conn.subscribe_events().unwrap();
        let dom = conn.get_domain("test").unwrap();
        conn.destroy(&dom).unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, DomainEventKind::Stopped);
        assert_eq!(event.domain_uuid, DEFAULT_DOMAIN_UUID);
    }
}
