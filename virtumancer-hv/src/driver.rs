//! The capability boundary: one `Connection` per hypervisor, opened by a `Driver`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::{HvError, HvErrorKind, Result};
use crate::types::{
    BlockStats, DomainEvent, DomainInfo, DomainRef, DomainState, IfaceStats, MemoryParams,
    NodeCpuStats, NodeInfo, NodeMemoryStats, VcpuFlags, VcpuInfo,
};

/// Opens connections for the URI schemes it understands.
pub trait Driver: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn Connection>>;
}

/// A single hypervisor connection.
///
/// All calls block. Implementations are not required to be `Sync`; the
/// connection pool serializes access to each connection.
pub trait Connection: Send {
    fn uri(&self) -> &str;

    /// Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Active and inactive domains.
    fn list_domains(&self) -> Result<Vec<DomainRef>>;

    /// Look a domain up by UUID or name.
    fn get_domain(&self, identifier: &str) -> Result<DomainRef>;

    fn get_state(&self, dom: &DomainRef) -> Result<DomainState>;
    fn get_xml(&self, dom: &DomainRef) -> Result<String>;
    fn get_info(&self, dom: &DomainRef) -> Result<DomainInfo>;
    fn get_max_vcpus(&self, dom: &DomainRef) -> Result<u32>;
    fn get_vcpus_flags(&self, dom: &DomainRef, flags: VcpuFlags) -> Result<u32>;
    fn get_vcpus(&self, dom: &DomainRef) -> Result<Vec<VcpuInfo>>;
    fn get_memory_params(&self, dom: &DomainRef) -> Result<MemoryParams>;
    fn get_block_stats(&self, dom: &DomainRef, device: &str) -> Result<BlockStats>;
    fn get_iface_stats(&self, dom: &DomainRef, device: &str) -> Result<IfaceStats>;

    fn start(&self, dom: &DomainRef) -> Result<()>;
    fn shutdown(&self, dom: &DomainRef) -> Result<()>;
    fn reboot(&self, dom: &DomainRef) -> Result<()>;
    /// Force off.
    fn destroy(&self, dom: &DomainRef) -> Result<()>;
    /// Force reset.
    fn reset(&self, dom: &DomainRef) -> Result<()>;
    fn suspend(&self, dom: &DomainRef) -> Result<()>;
    fn resume(&self, dom: &DomainRef) -> Result<()>;

    /// Define (or redefine) a persistent domain from XML.
    fn define_xml(&self, xml: &str) -> Result<DomainRef>;

    fn node_info(&self) -> Result<NodeInfo>;

    fn node_cpu_stats(&self) -> Result<NodeCpuStats> {
        Err(HvError::unsupported("node cpu stats"))
    }

    fn node_memory_stats(&self) -> Result<NodeMemoryStats> {
        Err(HvError::unsupported("node memory stats"))
    }

    fn capabilities_xml(&self) -> Result<String>;

    /// Lifecycle events. Drivers without event support return `Unsupported`
    /// and callers poll instead.
    fn subscribe_events(&self) -> Result<broadcast::Receiver<DomainEvent>> {
        Err(HvError::unsupported("domain events"))
    }
}

/// Dispatches `open` to a driver chosen by URI scheme.
///
/// `qemu+ssh://host/system` is looked up under `qemu+ssh` first, then `qemu`.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
    fallback: Option<Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver compiled into this build.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("test", Arc::new(crate::test_driver::TestDriver::new()));
        #[cfg(feature = "libvirt")]
        registry.set_fallback(Arc::new(crate::libvirt::LibvirtDriver));
        registry
    }

    pub fn register(&mut self, scheme: &str, driver: Arc<dyn Driver>) {
        self.drivers.insert(scheme.to_string(), driver);
    }

    /// Driver used for schemes nobody registered.
    pub fn set_fallback(&mut self, driver: Arc<dyn Driver>) {
        self.fallback = Some(driver);
    }

    fn resolve(&self, uri: &str) -> Result<&Arc<dyn Driver>> {
        let scheme = uri_scheme(uri).ok_or_else(|| {
            HvError::new(HvErrorKind::UnsupportedUri, format!("malformed URI: {}", uri))
        })?;
        let base = scheme.split('+').next().unwrap_or(scheme);

        self.drivers
            .get(scheme)
            .or_else(|| self.drivers.get(base))
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                HvError::new(
                    HvErrorKind::UnsupportedUri,
                    format!("no driver for scheme '{}'", scheme),
                )
            })
    }
}

impl Driver for DriverRegistry {
    fn open(&self, uri: &str) -> Result<Box<dyn Connection>> {
        self.resolve(uri)?.open(uri)
    }
}

/// Scheme part of a hypervisor URI (`qemu+ssh` for `qemu+ssh://h/system`).
pub fn uri_scheme(uri: &str) -> Option<&str> {
    let (scheme, _) = uri.split_once("://")?;
    if scheme.is_empty() {
        return None;
    }
    let valid = scheme
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
    valid.then_some(scheme)
}
