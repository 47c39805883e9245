//! libvirt backend, built with the `libvirt` feature.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::sys;

use crate::driver::{Connection, Driver};
use crate::error::{HvError, HvErrorKind, Result};
use crate::types::{
    BlockStats, DomainInfo, DomainRef, DomainState, IfaceStats, MemoryParams, NodeInfo,
    NodeMemoryStats, VcpuFlags, VcpuInfo,
};

/// Opens any URI libvirt itself understands.
pub struct LibvirtDriver;

impl Driver for LibvirtDriver {
    fn open(&self, uri: &str) -> Result<Box<dyn Connection>> {
        let conn = Connect::open(Some(uri)).map_err(|e| {
            let err = map_error(&e);
            // A broken transport at open time is an unreachable host, not a lost session.
            match err.kind {
                HvErrorKind::ConnectionLost | HvErrorKind::Internal => {
                    HvError::new(HvErrorKind::Unreachable, err.message)
                }
                _ => err,
            }
        })?;
        debug!(uri = %uri, "libvirt connection opened");
        Ok(Box::new(LibvirtConnection {
            uri: uri.to_string(),
            conn: Some(conn),
        }))
    }
}

pub struct LibvirtConnection {
    uri: String,
    conn: Option<Connect>,
}

fn map_error(e: &virt::error::Error) -> HvError {
    let kind = match e.code() {
        ErrorNumber::NoDomain => HvErrorKind::NotFound,
        ErrorNumber::OperationInvalid => HvErrorKind::InvalidOperation,
        ErrorNumber::AuthFailed | ErrorNumber::AuthCancelled => HvErrorKind::Auth,
        ErrorNumber::NoConnect => HvErrorKind::Unreachable,
        ErrorNumber::SystemError | ErrorNumber::InvalidConn => HvErrorKind::ConnectionLost,
        ErrorNumber::OperationTimeout => HvErrorKind::Timeout,
        ErrorNumber::NoSupport => HvErrorKind::Unsupported,
        _ => HvErrorKind::Internal,
    };
    HvError::new(kind, e.to_string())
}

fn map_state(state: sys::virDomainState) -> DomainState {
    match state {
        sys::VIR_DOMAIN_RUNNING => DomainState::Running,
        sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
        sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
        sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
        sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
        sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
        sys::VIR_DOMAIN_PMSUSPENDED => DomainState::PmSuspended,
        _ => DomainState::NoState,
    }
}

fn dom_ref(domain: &Domain) -> Result<DomainRef> {
    Ok(DomainRef {
        uuid: domain.get_uuid_string().map_err(|e| map_error(&e))?,
        name: domain.get_name().map_err(|e| map_error(&e))?,
    })
}

impl LibvirtConnection {
    fn connect(&self) -> Result<&Connect> {
        self.conn
            .as_ref()
            .ok_or_else(|| HvError::new(HvErrorKind::ConnectionLost, "connection is closed"))
    }

    /// Resolve the domain for one call. The handle is dropped (and freed) on return.
    fn lookup(&self, dom: &DomainRef) -> Result<Domain> {
        Domain::lookup_by_uuid_string(self.connect()?, &dom.uuid).map_err(|e| map_error(&e))
    }

    fn with_domain<T>(
        &self,
        dom: &DomainRef,
        f: impl FnOnce(&Domain) -> std::result::Result<T, virt::error::Error>,
    ) -> Result<T> {
        let domain = self.lookup(dom)?;
        f(&domain).map_err(|e| map_error(&e))
    }
}

impl Connection for LibvirtConnection {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take()
            && let Err(e) = conn.close()
        {
            warn!(uri = %self.uri, error = %e, "libvirt close failed");
        }
        Ok(())
    }

    fn list_domains(&self) -> Result<Vec<DomainRef>> {
        let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
        let domains = self
            .connect()?
            .list_all_domains(flags)
            .map_err(|e| map_error(&e))?;
        domains.iter().map(dom_ref).collect()
    }

    fn get_domain(&self, identifier: &str) -> Result<DomainRef> {
        let conn = self.connect()?;
        let domain = match Domain::lookup_by_uuid_string(conn, identifier) {
            Ok(d) => d,
            Err(_) => Domain::lookup_by_name(conn, identifier).map_err(|e| map_error(&e))?,
        };
        dom_ref(&domain)
    }

    fn get_state(&self, dom: &DomainRef) -> Result<DomainState> {
        self.with_domain(dom, |d| d.get_state().map(|(state, _)| map_state(state)))
    }

    fn get_xml(&self, dom: &DomainRef) -> Result<String> {
        self.with_domain(dom, |d| d.get_xml_desc(0))
    }

    fn get_info(&self, dom: &DomainRef) -> Result<DomainInfo> {
        self.with_domain(dom, |d| {
            d.get_info().map(|info| DomainInfo {
                state: map_state(info.state),
                max_mem_kib: info.max_mem,
                memory_kib: info.memory,
                vcpus: info.nr_virt_cpu,
                cpu_time_ns: info.cpu_time,
            })
        })
    }

    fn get_max_vcpus(&self, dom: &DomainRef) -> Result<u32> {
        self.with_domain(dom, |d| d.get_max_vcpus().map(|n| n as u32))
    }

    fn get_vcpus_flags(&self, dom: &DomainRef, flags: VcpuFlags) -> Result<u32> {
        let raw = match flags {
            VcpuFlags::Live => sys::VIR_DOMAIN_VCPU_LIVE,
            VcpuFlags::Config => sys::VIR_DOMAIN_VCPU_CONFIG,
            VcpuFlags::Maximum => sys::VIR_DOMAIN_VCPU_MAXIMUM | sys::VIR_DOMAIN_VCPU_CONFIG,
        };
        self.with_domain(dom, |d| d.get_vcpus_flags(raw))
    }

    fn get_vcpus(&self, dom: &DomainRef) -> Result<Vec<VcpuInfo>> {
        // Per-vCPU times are not exposed by the bindings; spread the domain total.
        let info = self.get_info(dom)?;
        if !info.state.is_active() {
            return Err(HvError::invalid("domain is not running"));
        }
        let n = info.vcpus.max(1);
        Ok((0..n)
            .map(|i| VcpuInfo {
                number: i,
                state: 1,
                cpu_time_ns: info.cpu_time_ns / n as u64,
                cpu: -1,
            })
            .collect())
    }

    fn get_memory_params(&self, dom: &DomainRef) -> Result<MemoryParams> {
        self.with_domain(dom, |d| {
            d.get_memory_parameters(0).map(|p| MemoryParams {
                hard_limit_kib: p.hard_limit,
                soft_limit_kib: p.soft_limit,
                min_guarantee_kib: p.min_guarantee,
                swap_hard_limit_kib: p.swap_hard_limit,
                extra: BTreeMap::new(),
            })
        })
    }

    fn get_block_stats(&self, dom: &DomainRef, device: &str) -> Result<BlockStats> {
        self.with_domain(dom, |d| {
            d.get_block_stats(device).map(|s| BlockStats {
                rd_bytes: s.rd_bytes.max(0) as u64,
                wr_bytes: s.wr_bytes.max(0) as u64,
                rd_reqs: s.rd_req.max(0) as u64,
                wr_reqs: s.wr_req.max(0) as u64,
            })
        })
    }

    fn get_iface_stats(&self, dom: &DomainRef, device: &str) -> Result<IfaceStats> {
        self.with_domain(dom, |d| {
            d.interface_stats(device).map(|s| IfaceStats {
                rx_bytes: s.rx_bytes.max(0) as u64,
                tx_bytes: s.tx_bytes.max(0) as u64,
                rx_pkts: s.rx_packets.max(0) as u64,
                tx_pkts: s.tx_packets.max(0) as u64,
            })
        })
    }

    fn start(&self, dom: &DomainRef) -> Result<()> {
        self.with_domain(dom, |d| d.create().map(|_| ()))
    }

    fn shutdown(&self, dom: &DomainRef) -> Result<()> {
        self.with_domain(dom, |d| d.shutdown().map(|_| ()))
    }

    fn reboot(&self, dom: &DomainRef) -> Result<()> {
        self.with_domain(dom, |d| d.reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT).map(|_| ()))
    }

    fn destroy(&self, dom: &DomainRef) -> Result<()> {
        self.with_domain(dom, |d| d.destroy().map(|_| ()))
    }

    fn reset(&self, dom: &DomainRef) -> Result<()> {
        self.with_domain(dom, |d| d.reset().map(|_| ()))
    }

    fn suspend(&self, dom: &DomainRef) -> Result<()> {
        self.with_domain(dom, |d| d.suspend().map(|_| ()))
    }

    fn resume(&self, dom: &DomainRef) -> Result<()> {
        self.with_domain(dom, |d| d.resume().map(|_| ()))
    }

    fn define_xml(&self, xml: &str) -> Result<DomainRef> {
        let domain = Domain::define_xml(self.connect()?, xml).map_err(|e| map_error(&e))?;
        dom_ref(&domain)
    }

    fn node_info(&self) -> Result<NodeInfo> {
        let info = self.connect()?.get_node_info().map_err(|e| map_error(&e))?;
        Ok(NodeInfo {
            cpu_model: info.model,
            memory_kib: info.memory,
            cpus: info.cpus,
            mhz: info.mhz,
            numa_nodes: info.nodes,
            sockets: info.sockets,
            cores: info.cores,
            threads: info.threads,
        })
    }

    fn node_memory_stats(&self) -> Result<NodeMemoryStats> {
        let conn = self.connect()?;
        let total_kib = conn.get_node_info().map_err(|e| map_error(&e))?.memory;
        let free_bytes = conn.get_free_memory().map_err(|e| map_error(&e))?;
        Ok(NodeMemoryStats {
            total_kib,
            free_kib: free_bytes / 1024,
            buffers_kib: 0,
            cached_kib: 0,
            extra: BTreeMap::new(),
        })
    }

    fn capabilities_xml(&self) -> Result<String> {
        self.connect()?.get_capabilities().map_err(|e| map_error(&e))
    }
}

impl Drop for LibvirtConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
