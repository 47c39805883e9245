//! In-process event bus between the pool, reconciler, orchestrator and hub.

use tokio::sync::broadcast;

use crate::error::ErrorCode;
use crate::model::VirtualMachine;
use crate::pool::HostState;

#[derive(Debug, Clone)]
pub enum Event {
    HostChanged {
        host_id: String,
        state: HostState,
        error: Option<String>,
    },
    HostRemoved {
        host_id: String,
    },
    /// The hypervisor reported a domain lifecycle change.
    DomainsChanged {
        host_id: String,
    },
    DiscoveryChanged {
        host_id: String,
    },
    VmChanged(VirtualMachine),
    TaskFailed {
        vm: VirtualMachine,
        code: ErrorCode,
        message: String,
    },
}

pub type EventBus = broadcast::Sender<Event>;

const CAPACITY: usize = 256;

pub fn bus() -> EventBus {
    broadcast::channel(CAPACITY).0
}
