use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use virtumancer_hv::domain_xml::{Device, DomainSpec};

use super::required;
use crate::drift;
use crate::error::{AppError, Result};
use crate::model::{Attachment, DriftDetail, VirtualMachine, VmState};
use crate::orchestrator::Verb;
use crate::pool::HostState;
use crate::rest::AppState;
use crate::telemetry::{self, VmCounters};

#[derive(Deserialize)]
pub struct SetStateRequest {
    pub state: String,
}

#[derive(Serialize)]
pub struct VmHardware {
    pub vm: VirtualMachine,
    pub devices: Vec<Device>,
}

/// Stored hardware next to the live definition, when the host is reachable.
#[derive(Serialize)]
pub struct VmHardwareExtended {
    pub vm: VirtualMachine,
    pub attachments: Vec<Attachment>,
    pub live: Option<DomainSpec>,
    pub drift: Vec<DriftDetail>,
}

type Accepted = (StatusCode, Json<VirtualMachine>);

async fn run_verb(service: AppState, id: &str, name: &str, verb: Verb) -> Result<Accepted> {
    let id = required("host id", id)?;
    let name = required("vm name", name)?;
    let handle = service.orchestrator.run(id, name, verb).await?;
    Ok((StatusCode::ACCEPTED, Json(handle.vm)))
}

pub async fn get_vm(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<VirtualMachine>> {
    let id = required("host id", &id)?;
    let name = required("vm name", &name)?;
    Ok(Json(service.orchestrator.lookup(id, name).await?))
}

pub async fn start_vm(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Accepted> {
    run_verb(service, &id, &name, Verb::Start).await
}

pub async fn shutdown_vm(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Accepted> {
    run_verb(service, &id, &name, Verb::Shutdown).await
}

pub async fn reboot_vm(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Accepted> {
    run_verb(service, &id, &name, Verb::Reboot).await
}

pub async fn force_off_vm(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Accepted> {
    run_verb(service, &id, &name, Verb::ForceOff).await
}

pub async fn force_reset_vm(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Accepted> {
    run_verb(service, &id, &name, Verb::ForceReset).await
}

pub async fn suspend_vm(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Accepted> {
    run_verb(service, &id, &name, Verb::Suspend).await
}

pub async fn resume_vm(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Accepted> {
    run_verb(service, &id, &name, Verb::Resume).await
}

/// Rewrite the live domain from the stored definition.
pub async fn rebuild_from_db(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Accepted> {
    run_verb(service, &id, &name, Verb::Rebuild).await
}

/// Accept the live definition as the stored one.
pub async fn sync_from_libvirt(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<VirtualMachine>> {
    let id = required("host id", &id)?;
    let name = required("vm name", &name)?;
    Ok(Json(service.orchestrator.sync_from_live(id, name).await?))
}

pub async fn set_vm_state(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    body: std::result::Result<Json<SetStateRequest>, JsonRejection>,
) -> Result<Accepted> {
    let Json(req) = body?;
    let id = required("host id", &id)?;
    let name = required("vm name", &name)?;
    let desired = VmState::parse(&req.state.trim().to_ascii_uppercase())
        .ok_or_else(|| AppError::Validation(format!("unknown state '{}'", req.state)))?;

    let handle = service
        .orchestrator
        .set_desired_state(id, name, desired)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(handle.vm)))
}

pub async fn vm_stats(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<VmCounters>> {
    let id = required("host id", &id)?;
    let name = required("vm name", &name)?;
    let vm = service.orchestrator.lookup(id, name).await?;
    Ok(Json(
        telemetry::read_vm(&service.pool, &vm.host_id, &vm.domain_uuid).await?,
    ))
}

pub async fn vm_hardware(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<VmHardware>> {
    let id = required("host id", &id)?;
    let name = required("vm name", &name)?;
    let vm = service.orchestrator.lookup(id, name).await?;
    let devices = service.store.canonical_devices(&vm.uuid).await?;
    Ok(Json(VmHardware { vm, devices }))
}

pub async fn vm_hardware_extended(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<VmHardwareExtended>> {
    let id = required("host id", &id)?;
    let name = required("vm name", &name)?;
    let vm = service.orchestrator.lookup(id, name).await?;
    let attachments = service.store.list_attachments(&vm.uuid).await?;

    let live = if service.pool.state(&vm.host_id) == Some(HostState::Connected) {
        match drift::fetch_live(&service.pool, &vm.host_id, &vm.domain_uuid).await {
            Ok(live) => Some(live.spec()?),
            Err(e) => {
                debug!(vm = %vm.name, host_id = %vm.host_id, error = %e, "live definition unavailable");
                None
            }
        }
    } else {
        None
    };

    Ok(Json(VmHardwareExtended {
        drift: vm.drift_details.clone(),
        vm,
        attachments,
        live,
    }))
}
