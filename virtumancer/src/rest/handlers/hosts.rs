use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use virtumancer_hv::{NodeInfo, uri_scheme};

use super::required;
use crate::error::{AppError, Result};
use crate::model::{DiscoveredVm, VirtualMachine};
use crate::pool::{HostState, HostView};
use crate::reconciler::{ImportOutcome, LiveDomain};
use crate::rest::AppState;
use crate::service::Service;
use crate::telemetry::{self, HostCounters};

#[derive(Deserialize)]
pub struct CreateHostRequest {
    pub id: String,
    pub uri: String,
}

#[derive(Deserialize)]
pub struct UpdateHostRequest {
    pub uri: Option<String>,
    pub auto_reconnect_disabled: Option<bool>,
}

#[derive(Deserialize)]
pub struct DomainUuidsRequest {
    pub domain_uuids: Vec<String>,
}

#[derive(Serialize)]
pub struct HostInfo {
    pub host: HostView,
    pub node: NodeInfo,
    pub capabilities: String,
}

#[derive(Serialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

fn validate_uri(uri: &str) -> Result<&str> {
    let uri = required("uri", uri)?;
    if uri_scheme(uri).is_none() {
        return Err(AppError::Validation(format!(
            "invalid hypervisor uri '{}'",
            uri
        )));
    }
    Ok(uri)
}

/// Registered host id, or HOST_NOT_FOUND.
fn known_host<'a>(service: &Service, id: &'a str) -> Result<&'a str> {
    let id = required("host id", id)?;
    if !service.pool.contains(id) {
        return Err(AppError::HostNotFound(id.to_string()));
    }
    Ok(id)
}

pub async fn list_hosts(State(service): State<AppState>) -> Json<Vec<HostView>> {
    Json(service.pool.list())
}

pub async fn create_host(
    State(service): State<AppState>,
    body: std::result::Result<Json<CreateHostRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<HostView>)> {
    let Json(req) = body?;
    let id = required("id", &req.id)?;
    if id.contains('/') {
        return Err(AppError::Validation("id must not contain '/'".to_string()));
    }
    let uri = validate_uri(&req.uri)?;

    let view = service.pool.add_host(id, uri).await?;
    info!(host_id = %id, uri = %uri, state = ?view.state, "host added");
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_host(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HostView>> {
    let id = required("host id", &id)?;
    Ok(Json(service.pool.status(id)?))
}

pub async fn update_host(
    State(service): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<UpdateHostRequest>, JsonRejection>,
) -> Result<Json<HostView>> {
    let Json(req) = body?;
    let id = required("host id", &id)?;
    let uri = req.uri.as_deref().map(validate_uri).transpose()?;
    if uri.is_none() && req.auto_reconnect_disabled.is_none() {
        return Err(AppError::Validation(
            "nothing to update: provide uri or auto_reconnect_disabled".to_string(),
        ));
    }
    let view = service
        .pool
        .update_host(id, uri, req.auto_reconnect_disabled)
        .await?;
    Ok(Json(view))
}

pub async fn delete_host(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let id = required("host id", &id)?;
    service.pool.remove_host(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Connect now, re-enabling auto-reconnect if a user had disabled it.
pub async fn connect_host(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HostView>> {
    let id = required("host id", &id)?;
    service.pool.ensure_connected_forced(id).await?;
    Ok(Json(service.pool.status(id)?))
}

/// Disconnect and keep the host disconnected until asked to connect.
pub async fn disconnect_host(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HostView>> {
    let id = required("host id", &id)?;
    service.pool.disconnect(id, true).await?;
    Ok(Json(service.pool.status(id)?))
}

pub async fn host_info(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HostInfo>> {
    let id = known_host(&service, &id)?;
    let (node, capabilities) = service
        .pool
        .with_connection(id, |conn| Ok((conn.node_info()?, conn.capabilities_xml()?)))
        .await?;
    Ok(Json(HostInfo {
        host: service.pool.status(id)?,
        node,
        capabilities,
    }))
}

pub async fn host_stats(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HostCounters>> {
    let id = known_host(&service, &id)?;
    Ok(Json(telemetry::read_host(&service.pool, id).await?))
}

/// Live domains straight from the hypervisor, flagged when imported.
pub async fn list_vms(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LiveDomain>>> {
    let id = known_host(&service, &id)?;
    Ok(Json(service.reconciler.live_domains(id).await?))
}

/// Canonical VMs stored for the host.
pub async fn list_inventory(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<VirtualMachine>>> {
    let id = known_host(&service, &id)?;
    Ok(Json(service.store.list_vms_by_host(id).await?))
}

/// Discovered domains, refreshed first when the host is connected.
pub async fn list_discovered(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DiscoveredVm>>> {
    let id = known_host(&service, &id)?;
    if service.pool.state(id) == Some(HostState::Connected)
        && let Err(e) = service.reconciler.discover(id).await
    {
        debug!(host_id = %id, error = %e, "discovery before listing failed");
    }
    Ok(Json(service.store.list_discovered(id).await?))
}

pub async fn delete_discovered(
    State(service): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<DomainUuidsRequest>, JsonRejection>,
) -> Result<Json<DeletedResponse>> {
    let Json(req) = body?;
    let id = known_host(&service, &id)?;
    let deleted = service
        .store
        .bulk_delete_discovered(id, &req.domain_uuids)
        .await?;
    Ok(Json(DeletedResponse { deleted }))
}

pub async fn import_vm(
    State(service): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<(StatusCode, Json<VirtualMachine>)> {
    let id = known_host(&service, &id)?;
    let name = required("vm name", &name)?;
    let vm = service.reconciler.import_vm(id, name).await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

pub async fn import_all(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ImportOutcome>>> {
    let id = known_host(&service, &id)?;
    Ok(Json(service.reconciler.import_all(id).await?))
}

pub async fn import_selected(
    State(service): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<DomainUuidsRequest>, JsonRejection>,
) -> Result<Json<Vec<ImportOutcome>>> {
    let Json(req) = body?;
    let id = known_host(&service, &id)?;
    if req.domain_uuids.is_empty() {
        return Err(AppError::Validation(
            "domain_uuids must not be empty".to_string(),
        ));
    }
    Ok(Json(
        service
            .reconciler
            .import_selected(id, &req.domain_uuids)
            .await,
    ))
}
