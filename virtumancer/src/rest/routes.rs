use std::any::Any;

use axum::{
    Router,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::AppState;
use super::handlers::{self, hosts, settings, vms};
use super::ws;
use crate::error::AppError;

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        // Hosts
        .route("/hosts", get(hosts::list_hosts).post(hosts::create_host))
        .route(
            "/hosts/{id}",
            get(hosts::get_host)
                .patch(hosts::update_host)
                .delete(hosts::delete_host),
        )
        .route("/hosts/{id}/connect", post(hosts::connect_host))
        .route("/hosts/{id}/disconnect", post(hosts::disconnect_host))
        .route("/hosts/{id}/info", get(hosts::host_info))
        .route("/hosts/{id}/stats", get(hosts::host_stats))
        // Inventory
        .route("/hosts/{id}/vms", get(hosts::list_vms))
        .route("/hosts/{id}/inventory", get(hosts::list_inventory))
        .route(
            "/hosts/{id}/discovered-vms",
            get(hosts::list_discovered).delete(hosts::delete_discovered),
        )
        .route("/hosts/{id}/vms/import-all", post(hosts::import_all))
        .route("/hosts/{id}/vms/import-selected", post(hosts::import_selected))
        .route("/hosts/{id}/vms/{name}/import", post(hosts::import_vm))
        // VMs
        .route("/hosts/{id}/vms/{name}", get(vms::get_vm))
        .route("/hosts/{id}/vms/{name}/start", post(vms::start_vm))
        .route("/hosts/{id}/vms/{name}/shutdown", post(vms::shutdown_vm))
        .route("/hosts/{id}/vms/{name}/reboot", post(vms::reboot_vm))
        .route("/hosts/{id}/vms/{name}/forceoff", post(vms::force_off_vm))
        .route("/hosts/{id}/vms/{name}/forcereset", post(vms::force_reset_vm))
        .route("/hosts/{id}/vms/{name}/suspend", post(vms::suspend_vm))
        .route("/hosts/{id}/vms/{name}/resume", post(vms::resume_vm))
        .route(
            "/hosts/{id}/vms/{name}/sync-from-libvirt",
            post(vms::sync_from_libvirt),
        )
        .route("/hosts/{id}/vms/{name}/rebuild-from-db", post(vms::rebuild_from_db))
        .route("/hosts/{id}/vms/{name}/state", put(vms::set_vm_state))
        .route("/hosts/{id}/vms/{name}/stats", get(vms::vm_stats))
        .route("/hosts/{id}/vms/{name}/hardware", get(vms::vm_hardware))
        .route(
            "/hosts/{id}/vms/{name}/hardware/extended",
            get(vms::vm_hardware_extended),
        )
        // Settings
        .route(
            "/settings/metrics",
            get(settings::get_metrics).put(settings::update_metrics),
        )
        .route("/settings/metrics/runtime", get(settings::metrics_runtime));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws", get(ws::ws_handler))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "handler panicked");
    AppError::Internal("internal error".to_string()).into_response()
}
