use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::rest::AppState;
use crate::settings::MetricsSettings;

/// Effective settings plus what the telemetry layer is doing with them.
#[derive(Serialize)]
pub struct MetricsRuntime {
    #[serde(flatten)]
    pub settings: MetricsSettings,
    pub active_samplers: Vec<String>,
    pub connected_hosts: Vec<String>,
}

pub async fn get_metrics(State(service): State<AppState>) -> Result<Json<MetricsSettings>> {
    Ok(Json(service.settings.metrics().await?))
}

/// Merge a partial document over the stored settings.
pub async fn update_metrics(
    State(service): State<AppState>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<MetricsSettings>> {
    let Json(patch) = body?;
    Ok(Json(service.settings.update_metrics(patch).await?))
}

pub async fn metrics_runtime(State(service): State<AppState>) -> Result<Json<MetricsRuntime>> {
    Ok(Json(MetricsRuntime {
        settings: service.settings.metrics().await?,
        active_samplers: service
            .telemetry
            .active()
            .iter()
            .map(ToString::to_string)
            .collect(),
        connected_hosts: service.pool.connected_hosts(),
    }))
}
