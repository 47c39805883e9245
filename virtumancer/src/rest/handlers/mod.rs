pub mod hosts;
pub mod settings;
pub mod vms;

use axum::Json;
use serde::Serialize;

use crate::error::{AppError, Result};

#[derive(Serialize)]
pub struct Health {
    pub ok: bool,
}

pub async fn health() -> Json<Health> {
    Json(Health { ok: true })
}

/// Reject blank path parameters.
pub(crate) fn required<'a>(what: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation(format!("{} must not be empty", what)));
    }
    Ok(value)
}
