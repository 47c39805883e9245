//! Telemetry display and smoothing settings, stored under `metrics:global`.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::store::Store;

pub const METRICS_KEY: &str = "metrics:global";

const INTERVAL_RANGE_MS: std::ops::RangeInclusive<u64> = 100..=60_000;

/// How CPU usage is scaled for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Share of the whole host.
    Host,
    /// Share of the guest's vCPUs.
    Guest,
    /// Unscaled, 100 per busy CPU.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskUnit {
    Kib,
    Mib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetUnit {
    Kb,
    Mb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Units {
    pub disk: DiskUnit,
    pub network: NetUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSettings {
    pub cpu_display_default: DisplayMode,
    pub cpu_smooth_alpha: f64,
    pub disk_smooth_alpha: f64,
    pub net_smooth_alpha: f64,
    pub units: Units,
    pub vm_interval_ms: u64,
    pub host_interval_ms: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            cpu_display_default: DisplayMode::Host,
            cpu_smooth_alpha: 0.3,
            disk_smooth_alpha: 0.3,
            net_smooth_alpha: 0.3,
            units: Units {
                disk: DiskUnit::Mib,
                network: NetUnit::Mb,
            },
            vm_interval_ms: 1000,
            host_interval_ms: 500,
        }
    }
}

impl MetricsSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, alpha) in [
            ("cpuSmoothAlpha", self.cpu_smooth_alpha),
            ("diskSmoothAlpha", self.disk_smooth_alpha),
            ("netSmoothAlpha", self.net_smooth_alpha),
        ] {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(AppError::Validation(format!(
                    "{} must be between 0 and 1, got {}",
                    name, alpha
                )));
            }
        }
        for (name, ms) in [
            ("vmIntervalMs", self.vm_interval_ms),
            ("hostIntervalMs", self.host_interval_ms),
        ] {
            if !INTERVAL_RANGE_MS.contains(&ms) {
                return Err(AppError::Validation(format!(
                    "{} must be between {} and {}, got {}",
                    name,
                    INTERVAL_RANGE_MS.start(),
                    INTERVAL_RANGE_MS.end(),
                    ms
                )));
            }
        }
        Ok(())
    }

    pub fn vm_interval(&self) -> Duration {
        Duration::from_millis(self.vm_interval_ms)
    }

    pub fn host_interval(&self) -> Duration {
        Duration::from_millis(self.host_interval_ms)
    }
}

/// Read-through cache over the stored settings document.
pub struct SettingsService {
    store: Store,
    ttl: Duration,
    cache: Mutex<Option<(Instant, MetricsSettings)>>,
}

impl SettingsService {
    pub fn new(store: Store, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Effective settings, served from cache while fresh.
    pub async fn metrics(&self) -> Result<MetricsSettings> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, settings)| settings.clone());
        if let Some(settings) = cached {
            return Ok(settings);
        }

        let settings = self.load().await?;
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((Instant::now(), settings.clone()));
        Ok(settings)
    }

    /// Settings as stored, bypassing the cache.
    pub async fn load(&self) -> Result<MetricsSettings> {
        let Some(stored) = self.store.get_setting(METRICS_KEY).await? else {
            return Ok(MetricsSettings::default());
        };

        let mut merged = serde_json::to_value(MetricsSettings::default())
            .map_err(|e| AppError::Internal(e.to_string()))?;
        merge(&mut merged, stored);
        match serde_json::from_value::<MetricsSettings>(merged) {
            Ok(settings) if settings.validate().is_ok() => Ok(settings),
            _ => {
                warn!(key = METRICS_KEY, "stored metrics settings are invalid, using defaults");
                Ok(MetricsSettings::default())
            }
        }
    }

    /// Merge a partial document over the stored settings.
    pub async fn update_metrics(&self, patch: Value) -> Result<MetricsSettings> {
        if !patch.is_object() {
            return Err(AppError::Validation(
                "settings must be a JSON object".to_string(),
            ));
        }

        let mut merged = serde_json::to_value(self.load().await?)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        merge(&mut merged, patch);
        let settings: MetricsSettings = serde_json::from_value(merged)
            .map_err(|e| AppError::Validation(format!("invalid metrics settings: {}", e)))?;
        settings.validate()?;

        let value = serde_json::to_value(&settings).map_err(|e| AppError::Internal(e.to_string()))?;
        self.store.set_setting(METRICS_KEY, &value).await?;
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!(key = METRICS_KEY, "metrics settings updated");
        Ok(settings)
    }
}

/// Deep-merge `patch` into `base`; objects merge key by key, anything else replaces.
fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
