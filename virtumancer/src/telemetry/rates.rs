//! Rate derivation, smoothing and unit scaling for telemetry samples.

use crate::settings::{DiskUnit, DisplayMode, NetUnit};

/// Exponential moving average. The first value seeds it.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            value: None,
        }
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha.clamp(0.0, 1.0);
    }

    pub fn update(&mut self, raw: f64) -> f64 {
        let next = match self.value {
            None => raw,
            Some(prev) => self.alpha * raw + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// Per-second rate of a monotonically increasing counter. `None` when the
/// counter went backwards or no time passed.
pub fn rate(prev: u64, now: u64, elapsed_secs: f64) -> Option<f64> {
    if now < prev || elapsed_secs <= 0.0 {
        return None;
    }
    Some((now - prev) as f64 / elapsed_secs)
}

/// CPU usage from two cumulative CPU-time readings, unscaled: 100 per fully
/// busy CPU. `None` on a counter reset.
pub fn raw_cpu_percent(prev_ns: u64, now_ns: u64, elapsed_ns: f64) -> Option<f64> {
    if now_ns < prev_ns || elapsed_ns <= 0.0 {
        return None;
    }
    Some((now_ns - prev_ns) as f64 / elapsed_ns * 100.0)
}

/// Share of the guest's vCPUs, clamped to [0, 100].
pub fn guest_percent(raw: f64, vcpus: u32) -> f64 {
    (raw / vcpus.max(1) as f64).clamp(0.0, 100.0)
}

/// Share of the host's CPUs, clamped to [0, 100].
pub fn host_percent(raw: f64, host_cpus: u32) -> f64 {
    (raw / host_cpus.max(1) as f64).clamp(0.0, 100.0)
}

pub fn display_percent(mode: DisplayMode, raw: f64, vcpus: u32, host_cpus: u32) -> f64 {
    match mode {
        DisplayMode::Host => host_percent(raw, host_cpus),
        DisplayMode::Guest => guest_percent(raw, vcpus),
        DisplayMode::Raw => raw.max(0.0),
    }
}

/// Bytes per second in the configured disk unit.
pub fn scale_disk(bytes_per_sec: f64, unit: DiskUnit) -> f64 {
    match unit {
        DiskUnit::Kib => bytes_per_sec / 1024.0,
        DiskUnit::Mib => bytes_per_sec / (1024.0 * 1024.0),
    }
}

/// Bytes per second as bits per second in the configured network unit.
pub fn scale_net(bytes_per_sec: f64, unit: NetUnit) -> f64 {
    match unit {
        NetUnit::Kb => bytes_per_sec * 8.0 / 1_000.0,
        NetUnit::Mb => bytes_per_sec * 8.0 / 1_000_000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_ema_seeds_then_smooths() {
        let mut ema = Ema::new(0.3);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(10.0), 10.0);
        assert!(close(ema.update(20.0), 13.0));
        assert!(close(ema.update(20.0), 15.1));

        let mut pass = Ema::new(1.0);
        pass.update(5.0);
        assert_eq!(pass.update(9.0), 9.0);

        let mut frozen = Ema::new(0.0);
        frozen.update(5.0);
        assert_eq!(frozen.update(9.0), 5.0);
    }

    #[test]
    fn test_counter_reset_yields_nothing() {
        assert_eq!(rate(100, 50, 1.0), None);
        assert_eq!(rate(100, 300, 0.0), None);
        assert_eq!(rate(100, 300, 2.0), Some(100.0));
        assert_eq!(raw_cpu_percent(2_000, 1_000, 1e9), None);
    }

    #[test]
    fn test_cpu_scaling_and_clamping() {
        // Two vCPUs fully busy for one second.
        let raw = raw_cpu_percent(0, 2_000_000_000, 1e9).unwrap();
        assert!(close(raw, 200.0));
        assert!(close(guest_percent(raw, 2), 100.0));
        assert!(close(guest_percent(raw, 4), 50.0));
        assert!(close(host_percent(raw, 16), 12.5));
        assert_eq!(guest_percent(raw, 1), 100.0);
        assert_eq!(guest_percent(raw, 0), 100.0);
        assert!(close(display_percent(DisplayMode::Raw, raw, 2, 16), 200.0));
        assert!(close(display_percent(DisplayMode::Host, raw, 2, 16), 12.5));
    }

    #[test]
    fn test_unit_scaling() {
        assert!(close(scale_disk(1_048_576.0, DiskUnit::Mib), 1.0));
        assert!(close(scale_disk(1_048_576.0, DiskUnit::Kib), 1024.0));
        assert!(close(scale_net(125_000.0, NetUnit::Mb), 1.0));
        assert!(close(scale_net(125_000.0, NetUnit::Kb), 1000.0));
    }
}
