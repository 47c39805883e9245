//! Per-subject sampling loops and the rate trackers they feed.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use virtumancer_hv::{BlockStats, IfaceStats, NodeCpuStats};

use super::rates::{
    Ema, display_percent, guest_percent, raw_cpu_percent, rate, scale_disk, scale_net,
};
use super::{DiskRate, HostCounters, HostStats, NetRate, SamplerContext, VmCounters, VmStats};
use crate::error::{AppError, Result};
use crate::hub::{ServerMessage, Subject};
use crate::settings::MetricsSettings;
use crate::store::Store;

/// Turns successive VM counter readings into smoothed rates.
pub(crate) struct VmTracker {
    prev: Option<(Instant, VmCounters)>,
    cpu: Ema,
    disk_read: Ema,
    disk_write: Ema,
    net_rx: Ema,
    net_tx: Ema,
}

impl VmTracker {
    pub(crate) fn new(settings: &MetricsSettings) -> Self {
        Self {
            prev: None,
            cpu: Ema::new(settings.cpu_smooth_alpha),
            disk_read: Ema::new(settings.disk_smooth_alpha),
            disk_write: Ema::new(settings.disk_smooth_alpha),
            net_rx: Ema::new(settings.net_smooth_alpha),
            net_tx: Ema::new(settings.net_smooth_alpha),
        }
    }

    fn apply(&mut self, settings: &MetricsSettings) {
        self.cpu.set_alpha(settings.cpu_smooth_alpha);
        self.disk_read.set_alpha(settings.disk_smooth_alpha);
        self.disk_write.set_alpha(settings.disk_smooth_alpha);
        self.net_rx.set_alpha(settings.net_smooth_alpha);
        self.net_tx.set_alpha(settings.net_smooth_alpha);
    }

    fn reset(&mut self) {
        for ema in [
            &mut self.cpu,
            &mut self.disk_read,
            &mut self.disk_write,
            &mut self.net_rx,
            &mut self.net_tx,
        ] {
            ema.reset();
        }
    }

    /// Record a reading. Returns nothing for the first reading and after a
    /// counter reset; both only seed the next delta.
    pub(crate) fn observe(
        &mut self,
        vm_uuid: &str,
        counters: VmCounters,
        at: Instant,
        settings: &MetricsSettings,
    ) -> Option<VmStats> {
        self.apply(settings);
        let (prev_at, prev) = self.prev.replace((at, counters.clone()))?;
        let elapsed = at.checked_duration_since(prev_at)?.as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let Some(raw_cpu) = raw_cpu_percent(prev.cpu_time_ns, counters.cpu_time_ns, elapsed * 1e9)
        else {
            debug!(vm = %vm_uuid, "cpu counter reset, reseeding");
            self.reset();
            return None;
        };
        let raw_cpu = self.cpu.update(raw_cpu);

        let units = settings.units;
        let mut disks = Vec::new();
        let (mut read_total, mut write_total) = (0.0, 0.0);
        for (device, now) in &counters.disks {
            let Some((read, write)) = prev.disks.get(device).and_then(|p| block_rates(p, now, elapsed))
            else {
                continue;
            };
            read_total += read;
            write_total += write;
            disks.push(DiskRate {
                device: device.clone(),
                read: scale_disk(read, units.disk),
                write: scale_disk(write, units.disk),
            });
        }

        let mut interfaces = Vec::new();
        let (mut rx_total, mut tx_total) = (0.0, 0.0);
        for (device, now) in &counters.interfaces {
            let Some((rx, tx)) = prev.interfaces.get(device).and_then(|p| iface_rates(p, now, elapsed))
            else {
                continue;
            };
            rx_total += rx;
            tx_total += tx;
            interfaces.push(NetRate {
                device: device.clone(),
                rx: scale_net(rx, units.network),
                tx: scale_net(tx, units.network),
            });
        }

        Some(VmStats {
            vm_uuid: vm_uuid.to_string(),
            host_id: counters.host_id.clone(),
            domain_uuid: counters.domain_uuid.clone(),
            name: counters.name.clone(),
            state: counters.state,
            vcpus: counters.vcpus,
            host_cpus: counters.host_cpus,
            cpu_percent: guest_percent(raw_cpu, counters.vcpus),
            cpu_display_percent: display_percent(
                settings.cpu_display_default,
                raw_cpu,
                counters.vcpus,
                counters.host_cpus,
            ),
            cpu_raw_percent: raw_cpu.max(0.0),
            display_mode: settings.cpu_display_default,
            memory_kib: counters.memory_kib,
            max_mem_kib: counters.max_mem_kib,
            disk_read: scale_disk(self.disk_read.update(read_total), units.disk),
            disk_write: scale_disk(self.disk_write.update(write_total), units.disk),
            disk_unit: units.disk,
            net_rx: scale_net(self.net_rx.update(rx_total), units.network),
            net_tx: scale_net(self.net_tx.update(tx_total), units.network),
            net_unit: units.network,
            disks,
            interfaces,
            timestamp: Utc::now(),
        })
    }
}

fn block_rates(prev: &BlockStats, now: &BlockStats, elapsed: f64) -> Option<(f64, f64)> {
    Some((
        rate(prev.rd_bytes, now.rd_bytes, elapsed)?,
        rate(prev.wr_bytes, now.wr_bytes, elapsed)?,
    ))
}

fn iface_rates(prev: &IfaceStats, now: &IfaceStats, elapsed: f64) -> Option<(f64, f64)> {
    Some((
        rate(prev.rx_bytes, now.rx_bytes, elapsed)?,
        rate(prev.tx_bytes, now.tx_bytes, elapsed)?,
    ))
}

/// Host CPU and memory from successive node readings.
pub(crate) struct HostTracker {
    prev: Option<NodeCpuStats>,
    cpu: Ema,
}

impl HostTracker {
    pub(crate) fn new(settings: &MetricsSettings) -> Self {
        Self {
            prev: None,
            cpu: Ema::new(settings.cpu_smooth_alpha),
        }
    }

    pub(crate) fn observe(
        &mut self,
        counters: HostCounters,
        settings: &MetricsSettings,
    ) -> Option<HostStats> {
        self.cpu.set_alpha(settings.cpu_smooth_alpha);
        let prev = self.prev.replace(counters.cpu.clone())?;

        let total_prev = prev.total_ns();
        let total_now = counters.cpu.total_ns();
        let busy_prev = prev.busy_ns();
        let busy_now = counters.cpu.busy_ns();
        if total_now <= total_prev || busy_now < busy_prev {
            debug!(host_id = %counters.host_id, "host cpu counters did not advance, reseeding");
            self.cpu.reset();
            return None;
        }
        let raw = (busy_now - busy_prev) as f64 / (total_now - total_prev) as f64 * 100.0;
        let cpu_percent = self.cpu.update(raw.clamp(0.0, 100.0));

        let total = counters.memory.total_kib;
        let used = counters.memory.used_kib();
        let memory_percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };

        Some(HostStats {
            host_id: counters.host_id.clone(),
            cpu_model: counters.node.cpu_model.clone(),
            cpus: counters.node.cpus,
            cpu_percent,
            memory_total_kib: total,
            memory_used_kib: used,
            memory_percent,
            timestamp: Utc::now(),
        })
    }
}

enum Tracker {
    Host(HostTracker),
    Vm(VmTracker),
}

/// The domain behind a `vm:<id>` subject.
#[derive(Debug, PartialEq)]
pub(crate) struct VmTarget {
    pub host_id: String,
    pub domain_uuid: String,
    /// Canonical uuid once imported; a discovered domain reports its own uuid.
    pub vm_uuid: String,
}

/// Resolve a canonical VM uuid, the domain uuid of an imported VM, or a
/// discovered domain.
pub(crate) async fn resolve_vm(store: &Store, id: &str) -> Result<VmTarget> {
    let vm = match store.get_vm(id).await? {
        Some(vm) => Some(vm),
        None => store.get_vm_by_domain_uuid(id).await?,
    };
    if let Some(vm) = vm {
        return Ok(VmTarget {
            host_id: vm.host_id,
            domain_uuid: vm.domain_uuid,
            vm_uuid: vm.uuid,
        });
    }
    if let Some(found) = store.find_discovered(id).await? {
        return Ok(VmTarget {
            host_id: found.host_id,
            vm_uuid: found.domain_uuid.clone(),
            domain_uuid: found.domain_uuid,
        });
    }
    Err(AppError::VmNotFound(id.to_string()))
}

async fn tick(
    ctx: &SamplerContext,
    subject: &Subject,
    tracker: &mut Tracker,
    settings: &MetricsSettings,
) -> Result<Option<ServerMessage>> {
    match (subject, tracker) {
        (Subject::Host(host_id), Tracker::Host(tracker)) => {
            let counters = super::read_host(&ctx.pool, host_id).await?;
            Ok(tracker
                .observe(counters, settings)
                .map(ServerMessage::HostStats))
        }
        (Subject::Vm(id), Tracker::Vm(tracker)) => {
            let target = resolve_vm(&ctx.store, id).await?;
            let counters = super::read_vm(&ctx.pool, &target.host_id, &target.domain_uuid).await?;
            Ok(tracker
                .observe(&target.vm_uuid, counters, Instant::now(), settings)
                .map(ServerMessage::VmStats))
        }
        _ => Err(AppError::Internal(format!(
            "tracker does not match subject {}",
            subject
        ))),
    }
}

fn period(subject: &Subject, settings: &MetricsSettings) -> Duration {
    match subject {
        Subject::Host(_) => settings.host_interval(),
        Subject::Vm(_) => settings.vm_interval(),
    }
}

/// Ticker whose first tick lands `delay` from now. Late ticks push the
/// schedule back instead of bursting.
fn ticker(delay: Duration, period: Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + delay, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Sample `subject` until cancelled or until too many consecutive ticks fail.
/// Returns `true` when it gave up.
pub(crate) async fn run(ctx: &SamplerContext, subject: &Subject, token: CancellationToken) -> bool {
    let initial = ctx.settings.metrics().await.unwrap_or_default();
    let mut tracker = match subject {
        Subject::Host(_) => Tracker::Host(HostTracker::new(&initial)),
        Subject::Vm(_) => Tracker::Vm(VmTracker::new(&initial)),
    };
    let mut failures = 0u32;
    let mut current = period(subject, &initial);
    let mut interval = ticker(Duration::ZERO, current);
    debug!(subject = %subject, "sampler started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let settings = match ctx.settings.metrics().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "failed to read metrics settings, using defaults");
                MetricsSettings::default()
            }
        };

        match tick(ctx, subject, &mut tracker, &settings).await {
            Ok(message) => {
                failures = 0;
                if let Some(message) = message
                    && !token.is_cancelled()
                {
                    ctx.hub.publish(subject.clone(), message).await;
                }
            }
            Err(e) => {
                failures += 1;
                debug!(subject = %subject, failures, error = %e, "sample skipped");
                if failures >= ctx.failure_limit {
                    let (code, _, message) = e.classify();
                    warn!(subject = %subject, failures, error = %e, "sampler giving up");
                    ctx.hub
                        .publish(
                            subject.clone(),
                            ServerMessage::Error {
                                subject: Some(subject.clone()),
                                code,
                                message,
                            },
                        )
                        .await;
                    return true;
                }
            }
        }

        let next = period(subject, &settings);
        if next != current {
            debug!(subject = %subject, interval_ms = next.as_millis() as u64, "sampling interval changed");
            current = next;
            interval = ticker(current, current);
        }
    }

    debug!(subject = %subject, "sampler stopped");
    false
}
