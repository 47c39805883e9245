use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::orchestrator::VerbTimeouts;
use crate::pool::BackoffPolicy;

#[derive(Debug, Parser)]
#[command(name = "virtumancer")]
#[command(about = "Virtumancer - multi-host virtual machine manager")]
pub struct Args {
    /// Listen address for the HTTP API and WebSocket
    #[arg(short, long, default_value = "0.0.0.0:8888")]
    pub listen: String,

    /// Directory holding virtumancer.db
    #[arg(short, long, default_value = "/var/lib/virtumancer")]
    pub data_dir: PathBuf,

    /// Seconds between discovery passes per connected host
    #[arg(long, default_value_t = 15)]
    pub discovery_interval: u64,

    /// Debug logging for virtumancer
    #[arg(long)]
    pub verbose: bool,

    /// Debug logging for every crate, trace for virtumancer
    #[arg(long)]
    pub debug: bool,
}

impl Args {
    /// Log filter used when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug,virtumancer=trace,virtumancer_hv=trace"
        } else if self.verbose {
            "info,virtumancer=debug,virtumancer_hv=debug"
        } else {
            "info"
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            discovery_interval: Duration::from_secs(self.discovery_interval.max(1)),
            ..ServiceConfig::default()
        }
    }
}

/// Runtime tunables of the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub discovery_interval: Duration,
    pub backoff: BackoffPolicy,
    pub timeouts: VerbTimeouts,
    /// How often lifecycle tasks poll the hypervisor for their terminal state.
    pub poll_interval: Duration,
    /// Consecutive failed ticks before a sampler stops.
    pub sampler_failure_limit: u32,
    /// Outbound WebSocket buffer per client.
    pub client_buffer: usize,
    pub settings_ttl: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(15),
            backoff: BackoffPolicy::default(),
            timeouts: VerbTimeouts::default(),
            poll_interval: Duration::from_millis(500),
            sampler_failure_limit: 5,
            client_buffer: 64,
            settings_ttl: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["virtumancer"]);
        assert_eq!(args.listen, "0.0.0.0:8888");
        assert_eq!(args.data_dir, PathBuf::from("/var/lib/virtumancer"));
        assert_eq!(args.log_filter(), "info");
        assert_eq!(
            args.service_config().discovery_interval,
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_flags() {
        let args = Args::parse_from([
            "virtumancer",
            "-l",
            "127.0.0.1:9000",
            "-d",
            "/tmp/vm",
            "--discovery-interval",
            "3",
            "--verbose",
        ]);
        assert_eq!(args.listen, "127.0.0.1:9000");
        assert_eq!(args.log_filter(), "info,virtumancer=debug,virtumancer_hv=debug");
        assert_eq!(args.service_config().discovery_interval, Duration::from_secs(3));
        assert_eq!(args.service_config().sampler_failure_limit, 5);
    }
}
