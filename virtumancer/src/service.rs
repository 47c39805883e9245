//! Wires the components together and owns their background tasks.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use virtumancer_hv::Driver;

use crate::config::ServiceConfig;
use crate::drift::DriftDetector;
use crate::error::Result;
use crate::events::{self, Event, EventBus};
use crate::hub::{Hub, HubHandle, ServerMessage, Subject, SubjectListener};
use crate::locks::KeyedLocks;
use crate::orchestrator::Orchestrator;
use crate::pool::{ConnectionPool, HostState};
use crate::reconciler::Reconciler;
use crate::settings::SettingsService;
use crate::store::Store;
use crate::telemetry::Telemetry;

pub struct Service {
    pub store: Store,
    pub events: EventBus,
    pub pool: Arc<ConnectionPool>,
    pub drift: Arc<DriftDetector>,
    pub reconciler: Arc<Reconciler>,
    pub orchestrator: Arc<Orchestrator>,
    pub settings: Arc<SettingsService>,
    pub telemetry: Arc<Telemetry>,
    pub hub: HubHandle,
    token: CancellationToken,
}

impl Service {
    /// Build every component, start the background tasks and bring up the
    /// persisted hosts. Everything stops when `token` is cancelled.
    pub async fn start(
        store: Store,
        driver: Arc<dyn Driver>,
        config: ServiceConfig,
        token: CancellationToken,
    ) -> Result<Arc<Self>> {
        let events = events::bus();
        let pool = ConnectionPool::new(
            driver,
            store.clone(),
            events.clone(),
            config.backoff,
            token.child_token(),
        );
        let drift = Arc::new(DriftDetector::new(
            Arc::clone(&pool),
            store.clone(),
            events.clone(),
        ));
        let locks = Arc::new(KeyedLocks::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&pool),
            store.clone(),
            events.clone(),
            Arc::clone(&drift),
            Arc::clone(&locks),
            config.discovery_interval,
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&pool),
            store.clone(),
            events.clone(),
            Arc::clone(&drift),
            locks,
            config.timeouts,
            config.poll_interval,
            token.child_token(),
        );
        let settings = Arc::new(SettingsService::new(store.clone(), config.settings_ttl));

        let (hub, runner) = Hub::new(config.client_buffer);
        let telemetry = Telemetry::new(
            Arc::clone(&pool),
            store.clone(),
            Arc::clone(&settings),
            hub.clone(),
            config.sampler_failure_limit,
            token.child_token(),
        );
        let listener = Arc::new(Fanout {
            telemetry: Arc::clone(&telemetry),
            reconciler: Arc::clone(&reconciler),
            pool: Arc::clone(&pool),
        });
        tokio::spawn(runner.run(listener, token.child_token()));

        spawn_event_bridge(events.subscribe(), hub.clone(), token.child_token());
        reconciler.spawn(token.child_token());

        let hosts = store.list_hosts().await?;
        info!(hosts = hosts.len(), "loading hosts");
        pool.load(hosts);

        Ok(Arc::new(Self {
            store,
            events,
            pool,
            drift,
            reconciler,
            orchestrator,
            settings,
            telemetry,
            hub,
            token,
        }))
    }

    /// Stop every background task and close all connections.
    pub async fn shutdown(&self) {
        info!("service shutting down");
        self.token.cancel();
        self.pool.shutdown().await;
    }
}

/// Starts samplers for subscribed subjects. A newly watched host also gets
/// an immediate discovery pass.
struct Fanout {
    telemetry: Arc<Telemetry>,
    reconciler: Arc<Reconciler>,
    pool: Arc<ConnectionPool>,
}

impl SubjectListener for Fanout {
    fn subscribed(&self, subject: &Subject) {
        self.telemetry.ensure(subject);
        if let Subject::Host(host_id) = subject
            && self.pool.state(host_id) == Some(HostState::Connected)
        {
            let reconciler = Arc::clone(&self.reconciler);
            let host_id = host_id.clone();
            tokio::spawn(async move {
                if let Err(e) = reconciler.discover(&host_id).await {
                    debug!(host_id = %host_id, error = %e, "discovery on subscribe failed");
                }
            });
        }
    }

    fn last_unsubscribed(&self, subject: &Subject) {
        self.telemetry.stop(subject);
    }
}

/// Forward internal events to every WebSocket client.
fn spawn_event_bridge(
    mut rx: broadcast::Receiver<Event>,
    hub: HubHandle,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = rx.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event bridge lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match event {
                Event::HostChanged {
                    host_id,
                    state,
                    error,
                } => {
                    hub.broadcast(ServerMessage::HostChanged {
                        host_id,
                        state: Some(state),
                        error,
                        removed: false,
                    })
                    .await;
                }
                Event::HostRemoved { host_id } => {
                    hub.broadcast(ServerMessage::HostChanged {
                        host_id,
                        state: None,
                        error: None,
                        removed: true,
                    })
                    .await;
                }
                Event::DomainsChanged { .. } => {}
                Event::DiscoveryChanged { host_id } => {
                    hub.broadcast(ServerMessage::DiscoveryChanged { host_id })
                        .await;
                }
                Event::VmChanged(vm) => {
                    hub.broadcast(ServerMessage::VmsChanged {
                        host_id: vm.host_id.clone(),
                        vm: Some(vm),
                    })
                    .await;
                }
                Event::TaskFailed { vm, code, message } => {
                    hub.broadcast(ServerMessage::Error {
                        subject: Some(Subject::Vm(vm.uuid.clone())),
                        code,
                        message,
                    })
                    .await;
                    hub.broadcast(ServerMessage::VmsChanged {
                        host_id: vm.host_id.clone(),
                        vm: Some(vm),
                    })
                    .await;
                }
            }
        }
        debug!("event bridge stopped");
    });
}
