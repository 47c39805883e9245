//! Connection pool: one hypervisor connection per registered host, kept alive by
//! a per-host supervisor task.
//!
//! ```text
//! DISCONNECTED ──connect──► CONNECTING ──ok──► CONNECTED
//!      ▲                        │                  │
//!      │                        └──fail──► ERRORED │
//!      └─────────────disconnect──────────┴─────────┘
//! ```
//!
//! Callers never hold a connection. [`ConnectionPool::with_connection`] runs a
//! closure on the blocking pool while holding the host's connection mutex.

mod backoff;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use virtumancer_hv::{Connection, DomainEvent, Driver, HvError, HvErrorKind};

use crate::events::{Event, EventBus};
use crate::model::HostRecord;
use crate::store::{Store, StoreError};

pub use backoff::{Backoff, BackoffPolicy};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("host {0} not found")]
    HostNotFound(String),

    #[error("host {0} is not connected")]
    Disconnected(String),

    #[error(transparent)]
    Hypervisor(#[from] HvError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for PoolError {
    fn from(e: tokio::task::JoinError) -> Self {
        PoolError::Join(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

/// Transient label while a host transition is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostTask {
    Connecting,
    Disconnecting,
}

#[derive(Debug, Clone)]
struct HostStatus {
    state: HostState,
    task_state: Option<HostTask>,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
}

/// Host as reported to API clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostView {
    pub id: String,
    pub uri: String,
    pub state: HostState,
    pub task_state: Option<HostTask>,
    pub auto_reconnect_disabled: bool,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

type ConnSlot = Arc<AsyncMutex<Option<Box<dyn Connection>>>>;

struct HostEntry {
    id: String,
    uri: RwLock<String>,
    status: RwLock<HostStatus>,
    /// Serializes state transitions.
    transition: AsyncMutex<()>,
    conn: ConnSlot,
    backoff: Mutex<Backoff>,
    wake: Notify,
    cancel: CancellationToken,
    auto_reconnect_disabled: AtomicBool,
    bridge: Mutex<Option<CancellationToken>>,
}

impl HostEntry {
    fn status(&self) -> HostStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn state(&self) -> HostState {
        self.status().state
    }

    fn update_status(&self, f: impl FnOnce(&mut HostStatus)) {
        f(&mut self.status.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn uri(&self) -> String {
        self.uri.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn disabled(&self) -> bool {
        self.auto_reconnect_disabled.load(Ordering::SeqCst)
    }

    fn wants_connection(&self) -> bool {
        self.state() != HostState::Connected && !self.disabled()
    }

    fn backoff(&self) -> std::sync::MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_bridge(&self) {
        if let Some(token) = self
            .bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    fn view(&self) -> HostView {
        let status = self.status();
        HostView {
            id: self.id.clone(),
            uri: self.uri(),
            state: status.state,
            task_state: status.task_state,
            auto_reconnect_disabled: self.disabled(),
            last_error: status.last_error,
            connected_at: status.connected_at,
        }
    }
}

pub struct ConnectionPool {
    driver: Arc<dyn Driver>,
    store: Store,
    events: EventBus,
    hosts: RwLock<HashMap<String, Arc<HostEntry>>>,
    policy: BackoffPolicy,
    token: CancellationToken,
}

impl ConnectionPool {
    pub fn new(
        driver: Arc<dyn Driver>,
        store: Store,
        events: EventBus,
        policy: BackoffPolicy,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            store,
            events,
            hosts: RwLock::new(HashMap::new()),
            policy,
            token,
        })
    }

    /// Register persisted hosts and start their supervisors.
    pub fn load(self: &Arc<Self>, records: Vec<HostRecord>) {
        for record in records {
            let entry = self.register(&record);
            self.spawn_supervisor(entry);
        }
    }

    /// Persist a new host, make one connection attempt and hand it to its
    /// supervisor. A failed attempt leaves the host ERRORED, not the call.
    pub async fn add_host(self: &Arc<Self>, id: &str, uri: &str) -> Result<HostView> {
        let record = self.store.create_host(id, uri).await?;
        let entry = self.register(&record);
        if let Err(e) = self.connect(&entry).await {
            warn!(host_id = %id, error = %e, "initial connection failed");
        }
        self.spawn_supervisor(Arc::clone(&entry));
        Ok(entry.view())
    }

    /// Change the URI and/or the auto-reconnect flag. A new URI forces a
    /// reconnect.
    pub async fn update_host(
        &self,
        id: &str,
        uri: Option<&str>,
        auto_reconnect_disabled: Option<bool>,
    ) -> Result<HostView> {
        let entry = self.entry(id)?;

        if let Some(disabled) = auto_reconnect_disabled {
            self.store.set_auto_reconnect_disabled(id, disabled).await?;
            entry.auto_reconnect_disabled.store(disabled, Ordering::SeqCst);
            if !disabled {
                entry.backoff().reset();
                entry.wake.notify_one();
            }
        }

        if let Some(uri) = uri
            && uri != entry.uri()
        {
            self.store.update_host_uri(id, uri).await?;
            *entry.uri.write().unwrap_or_else(PoisonError::into_inner) = uri.to_string();
            info!(host_id = %id, uri = %uri, "host uri changed");
            self.close(&entry).await;
            entry.backoff().reset();
            if !entry.disabled()
                && let Err(e) = self.connect(&entry).await
            {
                warn!(host_id = %id, error = %e, "reconnect after uri change failed");
            }
        }

        Ok(entry.view())
    }

    pub async fn remove_host(&self, id: &str) -> Result<()> {
        let entry = self
            .hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| PoolError::HostNotFound(id.to_string()))?;

        entry.cancel.cancel();
        self.close(&entry).await;
        self.store.delete_host(id).await?;
        info!(host_id = %id, "host removed");
        let _ = self.events.send(Event::HostRemoved {
            host_id: id.to_string(),
        });
        Ok(())
    }

    /// CONNECTED is a no-op; otherwise connect unless auto-reconnect is disabled.
    pub async fn ensure_connected(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.state() == HostState::Connected {
            return Ok(());
        }
        if entry.disabled() {
            return Err(PoolError::Disconnected(id.to_string()));
        }
        self.connect(&entry).await
    }

    /// Clear the auto-reconnect flag, reset backoff and connect.
    pub async fn ensure_connected_forced(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.disabled() {
            self.store.set_auto_reconnect_disabled(id, false).await?;
            entry.auto_reconnect_disabled.store(false, Ordering::SeqCst);
        }
        entry.backoff().reset();
        let result = if entry.state() == HostState::Connected {
            Ok(())
        } else {
            self.connect(&entry).await
        };
        entry.wake.notify_one();
        result
    }

    /// Close the connection. A user-initiated disconnect also disables
    /// auto-reconnect until the next forced connect.
    pub async fn disconnect(&self, id: &str, user_initiated: bool) -> Result<()> {
        let entry = self.entry(id)?;
        if user_initiated {
            self.store.set_auto_reconnect_disabled(id, true).await?;
            entry.auto_reconnect_disabled.store(true, Ordering::SeqCst);
        }
        self.close(&entry).await;
        entry.wake.notify_one();
        Ok(())
    }

    /// Run `f` against the host's connection on the blocking pool.
    ///
    /// A connection-level failure moves a CONNECTED host to ERRORED so the
    /// supervisor takes over.
    pub async fn with_connection<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Connection) -> virtumancer_hv::Result<T> + Send + 'static,
    {
        let entry = self.entry(id)?;
        if entry.state() != HostState::Connected {
            return Err(PoolError::Disconnected(id.to_string()));
        }

        let guard = Arc::clone(&entry.conn).lock_owned().await;
        let result = tokio::task::spawn_blocking(move || match guard.as_deref() {
            Some(conn) => f(conn),
            None => Err(HvError::new(
                HvErrorKind::ConnectionLost,
                "connection is closed",
            )),
        })
        .await?;

        if let Err(e) = &result
            && e.is_connection_failure()
        {
            self.mark_errored(&entry, e).await;
        }
        result.map_err(PoolError::from)
    }

    pub fn status(&self, id: &str) -> Result<HostView> {
        Ok(self.entry(id)?.view())
    }

    pub fn list(&self) -> Vec<HostView> {
        let mut views: Vec<_> = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.view())
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    pub fn contains(&self, id: &str) -> bool {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<HostState> {
        self.entry(id).ok().map(|e| e.state())
    }

    pub fn connected_hosts(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.state() == HostState::Connected)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stop every supervisor and close every connection.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let entries: Vec<_> = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for entry in entries {
            self.close(&entry).await;
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<HostEntry>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| PoolError::HostNotFound(id.to_string()))
    }

    fn register(&self, record: &HostRecord) -> Arc<HostEntry> {
        let entry = Arc::new(HostEntry {
            id: record.id.clone(),
            uri: RwLock::new(record.uri.clone()),
            status: RwLock::new(HostStatus {
                state: HostState::Disconnected,
                task_state: None,
                last_error: None,
                connected_at: None,
            }),
            transition: AsyncMutex::new(()),
            conn: Arc::new(AsyncMutex::new(None)),
            backoff: Mutex::new(Backoff::new(self.policy)),
            wake: Notify::new(),
            cancel: self.token.child_token(),
            auto_reconnect_disabled: AtomicBool::new(record.auto_reconnect_disabled),
            bridge: Mutex::new(None),
        });
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), Arc::clone(&entry));
        entry
    }

    fn emit_state(&self, entry: &HostEntry) {
        let status = entry.status();
        let _ = self.events.send(Event::HostChanged {
            host_id: entry.id.clone(),
            state: status.state,
            error: status.last_error,
        });
    }

    async fn connect(&self, entry: &Arc<HostEntry>) -> Result<()> {
        let _transition = entry.transition.lock().await;
        if entry.state() == HostState::Connected {
            return Ok(());
        }
        if entry.disabled() {
            return Err(PoolError::Disconnected(entry.id.clone()));
        }

        entry.update_status(|s| {
            s.state = HostState::Connecting;
            s.task_state = Some(HostTask::Connecting);
        });
        self.emit_state(entry);

        // Drop whatever is left of a broken connection first.
        let stale = entry.conn.lock().await.take();
        if let Some(stale) = stale {
            close_connection(&entry.id, stale).await;
        }

        let uri = entry.uri();
        let driver = Arc::clone(&self.driver);
        let opened = tokio::task::spawn_blocking(move || {
            let conn = driver.open(&uri)?;
            let events = conn.subscribe_events().ok();
            Ok::<_, HvError>((conn, events))
        })
        .await?;

        match opened {
            Ok((conn, events)) => {
                *entry.conn.lock().await = Some(conn);
                entry.backoff().reset();
                entry.update_status(|s| {
                    s.state = HostState::Connected;
                    s.task_state = None;
                    s.last_error = None;
                    s.connected_at = Some(Utc::now());
                });
                if let Some(events) = events {
                    self.spawn_event_bridge(entry, events);
                }
                info!(host_id = %entry.id, uri = %entry.uri(), "host connected");
                self.emit_state(entry);
                Ok(())
            }
            Err(e) => {
                entry.update_status(|s| {
                    s.state = HostState::Errored;
                    s.task_state = None;
                    s.last_error = Some(e.message.clone());
                });
                warn!(host_id = %entry.id, error = %e, "host connection failed");
                self.emit_state(entry);
                Err(e.into())
            }
        }
    }

    async fn close(&self, entry: &HostEntry) {
        let _transition = entry.transition.lock().await;
        entry.update_status(|s| s.task_state = Some(HostTask::Disconnecting));
        entry.stop_bridge();

        let conn = entry.conn.lock().await.take();
        if let Some(conn) = conn {
            close_connection(&entry.id, conn).await;
        }

        let was = entry.state();
        entry.update_status(|s| {
            s.state = HostState::Disconnected;
            s.task_state = None;
            s.connected_at = None;
        });
        if was != HostState::Disconnected {
            info!(host_id = %entry.id, "host disconnected");
        }
        self.emit_state(entry);
    }

    async fn mark_errored(&self, entry: &HostEntry, error: &HvError) {
        let _transition = entry.transition.lock().await;
        if entry.state() != HostState::Connected {
            return;
        }
        entry.stop_bridge();
        entry.update_status(|s| {
            s.state = HostState::Errored;
            s.last_error = Some(error.message.clone());
            s.connected_at = None;
        });
        warn!(host_id = %entry.id, error = %error, "host connection lost");
        self.emit_state(entry);
        entry.wake.notify_one();
    }

    fn spawn_event_bridge(&self, entry: &HostEntry, mut rx: broadcast::Receiver<DomainEvent>) {
        let token = entry.cancel.child_token();
        if let Some(old) = entry
            .bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone())
        {
            old.cancel();
        }

        let host_id = entry.id.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) => {
                        debug!(host_id = %host_id, domain = %event.domain_uuid, kind = ?event.kind, "domain event");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(host_id = %host_id, skipped = n, "domain events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let _ = events.send(Event::DomainsChanged {
                    host_id: host_id.clone(),
                });
            }
        });
    }

    fn spawn_supervisor(self: &Arc<Self>, entry: Arc<HostEntry>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            debug!(host_id = %entry.id, "supervisor started");
            loop {
                if entry.cancel.is_cancelled() {
                    break;
                }
                if !entry.wants_connection() {
                    tokio::select! {
                        _ = entry.cancel.cancelled() => break,
                        _ = entry.wake.notified() => continue,
                    }
                }

                if entry.state() == HostState::Errored {
                    let delay = entry.backoff().next_delay();
                    debug!(host_id = %entry.id, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                    tokio::select! {
                        _ = entry.cancel.cancelled() => break,
                        _ = entry.wake.notified() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if !entry.wants_connection() {
                        continue;
                    }
                }

                if let Err(e) = pool.connect(&entry).await {
                    debug!(host_id = %entry.id, error = %e, "reconnect attempt failed");
                }
            }
            debug!(host_id = %entry.id, "supervisor stopped");
        });
    }
}

async fn close_connection(host_id: &str, mut conn: Box<dyn Connection>) {
    match tokio::task::spawn_blocking(move || conn.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(host_id = %host_id, error = %e, "error closing connection"),
        Err(e) => warn!(host_id = %host_id, error = %e, "close task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use std::time::Duration;
    use virtumancer_hv::TestDriver;
    use virtumancer_hv::test_driver::DEFAULT_URI;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(10),
            factor: 2.0,
            max: Duration::from_millis(50),
            jitter: 0.0,
        }
    }

    async fn setup() -> (Arc<ConnectionPool>, Arc<TestDriver>, Store, tempfile::TempDir) {
        let (store, dir) = temp_store().await;
        let driver = Arc::new(TestDriver::new());
        let pool = ConnectionPool::new(
            driver.clone(),
            store.clone(),
            crate::events::bus(),
            fast_policy(),
            CancellationToken::new(),
        );
        (pool, driver, store, dir)
    }

    async fn wait_for(pool: &ConnectionPool, id: &str, state: HostState) {
        for _ in 0..200 {
            if pool.state(id) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("host {} never reached {:?}, now {:?}", id, state, pool.state(id));
    }

    #[tokio::test]
    async fn test_add_host_connects() {
        let (pool, _driver, _store, _dir) = setup().await;
        let view = pool.add_host("h1", DEFAULT_URI).await.unwrap();
        assert_eq!(view.state, HostState::Connected);
        assert!(view.connected_at.is_some());

        // Idempotent.
        pool.ensure_connected("h1").await.unwrap();
        pool.ensure_connected("h1").await.unwrap();

        let domains = pool
            .with_connection("h1", |c| c.list_domains())
            .await
            .unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(pool.connected_hosts(), vec!["h1".to_string()]);

        assert!(matches!(
            pool.add_host("h1", DEFAULT_URI).await,
            Err(PoolError::Store(StoreError::Conflict(_)))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_errored() {
        let (pool, _driver, _store, _dir) = setup().await;
        let view = pool.add_host("h1", "test:///nowhere").await.unwrap();
        assert_eq!(view.state, HostState::Errored);
        assert!(view.last_error.is_some());

        let err = pool.ensure_connected("h1").await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::Hypervisor(HvError {
                kind: HvErrorKind::Unreachable,
                ..
            })
        ));
        assert!(matches!(
            pool.with_connection("h1", |c| c.list_domains()).await,
            Err(PoolError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_user_disconnect_disables_reconnect() {
        let (pool, _driver, store, _dir) = setup().await;
        pool.add_host("h1", DEFAULT_URI).await.unwrap();

        pool.disconnect("h1", true).await.unwrap();
        let view = pool.status("h1").unwrap();
        assert_eq!(view.state, HostState::Disconnected);
        assert!(view.auto_reconnect_disabled);
        assert!(store.get_host("h1").await.unwrap().unwrap().auto_reconnect_disabled);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.state("h1"), Some(HostState::Disconnected));
        assert!(matches!(
            pool.ensure_connected("h1").await,
            Err(PoolError::Disconnected(_))
        ));

        pool.ensure_connected_forced("h1").await.unwrap();
        let view = pool.status("h1").unwrap();
        assert_eq!(view.state, HostState::Connected);
        assert!(!view.auto_reconnect_disabled);
        assert!(!store.get_host("h1").await.unwrap().unwrap().auto_reconnect_disabled);
    }

    #[tokio::test]
    async fn test_supervisor_recovers_lost_connection() {
        let (pool, driver, _store, _dir) = setup().await;
        pool.add_host("h1", DEFAULT_URI).await.unwrap();
        let host = driver.host(DEFAULT_URI).unwrap();

        host.fail_next_opens(2);
        host.drop_connections();
        let err = pool
            .with_connection("h1", |c| c.list_domains())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::Hypervisor(HvError {
                kind: HvErrorKind::ConnectionLost,
                ..
            })
        ));

        wait_for(&pool, "h1", HostState::Connected).await;
        pool.with_connection("h1", |c| c.list_domains())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_user_disconnect_reconnects() {
        let (pool, _driver, _store, _dir) = setup().await;
        pool.add_host("h1", DEFAULT_URI).await.unwrap();
        pool.disconnect("h1", false).await.unwrap();
        wait_for(&pool, "h1", HostState::Connected).await;
    }

    #[tokio::test]
    async fn test_update_and_remove_host() {
        let (pool, _driver, store, _dir) = setup().await;
        pool.add_host("h1", DEFAULT_URI).await.unwrap();

        let view = pool
            .update_host("h1", Some("test:///empty"), None)
            .await
            .unwrap();
        assert_eq!(view.uri, "test:///empty");
        assert_eq!(view.state, HostState::Connected);
        let domains = pool
            .with_connection("h1", |c| c.list_domains())
            .await
            .unwrap();
        assert!(domains.is_empty());

        pool.remove_host("h1").await.unwrap();
        assert!(!pool.contains("h1"));
        assert!(store.get_host("h1").await.unwrap().is_none());
        assert!(matches!(
            pool.remove_host("h1").await,
            Err(PoolError::HostNotFound(_))
        ));
    }
}
