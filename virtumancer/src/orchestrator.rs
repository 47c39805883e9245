//! Lifecycle tasks on canonical VMs.
//!
//! Every verb runs in the same envelope: take the VM's lock, refuse when a task
//! is already running or the stable state does not allow the verb, record the
//! task, call the hypervisor, then poll until the domain reaches the verb's
//! terminal state. Polling continues on a spawned task, so callers get the VM
//! back with its task label right away. The lock covers admission and the
//! final write only; in between, the recorded task label turns other verbs
//! away with VM_BUSY.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use virtumancer_hv::DomainState;
use virtumancer_hv::domain_xml;

use crate::drift::{DriftDetector, fetch_live};
use crate::error::{AppError, ErrorCode, Result};
use crate::events::{Event, EventBus};
use crate::locks::KeyedLocks;
use crate::model::{SyncStatus, TaskState, VirtualMachine, VmState};
use crate::pool::{ConnectionPool, HostState};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    Shutdown,
    Reboot,
    ForceOff,
    ForceReset,
    Suspend,
    Resume,
    Rebuild,
}

impl Verb {
    pub fn task(self) -> TaskState {
        match self {
            Verb::Start => TaskState::Starting,
            Verb::Shutdown => TaskState::Stopping,
            Verb::Reboot | Verb::ForceReset => TaskState::Rebooting,
            Verb::ForceOff => TaskState::PoweringOff,
            Verb::Suspend => TaskState::Pausing,
            Verb::Resume => TaskState::Unpausing,
            Verb::Rebuild => TaskState::Rebuilding,
        }
    }

    /// Whether the verb may start from stable state `state`.
    pub fn allowed(self, state: VmState) -> bool {
        use VmState::*;
        match self {
            Verb::Start => matches!(state, Stopped | Initialized | Error),
            Verb::Shutdown => matches!(state, Active | Paused),
            Verb::Reboot => matches!(state, Active),
            Verb::ForceOff => matches!(state, Active | Paused | Suspended | Error),
            Verb::ForceReset => matches!(state, Active | Paused),
            Verb::Suspend => matches!(state, Active),
            Verb::Resume => matches!(state, Paused),
            Verb::Rebuild => true,
        }
    }

    fn reached(self, live: DomainState) -> bool {
        match self {
            Verb::Start | Verb::Reboot | Verb::ForceReset | Verb::Resume => {
                live == DomainState::Running
            }
            Verb::Shutdown => matches!(live, DomainState::Shutoff | DomainState::Shutdown),
            Verb::ForceOff => live == DomainState::Shutoff,
            Verb::Suspend => live == DomainState::Paused,
            Verb::Rebuild => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Shutdown => "shutdown",
            Verb::Reboot => "reboot",
            Verb::ForceOff => "forceoff",
            Verb::ForceReset => "forcereset",
            Verb::Suspend => "suspend",
            Verb::Resume => "resume",
            Verb::Rebuild => "rebuild",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long each verb may take to reach its terminal state.
#[derive(Debug, Clone, Copy)]
pub struct VerbTimeouts {
    pub start: Duration,
    pub shutdown: Duration,
    pub reboot: Duration,
    pub force_off: Duration,
    pub force_reset: Duration,
    pub suspend: Duration,
    pub resume: Duration,
    pub rebuild: Duration,
}

impl Default for VerbTimeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(60),
            shutdown: Duration::from_secs(120),
            reboot: Duration::from_secs(180),
            force_off: Duration::from_secs(15),
            force_reset: Duration::from_secs(15),
            suspend: Duration::from_secs(15),
            resume: Duration::from_secs(15),
            rebuild: Duration::from_secs(180),
        }
    }
}

impl VerbTimeouts {
    pub fn of(&self, verb: Verb) -> Duration {
        match verb {
            Verb::Start => self.start,
            Verb::Shutdown => self.shutdown,
            Verb::Reboot => self.reboot,
            Verb::ForceOff => self.force_off,
            Verb::ForceReset => self.force_reset,
            Verb::Suspend => self.suspend,
            Verb::Resume => self.resume,
            Verb::Rebuild => self.rebuild,
        }
    }
}

/// A lifecycle task that was admitted.
pub struct TaskHandle {
    /// The VM as committed when the task started.
    pub vm: VirtualMachine,
    done: Option<JoinHandle<Result<VirtualMachine>>>,
}

impl TaskHandle {
    fn completed(vm: VirtualMachine) -> Self {
        Self { vm, done: None }
    }

    /// Wait for the task to resolve.
    pub async fn wait(self) -> Result<VirtualMachine> {
        match self.done {
            None => Ok(self.vm),
            Some(done) => done
                .await
                .map_err(|e| AppError::Internal(format!("task panicked: {}", e)))?,
        }
    }
}

enum PollOutcome {
    Reached(DomainState),
    TimedOut(Option<DomainState>),
    Cancelled,
}

pub struct Orchestrator {
    pool: Arc<ConnectionPool>,
    store: Store,
    events: EventBus,
    drift: Arc<DriftDetector>,
    locks: Arc<KeyedLocks>,
    timeouts: VerbTimeouts,
    poll_interval: Duration,
    token: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<ConnectionPool>,
        store: Store,
        events: EventBus,
        drift: Arc<DriftDetector>,
        locks: Arc<KeyedLocks>,
        timeouts: VerbTimeouts,
        poll_interval: Duration,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            store,
            events,
            drift,
            locks,
            timeouts,
            poll_interval,
            token,
        })
    }

    /// Admit `verb` on VM `name` of `host_id`.
    pub async fn run(self: &Arc<Self>, host_id: &str, name: &str, verb: Verb) -> Result<TaskHandle> {
        let vm = self.lookup(host_id, name).await?;
        let guard = self.locks.lock(&vm.uuid).await;
        let vm = self.reload(&vm.uuid).await?;

        if let Some(task) = vm.task_state {
            return Err(AppError::VmBusy(format!("{} ({})", vm.name, task)));
        }
        if !verb.allowed(vm.state) {
            return Err(AppError::VmState(format!(
                "cannot {} vm {} while it is {}",
                verb, vm.name, vm.state
            )));
        }
        if self.pool.state(host_id) != Some(HostState::Connected) {
            return Err(AppError::HostDisconnected(host_id.to_string()));
        }

        self.store.update_task_state(&vm.uuid, Some(verb.task())).await?;
        let vm = self.reload(&vm.uuid).await?;
        let _ = self.events.send(Event::VmChanged(vm.clone()));
        info!(vm = %vm.name, host_id = %host_id, verb = %verb, "task started");

        if verb != Verb::Rebuild
            && let Err(e) = self.invoke(host_id, &vm.domain_uuid, verb).await
        {
            warn!(vm = %vm.name, host_id = %host_id, verb = %verb, error = %e, "hypervisor rejected task");
            self.clear_task(&vm).await;
            return Err(e);
        }
        // From here the recorded task keeps other verbs out.
        drop(guard);

        let this = Arc::clone(self);
        let task_vm = vm.clone();
        let done = tokio::spawn(async move {
            if verb == Verb::Rebuild {
                this.rebuild(task_vm).await
            } else {
                this.await_terminal(task_vm, verb).await
            }
        });
        Ok(TaskHandle {
            vm,
            done: Some(done),
        })
    }

    /// Drive the VM towards a stable state: ACTIVE, STOPPED or PAUSED.
    pub async fn set_desired_state(
        self: &Arc<Self>,
        host_id: &str,
        name: &str,
        desired: VmState,
    ) -> Result<TaskHandle> {
        let vm = self.lookup(host_id, name).await?;
        if vm.state == desired && vm.task_state.is_none() {
            return Ok(TaskHandle::completed(vm));
        }
        let verb = match desired {
            VmState::Active if vm.state == VmState::Paused => Verb::Resume,
            VmState::Active => Verb::Start,
            VmState::Stopped => Verb::Shutdown,
            VmState::Paused => Verb::Suspend,
            other => {
                return Err(AppError::Validation(format!(
                    "state {} cannot be requested",
                    other
                )));
            }
        };
        self.run(host_id, name, verb).await
    }

    /// Accept the live hardware definition as canonical.
    pub async fn sync_from_live(&self, host_id: &str, name: &str) -> Result<VirtualMachine> {
        let vm = self.lookup(host_id, name).await?;
        let _guard = self.locks.lock(&vm.uuid).await;
        let vm = self.reload(&vm.uuid).await?;
        if let Some(task) = vm.task_state {
            return Err(AppError::VmBusy(format!("{} ({})", vm.name, task)));
        }
        self.drift.sync_from_live(&vm).await
    }

    pub async fn lookup(&self, host_id: &str, name: &str) -> Result<VirtualMachine> {
        if !self.pool.contains(host_id) {
            return Err(AppError::HostNotFound(host_id.to_string()));
        }
        self.store
            .get_vm_by_name(host_id, name)
            .await?
            .ok_or_else(|| AppError::VmNotFound(name.to_string()))
    }

    async fn reload(&self, uuid: &str) -> Result<VirtualMachine> {
        self.store
            .get_vm(uuid)
            .await?
            .ok_or_else(|| AppError::VmNotFound(uuid.to_string()))
    }

    async fn invoke(&self, host_id: &str, domain_uuid: &str, verb: Verb) -> Result<()> {
        let domain = domain_uuid.to_string();
        self.pool
            .with_connection(host_id, move |conn| {
                let dom = conn.get_domain(&domain)?;
                match verb {
                    Verb::Start => conn.start(&dom),
                    Verb::Shutdown => conn.shutdown(&dom),
                    Verb::Reboot => conn.reboot(&dom),
                    Verb::ForceOff => conn.destroy(&dom),
                    Verb::ForceReset => conn.reset(&dom),
                    Verb::Suspend => conn.suspend(&dom),
                    Verb::Resume => conn.resume(&dom),
                    Verb::Rebuild => Ok(()),
                }
            })
            .await?;
        Ok(())
    }

    async fn poll_until(
        &self,
        host_id: &str,
        domain_uuid: &str,
        timeout: Duration,
        done: impl Fn(DomainState) -> bool,
    ) -> PollOutcome {
        let deadline = Instant::now() + timeout;
        let mut last = None;
        loop {
            let domain = domain_uuid.to_string();
            match self
                .pool
                .with_connection(host_id, move |conn| {
                    let dom = conn.get_domain(&domain)?;
                    conn.get_state(&dom)
                })
                .await
            {
                Ok(state) => {
                    last = Some(state);
                    if done(state) {
                        return PollOutcome::Reached(state);
                    }
                }
                Err(e) => debug!(host_id = %host_id, domain = %domain_uuid, error = %e, "state poll failed"),
            }

            if Instant::now() >= deadline {
                return PollOutcome::TimedOut(last);
            }
            tokio::select! {
                _ = self.token.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn await_terminal(&self, vm: VirtualMachine, verb: Verb) -> Result<VirtualMachine> {
        let outcome = self
            .poll_until(&vm.host_id, &vm.domain_uuid, self.timeouts.of(verb), |s| {
                verb.reached(s)
            })
            .await;

        let _guard = self.locks.lock(&vm.uuid).await;
        match outcome {
            PollOutcome::Reached(live) => {
                let state = VmState::from_live(live, vm.state);
                self.store.update_stable_state(&vm.uuid, state).await?;
                self.store.update_task_state(&vm.uuid, None).await?;
                let vm = self.reload(&vm.uuid).await?;
                info!(vm = %vm.name, host_id = %vm.host_id, verb = %verb, state = %vm.state, "task finished");
                let _ = self.events.send(Event::VmChanged(vm.clone()));
                Ok(vm)
            }
            PollOutcome::TimedOut(last) => {
                let message = format!(
                    "{} of vm {} did not finish within {}s",
                    verb,
                    vm.name,
                    self.timeouts.of(verb).as_secs_f64()
                );
                if let Some(live) = last {
                    self.store
                        .update_stable_state(&vm.uuid, VmState::from_live(live, vm.state))
                        .await?;
                }
                self.fail_task(&vm, ErrorCode::Timeout, &message).await;
                Err(AppError::Timeout(message))
            }
            PollOutcome::Cancelled => {
                self.clear_task(&vm).await;
                Err(AppError::Unavailable("shutting down".to_string()))
            }
        }
    }

    async fn rebuild(&self, vm: VirtualMachine) -> Result<VirtualMachine> {
        let result = match tokio::time::timeout(self.timeouts.rebuild, self.rebuild_domain(&vm)).await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "rebuild of vm {} did not finish within {}s",
                vm.name,
                self.timeouts.rebuild.as_secs_f64()
            ))),
        };

        let _guard = self.locks.lock(&vm.uuid).await;
        match result {
            Ok(state) => {
                self.store.update_stable_state(&vm.uuid, state).await?;
                self.store.update_task_state(&vm.uuid, None).await?;
                let vm = self.reload(&vm.uuid).await?;
                info!(vm = %vm.name, host_id = %vm.host_id, state = %vm.state, "vm rebuilt");
                let _ = self.events.send(Event::VmChanged(vm.clone()));
                Ok(vm)
            }
            Err(e) => {
                let (code, _, message) = e.classify();
                warn!(vm = %vm.name, host_id = %vm.host_id, error = %e, "rebuild failed");
                self.fail_task(&vm, code, &message).await;
                Err(e)
            }
        }
    }

    /// Stop, redefine from the canonical spec, restore the previous power state.
    async fn rebuild_domain(&self, vm: &VirtualMachine) -> Result<VmState> {
        let host_id = vm.host_id.as_str();
        let live = fetch_live(&self.pool, host_id, &vm.domain_uuid).await?;
        let previous = live.state;
        let domain_type = domain_xml::domain_type(&live.xml)?;

        if previous.is_active() {
            self.stop_for_rebuild(vm).await?;
        }

        let spec = vm.spec(self.store.canonical_devices(&vm.uuid).await?);
        let xml = domain_xml::render(&spec, &domain_type);
        self.pool
            .with_connection(host_id, move |conn| conn.define_xml(&xml))
            .await?;
        self.store
            .record_drift(&vm.uuid, SyncStatus::Synced, &[], false)
            .await?;
        debug!(vm = %vm.name, host_id = %host_id, "domain redefined");

        let mut last = DomainState::Shutoff;
        if previous.is_active() {
            self.invoke(host_id, &vm.domain_uuid, Verb::Start).await?;
            last = self.expect(vm, Verb::Start).await?;
            if previous == DomainState::Paused {
                self.invoke(host_id, &vm.domain_uuid, Verb::Suspend).await?;
                last = self.expect(vm, Verb::Suspend).await?;
            }
        }
        Ok(VmState::from_live(last, vm.state))
    }

    async fn stop_for_rebuild(&self, vm: &VirtualMachine) -> Result<()> {
        let host_id = vm.host_id.as_str();
        self.invoke(host_id, &vm.domain_uuid, Verb::Shutdown).await?;
        match self
            .poll_until(host_id, &vm.domain_uuid, self.timeouts.shutdown, |s| {
                Verb::Shutdown.reached(s)
            })
            .await
        {
            PollOutcome::Reached(_) => return Ok(()),
            PollOutcome::Cancelled => {
                return Err(AppError::Unavailable("shutting down".to_string()));
            }
            PollOutcome::TimedOut(_) => {
                info!(vm = %vm.name, host_id = %host_id, "graceful shutdown timed out, destroying");
            }
        }
        self.invoke(host_id, &vm.domain_uuid, Verb::ForceOff).await?;
        self.expect(vm, Verb::ForceOff).await?;
        Ok(())
    }

    async fn expect(&self, vm: &VirtualMachine, verb: Verb) -> Result<DomainState> {
        match self
            .poll_until(&vm.host_id, &vm.domain_uuid, self.timeouts.of(verb), |s| {
                verb.reached(s)
            })
            .await
        {
            PollOutcome::Reached(state) => Ok(state),
            PollOutcome::TimedOut(_) => Err(AppError::Timeout(format!(
                "{} of vm {} did not finish",
                verb, vm.name
            ))),
            PollOutcome::Cancelled => Err(AppError::Unavailable("shutting down".to_string())),
        }
    }

    async fn clear_task(&self, vm: &VirtualMachine) {
        if let Err(e) = self.store.update_task_state(&vm.uuid, None).await {
            warn!(vm = %vm.name, error = %e, "failed to clear task state");
            return;
        }
        if let Ok(vm) = self.reload(&vm.uuid).await {
            let _ = self.events.send(Event::VmChanged(vm));
        }
    }

    async fn fail_task(&self, vm: &VirtualMachine, code: ErrorCode, message: &str) {
        self.clear_task(vm).await;
        let vm = self.reload(&vm.uuid).await.unwrap_or_else(|_| vm.clone());
        warn!(vm = %vm.name, host_id = %vm.host_id, code = %code, "{}", message);
        let _ = self.events.send(Event::TaskFailed {
            vm,
            code,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BackoffPolicy;
    use crate::reconciler::Reconciler;
    use crate::store::test_support::temp_store;
    use virtumancer_hv::TestDriver;
    use virtumancer_hv::test_driver::{DEFAULT_URI, TestHost};

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        store: Store,
        host: Arc<TestHost>,
        events: EventBus,
        _dir: tempfile::TempDir,
    }

    fn short_timeouts() -> VerbTimeouts {
        let t = Duration::from_millis(300);
        VerbTimeouts {
            start: t,
            shutdown: t,
            reboot: t,
            force_off: t,
            force_reset: t,
            suspend: t,
            resume: t,
            rebuild: Duration::from_secs(5),
        }
    }

    async fn fixture(initial: DomainState) -> Fixture {
        let (store, dir) = temp_store().await;
        let driver = Arc::new(TestDriver::new());
        let host = driver.host(DEFAULT_URI).unwrap();
        host.set_domain_state("test", initial);

        let events = crate::events::bus();
        let token = CancellationToken::new();
        let pool = ConnectionPool::new(
            driver.clone(),
            store.clone(),
            events.clone(),
            BackoffPolicy::default(),
            token.clone(),
        );
        pool.add_host("h1", DEFAULT_URI).await.unwrap();
        let drift = Arc::new(DriftDetector::new(
            Arc::clone(&pool),
            store.clone(),
            events.clone(),
        ));
        let locks = Arc::new(KeyedLocks::new());
        let reconciler = Reconciler::new(
            Arc::clone(&pool),
            store.clone(),
            events.clone(),
            Arc::clone(&drift),
            Arc::clone(&locks),
            Duration::from_secs(15),
        );
        reconciler.import_vm("h1", "test").await.unwrap();

        let orchestrator = Orchestrator::new(
            pool,
            store.clone(),
            events.clone(),
            drift,
            locks,
            short_timeouts(),
            Duration::from_millis(20),
            token,
        );
        Fixture {
            orchestrator,
            store,
            host,
            events,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_start_stopped_vm() {
        let f = fixture(DomainState::Shutoff).await;
        let mut rx = f.events.subscribe();

        let handle = f.orchestrator.run("h1", "test", Verb::Start).await.unwrap();
        assert_eq!(handle.vm.task_state, Some(TaskState::Starting));
        assert_eq!(handle.vm.state, VmState::Stopped);

        let vm = handle.wait().await.unwrap();
        assert_eq!(vm.state, VmState::Active);
        assert_eq!(vm.task_state, None);
        assert_eq!(f.host.domain_state("test"), Some(DomainState::Running));

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::VmChanged(vm) = event {
                seen.push((vm.state, vm.task_state));
            }
        }
        assert_eq!(seen.first(), Some(&(VmState::Stopped, Some(TaskState::Starting))));
        assert_eq!(seen.last(), Some(&(VmState::Active, None)));
    }

    #[tokio::test]
    async fn test_precondition_failure_changes_nothing() {
        let f = fixture(DomainState::Shutoff).await;
        let before = f.orchestrator.lookup("h1", "test").await.unwrap();

        let err = f
            .orchestrator
            .run("h1", "test", Verb::Shutdown)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::VmStateError);

        let after = f.orchestrator.lookup("h1", "test").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_busy_vm_rejects_second_task() {
        let f = fixture(DomainState::Running).await;
        let vm = f.orchestrator.lookup("h1", "test").await.unwrap();
        f.store
            .update_task_state(&vm.uuid, Some(TaskState::Rebooting))
            .await
            .unwrap();

        let err = f
            .orchestrator
            .run("h1", "test", Verb::ForceOff)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::VmBusy);
    }

    #[tokio::test]
    async fn test_in_flight_task_rejects_second_verb_immediately() {
        let f = fixture(DomainState::Running).await;
        f.host.set_ignore_shutdown("test", true);

        let first = f.orchestrator.run("h1", "test", Verb::Shutdown).await.unwrap();
        assert_eq!(first.vm.task_state, Some(TaskState::Stopping));

        let started = Instant::now();
        let err = f
            .orchestrator
            .run("h1", "test", Verb::Reboot)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::VmBusy);
        assert!(started.elapsed() < Duration::from_millis(200));

        let err = f.orchestrator.sync_from_live("h1", "test").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::VmBusy);

        // Once the first task resolves, the VM takes verbs again.
        assert_eq!(first.wait().await.unwrap_err().code(), ErrorCode::Timeout);
        let handle = f.orchestrator.run("h1", "test", Verb::Reboot).await.unwrap();
        assert_eq!(handle.wait().await.unwrap().task_state, None);
    }

    #[tokio::test]
    async fn test_unknown_vm_and_host() {
        let f = fixture(DomainState::Running).await;
        let err = f.orchestrator.run("h1", "nope", Verb::Start).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::VmNotFound);
        let err = f.orchestrator.run("h9", "test", Verb::Start).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::HostNotFound);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_clears_task() {
        let f = fixture(DomainState::Running).await;
        f.host.set_ignore_shutdown("test", true);
        let mut rx = f.events.subscribe();

        let handle = f.orchestrator.run("h1", "test", Verb::Shutdown).await.unwrap();
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);

        let vm = f.orchestrator.lookup("h1", "test").await.unwrap();
        assert_eq!(vm.task_state, None);
        assert_eq!(vm.state, VmState::Active);

        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::TaskFailed { code, .. } = event {
                assert_eq!(code, ErrorCode::Timeout);
                failed = true;
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_hypervisor_error_clears_task() {
        let f = fixture(DomainState::Running).await;
        // Stopped behind our back; the stored state still says ACTIVE.
        f.host.set_domain_state("test", DomainState::Shutoff);

        let err = f
            .orchestrator
            .run("h1", "test", Verb::Suspend)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::VmStateError);
        let vm = f.orchestrator.lookup("h1", "test").await.unwrap();
        assert_eq!(vm.task_state, None);
    }

    #[tokio::test]
    async fn test_desired_state_pause_and_resume() {
        let f = fixture(DomainState::Running).await;

        let vm = f
            .orchestrator
            .set_desired_state("h1", "test", VmState::Paused)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(vm.state, VmState::Paused);

        let handle = f
            .orchestrator
            .set_desired_state("h1", "test", VmState::Active)
            .await
            .unwrap();
        assert_eq!(handle.vm.task_state, Some(TaskState::Unpausing));
        assert_eq!(handle.wait().await.unwrap().state, VmState::Active);

        // Already there.
        let handle = f
            .orchestrator
            .set_desired_state("h1", "test", VmState::Active)
            .await
            .unwrap();
        assert_eq!(handle.vm.task_state, None);

        let err = f
            .orchestrator
            .set_desired_state("h1", "test", VmState::Suspended)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_rebuild_restores_canonical_definition() {
        let f = fixture(DomainState::Running).await;
        let canonical = f.host.domain_spec("test").unwrap();
        f.host.modify_domain("test", |s| s.vcpu_count = 8);

        let vm = f
            .orchestrator
            .run("h1", "test", Verb::Rebuild)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(vm.state, VmState::Active);
        assert_eq!(vm.sync_status, SyncStatus::Synced);
        assert!(!vm.needs_rebuild);
        assert_eq!(f.host.domain_spec("test").unwrap(), canonical);
        assert_eq!(f.host.domain_state("test"), Some(DomainState::Running));
    }

    #[tokio::test]
    async fn test_rebuild_destroys_when_shutdown_ignored() {
        let f = fixture(DomainState::Paused).await;
        f.host.set_ignore_shutdown("test", true);

        let vm = f
            .orchestrator
            .run("h1", "test", Verb::Rebuild)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(vm.state, VmState::Paused);
        assert_eq!(f.host.domain_state("test"), Some(DomainState::Paused));
    }

    #[tokio::test]
    async fn test_sync_from_live() {
        let f = fixture(DomainState::Running).await;
        f.host.modify_domain("test", |s| s.memory_bytes = 1 << 30);
        let vm = f.orchestrator.sync_from_live("h1", "test").await.unwrap();
        assert_eq!(vm.memory_bytes, 1 << 30);
        assert_eq!(vm.sync_status, SyncStatus::Synced);
    }
}
