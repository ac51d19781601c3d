//! # Task: one supervised execution of a job.
//!
//! A [`Task`] runs its job at most once, guarded by a TTL lease in the store:
//!
//! ```text
//! Init ──► pre-flight: watch + look up every parent ──(missing)──► ParentGone (nothing recorded)
//!   │
//! Starting ──► create `running` (TTL) ──(exists)──► IsRunning
//!   │          set `started`, state=run, sync
//!   ▼
//! Running ──► select! {
//!               payload finished    → ok / error (panic → Panicked)
//!               heartbeat lost lease → fail "Run marker deleted|superseded" (keep `running`)
//!               local deadline       → fail "Aborted by timeout"
//!               parent deleted       → fail "Parent <p> gone"
//!               external cancel      → fail "Cancelled", returns Canceled
//!             }
//!   ▼
//! teardown (always): reg.free(), set `stopped`, CAS-delete `running`, sync
//! ```
//!
//! ## Rules
//! - The heartbeat refreshes `running` every `ttl / (refresh + 0.1)` with
//!   compare-and-swap on the version obtained at creation. A missing key or a
//!   version mismatch means someone else tore the lease down.
//! - The local deadline is `ttl` after the last successful refresh was sent
//!   (the first one counts from before the create call). It fires
//!   even while the store is unreachable, so a partitioned holder stops no
//!   later than its lease expires for everybody else.
//! - Transient store errors in the heartbeat are logged and absorbed.
//! - A cancelled payload gets `cancel_grace` to return before it is aborted.
//!   On cancel or parent loss the heartbeat and deadline keep running until
//!   the payload has returned; losing the lease meanwhile aborts it at once.
//! - If the `run` future is dropped early, a guard deletes the lease in the background.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::events::{Bus, Event, EventKind};
use crate::reg::Reg;
use crate::store::{Change, Store, StoreError, StoreRef, Version, Watch, layout};
use crate::tasks::{JobContext, JobRef, RunStatus, TaskVars, VarMap, field, timestamp};

/// Observable phase of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, not started.
    Init,
    /// Acquiring the lease.
    Starting,
    /// Payload running.
    Running,
    /// Payload completed.
    Ok,
    /// Payload returned an error or panicked.
    Error,
    /// Aborted: lease busy or lost, timeout, parent gone, or pre-flight failure.
    Fail,
    /// Cancelled from outside.
    Cancelled,
}

/// One execution of a job under a lease.
pub struct Task {
    path: String,
    taskdef: String,
    job: JobRef,
    parents: Vec<String>,
    data: VarMap,
    vars: watch::Receiver<TaskVars>,
    attempt: u32,
    cancel_grace: Duration,
    store: StoreRef,
    bus: Bus,
    phase: watch::Sender<Phase>,
}

impl Task {
    /// Creates a task for instance `path` running `job` with default vars.
    pub fn new(path: impl Into<String>, job: JobRef, store: StoreRef, bus: Bus) -> Self {
        let (_tx, vars) = watch::channel(TaskVars::default());
        let (phase, _rx) = watch::channel(Phase::Init);
        Self {
            path: path.into(),
            taskdef: String::new(),
            job,
            parents: Vec::new(),
            data: VarMap::new(),
            vars,
            attempt: 1,
            cancel_grace: Duration::from_secs(5),
            store,
            bus,
            phase,
        }
    }

    /// Instance paths that must keep existing.
    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = parents;
        self
    }

    /// Definition path passed to the job.
    pub fn with_taskdef(mut self, taskdef: impl Into<String>) -> Self {
        self.taskdef = taskdef.into();
        self
    }

    /// Job data.
    pub fn with_data(mut self, data: VarMap) -> Self {
        self.data = data;
        self
    }

    /// Fixed vars.
    pub fn with_vars(self, vars: TaskVars) -> Self {
        let (_tx, rx) = watch::channel(vars);
        self.with_live_vars(rx)
    }

    /// Vars that may change while running; read again on every heartbeat.
    pub fn with_live_vars(mut self, vars: watch::Receiver<TaskVars>) -> Self {
        self.vars = vars;
        self
    }

    /// Attempt number reported in events.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Window between cooperative cancellation and abort of the payload.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Subscribes to phase changes.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Runs the execution to its end.
    pub async fn run(self, token: CancellationToken) -> Result<String, TaskError> {
        self.publish(Event::new(EventKind::TaskStarting).with_attempt(self.attempt));

        let parents = match self.preflight().await {
            Ok(p) => p,
            Err(e) => {
                self.phase.send_replace(Phase::Fail);
                self.publish(Event::new(EventKind::TaskFailed).with_reason(e.to_string()));
                return Err(e);
            }
        };

        self.phase.send_replace(Phase::Starting);
        let mut lease = match self.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                self.phase.send_replace(Phase::Fail);
                if matches!(e, TaskError::IsRunning { .. }) {
                    self.publish(Event::new(EventKind::LeaseBusy));
                } else {
                    self.publish(Event::new(EventKind::TaskFailed).with_reason(e.to_string()));
                }
                return Err(e);
            }
        };
        self.publish(Event::new(EventKind::LeaseAcquired));
        info!(path = %self.path, attempt = self.attempt, "task started");

        let reg = Reg::new();
        let res = self.execute(&mut lease, &reg, parents, &token).await;
        self.teardown(&mut lease, &reg).await;
        match &res {
            Ok(_) => info!(path = %self.path, "task ended"),
            Err(e) => info!(path = %self.path, error = %e, "task ended"),
        }
        res
    }

    /// Subscribes to every parent, then checks that each one exists.
    async fn preflight(&self) -> Result<Vec<ParentWatch>, TaskError> {
        let mut watches = Vec::with_capacity(self.parents.len());
        for parent in &self.parents {
            let key = layout::task_key(parent);
            let watch = self.store.watch(&key);
            if self.store.get(&key).await?.is_none() {
                return Err(TaskError::ParentGone {
                    parent: parent.clone(),
                });
            }
            watches.push(ParentWatch {
                parent: parent.clone(),
                key,
                watch,
            });
        }
        Ok(watches)
    }

    async fn acquire(&self) -> Result<Lease, TaskError> {
        let key = layout::state_key(&self.path, field::RUNNING);
        let ttl = self.vars.borrow().lease_ttl();
        let since = Instant::now();
        match self.store.create(&key, json!(timestamp()), Some(ttl)).await {
            Ok(version) => Ok(Lease {
                store: Arc::clone(&self.store),
                key,
                version,
                since,
                keep: false,
                armed: true,
            }),
            Err(StoreError::AlreadyExists { .. }) => Err(TaskError::IsRunning {
                path: self.path.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn execute(
        &self,
        lease: &mut Lease,
        reg: &Reg,
        parents: Vec<ParentWatch>,
        token: &CancellationToken,
    ) -> Result<String, TaskError> {
        let ttl = self.vars.borrow().lease_ttl();
        let (deadline_tx, deadline_rx) = watch::channel(lease.since + ttl);

        self.put(field::STARTED, json!(timestamp())).await?;
        self.put(field::STATE, json!(RunStatus::Run.as_str())).await?;
        self.store.sync().await?;
        self.phase.send_replace(Phase::Running);

        let job_token = CancellationToken::new();
        let ctx = JobContext {
            path: self.path.clone(),
            taskdef: self.taskdef.clone(),
            data: self.data.clone(),
            vars: self.vars.borrow().clone(),
            token: job_token.clone(),
            reg: reg.clone(),
            store: Arc::clone(&self.store),
        };
        let job = Arc::clone(&self.job);
        let mut payload: JoinHandle<Result<String, TaskError>> =
            tokio::spawn(async move { job.run(ctx).await });
        let _abort = AbortOnDrop(payload.abort_handle());

        let outcome = {
            let beat = heartbeat(
                self.store.as_ref(),
                &lease.key,
                &mut lease.version,
                self.vars.clone(),
                &deadline_tx,
            );
            let expiry = expire(deadline_rx);
            tokio::pin!(beat, expiry);

            let outcome = tokio::select! {
                res = &mut payload => Outcome::Finished(res),
                reason = &mut beat => Outcome::LeaseLost(reason),
                _ = &mut expiry => Outcome::Deadline,
                parent = parent_gone(self.store.as_ref(), parents) => Outcome::ParentGone(parent),
                _ = token.cancelled() => Outcome::Cancelled,
            };

            match outcome {
                Outcome::Finished(_) => {}
                // Still ours: keep refreshing until the payload has wound down.
                Outcome::Cancelled | Outcome::ParentGone(_) => {
                    job_token.cancel();
                    let grace = tokio::time::sleep(self.cancel_grace);
                    tokio::pin!(grace);
                    let abort = tokio::select! {
                        _ = &mut payload => None,
                        _ = &mut grace => Some("payload ignored cancellation"),
                        reason = &mut beat => Some(if reason == "deleted" {
                            "run marker deleted while stopping"
                        } else {
                            "run marker superseded while stopping"
                        }),
                        _ = &mut expiry => Some("lease expired while stopping"),
                    };
                    if let Some(why) = abort {
                        warn!(path = %self.path, grace = ?self.cancel_grace, "{why}, aborting");
                        payload.abort();
                        let _ = (&mut payload).await;
                    }
                }
                Outcome::LeaseLost(_) | Outcome::Deadline => {
                    self.stop_payload(&job_token, &mut payload).await;
                }
            }
            outcome
        };
        self.record(outcome, lease, ttl).await
    }

    /// Stops a payload whose lease is already gone.
    async fn stop_payload(
        &self,
        job_token: &CancellationToken,
        payload: &mut JoinHandle<Result<String, TaskError>>,
    ) {
        job_token.cancel();
        if timeout(self.cancel_grace, &mut *payload).await.is_err() {
            warn!(path = %self.path, grace = ?self.cancel_grace, "payload ignored cancellation, aborting");
            payload.abort();
            let _ = payload.await;
        }
    }

    /// Writes the outcome to the run-state record and maps it to the result.
    async fn record(
        &self,
        outcome: Outcome,
        lease: &mut Lease,
        ttl: Duration,
    ) -> Result<String, TaskError> {
        let err = match outcome {
            Outcome::Finished(Ok(Ok(msg))) => {
                self.write_state(RunStatus::Ok, &msg, None).await;
                self.phase.send_replace(Phase::Ok);
                self.publish(Event::new(EventKind::TaskStopped).with_reason(msg.as_str()));
                return Ok(msg);
            }
            Outcome::Finished(Ok(Err(TaskError::Canceled))) | Outcome::Cancelled => {
                self.write_state(RunStatus::Fail, "Cancelled", None).await;
                self.phase.send_replace(Phase::Cancelled);
                self.publish(Event::new(EventKind::TaskCancelled));
                return Err(TaskError::Canceled);
            }
            Outcome::Finished(Ok(Err(e))) => e,
            Outcome::Finished(Err(join)) => join_error(join),
            Outcome::LeaseLost(reason) => {
                lease.keep = true;
                let msg = format!("Run marker {reason}");
                warn!(path = %self.path, %msg, "lease lost");
                self.publish(Event::new(EventKind::LeaseLost).with_reason(msg.as_str()));
                return self
                    .fail(
                        &msg,
                        TaskError::MarkGone {
                            path: self.path.clone(),
                            reason,
                        },
                    )
                    .await;
            }
            Outcome::Deadline => {
                self.publish(Event::new(EventKind::TimeoutHit).with_timeout(ttl));
                return self.fail("Aborted by timeout", TaskError::Timeout { ttl }).await;
            }
            Outcome::ParentGone(parent) => {
                let msg = format!("Parent {parent} gone");
                return self.fail(&msg, TaskError::ParentGone { parent }).await;
            }
        };

        let msg = err.to_string();
        self.write_state(RunStatus::Error, &msg, Some(&err.debug_text()))
            .await;
        self.phase.send_replace(Phase::Error);
        self.publish(Event::new(EventKind::TaskErrored).with_reason(msg));
        Err(err)
    }

    async fn fail(&self, msg: &str, err: TaskError) -> Result<String, TaskError> {
        self.write_state(RunStatus::Fail, msg, None).await;
        self.phase.send_replace(Phase::Fail);
        self.publish(Event::new(EventKind::TaskFailed).with_reason(msg));
        Err(err)
    }

    async fn teardown(&self, lease: &mut Lease, reg: &Reg) {
        let freed = reg.free().await;
        if freed > 0 {
            debug!(path = %self.path, freed, "released resources");
        }
        if let Err(e) = self.put(field::STOPPED, json!(timestamp())).await {
            warn!(path = %self.path, error = %e, "could not record stop");
        }
        if !lease.keep {
            match self.store.delete(&lease.key, Some(lease.version)).await {
                Ok(()) => {}
                Err(e) if e.is_lost() => debug!(path = %self.path, "run marker already gone"),
                Err(e) => warn!(path = %self.path, error = %e, "could not delete run marker"),
            }
        }
        lease.armed = false;
        if let Err(e) = self.store.sync().await {
            warn!(path = %self.path, error = %e, "store sync failed");
        }
    }

    async fn write_state(&self, status: RunStatus, message: &str, debug: Option<&str>) {
        let mut writes = vec![
            (field::STATE, json!(status.as_str())),
            (field::MESSAGE, json!(message)),
        ];
        if let Some(debug) = debug {
            writes.push((field::DEBUG, json!(debug)));
            writes.push((field::DEBUG_TIME, json!(timestamp())));
        }
        for (f, value) in writes {
            if let Err(e) = self.put(f, value).await {
                warn!(path = %self.path, field = f, error = %e, "could not record run state");
            }
        }
    }

    async fn put(&self, f: &str, value: Value) -> Result<(), StoreError> {
        self.store
            .set(&layout::state_key(&self.path, f), value, None, None)
            .await
            .map(|_| ())
    }

    fn publish(&self, ev: Event) {
        self.bus.publish(ev.with_task(self.path.as_str()));
    }
}

enum Outcome {
    Finished(Result<Result<String, TaskError>, JoinError>),
    LeaseLost(&'static str),
    Deadline,
    ParentGone(String),
    Cancelled,
}

/// The `running` key held by this execution.
struct Lease {
    store: StoreRef,
    key: String,
    version: Version,
    /// Taken before the create call; the first deadline counts from here.
    since: Instant,
    /// Leave the key alone at teardown; it is not ours anymore.
    keep: bool,
    armed: bool,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.armed || self.keep {
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let version = self.version;
        rt.spawn(async move {
            if let Err(e) = store.delete(&key, Some(version)).await {
                debug!(%key, error = %e, "dropped lease not deleted");
            }
        });
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct ParentWatch {
    parent: String,
    key: String,
    watch: Watch,
}

impl ParentWatch {
    async fn gone(&mut self, store: &dyn Store) -> String {
        loop {
            match self.watch.changed().await {
                Some(Change::Delete { key, .. }) if key == self.key => break,
                Some(Change::Resync) => {
                    if matches!(store.get(&self.key).await, Ok(None)) {
                        break;
                    }
                }
                Some(_) => {}
                None => future::pending::<()>().await,
            }
        }
        self.parent.clone()
    }
}

async fn parent_gone(store: &dyn Store, mut parents: Vec<ParentWatch>) -> String {
    if parents.is_empty() {
        return future::pending().await;
    }
    let waits = parents.iter_mut().map(|p| Box::pin(p.gone(store)));
    future::select_all(waits).await.0
}

/// Refreshes the lease until it is lost; returns `deleted` or `superseded`.
async fn heartbeat(
    store: &dyn Store,
    key: &str,
    version: &mut Version,
    vars: watch::Receiver<TaskVars>,
    deadline: &watch::Sender<Instant>,
) -> &'static str {
    loop {
        let interval = vars.borrow().refresh_interval();
        tokio::time::sleep(interval).await;

        let ttl = vars.borrow().lease_ttl();
        let sent = Instant::now();
        match store.set(key, json!(timestamp()), Some(ttl), Some(*version)).await {
            Ok(v) => {
                *version = v;
                deadline.send_replace(sent + ttl);
                debug!(%key, "lease refreshed");
            }
            Err(StoreError::NotFound { .. }) => return "deleted",
            Err(StoreError::CompareFailed { .. }) => return "superseded",
            Err(e) => warn!(%key, error = %e, "lease refresh failed"),
        }
    }
}

/// Completes once the latest deadline passes.
async fn expire(mut deadline: watch::Receiver<Instant>) {
    loop {
        let at = *deadline.borrow_and_update();
        tokio::select! {
            _ = sleep_until(at) => return,
            changed = deadline.changed() => {
                if changed.is_err() {
                    sleep_until(at).await;
                    return;
                }
            }
        }
    }
}

fn join_error(err: JoinError) -> TaskError {
    if err.is_cancelled() {
        return TaskError::Fatal {
            error: "payload aborted".to_string(),
        };
    }
    TaskError::Panicked {
        info: panic_info(err.into_panic()),
    }
}

fn panic_info(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
