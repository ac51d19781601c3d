//! # TaskMaster: supervisor of one task slot.
//!
//! Keeps creating fresh [`Task`] executions for one instance path, one at a
//! time, according to the instance's variables.
//!
//! ## Architecture
//! ```text
//! init: watch instance + config/run, read instance, watch definition,
//!       read definition, resolve job (once) and vars
//!
//! loop {
//!   ├─► attempt += 1, status Started
//!   ├─► Task::run()   ◄── watch change → reload vars (or DefinitionChanged)
//!   │       │
//!   │       ├─ Ok        ──► reset backoff, status Ok
//!   │       │                ├─ restart == 0 → finish with the result
//!   │       │                └─ else BackoffScheduled(success), wait `restart`
//!   │       ├─ Canceled  ──► finish (cancellation)
//!   │       ├─ fatal     ──► MasterDead, propagate
//!   │       └─ Err       ──► status Error
//!   │                        ├─ retry == 0 or give-up at ceiling → propagate
//!   │                        └─ else base = backoff.next(prev), BackoffScheduled(failure)
//!   └─► wait: sleep | trigger | cancel | watch change
//! }
//! ```
//!
//! ## Rules
//! - Executions of one master never overlap.
//! - The backoff resets after every success.
//! - A trigger arriving while a task runs is kept and ends the next wait at once.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::task::Task;
use crate::error::TaskError;
use crate::events::{Bus, Event, EventKind};
use crate::policies::BackoffPolicy;
use crate::store::{self, StoreRef, Watch, layout};
use crate::tasks::{Catalog, JobRef, TaskDef, TaskInstance, TaskVars, VarMap, merge};

/// Transition reported to a status callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// An execution is starting.
    Started,
    /// An execution completed with this result.
    Ok(String),
    /// An execution ended with this error text.
    Error(String),
}

/// Status callback: `(instance path, transition)`.
pub type StatusFn = Arc<dyn Fn(&str, &Status) + Send + Sync>;

/// Forces a master to restart at once.
#[derive(Clone, Debug, Default)]
pub struct Trigger(Arc<Notify>);

impl Trigger {
    /// Ends the current backoff wait, or the next one if a task is running.
    pub fn fire(&self) {
        self.0.notify_one();
    }
}

/// Supervises executions of one task instance.
pub struct TaskMaster {
    path: String,
    store: StoreRef,
    catalog: Arc<Catalog>,
    bus: Bus,
    defaults: TaskVars,
    backoff: BackoffPolicy,
    cancel_grace: Duration,
    trigger: Trigger,
    callback: Option<StatusFn>,
}

/// Everything read from the tree for the next execution.
struct Loaded {
    inst: TaskInstance,
    vars: TaskVars,
    data: VarMap,
}

/// Mutable state of a running master.
struct Slot {
    taskdef: String,
    watches: Vec<Watch>,
    vars: watch::Sender<TaskVars>,
    current: Loaded,
}

impl TaskMaster {
    /// Creates a master for instance `path` with default configuration.
    pub fn new(path: impl Into<String>, store: StoreRef, catalog: Arc<Catalog>, bus: Bus) -> Self {
        let cfg = Config::default();
        Self {
            path: layout::normalize(&path.into()),
            store,
            catalog,
            bus,
            defaults: cfg.vars,
            backoff: cfg.backoff,
            cancel_grace: cfg.cancel_grace,
            trigger: Trigger::default(),
            callback: None,
        }
    }

    /// Takes variable defaults, backoff and cancel grace from `cfg`.
    pub fn with_config(mut self, cfg: &Config) -> Self {
        self.defaults = cfg.vars.clone();
        self.backoff = cfg.backoff;
        self.cancel_grace = cfg.cancel_grace;
        self
    }

    /// Installs a status callback.
    pub fn with_callback(mut self, f: StatusFn) -> Self {
        self.callback = Some(f);
        self
    }

    /// Handle that forces an immediate restart.
    pub fn trigger(&self) -> Trigger {
        self.trigger.clone()
    }

    /// Instance path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Supervises until finished, failed or cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<String, TaskError> {
        let res = self.supervise(&token).await;
        match &res {
            Ok(_) | Err(TaskError::Canceled) => {
                info!(path = %self.path, "master finished");
                self.publish(Event::new(EventKind::MasterFinished));
            }
            Err(e) => {
                warn!(path = %self.path, error = %e, "master dead");
                self.publish(Event::new(EventKind::MasterDead).with_reason(e.to_string()));
            }
        }
        res
    }

    async fn supervise(&self, token: &CancellationToken) -> Result<String, TaskError> {
        let mut watches = vec![
            self.store.watch(&layout::task_key(&self.path)),
            self.store.watch(layout::RUN_CONFIG),
        ];
        let first = self.load(None).await?;
        let taskdef = first.inst.taskdef.clone();
        watches.push(self.store.watch(&layout::taskdef_key(&taskdef)));
        let def = self.definition(&taskdef, false).await?;
        let job = self.catalog.resolve(&def.code)?;
        let current = self.load(Some(&taskdef)).await?;

        let (vars, _rx) = watch::channel(current.vars.clone());
        let mut slot = Slot {
            taskdef,
            watches,
            vars,
            current,
        };

        let mut attempt = 0u32;
        let mut prev: Option<Duration> = None;
        loop {
            attempt += 1;
            self.notify(&Status::Started);

            let res = self.execute(&job, &mut slot, attempt, token).await?;
            match res {
                Ok(msg) => {
                    prev = None;
                    self.notify(&Status::Ok(msg.clone()));
                    let restart = slot.vars.borrow().restart;
                    if restart.is_zero() {
                        return Ok(msg);
                    }
                    self.publish(
                        Event::new(EventKind::BackoffScheduled)
                            .with_attempt(attempt)
                            .with_delay(restart)
                            .with_backoff_success(),
                    );
                    self.pause(restart, &mut slot, token).await?;
                }
                Err(TaskError::Canceled) => return Err(TaskError::Canceled),
                Err(e) => {
                    self.notify(&Status::Error(e.to_string()));
                    if e.is_fatal() {
                        return Err(e);
                    }
                    let vars = slot.vars.borrow().clone();
                    if vars.retry.is_zero() || self.backoff.exhausted(prev, vars.max_retry) {
                        return Err(e);
                    }
                    let base = self.backoff.next(prev, vars.retry, vars.max_retry);
                    prev = Some(base);
                    let delay = self.backoff.schedule(base);
                    debug!(path = %self.path, ?delay, error = %e, "retrying");
                    self.publish(
                        Event::new(EventKind::BackoffScheduled)
                            .with_attempt(attempt)
                            .with_delay(delay)
                            .with_reason(e.to_string())
                            .with_backoff_failure(),
                    );
                    self.pause(delay, &mut slot, token).await?;
                }
            }
        }
    }

    /// Runs one task while following tree changes.
    ///
    /// The outer error ends the master (definition gone or changed); the inner
    /// result is the task's.
    async fn execute(
        &self,
        job: &JobRef,
        slot: &mut Slot,
        attempt: u32,
        token: &CancellationToken,
    ) -> Result<Result<String, TaskError>, TaskError> {
        let cur = &slot.current;
        let task = Task::new(self.path.as_str(), Arc::clone(job), Arc::clone(&self.store), self.bus.clone())
            .with_taskdef(slot.taskdef.as_str())
            .with_parents(cur.inst.parent.iter().cloned().collect())
            .with_data(cur.data.clone())
            .with_live_vars(slot.vars.subscribe())
            .with_attempt(attempt)
            .with_cancel_grace(self.cancel_grace);

        let child = token.child_token();
        let run = task.run(child.clone());
        tokio::pin!(run);
        loop {
            tokio::select! {
                res = &mut run => return Ok(res),
                _ = changed(&mut slot.watches) => {
                    if let Err(e) = self.reload(slot).await {
                        child.cancel();
                        let _ = run.await;
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Waits `delay`, ending early on trigger. Follows tree changes meanwhile.
    async fn pause(
        &self,
        delay: Duration,
        slot: &mut Slot,
        token: &CancellationToken,
    ) -> Result<(), TaskError> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                _ = self.trigger.0.notified() => {
                    debug!(path = %self.path, "triggered");
                    return Ok(());
                }
                _ = token.cancelled() => return Err(TaskError::Canceled),
                _ = changed(&mut slot.watches) => self.reload(slot).await?,
            }
        }
    }

    /// Re-reads the tree; pushes new vars to the running task.
    async fn reload(&self, slot: &mut Slot) -> Result<(), TaskError> {
        match self.load(Some(&slot.taskdef)).await {
            Ok(loaded) => {
                if *slot.vars.borrow() != loaded.vars {
                    debug!(path = %self.path, "variables changed");
                }
                slot.vars.send_replace(loaded.vars.clone());
                slot.current = loaded;
                Ok(())
            }
            Err(TaskError::Store(e)) if !e.is_lost() => {
                warn!(path = %self.path, error = %e, "reload failed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reads instance, definition and global config.
    ///
    /// With `expect`, the instance must still refer to that definition and
    /// anything missing is a [`TaskError::DefinitionChanged`].
    async fn load(&self, expect: Option<&str>) -> Result<Loaded, TaskError> {
        let key = layout::task_key(&self.path);
        let inst: Option<TaskInstance> = store::load(self.store.as_ref(), &key).await?;
        let inst = match (inst, expect) {
            (Some(inst), Some(def)) if inst.taskdef != def => return Err(self.changed_error()),
            (Some(inst), _) => inst,
            (None, Some(_)) => return Err(self.changed_error()),
            (None, None) => return Err(TaskError::NotFound { key }),
        };
        let def = self.definition(&inst.taskdef, expect.is_some()).await?;
        let config: VarMap = store::load(self.store.as_ref(), layout::RUN_CONFIG)
            .await?
            .unwrap_or_default();

        let vars = TaskVars::resolve(&[&inst.data, &def.data, &config], &self.defaults)?;
        let data = merge(&[&def.data, &inst.data]);
        Ok(Loaded { inst, vars, data })
    }

    async fn definition(&self, taskdef: &str, running: bool) -> Result<TaskDef, TaskError> {
        let key = layout::taskdef_key(taskdef);
        match store::load(self.store.as_ref(), &key).await? {
            Some(def) => Ok(def),
            None if running => Err(self.changed_error()),
            None => Err(TaskError::NotFound { key }),
        }
    }

    fn changed_error(&self) -> TaskError {
        TaskError::DefinitionChanged {
            path: self.path.clone(),
        }
    }

    fn notify(&self, status: &Status) {
        if let Some(cb) = &self.callback {
            cb(&self.path, status);
        }
    }

    fn publish(&self, ev: Event) {
        self.bus.publish(ev.with_task(self.path.as_str()));
    }
}

/// Completes on the next change seen by any watch. Closed watches never fire.
async fn changed(watches: &mut [Watch]) {
    if watches.is_empty() {
        return future::pending().await;
    }
    let waits = watches.iter_mut().map(|w| {
        Box::pin(async move {
            if w.changed().await.is_none() {
                future::pending::<()>().await;
            }
        })
    });
    future::select_all(waits).await;
}
